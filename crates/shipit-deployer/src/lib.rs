//! Deployment backends for shipit.
//!
//! Provides:
//! - Web-identity role assumption (GitHub Actions OIDC or a token file)
//! - Elastic Beanstalk deployer
//! - A wait loop that follows a deployment until it is live

pub mod aws;
pub mod beanstalk;
pub mod identity;
pub mod wait;

pub use aws::{AwsError, Endpoints};
pub use beanstalk::{BeanstalkDeployer, BeanstalkDeployerFactory};
pub use identity::{IdentityTokenSource, WebIdentityCredentialProvider};
pub use wait::{WaitOptions, WaitUpdate, wait_for_deployment};
