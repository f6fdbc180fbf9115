//! Core domain types and traits for the shipit pipeline runner.
//!
//! This crate contains:
//! - Run and job identifiers
//! - Pipeline, trigger and stage definitions
//! - Executor trait and job types (build steps)
//! - Artifact storage abstraction
//! - Scoped credentials and the role-assumption trait
//! - Deployer trait and deployment types

pub mod artifact;
pub mod credentials;
pub mod deployer;
pub mod error;
pub mod executor;
pub mod id;
pub mod pipeline;
pub mod secret;

pub use error::{Error, Result};
pub use id::{JobId, RunId};
