//! Elastic Beanstalk deployer.
//!
//! A deploy is "register the bundle as an application version, then point
//! the environment at it". Beanstalk rolls the instances itself; progress is
//! observed through `DescribeEnvironments` and `DescribeEvents`.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use shipit_core::credentials::ScopedCredentials;
use shipit_core::deployer::*;
use shipit_core::{Error, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::aws::beanstalk::{BeanstalkClient, EnvironmentDescription};
use crate::aws::s3::S3Client;
use crate::aws::{AwsError, Endpoints};

const BUNDLE_CONTENT_TYPE: &str = "application/zip";

pub struct BeanstalkDeployer {
    client: BeanstalkClient,
    s3: S3Client,
}

impl BeanstalkDeployer {
    pub fn new(http: reqwest::Client, endpoints: &Endpoints, region: &str, credentials: ScopedCredentials) -> Self {
        Self {
            client: BeanstalkClient::new(
                http.clone(),
                endpoints.beanstalk(region),
                region,
                credentials.clone(),
            ),
            s3: S3Client::new(http, endpoints.s3(region), region, credentials),
        }
    }

    /// Key of the uploaded bundle inside the Beanstalk storage bucket.
    pub fn bundle_key(application: &str, version_label: &str) -> String {
        format!("{}/{}.zip", application, version_label)
    }
}

fn rejected(operation: &'static str) -> impl FnOnce(AwsError) -> Error {
    move |e| match e {
        AwsError::Expired(_) => Error::CredentialExchange(format!("{}: {}", operation, e)),
        e => Error::DeploymentRejected(format!("{}: {}", operation, e)),
    }
}

/// Poll failures: transient ones may be retried by the caller.
fn poll_error(operation: &'static str) -> impl FnOnce(AwsError) -> Error {
    move |e| {
        if matches!(e, AwsError::Expired(_)) {
            Error::CredentialExchange(format!("{}: {}", operation, e))
        } else if e.is_transient() {
            Error::Internal(format!("{}: {}", operation, e))
        } else {
            Error::DeploymentFailed(format!("{}: {}", operation, e))
        }
    }
}

fn to_state(environment: Option<EnvironmentDescription>) -> DeploymentState {
    let Some(environment) = environment else {
        return DeploymentState {
            status: DeploymentStatus::Terminated,
            active_version: None,
            health: EnvironmentHealth::Unknown,
            last_updated: Utc::now(),
        };
    };
    let status = match environment.status.as_str() {
        "Ready" => DeploymentStatus::Ready,
        "Terminating" | "Terminated" => DeploymentStatus::Terminated,
        other => DeploymentStatus::InProgress {
            detail: other.to_string(),
        },
    };
    DeploymentState {
        status,
        active_version: environment.version_label,
        health: environment
            .health
            .as_deref()
            .map(EnvironmentHealth::parse)
            .unwrap_or(EnvironmentHealth::Unknown),
        last_updated: environment.date_updated.unwrap_or_else(Utc::now),
    }
}

#[async_trait]
impl Deployer for BeanstalkDeployer {
    fn name(&self) -> &'static str {
        "elastic-beanstalk"
    }

    async fn deploy(&self, spec: &DeploymentSpec, bundle: Bytes) -> Result<DeploymentHandle> {
        for warning in spec.validate()? {
            warn!(field = %warning.field, "{}", warning.message);
        }

        let existing = self
            .client
            .describe_application_version(&spec.application, &spec.version_label)
            .await
            .map_err(rejected("DescribeApplicationVersions"))?;

        let reused_version = match existing {
            Some(version) if spec.use_existing_version_if_available => {
                info!(
                    application = %spec.application,
                    version_label = %spec.version_label,
                    status = version.status.as_deref().unwrap_or("unknown"),
                    "Reusing existing application version"
                );
                true
            }
            Some(_) => {
                return Err(Error::Conflict(format!(
                    "application version '{}' already exists in {}",
                    spec.version_label, spec.application
                )));
            }
            None => {
                let bucket = self
                    .client
                    .create_storage_location()
                    .await
                    .map_err(rejected("CreateStorageLocation"))?;
                let key = Self::bundle_key(&spec.application, &spec.version_label);
                info!(bucket = %bucket, key = %key, size = bundle.len(), "Uploading source bundle");
                self.s3
                    .put_object(&bucket, &key, bundle, BUNDLE_CONTENT_TYPE)
                    .await
                    .map_err(rejected("PutObject"))?;
                self.client
                    .create_application_version(
                        &spec.application,
                        &spec.version_label,
                        spec.description.as_deref(),
                        &bucket,
                        &key,
                    )
                    .await
                    .map_err(rejected("CreateApplicationVersion"))?;
                info!(version_label = %spec.version_label, "Created application version");
                false
            }
        };

        let submitted_at = Utc::now();
        let environment = self
            .client
            .update_environment(&spec.application, &spec.environment, &spec.version_label)
            .await
            .map_err(rejected("UpdateEnvironment"))?;

        info!(
            environment = %spec.environment,
            environment_id = %environment.environment_id,
            version_label = %spec.version_label,
            status = %environment.status,
            "Environment update submitted"
        );

        Ok(DeploymentHandle {
            environment_id: environment.environment_id,
            deployer_name: self.name().to_string(),
            application: spec.application.clone(),
            environment: spec.environment.clone(),
            version_label: spec.version_label.clone(),
            reused_version,
            submitted_at,
        })
    }

    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState> {
        let environment = self
            .client
            .describe_environment(&handle.application, &handle.environment)
            .await
            .map_err(poll_error("DescribeEnvironments"))?;
        Ok(to_state(environment))
    }

    async fn events(
        &self,
        handle: &DeploymentHandle,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeploymentEvent>> {
        let events = self
            .client
            .describe_events(&handle.application, &handle.environment, since)
            .await
            .map_err(poll_error("DescribeEvents"))?;
        Ok(events
            .into_iter()
            .filter(|e| e.event_date > since)
            .map(|e| DeploymentEvent {
                timestamp: e.event_date,
                severity: EventSeverity::parse(&e.severity),
                message: e.message,
            })
            .collect())
    }
}

/// Creates [`BeanstalkDeployer`]s from assumed-role credentials.
pub struct BeanstalkDeployerFactory {
    http: reqwest::Client,
    endpoints: Endpoints,
}

impl BeanstalkDeployerFactory {
    pub fn new(endpoints: Endpoints) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoints,
        }
    }
}

#[async_trait]
impl DeployerFactory for BeanstalkDeployerFactory {
    fn name(&self) -> &'static str {
        "elastic-beanstalk"
    }

    async fn connect(
        &self,
        credentials: ScopedCredentials,
        region: &str,
    ) -> Result<Arc<dyn Deployer>> {
        credentials.ensure_valid()?;
        Ok(Arc::new(BeanstalkDeployer::new(
            self.http.clone(),
            &self.endpoints,
            region,
            credentials,
        )))
    }
}
