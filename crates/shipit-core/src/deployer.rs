//! Deployer trait and deployment types.
//!
//! A deployer submits a source bundle to a hosting platform under a version
//! label and reports the environment's state. The platform owns the live
//! version; deployers only submit and observe.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::credentials::ScopedCredentials;
use crate::{Error, Result};

/// Longest version label the platform accepts.
pub const MAX_VERSION_LABEL_LEN: usize = 100;

/// Specification for a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    /// Hosting application name.
    pub application: String,
    /// Hosting environment name.
    pub environment: String,
    /// Version label, normally the triggering commit hash.
    pub version_label: String,
    /// Human readable description stored with the version.
    pub description: Option<String>,
    /// Reuse an existing version record with the same label.
    pub use_existing_version_if_available: bool,
}

/// Warning from deployment validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub field: String,
    pub message: String,
}

impl DeploymentSpec {
    /// Check names and label against platform limits.
    ///
    /// Hard violations are errors; soft issues come back as warnings.
    pub fn validate(&self) -> Result<Vec<ValidationWarning>> {
        let mut warnings = Vec::new();

        if self.application.trim().is_empty() {
            return Err(Error::InvalidInput("application name is empty".to_string()));
        }
        if !(4..=40).contains(&self.environment.len()) {
            return Err(Error::InvalidInput(format!(
                "environment name '{}' must be 4 to 40 characters",
                self.environment
            )));
        }
        if self.version_label.trim().is_empty() {
            return Err(Error::InvalidInput("version label is empty".to_string()));
        }
        if self.version_label.len() > MAX_VERSION_LABEL_LEN {
            return Err(Error::InvalidInput(format!(
                "version label is {} characters, limit is {}",
                self.version_label.len(),
                MAX_VERSION_LABEL_LEN
            )));
        }
        if self.version_label.contains("${") {
            warnings.push(ValidationWarning {
                field: "version_label".to_string(),
                message: format!(
                    "'{}' contains an unresolved variable",
                    self.version_label
                ),
            });
        }
        if self.version_label.contains('/') {
            warnings.push(ValidationWarning {
                field: "version_label".to_string(),
                message: "'/' in a version label produces a nested storage key".to_string(),
            });
        }

        Ok(warnings)
    }
}

/// Handle to a submitted deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentHandle {
    /// Platform identifier of the target environment.
    pub environment_id: String,
    pub deployer_name: String,
    pub application: String,
    pub environment: String,
    pub version_label: String,
    /// True when an existing version record was reused.
    pub reused_version: bool,
    /// When the update request was accepted.
    pub submitted_at: DateTime<Utc>,
}

/// Environment health as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvironmentHealth {
    Green,
    Yellow,
    Red,
    Grey,
    Unknown,
}

impl EnvironmentHealth {
    pub fn parse(value: &str) -> Self {
        match value {
            "Green" => Self::Green,
            "Yellow" => Self::Yellow,
            "Red" => Self::Red,
            "Grey" => Self::Grey,
            _ => Self::Unknown,
        }
    }
}

/// Lifecycle status of the target environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeploymentStatus {
    /// The platform is applying a change.
    InProgress { detail: String },
    /// The environment is stable.
    Ready,
    /// The environment is gone or going away.
    Terminated,
}

/// Current state of a deployment target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub status: DeploymentStatus,
    /// Version label the environment is currently running.
    pub active_version: Option<String>,
    pub health: EnvironmentHealth,
    pub last_updated: DateTime<Utc>,
}

impl DeploymentState {
    /// True once the environment is stable on `label`.
    pub fn is_live(&self, label: &str) -> bool {
        self.status == DeploymentStatus::Ready && self.active_version.as_deref() == Some(label)
    }
}

/// Deployment event reported by the platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    pub timestamp: DateTime<Utc>,
    pub severity: EventSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl EventSeverity {
    pub fn parse(value: &str) -> Self {
        match value {
            "TRACE" => Self::Trace,
            "DEBUG" => Self::Debug,
            "WARN" => Self::Warn,
            "ERROR" => Self::Error,
            "FATAL" => Self::Fatal,
            _ => Self::Info,
        }
    }

    pub fn is_failure(&self) -> bool {
        *self >= Self::Error
    }
}

/// Trait for deployers.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// Name of this deployer.
    fn name(&self) -> &'static str;

    /// Submit `bundle` under the requested version label and point the
    /// environment at it. Returns once the platform accepted the request.
    async fn deploy(&self, spec: &DeploymentSpec, bundle: Bytes) -> Result<DeploymentHandle>;

    /// Get current state of the target environment.
    async fn state(&self, handle: &DeploymentHandle) -> Result<DeploymentState>;

    /// Events recorded for the environment since `since`, oldest first.
    async fn events(
        &self,
        handle: &DeploymentHandle,
        since: DateTime<Utc>,
    ) -> Result<Vec<DeploymentEvent>>;
}

/// Builds deployers bound to a set of scoped credentials.
#[async_trait]
pub trait DeployerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(
        &self,
        credentials: ScopedCredentials,
        region: &str,
    ) -> Result<Arc<dyn Deployer>>;
}
