//! System settings read from the process environment.

use crate::{ConfigError, ConfigResult};
use std::path::PathBuf;
use std::time::Duration;

/// Default lifetime requested for assumed-role credentials.
pub const DEFAULT_SESSION_DURATION: Duration = Duration::from_secs(3600);

/// Settings that are not part of a pipeline definition.
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Root directory of the filesystem artifact store.
    pub artifact_dir: PathBuf,
    /// Endpoint override for every AWS service (e.g. LocalStack).
    pub aws_endpoint: Option<String>,
    /// Lifetime requested for assumed-role credentials.
    pub session_duration: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            artifact_dir: std::env::temp_dir().join("shipit-artifacts"),
            aws_endpoint: None,
            session_duration: DEFAULT_SESSION_DURATION,
        }
    }
}

impl SystemConfig {
    /// Read `SHIPIT_ARTIFACT_DIR`, `SHIPIT_AWS_ENDPOINT` and
    /// `SHIPIT_SESSION_DURATION_SECS`, falling back to defaults.
    pub fn from_env() -> ConfigResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<Self> {
        let mut config = Self::default();

        if let Some(dir) = lookup("SHIPIT_ARTIFACT_DIR").filter(|v| !v.is_empty()) {
            config.artifact_dir = PathBuf::from(dir);
        }

        config.aws_endpoint = lookup("SHIPIT_AWS_ENDPOINT")
            .filter(|v| !v.is_empty())
            .map(|v| v.trim_end_matches('/').to_string());

        if let Some(raw) = lookup("SHIPIT_SESSION_DURATION_SECS") {
            let secs: u64 = raw.parse().map_err(|_| {
                ConfigError::invalid("SHIPIT_SESSION_DURATION_SECS", format!("'{}' is not a number", raw))
            })?;
            // STS accepts 15 minutes to 12 hours.
            if !(900..=43_200).contains(&secs) {
                return Err(ConfigError::invalid(
                    "SHIPIT_SESSION_DURATION_SECS",
                    "must be between 900 and 43200",
                ));
            }
            config.session_duration = Duration::from_secs(secs);
        }

        Ok(config)
    }
}
