//! Scoped, short-lived credentials obtained by role assumption.
//!
//! Credentials live only for the duration of a deploy stage. They are never
//! serialized and carry their own expiry, so a stale value is rejected
//! instead of being sent to the platform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::secret::SecretString;
use crate::{Error, Result};

/// Temporary credentials returned by a trust exchange.
#[derive(Debug, Clone)]
pub struct ScopedCredentials {
    pub access_key_id: String,
    pub secret_access_key: SecretString,
    pub session_token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl ScopedCredentials {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Fail with a credential error if these credentials can no longer be used.
    pub fn ensure_valid(&self) -> Result<()> {
        if self.is_expired() {
            return Err(Error::CredentialExchange(format!(
                "credentials for {} expired at {}",
                self.access_key_id, self.expires_at
            )));
        }
        Ok(())
    }
}

/// Parameters for a role assumption.
#[derive(Debug, Clone)]
pub struct AssumeRoleRequest {
    /// ARN of the role to assume.
    pub role_arn: String,
    /// Region whose STS endpoint handles the exchange.
    pub region: String,
    /// Session name recorded by the platform's audit trail.
    pub session_name: String,
    /// Requested lifetime of the credentials.
    pub duration: Duration,
}

impl AssumeRoleRequest {
    /// Check the shape of the request before any network call is made.
    pub fn validate(&self) -> Result<()> {
        if self.role_arn.is_empty() {
            return Err(Error::InvalidInput("role ARN is empty".to_string()));
        }
        let parts: Vec<&str> = self.role_arn.splitn(6, ':').collect();
        let valid = parts.len() == 6
            && parts[0] == "arn"
            && parts[2] == "iam"
            && parts[4].len() == 12
            && parts[4].chars().all(|c| c.is_ascii_digit())
            && parts[5].starts_with("role/");
        if !valid {
            return Err(Error::InvalidInput(format!(
                "'{}' is not an IAM role ARN",
                self.role_arn
            )));
        }
        if self.region.is_empty() {
            return Err(Error::InvalidInput("region is empty".to_string()));
        }
        // STS accepts 2-64 characters from [\w+=,.@-]
        let name_ok = (2..=64).contains(&self.session_name.len())
            && self
                .session_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_+=,.@-".contains(c));
        if !name_ok {
            return Err(Error::InvalidInput(format!(
                "invalid role session name '{}'",
                self.session_name
            )));
        }
        Ok(())
    }
}

/// Exchanges the pipeline's identity for scoped credentials.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Name of this provider.
    fn name(&self) -> &'static str;

    /// Assume a role and return credentials valid for at most `request.duration`.
    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<ScopedCredentials>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(arn: &str) -> AssumeRoleRequest {
        AssumeRoleRequest {
            role_arn: arn.to_string(),
            region: "us-east-1".to_string(),
            session_name: "shipit-0190a1b2".to_string(),
            duration: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_valid_role_arn() {
        assert!(
            request("arn:aws:iam::123456789012:role/github-deploy")
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_rejects_malformed_role_arn() {
        for arn in [
            "",
            "github-deploy",
            "arn:aws:iam::1234:role/x",
            "arn:aws:iam::123456789012:user/bob",
            "arn:aws:s3:::bucket",
        ] {
            assert!(
                matches!(request(arn).validate(), Err(Error::InvalidInput(_))),
                "{arn} should be rejected"
            );
        }
    }

    #[test]
    fn test_expiry() {
        let now = Utc::now();
        let creds = ScopedCredentials {
            access_key_id: "ASIAEXAMPLE".to_string(),
            secret_access_key: SecretString::new("hunter2"),
            session_token: SecretString::new("session-hunter3"),
            expires_at: now,
        };
        assert!(creds.is_expired_at(now));
        assert!(!creds.is_expired_at(now - chrono::Duration::seconds(1)));
        assert!(matches!(
            creds.ensure_valid(),
            Err(Error::CredentialExchange(_))
        ));
        let debug = format!("{:?}", creds);
        assert!(!debug.contains("hunter"));
    }
}
