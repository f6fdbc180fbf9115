//! Minimal AWS clients built on `reqwest`.
//!
//! Only the calls a deploy needs are implemented: STS web-identity role
//! assumption, the Elastic Beanstalk query API and an S3 object upload.

pub mod beanstalk;
pub mod s3;
pub mod sigv4;
pub mod sts;
pub mod xml;

use chrono::Utc;
use shipit_core::credentials::ScopedCredentials;
use tracing::debug;
use url::Url;

use sigv4::RequestSigner;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// Errors from AWS calls.
#[derive(Debug, thiserror::Error)]
pub enum AwsError {
    #[error("request failed: {0}")]
    Http(String),

    #[error("{code}: {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    #[error("malformed response: {0}")]
    Xml(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error("credentials expired at {0}")]
    Expired(chrono::DateTime<chrono::Utc>),

    #[error("identity token unavailable: {0}")]
    Token(String),
}

impl AwsError {
    /// True for failures the caller may retry, such as throttling or a 5xx.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Service { status, code, .. } => {
                *status >= 500 || code == "Throttling" || code == "ThrottlingException"
            }
            _ => false,
        }
    }
}

/// Service endpoints, optionally overridden for every service at once.
#[derive(Debug, Clone, Default)]
pub struct Endpoints {
    override_url: Option<String>,
}

impl Endpoints {
    pub fn new(override_url: Option<String>) -> Self {
        Self {
            override_url: override_url.map(|u| u.trim_end_matches('/').to_string()),
        }
    }

    fn resolve(&self, service: &str, region: &str) -> String {
        if let Some(url) = &self.override_url {
            return url.clone();
        }
        let suffix = if region.starts_with("cn-") {
            "amazonaws.com.cn"
        } else {
            "amazonaws.com"
        };
        format!("https://{}.{}.{}", service, region, suffix)
    }

    pub fn sts(&self, region: &str) -> String {
        self.resolve("sts", region)
    }

    pub fn beanstalk(&self, region: &str) -> String {
        self.resolve("elasticbeanstalk", region)
    }

    pub fn s3(&self, region: &str) -> String {
        self.resolve("s3", region)
    }
}

/// Encode query parameters as a form body.
pub(crate) fn form_body(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Read a response body, turning non-success statuses into service errors.
pub(crate) async fn read_response(response: reqwest::Response) -> Result<String, AwsError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AwsError::Http(e.to_string()))?;
    if status.is_success() {
        return Ok(body);
    }
    let (code, message) = xml::parse_error(&body).unwrap_or_else(|| {
        (
            status.canonical_reason().unwrap_or("Unknown").to_string(),
            body.chars().take(200).collect(),
        )
    });
    Err(AwsError::Service {
        status: status.as_u16(),
        code,
        message,
    })
}

/// Signed client for the AWS query protocol (form-encoded POST, XML reply).
#[derive(Clone)]
pub struct QueryClient {
    http: reqwest::Client,
    endpoint: String,
    region: String,
    service: &'static str,
    version: &'static str,
    credentials: ScopedCredentials,
}

impl QueryClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        region: impl Into<String>,
        service: &'static str,
        version: &'static str,
        credentials: ScopedCredentials,
    ) -> Self {
        Self {
            http,
            endpoint,
            region: region.into(),
            service,
            version,
            credentials,
        }
    }

    /// Call `action` with `params` and return the XML body.
    pub async fn call(&self, action: &str, params: &[(&str, String)]) -> Result<String, AwsError> {
        if self.credentials.is_expired() {
            return Err(AwsError::Expired(self.credentials.expires_at));
        }

        let mut all = vec![
            ("Action", action.to_string()),
            ("Version", self.version.to_string()),
        ];
        all.extend(params.iter().cloned());
        let body = form_body(&all);

        let url = Url::parse(&format!("{}/", self.endpoint))
            .map_err(|e| AwsError::Signing(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        let headers = vec![("content-type".to_string(), FORM_CONTENT_TYPE.to_string())];
        let signer = RequestSigner::new(&self.credentials, &self.region, self.service);
        let auth = signer.sign(
            "POST",
            &url,
            &headers,
            &sigv4::payload_hash(body.as_bytes()),
            Utc::now(),
        )?;

        debug!(service = self.service, action, "AWS request");

        let mut request = self
            .http
            .post(url)
            .header("content-type", FORM_CONTENT_TYPE)
            .body(body);
        for (name, value) in auth {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AwsError::Http(e.to_string()))?;
        read_response(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_endpoints() {
        let endpoints = Endpoints::default();
        assert_eq!(endpoints.sts("us-east-1"), "https://sts.us-east-1.amazonaws.com");
        assert_eq!(
            endpoints.beanstalk("eu-west-1"),
            "https://elasticbeanstalk.eu-west-1.amazonaws.com"
        );
        assert_eq!(endpoints.s3("cn-north-1"), "https://s3.cn-north-1.amazonaws.com.cn");
    }

    #[test]
    fn test_endpoint_override() {
        let endpoints = Endpoints::new(Some("http://localhost:4566/".to_string()));
        assert_eq!(endpoints.sts("us-east-1"), "http://localhost:4566");
        assert_eq!(endpoints.s3("us-east-1"), "http://localhost:4566");
    }

    #[test]
    fn test_form_body_encoding() {
        let body = form_body(&[
            ("Action", "UpdateEnvironment".to_string()),
            ("VersionLabel", "v1 +build/2".to_string()),
        ]);
        assert_eq!(body, "Action=UpdateEnvironment&VersionLabel=v1%20%2Bbuild%2F2");
    }

    #[test]
    fn test_transient_errors() {
        assert!(AwsError::Http("reset".to_string()).is_transient());
        assert!(
            AwsError::Service {
                status: 400,
                code: "Throttling".to_string(),
                message: "Rate exceeded".to_string()
            }
            .is_transient()
        );
        assert!(
            !AwsError::Service {
                status: 400,
                code: "InvalidParameterValue".to_string(),
                message: "bad".to_string()
            }
            .is_transient()
        );
    }
}
