//! Web-identity role assumption.
//!
//! The pipeline proves who it is with an OIDC token (from the GitHub Actions
//! token service or a projected token file) and trades it at STS for scoped
//! credentials. No long-lived key is read or stored.

use async_trait::async_trait;
use serde::Deserialize;
use shipit_core::credentials::{AssumeRoleRequest, CredentialProvider, ScopedCredentials};
use shipit_core::secret::SecretString;
use shipit_core::{Error, Result};
use std::path::PathBuf;
use tracing::{info, warn};
use url::Url;

use crate::aws::sts::StsClient;
use crate::aws::{AwsError, Endpoints};

/// Audience STS expects in GitHub-issued tokens.
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Where the OIDC identity token comes from.
#[derive(Debug, Clone)]
pub enum IdentityTokenSource {
    /// GitHub Actions token service (`permissions: id-token: write`).
    GitHubActions {
        request_url: String,
        request_token: SecretString,
        audience: String,
    },
    /// File containing the token, as projected by EKS or written by CI.
    File(PathBuf),
}

#[derive(Deserialize)]
struct GitHubTokenResponse {
    value: String,
}

impl IdentityTokenSource {
    /// Detect a token source from the environment. GitHub Actions wins over
    /// `AWS_WEB_IDENTITY_TOKEN_FILE`.
    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let (Some(request_url), Some(request_token)) = (
            non_empty("ACTIONS_ID_TOKEN_REQUEST_URL"),
            non_empty("ACTIONS_ID_TOKEN_REQUEST_TOKEN"),
        ) {
            return Some(Self::GitHubActions {
                request_url,
                request_token: SecretString::new(request_token),
                audience: STS_AUDIENCE.to_string(),
            });
        }
        non_empty("AWS_WEB_IDENTITY_TOKEN_FILE").map(|path| Self::File(PathBuf::from(path)))
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Self::GitHubActions { .. } => "github-actions",
            Self::File(_) => "token-file",
        }
    }

    pub async fn fetch(&self, http: &reqwest::Client) -> std::result::Result<SecretString, AwsError> {
        match self {
            Self::GitHubActions {
                request_url,
                request_token,
                audience,
            } => {
                let mut url = Url::parse(request_url)
                    .map_err(|e| AwsError::Token(format!("invalid token request URL: {}", e)))?;
                url.query_pairs_mut().append_pair("audience", audience);

                let response = http
                    .get(url)
                    .header("Authorization", format!("Bearer {}", request_token.expose()))
                    .header("Accept", "application/json")
                    .header("User-Agent", "shipit")
                    .send()
                    .await
                    .map_err(|e| AwsError::Token(e.to_string()))?;

                if !response.status().is_success() {
                    return Err(AwsError::Token(format!(
                        "token service returned {}",
                        response.status()
                    )));
                }
                let token: GitHubTokenResponse = response
                    .json()
                    .await
                    .map_err(|e| AwsError::Token(format!("unreadable token response: {}", e)))?;
                if token.value.is_empty() {
                    return Err(AwsError::Token("token service returned an empty token".to_string()));
                }
                Ok(SecretString::new(token.value))
            }
            Self::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| AwsError::Token(format!("{}: {}", path.display(), e)))?;
                let token = raw.trim();
                if token.is_empty() {
                    return Err(AwsError::Token(format!("{} is empty", path.display())));
                }
                Ok(SecretString::new(token))
            }
        }
    }
}

/// Assumes roles with `AssumeRoleWithWebIdentity`.
pub struct WebIdentityCredentialProvider {
    http: reqwest::Client,
    source: IdentityTokenSource,
    endpoints: Endpoints,
}

impl WebIdentityCredentialProvider {
    pub fn new(source: IdentityTokenSource, endpoints: Endpoints) -> Self {
        Self {
            http: reqwest::Client::new(),
            source,
            endpoints,
        }
    }

    /// Provider using the token source found in the environment.
    pub fn from_env(endpoints: Endpoints) -> Result<Self> {
        let source = IdentityTokenSource::from_env().ok_or_else(|| {
            Error::CredentialExchange(
                "no identity token source: set ACTIONS_ID_TOKEN_REQUEST_URL/ACTIONS_ID_TOKEN_REQUEST_TOKEN or AWS_WEB_IDENTITY_TOKEN_FILE"
                    .to_string(),
            )
        })?;
        Ok(Self::new(source, endpoints))
    }
}

#[async_trait]
impl CredentialProvider for WebIdentityCredentialProvider {
    fn name(&self) -> &'static str {
        "web-identity"
    }

    async fn assume_role(&self, request: &AssumeRoleRequest) -> Result<ScopedCredentials> {
        request.validate()?;

        let token = self.source.fetch(&self.http).await.map_err(|e| {
            warn!(source = self.source.describe(), error = %e, "Failed to obtain identity token");
            Error::CredentialExchange(e.to_string())
        })?;

        let sts = StsClient::new(self.http.clone(), self.endpoints.sts(&request.region));
        let credentials = sts
            .assume_role_with_web_identity(request, &token)
            .await
            .map_err(|e| {
                warn!(role_arn = %request.role_arn, error = %e, "Role assumption failed");
                Error::CredentialExchange(format!("assume {}: {}", request.role_arn, e))
            })?;
        credentials.ensure_valid()?;

        info!(
            role_arn = %request.role_arn,
            access_key_id = %credentials.access_key_id,
            expires_at = %credentials.expires_at,
            "Assumed role"
        );
        Ok(credentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Form, Query};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::collections::HashMap;
    use std::time::Duration;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn request(region: &str) -> AssumeRoleRequest {
        AssumeRoleRequest {
            role_arn: "arn:aws:iam::123456789012:role/github-deploy".to_string(),
            region: region.to_string(),
            session_name: "shipit-0190a1b2".to_string(),
            duration: Duration::from_secs(3600),
        }
    }

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    const STS_OK: &str = r#"<AssumeRoleWithWebIdentityResponse>
  <AssumeRoleWithWebIdentityResult>
    <Credentials>
      <SessionToken>session-token</SessionToken>
      <SecretAccessKey>secret-key</SecretAccessKey>
      <Expiration>2099-01-01T00:00:00Z</Expiration>
      <AccessKeyId>ASIAEXAMPLE</AccessKeyId>
    </Credentials>
  </AssumeRoleWithWebIdentityResult>
</AssumeRoleWithWebIdentityResponse>"#;

    #[test]
    fn test_source_prefers_github_actions() {
        let source = IdentityTokenSource::from_lookup(lookup(&[
            ("ACTIONS_ID_TOKEN_REQUEST_URL", "https://token.actions/x?api-version=2.0"),
            ("ACTIONS_ID_TOKEN_REQUEST_TOKEN", "bearer"),
            ("AWS_WEB_IDENTITY_TOKEN_FILE", "/var/run/token"),
        ]))
        .unwrap();
        assert_eq!(source.describe(), "github-actions");

        let source = IdentityTokenSource::from_lookup(lookup(&[(
            "AWS_WEB_IDENTITY_TOKEN_FILE",
            "/var/run/token",
        )]))
        .unwrap();
        assert!(matches!(source, IdentityTokenSource::File(_)));

        assert!(IdentityTokenSource::from_lookup(lookup(&[])).is_none());
    }

    #[tokio::test]
    async fn test_token_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "eyJhbGciOi.payload.sig\n").unwrap();

        let token = IdentityTokenSource::File(path)
            .fetch(&reqwest::Client::new())
            .await
            .unwrap();
        assert_eq!(token.expose(), "eyJhbGciOi.payload.sig");
    }

    #[tokio::test]
    async fn test_github_token_and_sts_exchange() {
        let app = Router::new()
            .route(
                "/token",
                get(
                    |Query(q): Query<HashMap<String, String>>, headers: HeaderMap| async move {
                        assert_eq!(q.get("audience").map(String::as_str), Some(STS_AUDIENCE));
                        assert_eq!(
                            headers.get("authorization").unwrap().to_str().unwrap(),
                            "Bearer request-token"
                        );
                        Json(serde_json::json!({ "count": 1, "value": "oidc-jwt" }))
                    },
                ),
            )
            .route(
                "/",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    assert_eq!(form["Action"], "AssumeRoleWithWebIdentity");
                    assert_eq!(form["WebIdentityToken"], "oidc-jwt");
                    assert_eq!(form["DurationSeconds"], "3600");
                    STS_OK
                }),
            );
        let base = serve(app).await;

        let provider = WebIdentityCredentialProvider::new(
            IdentityTokenSource::GitHubActions {
                request_url: format!("{}/token?api-version=2.0", base),
                request_token: SecretString::new("request-token"),
                audience: STS_AUDIENCE.to_string(),
            },
            Endpoints::new(Some(base)),
        );
        let creds = provider.assume_role(&request("us-east-1")).await.unwrap();
        assert_eq!(creds.access_key_id, "ASIAEXAMPLE");
        assert_eq!(creds.session_token.expose(), "session-token");
    }

    #[tokio::test]
    async fn test_denied_role_is_credential_error() {
        let app = Router::new().route(
            "/",
            post(|| async {
                (
                    StatusCode::FORBIDDEN,
                    "<ErrorResponse><Error><Code>AccessDenied</Code><Message>Not authorized to perform sts:AssumeRoleWithWebIdentity</Message></Error></ErrorResponse>",
                )
            }),
        );
        let base = serve(app).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "jwt").unwrap();

        let provider =
            WebIdentityCredentialProvider::new(IdentityTokenSource::File(path), Endpoints::new(Some(base)));
        match provider.assume_role(&request("us-east-1")).await {
            Err(Error::CredentialExchange(message)) => assert!(message.contains("AccessDenied")),
            other => panic!("unexpected result {:?}", other.map(|c| c.access_key_id)),
        }
    }

    #[tokio::test]
    async fn test_invalid_request_fails_before_network() {
        let provider = WebIdentityCredentialProvider::new(
            IdentityTokenSource::File(PathBuf::from("/nonexistent")),
            Endpoints::new(Some("http://127.0.0.1:9".to_string())),
        );
        let mut bad = request("us-east-1");
        bad.role_arn = "not-an-arn".to_string();
        assert!(matches!(
            provider.assume_role(&bad).await,
            Err(Error::InvalidInput(_))
        ));
    }
}
