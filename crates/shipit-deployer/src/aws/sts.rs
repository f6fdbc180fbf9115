//! STS `AssumeRoleWithWebIdentity`.
//!
//! The call is unsigned: the identity token itself authenticates the caller.

use shipit_core::credentials::{AssumeRoleRequest, ScopedCredentials};
use shipit_core::secret::SecretString;
use tracing::debug;

use super::{AwsError, form_body, read_response, xml};

const STS_VERSION: &str = "2011-06-15";

pub struct StsClient {
    http: reqwest::Client,
    endpoint: String,
}

impl StsClient {
    pub fn new(http: reqwest::Client, endpoint: String) -> Self {
        Self { http, endpoint }
    }

    pub async fn assume_role_with_web_identity(
        &self,
        request: &AssumeRoleRequest,
        token: &SecretString,
    ) -> Result<ScopedCredentials, AwsError> {
        let params = [
            ("Action", "AssumeRoleWithWebIdentity".to_string()),
            ("Version", STS_VERSION.to_string()),
            ("RoleArn", request.role_arn.clone()),
            ("RoleSessionName", request.session_name.clone()),
            ("WebIdentityToken", token.expose().to_string()),
            ("DurationSeconds", request.duration.as_secs().to_string()),
        ];

        debug!(role_arn = %request.role_arn, endpoint = %self.endpoint, "AssumeRoleWithWebIdentity");

        let response = self
            .http
            .post(format!("{}/", self.endpoint))
            .header("content-type", "application/x-www-form-urlencoded; charset=utf-8")
            .header("accept", "application/xml")
            .body(form_body(&params))
            .send()
            .await
            .map_err(|e| AwsError::Http(e.to_string()))?;

        let body = read_response(response).await?;
        parse_credentials(&body)
    }
}

pub(crate) fn parse_credentials(body: &str) -> Result<ScopedCredentials, AwsError> {
    let doc = xml::parse(body)?;
    let credentials = xml::find(doc.root_element(), "Credentials")
        .ok_or_else(|| AwsError::Xml("missing <Credentials>".to_string()))?;

    Ok(ScopedCredentials {
        access_key_id: xml::required_text(credentials, "AccessKeyId")?,
        secret_access_key: SecretString::new(xml::required_text(credentials, "SecretAccessKey")?),
        session_token: SecretString::new(xml::required_text(credentials, "SessionToken")?),
        expires_at: xml::parse_timestamp(&xml::required_text(credentials, "Expiration")?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleWithWebIdentityResult>
    <SubjectFromWebIdentityToken>repo:acme/livekit-poc:ref:refs/heads/main</SubjectFromWebIdentityToken>
    <Audience>sts.amazonaws.com</Audience>
    <AssumedRoleUser>
      <Arn>arn:aws:sts::123456789012:assumed-role/github-deploy/shipit-0190a1b2</Arn>
      <AssumedRoleId>AROACLKWSDQRAOEXAMPLE:shipit-0190a1b2</AssumedRoleId>
    </AssumedRoleUser>
    <Credentials>
      <SessionToken>AQoDYXdzEE0a8ANXXXXXXXXNO1ewxE5TijQyp+IEXAMPLE</SessionToken>
      <SecretAccessKey>wJalrXUtnFEMI/K7MDENG/bPxRfiCYzEXAMPLEKEY</SecretAccessKey>
      <Expiration>2026-10-24T23:00:23Z</Expiration>
      <AccessKeyId>ASgeIAIOSFODNN7EXAMPLE</AccessKeyId>
    </Credentials>
    <Provider>token.actions.githubusercontent.com</Provider>
  </AssumeRoleWithWebIdentityResult>
  <ResponseMetadata>
    <RequestId>ad4156e9-bce1-11e2-82e6-6b6efEXAMPLE</RequestId>
  </ResponseMetadata>
</AssumeRoleWithWebIdentityResponse>"#;

    #[test]
    fn test_parse_credentials() {
        let creds = parse_credentials(RESPONSE).unwrap();
        assert_eq!(creds.access_key_id, "ASgeIAIOSFODNN7EXAMPLE");
        assert_eq!(
            creds.secret_access_key.expose(),
            "wJalrXUtnFEMI/K7MDENG/bPxRfiCYzEXAMPLEKEY"
        );
        assert!(creds.session_token.expose().starts_with("AQoDYXdzEE0a8AN"));
        assert_eq!(creds.expires_at.to_rfc3339(), "2026-10-24T23:00:23+00:00");
    }

    #[test]
    fn test_missing_credentials_is_malformed() {
        let body = "<AssumeRoleWithWebIdentityResponse><AssumeRoleWithWebIdentityResult/></AssumeRoleWithWebIdentityResponse>";
        assert!(matches!(parse_credentials(body), Err(AwsError::Xml(_))));
    }
}
