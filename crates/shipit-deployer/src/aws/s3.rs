//! S3 object upload (path-style addressing).

use bytes::Bytes;
use chrono::Utc;
use shipit_core::credentials::ScopedCredentials;
use tracing::debug;
use url::Url;

use super::sigv4::{self, RequestSigner};
use super::{AwsError, read_response};

const SERVICE: &str = "s3";

pub struct S3Client {
    http: reqwest::Client,
    endpoint: String,
    region: String,
    credentials: ScopedCredentials,
}

impl S3Client {
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        region: &str,
        credentials: ScopedCredentials,
    ) -> Self {
        Self {
            http,
            endpoint,
            region: region.to_string(),
            credentials,
        }
    }

    pub(crate) fn object_url(&self, bucket: &str, key: &str) -> Result<Url, AwsError> {
        let path = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect::<Vec<_>>()
            .join("/");
        Url::parse(&format!("{}/{}/{}", self.endpoint, bucket, path))
            .map_err(|e| AwsError::Signing(format!("invalid object URL: {}", e)))
    }

    /// Upload `body` to `s3://bucket/key`.
    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), AwsError> {
        let url = self.object_url(bucket, key)?;
        let hash = sigv4::payload_hash(&body);
        let headers = vec![
            ("content-type".to_string(), content_type.to_string()),
            ("x-amz-content-sha256".to_string(), hash.clone()),
        ];
        let signer = RequestSigner::new(&self.credentials, &self.region, SERVICE);
        let auth = signer.sign("PUT", &url, &headers, &hash, Utc::now())?;

        debug!(bucket, key, size = body.len(), "S3 PutObject");

        let mut request = self.http.put(url).body(body);
        for (name, value) in headers.into_iter().chain(auth) {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AwsError::Http(e.to_string()))?;
        read_response(response).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipit_core::secret::SecretString;

    #[test]
    fn test_object_url_encodes_segments() {
        let client = S3Client::new(
            reqwest::Client::new(),
            "https://s3.us-east-1.amazonaws.com".to_string(),
            "us-east-1",
            ScopedCredentials {
                access_key_id: "ASIAEXAMPLE".to_string(),
                secret_access_key: SecretString::new("secret"),
                session_token: SecretString::new("token"),
                expires_at: Utc::now(),
            },
        );
        let url = client
            .object_url("elasticbeanstalk-us-east-1-123456789012", "LiveKitPOC/v 1.zip")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://s3.us-east-1.amazonaws.com/elasticbeanstalk-us-east-1-123456789012/LiveKitPOC/v%201.zip"
        );
    }
}
