//! AWS Signature Version 4 request signing.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use shipit_core::credentials::ScopedCredentials;
use url::Url;

use super::AwsError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Hex SHA-256 of a request body.
pub fn payload_hash(body: &[u8]) -> String {
    hex::encode(Sha256::digest(body))
}

/// Signs requests for one service in one region.
pub struct RequestSigner<'a> {
    credentials: &'a ScopedCredentials,
    region: &'a str,
    service: &'a str,
}

impl<'a> RequestSigner<'a> {
    pub fn new(credentials: &'a ScopedCredentials, region: &'a str, service: &'a str) -> Self {
        Self {
            credentials,
            region,
            service,
        }
    }

    /// Compute the headers that authenticate a request.
    ///
    /// `headers` are the request headers to sign besides `host` and
    /// `x-amz-date`, which are added here. The returned list contains
    /// `x-amz-date`, the session token when present, and `authorization`.
    pub fn sign(
        &self,
        method: &str,
        url: &Url,
        headers: &[(String, String)],
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, String)>, AwsError> {
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(AwsError::Signing(format!("{} has no host", url))),
        };

        let mut added = vec![("x-amz-date".to_string(), amz_date.clone())];
        if !self.credentials.session_token.is_empty() {
            added.push((
                "x-amz-security-token".to_string(),
                self.credentials.session_token.expose().to_string(),
            ));
        }

        let mut all: Vec<(String, String)> = headers.to_vec();
        all.push(("host".to_string(), host));
        all.extend(added.iter().cloned());

        let (canonical, signed_headers) = canonical_request(method, url, &all, payload_hash);
        let scope = format!("{}/{}/{}/aws4_request", date, self.region, self.service);
        let to_sign = string_to_sign(&amz_date, &scope, &canonical);
        let key = signing_key(
            self.credentials.secret_access_key.expose(),
            &date,
            self.region,
            self.service,
        );
        let signature = hex::encode(hmac(&key, to_sign.as_bytes()));

        added.push((
            "authorization".to_string(),
            format!(
                "{} Credential={}/{}, SignedHeaders={}, Signature={}",
                ALGORITHM, self.credentials.access_key_id, scope, signed_headers, signature
            ),
        ));
        Ok(added)
    }
}

/// Build the canonical request; returns it with the signed header list.
pub(crate) fn canonical_request(
    method: &str,
    url: &Url,
    headers: &[(String, String)],
    payload_hash: &str,
) -> (String, String) {
    let path = url.path();
    let canonical_uri = if path.is_empty() {
        "/".to_string()
    } else {
        path.split('/')
            .map(|segment| {
                let decoded = urlencoding::decode(segment)
                    .map(|s| s.into_owned())
                    .unwrap_or_else(|_| segment.to_string());
                urlencoding::encode(&decoded).into_owned()
            })
            .collect::<Vec<_>>()
            .join("/")
    };

    let mut query: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| {
            (
                urlencoding::encode(&k).into_owned(),
                urlencoding::encode(&v).into_owned(),
            )
        })
        .collect();
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&");

    let mut normalized: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.to_ascii_lowercase(),
                v.split_whitespace().collect::<Vec<_>>().join(" "),
            )
        })
        .collect();
    normalized.sort();
    let canonical_headers: String = normalized
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = normalized
        .iter()
        .map(|(k, _)| k.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let canonical = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method, canonical_uri, canonical_query, canonical_headers, signed_headers, payload_hash
    );
    (canonical, signed_headers)
}

pub(crate) fn string_to_sign(amz_date: &str, scope: &str, canonical_request: &str) -> String {
    format!(
        "{}\n{}\n{}\n{}",
        ALGORITHM,
        amz_date,
        scope,
        payload_hash(canonical_request.as_bytes())
    )
}

pub(crate) fn signing_key(secret: &str, date: &str, region: &str, service: &str) -> Vec<u8> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes());
    let k_region = hmac(&k_date, region.as_bytes());
    let k_service = hmac(&k_region, service.as_bytes());
    hmac(&k_service, b"aws4_request")
}

fn hmac(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take any size key");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use shipit_core::secret::SecretString;

    const SECRET: &str = "wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY";
    const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    fn credentials(token: &str) -> ScopedCredentials {
        ScopedCredentials {
            access_key_id: "AKIDEXAMPLE".to_string(),
            secret_access_key: SecretString::new(SECRET),
            session_token: SecretString::new(token),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    fn vector_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 8, 30, 12, 36, 0).unwrap()
    }

    fn vector_url() -> Url {
        Url::parse("https://iam.amazonaws.com/?Action=ListUsers&Version=2010-05-08").unwrap()
    }

    fn content_type() -> Vec<(String, String)> {
        vec![(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        )]
    }

    #[test]
    fn test_empty_payload_hash() {
        assert_eq!(payload_hash(b""), EMPTY_HASH);
    }

    // Published example from the AWS General Reference (IAM ListUsers).
    #[test]
    fn test_canonical_request_vector() {
        let mut headers = content_type();
        headers.push(("host".to_string(), "iam.amazonaws.com".to_string()));
        headers.push(("x-amz-date".to_string(), "20150830T123600Z".to_string()));

        let (canonical, signed) = canonical_request("GET", &vector_url(), &headers, EMPTY_HASH);

        assert_eq!(signed, "content-type;host;x-amz-date");
        assert_eq!(
            canonical,
            "GET\n/\nAction=ListUsers&Version=2010-05-08\n\
             content-type:application/x-www-form-urlencoded; charset=utf-8\n\
             host:iam.amazonaws.com\nx-amz-date:20150830T123600Z\n\n\
             content-type;host;x-amz-date\n\
             e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(
            payload_hash(canonical.as_bytes()),
            "f536975d06c0309214f805bb90ccff089219ecd68b2577efef23edd43b7e1a59"
        );
    }

    #[test]
    fn test_signing_key_vector() {
        let key = signing_key(SECRET, "20150830", "us-east-1", "iam");
        assert_eq!(
            hex::encode(key),
            "c4afb1cc5771d871763a393e44b703571b55cc28424d1a5e86da6ed3c154a4b9"
        );
    }

    #[test]
    fn test_signature_vector() {
        let creds = credentials("");
        let signer = RequestSigner::new(&creds, "us-east-1", "iam");
        let headers = signer
            .sign("GET", &vector_url(), &content_type(), EMPTY_HASH, vector_time())
            .unwrap();

        let authorization = headers
            .iter()
            .find(|(k, _)| k == "authorization")
            .map(|(_, v)| v.as_str())
            .unwrap();
        assert_eq!(
            authorization,
            "AWS4-HMAC-SHA256 Credential=AKIDEXAMPLE/20150830/us-east-1/iam/aws4_request, \
             SignedHeaders=content-type;host;x-amz-date, \
             Signature=5d672d79c15b13162d9279b0855cfba6789a8edb4c82c400e06b5924a6f2b5d7"
        );
        assert!(!headers.iter().any(|(k, _)| k == "x-amz-security-token"));
    }

    #[test]
    fn test_session_token_is_signed() {
        let creds = credentials("session-token");
        let signer = RequestSigner::new(&creds, "us-east-1", "iam");
        let headers = signer
            .sign("GET", &vector_url(), &content_type(), EMPTY_HASH, vector_time())
            .unwrap();

        assert!(
            headers
                .iter()
                .any(|(k, v)| k == "x-amz-security-token" && v == "session-token")
        );
        let authorization = &headers.last().unwrap().1;
        assert!(authorization.contains("SignedHeaders=content-type;host;x-amz-date;x-amz-security-token"));
    }

    #[test]
    fn test_non_default_port_in_host() {
        let url = Url::parse("http://localhost:4566/bucket/app/abc123.zip").unwrap();
        let mut headers = vec![("host".to_string(), "localhost:4566".to_string())];
        headers.push(("x-amz-date".to_string(), "20150830T123600Z".to_string()));
        let (canonical, _) = canonical_request("PUT", &url, &headers, EMPTY_HASH);
        assert!(canonical.starts_with("PUT\n/bucket/app/abc123.zip\n\n"));
        assert!(canonical.contains("host:localhost:4566\n"));
    }
}
