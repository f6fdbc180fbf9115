//! Elastic Beanstalk query API client.

use chrono::{DateTime, SecondsFormat, Utc};
use roxmltree::Node;
use shipit_core::credentials::ScopedCredentials;

use super::{AwsError, QueryClient, xml};

const SERVICE: &str = "elasticbeanstalk";
const API_VERSION: &str = "2010-12-01";

/// An application version record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationVersion {
    pub application: String,
    pub version_label: String,
    pub status: Option<String>,
    pub s3_bucket: Option<String>,
    pub s3_key: Option<String>,
}

/// Environment as returned by `DescribeEnvironments` and `UpdateEnvironment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentDescription {
    pub environment_id: String,
    pub environment_name: String,
    pub version_label: Option<String>,
    pub status: String,
    pub health: Option<String>,
    pub date_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescription {
    pub event_date: DateTime<Utc>,
    pub severity: String,
    pub message: String,
    pub version_label: Option<String>,
}

pub struct BeanstalkClient {
    inner: QueryClient,
}

impl BeanstalkClient {
    pub fn new(
        http: reqwest::Client,
        endpoint: String,
        region: &str,
        credentials: ScopedCredentials,
    ) -> Self {
        Self {
            inner: QueryClient::new(http, endpoint, region, SERVICE, API_VERSION, credentials),
        }
    }

    pub async fn describe_application_version(
        &self,
        application: &str,
        version_label: &str,
    ) -> Result<Option<ApplicationVersion>, AwsError> {
        let body = self
            .inner
            .call(
                "DescribeApplicationVersions",
                &[
                    ("ApplicationName", application.to_string()),
                    ("VersionLabels.member.1", version_label.to_string()),
                ],
            )
            .await?;
        let versions = parse_application_versions(&body)?;
        Ok(versions
            .into_iter()
            .find(|v| v.version_label == version_label))
    }

    /// Returns the account's Beanstalk storage bucket, creating it if needed.
    pub async fn create_storage_location(&self) -> Result<String, AwsError> {
        let body = self.inner.call("CreateStorageLocation", &[]).await?;
        let doc = xml::parse(&body)?;
        let result = xml::find(doc.root_element(), "CreateStorageLocationResult")
            .ok_or_else(|| AwsError::Xml("missing <CreateStorageLocationResult>".to_string()))?;
        xml::required_text(result, "S3Bucket")
    }

    pub async fn create_application_version(
        &self,
        application: &str,
        version_label: &str,
        description: Option<&str>,
        s3_bucket: &str,
        s3_key: &str,
    ) -> Result<ApplicationVersion, AwsError> {
        let mut params = vec![
            ("ApplicationName", application.to_string()),
            ("VersionLabel", version_label.to_string()),
            ("SourceBundle.S3Bucket", s3_bucket.to_string()),
            ("SourceBundle.S3Key", s3_key.to_string()),
        ];
        if let Some(description) = description {
            params.push(("Description", description.to_string()));
        }
        let body = self.inner.call("CreateApplicationVersion", &params).await?;
        let doc = xml::parse(&body)?;
        let version = xml::find(doc.root_element(), "ApplicationVersion")
            .ok_or_else(|| AwsError::Xml("missing <ApplicationVersion>".to_string()))?;
        parse_application_version(version)
    }

    pub async fn update_environment(
        &self,
        application: &str,
        environment: &str,
        version_label: &str,
    ) -> Result<EnvironmentDescription, AwsError> {
        let body = self
            .inner
            .call(
                "UpdateEnvironment",
                &[
                    ("ApplicationName", application.to_string()),
                    ("EnvironmentName", environment.to_string()),
                    ("VersionLabel", version_label.to_string()),
                ],
            )
            .await?;
        let doc = xml::parse(&body)?;
        let result = xml::find(doc.root_element(), "UpdateEnvironmentResult")
            .ok_or_else(|| AwsError::Xml("missing <UpdateEnvironmentResult>".to_string()))?;
        parse_environment(result)
    }

    /// `None` when the environment does not exist (or was deleted).
    pub async fn describe_environment(
        &self,
        application: &str,
        environment: &str,
    ) -> Result<Option<EnvironmentDescription>, AwsError> {
        let body = self
            .inner
            .call(
                "DescribeEnvironments",
                &[
                    ("ApplicationName", application.to_string()),
                    ("EnvironmentNames.member.1", environment.to_string()),
                    ("IncludeDeleted", "false".to_string()),
                ],
            )
            .await?;
        let environments = parse_environments(&body)?;
        Ok(environments
            .into_iter()
            .find(|e| e.environment_name == environment))
    }

    /// Events for the environment at or after `since`, oldest first.
    pub async fn describe_events(
        &self,
        application: &str,
        environment: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<EventDescription>, AwsError> {
        let body = self
            .inner
            .call(
                "DescribeEvents",
                &[
                    ("ApplicationName", application.to_string()),
                    ("EnvironmentName", environment.to_string()),
                    (
                        "StartTime",
                        since.to_rfc3339_opts(SecondsFormat::Millis, true),
                    ),
                ],
            )
            .await?;
        let mut events = parse_events(&body)?;
        events.sort_by(|a, b| a.event_date.cmp(&b.event_date));
        Ok(events)
    }
}

pub(crate) fn parse_application_versions(body: &str) -> Result<Vec<ApplicationVersion>, AwsError> {
    let doc = xml::parse(body)?;
    xml::members(doc.root_element(), "ApplicationVersions")
        .into_iter()
        .map(parse_application_version)
        .collect()
}

fn parse_application_version(node: Node<'_, '_>) -> Result<ApplicationVersion, AwsError> {
    let bundle = xml::find(node, "SourceBundle");
    Ok(ApplicationVersion {
        application: xml::required_text(node, "ApplicationName")?,
        version_label: xml::required_text(node, "VersionLabel")?,
        status: xml::child_text(node, "Status"),
        s3_bucket: bundle.and_then(|b| xml::child_text(b, "S3Bucket")),
        s3_key: bundle.and_then(|b| xml::child_text(b, "S3Key")),
    })
}

pub(crate) fn parse_environments(body: &str) -> Result<Vec<EnvironmentDescription>, AwsError> {
    let doc = xml::parse(body)?;
    xml::members(doc.root_element(), "Environments")
        .into_iter()
        .map(parse_environment)
        .collect()
}

fn parse_environment(node: Node<'_, '_>) -> Result<EnvironmentDescription, AwsError> {
    let date_updated = match xml::child_text(node, "DateUpdated") {
        Some(raw) => Some(xml::parse_timestamp(&raw)?),
        None => None,
    };
    Ok(EnvironmentDescription {
        environment_id: xml::required_text(node, "EnvironmentId")?,
        environment_name: xml::required_text(node, "EnvironmentName")?,
        version_label: xml::child_text(node, "VersionLabel").filter(|v| !v.is_empty()),
        status: xml::required_text(node, "Status")?,
        health: xml::child_text(node, "Health"),
        date_updated,
    })
}

pub(crate) fn parse_events(body: &str) -> Result<Vec<EventDescription>, AwsError> {
    let doc = xml::parse(body)?;
    xml::members(doc.root_element(), "Events")
        .into_iter()
        .map(|node| {
            Ok(EventDescription {
                event_date: xml::parse_timestamp(&xml::required_text(node, "EventDate")?)?,
                severity: xml::child_text(node, "Severity").unwrap_or_else(|| "INFO".to_string()),
                message: xml::child_text(node, "Message").unwrap_or_default(),
                version_label: xml::child_text(node, "VersionLabel"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_application_versions() {
        let body = r#"<DescribeApplicationVersionsResponse xmlns="https://elasticbeanstalk.amazonaws.com/docs/2010-12-01/">
  <DescribeApplicationVersionsResult>
    <ApplicationVersions>
      <member>
        <SourceBundle>
          <S3Bucket>elasticbeanstalk-us-east-1-123456789012</S3Bucket>
          <S3Key>LiveKitPOC/abc123.zip</S3Key>
        </SourceBundle>
        <VersionLabel>abc123</VersionLabel>
        <ApplicationName>LiveKitPOC</ApplicationName>
        <Status>UNPROCESSED</Status>
        <DateCreated>2026-10-17T03:21:51.144Z</DateCreated>
      </member>
    </ApplicationVersions>
  </DescribeApplicationVersionsResult>
  <ResponseMetadata><RequestId>773cd80a-f26c-11df-8a78-9f77047e0d0c</RequestId></ResponseMetadata>
</DescribeApplicationVersionsResponse>"#;
        let versions = parse_application_versions(body).unwrap();
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].version_label, "abc123");
        assert_eq!(versions[0].s3_key.as_deref(), Some("LiveKitPOC/abc123.zip"));
        assert_eq!(versions[0].status.as_deref(), Some("UNPROCESSED"));
    }

    #[test]
    fn test_parse_empty_versions() {
        let body = "<DescribeApplicationVersionsResponse><DescribeApplicationVersionsResult><ApplicationVersions/></DescribeApplicationVersionsResult></DescribeApplicationVersionsResponse>";
        assert!(parse_application_versions(body).unwrap().is_empty());
    }

    #[test]
    fn test_parse_environments() {
        let body = r#"<DescribeEnvironmentsResponse xmlns="https://elasticbeanstalk.amazonaws.com/docs/2010-12-01/">
  <DescribeEnvironmentsResult>
    <Environments>
      <member>
        <VersionLabel>abc123</VersionLabel>
        <Status>Updating</Status>
        <ApplicationName>LiveKitPOC</ApplicationName>
        <EndpointURL>awseb-e-i-AWSEBLoa-1RDLX6TC9VUAO-0123456789.us-east-1.elb.amazonaws.com</EndpointURL>
        <Health>Grey</Health>
        <EnvironmentId>e-icsgecu3wf</EnvironmentId>
        <DateUpdated>2026-10-17T04:01:40.668Z</DateUpdated>
        <EnvironmentName>LiveKitPOC-dev</EnvironmentName>
      </member>
    </Environments>
  </DescribeEnvironmentsResult>
</DescribeEnvironmentsResponse>"#;
        let environments = parse_environments(body).unwrap();
        assert_eq!(
            environments[0],
            EnvironmentDescription {
                environment_id: "e-icsgecu3wf".to_string(),
                environment_name: "LiveKitPOC-dev".to_string(),
                version_label: Some("abc123".to_string()),
                status: "Updating".to_string(),
                health: Some("Grey".to_string()),
                date_updated: Some(xml::parse_timestamp("2026-10-17T04:01:40.668Z").unwrap()),
            }
        );
    }

    #[test]
    fn test_parse_events() {
        let body = r#"<DescribeEventsResponse>
  <DescribeEventsResult>
    <Events>
      <member>
        <Message>Environment update completed successfully.</Message>
        <EventDate>2026-10-17T04:05:00.000Z</EventDate>
        <Severity>INFO</Severity>
        <EnvironmentName>LiveKitPOC-dev</EnvironmentName>
      </member>
      <member>
        <Message>Deploying new version to instance(s).</Message>
        <EventDate>2026-10-17T04:02:00.000Z</EventDate>
        <VersionLabel>abc123</VersionLabel>
        <Severity>INFO</Severity>
      </member>
    </Events>
  </DescribeEventsResult>
</DescribeEventsResponse>"#;
        let events = parse_events(body).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].version_label.as_deref(), Some("abc123"));
        assert_eq!(events[0].severity, "INFO");
    }

    #[test]
    fn test_environment_without_id_is_malformed() {
        let body = "<R><Environments><member><Status>Ready</Status></member></Environments></R>";
        assert!(matches!(parse_environments(body), Err(AwsError::Xml(_))));
    }
}
