//! Helpers for AWS XML responses.

use chrono::{DateTime, Utc};
use roxmltree::{Document, Node};

use super::AwsError;

pub(crate) fn parse(body: &str) -> Result<Document<'_>, AwsError> {
    Document::parse(body).map_err(|e| AwsError::Xml(e.to_string()))
}

/// Extract `(Code, Message)` from an error response.
///
/// Query APIs wrap the error in `<ErrorResponse><Error>`; S3 returns a bare
/// `<Error>`.
pub fn parse_error(body: &str) -> Option<(String, String)> {
    let doc = Document::parse(body).ok()?;
    let error = doc.descendants().find(|n| n.has_tag_name("Error"))?;
    let code = child_text(error, "Code")?;
    let message = child_text(error, "Message").unwrap_or_default();
    Some((code, message))
}

/// First descendant element named `name`.
pub(crate) fn find<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.descendants().find(|n| n.is_element() && n.has_tag_name(name))
}

/// Trimmed text of the direct child element named `name`.
pub(crate) fn child_text(node: Node<'_, '_>, name: &str) -> Option<String> {
    node.children()
        .find(|n| n.is_element() && n.has_tag_name(name))
        .and_then(|n| n.text())
        .map(|s| s.trim().to_string())
}

pub(crate) fn required_text(node: Node<'_, '_>, name: &str) -> Result<String, AwsError> {
    child_text(node, name).ok_or_else(|| AwsError::Xml(format!("missing <{}>", name)))
}

/// `<member>` children of the first descendant named `list`.
pub(crate) fn members<'a, 'input>(node: Node<'a, 'input>, list: &str) -> Vec<Node<'a, 'input>> {
    match find(node, list) {
        Some(list) => list
            .children()
            .filter(|n| n.is_element() && n.has_tag_name("member"))
            .collect(),
        None => Vec::new(),
    }
}

pub(crate) fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AwsError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| AwsError::Xml(format!("invalid timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_error_response() {
        let body = r#"<ErrorResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <Error>
    <Type>Sender</Type>
    <Code>AccessDenied</Code>
    <Message>Not authorized to perform sts:AssumeRoleWithWebIdentity</Message>
  </Error>
  <RequestId>c6104cbe-af31-11e0-8154-cbc7ccf896c7</RequestId>
</ErrorResponse>"#;
        let (code, message) = parse_error(body).unwrap();
        assert_eq!(code, "AccessDenied");
        assert_eq!(message, "Not authorized to perform sts:AssumeRoleWithWebIdentity");
    }

    #[test]
    fn test_s3_error_response() {
        let body = r#"<?xml version="1.0" encoding="UTF-8"?>
<Error><Code>NoSuchBucket</Code><Message>The specified bucket does not exist</Message></Error>"#;
        let (code, _) = parse_error(body).unwrap();
        assert_eq!(code, "NoSuchBucket");
    }

    #[test]
    fn test_not_an_error() {
        assert!(parse_error("<html>Bad Gateway</html>").is_none());
        assert!(parse_error("not xml").is_none());
    }

    #[test]
    fn test_members() {
        let doc = parse("<R><Items><member><V>a</V></member><member><V>b</V></member></Items></R>")
            .unwrap();
        let values: Vec<String> = members(doc.root_element(), "Items")
            .into_iter()
            .filter_map(|m| child_text(m, "V"))
            .collect();
        assert_eq!(values, vec!["a", "b"]);
    }

    #[test]
    fn test_timestamp_with_millis() {
        let t = parse_timestamp("2010-11-17T04:01:40.668Z").unwrap();
        assert_eq!(t.timestamp_subsec_millis(), 668);
    }
}
