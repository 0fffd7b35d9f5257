//! Structured request records emitted by the proxy pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Bodies above this size, or with a non-text content type, are elided.
pub const BODY_CAPTURE_CAP: usize = 64 * 1024;

/// Final verdict recorded for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Allow,
    Block,
}

/// One redaction hit inside a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedactionEvent {
    pub rule: String,
    /// Where the secret appeared: `url`, `header:<name>`, or `body`.
    pub location: String,
    pub action: String,
}

/// One JSON line in `logs/proxy/requests-*.jsonl`.
///
/// Field order matters for the reader's timestamp prefilter: `timestamp`
/// must serialize near the head of the line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub url: String,
    pub request_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default)]
    pub response_headers: BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub injected_creds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redactions: Vec<RedactionEvent>,
}

impl RequestRecord {
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// Whether a content type is worth capturing as text.
pub fn is_text_content_type(content_type: Option<&str>) -> bool {
    let Some(ct) = content_type else {
        return false;
    };
    let ct = ct
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ct.starts_with("text/")
        || ct == "application/json"
        || ct == "application/x-www-form-urlencoded"
        || ct == "application/xml"
        || ct.ends_with("+json")
        || ct.ends_with("+xml")
}

/// Capture a body for the record: text bodies within the cap verbatim,
/// everything else as an eliding marker.
pub fn capture_body(content_type: Option<&str>, body: &[u8]) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if !is_text_content_type(content_type) || body.len() > BODY_CAPTURE_CAP {
        return Some(format!("[elided: {} bytes]", body.len()));
    }
    match std::str::from_utf8(body) {
        Ok(text) => Some(text.to_string()),
        Err(_) => Some(format!("[elided: {} bytes]", body.len())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_content_types() {
        assert!(is_text_content_type(Some("application/json")));
        assert!(is_text_content_type(Some("text/plain; charset=utf-8")));
        assert!(is_text_content_type(Some("application/vnd.api+json")));
        assert!(!is_text_content_type(Some("application/octet-stream")));
        assert!(!is_text_content_type(Some("image/png")));
        assert!(!is_text_content_type(None));
    }

    #[test]
    fn test_capture_body_elides_binary_and_large() {
        assert_eq!(
            capture_body(Some("application/octet-stream"), b"\x00\x01"),
            Some("[elided: 2 bytes]".to_string())
        );
        let big = vec![b'a'; BODY_CAPTURE_CAP + 1];
        assert_eq!(
            capture_body(Some("text/plain"), &big),
            Some(format!("[elided: {} bytes]", big.len()))
        );
        assert_eq!(
            capture_body(Some("text/plain"), b"hello"),
            Some("hello".to_string())
        );
        assert_eq!(capture_body(Some("text/plain"), b""), None);
    }

    #[test]
    fn test_timestamp_serializes_near_line_head() {
        let record = RequestRecord {
            id: "r-1".into(),
            timestamp: Utc::now(),
            method: "GET".into(),
            scheme: "https".into(),
            host: "example.com".into(),
            path: "/".into(),
            url: "https://example.com/".into(),
            request_headers: BTreeMap::new(),
            request_body: None,
            response_status: Some(200),
            response_headers: BTreeMap::new(),
            response_body: None,
            duration_ms: 5,
            error: None,
            decision: Decision::Allow,
            reason: None,
            injected_creds: Vec::new(),
            redactions: Vec::new(),
        };
        let line = record.to_json_line().expect("serialize");
        let pos = line.find("\"timestamp\"").expect("timestamp field");
        assert!(pos < 32, "timestamp must be parseable without full decode");
    }
}
