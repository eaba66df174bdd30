//! HTTP probes against tunnelled services.

use std::time::Duration;

use dockside_core::{DeployError, DeployWarning, Result};
use serde_json::Value;
use tracing::debug;

/// A completed request. The body is kept even when it is not JSON.
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub url: String,
    pub status: u16,
    pub body: String,
    pub json: Option<Value>,
    parse_error: Option<String>,
}

impl ProbeResponse {
    fn new(url: String, status: u16, body: String) -> Self {
        let (json, parse_error) = match serde_json::from_str::<Value>(&body) {
            Ok(value) => (Some(value), None),
            Err(e) => (None, Some(e.to_string())),
        };
        Self {
            url,
            status,
            body,
            json,
            parse_error,
        }
    }

    /// `MalformedResponse` when the body did not parse.
    pub fn warning(&self) -> Option<DeployWarning> {
        self.parse_error
            .as_ref()
            .map(|detail| DeployWarning::MalformedResponse {
                url: self.url.clone(),
                detail: detail.clone(),
            })
    }

    /// String value of `key` in the parsed body.
    pub fn field(&self, key: &str) -> Option<String> {
        self.json.as_ref().and_then(|json| extract_field(json, key))
    }
}

/// Value of `key` as a string. `None` when absent or null.
pub fn extract_field(json: &Value, key: &str) -> Option<String> {
    match json.get(key)? {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Thin wrapper over a `reqwest::Client` with a per-request timeout.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DeployError::Config(format!("http client: {e}")))?;
        Ok(Self { client })
    }

    /// GET `base_url` + `path`.
    ///
    /// Transport errors and non-success statuses are fatal. A body that is
    /// not JSON is not; see [`ProbeResponse::warning`].
    pub async fn get(&self, base_url: &str, path: &str) -> Result<ProbeResponse> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), path);
        debug!(url = %url, "GET");

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| DeployError::RequestFailed {
                    url: url.clone(),
                    detail: e.to_string(),
                })?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| DeployError::RequestFailed {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        if !status.is_success() {
            return Err(DeployError::RequestFailed {
                url,
                detail: format!("HTTP {}: {}", status.as_u16(), body.trim()),
            });
        }
        debug!(url = %url, status = status.as_u16(), bytes = body.len(), "Response");
        Ok(ProbeResponse::new(url, status.as_u16(), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_field() {
        let value = json!({"task_id": "abc", "count": 3, "result": null});
        assert_eq!(extract_field(&value, "task_id").as_deref(), Some("abc"));
        assert_eq!(extract_field(&value, "count").as_deref(), Some("3"));
        assert_eq!(extract_field(&value, "result"), None);
        assert_eq!(extract_field(&value, "missing"), None);
    }

    #[test]
    fn test_non_json_body_is_a_warning() {
        let response = ProbeResponse::new(
            "http://127.0.0.1:8000/task/x".to_string(),
            200,
            "<html>Internal</html>".to_string(),
        );
        assert!(response.json.is_none());
        assert_eq!(response.field("task_id"), None);
        match response.warning() {
            Some(DeployWarning::MalformedResponse { url, .. }) => assert!(url.ends_with("/task/x")),
            other => panic!("expected MalformedResponse, got {other:?}"),
        }
    }

    #[test]
    fn test_json_body_has_no_warning() {
        let response = ProbeResponse::new(
            "u".to_string(),
            200,
            r#"{"task_id":"t-1","message":"Task queued"}"#.to_string(),
        );
        assert!(response.warning().is_none());
        assert_eq!(response.field("message").as_deref(), Some("Task queued"));
    }

    #[tokio::test]
    async fn test_connection_refused_is_request_failed() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = HttpProbe::new(Duration::from_secs(2)).unwrap();
        let err = probe
            .get(&format!("http://127.0.0.1:{port}"), "/task/x")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "request_failed");
    }
}
