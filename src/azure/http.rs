//! HTTP utilities for Azure Resource Manager calls

use crate::error::ApiError;
use reqwest::header::HeaderMap;
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

/// Maximum length of response body to log (to avoid logging sensitive data)
const MAX_LOG_BODY_LENGTH: usize = 200;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound for a single request, body included
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Truncate long bodies and drop control characters before logging
pub(crate) fn sanitize_for_log(body: &str) -> String {
    let truncated = if body.len() > MAX_LOG_BODY_LENGTH {
        let mut end = MAX_LOG_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... [truncated, {} bytes total]", &body[..end], body.len())
    } else {
        body.to_string()
    };

    truncated.replace(|c: char| !c.is_ascii_graphic() && c != ' ', "")
}

/// Status, headers and raw body of one response
#[derive(Debug, Clone)]
pub struct ArmResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
}

impl ArmResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Parse the body, turning non-2xx statuses into [`ApiError::Status`]
    /// with the raw body as diagnostics
    pub fn into_json(self) -> Result<Value, ApiError> {
        if !self.is_success() {
            return Err(ApiError::Status {
                status: self.status,
                body: self.body,
            });
        }

        if self.body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&self.body).map_err(|e| ApiError::Malformed {
            message: format!("response is not JSON: {}", e),
        })
    }
}

/// HTTP client wrapper for ARM calls
#[derive(Clone)]
pub struct ArmHttpClient {
    client: Client,
}

impl ArmHttpClient {
    pub fn new() -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("azprov/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self { client })
    }

    pub async fn get(&self, url: &str, token: &str) -> Result<ArmResponse, ApiError> {
        tracing::debug!("GET {}", url);
        self.send(self.client.get(url).bearer_auth(token)).await
    }

    pub async fn put(&self, url: &str, token: &str, body: &Value) -> Result<ArmResponse, ApiError> {
        tracing::debug!("PUT {}", url);
        self.send(self.client.put(url).bearer_auth(token).json(body)).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<ArmResponse, ApiError> {
        let response = request.send().await.map_err(|e| ApiError::Transport {
            message: e.to_string(),
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.text().await.map_err(|e| ApiError::Transport {
            message: format!("failed to read response body: {}", e),
        })?;

        if !(200..300).contains(&status) && status != 404 {
            // Security: Only log sanitized/truncated error body
            tracing::error!("API error: {} - {}", status, sanitize_for_log(&body));
        }

        Ok(ArmResponse { status, headers, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_for_log_truncates() {
        let long = "x".repeat(500);
        let sanitized = sanitize_for_log(&long);
        assert!(sanitized.contains("[truncated, 500 bytes total]"));
        assert_eq!(sanitize_for_log("a\nb"), "ab");
    }

    #[test]
    fn test_into_json_keeps_error_body() {
        let response = ArmResponse {
            status: 400,
            headers: HeaderMap::new(),
            body: r#"{"error":{"code":"InvalidParameter"}}"#.into(),
        };
        assert_eq!(
            response.into_json(),
            Err(ApiError::Status {
                status: 400,
                body: r#"{"error":{"code":"InvalidParameter"}}"#.into()
            })
        );
    }
}
