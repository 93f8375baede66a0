use async_trait::async_trait;
use serde::de::DeserializeOwned;
use url::Url;

use crate::config::TransportConfig;
use crate::error::AppError;

use super::types::{LogsPage, OperationSnapshot};
use super::LogTransport;

// ============================================================================
// Helpers
// ============================================================================

/// Classify a request-level failure (no HTTP status available).
fn request_err(e: reqwest::Error) -> AppError {
    if e.is_decode() || e.is_body() {
        AppError::Transport(e.to_string())
    } else {
        AppError::NetworkOffline(e.to_string())
    }
}

/// Classify a non-success HTTP status.
fn status_err(status: reqwest::StatusCode, body: String, what: &str) -> AppError {
    let message = if body.trim().is_empty() {
        what.to_string()
    } else {
        format!("{what}: {}", body.trim())
    };
    match status.as_u16() {
        404 => AppError::NotFound(message),
        502..=504 => AppError::ServiceUnavailable(format!("HTTP {}", status.as_u16())),
        code => AppError::Http {
            status: code,
            message,
        },
    }
}

fn parse_base(field: &str, raw: &str) -> Result<Url, AppError> {
    let url = Url::parse(raw).map_err(|e| AppError::Config(format!("{field}: {e}")))?;
    if url.cannot_be_a_base() {
        return Err(AppError::Config(format!("{field}: not a base URL")));
    }
    Ok(url)
}

// ============================================================================
// HttpTransport
// ============================================================================

/// HTTP client for the pipeline log and status endpoints.
pub struct HttpTransport {
    http: reqwest::Client,
    logs_base: Url,
    status_base: Url,
    api_token: Option<String>,
}

impl HttpTransport {
    pub fn new(config: &TransportConfig) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| AppError::Internal(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            logs_base: parse_base("transport.logs_base_url", &config.logs_base_url)?,
            status_base: parse_base("transport.status_base_url", &config.status_base_url)?,
            api_token: config.api_token.clone(),
        })
    }

    pub fn logs_url(&self, run_id: &str, since: u64, limit: u32) -> Url {
        let mut url = self.logs_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(run_id);
        }
        url.query_pairs_mut()
            .append_pair("since", &since.to_string())
            .append_pair("limit", &limit.to_string());
        url
    }

    pub fn status_url(&self, run_id: &str) -> Url {
        let mut url = self.status_base.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(run_id).push("status");
        }
        url
    }

    fn authed(&self, url: Url) -> reqwest::RequestBuilder {
        let req = self.http.get(url);
        match &self.api_token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    /// Send a request, classify the status code, and deserialize the JSON body.
    async fn send_json<T: DeserializeOwned>(
        &self,
        req: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T, AppError> {
        let response = req.send().await.map_err(request_err)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_err(status, body, what));
        }
        response
            .json()
            .await
            .map_err(|e| AppError::Transport(format!("{what}: {e}")))
    }
}

#[async_trait]
impl LogTransport for HttpTransport {
    async fn fetch_logs(&self, run_id: &str, since: u64, limit: u32) -> Result<LogsPage, AppError> {
        let url = self.logs_url(run_id, since, limit);
        tracing::trace!(run_id = %run_id, since, limit, "GET logs");
        self.send_json(self.authed(url), &format!("logs for run {run_id}"))
            .await
    }

    async fn fetch_status(&self, run_id: &str) -> Result<OperationSnapshot, AppError> {
        let url = self.status_url(run_id);
        tracing::trace!(run_id = %run_id, "GET status");
        self.send_json(self.authed(url), &format!("status for run {run_id}"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport(logs: &str, status: &str) -> HttpTransport {
        HttpTransport::new(&TransportConfig {
            logs_base_url: logs.into(),
            status_base_url: status.into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_logs_url_shape() {
        let t = transport("http://localhost:8000/api/logs/", "http://localhost:8000/api/ops");
        assert_eq!(
            t.logs_url("r1", 3, 500).as_str(),
            "http://localhost:8000/api/logs/r1?since=3&limit=500"
        );
        assert_eq!(
            t.status_url("r1").as_str(),
            "http://localhost:8000/api/ops/r1/status"
        );
    }

    #[test]
    fn test_run_id_is_path_escaped() {
        let t = transport("http://localhost/logs", "http://localhost/ops");
        assert_eq!(
            t.logs_url("a b", 0, 10).as_str(),
            "http://localhost/logs/a%20b?since=0&limit=10"
        );
    }

    #[test]
    fn test_invalid_base_url_is_config_error() {
        let err = HttpTransport::new(&TransportConfig {
            logs_base_url: "not a url".into(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, AppError::Config(_)));
    }

    #[test]
    fn test_status_classification() {
        use reqwest::StatusCode;
        assert!(status_err(StatusCode::NOT_FOUND, String::new(), "logs").is_not_found());
        assert!(status_err(StatusCode::BAD_GATEWAY, String::new(), "logs").is_service_unavailable());
        assert!(status_err(StatusCode::SERVICE_UNAVAILABLE, "restarting".into(), "logs")
            .is_service_unavailable());
        match status_err(StatusCode::INTERNAL_SERVER_ERROR, "boom".into(), "logs") {
            AppError::Http { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "logs: boom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
