//! Push/pull transports
//!
//! The sync client talks to the server through `SyncTransport`. The HTTP
//! transport is what devices use; the in-process transport drives a
//! `SyncService` directly and backs embedded servers and tests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::StatusCode;

use crate::error::ClientError;
use crate::sync::{ChangeRecord, PingResponse, PullQuery, PushResponse, SyncService};

/// Header carrying the pushing device's platform
pub const PLATFORM_HEADER: &str = "x-device-platform";

#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn ping(&self, base_url: &str) -> Result<PingResponse, ClientError>;

    async fn push(
        &self,
        base_url: &str,
        platform: Option<&str>,
        batch: &[ChangeRecord],
    ) -> Result<PushResponse, ClientError>;

    async fn pull(
        &self,
        base_url: &str,
        since: DateTime<Utc>,
        query: &PullQuery,
    ) -> Result<Vec<ChangeRecord>, ClientError>;
}

/// REST transport over `reqwest`
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Every request carries `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(ClientError::Server {
            status: status.as_u16(),
            message: parse_error_message(status, &body),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn ping(&self, base_url: &str) -> Result<PingResponse, ClientError> {
        let response = self
            .client
            .get(format!("{}/sync/ping", base_url))
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn push(
        &self,
        base_url: &str,
        platform: Option<&str>,
        batch: &[ChangeRecord],
    ) -> Result<PushResponse, ClientError> {
        let mut request = self
            .client
            .post(format!("{}/sync/receive-changes", base_url))
            .json(batch);
        if let Some(platform) = platform {
            request = request.header(PLATFORM_HEADER, platform);
        }

        let response = request.send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    async fn pull(
        &self,
        base_url: &str,
        since: DateTime<Utc>,
        query: &PullQuery,
    ) -> Result<Vec<ChangeRecord>, ClientError> {
        let since = since.to_rfc3339_opts(SecondsFormat::Micros, true);
        let response = self
            .client
            .get(format!(
                "{}/sync/changes-since/{}",
                base_url,
                urlencoding::encode(&since)
            ))
            .query(query)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }
}

fn parse_error_message(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = payload.get("message").and_then(|m| m.as_str()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        trimmed.to_string()
    }
}

/// Calls a `SyncService` in the same process; the base URL is ignored
#[derive(Clone)]
pub struct LocalTransport {
    service: SyncService,
}

impl LocalTransport {
    pub fn new(service: SyncService) -> Self {
        Self { service }
    }
}

fn local_error(e: crate::error::AppError) -> ClientError {
    ClientError::Server {
        status: 500,
        message: e.to_string(),
    }
}

#[async_trait]
impl SyncTransport for LocalTransport {
    async fn ping(&self, _base_url: &str) -> Result<PingResponse, ClientError> {
        Ok(self.service.ping())
    }

    async fn push(
        &self,
        _base_url: &str,
        platform: Option<&str>,
        batch: &[ChangeRecord],
    ) -> Result<PushResponse, ClientError> {
        self.service
            .push(batch.to_vec(), platform)
            .await
            .map_err(local_error)
    }

    async fn pull(
        &self,
        _base_url: &str,
        since: DateTime<Utc>,
        query: &PullQuery,
    ) -> Result<Vec<ChangeRecord>, ClientError> {
        self.service.pull(since, query).await.map_err(local_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_prefers_json_message() {
        let body = r#"{"error":"bad_request","message":"Invalid timestamp: soon"}"#;
        assert_eq!(
            parse_error_message(StatusCode::BAD_REQUEST, body),
            "Invalid timestamp: soon"
        );
        assert_eq!(parse_error_message(StatusCode::BAD_GATEWAY, "  "), "HTTP 502");
        assert_eq!(parse_error_message(StatusCode::BAD_GATEWAY, "upstream down"), "upstream down");
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let transport = HttpTransport::new(Duration::from_millis(500)).unwrap();
        let err = transport.ping("http://127.0.0.1:1").await.unwrap_err();
        assert!(err.is_transient());
    }
}
