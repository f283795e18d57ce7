//! One-shot HTTP fetches that seed the store before push sync takes over.

use std::future::Future;
use std::time::Duration;

use podsync_proto::config::StartupConfig;
use podsync_proto::protocol::{Notification, ServerConfig};
use reqwest::Client;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::backoff::Backoff;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{url} returned status {status}")]
    Status { url: String, status: reqwest::StatusCode },
    #[error("failed to decode response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Client for the server's REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    client: Client,
    api_url: String,
}

impl ApiClient {
    pub fn new(api_url: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|source| FetchError::Request {
                url: api_url.to_string(),
                source,
            })?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.api_url, path.trim_start_matches('/'))
    }

    /// `GET {api}/sys/config`
    pub async fn fetch_server_config(&self) -> Result<ServerConfig, FetchError> {
        self.get_json("sys/config").await
    }

    /// `GET {api}/notifications/unread`
    pub async fn fetch_unread_notifications(&self) -> Result<Vec<Notification>, FetchError> {
        self.get_json("notifications/unread").await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let url = self.endpoint(path);
        debug!("startup: GET {}", url);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.clone(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url,
                status: response.status(),
            });
        }

        response
            .json()
            .await
            .map_err(|source| FetchError::Decode { url, source })
    }
}

/// How often and how patiently to retry a startup fetch.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &StartupConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }
}

/// Run `op` until it succeeds or `policy.max_attempts` is used up. Returns
/// the last error.
pub async fn with_retry<T, E, F, Fut>(what: &str, policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut backoff = Backoff::new(policy.initial_backoff, policy.max_backoff);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts => {
                warn!("startup: {} failed after {} attempts: {}", what, attempt, e);
                return Err(e);
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    "startup: {} failed (attempt {}/{}): {}; retrying in {:?}",
                    what, attempt, policy.max_attempts, e, delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(4),
        }
    }

    /// Serve one canned HTTP response per accepted connection.
    async fn serve(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/api/v1", addr)
    }

    #[test]
    fn test_endpoint_joins_paths() {
        let api = ApiClient::new("http://localhost:8000/api/v1/", Duration::from_secs(1)).unwrap();
        assert_eq!(api.endpoint("sys/config"), "http://localhost:8000/api/v1/sys/config");
        assert_eq!(
            api.endpoint("/notifications/unread"),
            "http://localhost:8000/api/v1/notifications/unread"
        );
    }

    #[test]
    fn test_policy_always_tries_once() {
        let policy = RetryPolicy::from_config(&StartupConfig {
            max_attempts: 0,
            ..StartupConfig::default()
        });
        assert_eq!(policy.max_attempts, 1);
    }

    #[tokio::test]
    async fn test_retry_until_success() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<u32, String> = with_retry("lookup", &quick_policy(5), || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(format!("attempt {} failed", n))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result, Ok(3));
    }

    #[tokio::test]
    async fn test_retry_gives_up_with_last_error() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: Result<(), String> = with_retry("lookup", &quick_policy(2), || async move {
            let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
            Err(format!("attempt {}", n))
        })
        .await;
        assert_eq!(result, Err("attempt 2".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_fetch_server_config() {
        let base = serve(
            "200 OK",
            r#"{"serverUrl":"http://localhost:8000/","oidcConfigured":false,"basicAuth":true}"#,
        )
        .await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        let config = api.fetch_server_config().await.unwrap();
        assert_eq!(config.server_url, "http://localhost:8000/");
        assert!(!config.oidc_configured);
        assert!(config.oidc_config.is_none());
    }

    #[tokio::test]
    async fn test_fetch_unread_notifications() {
        let base = serve(
            "200 OK",
            r#"[{"id":1,"message":"Feed updated","status":"unread","type_of_message":"Download","created_at":"2024-01-01T00:00:00"}]"#,
        )
        .await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        let notifications = api.fetch_unread_notifications().await.unwrap();
        assert_eq!(notifications.len(), 1);
        assert!(notifications[0].is_unread());
    }

    #[tokio::test]
    async fn test_non_success_status_is_an_error() {
        let base = serve("503 Service Unavailable", "{}").await;
        let api = ApiClient::new(&base, Duration::from_secs(5)).unwrap();
        let err = api.fetch_server_config().await.unwrap_err();
        assert!(matches!(
            err,
            FetchError::Status { status, .. } if status == reqwest::StatusCode::SERVICE_UNAVAILABLE
        ));
    }
}
