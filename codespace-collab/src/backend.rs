//! Durable history backend consumed by the shared history map.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::RoomConfig;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Backend returned {status} for {url}")]
    Status { status: u16, url: String },
    #[error("Invalid backend URL: {0}")]
    InvalidUrl(String),
}

/// One saved snapshot of a repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub author_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Source of the bearer token sent to the backend.
pub trait TokenSource: Send + Sync {
    fn token(&self) -> Option<String>;
}

/// Fixed token (or none), e.g. read once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticToken(pub Option<String>);

impl TokenSource for StaticToken {
    fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

pub trait HistoryBackend: Send + Sync {
    fn fetch_history<'a>(
        &'a self,
        repository_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<HistoryEntry>, BackendError>>;
}

/// `GET {base_url}/repositories/{repositoryId}/history`.
pub struct RestHistoryBackend {
    client: Client,
    base_url: Url,
    tokens: Arc<dyn TokenSource>,
}

impl RestHistoryBackend {
    pub fn new(base_url: impl AsRef<str>, tokens: Arc<dyn TokenSource>) -> Result<Self, BackendError> {
        let base_url = Url::parse(base_url.as_ref()).map_err(|e| BackendError::InvalidUrl(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidUrl(base_url.to_string()));
        }
        let client = Client::builder().timeout(Duration::from_secs(10)).build()?;
        Ok(Self {
            client,
            base_url,
            tokens,
        })
    }

    /// Backend at `history_api_url`, or `None` when it is not configured.
    pub fn from_config(config: &RoomConfig, tokens: Arc<dyn TokenSource>) -> Result<Option<Self>, BackendError> {
        config
            .history_api_url
            .as_deref()
            .map(|base| Self::new(base, tokens))
            .transpose()
    }

    /// Repository ids go in as single, percent-encoded path segments.
    fn history_url(&self, repository_id: &str) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::InvalidUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["repositories", repository_id, "history"]);
        Ok(url)
    }
}

impl HistoryBackend for RestHistoryBackend {
    fn fetch_history<'a>(
        &'a self,
        repository_id: &'a str,
    ) -> BoxFuture<'a, Result<Vec<HistoryEntry>, BackendError>> {
        Box::pin(async move {
            let url = self.history_url(repository_id)?;
            let mut request = self.client.get(url.clone());
            if let Some(token) = self.tokens.token() {
                request = request.header("Authorization", format!("Bearer {token}"));
            }

            let response = request.send().await?;
            if !response.status().is_success() {
                return Err(BackendError::Status {
                    status: response.status().as_u16(),
                    url: url.to_string(),
                });
            }
            let entries: Vec<HistoryEntry> = response.json().await?;
            log::debug!("Fetched {} history entries for {repository_id}", entries.len());
            Ok(entries)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response and hand back the raw request.
    async fn one_shot_server(status: &'static str, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let task = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&buf[..n]).to_string()
        });
        (format!("http://{addr}"), task)
    }

    #[tokio::test]
    async fn test_fetch_history_with_token() {
        let body = r#"[{"id":"h1","message":"first save","authorId":"u1","createdAt":"2024-05-01T10:00:00Z"}]"#;
        let (base, server) = one_shot_server("200 OK", body).await;
        let backend =
            RestHistoryBackend::new(base, Arc::new(StaticToken(Some("secret".into())))).unwrap();

        let entries = backend.fetch_history("repo1").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, "h1");
        assert_eq!(entries[0].author_id.as_deref(), Some("u1"));

        let request = server.await.unwrap();
        assert!(request.starts_with("GET /repositories/repo1/history"));
        assert!(request.to_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_repository_id_is_percent_encoded() {
        let (base, server) = one_shot_server("200 OK", "[]").await;
        let backend = RestHistoryBackend::new(format!("{base}/api/"), Arc::new(StaticToken::default())).unwrap();

        assert!(backend.fetch_history("team/repo 1").await.unwrap().is_empty());
        let request = server.await.unwrap();
        assert!(
            request.starts_with("GET /api/repositories/team%2Frepo%201/history "),
            "{request}"
        );
    }

    #[tokio::test]
    async fn test_from_config() {
        let tokens: Arc<dyn TokenSource> = Arc::new(StaticToken::default());
        let unset = RoomConfig::default();
        assert!(RestHistoryBackend::from_config(&unset, tokens.clone()).unwrap().is_none());

        let (base, server) = one_shot_server("200 OK", "[]").await;
        let config = RoomConfig {
            history_api_url: Some(base),
            ..RoomConfig::default()
        };
        let backend = RestHistoryBackend::from_config(&config, tokens.clone()).unwrap().unwrap();
        backend.fetch_history("repo1").await.unwrap();
        assert!(server.await.unwrap().starts_with("GET /repositories/repo1/history"));

        let broken = RoomConfig {
            history_api_url: Some("not a url".into()),
            ..RoomConfig::default()
        };
        assert!(matches!(
            RestHistoryBackend::from_config(&broken, tokens),
            Err(BackendError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn test_fetch_history_error_status() {
        let (base, _server) = one_shot_server("500 Internal Server Error", "{}").await;
        let backend = RestHistoryBackend::new(base, Arc::new(StaticToken::default())).unwrap();

        match backend.fetch_history("repo1").await {
            Err(BackendError::Status { status, url }) => {
                assert_eq!(status, 500);
                assert!(url.ends_with("/repositories/repo1/history"));
            }
            other => panic!("Expected status error, got {other:?}"),
        }
    }
}
