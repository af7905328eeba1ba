//! Short-lived access credentials and their refresh.

use std::{
    fmt,
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use osmo_core::TaskContext;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::ChannelError;

/// Access token and the instant it stops being accepted.
#[derive(Clone, Deserialize)]
pub struct Credential {
    pub token: String,
    #[serde(alias = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl Credential {
    /// Whether the credential is still usable `skew` from now.
    #[must_use]
    pub fn is_valid(&self, skew: Duration) -> bool {
        let skew = chrono::Duration::from_std(skew).unwrap_or_else(|_| chrono::Duration::zero());
        Utc::now() + skew < self.expires_at
    }
}

/// Exchanges the long-lived refresh credential for an access credential.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    /// Fetch a fresh access credential.
    ///
    /// # Errors
    /// `NotReady` while the task cannot run yet, `InvalidCredential` when
    /// the refresh credential is rejected for good, `Dial` otherwise.
    async fn refresh(&self) -> Result<Credential, ChannelError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum RefreshErrorKind {
    Pending,
    Finished,
    Invalid,
}

#[derive(Debug, Deserialize)]
struct RefreshErrorBody {
    error: RefreshErrorKind,
    #[serde(default)]
    message: String,
}

/// Refreshes credentials against the service's HTTP refresh endpoint.
///
/// The refresh token travels in the `Authorization` header, never in the URL.
pub struct HttpRefresher {
    client: reqwest::Client,
    endpoint: Url,
    refresh_token: String,
    task: TaskContext,
}

impl HttpRefresher {
    #[must_use]
    pub fn new(endpoint: Url, refresh_token: String, task: TaskContext) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint,
            refresh_token,
            task,
        }
    }
}

#[async_trait]
impl TokenRefresher for HttpRefresher {
    async fn refresh(&self) -> Result<Credential, ChannelError> {
        let response = self
            .client
            .get(self.endpoint.clone())
            .bearer_auth(&self.refresh_token)
            .query(&self.task.query_pairs())
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| ChannelError::Dial(format!("refresh request failed: {}", e.without_url())))?;

        let status = response.status();
        if status.is_success() {
            return response
                .json::<Credential>()
                .await
                .map_err(|e| {
                    ChannelError::Dial(format!("malformed refresh response: {}", e.without_url()))
                });
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RefreshErrorBody>(&body) {
            Ok(err) => Err(classify_refresh_error(&err)),
            Err(_) if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN =>
            {
                Err(ChannelError::InvalidCredential(format!("refresh rejected: {status}")))
            }
            Err(_) => Err(ChannelError::Dial(format!("refresh failed: {status} {body}"))),
        }
    }
}

fn classify_refresh_error(err: &RefreshErrorBody) -> ChannelError {
    match err.error {
        RefreshErrorKind::Pending => ChannelError::NotReady,
        RefreshErrorKind::Finished => {
            ChannelError::InvalidCredential(format!("task already finished: {}", err.message))
        }
        RefreshErrorKind::Invalid => ChannelError::InvalidCredential(err.message.clone()),
    }
}

/// Current access credential, refreshed on demand.
///
/// Only [`token`](Self::token) replaces the credential; readers take the
/// shared lock and never hold it across I/O.
pub struct CredentialStore {
    current: RwLock<Option<Credential>>,
    refresher: Arc<dyn TokenRefresher>,
    skew: Duration,
}

impl CredentialStore {
    #[must_use]
    pub fn new(refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            current: RwLock::new(None),
            refresher,
            skew: Duration::from_secs(30),
        }
    }

    /// Seed the store with an already issued credential.
    #[must_use]
    pub fn with_credential(self, credential: Credential) -> Self {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(credential);
        self
    }

    fn valid_token(&self) -> Option<String> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .filter(|c| c.is_valid(self.skew))
            .map(|c| c.token.clone())
    }

    /// A currently valid access token, refreshing first if needed.
    ///
    /// # Errors
    /// Propagates refresh failures.
    pub async fn token(&self) -> Result<String, ChannelError> {
        if let Some(token) = self.valid_token() {
            return Ok(token);
        }

        let fresh = self.refresher.refresh().await?;
        debug!(expires_at = %fresh.expires_at, "Access credential refreshed");
        let token = fresh.token.clone();
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(fresh);
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CountingRefresher {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self) -> Result<Credential, ChannelError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Credential {
                token: format!("token-{n}"),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_valid_credential_is_reused() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        let store = CredentialStore::new(refresher.clone());
        assert_eq!(store.token().await.unwrap(), "token-0");
        assert_eq!(store.token().await.unwrap(), "token-0");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_credential_is_refreshed() {
        let refresher = Arc::new(CountingRefresher {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        let store = CredentialStore::new(refresher.clone()).with_credential(Credential {
            token: "stale".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
        });
        assert_eq!(store.token().await.unwrap(), "token-0");
    }

    #[test]
    fn test_refresh_error_classification() {
        let pending: RefreshErrorBody =
            serde_json::from_str(r#"{"error":"pending","message":"scheduling"}"#).unwrap();
        assert!(matches!(classify_refresh_error(&pending), ChannelError::NotReady));

        let finished: RefreshErrorBody = serde_json::from_str(r#"{"error":"finished"}"#).unwrap();
        assert!(!classify_refresh_error(&finished).is_retryable());
    }

    #[test]
    fn test_debug_redacts_token() {
        let credential = Credential {
            token: "secret".into(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{credential:?}").contains("secret"));
    }

    fn refresher(endpoint: &str) -> HttpRefresher {
        HttpRefresher::new(
            Url::parse(endpoint).unwrap(),
            "long-lived-secret".into(),
            TaskContext::new("wf", "group", "task", 1),
        )
    }

    #[tokio::test]
    async fn test_refresh_token_sent_as_header() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = conn.read(&mut buf).await.unwrap();
                assert!(n > 0, "request ended early");
                request.extend_from_slice(&buf[..n]);
            }
            let body = r#"{"token":"access","expires_at":"2099-01-01T00:00:00Z"}"#;
            let response = format!(
                "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                body.len()
            );
            conn.write_all(response.as_bytes()).await.unwrap();
            String::from_utf8(request).unwrap()
        });

        let credential = refresher(&format!("http://{addr}/refresh")).refresh().await.unwrap();
        assert_eq!(credential.token, "access");

        let request = server.await.unwrap();
        let request_line = request.lines().next().unwrap();
        assert!(!request_line.contains("long-lived-secret"), "{request_line}");
        assert!(request_line.contains("workflow_id=wf"));
        assert!(
            request
                .to_ascii_lowercase()
                .contains("authorization: bearer long-lived-secret")
        );
    }

    #[tokio::test]
    async fn test_refresh_failure_does_not_leak_token() {
        let err = refresher("http://127.0.0.1:1/refresh").refresh().await.unwrap_err();
        assert!(matches!(err, ChannelError::Dial(_)));
        assert!(!err.to_string().contains("long-lived-secret"), "{err}");
    }
}
