//! HTTP client for the external user service.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use crate::domain::{AppError, ExternalServiceError, SellerId, User, UserDirectory};

/// Configuration for the user service client
#[derive(Debug, Clone)]
pub struct UserServiceConfig {
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for UserServiceConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
            max_retries: 2,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// Looks sellers up with `GET {base_url}/users/{id}`.
pub struct HttpUserDirectory {
    http_client: Client,
    base_url: String,
    config: UserServiceConfig,
}

impl HttpUserDirectory {
    pub fn new(base_url: &str, config: UserServiceConfig) -> Result<Self, AppError> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ExternalServiceError::HttpError(e.to_string()))?;
        info!(base_url = %base_url, "Created user service client");
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            config,
        })
    }

    pub fn with_defaults(base_url: &str) -> Result<Self, AppError> {
        Self::new(base_url, UserServiceConfig::default())
    }

    fn user_url(&self, id: SellerId) -> String {
        format!("{}/users/{id}", self.base_url)
    }

    /// Single lookup; `Ok(None)` for a definitive 404.
    async fn lookup(&self, id: SellerId) -> Result<Option<User>, ExternalServiceError> {
        let response = self
            .http_client
            .get(self.user_url(id))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExternalServiceError::Timeout(e.to_string())
                } else {
                    ExternalServiceError::Unavailable(e.to_string())
                }
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => Err(ExternalServiceError::RateLimited(
                "user service is throttling".to_string(),
            )),
            status if status.is_success() => {
                // A 200 settles existence; the body is informational.
                let user = response.json::<User>().await.unwrap_or_else(|e| {
                    debug!(error = %e, "User body not understood");
                    User { id, name: None }
                });
                Ok(Some(user))
            }
            status => Err(ExternalServiceError::Unavailable(format!(
                "user service answered {status}"
            ))),
        }
    }
}

fn is_retryable(error: &ExternalServiceError) -> bool {
    !matches!(error, ExternalServiceError::HttpError(_))
}

#[async_trait]
impl UserDirectory for HttpUserDirectory {
    #[instrument(skip(self))]
    async fn find_user(&self, id: SellerId) -> Result<Option<User>, AppError> {
        let mut attempt = 0;
        loop {
            match self.lookup(id).await {
                Ok(user) => {
                    debug!(found = user.is_some(), "User lookup finished");
                    return Ok(user);
                }
                Err(e) if attempt < self.config.max_retries && is_retryable(&e) => {
                    warn!(attempt, error = %e, "User lookup failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ErrorKind;
    use axum::{Json, Router, extract::Path, http::StatusCode as AxumStatus, routing::get};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use uuid::Uuid;

    const KNOWN: Uuid = Uuid::from_u128(0x1111);
    const FLAKY: Uuid = Uuid::from_u128(0x2222);
    const BROKEN: Uuid = Uuid::from_u128(0x3333);

    /// Serves a tiny user service on an ephemeral port.
    async fn user_service() -> (String, Arc<AtomicU32>) {
        let flaky_calls = Arc::new(AtomicU32::new(0));
        let calls = flaky_calls.clone();

        let app = Router::new().route(
            "/users/{id}",
            get(move |Path(id): Path<Uuid>| {
                let calls = calls.clone();
                async move {
                    if id == KNOWN {
                        return Ok(Json(User {
                            id,
                            name: Some("Ada".to_string()),
                        }));
                    }
                    if id == FLAKY && calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(AxumStatus::SERVICE_UNAVAILABLE);
                    }
                    if id == FLAKY {
                        return Ok(Json(User { id, name: None }));
                    }
                    if id == BROKEN {
                        return Err(AxumStatus::INTERNAL_SERVER_ERROR);
                    }
                    Err(AxumStatus::NOT_FOUND)
                }
            }),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/"), flaky_calls)
    }

    fn fast_config() -> UserServiceConfig {
        UserServiceConfig {
            timeout: Duration::from_secs(2),
            max_retries: 2,
            retry_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_user_url_trims_trailing_slash() {
        let client = HttpUserDirectory::with_defaults("http://users.local/").unwrap();
        assert_eq!(
            client.user_url(KNOWN),
            format!("http://users.local/users/{KNOWN}")
        );
    }

    #[tokio::test]
    async fn test_known_and_unknown_users() {
        let (base_url, _) = user_service().await;
        let client = HttpUserDirectory::new(&base_url, fast_config()).unwrap();

        let user = client.find_user(KNOWN).await.unwrap();
        assert_eq!(user.map(|u| u.id), Some(KNOWN));

        assert!(client.find_user(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let (base_url, flaky_calls) = user_service().await;
        let client = HttpUserDirectory::new(&base_url, fast_config()).unwrap();

        let user = client.find_user(FLAKY).await.unwrap();
        assert!(user.is_some());
        assert_eq!(flaky_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_is_unavailable() {
        let (base_url, _) = user_service().await;
        let client = HttpUserDirectory::new(&base_url, fast_config()).unwrap();

        let err = client.find_user(BROKEN).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UserDirectoryUnavailable);
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let client = HttpUserDirectory::new(
            "http://127.0.0.1:1",
            UserServiceConfig {
                max_retries: 0,
                ..fast_config()
            },
        )
        .unwrap();

        let err = client.find_user(KNOWN).await.unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
    }
}
