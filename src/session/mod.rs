//! Session handling for the garage service.
//!
//! Owns the credentials and the cached session token. All authenticated
//! requests go through [`SessionManager::get_json`], which implements the
//! unauthorized-retry contract: a 401 invalidates the session, triggers
//! exactly one re-authentication, and retries the request once. A second
//! 401 surfaces as a terminal [`FetchError::Auth`] for that call.

use crate::client::FetchError;
use crate::config::ServiceConfig;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};


/// Connection settings for one garage service instance.
///
/// Immutable for the lifetime of the coordinator that owns the session.
#[derive(Debug, Clone)]
pub struct Credentials {
    base_url: String,
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(base_url: &str, username: &str, password: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(&config.base_url, &config.username, &config.password)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// An authenticated session token.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    token: String,
}

/// Login response from the garage service.
#[derive(Deserialize)]
struct LoginResponse {
    token: String,
}

/// Holds authentication state and issues authenticated requests.
pub struct SessionManager {
    credentials: Credentials,
    http: reqwest::Client,
    /// Cached session; None until first login or after invalidation.
    /// Holding the lock across login collapses concurrent re-auth attempts
    /// into a single request.
    session: Mutex<Option<Session>>,
}

impl SessionManager {
    pub fn new(credentials: Credentials, http: reqwest::Client) -> Self {
        Self {
            credentials,
            http,
            session: Mutex::new(None),
        }
    }

    /// Exchange the configured credentials for a fresh session token.
    pub(crate) async fn authenticate(&self) -> Result<Session, FetchError> {
        let url = format!("{}/api/auth/login", self.credentials.base_url);
        let body = serde_json::json!({
            "username": self.credentials.username,
            "password": self.credentials.password,
        });

        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(FetchError::Auth),
            status if !status.is_success() => Err(FetchError::Network(format!(
                "login failed with status {}",
                status
            ))),
            _ => {
                let login: LoginResponse = response
                    .json()
                    .await
                    .map_err(|e| FetchError::Malformed(format!("login response: {}", e)))?;
                if login.token.is_empty() {
                    return Err(FetchError::Malformed("login response: empty token".into()));
                }
                info!(base_url = %self.credentials.base_url, "Authenticated with garage service");
                Ok(Session { token: login.token })
            }
        }
    }

    /// Return a valid session, authenticating if none is held.
    pub(crate) async fn ensure_session(&self) -> Result<Session, FetchError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }
        let session = self.authenticate().await?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Drop the cached session if it is still the one that failed.
    ///
    /// A concurrent caller may already have replaced it with a fresh token;
    /// that token must survive.
    async fn invalidate(&self, failed: &Session) {
        let mut guard = self.session.lock().await;
        if guard
            .as_ref()
            .is_some_and(|current| current.token == failed.token)
        {
            *guard = None;
            debug!("Session invalidated");
        }
    }

    /// Authenticated GET returning the parsed JSON body.
    ///
    /// On a 401, invalidates the session, re-authenticates once, and retries
    /// the request once. Any further 401 is returned as [`FetchError::Auth`].
    pub(crate) async fn get_json(&self, path_and_query: &str) -> Result<Value, FetchError> {
        let session = self.ensure_session().await?;
        match self.send_get(path_and_query, &session).await {
            Err(FetchError::Auth) => {
                warn!(path = %path_and_query, "Unauthorized response, re-authenticating");
                self.invalidate(&session).await;
                let session = self.ensure_session().await?;
                self.send_get(path_and_query, &session).await
            }
            other => other,
        }
    }

    async fn send_get(&self, path_and_query: &str, session: &Session) -> Result<Value, FetchError> {
        let url = format!("{}{}", self.credentials.base_url, path_and_query);
        let response = self
            .http
            .get(&url)
            .bearer_auth(&session.token)
            .send()
            .await
            .map_err(request_error)?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(FetchError::Auth),
            StatusCode::NOT_FOUND => Err(FetchError::NotFound),
            status if !status.is_success() => Err(FetchError::Network(format!(
                "{} returned status {}",
                path_and_query, status
            ))),
            _ => response.json::<Value>().await.map_err(|e| {
                FetchError::Malformed(format!("{}: invalid JSON body: {}", path_and_query, e))
            }),
        }
    }
}

/// Map transport-level failures (including timeouts) to [`FetchError::Network`].
fn request_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Network("request timed out".to_string())
    } else {
        FetchError::Network(err.to_string())
    }
}
