//! Management API transport
//!
//! Owns the session-cookie lifecycle against the Data Collector. A session is
//! acquired lazily, refreshed once when a request is rejected with 401, and
//! expired on logout. Concurrent callers share one login.

use super::filter::{FilterFlavor, PayloadFilter};
use super::models::LoginResponse;
use crate::config::DriverConfig;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const API_VERSION_HEADER: &str = "x-dell-api-version";
const API_VERSION: &str = "2.0";
const APPLICATION: &str = "Storage Center Block Device Driver";

// =============================================================================
// Session State
// =============================================================================

/// Current management session
#[derive(Debug, Clone, Default)]
pub struct Session {
    /// Incremented on every successful login
    pub generation: u64,
    pub active: bool,
    pub api_version: Option<String>,
    pub established_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn flavor(&self) -> FilterFlavor {
        self.api_version
            .as_deref()
            .map(FilterFlavor::for_api_version)
            .unwrap_or_default()
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Fully read response
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    /// Map non-success statuses to the error taxonomy
    pub fn error_for_status(self, operation: &str) -> Result<Self> {
        let status = self.status;
        if status.is_success() {
            return Ok(self);
        }

        let reason = if self.body.trim().is_empty() {
            status.canonical_reason().unwrap_or("no reason").to_string()
        } else {
            self.body.trim().to_string()
        };

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::Unauthorized(reason),
            StatusCode::NOT_FOUND => Error::NotFound {
                kind: operation.to_string(),
                name: reason,
            },
            StatusCode::CONFLICT => Error::Conflict {
                resource: operation.to_string(),
                reason,
            },
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY
                if reason.to_ascii_lowercase().contains("already exists") =>
            {
                Error::AlreadyExists {
                    kind: operation.to_string(),
                    name: reason,
                }
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                Error::unavailable(operation, format!("{}: {}", status, reason))
            }
            s if s.is_server_error() => {
                Error::unavailable(operation, format!("{}: {}", status, reason))
            }
            _ => Error::ArrayApi {
                operation: operation.to_string(),
                status: status.as_u16(),
                reason,
            },
        })
    }

    /// Decode the body; an empty body is `None`
    pub fn json_opt<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        if self.body.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(&self.body)?))
    }

    /// Decode a list response; a single object becomes a one-element list
    pub fn json_list<T: DeserializeOwned>(&self) -> Result<Vec<T>> {
        match self.json_opt::<Value>()? {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .into_iter()
                .map(|item| serde_json::from_value(item).map_err(Error::from))
                .collect(),
            Some(item) => Ok(vec![serde_json::from_value(item)?]),
        }
    }

    /// First object of a list response, or the object itself
    pub fn first<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        Ok(self.json_list::<T>()?.into_iter().next())
    }
}

// =============================================================================
// HTTP Client
// =============================================================================

/// Session-aware client for the management REST API
pub struct HttpClient {
    base_url: String,
    client: Client,
    username: String,
    password: String,
    session: RwLock<Session>,
    login_lock: Mutex<()>,
}

// Credentials stay out of debug output.
impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("base_url", &self.base_url)
            .field("username", &self.username)
            .field("session", &*self.session.read())
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Client for the configured Data Collector
    pub fn new(config: &DriverConfig) -> Result<Self> {
        Self::with_base_url(config.base_url(), config)
    }

    /// Client for an explicit base URL (ending in `/api/rest/`)
    pub fn with_base_url(base_url: impl Into<String>, config: &DriverConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        headers.insert(API_VERSION_HEADER, HeaderValue::from_static(API_VERSION));

        let client = Client::builder()
            .default_headers(headers)
            .cookie_store(true)
            .danger_accept_invalid_certs(!config.verify_ssl)
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| Error::Configuration(format!("cannot build HTTP client: {}", e)))?;

        let mut base_url = base_url.into();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }

        Ok(Self {
            base_url,
            client,
            username: config.username.clone(),
            password: config.password.clone(),
            session: RwLock::new(Session::default()),
            login_lock: Mutex::new(()),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Snapshot of the session state
    pub fn session(&self) -> Session {
        self.session.read().clone()
    }

    /// New filter in the flavour the session's API version accepts
    pub fn filter(&self) -> PayloadFilter {
        PayloadFilter::and(self.session.read().flavor())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path.trim_start_matches('/'))
    }

    // -------------------------------------------------------------------------
    // Session lifecycle
    // -------------------------------------------------------------------------

    /// Log in unless a session is already active; returns its generation
    pub async fn acquire(&self) -> Result<u64> {
        {
            let session = self.session.read();
            if session.active {
                return Ok(session.generation);
            }
        }
        self.refresh(None).await
    }

    /// Log in again unless another caller already replaced `stale`
    async fn refresh(&self, stale: Option<u64>) -> Result<u64> {
        let _guard = self.login_lock.lock().await;
        {
            let session = self.session.read();
            let replaced = match stale {
                Some(generation) => session.generation != generation,
                None => true,
            };
            if session.active && replaced {
                return Ok(session.generation);
            }
        }
        self.login().await
    }

    async fn login(&self) -> Result<u64> {
        let payload = json!({
            "Application": APPLICATION,
            "ApplicationVersion": crate::VERSION,
        });

        let response = self
            .client
            .post(self.url("ApiConnection/Login"))
            .basic_auth(&self.username, Some(&self.password))
            .body(payload.to_string())
            .send()
            .await
            .map_err(|e| Error::unavailable("ApiConnection/Login", e))?;
        let response = read(response, "ApiConnection/Login").await?;
        let response = response.error_for_status("ApiConnection/Login")?;

        let api_version = match response.json_opt::<LoginResponse>() {
            Ok(login) => login.and_then(|l| l.api_version),
            Err(e) => {
                warn!(error = %e, "Unrecognized login response");
                None
            }
        };

        let mut session = self.session.write();
        session.generation += 1;
        session.active = true;
        session.api_version = api_version;
        session.established_at = Some(Utc::now());
        info!(
            base_url = %self.base_url,
            api_version = ?session.api_version,
            generation = session.generation,
            "Management session established"
        );
        Ok(session.generation)
    }

    /// Mark the session expired so the next call logs in again
    pub fn expire(&self) {
        self.session.write().active = false;
    }

    /// End the session on the Data Collector
    pub async fn logout(&self) -> Result<()> {
        if !self.session.read().active {
            return Ok(());
        }
        let result = self
            .execute(Method::POST, "ApiConnection/Logout", Some(&json!({})))
            .await
            .and_then(|r| r.error_for_status("ApiConnection/Logout"));
        self.expire();
        match result {
            Ok(_) => {
                info!("Management session closed");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Logout failed");
                Err(e)
            }
        }
    }

    // -------------------------------------------------------------------------
    // Requests
    // -------------------------------------------------------------------------

    pub async fn get(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::GET, path, None).await
    }

    pub async fn post(&self, path: &str, payload: &Value) -> Result<ApiResponse> {
        self.send(Method::POST, path, Some(payload)).await
    }

    pub async fn delete(&self, path: &str) -> Result<ApiResponse> {
        self.send(Method::DELETE, path, None).await
    }

    /// Send with the current session; a 401 triggers exactly one re-login
    async fn send(&self, method: Method, path: &str, payload: Option<&Value>) -> Result<ApiResponse> {
        let generation = self.acquire().await?;
        let response = self.execute(method.clone(), path, payload).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        debug!(path, generation, "Session rejected, re-authenticating");
        {
            let mut session = self.session.write();
            if session.generation == generation {
                session.active = false;
            }
        }
        self.refresh(Some(generation)).await?;
        self.execute(method, path, payload).await
    }

    async fn execute(
        &self,
        method: Method,
        path: &str,
        payload: Option<&Value>,
    ) -> Result<ApiResponse> {
        debug!(%method, path, "Management API request");
        let mut request = self.client.request(method, self.url(path));
        if let Some(payload) = payload {
            request = request.body(payload.to_string());
        }
        let response = request.send().await.map_err(|e| Error::unavailable(path, e))?;
        read(response, path).await
    }
}

async fn read(response: reqwest::Response, path: &str) -> Result<ApiResponse> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| Error::unavailable(path, e))?;
    debug!(path, status = status.as_u16(), "Management API response");
    Ok(ApiResponse { status, body })
}
