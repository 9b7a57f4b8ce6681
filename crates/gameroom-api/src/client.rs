//! HTTP request façade: attaches the credential, recovers 401s through the
//! refresh coordinator, and maps error responses.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::credentials::CredentialStore;
use crate::error::{ApiError, ApiResult};
use crate::refresh::{RefreshConfig, RefreshCoordinator};

/// Default timeout for API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for [`ApiClient`].
pub struct ApiConfig {
    /// Base URL of the API, e.g. `https://play.example.com`.
    pub base_url: String,
    pub refresh: RefreshConfig,
    pub timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            refresh: RefreshConfig::default(),
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

/// A successful response body: parsed JSON when the server says so, raw
/// text passed through otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Json(Value),
    Text(String),
}

impl ResponseBody {
    pub fn json(&self) -> Option<&Value> {
        match self {
            ResponseBody::Json(value) => Some(value),
            ResponseBody::Text(_) => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match self {
            ResponseBody::Json(_) => None,
            ResponseBody::Text(text) => Some(text),
        }
    }
}

/// Session payload returned by the login endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// An authorized call captured so it can be replayed exactly once after a
/// credential refresh.
struct PendingRequest {
    method: Method,
    path: String,
    body: Option<Value>,
}

impl PendingRequest {
    fn new(method: Method, path: &str, body: Option<Value>) -> Self {
        Self {
            method,
            path: path.to_string(),
            body,
        }
    }
}

/// Shared HTTP client for the gameroom API. Owns the connection pool, the
/// base URL, and the refresh coordination; clone is a cheap refcount bump.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<Inner>,
}

struct Inner {
    http: reqwest::Client,
    base_url: String,
    store: CredentialStore,
    refresh: RefreshCoordinator,
}

impl ApiClient {
    pub fn new(config: ApiConfig, store: CredentialStore) -> ApiResult<Self> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        let refresh = RefreshCoordinator::new(
            http.clone(),
            config.base_url.clone(),
            store.clone(),
            config.refresh,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                http,
                base_url: config.base_url,
                store,
                refresh,
            }),
        })
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.inner.store
    }

    pub async fn get(&self, path: &str) -> ApiResult<ResponseBody> {
        self.execute(PendingRequest::new(Method::GET, path, None)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> ApiResult<ResponseBody> {
        self.execute(PendingRequest::new(Method::POST, path, Some(body)))
            .await
    }

    pub async fn put(&self, path: &str, body: Value) -> ApiResult<ResponseBody> {
        self.execute(PendingRequest::new(Method::PUT, path, Some(body)))
            .await
    }

    pub async fn delete(&self, path: &str) -> ApiResult<ResponseBody> {
        self.execute(PendingRequest::new(Method::DELETE, path, None))
            .await
    }

    /// Issue the call with the current credential. On a 401, renew the
    /// credential (single-flight across concurrent callers) and replay the
    /// call exactly once; if the refresh fails, the original authorization
    /// failure is surfaced. A 401 on the replay is surfaced as-is, never
    /// retried again.
    async fn execute(&self, request: PendingRequest) -> ApiResult<ResponseBody> {
        let observed = self.inner.store.generation();
        let token = self.inner.store.access_token();
        let resp = self.send(&request, token.as_deref()).await?;
        if resp.status() != StatusCode::UNAUTHORIZED {
            return into_body(resp).await;
        }

        let original = error_message(resp).await;
        match self.inner.refresh.refresh(observed).await {
            Ok(renewed) => {
                let resp = self.send(&request, Some(&renewed)).await?;
                if resp.status() == StatusCode::UNAUTHORIZED {
                    return Err(ApiError::Unauthorized(error_message(resp).await));
                }
                into_body(resp).await
            }
            Err(e) => {
                tracing::warn!("refresh failed, surfacing original authorization error: {e}");
                Err(ApiError::Unauthorized(original))
            }
        }
    }

    async fn send(
        &self,
        request: &PendingRequest,
        token: Option<&str>,
    ) -> ApiResult<reqwest::Response> {
        let url = format!("{}{}", self.inner.base_url, request.path);
        let mut req = self.inner.http.request(request.method.clone(), url);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }
        Ok(req.send().await?)
    }

    // -----------------------------------------------------------------------
    // Session endpoints
    // -----------------------------------------------------------------------

    /// Authenticate with the password grant form and persist the returned
    /// session credential.
    pub async fn login(&self, username: &str, password: &str) -> ApiResult<LoginResponse> {
        let url = format!("{}/auth/login", self.inner.base_url);
        let form = [("username", username), ("password", password)];
        let resp = self.inner.http.post(&url).form(&form).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let message = error_message(resp).await;
            return Err(if status == StatusCode::UNAUTHORIZED {
                ApiError::Unauthorized(message)
            } else {
                ApiError::Api {
                    status: status.as_u16(),
                    message,
                }
            });
        }
        let login: LoginResponse = resp.json().await?;
        self.inner.store.set_session(
            login.access_token.clone(),
            login.token_type.clone(),
            login.refresh_token.clone(),
        );
        tracing::info!("logged in");
        Ok(login)
    }

    /// Create an account. Does not log in.
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> ApiResult<ResponseBody> {
        self.post(
            "/auth/register",
            serde_json::json!({
                "username": username,
                "email": email,
                "password": password,
            }),
        )
        .await
    }

    /// End the session: credential state and storage are cleared
    /// unconditionally.
    pub fn logout(&self) {
        self.inner.store.clear();
        tracing::info!("logged out");
    }

    /// Token provider for the realtime layer, backed by this client's
    /// credential store.
    pub fn token_provider(&self) -> gameroom_realtime::TokenProvider {
        let store = self.inner.store.clone();
        Box::new(move || {
            let store = store.clone();
            Box::pin(async move {
                store
                    .access_token()
                    .ok_or_else(|| "no credential available".into())
            })
        })
    }
}

/// Map a completed response to its body, JSON or text passthrough.
async fn into_body(resp: reqwest::Response) -> ApiResult<ResponseBody> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ApiError::Api {
            status: status.as_u16(),
            message: error_message(resp).await,
        });
    }
    let is_json = resp
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("application/json"));
    if is_json {
        Ok(ResponseBody::Json(resp.json().await?))
    } else {
        Ok(ResponseBody::Text(resp.text().await?))
    }
}

/// Best-effort extraction of the server's error message (`message` or
/// `detail` field), falling back to the status line.
pub(crate) async fn error_message(resp: reqwest::Response) -> String {
    let status = resp.status();
    let body = resp.text().await.unwrap_or_default();
    serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| {
            v.get("message")
                .or_else(|| v.get("detail"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| format!("API error: {status}"))
}
