//! Single-flight renewal of the expiring access token.

use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::client::error_message;
use crate::credentials::CredentialStore;
use crate::error::{ApiError, ApiResult};

const DEFAULT_MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(10);
const DEFAULT_MAX_REFRESH_FAILURES: u32 = 3;

/// Throttling knobs for credential refresh. The limits exist so a
/// permanently invalid credential (say, revoked server-side) cannot cause
/// a refresh storm.
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// Minimum spacing between refresh attempts; a second attempt inside
    /// the window is refused without a network call.
    pub min_interval: Duration,
    /// Consecutive failures after which refresh is refused outright.
    pub max_failures: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_REFRESH_INTERVAL,
            max_failures: DEFAULT_MAX_REFRESH_FAILURES,
        }
    }
}

#[derive(Debug, Default)]
struct RefreshState {
    last_attempt: Option<Instant>,
    consecutive_failures: u32,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Coordinates access-token renewal so that arbitrarily many concurrent
/// 401 handlers produce at most one network refresh.
///
/// Racers queue on the internal lock; whoever wins performs the exchange,
/// and everyone who was waiting observes the bumped store generation and
/// returns the renewed token without a second call. The same check absorbs
/// stragglers whose requests were issued with the old token but 401ed
/// after the refresh already settled.
pub(crate) struct RefreshCoordinator {
    http: reqwest::Client,
    base_url: String,
    store: CredentialStore,
    config: RefreshConfig,
    state: Mutex<RefreshState>,
}

impl RefreshCoordinator {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        store: CredentialStore,
        config: RefreshConfig,
    ) -> Self {
        Self {
            http,
            base_url,
            store,
            config,
            state: Mutex::new(RefreshState::default()),
        }
    }

    /// Renew the access token. `observed_generation` is the store
    /// generation at the moment the failed request attached its token; if
    /// the credential has been renewed since, the stored token is returned
    /// immediately.
    pub async fn refresh(&self, observed_generation: u64) -> ApiResult<String> {
        let mut state = self.state.lock().await;

        if self.store.generation() > observed_generation {
            return self
                .store
                .access_token()
                .ok_or(ApiError::RefreshUnavailable("credential was cleared"));
        }
        if state.consecutive_failures >= self.config.max_failures {
            return Err(ApiError::RefreshUnavailable(
                "too many consecutive refresh failures",
            ));
        }
        if let Some(at) = state.last_attempt {
            if at.elapsed() < self.config.min_interval {
                return Err(ApiError::RefreshUnavailable("refresh attempted too recently"));
            }
        }
        let Some(refresh_token) = self.store.refresh_token() else {
            return Err(ApiError::RefreshUnavailable("no refresh token"));
        };

        state.last_attempt = Some(Instant::now());
        tracing::info!("refreshing access token");
        match self.exchange(&refresh_token).await {
            Ok(renewed) => {
                state.consecutive_failures = 0;
                self.store
                    .set_access_token(renewed.access_token.clone(), renewed.refresh_token);
                tracing::info!("access token refreshed");
                Ok(renewed.access_token)
            }
            Err(e) => {
                state.consecutive_failures += 1;
                tracing::warn!(
                    failures = state.consecutive_failures,
                    "token refresh failed: {e}"
                );
                if matches!(e, ApiError::Unauthorized(_)) {
                    // The refresh token itself was rejected; the session is
                    // over and the stored credential is useless.
                    self.store.clear();
                }
                Err(e)
            }
        }
    }

    async fn exchange(&self, refresh_token: &str) -> ApiResult<RefreshResponse> {
        let url = format!("{}/auth/refresh", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await?;
        let status = resp.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(ApiError::Unauthorized(error_message(resp).await));
        }
        if !status.is_success() {
            return Err(ApiError::Api {
                status: status.as_u16(),
                message: error_message(resp).await,
            });
        }
        Ok(resp.json::<RefreshResponse>().await?)
    }
}
