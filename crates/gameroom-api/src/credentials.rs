//! Credential state: the expiring access token, its refresh token, and
//! persistence across sessions.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

// ---------------------------------------------------------------------------
// Storage backends
// ---------------------------------------------------------------------------

/// Credential material persisted across sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

/// Pluggable persistence for [`StoredCredentials`].
pub trait TokenStorage: Send + Sync {
    fn load(&self) -> std::io::Result<Option<StoredCredentials>>;
    fn store(&self, credentials: &StoredCredentials) -> std::io::Result<()>;
    fn clear(&self) -> std::io::Result<()>;
}

/// JSON file under a stable path; the desktop analog of browser local
/// storage.
pub struct FileStorage {
    path: PathBuf,
}

impl FileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl TokenStorage for FileStorage {
    fn load(&self) -> std::io::Result<Option<StoredCredentials>> {
        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        match serde_json::from_slice(&bytes) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                // A corrupt file is treated as logged out rather than fatal.
                tracing::warn!("ignoring unreadable credential file: {e}");
                Ok(None)
            }
        }
    }

    fn store(&self, credentials: &StoredCredentials) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(credentials).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, bytes)
    }

    fn clear(&self) -> std::io::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-memory storage for tests and ephemeral sessions.
#[derive(Default)]
pub struct MemoryStorage {
    cell: Mutex<Option<StoredCredentials>>,
}

impl TokenStorage for MemoryStorage {
    fn load(&self) -> std::io::Result<Option<StoredCredentials>> {
        Ok(lock_unpoisoned(&self.cell).clone())
    }

    fn store(&self, credentials: &StoredCredentials) -> std::io::Result<()> {
        *lock_unpoisoned(&self.cell) = Some(credentials.clone());
        Ok(())
    }

    fn clear(&self) -> std::io::Result<()> {
        *lock_unpoisoned(&self.cell) = None;
        Ok(())
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Credential store
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone)]
struct CredentialState {
    access_token: Option<String>,
    token_type: Option<String>,
    refresh_token: Option<String>,
    expiry_epoch: Option<i64>,
}

/// Process-wide credential state: one per client, mutated only by login,
/// refresh, and logout. Cloning shares the same state.
#[derive(Clone)]
pub struct CredentialStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    state: Mutex<CredentialState>,
    /// Bumped whenever the access token changes; lets a 401 handler tell
    /// whether the credential it used has already been renewed.
    generation: AtomicU64,
    storage: Box<dyn TokenStorage>,
}

impl CredentialStore {
    /// Hydrate from storage. An unreadable backend starts the session
    /// logged out rather than failing.
    pub fn new(storage: Box<dyn TokenStorage>) -> Self {
        let state = match storage.load() {
            Ok(Some(saved)) => CredentialState {
                expiry_epoch: token_expiry(&saved.access_token),
                access_token: Some(saved.access_token),
                token_type: saved.token_type,
                refresh_token: saved.refresh_token,
            },
            Ok(None) => CredentialState::default(),
            Err(e) => {
                tracing::warn!("failed to load stored credentials: {e}");
                CredentialState::default()
            }
        };
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(state),
                generation: AtomicU64::new(0),
                storage,
            }),
        }
    }

    /// A store backed by [`MemoryStorage`].
    pub fn in_memory() -> Self {
        Self::new(Box::new(MemoryStorage::default()))
    }

    pub fn access_token(&self) -> Option<String> {
        self.locked().access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.locked().refresh_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.locked().access_token.is_some()
    }

    /// Epoch seconds at which the access token expires, when the JWT
    /// carries an `exp` claim.
    pub fn expiry_epoch(&self) -> Option<i64> {
        self.locked().expiry_epoch
    }

    pub(crate) fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::Acquire)
    }

    /// Install a full session (login).
    pub(crate) fn set_session(
        &self,
        access_token: String,
        token_type: Option<String>,
        refresh_token: Option<String>,
    ) {
        let state = CredentialState {
            expiry_epoch: token_expiry(&access_token),
            access_token: Some(access_token),
            token_type,
            refresh_token,
        };
        self.replace(state);
    }

    /// Install a renewed access token (refresh), keeping the current
    /// refresh token unless the server rotated it.
    pub(crate) fn set_access_token(&self, access_token: String, refresh_token: Option<String>) {
        let mut state = self.locked().clone();
        state.expiry_epoch = token_expiry(&access_token);
        state.access_token = Some(access_token);
        if refresh_token.is_some() {
            state.refresh_token = refresh_token;
        }
        self.replace(state);
    }

    /// Drop everything, memory and storage, unconditionally (logout, or a
    /// revoked refresh token).
    pub fn clear(&self) {
        *self.locked() = CredentialState::default();
        self.inner.generation.fetch_add(1, Ordering::Release);
        if let Err(e) = self.inner.storage.clear() {
            tracing::warn!("failed to clear stored credentials: {e}");
        }
    }

    fn replace(&self, state: CredentialState) {
        let saved = state.access_token.as_ref().map(|token| StoredCredentials {
            access_token: token.clone(),
            token_type: state.token_type.clone(),
            refresh_token: state.refresh_token.clone(),
        });
        *self.locked() = state;
        self.inner.generation.fetch_add(1, Ordering::Release);
        if let Some(saved) = saved {
            if let Err(e) = self.inner.storage.store(&saved) {
                tracing::warn!("failed to persist credentials: {e}");
            }
        }
    }

    fn locked(&self) -> MutexGuard<'_, CredentialState> {
        lock_unpoisoned(&self.inner.state)
    }
}

// ---------------------------------------------------------------------------
// JWT introspection
// ---------------------------------------------------------------------------

/// Decode the payload segment of a JWT without verifying the signature.
/// Client-side introspection only; the server remains the authority.
pub fn decode_claims(token: &str) -> ApiResult<serde_json::Value> {
    let payload = token
        .split('.')
        .nth(1)
        .ok_or_else(|| ApiError::MalformedToken("missing payload segment".into()))?;
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(payload)
        .map_err(|e| ApiError::MalformedToken(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| ApiError::MalformedToken(e.to_string()))
}

/// The `exp` claim of a token, when present and well-formed.
pub fn token_expiry(token: &str) -> Option<i64> {
    decode_claims(token).ok()?.get("exp")?.as_i64()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
