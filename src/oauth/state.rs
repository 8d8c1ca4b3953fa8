//! Pending authorization state.
//!
//! `initiate_oauth_flow` stores one entry per opaque state value;
//! the callback takes it back out. Entries are single use and expire.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

/// What a state value maps back to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub service_id: String,
    pub redirect_uri: String,
    /// PKCE verifier, when the request carried a challenge.
    pub code_verifier: Option<String>,
}

/// Store for pending authorizations.
#[async_trait]
pub trait OAuthStateStore: Send + Sync {
    async fn put(&self, state: &str, pending: PendingAuthorization);

    /// Remove and return the entry. `None` if unknown, already taken or
    /// expired.
    async fn take(&self, state: &str) -> Option<PendingAuthorization>;
}

/// A fresh opaque state value: 256 random bits from the OS generator.
pub fn generate_state() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

// ─── In-memory implementation ────────────────────────────────────────────────

struct Entry {
    pending: PendingAuthorization,
    created: Instant,
}

/// Process-local store with a fixed time-to-live.
pub struct InMemoryStateStore {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStateStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn expired(&self, entry: &Entry) -> bool {
        entry.created.elapsed() >= self.ttl
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}

#[async_trait]
impl OAuthStateStore for InMemoryStateStore {
    async fn put(&self, state: &str, pending: PendingAuthorization) {
        let mut entries = self.entries.lock().await;
        // Abandoned flows never come back; sweep them on write.
        entries.retain(|_, entry| entry.created.elapsed() < self.ttl);
        entries.insert(
            state.to_string(),
            Entry {
                pending,
                created: Instant::now(),
            },
        );
    }

    async fn take(&self, state: &str) -> Option<PendingAuthorization> {
        let entry = self.entries.lock().await.remove(state)?;
        if self.expired(&entry) {
            tracing::debug!(service = %entry.pending.service_id, "oauth state expired");
            return None;
        }
        Some(entry.pending)
    }
}
