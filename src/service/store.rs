//! Store collaborator interface.
//!
//! Persistence of services and decks lives outside this crate. The
//! connection layer only needs to read a service, patch it, and write OAuth
//! tokens. [`InMemoryServiceStore`] backs tests and single-process setups.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;

use super::types::{Deck, Service, ServicePatch};

/// Errors surfaced by a store implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No service with the given id.
    #[error("service not found: '{id}'")]
    NotFound { id: String },

    /// The backing storage failed.
    #[error("store backend error: {reason}")]
    Backend { reason: String },
}

/// Read/update access to service and deck records.
#[async_trait]
pub trait ServiceStore: Send + Sync {
    async fn get_service(&self, id: &str) -> Result<Option<Service>, StoreError>;

    /// Apply a partial update and return the updated record.
    async fn update_service(&self, id: &str, patch: ServicePatch) -> Result<Service, StoreError>;

    /// Replace the stored token material for a service.
    async fn update_oauth_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    /// The deck currently selected in the UI, if any.
    async fn get_active_deck(&self) -> Result<Option<Deck>, StoreError>;
}

// ─── In-memory implementation ────────────────────────────────────────────────

/// Process-local store keyed by service id.
#[derive(Debug, Default)]
pub struct InMemoryServiceStore {
    services: RwLock<HashMap<String, Service>>,
    decks: RwLock<Vec<Deck>>,
}

impl InMemoryServiceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a service record.
    pub async fn insert_service(&self, service: Service) {
        self.services
            .write()
            .await
            .insert(service.id.clone(), service);
    }

    /// Insert or replace a deck. Marking it active deactivates the others.
    pub async fn insert_deck(&self, deck: Deck) {
        let mut decks = self.decks.write().await;
        if deck.is_active {
            for other in decks.iter_mut() {
                other.is_active = false;
            }
        }
        decks.retain(|d| d.id != deck.id);
        decks.push(deck);
    }

    pub async fn service_count(&self) -> usize {
        self.services.read().await.len()
    }
}

#[async_trait]
impl ServiceStore for InMemoryServiceStore {
    async fn get_service(&self, id: &str) -> Result<Option<Service>, StoreError> {
        Ok(self.services.read().await.get(id).cloned())
    }

    async fn update_service(&self, id: &str, patch: ServicePatch) -> Result<Service, StoreError> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        service.apply(patch);
        Ok(service.clone())
    }

    async fn update_oauth_tokens(
        &self,
        id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let mut services = self.services.write().await;
        let service = services
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_string() })?;
        service.oauth.access_token = Some(access_token.to_string());
        service.oauth.refresh_token = refresh_token.map(str::to_string);
        service.oauth.expires_at = expires_at;
        Ok(())
    }

    async fn get_active_deck(&self) -> Result<Option<Deck>, StoreError> {
        Ok(self.decks.read().await.iter().find(|d| d.is_active).cloned())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::types::ServiceHealth;

    #[tokio::test]
    async fn test_update_service_applies_patch() {
        let store = InMemoryServiceStore::new();
        store
            .insert_service(Service::a2a("a", "Agent", "http://localhost:9000"))
            .await;

        let updated = store
            .update_service("a", ServicePatch::status(ServiceHealth::Healthy, true, None))
            .await
            .unwrap();
        assert_eq!(updated.health, ServiceHealth::Healthy);
        assert!(updated.is_connected);
    }

    #[tokio::test]
    async fn test_update_missing_service_is_not_found() {
        let store = InMemoryServiceStore::new();
        let err = store
            .update_service("ghost", ServicePatch::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_update_oauth_tokens_replaces_material() {
        let store = InMemoryServiceStore::new();
        store
            .insert_service(Service::remote_mcp("r", "Remote", "https://x.test/mcp"))
            .await;
        store
            .update_oauth_tokens("r", "access-1", Some("refresh-1"), None)
            .await
            .unwrap();
        store.update_oauth_tokens("r", "access-2", None, None).await.unwrap();

        let service = store.get_service("r").await.unwrap().unwrap();
        assert_eq!(service.oauth.access_token.as_deref(), Some("access-2"));
        assert!(service.oauth.refresh_token.is_none());
    }

    #[tokio::test]
    async fn test_single_active_deck() {
        let store = InMemoryServiceStore::new();
        for (id, active) in [("d1", true), ("d2", true)] {
            store
                .insert_deck(Deck {
                    id: id.into(),
                    name: id.into(),
                    description: String::new(),
                    services: vec![],
                    is_active: active,
                })
                .await;
        }
        let active = store.get_active_deck().await.unwrap().unwrap();
        assert_eq!(active.id, "d2");
    }
}
