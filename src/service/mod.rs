//! Service records and the store collaborator they come from.

pub mod store;
pub mod types;

pub use store::{InMemoryServiceStore, ServiceStore, StoreError};
pub use types::{
    Deck, LocalCommand, OAuthSettings, OAuthSettingsPatch, Service, ServiceEndpoint,
    ServiceHealth, ServiceKind, ServicePatch,
};
