//! Database repositories

pub mod connection;
pub mod provider_config;

pub use connection::{ConnectionRepository, StoredConnection, UpsertOperation, UpsertResult};
pub use provider_config::ProviderConfigRepository;
