//! SeaORM entity models

pub mod connection;
pub mod encryption_checkpoint;
pub mod oauth_session;
pub mod provider_config;
pub mod refresh_lock;
