//! # Keybridge Library
//!
//! This library provides the core functionality for the Keybridge credential
//! broker: authorization flows, credential storage and refresh, and the HTTP
//! surface around them.

pub mod auth;
pub mod config;
pub mod credentials;
pub mod crypto;
pub mod db;
pub mod error;
pub mod flows;
pub mod handlers;
pub mod hooks;
pub mod interpolation;
pub mod lock;
pub mod models;
pub mod providers;
pub mod refresh;
pub mod repositories;
pub mod server;
pub mod session;
pub mod telemetry;
