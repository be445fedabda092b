//! Network management service
//!
//! Port forwarding relays, WireGuard supervision, port scanning and firewall
//! management behind one [`NetworkService`].

pub mod auth;
pub mod config;
pub mod error;
pub mod service;

pub use auth::{AuthConfig, Caller};
pub use config::{FirewallConfig, ServiceConfig, SocketsConfig, StorageConfig, DEFAULT_CONFIG_PATH};
pub use error::{Result, ServiceError};
pub use service::{NetworkService, Overview};
