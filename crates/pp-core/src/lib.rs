//! pp-core: Shared configuration and types for pty-proxy
//!
//! This crate provides the configuration structures and the resolved
//! command description used by the session layer and the CLI.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ProtocolConfig, ProxyConfig, SessionConfig, SlaveConfig};
pub use error::ConfigError;
pub use types::CommandSpec;
