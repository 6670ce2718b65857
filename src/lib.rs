// A SIP user agent over WebSocket, in Rust
pub type Result<T> = std::result::Result<T, crate::error::Error>;
pub use crate::error::Error;

pub mod auth;
pub mod config;
pub mod dialog;
pub mod error;
pub mod media;
pub mod message;
pub mod registrar;
pub mod rsip_ext;
pub mod session;
pub mod transaction;
pub mod transport;
pub mod ua;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::UaConfig;
pub use ua::UserAgent;
