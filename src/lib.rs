#![warn(clippy::all)]
#![allow(clippy::new_without_default)]
#![allow(clippy::unneeded_field_pattern)]

pub mod classifier;
pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod server;
pub mod session;
pub mod types;

pub use client::Client;
pub use config::{ConnectionConfig, ServerConfig};
pub use connection::Connection;
pub use error::{Error, Result};
pub use server::Server;
pub use session::{BackendSession, Memory};
pub use types::{ResultSet, Value};
