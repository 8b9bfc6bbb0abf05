//! Framewire client library.
//!
//! - [`runtime`]: connection runtime with a pending queue and reconnect policy
//! - [`config`]: TOML configuration

pub mod config;
pub mod runtime;

pub use runtime::{
    ClientHandle, ClientHandler, ClientOptions, ClientRuntime, ConnectionState, SendOutcome,
};
