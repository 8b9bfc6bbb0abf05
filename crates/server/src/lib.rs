//! Framewire server library.
//!
//! This crate provides the server side of Framewire:
//! - [`session`]: per-connection state and the handle given to handlers
//! - [`registry`]: connection table, classification and fan-out
//! - [`listener`]: TCP transport driving the registry
//! - [`config`]: TOML configuration

pub mod config;
pub mod listener;
pub mod registry;
pub mod session;

pub use listener::{ListenerOptions, TcpServer};
pub use registry::{BroadcastScope, ConnectionRegistry, DeliveryReport, RegistryEvent};
pub use session::{PeerHandle, PeerHandler, PeerInfo, PeerSession, SessionState};
