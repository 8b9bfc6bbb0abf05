//! # Framewire Protocol Library
//!
//! This crate provides the wire format and dispatch contract shared by the
//! Framewire server and client.
//!
//! ## Overview
//!
//! Framewire carries discrete text messages over a raw byte stream such as
//! a TCP connection. This crate is transport-agnostic and provides:
//!
//! - **Frame Codec**: 4-byte little-endian length prefix with optional LZ4
//!   compression of the whole payload
//! - **Frame Reassembler**: incremental state machine turning arbitrary byte
//!   chunks into complete messages
//! - **Handler Contract**: the `MessageHandler` trait and the type-name keyed
//!   factory table used to dispatch classified connections
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │     Handlers (per client type)          │  MessageHandler
//! ├─────────────────────────────────────────┤
//! │     Registry / Client runtime           │  classification, fan-out
//! ├─────────────────────────────────────────┤
//! │     Reassembly                          │  FrameReassembler
//! ├─────────────────────────────────────────┤
//! │     Framing                             │  length prefix, LZ4
//! ├─────────────────────────────────────────┤
//! │     Transport (TCP)                     │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{FrameCodec, FrameEvent, FrameReassembler};
//!
//! let codec = FrameCodec::compressed();
//! let frame = codec.encode(b"Hello server!").unwrap();
//!
//! let mut reassembler = FrameReassembler::new(codec, 0);
//! let events = reassembler.feed_collect(&frame).unwrap();
//! assert_eq!(events, vec![FrameEvent::Message("Hello server!".into())]);
//! ```
//!
//! ## Modules
//!
//! - [`framing`]: Frame codec with compression
//! - [`reassembler`]: Stream reassembly state machine
//! - [`handler`]: Handler trait and factory table
//! - [`connection`]: Connection identifiers
//! - [`config`]: Shared wire settings
//! - [`error`]: Error types

pub mod config;
pub mod connection;
pub mod error;
pub mod framing;
pub mod handler;
pub mod reassembler;

pub use config::ProtocolConfig;
pub use connection::ConnectionId;
pub use error::{ProtocolError, Result};
pub use framing::{FrameCodec, LENGTH_PREFIX_SIZE, MAX_PAYLOAD_SIZE};
pub use handler::{HandlerFactories, HandlerFactory, MessageHandler};
pub use reassembler::{FrameEvent, FrameReassembler, ReassemblyStats};
