//! Wire settings shared by both ends of a connection.
//!
//! Compression is not negotiated on the wire, so server and client must be
//! configured with the same `[protocol]` section.

use serde::{Deserialize, Serialize};

use crate::framing::FrameCodec;

/// The `[protocol]` section of the server and client configuration files.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Compress every payload with LZ4.
    pub compress: bool,

    /// Largest accepted payload in bytes (0 = unlimited).
    pub max_message_size: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            compress: true,
            max_message_size: 0,
        }
    }
}

impl ProtocolConfig {
    /// Builds the codec these settings describe.
    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.compress).with_max_message_size(self.max_message_size)
    }
}
