//! Incremental reassembly of length-prefixed frames from a byte stream.
//!
//! The transport hands over byte chunks with arbitrary boundaries: a chunk
//! may hold half a length prefix, several whole frames, or the tail of one
//! frame and the head of the next. [`FrameReassembler`] consumes every chunk
//! completely and emits one [`FrameEvent`] per finished frame, in wire order.
//!
//! # State machine
//!
//! ```text
//!            4 prefix bytes, length > 0
//! ReadingLength ───────────────────────────▶ ReadingPayload
//!   ▲     │                                        │
//!   │     └── length == 0 (keepalive) ──┐          │ payload complete
//!   │                                   │          │ (emit event)
//!   └───────────────────────────────────┴──────────┘
//! ```
//!
//! A negative length, or one above the configured maximum, is a protocol
//! violation. The reassembler then refuses all further input until
//! [`reset`](FrameReassembler::reset).
//!
//! # Example
//!
//! ```rust
//! use protocol::{FrameCodec, FrameEvent, FrameReassembler};
//!
//! let codec = FrameCodec::uncompressed();
//! let mut wire = codec.encode(b"first").unwrap();
//! wire.extend(codec.encode(b"second").unwrap());
//!
//! let mut reassembler = FrameReassembler::new(codec, 0);
//! let mut messages = Vec::new();
//! for chunk in wire.chunks(3) {
//!     reassembler
//!         .feed(chunk, |event| {
//!             if let FrameEvent::Message(bytes) = event {
//!                 messages.push(bytes);
//!             }
//!         })
//!         .unwrap();
//! }
//!
//! assert_eq!(messages, vec![&b"first"[..], &b"second"[..]]);
//! ```

use bytes::Bytes;

use crate::error::{ProtocolError, Result};
use crate::framing::{read_length_prefix, FrameCodec, LENGTH_PREFIX_SIZE};

/// Initial payload allocation cap. Larger payloads grow as bytes arrive, so a
/// peer cannot force a huge allocation with a length prefix alone.
const INITIAL_PAYLOAD_CAPACITY: usize = 64 * 1024;

/// Outcome of one completed frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameEvent {
    /// A decoded message.
    Message(Bytes),
    /// The frame was well-formed but its payload could not be decoded.
    /// Reassembly continues with the next frame.
    Corrupt(ProtocolError),
}

/// Counters describing what a reassembler has processed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Messages emitted.
    pub messages: u64,
    /// Zero-length frames consumed.
    pub keepalives: u64,
    /// Payloads that failed to decode.
    pub corrupt_payloads: u64,
    /// Total bytes consumed from the stream.
    pub bytes_consumed: u64,
}

#[derive(Debug)]
enum State {
    /// Filling the 4-byte length prefix.
    ReadingLength,
    /// Prefix parsed, filling a payload of `expected` bytes.
    ReadingPayload { expected: usize, buffer: Vec<u8> },
}

/// Per-connection state machine converting byte chunks into messages.
///
/// `feed` takes `&mut self`: one reassembler belongs to exactly one reader.
#[derive(Debug)]
pub struct FrameReassembler {
    codec: FrameCodec,
    /// Largest accepted length prefix (0 = unlimited).
    max_message_size: usize,
    length_prefix: [u8; LENGTH_PREFIX_SIZE],
    /// Prefix bytes filled so far while in `ReadingLength`.
    prefix_filled: usize,
    state: State,
    failure: Option<ProtocolError>,
    stats: ReassemblyStats,
}

impl FrameReassembler {
    /// Create a reassembler decoding payloads with `codec`.
    ///
    /// `max_message_size` bounds the length prefix; `0` means unlimited.
    pub fn new(codec: FrameCodec, max_message_size: usize) -> Self {
        Self {
            codec: codec.with_max_message_size(max_message_size),
            max_message_size,
            length_prefix: [0; LENGTH_PREFIX_SIZE],
            prefix_filled: 0,
            state: State::ReadingLength,
            failure: None,
            stats: ReassemblyStats::default(),
        }
    }

    /// Consume a chunk, calling `emit` once per completed frame in wire order.
    ///
    /// The whole chunk is consumed unless a protocol violation is hit, in
    /// which case the violation is returned and the reassembler stays failed.
    /// Events for frames completed earlier in the same chunk have already
    /// been emitted by then.
    pub fn feed<F>(&mut self, chunk: &[u8], mut emit: F) -> Result<()>
    where
        F: FnMut(FrameEvent),
    {
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }

        let mut cursor = 0;
        while cursor < chunk.len() {
            let available = chunk.len() - cursor;

            let transferred = match &mut self.state {
                State::ReadingLength => {
                    let wanted = LENGTH_PREFIX_SIZE - self.prefix_filled;
                    let n = wanted.min(available);
                    self.length_prefix[self.prefix_filled..self.prefix_filled + n]
                        .copy_from_slice(&chunk[cursor..cursor + n]);
                    self.prefix_filled += n;
                    n
                }
                State::ReadingPayload { expected, buffer } => {
                    let wanted = *expected - buffer.len();
                    let n = wanted.min(available);
                    buffer.extend_from_slice(&chunk[cursor..cursor + n]);
                    n
                }
            };

            cursor += transferred;
            self.stats.bytes_consumed += transferred as u64;

            self.read_completed(&mut emit)?;
        }

        Ok(())
    }

    /// Consume a chunk and collect its events.
    ///
    /// On a protocol violation the events completed before it are dropped;
    /// use [`feed`](Self::feed) when they matter.
    pub fn feed_collect(&mut self, chunk: &[u8]) -> Result<Vec<FrameEvent>> {
        let mut events = Vec::new();
        self.feed(chunk, |event| events.push(event))?;
        Ok(events)
    }

    /// Discard any partial frame and clear a previous failure.
    pub fn reset(&mut self) {
        self.length_prefix = [0; LENGTH_PREFIX_SIZE];
        self.prefix_filled = 0;
        self.state = State::ReadingLength;
        self.failure = None;
    }

    /// `true` when no partial frame is buffered.
    pub fn is_idle(&self) -> bool {
        matches!(self.state, State::ReadingLength) && self.prefix_filled == 0
    }

    /// `true` after a protocol violation, until [`reset`](Self::reset).
    pub fn is_failed(&self) -> bool {
        self.failure.is_some()
    }

    /// Bytes held for the frame currently being assembled.
    pub fn pending_bytes(&self) -> usize {
        match &self.state {
            State::ReadingLength => self.prefix_filled,
            State::ReadingPayload { buffer, .. } => LENGTH_PREFIX_SIZE + buffer.len(),
        }
    }

    /// Processing counters.
    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// The codec payloads are decoded with.
    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    fn read_completed<F>(&mut self, emit: &mut F) -> Result<()>
    where
        F: FnMut(FrameEvent),
    {
        let (complete, reading_length) = match &self.state {
            State::ReadingLength => (self.prefix_filled == LENGTH_PREFIX_SIZE, true),
            State::ReadingPayload { expected, buffer } => (buffer.len() == *expected, false),
        };

        if !complete {
            return Ok(());
        }

        if reading_length {
            self.length_completed()
        } else {
            self.payload_completed(emit);
            Ok(())
        }
    }

    fn length_completed(&mut self) -> Result<()> {
        let length = read_length_prefix(self.length_prefix);
        self.prefix_filled = 0;

        if length < 0 {
            return Err(self.fail(format!("negative length {}", length)));
        }

        let length = length as usize;
        if self.max_message_size > 0 && length > self.max_message_size {
            return Err(self.fail(format!(
                "message too large: length {} exceeds maximum message size {}",
                length, self.max_message_size
            )));
        }

        if length == 0 {
            self.stats.keepalives += 1;
            tracing::trace!("keepalive frame received");
            return Ok(());
        }

        self.state = State::ReadingPayload {
            expected: length,
            buffer: Vec::with_capacity(length.min(INITIAL_PAYLOAD_CAPACITY)),
        };
        Ok(())
    }

    fn payload_completed<F>(&mut self, emit: &mut F)
    where
        F: FnMut(FrameEvent),
    {
        let State::ReadingPayload { buffer, .. } =
            std::mem::replace(&mut self.state, State::ReadingLength)
        else {
            return;
        };

        match self.codec.decode_payload(&buffer) {
            Ok(message) => {
                self.stats.messages += 1;
                emit(FrameEvent::Message(Bytes::from(message)));
            }
            Err(err) => {
                self.stats.corrupt_payloads += 1;
                tracing::debug!(payload_len = buffer.len(), error = %err, "dropping undecodable frame");
                emit(FrameEvent::Corrupt(err));
            }
        }
    }

    fn fail(&mut self, reason: String) -> ProtocolError {
        let err = ProtocolError::ProtocolViolation(reason);
        self.failure = Some(err.clone());
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn messages(events: &[FrameEvent]) -> Vec<Vec<u8>> {
        events
            .iter()
            .filter_map(|e| match e {
                FrameEvent::Message(b) => Some(b.to_vec()),
                FrameEvent::Corrupt(_) => None,
            })
            .collect()
    }

    fn feed_in_chunks(
        reassembler: &mut FrameReassembler,
        wire: &[u8],
        chunk_size: usize,
    ) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        for chunk in wire.chunks(chunk_size) {
            reassembler.feed(chunk, |e| events.push(e)).unwrap();
        }
        events
    }

    #[test]
    fn test_single_frame_single_chunk() {
        let codec = FrameCodec::uncompressed();
        let wire = codec.encode(b"hello").unwrap();
        let mut reassembler = FrameReassembler::new(codec, 0);

        let events = reassembler.feed_collect(&wire).unwrap();

        assert_eq!(messages(&events), vec![b"hello".to_vec()]);
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_every_split_yields_message_exactly_once() {
        for compress in [false, true] {
            let codec = FrameCodec::new(compress);
            let message = b"boundary agnostic payload".to_vec();
            let wire = codec.encode(&message).unwrap();

            for chunk_size in 1..=wire.len() {
                let mut reassembler = FrameReassembler::new(codec, 0);
                let events = feed_in_chunks(&mut reassembler, &wire, chunk_size);
                assert_eq!(
                    messages(&events),
                    vec![message.clone()],
                    "chunk_size={} compress={}",
                    chunk_size,
                    compress
                );
                assert!(reassembler.is_idle());
            }
        }
    }

    #[test]
    fn test_split_at_every_single_offset() {
        let codec = FrameCodec::uncompressed();
        let wire = codec.encode(b"0123456789").unwrap();

        for split in 0..=wire.len() {
            let mut reassembler = FrameReassembler::new(codec, 0);
            let mut events = reassembler.feed_collect(&wire[..split]).unwrap();
            events.extend(reassembler.feed_collect(&wire[split..]).unwrap());
            assert_eq!(messages(&events), vec![b"0123456789".to_vec()], "split={}", split);
        }
    }

    #[test]
    fn test_multiple_frames_in_order() {
        let codec = FrameCodec::compressed();
        let originals: Vec<Vec<u8>> = (0..10)
            .map(|i| format!("message number {}", i).into_bytes())
            .collect();

        let mut wire = Vec::new();
        for m in &originals {
            wire.extend(codec.encode(m).unwrap());
        }

        for chunk_size in [1, 2, 3, 5, 7, 13, 64, wire.len()] {
            let mut reassembler = FrameReassembler::new(codec, 0);
            let events = feed_in_chunks(&mut reassembler, &wire, chunk_size);
            assert_eq!(messages(&events), originals, "chunk_size={}", chunk_size);
        }
    }

    #[test]
    fn test_one_chunk_completes_many_frames() {
        let codec = FrameCodec::uncompressed();
        let mut wire = codec.encode(b"a").unwrap();
        wire.extend(codec.encode(b"bb").unwrap());
        wire.extend(codec.encode(b"ccc").unwrap());

        let mut reassembler = FrameReassembler::new(codec, 0);
        let events = reassembler.feed_collect(&wire).unwrap();

        assert_eq!(
            messages(&events),
            vec![b"a".to_vec(), b"bb".to_vec(), b"ccc".to_vec()]
        );
        assert_eq!(reassembler.stats().messages, 3);
        assert_eq!(reassembler.stats().bytes_consumed, wire.len() as u64);
    }

    #[test]
    fn test_negative_length_is_violation() {
        let mut reassembler = FrameReassembler::new(FrameCodec::uncompressed(), 0);
        let mut events = Vec::new();

        let err = reassembler
            .feed(&(-1i32).to_le_bytes(), |e| events.push(e))
            .unwrap_err();

        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
        assert!(err.to_string().contains("negative length"));
        assert!(events.is_empty());
        assert!(reassembler.is_failed());
    }

    #[test]
    fn test_length_above_max_is_violation() {
        let mut reassembler = FrameReassembler::new(FrameCodec::uncompressed(), 100);

        let err = reassembler.feed_collect(&101i32.to_le_bytes()).unwrap_err();

        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
        assert!(err.to_string().contains("message too large"));
    }

    #[test]
    fn test_length_at_max_is_accepted() {
        let codec = FrameCodec::uncompressed();
        let wire = codec.encode(&[7u8; 100]).unwrap();
        let mut reassembler = FrameReassembler::new(codec, 100);

        let events = reassembler.feed_collect(&wire).unwrap();
        assert_eq!(messages(&events), vec![vec![7u8; 100]]);
    }

    #[test]
    fn test_zero_max_means_unlimited() {
        let codec = FrameCodec::uncompressed();
        let wire = codec.encode(&vec![1u8; 200_000]).unwrap();
        let mut reassembler = FrameReassembler::new(codec, 0);

        let events = feed_in_chunks(&mut reassembler, &wire, 4096);
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn test_failed_reassembler_rejects_further_input() {
        let codec = FrameCodec::uncompressed();
        let mut reassembler = FrameReassembler::new(codec, 0);
        reassembler.feed_collect(&(-5i32).to_le_bytes()).unwrap_err();

        let valid = codec.encode(b"after").unwrap();
        let err = reassembler.feed_collect(&valid).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));

        reassembler.reset();
        let events = reassembler.feed_collect(&valid).unwrap();
        assert_eq!(messages(&events), vec![b"after".to_vec()]);
    }

    #[test]
    fn test_events_before_violation_are_emitted() {
        let codec = FrameCodec::uncompressed();
        let mut wire = codec.encode(b"ok").unwrap();
        wire.extend_from_slice(&(-1i32).to_le_bytes());

        let mut reassembler = FrameReassembler::new(codec, 0);
        let mut events = Vec::new();
        let result = reassembler.feed(&wire, |e| events.push(e));

        assert!(result.is_err());
        assert_eq!(messages(&events), vec![b"ok".to_vec()]);
    }

    #[test]
    fn test_keepalive_emits_nothing() {
        let codec = FrameCodec::uncompressed();
        let mut reassembler = FrameReassembler::new(codec, 0);

        let events = reassembler
            .feed_collect(&FrameCodec::keepalive_frame())
            .unwrap();
        assert!(events.is_empty());
        assert!(reassembler.is_idle());
        assert_eq!(reassembler.stats().keepalives, 1);

        let events = reassembler
            .feed_collect(&codec.encode(b"next").unwrap())
            .unwrap();
        assert_eq!(messages(&events), vec![b"next".to_vec()]);
    }

    #[test]
    fn test_keepalives_interleaved_byte_by_byte() {
        let codec = FrameCodec::compressed();
        let mut wire = FrameCodec::keepalive_frame().to_vec();
        wire.extend(codec.encode(b"x").unwrap());
        wire.extend(FrameCodec::keepalive_frame());
        wire.extend(FrameCodec::keepalive_frame());
        wire.extend(codec.encode(b"y").unwrap());

        let mut reassembler = FrameReassembler::new(codec, 0);
        let events = feed_in_chunks(&mut reassembler, &wire, 1);

        assert_eq!(messages(&events), vec![b"x".to_vec(), b"y".to_vec()]);
        assert_eq!(reassembler.stats().keepalives, 3);
    }

    #[test]
    fn test_corrupt_payload_does_not_break_next_frame() {
        let codec = FrameCodec::compressed();

        let garbage = [0xFFu8; 8];
        let mut wire = (garbage.len() as i32).to_le_bytes().to_vec();
        wire.extend_from_slice(&garbage);
        wire.extend(codec.encode(b"still fine").unwrap());

        let mut reassembler = FrameReassembler::new(codec, 0);
        let events = feed_in_chunks(&mut reassembler, &wire, 3);

        assert_eq!(events.len(), 2);
        assert!(matches!(
            events[0],
            FrameEvent::Corrupt(ProtocolError::CorruptPayload(_))
        ));
        assert_eq!(events[1], FrameEvent::Message(Bytes::from_static(b"still fine")));
        assert_eq!(reassembler.stats().corrupt_payloads, 1);
        assert!(!reassembler.is_failed());
    }

    #[test]
    fn test_partial_frame_is_never_emitted() {
        let codec = FrameCodec::uncompressed();
        let wire = codec.encode(b"incomplete").unwrap();
        let mut reassembler = FrameReassembler::new(codec, 0);

        let events = reassembler.feed_collect(&wire[..wire.len() - 1]).unwrap();
        assert!(events.is_empty());
        assert!(!reassembler.is_idle());
        assert_eq!(reassembler.pending_bytes(), wire.len() - 1);

        reassembler.reset();
        assert!(reassembler.is_idle());
        assert_eq!(reassembler.pending_bytes(), 0);
    }

    #[test]
    fn test_empty_chunk_is_noop() {
        let mut reassembler = FrameReassembler::new(FrameCodec::uncompressed(), 0);
        let events = reassembler.feed_collect(&[]).unwrap();
        assert!(events.is_empty());
        assert!(reassembler.is_idle());
    }
}
