// Length-tagged message framing over a byte stream.
//
// Wire format: the ASCII tag `MSG`, then the payload byte length as decimal
// left-padded with zeros to five digits, then the UTF-8 JSON payload. There is
// no delimiter between header and payload or between frames:
//
//   MSG00017{"addPool":"lobby7"}MSG00012{"ping":true}...
//
// Decoding is a two-phase accumulator. The decoder always asks for a fixed
// number of bytes (`remaining()`): eight for a header probe, then exactly the
// announced payload length. `decode_step` is the pure transition function for
// one read; `FrameDecoder::push` feeds arbitrary chunks by splitting them at
// target boundaries, so the same byte stream decodes identically no matter how
// the socket fragments it.
//
// Bad frames never poison the stream state: a malformed header discards the
// eight probed bytes, an undecodable payload discards that payload, and both
// reset to the header phase. A read that delivers more than was asked for is
// an overflow and is dropped without changing state.

use std::io::{self, Write};

use crate::error::{ProtocolError, Result};
use crate::message::Message;

/// Literal tag that opens every frame header.
pub const HEADER_TAG: &str = "MSG";

/// Bytes read when probing for a header: tag plus five length digits.
pub const HEADER_PROBE_LEN: usize = 8;

/// Largest payload the fixed-size header probe can describe.
pub const MAX_PAYLOAD_LEN: usize = 99_999;

/// Length digits for a header: zero-padded to five digits, plain decimal once
/// the length has five or more digits of its own.
pub fn format_length_digits(len: usize) -> String {
    format!("{len:05}")
}

/// Full header for a payload of `len` bytes.
pub fn format_length_header(len: usize) -> String {
    format!("{HEADER_TAG}{}", format_length_digits(len))
}

/// A message serialized for the stream: header and payload are kept apart so
/// a writer can emit them back-to-back under a single lock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedFrame {
    pub header: String,
    pub payload: Vec<u8>,
}

impl EncodedFrame {
    /// Total bytes on the wire.
    pub fn wire_len(&self) -> usize {
        self.header.len() + self.payload.len()
    }

    /// Header followed by payload as one buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.wire_len());
        bytes.extend_from_slice(self.header.as_bytes());
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Serialize a message and build its length header.
pub fn encode_frame(msg: &Message) -> Result<EncodedFrame> {
    let payload = msg.to_json_bytes()?;
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: payload.len(),
            max: MAX_PAYLOAD_LEN,
        });
    }
    Ok(EncodedFrame {
        header: format_length_header(payload.len()),
        payload,
    })
}

/// Write header then payload, then flush.
pub fn write_frame<W: Write>(writer: &mut W, frame: &EncodedFrame) -> io::Result<()> {
    writer.write_all(frame.header.as_bytes())?;
    writer.write_all(&frame.payload)?;
    writer.flush()
}

/// Which part of a frame the decoder is accumulating.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Header,
    Payload,
}

/// Complete decoder state: phase, target length for the current phase, and
/// the bytes accumulated toward it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecoderState {
    pub phase: Phase,
    pub target: usize,
    pub buffer: Vec<u8>,
}

impl Default for DecoderState {
    fn default() -> Self {
        Self {
            phase: Phase::Header,
            target: HEADER_PROBE_LEN,
            buffer: Vec::with_capacity(HEADER_PROBE_LEN),
        }
    }
}

impl DecoderState {
    /// Bytes still needed to complete the current phase.
    pub fn remaining(&self) -> usize {
        self.target.saturating_sub(self.buffer.len())
    }
}

/// Result of feeding one read to the decoder.
#[derive(Debug)]
pub enum StepOutcome {
    /// More bytes are needed.
    Pending,
    /// A complete message was decoded.
    Message(Message),
    /// The bytes were dropped as a protocol violation.
    Discarded(ProtocolError),
}

/// Pure transition for one read of `bytes`.
///
/// `bytes` must not exceed `state.remaining()`; a longer read is reported as
/// `Overflow` and the state is returned unchanged.
pub fn decode_step(mut state: DecoderState, bytes: &[u8]) -> (DecoderState, StepOutcome) {
    let remaining = state.remaining();
    if bytes.len() > remaining {
        return (
            state,
            StepOutcome::Discarded(ProtocolError::Overflow {
                got: bytes.len(),
                expected: remaining,
            }),
        );
    }

    state.buffer.extend_from_slice(bytes);
    if state.buffer.len() < state.target {
        return (state, StepOutcome::Pending);
    }

    let complete = std::mem::take(&mut state.buffer);
    match state.phase {
        Phase::Header => match parse_header(&complete) {
            Ok(0) => (
                DecoderState::default(),
                StepOutcome::Discarded(ProtocolError::EmptyFrame),
            ),
            Ok(len) => (
                DecoderState {
                    phase: Phase::Payload,
                    target: len,
                    buffer: Vec::with_capacity(len),
                },
                StepOutcome::Pending,
            ),
            Err(e) => (DecoderState::default(), StepOutcome::Discarded(e)),
        },
        Phase::Payload => {
            let outcome = match Message::from_json_slice(&complete) {
                Ok(msg) => StepOutcome::Message(msg),
                Err(e) => StepOutcome::Discarded(e),
            };
            (DecoderState::default(), outcome)
        }
    }
}

/// Parse a complete header probe into the announced payload length.
fn parse_header(bytes: &[u8]) -> Result<usize> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| ProtocolError::MalformedHeader(String::from_utf8_lossy(bytes).into_owned()))?;
    let digits = text
        .strip_prefix(HEADER_TAG)
        .ok_or_else(|| ProtocolError::MalformedHeader(text.to_owned()))?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ProtocolError::MalformedHeader(text.to_owned()));
    }
    digits
        .parse()
        .map_err(|_| ProtocolError::MalformedHeader(text.to_owned()))
}

/// Stateful wrapper around `decode_step`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    state: DecoderState,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many bytes the next read should ask for.
    pub fn remaining(&self) -> usize {
        self.state.remaining()
    }

    pub fn phase(&self) -> Phase {
        self.state.phase
    }

    /// Feed exactly one read. See `decode_step`.
    pub fn step(&mut self, bytes: &[u8]) -> StepOutcome {
        let state = std::mem::take(&mut self.state);
        let (next, outcome) = decode_step(state, bytes);
        self.state = next;
        outcome
    }

    /// Feed an arbitrary chunk, returning every message it completes.
    /// Discarded frames are logged and skipped.
    pub fn push(&mut self, mut bytes: &[u8]) -> Vec<Message> {
        let mut messages = Vec::new();
        while !bytes.is_empty() {
            let take = self.remaining().min(bytes.len());
            let (chunk, rest) = bytes.split_at(take);
            bytes = rest;
            match self.step(chunk) {
                StepOutcome::Pending => {}
                StepOutcome::Message(msg) => messages.push(msg),
                StepOutcome::Discarded(e) => {
                    tracing::warn!(error = %e, "discarding frame");
                }
            }
        }
        messages
    }

    /// Drop any partial frame and return to the header phase.
    pub fn reset(&mut self) {
        self.state = DecoderState::default();
    }
}
