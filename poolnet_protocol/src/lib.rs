// poolnet_protocol: wire protocol between relay clients and the relay server.
//
// This crate defines the message vocabulary and framing shared with the
// poolnet relay. It does no networking of its own; the client session engine
// (`poolnet_client`) drives it over real sockets.
//
// Module overview:
// - `types.rs`:    `ConnId` (relay-assigned connection ID) and
//                  `PriorityChannel` (the four outbound traffic classes).
// - `message.rs`:  `Message` (a JSON object), the reserved-key vocabulary,
//                  control-message builders, routing `Directive` stamping
//                  and inbound `Route` classification.
// - `framing.rs`:  `MSG` + five-digit length header framing, a pure decoder
//                  step function and a chunk-tolerant `FrameDecoder`.
// - `error.rs`:    `ProtocolError`.
//
// Design decisions:
// - **Untyped JSON objects.** Application payloads and protocol signals share
//   one object, distinguished only by reserved keys, so `Message` stays a map
//   rather than a closed enum.
// - **Datagrams are unframed.** A datagram carries exactly one JSON object;
//   only the stream needs length headers.

pub mod error;
pub mod framing;
pub mod message;
pub mod types;

pub use error::{ProtocolError, Result};
pub use framing::{
    DecoderState, EncodedFrame, FrameDecoder, HEADER_PROBE_LEN, MAX_PAYLOAD_LEN, Phase,
    StepOutcome, decode_step, encode_frame, format_length_digits, format_length_header,
    write_frame,
};
pub use message::{Directive, Message, Route, keys};
pub use types::{ConnId, PriorityChannel};
