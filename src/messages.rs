//! Wire message model and framing codec.
//!
//! Every datagram exchanged between peers is an [`Envelope`]: correlation id,
//! sender and receiver addresses, a response flag, an optional error string
//! and a typed [`Payload`]. The payload enum is the on-wire type tag; the
//! decoder dispatches on it and rejects unknown variants.
//!
//! Frames are self-delimiting over a byte stream: a 4-byte big-endian length
//! followed by the bincode-encoded envelope. Deserialization is bounded so a
//! peer cannot make us allocate more than [`MAX_FRAME_SIZE`] bytes.

use bincode::Options;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::{NetworkAddress, NodeId};

/// Largest value accepted in a `Store` payload.
pub const MAX_VALUE_SIZE: usize = 1024 * 1024;

/// Largest frame body accepted by the codec; headroom over the value limit
/// covers the envelope fields and the closest-node lists.
pub const MAX_FRAME_SIZE: usize = MAX_VALUE_SIZE + 4096;

/// Bytes of framing prepended to every encoded envelope.
pub const FRAME_HEADER_LEN: usize = 4;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_FRAME_SIZE as u64)
        .with_fixint_encoding()
}

/// Failure to turn bytes into a well-formed envelope (or back).
///
/// Fatal for the offending frame only; the listen loop drops it and keeps
/// reading.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("frame of {0} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized(usize),
    #[error("truncated frame: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
}

/// The six message kinds of the protocol.
///
/// `FindValueResponse` populates exactly one of `value` and `closest`: a hit
/// carries the bytes, a miss carries the responder's closest contacts.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    FindNodeQuery { target: NodeId },
    FindNodeResponse { closest: Vec<NetworkAddress> },
    FindValueQuery { target: NodeId },
    FindValueResponse { value: Option<Vec<u8>>, closest: Vec<NetworkAddress> },
    StoreQuery { key: NodeId, data: Vec<u8> },
    PingQuery,
    PingResponse,
}

/// One routed protocol message.
///
/// Requests get a fresh id from the sending transport; a response echoes the
/// id of the request it answers, which is the whole correlation mechanism.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: u64,
    pub sender: NetworkAddress,
    pub receiver: NetworkAddress,
    pub is_response: bool,
    pub error: Option<String>,
    pub payload: Payload,
}

impl Envelope {
    /// A fresh request envelope; the transport assigns the id on send.
    pub fn query(sender: NetworkAddress, receiver: NetworkAddress, payload: Payload) -> Self {
        Self {
            id: 0,
            sender,
            receiver,
            is_response: false,
            error: None,
            payload,
        }
    }

    /// A response to `request`, echoing its envelope id.
    pub fn reply_to(request: &Envelope, sender: NetworkAddress, payload: Payload) -> Self {
        Self {
            id: request.id,
            sender,
            receiver: request.sender,
            is_response: true,
            error: None,
            payload,
        }
    }
}

/// Serializes an envelope into a length-prefixed frame.
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
    let body = bincode_options().serialize(envelope)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized(body.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Parses a complete length-prefixed frame back into an envelope.
pub fn decode(frame: &[u8]) -> Result<Envelope, CodecError> {
    if frame.len() < FRAME_HEADER_LEN {
        return Err(CodecError::Truncated {
            expected: FRAME_HEADER_LEN,
            actual: frame.len(),
        });
    }
    let mut header = [0u8; FRAME_HEADER_LEN];
    header.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
    let len = u32::from_be_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::Oversized(len));
    }
    let body = &frame[FRAME_HEADER_LEN..];
    if body.len() < len {
        return Err(CodecError::Truncated {
            expected: len,
            actual: body.len(),
        });
    }
    decode_body(&body[..len])
}

/// Deserializes a frame body whose length prefix was already consumed.
pub fn decode_body(body: &[u8]) -> Result<Envelope, CodecError> {
    Ok(bincode_options().deserialize(body)?)
}
