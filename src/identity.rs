//! # Node Identity and Distance Metric
//!
//! This module defines the identifier types used throughout Cinder:
//!
//! - [`NodeId`]: 160-bit identifier for both nodes and stored keys
//! - [`NetworkAddress`]: a node id paired with its reachable (ip, port)
//!
//! ## Distance Model
//!
//! Routing uses the Kademlia XOR metric: `distance(a, b) = a XOR b`,
//! interpreted as a 160-bit unsigned integer. "Closer" means numerically
//! smaller. The metric is symmetric and unidirectional: for any point there
//! is exactly one id at each distance.
//!
//! ## Printable Form
//!
//! Keys cross the API boundary as base58 strings of the raw 20 bytes.
//! `NodeId::to_base58` / `NodeId::from_base58` are the only sanctioned
//! conversions; everything on the wire is raw bytes.

use std::cmp::Ordering;
use std::net::{IpAddr, SocketAddr};

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier width in bits.
pub const ID_BITS: usize = 160;

/// Identifier width in bytes; ids travel on the wire as this many raw bytes.
pub const ID_BYTES: usize = ID_BITS / 8;

/// Error returned when a printable key does not decode to a [`NodeId`].
#[derive(Debug, Error)]
pub enum KeyParseError {
    #[error("key is not valid base58: {0}")]
    Encoding(#[from] bs58::decode::Error),
    #[error("key must decode to {ID_BYTES} bytes, got {0}")]
    Length(usize),
}

/// A 160-bit node or content identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId([u8; ID_BYTES]);

impl NodeId {
    pub fn from_bytes(bytes: [u8; ID_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_BYTES] {
        &self.0
    }

    /// Uniformly random identifier.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_BYTES];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Bytewise XOR against `other`, the raw distance value.
    pub fn xor_distance(&self, other: &NodeId) -> [u8; ID_BYTES] {
        let mut dist = [0u8; ID_BYTES];
        for (i, byte) in dist.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        dist
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    pub fn from_base58(s: &str) -> Result<Self, KeyParseError> {
        let bytes = bs58::decode(s).into_vec()?;
        if bytes.len() != ID_BYTES {
            return Err(KeyParseError::Length(bytes.len()));
        }
        let mut id = [0u8; ID_BYTES];
        id.copy_from_slice(&bytes);
        Ok(Self(id))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({}..)", hex::encode(&self.0[..8]))
    }
}

/// Compares two raw distance values as 160-bit big-endian integers.
pub fn distance_cmp(a: &[u8; ID_BYTES], b: &[u8; ID_BYTES]) -> Ordering {
    for i in 0..ID_BYTES {
        match a[i].cmp(&b[i]) {
            Ordering::Equal => continue,
            unequal => return unequal,
        }
    }
    Ordering::Equal
}

/// A reachable peer: identifier plus transport endpoint.
///
/// Two addresses with the same id denote the same peer even when the
/// (ip, port) differ; routing and lookups compare by id only.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub id: NodeId,
    pub ip: IpAddr,
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(id: NodeId, ip: IpAddr, port: u16) -> Self {
        Self { id, ip, port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl std::fmt::Debug for NetworkAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}..@{}:{}",
            hex::encode(&self.id.as_bytes()[..8]),
            self.ip,
            self.port
        )
    }
}
