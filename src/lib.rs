mod dht;
mod identity;
mod messages;
mod node;
mod routing;
mod storage;
mod transport;

pub use dht::{hash_content, BootstrapPeer, Dht, ALPHA, K};
pub use identity::{KeyParseError, NetworkAddress, NodeId};
pub use messages::{decode, encode, CodecError, Envelope, Payload};
pub use node::{Node, NodeConfig};
pub use storage::{EXPIRE_INTERVAL, REFRESH_INTERVAL, REPLICATE_INTERVAL, REPUBLISH_INTERVAL};
pub use transport::{
    ResponseHandle, TcpTransport, Transport, TransportError, MSG_TIMEOUT, PING_TIMEOUT,
};
