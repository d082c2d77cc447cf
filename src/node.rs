//! Public node façade: configuration, lifecycle and the key-value API.

use std::net::{IpAddr, Ipv4Addr};

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::info;

use crate::dht::{BootstrapPeer, Dht};
use crate::identity::{NetworkAddress, NodeId};
use crate::transport::TcpTransport;

/// Startup options for a [`Node`].
#[derive(Clone, Debug)]
pub struct NodeConfig {
    pub ip: IpAddr,
    /// 0 binds an ephemeral port.
    pub port: u16,
    /// Generated randomly when unset.
    pub id: Option<NodeId>,
    /// Peers contacted by [`Node::bootstrap`], in order.
    pub bootstrap: Vec<BootstrapPeer>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)),
            port: 0,
            id: None,
            bootstrap: Vec::new(),
        }
    }
}

/// A running DHT node: bound TCP transport, listen loop and maintenance
/// driver, fronting the engine's Put/Get/Bootstrap operations.
pub struct Node {
    dht: Dht<TcpTransport>,
    bootstrap_peers: Vec<BootstrapPeer>,
    listen_task: JoinHandle<()>,
    maintenance_task: JoinHandle<()>,
}

impl Node {
    /// Binds the transport and starts the background tasks. The node is
    /// ready to serve queries immediately; call [`bootstrap`](Self::bootstrap)
    /// to join an existing network.
    pub async fn bind(config: NodeConfig) -> Result<Self> {
        let id = config.id.unwrap_or_else(NodeId::random);
        let transport = TcpTransport::bind(config.ip, config.port)
            .await
            .context("failed to bind transport")?;
        let local = transport.local_addr();
        let address = NetworkAddress::new(id, local.ip(), local.port());

        let dht = Dht::new(address, transport);
        let listen_task = dht.spawn_listen();
        let maintenance_task = dht.spawn_maintenance();

        info!(
            id = %hex::encode(&id.as_bytes()[..8]),
            addr = %local,
            "node up"
        );

        Ok(Self {
            dht,
            bootstrap_peers: config.bootstrap,
            listen_task,
            maintenance_task,
        })
    }

    pub fn id(&self) -> NodeId {
        self.dht.self_addr().id
    }

    pub fn address(&self) -> NetworkAddress {
        self.dht.self_addr()
    }

    /// Joins the network through the configured bootstrap peers.
    pub async fn bootstrap(&self) -> Result<()> {
        self.dht.bootstrap(&self.bootstrap_peers).await
    }

    /// Publishes `data` into the network; returns its printable key.
    pub async fn put(&self, data: Vec<u8>) -> Result<String> {
        self.dht.put(data).await
    }

    /// Resolves a printable key. `Ok(None)` means not found anywhere.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.dht.get(key).await
    }

    /// Forgets a key locally. Other nodes holding replicas are unaffected.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.dht.delete(key).await
    }

    /// Iterative FindNode from this node's perspective.
    pub async fn find_node(&self, target: NodeId) -> Result<Vec<NetworkAddress>> {
        self.dht.find_node(target).await
    }

    pub fn is_running(&self) -> bool {
        !self.listen_task.is_finished()
    }

    /// Closes the transport; the listen loop drains and exits.
    pub async fn shutdown(&self) {
        self.dht.shutdown().await;
        self.maintenance_task.abort();
    }
}
