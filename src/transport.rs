//! Peer messaging seam.
//!
//! The coordinator only talks to peers through [`PeerTransport`]. Delivery is
//! not assumed reliable: calls may fail, time out, or arrive late. The
//! in-process [`LocalNetwork`] wires coordinators together for the CLI
//! simulation and tests, with partitions, crashes and per-node delay.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::election::{NodeId, Term, VoteRequest, VoteResponse};
use crate::error::{CoordError, Result};
use crate::replay::Event;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Lease renewal sent by a leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub term: Term,
    pub leader_id: NodeId,
    pub lease_expiry: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub node_id: NodeId,
    pub term: Term,
    pub accepted: bool,
}

/// Outbound calls to a named peer.
pub trait PeerTransport: Send + Sync {
    fn request_vote(&self, peer: NodeId, req: VoteRequest) -> BoxFuture<'_, Result<VoteResponse>>;

    fn heartbeat(&self, peer: NodeId, beat: Heartbeat) -> BoxFuture<'_, Result<HeartbeatAck>>;

    /// Events the peer has logged above `after`.
    fn fetch_events(&self, peer: NodeId, after: u64) -> BoxFuture<'_, Result<Vec<Event>>>;
}

/// Inbound side, implemented by whatever answers for a node.
pub trait PeerHandler: Send + Sync {
    fn handle_vote_request(&self, req: &VoteRequest) -> VoteResponse;

    fn handle_heartbeat(&self, beat: &Heartbeat) -> HeartbeatAck;

    fn events_after(&self, after: u64) -> Vec<Event>;
}

#[derive(Default)]
struct NetworkInner {
    handlers: HashMap<NodeId, Weak<dyn PeerHandler>>,
    groups: HashMap<NodeId, usize>,
    down: HashSet<NodeId>,
    delays: HashMap<NodeId, u64>,
}

/// In-process network. Handlers are held weakly so a dropped node simply
/// becomes unreachable.
#[derive(Default)]
pub struct LocalNetwork {
    inner: RwLock<NetworkInner>,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register<H: PeerHandler + 'static>(&self, node_id: impl Into<NodeId>, handler: &Arc<H>) {
        let weak: Weak<dyn PeerHandler> = Arc::downgrade(handler) as Weak<dyn PeerHandler>;
        self.inner.write().handlers.insert(node_id.into(), weak);
    }

    /// Transport bound to `node_id` as the sender.
    pub fn endpoint(self: &Arc<Self>, node_id: impl Into<NodeId>) -> Arc<LocalEndpoint> {
        Arc::new(LocalEndpoint {
            network: self.clone(),
            from: node_id.into(),
        })
    }

    /// Split the network. Nodes only reach nodes in the same group; nodes
    /// not listed stay together in an implicit group of their own.
    pub fn partition(&self, groups: &[&[&str]]) {
        let mut inner = self.inner.write();
        inner.groups.clear();
        for (index, group) in groups.iter().enumerate() {
            for node in group.iter() {
                inner.groups.insert(node.to_string(), index);
            }
        }
        tracing::info!(groups = groups.len(), "Network partitioned");
    }

    pub fn heal(&self) {
        self.inner.write().groups.clear();
        tracing::info!("Network healed");
    }

    pub fn crash(&self, node_id: &str) {
        self.inner.write().down.insert(node_id.to_string());
    }

    pub fn restart(&self, node_id: &str) {
        self.inner.write().down.remove(node_id);
    }

    /// Delay every message delivered to `node_id`.
    pub fn set_delay(&self, node_id: &str, delay_ms: u64) {
        self.inner.write().delays.insert(node_id.to_string(), delay_ms);
    }

    pub fn reachable(&self, from: &str, to: &str) -> bool {
        let inner = self.inner.read();
        !inner.down.contains(from)
            && !inner.down.contains(to)
            && inner.groups.get(from) == inner.groups.get(to)
    }

    async fn route(&self, from: &str, to: &str) -> Result<Arc<dyn PeerHandler>> {
        let (handler, delay) = {
            let inner = self.inner.read();
            let handler = inner.handlers.get(to).and_then(|w| w.upgrade());
            (handler, inner.delays.get(to).copied().unwrap_or(0))
        };
        if !self.reachable(from, to) {
            return Err(CoordError::Transport(format!("{to} unreachable from {from}")));
        }
        let handler =
            handler.ok_or_else(|| CoordError::Transport(format!("{to} is not registered")))?;
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok(handler)
    }
}

/// One node's view of a [`LocalNetwork`].
pub struct LocalEndpoint {
    network: Arc<LocalNetwork>,
    from: NodeId,
}

impl PeerTransport for LocalEndpoint {
    fn request_vote(&self, peer: NodeId, req: VoteRequest) -> BoxFuture<'_, Result<VoteResponse>> {
        Box::pin(async move {
            let handler = self.network.route(&self.from, &peer).await?;
            Ok(handler.handle_vote_request(&req))
        })
    }

    fn heartbeat(&self, peer: NodeId, beat: Heartbeat) -> BoxFuture<'_, Result<HeartbeatAck>> {
        Box::pin(async move {
            let handler = self.network.route(&self.from, &peer).await?;
            Ok(handler.handle_heartbeat(&beat))
        })
    }

    fn fetch_events(&self, peer: NodeId, after: u64) -> BoxFuture<'_, Result<Vec<Event>>> {
        Box::pin(async move {
            let handler = self.network.route(&self.from, &peer).await?;
            Ok(handler.events_after(after))
        })
    }
}
