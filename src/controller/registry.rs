use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{HerdError, Result};
use crate::protocol::{AgentInfo, Message, Outbox};
use crate::scheduler::placement::NodeSnapshot;
use crate::scheduler::GpuInfo;

/// A connected agent as the controller sees it.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub address: String,
    pub capacity: u32,
    pub jobs_running: u32,
    pub capabilities: Vec<String>,
    pub gpus: Vec<GpuInfo>,
    pub connected_at: DateTime<Utc>,
    pub outbox: Outbox,
}

impl Node {
    pub fn new(
        name: impl Into<String>,
        address: impl Into<String>,
        capabilities: Vec<String>,
        info: &AgentInfo,
        outbox: Outbox,
    ) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            capacity: info.capacity,
            jobs_running: info.jobs_running,
            capabilities,
            gpus: info.gpus.clone(),
            connected_at: Utc::now(),
            outbox,
        }
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        NodeSnapshot {
            name: self.name.clone(),
            address: self.address.clone(),
            capacity: self.capacity,
            jobs_running: self.jobs_running,
            capabilities: self.capabilities.clone(),
            gpus: self.gpus.clone(),
        }
    }
}

/// How long a unicast waits on a node whose outbox is full.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Live agents keyed by name. Names are unique among connected agents.
#[derive(Debug)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Node>>,
    send_timeout: Duration,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::with_send_timeout(DEFAULT_SEND_TIMEOUT)
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry whose unicasts give up on a stalled node after `send_timeout`.
    pub fn with_send_timeout(send_timeout: Duration) -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
            send_timeout,
        }
    }

    /// Add a node. Returns false, leaving the registry untouched, if the name
    /// is already taken.
    ///
    /// `greeting` is queued on the node's outbox before the node becomes
    /// visible, so it precedes anything else sent through the registry.
    pub async fn register(&self, node: Node, greeting: Message) -> bool {
        let mut nodes = self.nodes.write().await;
        if nodes.contains_key(&node.name) {
            return false;
        }
        if let Err(e) = node.outbox.send(greeting).await {
            tracing::warn!(node = %node.name, error = %e, "Failed to greet node");
            return false;
        }
        tracing::info!(node = %node.name, address = %node.address, capacity = node.capacity, "Node registered");
        nodes.insert(node.name.clone(), node);
        true
    }

    pub async fn deregister(&self, name: &str) -> Option<Node> {
        let removed = self.nodes.write().await.remove(name);
        if removed.is_some() {
            tracing::info!(node = %name, "Node deregistered");
        }
        removed
    }

    /// Refresh the load figures of a node from the info it just reported.
    pub async fn update_stats(&self, name: &str, info: &AgentInfo) {
        if let Some(node) = self.nodes.write().await.get_mut(name) {
            node.capacity = info.capacity;
            node.jobs_running = info.jobs_running;
            node.gpus = info.gpus.clone();
        }
    }

    /// Value copies of every live node, sorted by name.
    pub async fn snapshot(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        let mut out: Vec<NodeSnapshot> = nodes.values().map(Node::snapshot).collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    /// Queue a message for the named node. A node that does not drain its
    /// queue within the send timeout gets [`ProtocolError::Stalled`].
    ///
    /// [`ProtocolError::Stalled`]: crate::error::ProtocolError::Stalled
    pub async fn unicast(&self, name: &str, message: Message) -> Result<()> {
        let outbox = self
            .nodes
            .read()
            .await
            .get(name)
            .map(|node| node.outbox.clone())
            .ok_or_else(|| HerdError::NodeNotFound(name.to_string()))?;
        outbox.send_timeout(message, self.send_timeout).await?;
        Ok(())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.nodes.read().await.contains_key(name)
    }

    pub async fn len(&self) -> usize {
        self.nodes.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.nodes.read().await.is_empty()
    }
}
