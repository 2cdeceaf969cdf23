//! Node topology collaborator: compute and gateway nodes, their ports and
//! their readiness.

use crate::listener::{ListenerId, ListenerRegistry};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Compute,
    Gateway,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeState {
    Init,
    Complete,
    Incomplete,
}

/// A switch-hosting node as seen by the reconcilers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub hostname: String,
    pub node_type: NodeType,
    /// Device id of the node's integration bridge.
    pub integration_bridge: String,
    /// Tunnel endpoint address.
    pub data_ip: Option<Ipv4Addr>,
    pub tunnel_port: Option<u32>,
    pub vlan_port: Option<u32>,
    /// External-facing port of a gateway node.
    pub uplink_port: Option<u32>,
    /// Ports bridged to provider physical networks, by physical network name.
    pub physical_ports: HashMap<String, u32>,
    pub state: NodeState,
}

impl Node {
    pub fn compute(hostname: impl Into<String>, bridge: impl Into<String>, data_ip: Ipv4Addr) -> Self {
        Node {
            hostname: hostname.into(),
            node_type: NodeType::Compute,
            integration_bridge: bridge.into(),
            data_ip: Some(data_ip),
            tunnel_port: Some(1),
            vlan_port: Some(2),
            uplink_port: None,
            physical_ports: HashMap::new(),
            state: NodeState::Complete,
        }
    }

    pub fn gateway(hostname: impl Into<String>, bridge: impl Into<String>, data_ip: Ipv4Addr) -> Self {
        Node {
            hostname: hostname.into(),
            node_type: NodeType::Gateway,
            integration_bridge: bridge.into(),
            data_ip: Some(data_ip),
            tunnel_port: Some(1),
            vlan_port: Some(2),
            uplink_port: Some(3),
            physical_ports: HashMap::new(),
            state: NodeState::Complete,
        }
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }

    pub fn with_physical_port(mut self, physical_network: impl Into<String>, port: u32) -> Self {
        self.physical_ports.insert(physical_network.into(), port);
        self
    }

    pub fn physical_port(&self, physical_network: &str) -> Option<u32> {
        self.physical_ports.get(physical_network).copied()
    }

    pub fn is_complete(&self) -> bool {
        self.state == NodeState::Complete
    }
}

/// Node lifecycle notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Complete(Node),
    Incomplete(Node),
}

impl NodeEvent {
    pub fn node(&self) -> &Node {
        match self {
            NodeEvent::Complete(node) | NodeEvent::Incomplete(node) => node,
        }
    }
}

pub trait NodeListener: Send + Sync {
    fn event(&self, event: &NodeEvent);
}

/// Per-node roles, ports and readiness.
pub trait NodeTopologyService: Send + Sync {
    fn node(&self, hostname: &str) -> Option<Node>;

    /// Look a node up by its integration bridge device id.
    fn node_by_device(&self, device_id: &str) -> Option<Node>;

    fn nodes(&self) -> Vec<Node>;

    fn complete_nodes(&self, node_type: NodeType) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes()
            .into_iter()
            .filter(|n| n.node_type == node_type && n.is_complete())
            .collect();
        nodes.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        nodes
    }

    /// Group id on compute nodes that load-balances to the gateways.
    fn gateway_group_id(&self, device_id: &str) -> u32;

    /// Gateway responsible for traffic keyed by `key` (an instance port id).
    /// Stable while the set of complete gateways does not change.
    fn select_gateway(&self, key: &str) -> Option<Node> {
        let gateways = self.complete_nodes(NodeType::Gateway);
        if gateways.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() % gateways.len() as u64) as usize;
        gateways.into_iter().nth(index)
    }

    fn add_listener(&self, listener: Arc<dyn NodeListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Single-process topology, driven by tests and host integrations.
#[derive(Default)]
pub struct InMemoryTopology {
    nodes: RwLock<HashMap<String, Node>>,
    listeners: ListenerRegistry<dyn NodeListener>,
}

impl InMemoryTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node. Announces a state change when the node becomes
    /// complete or stops being complete.
    pub fn upsert(&self, node: Node) {
        let previous = self
            .nodes
            .write()
            .unwrap()
            .insert(node.hostname.clone(), node.clone());
        let was_complete = previous.as_ref().is_some_and(Node::is_complete);

        let event = match (was_complete, node.is_complete()) {
            (false, true) => NodeEvent::Complete(node),
            (true, false) => NodeEvent::Incomplete(node),
            _ => return,
        };
        info!(hostname = %event.node().hostname, ?event, "node state changed");
        self.listeners.broadcast(|l| l.event(&event));
    }

    pub fn set_state(&self, hostname: &str, state: NodeState) {
        let node = self.nodes.read().unwrap().get(hostname).cloned();
        if let Some(node) = node {
            self.upsert(node.with_state(state));
        }
    }
}

impl NodeTopologyService for InMemoryTopology {
    fn node(&self, hostname: &str) -> Option<Node> {
        self.nodes.read().unwrap().get(hostname).cloned()
    }

    fn node_by_device(&self, device_id: &str) -> Option<Node> {
        self.nodes
            .read()
            .unwrap()
            .values()
            .find(|n| n.integration_bridge == device_id)
            .cloned()
    }

    fn nodes(&self) -> Vec<Node> {
        self.nodes.read().unwrap().values().cloned().collect()
    }

    fn gateway_group_id(&self, device_id: &str) -> u32 {
        let mut hasher = DefaultHasher::new();
        device_id.hash(&mut hasher);
        // Keep clear of the reserved high range.
        (hasher.finish() & 0x7fff_ffff) as u32
    }

    fn add_listener(&self, listener: Arc<dyn NodeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<NodeEvent>>);

    impl NodeListener for Recorder {
        fn event(&self, event: &NodeEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[test]
    fn test_complete_nodes_filters_state_and_type() {
        let topology = InMemoryTopology::new();
        topology.upsert(Node::compute("c2", "of:c2", Ipv4Addr::new(192, 168, 0, 2)));
        topology.upsert(Node::compute("c1", "of:c1", Ipv4Addr::new(192, 168, 0, 1)));
        topology.upsert(
            Node::compute("c3", "of:c3", Ipv4Addr::new(192, 168, 0, 3)).with_state(NodeState::Init),
        );
        topology.upsert(Node::gateway("g1", "of:g1", Ipv4Addr::new(192, 168, 0, 9)));

        let names: Vec<_> = topology
            .complete_nodes(NodeType::Compute)
            .into_iter()
            .map(|n| n.hostname)
            .collect();
        assert_eq!(names, vec!["c1", "c2"]);
        assert_eq!(
            topology.node_by_device("of:g1").map(|n| n.hostname),
            Some("g1".to_string())
        );
    }

    #[test]
    fn test_state_transitions_are_announced() {
        let topology = InMemoryTopology::new();
        let recorder = Arc::new(Recorder::default());
        topology.add_listener(recorder.clone());

        let node = Node::compute("c1", "of:c1", Ipv4Addr::new(192, 168, 0, 1));
        topology.upsert(node.clone());
        topology.upsert(node.clone());
        topology.set_state("c1", NodeState::Incomplete);

        let events = recorder.0.lock().unwrap();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], NodeEvent::Complete(_)));
        assert!(matches!(events[1], NodeEvent::Incomplete(_)));
    }

    #[test]
    fn test_select_gateway_is_stable() {
        let topology = InMemoryTopology::new();
        assert!(topology.select_gateway("p1").is_none());

        topology.upsert(Node::gateway("g1", "of:g1", Ipv4Addr::new(192, 168, 0, 9)));
        topology.upsert(Node::gateway("g2", "of:g2", Ipv4Addr::new(192, 168, 0, 10)));

        let first = topology.select_gateway("p1");
        assert!(first.is_some());
        assert_eq!(topology.select_gateway("p1"), first);
    }
}
