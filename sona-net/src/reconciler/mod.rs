//! Reconcilers that turn network state changes into flow rules.
//!
//! Each reconciler owns a task that drains its private queue, so the events of
//! one reconciler are handled in order while different reconcilers make
//! progress independently. Listener callbacks only enqueue; all work, including
//! the leadership check, happens on the reconciler task.

pub mod arp;
pub mod dhcp;
pub mod floating_ip;
pub mod icmp;
pub mod routing;
pub mod security_group;
pub mod snat;
pub mod switching;

use crate::config::NetworkingConfig;
use crate::error::ReconcileError;
use crate::flow::{
    FlowProgram, FlowRule, InboundPacket, PacketEmitter, PacketProcessor, Selector, Treatment,
};
use crate::instance_port::{InstancePortEvent, InstancePortListener, InstancePortSource};
use crate::leadership::LeaderGate;
use crate::listener::ListenerId;
use crate::model::{ExternalPeerRouter, Network, NetworkType, Router, RouterInterface, Subnet};
use crate::nat::PortNumberAllocator;
use crate::service::{NetworkListener, NetworkService};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeListener, NodeTopologyService};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

pub use arp::{ArpResponder, ArpRules};
pub use dhcp::{DhcpResponder, DhcpRules};
pub use floating_ip::FloatingIpReconciler;
pub use icmp::{IcmpResponder, IcmpRules};
pub use routing::RoutingReconciler;
pub use security_group::SecurityGroupReconciler;
pub use snat::SnatResponder;
pub use switching::SwitchingReconciler;

/// A reconciler fed by the network, node and instance port streams.
///
/// Handlers take events by value and run on the reconciler's own task.
/// Per-item failures are logged by the reconciler and never end the task.
#[async_trait]
pub trait Reconciler: Send + 'static {
    /// Name used in logs.
    const NAME: &'static str;

    /// Cheap filter applied on the publishing thread before queueing.
    fn accepts(_event: &NetworkEvent) -> bool
    where
        Self: Sized,
    {
        true
    }

    async fn on_network_event(&mut self, _event: NetworkEvent) {}

    async fn on_node_event(&mut self, _event: NodeEvent) {}

    async fn on_instance_port_event(&mut self, _event: InstancePortEvent) {}
}

enum Input {
    Network(NetworkEvent),
    Node(NodeEvent),
    InstancePort(InstancePortEvent),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

struct NetworkForwarder {
    tx: mpsc::UnboundedSender<Input>,
    accepts: fn(&NetworkEvent) -> bool,
}

impl NetworkListener for NetworkForwarder {
    fn is_relevant(&self, event: &NetworkEvent) -> bool {
        (self.accepts)(event)
    }

    fn event(&self, event: &NetworkEvent) {
        let _ = self.tx.send(Input::Network(event.clone()));
    }
}

struct NodeForwarder(mpsc::UnboundedSender<Input>);

impl NodeListener for NodeForwarder {
    fn event(&self, event: &NodeEvent) {
        let _ = self.0.send(Input::Node(event.clone()));
    }
}

struct InstancePortForwarder(mpsc::UnboundedSender<Input>);

impl InstancePortListener for InstancePortForwarder {
    fn event(&self, event: &InstancePortEvent) {
        let _ = self.0.send(Input::InstancePort(event.clone()));
    }
}

/// Collaborators shared by every reconciler.
#[derive(Clone)]
pub struct ReconcilerContext {
    pub service: Arc<NetworkService>,
    pub topology: Arc<dyn NodeTopologyService>,
    pub instance_ports: Arc<dyn InstancePortSource>,
    pub flows: Arc<dyn FlowProgram>,
    pub gate: LeaderGate,
    pub config: Arc<NetworkingConfig>,
}

impl ReconcilerContext {
    /// Apply every rule, logging each failure. Returns the first failure after
    /// all rules were attempted.
    pub async fn apply(&self, rules: &[FlowRule], install: bool) -> Result<(), ReconcileError> {
        let mut first_error = None;
        for rule in rules {
            match self.flows.apply(rule, install).await {
                Ok(()) => trace!(%rule, install, "flow rule applied"),
                Err(e) => {
                    error!(%rule, install, error = %e, "Failed to apply flow rule");
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub fn network(&self, id: &str) -> Result<Network, ReconcileError> {
        self.service
            .network(id)
            .ok_or_else(|| ReconcileError::missing("network", id))
    }

    pub fn subnet(&self, id: &str) -> Result<Subnet, ReconcileError> {
        self.service
            .subnet(id)
            .ok_or_else(|| ReconcileError::missing("subnet", id))
    }

    pub fn node_of_device(&self, device_id: &str) -> Result<Node, ReconcileError> {
        self.topology
            .node_by_device(device_id)
            .ok_or_else(|| ReconcileError::missing("node", device_id))
    }

    /// Router attached to a subnet, with the attaching interface.
    pub fn router_of_subnet(&self, subnet_id: &str) -> Option<(Router, RouterInterface)> {
        self.service
            .router_interfaces()
            .into_iter()
            .filter(|iface| iface.subnet_id == subnet_id)
            .find_map(|iface| {
                self.service
                    .router(&iface.router_id)
                    .map(|router| (router, iface))
            })
    }

    /// Upstream router reached from a tenant network through its router's
    /// external gateway.
    pub fn peer_router_of_network(
        &self,
        network_id: &str,
    ) -> Result<ExternalPeerRouter, ReconcileError> {
        let router = self
            .service
            .subnets_by_network(network_id)
            .iter()
            .find_map(|subnet| self.router_of_subnet(&subnet.id))
            .map(|(router, _)| router)
            .ok_or_else(|| ReconcileError::missing("router for network", network_id))?;
        self.peer_router_of(&router)
    }

    /// Upstream router behind `router`'s external gateway. Only `router`
    /// itself is consulted, so a router that was already updated or detached
    /// in the store still resolves.
    pub fn peer_router_of(&self, router: &Router) -> Result<ExternalPeerRouter, ReconcileError> {
        let gateway = router
            .external_gateway
            .as_ref()
            .ok_or_else(|| ReconcileError::missing("external gateway of router", &router.id))?;
        self.service
            .external_peer_router_for_network(&gateway.network_id)
            .or_else(|| self.service.derive_external_peer_router(router))
            .ok_or_else(|| ReconcileError::missing("external peer router", &gateway.network_id))
    }
}

/// Tenant traffic isolation of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    Vxlan(u64),
    Vlan(u16),
}

impl Segment {
    /// Flat networks have no segment and are rejected here.
    pub fn of(network: &Network) -> Result<Self, ReconcileError> {
        let segment = match network.network_type {
            NetworkType::Vxlan => network.vni().map(Segment::Vxlan),
            NetworkType::Vlan => network.vlan_id().map(Segment::Vlan),
            NetworkType::Flat => None,
        };
        segment.ok_or_else(|| ReconcileError::UnsupportedNetworkType {
            network_id: network.id.clone(),
            network_type: network.network_type.to_string(),
        })
    }

    /// Add the segment match to a selector.
    pub fn matching(self, selector: Selector) -> Selector {
        match self {
            Segment::Vxlan(vni) => selector.tunnel_id(vni),
            Segment::Vlan(vlan) => selector.vlan_id(vlan),
        }
    }

    /// Port of `node` that carries this kind of segment between nodes.
    pub fn transport_port(self, node: &Node) -> Option<u32> {
        match self {
            Segment::Vxlan(_) => node.tunnel_port,
            Segment::Vlan(_) => node.vlan_port,
        }
    }

    /// Tag the packet with the segment.
    pub fn tagging(self, treatment: Treatment) -> Treatment {
        match self {
            Segment::Vxlan(vni) => treatment.set_tunnel_id(vni),
            Segment::Vlan(vlan) => treatment.push_vlan().set_vlan_id(vlan),
        }
    }
}

/// Running reconciler task and its listener registrations.
pub struct ReconcilerHandle {
    name: &'static str,
    tx: mpsc::UnboundedSender<Input>,
    task: JoinHandle<()>,
    service: Arc<NetworkService>,
    topology: Arc<dyn NodeTopologyService>,
    instance_ports: Arc<dyn InstancePortSource>,
    listener_ids: [ListenerId; 3],
}

impl ReconcilerHandle {
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Wait until every event queued before this call has been handled.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(Input::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop listening, drain the queue and wait for the task to finish.
    pub async fn shutdown(self) {
        let [network_id, node_id, port_id] = self.listener_ids;
        self.service.remove_listener(network_id);
        self.topology.remove_listener(node_id);
        self.instance_ports.remove_listener(port_id);

        let _ = self.tx.send(Input::Shutdown);
        if let Err(e) = self.task.await {
            error!(reconciler = self.name, error = %e, "Reconciler task failed");
        }
        debug!(reconciler = self.name, "Reconciler stopped");
    }
}

/// Subscribe `reconciler` to every stream of `ctx` and run it on its own task.
///
/// Must be called from within a tokio runtime.
pub fn spawn<R: Reconciler>(reconciler: R, ctx: &ReconcilerContext) -> ReconcilerHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let network_id = ctx.service.add_listener(Arc::new(NetworkForwarder {
        tx: tx.clone(),
        accepts: R::accepts,
    }));
    let node_id = ctx.topology.add_listener(Arc::new(NodeForwarder(tx.clone())));
    let port_id = ctx
        .instance_ports
        .add_listener(Arc::new(InstancePortForwarder(tx.clone())));

    let task = tokio::spawn(run(reconciler, rx));
    debug!(reconciler = R::NAME, "Reconciler started");

    ReconcilerHandle {
        name: R::NAME,
        tx,
        task,
        service: Arc::clone(&ctx.service),
        topology: Arc::clone(&ctx.topology),
        instance_ports: Arc::clone(&ctx.instance_ports),
        listener_ids: [network_id, node_id, port_id],
    }
}

async fn run<R: Reconciler>(mut reconciler: R, mut rx: mpsc::UnboundedReceiver<Input>) {
    while let Some(input) = rx.recv().await {
        match input {
            Input::Network(event) => reconciler.on_network_event(event).await,
            Input::Node(event) => reconciler.on_node_event(event).await,
            Input::InstancePort(event) => reconciler.on_instance_port_event(event).await,
            Input::Flush(ack) => {
                let _ = ack.send(());
            }
            Input::Shutdown => break,
        }
    }
}

/// Every reconciler of the networking core, started together.
pub struct ReconcilerSet {
    handles: Vec<ReconcilerHandle>,
}

impl ReconcilerSet {
    /// Enroll for every role and start the flow-programming reconcilers.
    ///
    /// Packet responders are built separately because they need a
    /// [`crate::flow::PacketEmitter`]; their punt rules are part of this set.
    pub fn start(ctx: &ReconcilerContext) -> Self {
        for role in crate::leadership::LeaderRole::ALL {
            ctx.gate.enroll(role);
        }

        let handles = vec![
            spawn(SwitchingReconciler::new(ctx.clone()), ctx),
            spawn(RoutingReconciler::new(ctx.clone()), ctx),
            spawn(FloatingIpReconciler::new(ctx.clone()), ctx),
            spawn(SecurityGroupReconciler::new(ctx.clone()), ctx),
            spawn(ArpRules::new(ctx.clone()), ctx),
            spawn(IcmpRules::new(ctx.clone()), ctx),
            spawn(DhcpRules::new(ctx.clone()), ctx),
        ];
        ReconcilerSet { handles }
    }

    pub fn handles(&self) -> &[ReconcilerHandle] {
        &self.handles
    }

    /// Flush every reconciler queue.
    pub async fn flush(&self) {
        for handle in &self.handles {
            handle.flush().await;
        }
    }

    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
    }
}

/// Packet-in handlers in dispatch order; the first to consume a packet wins.
pub struct PacketResponders {
    processors: Vec<Arc<dyn PacketProcessor>>,
}

impl PacketResponders {
    pub fn new(
        ctx: &ReconcilerContext,
        emitter: Arc<dyn PacketEmitter>,
        allocator: Arc<PortNumberAllocator>,
    ) -> Self {
        let processors: Vec<Arc<dyn PacketProcessor>> = vec![
            Arc::new(ArpResponder::new(ctx.clone(), Arc::clone(&emitter))),
            Arc::new(DhcpResponder::new(ctx.clone(), Arc::clone(&emitter))),
            Arc::new(IcmpResponder::new(ctx.clone(), Arc::clone(&emitter))),
            Arc::new(SnatResponder::new(ctx.clone(), emitter, allocator)),
        ];
        PacketResponders { processors }
    }
}

impl PacketProcessor for PacketResponders {
    fn process(&self, packet: &InboundPacket) -> bool {
        let consumed = self.processors.iter().any(|p| p.process(packet));
        if !consumed {
            trace!(device_id = %packet.device_id, in_port = packet.in_port, "Packet not consumed");
        }
        consumed
    }
}
