//! ARP handling.
//!
//! On compute nodes requests from instances are answered by proxy: the
//! router interface gateway IP resolves to the virtual gateway MAC and other
//! instance IPs of the same network resolve to their own MAC. On gateway
//! nodes requests from the external network for floating IPs and router
//! gateway IPs are answered, and replies from upstream routers teach us their
//! MAC.

use super::{Reconciler, ReconcilerContext};
use crate::config::ArpMode;
use crate::flow::{
    FlowRule, InboundPacket, PacketEmitter, PacketProcessor, Selector, Treatment, priority, table,
};
use crate::leadership::LeaderRole;
use crate::model::{MacAddr, Router};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol, EthernetRepr,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const ETHERNET_HEADER_SIZE: usize = 14;
const ARP_PACKET_SIZE: usize = 28;

/// Build an Ethernet/IPv4 ARP frame.
fn arp_frame(
    operation: ArpOperation,
    eth_dst: MacAddr,
    source: (MacAddr, Ipv4Addr),
    target: (MacAddr, Ipv4Addr),
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + ARP_PACKET_SIZE];
    let eth_repr = EthernetRepr {
        src_addr: source.0.into(),
        dst_addr: eth_dst.into(),
        ethertype: EthernetProtocol::Arp,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let arp_repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: source.0.into(),
        source_protocol_addr: source.1,
        target_hardware_addr: target.0.into(),
        target_protocol_addr: target.1,
    };
    arp_repr.emit(&mut ArpPacket::new_unchecked(eth_frame.payload_mut()));
    frame
}

/// Answers ARP requests and learns upstream router MACs.
pub struct ArpResponder {
    ctx: ReconcilerContext,
    emitter: Arc<dyn PacketEmitter>,
}

impl ArpResponder {
    pub fn new(ctx: ReconcilerContext, emitter: Arc<dyn PacketEmitter>) -> Self {
        ArpResponder { ctx, emitter }
    }

    /// MAC answering for `target_ip` on behalf of the instance `sender_mac`.
    fn proxy_target(&self, sender_mac: MacAddr, target_ip: Ipv4Addr) -> Option<MacAddr> {
        if self.ctx.config.arp_mode != ArpMode::Proxy {
            return None;
        }
        let Some(instance) = self.ctx.instance_ports.by_mac(sender_mac) else {
            trace!(%sender_mac, "ARP request from unknown host");
            return None;
        };
        let is_gateway = self
            .ctx
            .service
            .subnets_by_network(&instance.network_id)
            .iter()
            .any(|subnet| subnet.gateway_ip == Some(target_ip));
        if is_gateway {
            return Some(self.ctx.config.gateway_mac);
        }
        self.ctx
            .instance_ports
            .by_ip(target_ip, &instance.network_id)
            .map(|target| target.mac)
    }

    /// MAC answering for `target_ip` on the external side of `gateway`.
    fn gateway_target(&self, gateway: &Node, target_ip: Ipv4Addr) -> Option<MacAddr> {
        let floating = self
            .ctx
            .service
            .floating_ips()
            .into_iter()
            .find(|fip| fip.floating_ip == target_ip);
        if let Some(fip) = floating {
            let port_id = fip.port_id?;
            let serving = self.ctx.topology.select_gateway(&port_id)?;
            if serving.integration_bridge != gateway.integration_bridge {
                trace!(%target_ip, gateway = %gateway.hostname, "floating IP served elsewhere");
                return None;
            }
            return self.ctx.instance_ports.by_port_id(&port_id).map(|i| i.mac);
        }

        let is_router_gateway = self
            .ctx
            .service
            .routers()
            .iter()
            .any(|router| self.ctx.service.external_gateway_ip(router) == Some(target_ip));
        is_router_gateway.then_some(self.ctx.config.gateway_mac)
    }

    /// Ask the upstream router of `router` for its MAC from every gateway
    /// uplink. Returns false when the MAC is already known or nothing could
    /// be sent.
    pub fn probe_peer_router(&self, router: &Router) -> bool {
        let Some(peer) = self.ctx.service.derive_external_peer_router(router) else {
            return false;
        };
        if peer.mac.is_some() {
            return false;
        }
        let Some(source_ip) = self.ctx.service.external_gateway_ip(router) else {
            return false;
        };

        let mut sent = false;
        for gateway in self.ctx.topology.complete_nodes(NodeType::Gateway) {
            let Some(uplink) = gateway.uplink_port else {
                continue;
            };
            let frame = arp_frame(
                ArpOperation::Request,
                MacAddr::BROADCAST,
                (self.ctx.config.gateway_mac, source_ip),
                (MacAddr::ZERO, peer.ip),
            );
            debug!(peer = %peer.ip, gateway = %gateway.hostname, "Probing external peer router");
            self.emitter.emit(&gateway.integration_bridge, uplink, frame);
            sent = true;
        }
        sent
    }
}

impl PacketProcessor for ArpResponder {
    fn process(&self, packet: &InboundPacket) -> bool {
        if !self.ctx.gate.is_leader_for(LeaderRole::ArpResponder) {
            return false;
        }
        let Ok(eth) = EthernetFrame::new_checked(&packet.frame[..]) else {
            return false;
        };
        if eth.ethertype() != EthernetProtocol::Arp {
            return false;
        }
        let Some(ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_protocol_addr,
            ..
        }) = ArpPacket::new_checked(eth.payload())
            .ok()
            .and_then(|arp| ArpRepr::parse(&arp).ok())
        else {
            return false;
        };
        let sender_mac = MacAddr::from(source_hardware_addr);

        let Some(node) = self.ctx.topology.node_by_device(&packet.device_id) else {
            warn!(device = %packet.device_id, "ARP packet from unknown device");
            return false;
        };

        if operation == ArpOperation::Reply {
            if node.node_type != NodeType::Gateway || node.uplink_port != Some(packet.in_port) {
                return false;
            }
            if !self
                .ctx
                .service
                .update_external_peer_router_mac(source_protocol_addr, sender_mac)
            {
                debug!(sender = %source_protocol_addr, "ARP reply from unknown peer, ignoring");
            }
            return true;
        }
        if operation != ArpOperation::Request {
            return false;
        }

        let answer = match node.node_type {
            NodeType::Compute => self.proxy_target(sender_mac, target_protocol_addr),
            NodeType::Gateway => self.gateway_target(&node, target_protocol_addr),
        };
        let Some(answer) = answer else {
            return false;
        };

        debug!(
            requester = %source_protocol_addr,
            target = %target_protocol_addr,
            mac = %answer,
            "Answering ARP request"
        );
        let reply = arp_frame(
            ArpOperation::Reply,
            sender_mac,
            (answer, target_protocol_addr),
            (sender_mac, source_protocol_addr),
        );
        self.emitter.emit(&packet.device_id, packet.in_port, reply);
        true
    }
}

/// Punts ARP to the controller on every node as it becomes complete.
pub struct ArpRules {
    ctx: ReconcilerContext,
}

impl ArpRules {
    pub fn new(ctx: ReconcilerContext) -> Self {
        ArpRules { ctx }
    }

    pub fn rules_for(&self, node: &Node) -> Vec<FlowRule> {
        let table = match node.node_type {
            NodeType::Compute if self.ctx.config.arp_mode != ArpMode::Proxy => return Vec::new(),
            NodeType::Compute => table::DHCP_ARP,
            NodeType::Gateway => table::GW_COMMON,
        };
        vec![FlowRule::new(
            &node.integration_bridge,
            Selector::arp(),
            Treatment::new().punt(),
            priority::ARP_CONTROL,
            table,
        )]
    }
}

#[async_trait]
impl Reconciler for ArpRules {
    const NAME: &'static str = "arp";

    fn accepts(_event: &NetworkEvent) -> bool {
        false
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let NodeEvent::Complete(node) = event else {
            return;
        };
        if !self.ctx.gate.is_leader_for(LeaderRole::ArpResponder) {
            return;
        }
        let rules = self.rules_for(&node);
        if let Err(e) = self.ctx.apply(&rules, true).await {
            warn!(node = %node.hostname, error = %e, "Failed to install ARP rules");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkingConfig;
    use crate::model::{FloatingIp, InstancePort, NetworkType};
    use crate::test_util::packets::{arp_reply, arp_request, parse_arp};
    use crate::test_util::{EXTERNAL_GATEWAY_IP, EXTERNAL_PEER_IP, EXTERNAL_PEER_MAC, Fixture};
    use crate::topology::NodeTopologyService;

    const VM_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const VM_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 6);
    const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);

    fn two_instances(fx: &Fixture) -> (InstancePort, InstancePort) {
        fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
        let a = fx.instance(1, VM_A, "n1", "of:c1");
        let b = fx.instance(2, VM_B, "n1", "of:c2");
        fx.instance_ports.upsert(a.clone());
        fx.instance_ports.upsert(b.clone());
        (a, b)
    }

    fn from(device: &str, in_port: u32, frame: Vec<u8>) -> InboundPacket {
        InboundPacket {
            device_id: device.into(),
            in_port,
            frame,
        }
    }

    #[tokio::test]
    async fn test_gateway_ip_resolves_to_gateway_mac() {
        let fx = Fixture::new();
        let (a, _) = two_instances(&fx);
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());

        let request = arp_request(a.mac, VM_A, GATEWAY_IP);
        assert!(responder.process(&from("of:c1", a.port_number, request)));

        let frames = fx.emitter.take();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].device_id.as_str(), frames[0].port), ("of:c1", 11));
        let reply = parse_arp(&frames[0].frame).unwrap();
        assert!(reply.is_reply);
        assert_eq!(reply.sender_mac, fx.config.gateway_mac);
        assert_eq!(reply.sender_ip, GATEWAY_IP);
        assert_eq!(reply.target_mac, a.mac);
        assert_eq!(reply.eth_dst, a.mac);
    }

    #[tokio::test]
    async fn test_instance_ip_resolves_within_network() {
        let fx = Fixture::new();
        let (a, b) = two_instances(&fx);
        fx.tenant_network("n2", "s2", NetworkType::Vxlan, "200", "10.1.0.0/24");
        let other = fx.instance(3, Ipv4Addr::new(10, 1, 0, 7), "n2", "of:c1");
        fx.instance_ports.upsert(other.clone());
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());

        assert!(responder.process(&from("of:c1", 11, arp_request(a.mac, VM_A, VM_B))));
        let reply = parse_arp(&fx.emitter.take()[0].frame).unwrap();
        assert_eq!(reply.sender_mac, b.mac);

        let cross = arp_request(a.mac, VM_A, other.ip);
        assert!(!responder.process(&from("of:c1", 11, cross)));
        assert!(fx.emitter.frames().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_sender_and_broadcast_mode_are_ignored() {
        let fx = Fixture::new();
        two_instances(&fx);
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());
        let stranger = MacAddr([0x02, 0, 0, 0, 0, 0x99]);
        assert!(!responder.process(&from("of:c1", 20, arp_request(stranger, VM_A, GATEWAY_IP))));

        let fx = Fixture::with_config(NetworkingConfig {
            arp_mode: ArpMode::Broadcast,
            ..Default::default()
        });
        let (a, _) = two_instances(&fx);
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());
        assert!(!responder.process(&from("of:c1", 11, arp_request(a.mac, VM_A, GATEWAY_IP))));
        assert!(fx.emitter.frames().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_answers_floating_and_router_gateway_ips() {
        let fx = Fixture::new();
        let (a, _) = two_instances(&fx);
        fx.router("r1", Some(true));
        fx.attach("r1", "s1");
        let fip = Ipv4Addr::new(172, 24, 4, 20);
        fx.service
            .create_floating_ip(FloatingIp::new("f1", fip).associated("p1", VM_A))
            .unwrap();
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());
        let outside = MacAddr([0x52, 0x54, 0, 0, 0, 0x01]);

        let request = arp_request(outside, EXTERNAL_PEER_IP, fip);
        assert!(responder.process(&from("of:g1", 3, request)));
        let reply = parse_arp(&fx.emitter.take()[0].frame).unwrap();
        assert_eq!(reply.sender_mac, a.mac);
        assert_eq!(reply.sender_ip, fip);

        let request = arp_request(outside, EXTERNAL_PEER_IP, EXTERNAL_GATEWAY_IP);
        assert!(responder.process(&from("of:g1", 3, request)));
        let reply = parse_arp(&fx.emitter.take()[0].frame).unwrap();
        assert_eq!(reply.sender_mac, fx.config.gateway_mac);

        let request = arp_request(outside, EXTERNAL_PEER_IP, Ipv4Addr::new(172, 24, 4, 99));
        assert!(!responder.process(&from("of:g1", 3, request)));
    }

    #[tokio::test]
    async fn test_probe_and_learn_peer_router() {
        let fx = Fixture::new();
        let router = fx.router("r1", Some(true));
        let responder = ArpResponder::new(fx.ctx(), fx.emitter.clone());

        assert!(responder.probe_peer_router(&router));
        let frames = fx.emitter.take();
        assert_eq!(frames.len(), 1);
        assert_eq!((frames[0].device_id.as_str(), frames[0].port), ("of:g1", 3));
        let probe = parse_arp(&frames[0].frame).unwrap();
        assert!(!probe.is_reply);
        assert_eq!(probe.target_ip, EXTERNAL_PEER_IP);
        assert_eq!(probe.sender_ip, EXTERNAL_GATEWAY_IP);

        let reply = arp_reply(
            EXTERNAL_PEER_MAC,
            EXTERNAL_PEER_IP,
            fx.config.gateway_mac,
            EXTERNAL_GATEWAY_IP,
        );
        assert!(!responder.process(&from("of:g1", 1, reply.clone())));
        assert!(responder.process(&from("of:g1", 3, reply)));
        assert_eq!(
            fx.service.external_peer_router(EXTERNAL_PEER_IP).unwrap().mac,
            Some(EXTERNAL_PEER_MAC)
        );
        assert!(!responder.probe_peer_router(&router));
    }

    #[tokio::test]
    async fn test_rules_follow_node_type_and_mode() {
        let fx = Fixture::new();
        let mut rules = ArpRules::new(fx.ctx());
        for host in ["c1", "g1"] {
            let node = fx.topology.node(host).unwrap();
            rules.on_node_event(NodeEvent::Complete(node)).await;
        }
        let installed = fx.flows.installed();
        assert_eq!(installed.len(), 2);
        assert!(installed.iter().all(|r| r.priority == priority::ARP_CONTROL));

        let fx = Fixture::with_config(NetworkingConfig {
            arp_mode: ArpMode::Broadcast,
            ..Default::default()
        });
        let rules = ArpRules::new(fx.ctx());
        assert!(rules.rules_for(&fx.topology.node("c1").unwrap()).is_empty());
        assert_eq!(rules.rules_for(&fx.topology.node("g1").unwrap()).len(), 1);
    }
}
