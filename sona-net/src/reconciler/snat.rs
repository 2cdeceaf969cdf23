//! Reactive SNAT on gateway nodes.
//!
//! The first packet of an outbound TCP/UDP flow is punted by the gateway
//! rules installed in [`super::routing`]. The responder leases a transport
//! port, sends the translated packet upstream and installs the pair of rules
//! that carries the rest of the flow in both directions without the
//! controller.

use super::{ReconcilerContext, Segment};
use crate::error::ReconcileError;
use crate::flow::{
    FlowRule, InboundPacket, PacketEmitter, PacketProcessor, PortMatch, Selector, Treatment, host,
    priority, table,
};
use crate::leadership::LeaderRole;
use crate::model::{ExternalPeerRouter, InstancePort, MacAddr};
use crate::nat::PortNumberAllocator;
use crate::topology::NodeType;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, IpAddress, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const VLAN_TPID: [u8; 2] = [0x81, 0x00];

/// Five-tuple of the punted packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Flow {
    src_mac: MacAddr,
    protocol: IpProtocol,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
}

impl Flow {
    fn parse(frame: &[u8]) -> Option<Flow> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        let (src_port, dst_port) = match ip.next_header() {
            IpProtocol::Tcp => {
                let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
                (tcp.src_port(), tcp.dst_port())
            }
            IpProtocol::Udp => {
                let udp = UdpPacket::new_checked(ip.payload()).ok()?;
                (udp.src_port(), udp.dst_port())
            }
            _ => return None,
        };
        Some(Flow {
            src_mac: eth.src_addr().into(),
            protocol: ip.next_header(),
            src_ip: ip.src_addr(),
            dst_ip: ip.dst_addr(),
            src_port,
            dst_port,
        })
    }
}

/// Outcome of translating one punted packet.
#[derive(Debug, Clone)]
pub struct SnatTranslation {
    pub nat_ip: Ipv4Addr,
    pub nat_port: u16,
    /// Downstream and upstream rules for every complete gateway.
    pub rules: Vec<FlowRule>,
}

pub struct SnatResponder {
    ctx: ReconcilerContext,
    emitter: Arc<dyn PacketEmitter>,
    allocator: Arc<PortNumberAllocator>,
}

impl SnatResponder {
    pub fn new(
        ctx: ReconcilerContext,
        emitter: Arc<dyn PacketEmitter>,
        allocator: Arc<PortNumberAllocator>,
    ) -> Self {
        SnatResponder {
            ctx,
            emitter,
            allocator,
        }
    }

    /// Translate the first packet of a flow and send it out of the uplink.
    ///
    /// Returns `Ok(None)` for packets that are not SNAT candidates and when
    /// the port pool is exhausted; the packet is dropped in both cases.
    pub fn translate(
        &self,
        packet: &InboundPacket,
    ) -> Result<Option<SnatTranslation>, ReconcileError> {
        let Some(flow) = Flow::parse(&packet.frame) else {
            trace!(device = %packet.device_id, "not a TCP/UDP packet, ignoring");
            return Ok(None);
        };

        let instance = self
            .ctx
            .instance_ports
            .by_mac(flow.src_mac)
            .ok_or_else(|| ReconcileError::missing("instance port", flow.src_mac.to_string()))?;
        let port = self
            .ctx
            .service
            .port(&instance.port_id)
            .ok_or_else(|| ReconcileError::missing("port", &instance.port_id))?;
        let subnet_id = port
            .fixed_ips
            .iter()
            .find(|fixed| fixed.ip == flow.src_ip)
            .map(|fixed| fixed.subnet_id.clone())
            .ok_or_else(|| ReconcileError::missing("fixed ip", flow.src_ip.to_string()))?;
        let (router, _) = self
            .ctx
            .router_of_subnet(&subnet_id)
            .ok_or_else(|| ReconcileError::missing("router for subnet", &subnet_id))?;
        if !router.snat_enabled() {
            debug!(router_id = %router.id, "SNAT disabled, dropping packet");
            return Ok(None);
        }
        let nat_ip = self
            .ctx
            .service
            .external_gateway_ip(&router)
            .ok_or_else(|| ReconcileError::missing("external gateway ip of router", &router.id))?;
        let peer = self.ctx.peer_router_of(&router)?;
        let peer_mac = peer
            .mac
            .ok_or_else(|| ReconcileError::missing("external peer router mac", peer.ip.to_string()))?;
        let segment = Segment::of(&self.ctx.network(&instance.network_id)?)?;
        let uplink = self
            .ctx
            .node_of_device(&packet.device_id)?
            .uplink_port
            .ok_or_else(|| ReconcileError::missing("uplink port of", &packet.device_id))?;

        let Some(nat_port) = self.allocator.allocate() else {
            return Ok(None);
        };

        let rules = match self.rules(&flow, &instance, segment, &peer, nat_ip, nat_port) {
            Ok(rules) => rules,
            Err(e) => {
                self.allocator.release(nat_port);
                return Err(e);
            }
        };

        match rewrite_upstream(
            &packet.frame,
            nat_ip,
            nat_port,
            self.ctx.config.gateway_mac,
            peer_mac,
            peer.vlan_id,
        ) {
            Some(frame) => self.emitter.emit(&packet.device_id, uplink, frame),
            None => warn!(device = %packet.device_id, "Failed to rewrite SNAT packet"),
        }

        debug!(
            src = %flow.src_ip,
            dst = %flow.dst_ip,
            %nat_ip,
            nat_port,
            "SNAT flow translated"
        );
        Ok(Some(SnatTranslation {
            nat_ip,
            nat_port,
            rules,
        }))
    }

    fn rules(
        &self,
        flow: &Flow,
        instance: &InstancePort,
        segment: Segment,
        peer: &ExternalPeerRouter,
        nat_ip: Ipv4Addr,
        nat_port: u16,
    ) -> Result<Vec<FlowRule>, ReconcileError> {
        let source = self.ctx.node_of_device(&instance.device_id)?;
        let protocol = u8::from(flow.protocol);

        let mut down_selector = Selector::ipv4()
            .ip_proto(protocol)
            .ip_dst(host(nat_ip))
            .ip_src(host(flow.dst_ip))
            .tp_src(PortMatch::exact(flow.dst_port))
            .tp_dst(PortMatch::exact(nat_port));
        let mut down = Treatment::new();
        if let Some(vlan) = peer.vlan_id {
            down_selector = down_selector.vlan_id(vlan);
            down = down.pop_vlan();
        }
        let down = segment.tagging(
            down.set_eth_dst(instance.mac)
                .set_ip_dst(flow.src_ip)
                .set_tp_dst(flow.src_port),
        );

        let up_selector = segment.matching(
            Selector::ipv4()
                .ip_proto(protocol)
                .ip_src(host(flow.src_ip))
                .ip_dst(host(flow.dst_ip))
                .tp_src(PortMatch::exact(flow.src_port))
                .tp_dst(PortMatch::exact(flow.dst_port)),
        );
        let mut up = match segment {
            Segment::Vxlan(_) => Treatment::new(),
            Segment::Vlan(_) => Treatment::new().pop_vlan(),
        };
        up = up
            .set_tp_src(nat_port)
            .set_eth_src(self.ctx.config.gateway_mac);
        if let Some(mac) = peer.mac {
            up = up.set_eth_dst(mac);
        }
        if let Some(vlan) = peer.vlan_id {
            up = up.push_vlan().set_vlan_id(vlan);
        }
        let up = up.set_ip_src(nat_ip);

        let mut rules = Vec::new();
        for gateway in self.ctx.topology.complete_nodes(NodeType::Gateway) {
            let to_instance = match segment {
                Segment::Vxlan(_) => match (source.data_ip, gateway.tunnel_port) {
                    (Some(data_ip), Some(port)) => {
                        Some(down.clone().set_tunnel_dst(data_ip).output(port))
                    }
                    _ => None,
                },
                Segment::Vlan(_) => gateway.vlan_port.map(|port| down.clone().output(port)),
            };
            if let Some(treatment) = to_instance {
                rules.push(FlowRule::new(
                    &gateway.integration_bridge,
                    down_selector.clone(),
                    treatment,
                    priority::SNAT,
                    table::GW_COMMON,
                ));
            }
            if let Some(uplink) = gateway.uplink_port {
                rules.push(FlowRule::new(
                    &gateway.integration_bridge,
                    up_selector.clone(),
                    up.clone().output(uplink),
                    priority::SNAT,
                    table::GW_COMMON,
                ));
            }
        }
        Ok(rules)
    }
}

impl PacketProcessor for SnatResponder {
    fn process(&self, packet: &InboundPacket) -> bool {
        if self.ctx.config.use_stateful_snat || !self.ctx.gate.is_leader_for(LeaderRole::Routing) {
            return false;
        }
        let on_gateway = self
            .ctx
            .topology
            .node_by_device(&packet.device_id)
            .is_some_and(|node| node.node_type == NodeType::Gateway);
        if !on_gateway {
            return false;
        }
        match self.translate(packet) {
            Ok(Some(translation)) => {
                let ctx = self.ctx.clone();
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn(async move {
                            if let Err(e) = ctx.apply(&translation.rules, true).await {
                                warn!(
                                    nat_port = translation.nat_port,
                                    error = %e,
                                    "Failed to install SNAT rules"
                                );
                            }
                        });
                    }
                    Err(_) => warn!("No runtime to install SNAT rules on"),
                }
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(device = %packet.device_id, error = %e, "Failed to translate SNAT packet");
                true
            }
        }
    }
}

/// Rewrite source address and port, re-address the frame to the peer router
/// and tag it with the peer VLAN if there is one.
fn rewrite_upstream(
    frame: &[u8],
    nat_ip: Ipv4Addr,
    nat_port: u16,
    src_mac: MacAddr,
    dst_mac: MacAddr,
    vlan: Option<u16>,
) -> Option<Vec<u8>> {
    let mut out = frame.to_vec();
    {
        let mut eth = EthernetFrame::new_checked(&mut out[..]).ok()?;
        eth.set_src_addr(src_mac.into());
        eth.set_dst_addr(dst_mac.into());

        let mut ip = Ipv4Packet::new_checked(eth.payload_mut()).ok()?;
        let dst_ip = ip.dst_addr();
        ip.set_src_addr(nat_ip);
        let (src, dst) = (IpAddress::Ipv4(nat_ip), IpAddress::Ipv4(dst_ip));
        match ip.next_header() {
            IpProtocol::Tcp => {
                let mut tcp = TcpPacket::new_checked(ip.payload_mut()).ok()?;
                tcp.set_src_port(nat_port);
                tcp.fill_checksum(&src, &dst);
            }
            IpProtocol::Udp => {
                let mut udp = UdpPacket::new_checked(ip.payload_mut()).ok()?;
                udp.set_src_port(nat_port);
                udp.fill_checksum(&src, &dst);
            }
            _ => return None,
        }
        ip.fill_checksum();
    }

    if let Some(vlan) = vlan {
        let mut tagged = Vec::with_capacity(out.len() + 4);
        tagged.extend_from_slice(&out[..12]);
        tagged.extend_from_slice(&VLAN_TPID);
        tagged.extend_from_slice(&(vlan & 0x0fff).to_be_bytes());
        tagged.extend_from_slice(&out[12..]);
        out = tagged;
    }
    Some(out)
}
