//! ICMP echo on gateway nodes.
//!
//! Echo requests for a router interface gateway are answered locally. Echo
//! requests for anything else leave through the router's external gateway
//! IP; the matching reply is mapped back to the instance by a correlation
//! entry keyed by (identifier, external gateway IP, remote IP).

use super::{Reconciler, ReconcilerContext};
use crate::error::ReconcileError;
use crate::flow::{
    FlowRule, ICMP_ECHO_REPLY, IP_PROTO_ICMP, InboundPacket, PacketEmitter, PacketProcessor,
    Selector, Treatment, priority, table,
};
use crate::leadership::LeaderRole;
use crate::model::{InstancePort, MacAddr};
use crate::nat::{Clock, SystemClock};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use lru::LruCache;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, EthernetRepr, Icmpv4Packet, Icmpv4Repr, IpProtocol,
    Ipv4Packet, Ipv4Repr,
};
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};

const ETHERNET_HEADER_SIZE: usize = 14;
const IPV4_HEADER_SIZE: usize = 20;
const VLAN_TPID: [u8; 2] = [0x81, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct EchoKey {
    ident: u16,
    nat_ip: Ipv4Addr,
    remote_ip: Ipv4Addr,
}

struct PendingEcho {
    instance: InstancePort,
    sent_ms: i64,
}

/// Echo fields carried over from the request.
struct Echo<'a> {
    ident: u16,
    seq_no: u16,
    data: &'a [u8],
}

/// Build an Ethernet/IPv4/ICMP echo frame, optionally 802.1Q tagged.
fn echo_frame(
    (src_mac, dst_mac): (MacAddr, MacAddr),
    (src_ip, dst_ip): (Ipv4Addr, Ipv4Addr),
    repr: Icmpv4Repr<'_>,
    vlan: Option<u16>,
) -> Vec<u8> {
    let icmp_len = repr.buffer_len();
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + icmp_len];
    let caps = ChecksumCapabilities::default();

    let eth_repr = EthernetRepr {
        src_addr: src_mac.into(),
        dst_addr: dst_mac.into(),
        ethertype: EthernetProtocol::Ipv4,
    };
    let mut eth_frame = EthernetFrame::new_unchecked(&mut frame[..]);
    eth_repr.emit(&mut eth_frame);

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Icmp,
        payload_len: icmp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &caps);
    repr.emit(&mut Icmpv4Packet::new_unchecked(ip_packet.payload_mut()), &caps);

    match vlan {
        Some(vlan) => {
            let mut tagged = Vec::with_capacity(frame.len() + 4);
            tagged.extend_from_slice(&frame[..12]);
            tagged.extend_from_slice(&VLAN_TPID);
            tagged.extend_from_slice(&(vlan & 0x0fff).to_be_bytes());
            tagged.extend_from_slice(&frame[12..]);
            tagged
        }
        None => frame,
    }
}

/// Drop one 802.1Q tag if present.
fn untagged(frame: &[u8]) -> Vec<u8> {
    if frame.len() >= ETHERNET_HEADER_SIZE + 4 && frame[12..14] == VLAN_TPID {
        let mut out = frame[..12].to_vec();
        out.extend_from_slice(&frame[16..]);
        out
    } else {
        frame.to_vec()
    }
}

pub struct IcmpResponder {
    ctx: ReconcilerContext,
    emitter: Arc<dyn PacketEmitter>,
    clock: Arc<dyn Clock>,
    pending: Mutex<LruCache<EchoKey, PendingEcho>>,
}

impl IcmpResponder {
    pub fn new(ctx: ReconcilerContext, emitter: Arc<dyn PacketEmitter>) -> Self {
        Self::with_clock(ctx, emitter, Arc::new(SystemClock))
    }

    pub fn with_clock(
        ctx: ReconcilerContext,
        emitter: Arc<dyn PacketEmitter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let capacity = NonZeroUsize::new(ctx.config.icmp_correlation_capacity)
            .unwrap_or(NonZeroUsize::MIN);
        IcmpResponder {
            ctx,
            emitter,
            clock,
            pending: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Number of external echo requests awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    fn expired(&self, sent_ms: i64) -> bool {
        let ttl = i64::try_from(self.ctx.config.icmp_correlation_ttl_ms).unwrap_or(i64::MAX);
        self.clock.now_ms() - sent_ms > ttl
    }

    fn echo_request(
        &self,
        gateway: &Node,
        src_mac: MacAddr,
        (src_ip, dst_ip): (Ipv4Addr, Ipv4Addr),
        echo: Echo<'_>,
    ) -> Result<bool, ReconcileError> {
        let Some(instance) = self.ctx.instance_ports.by_mac(src_mac) else {
            debug!(%src_mac, "echo request from unknown host, ignoring");
            return Ok(false);
        };
        let port = self
            .ctx
            .service
            .port(&instance.port_id)
            .ok_or_else(|| ReconcileError::missing("port", &instance.port_id))?;
        let subnet_id = port
            .fixed_ips
            .iter()
            .find(|fixed| fixed.ip == src_ip)
            .map(|fixed| fixed.subnet_id.clone())
            .ok_or_else(|| ReconcileError::missing("fixed ip", src_ip.to_string()))?;
        let (router, _) = self
            .ctx
            .router_of_subnet(&subnet_id)
            .ok_or_else(|| ReconcileError::missing("router for subnet", &subnet_id))?;

        let is_router_gateway = self
            .ctx
            .service
            .router_interfaces_of(&router.id)
            .iter()
            .filter_map(|iface| self.ctx.service.subnet(&iface.subnet_id))
            .any(|subnet| subnet.gateway_ip == Some(dst_ip));
        if is_router_gateway {
            let reply = echo_frame(
                (self.ctx.config.gateway_mac, instance.mac),
                (dst_ip, src_ip),
                Icmpv4Repr::EchoReply {
                    ident: echo.ident,
                    seq_no: echo.seq_no,
                    data: echo.data,
                },
                None,
            );
            trace!(%src_ip, %dst_ip, ident = echo.ident, "answering echo request for gateway");
            self.emitter
                .emit(&instance.device_id, instance.port_number, reply);
            return Ok(true);
        }

        if router.external_gateway.is_none() {
            debug!(router_id = %router.id, "no external gateway, dropping echo request");
            return Ok(false);
        }
        let nat_ip = self
            .ctx
            .service
            .external_gateway_ip(&router)
            .ok_or_else(|| ReconcileError::missing("external gateway ip of router", &router.id))?;
        let peer = self.ctx.peer_router_of_network(&instance.network_id)?;
        let peer_mac = peer
            .mac
            .ok_or_else(|| ReconcileError::missing("external peer router mac", peer.ip.to_string()))?;
        let uplink = gateway
            .uplink_port
            .ok_or_else(|| ReconcileError::missing("uplink port of", &gateway.hostname))?;

        let key = EchoKey {
            ident: echo.ident,
            nat_ip,
            remote_ip: dst_ip,
        };
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.peek(&key)
                && !self.expired(existing.sent_ms)
            {
                warn!(ident = echo.ident, remote = %dst_ip, "Duplicate echo request in flight, dropping");
                return Ok(false);
            }
            pending.put(
                key,
                PendingEcho {
                    instance,
                    sent_ms: self.clock.now_ms(),
                },
            );
        }

        let request = echo_frame(
            (self.ctx.config.gateway_mac, peer_mac),
            (nat_ip, dst_ip),
            Icmpv4Repr::EchoRequest {
                ident: echo.ident,
                seq_no: echo.seq_no,
                data: echo.data,
            },
            peer.vlan_id,
        );
        debug!(%src_ip, remote = %dst_ip, %nat_ip, ident = echo.ident, "Forwarding echo request");
        self.emitter
            .emit(&gateway.integration_bridge, uplink, request);
        Ok(true)
    }

    fn echo_reply(&self, (src_ip, dst_ip): (Ipv4Addr, Ipv4Addr), echo: Echo<'_>) -> bool {
        let key = EchoKey {
            ident: echo.ident,
            nat_ip: dst_ip,
            remote_ip: src_ip,
        };
        let Some(pending) = self.pending.lock().unwrap().pop(&key) else {
            trace!(ident = echo.ident, remote = %src_ip, "no pending echo for reply");
            return false;
        };
        if self.expired(pending.sent_ms) {
            debug!(ident = echo.ident, remote = %src_ip, "echo correlation expired");
            return false;
        }

        let instance = pending.instance;
        let reply = echo_frame(
            (self.ctx.config.gateway_mac, instance.mac),
            (src_ip, instance.ip),
            Icmpv4Repr::EchoReply {
                ident: echo.ident,
                seq_no: echo.seq_no,
                data: echo.data,
            },
            None,
        );
        self.emitter
            .emit(&instance.device_id, instance.port_number, reply);
        true
    }
}

impl PacketProcessor for IcmpResponder {
    fn process(&self, packet: &InboundPacket) -> bool {
        if !self.ctx.gate.is_leader_for(LeaderRole::IcmpResponder) {
            return false;
        }
        let Some(gateway) = self.ctx.topology.node_by_device(&packet.device_id) else {
            return false;
        };
        if gateway.node_type != NodeType::Gateway || !gateway.is_complete() {
            return false;
        }

        let frame = untagged(&packet.frame);
        let Ok(eth) = EthernetFrame::new_checked(&frame[..]) else {
            return false;
        };
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return false;
        }
        let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
            return false;
        };
        if ip.next_header() != IpProtocol::Icmp {
            return false;
        }
        let Ok(icmp) = Icmpv4Packet::new_checked(ip.payload()) else {
            return false;
        };
        let Ok(repr) = Icmpv4Repr::parse(&icmp, &ChecksumCapabilities::default()) else {
            trace!(device = %packet.device_id, "malformed ICMP packet");
            return false;
        };
        let addrs = (ip.src_addr(), ip.dst_addr());

        match repr {
            Icmpv4Repr::EchoRequest {
                ident,
                seq_no,
                data,
            } => {
                let echo = Echo {
                    ident,
                    seq_no,
                    data,
                };
                match self.echo_request(&gateway, eth.src_addr().into(), addrs, echo) {
                    Ok(handled) => handled,
                    Err(e) => {
                        warn!(src = %addrs.0, dst = %addrs.1, error = %e, "Failed to handle echo request");
                        false
                    }
                }
            }
            Icmpv4Repr::EchoReply {
                ident,
                seq_no,
                data,
            } => self.echo_reply(
                addrs,
                Echo {
                    ident,
                    seq_no,
                    data,
                },
            ),
            _ => false,
        }
    }
}

/// Punts echo replies from the external network on gateway nodes.
pub struct IcmpRules {
    ctx: ReconcilerContext,
}

impl IcmpRules {
    pub fn new(ctx: ReconcilerContext) -> Self {
        IcmpRules { ctx }
    }

    fn echo_reply_rule(node: &Node) -> FlowRule {
        FlowRule::new(
            &node.integration_bridge,
            Selector::ipv4()
                .ip_proto(IP_PROTO_ICMP)
                .icmp_type(ICMP_ECHO_REPLY),
            Treatment::new().punt(),
            priority::INTERNAL_ROUTING,
            table::GW_COMMON,
        )
    }
}

#[async_trait]
impl Reconciler for IcmpRules {
    const NAME: &'static str = "icmp";

    fn accepts(_event: &NetworkEvent) -> bool {
        false
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let NodeEvent::Complete(node) = event else {
            return;
        };
        if node.node_type != NodeType::Gateway
            || !self.ctx.gate.is_leader_for(LeaderRole::IcmpResponder)
        {
            return;
        }
        let rule = Self::echo_reply_rule(&node);
        if let Err(e) = self.ctx.apply(&[rule], true).await {
            warn!(node = %node.hostname, error = %e, "Failed to install ICMP rules");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkingConfig;
    use crate::model::NetworkType;
    use crate::nat::ManualClock;
    use crate::test_util::packets::{icmp_echo_reply, icmp_echo_request, parse_icmp_echo};
    use crate::test_util::{EXTERNAL_GATEWAY_IP, EXTERNAL_PEER_MAC, Fixture};
    use crate::topology::NodeTopologyService;

    const VM_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(8, 8, 8, 8);

    fn setup(fx: &Fixture, snat: Option<bool>) -> InstancePort {
        fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
        let router = fx.router("r1", snat);
        fx.attach("r1", "s1");
        if snat.is_some() {
            fx.learn_peer_mac(&router);
        }
        let vm = fx.instance(1, VM_IP, "n1", "of:c1");
        fx.instance_ports.upsert(vm.clone());
        vm
    }

    fn at_gateway(in_port: u32, frame: Vec<u8>) -> InboundPacket {
        InboundPacket {
            device_id: "of:g1".into(),
            in_port,
            frame,
        }
    }

    fn ping_out(fx: &Fixture, vm: &InstancePort, dst: Ipv4Addr, ident: u16) -> InboundPacket {
        at_gateway(
            1,
            icmp_echo_request(vm.mac, fx.config.gateway_mac, VM_IP, dst, ident, 1),
        )
    }

    fn pong_in(fx: &Fixture, ident: u16) -> InboundPacket {
        at_gateway(
            3,
            icmp_echo_reply(
                EXTERNAL_PEER_MAC,
                fx.config.gateway_mac,
                REMOTE,
                EXTERNAL_GATEWAY_IP,
                ident,
                1,
            ),
        )
    }

    #[tokio::test]
    async fn test_router_gateways_answer_locally() {
        let fx = Fixture::new();
        let vm = setup(&fx, None);
        fx.tenant_network("n2", "s2", NetworkType::Vxlan, "200", "10.1.0.0/24");
        fx.attach("r1", "s2");
        let responder = IcmpResponder::new(fx.ctx(), fx.emitter.clone());

        for gateway in [Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 1, 0, 1)] {
            assert!(responder.process(&ping_out(&fx, &vm, gateway, 9)));
            let frames = fx.emitter.take();
            assert_eq!(frames.len(), 1);
            assert_eq!((frames[0].device_id.as_str(), frames[0].port), ("of:c1", 11));
            let reply = parse_icmp_echo(&frames[0].frame).unwrap();
            assert!(reply.is_reply);
            assert_eq!((reply.src_ip, reply.dst_ip), (gateway, VM_IP));
            assert_eq!((reply.src_mac, reply.dst_mac), (fx.config.gateway_mac, vm.mac));
            assert_eq!((reply.ident, reply.seq_no), (9, 1));
            assert!(reply.checksum_valid);
        }
        assert_eq!(responder.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_external_echo_round_trip() {
        let fx = Fixture::new();
        let vm = setup(&fx, Some(true));
        let responder = IcmpResponder::new(fx.ctx(), fx.emitter.clone());

        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 7)));
        let frames = fx.emitter.take();
        assert_eq!((frames[0].device_id.as_str(), frames[0].port), ("of:g1", 3));
        let request = parse_icmp_echo(&frames[0].frame).unwrap();
        assert!(!request.is_reply);
        assert_eq!((request.src_ip, request.dst_ip), (EXTERNAL_GATEWAY_IP, REMOTE));
        assert_eq!(request.dst_mac, EXTERNAL_PEER_MAC);
        assert!(request.checksum_valid);
        assert_eq!(responder.pending_count(), 1);

        assert!(responder.process(&pong_in(&fx, 7)));
        let frames = fx.emitter.take();
        assert_eq!((frames[0].device_id.as_str(), frames[0].port), ("of:c1", 11));
        let reply = parse_icmp_echo(&frames[0].frame).unwrap();
        assert_eq!((reply.src_ip, reply.dst_ip), (REMOTE, VM_IP));
        assert!(reply.checksum_valid);

        assert_eq!(responder.pending_count(), 0);
        assert!(!responder.process(&pong_in(&fx, 7)));
    }

    #[tokio::test]
    async fn test_duplicate_request_is_dropped() {
        let fx = Fixture::new();
        let vm = setup(&fx, Some(true));
        let responder = IcmpResponder::new(fx.ctx(), fx.emitter.clone());

        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 7)));
        assert!(!responder.process(&ping_out(&fx, &vm, REMOTE, 7)));
        assert_eq!(fx.emitter.frames().len(), 1);
    }

    #[tokio::test]
    async fn test_correlation_expires() {
        let fx = Fixture::new();
        let vm = setup(&fx, Some(true));
        let clock = Arc::new(ManualClock::new(0));
        let responder = IcmpResponder::with_clock(fx.ctx(), fx.emitter.clone(), clock.clone());

        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 7)));
        clock.advance(60_001);
        assert!(!responder.process(&pong_in(&fx, 7)));
        assert_eq!(responder.pending_count(), 0);

        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 8)));
        clock.advance(60_001);
        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 8)));
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let fx = Fixture::with_config(NetworkingConfig {
            icmp_correlation_capacity: 1,
            ..Default::default()
        });
        let vm = setup(&fx, Some(true));
        let responder = IcmpResponder::new(fx.ctx(), fx.emitter.clone());

        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 1)));
        assert!(responder.process(&ping_out(&fx, &vm, REMOTE, 2)));
        assert_eq!(responder.pending_count(), 1);
        assert!(!responder.process(&pong_in(&fx, 1)));
        assert!(responder.process(&pong_in(&fx, 2)));
    }

    #[tokio::test]
    async fn test_compute_nodes_and_unknown_hosts_are_ignored() {
        let fx = Fixture::new();
        let vm = setup(&fx, Some(true));
        let responder = IcmpResponder::new(fx.ctx(), fx.emitter.clone());

        let mut packet = ping_out(&fx, &vm, REMOTE, 7);
        packet.device_id = "of:c1".into();
        assert!(!responder.process(&packet));

        let stranger = MacAddr([0x02, 0, 0, 0, 0, 0x42]);
        let frame = icmp_echo_request(stranger, fx.config.gateway_mac, VM_IP, REMOTE, 7, 1);
        assert!(!responder.process(&at_gateway(1, frame)));
        assert!(fx.emitter.frames().is_empty());
    }

    #[tokio::test]
    async fn test_echo_reply_punt_on_gateways_only() {
        let fx = Fixture::new();
        let mut rules = IcmpRules::new(fx.ctx());
        for host in ["c1", "c2", "g1"] {
            let node = fx.topology.node(host).unwrap();
            rules.on_node_event(NodeEvent::Complete(node)).await;
        }
        let installed = fx.flows.installed();
        assert_eq!(installed.len(), 1);
        assert_eq!(installed[0].device_id, "of:g1");
        assert_eq!(installed[0].selector.icmp_type, Some(ICMP_ECHO_REPLY));
    }
}
