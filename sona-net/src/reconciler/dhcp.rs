//! DHCPv4 server for tenant ports.
//!
//! Addresses come from the port's first fixed IP; the rest of the lease
//! (mask, router, routes) comes from that IP's subnet. Requests are punted
//! by a rule installed on every compute node.

use super::{Reconciler, ReconcilerContext};
use crate::flow::{
    DHCP_CLIENT_PORT, DHCP_SERVER_PORT, FlowRule, IP_PROTO_UDP, InboundPacket, PacketEmitter,
    PacketProcessor, PortMatch, Selector, Treatment, priority, table,
};
use crate::leadership::LeaderRole;
use crate::model::{MacAddr, Subnet};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    EthernetFrame, EthernetProtocol, EthernetRepr, IpProtocol, Ipv4Packet, Ipv4Repr, UdpPacket,
    UdpRepr,
};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

const ETHERNET_HEADER_SIZE: usize = 14;
const IPV4_HEADER_SIZE: usize = 20;
const UDP_HEADER_SIZE: usize = 8;

fn message_type(msg: &Message) -> Option<MessageType> {
    match msg.opts().get(OptionCode::MessageType) {
        Some(DhcpOption::MessageType(t)) => Some(*t),
        _ => None,
    }
}

fn requested_ip(msg: &Message) -> Option<Ipv4Addr> {
    match msg.opts().get(OptionCode::RequestedIpAddress) {
        Some(DhcpOption::RequestedIpAddress(ip)) => Some(*ip),
        _ => None,
    }
}

/// Build the Ethernet/IPv4/UDP frame around an encoded DHCP message.
fn dhcp_frame(
    src_mac: MacAddr,
    (dst_mac, dst_ip): (MacAddr, Ipv4Addr),
    src_ip: Ipv4Addr,
    dhcp_bytes: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_SIZE + dhcp_bytes.len();
    let mut frame = vec![0u8; ETHERNET_HEADER_SIZE + IPV4_HEADER_SIZE + udp_len];
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
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(eth_frame.payload_mut());
    ip_repr.emit(&mut ip_packet, &caps);

    let udp_repr = UdpRepr {
        src_port: DHCP_SERVER_PORT,
        dst_port: DHCP_CLIENT_PORT,
    };
    udp_repr.emit(
        &mut UdpPacket::new_unchecked(ip_packet.payload_mut()),
        &src_ip.into(),
        &dst_ip.into(),
        dhcp_bytes.len(),
        |buf| buf.copy_from_slice(dhcp_bytes),
        &caps,
    );
    frame
}

pub struct DhcpResponder {
    ctx: ReconcilerContext,
    emitter: Arc<dyn PacketEmitter>,
}

impl DhcpResponder {
    pub fn new(ctx: ReconcilerContext, emitter: Arc<dyn PacketEmitter>) -> Self {
        DhcpResponder { ctx, emitter }
    }

    /// Server address announced for `subnet`: its gateway, or the first host
    /// address when the subnet has none.
    fn server_ip(subnet: &Subnet) -> Ipv4Addr {
        subnet
            .gateway_ip
            .or_else(|| subnet.cidr.hosts().next())
            .unwrap_or(subnet.cidr.network())
    }

    fn reply(
        &self,
        request: &Message,
        msg_type: MessageType,
        assigned_ip: Ipv4Addr,
        subnet: &Subnet,
    ) -> Message {
        let server_ip = Self::server_ip(subnet);

        let mut reply = Message::default();
        reply
            .set_opcode(Opcode::BootReply)
            .set_htype(request.htype())
            .set_xid(request.xid())
            .set_flags(request.flags())
            .set_chaddr(request.chaddr());
        if request.flags().broadcast() {
            reply.set_flags(Flags::default().set_broadcast());
        }

        let opts = reply.opts_mut();
        opts.insert(DhcpOption::MessageType(msg_type));
        opts.insert(DhcpOption::ServerIdentifier(server_ip));
        if msg_type == MessageType::Nak {
            return reply;
        }

        reply.set_yiaddr(assigned_ip).set_siaddr(server_ip);
        let opts = reply.opts_mut();
        opts.insert(DhcpOption::AddressLeaseTime(self.ctx.config.dhcp_lease_secs));
        opts.insert(DhcpOption::SubnetMask(subnet.cidr.netmask()));
        opts.insert(DhcpOption::BroadcastAddr(subnet.cidr.broadcast()));
        if !self.ctx.config.dns_servers.is_empty() {
            opts.insert(DhcpOption::DomainNameServer(
                self.ctx.config.dns_servers.clone(),
            ));
        }
        if !subnet.host_routes.is_empty() {
            let routes = subnet
                .host_routes
                .iter()
                .map(|route| (route.destination, route.next_hop))
                .collect();
            opts.insert(DhcpOption::ClasslessStaticRoute(routes));
        }
        if let Some(gateway) = subnet.gateway_ip {
            opts.insert(DhcpOption::Router(vec![gateway]));
        }
        reply
    }

    /// Reply to a DHCP message, or `None` if it is not for us.
    pub fn respond(&self, frame: &[u8]) -> Option<Vec<u8>> {
        let eth = EthernetFrame::new_checked(frame).ok()?;
        if eth.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
        if ip.next_header() != IpProtocol::Udp {
            return None;
        }
        let udp = UdpPacket::new_checked(ip.payload()).ok()?;
        if udp.dst_port() != DHCP_SERVER_PORT {
            return None;
        }
        let request = Message::decode(&mut Decoder::new(udp.payload())).ok()?;
        if request.opcode() != Opcode::BootRequest {
            return None;
        }
        let Some(msg_type) = message_type(&request) else {
            trace!("DHCP message without type, ignoring");
            return None;
        };
        let client_mac = MacAddr(request.chaddr().get(..6)?.try_into().ok()?);

        let Some(port) = self.ctx.service.port_by_mac(client_mac) else {
            debug!(%client_mac, "DHCP from unmanaged host, ignoring");
            return None;
        };
        let Some(fixed) = port.primary_ip() else {
            warn!(port_id = %port.id, "No fixed IP on port, cannot answer DHCP");
            return None;
        };
        let Some(subnet) = self.ctx.service.subnet(&fixed.subnet_id) else {
            warn!(port_id = %port.id, subnet_id = %fixed.subnet_id, "Subnet of port not found");
            return None;
        };

        let reply_type = match msg_type {
            MessageType::Discover => MessageType::Offer,
            MessageType::Request => match requested_ip(&request) {
                Some(requested) if requested != fixed.ip => {
                    debug!(%client_mac, %requested, assigned = %fixed.ip, "Requested IP mismatch, sending NAK");
                    MessageType::Nak
                }
                _ => MessageType::Ack,
            },
            MessageType::Release => {
                trace!(%client_mac, "DHCP release");
                return None;
            }
            other => {
                trace!(msg_type = ?other, "Ignoring DHCP message type");
                return None;
            }
        };

        let reply = self.reply(&request, reply_type, fixed.ip, &subnet);
        let mut bytes = Vec::new();
        if let Err(e) = reply.encode(&mut Encoder::new(&mut bytes)) {
            warn!(error = %e, "Failed to encode DHCP reply");
            return None;
        }

        let destination = if reply_type == MessageType::Nak
            || request.flags().broadcast()
            || request.ciaddr() == Ipv4Addr::UNSPECIFIED
        {
            (MacAddr::BROADCAST, Ipv4Addr::BROADCAST)
        } else {
            (client_mac, fixed.ip)
        };

        debug!(
            %client_mac,
            ip = %fixed.ip,
            reply = ?reply_type,
            xid = request.xid(),
            "Sending DHCP reply"
        );
        Some(dhcp_frame(
            self.ctx.config.dhcp_server_mac,
            destination,
            Self::server_ip(&subnet),
            &bytes,
        ))
    }
}

impl PacketProcessor for DhcpResponder {
    fn process(&self, packet: &InboundPacket) -> bool {
        if !self.ctx.gate.is_leader_for(LeaderRole::DhcpResponder) {
            return false;
        }
        match self.respond(&packet.frame) {
            Some(reply) => {
                self.emitter.emit(&packet.device_id, packet.in_port, reply);
                true
            }
            None => false,
        }
    }
}

/// Punts DHCP client traffic on compute nodes.
pub struct DhcpRules {
    ctx: ReconcilerContext,
}

impl DhcpRules {
    pub fn new(ctx: ReconcilerContext) -> Self {
        DhcpRules { ctx }
    }

    fn rule(node: &Node) -> FlowRule {
        FlowRule::new(
            &node.integration_bridge,
            Selector::ipv4()
                .ip_proto(IP_PROTO_UDP)
                .tp_src(PortMatch::exact(DHCP_CLIENT_PORT))
                .tp_dst(PortMatch::exact(DHCP_SERVER_PORT)),
            Treatment::new().punt(),
            priority::DHCP,
            table::DHCP_ARP,
        )
    }
}

#[async_trait]
impl Reconciler for DhcpRules {
    const NAME: &'static str = "dhcp";

    fn accepts(_event: &NetworkEvent) -> bool {
        false
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let NodeEvent::Complete(node) = event else {
            return;
        };
        if node.node_type != NodeType::Compute
            || !self.ctx.gate.is_leader_for(LeaderRole::DhcpResponder)
        {
            return;
        }
        if let Err(e) = self.ctx.apply(&[Self::rule(&node)], true).await {
            warn!(node = %node.hostname, error = %e, "Failed to install DHCP rule");
        }
    }
}
