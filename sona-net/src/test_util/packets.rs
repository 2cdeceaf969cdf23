//! Frame builders and parsers for responder tests.
//!
//! Uses smoltcp for Ethernet/ARP/IPv4/ICMP/UDP and dhcproto for DHCP, the same
//! codecs the responders use.

use crate::model::MacAddr;
use dhcproto::v4::{DhcpOption, Flags, Message, MessageType, Opcode, OptionCode};
use dhcproto::{Decodable, Decoder, Encodable, Encoder};
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    ArpOperation, ArpPacket, ArpRepr, EthernetFrame, EthernetProtocol,
    EthernetRepr, Icmpv4Message, Icmpv4Packet, Icmpv4Repr, IpProtocol, Ipv4Packet, Ipv4Repr,
    TcpPacket, UdpPacket, UdpRepr,
};
use std::net::Ipv4Addr;

pub const ETHERNET_HDR_SIZE: usize = 14;
pub const IP_HDR_SIZE: usize = 20;
pub const UDP_HDR_SIZE: usize = 8;
pub const TCP_HDR_SIZE: usize = 20;
pub const ARP_PKT_SIZE: usize = 28;

fn ethernet(buf: &mut [u8], src: MacAddr, dst: MacAddr, ethertype: EthernetProtocol) {
    let repr = EthernetRepr {
        src_addr: src.into(),
        dst_addr: dst.into(),
        ethertype,
    };
    repr.emit(&mut EthernetFrame::new_unchecked(buf));
}

fn ipv4(buf: &mut [u8], src: Ipv4Addr, dst: Ipv4Addr, protocol: IpProtocol, payload_len: usize) {
    let repr = Ipv4Repr {
        src_addr: src,
        dst_addr: dst,
        next_header: protocol,
        payload_len,
        hop_limit: 64,
    };
    repr.emit(
        &mut Ipv4Packet::new_unchecked(buf),
        &ChecksumCapabilities::default(),
    );
}

// ARP

pub fn arp_request(sender_mac: MacAddr, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Vec<u8> {
    arp_frame(
        ArpOperation::Request,
        sender_mac,
        sender_ip,
        MacAddr::BROADCAST,
        MacAddr::ZERO,
        target_ip,
    )
}

pub fn arp_reply(
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    arp_frame(
        ArpOperation::Reply,
        sender_mac,
        sender_ip,
        target_mac,
        target_mac,
        target_ip,
    )
}

fn arp_frame(
    operation: ArpOperation,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    eth_dst: MacAddr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + ARP_PKT_SIZE];
    ethernet(&mut frame, sender_mac, eth_dst, EthernetProtocol::Arp);

    let repr = ArpRepr::EthernetIpv4 {
        operation,
        source_hardware_addr: sender_mac.into(),
        source_protocol_addr: sender_ip,
        target_hardware_addr: target_mac.into(),
        target_protocol_addr: target_ip,
    };
    repr.emit(&mut ArpPacket::new_unchecked(
        &mut frame[ETHERNET_HDR_SIZE..],
    ));
    frame
}

/// Parsed ARP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpFrame {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub is_reply: bool,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

pub fn parse_arp(frame: &[u8]) -> Option<ArpFrame> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let packet = ArpPacket::new_checked(eth.payload()).ok()?;
    match ArpRepr::parse(&packet).ok()? {
        ArpRepr::EthernetIpv4 {
            operation,
            source_hardware_addr,
            source_protocol_addr,
            target_hardware_addr,
            target_protocol_addr,
        } => Some(ArpFrame {
            eth_src: eth.src_addr().into(),
            eth_dst: eth.dst_addr().into(),
            is_reply: operation == ArpOperation::Reply,
            sender_mac: source_hardware_addr.into(),
            sender_ip: source_protocol_addr,
            target_mac: target_hardware_addr.into(),
            target_ip: target_protocol_addr,
        }),
        _ => None,
    }
}

// ICMP

pub fn icmp_echo_request(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    seq_no: u16,
) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoRequest {
        ident,
        seq_no,
        data: b"ping from test!",
    };
    icmp_frame(src_mac, dst_mac, src_ip, dst_ip, repr)
}

pub fn icmp_echo_reply(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    ident: u16,
    seq_no: u16,
) -> Vec<u8> {
    let repr = Icmpv4Repr::EchoReply {
        ident,
        seq_no,
        data: b"ping from test!",
    };
    icmp_frame(src_mac, dst_mac, src_ip, dst_ip, repr)
}

fn icmp_frame(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src_ip: Ipv4Addr,
    dst_ip: Ipv4Addr,
    repr: Icmpv4Repr<'_>,
) -> Vec<u8> {
    let icmp_len = repr.buffer_len();
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + icmp_len];
    ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);
    ipv4(
        &mut frame[ETHERNET_HDR_SIZE..],
        src_ip,
        dst_ip,
        IpProtocol::Icmp,
        icmp_len,
    );
    repr.emit(
        &mut Icmpv4Packet::new_unchecked(&mut frame[ETHERNET_HDR_SIZE + IP_HDR_SIZE..]),
        &ChecksumCapabilities::default(),
    );
    frame
}

/// Parsed ICMP echo request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpEcho {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub is_reply: bool,
    pub ident: u16,
    pub seq_no: u16,
    pub checksum_valid: bool,
}

pub fn parse_icmp_echo(frame: &[u8]) -> Option<IcmpEcho> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Icmp {
        return None;
    }
    let icmp = Icmpv4Packet::new_checked(ip.payload()).ok()?;
    let is_reply = match icmp.msg_type() {
        Icmpv4Message::EchoReply => true,
        Icmpv4Message::EchoRequest => false,
        _ => return None,
    };
    Some(IcmpEcho {
        src_mac: eth.src_addr().into(),
        dst_mac: eth.dst_addr().into(),
        src_ip: ip.src_addr(),
        dst_ip: ip.dst_addr(),
        is_reply,
        ident: icmp.echo_ident(),
        seq_no: icmp.echo_seq_no(),
        checksum_valid: ip.verify_checksum() && icmp.verify_checksum(),
    })
}

// TCP / UDP

pub fn udp_datagram(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + payload.len();
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + udp_len];
    ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);
    ipv4(
        &mut frame[ETHERNET_HDR_SIZE..],
        src.0,
        dst.0,
        IpProtocol::Udp,
        udp_len,
    );
    let repr = UdpRepr {
        src_port: src.1,
        dst_port: dst.1,
    };
    repr.emit(
        &mut UdpPacket::new_unchecked(&mut frame[ETHERNET_HDR_SIZE + IP_HDR_SIZE..]),
        &src.0.into(),
        &dst.0.into(),
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &ChecksumCapabilities::default(),
    );
    frame
}

/// A bare TCP SYN.
pub fn tcp_syn(
    src_mac: MacAddr,
    dst_mac: MacAddr,
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
) -> Vec<u8> {
    let mut frame = vec![0u8; ETHERNET_HDR_SIZE + IP_HDR_SIZE + TCP_HDR_SIZE];
    ethernet(&mut frame, src_mac, dst_mac, EthernetProtocol::Ipv4);
    ipv4(
        &mut frame[ETHERNET_HDR_SIZE..],
        src.0,
        dst.0,
        IpProtocol::Tcp,
        TCP_HDR_SIZE,
    );
    let mut tcp = TcpPacket::new_unchecked(&mut frame[ETHERNET_HDR_SIZE + IP_HDR_SIZE..]);
    tcp.set_src_port(src.1);
    tcp.set_dst_port(dst.1);
    tcp.set_seq_number(smoltcp::wire::TcpSeqNumber(1000));
    tcp.set_header_len(TCP_HDR_SIZE as u8);
    tcp.clear_flags();
    tcp.set_syn(true);
    tcp.set_window_len(64240);
    tcp.fill_checksum(&src.0.into(), &dst.0.into());
    frame
}

/// Addressing of a parsed TCP or UDP frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transport {
    pub src_mac: MacAddr,
    pub dst_mac: MacAddr,
    pub vlan_id: Option<u16>,
    pub protocol: IpProtocol,
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub checksum_valid: bool,
}

/// Parse a TCP or UDP frame, accepting one 802.1Q tag.
pub fn parse_transport(frame: &[u8]) -> Option<Transport> {
    let (frame, vlan_id) = strip_vlan(frame)?;
    let eth = EthernetFrame::new_checked(&frame[..]).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    let (src_ip, dst_ip) = (ip.src_addr(), ip.dst_addr());
    let (src_port, dst_port, l4_valid) = match ip.next_header() {
        IpProtocol::Tcp => {
            let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
            let valid = tcp.verify_checksum(&src_ip.into(), &dst_ip.into());
            (tcp.src_port(), tcp.dst_port(), valid)
        }
        IpProtocol::Udp => {
            let udp = UdpPacket::new_checked(ip.payload()).ok()?;
            let valid = udp.verify_checksum(&src_ip.into(), &dst_ip.into());
            (udp.src_port(), udp.dst_port(), valid)
        }
        _ => return None,
    };
    Some(Transport {
        src_mac: eth.src_addr().into(),
        dst_mac: eth.dst_addr().into(),
        vlan_id,
        protocol: ip.next_header(),
        src_ip,
        dst_ip,
        src_port,
        dst_port,
        checksum_valid: l4_valid && ip.verify_checksum(),
    })
}

fn strip_vlan(frame: &[u8]) -> Option<(Vec<u8>, Option<u16>)> {
    if frame.len() < ETHERNET_HDR_SIZE {
        return None;
    }
    if frame[12..14] != [0x81, 0x00] {
        return Some((frame.to_vec(), None));
    }
    if frame.len() < ETHERNET_HDR_SIZE + 4 {
        return None;
    }
    let vlan = u16::from_be_bytes([frame[14], frame[15]]) & 0x0fff;
    let mut untagged = frame[..12].to_vec();
    untagged.extend_from_slice(&frame[16..]);
    Some((untagged, Some(vlan)))
}

// DHCP

/// A client DISCOVER, broadcast from `client_mac`.
pub fn dhcp_discover(client_mac: MacAddr, xid: u32) -> Vec<u8> {
    dhcp_client_frame(client_mac, xid, MessageType::Discover, None, None)
}

/// A client REQUEST for `requested_ip` offered by `server_id`.
pub fn dhcp_request(
    client_mac: MacAddr,
    xid: u32,
    requested_ip: Ipv4Addr,
    server_id: Ipv4Addr,
) -> Vec<u8> {
    dhcp_client_frame(
        client_mac,
        xid,
        MessageType::Request,
        Some(requested_ip),
        Some(server_id),
    )
}

pub fn dhcp_release(client_mac: MacAddr, xid: u32) -> Vec<u8> {
    dhcp_client_frame(client_mac, xid, MessageType::Release, None, None)
}

fn dhcp_client_frame(
    client_mac: MacAddr,
    xid: u32,
    message_type: MessageType,
    requested_ip: Option<Ipv4Addr>,
    server_id: Option<Ipv4Addr>,
) -> Vec<u8> {
    let mut msg = Message::default();
    msg.set_opcode(Opcode::BootRequest)
        .set_xid(xid)
        .set_flags(Flags::default().set_broadcast())
        .set_chaddr(&client_mac.octets());
    msg.opts_mut().insert(DhcpOption::MessageType(message_type));
    if let Some(ip) = requested_ip {
        msg.opts_mut().insert(DhcpOption::RequestedIpAddress(ip));
    }
    if let Some(ip) = server_id {
        msg.opts_mut().insert(DhcpOption::ServerIdentifier(ip));
    }

    let mut payload = Vec::new();
    msg.encode(&mut Encoder::new(&mut payload))
        .expect("encode DHCP message");

    udp_datagram(
        client_mac,
        MacAddr::BROADCAST,
        (Ipv4Addr::UNSPECIFIED, crate::flow::DHCP_CLIENT_PORT),
        (Ipv4Addr::BROADCAST, crate::flow::DHCP_SERVER_PORT),
        &payload,
    )
}

/// A DHCP reply with its Ethernet/IPv4 addressing.
#[derive(Debug, Clone)]
pub struct DhcpReply {
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ip_src: Ipv4Addr,
    pub ip_dst: Ipv4Addr,
    pub message: Message,
}

impl DhcpReply {
    pub fn message_type(&self) -> Option<MessageType> {
        match self.message.opts().get(OptionCode::MessageType) {
            Some(DhcpOption::MessageType(t)) => Some(*t),
            _ => None,
        }
    }

    pub fn option(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.message.opts().get(code)
    }
}

pub fn parse_dhcp(frame: &[u8]) -> Option<DhcpReply> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    let message = Message::decode(&mut Decoder::new(udp.payload())).ok()?;
    Some(DhcpReply {
        eth_src: eth.src_addr().into(),
        eth_dst: eth.dst_addr().into(),
        ip_src: ip.src_addr(),
        ip_dst: ip.dst_addr(),
        message,
    })
}
