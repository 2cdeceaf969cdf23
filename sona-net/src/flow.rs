//! Flow rule vocabulary and the dataplane collaborators.
//!
//! Reconcilers never talk to switches. They describe rules as
//! (device, selector, treatment, priority, table) tuples and hand them to a
//! [`FlowProgram`]; responders hand finished frames to a [`PacketEmitter`].

use crate::error::FlowError;
use crate::model::MacAddr;
use async_trait::async_trait;
use ipnet::Ipv4Net;
use std::fmt;
use std::net::Ipv4Addr;

pub const ETH_TYPE_IPV4: u16 = 0x0800;
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;

pub const DHCP_SERVER_PORT: u16 = 67;
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Reserved port: send back out of the ingress port.
pub const IN_PORT: u32 = 0xffff_fff8;
/// Reserved port: punt to the controller.
pub const CONTROLLER: u32 = 0xffff_fffd;

/// Rule priorities. Higher wins.
pub mod priority {
    pub const CT_DROP: u16 = 32767;
    pub const ICMP: u16 = 43000;
    pub const DHCP: u16 = 42000;
    pub const FLOATING_INTERNAL: u16 = 42000;
    pub const FLOATING_EXTERNAL: u16 = 41500;
    pub const STATEFUL_SNAT: u16 = 40500;
    pub const FLAT_JUMP: u16 = 41000;
    pub const FLAT: u16 = 41000;
    pub const ARP_CONTROL: u16 = 40000;
    pub const ADMIN: u16 = 32000;
    pub const CT: u16 = 32000;
    pub const ACL: u16 = 31000;
    pub const CT_HOOK: u16 = 30500;
    pub const SWITCHING: u16 = 30000;
    pub const TUNNEL_TAG: u16 = 30000;
    pub const INTERNAL_ROUTING: u16 = 28000;
    pub const SNAT: u16 = 26000;
    pub const EXTERNAL_ROUTING: u16 = 25000;
}

/// Pipeline tables.
pub mod table {
    pub const VTAG: u8 = 0;
    pub const DHCP_ARP: u8 = 0;
    pub const GW_COMMON: u8 = 0;
    pub const ACL: u8 = 1;
    pub const CONNTRACK: u8 = 2;
    pub const JUMP: u8 = 3;
    pub const ROUTING: u8 = 4;
    pub const FORWARDING: u8 = 5;
    pub const FLAT: u8 = 6;
}

/// Host prefix (/32) of an address.
pub fn host(ip: Ipv4Addr) -> Ipv4Net {
    Ipv4Net::from(ip)
}

/// Transport port match with a bit mask. `mask == 0xffff` is an exact match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortMatch {
    pub port: u16,
    pub mask: u16,
}

impl PortMatch {
    pub const fn exact(port: u16) -> Self {
        PortMatch { port, mask: 0xffff }
    }
}

/// Connection tracking state bits.
pub mod ct_state {
    pub const NEW: u8 = 0x01;
    pub const ESTABLISHED: u8 = 0x02;
    pub const TRACKED: u8 = 0x20;
}

/// Masked match on the connection tracking state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CtStateMatch {
    pub state: u8,
    pub mask: u8,
}

/// Header fields a rule matches on. Unset fields are wildcards.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Selector {
    pub eth_type: Option<u16>,
    pub in_port: Option<u32>,
    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ip_src: Option<Ipv4Net>,
    pub ip_dst: Option<Ipv4Net>,
    pub ip_proto: Option<u8>,
    pub tunnel_id: Option<u64>,
    pub vlan_id: Option<u16>,
    pub tp_src: Option<PortMatch>,
    pub tp_dst: Option<PortMatch>,
    pub icmp_type: Option<u8>,
    pub arp_op: Option<u16>,
    /// ARP target protocol address.
    pub arp_tpa: Option<Ipv4Addr>,
    pub ct_state: Option<CtStateMatch>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ipv4() -> Self {
        Self::new().eth_type(ETH_TYPE_IPV4)
    }

    pub fn arp() -> Self {
        Self::new().eth_type(ETH_TYPE_ARP)
    }

    pub fn eth_type(mut self, eth_type: u16) -> Self {
        self.eth_type = Some(eth_type);
        self
    }

    pub fn in_port(mut self, port: u32) -> Self {
        self.in_port = Some(port);
        self
    }

    pub fn eth_src(mut self, mac: MacAddr) -> Self {
        self.eth_src = Some(mac);
        self
    }

    pub fn eth_dst(mut self, mac: MacAddr) -> Self {
        self.eth_dst = Some(mac);
        self
    }

    pub fn ip_src(mut self, net: Ipv4Net) -> Self {
        self.ip_src = Some(net);
        self
    }

    pub fn ip_dst(mut self, net: Ipv4Net) -> Self {
        self.ip_dst = Some(net);
        self
    }

    pub fn ip_proto(mut self, proto: u8) -> Self {
        self.ip_proto = Some(proto);
        self
    }

    pub fn tunnel_id(mut self, vni: u64) -> Self {
        self.tunnel_id = Some(vni);
        self
    }

    pub fn vlan_id(mut self, vlan: u16) -> Self {
        self.vlan_id = Some(vlan);
        self
    }

    pub fn tp_src(mut self, port: PortMatch) -> Self {
        self.tp_src = Some(port);
        self
    }

    pub fn tp_dst(mut self, port: PortMatch) -> Self {
        self.tp_dst = Some(port);
        self
    }

    pub fn icmp_type(mut self, icmp_type: u8) -> Self {
        self.icmp_type = Some(icmp_type);
        self
    }

    pub fn arp_op(mut self, op: u16) -> Self {
        self.arp_op = Some(op);
        self
    }

    pub fn arp_tpa(mut self, ip: Ipv4Addr) -> Self {
        self.arp_tpa = Some(ip);
        self
    }

    pub fn ct_state(mut self, state: u8, mask: u8) -> Self {
        self.ct_state = Some(CtStateMatch { state, mask });
        self
    }
}

/// NAT performed as part of a conntrack action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NatAction {
    /// Undo the translation recorded for the connection.
    Reverse,
    /// Rewrite the source to `ip` with a port from `[port_min, port_max]`.
    Source {
        ip: Ipv4Addr,
        port_min: u16,
        port_max: u16,
    },
}

/// Connection tracking action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Conntrack {
    pub commit: bool,
    pub nat: Option<NatAction>,
    /// Table the packet is recirculated to after tracking.
    pub recirculate: Option<u8>,
}

impl Conntrack {
    pub fn commit() -> Self {
        Conntrack {
            commit: true,
            ..Default::default()
        }
    }

    pub fn recirculate(table: u8) -> Self {
        Conntrack {
            recirculate: Some(table),
            ..Default::default()
        }
    }

    pub fn snat(ip: Ipv4Addr, port_min: u16, port_max: u16) -> Self {
        Conntrack {
            commit: true,
            nat: Some(NatAction::Source {
                ip,
                port_min,
                port_max,
            }),
            recirculate: None,
        }
    }

    pub fn unnat(table: u8) -> Self {
        Conntrack {
            commit: false,
            nat: Some(NatAction::Reverse),
            recirculate: Some(table),
        }
    }
}

/// A single action applied to matching packets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Instruction {
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetIpSrc(Ipv4Addr),
    SetIpDst(Ipv4Addr),
    SetTpSrc(u16),
    SetTpDst(u16),
    SetTunnelId(u64),
    /// Tunnel endpoint extension: remote node data IP.
    SetTunnelDst(Ipv4Addr),
    PushVlan,
    SetVlanId(u16),
    PopVlan,
    Output(u32),
    Group(u32),
    Transition(u8),
    Conntrack(Conntrack),
    Drop,
}

/// Ordered action list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Treatment {
    pub instructions: Vec<Instruction>,
}

impl Treatment {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, instruction: Instruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn set_eth_src(self, mac: MacAddr) -> Self {
        self.push(Instruction::SetEthSrc(mac))
    }

    pub fn set_eth_dst(self, mac: MacAddr) -> Self {
        self.push(Instruction::SetEthDst(mac))
    }

    pub fn set_ip_src(self, ip: Ipv4Addr) -> Self {
        self.push(Instruction::SetIpSrc(ip))
    }

    pub fn set_ip_dst(self, ip: Ipv4Addr) -> Self {
        self.push(Instruction::SetIpDst(ip))
    }

    pub fn set_tp_src(self, port: u16) -> Self {
        self.push(Instruction::SetTpSrc(port))
    }

    pub fn set_tp_dst(self, port: u16) -> Self {
        self.push(Instruction::SetTpDst(port))
    }

    pub fn set_tunnel_id(self, vni: u64) -> Self {
        self.push(Instruction::SetTunnelId(vni))
    }

    pub fn set_tunnel_dst(self, ip: Ipv4Addr) -> Self {
        self.push(Instruction::SetTunnelDst(ip))
    }

    pub fn push_vlan(self) -> Self {
        self.push(Instruction::PushVlan)
    }

    pub fn set_vlan_id(self, vlan: u16) -> Self {
        self.push(Instruction::SetVlanId(vlan))
    }

    pub fn pop_vlan(self) -> Self {
        self.push(Instruction::PopVlan)
    }

    pub fn output(self, port: u32) -> Self {
        self.push(Instruction::Output(port))
    }

    pub fn punt(self) -> Self {
        self.output(CONTROLLER)
    }

    pub fn group(self, group_id: u32) -> Self {
        self.push(Instruction::Group(group_id))
    }

    pub fn transition(self, table: u8) -> Self {
        self.push(Instruction::Transition(table))
    }

    pub fn conntrack(self, ct: Conntrack) -> Self {
        self.push(Instruction::Conntrack(ct))
    }

    pub fn drop(self) -> Self {
        self.push(Instruction::Drop)
    }

    pub fn contains(&self, instruction: &Instruction) -> bool {
        self.instructions.contains(instruction)
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

/// A device-level rule. Install and removal of the same value are inverse
/// operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowRule {
    pub device_id: String,
    pub selector: Selector,
    pub treatment: Treatment,
    pub priority: u16,
    pub table: u8,
}

impl FlowRule {
    pub fn new(
        device_id: impl Into<String>,
        selector: Selector,
        treatment: Treatment,
        priority: u16,
        table: u8,
    ) -> Self {
        FlowRule {
            device_id: device_id.into(),
            selector,
            treatment,
            priority,
            table,
        }
    }
}

impl fmt::Display for FlowRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/table={}/prio={}",
            self.device_id, self.table, self.priority
        )
    }
}

/// Installs and removes rules on devices.
///
/// Implementations must be idempotent: installing a present rule or removing
/// an absent one succeeds.
#[async_trait]
pub trait FlowProgram: Send + Sync {
    async fn apply(&self, rule: &FlowRule, install: bool) -> Result<(), FlowError>;
}

/// A packet punted to the controller by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundPacket {
    pub device_id: String,
    pub in_port: u32,
    /// Full Ethernet frame.
    pub frame: Vec<u8>,
}

/// Sends frames out of a device port.
pub trait PacketEmitter: Send + Sync {
    fn emit(&self, device_id: &str, port: u32, frame: Vec<u8>);
}

/// Handles packet-ins. Returns true if the packet was consumed.
pub trait PacketProcessor: Send + Sync {
    fn process(&self, packet: &InboundPacket) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_builder() {
        let net: Ipv4Net = "10.0.0.5/32".parse().unwrap();
        let selector = Selector::ipv4().ip_dst(net).tunnel_id(100);
        assert_eq!(selector.eth_type, Some(ETH_TYPE_IPV4));
        assert_eq!(selector.ip_dst, Some(net));
        assert_eq!(selector.tunnel_id, Some(100));
        assert_eq!(selector.ip_src, None);
    }

    #[test]
    fn test_conntrack_snat_commits() {
        let ip = Ipv4Addr::new(172, 24, 4, 10);
        let ct = Conntrack::snat(ip, 1025, 2048);
        assert!(ct.commit);
        assert_eq!(
            ct.nat,
            Some(NatAction::Source {
                ip,
                port_min: 1025,
                port_max: 2048
            })
        );
        assert!(!Conntrack::unnat(table::GW_COMMON).commit);
    }

    #[test]
    fn test_treatment_order_is_kept() {
        let treatment = Treatment::new()
            .set_eth_dst(MacAddr::BROADCAST)
            .pop_vlan()
            .punt();
        assert_eq!(
            treatment.instructions,
            vec![
                Instruction::SetEthDst(MacAddr::BROADCAST),
                Instruction::PopVlan,
                Instruction::Output(CONTROLLER),
            ]
        );
    }
}
