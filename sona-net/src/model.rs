//! OpenStack network objects tracked by the store.
//!
//! Every entity is an immutable value: an update replaces the whole value
//! under the same id.

use ipnet::Ipv4Net;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smoltcp::wire::EthernetAddress;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Device owner of a router gateway port.
pub const DEVICE_OWNER_ROUTER_GATEWAY: &str = "network:router_gateway";

/// Device owner of a router interface port.
pub const DEVICE_OWNER_ROUTER_INTERFACE: &str = "network:router_interface";

/// Device owner of a floating IP port.
pub const DEVICE_OWNER_FLOATING_IP: &str = "network:floatingip";

/// An Ethernet MAC address, serialized as `aa:bb:cc:dd:ee:ff`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    pub const fn new(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(|| s.to_string())?;
            *octet = u8::from_str_radix(part, 16).map_err(|_| s.to_string())?;
        }
        if parts.next().is_some() {
            return Err(s.to_string());
        }
        Ok(MacAddr(octets))
    }
}

impl Serialize for MacAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for MacAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse()
            .map_err(|e| serde::de::Error::custom(format!("invalid MAC address: {e}")))
    }
}

impl From<MacAddr> for EthernetAddress {
    fn from(mac: MacAddr) -> Self {
        EthernetAddress(mac.0)
    }
}

impl From<EthernetAddress> for MacAddr {
    fn from(addr: EthernetAddress) -> Self {
        MacAddr(addr.0)
    }
}

/// Common accessors for stored entities.
pub trait Entity: Clone + Send + Sync + 'static {
    /// Human-readable kind used in errors and logs.
    const KIND: &'static str;

    fn id(&self) -> &str;
}

/// Segmentation technology of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    /// Overlay tunnel; segment id is the VNI.
    Vxlan,
    /// Segment id is the VLAN tag.
    Vlan,
    Flat,
}

impl fmt::Display for NetworkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkType::Vxlan => write!(f, "vxlan"),
            NetworkType::Vlan => write!(f, "vlan"),
            NetworkType::Flat => write!(f, "flat"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    pub network_type: NetworkType,
    /// Provider segmentation id, a VNI or VLAN tag depending on `network_type`.
    pub segment_id: String,
    /// Provider physical network a flat network is bridged to.
    #[serde(default)]
    pub physical_network: Option<String>,
}

impl Network {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        network_type: NetworkType,
        segment_id: impl Into<String>,
    ) -> Self {
        Network {
            id: id.into(),
            name: name.into(),
            tenant_id: String::new(),
            network_type,
            segment_id: segment_id.into(),
            physical_network: None,
        }
    }

    pub fn with_physical_network(mut self, physical_network: impl Into<String>) -> Self {
        self.physical_network = Some(physical_network.into());
        self
    }

    /// Tunnel id for overlay networks.
    pub fn vni(&self) -> Option<u64> {
        match self.network_type {
            NetworkType::Vxlan => self.segment_id.parse().ok(),
            _ => None,
        }
    }

    /// VLAN tag for VLAN networks.
    pub fn vlan_id(&self) -> Option<u16> {
        match self.network_type {
            NetworkType::Vlan => self.segment_id.parse().ok(),
            _ => None,
        }
    }
}

impl Entity for Network {
    const KIND: &'static str = "network";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Static route handed to instances over DHCP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRoute {
    pub destination: Ipv4Net,
    pub next_hop: Ipv4Addr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub network_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub cidr: Ipv4Net,
    #[serde(default)]
    pub gateway_ip: Option<Ipv4Addr>,
    #[serde(default)]
    pub host_routes: Vec<HostRoute>,
}

impl Subnet {
    pub fn new(
        id: impl Into<String>,
        network_id: impl Into<String>,
        cidr: Ipv4Net,
        gateway_ip: Option<Ipv4Addr>,
    ) -> Self {
        Subnet {
            id: id.into(),
            name: String::new(),
            network_id: network_id.into(),
            tenant_id: String::new(),
            cidr,
            gateway_ip,
            host_routes: Vec::new(),
        }
    }
}

impl Entity for Subnet {
    const KIND: &'static str = "subnet";

    fn id(&self) -> &str {
        &self.id
    }
}

/// A fixed IP binding of a port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedIp {
    pub ip: Ipv4Addr,
    pub subnet_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: String,
    pub network_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub mac: MacAddr,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    /// Absent and empty lists are equivalent.
    #[serde(default)]
    pub security_groups: Option<Vec<String>>,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub device_id: String,
}

impl Port {
    pub fn new(id: impl Into<String>, network_id: impl Into<String>, mac: MacAddr) -> Self {
        Port {
            id: id.into(),
            network_id: network_id.into(),
            tenant_id: String::new(),
            mac,
            fixed_ips: Vec::new(),
            security_groups: None,
            device_owner: String::new(),
            device_id: String::new(),
        }
    }

    pub fn with_fixed_ip(mut self, ip: Ipv4Addr, subnet_id: impl Into<String>) -> Self {
        self.fixed_ips.push(FixedIp {
            ip,
            subnet_id: subnet_id.into(),
        });
        self
    }

    pub fn with_security_groups<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.security_groups = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn security_group_ids(&self) -> &[String] {
        self.security_groups.as_deref().unwrap_or(&[])
    }

    pub fn has_security_group(&self, sg_id: &str) -> bool {
        self.security_group_ids().iter().any(|id| id == sg_id)
    }

    /// The first fixed IP, used for DHCP and gateway addressing.
    pub fn primary_ip(&self) -> Option<&FixedIp> {
        self.fixed_ips.first()
    }
}

impl Entity for Port {
    const KIND: &'static str = "port";

    fn id(&self) -> &str {
        &self.id
    }
}

/// External gateway of a router.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGateway {
    pub network_id: String,
    pub enable_snat: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default = "default_admin_state")]
    pub admin_state_up: bool,
    #[serde(default)]
    pub external_gateway: Option<ExternalGateway>,
}

fn default_admin_state() -> bool {
    true
}

impl Router {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Router {
            id: id.into(),
            name: name.into(),
            tenant_id: String::new(),
            admin_state_up: true,
            external_gateway: None,
        }
    }

    pub fn with_gateway(mut self, network_id: impl Into<String>, enable_snat: bool) -> Self {
        self.external_gateway = Some(ExternalGateway {
            network_id: network_id.into(),
            enable_snat,
        });
        self
    }

    /// True when outbound traffic should be source-NATed.
    pub fn snat_enabled(&self) -> bool {
        self.external_gateway
            .as_ref()
            .is_some_and(|gw| gw.enable_snat)
    }
}

impl Entity for Router {
    const KIND: &'static str = "router";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Attachment of a subnet to a router, keyed by the interface port id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterInterface {
    pub port_id: String,
    pub router_id: String,
    pub subnet_id: String,
    #[serde(default)]
    pub tenant_id: String,
}

impl RouterInterface {
    pub fn new(
        port_id: impl Into<String>,
        router_id: impl Into<String>,
        subnet_id: impl Into<String>,
    ) -> Self {
        RouterInterface {
            port_id: port_id.into(),
            router_id: router_id.into(),
            subnet_id: subnet_id.into(),
            tenant_id: String::new(),
        }
    }
}

impl Entity for RouterInterface {
    const KIND: &'static str = "router interface";

    fn id(&self) -> &str {
        &self.port_id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub floating_ip: Ipv4Addr,
    #[serde(default)]
    pub floating_network_id: String,
    #[serde(default)]
    pub router_id: Option<String>,
    /// Present while the floating IP is associated with a port.
    #[serde(default)]
    pub port_id: Option<String>,
    #[serde(default)]
    pub fixed_ip: Option<Ipv4Addr>,
}

impl FloatingIp {
    pub fn new(id: impl Into<String>, floating_ip: Ipv4Addr) -> Self {
        FloatingIp {
            id: id.into(),
            tenant_id: String::new(),
            floating_ip,
            floating_network_id: String::new(),
            router_id: None,
            port_id: None,
            fixed_ip: None,
        }
    }

    pub fn associated(mut self, port_id: impl Into<String>, fixed_ip: Ipv4Addr) -> Self {
        self.port_id = Some(port_id.into());
        self.fixed_ip = Some(fixed_ip);
        self
    }

    pub fn disassociated(mut self) -> Self {
        self.port_id = None;
        self.fixed_ip = None;
        self
    }
}

impl Entity for FloatingIp {
    const KIND: &'static str = "floating IP";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Traffic direction of a security group rule, seen from the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    pub fn reversed(self) -> Self {
        match self {
            Direction::Ingress => Direction::Egress,
            Direction::Egress => Direction::Ingress,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EtherType {
    #[serde(rename = "IPv4")]
    Ipv4,
    #[serde(rename = "IPv6")]
    Ipv6,
}

/// Protocols a security group rule can match on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleProtocol {
    Icmp,
    Tcp,
    Udp,
}

impl RuleProtocol {
    /// IP protocol number.
    pub fn number(self) -> u8 {
        match self {
            RuleProtocol::Icmp => 1,
            RuleProtocol::Tcp => 6,
            RuleProtocol::Udp => 17,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    pub id: String,
    pub security_group_id: String,
    #[serde(default)]
    pub tenant_id: String,
    pub direction: Direction,
    pub ether_type: EtherType,
    #[serde(default)]
    pub protocol: Option<RuleProtocol>,
    #[serde(default)]
    pub port_range_min: Option<u16>,
    #[serde(default)]
    pub port_range_max: Option<u16>,
    #[serde(default)]
    pub remote_ip_prefix: Option<Ipv4Net>,
    #[serde(default)]
    pub remote_group_id: Option<String>,
}

impl SecurityGroupRule {
    pub fn new(
        id: impl Into<String>,
        security_group_id: impl Into<String>,
        direction: Direction,
    ) -> Self {
        SecurityGroupRule {
            id: id.into(),
            security_group_id: security_group_id.into(),
            tenant_id: String::new(),
            direction,
            ether_type: EtherType::Ipv4,
            protocol: None,
            port_range_min: None,
            port_range_max: None,
            remote_ip_prefix: None,
            remote_group_id: None,
        }
    }

    pub fn with_protocol(mut self, protocol: RuleProtocol) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_ports(mut self, min: u16, max: u16) -> Self {
        self.port_range_min = Some(min);
        self.port_range_max = Some(max);
        self
    }

    pub fn with_remote_prefix(mut self, prefix: Ipv4Net) -> Self {
        self.remote_ip_prefix = Some(prefix);
        self
    }

    pub fn with_remote_group(mut self, group_id: impl Into<String>) -> Self {
        self.remote_group_id = Some(group_id.into());
        self
    }

    /// Remote group id, treating an empty string as unset.
    pub fn remote_group(&self) -> Option<&str> {
        self.remote_group_id.as_deref().filter(|id| !id.is_empty())
    }
}

impl Entity for SecurityGroupRule {
    const KIND: &'static str = "security group rule";

    fn id(&self) -> &str {
        &self.id
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub rules: Vec<SecurityGroupRule>,
}

impl SecurityGroup {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        SecurityGroup {
            id: id.into(),
            name: name.into(),
            tenant_id: String::new(),
            rules: Vec::new(),
        }
    }

    pub fn rule(&self, rule_id: &str) -> Option<&SecurityGroupRule> {
        self.rules.iter().find(|r| r.id == rule_id)
    }
}

impl Entity for SecurityGroup {
    const KIND: &'static str = "security group";

    fn id(&self) -> &str {
        &self.id
    }
}

/// Dataplane view of a tenant NIC, discovered on a compute node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstancePort {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub network_id: String,
    pub port_id: String,
    /// Integration bridge the instance is attached to.
    pub device_id: String,
    pub port_number: u32,
}

/// Upstream router on an external network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalPeerRouter {
    pub ip: Ipv4Addr,
    /// Unknown until learned from an ARP reply.
    pub mac: Option<MacAddr>,
    pub vlan_id: Option<u16>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "fe:00:00:00:00:02".parse().unwrap();
        assert_eq!(mac, MacAddr([0xfe, 0, 0, 0, 0, 2]));
        assert_eq!(mac.to_string(), "fe:00:00:00:00:02");

        assert!("fe:00:00:00:00".parse::<MacAddr>().is_err());
        assert!("fe:00:00:00:00:02:03".parse::<MacAddr>().is_err());
        assert!("zz:00:00:00:00:02".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_serde_as_string() {
        let mac = MacAddr([0x52, 0x54, 0x00, 0x12, 0x34, 0x56]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"52:54:00:12:34:56\"");
        let back: MacAddr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }

    #[test]
    fn test_network_segment_ids() {
        let vxlan = Network::new("n1", "net", NetworkType::Vxlan, "100");
        assert_eq!(vxlan.vni(), Some(100));
        assert_eq!(vxlan.vlan_id(), None);

        let vlan = Network::new("n2", "net", NetworkType::Vlan, "20");
        assert_eq!(vlan.vlan_id(), Some(20));
        assert_eq!(vlan.vni(), None);
    }

    #[test]
    fn test_port_security_groups_absent_is_empty() {
        let port = Port::new("p1", "n1", MacAddr::ZERO);
        assert!(port.security_group_ids().is_empty());
        assert!(!port.has_security_group("sg"));

        let port = port.with_security_groups(["sg"]);
        assert!(port.has_security_group("sg"));
    }

    #[test]
    fn test_router_snat_enabled() {
        assert!(!Router::new("r1", "r").snat_enabled());
        assert!(!Router::new("r1", "r").with_gateway("ext", false).snat_enabled());
        assert!(Router::new("r1", "r").with_gateway("ext", true).snat_enabled());
    }

    #[test]
    fn test_rule_remote_group_ignores_empty() {
        let rule = SecurityGroupRule::new("r1", "sg", Direction::Ingress).with_remote_group("");
        assert_eq!(rule.remote_group(), None);
        assert_eq!(Direction::Ingress.reversed(), Direction::Egress);
    }
}
