//! Networking configuration shared by the reconcilers.

use crate::error::ConfigError;
use crate::model::MacAddr;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Default MAC used for virtual router gateways and the DHCP server.
pub const DEFAULT_GATEWAY_MAC: MacAddr = MacAddr([0xfe, 0x00, 0x00, 0x00, 0x00, 0x02]);

/// How ARP requests from instances are answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ArpMode {
    /// Requests are answered by the controller.
    #[default]
    Proxy,
    /// Requests are flooded; the controller stays out of the way.
    Broadcast,
}

/// Runtime configuration, usable as flattened CLI args or loaded from JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, clap::Args)]
#[serde(default)]
pub struct NetworkingConfig {
    /// MAC address answered for subnet gateway IPs.
    #[arg(long, default_value = "fe:00:00:00:00:02")]
    pub gateway_mac: MacAddr,

    /// Source MAC of DHCP replies.
    #[arg(long, default_value = "fe:00:00:00:00:02")]
    pub dhcp_server_mac: MacAddr,

    /// DHCP lease time in seconds.
    #[arg(long, default_value_t = u32::MAX)]
    pub dhcp_lease_secs: u32,

    /// DNS servers handed out over DHCP.
    #[arg(long, value_delimiter = ',', default_values = ["8.8.8.8", "8.8.4.4"])]
    pub dns_servers: Vec<Ipv4Addr>,

    #[arg(long, value_enum, default_value_t = ArpMode::Proxy)]
    pub arp_mode: ArpMode,

    /// Program per-gateway stateful SNAT instead of reactive SNAT.
    #[arg(long)]
    pub use_stateful_snat: bool,

    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub use_security_group: bool,

    /// First SNAT port (inclusive).
    #[arg(long, default_value_t = 1025)]
    pub snat_port_min: u16,

    /// Last SNAT port (exclusive).
    #[arg(long, default_value_t = 65535)]
    pub snat_port_max: u16,

    #[arg(long, default_value_t = 120_000)]
    pub snat_lease_ttl_ms: u64,

    #[arg(long, default_value_t = 60_000)]
    pub icmp_correlation_ttl_ms: u64,

    #[arg(long, default_value_t = 4096)]
    pub icmp_correlation_capacity: usize,
}

impl Default for NetworkingConfig {
    fn default() -> Self {
        NetworkingConfig {
            gateway_mac: DEFAULT_GATEWAY_MAC,
            dhcp_server_mac: DEFAULT_GATEWAY_MAC,
            dhcp_lease_secs: u32::MAX,
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
            arp_mode: ArpMode::Proxy,
            use_stateful_snat: false,
            use_security_group: true,
            snat_port_min: 1025,
            snat_port_max: 65535,
            snat_lease_ttl_ms: 120_000,
            icmp_correlation_ttl_ms: 60_000,
            icmp_correlation_capacity: 4096,
        }
    }
}

impl NetworkingConfig {
    /// Load from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: NetworkingConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.snat_port_min >= self.snat_port_max {
            return Err(ConfigError::PortRange {
                min: self.snat_port_min,
                max: self.snat_port_max,
            });
        }
        if self.snat_lease_ttl_ms == 0 {
            return Err(ConfigError::Zero("snat_lease_ttl_ms"));
        }
        if self.icmp_correlation_ttl_ms == 0 {
            return Err(ConfigError::Zero("icmp_correlation_ttl_ms"));
        }
        if self.icmp_correlation_capacity == 0 {
            return Err(ConfigError::Zero("icmp_correlation_capacity"));
        }
        Ok(())
    }
}
