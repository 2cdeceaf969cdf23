//! Administrative and query facade over the network object store.
//!
//! Mutations are validated before they reach the store. Every event the store
//! emits is re-broadcast to the listeners registered here, in registration
//! order, on the store's dispatch task.

use crate::error::ServiceError;
use crate::listener::{ListenerId, ListenerRegistry};
use crate::model::{
    DEVICE_OWNER_ROUTER_GATEWAY, ExternalPeerRouter, FloatingIp, MacAddr, Network, Port, Router,
    RouterInterface, SecurityGroup, SecurityGroupRule, Subnet,
};
use crate::store::{NetworkEvent, NetworkObjectStore, StoreDelegate};
use ipnet::Ipv4Net;
use prefix_trie::PrefixMap;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info};

pub type Result<T> = std::result::Result<T, ServiceError>;

/// Receives every network event.
pub trait NetworkListener: Send + Sync {
    /// Filter applied before [`event`](Self::event).
    fn is_relevant(&self, _event: &NetworkEvent) -> bool {
        true
    }

    fn event(&self, event: &NetworkEvent);
}

type Listeners = ListenerRegistry<dyn NetworkListener>;

/// Store delegate that fans events out to the facade listeners.
struct Relay {
    listeners: Arc<Listeners>,
}

impl StoreDelegate for Relay {
    fn notify(&self, event: NetworkEvent) {
        self.listeners.broadcast(|listener| {
            if listener.is_relevant(&event) {
                listener.event(&event);
            }
        });
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

pub struct NetworkService {
    store: Arc<NetworkObjectStore>,
    listeners: Arc<Listeners>,
    /// Makes check-then-remove atomic for this facade instance only.
    admin_lock: Mutex<()>,
    peer_routers: RwLock<HashMap<Ipv4Addr, ExternalPeerRouter>>,
}

impl NetworkService {
    /// Wrap a store and become its delegate.
    pub fn new(store: Arc<NetworkObjectStore>) -> Self {
        let listeners = Arc::new(Listeners::new());
        store.set_delegate(Arc::new(Relay {
            listeners: Arc::clone(&listeners),
        }));
        NetworkService {
            store,
            listeners,
            admin_lock: Mutex::new(()),
            peer_routers: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<NetworkObjectStore> {
        &self.store
    }

    pub fn add_listener(&self, listener: Arc<dyn NetworkListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Wait until every event caused by earlier mutations reached the listeners.
    pub async fn flush(&self) {
        self.store.flush().await;
    }

    // Networks

    pub fn create_network(&self, network: Network) -> Result<()> {
        require("network ID", &network.id)?;
        let id = network.id.clone();
        self.store.create_network(network)?;
        info!(network_id = %id, "Created network");
        Ok(())
    }

    pub fn update_network(&self, network: Network) -> Result<()> {
        require("network ID", &network.id)?;
        let id = network.id.clone();
        self.store.update_network(network)?;
        debug!(network_id = %id, "Updated network");
        Ok(())
    }

    /// Remove a network. Refused while subnets or ports still reference it.
    pub fn remove_network(&self, id: &str) -> Result<Option<Network>> {
        require("network ID", id)?;
        let _guard = self.admin_lock.lock().unwrap();
        if !self.subnets_by_network(id).is_empty() || !self.ports_by_network(id).is_empty() {
            return Err(ServiceError::InUse {
                kind: "network",
                id: id.to_string(),
            });
        }
        let removed = self.store.remove_network(id);
        if removed.is_some() {
            info!(network_id = %id, "Removed network");
        }
        Ok(removed)
    }

    pub fn network(&self, id: &str) -> Option<Network> {
        self.store.network(id)
    }

    pub fn networks(&self) -> Vec<Network> {
        self.store.networks()
    }

    // Subnets

    pub fn create_subnet(&self, subnet: Subnet) -> Result<()> {
        require("subnet ID", &subnet.id)?;
        require("subnet network ID", &subnet.network_id)?;
        let id = subnet.id.clone();
        self.store.create_subnet(subnet)?;
        info!(subnet_id = %id, "Created subnet");
        Ok(())
    }

    pub fn update_subnet(&self, subnet: Subnet) -> Result<()> {
        require("subnet ID", &subnet.id)?;
        require("subnet network ID", &subnet.network_id)?;
        self.store.update_subnet(subnet)?;
        Ok(())
    }

    /// Remove a subnet. Refused while a router interface is attached to it.
    pub fn remove_subnet(&self, id: &str) -> Result<Option<Subnet>> {
        require("subnet ID", id)?;
        let _guard = self.admin_lock.lock().unwrap();
        if self
            .store
            .router_interfaces()
            .iter()
            .any(|iface| iface.subnet_id == id)
        {
            return Err(ServiceError::InUse {
                kind: "subnet",
                id: id.to_string(),
            });
        }
        let removed = self.store.remove_subnet(id);
        if removed.is_some() {
            info!(subnet_id = %id, "Removed subnet");
        }
        Ok(removed)
    }

    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        self.store.subnet(id)
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        self.store.subnets()
    }

    pub fn subnets_by_network(&self, network_id: &str) -> Vec<Subnet> {
        self.store
            .subnets()
            .into_iter()
            .filter(|s| s.network_id == network_id)
            .collect()
    }

    /// Subnet of `network_id` with the longest prefix containing `ip`.
    pub fn subnet_of_ip(&self, network_id: &str, ip: Ipv4Addr) -> Option<Subnet> {
        let mut table = PrefixMap::<Ipv4Net, Subnet>::new();
        for subnet in self.subnets_by_network(network_id) {
            table.insert(subnet.cidr.trunc(), subnet);
        }
        let host = Ipv4Net::new(ip, 32).ok()?;
        table.get_lpm(&host).map(|(_, subnet)| subnet.clone())
    }

    // Ports

    pub fn create_port(&self, port: Port) -> Result<()> {
        require("port ID", &port.id)?;
        require("port network ID", &port.network_id)?;
        let id = port.id.clone();
        self.store.create_port(port)?;
        info!(port_id = %id, "Created port");
        Ok(())
    }

    pub fn update_port(&self, port: Port) -> Result<()> {
        require("port ID", &port.id)?;
        require("port network ID", &port.network_id)?;
        self.store.update_port(port)?;
        Ok(())
    }

    /// Remove a port. Refused while the port backs a router interface.
    pub fn remove_port(&self, id: &str) -> Result<Option<Port>> {
        require("port ID", id)?;
        let _guard = self.admin_lock.lock().unwrap();
        if self.store.router_interface(id).is_some() {
            return Err(ServiceError::InUse {
                kind: "port",
                id: id.to_string(),
            });
        }
        let removed = self.store.remove_port(id);
        if removed.is_some() {
            info!(port_id = %id, "Removed port");
        }
        Ok(removed)
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        self.store.port(id)
    }

    pub fn ports(&self) -> Vec<Port> {
        self.store.ports()
    }

    pub fn ports_by_network(&self, network_id: &str) -> Vec<Port> {
        self.store
            .ports()
            .into_iter()
            .filter(|p| p.network_id == network_id)
            .collect()
    }

    pub fn port_by_mac(&self, mac: MacAddr) -> Option<Port> {
        self.store.ports().into_iter().find(|p| p.mac == mac)
    }

    // Routers

    pub fn create_router(&self, router: Router) -> Result<()> {
        require("router ID", &router.id)?;
        let id = router.id.clone();
        self.store.create_router(router)?;
        info!(router_id = %id, "Created router");
        Ok(())
    }

    pub fn update_router(&self, router: Router) -> Result<()> {
        require("router ID", &router.id)?;
        if let Some(gateway) = &router.external_gateway {
            require("router gateway network ID", &gateway.network_id)?;
        }
        let id = router.id.clone();
        self.store.update_router(router)?;
        debug!(router_id = %id, "Updated router");
        Ok(())
    }

    /// Remove a router. Refused while interfaces are attached.
    pub fn remove_router(&self, id: &str) -> Result<Option<Router>> {
        require("router ID", id)?;
        let _guard = self.admin_lock.lock().unwrap();
        if !self.router_interfaces_of(id).is_empty() {
            return Err(ServiceError::InUse {
                kind: "router",
                id: id.to_string(),
            });
        }
        let removed = self.store.remove_router(id);
        if removed.is_some() {
            info!(router_id = %id, "Removed router");
        }
        Ok(removed)
    }

    pub fn router(&self, id: &str) -> Option<Router> {
        self.store.router(id)
    }

    pub fn routers(&self) -> Vec<Router> {
        self.store.routers()
    }

    // Router interfaces

    pub fn add_router_interface(&self, iface: RouterInterface) -> Result<()> {
        Self::validate_router_interface(&iface)?;
        let (router_id, subnet_id) = (iface.router_id.clone(), iface.subnet_id.clone());
        self.store.create_router_interface(iface)?;
        info!(router_id = %router_id, subnet_id = %subnet_id, "Added router interface");
        Ok(())
    }

    pub fn update_router_interface(&self, iface: RouterInterface) -> Result<()> {
        Self::validate_router_interface(&iface)?;
        self.store.update_router_interface(iface)?;
        Ok(())
    }

    pub fn remove_router_interface(&self, port_id: &str) -> Result<Option<RouterInterface>> {
        require("router interface port ID", port_id)?;
        let removed = self.store.remove_router_interface(port_id);
        if let Some(iface) = &removed {
            info!(router_id = %iface.router_id, subnet_id = %iface.subnet_id, "Removed router interface");
        }
        Ok(removed)
    }

    fn validate_router_interface(iface: &RouterInterface) -> Result<()> {
        require("router interface port ID", &iface.port_id)?;
        require("router interface router ID", &iface.router_id)?;
        require("router interface subnet ID", &iface.subnet_id)
    }

    pub fn router_interface(&self, port_id: &str) -> Option<RouterInterface> {
        self.store.router_interface(port_id)
    }

    pub fn router_interfaces(&self) -> Vec<RouterInterface> {
        self.store.router_interfaces()
    }

    pub fn router_interfaces_of(&self, router_id: &str) -> Vec<RouterInterface> {
        self.store
            .router_interfaces()
            .into_iter()
            .filter(|iface| iface.router_id == router_id)
            .collect()
    }

    /// First fixed IP of the router's gateway port.
    pub fn external_gateway_ip(&self, router: &Router) -> Option<Ipv4Addr> {
        router.external_gateway.as_ref()?;
        self.store
            .ports()
            .into_iter()
            .find(|p| p.device_owner == DEVICE_OWNER_ROUTER_GATEWAY && p.device_id == router.id)
            .and_then(|p| p.primary_ip().map(|fixed| fixed.ip))
    }

    // Floating IPs

    pub fn create_floating_ip(&self, floating_ip: FloatingIp) -> Result<()> {
        require("floating IP ID", &floating_ip.id)?;
        let id = floating_ip.id.clone();
        self.store.create_floating_ip(floating_ip)?;
        info!(floating_ip_id = %id, "Created floating IP");
        Ok(())
    }

    pub fn update_floating_ip(&self, floating_ip: FloatingIp) -> Result<()> {
        require("floating IP ID", &floating_ip.id)?;
        let id = floating_ip.id.clone();
        self.store.update_floating_ip(floating_ip)?;
        debug!(floating_ip_id = %id, "Updated floating IP");
        Ok(())
    }

    pub fn remove_floating_ip(&self, id: &str) -> Result<Option<FloatingIp>> {
        require("floating IP ID", id)?;
        let removed = self.store.remove_floating_ip(id);
        if removed.is_some() {
            info!(floating_ip_id = %id, "Removed floating IP");
        }
        Ok(removed)
    }

    pub fn floating_ip(&self, id: &str) -> Option<FloatingIp> {
        self.store.floating_ip(id)
    }

    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        self.store.floating_ips()
    }

    pub fn floating_ips_by_router(&self, router_id: &str) -> Vec<FloatingIp> {
        self.store
            .floating_ips()
            .into_iter()
            .filter(|f| f.router_id.as_deref() == Some(router_id))
            .collect()
    }

    /// Floating IP currently bound to `port_id`.
    pub fn floating_ip_of_port(&self, port_id: &str) -> Option<FloatingIp> {
        self.store
            .floating_ips()
            .into_iter()
            .find(|f| f.port_id.as_deref() == Some(port_id))
    }

    // Security groups

    pub fn create_security_group(&self, sg: SecurityGroup) -> Result<()> {
        require("security group ID", &sg.id)?;
        let id = sg.id.clone();
        self.store.create_security_group(sg)?;
        info!(security_group_id = %id, "Created security group");
        Ok(())
    }

    pub fn update_security_group(&self, sg: SecurityGroup) -> Result<()> {
        require("security group ID", &sg.id)?;
        self.store.update_security_group(sg)?;
        Ok(())
    }

    /// Remove a security group. Refused while ports reference it.
    pub fn remove_security_group(&self, id: &str) -> Result<Option<SecurityGroup>> {
        require("security group ID", id)?;
        let _guard = self.admin_lock.lock().unwrap();
        if self
            .store
            .ports()
            .iter()
            .any(|port| port.has_security_group(id))
        {
            return Err(ServiceError::InUse {
                kind: "security group",
                id: id.to_string(),
            });
        }
        let removed = self.store.remove_security_group(id);
        if removed.is_some() {
            info!(security_group_id = %id, "Removed security group");
        }
        Ok(removed)
    }

    pub fn security_group(&self, id: &str) -> Option<SecurityGroup> {
        self.store.security_group(id)
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        self.store.security_groups()
    }

    /// Security groups a port carries, skipping ids with no stored group.
    pub fn security_groups_of_port(&self, port_id: &str) -> Vec<SecurityGroup> {
        let Some(port) = self.store.port(port_id) else {
            return Vec::new();
        };
        port.security_group_ids()
            .iter()
            .filter_map(|sg_id| self.store.security_group(sg_id))
            .collect()
    }

    pub fn create_security_group_rule(&self, rule: SecurityGroupRule) -> Result<()> {
        require("security group rule ID", &rule.id)?;
        require("security group ID", &rule.security_group_id)?;
        let id = rule.id.clone();
        self.store.create_security_group_rule(rule)?;
        info!(rule_id = %id, "Created security group rule");
        Ok(())
    }

    pub fn update_security_group_rule(&self, rule: SecurityGroupRule) -> Result<()> {
        require("security group rule ID", &rule.id)?;
        require("security group ID", &rule.security_group_id)?;
        self.store.update_security_group_rule(rule)?;
        Ok(())
    }

    pub fn remove_security_group_rule(&self, id: &str) -> Result<Option<SecurityGroupRule>> {
        require("security group rule ID", id)?;
        let removed = self.store.remove_security_group_rule(id);
        if removed.is_some() {
            info!(rule_id = %id, "Removed security group rule");
        }
        Ok(removed)
    }

    pub fn security_group_rule(&self, id: &str) -> Option<SecurityGroupRule> {
        self.store.security_group_rule(id)
    }

    pub fn security_group_rules(&self) -> Vec<SecurityGroupRule> {
        self.store.security_group_rules()
    }

    // External peer routers

    /// Register the upstream router of `router`'s external network, unless
    /// already known. The peer is the gateway of the external network's
    /// subnet; its MAC stays unknown until learned.
    pub fn derive_external_peer_router(&self, router: &Router) -> Option<ExternalPeerRouter> {
        let gateway = router.external_gateway.as_ref()?;
        let network = self.store.network(&gateway.network_id)?;
        let peer_ip = self
            .subnets_by_network(&network.id)
            .into_iter()
            .find_map(|s| s.gateway_ip)?;

        let mut peers = self.peer_routers.write().unwrap();
        let peer = peers.entry(peer_ip).or_insert_with(|| {
            info!(ip = %peer_ip, network_id = %network.id, "Registered external peer router");
            ExternalPeerRouter {
                ip: peer_ip,
                mac: None,
                vlan_id: network.vlan_id(),
            }
        });
        Some(peer.clone())
    }

    /// Record a learned MAC. Returns false if the peer is unknown.
    pub fn update_external_peer_router_mac(&self, ip: Ipv4Addr, mac: MacAddr) -> bool {
        let mut peers = self.peer_routers.write().unwrap();
        let Some(peer) = peers.get_mut(&ip) else {
            return false;
        };
        if peer.mac != Some(mac) {
            info!(ip = %ip, mac = %mac, "Learned external peer router MAC");
            peer.mac = Some(mac);
        }
        true
    }

    pub fn external_peer_router(&self, ip: Ipv4Addr) -> Option<ExternalPeerRouter> {
        self.peer_routers.read().unwrap().get(&ip).cloned()
    }

    /// Peer router of an external network, found through its subnet gateway.
    pub fn external_peer_router_for_network(&self, network_id: &str) -> Option<ExternalPeerRouter> {
        let peers = self.peer_routers.read().unwrap();
        self.subnets_by_network(network_id)
            .into_iter()
            .filter_map(|s| s.gateway_ip)
            .find_map(|ip| peers.get(&ip).cloned())
    }

    pub fn delete_external_peer_router(&self, ip: Ipv4Addr) -> Option<ExternalPeerRouter> {
        self.peer_routers.write().unwrap().remove(&ip)
    }

    pub fn external_peer_routers(&self) -> Vec<ExternalPeerRouter> {
        self.peer_routers.read().unwrap().values().cloned().collect()
    }
}
