//! East-west routing between the subnets of a router, gateway ICMP and
//! source NAT towards the external network.

use super::{Reconciler, ReconcilerContext, Segment};
use crate::error::ReconcileError;
use crate::flow::{
    Conntrack, FlowRule, IP_PROTO_ICMP, Selector, Treatment, host, priority, table,
};
use crate::instance_port::InstancePortEvent;
use crate::leadership::LeaderRole;
use crate::model::{InstancePort, Router, RouterInterface, Subnet};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use std::mem;
use std::net::Ipv4Addr;
use tracing::{debug, info, warn};

pub struct RoutingReconciler {
    ctx: ReconcilerContext,
}

impl RoutingReconciler {
    pub fn new(ctx: ReconcilerContext) -> Self {
        RoutingReconciler { ctx }
    }

    fn segment_of(&self, subnet: &Subnet) -> Result<Segment, ReconcileError> {
        Segment::of(&self.ctx.network(&subnet.network_id)?)
    }

    fn computes(&self) -> Vec<Node> {
        self.ctx.topology.complete_nodes(NodeType::Compute)
    }

    fn gateways(&self) -> Vec<Node> {
        self.ctx.topology.complete_nodes(NodeType::Gateway)
    }

    /// Re-evaluate admin state and SNAT for every interface of `router`.
    /// `previous` is the router before an update, used to tear down SNAT
    /// when the external gateway went away.
    async fn router_updated(&self, router: &Router, previous: Option<&Router>) {
        let ifaces = self.ctx.service.router_interfaces_of(&router.id);
        for iface in &ifaces {
            report(
                self.set_admin_rules(iface, !router.admin_state_up).await,
                "admin rules",
                &iface.port_id,
            );
        }

        if router.external_gateway.is_none() {
            let nat_router = previous
                .filter(|old| old.snat_enabled())
                .unwrap_or(router);
            for iface in &ifaces {
                report(
                    self.set_source_nat(nat_router, iface, false).await,
                    "source NAT",
                    &iface.port_id,
                );
            }
            self.prune_peer_routers();
            return;
        }

        if self.ctx.service.derive_external_peer_router(router).is_none() {
            debug!(router_id = %router.id, "external network has no gateway, peer router unknown");
        }
        for iface in &ifaces {
            report(
                self.set_source_nat(router, iface, router.snat_enabled()).await,
                "source NAT",
                &iface.port_id,
            );
        }
    }

    /// Forget peer routers no router points at anymore.
    fn prune_peer_routers(&self) {
        let service = &self.ctx.service;
        let in_use: Vec<Ipv4Addr> = service
            .routers()
            .iter()
            .filter_map(|router| router.external_gateway.as_ref())
            .filter_map(|gw| service.external_peer_router_for_network(&gw.network_id))
            .map(|peer| peer.ip)
            .collect();
        for peer in service.external_peer_routers() {
            if !in_use.contains(&peer.ip) {
                service.delete_external_peer_router(peer.ip);
                info!(ip = %peer.ip, "Removed unused external peer router");
            }
        }
    }

    async fn router_iface_changed(
        &self,
        router: &Router,
        iface: &RouterInterface,
        install: bool,
    ) -> Result<(), ReconcileError> {
        if !router.admin_state_up {
            self.set_admin_rules(iface, install).await?;
        }

        let subnet = self.ctx.subnet(&iface.subnet_id)?;
        let segment = self.segment_of(&subnet)?;

        let mut rules = self.internal_route_rules(router, &subnet, segment);
        rules.extend(self.gateway_icmp_rules(&subnet, segment));
        self.ctx.apply(&rules, install).await?;

        if router.snat_enabled() {
            self.set_source_nat(router, iface, install).await?;
        }
        debug!(
            router_id = %router.id,
            subnet_id = %subnet.id,
            install,
            "Router interface programmed"
        );
        Ok(())
    }

    /// Drop routed traffic of the interface's subnet while the router is down.
    async fn set_admin_rules(
        &self,
        iface: &RouterInterface,
        install: bool,
    ) -> Result<(), ReconcileError> {
        let subnet = self.ctx.subnet(&iface.subnet_id)?;
        let segment = self.segment_of(&subnet)?;
        let selector = segment.matching(
            Selector::ipv4()
                .ip_src(subnet.cidr)
                .eth_dst(self.ctx.config.gateway_mac),
        );
        let rules: Vec<FlowRule> = self
            .computes()
            .iter()
            .map(|node| {
                FlowRule::new(
                    &node.integration_bridge,
                    selector.clone(),
                    Treatment::new().drop(),
                    priority::ADMIN,
                    table::ROUTING,
                )
            })
            .collect();
        self.ctx.apply(&rules, install).await
    }

    /// Self-route of `subnet` plus both directions between `subnet` and every
    /// other subnet of `router`, on every complete compute node.
    fn internal_route_rules(
        &self,
        router: &Router,
        subnet: &Subnet,
        segment: Segment,
    ) -> Vec<FlowRule> {
        let mut pairs = vec![(segment, subnet, segment, subnet)];
        let others: Vec<(Segment, Subnet)> = self
            .ctx
            .service
            .router_interfaces_of(&router.id)
            .iter()
            .filter(|iface| iface.subnet_id != subnet.id)
            .filter_map(|iface| {
                let other = self.ctx.subnet(&iface.subnet_id).ok()?;
                let other_segment = self.segment_of(&other).ok()?;
                if mem::discriminant(&other_segment) != mem::discriminant(&segment) {
                    warn!(
                        subnet_id = %subnet.id,
                        other_subnet_id = %other.id,
                        "Cannot route between different network types"
                    );
                    return None;
                }
                Some((other_segment, other))
            })
            .collect();
        for (other_segment, other) in &others {
            pairs.push((segment, subnet, *other_segment, other));
            pairs.push((*other_segment, other, segment, subnet));
        }

        let mut rules = Vec::new();
        for node in self.computes() {
            for (src_segment, src, dst_segment, dst) in &pairs {
                rules.extend(internal_rules(
                    &node.integration_bridge,
                    *src_segment,
                    src,
                    *dst_segment,
                    dst,
                ));
            }
        }
        rules
    }

    /// Traffic for the subnet gateway IP goes to the gateway nodes, where
    /// ICMP to it is punted to the controller.
    fn gateway_icmp_rules(&self, subnet: &Subnet, segment: Segment) -> Vec<FlowRule> {
        let Some(gateway_ip) = subnet.gateway_ip else {
            debug!(subnet_id = %subnet.id, "subnet has no gateway IP");
            return Vec::new();
        };
        let gateways = self.gateways();
        if gateways.is_empty() {
            debug!(subnet_id = %subnet.id, "no complete gateway node for gateway ICMP");
            return Vec::new();
        }

        let mut rules: Vec<FlowRule> = self
            .computes()
            .iter()
            .map(|node| {
                FlowRule::new(
                    &node.integration_bridge,
                    segment.matching(Selector::ipv4().ip_dst(host(gateway_ip))),
                    Treatment::new().group(
                        self.ctx
                            .topology
                            .gateway_group_id(&node.integration_bridge),
                    ),
                    priority::SWITCHING,
                    table::ROUTING,
                )
            })
            .collect();
        rules.extend(gateways.iter().map(|node| {
            FlowRule::new(
                &node.integration_bridge,
                Selector::ipv4()
                    .ip_proto(IP_PROTO_ICMP)
                    .ip_dst(host(gateway_ip)),
                Treatment::new().punt(),
                priority::ICMP,
                table::GW_COMMON,
            )
        }));
        rules
    }

    async fn set_source_nat(
        &self,
        router: &Router,
        iface: &RouterInterface,
        install: bool,
    ) -> Result<(), ReconcileError> {
        let subnet = self.ctx.subnet(&iface.subnet_id)?;
        let segment = self.segment_of(&subnet)?;
        let gateways = self.gateways();
        if gateways.is_empty() {
            debug!(subnet_id = %subnet.id, "no complete gateway node for source NAT");
            return Ok(());
        }

        let to_gateway = segment.matching(
            Selector::ipv4()
                .ip_src(subnet.cidr)
                .eth_dst(self.ctx.config.gateway_mac),
        );
        let mut rules: Vec<FlowRule> = self
            .computes()
            .iter()
            .map(|node| {
                FlowRule::new(
                    &node.integration_bridge,
                    to_gateway.clone(),
                    Treatment::new().group(
                        self.ctx
                            .topology
                            .gateway_group_id(&node.integration_bridge),
                    ),
                    priority::EXTERNAL_ROUTING,
                    table::ROUTING,
                )
            })
            .collect();

        if self.ctx.config.use_stateful_snat {
            match self.stateful_snat_rules(router, iface, &subnet, segment, &gateways, install) {
                Ok(stateful) => rules.extend(stateful),
                Err(e) if !install => {
                    // Still withdraw the compute side when the gateway side
                    // cannot be rebuilt.
                    let withdrawn = self.ctx.apply(&rules, false).await;
                    warn!(
                        router_id = %router.id,
                        subnet_id = %subnet.id,
                        error = %e,
                        "Gateway source NAT rules could not be rebuilt for removal"
                    );
                    return withdrawn.and(Err(e));
                }
                Err(e) => return Err(e),
            }
        } else {
            let punt = match segment {
                Segment::Vxlan(_) => Treatment::new().punt(),
                Segment::Vlan(_) => Treatment::new().pop_vlan().punt(),
            };
            rules.extend(gateways.iter().map(|node| {
                FlowRule::new(
                    &node.integration_bridge,
                    to_gateway.clone(),
                    punt.clone(),
                    priority::EXTERNAL_ROUTING,
                    table::GW_COMMON,
                )
            }));
        }

        info!(
            router_id = %router.id,
            subnet_id = %subnet.id,
            install,
            stateful = self.ctx.config.use_stateful_snat,
            "Source NAT programmed"
        );
        self.ctx.apply(&rules, install).await
    }

    /// Conntrack based SNAT on every gateway, each owning a slice of the
    /// port range.
    fn stateful_snat_rules(
        &self,
        router: &Router,
        iface: &RouterInterface,
        subnet: &Subnet,
        segment: Segment,
        gateways: &[Node],
        install: bool,
    ) -> Result<Vec<FlowRule>, ReconcileError> {
        let nat_ip = self
            .ctx
            .service
            .external_gateway_ip(router)
            .ok_or_else(|| ReconcileError::missing("external gateway IP of router", &router.id))?;
        let peer = self.ctx.peer_router_of(router)?;
        let peer_mac = peer
            .mac
            .ok_or_else(|| ReconcileError::missing("external peer router MAC", peer.ip.to_string()))?;

        // The un-NAT rule is per router; keep it while other interfaces still use it.
        let touch_shared = install
            || !self
                .ctx
                .service
                .router_interfaces_of(&router.id)
                .iter()
                .any(|other| other.port_id != iface.port_id);

        let instances: Vec<InstancePort> = self
            .ctx
            .instance_ports
            .instance_ports()
            .into_iter()
            .filter(|port| port.network_id == subnet.network_id)
            .collect();

        let mut rules = Vec::new();
        for (index, gateway) in gateways.iter().enumerate() {
            let bridge = &gateway.integration_bridge;
            rules.extend(
                instances
                    .iter()
                    .filter_map(|port| self.stateful_ingress_rule(gateway, port, segment)),
            );

            if touch_shared {
                rules.push(FlowRule::new(
                    bridge,
                    Selector::ipv4().ip_dst(host(nat_ip)),
                    Treatment::new().conntrack(Conntrack::unnat(table::GW_COMMON)),
                    priority::STATEFUL_SNAT,
                    table::GW_COMMON,
                ));
            }

            let Some(uplink) = gateway.uplink_port else {
                debug!(node = %gateway.hostname, "gateway has no uplink port");
                continue;
            };
            let (port_min, port_max) = self.port_range(index, gateways.len());
            let mut egress = Treatment::new()
                .conntrack(Conntrack::snat(nat_ip, port_min, port_max))
                .set_eth_src(self.ctx.config.gateway_mac)
                .set_eth_dst(peer_mac);
            if matches!(segment, Segment::Vlan(_)) {
                egress = egress.pop_vlan();
            }
            if let Some(vlan) = peer.vlan_id {
                egress = egress.push_vlan().set_vlan_id(vlan);
            }
            rules.push(FlowRule::new(
                bridge,
                segment.matching(
                    Selector::ipv4()
                        .ip_src(subnet.cidr)
                        .eth_dst(self.ctx.config.gateway_mac),
                ),
                egress.output(uplink),
                priority::STATEFUL_SNAT,
                table::GW_COMMON,
            ));
        }
        Ok(rules)
    }

    /// Deliver un-NATed traffic from `gateway` to the node hosting `port`.
    fn stateful_ingress_rule(
        &self,
        gateway: &Node,
        port: &InstancePort,
        segment: Segment,
    ) -> Option<FlowRule> {
        let node = self.ctx.topology.node_by_device(&port.device_id)?;
        let rewrite = Treatment::new()
            .set_eth_src(self.ctx.config.gateway_mac)
            .set_eth_dst(port.mac);
        let treatment = match segment {
            Segment::Vxlan(_) => segment
                .tagging(rewrite)
                .set_tunnel_dst(node.data_ip?)
                .output(gateway.tunnel_port?),
            Segment::Vlan(_) => segment.tagging(rewrite).output(gateway.vlan_port?),
        };
        Some(FlowRule::new(
            &gateway.integration_bridge,
            Selector::ipv4().ip_dst(host(port.ip)),
            treatment,
            priority::EXTERNAL_ROUTING,
            table::GW_COMMON,
        ))
    }

    /// Inclusive slice of the SNAT port range owned by gateway `index`.
    fn port_range(&self, index: usize, count: usize) -> (u16, u16) {
        let min = u32::from(self.ctx.config.snat_port_min);
        let max = u32::from(self.ctx.config.snat_port_max);
        let size = ((max - min) / count.max(1) as u32).max(1);
        let low = (min + index as u32 * size).min(max - 1);
        let high = (low + size - 1).min(max - 1);
        (low as u16, high as u16)
    }

    async fn reconfigure_routers(&self) {
        let service = &self.ctx.service;
        for router in service.routers() {
            self.router_updated(&router, None).await;
        }
        for iface in service.router_interfaces() {
            let Some(router) = service.router(&iface.router_id) else {
                continue;
            };
            report(
                self.router_iface_changed(&router, &iface, true).await,
                "router interface",
                &iface.port_id,
            );
        }
    }

    /// Stateful SNAT delivers to each instance from every gateway.
    async fn instance_port_changed(&self, port: &InstancePort, install: bool) {
        let snat_router = self
            .ctx
            .service
            .subnets_by_network(&port.network_id)
            .iter()
            .filter_map(|subnet| self.ctx.router_of_subnet(&subnet.id))
            .any(|(router, _)| router.snat_enabled());
        if !snat_router {
            return;
        }
        let segment = match self.ctx.network(&port.network_id).and_then(|n| Segment::of(&n)) {
            Ok(segment) => segment,
            Err(e) => {
                warn!(mac = %port.mac, error = %e, "Failed to program SNAT ingress");
                return;
            }
        };
        let rules: Vec<FlowRule> = self
            .gateways()
            .iter()
            .filter_map(|gateway| self.stateful_ingress_rule(gateway, port, segment))
            .collect();
        report(
            self.ctx.apply(&rules, install).await,
            "SNAT ingress",
            &port.port_id,
        );
    }
}

/// Retag from `src` to `dst` and hand over to forwarding. Matches on both
/// segments so that already retagged traffic passes too.
fn internal_rules(
    device_id: &str,
    src_segment: Segment,
    src: &Subnet,
    dst_segment: Segment,
    dst: &Subnet,
) -> Vec<FlowRule> {
    let selector = Selector::ipv4().ip_src(src.cidr).ip_dst(dst.cidr);
    let treatment = match dst_segment {
        Segment::Vxlan(vni) => Treatment::new().set_tunnel_id(vni),
        Segment::Vlan(vlan) => Treatment::new().set_vlan_id(vlan),
    }
    .transition(table::FORWARDING);

    let mut segments = vec![src_segment];
    if dst_segment != src_segment {
        segments.push(dst_segment);
    }
    segments
        .into_iter()
        .map(|segment| {
            FlowRule::new(
                device_id,
                segment.matching(selector.clone()),
                treatment.clone(),
                priority::INTERNAL_ROUTING,
                table::ROUTING,
            )
        })
        .collect()
}

fn report(result: Result<(), ReconcileError>, what: &str, id: &str) {
    if let Err(e) = result {
        warn!(id, error = %e, "Failed to program {what}");
    }
}

#[async_trait]
impl Reconciler for RoutingReconciler {
    const NAME: &'static str = "routing";

    fn accepts(event: &NetworkEvent) -> bool {
        matches!(event.resource_type(), "router" | "router_interface")
    }

    async fn on_network_event(&mut self, event: NetworkEvent) {
        if !self.ctx.gate.is_leader_for(LeaderRole::Routing) {
            return;
        }
        match event {
            NetworkEvent::RouterCreated(router) => self.router_updated(&router, None).await,
            NetworkEvent::RouterUpdated { old, new } => {
                self.router_updated(&new, Some(&old)).await
            }
            NetworkEvent::RouterRemoved(router) => {
                for iface in self.ctx.service.router_interfaces_of(&router.id) {
                    report(
                        self.set_admin_rules(&iface, false).await,
                        "admin rules",
                        &iface.port_id,
                    );
                }
            }
            NetworkEvent::RouterInterfaceAdded(iface) => {
                let Some(router) = self.ctx.service.router(&iface.router_id) else {
                    warn!(router_id = %iface.router_id, "Router of new interface not found");
                    return;
                };
                report(
                    self.router_iface_changed(&router, &iface, true).await,
                    "router interface",
                    &iface.port_id,
                );
            }
            NetworkEvent::RouterInterfaceUpdated { old, new } => {
                for (iface, install) in [(old, false), (new, true)] {
                    let Some(router) = self.ctx.service.router(&iface.router_id) else {
                        continue;
                    };
                    report(
                        self.router_iface_changed(&router, &iface, install).await,
                        "router interface",
                        &iface.port_id,
                    );
                }
            }
            NetworkEvent::RouterInterfaceRemoved(iface) => {
                // The router may already be gone; routes and ICMP can still be withdrawn.
                let router = self
                    .ctx
                    .service
                    .router(&iface.router_id)
                    .unwrap_or_else(|| Router::new(&iface.router_id, ""));
                report(
                    self.router_iface_changed(&router, &iface, false).await,
                    "router interface",
                    &iface.port_id,
                );
            }
            _ => {}
        }
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        if !self.ctx.gate.is_leader_for(LeaderRole::Routing) {
            return;
        }
        info!(node = %event.node().hostname, "Reconfiguring routers");
        self.reconfigure_routers().await;
    }

    async fn on_instance_port_event(&mut self, event: InstancePortEvent) {
        if !self.ctx.config.use_stateful_snat
            || !self.ctx.gate.is_leader_for(LeaderRole::Routing)
        {
            return;
        }
        match event {
            InstancePortEvent::Detected(port) | InstancePortEvent::Updated(port) => {
                self.instance_port_changed(&port, true).await
            }
            InstancePortEvent::Vanished(port) => self.instance_port_changed(&port, false).await,
        }
    }
}
