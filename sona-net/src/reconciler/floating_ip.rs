//! Floating IP programming: 1:1 NAT between a floating IP and an instance,
//! performed on the gateway nodes.

use super::{Reconciler, ReconcilerContext, Segment};
use crate::error::ReconcileError;
use crate::flow::{FlowRule, IN_PORT, Selector, Treatment, host, priority, table};
use crate::instance_port::InstancePortEvent;
use crate::leadership::LeaderRole;
use crate::model::{ExternalPeerRouter, FloatingIp, InstancePort};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use std::collections::HashMap;
use std::mem;
use tracing::{debug, info, warn};

pub struct FloatingIpReconciler {
    ctx: ReconcilerContext,
    /// What is programmed per floating IP id.
    installed: HashMap<String, Programmed>,
}

/// Rules of one floating IP and the gateway carrying its external traffic.
struct Programmed {
    gateway: String,
    rules: Vec<FlowRule>,
}

impl FloatingIpReconciler {
    pub fn new(ctx: ReconcilerContext) -> Self {
        FloatingIpReconciler {
            ctx,
            installed: HashMap::new(),
        }
    }

    fn peer_router(
        &self,
        fip: &FloatingIp,
        instance: &InstancePort,
    ) -> Result<ExternalPeerRouter, ReconcileError> {
        match self
            .ctx
            .service
            .external_peer_router_for_network(&fip.floating_network_id)
        {
            Some(peer) => Ok(peer),
            None => self.ctx.peer_router_of_network(&instance.network_id),
        }
    }

    /// Every rule realizing an associated floating IP.
    pub fn rules_for(&self, fip: &FloatingIp) -> Result<Vec<FlowRule>, ReconcileError> {
        self.program(fip).map(|programmed| programmed.rules)
    }

    fn program(&self, fip: &FloatingIp) -> Result<Programmed, ReconcileError> {
        let port_id = fip
            .port_id
            .as_deref()
            .ok_or_else(|| ReconcileError::missing("port of floating IP", &fip.id))?;
        let instance = self
            .ctx
            .instance_ports
            .by_port_id(port_id)
            .ok_or_else(|| ReconcileError::missing("instance port", port_id))?;
        let segment = Segment::of(&self.ctx.network(&instance.network_id)?)?;
        let compute = self.ctx.node_of_device(&instance.device_id)?;
        let selected = self
            .ctx
            .topology
            .select_gateway(port_id)
            .ok_or_else(|| ReconcileError::missing("gateway node for port", port_id))?;
        let peer = self.peer_router(fip, &instance)?;
        let peer_mac = peer
            .mac
            .ok_or_else(|| ReconcileError::missing("external peer router MAC", peer.ip.to_string()))?;

        let gateway_mac = self.ctx.config.gateway_mac;
        let floating = host(fip.floating_ip);
        let mut rules = Vec::new();

        // Compute node: routed traffic of the instance goes to its gateway.
        let compute_port = segment
            .transport_port(&compute)
            .ok_or_else(|| ReconcileError::missing("transport port of node", &compute.hostname))?;
        let to_gateway = match segment {
            Segment::Vxlan(_) => Treatment::new().set_tunnel_dst(tunnel_endpoint(&selected)?),
            Segment::Vlan(_) => Treatment::new(),
        };
        rules.push(FlowRule::new(
            &instance.device_id,
            segment.matching(
                Selector::ipv4()
                    .ip_src(host(instance.ip))
                    .eth_dst(gateway_mac),
            ),
            to_gateway.output(compute_port),
            priority::FLOATING_EXTERNAL,
            table::ROUTING,
        ));

        // Rewrite towards the instance, shared by both downstream paths.
        let to_instance = |treatment: Treatment| {
            treatment
                .set_eth_src(gateway_mac)
                .set_eth_dst(instance.mac)
                .set_ip_dst(instance.ip)
        };

        // Selected gateway: traffic from outside.
        let mut external = Selector::ipv4().ip_dst(floating);
        let mut downstream = Treatment::new();
        if let Some(vlan) = peer.vlan_id {
            external = external.vlan_id(vlan);
            downstream = downstream.pop_vlan();
        }
        let mut downstream = segment.tagging(to_instance(downstream));
        if matches!(segment, Segment::Vxlan(_)) {
            downstream = downstream.set_tunnel_dst(tunnel_endpoint(&compute)?);
        }
        let selected_port = segment
            .transport_port(&selected)
            .ok_or_else(|| ReconcileError::missing("transport port of node", &selected.hostname))?;
        rules.push(FlowRule::new(
            &selected.integration_bridge,
            external,
            downstream.output(selected_port),
            priority::FLOATING_EXTERNAL,
            table::GW_COMMON,
        ));

        for gateway in self.ctx.topology.complete_nodes(NodeType::Gateway) {
            // Hairpin: another instance reaching the floating IP from inside.
            if let Some(port) = segment.transport_port(&gateway) {
                let mut internal = segment.tagging(to_instance(Treatment::new()));
                if matches!(segment, Segment::Vxlan(_)) {
                    internal = internal.set_tunnel_dst(tunnel_endpoint(&compute)?);
                }
                rules.push(FlowRule::new(
                    &gateway.integration_bridge,
                    Selector::ipv4().ip_dst(floating).in_port(port),
                    internal.output(IN_PORT),
                    priority::FLOATING_INTERNAL,
                    table::GW_COMMON,
                ));
            }

            let Some(uplink) = gateway.uplink_port else {
                debug!(node = %gateway.hostname, "gateway has no uplink port");
                continue;
            };
            let mut upstream = Treatment::new()
                .set_ip_src(fip.floating_ip)
                .set_eth_src(instance.mac)
                .set_eth_dst(peer_mac);
            if matches!(segment, Segment::Vlan(_)) {
                upstream = upstream.pop_vlan();
            }
            if let Some(vlan) = peer.vlan_id {
                upstream = upstream.push_vlan().set_vlan_id(vlan);
            }
            rules.push(FlowRule::new(
                &gateway.integration_bridge,
                segment.matching(Selector::ipv4().ip_src(host(instance.ip))),
                upstream.output(uplink),
                priority::FLOATING_EXTERNAL,
                table::GW_COMMON,
            ));
        }

        Ok(Programmed {
            gateway: selected.hostname,
            rules,
        })
    }

    async fn associate(&mut self, fip: &FloatingIp) -> Result<(), ReconcileError> {
        let programmed = self.program(fip)?;
        if let Some(previous) = self.installed.get(&fip.id) {
            let stale: Vec<FlowRule> = previous
                .rules
                .iter()
                .filter(|rule| !programmed.rules.contains(rule))
                .cloned()
                .collect();
            self.ctx.apply(&stale, false).await?;
        }
        let result = self.ctx.apply(&programmed.rules, true).await;
        self.installed.insert(fip.id.clone(), programmed);
        info!(
            floating_ip = %fip.floating_ip,
            port_id = ?fip.port_id,
            "Floating IP associated"
        );
        result
    }

    /// Remove what was programmed for `fip`, recomputing it if nothing is cached.
    async fn disassociate(&mut self, fip: &FloatingIp) -> Result<(), ReconcileError> {
        let rules = match self.installed.remove(&fip.id) {
            Some(programmed) => programmed.rules,
            None => self.rules_for(fip)?,
        };
        self.ctx.apply(&rules, false).await?;
        info!(floating_ip = %fip.floating_ip, "Floating IP disassociated");
        Ok(())
    }

    /// Withdraw what a departed gateway carried. Only floating IPs whose
    /// external traffic it carried are moved to another gateway.
    async fn gateway_departed(&mut self, node: &Node) {
        let mut moved = Vec::new();
        for (fip_id, programmed) in self.installed.iter_mut() {
            let (gone, kept): (Vec<FlowRule>, Vec<FlowRule>) = mem::take(&mut programmed.rules)
                .into_iter()
                .partition(|rule| rule.device_id == node.integration_bridge);
            programmed.rules = kept;
            if let Err(e) = self.ctx.apply(&gone, false).await {
                warn!(floating_ip_id = %fip_id, error = %e, "Failed to withdraw floating IP rules");
            }
            if programmed.gateway == node.hostname {
                moved.push(fip_id.clone());
            }
        }

        for fip_id in moved {
            let Some(fip) = self.ctx.service.floating_ip(&fip_id) else {
                continue;
            };
            if fip.port_id.is_none() {
                continue;
            }
            if let Err(e) = self.associate(&fip).await {
                warn!(floating_ip = %fip.floating_ip, error = %e, "Failed to move floating IP");
            }
        }
    }

    async fn replay(&mut self) {
        for fip in self.ctx.service.floating_ips() {
            if fip.port_id.is_none() {
                continue;
            }
            if let Err(e) = self.associate(&fip).await {
                warn!(floating_ip = %fip.floating_ip, error = %e, "Failed to program floating IP");
            }
        }
    }
}

fn tunnel_endpoint(node: &Node) -> Result<std::net::Ipv4Addr, ReconcileError> {
    node.data_ip
        .ok_or_else(|| ReconcileError::missing("data IP of node", &node.hostname))
}

#[async_trait]
impl Reconciler for FloatingIpReconciler {
    const NAME: &'static str = "floating-ip";

    fn accepts(event: &NetworkEvent) -> bool {
        event.resource_type() == "floating_ip"
    }

    async fn on_network_event(&mut self, event: NetworkEvent) {
        if !self.ctx.gate.is_leader_for(LeaderRole::FloatingIp) {
            return;
        }
        let (fip, result) = match event {
            NetworkEvent::FloatingIpAssociated { floating_ip, .. } => {
                let result = self.associate(&floating_ip).await;
                (floating_ip, result)
            }
            NetworkEvent::FloatingIpDisassociated {
                floating_ip,
                port_id,
            } => {
                let bound = FloatingIp {
                    port_id: Some(port_id),
                    ..floating_ip
                };
                let result = self.disassociate(&bound).await;
                (bound, result)
            }
            NetworkEvent::FloatingIpCreated(fip) if fip.port_id.is_some() => {
                let result = self.associate(&fip).await;
                (fip, result)
            }
            NetworkEvent::FloatingIpRemoved(fip) if fip.port_id.is_some() => {
                let result = self.disassociate(&fip).await;
                (fip, result)
            }
            _ => return,
        };
        if let Err(e) = result {
            warn!(floating_ip = %fip.floating_ip, error = %e, "Failed to program floating IP");
        }
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        if event.node().node_type != NodeType::Gateway
            || !self.ctx.gate.is_leader_for(LeaderRole::FloatingIp)
        {
            return;
        }
        match event {
            NodeEvent::Complete(node) => {
                info!(node = %node.hostname, "Replaying floating IPs");
                self.replay().await;
            }
            NodeEvent::Incomplete(node) => {
                info!(node = %node.hostname, "Gateway left, moving its floating IPs");
                self.gateway_departed(&node).await;
            }
        }
    }

    async fn on_instance_port_event(&mut self, event: InstancePortEvent) {
        if !self.ctx.gate.is_leader_for(LeaderRole::FloatingIp) {
            return;
        }
        let port = event.port();
        let Some(fip) = self.ctx.service.floating_ip_of_port(&port.port_id) else {
            return;
        };
        let result = match event {
            InstancePortEvent::Detected(_) | InstancePortEvent::Updated(_) => {
                self.associate(&fip).await
            }
            InstancePortEvent::Vanished(_) => match self.installed.remove(&fip.id) {
                Some(programmed) => self.ctx.apply(&programmed.rules, false).await,
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!(floating_ip = %fip.floating_ip, error = %e, "Failed to program floating IP");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Instruction;
    use crate::model::NetworkType;
    use crate::test_util::{C2_DATA_IP, EXTERNAL_PEER_MAC, Fixture, G1_DATA_IP};
    use crate::topology::{NodeState, NodeTopologyService};
    use std::net::Ipv4Addr;

    const FLOATING: Ipv4Addr = Ipv4Addr::new(172, 24, 4, 20);
    const VM_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    fn setup(fx: &Fixture) -> (FloatingIp, InstancePort) {
        fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
        let router = fx.router("r1", Some(true));
        fx.attach("r1", "s1");
        let vm = fx.instance(1, VM_IP, "n1", "of:c2");
        fx.instance_ports.upsert(vm.clone());

        let mut fip = FloatingIp::new("f1", FLOATING).associated("p1", VM_IP);
        fip.floating_network_id = "ext".into();
        fx.service.create_floating_ip(fip.clone()).unwrap();
        fx.learn_peer_mac(&router);
        (fip, vm)
    }

    #[tokio::test]
    async fn test_associate_installs_downstream_and_upstream() {
        let fx = Fixture::new();
        let (fip, vm) = setup(&fx);

        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        reconciler.associate(&fip).await.unwrap();

        let compute = fx.flows.installed_on("of:c2");
        assert_eq!(compute.len(), 1);
        assert!(compute[0].treatment.contains(&Instruction::SetTunnelDst(G1_DATA_IP)));

        let gateway = fx.flows.installed_on("of:g1");
        assert_eq!(gateway.len(), 3);
        let external = gateway
            .iter()
            .find(|r| r.selector.ip_dst == Some(host(FLOATING)) && r.selector.in_port.is_none())
            .unwrap();
        assert!(external.treatment.contains(&Instruction::SetIpDst(VM_IP)));
        assert!(external.treatment.contains(&Instruction::SetEthDst(vm.mac)));
        assert!(external.treatment.contains(&Instruction::SetTunnelDst(C2_DATA_IP)));

        let upstream = gateway
            .iter()
            .find(|r| r.selector.ip_src == Some(host(VM_IP)))
            .unwrap();
        assert!(upstream.treatment.contains(&Instruction::SetIpSrc(FLOATING)));
        assert!(upstream.treatment.contains(&Instruction::SetEthDst(EXTERNAL_PEER_MAC)));
        assert_eq!(upstream.treatment.instructions.last(), Some(&Instruction::Output(3)));

        let internal = gateway
            .iter()
            .find(|r| r.priority == priority::FLOATING_INTERNAL)
            .unwrap();
        assert_eq!(internal.treatment.instructions.last(), Some(&Instruction::Output(IN_PORT)));
    }

    #[tokio::test]
    async fn test_disassociate_removes_exactly_its_rules() {
        let fx = Fixture::new();
        let (fip, _) = setup(&fx);
        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        reconciler.associate(&fip).await.unwrap();
        let installed = fx.flows.installed();
        fx.flows.clear_ops();

        reconciler
            .on_network_event(NetworkEvent::FloatingIpDisassociated {
                floating_ip: fip.clone().disassociated(),
                port_id: "p1".into(),
            })
            .await;

        assert!(fx.flows.installed().is_empty());
        let removed: Vec<FlowRule> = fx.flows.ops().into_iter().map(|(_, r)| r).collect();
        assert_eq!(removed.len(), installed.len());
        assert!(installed.iter().all(|r| removed.contains(r)));
    }

    #[tokio::test]
    async fn test_missing_instance_port_is_programmed_on_detection() {
        let fx = Fixture::new();
        let (fip, vm) = setup(&fx);
        fx.instance_ports.remove(vm.mac);

        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        let err = reconciler.associate(&fip).await.unwrap_err();
        assert!(matches!(err, ReconcileError::MissingDependency { kind: "instance port", .. }));
        assert!(fx.flows.installed().is_empty());

        fx.instance_ports.upsert(vm.clone());
        reconciler
            .on_instance_port_event(InstancePortEvent::Detected(vm.clone()))
            .await;
        assert_eq!(fx.flows.installed().len(), 4);

        reconciler
            .on_instance_port_event(InstancePortEvent::Vanished(vm))
            .await;
        assert!(fx.flows.installed().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_peer_mac_aborts_only_that_floating_ip() {
        let fx = Fixture::new();
        fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
        fx.router("r1", Some(true));
        fx.attach("r1", "s1");
        let vm = fx.instance(1, VM_IP, "n1", "of:c2");
        fx.instance_ports.upsert(vm);
        let fip = FloatingIp::new("f1", FLOATING).associated("p1", VM_IP);

        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        reconciler
            .on_network_event(NetworkEvent::FloatingIpAssociated {
                floating_ip: fip,
                port_id: "p1".into(),
            })
            .await;
        assert!(fx.flows.ops().is_empty());
    }

    #[tokio::test]
    async fn test_gateway_complete_replays_associations() {
        let fx = Fixture::new();
        setup(&fx);
        let mut reconciler = FloatingIpReconciler::new(fx.ctx());

        let compute = fx.topology.node("c1").unwrap();
        reconciler.on_node_event(NodeEvent::Complete(compute)).await;
        assert!(fx.flows.installed().is_empty());

        let gateway = fx.topology.node("g1").unwrap();
        reconciler.on_node_event(NodeEvent::Complete(gateway)).await;
        assert_eq!(fx.flows.installed().len(), 4);
    }

    /// Second gateway `g2` next to the fixture's `g1`; returns the hostname
    /// of the gateway selected for `f1` and the other one.
    async fn two_gateways(fx: &Fixture, reconciler: &mut FloatingIpReconciler) -> (String, String) {
        fx.topology
            .upsert(Node::gateway("g2", "of:g2", Ipv4Addr::new(192, 168, 0, 10)));
        let (fip, _) = setup(fx);
        reconciler.associate(&fip).await.unwrap();
        let selected = reconciler.installed["f1"].gateway.clone();
        let other = if selected == "g1" { "g2" } else { "g1" };
        (selected, other.to_string())
    }

    #[tokio::test]
    async fn test_departed_standby_gateway_only_withdraws_its_rules() {
        let fx = Fixture::new();
        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        let (selected, other) = two_gateways(&fx, &mut reconciler).await;
        let selected_bridge = format!("of:{selected}");
        let other_bridge = format!("of:{other}");
        let kept = fx.flows.installed_on(&selected_bridge);
        assert_eq!(fx.flows.installed_on(&other_bridge).len(), 2);
        fx.flows.clear_ops();

        fx.topology.set_state(&other, NodeState::Incomplete);
        let node = fx.topology.node(&other).unwrap();
        reconciler.on_node_event(NodeEvent::Incomplete(node)).await;

        let ops = fx.flows.ops();
        assert_eq!(ops.len(), 2);
        assert!(ops.iter().all(|(install, rule)| !install && rule.device_id == other_bridge));
        assert_eq!(fx.flows.installed_on(&selected_bridge), kept);
        assert_eq!(reconciler.installed["f1"].rules.len(), 4);
    }

    #[tokio::test]
    async fn test_departed_selected_gateway_moves_floating_ip() {
        let fx = Fixture::new();
        let mut reconciler = FloatingIpReconciler::new(fx.ctx());
        let (selected, other) = two_gateways(&fx, &mut reconciler).await;
        let other_node = fx.topology.node(&other).unwrap();

        fx.topology.set_state(&selected, NodeState::Incomplete);
        let node = fx.topology.node(&selected).unwrap();
        reconciler.on_node_event(NodeEvent::Incomplete(node)).await;

        assert!(fx.flows.installed_on(&format!("of:{selected}")).is_empty());
        assert_eq!(fx.flows.installed_on(&other_node.integration_bridge).len(), 3);
        let compute = fx.flows.installed_on("of:c2");
        assert_eq!(compute.len(), 1);
        assert!(
            compute[0]
                .treatment
                .contains(&Instruction::SetTunnelDst(other_node.data_ip.unwrap()))
        );
        assert_eq!(reconciler.installed["f1"].gateway, other);
    }
}
