//! L2 switching: per-instance tagging and forwarding rules.

use super::{Reconciler, ReconcilerContext, Segment};
use crate::error::ReconcileError;
use crate::flow::{Conntrack, FlowRule, Selector, Treatment, host, priority, table};
use crate::instance_port::InstancePortEvent;
use crate::leadership::LeaderRole;
use crate::model::{InstancePort, MacAddr, Network, NetworkType};
use crate::topology::{NodeEvent, NodeType};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Programs tunnel/VLAN tagging at the instance's port and forwarding to it
/// from every compute node.
pub struct SwitchingReconciler {
    ctx: ReconcilerContext,
    /// Rules currently programmed per instance, so an update can retract what
    /// no longer applies (e.g. after a migration).
    installed: HashMap<MacAddr, Vec<FlowRule>>,
}

impl SwitchingReconciler {
    pub fn new(ctx: ReconcilerContext) -> Self {
        SwitchingReconciler {
            ctx,
            installed: HashMap::new(),
        }
    }

    /// Rules for `port`: tag at ingress, deliver locally, tunnel from remote nodes.
    pub fn rules_for(&self, port: &InstancePort) -> Result<Vec<FlowRule>, ReconcileError> {
        let network = self.ctx.network(&port.network_id)?;
        if network.network_type == NetworkType::Flat {
            return self.flat_rules(port, &network);
        }
        let segment = Segment::of(&network)?;
        let local = self.ctx.node_of_device(&port.device_id)?;

        let mut rules = Vec::new();

        let mut tag = segment.tagging(Treatment::new());
        if self.ctx.config.use_security_group {
            tag = tag.conntrack(Conntrack::commit());
        }
        rules.push(FlowRule::new(
            &port.device_id,
            Selector::ipv4().in_port(port.port_number),
            tag.transition(table::ACL),
            priority::TUNNEL_TAG,
            table::VTAG,
        ));

        let to_instance = segment.matching(Selector::ipv4().ip_dst(host(port.ip)));
        let local_delivery = match segment {
            Segment::Vxlan(_) => Treatment::new(),
            Segment::Vlan(_) => Treatment::new().pop_vlan(),
        };
        rules.push(FlowRule::new(
            &port.device_id,
            to_instance.clone(),
            local_delivery.set_eth_dst(port.mac).output(port.port_number),
            priority::SWITCHING,
            table::FORWARDING,
        ));

        for remote in self.ctx.topology.complete_nodes(NodeType::Compute) {
            if remote.integration_bridge == port.device_id {
                continue;
            }
            let treatment = match segment {
                Segment::Vxlan(_) => {
                    let (Some(data_ip), Some(tunnel_port)) = (local.data_ip, remote.tunnel_port)
                    else {
                        debug!(node = %remote.hostname, "no tunnel endpoint, skipping remote rule");
                        continue;
                    };
                    Treatment::new().set_tunnel_dst(data_ip).output(tunnel_port)
                }
                Segment::Vlan(_) => {
                    let Some(vlan_port) = remote.vlan_port else {
                        debug!(node = %remote.hostname, "no vlan port, skipping remote rule");
                        continue;
                    };
                    Treatment::new().set_eth_dst(port.mac).output(vlan_port)
                }
            };
            rules.push(FlowRule::new(
                &remote.integration_bridge,
                to_instance.clone(),
                treatment,
                priority::SWITCHING,
                table::FORWARDING,
            ));
        }

        Ok(rules)
    }

    /// Flat networks carry no segment: traffic is bridged untagged between the
    /// instance and the node's port on the provider physical network.
    fn flat_rules(
        &self,
        port: &InstancePort,
        network: &Network,
    ) -> Result<Vec<FlowRule>, ReconcileError> {
        let local = self.ctx.node_of_device(&port.device_id)?;
        let physical_network = network
            .physical_network
            .as_deref()
            .ok_or_else(|| ReconcileError::missing("physical network of network", &network.id))?;
        let uplink = local
            .physical_port(physical_network)
            .ok_or_else(|| ReconcileError::missing("physical port", physical_network))?;

        let to_flat = Treatment::new().transition(table::FLAT);
        let deliver = Treatment::new().output(port.port_number);
        let jump = |selector: Selector| {
            FlowRule::new(
                &port.device_id,
                selector,
                to_flat.clone(),
                priority::FLAT_JUMP,
                table::DHCP_ARP,
            )
        };
        let flat = |selector: Selector, treatment: Treatment| {
            FlowRule::new(&port.device_id, selector, treatment, priority::FLAT, table::FLAT)
        };

        Ok(vec![
            jump(Selector::new().in_port(port.port_number)),
            jump(Selector::ipv4().in_port(uplink).ip_dst(host(port.ip))),
            jump(Selector::arp().in_port(uplink).arp_tpa(port.ip)),
            flat(Selector::ipv4().ip_dst(host(port.ip)), deliver.clone()),
            flat(Selector::arp().arp_tpa(port.ip), deliver),
            flat(
                Selector::new().in_port(port.port_number),
                Treatment::new().output(uplink),
            ),
        ])
    }

    async fn install(&mut self, port: &InstancePort) -> Result<(), ReconcileError> {
        let rules = self.rules_for(port)?;
        if let Some(previous) = self.installed.get(&port.mac) {
            let stale: Vec<FlowRule> = previous
                .iter()
                .filter(|rule| !rules.contains(rule))
                .cloned()
                .collect();
            self.ctx.apply(&stale, false).await?;
        }
        let result = self.ctx.apply(&rules, true).await;
        self.installed.insert(port.mac, rules);
        result
    }

    async fn remove(&mut self, port: &InstancePort) -> Result<(), ReconcileError> {
        let rules = match self.installed.remove(&port.mac) {
            Some(rules) => rules,
            None => self.rules_for(port)?,
        };
        self.ctx.apply(&rules, false).await
    }
}

#[async_trait]
impl Reconciler for SwitchingReconciler {
    const NAME: &'static str = "switching";

    fn accepts(_event: &crate::store::NetworkEvent) -> bool {
        false
    }

    async fn on_instance_port_event(&mut self, event: InstancePortEvent) {
        if !self.ctx.gate.is_leader_for(LeaderRole::Switching) {
            return;
        }
        let result = match &event {
            InstancePortEvent::Detected(port) | InstancePortEvent::Updated(port) => {
                self.install(port).await
            }
            InstancePortEvent::Vanished(port) => self.remove(port).await,
        };
        if let Err(e) = result {
            warn!(mac = %event.port().mac, error = %e, "Failed to program switching rules");
        }
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let NodeEvent::Complete(node) = event else {
            return;
        };
        if node.node_type != NodeType::Compute
            || !self.ctx.gate.is_leader_for(LeaderRole::Switching)
        {
            return;
        }
        let ports = self.ctx.instance_ports.instance_ports();
        info!(node = %node.hostname, count = ports.len(), "Replaying switching rules");
        for port in ports {
            if let Err(e) = self.install(&port).await {
                warn!(mac = %port.mac, error = %e, "Failed to program switching rules");
            }
        }
    }
}
