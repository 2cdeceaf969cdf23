//! Security group ACLs on the instance's node.
//!
//! Each rule becomes one or more allow entries in the ACL table. Traffic not
//! allowed there falls through to connection tracking, which lets established
//! flows pass and drops new ones.

use super::{Reconciler, ReconcilerContext};
use crate::error::ReconcileError;
use crate::flow::{
    Conntrack, FlowRule, PortMatch, Selector, Treatment, ct_state, host, priority, table,
};
use crate::instance_port::InstancePortEvent;
use crate::leadership::LeaderRole;
use crate::model::{Direction, EtherType, InstancePort, RuleProtocol, SecurityGroupRule};
use crate::store::NetworkEvent;
use crate::topology::{Node, NodeEvent, NodeType};
use async_trait::async_trait;
use ipnet::Ipv4Net;
use tracing::{debug, info, warn};

pub struct SecurityGroupReconciler {
    ctx: ReconcilerContext,
}

/// Cover `[min, max]` with masked port matches, largest aligned blocks first.
pub fn port_range_matches(min: u16, max: u16) -> Vec<PortMatch> {
    let mut matches = Vec::new();
    let mut start = u32::from(min);
    let end = u32::from(max);
    while start <= end {
        let mut bits = 0;
        while bits < 16 {
            let size = 1u32 << (bits + 1);
            if start % size != 0 || start + size - 1 > end {
                break;
            }
            bits += 1;
        }
        matches.push(PortMatch {
            port: start as u16,
            mask: (0xffff_u32 << bits) as u16,
        });
        start += 1 << bits;
    }
    matches
}

/// Selectors for `rule` applied to the instance at `vm`, with an optional
/// remote address. Empty when the rule cannot be expressed.
fn acl_selectors(rule: &SecurityGroupRule, vm: Ipv4Net, remote: Option<Ipv4Net>) -> Vec<Selector> {
    if rule.ether_type != EtherType::Ipv4 {
        return Vec::new();
    }

    let mut selector = match rule.direction {
        Direction::Egress => Selector::ipv4().ip_src(vm),
        Direction::Ingress => Selector::ipv4().ip_dst(vm),
    };
    if let Some(protocol) = rule.protocol {
        selector = selector.ip_proto(protocol.number());
    }
    if let Some(remote) = remote {
        if remote == vm {
            return Vec::new();
        }
        selector = match rule.direction {
            Direction::Egress => selector.ip_dst(remote),
            Direction::Ingress => selector.ip_src(remote),
        };
    }

    let with_port = |selector: Selector, port: PortMatch| match rule.direction {
        Direction::Egress => selector.tp_src(port),
        Direction::Ingress => selector.tp_dst(port),
    };
    let has_ports = matches!(rule.protocol, Some(RuleProtocol::Tcp | RuleProtocol::Udp));
    match (rule.port_range_min, rule.port_range_max) {
        (Some(min), Some(max)) if has_ports && min == max => {
            vec![with_port(selector, PortMatch::exact(min))]
        }
        (Some(min), Some(max)) if has_ports && min < max => port_range_matches(min, max)
            .into_iter()
            .map(|port| with_port(selector.clone(), port))
            .collect(),
        _ => vec![selector],
    }
}

impl SecurityGroupReconciler {
    pub fn new(ctx: ReconcilerContext) -> Self {
        SecurityGroupReconciler { ctx }
    }

    fn enabled(&self) -> bool {
        self.ctx.config.use_security_group
            && self.ctx.gate.is_leader_for(LeaderRole::SecurityGroup)
    }

    fn acl_rules(
        &self,
        instance: &InstancePort,
        rule: &SecurityGroupRule,
        remote: Option<Ipv4Net>,
    ) -> Vec<FlowRule> {
        acl_selectors(rule, host(instance.ip), remote)
            .into_iter()
            .map(|selector| {
                FlowRule::new(
                    &instance.device_id,
                    selector,
                    Treatment::new().transition(table::JUMP),
                    priority::ACL,
                    table::ACL,
                )
            })
            .collect()
    }

    /// Live instances of ports in `tenant_id` carrying `group_id`.
    fn remote_instances(&self, tenant_id: &str, group_id: &str) -> Vec<InstancePort> {
        self.ctx
            .service
            .ports()
            .into_iter()
            .filter(|port| port.tenant_id == tenant_id && port.has_security_group(group_id))
            .filter_map(|port| self.ctx.instance_ports.by_port_id(&port.id))
            .collect()
    }

    /// Flow rules realizing `rule` for `instance`. Remote group members are
    /// resolved now, against the live instance ports.
    pub fn rules_for(
        &self,
        instance: &InstancePort,
        rule: &SecurityGroupRule,
    ) -> Result<Vec<FlowRule>, ReconcileError> {
        let Some(group_id) = rule.remote_group() else {
            let remote = rule.remote_ip_prefix.filter(|prefix| prefix.prefix_len() != 0);
            return Ok(self.acl_rules(instance, rule, remote));
        };

        let port = self
            .ctx
            .service
            .port(&instance.port_id)
            .ok_or_else(|| ReconcileError::missing("port", &instance.port_id))?;
        let reversed = SecurityGroupRule {
            direction: rule.direction.reversed(),
            ..rule.clone()
        };

        let mut rules = Vec::new();
        for remote in self.remote_instances(&port.tenant_id, group_id) {
            if remote.mac == instance.mac {
                continue;
            }
            for r in [rule, &reversed] {
                rules.extend(self.acl_rules(instance, r, Some(host(remote.ip))));
                rules.extend(self.acl_rules(&remote, r, Some(host(instance.ip))));
            }
        }
        Ok(rules)
    }

    /// Apply every rule of every security group of `instance`'s port.
    async fn set_port_rules(&self, instance: &InstancePort, install: bool) {
        for sg in self.ctx.service.security_groups_of_port(&instance.port_id) {
            for rule in &sg.rules {
                self.set_rule(instance, rule, install).await;
            }
        }
    }

    async fn set_rule(&self, instance: &InstancePort, rule: &SecurityGroupRule, install: bool) {
        let result = match self.rules_for(instance, rule) {
            Ok(rules) => self.ctx.apply(&rules, install).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(rule_id = %rule.id, mac = %instance.mac, install, "ACL programmed"),
            Err(e) => warn!(
                rule_id = %rule.id,
                mac = %instance.mac,
                error = %e,
                "Failed to program security group rule"
            ),
        }
    }

    /// Apply `rule` to every live instance whose port carries its group.
    async fn set_rule_everywhere(&self, rule: &SecurityGroupRule, install: bool) {
        let instances: Vec<InstancePort> = self
            .ctx
            .service
            .ports()
            .into_iter()
            .filter(|port| port.has_security_group(&rule.security_group_id))
            .filter_map(|port| self.ctx.instance_ports.by_port_id(&port.id))
            .collect();
        for instance in &instances {
            self.set_rule(instance, rule, install).await;
        }
    }

    /// Connection tracking pipeline of a compute node.
    fn conntrack_rules(node: &Node) -> Vec<FlowRule> {
        let tracked_est = ct_state::TRACKED | ct_state::ESTABLISHED;
        let tracked_new = ct_state::TRACKED | ct_state::NEW;
        vec![
            FlowRule::new(
                &node.integration_bridge,
                Selector::ipv4().ct_state(0, ct_state::TRACKED),
                Treatment::new().conntrack(Conntrack::recirculate(table::CONNTRACK)),
                priority::CT_HOOK,
                table::ACL,
            ),
            FlowRule::new(
                &node.integration_bridge,
                Selector::ipv4().ct_state(tracked_est, tracked_est),
                Treatment::new().transition(table::JUMP),
                priority::CT,
                table::CONNTRACK,
            ),
            FlowRule::new(
                &node.integration_bridge,
                Selector::ipv4().ct_state(tracked_new, tracked_new),
                Treatment::new().drop(),
                priority::CT_DROP,
                table::CONNTRACK,
            ),
        ]
    }
}

#[async_trait]
impl Reconciler for SecurityGroupReconciler {
    const NAME: &'static str = "security-group";

    fn accepts(event: &NetworkEvent) -> bool {
        matches!(
            event,
            NetworkEvent::PortSecurityGroupAdded { .. }
                | NetworkEvent::PortSecurityGroupRemoved { .. }
                | NetworkEvent::SecurityGroupRuleCreated(_)
                | NetworkEvent::SecurityGroupRuleRemoved(_)
        )
    }

    async fn on_network_event(&mut self, event: NetworkEvent) {
        if !self.enabled() {
            return;
        }
        match event {
            NetworkEvent::PortSecurityGroupAdded {
                port,
                security_group_id,
            }
            | NetworkEvent::PortSecurityGroupRemoved {
                port,
                security_group_id,
            } if self.ctx.instance_ports.by_port_id(&port.id).is_none() => {
                debug!(port_id = %port.id, %security_group_id, "no instance port, nothing to program");
            }
            NetworkEvent::PortSecurityGroupAdded {
                port,
                security_group_id,
            } => {
                let (Some(instance), Some(sg)) = (
                    self.ctx.instance_ports.by_port_id(&port.id),
                    self.ctx.service.security_group(&security_group_id),
                ) else {
                    return;
                };
                for rule in &sg.rules {
                    self.set_rule(&instance, rule, true).await;
                }
            }
            NetworkEvent::PortSecurityGroupRemoved {
                port,
                security_group_id,
            } => {
                let (Some(instance), Some(sg)) = (
                    self.ctx.instance_ports.by_port_id(&port.id),
                    self.ctx.service.security_group(&security_group_id),
                ) else {
                    return;
                };
                for rule in &sg.rules {
                    self.set_rule(&instance, rule, false).await;
                }
            }
            NetworkEvent::SecurityGroupRuleCreated(rule) => {
                self.set_rule_everywhere(&rule, true).await
            }
            NetworkEvent::SecurityGroupRuleRemoved(rule) => {
                self.set_rule_everywhere(&rule, false).await
            }
            _ => {}
        }
    }

    async fn on_node_event(&mut self, event: NodeEvent) {
        let NodeEvent::Complete(node) = event else {
            return;
        };
        if node.node_type != NodeType::Compute || !self.enabled() {
            return;
        }
        info!(node = %node.hostname, "Initializing connection tracking tables");
        let rules = Self::conntrack_rules(&node);
        if let Err(e) = self.ctx.apply(&rules, true).await {
            warn!(node = %node.hostname, error = %e, "Failed to initialize connection tracking");
        }
    }

    async fn on_instance_port_event(&mut self, event: InstancePortEvent) {
        if !self.enabled() {
            return;
        }
        match event {
            InstancePortEvent::Detected(instance) | InstancePortEvent::Updated(instance) => {
                self.set_port_rules(&instance, true).await
            }
            InstancePortEvent::Vanished(instance) => self.set_port_rules(&instance, false).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkingConfig;
    use crate::flow::Instruction;
    use crate::model::{NetworkType, SecurityGroup};
    use crate::test_util::Fixture;
    use crate::topology::NodeTopologyService;
    use std::net::Ipv4Addr;

    const VM_A: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const VM_B: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 6);

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    /// Network, security group `web` holding `rule`, and one instance port in it.
    fn setup(fx: &Fixture, rule: SecurityGroupRule) -> InstancePort {
        fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
        let mut sg = SecurityGroup::new("web", "web");
        sg.rules.push(rule);
        fx.service.create_security_group(sg).unwrap();

        let vm = fx.instance(1, VM_A, "n1", "of:c1");
        let mut port = fx.service.port("p1").unwrap();
        port.security_groups = Some(vec!["web".into()]);
        fx.service.update_port(port).unwrap();
        fx.instance_ports.upsert(vm.clone());
        vm
    }

    #[test]
    fn test_port_range_matches() {
        assert_eq!(
            port_range_matches(1, 4),
            vec![
                PortMatch { port: 1, mask: 0xffff },
                PortMatch { port: 2, mask: 0xfffe },
                PortMatch { port: 4, mask: 0xffff },
            ]
        );
        assert_eq!(
            port_range_matches(1024, 2047),
            vec![PortMatch { port: 1024, mask: 0xfc00 }]
        );
        assert_eq!(
            port_range_matches(0, u16::MAX),
            vec![PortMatch { port: 0, mask: 0 }]
        );
    }

    #[test]
    fn test_selectors_follow_direction() {
        let vm = host(VM_A);
        let ingress = SecurityGroupRule::new("r1", "web", Direction::Ingress)
            .with_protocol(RuleProtocol::Tcp)
            .with_ports(22, 22)
            .with_remote_prefix(net("192.0.2.0/24"));
        let selectors = acl_selectors(&ingress, vm, ingress.remote_ip_prefix);
        assert_eq!(selectors.len(), 1);
        assert_eq!(selectors[0].ip_dst, Some(vm));
        assert_eq!(selectors[0].ip_src, Some(net("192.0.2.0/24")));
        assert_eq!(selectors[0].tp_dst, Some(PortMatch::exact(22)));
        assert_eq!(selectors[0].ip_proto, Some(6));

        let egress = SecurityGroupRule::new("r2", "web", Direction::Egress)
            .with_protocol(RuleProtocol::Udp)
            .with_ports(1, 4);
        let selectors = acl_selectors(&egress, vm, None);
        assert_eq!(selectors.len(), 3);
        assert!(selectors.iter().all(|s| s.ip_src == Some(vm) && s.tp_src.is_some()));
    }

    #[test]
    fn test_remote_equal_to_vm_is_skipped() {
        let vm = host(VM_A);
        let rule = SecurityGroupRule::new("r1", "web", Direction::Ingress);
        assert!(acl_selectors(&rule, vm, Some(vm)).is_empty());

        let mut v6 = rule.clone();
        v6.ether_type = EtherType::Ipv6;
        assert!(acl_selectors(&v6, vm, None).is_empty());
    }

    #[tokio::test]
    async fn test_instance_detected_installs_acl() {
        let fx = Fixture::new();
        let rule = SecurityGroupRule::new("r1", "web", Direction::Ingress)
            .with_protocol(RuleProtocol::Tcp)
            .with_ports(80, 80);
        let vm = setup(&fx, rule);

        let mut reconciler = SecurityGroupReconciler::new(fx.ctx());
        reconciler
            .on_instance_port_event(InstancePortEvent::Detected(vm.clone()))
            .await;

        let rules = fx.flows.installed_on("of:c1");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].table, table::ACL);
        assert_eq!(rules[0].treatment.instructions, vec![Instruction::Transition(table::JUMP)]);

        reconciler
            .on_instance_port_event(InstancePortEvent::Vanished(vm))
            .await;
        assert!(fx.flows.installed().is_empty());
    }

    #[tokio::test]
    async fn test_instance_updated_reinstalls_acl_where_it_runs() {
        let fx = Fixture::new();
        let rule = SecurityGroupRule::new("r1", "web", Direction::Ingress)
            .with_protocol(RuleProtocol::Tcp)
            .with_ports(22, 22);
        let vm = setup(&fx, rule);

        let mut reconciler = SecurityGroupReconciler::new(fx.ctx());
        reconciler
            .on_instance_port_event(InstancePortEvent::Detected(vm.clone()))
            .await;
        assert!(fx.flows.installed_on("of:c2").is_empty());

        let moved = InstancePort {
            device_id: "of:c2".into(),
            ..vm
        };
        fx.instance_ports.upsert(moved.clone());
        reconciler
            .on_instance_port_event(InstancePortEvent::Updated(moved))
            .await;

        let rules = fx.flows.installed_on("of:c2");
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].table, table::ACL);
        assert_eq!(rules[0].selector.ip_dst, Some(host(VM_A)));
        assert_eq!(rules[0].selector.tp_dst, Some(PortMatch::exact(22)));
    }

    #[tokio::test]
    async fn test_remote_group_expands_to_live_members() {
        let fx = Fixture::new();
        let rule = SecurityGroupRule::new("r1", "web", Direction::Ingress).with_remote_group("web");
        let vm_a = setup(&fx, rule.clone());

        let reconciler = SecurityGroupReconciler::new(fx.ctx());
        assert!(reconciler.rules_for(&vm_a, &rule).unwrap().is_empty());

        let vm_b = fx.instance(2, VM_B, "n1", "of:c2");
        let mut port = fx.service.port("p2").unwrap();
        port.security_groups = Some(vec!["web".into()]);
        fx.service.update_port(port).unwrap();
        fx.instance_ports.upsert(vm_b);

        let rules = reconciler.rules_for(&vm_a, &rule).unwrap();
        assert_eq!(rules.len(), 4);
        assert_eq!(rules.iter().filter(|r| r.device_id == "of:c1").count(), 2);
        assert!(rules.iter().any(|r| r.device_id == "of:c1"
            && r.selector.ip_dst == Some(host(VM_A))
            && r.selector.ip_src == Some(host(VM_B))));
        assert!(rules.iter().any(|r| r.device_id == "of:c2"
            && r.selector.ip_src == Some(host(VM_B))
            && r.selector.ip_dst == Some(host(VM_A))));
    }

    #[tokio::test]
    async fn test_rule_created_applies_to_group_members() {
        let fx = Fixture::new();
        let first = SecurityGroupRule::new("r1", "web", Direction::Ingress);
        setup(&fx, first);

        let mut reconciler = SecurityGroupReconciler::new(fx.ctx());
        let added = SecurityGroupRule::new("r2", "web", Direction::Egress)
            .with_protocol(RuleProtocol::Icmp);
        reconciler
            .on_network_event(NetworkEvent::SecurityGroupRuleCreated(added.clone()))
            .await;
        assert_eq!(fx.flows.installed_on("of:c1").len(), 1);

        reconciler
            .on_network_event(NetworkEvent::SecurityGroupRuleRemoved(added))
            .await;
        assert!(fx.flows.installed().is_empty());
    }

    #[tokio::test]
    async fn test_disabled_security_groups_do_nothing() {
        let fx = Fixture::with_config(NetworkingConfig {
            use_security_group: false,
            ..Default::default()
        });
        let vm = setup(&fx, SecurityGroupRule::new("r1", "web", Direction::Ingress));

        let mut reconciler = SecurityGroupReconciler::new(fx.ctx());
        reconciler
            .on_instance_port_event(InstancePortEvent::Detected(vm))
            .await;
        let node = fx.topology.node("c1").unwrap();
        reconciler.on_node_event(NodeEvent::Complete(node)).await;
        assert!(fx.flows.ops().is_empty());
    }

    #[tokio::test]
    async fn test_compute_complete_initializes_conntrack() {
        let fx = Fixture::new();
        let mut reconciler = SecurityGroupReconciler::new(fx.ctx());

        let gateway = fx.topology.node("g1").unwrap();
        reconciler.on_node_event(NodeEvent::Complete(gateway)).await;
        assert!(fx.flows.installed().is_empty());

        let node = fx.topology.node("c1").unwrap();
        reconciler.on_node_event(NodeEvent::Complete(node)).await;
        let rules = fx.flows.installed_on("of:c1");
        assert_eq!(rules.len(), 3);
        let drop = rules.iter().find(|r| r.priority == priority::CT_DROP).unwrap();
        assert_eq!(drop.table, table::CONNTRACK);
        assert!(drop.treatment.contains(&Instruction::Drop));
    }
}
