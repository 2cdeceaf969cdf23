//! Domain events derived from store changes.

use crate::model::{
    ExternalGateway, FloatingIp, Network, Port, Router, RouterInterface, SecurityGroup,
    SecurityGroupRule, Subnet,
};

/// Events emitted when network objects change.
///
/// Every listener receives every event; each matches on the variants it cares
/// about and ignores the rest.
#[derive(Debug, Clone, PartialEq)]
pub enum NetworkEvent {
    // Network events
    NetworkCreated(Network),
    NetworkUpdated { old: Network, new: Network },
    NetworkRemoved(Network),

    // Subnet events
    SubnetCreated(Subnet),
    SubnetUpdated { old: Subnet, new: Subnet },
    SubnetRemoved(Subnet),

    // Port events
    PortCreated(Port),
    PortUpdated { old: Port, new: Port },
    PortRemoved(Port),
    /// A security group id appeared on an existing port.
    PortSecurityGroupAdded {
        port: Port,
        security_group_id: String,
    },
    /// A security group id disappeared from an existing port.
    PortSecurityGroupRemoved {
        port: Port,
        security_group_id: String,
    },

    // Router events
    RouterCreated(Router),
    RouterUpdated { old: Router, new: Router },
    RouterRemoved(Router),
    RouterGatewayAdded {
        router: Router,
        gateway: ExternalGateway,
    },
    RouterGatewayRemoved {
        router: Router,
        gateway: ExternalGateway,
    },

    // Router interface events
    RouterInterfaceAdded(RouterInterface),
    RouterInterfaceUpdated {
        old: RouterInterface,
        new: RouterInterface,
    },
    RouterInterfaceRemoved(RouterInterface),

    // Floating IP events
    FloatingIpCreated(FloatingIp),
    FloatingIpUpdated { old: FloatingIp, new: FloatingIp },
    FloatingIpRemoved(FloatingIp),
    FloatingIpAssociated {
        floating_ip: FloatingIp,
        port_id: String,
    },
    FloatingIpDisassociated {
        floating_ip: FloatingIp,
        port_id: String,
    },

    // Security group events
    SecurityGroupCreated(SecurityGroup),
    SecurityGroupUpdated {
        old: SecurityGroup,
        new: SecurityGroup,
    },
    SecurityGroupRemoved(SecurityGroup),
    SecurityGroupRuleCreated(SecurityGroupRule),
    SecurityGroupRuleRemoved(SecurityGroupRule),
}

impl NetworkEvent {
    /// Get the resource type this event relates to.
    pub fn resource_type(&self) -> &'static str {
        match self {
            NetworkEvent::NetworkCreated(_)
            | NetworkEvent::NetworkUpdated { .. }
            | NetworkEvent::NetworkRemoved(_) => "network",

            NetworkEvent::SubnetCreated(_)
            | NetworkEvent::SubnetUpdated { .. }
            | NetworkEvent::SubnetRemoved(_) => "subnet",

            NetworkEvent::PortCreated(_)
            | NetworkEvent::PortUpdated { .. }
            | NetworkEvent::PortRemoved(_)
            | NetworkEvent::PortSecurityGroupAdded { .. }
            | NetworkEvent::PortSecurityGroupRemoved { .. } => "port",

            NetworkEvent::RouterCreated(_)
            | NetworkEvent::RouterUpdated { .. }
            | NetworkEvent::RouterRemoved(_)
            | NetworkEvent::RouterGatewayAdded { .. }
            | NetworkEvent::RouterGatewayRemoved { .. } => "router",

            NetworkEvent::RouterInterfaceAdded(_)
            | NetworkEvent::RouterInterfaceUpdated { .. }
            | NetworkEvent::RouterInterfaceRemoved(_) => "router_interface",

            NetworkEvent::FloatingIpCreated(_)
            | NetworkEvent::FloatingIpUpdated { .. }
            | NetworkEvent::FloatingIpRemoved(_)
            | NetworkEvent::FloatingIpAssociated { .. }
            | NetworkEvent::FloatingIpDisassociated { .. } => "floating_ip",

            NetworkEvent::SecurityGroupCreated(_)
            | NetworkEvent::SecurityGroupUpdated { .. }
            | NetworkEvent::SecurityGroupRemoved(_) => "security_group",

            NetworkEvent::SecurityGroupRuleCreated(_)
            | NetworkEvent::SecurityGroupRuleRemoved(_) => "security_group_rule",
        }
    }

    /// Get the ID of the resource this event relates to.
    pub fn resource_id(&self) -> &str {
        match self {
            NetworkEvent::NetworkCreated(n) | NetworkEvent::NetworkRemoved(n) => &n.id,
            NetworkEvent::NetworkUpdated { new, .. } => &new.id,

            NetworkEvent::SubnetCreated(s) | NetworkEvent::SubnetRemoved(s) => &s.id,
            NetworkEvent::SubnetUpdated { new, .. } => &new.id,

            NetworkEvent::PortCreated(p) | NetworkEvent::PortRemoved(p) => &p.id,
            NetworkEvent::PortUpdated { new, .. } => &new.id,
            NetworkEvent::PortSecurityGroupAdded { port, .. }
            | NetworkEvent::PortSecurityGroupRemoved { port, .. } => &port.id,

            NetworkEvent::RouterCreated(r) | NetworkEvent::RouterRemoved(r) => &r.id,
            NetworkEvent::RouterUpdated { new, .. } => &new.id,
            NetworkEvent::RouterGatewayAdded { router, .. }
            | NetworkEvent::RouterGatewayRemoved { router, .. } => &router.id,

            NetworkEvent::RouterInterfaceAdded(i) | NetworkEvent::RouterInterfaceRemoved(i) => {
                &i.port_id
            }
            NetworkEvent::RouterInterfaceUpdated { new, .. } => &new.port_id,

            NetworkEvent::FloatingIpCreated(f) | NetworkEvent::FloatingIpRemoved(f) => &f.id,
            NetworkEvent::FloatingIpUpdated { new, .. } => &new.id,
            NetworkEvent::FloatingIpAssociated { floating_ip, .. }
            | NetworkEvent::FloatingIpDisassociated { floating_ip, .. } => &floating_ip.id,

            NetworkEvent::SecurityGroupCreated(sg) | NetworkEvent::SecurityGroupRemoved(sg) => {
                &sg.id
            }
            NetworkEvent::SecurityGroupUpdated { new, .. } => &new.id,

            NetworkEvent::SecurityGroupRuleCreated(r)
            | NetworkEvent::SecurityGroupRuleRemoved(r) => &r.id,
        }
    }
}

/// Secondary events for a port update: one per security group id added or removed.
///
/// Absent lists count as empty.
pub(crate) fn port_security_group_diff(old: &Port, new: &Port) -> Vec<NetworkEvent> {
    let mut events = Vec::new();
    for sg_id in new.security_group_ids() {
        if !old.has_security_group(sg_id) {
            events.push(NetworkEvent::PortSecurityGroupAdded {
                port: new.clone(),
                security_group_id: sg_id.clone(),
            });
        }
    }
    for sg_id in old.security_group_ids() {
        if !new.has_security_group(sg_id) {
            events.push(NetworkEvent::PortSecurityGroupRemoved {
                port: new.clone(),
                security_group_id: sg_id.clone(),
            });
        }
    }
    events
}

/// Secondary events for a router update: external gateway appeared, vanished or changed.
pub(crate) fn router_gateway_diff(old: &Router, new: &Router) -> Vec<NetworkEvent> {
    match (&old.external_gateway, &new.external_gateway) {
        (None, Some(gw)) => vec![NetworkEvent::RouterGatewayAdded {
            router: new.clone(),
            gateway: gw.clone(),
        }],
        (Some(gw), None) => vec![NetworkEvent::RouterGatewayRemoved {
            router: new.clone(),
            gateway: gw.clone(),
        }],
        (Some(before), Some(after)) if before != after => vec![
            NetworkEvent::RouterGatewayRemoved {
                router: new.clone(),
                gateway: before.clone(),
            },
            NetworkEvent::RouterGatewayAdded {
                router: new.clone(),
                gateway: after.clone(),
            },
        ],
        _ => Vec::new(),
    }
}

/// Secondary events for a floating IP update, driven by the port binding.
///
/// Re-binding to a different port is reported as a disassociation from the
/// old port followed by an association with the new one.
pub(crate) fn floating_ip_binding_diff(old: &FloatingIp, new: &FloatingIp) -> Vec<NetworkEvent> {
    match (&old.port_id, &new.port_id) {
        (None, Some(port_id)) => vec![NetworkEvent::FloatingIpAssociated {
            floating_ip: new.clone(),
            port_id: port_id.clone(),
        }],
        (Some(port_id), None) => vec![NetworkEvent::FloatingIpDisassociated {
            floating_ip: new.clone(),
            port_id: port_id.clone(),
        }],
        (Some(before), Some(after)) if before != after => vec![
            NetworkEvent::FloatingIpDisassociated {
                floating_ip: old.clone(),
                port_id: before.clone(),
            },
            NetworkEvent::FloatingIpAssociated {
                floating_ip: new.clone(),
                port_id: after.clone(),
            },
        ],
        _ => Vec::new(),
    }
}

/// Secondary events for a security group update: rules added or removed by id.
///
/// A rule whose body changed under the same id is removed and re-created.
pub(crate) fn security_group_rule_diff(
    old: &SecurityGroup,
    new: &SecurityGroup,
) -> Vec<NetworkEvent> {
    let mut events = Vec::new();
    for rule in &old.rules {
        match new.rule(&rule.id) {
            Some(current) if current == rule => {}
            _ => events.push(NetworkEvent::SecurityGroupRuleRemoved(rule.clone())),
        }
    }
    for rule in &new.rules {
        match old.rule(&rule.id) {
            Some(previous) if previous == rule => {}
            _ => events.push(NetworkEvent::SecurityGroupRuleCreated(rule.clone())),
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, MacAddr};
    use std::net::Ipv4Addr;

    fn port_with(sgs: Option<Vec<&str>>) -> Port {
        let mut port = Port::new("p1", "n1", MacAddr::ZERO);
        port.security_groups = sgs.map(|ids| ids.into_iter().map(String::from).collect());
        port
    }

    #[test]
    fn test_security_group_diff() {
        let old = port_with(Some(vec!["A", "B"]));
        let new = port_with(Some(vec!["B", "C"]));

        let events = port_security_group_diff(&old, &new);
        assert_eq!(events.len(), 2);
        assert!(events.iter().any(|e| matches!(
            e,
            NetworkEvent::PortSecurityGroupAdded { security_group_id, .. } if security_group_id == "C"
        )));
        assert!(events.iter().any(|e| matches!(
            e,
            NetworkEvent::PortSecurityGroupRemoved { security_group_id, .. } if security_group_id == "A"
        )));
    }

    #[test]
    fn test_security_group_diff_absent_old_list() {
        let old = port_with(None);
        let new = port_with(Some(vec!["A"]));

        let events = port_security_group_diff(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            NetworkEvent::PortSecurityGroupAdded { security_group_id, .. } if security_group_id == "A"
        ));

        assert!(port_security_group_diff(&port_with(None), &port_with(Some(vec![]))).is_empty());
    }

    #[test]
    fn test_floating_ip_binding_diff() {
        let unbound = FloatingIp::new("f1", Ipv4Addr::new(172, 24, 4, 10));
        let bound = unbound.clone().associated("p1", Ipv4Addr::new(10, 0, 0, 5));

        let events = floating_ip_binding_diff(&unbound, &bound);
        assert_eq!(
            events,
            vec![NetworkEvent::FloatingIpAssociated {
                floating_ip: bound.clone(),
                port_id: "p1".into(),
            }]
        );

        let events = floating_ip_binding_diff(&bound, &unbound);
        assert_eq!(
            events,
            vec![NetworkEvent::FloatingIpDisassociated {
                floating_ip: unbound.clone(),
                port_id: "p1".into(),
            }]
        );

        assert!(floating_ip_binding_diff(&bound, &bound).is_empty());
    }

    #[test]
    fn test_floating_ip_rebinding_is_disassociate_then_associate() {
        let first = FloatingIp::new("f1", Ipv4Addr::new(172, 24, 4, 10))
            .associated("p1", Ipv4Addr::new(10, 0, 0, 5));
        let second = first
            .clone()
            .associated("p2", Ipv4Addr::new(10, 0, 0, 6));

        let events = floating_ip_binding_diff(&first, &second);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            NetworkEvent::FloatingIpDisassociated { port_id, floating_ip } if port_id == "p1" && floating_ip == &first
        ));
        assert!(matches!(
            &events[1],
            NetworkEvent::FloatingIpAssociated { port_id, .. } if port_id == "p2"
        ));
    }

    #[test]
    fn test_router_gateway_diff() {
        let plain = Router::new("r1", "router");
        let with_gw = plain.clone().with_gateway("ext", true);
        let other_gw = plain.clone().with_gateway("ext", false);

        assert!(matches!(
            router_gateway_diff(&plain, &with_gw)[..],
            [NetworkEvent::RouterGatewayAdded { .. }]
        ));
        assert!(matches!(
            router_gateway_diff(&with_gw, &plain)[..],
            [NetworkEvent::RouterGatewayRemoved { .. }]
        ));
        assert!(matches!(
            router_gateway_diff(&with_gw, &other_gw)[..],
            [
                NetworkEvent::RouterGatewayRemoved { .. },
                NetworkEvent::RouterGatewayAdded { .. }
            ]
        ));
        assert!(router_gateway_diff(&with_gw, &with_gw).is_empty());
    }

    #[test]
    fn test_security_group_rule_diff() {
        let r1 = SecurityGroupRule::new("r1", "sg", Direction::Ingress);
        let r2 = SecurityGroupRule::new("r2", "sg", Direction::Egress);
        let mut old = SecurityGroup::new("sg", "web");
        old.rules = vec![r1.clone()];
        let mut new = old.clone();
        new.rules = vec![r2.clone()];

        let events = security_group_rule_diff(&old, &new);
        assert_eq!(
            events,
            vec![
                NetworkEvent::SecurityGroupRuleRemoved(r1),
                NetworkEvent::SecurityGroupRuleCreated(r2),
            ]
        );
    }

    #[test]
    fn test_resource_helpers() {
        let event = NetworkEvent::PortSecurityGroupAdded {
            port: port_with(None),
            security_group_id: "sg".into(),
        };
        assert_eq!(event.resource_type(), "port");
        assert_eq!(event.resource_id(), "p1");
    }
}
