//! Router and router interface changes flowing through the running
//! reconcilers into flow rules.

mod harness;

use harness::Harness;
use ipnet::Ipv4Net;
use sona_net::flow::{CONTROLLER, FlowRule, IP_PROTO_ICMP, Instruction, host, priority};
use sona_net::model::{DEVICE_OWNER_ROUTER_GATEWAY, MacAddr, NetworkType, Port, Router};
use sona_net::test_util::EXTERNAL_GATEWAY_IP;
use std::collections::HashSet;
use std::net::Ipv4Addr;

fn cidr(s: &str) -> Ipv4Net {
    s.parse().unwrap()
}

fn touches(rule: &FlowRule, net: Ipv4Net) -> bool {
    [rule.selector.ip_src, rule.selector.ip_dst]
        .into_iter()
        .flatten()
        .any(|matched| net.contains(&matched.network()))
}

fn route_count(rules: &[FlowRule], src: &str, dst: &str) -> usize {
    rules
        .iter()
        .filter(|r| r.priority == priority::INTERNAL_ROUTING)
        .filter(|r| r.selector.ip_src == Some(cidr(src)) && r.selector.ip_dst == Some(cidr(dst)))
        .count()
}

#[tokio::test]
async fn test_router_interface_installs_routes_and_gateway_icmp_without_snat() {
    let h = Harness::start();
    h.fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
    h.fx.router("r1", None);
    h.fx.attach("r1", "s1");
    h.settle().await;

    for device in ["of:c1", "of:c2"] {
        let rules = h.fx.flows.installed_on(device);
        assert_eq!(route_count(&rules, "10.0.0.0/24", "10.0.0.0/24"), 1);
    }

    let gateway = h.fx.flows.installed_on("of:g1");
    assert!(gateway.iter().any(|r| {
        r.selector.ip_proto == Some(IP_PROTO_ICMP)
            && r.selector.ip_dst == Some(host(Ipv4Addr::new(10, 0, 0, 1)))
            && r.treatment.contains(&Instruction::Output(CONTROLLER))
    }));

    assert!(
        !h.fx
            .flows
            .installed()
            .iter()
            .any(|r| r.priority == priority::EXTERNAL_ROUTING)
    );
}

#[tokio::test]
async fn test_adding_external_gateway_enables_snat_for_existing_interfaces() {
    let h = Harness::start();
    h.fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
    h.fx.router("r1", None);
    h.fx.attach("r1", "s1");
    h.settle().await;

    h.fx.external_network();
    let mut gateway_port = Port::new("gw-r1", "ext", MacAddr([0xfa, 0x16, 0x3e, 0xee, 0, 1]))
        .with_fixed_ip(EXTERNAL_GATEWAY_IP, "ext-s");
    gateway_port.device_owner = DEVICE_OWNER_ROUTER_GATEWAY.into();
    gateway_port.device_id = "r1".into();
    h.fx.service.create_port(gateway_port).unwrap();
    h.fx.service
        .update_router(Router::new("r1", "r1").with_gateway("ext", true))
        .unwrap();
    h.settle().await;

    for device in ["of:c1", "of:c2"] {
        let snat: Vec<FlowRule> = h
            .fx
            .flows
            .installed_on(device)
            .into_iter()
            .filter(|r| r.priority == priority::EXTERNAL_ROUTING)
            .collect();
        assert_eq!(snat.len(), 1);
        assert_eq!(snat[0].selector.ip_src, Some(cidr("10.0.0.0/24")));
        assert_eq!(snat[0].selector.tunnel_id, Some(100));
        assert!(matches!(snat[0].treatment.instructions[..], [Instruction::Group(_)]));
    }
    let punted: Vec<FlowRule> = h
        .fx
        .flows
        .installed_on("of:g1")
        .into_iter()
        .filter(|r| r.priority == priority::EXTERNAL_ROUTING)
        .collect();
    assert_eq!(punted.len(), 1);
    assert!(punted[0].treatment.contains(&Instruction::Output(CONTROLLER)));
}

#[tokio::test]
async fn test_interface_removal_withdraws_only_its_routes() {
    let h = Harness::start();
    h.fx.tenant_network("n1", "s1", NetworkType::Vxlan, "100", "10.0.0.0/24");
    h.fx.tenant_network("n2", "s2", NetworkType::Vxlan, "200", "10.0.1.0/24");
    h.fx.tenant_network("n3", "s3", NetworkType::Vxlan, "300", "10.0.2.0/24");
    h.fx.router("r1", None);
    h.fx.attach("r1", "s2");
    h.fx.attach("r1", "s3");
    h.settle().await;
    let before_s1 = h.installed();

    h.fx.attach("r1", "s1");
    h.settle().await;
    let rules = h.fx.flows.installed_on("of:c1");
    assert_eq!(route_count(&rules, "10.0.0.0/24", "10.0.1.0/24"), 2);
    assert_eq!(route_count(&rules, "10.0.1.0/24", "10.0.0.0/24"), 2);
    let with_s1 = h.installed();

    h.fx.service.remove_router_interface("rif-s1").unwrap();
    h.settle().await;
    let after = h.installed();

    let s1 = cidr("10.0.0.0/24");
    let expected: HashSet<FlowRule> = with_s1.into_iter().filter(|r| !touches(r, s1)).collect();
    assert_eq!(after, expected);
    assert_eq!(after, before_s1);

    let rules = h.fx.flows.installed_on("of:c1");
    assert_eq!(route_count(&rules, "10.0.1.0/24", "10.0.1.0/24"), 1);
    assert_eq!(route_count(&rules, "10.0.1.0/24", "10.0.2.0/24"), 2);
}
