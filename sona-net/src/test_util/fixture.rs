use super::{RecordingEmitter, RecordingFlowProgram};
use crate::config::NetworkingConfig;
use crate::instance_port::InMemoryInstancePorts;
use crate::leadership::{InMemoryLeadership, LeaderGate, LeaderRole};
use crate::model::{
    DEVICE_OWNER_ROUTER_GATEWAY, DEVICE_OWNER_ROUTER_INTERFACE, InstancePort, MacAddr, Network,
    NetworkType, Port, Router, RouterInterface, Subnet,
};
use crate::reconciler::ReconcilerContext;
use crate::service::NetworkService;
use crate::store::NetworkObjectStore;
use crate::topology::{InMemoryTopology, Node};
use ipnet::Ipv4Net;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

pub const C1_DATA_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 1);
pub const C2_DATA_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 2);
pub const G1_DATA_IP: Ipv4Addr = Ipv4Addr::new(192, 168, 0, 9);

/// Address of every router gateway port created by [`Fixture::router`].
pub const EXTERNAL_GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(172, 24, 4, 10);
/// Gateway of the external subnet.
pub const EXTERNAL_PEER_IP: Ipv4Addr = Ipv4Addr::new(172, 24, 4, 1);
pub const EXTERNAL_PEER_MAC: MacAddr = MacAddr([0x52, 0x54, 0x00, 0xaa, 0xbb, 0xcc]);

/// Install a test subscriber honoring `RUST_LOG`. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two compute nodes (`c1`, `c2`) and one gateway (`g1`), all complete, with
/// a local node leading every role.
///
/// Must be created inside a tokio runtime.
pub struct Fixture {
    pub service: Arc<NetworkService>,
    pub topology: Arc<InMemoryTopology>,
    pub instance_ports: Arc<InMemoryInstancePorts>,
    pub flows: Arc<RecordingFlowProgram>,
    pub emitter: Arc<RecordingEmitter>,
    pub gate: LeaderGate,
    pub config: Arc<NetworkingConfig>,
}

impl Default for Fixture {
    fn default() -> Self {
        Self::new()
    }
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(NetworkingConfig::default())
    }

    pub fn with_config(config: NetworkingConfig) -> Self {
        init_tracing();

        let topology = Arc::new(InMemoryTopology::new());
        topology.upsert(Node::compute("c1", "of:c1", C1_DATA_IP));
        topology.upsert(Node::compute("c2", "of:c2", C2_DATA_IP));
        topology.upsert(Node::gateway("g1", "of:g1", G1_DATA_IP));

        let gate = LeaderGate::new(Arc::new(InMemoryLeadership::standalone()));
        for role in LeaderRole::ALL {
            gate.enroll(role);
        }

        Fixture {
            service: Arc::new(NetworkService::new(Arc::new(
                NetworkObjectStore::in_memory(),
            ))),
            topology,
            instance_ports: Arc::new(InMemoryInstancePorts::new()),
            flows: Arc::new(RecordingFlowProgram::new()),
            emitter: Arc::new(RecordingEmitter::new()),
            gate,
            config: Arc::new(config),
        }
    }

    pub fn ctx(&self) -> ReconcilerContext {
        ReconcilerContext {
            service: self.service.clone(),
            topology: self.topology.clone(),
            instance_ports: self.instance_ports.clone(),
            flows: self.flows.clone(),
            gate: self.gate.clone(),
            config: self.config.clone(),
        }
    }

    /// Network of tenant `t1` with one subnet whose gateway is the first host.
    pub fn tenant_network(
        &self,
        network_id: &str,
        subnet_id: &str,
        network_type: NetworkType,
        segment_id: &str,
        cidr: &str,
    ) -> Subnet {
        let mut network = Network::new(network_id, network_id, network_type, segment_id);
        network.tenant_id = "t1".into();
        self.service.create_network(network).unwrap();

        let cidr: Ipv4Net = cidr.parse().unwrap();
        let mut subnet = Subnet::new(subnet_id, network_id, cidr, cidr.hosts().next());
        subnet.tenant_id = "t1".into();
        self.service.create_subnet(subnet.clone()).unwrap();
        subnet
    }

    /// External network `ext` with subnet `ext-s` (172.24.4.0/24), created once.
    pub fn external_network(&self) -> Subnet {
        if let Some(subnet) = self.service.subnet("ext-s") {
            return subnet;
        }
        self.service
            .create_network(Network::new("ext", "public", NetworkType::Flat, ""))
            .unwrap();
        let subnet = Subnet::new(
            "ext-s",
            "ext",
            "172.24.4.0/24".parse().unwrap(),
            Some(EXTERNAL_PEER_IP),
        );
        self.service.create_subnet(subnet.clone()).unwrap();
        subnet
    }

    /// Router; with `snat` set it gets an external gateway and a gateway port
    /// holding [`EXTERNAL_GATEWAY_IP`].
    pub fn router(&self, router_id: &str, snat: Option<bool>) -> Router {
        let mut router = Router::new(router_id, router_id);
        if let Some(snat) = snat {
            self.external_network();
            router = router.with_gateway("ext", snat);

            let mut port = Port::new(
                format!("gw-{router_id}"),
                "ext",
                MacAddr([0xfa, 0x16, 0x3e, 0xee, 0, 1]),
            )
            .with_fixed_ip(EXTERNAL_GATEWAY_IP, "ext-s");
            port.device_owner = DEVICE_OWNER_ROUTER_GATEWAY.into();
            port.device_id = router_id.into();
            self.service.create_port(port).unwrap();
        }
        self.service.create_router(router.clone()).unwrap();
        router
    }

    /// Attach `subnet_id` to `router_id` through a port holding the subnet gateway IP.
    pub fn attach(&self, router_id: &str, subnet_id: &str) -> RouterInterface {
        let subnet = self.service.subnet(subnet_id).unwrap();
        let mut port = Port::new(
            format!("rif-{subnet_id}"),
            &subnet.network_id,
            self.config.gateway_mac,
        );
        if let Some(gateway_ip) = subnet.gateway_ip {
            port = port.with_fixed_ip(gateway_ip, subnet_id);
        }
        port.device_owner = DEVICE_OWNER_ROUTER_INTERFACE.into();
        port.device_id = router_id.into();
        self.service.create_port(port).unwrap();

        let iface = RouterInterface::new(format!("rif-{subnet_id}"), router_id, subnet_id);
        self.service.add_router_interface(iface.clone()).unwrap();
        iface
    }

    /// Tenant port `p{n}` with MAC `fa:16:3e:00:00:{n}` and its dataplane
    /// view on `device_id`, port number `10 + n`. The instance port is not
    /// published; call `instance_ports.upsert` for that.
    pub fn instance(&self, n: u8, ip: Ipv4Addr, network_id: &str, device_id: &str) -> InstancePort {
        let mac = MacAddr([0xfa, 0x16, 0x3e, 0, 0, n]);
        let subnet_id = self
            .service
            .subnet_of_ip(network_id, ip)
            .map(|s| s.id)
            .unwrap_or_default();

        let mut port = Port::new(format!("p{n}"), network_id, mac).with_fixed_ip(ip, subnet_id);
        port.tenant_id = "t1".into();
        port.device_id = format!("vm-{n}");
        self.service.create_port(port).unwrap();

        InstancePort {
            mac,
            ip,
            network_id: network_id.into(),
            port_id: format!("p{n}"),
            device_id: device_id.into(),
            port_number: 10 + u32::from(n),
        }
    }

    /// Register the external peer router of `router` with [`EXTERNAL_PEER_MAC`].
    pub fn learn_peer_mac(&self, router: &Router) {
        self.service.derive_external_peer_router(router).unwrap();
        assert!(
            self.service
                .update_external_peer_router_mac(EXTERNAL_PEER_IP, EXTERNAL_PEER_MAC)
        );
    }
}
