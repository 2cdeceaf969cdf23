//! Canonical network object state.
//!
//! The store wraps one versioned map per entity type and turns their change
//! notifications into [`NetworkEvent`]s. Events are derived from the maps, not
//! from the call site, so every member observing the same maps sees the same
//! event sequence regardless of who issued the write.

use super::event::{
    NetworkEvent, floating_ip_binding_diff, port_security_group_diff, router_gateway_diff,
    security_group_rule_diff,
};
use super::versioned::{
    InMemoryVersionedStore, MapEvent, MapListener, VersionedStore, put_if_absent,
    replace_existing,
};
use crate::error::{Result, StoreError};
use crate::listener::ListenerId;
use crate::model::{
    Entity, FloatingIp, Network, Port, Router, RouterInterface, SecurityGroup, SecurityGroupRule,
    Subnet,
};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// Receives every event the store emits, on the store's dispatch task.
pub trait StoreDelegate: Send + Sync {
    fn notify(&self, event: NetworkEvent);
}

/// The versioned maps backing a [`NetworkObjectStore`].
///
/// Security group rules are kept inside their owning group.
#[derive(Clone)]
pub struct StoreBackend {
    pub networks: Arc<dyn VersionedStore<String, Network>>,
    pub subnets: Arc<dyn VersionedStore<String, Subnet>>,
    pub ports: Arc<dyn VersionedStore<String, Port>>,
    pub routers: Arc<dyn VersionedStore<String, Router>>,
    pub router_interfaces: Arc<dyn VersionedStore<String, RouterInterface>>,
    pub floating_ips: Arc<dyn VersionedStore<String, FloatingIp>>,
    pub security_groups: Arc<dyn VersionedStore<String, SecurityGroup>>,
}

impl StoreBackend {
    pub fn in_memory() -> Self {
        StoreBackend {
            networks: InMemoryVersionedStore::shared(),
            subnets: InMemoryVersionedStore::shared(),
            ports: InMemoryVersionedStore::shared(),
            routers: InMemoryVersionedStore::shared(),
            router_interfaces: InMemoryVersionedStore::shared(),
            floating_ips: InMemoryVersionedStore::shared(),
            security_groups: InMemoryVersionedStore::shared(),
        }
    }
}

/// Raw map change queued for the dispatch task.
enum StoreChange {
    Network(MapEvent<String, Network>),
    Subnet(MapEvent<String, Subnet>),
    Port(MapEvent<String, Port>),
    Router(MapEvent<String, Router>),
    RouterInterface(MapEvent<String, RouterInterface>),
    FloatingIp(MapEvent<String, FloatingIp>),
    SecurityGroup(MapEvent<String, SecurityGroup>),
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Map listener that hands changes off to the dispatch queue.
struct Forwarder<V> {
    tx: mpsc::UnboundedSender<StoreChange>,
    wrap: fn(MapEvent<String, V>) -> StoreChange,
}

impl<V: Clone + Send + Sync + 'static> MapListener<String, V> for Forwarder<V> {
    fn event(&self, event: &MapEvent<String, V>) {
        // A closed queue means the store is shutting down.
        let _ = self.tx.send((self.wrap)(event.clone()));
    }
}

fn forward<V: Clone + Send + Sync + 'static>(
    map: &Arc<dyn VersionedStore<String, V>>,
    tx: &mpsc::UnboundedSender<StoreChange>,
    wrap: fn(MapEvent<String, V>) -> StoreChange,
) -> ListenerId {
    map.add_listener(Arc::new(Forwarder {
        tx: tx.clone(),
        wrap,
    }))
}

struct Registrations {
    networks: ListenerId,
    subnets: ListenerId,
    ports: ListenerId,
    routers: ListenerId,
    router_interfaces: ListenerId,
    floating_ips: ListenerId,
    security_groups: ListenerId,
}

type DelegateSlot = Arc<RwLock<Option<Arc<dyn StoreDelegate>>>>;

/// Sole writer of the per-entity maps and sole source of domain events.
pub struct NetworkObjectStore {
    backend: StoreBackend,
    delegate: DelegateSlot,
    tx: mpsc::UnboundedSender<StoreChange>,
    registrations: Mutex<Option<Registrations>>,
    task: Mutex<Option<JoinHandle<()>>>,
    /// Held across the rule id lookup and the owning group's write, so a rule
    /// id stays unique across groups.
    rule_ids: Mutex<()>,
}

impl NetworkObjectStore {
    /// Create the store and start its dispatch task. Must be called from
    /// within a tokio runtime.
    pub fn new(backend: StoreBackend) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let delegate: DelegateSlot = Arc::new(RwLock::new(None));

        let registrations = Registrations {
            networks: forward(&backend.networks, &tx, StoreChange::Network),
            subnets: forward(&backend.subnets, &tx, StoreChange::Subnet),
            ports: forward(&backend.ports, &tx, StoreChange::Port),
            routers: forward(&backend.routers, &tx, StoreChange::Router),
            router_interfaces: forward(
                &backend.router_interfaces,
                &tx,
                StoreChange::RouterInterface,
            ),
            floating_ips: forward(&backend.floating_ips, &tx, StoreChange::FloatingIp),
            security_groups: forward(&backend.security_groups, &tx, StoreChange::SecurityGroup),
        };

        let task = tokio::spawn(dispatch(rx, Arc::clone(&delegate)));

        NetworkObjectStore {
            backend,
            delegate,
            tx,
            registrations: Mutex::new(Some(registrations)),
            task: Mutex::new(Some(task)),
            rule_ids: Mutex::new(()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(StoreBackend::in_memory())
    }

    pub fn backend(&self) -> &StoreBackend {
        &self.backend
    }

    /// Install the delegate. Replaces any previous one.
    pub fn set_delegate(&self, delegate: Arc<dyn StoreDelegate>) {
        *self.delegate.write().unwrap() = Some(delegate);
    }

    pub fn unset_delegate(&self) {
        *self.delegate.write().unwrap() = None;
    }

    /// Wait until every change queued before this call has been delivered.
    pub async fn flush(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StoreChange::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
    }

    /// Stop listening to the maps, drain queued changes and stop the dispatch task.
    pub async fn close(&self) {
        self.unregister();
        let _ = self.tx.send(StoreChange::Shutdown);
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn unregister(&self) {
        let Some(ids) = self.registrations.lock().unwrap().take() else {
            return;
        };
        self.backend.networks.remove_listener(ids.networks);
        self.backend.subnets.remove_listener(ids.subnets);
        self.backend.ports.remove_listener(ids.ports);
        self.backend.routers.remove_listener(ids.routers);
        self.backend
            .router_interfaces
            .remove_listener(ids.router_interfaces);
        self.backend.floating_ips.remove_listener(ids.floating_ips);
        self.backend
            .security_groups
            .remove_listener(ids.security_groups);
    }

    // Networks

    pub fn create_network(&self, network: Network) -> Result<()> {
        create(self.backend.networks.as_ref(), network)
    }

    pub fn update_network(&self, network: Network) -> Result<()> {
        update(self.backend.networks.as_ref(), network)
    }

    pub fn remove_network(&self, id: &str) -> Option<Network> {
        remove(self.backend.networks.as_ref(), id)
    }

    pub fn network(&self, id: &str) -> Option<Network> {
        get(self.backend.networks.as_ref(), id)
    }

    pub fn networks(&self) -> Vec<Network> {
        all(self.backend.networks.as_ref())
    }

    // Subnets

    pub fn create_subnet(&self, subnet: Subnet) -> Result<()> {
        create(self.backend.subnets.as_ref(), subnet)
    }

    pub fn update_subnet(&self, subnet: Subnet) -> Result<()> {
        update(self.backend.subnets.as_ref(), subnet)
    }

    pub fn remove_subnet(&self, id: &str) -> Option<Subnet> {
        remove(self.backend.subnets.as_ref(), id)
    }

    pub fn subnet(&self, id: &str) -> Option<Subnet> {
        get(self.backend.subnets.as_ref(), id)
    }

    pub fn subnets(&self) -> Vec<Subnet> {
        all(self.backend.subnets.as_ref())
    }

    // Ports

    pub fn create_port(&self, port: Port) -> Result<()> {
        create(self.backend.ports.as_ref(), port)
    }

    pub fn update_port(&self, port: Port) -> Result<()> {
        update(self.backend.ports.as_ref(), port)
    }

    pub fn remove_port(&self, id: &str) -> Option<Port> {
        remove(self.backend.ports.as_ref(), id)
    }

    pub fn port(&self, id: &str) -> Option<Port> {
        get(self.backend.ports.as_ref(), id)
    }

    pub fn ports(&self) -> Vec<Port> {
        all(self.backend.ports.as_ref())
    }

    // Routers

    pub fn create_router(&self, router: Router) -> Result<()> {
        create(self.backend.routers.as_ref(), router)
    }

    pub fn update_router(&self, router: Router) -> Result<()> {
        update(self.backend.routers.as_ref(), router)
    }

    pub fn remove_router(&self, id: &str) -> Option<Router> {
        remove(self.backend.routers.as_ref(), id)
    }

    pub fn router(&self, id: &str) -> Option<Router> {
        get(self.backend.routers.as_ref(), id)
    }

    pub fn routers(&self) -> Vec<Router> {
        all(self.backend.routers.as_ref())
    }

    // Router interfaces, keyed by port id

    pub fn create_router_interface(&self, iface: RouterInterface) -> Result<()> {
        create(self.backend.router_interfaces.as_ref(), iface)
    }

    pub fn update_router_interface(&self, iface: RouterInterface) -> Result<()> {
        update(self.backend.router_interfaces.as_ref(), iface)
    }

    pub fn remove_router_interface(&self, port_id: &str) -> Option<RouterInterface> {
        remove(self.backend.router_interfaces.as_ref(), port_id)
    }

    pub fn router_interface(&self, port_id: &str) -> Option<RouterInterface> {
        get(self.backend.router_interfaces.as_ref(), port_id)
    }

    pub fn router_interfaces(&self) -> Vec<RouterInterface> {
        all(self.backend.router_interfaces.as_ref())
    }

    // Floating IPs

    pub fn create_floating_ip(&self, floating_ip: FloatingIp) -> Result<()> {
        create(self.backend.floating_ips.as_ref(), floating_ip)
    }

    pub fn update_floating_ip(&self, floating_ip: FloatingIp) -> Result<()> {
        update(self.backend.floating_ips.as_ref(), floating_ip)
    }

    pub fn remove_floating_ip(&self, id: &str) -> Option<FloatingIp> {
        remove(self.backend.floating_ips.as_ref(), id)
    }

    pub fn floating_ip(&self, id: &str) -> Option<FloatingIp> {
        get(self.backend.floating_ips.as_ref(), id)
    }

    pub fn floating_ips(&self) -> Vec<FloatingIp> {
        all(self.backend.floating_ips.as_ref())
    }

    // Security groups

    pub fn create_security_group(&self, sg: SecurityGroup) -> Result<()> {
        create(self.backend.security_groups.as_ref(), sg)
    }

    pub fn update_security_group(&self, sg: SecurityGroup) -> Result<()> {
        update(self.backend.security_groups.as_ref(), sg)
    }

    pub fn remove_security_group(&self, id: &str) -> Option<SecurityGroup> {
        remove(self.backend.security_groups.as_ref(), id)
    }

    pub fn security_group(&self, id: &str) -> Option<SecurityGroup> {
        get(self.backend.security_groups.as_ref(), id)
    }

    pub fn security_groups(&self) -> Vec<SecurityGroup> {
        all(self.backend.security_groups.as_ref())
    }

    // Security group rules, stored inside their owning group

    /// Append a rule to its security group.
    ///
    /// Fails with AlreadyExists if any group holds a rule with the same id and
    /// with NotFound if the owning group is absent.
    pub fn create_security_group_rule(&self, rule: SecurityGroupRule) -> Result<()> {
        let _guard = self.rule_ids.lock().unwrap();
        if self.security_group_rule(&rule.id).is_some() {
            return Err(StoreError::already_exists(SecurityGroupRule::KIND, &rule.id));
        }
        let sg_id = rule.security_group_id.clone();
        self.backend
            .security_groups
            .compute(&sg_id, &mut |_, existing| {
                let Some(sg) = existing else {
                    return Err(StoreError::not_found(SecurityGroup::KIND, &sg_id));
                };
                if sg.rule(&rule.id).is_some() {
                    return Err(StoreError::already_exists(SecurityGroupRule::KIND, &rule.id));
                }
                let mut next = sg.clone();
                next.rules.push(rule.clone());
                Ok(next)
            })
            .map(|_| ())
    }

    /// Replace a rule in place, keeping its position in the group.
    pub fn update_security_group_rule(&self, rule: SecurityGroupRule) -> Result<()> {
        let sg_id = rule.security_group_id.clone();
        self.backend
            .security_groups
            .compute(&sg_id, &mut |_, existing| {
                let position = existing
                    .and_then(|sg| sg.rules.iter().position(|r| r.id == rule.id))
                    .ok_or_else(|| StoreError::not_found(SecurityGroupRule::KIND, &rule.id))?;
                let mut next = existing.cloned().ok_or_else(|| {
                    StoreError::not_found(SecurityGroup::KIND, &rule.security_group_id)
                })?;
                next.rules[position] = rule.clone();
                Ok(next)
            })
            .map(|_| ())
    }

    /// Remove a rule from whichever group holds it.
    pub fn remove_security_group_rule(&self, rule_id: &str) -> Option<SecurityGroupRule> {
        let owner = self.security_group_rule(rule_id)?.security_group_id;
        let mut removed = None;
        let result = self
            .backend
            .security_groups
            .compute(&owner, &mut |_, existing| {
                let mut next = existing
                    .cloned()
                    .ok_or_else(|| StoreError::not_found(SecurityGroup::KIND, &owner))?;
                let position = next
                    .rules
                    .iter()
                    .position(|r| r.id == rule_id)
                    .ok_or_else(|| StoreError::not_found(SecurityGroupRule::KIND, rule_id))?;
                removed = Some(next.rules.remove(position));
                Ok(next)
            });
        match result {
            Ok(_) => removed,
            Err(e) => {
                // Lost a race with a concurrent removal.
                trace!(rule_id, error = %e, "security group rule already gone");
                None
            }
        }
    }

    pub fn security_group_rule(&self, rule_id: &str) -> Option<SecurityGroupRule> {
        self.security_groups()
            .into_iter()
            .find_map(|sg| sg.rule(rule_id).cloned())
    }

    pub fn security_group_rules(&self) -> Vec<SecurityGroupRule> {
        self.security_groups()
            .into_iter()
            .flat_map(|sg| sg.rules)
            .collect()
    }
}

impl Drop for NetworkObjectStore {
    fn drop(&mut self) {
        self.unregister();
        let _ = self.tx.send(StoreChange::Shutdown);
    }
}

fn create<E: Entity>(map: &dyn VersionedStore<String, E>, entity: E) -> Result<()> {
    let id = entity.id().to_string();
    put_if_absent(map, &id, entity, E::KIND, &id).map(|_| ())
}

fn update<E: Entity>(map: &dyn VersionedStore<String, E>, entity: E) -> Result<()> {
    let id = entity.id().to_string();
    replace_existing(map, &id, entity, E::KIND, &id).map(|_| ())
}

fn remove<E: Entity>(map: &dyn VersionedStore<String, E>, id: &str) -> Option<E> {
    map.remove(&id.to_string()).map(|v| v.value)
}

fn get<E: Entity>(map: &dyn VersionedStore<String, E>, id: &str) -> Option<E> {
    map.get(&id.to_string()).map(|v| v.value)
}

fn all<E: Entity>(map: &dyn VersionedStore<String, E>) -> Vec<E> {
    map.values().into_iter().map(|v| v.value).collect()
}

async fn dispatch(mut rx: mpsc::UnboundedReceiver<StoreChange>, delegate: DelegateSlot) {
    while let Some(change) = rx.recv().await {
        let events = match change {
            StoreChange::Flush(ack) => {
                let _ = ack.send(());
                continue;
            }
            StoreChange::Shutdown => break,
            other => to_events(other),
        };

        let Some(delegate) = delegate.read().unwrap().clone() else {
            trace!(count = events.len(), "no store delegate, dropping events");
            continue;
        };
        for event in events {
            debug!(
                resource_type = event.resource_type(),
                resource_id = event.resource_id(),
                "dispatching store event"
            );
            delegate.notify(event);
        }
    }
    debug!("store dispatcher stopped");
}

/// Plain created/updated/removed translation shared by every entity type.
fn lifecycle<V>(
    event: MapEvent<String, V>,
    created: fn(V) -> NetworkEvent,
    updated: fn(V, V) -> NetworkEvent,
    removed: fn(V) -> NetworkEvent,
) -> NetworkEvent {
    match event {
        MapEvent::Insert { new, .. } => created(new.value),
        MapEvent::Update { old, new, .. } => updated(old.value, new.value),
        MapEvent::Remove { old, .. } => removed(old.value),
    }
}

fn to_events(change: StoreChange) -> Vec<NetworkEvent> {
    match change {
        StoreChange::Network(e) => vec![lifecycle(
            e,
            NetworkEvent::NetworkCreated,
            |old, new| NetworkEvent::NetworkUpdated { old, new },
            NetworkEvent::NetworkRemoved,
        )],
        StoreChange::Subnet(e) => vec![lifecycle(
            e,
            NetworkEvent::SubnetCreated,
            |old, new| NetworkEvent::SubnetUpdated { old, new },
            NetworkEvent::SubnetRemoved,
        )],
        StoreChange::Port(e) => {
            let secondary = match &e {
                MapEvent::Update { old, new, .. } => port_security_group_diff(&old.value, &new.value),
                _ => Vec::new(),
            };
            with_secondary(
                lifecycle(
                    e,
                    NetworkEvent::PortCreated,
                    |old, new| NetworkEvent::PortUpdated { old, new },
                    NetworkEvent::PortRemoved,
                ),
                secondary,
            )
        }
        StoreChange::Router(e) => {
            let secondary = match &e {
                MapEvent::Update { old, new, .. } => router_gateway_diff(&old.value, &new.value),
                _ => Vec::new(),
            };
            with_secondary(
                lifecycle(
                    e,
                    NetworkEvent::RouterCreated,
                    |old, new| NetworkEvent::RouterUpdated { old, new },
                    NetworkEvent::RouterRemoved,
                ),
                secondary,
            )
        }
        StoreChange::RouterInterface(e) => vec![lifecycle(
            e,
            NetworkEvent::RouterInterfaceAdded,
            |old, new| NetworkEvent::RouterInterfaceUpdated { old, new },
            NetworkEvent::RouterInterfaceRemoved,
        )],
        StoreChange::FloatingIp(e) => {
            let secondary = match &e {
                MapEvent::Update { old, new, .. } => {
                    floating_ip_binding_diff(&old.value, &new.value)
                }
                _ => Vec::new(),
            };
            with_secondary(
                lifecycle(
                    e,
                    NetworkEvent::FloatingIpCreated,
                    |old, new| NetworkEvent::FloatingIpUpdated { old, new },
                    NetworkEvent::FloatingIpRemoved,
                ),
                secondary,
            )
        }
        StoreChange::SecurityGroup(e) => {
            let secondary = match &e {
                MapEvent::Update { old, new, .. } => {
                    security_group_rule_diff(&old.value, &new.value)
                }
                _ => Vec::new(),
            };
            with_secondary(
                lifecycle(
                    e,
                    NetworkEvent::SecurityGroupCreated,
                    |old, new| NetworkEvent::SecurityGroupUpdated { old, new },
                    NetworkEvent::SecurityGroupRemoved,
                ),
                secondary,
            )
        }
        StoreChange::Flush(_) | StoreChange::Shutdown => Vec::new(),
    }
}

fn with_secondary(primary: NetworkEvent, secondary: Vec<NetworkEvent>) -> Vec<NetworkEvent> {
    let mut events = Vec::with_capacity(secondary.len() + 1);
    events.push(primary);
    events.extend(secondary);
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Direction, MacAddr, NetworkType};
    use ipnet::Ipv4Net;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct Collect {
        events: Mutex<Vec<NetworkEvent>>,
    }

    impl StoreDelegate for Collect {
        fn notify(&self, event: NetworkEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    fn setup() -> (NetworkObjectStore, Arc<Collect>) {
        let store = NetworkObjectStore::in_memory();
        let collect = Arc::new(Collect::default());
        store.set_delegate(collect.clone());
        (store, collect)
    }

    fn net(id: &str) -> Network {
        Network::new(id, "net", NetworkType::Vxlan, "100")
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let (store, _) = setup();
        store.create_network(net("n1")).unwrap();
        assert_eq!(
            store.create_network(net("n1")),
            Err(StoreError::already_exists("network", "n1"))
        );

        let subnet = Subnet::new("s1", "n1", "10.0.0.0/24".parse().unwrap(), None);
        store.create_subnet(subnet.clone()).unwrap();
        assert!(matches!(
            store.create_subnet(subnet),
            Err(StoreError::AlreadyExists { .. })
        ));
    }

    #[tokio::test]
    async fn test_update_absent_fails() {
        let (store, _) = setup();
        assert_eq!(
            store.update_network(net("n1")),
            Err(StoreError::not_found("network", "n1"))
        );
        assert!(matches!(
            store.update_router(Router::new("r1", "r")),
            Err(StoreError::NotFound { .. })
        ));
        assert!(matches!(
            store.update_floating_ip(FloatingIp::new("f1", Ipv4Addr::new(1, 2, 3, 4))),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_remove_twice() {
        let (store, _) = setup();
        store.create_network(net("n1")).unwrap();

        assert_eq!(store.remove_network("n1"), Some(net("n1")));
        assert_eq!(store.remove_network("n1"), None);
        assert_eq!(store.remove_port("never"), None);
    }

    #[tokio::test]
    async fn test_events_follow_map_changes() {
        let (store, collect) = setup();
        store.create_network(net("n1")).unwrap();
        let mut renamed = net("n1");
        renamed.name = "renamed".into();
        store.update_network(renamed.clone()).unwrap();
        store.remove_network("n1");
        store.flush().await;

        let events = collect.events.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                NetworkEvent::NetworkCreated(net("n1")),
                NetworkEvent::NetworkUpdated {
                    old: net("n1"),
                    new: renamed.clone(),
                },
                NetworkEvent::NetworkRemoved(renamed),
            ]
        );
    }

    #[tokio::test]
    async fn test_port_update_emits_security_group_events() {
        let (store, collect) = setup();
        let port = Port::new("p1", "n1", MacAddr::ZERO).with_security_groups(["A", "B"]);
        store.create_port(port.clone()).unwrap();
        store
            .update_port(port.with_security_groups(["B", "C"]))
            .unwrap();
        store.flush().await;

        let events = collect.events.lock().unwrap();
        let secondary: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                NetworkEvent::PortSecurityGroupAdded {
                    security_group_id, ..
                } => Some(format!("+{security_group_id}")),
                NetworkEvent::PortSecurityGroupRemoved {
                    security_group_id, ..
                } => Some(format!("-{security_group_id}")),
                _ => None,
            })
            .collect();
        assert_eq!(secondary, vec!["+C", "-A"]);
    }

    #[tokio::test]
    async fn test_floating_ip_association_event() {
        let (store, collect) = setup();
        let fip = FloatingIp::new("f1", Ipv4Addr::new(172, 24, 4, 10));
        store.create_floating_ip(fip.clone()).unwrap();
        store
            .update_floating_ip(fip.clone().associated("p1", Ipv4Addr::new(10, 0, 0, 5)))
            .unwrap();
        store.update_floating_ip(fip).unwrap();
        store.flush().await;

        let events = collect.events.lock().unwrap();
        let associated: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, NetworkEvent::FloatingIpAssociated { port_id, .. } if port_id == "p1"))
            .collect();
        let disassociated: Vec<_> = events
            .iter()
            .filter(|e| matches!(e, NetworkEvent::FloatingIpDisassociated { port_id, .. } if port_id == "p1"))
            .collect();
        assert_eq!(associated.len(), 1);
        assert_eq!(disassociated.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_rule_creates_keep_ids_unique_across_groups() {
        let (store, _) = setup();
        let groups: Vec<String> = (0..8).map(|i| format!("sg{i}")).collect();
        for id in &groups {
            store
                .create_security_group(SecurityGroup::new(id.as_str(), "web"))
                .unwrap();
        }

        let barrier = std::sync::Barrier::new(groups.len());
        let created = std::thread::scope(|scope| {
            let handles: Vec<_> = groups
                .iter()
                .map(|sg| {
                    let store = &store;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        store
                            .create_security_group_rule(SecurityGroupRule::new(
                                "shared",
                                sg.as_str(),
                                Direction::Ingress,
                            ))
                            .is_ok()
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .filter(|ok| *ok)
                .count()
        });
        assert_eq!(created, 1);

        let owners = store
            .security_groups()
            .iter()
            .filter(|sg| sg.rule("shared").is_some())
            .count();
        assert_eq!(owners, 1);
    }

    #[tokio::test]
    async fn test_security_group_rule_lifecycle() {
        let (store, collect) = setup();
        let rule = SecurityGroupRule::new("r1", "sg1", Direction::Ingress);

        assert!(matches!(
            store.create_security_group_rule(rule.clone()),
            Err(StoreError::NotFound { .. })
        ));

        store
            .create_security_group(SecurityGroup::new("sg1", "web"))
            .unwrap();
        store.create_security_group_rule(rule.clone()).unwrap();
        assert!(matches!(
            store.create_security_group_rule(rule.clone()),
            Err(StoreError::AlreadyExists { .. })
        ));
        assert_eq!(store.security_group_rule("r1"), Some(rule.clone()));

        let widened = rule
            .clone()
            .with_remote_prefix(Ipv4Net::new(Ipv4Addr::new(10, 0, 0, 0), 8).unwrap());
        store.update_security_group_rule(widened.clone()).unwrap();

        assert_eq!(store.remove_security_group_rule("r1"), Some(widened.clone()));
        assert_eq!(store.remove_security_group_rule("r1"), None);
        store.flush().await;

        let events = collect.events.lock().unwrap();
        let rule_events: Vec<_> = events
            .iter()
            .filter(|e| e.resource_type() == "security_group_rule")
            .cloned()
            .collect();
        assert_eq!(
            rule_events,
            vec![
                NetworkEvent::SecurityGroupRuleCreated(rule.clone()),
                NetworkEvent::SecurityGroupRuleRemoved(rule),
                NetworkEvent::SecurityGroupRuleCreated(widened.clone()),
                NetworkEvent::SecurityGroupRuleRemoved(widened),
            ]
        );
    }

    #[tokio::test]
    async fn test_close_stops_delivery() {
        let (store, collect) = setup();
        store.create_network(net("n1")).unwrap();
        store.close().await;

        store.create_network(net("n2")).unwrap();
        assert_eq!(store.networks().len(), 2);
        assert_eq!(collect.events.lock().unwrap().len(), 1);
    }
}
