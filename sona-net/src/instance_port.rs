//! Instance port collaborator: tenant NICs discovered on compute nodes.

use crate::listener::{ListenerId, ListenerRegistry};
use crate::model::{InstancePort, MacAddr};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, RwLock};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstancePortEvent {
    Detected(InstancePort),
    Updated(InstancePort),
    Vanished(InstancePort),
}

impl InstancePortEvent {
    pub fn port(&self) -> &InstancePort {
        match self {
            InstancePortEvent::Detected(p)
            | InstancePortEvent::Updated(p)
            | InstancePortEvent::Vanished(p) => p,
        }
    }
}

pub trait InstancePortListener: Send + Sync {
    fn event(&self, event: &InstancePortEvent);
}

/// Lookups over live instance ports plus their lifecycle stream.
pub trait InstancePortSource: Send + Sync {
    fn by_mac(&self, mac: MacAddr) -> Option<InstancePort>;

    fn by_ip(&self, ip: Ipv4Addr, network_id: &str) -> Option<InstancePort>;

    fn by_port_id(&self, port_id: &str) -> Option<InstancePort>;

    fn instance_ports(&self) -> Vec<InstancePort>;

    fn add_listener(&self, listener: Arc<dyn InstancePortListener>) -> ListenerId;

    fn remove_listener(&self, id: ListenerId) -> bool;
}

/// Single-process instance port table keyed by MAC.
#[derive(Default)]
pub struct InMemoryInstancePorts {
    ports: RwLock<HashMap<MacAddr, InstancePort>>,
    listeners: ListenerRegistry<dyn InstancePortListener>,
}

impl InMemoryInstancePorts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a port; announces Detected for a new MAC and Updated otherwise.
    pub fn upsert(&self, port: InstancePort) {
        let previous = self.ports.write().unwrap().insert(port.mac, port.clone());
        let event = match previous {
            None => InstancePortEvent::Detected(port),
            Some(old) if old == port => return,
            Some(_) => InstancePortEvent::Updated(port),
        };
        debug!(mac = %event.port().mac, ip = %event.port().ip, "instance port changed");
        self.listeners.broadcast(|l| l.event(&event));
    }

    pub fn remove(&self, mac: MacAddr) -> Option<InstancePort> {
        let removed = self.ports.write().unwrap().remove(&mac)?;
        debug!(mac = %removed.mac, "instance port vanished");
        let event = InstancePortEvent::Vanished(removed.clone());
        self.listeners.broadcast(|l| l.event(&event));
        Some(removed)
    }
}

impl InstancePortSource for InMemoryInstancePorts {
    fn by_mac(&self, mac: MacAddr) -> Option<InstancePort> {
        self.ports.read().unwrap().get(&mac).cloned()
    }

    fn by_ip(&self, ip: Ipv4Addr, network_id: &str) -> Option<InstancePort> {
        self.ports
            .read()
            .unwrap()
            .values()
            .find(|p| p.ip == ip && p.network_id == network_id)
            .cloned()
    }

    fn by_port_id(&self, port_id: &str) -> Option<InstancePort> {
        self.ports
            .read()
            .unwrap()
            .values()
            .find(|p| p.port_id == port_id)
            .cloned()
    }

    fn instance_ports(&self) -> Vec<InstancePort> {
        self.ports.read().unwrap().values().cloned().collect()
    }

    fn add_listener(&self, listener: Arc<dyn InstancePortListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<InstancePortEvent>>);

    impl InstancePortListener for Recorder {
        fn event(&self, event: &InstancePortEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    fn inst(mac: u8, ip: u8) -> InstancePort {
        InstancePort {
            mac: MacAddr([0xfa, 0x16, 0x3e, 0, 0, mac]),
            ip: Ipv4Addr::new(10, 0, 0, ip),
            network_id: "n1".into(),
            port_id: format!("p{mac}"),
            device_id: "of:c1".into(),
            port_number: u32::from(mac),
        }
    }

    #[test]
    fn test_lookups() {
        let ports = InMemoryInstancePorts::new();
        ports.upsert(inst(1, 5));

        assert!(ports.by_mac(inst(1, 5).mac).is_some());
        assert!(ports.by_ip(Ipv4Addr::new(10, 0, 0, 5), "n1").is_some());
        assert!(ports.by_ip(Ipv4Addr::new(10, 0, 0, 5), "n2").is_none());
        assert_eq!(ports.by_port_id("p1").map(|p| p.port_number), Some(1));
    }

    #[test]
    fn test_lifecycle_events() {
        let ports = InMemoryInstancePorts::new();
        let recorder = Arc::new(Recorder::default());
        ports.add_listener(recorder.clone());

        ports.upsert(inst(1, 5));
        ports.upsert(inst(1, 5));
        ports.upsert(inst(1, 6));
        ports.remove(inst(1, 6).mac);
        assert!(ports.remove(inst(1, 6).mac).is_none());

        let events = recorder.0.lock().unwrap();
        assert_eq!(
            *events,
            vec![
                InstancePortEvent::Detected(inst(1, 5)),
                InstancePortEvent::Updated(inst(1, 6)),
                InstancePortEvent::Vanished(inst(1, 6)),
            ]
        );
    }
}
