//! Shared setup for integration tests: a fixture with every reconciler
//! running on its own task.

#![allow(dead_code)]

use sona_net::flow::FlowRule;
use sona_net::reconciler::ReconcilerSet;
use sona_net::service::NetworkListener;
use sona_net::store::NetworkEvent;
use sona_net::test_util::Fixture;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

pub struct Harness {
    pub fx: Fixture,
    pub set: ReconcilerSet,
}

impl Harness {
    pub fn start() -> Self {
        let fx = Fixture::new();
        let set = ReconcilerSet::start(&fx.ctx());
        Harness { fx, set }
    }

    /// Wait until every earlier mutation has been seen and handled by every
    /// reconciler.
    pub async fn settle(&self) {
        self.fx.service.flush().await;
        self.set.flush().await;
    }

    pub fn installed(&self) -> HashSet<FlowRule> {
        self.fx.flows.installed().into_iter().collect()
    }

    /// Subscribe a recorder to the facade.
    pub fn record_events(&self) -> Arc<EventLog> {
        let log = Arc::new(EventLog::default());
        self.fx.service.add_listener(log.clone());
        log
    }
}

#[derive(Default)]
pub struct EventLog(Mutex<Vec<NetworkEvent>>);

impl EventLog {
    pub fn take(&self) -> Vec<NetworkEvent> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl NetworkListener for EventLog {
    fn event(&self, event: &NetworkEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}
