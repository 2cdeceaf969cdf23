//! Leadership gating for dataplane side effects.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Cluster leadership election primitive.
pub trait LeadershipProvider: Send + Sync {
    /// Enter the election for `topic`.
    fn run_for_leadership(&self, topic: &str);

    /// Leave the election for `topic`.
    fn withdraw(&self, topic: &str);

    /// Current leader of `topic`, if any.
    fn leader(&self, topic: &str) -> Option<String>;

    /// Identity of the local node.
    fn local_node_id(&self) -> String;
}

/// Logical roles whose side effects are restricted to one cluster member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeaderRole {
    Switching,
    Routing,
    FloatingIp,
    SecurityGroup,
    ArpResponder,
    IcmpResponder,
    DhcpResponder,
}

impl LeaderRole {
    pub const ALL: [LeaderRole; 7] = [
        LeaderRole::Switching,
        LeaderRole::Routing,
        LeaderRole::FloatingIp,
        LeaderRole::SecurityGroup,
        LeaderRole::ArpResponder,
        LeaderRole::IcmpResponder,
        LeaderRole::DhcpResponder,
    ];

    /// Election topic for this role.
    pub fn topic(self) -> &'static str {
        match self {
            LeaderRole::Switching => "sona.switching",
            LeaderRole::Routing => "sona.routing",
            LeaderRole::FloatingIp => "sona.floating-ip",
            LeaderRole::SecurityGroup => "sona.security-group",
            LeaderRole::ArpResponder => "sona.arp",
            LeaderRole::IcmpResponder => "sona.icmp",
            LeaderRole::DhcpResponder => "sona.dhcp",
        }
    }
}

impl fmt::Display for LeaderRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.topic())
    }
}

/// Answers "is this node authoritative for role X right now?".
///
/// The answer is best effort: leadership may move between the check and the
/// side effect. Reconcilers re-check at execution time.
#[derive(Clone)]
pub struct LeaderGate {
    provider: Arc<dyn LeadershipProvider>,
}

impl LeaderGate {
    pub fn new(provider: Arc<dyn LeadershipProvider>) -> Self {
        LeaderGate { provider }
    }

    pub fn enroll(&self, role: LeaderRole) {
        debug!(%role, "running for leadership");
        self.provider.run_for_leadership(role.topic());
    }

    pub fn withdraw(&self, role: LeaderRole) {
        debug!(%role, "withdrawing from leadership");
        self.provider.withdraw(role.topic());
    }

    /// True iff the local node is the elected leader for `role`.
    /// No leader means false.
    pub fn is_leader_for(&self, role: LeaderRole) -> bool {
        self.provider
            .leader(role.topic())
            .is_some_and(|leader| leader == self.provider.local_node_id())
    }

    pub fn local_node_id(&self) -> String {
        self.provider.local_node_id()
    }
}

/// Shared in-process election board. The first candidate of a topic leads
/// until it withdraws; the next candidate in line then takes over.
#[derive(Default)]
pub struct ElectionBoard {
    candidates: RwLock<HashMap<String, Vec<String>>>,
}

impl ElectionBoard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn enter(&self, topic: &str, node_id: &str) {
        let mut candidates = self.candidates.write().unwrap();
        let queue = candidates.entry(topic.to_string()).or_default();
        if !queue.iter().any(|c| c == node_id) {
            queue.push(node_id.to_string());
            if queue.len() == 1 {
                info!(topic, node_id, "elected leader");
            }
        }
    }

    fn leave(&self, topic: &str, node_id: &str) {
        let mut candidates = self.candidates.write().unwrap();
        if let Some(queue) = candidates.get_mut(topic) {
            let was_leader = queue.first().is_some_and(|c| c == node_id);
            queue.retain(|c| c != node_id);
            if was_leader && let Some(next) = queue.first() {
                info!(topic, node_id = %next, "leadership moved");
            }
        }
    }

    fn leader(&self, topic: &str) -> Option<String> {
        self.candidates
            .read()
            .unwrap()
            .get(topic)
            .and_then(|queue| queue.first().cloned())
    }
}

/// One cluster member's view of an [`ElectionBoard`].
pub struct InMemoryLeadership {
    node_id: String,
    board: Arc<ElectionBoard>,
}

impl InMemoryLeadership {
    pub fn new(node_id: impl Into<String>, board: Arc<ElectionBoard>) -> Self {
        InMemoryLeadership {
            node_id: node_id.into(),
            board,
        }
    }

    /// Standalone member with a random node id and a private board.
    pub fn standalone() -> Self {
        Self::new(Uuid::new_v4().to_string(), ElectionBoard::new())
    }
}

impl LeadershipProvider for InMemoryLeadership {
    fn run_for_leadership(&self, topic: &str) {
        self.board.enter(topic, &self.node_id);
    }

    fn withdraw(&self, topic: &str) {
        self.board.leave(topic, &self.node_id);
    }

    fn leader(&self, topic: &str) -> Option<String> {
        self.board.leader(topic)
    }

    fn local_node_id(&self) -> String {
        self.node_id.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_leader_means_false() {
        let gate = LeaderGate::new(Arc::new(InMemoryLeadership::standalone()));
        assert!(!gate.is_leader_for(LeaderRole::Routing));
    }

    #[test]
    fn test_first_candidate_leads() {
        let board = ElectionBoard::new();
        let a = LeaderGate::new(Arc::new(InMemoryLeadership::new("a", board.clone())));
        let b = LeaderGate::new(Arc::new(InMemoryLeadership::new("b", board.clone())));

        a.enroll(LeaderRole::Routing);
        b.enroll(LeaderRole::Routing);
        b.enroll(LeaderRole::FloatingIp);

        assert!(a.is_leader_for(LeaderRole::Routing));
        assert!(!b.is_leader_for(LeaderRole::Routing));
        assert!(b.is_leader_for(LeaderRole::FloatingIp));
        assert!(!a.is_leader_for(LeaderRole::FloatingIp));
    }

    #[test]
    fn test_withdraw_hands_over() {
        let board = ElectionBoard::new();
        let a = LeaderGate::new(Arc::new(InMemoryLeadership::new("a", board.clone())));
        let b = LeaderGate::new(Arc::new(InMemoryLeadership::new("b", board.clone())));

        a.enroll(LeaderRole::Routing);
        b.enroll(LeaderRole::Routing);
        a.withdraw(LeaderRole::Routing);

        assert!(!a.is_leader_for(LeaderRole::Routing));
        assert!(b.is_leader_for(LeaderRole::Routing));

        b.withdraw(LeaderRole::Routing);
        assert!(!b.is_leader_for(LeaderRole::Routing));
    }
}
