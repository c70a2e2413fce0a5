use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;

use moltlink_core::PeerRef;

/// Metrics for delegations
#[derive(Debug, Clone, Default, Serialize)]
pub struct DelegationMetrics {
    /// Delegations sent to an assignee
    pub total_submitted: u64,
    pub total_completed: u64,
    /// Refusals, transport failures and missing candidates
    pub total_failed: u64,
    pub total_timed_out: u64,
    pub total_abandoned: u64,
    /// Average time from send to reply (ms)
    pub avg_response_time_ms: u64,
    pub per_peer: HashMap<PeerRef, PeerMetrics>,
}

impl DelegationMetrics {
    /// Success rate over submitted delegations (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.total_submitted == 0 {
            return 0.0;
        }
        self.total_completed as f64 / self.total_submitted as f64
    }

    pub fn peer_metrics(&self, peer: &PeerRef) -> Option<&PeerMetrics> {
        self.per_peer.get(peer)
    }
}

/// Per-assignee delegation metrics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PeerMetrics {
    pub assigned: u64,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub avg_response_time_ms: u64,
}

/// Tracker for delegation metrics
pub struct MetricsTracker {
    state: RwLock<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    metrics: DelegationMetrics,
    /// Sum of all response times, for the running average
    response_total_ms: u64,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(TrackerState::default()),
        }
    }

    pub fn record_submitted(&self, peer: &PeerRef) {
        let mut state = self.state.write();
        state.metrics.total_submitted += 1;
        state.metrics.per_peer.entry(peer.clone()).or_default().assigned += 1;
    }

    pub fn record_completed(&self, peer: &PeerRef, response_time: Duration) {
        let response_ms = response_time.as_millis() as u64;
        let mut state = self.state.write();
        state.response_total_ms = state.response_total_ms.saturating_add(response_ms);
        let total_ms = state.response_total_ms;

        let metrics = &mut state.metrics;
        metrics.total_completed += 1;
        metrics.avg_response_time_ms = total_ms / metrics.total_completed;

        let peer_metrics = metrics.per_peer.entry(peer.clone()).or_default();
        peer_metrics.completed += 1;
        let total = peer_metrics.avg_response_time_ms * (peer_metrics.completed - 1);
        peer_metrics.avg_response_time_ms = (total + response_ms) / peer_metrics.completed;
    }

    /// Record a failure; `peer` is `None` when nothing was sent.
    pub fn record_failed(&self, peer: Option<&PeerRef>) {
        let mut state = self.state.write();
        state.metrics.total_failed += 1;
        if let Some(peer) = peer {
            state.metrics.per_peer.entry(peer.clone()).or_default().failed += 1;
        }
    }

    pub fn record_timed_out(&self, peer: &PeerRef) {
        let mut state = self.state.write();
        state.metrics.total_timed_out += 1;
        state.metrics.per_peer.entry(peer.clone()).or_default().timed_out += 1;
    }

    pub fn record_abandoned(&self) {
        self.state.write().metrics.total_abandoned += 1;
    }

    pub fn snapshot(&self) -> DelegationMetrics {
        self.state.read().metrics.clone()
    }
}

impl Default for MetricsTracker {
    fn default() -> Self {
        Self::new()
    }
}
