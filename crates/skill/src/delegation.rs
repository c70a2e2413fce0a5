use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use moltlink_core::{DelegationConfig, PeerRef};
use moltlink_session::{EnvelopeKind, Received, SessionEngine, SessionError, SessionId};

use crate::definition::now_millis;
use crate::error::{Result, SkillError};
use crate::metrics::{DelegationMetrics, MetricsTracker};
use crate::registry::SkillRegistry;
use crate::router::SkillRouter;
use crate::task::{Delegation, DelegationId, DelegationState, FailureReason, Priority, TaskReply};

enum Outcome {
    Completed(Value),
    Failed(FailureReason),
}

/// Tracks delegations from creation to a terminal state.
///
/// Each delegation has at most one assignee and one outstanding request.
/// Failures are recorded on the delegation, never retried; callers retry by
/// creating a new delegation.
pub struct DelegationCoordinator {
    engine: Arc<SessionEngine>,
    router: SkillRouter,
    config: DelegationConfig,
    delegations: DashMap<DelegationId, Delegation>,
    /// Creation order, for the audit trail
    order: Mutex<Vec<DelegationId>>,
    metrics: MetricsTracker,
}

impl DelegationCoordinator {
    pub fn new(registry: Arc<SkillRegistry>, config: DelegationConfig) -> Self {
        Self {
            engine: Arc::clone(registry.engine()),
            router: SkillRouter::new(registry),
            config,
            delegations: DashMap::new(),
            order: Mutex::new(Vec::new()),
            metrics: MetricsTracker::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    pub fn create(&self, skill: &str, task: &str) -> DelegationId {
        self.create_with(skill, task, Priority::Normal, None)
    }

    /// Record a new delegation. When no known agent has `skill` it fails
    /// with `NoCandidate` straight away.
    pub fn create_with(
        &self,
        skill: &str,
        task: &str,
        priority: Priority,
        context: Option<String>,
    ) -> DelegationId {
        let mut delegation = Delegation::new(skill, task, priority, context);
        let id = delegation.id;
        let required_skill = delegation.required_skill.clone();
        let unmatched = self.router.route(&required_skill).is_err();
        if unmatched {
            delegation.fail(FailureReason::NoCandidate(required_skill.clone()));
        }

        info!(
            "Created delegation {} for '{}' ({:?})",
            id, required_skill, priority
        );
        self.delegations.insert(id, delegation);
        self.order.lock().push(id);

        if unmatched {
            warn!("Delegation {} failed: no agent found with skill {}", id, required_skill);
            self.metrics.record_failed(None);
        }
        id
    }

    /// Send a pending delegation to its best candidate.
    ///
    /// Transport failures are recorded on the delegation. Only a missing or
    /// non-pending delegation is an error.
    pub async fn dispatch(&self, id: DelegationId) -> Result<()> {
        let routed = {
            let mut delegation = self
                .delegations
                .get_mut(&id)
                .ok_or(SkillError::DelegationNotFound(id))?;
            if delegation.state != DelegationState::Pending {
                return Err(SkillError::InvalidTransition {
                    id,
                    from: delegation.state.label(),
                    to: "sent",
                });
            }

            let payload = serde_json::to_value(delegation.request())?;
            match self.router.route(&delegation.required_skill) {
                Ok(decision) => {
                    delegation.mark_sent(decision.peer.clone());
                    Some((decision.peer, payload))
                }
                Err(SkillError::NoCandidate(skill)) => {
                    delegation.fail(FailureReason::NoCandidate(skill));
                    None
                }
                Err(e) => return Err(e),
            }
        };

        // The candidate vanished between creation and dispatch.
        let Some((peer, payload)) = routed else {
            warn!("Delegation {} failed: no candidate left", id);
            self.metrics.record_failed(None);
            return Ok(());
        };

        match self.engine.send(&peer, payload).await {
            Ok(session) => {
                let abandoned = match self.delegations.get_mut(&id) {
                    Some(mut delegation) => {
                        delegation.session = Some(session);
                        delegation.sent_at = Some(now_millis());
                        delegation.acknowledged_at = Some(Instant::now());
                        delegation.state == DelegationState::Abandoned
                    }
                    None => true,
                };
                if abandoned {
                    self.release(session);
                } else {
                    info!("Delegation {} sent to {}", id, peer);
                }
                self.metrics.record_submitted(&peer);
            }
            Err(e) => {
                let reason = FailureReason::Transport(e.to_string());
                if self.settle(id, |d| d.fail(reason.clone())).is_some() {
                    warn!("Delegation {} failed: {}", id, reason);
                    self.metrics.record_failed(Some(&peer));
                }
            }
        }
        Ok(())
    }

    /// Wait for the assignee of a sent delegation to answer.
    ///
    /// Returns once the delegation is terminal; this never outlives the
    /// delegation timeout plus one polling interval.
    pub async fn await_outcome(&self, id: DelegationId) -> Result<Delegation> {
        self.expire_if_overdue(id);
        let (session, assignee) = {
            let delegation = self
                .delegations
                .get(&id)
                .ok_or(SkillError::DelegationNotFound(id))?;
            if delegation.is_terminal() {
                return Ok(delegation.clone());
            }
            match (&delegation.state, delegation.session, &delegation.assignee) {
                (DelegationState::Sent, Some(session), Some(assignee)) => (session, assignee.clone()),
                (state, _, _) => {
                    return Err(SkillError::InvalidTransition {
                        id,
                        from: state.label(),
                        to: "completed",
                    })
                }
            }
        };

        let outcome = self.wait_for_reply(session, &assignee).await;
        self.release(session);

        match outcome {
            Some(Outcome::Completed(result)) => {
                if let Some(delegation) = self.settle(id, |d| d.complete(result)) {
                    let elapsed = delegation.response_time_ms().unwrap_or_default();
                    info!("Delegation {} completed by {}", id, assignee);
                    self.metrics
                        .record_completed(&assignee, Duration::from_millis(elapsed));
                }
            }
            Some(Outcome::Failed(reason)) => {
                let timed_out = reason == FailureReason::TimedOut;
                if self.settle(id, |d| d.fail(reason.clone())).is_some() {
                    warn!("Delegation {} failed: {}", id, reason);
                    if timed_out {
                        self.metrics.record_timed_out(&assignee);
                    } else {
                        self.metrics.record_failed(Some(&assignee));
                    }
                }
            }
            None => debug!("Stopped waiting on delegation {}", id),
        }

        self.get(id).ok_or(SkillError::DelegationNotFound(id))
    }

    /// `None` when the session was cancelled underneath us.
    async fn wait_for_reply(&self, session: SessionId, assignee: &PeerRef) -> Option<Outcome> {
        let timeout = self.config.timeout();
        loop {
            let envelope = match self.engine.receive(session, timeout).await {
                Ok(Received::Envelope(envelope)) => envelope,
                Ok(Received::TimedOut) => return Some(Outcome::Failed(FailureReason::TimedOut)),
                Ok(Received::Cancelled) | Err(SessionError::UnknownSession(_)) => return None,
                Err(e) => return Some(Outcome::Failed(FailureReason::Transport(e.to_string()))),
            };

            if &envelope.sender != assignee || envelope.kind != EnvelopeKind::Reply {
                debug!(
                    "Ignoring {} from {} in session {}",
                    envelope.kind.label(),
                    envelope.sender,
                    session.short()
                );
                continue;
            }

            return Some(match serde_json::from_value::<TaskReply>(envelope.payload) {
                Ok(TaskReply::Success { result }) => Outcome::Completed(result),
                Ok(TaskReply::Failure { reason }) => Outcome::Failed(FailureReason::Refused(reason)),
                Err(e) => Outcome::Failed(FailureReason::Refused(format!(
                    "unrecognised reply: {}",
                    e
                ))),
            });
        }
    }

    /// Create, dispatch and await one delegation.
    pub async fn delegate(&self, skill: &str, task: &str) -> Result<Delegation> {
        self.delegate_with(skill, task, Priority::Normal, None).await
    }

    pub async fn delegate_with(
        &self,
        skill: &str,
        task: &str,
        priority: Priority,
        context: Option<String>,
    ) -> Result<Delegation> {
        let id = self.create_with(skill, task, priority, context);
        if let Some(delegation) = self.get(id).filter(Delegation::is_terminal) {
            return Ok(delegation);
        }
        self.dispatch(id).await?;
        self.await_outcome(id).await
    }

    /// Delegate `(skill, task)` pairs concurrently, one flow each.
    pub async fn delegate_all(&self, subtasks: &[(&str, &str)]) -> Result<Vec<Delegation>> {
        join_all(subtasks.iter().map(|(skill, task)| self.delegate(skill, task)))
            .await
            .into_iter()
            .collect()
    }

    /// Abandon a delegation that is not yet terminal. Whatever was already
    /// published stays published.
    pub fn cancel(&self, id: DelegationId) -> Result<Delegation> {
        self.expire_if_overdue(id);
        let (session, delegation) = {
            let mut delegation = self
                .delegations
                .get_mut(&id)
                .ok_or(SkillError::DelegationNotFound(id))?;
            if delegation.is_terminal() {
                return Err(SkillError::InvalidTransition {
                    id,
                    from: delegation.state.label(),
                    to: "abandoned",
                });
            }
            delegation.transition(DelegationState::Abandoned);
            (delegation.session, delegation.clone())
        };

        if let Some(session) = session {
            self.release(session);
        }
        info!("Delegation {} abandoned", id);
        self.metrics.record_abandoned();
        Ok(delegation)
    }

    /// Snapshot of one delegation. A `Sent` delegation read after its
    /// deadline has passed is settled as timed out first.
    pub fn get(&self, id: DelegationId) -> Option<Delegation> {
        self.expire_if_overdue(id);
        self.delegations.get(&id).map(|d| d.clone())
    }

    /// Every delegation, oldest first.
    pub fn history(&self) -> Vec<Delegation> {
        self.order
            .lock()
            .iter()
            .filter_map(|id| self.get(*id))
            .collect()
    }

    pub fn active_count(&self) -> usize {
        let ids: Vec<DelegationId> = self.delegations.iter().map(|d| d.id).collect();
        for id in ids {
            self.expire_if_overdue(id);
        }
        self.delegations.iter().filter(|d| !d.is_terminal()).count()
    }

    pub fn metrics(&self) -> DelegationMetrics {
        self.metrics.snapshot()
    }

    /// Apply a terminal transition if the delegation is still `Sent`.
    fn settle(&self, id: DelegationId, apply: impl FnOnce(&mut Delegation)) -> Option<Delegation> {
        let mut delegation = self.delegations.get_mut(&id)?;
        if delegation.state != DelegationState::Sent {
            return None;
        }
        apply(&mut delegation);
        Some(delegation.clone())
    }

    /// A sent delegation is overdue one polling interval after its timeout,
    /// by which time a waiting `await_outcome` has already given up.
    fn expire_if_overdue(&self, id: DelegationId) {
        let grace = self.config.timeout() + self.engine.config().poll_interval();
        let overdue = self.delegations.get(&id).is_some_and(|d| {
            d.state == DelegationState::Sent
                && d.acknowledged_at.is_some_and(|at| at.elapsed() >= grace)
        });
        if !overdue {
            return;
        }

        if let Some(delegation) = self.settle(id, |d| d.fail(FailureReason::TimedOut)) {
            warn!("Delegation {} failed: {}", id, FailureReason::TimedOut);
            if let Some(session) = delegation.session {
                self.release(session);
            }
            if let Some(assignee) = &delegation.assignee {
                self.metrics.record_timed_out(assignee);
            }
        }
    }

    fn release(&self, session: SessionId) {
        self.engine.cancel(session);
        self.engine.close(session);
    }
}
