use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

use moltlink_core::PeerRef;
use moltlink_session::SessionId;

use crate::definition::now_millis;

/// Unique delegation identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DelegationId(pub Uuid);

impl DelegationId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DelegationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DelegationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

/// Payload of the `Request` envelope sent to an assignee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub delegation_id: DelegationId,
    pub skill: String,
    pub task: String,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

/// Payload of the assignee's `Reply` envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskReply {
    Success { result: Value },
    Failure { reason: String },
}

impl TaskReply {
    pub fn success(result: impl Into<Value>) -> Self {
        TaskReply::Success {
            result: result.into(),
        }
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        TaskReply::Failure {
            reason: reason.into(),
        }
    }
}

/// Why a delegation ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    /// No known agent matched the required skill; nothing was sent
    NoCandidate(String),
    /// The assignee did not reply in time
    TimedOut,
    /// The assignee answered with a failure
    Refused(String),
    /// The transport stayed unavailable past the retry budget
    Transport(String),
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::NoCandidate(skill) => write!(f, "no agent found with skill: {}", skill),
            FailureReason::TimedOut => write!(f, "timed out waiting for a reply"),
            FailureReason::Refused(reason) => write!(f, "refused by assignee: {}", reason),
            FailureReason::Transport(detail) => write!(f, "transport failure: {}", detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum DelegationState {
    Pending,
    Sent,
    Completed,
    Failed(FailureReason),
    Abandoned,
}

impl DelegationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DelegationState::Completed | DelegationState::Failed(_) | DelegationState::Abandoned
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            DelegationState::Pending => "pending",
            DelegationState::Sent => "sent",
            DelegationState::Completed => "completed",
            DelegationState::Failed(_) => "failed",
            DelegationState::Abandoned => "abandoned",
        }
    }
}

impl fmt::Display for DelegationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DelegationState::Failed(reason) => write!(f, "failed ({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// A tracked assignment of one sub-task to one peer.
///
/// Only the coordinator mutates a delegation. Once terminal it never changes
/// again; retrying means creating a new delegation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delegation {
    pub id: DelegationId,
    pub task: String,
    pub required_skill: String,
    pub priority: Priority,
    pub context: Option<String>,
    pub assignee: Option<PeerRef>,
    pub state: DelegationState,
    pub session: Option<SessionId>,
    /// Unix milliseconds
    pub created_at: u64,
    pub sent_at: Option<u64>,
    pub responded_at: Option<u64>,
    pub result: Option<Value>,
    /// Every state this delegation has been in, oldest first
    pub transitions: Vec<DelegationState>,
    /// Monotonic time the transport acknowledged the request
    #[serde(skip)]
    pub(crate) acknowledged_at: Option<Instant>,
}

impl Delegation {
    pub fn new(required_skill: &str, task: &str, priority: Priority, context: Option<String>) -> Self {
        Self {
            id: DelegationId::new(),
            task: task.to_string(),
            required_skill: required_skill.trim().to_lowercase(),
            priority,
            context,
            assignee: None,
            state: DelegationState::Pending,
            session: None,
            created_at: now_millis(),
            sent_at: None,
            responded_at: None,
            result: None,
            transitions: vec![DelegationState::Pending],
            acknowledged_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Human-readable reason for a failed delegation.
    pub fn failure(&self) -> Option<&FailureReason> {
        match &self.state {
            DelegationState::Failed(reason) => Some(reason),
            _ => None,
        }
    }

    pub fn request(&self) -> TaskRequest {
        TaskRequest {
            delegation_id: self.id,
            skill: self.required_skill.clone(),
            task: self.task.clone(),
            priority: self.priority,
            context: self.context.clone(),
        }
    }

    pub(crate) fn transition(&mut self, state: DelegationState) {
        self.state = state.clone();
        self.transitions.push(state);
    }

    pub(crate) fn mark_sent(&mut self, assignee: PeerRef) {
        self.assignee = Some(assignee);
        self.transition(DelegationState::Sent);
    }

    pub(crate) fn complete(&mut self, result: Value) {
        self.responded_at = Some(now_millis());
        self.result = Some(result);
        self.transition(DelegationState::Completed);
    }

    pub(crate) fn fail(&mut self, reason: FailureReason) {
        if matches!(reason, FailureReason::Refused(_)) {
            self.responded_at = Some(now_millis());
        }
        self.transition(DelegationState::Failed(reason));
    }

    /// Milliseconds from send acknowledgement to reply.
    pub fn response_time_ms(&self) -> Option<u64> {
        Some(self.responded_at?.saturating_sub(self.sent_at?))
    }
}
