//! Durable runtime entities: executions, jobs, event subscriptions.
//!
//! Every mutable entity carries a `revision` used for optimistic locking:
//! a successful update increments it by exactly 1, and an update submitted
//! with a stale revision is rejected by the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::graph::NodeId;

// ─── Variables ────────────────────────────────────────────────

/// Content address of an out-of-line variable payload (hex SHA-256).
/// Immutable once written: a new value always produces a new handle.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PayloadHandle(pub String);

impl PayloadHandle {
    pub fn for_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut hex = String::with_capacity(64);
        for b in digest {
            hex.push_str(&format!("{b:02x}"));
        }
        PayloadHandle(hex)
    }
}

impl std::fmt::Display for PayloadHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A variable value, inline or stored by reference. References are resolved
/// lazily on first read.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableValue {
    Inline(serde_json::Value),
    Ref(PayloadHandle),
}

pub type Variables = BTreeMap<String, VariableValue>;

/// Convenience for building an inline variable map from JSON values.
pub fn inline_variables<I, K>(entries: I) -> Variables
where
    I: IntoIterator<Item = (K, serde_json::Value)>,
    K: Into<String>,
{
    entries
        .into_iter()
        .map(|(k, v)| (k.into(), VariableValue::Inline(v)))
        .collect()
}

// ─── Execution (token) ────────────────────────────────────────

/// One node of the runtime token tree of a process instance.
///
/// The tree is an arena keyed by id with parent-id back-pointers; it is
/// rebuildable purely from persisted rows.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    /// `None` only for the process-instance root.
    pub parent_id: Option<Uuid>,
    pub process_instance_id: Uuid,
    pub definition_id: Uuid,
    pub tenant_id: Option<String>,
    /// Current graph node, `None` while acting purely as a scope parent.
    pub node_id: Option<NodeId>,
    /// Active executions are "at" a node awaiting their next step.
    pub is_active: bool,
    /// Created by a fork; subject to join counting.
    pub is_concurrent: bool,
    /// Owns its own variable namespace and completion semantics.
    pub is_scope: bool,
    pub suspended: bool,
    pub revision: i32,
    pub variables: Variables,
}

impl Execution {
    /// Root execution of a fresh process instance. Its id doubles as the
    /// process-instance id.
    pub fn new_root(definition_id: Uuid, tenant_id: Option<String>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            parent_id: None,
            process_instance_id: id,
            definition_id,
            tenant_id,
            node_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            suspended: false,
            revision: 1,
            variables: Variables::new(),
        }
    }

    /// Child token under `parent`, inheriting instance and tenant.
    pub fn new_child(parent: &Execution, concurrent: bool, scope: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            parent_id: Some(parent.id),
            process_instance_id: parent.process_instance_id,
            definition_id: parent.definition_id,
            tenant_id: parent.tenant_id.clone(),
            node_id: None,
            is_active: true,
            is_concurrent: concurrent,
            is_scope: scope,
            suspended: parent.suspended,
            revision: 1,
            variables: Variables::new(),
        }
    }

    pub fn is_process_instance(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ─── Event subscriptions ──────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Signal,
    Message,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Signal => "signal",
            Self::Message => "message",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a subscription is satisfiable from anywhere or only from throws
/// scoped to its own process instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionScope {
    Global,
    ProcessInstance,
}

/// Durable record of "someone is waiting for event (kind, name)".
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventSubscription {
    pub id: Uuid,
    pub kind: EventKind,
    pub event_name: String,
    pub correlation_key: Option<String>,
    pub scope: SubscriptionScope,
    /// Waiting execution; `None` for definition-level start subscriptions.
    pub execution_id: Option<Uuid>,
    pub process_instance_id: Option<Uuid>,
    pub definition_id: Uuid,
    /// Catching node (or triggered start event) the subscription belongs to.
    pub node_id: Option<NodeId>,
    pub tenant_id: Option<String>,
    /// Deliver through a job in a later command instead of in-command.
    pub async_delivery: bool,
    pub created_at: DateTime<Utc>,
    pub revision: i32,
}

// ─── Jobs ─────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Immediate asynchronous continuation of an execution.
    Continuation,
    Timer,
    /// Deferred delivery of a correlated event.
    EventDelivery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Continuation => "continuation",
            Self::Timer => "timer",
            Self::EventDelivery => "event_delivery",
        }
    }
}

/// Typed handler dispatch for a job. Serialized with the job row, so a
/// different engine process can pick the job up and run it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum JobHandler {
    /// Resume `execution_id` past its async service task.
    AsyncContinuation { execution_id: Uuid },
    /// Fire an intermediate timer: resume `execution_id` past its catch node.
    TimerFire { execution_id: Uuid },
    /// Start a new instance of `definition_id` at the timer start `node_id`.
    TimerStart { definition_id: Uuid, node_id: NodeId },
    /// Deliver a previously correlated event to its subscription.
    EventDelivery {
        subscription_id: Uuid,
        variables: Variables,
    },
}

/// Repetition of a timer job: reschedule instead of delete on success.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimerCycle {
    pub interval_ms: i64,
    /// Remaining fires after the next one; `None` = unbounded.
    pub repeat: Option<u32>,
}

/// Durable unit of deferred work with due date, lock lease and retry state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub handler: JobHandler,
    pub due_date: DateTime<Utc>,
    pub lock_owner: Option<String>,
    pub lock_expiration: Option<DateTime<Utc>>,
    pub retries: i32,
    pub last_failure: Option<String>,
    /// Never run concurrently with other exclusive jobs of the same instance.
    pub exclusive: bool,
    pub execution_id: Option<Uuid>,
    pub process_instance_id: Option<Uuid>,
    pub definition_id: Uuid,
    pub tenant_id: Option<String>,
    pub suspended: bool,
    pub cycle: Option<TimerCycle>,
    pub revision: i32,
}

impl Job {
    /// Acquisition predicate: due, unlocked (or lease expired), retries
    /// left, and not hidden by suspension.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended
            && self.retries > 0
            && self.due_date <= now
            && self.lock_expiration.map_or(true, |exp| exp < now)
    }

    /// A live lock: owner set and lease not yet expired.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration.map_or(false, |exp| exp >= now)
    }

    /// Dead jobs are out of retries and need operator intervention.
    pub fn is_dead(&self) -> bool {
        self.retries <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(due: DateTime<Utc>) -> Job {
        Job {
            id: Uuid::now_v7(),
            kind: JobKind::Timer,
            handler: JobHandler::TimerFire {
                execution_id: Uuid::now_v7(),
            },
            due_date: due,
            lock_owner: None,
            lock_expiration: None,
            retries: 3,
            last_failure: None,
            exclusive: true,
            execution_id: None,
            process_instance_id: None,
            definition_id: Uuid::now_v7(),
            tenant_id: None,
            suspended: false,
            cycle: None,
            revision: 1,
        }
    }

    #[test]
    fn acquirable_matrix() {
        let now = Utc::now();

        let due = job(now - Duration::seconds(1));
        assert!(due.is_acquirable(now));

        let future = job(now + Duration::seconds(10));
        assert!(!future.is_acquirable(now));

        let mut suspended = job(now - Duration::seconds(1));
        suspended.suspended = true;
        assert!(!suspended.is_acquirable(now));

        let mut dead = job(now - Duration::seconds(1));
        dead.retries = 0;
        assert!(!dead.is_acquirable(now));
        assert!(dead.is_dead());

        let mut locked = job(now - Duration::seconds(1));
        locked.lock_owner = Some("other".into());
        locked.lock_expiration = Some(now + Duration::minutes(5));
        assert!(!locked.is_acquirable(now));
        assert!(locked.is_locked(now));

        let mut expired_lease = job(now - Duration::seconds(1));
        expired_lease.lock_owner = Some("crashed".into());
        expired_lease.lock_expiration = Some(now - Duration::seconds(1));
        assert!(expired_lease.is_acquirable(now));
        assert!(!expired_lease.is_locked(now));
    }

    #[test]
    fn payload_handle_is_content_addressed() {
        let a = PayloadHandle::for_bytes(b"{\"amount\":1}");
        let b = PayloadHandle::for_bytes(b"{\"amount\":1}");
        let c = PayloadHandle::for_bytes(b"{\"amount\":2}");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.0.len(), 64);
    }

    #[test]
    fn child_execution_inherits_instance_and_tenant() {
        let mut root = Execution::new_root(Uuid::now_v7(), Some("acme".into()));
        root.node_id = Some("fork".into());

        let child = Execution::new_child(&root, true, false);
        assert_eq!(child.parent_id, Some(root.id));
        assert_eq!(child.process_instance_id, root.id);
        assert_eq!(child.tenant_id.as_deref(), Some("acme"));
        assert!(child.is_concurrent);
        assert!(!child.is_scope);
        assert_eq!(child.revision, 1);
    }
}
