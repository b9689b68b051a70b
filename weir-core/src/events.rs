//! Engine notifications.
//!
//! Commands buffer [`EngineEvent`]s and the engine fans them out to
//! registered listeners only after the command's flush succeeded. Delivery
//! is best-effort; a listener can never affect a transaction's outcome.

use serde::Serialize;
use uuid::Uuid;

use crate::entity::JobKind;
use crate::graph::NodeId;

#[derive(Clone, Debug, Serialize)]
pub enum EngineEvent {
    InstanceStarted {
        process_instance_id: Uuid,
        definition_id: Uuid,
    },
    InstanceEnded {
        process_instance_id: Uuid,
        reason: Option<String>,
    },
    InstanceSuspended {
        process_instance_id: Uuid,
        suspended: bool,
    },
    NodeEntered {
        process_instance_id: Uuid,
        execution_id: Uuid,
        node_id: NodeId,
    },
    TransitionTaken {
        execution_id: Uuid,
        transition_id: String,
    },
    JobScheduled {
        job_id: Uuid,
        kind: JobKind,
    },
    JobExecuted {
        job_id: Uuid,
    },
    JobFailed {
        job_id: Uuid,
        retries_left: i32,
        error: String,
    },
    /// Retries exhausted; the job needs operator intervention.
    JobDead {
        job_id: Uuid,
    },
    TimerFired {
        job_id: Uuid,
    },
    SubscriptionCreated {
        subscription_id: Uuid,
        event_name: String,
    },
    EventDelivered {
        subscription_id: Uuid,
        execution_id: Option<Uuid>,
        event_name: String,
    },
    /// Delivery was deferred into a job by the async-delivery flag.
    EventDeliveryDeferred {
        subscription_id: Uuid,
        job_id: Uuid,
    },
}

pub trait EngineListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Collects events into a shared vec. Test aid.
#[derive(Default)]
pub struct RecordingListener {
    events: std::sync::Mutex<Vec<EngineEvent>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events.lock().unwrap())
    }
}

impl EngineListener for RecordingListener {
    fn on_event(&self, event: &EngineEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}
