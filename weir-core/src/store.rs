//! Persistence contract.
//!
//! The engine operates exclusively through [`ProcessStore`], enabling
//! pluggable backends. Reads are plain queries returning explicit
//! `Option`/`Vec`; all writes of one command travel together in a single
//! [`FlushBatch`] that the store applies atomically, checking the expected
//! revision of every update and delete as part of the same write.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entity::{EventKind, EventSubscription, Execution, Job, PayloadHandle};
use crate::error::StoreError;

// ─── Entity addressing ────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Execution,
    Job,
    EventSubscription,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Execution => "execution",
            Self::Job => "job",
            Self::EventSubscription => "event subscription",
        };
        f.write_str(s)
    }
}

/// One entity payload inside a flush batch.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityRecord {
    Execution(Execution),
    Job(Job),
    Subscription(EventSubscription),
}

impl EntityRecord {
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Execution(_) => EntityKind::Execution,
            Self::Job(_) => EntityKind::Job,
            Self::Subscription(_) => EntityKind::EventSubscription,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            Self::Execution(e) => e.id,
            Self::Job(j) => j.id,
            Self::Subscription(s) => s.id,
        }
    }

    pub fn revision(&self) -> i32 {
        match self {
            Self::Execution(e) => e.revision,
            Self::Job(j) => j.revision,
            Self::Subscription(s) => s.revision,
        }
    }
}

/// Update carrying the revision the caller loaded; the stored row must
/// still have it for the write to apply.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateRecord {
    pub entity: EntityRecord,
    pub expected_revision: i32,
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeleteRecord {
    pub kind: EntityKind,
    pub id: Uuid,
    pub expected_revision: i32,
}

/// All pending entity changes of one command, ordered inserts → updates →
/// deletes. Applied all-or-nothing: if any revision check fails, nothing
/// is written.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlushBatch {
    pub inserts: Vec<EntityRecord>,
    pub updates: Vec<UpdateRecord>,
    pub deletes: Vec<DeleteRecord>,
}

impl FlushBatch {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

// ─── Store trait ──────────────────────────────────────────────

/// Access contract the engine requires from a durable store.
///
/// Revision checks inside [`apply`](ProcessStore::apply) are the only
/// concurrency-control mechanism between engine processes sharing one
/// store; no distributed locks are used for entity mutation.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Executions ──

    async fn find_execution(&self, id: Uuid) -> Result<Option<Execution>, StoreError>;
    async fn executions_by_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<Execution>, StoreError>;

    // ── Jobs ──

    async fn find_job(&self, id: Uuid) -> Result<Option<Job>, StoreError>;
    async fn jobs_by_instance(&self, process_instance_id: Uuid) -> Result<Vec<Job>, StoreError>;
    async fn jobs_by_definition(&self, definition_id: Uuid) -> Result<Vec<Job>, StoreError>;

    /// Jobs passing the acquisition predicate, ordered by due date.
    async fn due_jobs(&self, now: DateTime<Utc>, max: usize) -> Result<Vec<Job>, StoreError>;

    /// Process instances that currently hold a live lock on an exclusive
    /// job. Used by acquisition to skip sibling exclusive jobs.
    async fn instances_with_locked_exclusive_jobs(
        &self,
        now: DateTime<Utc>,
    ) -> Result<HashSet<Uuid>, StoreError>;

    // ── Event subscriptions ──

    async fn find_subscription(&self, id: Uuid) -> Result<Option<EventSubscription>, StoreError>;
    async fn subscriptions_by_event(
        &self,
        kind: EventKind,
        event_name: &str,
    ) -> Result<Vec<EventSubscription>, StoreError>;
    async fn subscriptions_by_instance(
        &self,
        process_instance_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError>;
    async fn subscriptions_by_definition(
        &self,
        definition_id: Uuid,
    ) -> Result<Vec<EventSubscription>, StoreError>;

    // ── Variable payload blobs ──

    /// Store a payload and return its content handle. Idempotent: storing
    /// the same bytes twice yields the same handle.
    async fn put_payload(&self, bytes: Vec<u8>) -> Result<PayloadHandle, StoreError>;
    async fn get_payload(&self, handle: &PayloadHandle) -> Result<Option<Vec<u8>>, StoreError>;

    // ── Flush ──

    /// Apply one command's writes atomically with revision checks.
    async fn apply(&self, batch: FlushBatch) -> Result<(), StoreError>;
}
