//! Command execution context.
//!
//! Everything a command touches goes through one [`CommandContext`]: an
//! explicit parameter object, never ambient state. It overlays a
//! dirty-tracking entity cache on the store, so graph interpretation is a
//! pure in-memory walk whose side effects only become durable at the flush
//! boundary, as one atomic batch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agenda::AgendaOp;
use crate::cache::DefinitionCache;
use crate::clock::Clock;
use crate::engine::EngineConfig;
use crate::entity::{
    EventKind, EventSubscription, Execution, Job, VariableValue, Variables,
};
use crate::error::{EngineError, EngineResult, StoreError};
use crate::events::EngineEvent;
use crate::graph::ProcessDefinition;
use crate::store::{DeleteRecord, EntityKind, EntityRecord, FlushBatch, ProcessStore, UpdateRecord};

// ─── Entity cache ─────────────────────────────────────────────

trait CacheEntity: Clone {
    const KIND: EntityKind;
    fn id(&self) -> Uuid;
    fn revision(&self) -> i32;
    fn set_revision(&mut self, revision: i32);
    fn into_record(self) -> EntityRecord;
}

impl CacheEntity for Execution {
    const KIND: EntityKind = EntityKind::Execution;
    fn id(&self) -> Uuid {
        self.id
    }
    fn revision(&self) -> i32 {
        self.revision
    }
    fn set_revision(&mut self, revision: i32) {
        self.revision = revision;
    }
    fn into_record(self) -> EntityRecord {
        EntityRecord::Execution(self)
    }
}

impl CacheEntity for Job {
    const KIND: EntityKind = EntityKind::Job;
    fn id(&self) -> Uuid {
        self.id
    }
    fn revision(&self) -> i32 {
        self.revision
    }
    fn set_revision(&mut self, revision: i32) {
        self.revision = revision;
    }
    fn into_record(self) -> EntityRecord {
        EntityRecord::Job(self)
    }
}

impl CacheEntity for EventSubscription {
    const KIND: EntityKind = EntityKind::EventSubscription;
    fn id(&self) -> Uuid {
        self.id
    }
    fn revision(&self) -> i32 {
        self.revision
    }
    fn set_revision(&mut self, revision: i32) {
        self.revision = revision;
    }
    fn into_record(self) -> EntityRecord {
        EntityRecord::Subscription(self)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CacheState {
    /// Created in this command, not yet persisted.
    Transient,
    /// Loaded and unchanged.
    Clean,
    /// Loaded and modified.
    Dirty,
}

struct Cached<T> {
    entity: T,
    state: CacheState,
    loaded_revision: i32,
    removed: bool,
}

struct EntityCache<T: CacheEntity> {
    entries: HashMap<Uuid, Cached<T>>,
}

impl<T: CacheEntity> Default for EntityCache<T> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<T: CacheEntity> EntityCache<T> {
    fn live(&self, id: Uuid) -> Option<&T> {
        self.entries
            .get(&id)
            .filter(|c| !c.removed)
            .map(|c| &c.entity)
    }

    fn is_removed(&self, id: Uuid) -> bool {
        self.entries.get(&id).is_some_and(|c| c.removed)
    }

    fn insert_new(&mut self, entity: T) {
        self.entries.insert(
            entity.id(),
            Cached {
                loaded_revision: entity.revision(),
                entity,
                state: CacheState::Transient,
                removed: false,
            },
        );
    }

    /// Admit a store row unless the command already holds this id.
    fn admit_clean(&mut self, entity: T) {
        self.entries.entry(entity.id()).or_insert_with(|| Cached {
            loaded_revision: entity.revision(),
            entity,
            state: CacheState::Clean,
            removed: false,
        });
    }

    fn update(&mut self, entity: T) -> EngineResult<()> {
        let id = entity.id();
        match self.entries.get_mut(&id) {
            Some(cached) if !cached.removed => {
                cached.entity = entity;
                if cached.state == CacheState::Clean {
                    cached.state = CacheState::Dirty;
                }
                Ok(())
            }
            _ => Err(EngineError::not_found(T::KIND, id)),
        }
    }

    fn remove(&mut self, id: Uuid) -> EngineResult<()> {
        match self.entries.get_mut(&id) {
            Some(cached) if !cached.removed => {
                if cached.state == CacheState::Transient {
                    // Never persisted, nothing to delete.
                    self.entries.remove(&id);
                } else {
                    cached.removed = true;
                }
                Ok(())
            }
            _ => Err(EngineError::not_found(T::KIND, id)),
        }
    }

    fn iter_live(&self) -> impl Iterator<Item = &T> + '_ {
        self.entries
            .values()
            .filter(|c| !c.removed)
            .map(|c| &c.entity)
    }

    fn contribute(&mut self, batch: &mut FlushBatch) {
        for cached in self.entries.values_mut() {
            if cached.removed {
                batch.deletes.push(DeleteRecord {
                    kind: T::KIND,
                    id: cached.entity.id(),
                    expected_revision: cached.loaded_revision,
                });
                continue;
            }
            match cached.state {
                CacheState::Transient => {
                    batch.inserts.push(cached.entity.clone().into_record());
                }
                CacheState::Dirty => {
                    let mut entity = cached.entity.clone();
                    entity.set_revision(cached.loaded_revision + 1);
                    batch.updates.push(UpdateRecord {
                        entity: entity.into_record(),
                        expected_revision: cached.loaded_revision,
                    });
                }
                CacheState::Clean => {}
            }
        }
    }
}

// ─── Command context ──────────────────────────────────────────

pub struct CommandContext {
    store: Arc<dyn ProcessStore>,
    definitions: Arc<DefinitionCache>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    agenda: VecDeque<AgendaOp>,
    executions: EntityCache<Execution>,
    jobs: EntityCache<Job>,
    subscriptions: EntityCache<EventSubscription>,
    events: Vec<EngineEvent>,
    loaded_instances: HashSet<Uuid>,
}

impl CommandContext {
    pub(crate) fn new(
        store: Arc<dyn ProcessStore>,
        definitions: Arc<DefinitionCache>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            definitions,
            clock,
            config,
            agenda: VecDeque::new(),
            executions: EntityCache::default(),
            jobs: EntityCache::default(),
            subscriptions: EntityCache::default(),
            events: Vec::new(),
            loaded_instances: HashSet::new(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn definition_cache(&self) -> &DefinitionCache {
        &self.definitions
    }

    pub async fn definition(&self, id: Uuid) -> EngineResult<Arc<ProcessDefinition>> {
        self.definitions.definition_by_id(id).await
    }

    // ── Agenda ──

    pub fn enqueue(&mut self, op: AgendaOp) {
        self.agenda.push_back(op);
    }

    pub(crate) fn next_op(&mut self) -> Option<AgendaOp> {
        self.agenda.pop_front()
    }

    // ── Notifications ──

    pub fn emit(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    pub(crate) fn take_events(&mut self) -> Vec<EngineEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Executions ──

    pub async fn execution(&mut self, id: Uuid) -> EngineResult<Execution> {
        self.try_execution(id)
            .await?
            .ok_or_else(|| EngineError::not_found(EntityKind::Execution, id))
    }

    pub async fn try_execution(&mut self, id: Uuid) -> EngineResult<Option<Execution>> {
        if self.executions.is_removed(id) {
            return Ok(None);
        }
        if let Some(found) = self.executions.live(id) {
            return Ok(Some(found.clone()));
        }
        match self.store.find_execution(id).await? {
            Some(found) => {
                self.executions.admit_clean(found.clone());
                Ok(Some(found))
            }
            None => Ok(None),
        }
    }

    /// True when this command already removed the execution: its queued
    /// agenda steps are cancelled rather than errors.
    pub fn execution_removed(&self, id: Uuid) -> bool {
        self.executions.is_removed(id)
    }

    pub fn insert_execution(&mut self, execution: Execution) {
        self.executions.insert_new(execution);
    }

    pub fn update_execution(&mut self, execution: Execution) -> EngineResult<()> {
        self.executions.update(execution)
    }

    pub fn remove_execution(&mut self, id: Uuid) -> EngineResult<()> {
        self.executions.remove(id)
    }

    /// Load the whole runtime state of an instance into the cache. Explicit
    /// and idempotent; tree walks and cascade deletes rely on it.
    pub async fn load_instance(&mut self, process_instance_id: Uuid) -> EngineResult<()> {
        if !self.loaded_instances.insert(process_instance_id) {
            return Ok(());
        }
        for execution in self.store.executions_by_instance(process_instance_id).await? {
            self.executions.admit_clean(execution);
        }
        for job in self.store.jobs_by_instance(process_instance_id).await? {
            self.jobs.admit_clean(job);
        }
        for subscription in self
            .store
            .subscriptions_by_instance(process_instance_id)
            .await?
        {
            self.subscriptions.admit_clean(subscription);
        }
        Ok(())
    }

    pub fn children_of(&self, parent_id: Uuid) -> Vec<Execution> {
        let mut children: Vec<Execution> = self
            .executions
            .iter_live()
            .filter(|e| e.parent_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|e| e.id);
        children
    }

    pub fn instance_executions(&self, process_instance_id: Uuid) -> Vec<Execution> {
        let mut found: Vec<Execution> = self
            .executions
            .iter_live()
            .filter(|e| e.process_instance_id == process_instance_id)
            .cloned()
            .collect();
        found.sort_by_key(|e| e.id);
        found
    }

    // ── Jobs ──

    pub async fn job(&mut self, id: Uuid) -> EngineResult<Job> {
        if self.jobs.is_removed(id) {
            return Err(EngineError::not_found(EntityKind::Job, id));
        }
        if let Some(found) = self.jobs.live(id) {
            return Ok(found.clone());
        }
        match self.store.find_job(id).await? {
            Some(found) => {
                self.jobs.admit_clean(found.clone());
                Ok(found)
            }
            None => Err(EngineError::not_found(EntityKind::Job, id)),
        }
    }

    pub fn insert_job(&mut self, job: Job) {
        self.emit(EngineEvent::JobScheduled {
            job_id: job.id,
            kind: job.kind,
        });
        self.jobs.insert_new(job);
    }

    pub fn update_job(&mut self, job: Job) -> EngineResult<()> {
        self.jobs.update(job)
    }

    pub fn remove_job(&mut self, id: Uuid) -> EngineResult<()> {
        self.jobs.remove(id)
    }

    pub fn instance_jobs(&self, process_instance_id: Uuid) -> Vec<Job> {
        let mut found: Vec<Job> = self
            .jobs
            .iter_live()
            .filter(|j| j.process_instance_id == Some(process_instance_id))
            .cloned()
            .collect();
        found.sort_by_key(|j| j.id);
        found
    }

    pub fn jobs_for_execution(&self, execution_id: Uuid) -> Vec<Job> {
        let mut found: Vec<Job> = self
            .jobs
            .iter_live()
            .filter(|j| j.execution_id == Some(execution_id))
            .cloned()
            .collect();
        found.sort_by_key(|j| j.id);
        found
    }

    pub async fn jobs_by_definition(&mut self, definition_id: Uuid) -> EngineResult<Vec<Job>> {
        for job in self.store.jobs_by_definition(definition_id).await? {
            self.jobs.admit_clean(job);
        }
        let mut found: Vec<Job> = self
            .jobs
            .iter_live()
            .filter(|j| j.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by_key(|j| j.id);
        Ok(found)
    }

    // ── Event subscriptions ──

    pub async fn subscription(&mut self, id: Uuid) -> EngineResult<Option<EventSubscription>> {
        if self.subscriptions.is_removed(id) {
            return Ok(None);
        }
        if let Some(found) = self.subscriptions.live(id) {
            return Ok(Some(found.clone()));
        }
        match self.store.find_subscription(id).await? {
            Some(found) => {
                self.subscriptions.admit_clean(found.clone());
                Ok(Some(found))
            }
            None => Ok(None),
        }
    }

    pub fn insert_subscription(&mut self, subscription: EventSubscription) {
        self.emit(EngineEvent::SubscriptionCreated {
            subscription_id: subscription.id,
            event_name: subscription.event_name.clone(),
        });
        self.subscriptions.insert_new(subscription);
    }

    pub fn update_subscription(&mut self, subscription: EventSubscription) -> EngineResult<()> {
        self.subscriptions.update(subscription)
    }

    pub fn remove_subscription(&mut self, id: Uuid) -> EngineResult<()> {
        self.subscriptions.remove(id)
    }

    pub fn subscriptions_for_execution(&self, execution_id: Uuid) -> Vec<EventSubscription> {
        let mut found: Vec<EventSubscription> = self
            .subscriptions
            .iter_live()
            .filter(|s| s.execution_id == Some(execution_id))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        found
    }

    pub async fn subscriptions_by_event(
        &mut self,
        kind: EventKind,
        event_name: &str,
    ) -> EngineResult<Vec<EventSubscription>> {
        for subscription in self.store.subscriptions_by_event(kind, event_name).await? {
            self.subscriptions.admit_clean(subscription);
        }
        let mut found: Vec<EventSubscription> = self
            .subscriptions
            .iter_live()
            .filter(|s| s.kind == kind && s.event_name == event_name)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    pub async fn subscriptions_by_definition(
        &mut self,
        definition_id: Uuid,
    ) -> EngineResult<Vec<EventSubscription>> {
        for subscription in self.store.subscriptions_by_definition(definition_id).await? {
            self.subscriptions.admit_clean(subscription);
        }
        let mut found: Vec<EventSubscription> = self
            .subscriptions
            .iter_live()
            .filter(|s| s.definition_id == definition_id)
            .cloned()
            .collect();
        found.sort_by_key(|s| s.id);
        Ok(found)
    }

    // ── Variables ──

    /// Scope-resolved read: this execution first, then each ancestor until
    /// found or the root is exhausted. References resolve lazily here.
    pub async fn read_variable(
        &mut self,
        execution_id: Uuid,
        name: &str,
    ) -> EngineResult<Option<serde_json::Value>> {
        let mut current = self.execution(execution_id).await?;
        loop {
            if let Some(value) = current.variables.get(name).cloned() {
                return Ok(Some(self.resolve_value(value).await?));
            }
            match current.parent_id {
                Some(parent) => current = self.execution(parent).await?,
                None => return Ok(None),
            }
        }
    }

    async fn resolve_value(&self, value: VariableValue) -> EngineResult<serde_json::Value> {
        match value {
            VariableValue::Inline(v) => Ok(v),
            VariableValue::Ref(handle) => {
                let bytes = self
                    .store
                    .get_payload(&handle)
                    .await?
                    .ok_or_else(|| StoreError::MissingPayload(handle.to_string()))?;
                Ok(serde_json::from_slice(&bytes)?)
            }
        }
    }

    async fn encode_value(&self, value: serde_json::Value) -> EngineResult<VariableValue> {
        let bytes = serde_json::to_vec(&value)?;
        if bytes.len() > self.config.inline_payload_limit {
            let handle = self.store.put_payload(bytes).await?;
            Ok(VariableValue::Ref(handle))
        } else {
            Ok(VariableValue::Inline(value))
        }
    }

    /// Encode a plain JSON map into storable values, spilling large
    /// payloads out of line by content handle.
    pub async fn encode_variables(
        &self,
        values: std::collections::BTreeMap<String, serde_json::Value>,
    ) -> EngineResult<Variables> {
        let mut encoded = Variables::new();
        for (name, value) in values {
            encoded.insert(name, self.encode_value(value).await?);
        }
        Ok(encoded)
    }

    /// Scope-resolved write: replaces the variable in the nearest ancestor
    /// holding it, otherwise sets it on the process-instance root.
    pub async fn set_variable(
        &mut self,
        execution_id: Uuid,
        name: &str,
        value: serde_json::Value,
    ) -> EngineResult<()> {
        let mut target = self.execution(execution_id).await?;
        while !target.variables.contains_key(name) {
            match target.parent_id {
                Some(parent) => target = self.execution(parent).await?,
                None => break,
            }
        }
        let encoded = self.encode_value(value).await?;
        target.variables.insert(name.to_string(), encoded);
        self.update_execution(target)
    }

    pub async fn set_variable_local(
        &mut self,
        execution_id: Uuid,
        name: &str,
        value: serde_json::Value,
    ) -> EngineResult<()> {
        let mut target = self.execution(execution_id).await?;
        let encoded = self.encode_value(value).await?;
        target.variables.insert(name.to_string(), encoded);
        self.update_execution(target)
    }

    /// Merge already-encoded values into an execution's local scope, as
    /// event delivery does with its payload.
    pub async fn merge_variables_local(
        &mut self,
        execution_id: Uuid,
        variables: &Variables,
    ) -> EngineResult<()> {
        if variables.is_empty() {
            return Ok(());
        }
        let mut target = self.execution(execution_id).await?;
        for (name, value) in variables {
            target.variables.insert(name.clone(), value.clone());
        }
        self.update_execution(target)
    }

    // ── Flush ──

    /// Build and apply the ordered batch. A revision mismatch (or a write
    /// target deleted by a racing command) surfaces as `Conflict`.
    pub(crate) async fn flush(&mut self) -> EngineResult<()> {
        let mut batch = FlushBatch::default();
        self.executions.contribute(&mut batch);
        self.subscriptions.contribute(&mut batch);
        self.jobs.contribute(&mut batch);
        if batch.is_empty() {
            return Ok(());
        }

        // Inserts land parents before children (v7 ids are creation-ordered)
        // and executions before their dependents; deletes drop dependents
        // before their executions.
        batch.inserts.sort_by_key(|r| {
            let rank = match r.kind() {
                EntityKind::Execution => 0,
                EntityKind::EventSubscription => 1,
                EntityKind::Job => 2,
            };
            (rank, r.id())
        });
        batch.deletes.sort_by_key(|d| match d.kind {
            EntityKind::Job => 0,
            EntityKind::EventSubscription => 1,
            EntityKind::Execution => 2,
        });

        match self.store.apply(batch).await {
            Ok(()) => Ok(()),
            Err(
                StoreError::Conflict { kind, id, .. }
                | StoreError::NotFound { kind, id }
                | StoreError::DuplicateId { kind, id },
            ) => Err(EngineError::Conflict { kind, id }),
            Err(other) => Err(EngineError::Store(other)),
        }
    }
}
