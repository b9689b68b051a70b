//! The engine facade.
//!
//! Wires the store, the definition cache, the clock and the listeners
//! together, and exposes the single entry point the outside world uses:
//! [`ProcessEngine::execute_command`]. Conflicts retry the whole command a
//! bounded number of times; everything else surfaces as-is.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{DefinitionCache, DefinitionResolver};
use crate::clock::{Clock, SystemClock};
use crate::command::Command;
use crate::commands::{ReconcileDefinition, RetireDefinition, SetDefinitionJobsSuspended};
use crate::context::CommandContext;
use crate::entity::{EventSubscription, Execution, Job};
use crate::error::EngineResult;
use crate::events::{EngineEvent, EngineListener};
use crate::graph::NodeId;
use crate::store::ProcessStore;

#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Conflict retries per command before the failure reaches the caller.
    pub command_retries: u32,
    /// Retry budget given to freshly created jobs.
    pub default_job_retries: i32,
    /// Whether engine-created jobs default to per-instance exclusivity.
    pub exclusive_jobs: bool,
    /// Variable values serializing larger than this are stored by
    /// reference instead of inline.
    pub inline_payload_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            command_retries: 3,
            default_job_retries: 3,
            exclusive_jobs: true,
            inline_payload_limit: 4096,
        }
    }
}

pub struct ProcessEngine {
    store: Arc<dyn ProcessStore>,
    definitions: Arc<DefinitionCache>,
    clock: Arc<dyn Clock>,
    listeners: Vec<Arc<dyn EngineListener>>,
    config: EngineConfig,
}

impl ProcessEngine {
    pub fn new(store: Arc<dyn ProcessStore>, resolver: Arc<dyn DefinitionResolver>) -> Self {
        Self {
            store,
            definitions: Arc::new(DefinitionCache::new(resolver)),
            clock: Arc::new(SystemClock),
            listeners: Vec::new(),
            config: EngineConfig::default(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EngineListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.store
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn definition_cache(&self) -> &Arc<DefinitionCache> {
        &self.definitions
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Run one command to completion: body, agenda drain, flush. On a
    /// conflict the whole command restarts from scratch against fresh
    /// state; the retry is invisible to the caller unless the budget runs
    /// out.
    pub async fn execute_command<C: Command>(&self, command: &C) -> EngineResult<C::Output> {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let mut ctx = CommandContext::new(
                Arc::clone(&self.store),
                Arc::clone(&self.definitions),
                Arc::clone(&self.clock),
                self.config.clone(),
            );
            match self.run_once(command, &mut ctx).await {
                Ok(output) => {
                    for event in ctx.take_events() {
                        self.publish(&event);
                    }
                    return Ok(output);
                }
                Err(err) if err.is_retryable() && attempt <= self.config.command_retries => {
                    warn!(
                        command = command.name(),
                        attempt,
                        error = %err,
                        "command conflicted, retrying"
                    );
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn run_once<C: Command>(
        &self,
        command: &C,
        ctx: &mut CommandContext,
    ) -> EngineResult<C::Output> {
        let output = command.execute(ctx).await?;
        crate::agenda::drain(ctx).await?;
        ctx.flush().await?;
        Ok(output)
    }

    /// Best-effort fan-out after a successful flush; listener behavior
    /// never affects the command's outcome.
    pub(crate) fn publish(&self, event: &EngineEvent) {
        debug!(?event, "engine event");
        for listener in &self.listeners {
            listener.on_event(event);
        }
    }

    // ── Queries ──

    /// Runtime state of an instance straight from the store. An ended
    /// instance yields an empty overview.
    pub async fn instance_overview(
        &self,
        process_instance_id: Uuid,
    ) -> EngineResult<InstanceOverview> {
        Ok(InstanceOverview {
            executions: self
                .store
                .executions_by_instance(process_instance_id)
                .await?,
            jobs: self.store.jobs_by_instance(process_instance_id).await?,
            subscriptions: self
                .store
                .subscriptions_by_instance(process_instance_id)
                .await?,
        })
    }

    // ── Deployment hooks ──

    /// Invalidate and reconcile after a definition (re)deploy.
    pub async fn on_definition_deployed(&self, definition_id: Uuid) -> EngineResult<()> {
        let change = self.definitions.on_definition_deployed(definition_id).await?;
        self.execute_command(&ReconcileDefinition {
            previous: change.previous,
            current: change.current,
        })
        .await
    }

    /// Retire a removed definition's declarations and evict it.
    pub async fn on_definition_removed(&self, definition_id: Uuid) -> EngineResult<()> {
        self.execute_command(&RetireDefinition { definition_id })
            .await?;
        self.definitions.on_definition_removed(definition_id);
        Ok(())
    }

    /// Definition-level suspension: rejects new instances and hides the
    /// definition's jobs from acquisition until resumed.
    pub async fn set_definition_suspended(
        &self,
        definition_id: Uuid,
        suspended: bool,
    ) -> EngineResult<()> {
        self.definitions.definition_by_id(definition_id).await?;
        self.definitions.set_suspended(definition_id, suspended);
        self.execute_command(&SetDefinitionJobsSuspended {
            definition_id,
            suspended,
        })
        .await
    }
}

/// Snapshot of one instance's durable runtime state.
#[derive(Clone, Debug)]
pub struct InstanceOverview {
    pub executions: Vec<Execution>,
    pub jobs: Vec<Job>,
    pub subscriptions: Vec<EventSubscription>,
}

impl InstanceOverview {
    /// No executions left means the instance has ended (or never existed).
    pub fn is_ended(&self) -> bool {
        self.executions.is_empty()
    }

    /// Active executions currently positioned at `node_id`.
    pub fn executions_at(&self, node_id: &str) -> Vec<&Execution> {
        self.executions
            .iter()
            .filter(|e| e.is_active && e.node_id.as_deref() == Some(node_id))
            .collect()
    }

    /// (execution id, node id) of every active positioned execution.
    pub fn active_nodes(&self) -> Vec<(Uuid, NodeId)> {
        self.executions
            .iter()
            .filter(|e| e.is_active)
            .filter_map(|e| e.node_id.clone().map(|n| (e.id, n)))
            .collect()
    }

    /// True when no execution below the scope is still active, i.e. the
    /// scope could complete if asked.
    pub fn scope_ready_to_complete(&self, scope_id: Uuid) -> bool {
        let mut pending: Vec<Uuid> = self
            .executions
            .iter()
            .filter(|e| e.parent_id == Some(scope_id))
            .map(|e| e.id)
            .collect();
        while let Some(current) = pending.pop() {
            let Some(execution) = self.executions.iter().find(|e| e.id == current) else {
                continue;
            };
            if execution.is_active {
                return false;
            }
            pending.extend(
                self.executions
                    .iter()
                    .filter(|e| e.parent_id == Some(current))
                    .map(|e| e.id),
            );
        }
        true
    }
}
