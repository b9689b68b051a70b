//! The engine's built-in commands.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::command::Command;
use crate::context::CommandContext;
use crate::entity::{EventKind, JobHandler, Variables};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::{
    end_instance, resume_waiting_execution, start_instance_at,
};
use crate::graph::ProcessDefinition;
use crate::job::reschedule_cycle;
use crate::subscription::{self, EventThrow};

/// How a start command picks its definition.
#[derive(Clone, Debug)]
pub enum DefinitionSelector {
    ById(Uuid),
    LatestByKey {
        key: String,
        tenant_id: Option<String>,
    },
}

// ─── Start ────────────────────────────────────────────────────

/// Start a new process instance at the definition's untriggered start
/// event. Returns the process-instance id.
#[derive(Clone, Debug)]
pub struct StartProcessInstance {
    pub definition: DefinitionSelector,
    pub variables: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
impl Command for StartProcessInstance {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "start-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<Uuid> {
        let definition = match &self.definition {
            DefinitionSelector::ById(id) => ctx.definition(*id).await?,
            DefinitionSelector::LatestByKey { key, tenant_id } => {
                ctx.definition_cache()
                    .latest_by_key(key, tenant_id.as_deref())
                    .await?
            }
        };
        if ctx.definition_cache().is_suspended(definition.id) {
            return Err(EngineError::Suspended(format!(
                "process definition {}",
                definition.key
            )));
        }
        let start = definition
            .graph
            .initial_start(None)
            .ok_or_else(|| {
                EngineError::IllegalGraphState(format!(
                    "definition {} has no untriggered start event",
                    definition.key
                ))
            })?
            .id
            .clone();
        let variables = ctx.encode_variables(self.variables.clone()).await?;
        start_instance_at(ctx, &definition, &start, &variables).await
    }
}

// ─── Trigger ──────────────────────────────────────────────────

/// Resume an execution waiting at a wait-state node (user task, catch
/// event, timer), merging the given variables into its local scope.
#[derive(Clone, Debug)]
pub struct TriggerExecution {
    pub execution_id: Uuid,
    pub variables: BTreeMap<String, serde_json::Value>,
}

#[async_trait]
impl Command for TriggerExecution {
    type Output = ();

    fn name(&self) -> &'static str {
        "trigger-execution"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let execution = ctx.execution(self.execution_id).await?;
        let node_id = execution.node_id.clone().ok_or_else(|| {
            EngineError::IllegalGraphState(format!(
                "execution {} is not positioned at a node",
                self.execution_id
            ))
        })?;
        let definition = ctx.definition(execution.definition_id).await?;
        let node = definition.graph.node(&node_id)?;
        if !node.kind.is_wait_state() {
            return Err(EngineError::IllegalGraphState(format!(
                "node {} ({}) is not a wait state",
                node_id,
                node.kind.label()
            )));
        }
        let variables = ctx.encode_variables(self.variables.clone()).await?;
        resume_waiting_execution(ctx, self.execution_id, &variables).await
    }
}

// ─── Event throws ─────────────────────────────────────────────

/// Throw a signal; every matching subscription is satisfied. Returns the
/// number of deliveries (0 is a legal no-op).
#[derive(Clone, Debug)]
pub struct ThrowSignal {
    pub event_name: String,
    /// Restrict delivery to subscriptions of one process instance.
    pub scope_instance: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub variables: BTreeMap<String, serde_json::Value>,
    /// Defer every delivery through a job.
    pub async_delivery: bool,
}

#[async_trait]
impl Command for ThrowSignal {
    type Output = usize;

    fn name(&self) -> &'static str {
        "throw-signal"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let variables = ctx.encode_variables(self.variables.clone()).await?;
        subscription::correlate(
            ctx,
            EventThrow {
                kind: EventKind::Signal,
                event_name: self.event_name.clone(),
                correlation_key: None,
                scope_instance: self.scope_instance,
                tenant_id: self.tenant_id.clone(),
                variables,
                async_delivery: self.async_delivery,
            },
        )
        .await
    }
}

/// Correlate a message against waiting subscriptions (and message start
/// events). Returns the number of deliveries.
#[derive(Clone, Debug)]
pub struct CorrelateMessage {
    pub event_name: String,
    pub correlation_key: Option<String>,
    pub scope_instance: Option<Uuid>,
    pub tenant_id: Option<String>,
    pub variables: BTreeMap<String, serde_json::Value>,
    pub async_delivery: bool,
}

#[async_trait]
impl Command for CorrelateMessage {
    type Output = usize;

    fn name(&self) -> &'static str {
        "correlate-message"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<usize> {
        let variables = ctx.encode_variables(self.variables.clone()).await?;
        subscription::correlate(
            ctx,
            EventThrow {
                kind: EventKind::Message,
                event_name: self.event_name.clone(),
                correlation_key: self.correlation_key.clone(),
                scope_instance: self.scope_instance,
                tenant_id: self.tenant_id.clone(),
                variables,
                async_delivery: self.async_delivery,
            },
        )
        .await
    }
}

// ─── Jobs ─────────────────────────────────────────────────────

/// Run one acquired job inside its own command. Success deletes the job
/// (timer cycles reschedule instead); any error rolls the command back and
/// the executor records the failure on the job separately.
#[derive(Clone, Debug)]
pub struct ExecuteJob {
    pub job_id: Uuid,
}

#[async_trait]
impl Command for ExecuteJob {
    type Output = ();

    fn name(&self) -> &'static str {
        "execute-job"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let job = ctx.job(self.job_id).await?;
        if job.suspended {
            return Err(EngineError::Suspended(format!("job {}", self.job_id)));
        }

        match job.handler.clone() {
            JobHandler::AsyncContinuation { execution_id } => {
                ctx.remove_job(job.id)?;
                resume_waiting_execution(ctx, execution_id, &Variables::new()).await?;
            }
            JobHandler::TimerFire { execution_id } => {
                ctx.remove_job(job.id)?;
                ctx.emit(EngineEvent::TimerFired { job_id: job.id });
                resume_waiting_execution(ctx, execution_id, &Variables::new()).await?;
            }
            JobHandler::TimerStart {
                definition_id,
                node_id,
            } => {
                let definition = ctx.definition(definition_id).await?;
                if ctx.definition_cache().is_suspended(definition.id) {
                    return Err(EngineError::Suspended(format!(
                        "process definition {}",
                        definition.key
                    )));
                }
                ctx.emit(EngineEvent::TimerFired { job_id: job.id });
                start_instance_at(ctx, &definition, &node_id, &Variables::new()).await?;
                match reschedule_cycle(&job, ctx.now()) {
                    Some(next) => ctx.update_job(next)?,
                    None => ctx.remove_job(job.id)?,
                }
            }
            JobHandler::EventDelivery {
                subscription_id,
                variables,
            } => {
                ctx.remove_job(job.id)?;
                subscription::deliver(ctx, subscription_id, &variables).await?;
            }
        }

        ctx.emit(EngineEvent::JobExecuted { job_id: self.job_id });
        Ok(())
    }
}

// ─── Suspension ───────────────────────────────────────────────

/// Cooperatively suspend or resume a process instance: flags every
/// execution and hides the instance's jobs from acquisition. Due dates are
/// untouched, so resuming makes overdue jobs immediately visible again.
#[derive(Clone, Debug)]
pub struct SetInstanceSuspended {
    pub process_instance_id: Uuid,
    pub suspended: bool,
}

#[async_trait]
impl Command for SetInstanceSuspended {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-instance-suspended"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        ctx.load_instance(self.process_instance_id).await?;
        // Fails with NotFound when the instance is gone.
        ctx.execution(self.process_instance_id).await?;

        for mut execution in ctx.instance_executions(self.process_instance_id) {
            execution.suspended = self.suspended;
            ctx.update_execution(execution)?;
        }
        for mut job in ctx.instance_jobs(self.process_instance_id) {
            job.suspended = self.suspended;
            ctx.update_job(job)?;
        }
        ctx.emit(EngineEvent::InstanceSuspended {
            process_instance_id: self.process_instance_id,
            suspended: self.suspended,
        });
        Ok(())
    }
}

/// Hide (or reveal) every job of a definition from acquisition; used by
/// definition-level suspension.
#[derive(Clone, Debug)]
pub struct SetDefinitionJobsSuspended {
    pub definition_id: Uuid,
    pub suspended: bool,
}

#[async_trait]
impl Command for SetDefinitionJobsSuspended {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-definition-jobs-suspended"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        for mut job in ctx.jobs_by_definition(self.definition_id).await? {
            job.suspended = self.suspended;
            ctx.update_job(job)?;
        }
        Ok(())
    }
}

// ─── Instance deletion ────────────────────────────────────────

/// Cancel a running instance: the whole execution tree, its jobs and its
/// subscriptions disappear in one transaction.
#[derive(Clone, Debug)]
pub struct DeleteProcessInstance {
    pub process_instance_id: Uuid,
    pub reason: Option<String>,
}

#[async_trait]
impl Command for DeleteProcessInstance {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete-process-instance"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        end_instance(ctx, self.process_instance_id, self.reason.clone()).await
    }
}

// ─── Deployment reconciliation ────────────────────────────────

/// Install the start declarations of a freshly deployed definition version
/// and retire those of the version it replaces.
#[derive(Clone)]
pub struct ReconcileDefinition {
    pub previous: Option<Arc<ProcessDefinition>>,
    pub current: Arc<ProcessDefinition>,
}

#[async_trait]
impl Command for ReconcileDefinition {
    type Output = ();

    fn name(&self) -> &'static str {
        "reconcile-definition"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        subscription::reconcile_start_declarations(
            ctx,
            self.previous.as_deref(),
            &self.current,
        )
        .await
    }
}

/// Drop the declaration-owned subscriptions and timer-start jobs of a
/// removed definition. Running instances keep their own subscriptions.
#[derive(Clone, Debug)]
pub struct RetireDefinition {
    pub definition_id: Uuid,
}

#[async_trait]
impl Command for RetireDefinition {
    type Output = ();

    fn name(&self) -> &'static str {
        "retire-definition"
    }

    async fn execute(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        for subscription in ctx.subscriptions_by_definition(self.definition_id).await? {
            if subscription.execution_id.is_none() {
                ctx.remove_subscription(subscription.id)?;
            }
        }
        for job in ctx.jobs_by_definition(self.definition_id).await? {
            if matches!(job.handler, JobHandler::TimerStart { .. }) {
                ctx.remove_job(job.id)?;
            }
        }
        Ok(())
    }
}
