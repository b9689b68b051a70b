//! The agenda: an in-memory FIFO queue of pending graph-interpretation
//! steps for one command.
//!
//! Draining takes one execution one step forward per operation, strictly in
//! order, until quiescent. Operations may push further operations; nothing
//! here runs concurrently. Many commands run concurrently system-wide, but
//! graph interpretation inside one command is single-threaded by design.

use uuid::Uuid;

use crate::context::CommandContext;
use crate::entity::{
    EventKind, EventSubscription, Execution, JobHandler, JobKind, SubscriptionScope, Variables,
};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::{
    propagate_completion, remove_execution_cascade, end_instance,
};
use crate::graph::{GraphNode, NodeId, NodeKind, TransitionId};
use crate::job::{make_job, timer_schedule};
use crate::subscription::{self, EventThrow};

/// Upper bound on steps per command; a graph cycle without a wait state
/// would otherwise spin forever.
const MAX_AGENDA_STEPS: usize = 10_000;

#[derive(Clone, Debug, PartialEq)]
pub enum AgendaOp {
    /// Continue past the execution's current node.
    TakeOutgoingTransitions { execution_id: Uuid },
    TakeTransition {
        execution_id: Uuid,
        transition_id: TransitionId,
    },
    EnterNode {
        execution_id: Uuid,
        node_id: NodeId,
    },
    /// The token reached the end of its path; collapse scopes upward.
    EndExecutionPath { execution_id: Uuid },
    /// Cancel the whole instance, all tokens included.
    TerminateInstance {
        process_instance_id: Uuid,
        reason: String,
    },
    /// In-command delivery of a correlated event.
    DeliverSubscription {
        subscription_id: Uuid,
        variables: Variables,
    },
}

/// Run the agenda until it is empty.
pub(crate) async fn drain(ctx: &mut CommandContext) -> EngineResult<()> {
    let mut steps = 0usize;
    while let Some(op) = ctx.next_op() {
        steps += 1;
        if steps > MAX_AGENDA_STEPS {
            return Err(EngineError::IllegalGraphState(format!(
                "agenda did not quiesce after {MAX_AGENDA_STEPS} steps"
            )));
        }
        run_op(ctx, op).await?;
    }
    Ok(())
}

async fn run_op(ctx: &mut CommandContext, op: AgendaOp) -> EngineResult<()> {
    match op {
        AgendaOp::TakeOutgoingTransitions { execution_id } => {
            take_outgoing(ctx, execution_id).await
        }
        AgendaOp::TakeTransition {
            execution_id,
            transition_id,
        } => take_transition(ctx, execution_id, transition_id).await,
        AgendaOp::EnterNode {
            execution_id,
            node_id,
        } => enter_node(ctx, execution_id, node_id).await,
        AgendaOp::EndExecutionPath { execution_id } => end_path(ctx, execution_id).await,
        AgendaOp::TerminateInstance {
            process_instance_id,
            reason,
        } => end_instance(ctx, process_instance_id, Some(reason)).await,
        AgendaOp::DeliverSubscription {
            subscription_id,
            variables,
        } => subscription::deliver(ctx, subscription_id, &variables).await,
    }
}

/// Load the execution an op refers to. A token removed earlier in the same
/// command (terminate, cascade delete) cancels its queued steps; a token
/// that never existed is a hard NotFound.
async fn live_token(
    ctx: &mut CommandContext,
    execution_id: Uuid,
) -> EngineResult<Option<Execution>> {
    match ctx.try_execution(execution_id).await? {
        Some(execution) => Ok(Some(execution)),
        None if ctx.execution_removed(execution_id) => Ok(None),
        None => Err(EngineError::not_found(
            crate::store::EntityKind::Execution,
            execution_id,
        )),
    }
}

async fn take_outgoing(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    let Some(execution) = live_token(ctx, execution_id).await? else {
        return Ok(());
    };
    let node_id = execution.node_id.clone().ok_or_else(|| {
        EngineError::IllegalGraphState(format!(
            "execution {execution_id} has no current node to leave"
        ))
    })?;
    let definition = ctx.definition(execution.definition_id).await?;
    let outgoing = definition.graph.node(&node_id)?.outgoing.clone();

    match outgoing.len() {
        0 => {
            ctx.enqueue(AgendaOp::EndExecutionPath { execution_id });
            Ok(())
        }
        1 => {
            ctx.enqueue(AgendaOp::TakeTransition {
                execution_id,
                transition_id: outgoing.into_iter().next().expect("len checked"),
            });
            Ok(())
        }
        _ => fork(ctx, execution, outgoing).await,
    }
}

/// Split the token into one concurrent child per transition. The children's
/// common parent tracks the join later; left-to-right order is preserved by
/// the agenda's FIFO discipline.
async fn fork(
    ctx: &mut CommandContext,
    execution: Execution,
    outgoing: Vec<TransitionId>,
) -> EngineResult<()> {
    ctx.load_instance(execution.process_instance_id).await?;

    let parent = if execution.is_concurrent {
        // Nested fork: the branches replace this token under its parent.
        let parent_id = execution
            .parent_id
            .expect("concurrent execution has a parent");
        ctx.execution(parent_id).await?
    } else {
        let mut parent = execution.clone();
        parent.is_active = false;
        ctx.update_execution(parent.clone())?;
        parent
    };

    for transition_id in outgoing {
        let mut child = Execution::new_child(&parent, true, false);
        child.node_id = execution.node_id.clone();
        let child_id = child.id;
        ctx.insert_execution(child);
        ctx.enqueue(AgendaOp::TakeTransition {
            execution_id: child_id,
            transition_id,
        });
    }

    if execution.is_concurrent {
        remove_execution_cascade(ctx, execution.id)?;
    }
    Ok(())
}

async fn take_transition(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    transition_id: TransitionId,
) -> EngineResult<()> {
    let Some(mut execution) = live_token(ctx, execution_id).await? else {
        return Ok(());
    };
    let definition = ctx.definition(execution.definition_id).await?;
    let target = definition.graph.transition(&transition_id)?.target.clone();

    execution.node_id = Some(target.clone());
    ctx.update_execution(execution)?;
    ctx.emit(EngineEvent::TransitionTaken {
        execution_id,
        transition_id,
    });
    ctx.enqueue(AgendaOp::EnterNode {
        execution_id,
        node_id: target,
    });
    Ok(())
}

async fn enter_node(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    node_id: NodeId,
) -> EngineResult<()> {
    let Some(execution) = live_token(ctx, execution_id).await? else {
        return Ok(());
    };
    let definition = ctx.definition(execution.definition_id).await?;
    let node = definition.graph.node(&node_id)?.clone();

    ctx.emit(EngineEvent::NodeEntered {
        process_instance_id: execution.process_instance_id,
        execution_id,
        node_id: node.id.clone(),
    });

    match node.kind.clone() {
        NodeKind::Passthrough | NodeKind::StartEvent { .. } => {
            ctx.enqueue(AgendaOp::TakeOutgoingTransitions { execution_id });
            Ok(())
        }

        NodeKind::ServiceTask {
            asynchronous: false,
        } => {
            ctx.enqueue(AgendaOp::TakeOutgoingTransitions { execution_id });
            Ok(())
        }

        // The async continuation ends this command's walk here; a job picks
        // the token up again in a later command.
        NodeKind::ServiceTask { asynchronous: true } => {
            let job = make_job(
                ctx,
                JobKind::Continuation,
                JobHandler::AsyncContinuation { execution_id },
                ctx.now(),
                None,
                Some(&execution),
                execution.definition_id,
                None,
            );
            ctx.insert_job(job);
            Ok(())
        }

        // Wait for an external trigger.
        NodeKind::UserTask => Ok(()),

        NodeKind::ParallelGateway => {
            if node.incoming.len() > 1 {
                join_arrive(ctx, execution, &node).await
            } else {
                ctx.enqueue(AgendaOp::TakeOutgoingTransitions { execution_id });
                Ok(())
            }
        }

        NodeKind::SignalCatch {
            event_name,
            instance_scoped,
            async_delivery,
        } => {
            let scope = if instance_scoped {
                SubscriptionScope::ProcessInstance
            } else {
                SubscriptionScope::Global
            };
            let subscription = new_catch_subscription(
                ctx,
                &execution,
                &node,
                EventKind::Signal,
                event_name,
                None,
                scope,
                async_delivery,
            );
            ctx.insert_subscription(subscription);
            Ok(())
        }

        NodeKind::MessageCatch {
            event_name,
            correlation_variable,
            async_delivery,
        } => {
            let correlation_key = match correlation_variable {
                Some(variable) => ctx
                    .read_variable(execution_id, &variable)
                    .await?
                    .map(|value| match value {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    }),
                None => None,
            };
            let subscription = new_catch_subscription(
                ctx,
                &execution,
                &node,
                EventKind::Message,
                event_name,
                correlation_key,
                SubscriptionScope::Global,
                async_delivery,
            );
            ctx.insert_subscription(subscription);
            Ok(())
        }

        NodeKind::SignalThrow {
            event_name,
            instance_scoped,
            async_delivery,
        } => {
            subscription::correlate(
                ctx,
                EventThrow {
                    kind: EventKind::Signal,
                    event_name,
                    correlation_key: None,
                    scope_instance: instance_scoped.then_some(execution.process_instance_id),
                    tenant_id: execution.tenant_id.clone(),
                    variables: Variables::new(),
                    async_delivery,
                },
            )
            .await?;
            ctx.enqueue(AgendaOp::TakeOutgoingTransitions { execution_id });
            Ok(())
        }

        NodeKind::TimerCatch { due } => {
            let (due_date, cycle) = timer_schedule(&due, ctx.now());
            let job = make_job(
                ctx,
                JobKind::Timer,
                JobHandler::TimerFire { execution_id },
                due_date,
                cycle,
                Some(&execution),
                execution.definition_id,
                None,
            );
            ctx.insert_job(job);
            Ok(())
        }

        NodeKind::SubProcess => {
            let inner_start = definition
                .graph
                .initial_start(Some(node.id.as_str()))
                .ok_or_else(|| {
                    EngineError::IllegalGraphState(format!(
                        "sub-process {} has no start event",
                        node.id
                    ))
                })?
                .id
                .clone();

            let mut host = execution.clone();
            host.is_active = false;
            ctx.update_execution(host.clone())?;

            let mut scope = Execution::new_child(&host, false, true);
            scope.node_id = Some(inner_start.clone());
            let scope_id = scope.id;
            ctx.insert_execution(scope);
            ctx.enqueue(AgendaOp::EnterNode {
                execution_id: scope_id,
                node_id: inner_start,
            });
            Ok(())
        }

        NodeKind::EndEvent => {
            ctx.enqueue(AgendaOp::EndExecutionPath { execution_id });
            Ok(())
        }

        NodeKind::TerminateEndEvent => {
            ctx.enqueue(AgendaOp::TerminateInstance {
                process_instance_id: execution.process_instance_id,
                reason: format!("terminate end event {}", node.id),
            });
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn new_catch_subscription(
    ctx: &CommandContext,
    execution: &Execution,
    node: &GraphNode,
    kind: EventKind,
    event_name: String,
    correlation_key: Option<String>,
    scope: SubscriptionScope,
    async_delivery: bool,
) -> EventSubscription {
    EventSubscription {
        id: Uuid::now_v7(),
        kind,
        event_name,
        correlation_key,
        scope,
        execution_id: Some(execution.id),
        process_instance_id: Some(execution.process_instance_id),
        definition_id: execution.definition_id,
        node_id: Some(node.id.clone()),
        tenant_id: execution.tenant_id.clone(),
        async_delivery,
        created_at: ctx.now(),
        revision: 1,
    }
}

/// Parallel join: deactivate the arriving token and complete the gateway
/// once the number of tokens parked at it reaches the number of incoming
/// transitions. Counting is explicit, never inferred from arrival order.
async fn join_arrive(
    ctx: &mut CommandContext,
    execution: Execution,
    node: &GraphNode,
) -> EngineResult<()> {
    let expected = node.incoming.len();
    if !execution.is_concurrent {
        return Err(EngineError::IllegalGraphState(format!(
            "join {} reached by non-concurrent execution {} (no matching fork)",
            node.id, execution.id
        )));
    }
    ctx.load_instance(execution.process_instance_id).await?;

    let mut arriver = execution.clone();
    arriver.is_active = false;
    ctx.update_execution(arriver)?;

    let parent_id = execution
        .parent_id
        .expect("concurrent execution has a parent");
    let arrived: Vec<Execution> = ctx
        .children_of(parent_id)
        .into_iter()
        .filter(|sibling| {
            sibling.is_concurrent
                && !sibling.is_active
                && sibling.node_id.as_deref() == Some(node.id.as_str())
        })
        .collect();

    if arrived.len() < expected {
        return Ok(());
    }
    if arrived.len() > expected {
        return Err(EngineError::IllegalGraphState(format!(
            "join {} counted {} arrivals for {} incoming transitions",
            node.id,
            arrived.len(),
            expected
        )));
    }

    for sibling in &arrived {
        if sibling.id != execution.id {
            remove_execution_cascade(ctx, sibling.id)?;
        }
    }

    let survivors = ctx.children_of(parent_id);
    if survivors.len() == 1 && survivors[0].id == execution.id {
        // Concurrency fully collapsed: the parent resumes the walk itself.
        remove_execution_cascade(ctx, execution.id)?;
        let mut parent = ctx.execution(parent_id).await?;
        parent.node_id = Some(node.id.clone());
        parent.is_active = true;
        ctx.update_execution(parent)?;
        ctx.enqueue(AgendaOp::TakeOutgoingTransitions {
            execution_id: parent_id,
        });
    } else {
        // Other concurrent branches are still out there; this token carries
        // on as one of them.
        let mut survivor = ctx.execution(execution.id).await?;
        survivor.is_active = true;
        ctx.update_execution(survivor)?;
        ctx.enqueue(AgendaOp::TakeOutgoingTransitions {
            execution_id: execution.id,
        });
    }
    Ok(())
}

async fn end_path(ctx: &mut CommandContext, execution_id: Uuid) -> EngineResult<()> {
    let Some(execution) = live_token(ctx, execution_id).await? else {
        return Ok(());
    };
    ctx.load_instance(execution.process_instance_id).await?;

    let parent_id = execution.parent_id;
    remove_execution_cascade(ctx, execution_id)?;
    match parent_id {
        None => {
            ctx.emit(EngineEvent::InstanceEnded {
                process_instance_id: execution.process_instance_id,
                reason: None,
            });
            Ok(())
        }
        // A sub-process body ran to its end: the scope dissolves and the
        // hosting execution moves on past the sub-process node.
        Some(host_id) if execution.is_scope => {
            let mut host = ctx.execution(host_id).await?;
            host.is_active = true;
            ctx.update_execution(host)?;
            ctx.enqueue(AgendaOp::TakeOutgoingTransitions {
                execution_id: host_id,
            });
            Ok(())
        }
        Some(parent_id) => propagate_completion(ctx, parent_id).await,
    }
}
