//! Execution-tree operations.
//!
//! Tokens of one process instance form a tree rooted at the instance
//! execution. All walks here go over the context's entity cache through
//! parent-id back-pointers; callers load the instance first.

use uuid::Uuid;

use crate::agenda::AgendaOp;
use crate::context::CommandContext;
use crate::entity::{Execution, Variables};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::graph::ProcessDefinition;

/// Create the root execution of a new instance positioned at `start_node`
/// and schedule its first step.
pub(crate) async fn start_instance_at(
    ctx: &mut CommandContext,
    definition: &ProcessDefinition,
    start_node: &str,
    variables: &Variables,
) -> EngineResult<Uuid> {
    let mut root = Execution::new_root(definition.id, definition.tenant_id.clone());
    root.node_id = Some(start_node.to_string());
    root.variables = variables.clone();
    let process_instance_id = root.process_instance_id;
    let root_id = root.id;
    ctx.insert_execution(root);
    ctx.emit(EngineEvent::InstanceStarted {
        process_instance_id,
        definition_id: definition.id,
    });
    ctx.enqueue(AgendaOp::EnterNode {
        execution_id: root_id,
        node_id: start_node.to_string(),
    });
    Ok(process_instance_id)
}

/// Subtree ids in children-first order, so removal never orphans a child.
pub(crate) fn collect_subtree(ctx: &CommandContext, root_id: Uuid) -> Vec<Uuid> {
    let mut ordered = vec![root_id];
    let mut index = 0;
    while index < ordered.len() {
        let current = ordered[index];
        for child in ctx.children_of(current) {
            ordered.push(child.id);
        }
        index += 1;
    }
    ordered.reverse();
    ordered
}

/// Delete an execution with its entire subtree, including the jobs and
/// event subscriptions owned by any execution in it.
pub(crate) fn remove_execution_cascade(ctx: &mut CommandContext, id: Uuid) -> EngineResult<()> {
    for execution_id in collect_subtree(ctx, id) {
        for job in ctx.jobs_for_execution(execution_id) {
            ctx.remove_job(job.id)?;
        }
        for subscription in ctx.subscriptions_for_execution(execution_id) {
            ctx.remove_subscription(subscription.id)?;
        }
        ctx.remove_execution(execution_id)?;
    }
    Ok(())
}

/// End a whole process instance: cascade-delete the tree and notify.
pub(crate) async fn end_instance(
    ctx: &mut CommandContext,
    process_instance_id: Uuid,
    reason: Option<String>,
) -> EngineResult<()> {
    ctx.load_instance(process_instance_id).await?;
    let root = ctx.execution(process_instance_id).await?;
    remove_execution_cascade(ctx, root.id)?;
    ctx.emit(EngineEvent::InstanceEnded {
        process_instance_id,
        reason,
    });
    Ok(())
}

/// Walk upward after an execution ended, completing scopes whose last
/// token just disappeared.
///
/// Quiescent cases simply return: the parent still has children, or is
/// itself actively positioned at a node.
pub(crate) async fn propagate_completion(
    ctx: &mut CommandContext,
    parent_id: Uuid,
) -> EngineResult<()> {
    let mut current = Some(parent_id);
    while let Some(id) = current {
        let Some(parent) = ctx.try_execution(id).await? else {
            return Ok(());
        };
        if !ctx.children_of(parent.id).is_empty() {
            return Ok(());
        }
        if parent.is_process_instance() {
            if !parent.is_active {
                end_instance(ctx, parent.process_instance_id, None).await?;
            }
            return Ok(());
        }
        if parent.is_active {
            return Ok(());
        }
        if parent.is_scope {
            // A sub-process body finished: the scope dissolves and the
            // hosting execution moves on past the sub-process node.
            let host_id = parent
                .parent_id
                .expect("non-root scope has a parent");
            remove_execution_cascade(ctx, parent.id)?;
            let mut host = ctx.execution(host_id).await?;
            host.is_active = true;
            ctx.update_execution(host)?;
            ctx.enqueue(AgendaOp::TakeOutgoingTransitions {
                execution_id: host_id,
            });
            return Ok(());
        }
        // Inactive non-scope with nothing below: dissolve it and keep
        // checking the level above.
        current = parent.parent_id;
        remove_execution_cascade(ctx, parent.id)?;
    }
    Ok(())
}

/// Resume an execution sitting in a wait state: clear the wait artifacts
/// at its current node, merge the delivered payload into its local scope,
/// and continue past the node.
pub(crate) async fn resume_waiting_execution(
    ctx: &mut CommandContext,
    execution_id: Uuid,
    variables: &Variables,
) -> EngineResult<()> {
    let execution = ctx.execution(execution_id).await?;
    if execution.suspended {
        return Err(EngineError::Suspended(format!(
            "execution {execution_id}"
        )));
    }
    if !execution.is_active {
        return Err(EngineError::IllegalGraphState(format!(
            "execution {execution_id} is not awaiting a trigger"
        )));
    }
    let Some(node_id) = execution.node_id.clone() else {
        return Err(EngineError::IllegalGraphState(format!(
            "execution {execution_id} is not positioned at a node"
        )));
    };

    ctx.load_instance(execution.process_instance_id).await?;

    for subscription in ctx.subscriptions_for_execution(execution_id) {
        if subscription.node_id.as_deref() == Some(node_id.as_str()) {
            ctx.remove_subscription(subscription.id)?;
        }
    }
    for job in ctx.jobs_for_execution(execution_id) {
        ctx.remove_job(job.id)?;
    }

    ctx.merge_variables_local(execution_id, variables).await?;
    ctx.enqueue(AgendaOp::TakeOutgoingTransitions { execution_id });
    Ok(())
}
