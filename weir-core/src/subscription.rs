//! Event subscription engine.
//!
//! Durably records "execution X waits for event (kind, name)" and resolves
//! which waiting executions a thrown event satisfies. Delivery happens
//! inside the throwing command, unless the subscription or the throw opts
//! into async delivery, in which case a job carries the payload into a
//! later command.

use tracing::debug;
use uuid::Uuid;

use crate::agenda::AgendaOp;
use crate::context::CommandContext;
use crate::entity::{
    EventKind, EventSubscription, JobHandler, JobKind, SubscriptionScope, Variables,
};
use crate::error::{EngineError, EngineResult};
use crate::events::EngineEvent;
use crate::execution::{resume_waiting_execution, start_instance_at};
use crate::graph::{ProcessDefinition, StartTrigger};
use crate::job::{make_job, timer_schedule};

/// One thrown event, scoped and addressed.
#[derive(Clone, Debug)]
pub struct EventThrow {
    pub kind: EventKind,
    pub event_name: String,
    pub correlation_key: Option<String>,
    /// Restrict delivery to subscriptions of this process instance.
    pub scope_instance: Option<Uuid>,
    /// Tenant-isolated throws only reach subscriptions of the same tenant.
    pub tenant_id: Option<String>,
    pub variables: Variables,
    pub async_delivery: bool,
}

/// Matching rules:
/// - an instance-scoped throw only reaches subscriptions of that instance;
/// - a global throw reaches global-scope subscriptions anywhere, but never
///   instance-scoped ones;
/// - a tenant-carrying throw stays inside its tenant;
/// - a subscription requiring a correlation key needs the throw to carry
///   the same key.
pub(crate) fn matches(subscription: &EventSubscription, throw: &EventThrow) -> bool {
    if subscription.kind != throw.kind || subscription.event_name != throw.event_name {
        return false;
    }
    match throw.scope_instance {
        Some(instance) => {
            if subscription.process_instance_id != Some(instance) {
                return false;
            }
        }
        None => {
            if subscription.scope != SubscriptionScope::Global {
                return false;
            }
        }
    }
    if throw.tenant_id.is_some() && subscription.tenant_id != throw.tenant_id {
        return false;
    }
    if let Some(required) = &subscription.correlation_key {
        if throw.correlation_key.as_ref() != Some(required) {
            return false;
        }
    }
    true
}

/// Find and satisfy every matching subscription. A throw with no match is
/// a no-op, not an error: the event is simply not observed by anyone.
/// Returns the number of subscriptions satisfied.
pub(crate) async fn correlate(
    ctx: &mut CommandContext,
    throw: EventThrow,
) -> EngineResult<usize> {
    let candidates = ctx
        .subscriptions_by_event(throw.kind, &throw.event_name)
        .await?;
    let matched: Vec<EventSubscription> = candidates
        .into_iter()
        .filter(|subscription| matches(subscription, &throw))
        .collect();

    if matched.is_empty() {
        debug!(event = %throw.event_name, kind = %throw.kind, "no subscription matched");
        return Ok(0);
    }

    let delivered = matched.len();
    for subscription in matched {
        if subscription.async_delivery || throw.async_delivery {
            let owner = match subscription.execution_id {
                Some(execution_id) => Some(ctx.execution(execution_id).await?),
                None => None,
            };
            let job = make_job(
                ctx,
                JobKind::EventDelivery,
                JobHandler::EventDelivery {
                    subscription_id: subscription.id,
                    variables: throw.variables.clone(),
                },
                ctx.now(),
                None,
                owner.as_ref(),
                subscription.definition_id,
                subscription.tenant_id.clone(),
            );
            ctx.emit(EngineEvent::EventDeliveryDeferred {
                subscription_id: subscription.id,
                job_id: job.id,
            });
            ctx.insert_job(job);
        } else {
            ctx.enqueue(AgendaOp::DeliverSubscription {
                subscription_id: subscription.id,
                variables: throw.variables.clone(),
            });
        }
    }
    Ok(delivered)
}

/// Satisfy one subscription: merge the payload into the target's local
/// scope and resume it past its catching node. For definition-level start
/// subscriptions, spawn a fresh instance instead.
pub(crate) async fn deliver(
    ctx: &mut CommandContext,
    subscription_id: Uuid,
    variables: &Variables,
) -> EngineResult<()> {
    let Some(subscription) = ctx.subscription(subscription_id).await? else {
        // Consumed by a racing delivery; a correlation miss is a no-op.
        debug!(%subscription_id, "subscription gone before delivery");
        return Ok(());
    };

    match subscription.execution_id {
        Some(execution_id) => {
            ctx.remove_subscription(subscription.id)?;
            ctx.emit(EngineEvent::EventDelivered {
                subscription_id: subscription.id,
                execution_id: Some(execution_id),
                event_name: subscription.event_name.clone(),
            });
            resume_waiting_execution(ctx, execution_id, variables).await
        }
        None => {
            // Start subscriptions survive consumption; they die on redeploy.
            let definition = ctx.definition(subscription.definition_id).await?;
            if ctx.definition_cache().is_suspended(definition.id) {
                return Err(EngineError::Suspended(format!(
                    "process definition {}",
                    definition.key
                )));
            }
            let start_node = subscription.node_id.clone().ok_or_else(|| {
                EngineError::IllegalGraphState(format!(
                    "start subscription {} has no start node",
                    subscription.id
                ))
            })?;
            ctx.emit(EngineEvent::EventDelivered {
                subscription_id: subscription.id,
                execution_id: None,
                event_name: subscription.event_name.clone(),
            });
            start_instance_at(ctx, &definition, &start_node, variables).await?;
            Ok(())
        }
    }
}

/// Redeploy reconciliation: retire the declaration-owned subscriptions and
/// timer-start jobs of the replaced version, then install the new
/// version's declarations. Subscriptions owned by running instances of any
/// version are never touched.
pub(crate) async fn reconcile_start_declarations(
    ctx: &mut CommandContext,
    previous: Option<&ProcessDefinition>,
    current: &ProcessDefinition,
) -> EngineResult<()> {
    if let Some(previous) = previous {
        for subscription in ctx.subscriptions_by_definition(previous.id).await? {
            if subscription.execution_id.is_none() {
                ctx.remove_subscription(subscription.id)?;
            }
        }
        for job in ctx.jobs_by_definition(previous.id).await? {
            if matches!(job.handler, JobHandler::TimerStart { .. }) {
                ctx.remove_job(job.id)?;
            }
        }
    }

    for (node, trigger) in current.graph.triggered_starts() {
        match trigger {
            StartTrigger::Signal { event_name } | StartTrigger::Message { event_name } => {
                let kind = match trigger {
                    StartTrigger::Signal { .. } => EventKind::Signal,
                    _ => EventKind::Message,
                };
                ctx.insert_subscription(EventSubscription {
                    id: Uuid::now_v7(),
                    kind,
                    event_name: event_name.clone(),
                    correlation_key: None,
                    scope: SubscriptionScope::Global,
                    execution_id: None,
                    process_instance_id: None,
                    definition_id: current.id,
                    node_id: Some(node.id.clone()),
                    tenant_id: current.tenant_id.clone(),
                    async_delivery: false,
                    created_at: ctx.now(),
                    revision: 1,
                });
            }
            StartTrigger::Timer { due } => {
                let (due_date, cycle) = timer_schedule(due, ctx.now());
                let job = make_job(
                    ctx,
                    JobKind::Timer,
                    JobHandler::TimerStart {
                        definition_id: current.id,
                        node_id: node.id.clone(),
                    },
                    due_date,
                    cycle,
                    None,
                    current.id,
                    current.tenant_id.clone(),
                );
                ctx.insert_job(job);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn subscription(
        kind: EventKind,
        name: &str,
        scope: SubscriptionScope,
        instance: Option<Uuid>,
    ) -> EventSubscription {
        EventSubscription {
            id: Uuid::now_v7(),
            kind,
            event_name: name.to_string(),
            correlation_key: None,
            scope,
            execution_id: Some(Uuid::now_v7()),
            process_instance_id: instance,
            definition_id: Uuid::now_v7(),
            node_id: Some("catch".into()),
            tenant_id: None,
            async_delivery: false,
            created_at: Utc::now(),
            revision: 1,
        }
    }

    fn global_throw(name: &str) -> EventThrow {
        EventThrow {
            kind: EventKind::Signal,
            event_name: name.to_string(),
            correlation_key: None,
            scope_instance: None,
            tenant_id: None,
            variables: Variables::new(),
            async_delivery: false,
        }
    }

    #[test]
    fn instance_scoped_subscription_ignores_foreign_throws() {
        let instance_a = Uuid::now_v7();
        let instance_b = Uuid::now_v7();
        let sub = subscription(
            EventKind::Signal,
            "go",
            SubscriptionScope::ProcessInstance,
            Some(instance_a),
        );

        let mut from_b = global_throw("go");
        from_b.scope_instance = Some(instance_b);
        assert!(!matches(&sub, &from_b));

        let mut from_a = global_throw("go");
        from_a.scope_instance = Some(instance_a);
        assert!(matches(&sub, &from_a));

        // A global throw does not satisfy an instance-scoped subscription.
        assert!(!matches(&sub, &global_throw("go")));
    }

    #[test]
    fn global_subscription_matches_regardless_of_origin() {
        let instance_a = Uuid::now_v7();
        let sub = subscription(
            EventKind::Signal,
            "go",
            SubscriptionScope::Global,
            Some(instance_a),
        );

        assert!(matches(&sub, &global_throw("go")));
        let mut scoped = global_throw("go");
        scoped.scope_instance = Some(instance_a);
        assert!(matches(&sub, &scoped));
        assert!(!matches(&sub, &global_throw("other")));
    }

    #[test]
    fn tenant_isolation_and_correlation_keys() {
        let mut sub = subscription(EventKind::Message, "doc", SubscriptionScope::Global, None);
        sub.tenant_id = Some("acme".into());
        sub.correlation_key = Some("case-7".into());

        let mut throw = global_throw("doc");
        throw.kind = EventKind::Message;
        assert!(!matches(&sub, &throw), "missing correlation key");

        throw.correlation_key = Some("case-7".into());
        assert!(matches(&sub, &throw), "tenant-open throw reaches any tenant");

        throw.tenant_id = Some("other".into());
        assert!(!matches(&sub, &throw), "tenant-isolated throw stays inside");

        throw.tenant_id = Some("acme".into());
        assert!(matches(&sub, &throw));

        throw.correlation_key = Some("case-8".into());
        assert!(!matches(&sub, &throw), "wrong correlation key");
    }
}
