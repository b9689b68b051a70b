//! Job construction and timer scheduling.

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::context::CommandContext;
use crate::entity::{Execution, Job, JobHandler, JobKind, TimerCycle};
use crate::graph::TimerDue;

/// Resolve a timer declaration against the current clock: the first due
/// date plus, for cycles, the repetition state carried on the job.
pub(crate) fn timer_schedule(
    due: &TimerDue,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, Option<TimerCycle>) {
    match due {
        TimerDue::Duration { ms } => (now + Duration::milliseconds(*ms), None),
        TimerDue::Date { at } => (*at, None),
        TimerDue::Cycle {
            interval_ms,
            repeat,
        } => (
            now + Duration::milliseconds(*interval_ms),
            Some(TimerCycle {
                interval_ms: *interval_ms,
                repeat: repeat.map(|total| total.saturating_sub(1)),
            }),
        ),
    }
}

/// A repeating timer reschedules on success instead of being deleted.
/// Returns the job readied for its next fire, or `None` when the cycle is
/// spent.
pub(crate) fn reschedule_cycle(job: &Job, now: DateTime<Utc>) -> Option<Job> {
    let cycle = job.cycle.as_ref()?;
    if cycle.repeat == Some(0) {
        return None;
    }
    let mut next = job.clone();
    next.due_date = now + Duration::milliseconds(cycle.interval_ms);
    next.cycle = Some(TimerCycle {
        interval_ms: cycle.interval_ms,
        repeat: cycle.repeat.map(|remaining| remaining - 1),
    });
    next.lock_owner = None;
    next.lock_expiration = None;
    next.last_failure = None;
    Some(next)
}

/// Build a job with the engine's retry and exclusivity defaults. `owner`
/// binds the job to an execution so cascade deletion reaches it; jobs
/// without an owner (timer starts, start-event deliveries) bind to the
/// definition only.
#[allow(clippy::too_many_arguments)]
pub(crate) fn make_job(
    ctx: &CommandContext,
    kind: JobKind,
    handler: JobHandler,
    due_date: DateTime<Utc>,
    cycle: Option<TimerCycle>,
    owner: Option<&Execution>,
    definition_id: Uuid,
    tenant_id: Option<String>,
) -> Job {
    Job {
        id: Uuid::now_v7(),
        kind,
        handler,
        due_date,
        lock_owner: None,
        lock_expiration: None,
        retries: ctx.config().default_job_retries,
        last_failure: None,
        exclusive: ctx.config().exclusive_jobs,
        execution_id: owner.map(|execution| execution.id),
        process_instance_id: owner.map(|execution| execution.process_instance_id),
        definition_id,
        tenant_id: owner
            .and_then(|execution| execution.tenant_id.clone())
            .or(tenant_id),
        suspended: owner.map_or(false, |execution| execution.suspended),
        cycle,
        revision: 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_and_date_timers_schedule_once() {
        let now = Utc::now();
        let (due, cycle) = timer_schedule(&TimerDue::Duration { ms: 60_000 }, now);
        assert_eq!(due, now + Duration::seconds(60));
        assert!(cycle.is_none());

        let deadline = now + Duration::days(2);
        let (due, cycle) = timer_schedule(&TimerDue::Date { at: deadline }, now);
        assert_eq!(due, deadline);
        assert!(cycle.is_none());
    }

    #[test]
    fn cycle_counts_down_and_stops() {
        let now = Utc::now();
        let (due, cycle) = timer_schedule(
            &TimerDue::Cycle {
                interval_ms: 1_000,
                repeat: Some(3),
            },
            now,
        );
        assert_eq!(due, now + Duration::seconds(1));
        let cycle = cycle.unwrap();
        // Three total fires: the scheduled one plus two reschedules.
        assert_eq!(cycle.repeat, Some(2));

        let mut job = Job {
            id: Uuid::now_v7(),
            kind: JobKind::Timer,
            handler: JobHandler::TimerStart {
                definition_id: Uuid::now_v7(),
                node_id: "every_second".into(),
            },
            due_date: due,
            lock_owner: Some("executor-1".into()),
            lock_expiration: Some(now + Duration::minutes(5)),
            retries: 3,
            last_failure: None,
            exclusive: true,
            execution_id: None,
            process_instance_id: None,
            definition_id: Uuid::now_v7(),
            tenant_id: None,
            suspended: false,
            cycle: Some(cycle),
            revision: 1,
        };

        let second = reschedule_cycle(&job, now).unwrap();
        assert_eq!(second.cycle.as_ref().unwrap().repeat, Some(1));
        assert_eq!(second.due_date, now + Duration::seconds(1));
        assert!(second.lock_owner.is_none());
        assert!(second.lock_expiration.is_none());

        let third = reschedule_cycle(&second, now).unwrap();
        assert_eq!(third.cycle.as_ref().unwrap().repeat, Some(0));
        assert!(reschedule_cycle(&third, now).is_none());

        // Unbounded cycles never stop rescheduling.
        job.cycle = Some(TimerCycle {
            interval_ms: 1_000,
            repeat: None,
        });
        let next = reschedule_cycle(&job, now).unwrap();
        assert_eq!(next.cycle.as_ref().unwrap().repeat, None);
    }
}
