//! Test suite for ensuring a correct implementation of a backend.
use chrono::{DateTime, DurationRound, TimeDelta, Utc};

use super::*;

const DEFAULT_JOB_TYPE: &str = "job_type";

/// Current time truncated to millisecond precision so it survives a round trip through stores
/// with coarser timestamps.
fn now() -> DateTime<Utc> {
    Utc::now()
        .duration_trunc(TimeDelta::milliseconds(1))
        .unwrap()
}

impl NewJob {
    pub(crate) fn mock_job() -> Self {
        Self::new(DEFAULT_JOB_TYPE, r#""data""#).with_scheduled_at(now() - TimeDelta::seconds(1))
    }

    pub(crate) fn with_scheduled_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub(crate) fn with_job_type(self, job_type: impl ToString) -> Self {
        Self {
            job_type: job_type.to_string(),
            ..self
        }
    }

    pub(crate) fn with_successor(self, successor: SuccessorLink) -> Self {
        Self { successor, ..self }
    }

    pub(crate) fn waiting(self) -> Self {
        Self {
            waits_for_predecessor: true,
            ..self
        }
    }

    pub(crate) fn recurring(self, cron: impl ToString) -> Self {
        Self {
            cron: Some(cron.to_string()),
            ..self
        }
    }

    pub(crate) fn without_restart(self) -> Self {
        Self {
            restart_on_crash: false,
            ..self
        }
    }
}

/// Create test suite for stevedore backend.
///
/// For backend implementors, it is useful to include this are part of your test suites.
///
/// # Example
///
/// ```
/// use stevedore::test_suite;
/// use stevedore::backend::memory::InMemoryBackend;
/// test_suite!(for: InMemoryBackend::new());
/// ```
///
/// If you using a different async test attribute you can configure the marco to use that instead.
/// For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use stevedore::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     backend: BackendImplementation::from_pool(pool).await.unwrap()
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $backend:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), backend: $backend);
    };
    (attr: $attr:meta, args: $args:tt, backend: $backend:expr) => {
        $crate::test_suite!(@tests attr: $attr, args: $args, backend: $backend,
            insert_and_get_job,
            insert_many_is_atomic,
            get_job_not_found,
            claim_returns_due_jobs_oldest_first,
            claim_skips_future_waiting_and_processing_jobs,
            claim_respects_limit,
            claim_marks_job_processing,
            concurrent_claims_are_disjoint,
            complete_jobs_marks_completed,
            complete_jobs_deletes,
            complete_jobs_unlocks_next_job,
            complete_jobs_promotes_sequence_in_order,
            complete_jobs_ignores_other_owner,
            retry_job_keeps_attempt,
            retry_job_ignores_other_owner,
            reschedule_recurrent_resets_attempt,
            fail_job_is_terminal_and_does_not_unlock,
            reclaim_stuck_restarts_eligible_jobs,
            reclaim_stuck_reports_ineligible_jobs,
            reclaim_stuck_ignores_live_workers,
            cancel_jobs_only_deletes_not_started,
            upsert_recurrent_replaces_existing,
            delete_recurrent,
        );
    };
    (@tests attr: $attr:meta, args: $args:tt, backend: $backend:expr, $($name:ident),* $(,)?) => {
        $(
            #[$attr]
            async fn $name $args {
                let backend = $backend;
                $crate::backend::testing::$name(backend).await;
            }
        )*
    };
}

pub use test_suite;

async fn claim_one(backend: &impl Backend, owner: WorkerId) -> ClaimedJob {
    let mut jobs = backend.claim(owner, 1, Utc::now()).await.unwrap();
    assert_eq!(jobs.len(), 1, "Expected to claim exactly one job");
    jobs.remove(0)
}

async fn stored(backend: &impl Backend, id: JobId) -> Job {
    backend
        .get_job(id)
        .await
        .unwrap()
        .unwrap_or_else(|| panic!("Job {id} should exist"))
}

#[doc(hidden)]
pub async fn insert_and_get_job(backend: impl Backend) {
    let new_job = NewJob::mock_job();
    let id = backend.insert(new_job.clone()).await.unwrap();

    let job = stored(&backend, id).await;

    assert_eq!(id, new_job.id);
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.job_type, new_job.job_type);
    assert_eq!(job.parameter, new_job.parameter);
    assert_eq!(job.scheduled_at, new_job.scheduled_at);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.owner, None);

    let waiting = backend.insert(NewJob::mock_job().waiting()).await.unwrap();
    assert_eq!(stored(&backend, waiting).await.status, JobStatus::WaitingPrev);
}

#[doc(hidden)]
pub async fn insert_many_is_atomic(backend: impl Backend) {
    let existing = backend.insert(NewJob::mock_job()).await.unwrap();
    let fresh = NewJob::mock_job();
    let duplicate = NewJob {
        id: existing,
        ..NewJob::mock_job()
    };

    let result = backend.insert_many(vec![fresh.clone(), duplicate]).await;

    assert!(result.is_err());
    assert!(backend.get_job(fresh.id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn get_job_not_found(backend: impl Backend) {
    assert!(backend.get_job(JobId::new()).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn claim_returns_due_jobs_oldest_first(backend: impl Backend) {
    let owner = WorkerId::new();
    let newer = backend.insert(NewJob::mock_job()).await.unwrap();
    let older = backend
        .insert(NewJob::mock_job().with_scheduled_at(now() - TimeDelta::hours(1)))
        .await
        .unwrap();

    let jobs = backend.claim(owner, 10, Utc::now()).await.unwrap();

    let ids = jobs.iter().map(|job| job.id).collect::<Vec<_>>();
    assert_eq!(ids, vec![older, newer]);
}

#[doc(hidden)]
pub async fn claim_skips_future_waiting_and_processing_jobs(backend: impl Backend) {
    let owner = WorkerId::new();
    backend
        .insert(NewJob::mock_job().with_scheduled_at(now() + TimeDelta::hours(1)))
        .await
        .unwrap();
    backend.insert(NewJob::mock_job().waiting()).await.unwrap();
    let due = backend.insert(NewJob::mock_job()).await.unwrap();

    let first = backend.claim(owner, 10, Utc::now()).await.unwrap();
    let second = backend.claim(owner, 10, Utc::now()).await.unwrap();

    assert_eq!(first.len(), 1);
    assert_eq!(first[0].id, due);
    assert!(second.is_empty());
}

#[doc(hidden)]
pub async fn claim_respects_limit(backend: impl Backend) {
    let owner = WorkerId::new();
    for _ in 0..5 {
        backend.insert(NewJob::mock_job()).await.unwrap();
    }

    assert_eq!(backend.claim(owner, 3, Utc::now()).await.unwrap().len(), 3);
    assert_eq!(backend.claim(owner, 3, Utc::now()).await.unwrap().len(), 2);
    assert_eq!(backend.claim(owner, 3, Utc::now()).await.unwrap().len(), 0);
}

#[doc(hidden)]
pub async fn claim_marks_job_processing(backend: impl Backend) {
    let owner = WorkerId::new();
    let next = JobId::new();
    let id = backend
        .insert(NewJob::mock_job().with_successor(SuccessorLink::Next(next)))
        .await
        .unwrap();

    let claimed = claim_one(&backend, owner).await;
    let job = stored(&backend, id).await;

    assert_eq!(claimed.id, id);
    assert_eq!(claimed.owner, owner);
    assert_eq!(claimed.attempt, 1);
    assert_eq!(claimed.job_type, DEFAULT_JOB_TYPE);
    assert_eq!(claimed.successor, SuccessorLink::Next(next));
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.owner, Some(owner));
    assert_eq!(job.attempt, 1);
    assert!(job.last_started_at.is_some());
}

#[doc(hidden)]
pub async fn concurrent_claims_are_disjoint(backend: impl Backend) {
    for _ in 0..20 {
        backend.insert(NewJob::mock_job()).await.unwrap();
    }

    let claims = futures::future::join_all(
        (0..8).map(|_| backend.claim(WorkerId::new(), 4, Utc::now())),
    )
    .await;

    let mut ids = claims
        .into_iter()
        .flat_map(|claim| claim.unwrap())
        .map(|job| job.id)
        .collect::<Vec<_>>();
    let claimed = ids.len();
    ids.sort();
    ids.dedup();
    assert_eq!(claimed, 20);
    assert_eq!(ids.len(), 20);
}

#[doc(hidden)]
pub async fn complete_jobs_marks_completed(backend: impl Backend) {
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;

    backend
        .complete_jobs(&[claimed.finished()], false)
        .await
        .unwrap();

    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.last_finished_at.is_some());
}

#[doc(hidden)]
pub async fn complete_jobs_deletes(backend: impl Backend) {
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;

    backend
        .complete_jobs(&[claimed.finished()], true)
        .await
        .unwrap();

    assert!(backend.get_job(id).await.unwrap().is_none());
}

#[doc(hidden)]
pub async fn complete_jobs_unlocks_next_job(backend: impl Backend) {
    let first = NewJob::mock_job();
    let second = NewJob::mock_job().waiting();
    let first = first.with_successor(SuccessorLink::Next(second.id));
    backend
        .insert_many(vec![first, second.clone()])
        .await
        .unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;
    assert_eq!(stored(&backend, second.id).await.status, JobStatus::WaitingPrev);

    backend
        .complete_jobs(&[claimed.finished()], true)
        .await
        .unwrap();

    assert_eq!(stored(&backend, second.id).await.status, JobStatus::Scheduled);
}

#[doc(hidden)]
pub async fn complete_jobs_promotes_sequence_in_order(backend: impl Backend) {
    let owner = WorkerId::new();
    let sequence = SuccessorLink::Sequence(SequenceId::new());
    let base = now() - TimeDelta::minutes(1);
    let jobs = (0..3)
        .map(|i| {
            let job = NewJob::mock_job()
                .with_successor(sequence)
                .with_scheduled_at(base + TimeDelta::seconds(i));
            if i == 0 {
                job
            } else {
                job.waiting()
            }
        })
        .collect::<Vec<_>>();
    let ids = backend.insert_many(jobs).await.unwrap();

    for (position, id) in ids.iter().enumerate() {
        let claimed = claim_one(&backend, owner).await;
        assert_eq!(claimed.id, *id);
        for waiting in &ids[position + 1..] {
            assert_eq!(stored(&backend, *waiting).await.status, JobStatus::WaitingPrev);
        }
        backend
            .complete_jobs(&[claimed.finished()], false)
            .await
            .unwrap();
    }

    assert!(backend.claim(owner, 10, Utc::now()).await.unwrap().is_empty());
}

#[doc(hidden)]
pub async fn complete_jobs_ignores_other_owner(backend: impl Backend) {
    let second = NewJob::mock_job().waiting();
    let first = NewJob::mock_job().with_successor(SuccessorLink::Next(second.id));
    let id = first.id;
    backend
        .insert_many(vec![first, second.clone()])
        .await
        .unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;
    let intruder = FinishedJob {
        job: ProcessingJob {
            id,
            owner: WorkerId::new(),
        },
        successor: claimed.successor,
    };

    backend.complete_jobs(&[intruder], false).await.unwrap();

    assert_eq!(stored(&backend, id).await.status, JobStatus::Processing);
    assert_eq!(stored(&backend, second.id).await.status, JobStatus::WaitingPrev);
}

#[doc(hidden)]
pub async fn retry_job_keeps_attempt(backend: impl Backend) {
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;
    let scheduled_at = now() + TimeDelta::seconds(5);

    backend
        .retry_job(claimed.processing(), scheduled_at, "boom".to_owned())
        .await
        .unwrap();

    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.scheduled_at, scheduled_at);
    assert_eq!(job.attempt, 1);
    assert_eq!(job.owner, None);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    assert!(job.last_finished_at.is_some());
}

#[doc(hidden)]
pub async fn retry_job_ignores_other_owner(backend: impl Backend) {
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;
    let intruder = ProcessingJob {
        id,
        owner: WorkerId::new(),
    };

    backend
        .retry_job(intruder, now(), "boom".to_owned())
        .await
        .unwrap();
    backend.fail_job(intruder, "boom".to_owned()).await.unwrap();

    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.owner, Some(claimed.owner));
}

#[doc(hidden)]
pub async fn reschedule_recurrent_resets_attempt(backend: impl Backend) {
    let id = backend
        .insert(NewJob::mock_job().recurring("0 */5 * * * *"))
        .await
        .unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;
    assert!(claimed.is_recurrent());
    let next = now() + TimeDelta::minutes(5);

    backend
        .reschedule_recurrent(claimed.processing(), next, Some("boom".to_owned()))
        .await
        .unwrap();

    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.scheduled_at, next);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.last_error.as_deref(), Some("boom"));
    assert!(job.last_finished_at.is_some());
}

#[doc(hidden)]
pub async fn fail_job_is_terminal_and_does_not_unlock(backend: impl Backend) {
    let second = NewJob::mock_job().waiting();
    let first = NewJob::mock_job().with_successor(SuccessorLink::Next(second.id));
    let id = first.id;
    backend
        .insert_many(vec![first, second.clone()])
        .await
        .unwrap();
    let claimed = claim_one(&backend, WorkerId::new()).await;

    backend
        .fail_job(claimed.processing(), "fatal".to_owned())
        .await
        .unwrap();

    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("fatal"));
    assert_eq!(stored(&backend, second.id).await.status, JobStatus::WaitingPrev);
}

#[doc(hidden)]
pub async fn reclaim_stuck_restarts_eligible_jobs(backend: impl Backend) {
    let worker = WorkerId::new();
    let t0 = now() - TimeDelta::minutes(10);
    backend.heartbeat(worker, t0).await.unwrap();
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    claim_one(&backend, worker).await;

    let reclaimed = backend
        .reclaim_stuck(t0 + TimeDelta::minutes(1))
        .await
        .unwrap();

    assert_eq!(
        reclaimed,
        vec![ReclaimedJob {
            id,
            job_type: DEFAULT_JOB_TYPE.to_owned(),
            restarted: true,
        }]
    );
    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Scheduled);
    assert_eq!(job.attempt, 0);
    assert_eq!(job.owner, None);

    let other = WorkerId::new();
    let claimed = claim_one(&backend, other).await;
    assert_eq!(claimed.id, id);
    assert_eq!(claimed.attempt, 1);
    backend
        .complete_jobs(&[claimed.finished()], false)
        .await
        .unwrap();
    assert_eq!(stored(&backend, id).await.status, JobStatus::Completed);
}

#[doc(hidden)]
pub async fn reclaim_stuck_reports_ineligible_jobs(backend: impl Backend) {
    let worker = WorkerId::new();
    let t0 = now() - TimeDelta::minutes(10);
    backend.heartbeat(worker, t0).await.unwrap();
    let id = backend
        .insert(NewJob::mock_job().without_restart())
        .await
        .unwrap();
    claim_one(&backend, worker).await;

    let reclaimed = backend
        .reclaim_stuck(t0 + TimeDelta::minutes(1))
        .await
        .unwrap();

    assert_eq!(reclaimed.len(), 1);
    assert!(!reclaimed[0].restarted);
    let job = stored(&backend, id).await;
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.attempt, 1);
}

#[doc(hidden)]
pub async fn reclaim_stuck_ignores_live_workers(backend: impl Backend) {
    let worker = WorkerId::new();
    backend.heartbeat(worker, Utc::now()).await.unwrap();
    let id = backend.insert(NewJob::mock_job()).await.unwrap();
    claim_one(&backend, worker).await;

    let reclaimed = backend
        .reclaim_stuck(Utc::now() - TimeDelta::minutes(1))
        .await
        .unwrap();

    assert!(reclaimed.is_empty());
    assert_eq!(stored(&backend, id).await.status, JobStatus::Processing);
}

#[doc(hidden)]
pub async fn cancel_jobs_only_deletes_not_started(backend: impl Backend) {
    let scheduled = backend.insert(NewJob::mock_job()).await.unwrap();
    let processing = backend
        .insert(NewJob::mock_job().with_scheduled_at(now() - TimeDelta::hours(1)))
        .await
        .unwrap();
    claim_one(&backend, WorkerId::new()).await;
    let waiting = backend.insert(NewJob::mock_job().waiting()).await.unwrap();

    let deleted = backend
        .cancel_jobs(&[scheduled, processing, waiting])
        .await
        .unwrap();

    assert_eq!(deleted, 2);
    assert!(backend.get_job(scheduled).await.unwrap().is_none());
    assert!(backend.get_job(waiting).await.unwrap().is_none());
    assert!(backend.get_job(processing).await.unwrap().is_some());
}

#[doc(hidden)]
pub async fn upsert_recurrent_replaces_existing(backend: impl Backend) {
    let first = backend
        .upsert_recurrent(NewJob::mock_job().recurring("0 */5 * * * *"))
        .await
        .unwrap();
    let second = backend
        .upsert_recurrent(
            NewJob::new(DEFAULT_JOB_TYPE, r#""other""#).recurring("0 */10 * * * *"),
        )
        .await
        .unwrap();

    assert_eq!(first, second);
    let job = stored(&backend, first).await;
    assert_eq!(job.cron.as_deref(), Some("0 */10 * * * *"));
    assert_eq!(job.parameter, r#""other""#);
}

#[doc(hidden)]
pub async fn delete_recurrent(backend: impl Backend) {
    let recurrent = backend
        .upsert_recurrent(NewJob::mock_job().recurring("0 */5 * * * *"))
        .await
        .unwrap();
    let other = backend
        .upsert_recurrent(
            NewJob::mock_job()
                .with_job_type("other_job_type")
                .recurring("0 */5 * * * *"),
        )
        .await
        .unwrap();
    let one_off = backend.insert(NewJob::mock_job()).await.unwrap();

    let deleted = backend.delete_recurrent(DEFAULT_JOB_TYPE).await.unwrap();

    assert_eq!(deleted, 1);
    assert!(backend.get_job(recurrent).await.unwrap().is_none());
    assert!(backend.get_job(other).await.unwrap().is_some());
    assert!(backend.get_job(one_off).await.unwrap().is_some());
}
