//! Bounded, staggered fan-out of job descriptions and fan-in of their outcomes.
//!
//! At most `concurrency_limit` jobs are alive at once. Every launch passes
//! through one global gate so two consecutive launches are never closer than
//! `stagger_interval`, whichever slot they run in. Outcomes come back in
//! completion order, exactly one per submitted job.
//!
//! Once the shutdown token fires no further job is launched. Jobs still
//! waiting for a slot or for the stagger gate come back as
//! [`OutcomeStatus::NotStarted`](crate::scheduler::job::OutcomeStatus::NotStarted).
//! Jobs already running are left to the runner, which kills them.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{DispatchError, Result};
use crate::scheduler::job::{FailureKind, JobDescription, JobOutcome, OutcomeStatus};

pub type OutcomeFuture = Pin<Box<dyn Future<Output = JobOutcome> + Send>>;

/// Starts one job.
///
/// `launch` must start the job before returning; the returned future only
/// waits for it. The dispatcher relies on this to time launches.
pub trait JobRunner: Send + Sync + 'static {
    fn launch(&self, job: JobDescription) -> OutcomeFuture;
}

/// Serializes launches and spaces them by at least `interval`.
struct LaunchGate {
    interval: Duration,
    last_launch: Mutex<Option<Instant>>,
}

impl LaunchGate {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_launch: Mutex::new(None),
        }
    }

    /// Hands the job back if shutdown is requested before it could launch.
    async fn launch<R: JobRunner>(
        &self,
        runner: &R,
        job: JobDescription,
        shutdown: &CancellationToken,
    ) -> std::result::Result<OutcomeFuture, JobDescription> {
        let mut last_launch = self.last_launch.lock().await;

        if let Some(previous) = *last_launch {
            tokio::select! {
                _ = tokio::time::sleep_until(previous + self.interval) => {}
                _ = shutdown.cancelled() => return Err(job),
            }
        }
        if shutdown.is_cancelled() {
            return Err(job);
        }

        let outcome = runner.launch(job);
        *last_launch = Some(Instant::now());
        Ok(outcome)
    }
}

pub struct Dispatcher<R: JobRunner> {
    runner: Arc<R>,
    concurrency_limit: usize,
    stagger_interval: Duration,
    shutdown: CancellationToken,
}

impl<R: JobRunner> Dispatcher<R> {
    /// Fails with `InvalidConcurrency` when `concurrency_limit` is 0.
    pub fn new(runner: R, concurrency_limit: usize, stagger_interval: Duration) -> Result<Self> {
        if concurrency_limit == 0 {
            return Err(DispatchError::InvalidConcurrency(concurrency_limit));
        }
        Ok(Self {
            runner: Arc::new(runner),
            concurrency_limit,
            stagger_interval,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    /// Run every job and return once all of them have terminated.
    pub async fn run(&self, jobs: Vec<JobDescription>) -> Vec<JobOutcome> {
        if jobs.is_empty() {
            return Vec::new();
        }

        tracing::info!(
            jobs = jobs.len(),
            concurrency_limit = self.concurrency_limit,
            stagger_interval = ?self.stagger_interval,
            "Dispatching jobs"
        );

        let slots = Arc::new(Semaphore::new(self.concurrency_limit));
        let gate = Arc::new(LaunchGate::new(self.stagger_interval));
        let mut tasks = JoinSet::new();
        let mut owners = HashMap::with_capacity(jobs.len());

        for job in jobs {
            let owner = (job.id, job.key.clone(), job.label.clone());
            let runner = Arc::clone(&self.runner);
            let slots = Arc::clone(&slots);
            let gate = Arc::clone(&gate);
            let shutdown = self.shutdown.clone();

            let handle = tasks.spawn(async move {
                let _slot = tokio::select! {
                    permit = slots.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(e) => {
                            return JobOutcome::failed(&job, FailureKind::Internal, Some(e.to_string()));
                        }
                    },
                    _ = shutdown.cancelled() => return not_started(job),
                };

                match gate.launch(runner.as_ref(), job, &shutdown).await {
                    Ok(outcome) => outcome.await,
                    Err(job) => not_started(job),
                }
            });
            owners.insert(handle.id(), owner);
        }

        let mut outcomes = Vec::with_capacity(owners.len());
        while let Some(joined) = tasks.join_next_with_id().await {
            match joined {
                Ok((_, outcome)) => outcomes.push(outcome),
                Err(e) => {
                    let Some((job_id, key, label)) = owners.remove(&e.id()) else {
                        tracing::error!(error = %e, "Unknown dispatch task ended abnormally");
                        continue;
                    };
                    tracing::error!(job_id = %job_id, key = %key, error = %e, "Job task ended abnormally");
                    outcomes.push(JobOutcome::failure(
                        job_id,
                        key,
                        label,
                        FailureKind::Internal,
                        Some(e.to_string()),
                    ));
                }
            }
        }

        let completed = outcomes.iter().filter(|o| o.is_success()).count();
        let not_started = outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::NotStarted)
            .count();
        tracing::info!(
            completed,
            failed = outcomes.len() - completed - not_started,
            not_started,
            "All dispatched jobs terminated"
        );
        outcomes
    }
}

fn not_started(job: JobDescription) -> JobOutcome {
    tracing::warn!(job_id = %job.id, key = %job.key, "Shutdown requested before launch");
    JobOutcome::not_started(&job)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::CompositeKey;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    const UNIT: Duration = Duration::from_secs(10);

    /// Sleeps one unit per job and fails jobs whose label is "fail".
    #[derive(Default)]
    struct FakeRunner {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        launches: Arc<StdMutex<Vec<Instant>>>,
    }

    impl JobRunner for FakeRunner {
        fn launch(&self, job: JobDescription) -> OutcomeFuture {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.launches.lock().unwrap().push(Instant::now());

            let active = Arc::clone(&self.active);
            Box::pin(async move {
                tokio::time::sleep(UNIT).await;
                active.fetch_sub(1, Ordering::SeqCst);
                if job.label == "fail" {
                    JobOutcome::failed(&job, FailureKind::NonZeroExit, None)
                } else {
                    JobOutcome::completed(&job, Some(0))
                }
            })
        }
    }

    struct PanickingRunner;

    impl JobRunner for PanickingRunner {
        fn launch(&self, job: JobDescription) -> OutcomeFuture {
            Box::pin(async move {
                if job.label == "panic" {
                    panic!("runner blew up");
                }
                JobOutcome::completed(&job, Some(0))
            })
        }
    }

    fn jobs(count: usize) -> Vec<JobDescription> {
        (0..count)
            .map(|i| JobDescription::new(CompositeKey::new(format!("S{i}"), "240101_A"), "ok", "true"))
            .collect()
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let err = Dispatcher::new(FakeRunner::default(), 0, Duration::ZERO).err();
        assert!(matches!(err, Some(DispatchError::InvalidConcurrency(0))));
    }

    #[tokio::test(start_paused = true)]
    async fn no_jobs_is_a_no_op() {
        let runner = FakeRunner::default();
        let launches = Arc::clone(&runner.launches);
        let dispatcher = Dispatcher::new(runner, 2, Duration::ZERO).unwrap();

        assert!(dispatcher.run(Vec::new()).await.is_empty());
        assert!(launches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrency_limit_bounds_active_jobs() {
        let runner = FakeRunner::default();
        let peak = Arc::clone(&runner.peak);
        let dispatcher = Dispatcher::new(runner, 2, Duration::ZERO).unwrap();

        let start = Instant::now();
        let outcomes = dispatcher.run(jobs(5)).await;

        assert_eq!(outcomes.len(), 5);
        assert_eq!(peak.load(Ordering::SeqCst), 2);
        // ceil(5 / 2) rounds of one unit each
        let elapsed = start.elapsed();
        assert!(elapsed >= UNIT * 3 && elapsed < UNIT * 4, "elapsed {elapsed:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn launches_are_staggered_across_slots() {
        let runner = FakeRunner::default();
        let launches = Arc::clone(&runner.launches);
        let stagger = Duration::from_secs(3);
        let dispatcher = Dispatcher::new(runner, 4, stagger).unwrap();

        dispatcher.run(jobs(4)).await;

        let launches = launches.lock().unwrap();
        assert_eq!(launches.len(), 4);
        for pair in launches.windows(2) {
            assert!(pair[1] - pair[0] >= stagger);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_outcome_per_job_and_failures_are_isolated() {
        let dispatcher = Dispatcher::new(FakeRunner::default(), 3, Duration::ZERO).unwrap();
        let mut submitted = jobs(4);
        submitted[1].label = "fail".to_string();
        let failing = submitted[1].id;
        let ids: HashSet<_> = submitted.iter().map(|j| j.id).collect();

        let outcomes = dispatcher.run(submitted).await;

        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes.iter().map(|o| o.job_id).collect::<HashSet<_>>(), ids);
        for outcome in &outcomes {
            assert_eq!(outcome.is_success(), outcome.job_id != failing);
        }
    }

    #[tokio::test]
    async fn panicking_task_still_yields_an_outcome() {
        let dispatcher = Dispatcher::new(PanickingRunner, 2, Duration::ZERO).unwrap();
        let mut submitted = jobs(3);
        submitted[0].label = "panic".to_string();
        let panicked = submitted[0].id;

        let outcomes = dispatcher.run(submitted).await;

        assert_eq!(outcomes.len(), 3);
        let failed = outcomes.iter().find(|o| o.job_id == panicked).unwrap();
        assert_eq!(failed.status, OutcomeStatus::Failed(FailureKind::Internal));
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_before_launch_yields_not_started_outcomes() {
        let runner = FakeRunner::default();
        let launches = Arc::clone(&runner.launches);
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let dispatcher = Dispatcher::new(runner, 2, Duration::ZERO)
            .unwrap()
            .with_shutdown(shutdown);

        let outcomes = dispatcher.run(jobs(3)).await;

        assert_eq!(outcomes.len(), 3);
        assert!(outcomes
            .iter()
            .all(|o| o.status == OutcomeStatus::NotStarted));
        assert!(launches.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_mid_pass_stops_further_launches() {
        let runner = FakeRunner::default();
        let launches = Arc::clone(&runner.launches);
        let shutdown = CancellationToken::new();
        let dispatcher = Dispatcher::new(runner, 1, Duration::ZERO)
            .unwrap()
            .with_shutdown(shutdown.clone());

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(UNIT / 2).await;
            shutdown.cancel();
        });
        let outcomes = dispatcher.run(jobs(3)).await;
        canceller.await.unwrap();

        // FakeRunner ignores the token, so the first job still completes.
        assert_eq!(launches.lock().unwrap().len(), 1);
        assert_eq!(outcomes.iter().filter(|o| o.is_success()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| o.status == OutcomeStatus::NotStarted)
                .count(),
            2
        );
    }
}
