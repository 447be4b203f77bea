//! Backfill scheduler.
//!
//! Turns `(identifier, endpoint)` pairs into repository fetches. Jobs are
//! persisted in the [`JobStore`] on submit; [`Scheduler::run`] loads the
//! pending ones into per-host FIFO queues and works through them:
//!
//! ```text
//!  JobStore ──load──▶ host queues (round robin) ──▶ dispatch ──▶ JoinSet
//!      ▲                  ▲                           │ global Semaphore
//!      │                  │ retry (not_before)        │ HostLimiter permit
//!      └──── status ──────┴──────────── settle ◀──────┘
//! ```
//!
//! A job is dispatched only when a global slot is free, its host is below
//! the per-host cap and not throttled, and its backoff has elapsed. Each
//! identifier is either queued or in flight, never both, so there is at most
//! one fetch per identifier.
//!
//! # Outcomes
//!
//! | result                     | job status          | notes                               |
//! |----------------------------|---------------------|-------------------------------------|
//! | records committed          | `done`              |                                     |
//! | transient, attempts left   | `pending` (requeued) | exponential backoff                 |
//! | rate limited               | as transient        | host throttled for the server delay |
//! | transient, attempts spent  | `failed`            | reported in [`RunSummary::failed`]  |
//! | permanent                  | `failed`            | no retry                            |
//! | cancelled                  | `pending`           | attempt not counted                 |
//! | persistence failure        | `pending`           | run stops after draining            |
//! | fetch task panicked        | as transient        |                                     |

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{self, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use atarchive_core::metrics::{increment_labeled, record_duration, set_gauge};

use super::endpoint::{EndpointOptions, host_key, normalize_endpoint};
use super::fetcher::SnapshotFetcher;
use super::job::{BackfillJob, JobStore, SubmitOutcome};
use super::limiter::{HostLimiter, HostPermit};
use super::sink::RecordSink;
use crate::backoff::RetryPolicy;
use crate::{Error, Result};

/// Configuration for the backfill scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent fetches per host.
    /// Default: 4
    pub per_host: usize,

    /// Concurrent fetches overall.
    /// Default: 64
    pub global: usize,

    /// Attempts per job and backoff between them.
    /// Default: 5 attempts, 2s doubling to 120s
    pub retry: RetryPolicy,

    /// Deadline for one fetch, body included. Exceeding it is transient.
    /// Default: 10 minutes
    pub fetch_deadline: Duration,

    /// Host pause after a rate-limited response that names no delay.
    /// Default: 30 seconds
    pub rate_limit_pause: Duration,

    pub endpoint: EndpointOptions,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            per_host: 4,
            global: 64,
            retry: RetryPolicy::new(5, Duration::from_secs(2), Duration::from_secs(120)),
            fetch_deadline: Duration::from_secs(600),
            rate_limit_pause: Duration::from_secs(30),
            endpoint: EndpointOptions::default(),
        }
    }
}

/// What a run accomplished.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub completed: usize,
    pub records: u64,
    pub retries: usize,
    /// In-flight fetches cancelled by shutdown; back to pending.
    pub cancelled: usize,
    /// Jobs that failed for good during this run.
    pub failed: Vec<BackfillJob>,
}

#[derive(Debug, Clone)]
struct QueuedJob {
    identifier: String,
    endpoint: String,
    host: String,
    not_before: Instant,
}

/// Per-host FIFO queues served round robin.
#[derive(Default)]
struct HostQueues {
    order: VecDeque<String>,
    queues: HashMap<String, VecDeque<QueuedJob>>,
    /// Identifiers queued or in flight.
    known: HashSet<String>,
}

impl HostQueues {
    fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    fn len(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Queue a job unless the identifier is already queued or in flight.
    fn push(&mut self, job: QueuedJob) -> bool {
        if !self.known.insert(job.identifier.clone()) {
            return false;
        }
        self.requeue(job);
        true
    }

    /// Put a job the scheduler already owns back in its host queue.
    fn requeue(&mut self, job: QueuedJob) {
        let queue = self.queues.entry(job.host.clone()).or_default();
        if queue.is_empty() {
            self.order.push_back(job.host.clone());
        }
        queue.push_back(job);
    }

    fn forget(&mut self, identifier: &str) {
        self.known.remove(identifier);
    }

    /// Take the next runnable job, rotating through hosts.
    fn next_ready(&mut self, limiter: &HostLimiter, now: Instant) -> Option<(QueuedJob, HostPermit)> {
        for _ in 0..self.order.len() {
            let host = self.order.pop_front()?;
            let Some(queue) = self.queues.get_mut(&host) else {
                continue;
            };

            let ready = queue.iter().position(|job| job.not_before <= now);
            let claimed = ready.and_then(|index| {
                let permit = limiter.try_acquire(&host)?;
                queue.remove(index).map(|job| (job, permit))
            });

            if queue.is_empty() {
                self.queues.remove(&host);
            } else {
                self.order.push_back(host);
            }
            if claimed.is_some() {
                return claimed;
            }
        }
        None
    }

    /// Earliest future instant at which a queued job could become runnable
    /// through time alone. Hosts that are only blocked by their cap wait for
    /// a completion instead.
    fn next_wakeup(&self, limiter: &HostLimiter, now: Instant) -> Option<Instant> {
        self.queues
            .iter()
            .filter_map(|(host, queue)| {
                let earliest = queue.iter().map(|job| job.not_before).min()?;
                let ready_at = limiter
                    .throttled_until(host)
                    .map_or(earliest, |until| until.max(earliest));
                (ready_at > now).then_some(ready_at)
            })
            .min()
    }
}

enum Attempt {
    Done(u64),
    Failed(Error),
    Cancelled,
}

struct Finished {
    job: QueuedJob,
    attempt: u32,
    result: Attempt,
}

/// Normalize `endpoint` and record a job for it.
///
/// An endpoint that fails validation is recorded as a failed job, so it shows
/// up in the failure export instead of disappearing.
pub fn submit_job(
    jobs: &JobStore,
    identifier: &str,
    endpoint: &str,
    options: EndpointOptions,
) -> Result<SubmitOutcome> {
    let outcome = match normalize_endpoint(endpoint, options) {
        Ok(normalized) => jobs.submit(identifier, &normalized)?,
        Err(e) => {
            warn!("Rejecting job for {}: {}", identifier, e);
            jobs.submit_failed(identifier, endpoint, &e.to_string())?;
            SubmitOutcome::Rejected
        }
    };

    let label = match outcome {
        SubmitOutcome::Created => "created",
        SubmitOutcome::Retargeted => "retargeted",
        SubmitOutcome::Unchanged => "unchanged",
        SubmitOutcome::AlreadyDone => "already_done",
        SubmitOutcome::Rejected => "rejected",
    };
    increment_labeled("backfill_jobs_submitted_total", "outcome", label, 1);
    Ok(outcome)
}

/// Persistent, host-polite backfill scheduler.
pub struct Scheduler {
    config: SchedulerConfig,
    jobs: Arc<JobStore>,
    fetcher: Arc<dyn SnapshotFetcher>,
    sink: Arc<dyn RecordSink>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        jobs: Arc<JobStore>,
        fetcher: Arc<dyn SnapshotFetcher>,
        sink: Arc<dyn RecordSink>,
    ) -> Self {
        Self {
            config,
            jobs,
            fetcher,
            sink,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn jobs(&self) -> &JobStore {
        &self.jobs
    }

    /// Record a job. Invalid endpoints are stored as failed right away.
    pub fn submit(&self, identifier: &str, endpoint: &str) -> Result<SubmitOutcome> {
        submit_job(&self.jobs, identifier, endpoint, self.config.endpoint)
    }

    /// Work through every pending job, then return.
    ///
    /// Jobs submitted while running are picked up once the queues drain.
    /// Cancelling `shutdown` cancels in-flight fetches, returns their jobs to
    /// pending and ends the run.
    pub async fn run(
        &self,
        per_host: usize,
        global: usize,
        shutdown: CancellationToken,
    ) -> Result<RunSummary> {
        let limiter = HostLimiter::new(per_host);
        let slots = Arc::new(Semaphore::new(global.max(1)));
        let cancel = shutdown.child_token();
        let mut queues = HostQueues::default();
        let mut tasks: JoinSet<Finished> = JoinSet::new();
        let mut in_flight: HashMap<task::Id, (QueuedJob, u32)> = HashMap::new();
        let mut summary = RunSummary::default();
        let mut fatal: Option<Error> = None;

        self.jobs.recover_interrupted()?;
        self.load_pending(&mut queues)?;
        info!(
            "Backfill run starting: {} jobs queued, per_host={}, global={}",
            queues.len(),
            limiter.per_host(),
            global.max(1)
        );

        loop {
            if !cancel.is_cancelled()
                && let Err(e) =
                    self.dispatch(&mut queues, &limiter, &slots, &mut tasks, &mut in_flight, &cancel)
            {
                error!("Backfill stopping: {}", e);
                fatal = Some(e);
                cancel.cancel();
            }
            set_gauge("backfill_inflight", tasks.len() as f64);

            if tasks.is_empty() {
                if cancel.is_cancelled() {
                    break;
                }
                if queues.is_empty() {
                    self.load_pending(&mut queues)?;
                    if queues.is_empty() {
                        break;
                    }
                    continue;
                }
            }

            let wakeup = queues.next_wakeup(&limiter, Instant::now());
            if tasks.is_empty() && wakeup.is_none() {
                // A throttle expired between dispatch and now.
                continue;
            }
            tokio::select! {
                Some(joined) = tasks.join_next_with_id() => {
                    let finished = match joined {
                        Ok((id, finished)) => {
                            in_flight.remove(&id);
                            finished
                        }
                        Err(e) => {
                            let Some((job, attempt)) = in_flight.remove(&e.id()) else {
                                error!("Untracked fetch task failed: {}", e);
                                continue;
                            };
                            error!("Fetch task for {} failed: {}", job.identifier, e);
                            Finished {
                                job,
                                attempt,
                                result: Attempt::Failed(Error::Task(e.to_string())),
                            }
                        }
                    };
                    if let Err(e) = self.settle(finished, &mut queues, &limiter, &mut summary)
                        && fatal.is_none()
                    {
                        error!("Backfill stopping: {}", e);
                        fatal = Some(e);
                        cancel.cancel();
                    }
                }
                _ = tokio::time::sleep_until(wakeup.unwrap_or_else(Instant::now)), if wakeup.is_some() => {}
                _ = cancel.cancelled(), if !cancel.is_cancelled() => {
                    info!("Backfill cancelled, waiting for {} in-flight fetches", tasks.len());
                }
                else => {}
            }
        }

        set_gauge("backfill_inflight", 0.0);
        if let Some(e) = fatal {
            return Err(e);
        }

        info!(
            "Backfill run finished: {} completed, {} failed, {} retries, {} cancelled, {} records",
            summary.completed,
            summary.failed.len(),
            summary.retries,
            summary.cancelled,
            summary.records
        );
        Ok(summary)
    }

    fn load_pending(&self, queues: &mut HostQueues) -> Result<()> {
        let now = Instant::now();
        for job in self.jobs.pending_jobs()? {
            queues.push(QueuedJob {
                host: host_key(&job.endpoint),
                identifier: job.identifier,
                endpoint: job.endpoint,
                not_before: now,
            });
        }
        Ok(())
    }

    /// Start as many jobs as slots, caps and backoffs allow.
    fn dispatch(
        &self,
        queues: &mut HostQueues,
        limiter: &HostLimiter,
        slots: &Arc<Semaphore>,
        tasks: &mut JoinSet<Finished>,
        in_flight: &mut HashMap<task::Id, (QueuedJob, u32)>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        loop {
            let Ok(slot) = slots.clone().try_acquire_owned() else {
                return Ok(());
            };
            let Some((job, permit)) = queues.next_ready(limiter, Instant::now()) else {
                return Ok(());
            };

            let Some(attempt) = self.jobs.mark_fetching(&job.identifier)? else {
                debug!("Job {} is no longer pending, dropping it", job.identifier);
                queues.forget(&job.identifier);
                continue;
            };

            debug!(
                "Fetching {} from {} (attempt {})",
                job.identifier, job.endpoint, attempt
            );
            let handle = tasks.spawn(run_fetch(
                job.clone(),
                attempt,
                self.fetcher.clone(),
                self.sink.clone(),
                self.config.fetch_deadline,
                cancel.clone(),
                slot,
                permit,
            ));
            in_flight.insert(handle.id(), (job, attempt));
        }
    }

    /// Record a finished attempt. Errors are persistence failures.
    fn settle(
        &self,
        finished: Finished,
        queues: &mut HostQueues,
        limiter: &HostLimiter,
        summary: &mut RunSummary,
    ) -> Result<()> {
        let Finished {
            mut job,
            attempt,
            result,
        } = finished;

        let err = match result {
            Attempt::Done(records) => {
                queues.forget(&job.identifier);
                self.jobs.mark_done(&job.identifier, records)?;
                summary.completed += 1;
                summary.records += records;
                increment_labeled("backfill_jobs_completed_total", "outcome", "done", 1);
                return Ok(());
            }
            Attempt::Cancelled => {
                queues.forget(&job.identifier);
                self.jobs.revert_fetching(&job.identifier)?;
                summary.cancelled += 1;
                return Ok(());
            }
            Attempt::Failed(err) => err,
        };

        if matches!(err, Error::Persistence(_) | Error::Database(_)) {
            queues.forget(&job.identifier);
            self.jobs.revert_fetching(&job.identifier)?;
            return Err(err);
        }

        if let Error::RateLimited { retry_after } = &err {
            let pause = retry_after.unwrap_or(self.config.rate_limit_pause);
            warn!("{} rate limited us, pausing it for {:?}", job.host, pause);
            limiter.throttle(&job.host, pause);
            metrics::counter!("backfill_rate_limited_total").increment(1);
        }

        if err.is_transient() && self.config.retry.allows(attempt) {
            let delay = self.config.retry.delay_for(attempt.saturating_sub(1));
            debug!(
                "Fetch of {} failed ({}), retrying in {:?}",
                job.identifier, err, delay
            );
            self.jobs.mark_retry(&job.identifier, &err.to_string())?;
            job.not_before = Instant::now() + delay;
            queues.requeue(job);
            summary.retries += 1;
            metrics::counter!("backfill_fetch_retries_total").increment(1);
            return Ok(());
        }

        warn!(
            "Fetch of {} from {} failed after {} attempts: {}",
            job.identifier, job.endpoint, attempt, err
        );
        queues.forget(&job.identifier);
        self.jobs.mark_failed(&job.identifier, &err.to_string())?;
        increment_labeled("backfill_jobs_completed_total", "outcome", err.class(), 1);
        if let Some(failed) = self.jobs.get(&job.identifier)? {
            summary.failed.push(failed);
        }
        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_fetch(
    job: QueuedJob,
    attempt: u32,
    fetcher: Arc<dyn SnapshotFetcher>,
    sink: Arc<dyn RecordSink>,
    deadline: Duration,
    cancel: CancellationToken,
    _slot: OwnedSemaphorePermit,
    _permit: HostPermit,
) -> Finished {
    let started = std::time::Instant::now();

    let result = tokio::select! {
        _ = cancel.cancelled() => Attempt::Cancelled,
        outcome = tokio::time::timeout(
            deadline,
            fetch_into(fetcher.as_ref(), sink.as_ref(), &job.identifier, &job.endpoint),
        ) => match outcome {
            Ok(Ok(records)) => Attempt::Done(records),
            Ok(Err(e)) => Attempt::Failed(e),
            Err(_) => Attempt::Failed(Error::Timeout(deadline)),
        },
    };

    record_duration("backfill_fetch_duration_seconds", started.elapsed());
    Finished {
        job,
        attempt,
        result,
    }
}

/// Stream one repository into the sink. Sink failures are persistence errors.
async fn fetch_into(
    fetcher: &dyn SnapshotFetcher,
    sink: &dyn RecordSink,
    identifier: &str,
    endpoint: &str,
) -> Result<u64> {
    let sink_error = |e: Error| Error::Persistence(format!("record sink for {}: {}", identifier, e));

    let mut records = fetcher.fetch(identifier, endpoint).await?;
    let mut writer = sink.open(identifier).map_err(sink_error)?;
    while let Some(record) = records.next().await {
        writer.write(&record?).map_err(sink_error)?;
    }
    writer.commit().map_err(sink_error)
}
