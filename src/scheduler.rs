//! Scheduler - recurring job triggers, run-now, deadlines and retention
//!
//! Each scheduled job gets its own trigger task that sleeps until the next
//! fire time and then spawns an execution. Executions of different jobs run
//! concurrently; a firing that finds its own job still running is skipped.
//! Every execution gets a child of the scheduler's shutdown token, so both a
//! job deadline and [`Scheduler::stop`] cancel in-flight work cooperatively.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{Config, JobConfig, JobSchedule, StoreConfig};
use crate::ledger::{Ledger, LedgerError, TransactionRecord, TransactionStatus};
use crate::sync::{JobReport, SyncEngine};

/// Something that can execute one run of a job
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Run `job` once, stopping at the next checkpoint after `cancel` fires
    async fn run_job(&self, job: &JobConfig, cancel: CancellationToken) -> JobReport;
}

#[async_trait]
impl JobRunner for SyncEngine {
    async fn run_job(&self, job: &JobConfig, cancel: CancellationToken) -> JobReport {
        self.sync_job(job, cancel).await
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("unknown job '{0}'")]
    UnknownJob(String),

    #[error("job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("invalid schedule for job '{job}': {reason}")]
    InvalidSchedule { job: String, reason: String },

    #[error("job '{job}' timed out after {timeout:?}")]
    TimedOut {
        job: String,
        timeout: Duration,
        report: Box<JobReport>,
    },

    #[error("job '{job}' failed: {summary}")]
    JobFailed {
        job: String,
        summary: String,
        report: Box<JobReport>,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// How long finished transactions are kept and how often they are swept
#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    /// Zero disables the sweep
    pub days: u32,
    pub sweep_interval: Duration,
}

impl RetentionPolicy {
    pub fn disabled() -> Self {
        Self {
            days: 0,
            sweep_interval: Duration::from_secs(24 * 3600),
        }
    }

    pub fn from_store(store: &StoreConfig) -> Self {
        Self {
            days: store.retention_days,
            sweep_interval: store.sweep_interval,
        }
    }

    fn window(&self) -> Option<chrono::Duration> {
        (self.days > 0).then(|| chrono::Duration::days(i64::from(self.days)))
    }
}

/// Point-in-time view of one job
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub schedule: String,
    pub enabled: bool,
    /// A trigger is registered for this job
    pub scheduled: bool,
    pub running: bool,
    pub next_run: Option<DateTime<Utc>>,
    pub prev_run: Option<DateTime<Utc>>,
    /// Most recent ledger entries, newest first
    pub recent: Vec<TransactionRecord>,
}

struct JobEntry {
    schedule: JobSchedule,
    next_run: Option<DateTime<Utc>>,
    prev_run: Option<DateTime<Utc>>,
}

struct Inner {
    jobs: Vec<Arc<JobConfig>>,
    runner: Arc<dyn JobRunner>,
    ledger: Option<Arc<Ledger>>,
    retention: RetentionPolicy,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    entries: RwLock<HashMap<String, JobEntry>>,
    running: Mutex<HashSet<String>>,
    sweep_started: AtomicBool,
}

/// Owns the configured jobs and drives them on their schedules
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        jobs: Vec<JobConfig>,
        runner: Arc<dyn JobRunner>,
        ledger: Option<Arc<Ledger>>,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                jobs: jobs.into_iter().map(Arc::new).collect(),
                runner,
                ledger,
                retention,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
                entries: RwLock::new(HashMap::new()),
                running: Mutex::new(HashSet::new()),
                sweep_started: AtomicBool::new(false),
            }),
        }
    }

    /// Scheduler running the configured jobs through `engine`
    pub fn from_config(config: &Config, engine: SyncEngine) -> Self {
        let ledger = Arc::clone(engine.ledger());
        Self::new(
            config.jobs.clone(),
            Arc::new(engine),
            Some(ledger),
            RetentionPolicy::from_store(&config.store),
        )
    }

    /// Register triggers for every enabled job and start the retention sweep
    ///
    /// Jobs that already have a trigger are left alone. Returns the number of
    /// newly scheduled jobs.
    pub fn start(&self) -> Result<usize, SchedulerError> {
        let inner = &self.inner;
        let now = Utc::now();
        let mut scheduled = 0;

        for job in inner.jobs.iter().filter(|job| job.enabled) {
            {
                let mut entries = inner.entries.write();
                if entries.contains_key(&job.name) {
                    warn!(job = %job.name, "Job already scheduled");
                    continue;
                }

                let schedule = JobSchedule::parse(&job.schedule).map_err(|e| {
                    SchedulerError::InvalidSchedule {
                        job: job.name.clone(),
                        reason: format!("{:#}", e),
                    }
                })?;
                let next_run = schedule.next_after(now);
                entries.insert(
                    job.name.clone(),
                    JobEntry {
                        schedule,
                        next_run,
                        prev_run: None,
                    },
                );
                info!(job = %job.name, schedule = %job.schedule, next_run = ?next_run, "Job scheduled");
            }

            inner
                .tracker
                .spawn(trigger_loop(Arc::clone(inner), Arc::clone(job)));
            scheduled += 1;
        }

        if inner.ledger.is_some()
            && inner.retention.window().is_some()
            && !inner.sweep_started.swap(true, Ordering::SeqCst)
        {
            inner.tracker.spawn(sweep_loop(Arc::clone(inner)));
        }

        Ok(scheduled)
    }

    /// Cancel all pending and in-flight work and wait for it to finish
    pub async fn stop(&self) {
        info!("Stopping scheduler");
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("Scheduler stopped");
    }

    /// Execute one job immediately, outside its schedule
    pub async fn run_now(&self, name: &str) -> Result<JobReport, SchedulerError> {
        let job = self
            .inner
            .job(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.inner.execute(&job).await
    }

    /// Execute every enabled job once, concurrently
    pub async fn run_all_now(&self) -> Vec<(String, Result<JobReport, SchedulerError>)> {
        let runs = self
            .inner
            .jobs
            .iter()
            .filter(|job| job.enabled)
            .map(|job| async move { (job.name.clone(), self.inner.execute(job).await) });

        futures::future::join_all(runs).await
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.inner.running.lock().contains(name)
    }

    /// Status of one job joined with its `recent` latest ledger entries
    pub fn job_status(&self, name: &str, recent: usize) -> Result<JobStatus, SchedulerError> {
        let job = self
            .inner
            .job(name)
            .ok_or_else(|| SchedulerError::UnknownJob(name.to_string()))?;
        self.inner.status_of(&job, recent)
    }

    /// Status of every configured job, sorted by name
    pub fn all_statuses(&self, recent: usize) -> Result<Vec<JobStatus>, SchedulerError> {
        let mut statuses = self
            .inner
            .jobs
            .iter()
            .map(|job| self.inner.status_of(job, recent))
            .collect::<Result<Vec<_>, _>>()?;
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(statuses)
    }

    /// Delete ledger records past the retention window
    pub fn sweep_retention(&self) -> Result<usize, SchedulerError> {
        self.inner.sweep()
    }
}

impl Inner {
    fn job(&self, name: &str) -> Option<Arc<JobConfig>> {
        self.jobs.iter().find(|job| job.name == name).cloned()
    }

    fn status_of(&self, job: &JobConfig, recent: usize) -> Result<JobStatus, SchedulerError> {
        let (scheduled, next_run, prev_run) = match self.entries.read().get(&job.name) {
            Some(entry) => (true, entry.next_run, entry.prev_run),
            None => (false, None, None),
        };

        let recent = match (&self.ledger, recent) {
            (Some(ledger), n) if n > 0 => ledger.list_by_job(&job.name, n)?,
            _ => Vec::new(),
        };

        Ok(JobStatus {
            name: job.name.clone(),
            schedule: job.schedule.clone(),
            enabled: job.enabled,
            scheduled,
            running: self.running.lock().contains(&job.name),
            next_run,
            prev_run,
            recent,
        })
    }

    /// One execution of `job` under its deadline
    async fn execute(&self, job: &JobConfig) -> Result<JobReport, SchedulerError> {
        let _guard = RunningGuard::acquire(&self.running, &job.name)
            .ok_or_else(|| SchedulerError::AlreadyRunning(job.name.clone()))?;

        let span = info_span!("job", job = %job.name);
        async move {
            let cancel = self.shutdown.child_token();
            let started = Instant::now();
            info!("Job started");

            let run = self.runner.run_job(job, cancel.clone());
            let (report, timed_out) = match job.deadline() {
                Some(limit) => {
                    let mut run = run;
                    tokio::select! {
                        report = &mut run => (report, false),
                        _ = tokio::time::sleep(limit) => {
                            warn!(timeout = ?limit, "Job deadline exceeded, cancelling");
                            cancel.cancel();
                            (run.await, true)
                        }
                    }
                }
                None => (run.await, false),
            };

            let elapsed = started.elapsed();
            let success = report.count(TransactionStatus::Success);
            let failed = report.count(TransactionStatus::Failed);
            let skipped = report.count(TransactionStatus::Skipped);

            if timed_out {
                let limit = job.deadline().unwrap_or_default();
                error!(duration_ms = elapsed.as_millis() as u64, success, failed, skipped, "Job timed out");
                return Err(SchedulerError::TimedOut {
                    job: job.name.clone(),
                    timeout: limit,
                    report: Box::new(report),
                });
            }

            match report.failure_summary() {
                None => {
                    info!(duration_ms = elapsed.as_millis() as u64, success, failed, skipped, "Job completed");
                    Ok(report)
                }
                Some(summary) => {
                    error!(duration_ms = elapsed.as_millis() as u64, success, failed, skipped, "Job failed: {}", summary);
                    Err(SchedulerError::JobFailed {
                        job: job.name.clone(),
                        summary,
                        report: Box::new(report),
                    })
                }
            }
        }
        .instrument(span)
        .await
    }

    fn sweep(&self) -> Result<usize, SchedulerError> {
        let (Some(ledger), Some(window)) = (&self.ledger, self.retention.window()) else {
            return Ok(0);
        };

        let cutoff = Utc::now() - window;
        let deleted = ledger.delete_older_than(cutoff)?;
        debug!(deleted, cutoff = %cutoff, "Retention sweep finished");
        Ok(deleted)
    }
}

/// Sleep until each fire time of `job` and spawn an execution
async fn trigger_loop(inner: Arc<Inner>, job: Arc<JobConfig>) {
    loop {
        let next = inner
            .entries
            .read()
            .get(&job.name)
            .and_then(|entry| entry.next_run);
        let Some(next) = next else {
            warn!(job = %job.name, "Schedule has no upcoming fire time");
            break;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {}
        }

        {
            let mut entries = inner.entries.write();
            if let Some(entry) = entries.get_mut(&job.name) {
                entry.prev_run = Some(next);
                entry.next_run = entry.schedule.next_after(Utc::now().max(next));
            }
        }

        let execution_inner = Arc::clone(&inner);
        let execution_job = Arc::clone(&job);
        inner.tracker.spawn(async move {
            match execution_inner.execute(&execution_job).await {
                Ok(_) => {}
                Err(SchedulerError::AlreadyRunning(name)) => {
                    warn!(job = %name, "Previous run still in progress, skipping this firing");
                }
                // Already logged inside the job span.
                Err(_) => {}
            }
        });
    }

    debug!(job = %job.name, "Trigger loop exiting");
}

/// Periodically delete expired ledger records
async fn sweep_loop(inner: Arc<Inner>) {
    let mut ticker = tokio::time::interval(inner.retention.sweep_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.sweep() {
                    warn!("Retention sweep failed: {}", e);
                }
            }
        }
    }
}

/// Marks a job as running for as long as it is held
struct RunningGuard<'a> {
    running: &'a Mutex<HashSet<String>>,
    name: String,
}

impl<'a> RunningGuard<'a> {
    fn acquire(running: &'a Mutex<HashSet<String>>, name: &str) -> Option<Self> {
        running.lock().insert(name.to_string()).then(|| Self {
            running,
            name: name.to_string(),
        })
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.lock().remove(&self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    /// Runner that sleeps for a fixed time unless cancelled
    struct ScriptedRunner {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl ScriptedRunner {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run_job(&self, job: &JobConfig, cancel: CancellationToken) -> JobReport {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let cancelled = tokio::select! {
                _ = tokio::time::sleep(self.delay) => false,
                _ = cancel.cancelled() => true,
            };
            JobReport {
                job: job.name.clone(),
                repos: Vec::new(),
                duration: self.delay,
                cancelled,
            }
        }
    }

    fn job(name: &str, schedule: &str, timeout: Duration) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            description: String::new(),
            schedule: schedule.to_string(),
            enabled: true,
            timeout,
            repos: Vec::new(),
        }
    }

    fn scheduler(jobs: Vec<JobConfig>, runner: Arc<ScriptedRunner>) -> Scheduler {
        Scheduler::new(jobs, runner, None, RetentionPolicy::disabled())
    }

    #[tokio::test]
    async fn test_run_now_unknown_job() {
        let sched = scheduler(vec![], ScriptedRunner::new(Duration::ZERO));
        assert_matches!(
            sched.run_now("missing").await,
            Err(SchedulerError::UnknownJob(name)) if name == "missing"
        );
    }

    #[tokio::test]
    async fn test_run_now_success() {
        let runner = ScriptedRunner::new(Duration::from_millis(10));
        let sched = scheduler(
            vec![job("main-sync", "@hourly", Duration::from_secs(5))],
            runner.clone(),
        );

        let report = sched.run_now("main-sync").await.unwrap();
        assert_eq!(report.job, "main-sync");
        assert_eq!(runner.calls(), 1);
        assert!(!sched.is_running("main-sync"));
    }

    #[tokio::test]
    async fn test_run_now_rejects_overlapping_run() {
        let runner = ScriptedRunner::new(Duration::from_millis(300));
        let sched = scheduler(
            vec![job("slow", "@hourly", Duration::ZERO)],
            runner.clone(),
        );

        let background = sched.clone();
        let first = tokio::spawn(async move { background.run_now("slow").await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(sched.is_running("slow"));
        assert_matches!(
            sched.run_now("slow").await,
            Err(SchedulerError::AlreadyRunning(_))
        );

        assert!(first.await.unwrap().is_ok());
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_deadline_cancels_run() {
        let runner = ScriptedRunner::new(Duration::from_secs(30));
        let sched = scheduler(
            vec![job("stuck", "@hourly", Duration::from_millis(100))],
            runner,
        );

        let started = Instant::now();
        let result = sched.run_now("stuck").await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_matches!(result, Err(SchedulerError::TimedOut { report, .. }) if report.cancelled);
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let runner = ScriptedRunner::new(Duration::ZERO);
        let mut disabled = job("off", "@daily", Duration::ZERO);
        disabled.enabled = false;
        let sched = scheduler(
            vec![job("nightly", "@daily", Duration::ZERO), disabled],
            runner,
        );

        assert_eq!(sched.start().unwrap(), 1);
        assert_eq!(sched.start().unwrap(), 0);

        let status = sched.job_status("nightly", 0).unwrap();
        assert!(status.scheduled);
        assert!(status.next_run.is_some());
        assert!(status.prev_run.is_none());

        let off = sched.job_status("off", 0).unwrap();
        assert!(!off.scheduled);
        assert!(off.next_run.is_none());

        sched.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_schedule_fails_start() {
        let sched = scheduler(
            vec![job("broken", "not a schedule", Duration::ZERO)],
            ScriptedRunner::new(Duration::ZERO),
        );
        assert_matches!(sched.start(), Err(SchedulerError::InvalidSchedule { .. }));
    }

    #[tokio::test]
    async fn test_every_second_schedule_fires() {
        let runner = ScriptedRunner::new(Duration::from_millis(10));
        let sched = scheduler(
            vec![job("fast", "* * * * * *", Duration::ZERO)],
            runner.clone(),
        );

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        sched.stop().await;

        let calls = runner.calls();
        assert!(calls >= 1, "expected at least one firing, got {calls}");
        assert!(sched.job_status("fast", 0).unwrap().prev_run.is_some());

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runner.calls(), calls);
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_runs() {
        let runner = ScriptedRunner::new(Duration::from_secs(60));
        let sched = scheduler(
            vec![job("long", "@every 1s", Duration::ZERO)],
            runner.clone(),
        );

        sched.start().unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(runner.calls(), 1);
        assert!(sched.is_running("long"));

        tokio::time::timeout(Duration::from_secs(5), sched.stop())
            .await
            .expect("stop should wait only for cancelled runs");
        assert!(!sched.is_running("long"));
    }

    #[tokio::test]
    async fn test_run_all_now() {
        let runner = ScriptedRunner::new(Duration::from_millis(10));
        let sched = scheduler(
            vec![
                job("a", "@hourly", Duration::ZERO),
                job("b", "@hourly", Duration::ZERO),
            ],
            runner.clone(),
        );

        let results = sched.run_all_now().await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(runner.calls(), 2);
    }

    #[tokio::test]
    async fn test_statuses_join_ledger_entries() {
        let ledger = Arc::new(Ledger::open_in_memory("sync_transactions").unwrap());
        for target in ["t1", "t2", "t3"] {
            let mut rec = TransactionRecord::begin("b-job", "repo", "main", "src", target, "abc");
            rec.finish(TransactionStatus::Success, None);
            ledger.append(&mut rec).unwrap();
        }

        let sched = Scheduler::new(
            vec![
                job("b-job", "@hourly", Duration::ZERO),
                job("a-job", "@hourly", Duration::ZERO),
            ],
            ScriptedRunner::new(Duration::ZERO),
            Some(ledger),
            RetentionPolicy::disabled(),
        );

        let statuses = sched.all_statuses(2).unwrap();
        let names: Vec<_> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a-job", "b-job"]);
        assert!(statuses[0].recent.is_empty());
        assert_eq!(statuses[1].recent.len(), 2);
        assert_eq!(statuses[1].recent[0].target, "t3");
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let ledger = Arc::new(Ledger::open_in_memory("sync_transactions").unwrap());
        let mut old = TransactionRecord::begin("job", "repo", "main", "src", "dst", "abc");
        old.status = TransactionStatus::Success;
        old.end_time = Some(Utc::now() - chrono::Duration::days(45));
        ledger.append(&mut old).unwrap();

        let mut fresh = TransactionRecord::begin("job", "repo", "main", "src", "dst", "abc");
        fresh.finish(TransactionStatus::Skipped, None);
        ledger.append(&mut fresh).unwrap();

        let disabled = Scheduler::new(
            vec![],
            ScriptedRunner::new(Duration::ZERO),
            Some(Arc::clone(&ledger)),
            RetentionPolicy::disabled(),
        );
        assert_eq!(disabled.sweep_retention().unwrap(), 0);

        let sched = Scheduler::new(
            vec![],
            ScriptedRunner::new(Duration::ZERO),
            Some(Arc::clone(&ledger)),
            RetentionPolicy {
                days: 30,
                sweep_interval: Duration::from_secs(3600),
            },
        );
        assert_eq!(sched.sweep_retention().unwrap(), 1);
        assert!(ledger.get(&old.id).unwrap().is_none());
        assert!(ledger.get(&fresh.id).unwrap().is_some());
    }
}
