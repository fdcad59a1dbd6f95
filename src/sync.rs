//! Sync Engine - mirrors one job's repositories to their targets
//!
//! For each repository of a job the engine acquires a cached clone of the
//! source, selects the branches in scope, optionally rewrites commit
//! identities, and pushes every selected branch to every target. Each push
//! attempt is written to the ledger as exactly one transaction that moves
//! from `running` to `success`, `failed` or `skipped`.
//!
//! A failing repository never stops the job; the engine moves on to the next
//! one. Cancellation is observed between branches and targets, and by any
//! git command other than a push that is in flight when it fires.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{JobConfig, PushMode, RepoConfig};
use crate::git::{GitClient, GitEnv, GitError, GitRepo};
use crate::ledger::{Ledger, TransactionRecord, TransactionStatus};
use crate::workspace::{url_token, Workspace};

/// Reasons a repository (or one of its branches) could not be synced
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("failed to prepare workspace: {0:#}")]
    Workspace(anyhow::Error),

    #[error("failed to stage credentials: {0:#}")]
    Credentials(anyhow::Error),

    #[error("failed to acquire {url}: {error}")]
    Acquire {
        url: String,
        #[source]
        error: GitError,
    },

    #[error("failed to list source branches: {0}")]
    Discovery(#[source] GitError),

    #[error("history rewrite requires force push mode")]
    RewriteRequiresForce,

    #[error("history rewrite failed: {0}")]
    Rewrite(#[source] GitError),

    #[error("failed to check out branch {branch}: {error}")]
    Checkout {
        branch: String,
        #[source]
        error: GitError,
    },

    #[error("sync cancelled")]
    Cancelled,
}

/// What happened to one repository during a job run
#[derive(Debug)]
pub struct RepoOutcome {
    pub repo: String,
    /// Branches selected by the repository's patterns
    pub branches: Vec<String>,
    /// One record per push attempt, in execution order
    pub transactions: Vec<TransactionRecord>,
    pub errors: Vec<SyncError>,
}

impl RepoOutcome {
    fn new(repo: String) -> Self {
        Self {
            repo,
            branches: Vec::new(),
            transactions: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
            && self
                .transactions
                .iter()
                .all(|t| t.status != TransactionStatus::Failed)
    }
}

/// Results of one execution of a job
#[derive(Debug)]
pub struct JobReport {
    pub job: String,
    pub repos: Vec<RepoOutcome>,
    pub duration: Duration,
    /// The run stopped early because its token was cancelled
    pub cancelled: bool,
}

impl JobReport {
    pub fn transactions(&self) -> impl Iterator<Item = &TransactionRecord> {
        self.repos.iter().flat_map(|r| r.transactions.iter())
    }

    pub fn count(&self, status: TransactionStatus) -> usize {
        self.transactions().filter(|t| t.status == status).count()
    }

    pub fn is_success(&self) -> bool {
        !self.cancelled && self.repos.iter().all(RepoOutcome::is_success)
    }

    /// Human-readable list of everything that went wrong
    pub fn failure_summary(&self) -> Option<String> {
        let mut problems = Vec::new();
        for repo in &self.repos {
            for err in &repo.errors {
                problems.push(format!("{}: {}", repo.repo, err));
            }
            for tx in repo
                .transactions
                .iter()
                .filter(|t| t.status == TransactionStatus::Failed)
            {
                problems.push(format!(
                    "{}: {} -> {}: {}",
                    repo.repo,
                    tx.branch,
                    tx.target,
                    tx.error.as_deref().unwrap_or("push failed")
                ));
            }
        }
        if self.cancelled && problems.is_empty() {
            problems.push("run cancelled".to_string());
        }

        (!problems.is_empty()).then(|| problems.join("; "))
    }
}

/// The engine that performs sync runs
#[derive(Clone)]
pub struct SyncEngine {
    git: GitClient,
    ledger: Arc<Ledger>,
    workspace: Workspace,
}

impl SyncEngine {
    pub fn new(git: GitClient, ledger: Arc<Ledger>, workspace: Workspace) -> Self {
        Self {
            git,
            ledger,
            workspace,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Sync every repository of `job`, continuing past per-repository failures
    pub async fn sync_job(&self, job: &JobConfig, cancel: CancellationToken) -> JobReport {
        let start_time = Instant::now();
        let mut report = JobReport {
            job: job.name.clone(),
            repos: Vec::with_capacity(job.repos.len()),
            duration: Duration::ZERO,
            cancelled: false,
        };

        info!(job = %job.name, repos = job.repos.len(), "Starting sync");

        for repo in &job.repos {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            let outcome = self.sync_repo(job, repo, &cancel).await;
            let cancelled = outcome
                .errors
                .iter()
                .any(|e| matches!(e, SyncError::Cancelled));
            report.repos.push(outcome);
            if cancelled {
                report.cancelled = true;
                break;
            }
        }

        report.duration = start_time.elapsed();

        info!(
            job = %job.name,
            duration_ms = report.duration.as_millis() as u64,
            success = report.count(TransactionStatus::Success),
            failed = report.count(TransactionStatus::Failed),
            skipped = report.count(TransactionStatus::Skipped),
            cancelled = report.cancelled,
            "Sync finished"
        );

        report
    }

    async fn sync_repo(
        &self,
        job: &JobConfig,
        repo: &RepoConfig,
        cancel: &CancellationToken,
    ) -> RepoOutcome {
        let repo_name = repo.display_name();
        let mut outcome = RepoOutcome::new(repo_name.clone());

        let env = match self
            .workspace
            .stage_credentials(&job.name, &repo.source, &repo.auth)
        {
            Ok(env) => env,
            Err(e) => {
                error!(job = %job.name, repo = %repo_name, "Failed to stage credentials: {:#}", e);
                outcome.errors.push(SyncError::Credentials(e));
                return outcome;
            }
        };

        let dir = self.workspace.repo_dir(&job.name, &repo.source);
        let git = match self.acquire(&dir, &repo.source, env, cancel).await {
            Ok(git) => git,
            Err(e) => {
                error!(job = %job.name, repo = %repo_name, "Acquisition failed: {}", e);
                outcome.errors.push(e);
                return outcome;
            }
        };

        let remote_branches = match git.remote_branches().await {
            Ok(branches) => branches,
            Err(e) => {
                error!(job = %job.name, repo = %repo_name, "Branch discovery failed: {}", e);
                outcome.errors.push(cancelled_or(e, SyncError::Discovery));
                return outcome;
            }
        };

        let filter = repo.branch_filter();
        outcome.branches = filter.select(remote_branches.iter().map(String::as_str));
        debug!(
            job = %job.name,
            repo = %repo_name,
            discovered = remote_branches.len(),
            selected = outcome.branches.len(),
            "Filtered branches with patterns {:?}",
            filter.patterns()
        );

        if outcome.branches.is_empty() {
            info!(job = %job.name, repo = %repo_name, "No branches match the configured patterns");
            return outcome;
        }

        if repo.wants_rewrite() {
            if repo.mode != PushMode::Force {
                error!(job = %job.name, repo = %repo_name, "Refusing to rewrite history in safe mode");
                outcome.errors.push(SyncError::RewriteRequiresForce);
                return outcome;
            }

            info!(
                job = %job.name,
                repo = %repo_name,
                rules = repo.author_rewrites.len(),
                "Rewriting commit authors"
            );
            if let Err(e) = git.rewrite_authors(&repo.author_rewrites).await {
                error!(job = %job.name, repo = %repo_name, "History rewrite failed: {}", e);
                outcome.errors.push(cancelled_or(e, SyncError::Rewrite));
                return outcome;
            }
        }

        let branches = outcome.branches.clone();
        for branch in &branches {
            if cancel.is_cancelled() {
                outcome.errors.push(SyncError::Cancelled);
                return outcome;
            }

            if let Err(e) = git.checkout_branch(branch).await {
                warn!(job = %job.name, repo = %repo_name, branch = %branch, "Checkout failed: {}", e);
                let cancelled = e.is_cancelled();
                outcome.errors.push(cancelled_or(e, |error| SyncError::Checkout {
                    branch: branch.clone(),
                    error,
                }));
                if cancelled {
                    return outcome;
                }
                continue;
            }

            let commit = match git.rev_parse("HEAD").await {
                Ok(commit) => commit,
                Err(e) => {
                    warn!(job = %job.name, repo = %repo_name, branch = %branch, "Failed to resolve HEAD: {}", e);
                    let cancelled = e.is_cancelled();
                    outcome.errors.push(cancelled_or(e, |error| SyncError::Checkout {
                        branch: branch.clone(),
                        error,
                    }));
                    if cancelled {
                        return outcome;
                    }
                    continue;
                }
            };

            for target in &repo.targets {
                if cancel.is_cancelled() {
                    outcome.errors.push(SyncError::Cancelled);
                    return outcome;
                }

                let record = self
                    .push_to_target(job, repo, &repo_name, branch, &commit, target, &git)
                    .await;
                let interrupted = record.status == TransactionStatus::Failed && cancel.is_cancelled();
                outcome.transactions.push(record);
                if interrupted {
                    outcome.errors.push(SyncError::Cancelled);
                    return outcome;
                }
            }
        }

        outcome
    }

    /// Clone the source, or refresh an existing clone
    async fn acquire(
        &self,
        dir: &Path,
        source: &str,
        env: GitEnv,
        cancel: &CancellationToken,
    ) -> Result<GitRepo, SyncError> {
        let acquire_err = |error: GitError| {
            cancelled_or(error, |error| SyncError::Acquire {
                url: source.to_string(),
                error,
            })
        };

        if dir.join(".git").exists() {
            let git = self.git.open(dir, env.clone(), cancel.clone());
            match git.fetch_prune().await {
                Ok(()) => return Ok(git),
                Err(e) if e.is_cancelled() => return Err(SyncError::Cancelled),
                Err(e) => {
                    warn!(
                        "Refreshing cached clone {} failed, cloning again: {}",
                        dir.display(),
                        e
                    );
                }
            }
        }

        if dir.exists() {
            std::fs::remove_dir_all(dir).map_err(|e| {
                SyncError::Workspace(anyhow::Error::new(e).context(format!(
                    "Failed to clear stale workspace {}",
                    dir.display()
                )))
            })?;
        }
        if let Some(parent) = dir.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                SyncError::Workspace(
                    anyhow::Error::new(e)
                        .context(format!("Failed to create {}", parent.display())),
                )
            })?;
        }

        self.git
            .clone_repo(source, dir, &env, cancel)
            .await
            .map_err(acquire_err)?;

        Ok(self.git.open(dir, env, cancel.clone()))
    }

    /// Push one branch to one target, recording the attempt
    async fn push_to_target(
        &self,
        job: &JobConfig,
        repo: &RepoConfig,
        repo_name: &str,
        branch: &str,
        commit: &str,
        target: &str,
        git: &GitRepo,
    ) -> TransactionRecord {
        let mut record =
            TransactionRecord::begin(&job.name, repo_name, branch, &repo.source, target, commit);
        self.record_start(&mut record);

        let remote = format!("target-{}", url_token(target));
        let result = async {
            git.ensure_remote(&remote, target).await?;
            let head = git.remote_branch_head(&remote, branch).await?;
            if head.as_deref() == Some(commit) {
                return Ok(TransactionStatus::Skipped);
            }
            git.push(&remote, branch, repo.mode).await?;
            Ok::<_, GitError>(TransactionStatus::Success)
        }
        .await;

        match result {
            Ok(TransactionStatus::Skipped) => {
                info!(
                    job = %job.name, repo = %repo_name, branch = %branch, target_url = %target,
                    commit = %commit,
                    "Target already up to date"
                );
                record.finish(TransactionStatus::Skipped, None);
            }
            Ok(status) => {
                info!(
                    job = %job.name, repo = %repo_name, branch = %branch, target_url = %target,
                    commit = %commit, mode = %repo.mode,
                    "Pushed branch"
                );
                record.finish(status, None);
            }
            Err(e) => {
                warn!(
                    job = %job.name, repo = %repo_name, branch = %branch, target_url = %target,
                    "Push failed: {}", e
                );
                record.finish(TransactionStatus::Failed, Some(e.to_string()));
            }
        }

        self.record_finish(&record);
        record
    }

    fn record_start(&self, record: &mut TransactionRecord) {
        if let Err(e) = self.ledger.append(record) {
            warn!(
                job = %record.job_name,
                branch = %record.branch,
                target_url = %record.target,
                "Failed to record transaction start: {}",
                e
            );
        }
    }

    fn record_finish(&self, record: &TransactionRecord) {
        if record.id.is_empty() {
            return;
        }
        if let Err(e) = self.ledger.update(record) {
            warn!(
                job = %record.job_name,
                transaction = %record.id,
                "Failed to record transaction outcome: {}",
                e
            );
        }
    }
}

/// Map a git error to `SyncError::Cancelled` when it was a cancellation
fn cancelled_or(error: GitError, wrap: impl FnOnce(GitError) -> SyncError) -> SyncError {
    if error.is_cancelled() {
        SyncError::Cancelled
    } else {
        wrap(error)
    }
}
