//! gitsync - Scheduled Git Repository Mirroring
//!
//! gitsync periodically mirrors source repositories to one or more target
//! repositories and records every push attempt in a transaction ledger.
//!
//! ## Core Features
//!
//! - **Branch Filtering**: `*`-wildcard patterns select the branches to mirror
//! - **Push Safety**: per-repository safe (fast-forward only) or force pushes
//! - **Idempotent Pushes**: targets already at the source commit are skipped
//! - **Author Rewriting**: optional history rewrite of commit identities
//! - **Transaction Ledger**: SQLite-backed history with retention
//! - **Scheduling**: cron and interval triggers with deadlines and run-now
//!
//! ## Modules
//!
//! - [`config`]: Configuration management and parsing
//! - [`pattern`]: Branch pattern matching
//! - [`git`]: Git command execution
//! - [`workspace`]: Per-job clone caches and credential staging
//! - [`ledger`]: Transaction ledger
//! - [`sync`]: Sync engine
//! - [`scheduler`]: Job scheduling
//! - [`logging`]: Log subscriber setup

pub mod config;
pub mod git;
pub mod ledger;
pub mod logging;
pub mod pattern;
pub mod scheduler;
pub mod sync;
pub mod workspace;

pub use config::{Config, JobConfig, PushMode, RepoConfig};
pub use git::{GitClient, GitError};
pub use ledger::{Ledger, LedgerError, LedgerStats, TransactionRecord, TransactionStatus};
pub use pattern::{matches, BranchFilter};
pub use scheduler::{JobRunner, JobStatus, RetentionPolicy, Scheduler, SchedulerError};
pub use sync::{JobReport, RepoOutcome, SyncEngine, SyncError};
pub use workspace::Workspace;
