//! Scheduler tests driving a real sync engine

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{allow_stalled_target, job, repo, rev, GitFixture, STALLED_TARGET};
use tokio_util::sync::CancellationToken;
use gitsync::{
    GitClient, Ledger, PushMode, RetentionPolicy, Scheduler, SchedulerError, SyncEngine,
    TransactionStatus, Workspace,
};

fn scheduler(fixture: &GitFixture, jobs: Vec<gitsync::JobConfig>) -> Scheduler {
    let ledger = Arc::new(Ledger::open(&fixture.ledger_path(), "sync_transactions").unwrap());
    let engine = SyncEngine::new(
        GitClient::new(),
        Arc::clone(&ledger),
        Workspace::new(fixture.workspace_root()),
    );
    Scheduler::new(jobs, Arc::new(engine), Some(ledger), RetentionPolicy::disabled())
}

#[tokio::test]
async fn test_run_now_twice_skips_unchanged_target() {
    let fixture = GitFixture::new();
    let target = fixture.create_target("backup");
    let scheduler = scheduler(
        &fixture,
        vec![job(
            "mirror",
            vec![repo(&fixture.source_url(), &[&target], &["main"], PushMode::Safe)],
        )],
    );

    let first = scheduler.run_now("mirror").await.unwrap();
    let second = scheduler.run_now("mirror").await.unwrap();

    assert_eq!(first.count(TransactionStatus::Success), 1);
    assert_eq!(second.count(TransactionStatus::Skipped), 1);
    assert_eq!(
        first.transactions().next().unwrap().commit_hash,
        second.transactions().next().unwrap().commit_hash
    );
    assert_eq!(rev(&target, "main"), rev(&fixture.source_url(), "main"));

    let status = scheduler.job_status("mirror", 5).unwrap();
    assert!(!status.running);
    assert!(!status.scheduled);
    assert_eq!(status.recent.len(), 2);
    assert_eq!(status.recent[0].status, TransactionStatus::Skipped);
}

#[tokio::test]
async fn test_run_now_reports_failed_push() {
    let fixture = GitFixture::new();
    let target = fixture.create_target("backup");
    let scheduler = scheduler(
        &fixture,
        vec![job(
            "safe",
            vec![repo(&fixture.source_url(), &[&target], &["main"], PushMode::Safe)],
        )],
    );

    scheduler.run_now("safe").await.unwrap();
    fixture.amend("main", "diverged\n");

    let err = scheduler.run_now("safe").await.unwrap_err();
    match err {
        SchedulerError::JobFailed { job, report, .. } => {
            assert_eq!(job, "safe");
            assert_eq!(report.count(TransactionStatus::Failed), 1);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_scheduled_interval_job_fires() {
    let fixture = GitFixture::new();
    let target = fixture.create_target("backup");
    let mut interval_job = job(
        "interval",
        vec![repo(&fixture.source_url(), &[&target], &["main"], PushMode::Safe)],
    );
    interval_job.schedule = "@every 1s".to_string();
    let scheduler = scheduler(&fixture, vec![interval_job]);

    assert_eq!(scheduler.start().unwrap(), 1);

    let mut pushed = false;
    for _ in 0..100 {
        if rev(&target, "main").is_some() && !scheduler.is_running("interval") {
            pushed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    scheduler.stop().await;

    assert!(pushed, "scheduled run never reached the target");
    let status = scheduler.job_status("interval", 10).unwrap();
    assert!(status.scheduled);
    assert!(status.prev_run.is_some());
    assert!(!status.recent.is_empty());
}

#[tokio::test]
async fn test_deadline_fails_open_transaction() {
    let fixture = GitFixture::new();
    let target = fixture.create_target("backup");
    let ledger = Arc::new(Ledger::open(&fixture.ledger_path(), "sync_transactions").unwrap());
    let engine = SyncEngine::new(
        GitClient::new(),
        Arc::clone(&ledger),
        Workspace::new(fixture.workspace_root()),
    );

    let warm = job(
        "deadline",
        vec![repo(&fixture.source_url(), &[&target], &["main"], PushMode::Safe)],
    );
    engine.sync_job(&warm, CancellationToken::new()).await;
    allow_stalled_target(&engine.workspace().repo_dir("deadline", &fixture.source_url()));

    let mut stalled = job(
        "deadline",
        vec![repo(
            &fixture.source_url(),
            &[&target, STALLED_TARGET],
            &["main"],
            PushMode::Safe,
        )],
    );
    stalled.timeout = Duration::from_secs(3);
    let scheduler = Scheduler::new(
        vec![stalled],
        Arc::new(engine),
        Some(Arc::clone(&ledger)),
        RetentionPolicy::disabled(),
    );

    let err = scheduler.run_now("deadline").await.unwrap_err();
    match err {
        SchedulerError::TimedOut { job, report, .. } => {
            assert_eq!(job, "deadline");
            assert!(report.cancelled);
        }
        other => panic!("unexpected error: {}", other),
    }

    let records = ledger.list_by_job("deadline", 10).unwrap();
    assert!(records
        .iter()
        .all(|r| r.status.is_terminal() && r.end_time.is_some()));
    assert!(!scheduler.is_running("deadline"));
}
