use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

use gitsync::config::EXAMPLE_CONFIG;
use gitsync::{
    logging, Config, GitClient, JobReport, Ledger, Scheduler, SchedulerError, SyncEngine,
    TransactionStatus, Workspace,
};

#[derive(Parser)]
#[command(name = "gitsync")]
#[command(about = "Scheduled git repository mirroring service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path (defaults to XDG config location)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until interrupted (default)
    Start,

    /// Check the configuration and exit
    Validate,

    /// Run one job immediately and exit
    RunJob {
        /// Job name
        name: String,
    },

    /// Show aggregate ledger statistics
    Stats,

    /// Show recent transactions, of one job or across all jobs
    History {
        /// Job name
        job: Option<String>,

        /// Maximum number of transactions to show
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Show gitsync and git versions
    Version,

    /// Print an example configuration file
    ExampleConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Start);

    match command {
        Commands::ExampleConfig => {
            print!("{}", EXAMPLE_CONFIG);
            return Ok(());
        }
        Commands::Version => return cmd_version().await,
        _ => {}
    }

    let config = load_config(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose)?;
    for warning in config.warnings() {
        warn!("{}", warning);
    }

    match command {
        Commands::Start => cmd_start(config).await,
        Commands::Validate => cmd_validate(&config),
        Commands::RunJob { name } => cmd_run_job(&config, &name).await,
        Commands::Stats => cmd_stats(&config),
        Commands::History { job, limit } => cmd_history(&config, job.as_deref(), limit),
        Commands::Version | Commands::ExampleConfig => Ok(()),
    }
}

/// Load configuration from specified path or default location
fn load_config(config_path: Option<&Path>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    }
}

fn open_ledger(config: &Config) -> Result<Arc<Ledger>> {
    let ledger = Ledger::open(&config.store.path, &config.store.collection).with_context(|| {
        format!(
            "Failed to open ledger at {}",
            config.store.path.display()
        )
    })?;
    Ok(Arc::new(ledger))
}

async fn check_git() -> Result<String> {
    GitClient::new()
        .version()
        .await
        .context("git is required but could not be executed")
}

fn build_scheduler(config: &Config) -> Result<Scheduler> {
    let ledger = open_ledger(config)?;
    let workspace = Workspace::new(config.workspace_root());
    let engine = SyncEngine::new(GitClient::new(), ledger, workspace);
    Ok(Scheduler::from_config(config, engine))
}

async fn cmd_start(config: Config) -> Result<()> {
    let git_version = check_git().await?;
    print_banner(&config, &git_version);

    let scheduler = build_scheduler(&config)?;

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    if config.service.run_on_start {
        info!("Running initial sync for all enabled jobs");
        let initial = scheduler.run_all_now();
        tokio::pin!(initial);

        let results = tokio::select! {
            results = &mut initial => Some(results),
            _ = &mut shutdown => None,
        };

        match results {
            Some(results) => {
                let failed = results.iter().filter(|(_, r)| r.is_err()).count();
                info!(
                    successful = results.len() - failed,
                    failed,
                    "Initial sync completed"
                );
            }
            None => {
                info!("Shutdown requested during initial sync");
                scheduler.stop().await;
                initial.await;
                return Ok(());
            }
        }
    }

    let scheduled = scheduler.start()?;
    info!(jobs = scheduled, "Scheduler started");
    println!("🚀 gitsync running with {} scheduled job(s) (Ctrl+C to stop)", scheduled);

    (&mut shutdown).await;
    info!("Shutdown signal received, stopping scheduler...");
    scheduler.stop().await;
    println!("👋 gitsync stopped");

    Ok(())
}

fn cmd_validate(config: &Config) -> Result<()> {
    println!("✅ Configuration is valid");
    println!(
        "   Jobs: {} configured, {} enabled",
        config.jobs.len(),
        config.enabled_jobs().count()
    );
    for job in &config.jobs {
        println!(
            "   - {} [{}] {} repo(s){}",
            job.name,
            job.schedule,
            job.repos.len(),
            if job.enabled { "" } else { " (disabled)" }
        );
    }
    for warning in config.warnings() {
        println!("⚠️  {}", warning);
    }
    Ok(())
}

async fn cmd_run_job(config: &Config, name: &str) -> Result<()> {
    check_git().await?;
    let scheduler = build_scheduler(config)?;

    println!("🔄 Running job '{}'...", name);
    match scheduler.run_now(name).await {
        Ok(report) => {
            print_report(&report);
            println!("✅ Job '{}' completed", name);
            Ok(())
        }
        Err(e) => {
            match &e {
                SchedulerError::JobFailed { report, .. } | SchedulerError::TimedOut { report, .. } => {
                    print_report(report)
                }
                _ => {}
            }
            error!("{}", e);
            Err(e.into())
        }
    }
}

fn cmd_stats(config: &Config) -> Result<()> {
    let ledger = open_ledger(config)?;
    let stats = ledger
        .aggregate_stats()
        .context("Failed to compute ledger statistics")?;

    println!("📊 Sync Statistics");
    println!("   Total transactions: {}", stats.total);
    println!("   Successful:         {}", stats.succeeded);
    println!("   Failed:             {}", stats.failed);
    println!("   Skipped:            {}", stats.skipped);
    if stats.in_flight > 0 {
        println!("   In flight:          {}", stats.in_flight);
    }
    match stats.average_success_duration {
        Some(avg) => println!("   Avg success time:   {:.2}s", avg.as_secs_f64()),
        None => println!("   Avg success time:   n/a"),
    }
    Ok(())
}

fn cmd_history(config: &Config, job: Option<&str>, limit: usize) -> Result<()> {
    let ledger = open_ledger(config)?;

    let records = match job {
        Some(job) => {
            if config.job(job).is_none() {
                warn!("Job '{}' is not in the current configuration", job);
            }
            ledger
                .list_by_job(job, limit)
                .with_context(|| format!("Failed to read history of job '{}'", job))?
        }
        None => ledger
            .list_recent(limit)
            .context("Failed to read recent transactions")?,
    };

    let scope = job.map_or_else(|| "all jobs".to_string(), |job| format!("'{}'", job));
    if records.is_empty() {
        println!("No transactions recorded for {}", scope);
        return Ok(());
    }

    println!("📜 Recent transactions for {}", scope);
    for record in records {
        let commit: String = record.commit_hash.chars().take(10).collect();
        println!(
            "   {} {} {:<8} {}/{} {} -> {} {}",
            status_icon(record.status),
            record.start_time.format("%Y-%m-%d %H:%M:%S"),
            record.status,
            record.job_name,
            record.repo_name,
            record.branch,
            record.target,
            commit
        );
        if let Some(err) = &record.error {
            println!("        {}", err);
        }
    }
    Ok(())
}

async fn cmd_version() -> Result<()> {
    println!("gitsync {}", env!("CARGO_PKG_VERSION"));
    match check_git().await {
        Ok(version) => println!("{}", version),
        Err(e) => println!("⚠️  {:#}", e),
    }
    Ok(())
}

fn print_banner(config: &Config, git_version: &str) {
    println!("🔁 {} v{}", config.service.name, env!("CARGO_PKG_VERSION"));
    println!("   Environment: {}", config.service.environment);
    println!("   {}", git_version);
    println!(
        "   Jobs: {} configured, {} enabled",
        config.jobs.len(),
        config.enabled_jobs().count()
    );
    println!("   Ledger: {}", config.store.path.display());
}

fn print_report(report: &JobReport) {
    for repo in &report.repos {
        println!("   📦 {} ({} branch(es))", repo.repo, repo.branches.len());
        for tx in &repo.transactions {
            println!(
                "      {} {} -> {}: {}",
                status_icon(tx.status),
                tx.branch,
                tx.target,
                tx.status
            );
            if let Some(err) = &tx.error {
                println!("         {}", err);
            }
        }
        for err in &repo.errors {
            println!("      ❌ {}", err);
        }
    }
    println!(
        "   {} succeeded, {} failed, {} skipped in {:.2}s",
        report.count(TransactionStatus::Success),
        report.count(TransactionStatus::Failed),
        report.count(TransactionStatus::Skipped),
        report.duration.as_secs_f64()
    );
}

fn status_icon(status: TransactionStatus) -> &'static str {
    match status {
        TransactionStatus::Success => "✅",
        TransactionStatus::Failed => "❌",
        TransactionStatus::Skipped => "⏭️ ",
        TransactionStatus::Pending | TransactionStatus::Running => "⏳",
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Failed to listen for Ctrl+C: {}", e);
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
        }
    }
}
