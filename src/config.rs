use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use dirs::config_dir;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::pattern::{self, BranchFilter};

/// Main configuration structure for gitsync
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Service identity and startup behavior
    #[serde(default)]
    pub service: ServiceConfig,

    /// Transaction ledger settings
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Where cached clones live
    #[serde(default)]
    pub workspace: WorkspaceConfig,

    /// Sync job definitions
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ServiceConfig {
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_environment")]
    pub environment: String,

    /// Run every enabled job once before the recurring schedule starts
    #[serde(default = "default_true")]
    pub run_on_start: bool,
}

/// Ledger persistence configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StoreConfig {
    /// SQLite file holding the ledger
    #[serde(default = "default_store_path")]
    pub path: PathBuf,

    /// Table the transaction entries are stored in
    #[serde(default = "default_collection")]
    pub collection: String,

    /// Days to keep finished transactions (0 disables the retention sweep)
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,

    /// How often the retention sweep runs
    #[serde(default = "default_sweep_interval", deserialize_with = "deserialize_duration")]
    pub sweep_interval: Duration,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Pretty,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String, // "info"

    /// Log format
    #[serde(default)]
    pub format: LogFormat,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Root for per-job clone caches (defaults to `<tmp>/gitsync`)
    pub root: Option<PathBuf>,
}

/// One independently scheduled sync job
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct JobConfig {
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// Cron expression (seconds field supported), `@daily`-style shortcut or `@every <duration>`
    #[serde(default)]
    pub schedule: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Execution deadline; zero means no deadline
    #[serde(default = "default_job_timeout", deserialize_with = "deserialize_duration")]
    pub timeout: Duration,

    pub repos: Vec<RepoConfig>,
}

/// Push-safety policy for a repository
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// Push only when it is a fast-forward of the target
    #[default]
    Safe,
    /// Overwrite the target ref unconditionally
    Force,
}

impl PushMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PushMode::Safe => "safe",
            PushMode::Force => "force",
        }
    }
}

impl fmt::Display for PushMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One source-to-targets mirroring configuration
#[derive(Debug, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RepoConfig {
    /// Name used in the ledger; derived from the source when absent
    #[serde(default)]
    pub name: Option<String>,

    pub source: String,

    pub targets: Vec<String>,

    /// Branch patterns; empty means just `main`
    #[serde(default)]
    pub branches: Vec<String>,

    #[serde(default)]
    pub mode: PushMode,

    #[serde(default)]
    pub auth: AuthConfig,

    #[serde(default)]
    pub rewrite_history: bool,

    #[serde(default)]
    pub author_rewrites: Vec<AuthorRewrite>,
}

/// Credentials passed through to git, never interpreted here
#[derive(Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct AuthConfig {
    pub username: Option<String>,
    pub token: Option<String>,
    /// Environment variable holding the token
    pub token_env: Option<String>,
    pub ssh_key_path: Option<String>,
    /// Environment variable holding the SSH key path
    pub ssh_key_env: Option<String>,
}

impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_env", &self.token_env)
            .field("ssh_key_path", &self.ssh_key_path)
            .field("ssh_key_env", &self.ssh_key_env)
            .finish()
    }
}

/// Replace a commit identity during history rewriting
///
/// `from_email` takes precedence; `from_name` is only consulted when no email
/// is given.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct AuthorRewrite {
    #[serde(default)]
    pub from_email: Option<String>,
    #[serde(default)]
    pub from_name: Option<String>,
    pub to_name: String,
    pub to_email: String,
}

/// Parsed recurrence of a job
#[derive(Debug, Clone)]
pub enum JobSchedule {
    Cron(Box<cron::Schedule>),
    Every(Duration),
}

impl JobSchedule {
    /// Parse a schedule expression
    ///
    /// Five-field cron expressions get a `0` seconds field prepended.
    pub fn parse(expression: &str) -> Result<Self> {
        let expression = expression.trim();
        if expression.is_empty() {
            bail!("schedule cannot be empty");
        }

        if let Some(every) = expression.strip_prefix("@every") {
            let interval = parse_duration(every)
                .with_context(|| format!("Invalid @every interval: {}", expression))?;
            if interval.is_zero() {
                bail!("@every interval must be positive");
            }
            return Ok(JobSchedule::Every(interval));
        }

        let normalized = if expression.starts_with('@') {
            expression.to_string()
        } else {
            match expression.split_whitespace().count() {
                5 => format!("0 {}", expression),
                6 | 7 => expression.to_string(),
                n => bail!("Cron expression must have 5, 6 or 7 fields, found {}", n),
            }
        };

        let schedule = cron::Schedule::from_str(&normalized)
            .map_err(|e| anyhow!("Invalid cron expression '{}': {}", expression, e))?;
        Ok(JobSchedule::Cron(Box::new(schedule)))
    }

    /// First fire time strictly after `after`
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            JobSchedule::Cron(schedule) => schedule.after(&after).next(),
            JobSchedule::Every(interval) => {
                let step = chrono::Duration::from_std(*interval).ok()?;
                after.checked_add_signed(step)
            }
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}
fn default_service_name() -> String {
    "gitsync".to_string()
}
fn default_environment() -> String {
    "development".to_string()
}
fn default_store_path() -> PathBuf {
    PathBuf::from("./data/gitsync.db")
}
fn default_collection() -> String {
    "sync_transactions".to_string()
}
fn default_retention_days() -> u32 {
    30
}
fn default_sweep_interval() -> Duration {
    Duration::from_secs(24 * 3600)
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_job_timeout() -> Duration {
    Duration::from_secs(300)
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            environment: default_environment(),
            run_on_start: default_true(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            collection: default_collection(),
            retention_days: default_retention_days(),
            sweep_interval: default_sweep_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Parse duration strings like "30s", "5m", "1h", "2d" or raw seconds
pub fn parse_duration(duration_str: &str) -> Result<Duration> {
    let duration_str = duration_str.trim().to_lowercase();

    let secs = if let Some(value) = duration_str.strip_suffix('s') {
        value.trim().parse::<u64>().context("Invalid seconds value")?
    } else if let Some(value) = duration_str.strip_suffix('m') {
        value.trim().parse::<u64>().map(|v| v * 60).context("Invalid minutes value")?
    } else if let Some(value) = duration_str.strip_suffix('h') {
        value.trim().parse::<u64>().map(|v| v * 3600).context("Invalid hours value")?
    } else if let Some(value) = duration_str.strip_suffix('d') {
        value.trim().parse::<u64>().map(|v| v * 86400).context("Invalid days value")?
    } else {
        duration_str
            .parse::<u64>()
            .context("Invalid duration format. Use format like '30s', '5m', '1h', '2d'")?
    };

    Ok(Duration::from_secs(secs))
}

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Text(text) => parse_duration(&text).map_err(serde::de::Error::custom),
    }
}

impl JobConfig {
    /// Deadline for one execution, if any
    pub fn deadline(&self) -> Option<Duration> {
        (!self.timeout.is_zero()).then_some(self.timeout)
    }

    pub fn parsed_schedule(&self) -> Result<JobSchedule> {
        JobSchedule::parse(&self.schedule)
            .with_context(|| format!("Invalid schedule for job '{}'", self.name))
    }
}

impl RepoConfig {
    /// Ledger name of this repository
    pub fn display_name(&self) -> String {
        if let Some(name) = self.name.as_deref().filter(|n| !n.trim().is_empty()) {
            return name.to_string();
        }

        let trimmed = self.source.trim_end_matches('/');
        let last = trimmed
            .rsplit(|c: char| c == '/' || c == ':')
            .next()
            .unwrap_or(trimmed);
        last.trim_end_matches(".git").to_string()
    }

    pub fn branch_filter(&self) -> BranchFilter {
        BranchFilter::new(self.branches.iter().cloned())
    }

    /// History rewriting is requested and has rules to apply
    pub fn wants_rewrite(&self) -> bool {
        self.rewrite_history && !self.author_rewrites.is_empty()
    }
}

impl Config {
    /// Load configuration from the default location
    pub fn load_default() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::from_yaml_str(&content)
            .with_context(|| format!("Failed to load config file: {:?}", path))
    }

    /// Parse, resolve and validate configuration text
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let expanded =
            shellexpand::env(content).map_err(|e| anyhow!("Failed to expand variables: {}", e))?;

        let mut config: Config =
            serde_yaml::from_str(&expanded).context("Failed to parse configuration")?;

        config.expand_paths()?;
        config.resolve_credentials()?;
        config.validate()?;

        Ok(config)
    }

    /// Get the default configuration file path (XDG compliant)
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = config_dir().context("Failed to get user config directory")?;

        Ok(config_dir.join("gitsync").join("config.yml"))
    }

    /// Expand `~` in configured paths
    pub fn expand_paths(&mut self) -> Result<()> {
        self.store.path = expand_path(&self.store.path);
        if let Some(root) = &self.workspace.root {
            self.workspace.root = Some(expand_path(root));
        }
        for job in &mut self.jobs {
            for repo in &mut job.repos {
                if let Some(key) = &repo.auth.ssh_key_path {
                    repo.auth.ssh_key_path = Some(shellexpand::tilde(key).into_owned());
                }
            }
        }
        Ok(())
    }

    /// Fill tokens and SSH key paths named by `*_env` fields
    fn resolve_credentials(&mut self) -> Result<()> {
        for job in &mut self.jobs {
            for repo in &mut job.repos {
                if let Some(var) = &repo.auth.token_env {
                    let token = std::env::var(var).with_context(|| {
                        format!(
                            "job '{}': token environment variable {} is not set",
                            job.name, var
                        )
                    })?;
                    repo.auth.token = Some(token);
                }
                if let Some(var) = &repo.auth.ssh_key_env {
                    let key = std::env::var(var).with_context(|| {
                        format!(
                            "job '{}': SSH key environment variable {} is not set",
                            job.name, var
                        )
                    })?;
                    repo.auth.ssh_key_path = Some(shellexpand::tilde(&key).into_owned());
                }
            }
        }
        Ok(())
    }

    /// Check required fields and cross-field rules
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            bail!("service name cannot be empty");
        }
        if self.store.path.as_os_str().is_empty() {
            bail!("store path cannot be empty");
        }

        let identifier =
            Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").context("Failed to compile identifier pattern")?;
        if !identifier.is_match(&self.store.collection) {
            bail!(
                "store collection '{}' must be a plain identifier (letters, digits, underscore)",
                self.store.collection
            );
        }

        if self.jobs.is_empty() {
            bail!("at least one job must be configured");
        }

        let mut seen = HashSet::new();
        for (i, job) in self.jobs.iter().enumerate() {
            if job.name.trim().is_empty() {
                bail!("jobs[{}]: name cannot be empty", i);
            }
            if !seen.insert(job.name.as_str()) {
                bail!("jobs[{}]: duplicate job name '{}'", i, job.name);
            }
            if job.enabled || !job.schedule.trim().is_empty() {
                job.parsed_schedule()
                    .with_context(|| format!("jobs[{}]", i))?;
            }
            if job.repos.is_empty() {
                bail!("jobs[{}]: at least one repository must be configured", i);
            }

            for (j, repo) in job.repos.iter().enumerate() {
                if repo.source.trim().is_empty() {
                    bail!("jobs[{}].repos[{}]: source cannot be empty", i, j);
                }
                if repo.targets.is_empty() {
                    bail!("jobs[{}].repos[{}]: at least one target must be configured", i, j);
                }
                if repo.targets.iter().any(|t| t.trim().is_empty()) {
                    bail!("jobs[{}].repos[{}]: targets cannot be empty strings", i, j);
                }
                for (k, rule) in repo.author_rewrites.iter().enumerate() {
                    let has_email = rule.from_email.as_deref().is_some_and(|e| !e.is_empty());
                    let has_name = rule.from_name.as_deref().is_some_and(|n| !n.is_empty());
                    if !has_email && !has_name {
                        bail!(
                            "jobs[{}].repos[{}].author_rewrites[{}]: from_email or from_name is required",
                            i, j, k
                        );
                    }
                    if rule.to_name.trim().is_empty() || rule.to_email.trim().is_empty() {
                        bail!(
                            "jobs[{}].repos[{}].author_rewrites[{}]: to_name and to_email are required",
                            i, j, k
                        );
                    }
                }
                if repo.wants_rewrite() && repo.mode != PushMode::Force {
                    bail!(
                        "jobs[{}].repos[{}]: rewrite_history requires mode: force",
                        i, j
                    );
                }
            }
        }

        Ok(())
    }

    /// Non-fatal findings worth reporting at startup
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for job in &self.jobs {
            for repo in &job.repos {
                for pattern in &repo.branches {
                    if pattern::is_literal_fallback(pattern) {
                        warnings.push(format!(
                            "job '{}', repo '{}': branch pattern '{}' has several wildcards and is matched literally",
                            job.name,
                            repo.display_name(),
                            pattern
                        ));
                    }
                }
                if repo.rewrite_history && repo.author_rewrites.is_empty() {
                    warnings.push(format!(
                        "job '{}', repo '{}': rewrite_history is set but no author_rewrites are configured",
                        job.name,
                        repo.display_name()
                    ));
                }
            }
        }
        warnings
    }

    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|job| job.name == name)
    }

    pub fn enabled_jobs(&self) -> impl Iterator<Item = &JobConfig> {
        self.jobs.iter().filter(|job| job.enabled)
    }

    /// Root directory for per-job workspaces
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace
            .root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("gitsync"))
    }
}

fn expand_path(path: &Path) -> PathBuf {
    let text = path.to_string_lossy();
    PathBuf::from(shellexpand::tilde(&text).into_owned())
}

/// Commented example configuration printed by `gitsync example-config`
pub const EXAMPLE_CONFIG: &str = r#"# gitsync configuration
#
# Environment variables are substituted before parsing (dollar-brace syntax).
#
# Schedules accept cron with a seconds field ("0 */5 * * * *"), classic
# five-field cron ("*/5 * * * *"), shortcuts such as "@hourly" or "@daily",
# and fixed intervals ("@every 10m").

service:
  name: gitsync
  environment: development
  run_on_start: true

store:
  path: ./data/gitsync.db
  collection: sync_transactions
  retention_days: 30
  sweep_interval: 24h

logging:
  level: info
  format: compact   # compact | pretty | json

jobs:
  - name: main-sync
    description: Mirror the main project to its backups
    schedule: "0 */5 * * * *"
    enabled: true
    timeout: 5m
    repos:
      - name: my-project
        source: https://github.com/myorg/my-project.git
        targets:
          - https://gitlab.com/myorg/my-project.git
          - https://bitbucket.org/myorg/my-project.git
        branches: ["main", "release-*"]
        mode: safe
        auth:
          username: git-sync-bot
          token_env: GITHUB_TOKEN
"#;
