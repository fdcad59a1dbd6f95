use std::path::{Path, PathBuf};
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command as AsyncCommand;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{AuthorRewrite, PushMode};

/// Errors raised while driving the git executable
#[derive(Debug, Error)]
pub enum GitError {
    #[error("failed to execute `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` failed: {output}")]
    Failed { command: String, output: String },

    #[error("`{command}` was cancelled")]
    Cancelled { command: String },
}

impl GitError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, GitError::Cancelled { .. })
    }
}

/// Environment overrides applied to individual git invocations
///
/// The process environment is never modified, so concurrent jobs with
/// different credentials do not interfere.
#[derive(Debug, Clone, Default)]
pub struct GitEnv {
    vars: Vec<(String, String)>,
}

impl GitEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.vars.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.vars.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Thin async wrapper around the `git` executable
#[derive(Debug, Clone)]
pub struct GitClient {
    program: PathBuf,
}

impl Default for GitClient {
    fn default() -> Self {
        Self::new()
    }
}

impl GitClient {
    /// Use `git` from `PATH`
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("git"),
        }
    }

    /// Use a specific git executable
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Report the installed git version, failing if git is unavailable
    pub async fn version(&self) -> Result<String, GitError> {
        let output = self
            .run(None, &["--version"], &GitEnv::default(), None)
            .await?;
        Ok(output.trim().to_string())
    }

    /// Clone `url` into `dest`
    pub async fn clone_repo(
        &self,
        url: &str,
        dest: &Path,
        env: &GitEnv,
        cancel: &CancellationToken,
    ) -> Result<(), GitError> {
        info!("Cloning repository: {} -> {}", url, dest.display());

        let dest_str = dest.to_string_lossy();
        self.run(None, &["clone", url, &dest_str], env, Some(cancel))
            .await?;
        Ok(())
    }

    /// Handle to an existing local clone
    pub fn open(&self, path: &Path, env: GitEnv, cancel: CancellationToken) -> GitRepo {
        GitRepo {
            git: self.clone(),
            path: path.to_path_buf(),
            env,
            cancel,
        }
    }

    /// Run git, returning stdout and stderr combined
    ///
    /// With a cancellation token the child's whole process group is killed
    /// as soon as the token fires.
    pub async fn run(
        &self,
        dir: Option<&Path>,
        args: &[&str],
        env: &GitEnv,
        cancel: Option<&CancellationToken>,
    ) -> Result<String, GitError> {
        let command = format!("git {}", args.join(" "));
        debug!("Running {}", command);

        let mut cmd = AsyncCommand::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }
        for (key, value) in env.iter() {
            cmd.env(key, value);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn().map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;
        let pid = child.id();

        let result = match cancel {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        kill_process_group(pid);
                        return Err(GitError::Cancelled { command });
                    }
                    output = child.wait_with_output() => output,
                }
            }
            None => child.wait_with_output().await,
        };

        let output = result.map_err(|source| GitError::Spawn {
            command: command.clone(),
            source,
        })?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if !output.status.success() {
            return Err(GitError::Failed {
                command,
                output: combined.trim().to_string(),
            });
        }

        Ok(combined)
    }
}

#[cfg(unix)]
fn kill_process_group(pid: Option<u32>) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid {
        if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            debug!("Failed to kill git process group {}: {}", pid, e);
        }
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: Option<u32>) {}

/// A local clone plus the credentials and cancellation scope used to drive it
#[derive(Debug, Clone)]
pub struct GitRepo {
    git: GitClient,
    path: PathBuf,
    env: GitEnv,
    cancel: CancellationToken,
}

impl GitRepo {
    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn git(&self, args: &[&str]) -> Result<String, GitError> {
        self.git
            .run(Some(&self.path), args, &self.env, Some(&self.cancel))
            .await
    }

    /// Fetch from origin, pruning deleted branches
    pub async fn fetch_prune(&self) -> Result<(), GitError> {
        self.git(&["fetch", "origin", "--prune"]).await?;
        Ok(())
    }

    /// Branch names known on origin, without the `origin/` prefix
    pub async fn remote_branches(&self) -> Result<Vec<String>, GitError> {
        let output = self
            .git(&[
                "for-each-ref",
                "--format=%(refname)",
                "refs/remotes/origin/",
            ])
            .await?;

        Ok(output
            .lines()
            .filter_map(|line| line.trim().strip_prefix("refs/remotes/origin/"))
            .filter(|name| !name.is_empty() && *name != "HEAD")
            .map(str::to_string)
            .collect())
    }

    /// Check out `branch` as a local branch reset to `origin/<branch>`
    pub async fn checkout_branch(&self, branch: &str) -> Result<(), GitError> {
        let start = format!("refs/remotes/origin/{}", branch);
        self.git(&["checkout", "-f", "-B", branch, &start]).await?;
        self.git(&["reset", "--hard", &start]).await?;
        Ok(())
    }

    /// Resolve a revision to a commit hash
    pub async fn rev_parse(&self, rev: &str) -> Result<String, GitError> {
        let spec = format!("{}^{{commit}}", rev);
        let output = self.git(&["rev-parse", "--verify", "--quiet", &spec]).await?;
        Ok(output.trim().to_string())
    }

    /// Make sure remote `name` exists and points at `url`
    pub async fn ensure_remote(&self, name: &str, url: &str) -> Result<(), GitError> {
        match self.git(&["remote", "get-url", name]).await {
            Ok(current) if current.trim() == url => Ok(()),
            Ok(_) => {
                debug!("Updating remote {} -> {}", name, url);
                self.git(&["remote", "set-url", name, url]).await?;
                Ok(())
            }
            Err(GitError::Failed { .. }) => {
                debug!("Adding remote {} -> {}", name, url);
                self.git(&["remote", "add", name, url]).await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current tip of `branch` on `remote`, or `None` if it does not exist there
    pub async fn remote_branch_head(
        &self,
        remote: &str,
        branch: &str,
    ) -> Result<Option<String>, GitError> {
        let tracking = format!("refs/remotes/{}/{}", remote, branch);
        let refspec = format!("+refs/heads/{}:{}", branch, tracking);

        match self.git(&["fetch", "--no-tags", remote, &refspec]).await {
            Ok(_) => {}
            Err(GitError::Failed { output, .. }) => {
                debug!("Branch {} not available on {}: {}", branch, remote, output);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        match self.rev_parse(&tracking).await {
            Ok(hash) if !hash.is_empty() => Ok(Some(hash)),
            Ok(_) | Err(GitError::Failed { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Push the local `branch` to the same name on `remote`
    ///
    /// Pushes are not cancellable: once started they run to completion so
    /// the outcome can be recorded.
    pub async fn push(&self, remote: &str, branch: &str, mode: PushMode) -> Result<(), GitError> {
        let refspec = format!("refs/heads/{}:refs/heads/{}", branch, branch);
        let mut args = vec!["push"];
        if mode == PushMode::Force {
            args.push("--force");
        }
        args.push(remote);
        args.push(refspec.as_str());

        self.git.run(Some(&self.path), &args, &self.env, None).await?;
        Ok(())
    }

    /// Rewrite commit identities across all refs
    pub async fn rewrite_authors(&self, rules: &[AuthorRewrite]) -> Result<(), GitError> {
        let script = env_filter_script(rules);
        self.git
            .run(
                Some(&self.path),
                &["filter-branch", "-f", "--env-filter", &script, "--", "--all"],
                &self.with_env("FILTER_BRANCH_SQUELCH_WARNING", "1"),
                Some(&self.cancel),
            )
            .await?;
        Ok(())
    }

    fn with_env(&self, key: &str, value: &str) -> GitEnv {
        let mut env = self.env.clone();
        env.set(key, value);
        env
    }
}

/// Quote a value for POSIX `sh`
pub(crate) fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Build the `--env-filter` script rewriting author and committer
///
/// Rules are keyed on the original author only. Email rules are tried first,
/// then name rules, and the first matching rule replaces both identities.
pub(crate) fn env_filter_script(rules: &[AuthorRewrite]) -> String {
    let email_rules = rules.iter().filter_map(|rule| {
        rule.from_email
            .as_deref()
            .filter(|email| !email.is_empty())
            .map(|email| ("gitsync_email", email, rule))
    });
    let name_rules = rules.iter().filter_map(|rule| {
        let keyed_by_email = rule.from_email.as_deref().is_some_and(|e| !e.is_empty());
        rule.from_name
            .as_deref()
            .filter(|name| !name.is_empty() && !keyed_by_email)
            .map(|name| ("gitsync_name", name, rule))
    });

    let mut blocks = String::new();
    for (var, needle, rule) in email_rules.chain(name_rules) {
        blocks.push_str(&format!(
            "if [ -z \"$gitsync_matched\" ] && [ \"${var}\" = {needle} ]; then\n    gitsync_matched=1\n    gitsync_to_name={name}\n    gitsync_to_email={email}\nfi\n",
            var = var,
            needle = shell_quote(needle),
            name = shell_quote(&rule.to_name),
            email = shell_quote(&rule.to_email),
        ));
    }
    if blocks.is_empty() {
        return blocks;
    }

    let mut script = String::from(
        "gitsync_email=$GIT_AUTHOR_EMAIL\ngitsync_name=$GIT_AUTHOR_NAME\ngitsync_matched=\n",
    );
    script.push_str(&blocks);
    script.push_str(concat!(
        "if [ -n \"$gitsync_matched\" ]; then\n",
        "    GIT_AUTHOR_NAME=$gitsync_to_name\n",
        "    GIT_AUTHOR_EMAIL=$gitsync_to_email\n",
        "    GIT_COMMITTER_NAME=$gitsync_to_name\n",
        "    GIT_COMMITTER_EMAIL=$gitsync_to_email\n",
        "    export GIT_AUTHOR_NAME GIT_AUTHOR_EMAIL GIT_COMMITTER_NAME GIT_COMMITTER_EMAIL\n",
        "fi\n",
    ));
    script
}
