//! Per-job working directories and credential staging
//!
//! Every job gets its own directory under the workspace root, and every
//! source repository its own cached clone inside it:
//!
//! ```text
//! <root>/<job>/<source-token>/        cached clone
//! <root>/<job>/<source-token>.askpass git askpass helper (token auth only)
//! ```
//!
//! Tokens combine a readable form of the URL with a short hash, so two URLs
//! that sanitize to the same text still get separate directories.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::AuthConfig;
use crate::git::{shell_quote, GitEnv};

const HASH_LEN: usize = 12;
const READABLE_MAX: usize = 48;

/// Derive a filesystem- and remote-name-safe token from a repository URL
pub fn url_token(url: &str) -> String {
    let mut readable = url.trim();
    for prefix in ["https://", "http://", "ssh://", "file://", "git@"] {
        if let Some(rest) = readable.strip_prefix(prefix) {
            readable = rest;
            break;
        }
    }
    let readable = readable.trim_end_matches('/').trim_end_matches(".git");

    let mut sanitized: String = readable
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let keep_from = sanitized.len().saturating_sub(READABLE_MAX);
    sanitized = sanitized[keep_from..].trim_matches('-').to_string();

    let digest = hex::encode(Sha256::digest(url.as_bytes()));
    if sanitized.is_empty() {
        digest[..HASH_LEN].to_string()
    } else {
        format!("{}-{}", sanitized, &digest[..HASH_LEN])
    }
}

/// Root directory holding all per-job workspaces
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory owned by one job
    pub fn job_root(&self, job: &str) -> PathBuf {
        let job_dir: String = job
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
            .collect();
        self.root.join(job_dir)
    }

    /// Cached clone location for `source` within `job`
    pub fn repo_dir(&self, job: &str, source: &str) -> PathBuf {
        self.job_root(job).join(url_token(source))
    }

    /// Remove everything a job has cached
    pub fn remove_job_root(&self, job: &str) -> Result<()> {
        let dir = self.job_root(job);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .with_context(|| format!("Failed to remove workspace {}", dir.display()))?;
        }
        Ok(())
    }

    /// Build the git environment carrying a repository's credentials
    ///
    /// Token auth installs an askpass helper next to the clone; an SSH key
    /// sets `GIT_SSH_COMMAND`. Prompts are always disabled so git never
    /// blocks waiting for input.
    pub fn stage_credentials(&self, job: &str, source: &str, auth: &AuthConfig) -> Result<GitEnv> {
        let mut env = GitEnv::new();
        env.set("GIT_TERMINAL_PROMPT", "0");

        if let Some(token) = auth.token.as_deref().filter(|t| !t.is_empty()) {
            let job_root = self.job_root(job);
            std::fs::create_dir_all(&job_root)
                .with_context(|| format!("Failed to create {}", job_root.display()))?;

            let script_path = job_root.join(format!("{}.askpass", url_token(source)));
            let username = auth.username.as_deref().unwrap_or("git");
            write_askpass(&script_path, username, token)?;
            debug!("Staged askpass helper at {}", script_path.display());

            env.set("GIT_ASKPASS", script_path.to_string_lossy());
        }

        if let Some(key) = auth.ssh_key_path.as_deref().filter(|k| !k.is_empty()) {
            env.set(
                "GIT_SSH_COMMAND",
                format!("ssh -i {} -o StrictHostKeyChecking=no", shell_quote(key)),
            );
        }

        Ok(env)
    }
}

fn write_askpass(path: &Path, username: &str, token: &str) -> Result<()> {
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n    Username*) echo {} ;;\n    *) echo {} ;;\nesac\n",
        shell_quote(username),
        shell_quote(token)
    );
    std::fs::write(path, script)
        .with_context(|| format!("Failed to write askpass helper {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
            .with_context(|| format!("Failed to mark {} executable", path.display()))?;
    }

    Ok(())
}
