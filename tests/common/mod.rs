//! Common test utilities and helpers for gitsync tests
#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tempfile::TempDir;

use gitsync::config::{AuthConfig, AuthorRewrite, JobConfig, PushMode, RepoConfig};

pub const AUTHOR_NAME: &str = "Alice";
pub const AUTHOR_EMAIL: &str = "alice@example.com";

/// Run git in `dir` with a fixed identity, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", AUTHOR_NAME)
        .env("GIT_AUTHOR_EMAIL", AUTHOR_EMAIL)
        .env("GIT_COMMITTER_NAME", AUTHOR_NAME)
        .env("GIT_COMMITTER_EMAIL", AUTHOR_EMAIL)
        .env("GIT_TERMINAL_PROMPT", "0")
        .output()
        .expect("Failed to execute git");

    assert!(
        output.status.success(),
        "git {:?} failed in {}: {}",
        args,
        dir.display(),
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A bare source repository fed from a scratch working copy, plus room for
/// bare targets, a workspace root and a ledger file
pub struct GitFixture {
    pub temp_dir: TempDir,
    pub source: PathBuf,
    work: PathBuf,
}

impl GitFixture {
    /// Source with a single commit on `main`
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let source = temp_dir.path().join("source.git");
        let work = temp_dir.path().join("work");

        init_bare(&source);

        std::fs::create_dir_all(&work).unwrap();
        git(&work, &["init", "--quiet"]);
        git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&work, &["remote", "add", "origin", &source.to_string_lossy()]);

        let fixture = Self {
            temp_dir,
            source,
            work,
        };
        fixture.commit("main", "README.md", "hello\n");
        fixture
    }

    pub fn source_url(&self) -> String {
        self.source.to_string_lossy().into_owned()
    }

    /// Commit a file on `branch` (created from the current branch if new)
    /// and push it to the source. Returns the new commit hash.
    pub fn commit(&self, branch: &str, file: &str, content: &str) -> String {
        self.switch(branch);
        std::fs::write(self.work.join(file), content).unwrap();
        git(&self.work, &["add", file]);
        git(&self.work, &["commit", "--quiet", "-m", &format!("update {}", file)]);
        git(&self.work, &["push", "--quiet", "origin", branch]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    /// Like [`GitFixture::commit`] with explicit `(name, email)` identities
    pub fn commit_as(
        &self,
        branch: &str,
        file: &str,
        author: (&str, &str),
        committer: (&str, &str),
    ) -> String {
        self.switch(branch);
        std::fs::write(self.work.join(file), file).unwrap();
        git(&self.work, &["add", file]);

        let output = Command::new("git")
            .args(["commit", "--quiet", "-m", &format!("add {}", file)])
            .current_dir(&self.work)
            .env("GIT_AUTHOR_NAME", author.0)
            .env("GIT_AUTHOR_EMAIL", author.1)
            .env("GIT_COMMITTER_NAME", committer.0)
            .env("GIT_COMMITTER_EMAIL", committer.1)
            .output()
            .expect("Failed to execute git");
        assert!(
            output.status.success(),
            "git commit failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );

        git(&self.work, &["push", "--quiet", "origin", branch]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    /// Replace the tip of `branch` with a different commit and force-push it
    pub fn amend(&self, branch: &str, content: &str) -> String {
        self.switch(branch);
        std::fs::write(self.work.join("README.md"), content).unwrap();
        git(&self.work, &["add", "README.md"]);
        git(&self.work, &["commit", "--quiet", "--amend", "-m", "rewritten"]);
        git(&self.work, &["push", "--quiet", "--force", "origin", branch]);
        git(&self.work, &["rev-parse", "HEAD"])
    }

    fn switch(&self, branch: &str) {
        let exists = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
            .current_dir(&self.work)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);
        let has_commits = Command::new("git")
            .args(["rev-parse", "--verify", "--quiet", "HEAD"])
            .current_dir(&self.work)
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false);

        if exists {
            git(&self.work, &["checkout", "--quiet", branch]);
        } else if has_commits {
            git(&self.work, &["checkout", "--quiet", "-b", branch]);
        }
    }

    /// Create an empty bare target repository
    pub fn create_target(&self, name: &str) -> String {
        let path = self.temp_dir.path().join(format!("{}.git", name));
        init_bare(&path);
        path.to_string_lossy().into_owned()
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.temp_dir.path().join("workspace")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.temp_dir.path().join("data").join("gitsync.db")
    }
}

fn init_bare(path: &Path) {
    std::fs::create_dir_all(path).unwrap();
    git(path, &["init", "--quiet", "--bare"]);
    git(path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
}

/// Tip of `branch` in a bare repository, if the branch exists
pub fn rev(repo: &str, branch: &str) -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--verify", "--quiet", &format!("refs/heads/{}", branch)])
        .current_dir(repo)
        .output()
        .expect("Failed to execute git");
    output
        .status
        .success()
        .then(|| String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Author email of the tip commit of `branch`
pub fn author_email(repo: &str, branch: &str) -> String {
    git(
        Path::new(repo),
        &["log", "-1", "--format=%ae", &format!("refs/heads/{}", branch)],
    )
}

/// `author name|author email|committer name|committer email` of the tip of `branch`
pub fn tip_identity(repo: &str, branch: &str) -> String {
    git(
        Path::new(repo),
        &["log", "-1", "--format=%an|%ae|%cn|%ce", &format!("refs/heads/{}", branch)],
    )
}

/// A target URL whose transport never answers, so fetches from it hang
pub const STALLED_TARGET: &str = "ext::sleep 30";

/// Let the clone in `dir` use the `ext::` transport of [`STALLED_TARGET`]
pub fn allow_stalled_target(dir: &Path) {
    git(dir, &["config", "protocol.ext.allow", "always"]);
}

pub fn repo(source: &str, targets: &[&str], branches: &[&str], mode: PushMode) -> RepoConfig {
    RepoConfig {
        name: Some("project".to_string()),
        source: source.to_string(),
        targets: targets.iter().map(|t| t.to_string()).collect(),
        branches: branches.iter().map(|b| b.to_string()).collect(),
        mode,
        auth: AuthConfig::default(),
        rewrite_history: false,
        author_rewrites: Vec::new(),
    }
}

pub fn rewrite_rule(from_email: &str, to_name: &str, to_email: &str) -> AuthorRewrite {
    AuthorRewrite {
        from_email: Some(from_email.to_string()),
        from_name: None,
        to_name: to_name.to_string(),
        to_email: to_email.to_string(),
    }
}

pub fn name_rule(from_name: &str, to_name: &str, to_email: &str) -> AuthorRewrite {
    AuthorRewrite {
        from_email: None,
        from_name: Some(from_name.to_string()),
        to_name: to_name.to_string(),
        to_email: to_email.to_string(),
    }
}

pub fn job(name: &str, repos: Vec<RepoConfig>) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        description: String::new(),
        schedule: "@hourly".to_string(),
        enabled: true,
        timeout: Duration::from_secs(120),
        repos,
    }
}
