//! Repository publisher backed by git and the GitHub CLI.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;

use crate::config::PublishConfig;
use crate::error::PublishError;

use super::worktree::{git, Worktree};
use super::{ArtifactRef, ChangeSet, RepositoryPublisher};

/// Publishes approved code as a branch and pull request.
///
/// Each publish stages the change in a fresh worktree, commits it, pushes
/// the branch and opens a PR with `gh pr create`. The worktree is always
/// removed; the branch survives only once committed.
#[derive(Debug, Clone)]
pub struct GitHubPublisher {
    repo_path: PathBuf,
    base_branch: String,
    file_path: PathBuf,
    push: bool,
    worktree_dir: Option<PathBuf>,
    gh_path: String,
}

impl GitHubPublisher {
    pub fn new(repo_path: PathBuf) -> Self {
        let defaults = PublishConfig::default();
        Self {
            repo_path,
            base_branch: defaults.base_branch,
            file_path: defaults.file_path,
            push: defaults.push,
            worktree_dir: None,
            gh_path: "gh".to_string(),
        }
    }

    /// Builds a publisher from config, defaulting the repository to `cwd`.
    pub fn from_config(config: &PublishConfig, cwd: &Path) -> Self {
        let repo_path = config
            .repo_path
            .clone()
            .unwrap_or_else(|| cwd.to_path_buf());
        Self::new(repo_path)
            .with_base_branch(config.base_branch.clone())
            .with_file_path(config.file_path.clone())
            .with_push(config.push)
    }

    pub fn with_base_branch(mut self, branch: impl Into<String>) -> Self {
        self.base_branch = branch.into();
        self
    }

    /// Repository-relative path the code is written to.
    pub fn with_file_path(mut self, path: PathBuf) -> Self {
        self.file_path = path;
        self
    }

    /// Whether to push and open a PR, or only commit locally.
    pub fn with_push(mut self, push: bool) -> Self {
        self.push = push;
        self
    }

    /// Directory worktrees are created under. Defaults to the system temp dir.
    pub fn with_worktree_dir(mut self, dir: PathBuf) -> Self {
        self.worktree_dir = Some(dir);
        self
    }

    pub fn with_gh_path(mut self, path: impl Into<String>) -> Self {
        self.gh_path = path.into();
        self
    }

    fn worktree_base(&self) -> PathBuf {
        self.worktree_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("agent-crew-worktrees"))
    }

    /// Runs the whole publish sequence. Blocking.
    fn publish_blocking(&self, change: &ChangeSet) -> Result<ArtifactRef, PublishError> {
        let mut worktree = Worktree::create(
            &self.repo_path,
            &self.worktree_base(),
            &change.branch_name,
            &self.base_ref(),
        )?;

        let result = self.stage_and_commit(&worktree, change);
        if result.is_ok() {
            worktree.keep_branch();
        }
        if let Err(e) = worktree.cleanup() {
            tracing::warn!(error = %e, branch = %change.branch_name, "failed to remove publish worktree");
        }
        let commit = result?;

        let mut artifact = ArtifactRef {
            branch: change.branch_name.clone(),
            commit: Some(commit),
            url: None,
            number: None,
        };

        if self.push {
            self.push_branch(&change.branch_name)?;
            let (url, number) = self.create_pr(change)?;
            artifact.url = Some(url);
            artifact.number = number;
        }

        Ok(artifact)
    }

    /// Prefers the remote base branch when one is known locally.
    fn base_ref(&self) -> String {
        let remote = format!("origin/{}", self.base_branch);
        match git(&self.repo_path, &["rev-parse", "--verify", "--quiet", &remote]) {
            Ok(output) if output.status.success() => remote,
            _ => self.base_branch.clone(),
        }
    }

    fn stage_and_commit(
        &self,
        worktree: &Worktree,
        change: &ChangeSet,
    ) -> Result<String, PublishError> {
        let target = worktree.path().join(&self.file_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PublishError::Unavailable(format!("failed to create {}: {}", parent.display(), e))
            })?;
        }
        std::fs::write(&target, &change.code.source).map_err(|e| {
            PublishError::Unavailable(format!("failed to write {}: {}", target.display(), e))
        })?;

        let file = self.file_path.to_string_lossy().to_string();
        let add = git(worktree.path(), &["add", "--", &file])?;
        if !add.status.success() {
            return Err(PublishError::Unavailable(format!(
                "failed to stage changes: {}",
                String::from_utf8_lossy(&add.stderr).trim()
            )));
        }

        let commit = git(worktree.path(), &["commit", "-m", &change.title])?;
        if !commit.status.success() {
            let stderr = String::from_utf8_lossy(&commit.stderr);
            let stdout = String::from_utf8_lossy(&commit.stdout);
            if stdout.contains("nothing to commit") || stderr.contains("nothing to commit") {
                return Err(PublishError::Rejected(
                    "approved code is identical to the base branch".to_string(),
                ));
            }
            return Err(PublishError::Unavailable(format!(
                "failed to commit: {}",
                stderr.trim()
            )));
        }

        let rev = git(worktree.path(), &["rev-parse", "HEAD"])?;
        Ok(String::from_utf8_lossy(&rev.stdout).trim().to_string())
    }

    fn push_branch(&self, branch_name: &str) -> Result<(), PublishError> {
        let output = git(&self.repo_path, &["push", "-u", "origin", branch_name])?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_remote_failure("failed to push branch", &stderr));
        }
        Ok(())
    }

    fn create_pr(&self, change: &ChangeSet) -> Result<(String, Option<u64>), PublishError> {
        let output = Command::new(&self.gh_path)
            .current_dir(&self.repo_path)
            .args([
                "pr",
                "create",
                "--title",
                &change.title,
                "--body",
                &change.body,
                "--head",
                &change.branch_name,
                "--base",
                &self.base_branch,
            ])
            .output()
            .map_err(|e| PublishError::Unavailable(format!("failed to run gh: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_remote_failure("failed to create PR", &stderr));
        }

        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        Ok((url.clone(), pr_number(&url)))
    }
}

/// Extracts the PR number from a `.../pull/<n>` URL.
fn pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next().and_then(|s| s.parse().ok())
}

/// Remote refusals are rejections; everything else means the host was unusable.
fn classify_remote_failure(context: &str, stderr: &str) -> PublishError {
    let message = format!("{}: {}", context, stderr.trim());
    let lowered = stderr.to_lowercase();
    if lowered.contains("rejected")
        || lowered.contains("permission")
        || lowered.contains("protected branch")
        || lowered.contains("already exists")
    {
        PublishError::Rejected(message)
    } else {
        PublishError::Unavailable(message)
    }
}

#[async_trait]
impl RepositoryPublisher for GitHubPublisher {
    async fn publish(&self, change: &ChangeSet) -> Result<ArtifactRef, PublishError> {
        tracing::info!(
            repo = ?self.repo_path,
            branch = %change.branch_name,
            push = self.push,
            "publishing approved change"
        );

        let publisher = self.clone();
        let change = change.clone();
        tokio::task::spawn_blocking(move || publisher.publish_blocking(&change))
            .await
            .map_err(|e| PublishError::Unavailable(format!("publish task failed: {}", e)))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{CodeUnit, Language};
    use crate::test_support::create_temp_git_repo;
    use tempfile::TempDir;

    fn change(branch: &str, source: &str) -> ChangeSet {
        ChangeSet {
            code: CodeUnit::new(Language::Python, source),
            branch_name: branch.to_string(),
            title: "Add numbers".to_string(),
            body: "Adds two numbers.".to_string(),
        }
    }

    fn current_branch(repo: &Path) -> String {
        let output = git(repo, &["rev-parse", "--abbrev-ref", "HEAD"]).unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    #[test]
    fn pr_number_parsed_from_url() {
        assert_eq!(pr_number("https://github.com/o/r/pull/42"), Some(42));
        assert_eq!(pr_number("not a url"), None);
    }

    #[test]
    fn remote_refusals_are_rejections() {
        assert!(matches!(
            classify_remote_failure("push", "! [remote rejected] main (protected branch hook declined)"),
            PublishError::Rejected(_)
        ));
        assert!(matches!(
            classify_remote_failure("push", "Could not resolve host: github.com"),
            PublishError::Unavailable(_)
        ));
    }

    #[test]
    fn from_config_defaults_repo_to_cwd() {
        let config = PublishConfig {
            push: false,
            ..Default::default()
        };
        let publisher = GitHubPublisher::from_config(&config, Path::new("/work/repo"));

        assert_eq!(publisher.repo_path, PathBuf::from("/work/repo"));
        assert_eq!(publisher.file_path, PathBuf::from("generated_code.py"));
        assert!(!publisher.push);
    }

    #[tokio::test]
    async fn local_publish_commits_on_branch_and_removes_worktree() {
        let repo = create_temp_git_repo();
        let worktrees = TempDir::new().unwrap();
        let base = current_branch(repo.path());
        let publisher = GitHubPublisher::new(repo.path().to_path_buf())
            .with_base_branch(base)
            .with_push(false)
            .with_worktree_dir(worktrees.path().to_path_buf());

        let artifact = publisher
            .publish(&change("auto/add-numbers", "print(1 + 2)\n"))
            .await
            .unwrap();

        assert_eq!(artifact.branch, "auto/add-numbers");
        assert!(artifact.commit.is_some());
        assert!(artifact.url.is_none());
        assert_eq!(std::fs::read_dir(worktrees.path()).unwrap().count(), 0);

        let show = git(repo.path(), &["show", "auto/add-numbers:generated_code.py"]).unwrap();
        assert_eq!(String::from_utf8_lossy(&show.stdout), "print(1 + 2)\n");
    }

    #[tokio::test]
    async fn failed_commit_drops_branch() {
        let repo = create_temp_git_repo();
        let worktrees = TempDir::new().unwrap();
        let base = current_branch(repo.path());
        // The base already holds README.md with this exact content.
        let publisher = GitHubPublisher::new(repo.path().to_path_buf())
            .with_base_branch(base)
            .with_push(false)
            .with_file_path(PathBuf::from("README.md"))
            .with_worktree_dir(worktrees.path().to_path_buf());

        let err = publisher
            .publish(&change("auto/noop", "# Test Repo\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Rejected(_)));
        let verify = git(repo.path(), &["rev-parse", "--verify", "--quiet", "auto/noop"]).unwrap();
        assert!(!verify.status.success());
    }

    #[tokio::test]
    async fn missing_repository_is_unavailable() {
        let dir = TempDir::new().unwrap();
        let publisher = GitHubPublisher::new(dir.path().join("nope")).with_push(false);

        let err = publisher
            .publish(&change("auto/x", "print(1)\n"))
            .await
            .unwrap_err();

        assert!(matches!(err, PublishError::Unavailable(_)));
    }

    #[tokio::test]
    #[ignore] // Requires a GitHub remote and an authenticated gh CLI
    async fn publish_opens_pull_request() {
        let repo = std::env::var("AGENT_CREW_TEST_REPO").expect("AGENT_CREW_TEST_REPO not set");
        let publisher = GitHubPublisher::new(PathBuf::from(repo));
        let branch = format!("auto/test-{}", uuid::Uuid::new_v4().simple());

        let artifact = publisher
            .publish(&change(&branch, "print('hello')\n"))
            .await
            .unwrap();

        assert!(artifact.url.unwrap().contains("/pull/"));
    }
}
