//! Git worktree used to stage a change off the main checkout.

use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::PublishError;

/// A git worktree on its own branch.
///
/// The worktree is removed on [`Worktree::cleanup`] or drop. The branch is
/// deleted with it unless [`Worktree::keep_branch`] was called.
pub struct Worktree {
    /// Path to the worktree directory.
    path: PathBuf,
    /// Path to the parent git repository.
    repo_path: PathBuf,
    /// Branch checked out in the worktree.
    branch_name: String,
    /// Whether the branch outlives the worktree.
    keep_branch: bool,
    /// Whether the worktree has been cleaned up.
    cleaned_up: bool,
}

impl Worktree {
    /// Creates `branch_name` from `base_ref` and checks it out under `base_dir`.
    pub fn create(
        repo_path: &Path,
        base_dir: &Path,
        branch_name: &str,
        base_ref: &str,
    ) -> Result<Self, PublishError> {
        std::fs::create_dir_all(base_dir).map_err(|e| {
            PublishError::Unavailable(format!("failed to create worktree dir: {}", e))
        })?;
        let path = base_dir.join(branch_name.replace('/', "-"));

        let output = git(
            repo_path,
            &["worktree", "add", "-b", branch_name, &path.to_string_lossy(), base_ref],
        )?;
        if !output.status.success() {
            return Err(PublishError::Unavailable(format!(
                "git worktree add failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(path = ?path, branch = %branch_name, "created publish worktree");

        Ok(Self {
            path,
            repo_path: repo_path.to_path_buf(),
            branch_name: branch_name.to_string(),
            keep_branch: false,
            cleaned_up: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn branch_name(&self) -> &str {
        &self.branch_name
    }

    /// Keeps the branch when the worktree is removed.
    pub fn keep_branch(&mut self) {
        self.keep_branch = true;
    }

    /// Removes the worktree, and the branch unless it is kept.
    pub fn cleanup(&mut self) -> Result<(), PublishError> {
        if self.cleaned_up {
            return Ok(());
        }

        let path = self.path.to_string_lossy().to_string();
        let output = git(&self.repo_path, &["worktree", "remove", "--force", &path])?;
        if !output.status.success() {
            return Err(PublishError::Unavailable(format!(
                "failed to remove worktree {}: {}",
                path,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        if !self.keep_branch {
            let output = git(&self.repo_path, &["branch", "-D", &self.branch_name])?;
            if !output.status.success() {
                tracing::warn!(
                    branch = %self.branch_name,
                    "failed to delete worktree branch, may need manual cleanup"
                );
            }
        }

        self.cleaned_up = true;
        Ok(())
    }
}

impl Drop for Worktree {
    fn drop(&mut self) {
        if !self.cleaned_up {
            if let Err(e) = self.cleanup() {
                tracing::error!(error = %e, path = ?self.path, "failed to cleanup worktree on drop");
            }
        }
    }
}

/// Runs git in `dir`, mapping spawn failures to [`PublishError::Unavailable`].
pub(crate) fn git(dir: &Path, args: &[&str]) -> Result<std::process::Output, PublishError> {
    Command::new("git")
        .current_dir(dir)
        .args(args)
        .output()
        .map_err(|e| PublishError::Unavailable(format!("failed to run git: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::create_temp_git_repo;
    use tempfile::TempDir;

    fn branch_exists(repo: &Path, branch: &str) -> bool {
        git(repo, &["rev-parse", "--verify", "--quiet", branch])
            .unwrap()
            .status
            .success()
    }

    #[test]
    fn worktree_creates_and_cleans_up() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();

        let mut worktree =
            Worktree::create(repo.path(), base.path(), "auto/add-numbers", "HEAD").unwrap();

        assert!(worktree.path().join("README.md").exists());
        assert!(!worktree.path().to_string_lossy().contains("auto/"));
        let path = worktree.path().to_path_buf();

        worktree.cleanup().expect("failed to cleanup worktree");

        assert!(!path.exists());
        assert!(!branch_exists(repo.path(), "auto/add-numbers"));
    }

    #[test]
    fn kept_branch_survives_cleanup() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();

        let mut worktree = Worktree::create(repo.path(), base.path(), "auto/keep", "HEAD").unwrap();
        worktree.keep_branch();
        worktree.cleanup().unwrap();

        assert!(branch_exists(repo.path(), "auto/keep"));
    }

    #[test]
    fn cleanup_is_idempotent_and_drop_removes() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();

        let mut worktree = Worktree::create(repo.path(), base.path(), "auto/twice", "HEAD").unwrap();
        worktree.cleanup().expect("first cleanup failed");
        worktree
            .cleanup()
            .expect("second cleanup should be idempotent");

        let dropped = Worktree::create(repo.path(), base.path(), "auto/dropped", "HEAD").unwrap();
        let path = dropped.path().to_path_buf();
        drop(dropped);
        assert!(!path.exists());
    }

    #[test]
    fn duplicate_branch_is_unavailable() {
        let repo = create_temp_git_repo();
        let base = TempDir::new().unwrap();

        let _first = Worktree::create(repo.path(), base.path(), "auto/same", "HEAD").unwrap();
        let second = Worktree::create(repo.path(), base.path(), "auto/same", "HEAD");

        assert!(matches!(second, Err(PublishError::Unavailable(_))));
    }
}
