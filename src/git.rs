//! Version-control operations the Engine performs around a successful
//! iteration: stage-all, commit, rev-parse HEAD, and diff --name-only
//! (spec.md §4.2 step 7, §6).
//!
//! Grounded in the host's `git::manager::GitManager` / `git::commits`
//! (`git2`-backed `stage_all`, `create_commit`, `get_working_diff`),
//! generalized to the narrower set of operations the Engine needs —
//! spec.md names these as literal CLI invocations, but the host already
//! performs the same effects through `git2` rather than shelling out, so
//! this keeps that idiom instead of spawning a `git` subprocess.

use git2::{IndexAddOption, Repository, Signature};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum GitOpsError {
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
}

/// Thin wrapper over a `git2::Repository` exposing only the operations
/// the Engine's commit step needs.
pub struct GitOps {
    repo: Repository,
}

impl GitOps {
    pub fn open(project_path: &std::path::Path) -> Result<Self, GitOpsError> {
        Ok(Self {
            repo: Repository::open(project_path)?,
        })
    }

    /// `git add .`
    pub fn stage_all(&self) -> Result<(), GitOpsError> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        Ok(())
    }

    /// `git commit -m <message>`. Returns the new commit's SHA.
    pub fn commit(&self, message: &str) -> Result<String, GitOpsError> {
        let signature = Signature::now("Ralph Engine", "ralph@localhost")?;
        let mut index = self.repo.index()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let parent = self.repo.head()?.peel_to_commit()?;

        let oid = self
            .repo
            .commit(Some("HEAD"), &signature, &signature, message, &tree, &[&parent])?;
        Ok(oid.to_string())
    }

    /// `git rev-parse HEAD`
    pub fn head_sha(&self) -> Result<String, GitOpsError> {
        let head = self.repo.head()?.peel_to_commit()?;
        Ok(head.id().to_string())
    }

    /// `git diff --name-only` between the working tree and HEAD.
    pub fn changed_files(&self) -> Result<Vec<String>, GitOpsError> {
        let head = self.repo.head()?.peel_to_commit()?;
        let tree = head.tree()?;
        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(Some(&tree), None)?;

        let mut files = Vec::new();
        diff.foreach(
            &mut |delta, _| {
                if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                    files.push(path.to_string_lossy().to_string());
                }
                true
            },
            None,
            None,
            None,
        )?;
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn init_repo_with_first_commit(dir: &std::path::Path) {
        let repo = Repository::init(dir).unwrap();
        fs::write(dir.join("README.md"), "hello\n").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let signature = Signature::now("Test", "test@localhost").unwrap();
        repo.commit(Some("HEAD"), &signature, &signature, "initial commit", &tree, &[])
            .unwrap();
    }

    #[test]
    fn stage_commit_and_head_sha_round_trip() {
        let dir = TempDir::new().unwrap();
        init_repo_with_first_commit(dir.path());

        fs::write(dir.path().join("task.txt"), "done\n").unwrap();
        let git_ops = GitOps::open(dir.path()).unwrap();
        git_ops.stage_all().unwrap();
        let sha = git_ops.commit("feat: 1.1 - add task file").unwrap();

        assert_eq!(git_ops.head_sha().unwrap(), sha);
    }

    #[test]
    fn changed_files_lists_new_file_after_commit() {
        let dir = TempDir::new().unwrap();
        init_repo_with_first_commit(dir.path());

        fs::write(dir.path().join("task.txt"), "done\n").unwrap();
        let git_ops = GitOps::open(dir.path()).unwrap();
        git_ops.stage_all().unwrap();
        git_ops.commit("feat: 1.1 - add task file").unwrap();

        fs::write(dir.path().join("task.txt"), "done again\n").unwrap();
        let changed = git_ops.changed_files().unwrap();
        assert_eq!(changed, vec!["task.txt".to_string()]);
    }

    #[test]
    fn open_on_non_repo_fails() {
        let dir = TempDir::new().unwrap();
        assert!(GitOps::open(dir.path()).is_err());
    }
}
