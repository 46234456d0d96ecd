//! Local repository state for pit.
//!
//! A repository is a working directory with a `.pit/` marker holding the
//! object directory and a small JSON state record: the Head digest, the
//! last-known remote head (bounds push negotiation) and the remote binding.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::history::{self, CommitMeta, HistoryError};
use crate::object::ObjectId;
use crate::store::{DiskStore, ObjectStore, StoreError};
use crate::worktree::{self, Changeset, PIT_DIR, WorkTreeError};

/// Errors from repository-level operations.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("a pit repository already exists at {0}")]
    AlreadyInitialized(PathBuf),

    #[error(transparent)]
    WorkTree(#[from] WorkTreeError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid state record: {0}")]
    State(#[from] serde_json::Error),
}

/// Persistent repository record, stored at `.pit/state.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoState {
    /// Repository name on the remote.
    pub repo_name: String,
    /// Base URL of the remote server, if bound.
    pub remote_url: Option<String>,
    /// Commit currently checked out. None until the first commit or clone.
    pub head: Option<ObjectId>,
    /// Remote head as of the last successful clone/push/pull.
    pub last_remote_head: Option<ObjectId>,
    /// Author recorded on new commits.
    pub author: String,
}

impl RepoState {
    fn path(pit_dir: &Path) -> PathBuf {
        pit_dir.join("state.json")
    }

    fn load(pit_dir: &Path) -> Result<Self, RepoError> {
        let data = fs::read_to_string(Self::path(pit_dir))?;
        Ok(serde_json::from_str(&data)?)
    }

    fn save(&self, pit_dir: &Path) -> Result<(), RepoError> {
        let path = Self::path(pit_dir);
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_string_pretty(self)?;
        fs::write(&tmp, &data)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Outcome of a local commit attempt.
///
/// `NothingToCommit` is a benign signal, not a failure: the working copy
/// matched the Head tree exactly, so no objects were created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(ObjectId),
    NothingToCommit,
}

/// A local repository: object store, commit history and Head pointer rooted
/// at one working directory.
#[derive(Debug)]
pub struct Repository {
    root: PathBuf,
    pit_dir: PathBuf,
    store: DiskStore,
    state: RepoState,
}

impl Repository {
    /// Initialize a fresh repository at `root`.
    pub fn init(
        root: &Path,
        repo_name: &str,
        remote_url: Option<String>,
        author: &str,
    ) -> Result<Self, RepoError> {
        let pit_dir = root.join(PIT_DIR);
        if pit_dir.exists() {
            return Err(RepoError::AlreadyInitialized(root.to_path_buf()));
        }
        fs::create_dir_all(&pit_dir)?;
        let store = DiskStore::open(&pit_dir.join("objects"))?;

        let state = RepoState {
            repo_name: repo_name.to_string(),
            remote_url,
            head: None,
            last_remote_head: None,
            author: author.to_string(),
        };
        state.save(&pit_dir)?;

        Ok(Self { root: root.to_path_buf(), pit_dir, store, state })
    }

    /// Open the repository containing `start`, walking upward to find the
    /// marker directory.
    pub fn open(start: &Path) -> Result<Self, RepoError> {
        let root = worktree::detect_repository(start)?;
        let pit_dir = root.join(PIT_DIR);
        let store = DiskStore::open(&pit_dir.join("objects"))?;
        let state = RepoState::load(&pit_dir)?;
        Ok(Self { root, pit_dir, store, state })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn store(&self) -> &DiskStore {
        &self.store
    }

    pub fn state(&self) -> &RepoState {
        &self.state
    }

    pub fn head(&self) -> Option<ObjectId> {
        self.state.head
    }

    /// Tree of the Head commit, if any.
    pub async fn head_tree(&self) -> Result<Option<ObjectId>, RepoError> {
        match self.state.head {
            Some(head) => Ok(Some(self.store.load_commit(head).await?.tree)),
            None => Ok(None),
        }
    }

    /// Compare the working directory against the Head tree.
    pub async fn status(&self) -> Result<Changeset, RepoError> {
        let tree = self.head_tree().await?;
        Ok(worktree::diff(&self.store, tree, &self.root).await?)
    }

    /// Record the working directory as a new commit and advance Head.
    ///
    /// A working copy with zero changes produces `NothingToCommit` without
    /// creating any objects.
    pub async fn commit(&mut self, message: &str) -> Result<CommitOutcome, RepoError> {
        let base_tree = self.head_tree().await?;
        let changes = worktree::diff(&self.store, base_tree, &self.root).await?;
        if changes.is_empty() && self.state.head.is_some() {
            return Ok(CommitOutcome::NothingToCommit);
        }

        let tree = worktree::snapshot(&self.store, &self.root).await?;
        let meta = CommitMeta {
            author: self.state.author.clone(),
            message: message.to_string(),
            timestamp: chrono::Utc::now().timestamp(),
        };
        let id = history::create_commit(&self.store, tree, self.state.head, meta).await?;

        self.state.head = Some(id);
        self.state.save(&self.pit_dir)?;
        tracing::info!(commit = %id.short(), changes = changes.len(), "created commit");
        Ok(CommitOutcome::Committed(id))
    }

    /// Commit history from Head back to the root, newest first.
    pub async fn log(&self) -> Result<Vec<(ObjectId, crate::object::Commit)>, RepoError> {
        let Some(head) = self.state.head else {
            return Ok(Vec::new());
        };
        let mut walk = history::Ancestry::new(&self.store, head);
        let mut out = Vec::new();
        while let Some(entry) = walk.next().await? {
            out.push(entry);
        }
        Ok(out)
    }

    /// Move Head after a verified transfer. Only the sync engine calls this,
    /// strictly after confirming the full closure of `head` is present.
    pub(crate) fn set_synced_heads(
        &mut self,
        head: Option<ObjectId>,
        remote_head: Option<ObjectId>,
    ) -> Result<(), RepoError> {
        self.state.head = head;
        self.state.last_remote_head = remote_head;
        self.state.save(&self.pit_dir)
    }

    /// Record the remote head observed by a successful push.
    pub(crate) fn set_last_remote_head(
        &mut self,
        remote_head: Option<ObjectId>,
    ) -> Result<(), RepoError> {
        self.state.last_remote_head = remote_head;
        self.state.save(&self.pit_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn init_repo(dir: &Path) -> Repository {
        Repository::init(dir, "demo", None, "tester").unwrap()
    }

    #[tokio::test]
    async fn test_init_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let repo = init_repo(dir.path());
        assert!(repo.head().is_none());
        drop(repo);

        let nested = dir.path().join("src");
        fs::create_dir_all(&nested).unwrap();
        let reopened = Repository::open(&nested).unwrap();
        assert_eq!(reopened.state().repo_name, "demo");
        assert_eq!(reopened.state().author, "tester");
    }

    #[tokio::test]
    async fn test_init_twice_rejected() {
        let dir = tempfile::tempdir().unwrap();
        init_repo(dir.path());
        let err = Repository::init(dir.path(), "demo", None, "tester").unwrap_err();
        assert!(matches!(err, RepoError::AlreadyInitialized(_)));
    }

    #[tokio::test]
    async fn test_open_outside_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = Repository::open(dir.path()).unwrap_err();
        assert!(matches!(err, RepoError::WorkTree(WorkTreeError::NotARepository(_))));
    }

    #[tokio::test]
    async fn test_commit_advances_head() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init_repo(dir.path());
        write(dir.path(), "a.txt", "alpha");

        let outcome = repo.commit("first").await.unwrap();
        let CommitOutcome::Committed(first) = outcome else {
            panic!("expected a commit");
        };
        assert_eq!(repo.head(), Some(first));

        write(dir.path(), "a.txt", "alpha2");
        let CommitOutcome::Committed(second) = repo.commit("second").await.unwrap() else {
            panic!("expected a commit");
        };
        assert_ne!(first, second);

        let log = repo.log().await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].0, second);
        assert_eq!(log[0].1.parent, Some(first));
        assert_eq!(log[1].1.parent, None);
    }

    #[tokio::test]
    async fn test_clean_tree_is_nothing_to_commit() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init_repo(dir.path());
        write(dir.path(), "a.txt", "alpha");

        let CommitOutcome::Committed(head) = repo.commit("first").await.unwrap() else {
            panic!("expected a commit");
        };
        assert_eq!(repo.commit("again").await.unwrap(), CommitOutcome::NothingToCommit);
        // Head did not move.
        assert_eq!(repo.head(), Some(head));
    }

    #[tokio::test]
    async fn test_head_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut repo = init_repo(dir.path());
        write(dir.path(), "a.txt", "alpha");
        let CommitOutcome::Committed(head) = repo.commit("first").await.unwrap() else {
            panic!("expected a commit");
        };
        drop(repo);

        let reopened = Repository::open(dir.path()).unwrap();
        assert_eq!(reopened.head(), Some(head));
        assert!(reopened.status().await.unwrap().is_empty());
    }
}
