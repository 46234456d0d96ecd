//! Server-side repository registry.
//!
//! A `RepoHub` hosts any number of named repositories, each an object store
//! plus a single mutable head. The hub is the authority on head movement:
//! `HostedRepo::advance_head` is a check-and-set under a per-repository
//! lock, and it refuses to publish a head whose object closure is not fully
//! present. `LocalChannel` adapts a hub to the `RemoteChannel` trait for
//! in-process use and tests; the HTTP server exposes the same operations
//! over the network.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use crate::history;
use crate::object::ObjectId;
use crate::store::{DiskStore, MemoryStore, ObjectStore, StoreError};
use crate::sync::{self, RemoteChannel, RepoId, SyncError};

/// A single repository hosted by a hub.
pub struct HostedRepo {
    name: String,
    id: RepoId,
    store: Arc<dyn ObjectStore>,
    head: Mutex<Option<ObjectId>>,
    head_path: Option<PathBuf>,
}

impl HostedRepo {
    fn new(
        name: String,
        store: Arc<dyn ObjectStore>,
        head: Option<ObjectId>,
        head_path: Option<PathBuf>,
    ) -> Self {
        Self {
            name,
            id: uuid::Uuid::new_v4().to_string(),
            store,
            head: Mutex::new(head),
            head_path,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn store(&self) -> &dyn ObjectStore {
        self.store.as_ref()
    }

    pub async fn head(&self) -> Option<ObjectId> {
        *self.head.lock().await
    }

    /// Store raw objects, verifying each digest against the content.
    pub async fn receive_objects(&self, objects: Vec<(ObjectId, Bytes)>) -> Result<(), SyncError> {
        for (id, data) in objects {
            let stored = self.store.put(data).await?;
            if stored != id {
                return Err(SyncError::Corrupt(format!(
                    "digest mismatch: declared {} computed {}",
                    id, stored
                )));
            }
        }
        Ok(())
    }

    /// Atomic check-and-set of the head.
    ///
    /// Holds the head lock across the comparison, the closure verification
    /// and the ancestry check, so concurrent pushers serialize and exactly
    /// one of two racing fast-forwards wins; the loser sees
    /// `NonFastForward`. A head whose closure has gaps is rejected with
    /// `Conflict`, and a `new_head` that does not descend from the current
    /// head is rejected with `NonFastForward` regardless of what the client
    /// claimed; either way the current head stands.
    pub async fn advance_head(
        &self,
        expected: Option<ObjectId>,
        new_head: ObjectId,
    ) -> Result<(), SyncError> {
        let mut head = self.head.lock().await;
        if *head != expected {
            return Err(SyncError::NonFastForward);
        }

        // History at or below the old head was verified when it was set.
        sync::closure(self.store.as_ref(), new_head, *head)
            .await
            .map_err(|e| match e {
                SyncError::Corrupt(_) => SyncError::Conflict,
                other => other,
            })?;

        // A matching `expected` is not enough: the published history must
        // extend the current one.
        if let Some(current) = *head {
            if !history::is_ancestor(self.store.as_ref(), current, new_head).await? {
                return Err(SyncError::NonFastForward);
            }
        }

        if let Some(path) = &self.head_path {
            persist_head(path, new_head)?;
        }
        *head = Some(new_head);
        tracing::info!(repo = %self.name, head = %new_head.short(), "head advanced");
        Ok(())
    }
}

fn persist_head(path: &Path, head: ObjectId) -> Result<(), SyncError> {
    let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
    std::fs::write(&tmp, head.to_hex()).map_err(StoreError::Io)?;
    std::fs::rename(&tmp, path).map_err(StoreError::Io)?;
    Ok(())
}

fn load_head(path: &Path) -> Result<Option<ObjectId>, SyncError> {
    match std::fs::read_to_string(path) {
        Ok(hex) => {
            let id = ObjectId::from_hex(hex.trim())
                .map_err(|e| SyncError::Corrupt(format!("bad head file {}: {}", path.display(), e)))?;
            Ok(Some(id))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e).into()),
    }
}

/// Registry of hosted repositories, keyed by name.
///
/// In-memory hubs back each repository with a `MemoryStore`; disk hubs lay
/// repositories out as `<root>/<name>/objects` plus a `HEAD` file and
/// reload them on open.
#[derive(Clone)]
pub struct RepoHub {
    repos: Arc<RwLock<HashMap<String, Arc<HostedRepo>>>>,
    root: Option<PathBuf>,
}

impl RepoHub {
    pub fn in_memory() -> Self {
        Self { repos: Arc::new(RwLock::new(HashMap::new())), root: None }
    }

    /// Open a disk-backed hub, reloading any repositories already present
    /// under `root`.
    pub fn open(root: &Path) -> Result<Self, SyncError> {
        std::fs::create_dir_all(root).map_err(StoreError::Io)?;

        let mut repos = HashMap::new();
        for entry in std::fs::read_dir(root).map_err(StoreError::Io)? {
            let entry = entry.map_err(StoreError::Io)?;
            if !entry.file_type().map_err(StoreError::Io)?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            let dir = entry.path();
            let store = DiskStore::open(&dir.join("objects"))?;
            let head_path = dir.join("HEAD");
            let head = load_head(&head_path)?;
            repos.insert(
                name.clone(),
                Arc::new(HostedRepo::new(name, Arc::new(store), head, Some(head_path))),
            );
        }

        tracing::info!(root = %root.display(), repos = repos.len(), "hub opened");
        Ok(Self {
            repos: Arc::new(RwLock::new(repos)),
            root: Some(root.to_path_buf()),
        })
    }

    /// Allocate a new empty repository.
    pub async fn create(&self, name: &str) -> Result<RepoId, SyncError> {
        if name.is_empty()
            || name.contains('/')
            || name.contains('\\')
            || name == "."
            || name == ".."
        {
            return Err(SyncError::Transport(format!("invalid repository name: {name:?}")));
        }

        let mut repos = self.repos.write().await;
        if repos.contains_key(name) {
            return Err(SyncError::AlreadyExists(name.to_string()));
        }

        let (store, head_path): (Arc<dyn ObjectStore>, _) = match &self.root {
            Some(root) => {
                let dir = root.join(name);
                let store = DiskStore::open(&dir.join("objects"))?;
                (Arc::new(store), Some(dir.join("HEAD")))
            }
            None => (Arc::new(MemoryStore::new()), None),
        };

        let repo = Arc::new(HostedRepo::new(name.to_string(), store, None, head_path));
        let id = repo.id().to_string();
        repos.insert(name.to_string(), repo);
        tracing::info!(repo = name, id = %id, "repository created");
        Ok(id)
    }

    pub async fn get(&self, name: &str) -> Result<Arc<HostedRepo>, SyncError> {
        self.repos
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::NotFound(name.to_string()))
    }

    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.repos.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

/// `RemoteChannel` over an in-process hub. Used by tests and by any caller
/// that embeds the server side directly.
#[derive(Clone)]
pub struct LocalChannel {
    hub: RepoHub,
}

impl LocalChannel {
    pub fn new(hub: RepoHub) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl RemoteChannel for LocalChannel {
    async fn create(&self, repo_name: &str) -> Result<RepoId, SyncError> {
        self.hub.create(repo_name).await
    }

    async fn get_head(&self, repo_name: &str) -> Result<Option<ObjectId>, SyncError> {
        Ok(self.hub.get(repo_name).await?.head().await)
    }

    async fn has_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<HashSet<ObjectId>, SyncError> {
        let repo = self.hub.get(repo_name).await?;
        let mut present = HashSet::new();
        for id in ids {
            if repo.store().has(*id).await? {
                present.insert(*id);
            }
        }
        Ok(present)
    }

    async fn fetch_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<(ObjectId, Option<Bytes>)>, SyncError> {
        let repo = self.hub.get(repo_name).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            match repo.store().get(*id).await {
                Ok(data) => out.push((*id, Some(data))),
                Err(StoreError::NotFound(_)) => out.push((*id, None)),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(out)
    }

    async fn push_objects(
        &self,
        repo_name: &str,
        objects: Vec<(ObjectId, Bytes)>,
    ) -> Result<(), SyncError> {
        self.hub.get(repo_name).await?.receive_objects(objects).await
    }

    async fn advance_head(
        &self,
        repo_name: &str,
        expected: Option<ObjectId>,
        new_head: ObjectId,
    ) -> Result<(), SyncError> {
        self.hub.get(repo_name).await?.advance_head(expected, new_head).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{self, CommitMeta};
    use crate::object::{ObjectKind, Tree, TreeEntry};

    async fn seed_commit(
        repo: &HostedRepo,
        parent: Option<ObjectId>,
        content: &[u8],
    ) -> ObjectId {
        let blob = crate::object::Blob::new(content.to_vec());
        let blob_id = repo.store().put_blob(&blob).await.unwrap();
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("f".into(), blob_id, ObjectKind::Blob, 0o644));
        let tree_id = repo.store().put_tree(&tree).await.unwrap();
        let meta = CommitMeta { author: "t".into(), message: "m".into(), timestamp: 0 };
        history::create_commit(repo.store(), tree_id, parent, meta).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_is_unique() {
        let hub = RepoHub::in_memory();
        hub.create("docs").await.unwrap();
        let err = hub.create("docs").await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_bad_names() {
        let hub = RepoHub::in_memory();
        assert!(hub.create("").await.is_err());
        assert!(hub.create("a/b").await.is_err());
        assert!(hub.create("..").await.is_err());
    }

    #[tokio::test]
    async fn test_advance_head_checks_expectation() {
        let hub = RepoHub::in_memory();
        hub.create("r").await.unwrap();
        let repo = hub.get("r").await.unwrap();
        let c1 = seed_commit(&repo, None, b"one").await;

        repo.advance_head(None, c1).await.unwrap();
        assert_eq!(repo.head().await, Some(c1));

        // Stale expectation loses.
        let err = repo.advance_head(None, c1).await.unwrap_err();
        assert!(matches!(err, SyncError::NonFastForward));
    }

    #[tokio::test]
    async fn test_advance_head_rejects_unrelated_history() {
        let hub = RepoHub::in_memory();
        hub.create("r").await.unwrap();
        let repo = hub.get("r").await.unwrap();
        let c1 = seed_commit(&repo, None, b"one").await;
        let c2 = seed_commit(&repo, Some(c1), b"two").await;
        repo.advance_head(None, c1).await.unwrap();
        repo.advance_head(Some(c1), c2).await.unwrap();

        // A root commit with no connection to the hosted history, fully
        // uploaded. Even a correct `expected` must not let it replace c2.
        let rogue = seed_commit(&repo, None, b"rogue").await;
        let err = repo.advance_head(Some(c2), rogue).await.unwrap_err();
        assert!(matches!(err, SyncError::NonFastForward));
        assert_eq!(repo.head().await, Some(c2));
    }

    #[tokio::test]
    async fn test_advance_head_requires_full_closure() {
        let hub = RepoHub::in_memory();
        hub.create("r").await.unwrap();
        let repo = hub.get("r").await.unwrap();

        // Commit referencing a tree that was never uploaded.
        let ghost_tree = ObjectId::from_data(b"missing tree");
        let meta = CommitMeta { author: "t".into(), message: "m".into(), timestamp: 0 };
        let commit = crate::object::Commit::new(ghost_tree, None, meta.author, meta.message, 0);
        let commit_id = repo.store().put_commit(&commit).await.unwrap();

        let err = repo.advance_head(None, commit_id).await.unwrap_err();
        assert!(matches!(err, SyncError::Conflict));
        assert_eq!(repo.head().await, None);
    }

    #[tokio::test]
    async fn test_disk_hub_reloads_state() {
        let dir = tempfile::tempdir().unwrap();

        let head = {
            let hub = RepoHub::open(dir.path()).unwrap();
            hub.create("persist").await.unwrap();
            let repo = hub.get("persist").await.unwrap();
            let c1 = seed_commit(&repo, None, b"hello").await;
            repo.advance_head(None, c1).await.unwrap();
            c1
        };

        let hub = RepoHub::open(dir.path()).unwrap();
        let repo = hub.get("persist").await.unwrap();
        assert_eq!(repo.head().await, Some(head));
        assert!(repo.store().has(head).await.unwrap());
    }
}
