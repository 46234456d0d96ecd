//! Object storage layer for pit.
//!
//! Content-addressed, immutable storage: an object is keyed by the digest of
//! its bytes, so writes are idempotent and any writer may be the first. Two
//! backends are provided: an in-memory store (server hosting, tests) and a
//! disk store laid out as a fan-out object directory.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::object::{Blob, Commit, ObjectId, Tree};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(ObjectId),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("object decode error: {0}")]
    Decode(String),
}

/// Generic content-addressed object store.
///
/// `put` is deterministic and idempotent: storing identical content twice is
/// a no-op that returns the same digest both times.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Get object data by ID. Fails with `NotFound` if the digest is unknown.
    async fn get(&self, id: ObjectId) -> Result<Bytes>;

    /// Check existence without transferring content.
    async fn has(&self, id: ObjectId) -> Result<bool>;

    /// Store data keyed by its content digest, returning the digest.
    async fn put(&self, data: Bytes) -> Result<ObjectId>;

    /// Store a blob (raw content bytes).
    async fn put_blob(&self, blob: &Blob) -> Result<ObjectId> {
        self.put(Bytes::copy_from_slice(blob.data())).await
    }

    /// Store a tree in its canonical serialized form.
    async fn put_tree(&self, tree: &Tree) -> Result<ObjectId> {
        let bytes = tree.to_bytes().map_err(|e| StoreError::Decode(e.to_string()))?;
        self.put(Bytes::from(bytes)).await
    }

    /// Store a commit in its canonical serialized form.
    async fn put_commit(&self, commit: &Commit) -> Result<ObjectId> {
        let bytes = commit.to_bytes().map_err(|e| StoreError::Decode(e.to_string()))?;
        self.put(Bytes::from(bytes)).await
    }

    /// Load and decode a tree.
    async fn load_tree(&self, id: ObjectId) -> Result<Tree> {
        let bytes = self.get(id).await?;
        Tree::from_bytes(&bytes).map_err(|e| StoreError::Decode(format!("tree {}: {}", id, e)))
    }

    /// Load and decode a commit.
    async fn load_commit(&self, id: ObjectId) -> Result<Commit> {
        let bytes = self.get(id).await?;
        Commit::from_bytes(&bytes)
            .map_err(|e| StoreError::Decode(format!("commit {}: {}", id, e)))
    }
}

/// In-memory object store.
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<ObjectId, Bytes>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self { objects: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Number of stored objects.
    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for MemoryStore {
    fn clone(&self) -> Self {
        Self { objects: self.objects.clone() }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, id: ObjectId) -> Result<Bytes> {
        self.objects
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NotFound(id))
    }

    async fn has(&self, id: ObjectId) -> Result<bool> {
        Ok(self.objects.read().await.contains_key(&id))
    }

    async fn put(&self, data: Bytes) -> Result<ObjectId> {
        let id = ObjectId::from_data(&data);
        self.objects.write().await.entry(id).or_insert(data);
        Ok(id)
    }
}

/// Disk-backed object store.
///
/// Objects are files under `<root>/<first 2 hex chars>/<remaining 62>`.
/// Writes land in a temp file and are renamed into place, so a half-written
/// object never becomes visible and concurrent writers of the same content
/// settle on first-writer-wins.
#[derive(Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    /// Open a store rooted at `root`, creating the directory if needed.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        Ok(Self { root: root.to_path_buf() })
    }

    /// Path of the object file for a digest.
    fn object_path(&self, id: ObjectId) -> PathBuf {
        let hex = id.to_hex();
        self.root.join(&hex[..2]).join(&hex[2..])
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl ObjectStore for DiskStore {
    async fn get(&self, id: ObjectId) -> Result<Bytes> {
        let path = self.object_path(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StoreError::NotFound(id)),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn has(&self, id: ObjectId) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.object_path(id)).await?)
    }

    async fn put(&self, data: Bytes) -> Result<ObjectId> {
        let id = ObjectId::from_data(&data);
        let path = self.object_path(id);

        // Content never changes after first write; an existing file is the
        // same bytes already.
        if tokio::fs::try_exists(&path).await? {
            return Ok(id);
        }

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp = path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;

        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_put_get() {
        let store = MemoryStore::new();
        let data = Bytes::from_static(b"hello world");
        let id = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), data);
        assert!(store.has(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_put_is_idempotent() {
        let store = MemoryStore::new();
        let id1 = store.put(Bytes::from_static(b"same bytes")).await.unwrap();
        let id2 = store.put(Bytes::from_static(b"same bytes")).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_memory_store_missing_object() {
        let store = MemoryStore::new();
        let id = ObjectId::from_data(b"never stored");
        assert!(!store.has(id).await.unwrap());
        assert!(matches!(store.get(id).await, Err(StoreError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_disk_store_put_get() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let data = Bytes::from_static(b"persistent data");
        let id = store.put(data.clone()).await.unwrap();
        assert_eq!(store.get(id).await.unwrap(), data);

        // Reopen and read back.
        let store2 = DiskStore::open(dir.path()).unwrap();
        assert_eq!(store2.get(id).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_disk_store_fanout_layout() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let id = store.put(Bytes::from_static(b"layout")).await.unwrap();
        let hex = id.to_hex();
        assert!(dir.path().join(&hex[..2]).join(&hex[2..]).is_file());
    }

    #[tokio::test]
    async fn test_disk_store_rewrite_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::open(dir.path()).unwrap();
        let id1 = store.put(Bytes::from_static(b"dup")).await.unwrap();
        let id2 = store.put(Bytes::from_static(b"dup")).await.unwrap();
        assert_eq!(id1, id2);
        assert_eq!(store.get(id1).await.unwrap(), Bytes::from_static(b"dup"));
    }

    #[tokio::test]
    async fn test_typed_helpers_roundtrip() {
        use crate::object::{ObjectKind, TreeEntry};

        let store = MemoryStore::new();
        let blob = Blob::new(b"content".to_vec());
        let blob_id = store.put_blob(&blob).await.unwrap();
        assert_eq!(blob_id, blob.id());

        let mut tree = Tree::new();
        tree.insert(TreeEntry::new("f".into(), blob_id, ObjectKind::Blob, 0o644));
        let tree_id = store.put_tree(&tree).await.unwrap();
        assert_eq!(tree_id, tree.id());
        assert_eq!(store.load_tree(tree_id).await.unwrap(), tree);

        let commit = Commit::new(tree_id, None, "a".into(), "m".into(), 0);
        let commit_id = store.put_commit(&commit).await.unwrap();
        assert_eq!(store.load_commit(commit_id).await.unwrap(), commit);
    }
}
