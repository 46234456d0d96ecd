//! Working-copy tracking for pit.
//!
//! The tracker is the only component that touches the live file system. It
//! owns no persistent state: snapshots and diffs are pure functions of the
//! directory contents plus a tree already in the object store.

use futures::future::BoxFuture;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::object::{Blob, ObjectId, ObjectKind, Tree, TreeEntry};
use crate::store::{ObjectStore, StoreError};

/// Name of the repository marker directory.
pub const PIT_DIR: &str = ".pit";

/// Errors from working-copy operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkTreeError {
    #[error("not inside a pit repository (no {PIT_DIR} directory found above {0})")]
    NotARepository(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Structural difference between a tree snapshot and the working directory.
///
/// Paths are relative, `/`-separated, in sorted order. Ephemeral; computed
/// on demand and never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }
}

/// Walk upward from `start` looking for the repository marker.
///
/// Returns the repository root, or `NotARepository` when no ancestor
/// directory carries a `.pit` marker.
pub fn detect_repository(start: &Path) -> Result<PathBuf, WorkTreeError> {
    let mut current = start;
    loop {
        if current.join(PIT_DIR).is_dir() {
            return Ok(current.to_path_buf());
        }
        match current.parent() {
            Some(parent) => current = parent,
            None => return Err(WorkTreeError::NotARepository(start.to_path_buf())),
        }
    }
}

#[cfg(unix)]
fn entry_mode(path: &Path) -> Result<u32, WorkTreeError> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::metadata(path)?.permissions();
    Ok(if perms.mode() & 0o111 != 0 { 0o755 } else { 0o644 })
}

#[cfg(not(unix))]
fn entry_mode(_path: &Path) -> Result<u32, WorkTreeError> {
    Ok(0o644)
}

/// Snapshot the working directory into the object store, bottom-up, and
/// return the root tree's digest. Deterministic for identical content; the
/// `.pit` marker directory is never captured.
pub async fn snapshot<S: ObjectStore + ?Sized>(
    store: &S,
    root: &Path,
) -> Result<ObjectId, WorkTreeError> {
    snapshot_dir(store, root).await
}

fn snapshot_dir<'a, S: ObjectStore + ?Sized>(
    store: &'a S,
    dir: &'a Path,
) -> BoxFuture<'a, Result<ObjectId, WorkTreeError>> {
    Box::pin(async move {
        let mut tree = Tree::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == PIT_DIR {
                continue;
            }
            let path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let id = snapshot_dir(store, &path).await?;
                tree.insert(TreeEntry::new(name, id, ObjectKind::Tree, 0o755));
            } else if file_type.is_file() {
                let data = std::fs::read(&path)?;
                let mode = entry_mode(&path)?;
                let id = store.put_blob(&Blob::new(data)).await?;
                tree.insert(TreeEntry::new(name, id, ObjectKind::Blob, mode));
            }
            // Symlinks and special files are not tracked.
        }
        Ok(store.put_tree(&tree).await?)
    })
}

/// Flatten a stored tree into `relative path -> (blob id, mode)`.
pub async fn flatten_tree<S: ObjectStore + ?Sized>(
    store: &S,
    tree_id: ObjectId,
) -> Result<BTreeMap<String, (ObjectId, u32)>, WorkTreeError> {
    let mut files = BTreeMap::new();
    let mut stack = vec![(String::new(), tree_id)];
    while let Some((prefix, id)) = stack.pop() {
        let tree = store.load_tree(id).await?;
        for entry in tree.iter() {
            let path = if prefix.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", prefix, entry.name)
            };
            match entry.kind {
                ObjectKind::Blob => {
                    files.insert(path, (entry.id, entry.mode));
                }
                ObjectKind::Tree => stack.push((path, entry.id)),
                ObjectKind::Commit => {}
            }
        }
    }
    Ok(files)
}

/// Hash the working directory's files without writing to the store.
fn working_files(
    root: &Path,
    dir: &Path,
    files: &mut BTreeMap<String, (ObjectId, u32)>,
) -> Result<(), WorkTreeError> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name == PIT_DIR {
            continue;
        }
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            working_files(root, &path, files)?;
        } else if file_type.is_file() {
            let data = std::fs::read(&path)?;
            let mode = entry_mode(&path)?;
            let rel = path
                .strip_prefix(root)
                .expect("walk stays under root")
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            files.insert(rel, (ObjectId::from_data(&data), mode));
        }
    }
    Ok(())
}

/// Compare the working directory against a tree snapshot.
///
/// `tree` is the Head commit's tree, or None for a repository with no
/// commits yet (everything shows as added).
pub async fn diff<S: ObjectStore + ?Sized>(
    store: &S,
    tree: Option<ObjectId>,
    root: &Path,
) -> Result<Changeset, WorkTreeError> {
    let base = match tree {
        Some(id) => flatten_tree(store, id).await?,
        None => BTreeMap::new(),
    };
    let mut work = BTreeMap::new();
    working_files(root, root, &mut work)?;

    let mut changes = Changeset::default();
    for (path, state) in &work {
        match base.get(path) {
            None => changes.added.push(path.clone()),
            Some(old) if old != state => changes.modified.push(path.clone()),
            Some(_) => {}
        }
    }
    for path in base.keys() {
        if !work.contains_key(path) {
            changes.removed.push(path.clone());
        }
    }
    Ok(changes)
}

#[cfg(unix)]
fn apply_mode(path: &Path, mode: u32) -> Result<(), WorkTreeError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    Ok(())
}

#[cfg(not(unix))]
fn apply_mode(_path: &Path, _mode: u32) -> Result<(), WorkTreeError> {
    Ok(())
}

/// Materialize a tree into the working directory.
///
/// Tracked paths from `old_tree` that are absent from `new_tree` are
/// removed; untracked files are left alone.
pub async fn checkout<S: ObjectStore + ?Sized>(
    store: &S,
    old_tree: Option<ObjectId>,
    new_tree: ObjectId,
    root: &Path,
) -> Result<(), WorkTreeError> {
    let new_files = flatten_tree(store, new_tree).await?;
    let old_files = match old_tree {
        Some(id) => flatten_tree(store, id).await?,
        None => BTreeMap::new(),
    };

    for path in old_files.keys() {
        if !new_files.contains_key(path) {
            let target = root.join(path);
            if target.is_file() {
                std::fs::remove_file(&target)?;
            }
        }
    }

    for (path, (id, mode)) in &new_files {
        let target = root.join(path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let data = store.get(*id).await?;
        std::fs::write(&target, &data)?;
        apply_mode(&target, *mode)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::fs;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[tokio::test]
    async fn test_snapshot_is_deterministic() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        write(dir.path(), "sub/b.txt", "beta");

        let t1 = snapshot(&store, dir.path()).await.unwrap();
        let t2 = snapshot(&store, dir.path()).await.unwrap();
        assert_eq!(t1, t2);

        // Identical content in a different directory hashes identically.
        let other = tempfile::tempdir().unwrap();
        write(other.path(), "sub/b.txt", "beta");
        write(other.path(), "a.txt", "alpha");
        let t3 = snapshot(&store, other.path()).await.unwrap();
        assert_eq!(t1, t3);
    }

    #[tokio::test]
    async fn test_snapshot_skips_marker_dir() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "alpha");
        let plain = snapshot(&store, dir.path()).await.unwrap();

        write(dir.path(), ".pit/state.json", "{}");
        let with_marker = snapshot(&store, dir.path()).await.unwrap();
        assert_eq!(plain, with_marker);
    }

    #[tokio::test]
    async fn test_diff_classifies_changes() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "keep.txt", "same");
        write(dir.path(), "edit.txt", "before");
        write(dir.path(), "gone.txt", "bye");
        let base = snapshot(&store, dir.path()).await.unwrap();

        write(dir.path(), "edit.txt", "after");
        write(dir.path(), "new.txt", "hello");
        fs::remove_file(dir.path().join("gone.txt")).unwrap();

        let changes = diff(&store, Some(base), dir.path()).await.unwrap();
        assert_eq!(changes.added, vec!["new.txt"]);
        assert_eq!(changes.modified, vec!["edit.txt"]);
        assert_eq!(changes.removed, vec!["gone.txt"]);
    }

    #[tokio::test]
    async fn test_diff_clean_tree_is_empty() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "nested/deep/file.txt", "content");
        let base = snapshot(&store, dir.path()).await.unwrap();

        let changes = diff(&store, Some(base), dir.path()).await.unwrap();
        assert!(changes.is_empty());
    }

    #[tokio::test]
    async fn test_diff_without_base_reports_all_added() {
        let store = MemoryStore::new();
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "a.txt", "x");
        write(dir.path(), "b/c.txt", "y");

        let changes = diff(&store, None, dir.path()).await.unwrap();
        assert_eq!(changes.added, vec!["a.txt", "b/c.txt"]);
        assert!(changes.modified.is_empty() && changes.removed.is_empty());
    }

    #[test]
    fn test_detect_repository() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".pit")).unwrap();
        let nested = dir.path().join("src/deep");
        fs::create_dir_all(&nested).unwrap();

        let found = detect_repository(&nested).unwrap();
        assert_eq!(found, dir.path());
    }

    #[test]
    fn test_detect_repository_missing() {
        let dir = tempfile::tempdir().unwrap();
        let err = detect_repository(dir.path()).unwrap_err();
        assert!(matches!(err, WorkTreeError::NotARepository(_)));
    }

    #[tokio::test]
    async fn test_checkout_materializes_and_removes() {
        let store = MemoryStore::new();
        let src = tempfile::tempdir().unwrap();
        write(src.path(), "a.txt", "alpha");
        write(src.path(), "sub/b.txt", "beta");
        let old = snapshot(&store, src.path()).await.unwrap();

        fs::remove_file(src.path().join("a.txt")).unwrap();
        write(src.path(), "sub/c.txt", "gamma");
        let new = snapshot(&store, src.path()).await.unwrap();

        // Replay old -> new in a fresh directory.
        let dest = tempfile::tempdir().unwrap();
        checkout(&store, None, old, dest.path()).await.unwrap();
        assert_eq!(fs::read_to_string(dest.path().join("a.txt")).unwrap(), "alpha");

        checkout(&store, Some(old), new, dest.path()).await.unwrap();
        assert!(!dest.path().join("a.txt").exists());
        assert_eq!(fs::read_to_string(dest.path().join("sub/b.txt")).unwrap(), "beta");
        assert_eq!(fs::read_to_string(dest.path().join("sub/c.txt")).unwrap(), "gamma");
    }
}
