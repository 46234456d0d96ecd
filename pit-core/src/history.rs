//! Commit history for pit.
//!
//! History is an append-only chain of commits linked by parent digests.
//! Nothing here mutates the Head pointer; that belongs to the repository
//! state, which advances Head only after a commit (or a verified transfer)
//! has landed in the store.

use crate::object::{Commit, ObjectId};
use crate::store::{ObjectStore, StoreError};

/// Errors from history operations.
#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    /// A new commit named a parent that is not present in the store.
    #[error("detached parent: commit {0} is not present in the object store")]
    DetachedParent(ObjectId),

    /// An ancestry walk hit a commit whose record is missing locally,
    /// indicating corruption or an incomplete transfer.
    #[error("broken commit chain: {0} is referenced but missing")]
    BrokenChain(ObjectId),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Metadata for a new commit.
#[derive(Debug, Clone)]
pub struct CommitMeta {
    pub author: String,
    pub message: String,
    pub timestamp: i64,
}

/// Append a new commit referencing `tree` with an optional `parent`.
///
/// Fails with `DetachedParent` when the parent digest is not present in the
/// store. Returns the new commit's digest; the caller advances Head.
pub async fn create_commit<S: ObjectStore + ?Sized>(
    store: &S,
    tree: ObjectId,
    parent: Option<ObjectId>,
    meta: CommitMeta,
) -> Result<ObjectId, HistoryError> {
    if let Some(parent_id) = parent {
        if !store.has(parent_id).await? {
            return Err(HistoryError::DetachedParent(parent_id));
        }
    }

    let commit = Commit::new(tree, parent, meta.author, meta.message, meta.timestamp);
    Ok(store.put_commit(&commit).await?)
}

/// Lazy walk over a commit's ancestor chain, newest first.
///
/// Restartable: construct from any digest to resume from there. Terminates
/// at the root commit; a missing link surfaces as `BrokenChain`.
pub struct Ancestry<'a, S: ObjectStore + ?Sized> {
    store: &'a S,
    next: Option<ObjectId>,
}

impl<'a, S: ObjectStore + ?Sized> Ancestry<'a, S> {
    pub fn new(store: &'a S, tip: ObjectId) -> Self {
        Self { store, next: Some(tip) }
    }

    /// Yield the next commit digest in the chain, or None past the root.
    pub async fn next(&mut self) -> Result<Option<(ObjectId, Commit)>, HistoryError> {
        let Some(id) = self.next else {
            return Ok(None);
        };
        let commit = match self.store.load_commit(id).await {
            Ok(c) => c,
            Err(StoreError::NotFound(_)) => return Err(HistoryError::BrokenChain(id)),
            Err(e) => return Err(e.into()),
        };
        self.next = commit.parent;
        Ok(Some((id, commit)))
    }
}

/// Collect the full ancestor chain of `tip`, newest first (including `tip`).
pub async fn ancestors<S: ObjectStore + ?Sized>(
    store: &S,
    tip: ObjectId,
) -> Result<Vec<ObjectId>, HistoryError> {
    let mut walk = Ancestry::new(store, tip);
    let mut out = Vec::new();
    while let Some((id, _)) = walk.next().await? {
        out.push(id);
    }
    Ok(out)
}

/// True when `a` appears in the ancestor chain of `b` (or equals `b`).
///
/// Used to decide fast-forward eligibility: Head may move to a commit only
/// when the current Head is an ancestor of it.
pub async fn is_ancestor<S: ObjectStore + ?Sized>(
    store: &S,
    a: ObjectId,
    b: ObjectId,
) -> Result<bool, HistoryError> {
    let mut walk = Ancestry::new(store, b);
    while let Some((id, _)) = walk.next().await? {
        if id == a {
            return Ok(true);
        }
    }
    Ok(false)
}
