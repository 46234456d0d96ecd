//! Synchronization engine for pit.
//!
//! Implements clone/push/pull against a remote peer reached through the
//! injected `RemoteChannel` abstraction. Every operation is a client-driven
//! request/response sequence with no session state; object transfer is
//! negotiated through `has` digests so shared subtrees are never re-sent,
//! and Head only moves after the full transitive closure of the target
//! commit is confirmed present.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use crate::history::{self, HistoryError};
use crate::object::{ObjectId, ObjectKind};
use crate::repo::{RepoError, Repository};
use crate::store::{ObjectStore, StoreError};
use crate::worktree::{self, WorkTreeError};

/// Server-assigned identity of a created repository.
pub type RepoId = String;

/// Objects per negotiation/transfer round trip.
const TRANSFER_BATCH: usize = 1000;

/// Errors from sync operations.
///
/// `NonFastForward` and `DivergedHistory` are expected, recoverable
/// conditions; everything else aborts the operation, which is always safe
/// to retry because object writes are idempotent and Head advancement is
/// deferred until after verification.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("repository already exists: {0}")]
    AlreadyExists(String),

    #[error("repository not found: {0}")]
    NotFound(String),

    #[error("push rejected: remote head has moved (non fast-forward); pull first, then push again")]
    NonFastForward,

    #[error("local and remote histories have diverged; resolve manually before syncing")]
    DivergedHistory,

    #[error("remote rejected head advance: objects referenced by the new head are missing there")]
    Conflict,

    #[error("repository has no commits to push")]
    NothingToPush,

    #[error("incomplete transfer: {0}; retry the operation")]
    Corrupt(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    History(#[from] HistoryError),

    #[error(transparent)]
    WorkTree(#[from] WorkTreeError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// The opaque request/response channel to a remote peer.
///
/// The remote is always passive: it answers these six requests and never
/// pushes unsolicited data. `advance_head` must be an atomic check-and-set
/// against the server's current head.
#[async_trait]
pub trait RemoteChannel: Send + Sync {
    /// Allocate a new empty repository. Fails with `AlreadyExists`.
    async fn create(&self, repo_name: &str) -> Result<RepoId, SyncError>;

    /// Current head commit, or None for a repository with no commits.
    async fn get_head(&self, repo_name: &str) -> Result<Option<ObjectId>, SyncError>;

    /// Subset of `ids` already present remotely.
    async fn has_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<HashSet<ObjectId>, SyncError>;

    /// Fetch raw object bytes; None marks digests unknown to the remote.
    async fn fetch_objects(
        &self,
        repo_name: &str,
        ids: &[ObjectId],
    ) -> Result<Vec<(ObjectId, Option<Bytes>)>, SyncError>;

    /// Upload raw objects. Idempotent on the remote side.
    async fn push_objects(
        &self,
        repo_name: &str,
        objects: Vec<(ObjectId, Bytes)>,
    ) -> Result<(), SyncError>;

    /// Atomically move the remote head from `expected` to `new_head`.
    async fn advance_head(
        &self,
        repo_name: &str,
        expected: Option<ObjectId>,
        new_head: ObjectId,
    ) -> Result<(), SyncError>;
}

/// Transitive object closure reachable from `tip`: every commit back to
/// `stop_at` (exclusive) or the root, plus each commit's tree and blob
/// references. A shared visited set keeps the traversal linear; it
/// terminates because the reference graph is acyclic and finite.
///
/// Doubles as the presence sweep: every commit and tree is loaded and every
/// blob is `has`-checked, so a missing digest surfaces as `Corrupt` instead
/// of silently truncating the closure.
pub async fn closure<S: ObjectStore + ?Sized>(
    store: &S,
    tip: ObjectId,
    stop_at: Option<ObjectId>,
) -> Result<Vec<ObjectId>, SyncError> {
    let mut visited = HashSet::new();
    let mut out = Vec::new();

    let mut next = Some(tip);
    while let Some(id) = next {
        if Some(id) == stop_at || !visited.insert(id) {
            break;
        }
        let commit = store
            .load_commit(id)
            .await
            .map_err(|e| missing_as_corrupt(e, "commit"))?;
        out.push(id);
        collect_tree(store, commit.tree, &mut visited, &mut out).await?;
        next = commit.parent;
    }
    Ok(out)
}

async fn collect_tree<S: ObjectStore + ?Sized>(
    store: &S,
    root: ObjectId,
    visited: &mut HashSet<ObjectId>,
    out: &mut Vec<ObjectId>,
) -> Result<(), SyncError> {
    let mut stack = Vec::new();
    if visited.insert(root) {
        stack.push(root);
    }
    while let Some(id) = stack.pop() {
        let tree = store
            .load_tree(id)
            .await
            .map_err(|e| missing_as_corrupt(e, "tree"))?;
        out.push(id);
        for entry in tree.iter() {
            if !visited.insert(entry.id) {
                continue;
            }
            match entry.kind {
                ObjectKind::Tree => stack.push(entry.id),
                ObjectKind::Blob => {
                    if !store.has(entry.id).await? {
                        return Err(SyncError::Corrupt(format!("missing blob {}", entry.id)));
                    }
                    out.push(entry.id);
                }
                ObjectKind::Commit => {}
            }
        }
    }
    Ok(())
}

fn missing_as_corrupt(err: StoreError, what: &str) -> SyncError {
    match err {
        StoreError::NotFound(id) => SyncError::Corrupt(format!("missing {} {}", what, id)),
        other => SyncError::Store(other),
    }
}

/// Fetch every object reachable from `tip` that the local store lacks.
///
/// The requester drives a typed frontier walk (commit digests expand into
/// tree and parent digests, trees into entries), checking local presence
/// before each fetch so already-held objects are never re-transferred.
/// Returns the number of objects fetched.
async fn fetch_missing<C, S>(
    channel: &C,
    repo_name: &str,
    store: &S,
    tip: ObjectId,
) -> Result<u64, SyncError>
where
    C: RemoteChannel + ?Sized,
    S: ObjectStore + ?Sized,
{
    let mut fetched = 0u64;
    let mut seen = HashSet::from([tip]);
    let mut pending = VecDeque::from([(tip, ObjectKind::Commit)]);

    while !pending.is_empty() {
        let wave: Vec<(ObjectId, ObjectKind)> = pending.drain(..).collect();

        let mut to_expand = Vec::new();
        let mut to_fetch = Vec::new();
        for (id, kind) in wave {
            if store.has(id).await? {
                to_expand.push((id, kind));
            } else {
                to_fetch.push((id, kind));
            }
        }

        for batch in to_fetch.chunks(TRANSFER_BATCH) {
            let ids: Vec<ObjectId> = batch.iter().map(|(id, _)| *id).collect();
            let mut received: HashMap<ObjectId, Bytes> = HashMap::new();
            for (id, data) in channel.fetch_objects(repo_name, &ids).await? {
                match data {
                    Some(bytes) => {
                        received.insert(id, bytes);
                    }
                    None => {
                        return Err(SyncError::Corrupt(format!(
                            "remote is missing referenced object {}",
                            id
                        )));
                    }
                }
            }
            for (id, kind) in batch {
                let bytes = received.remove(id).ok_or_else(|| {
                    SyncError::Corrupt(format!("remote did not return object {}", id))
                })?;
                let stored = store.put(bytes).await?;
                if stored != *id {
                    return Err(SyncError::Corrupt(format!(
                        "digest mismatch: requested {} received {}",
                        id, stored
                    )));
                }
                fetched += 1;
                to_expand.push((*id, *kind));
            }
        }

        // Locally present objects still expand: an earlier interrupted
        // transfer may have left gaps below them.
        for (id, kind) in to_expand {
            match kind {
                ObjectKind::Commit => {
                    let commit = store.load_commit(id).await?;
                    if seen.insert(commit.tree) {
                        pending.push_back((commit.tree, ObjectKind::Tree));
                    }
                    if let Some(parent) = commit.parent {
                        if seen.insert(parent) {
                            pending.push_back((parent, ObjectKind::Commit));
                        }
                    }
                }
                ObjectKind::Tree => {
                    let tree = store.load_tree(id).await?;
                    for entry in tree.iter() {
                        if seen.insert(entry.id) {
                            pending.push_back((entry.id, entry.kind));
                        }
                    }
                }
                ObjectKind::Blob => {}
            }
        }
    }
    Ok(fetched)
}

/// Result of a clone operation.
#[derive(Debug)]
pub struct CloneOutcome {
    pub head: Option<ObjectId>,
    pub objects_fetched: u64,
}

/// Clone `repo_name` from the remote into `dest`.
///
/// Safe against partial transfer: objects land idempotently and local Head
/// is set only after the whole closure of the fetched head verifies
/// present. Re-running a clone that was interrupted resumes in place.
pub async fn clone_repo<C: RemoteChannel + ?Sized>(
    channel: &C,
    repo_name: &str,
    dest: &Path,
    remote_url: Option<String>,
    author: &str,
) -> Result<(Repository, CloneOutcome), SyncError> {
    let remote_head = channel.get_head(repo_name).await?;

    let mut repo = match Repository::init(dest, repo_name, remote_url, author) {
        Ok(repo) => repo,
        // Resume an interrupted clone rather than failing.
        Err(RepoError::AlreadyInitialized(_)) => Repository::open(dest)?,
        Err(e) => return Err(e.into()),
    };

    let Some(head) = remote_head else {
        tracing::info!(repo = repo_name, "cloned empty repository");
        return Ok((repo, CloneOutcome { head: None, objects_fetched: 0 }));
    };

    let fetched = fetch_missing(channel, repo_name, repo.store(), head).await?;
    closure(repo.store(), head, None).await?;

    let tree = repo.store().load_commit(head).await?.tree;
    worktree::checkout(repo.store(), None, tree, repo.root()).await?;
    repo.set_synced_heads(Some(head), Some(head))?;

    tracing::info!(repo = repo_name, head = %head.short(), fetched, "clone complete");
    Ok((repo, CloneOutcome { head: Some(head), objects_fetched: fetched }))
}

/// Result of a push operation.
#[derive(Debug)]
pub struct PushOutcome {
    pub remote_head: ObjectId,
    pub objects_uploaded: u64,
    pub already_up_to_date: bool,
}

/// Push local history to the remote.
///
/// Uploads exactly the objects the remote reports missing from the local
/// ancestry, then atomically advances the remote head. A remote head that
/// is not an ancestor of the local head fails with `NonFastForward` and
/// nothing is overwritten.
pub async fn push<C: RemoteChannel + ?Sized>(
    channel: &C,
    repo: &mut Repository,
) -> Result<PushOutcome, SyncError> {
    let Some(local_head) = repo.head() else {
        return Err(SyncError::NothingToPush);
    };
    let name = repo.state().repo_name.clone();

    let remote_head = channel.get_head(&name).await?;
    if remote_head == Some(local_head) {
        repo.set_last_remote_head(remote_head)?;
        return Ok(PushOutcome {
            remote_head: local_head,
            objects_uploaded: 0,
            already_up_to_date: true,
        });
    }

    // Fast-forward pre-check: a remote head we don't know, or one outside
    // our ancestry, means the remote has history we lack.
    let stop_at = match remote_head {
        Some(rh) => {
            if !repo.store().has(rh).await?
                || !history::is_ancestor(repo.store(), rh, local_head).await?
            {
                return Err(SyncError::NonFastForward);
            }
            Some(rh)
        }
        None => None,
    };

    let wanted = closure(repo.store(), local_head, stop_at).await?;

    let mut missing = Vec::new();
    for batch in wanted.chunks(TRANSFER_BATCH) {
        let present = channel.has_objects(&name, batch).await?;
        missing.extend(batch.iter().copied().filter(|id| !present.contains(id)));
    }

    let mut uploaded = 0u64;
    for batch in missing.chunks(TRANSFER_BATCH) {
        let mut objects = Vec::with_capacity(batch.len());
        for id in batch {
            objects.push((*id, repo.store().get(*id).await?));
        }
        channel.push_objects(&name, objects).await?;
        uploaded += batch.len() as u64;
    }

    channel.advance_head(&name, remote_head, local_head).await?;
    repo.set_last_remote_head(Some(local_head))?;

    tracing::info!(repo = %name, head = %local_head.short(), uploaded, "push complete");
    Ok(PushOutcome {
        remote_head: local_head,
        objects_uploaded: uploaded,
        already_up_to_date: false,
    })
}

/// Result of a pull operation.
#[derive(Debug)]
pub struct PullOutcome {
    pub head: Option<ObjectId>,
    pub objects_fetched: u64,
    pub fast_forwarded: bool,
    pub already_up_to_date: bool,
}

/// Pull remote history and fast-forward the local head.
///
/// Fails with `DivergedHistory` when neither head is an ancestor of the
/// other; in that case local Head and local commits are left untouched
/// (the fetched objects remain, harmlessly, in the store).
pub async fn pull<C: RemoteChannel + ?Sized>(
    channel: &C,
    repo: &mut Repository,
) -> Result<PullOutcome, SyncError> {
    let name = repo.state().repo_name.clone();
    let local_head = repo.head();

    let Some(remote_head) = channel.get_head(&name).await? else {
        return Ok(PullOutcome {
            head: local_head,
            objects_fetched: 0,
            fast_forwarded: false,
            already_up_to_date: true,
        });
    };

    if local_head == Some(remote_head) {
        repo.set_last_remote_head(Some(remote_head))?;
        return Ok(PullOutcome {
            head: local_head,
            objects_fetched: 0,
            fast_forwarded: false,
            already_up_to_date: true,
        });
    }

    let fetched = fetch_missing(channel, &name, repo.store(), remote_head).await?;
    closure(repo.store(), remote_head, None).await?;

    if let Some(lh) = local_head {
        if history::is_ancestor(repo.store(), remote_head, lh).await? {
            // Local history is ahead of the remote; nothing to move.
            repo.set_last_remote_head(Some(remote_head))?;
            return Ok(PullOutcome {
                head: local_head,
                objects_fetched: fetched,
                fast_forwarded: false,
                already_up_to_date: true,
            });
        }
        if !history::is_ancestor(repo.store(), lh, remote_head).await? {
            return Err(SyncError::DivergedHistory);
        }
    }

    let old_tree = repo.head_tree().await?;
    let new_tree = repo.store().load_commit(remote_head).await?.tree;
    worktree::checkout(repo.store(), old_tree, new_tree, repo.root()).await?;
    repo.set_synced_heads(Some(remote_head), Some(remote_head))?;

    tracing::info!(repo = %name, head = %remote_head.short(), fetched, "pull fast-forwarded");
    Ok(PullOutcome {
        head: Some(remote_head),
        objects_fetched: fetched,
        fast_forwarded: true,
        already_up_to_date: false,
    })
}
