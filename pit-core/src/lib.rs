//! Pit Core Library
//!
//! Core functionality for pit including:
//! - Object model (Blob, Tree, Commit) with content-addressed identities
//! - Storage abstraction over in-memory and on-disk object stores
//! - Commit history walking and fast-forward checks
//! - Working-copy snapshot, diff and checkout
//! - Local repository state (.pit directory)
//! - Wire format for batched object transfer
//! - Fast-forward sync engine (clone, push, pull)
//! - Server-side repository hub

pub mod object;
pub mod store;
pub mod history;
pub mod worktree;
pub mod repo;
pub mod wire;
pub mod sync;
pub mod hub;

pub use object::{Blob, Commit, ObjectId, ObjectKind, Tree, TreeEntry};
pub use store::{DiskStore, MemoryStore, ObjectStore, StoreError};
pub use history::{Ancestry, CommitMeta, HistoryError};
pub use worktree::{Changeset, WorkTreeError, PIT_DIR};
pub use repo::{CommitOutcome, RepoError, RepoState, Repository};
pub use wire::{WireError, MAX_FRAME_SIZE, WIRE_MAGIC};
pub use sync::{
    CloneOutcome, PullOutcome, PushOutcome, RemoteChannel, RepoId, SyncError,
};
pub use hub::{HostedRepo, LocalChannel, RepoHub};
