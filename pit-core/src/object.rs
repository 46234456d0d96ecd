//! Core object model for pit.
//!
//! Implements content-addressable storage objects: Blob (file content),
//! Tree (directory snapshot) and Commit (history record). Object identity
//! is the SHA-256 digest of the object's canonical byte form, so identical
//! content always yields the identical id.

use serde::de::Visitor;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

/// Unique identifier for any stored object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectId([u8; 32]);

impl ObjectId {
    /// Create a new ObjectId from raw bytes.
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Compute ObjectId from data.
    pub fn from_data(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        Self(hash.into())
    }

    /// Convert to hexadecimal string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse from hexadecimal string.
    pub fn from_hex(hex_str: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(hex_str)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Get raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Abbreviated hex form for log output.
    pub fn short(&self) -> String {
        self.to_hex()[..12].to_string()
    }
}

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// Hex in JSON state files and API bodies, raw bytes in the bincode object
// encoding so digests stay compact inside trees and commits.
impl Serialize for ObjectId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if serializer.is_human_readable() {
            serializer.serialize_str(&self.to_hex())
        } else {
            serializer.serialize_bytes(&self.0)
        }
    }
}

struct ObjectIdVisitor;

impl<'de> Visitor<'de> for ObjectIdVisitor {
    type Value = ObjectId;

    fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("a 64-character hex string or 32 raw bytes")
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<ObjectId, E> {
        ObjectId::from_hex(v).map_err(|e| E::custom(format!("invalid object id: {}", e)))
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<ObjectId, E> {
        if v.len() != 32 {
            return Err(E::custom(format!("invalid object id length: {}", v.len())));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(v);
        Ok(ObjectId(arr))
    }
}

impl<'de> Deserialize<'de> for ObjectId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        if deserializer.is_human_readable() {
            deserializer.deserialize_str(ObjectIdVisitor)
        } else {
            deserializer.deserialize_bytes(ObjectIdVisitor)
        }
    }
}

/// Object type discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Blob,
    Tree,
    Commit,
}

/// File content object.
///
/// A blob is nothing but bytes; the executable bit lives on the referencing
/// tree entry so two files with equal content share one blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    data: Vec<u8>,
}

impl Blob {
    /// Create a new blob from raw content.
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Compute the object ID (digest of the raw content).
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(&self.data)
    }

    /// Raw content bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Content length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Consume the blob, returning its bytes.
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Directory tree entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    /// Name of the entry (a single path segment).
    pub name: String,
    /// Object ID (points to a Blob or a nested Tree).
    pub id: ObjectId,
    /// Entry type.
    pub kind: ObjectKind,
    /// File permissions (Unix mode).
    pub mode: u32,
}

impl TreeEntry {
    pub fn new(name: String, id: ObjectId, kind: ObjectKind, mode: u32) -> Self {
        Self { name, id, kind, mode }
    }

    /// Whether the entry carries the executable bit.
    pub fn is_executable(&self) -> bool {
        self.mode & 0o111 != 0
    }
}

/// Directory object.
///
/// Entries live in a BTreeMap so serialization is always name-sorted;
/// identical directory contents hash identically regardless of the order
/// the file system enumerated them in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: BTreeMap<String, TreeEntry>,
}

impl Tree {
    /// Create an empty tree.
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Add or replace an entry.
    pub fn insert(&mut self, entry: TreeEntry) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Remove an entry.
    pub fn remove(&mut self, name: &str) -> Option<TreeEntry> {
        self.entries.remove(name)
    }

    /// Get an entry by name.
    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries.get(name)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over entries in canonical (name) order.
    pub fn iter(&self) -> impl Iterator<Item = &TreeEntry> {
        self.entries.values()
    }

    /// Serialize to the canonical binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from the canonical binary form.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Compute the object ID (digest of the canonical serialized form).
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(&bincode::serialize(self).unwrap_or_default())
    }
}

/// Commit object.
///
/// Each commit references one tree snapshot and at most one parent commit,
/// forming a singly-linked, acyclic history that terminates at a parentless
/// root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    /// Tree snapshot for this commit.
    pub tree: ObjectId,
    /// Parent commit (None for the root commit).
    pub parent: Option<ObjectId>,
    /// Author name.
    pub author: String,
    /// Commit message.
    pub message: String,
    /// Commit timestamp (Unix seconds).
    pub timestamp: i64,
}

impl Commit {
    pub fn new(
        tree: ObjectId,
        parent: Option<ObjectId>,
        author: String,
        message: String,
        timestamp: i64,
    ) -> Self {
        Self { tree, parent, author, message, timestamp }
    }

    /// Serialize to the canonical binary form.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    /// Deserialize from the canonical binary form.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }

    /// Compute the object ID (digest of the canonical serialized form).
    pub fn id(&self) -> ObjectId {
        ObjectId::from_data(&bincode::serialize(self).unwrap_or_default())
    }

    /// Check if this is a root commit (no parent).
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_id_hex_roundtrip() {
        let id = ObjectId::new([42u8; 32]);
        let hex = id.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(ObjectId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn test_object_id_rejects_bad_hex() {
        assert!(ObjectId::from_hex("abcd").is_err());
        assert!(ObjectId::from_hex("zz").is_err());
    }

    #[test]
    fn test_object_id_json_is_hex() {
        let id = ObjectId::from_data(b"x");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_hex()));
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_blob_identity_is_content_digest() {
        let blob = Blob::new(b"hello world".to_vec());
        assert_eq!(blob.id(), ObjectId::from_data(b"hello world"));
        // Same content, same id.
        assert_eq!(blob.id(), Blob::new(b"hello world".to_vec()).id());
    }

    #[test]
    fn test_tree_canonical_order() {
        let blob_a = ObjectId::from_data(b"a");
        let blob_b = ObjectId::from_data(b"b");

        let mut t1 = Tree::new();
        t1.insert(TreeEntry::new("a.txt".into(), blob_a, ObjectKind::Blob, 0o644));
        t1.insert(TreeEntry::new("b.txt".into(), blob_b, ObjectKind::Blob, 0o644));

        let mut t2 = Tree::new();
        t2.insert(TreeEntry::new("b.txt".into(), blob_b, ObjectKind::Blob, 0o644));
        t2.insert(TreeEntry::new("a.txt".into(), blob_a, ObjectKind::Blob, 0o644));

        assert_eq!(t1.id(), t2.id());
    }

    #[test]
    fn test_tree_mode_changes_identity() {
        let blob = ObjectId::from_data(b"a");
        let mut t1 = Tree::new();
        t1.insert(TreeEntry::new("run.sh".into(), blob, ObjectKind::Blob, 0o644));
        let mut t2 = Tree::new();
        t2.insert(TreeEntry::new("run.sh".into(), blob, ObjectKind::Blob, 0o755));
        assert_ne!(t1.id(), t2.id());
    }

    #[test]
    fn test_tree_roundtrip() {
        let mut tree = Tree::new();
        tree.insert(TreeEntry::new(
            "src".into(),
            ObjectId::from_data(b"subtree"),
            ObjectKind::Tree,
            0o755,
        ));
        let bytes = tree.to_bytes().unwrap();
        let back = Tree::from_bytes(&bytes).unwrap();
        assert_eq!(back.id(), tree.id());
        assert_eq!(back.get("src").unwrap().kind, ObjectKind::Tree);
    }

    #[test]
    fn test_commit_roundtrip() {
        let commit = Commit::new(
            ObjectId::from_data(b"tree"),
            Some(ObjectId::from_data(b"parent")),
            "alice".into(),
            "add feature".into(),
            1_700_000_000,
        );
        let bytes = commit.to_bytes().unwrap();
        let back = Commit::from_bytes(&bytes).unwrap();
        assert_eq!(back.id(), commit.id());
        assert!(!back.is_root());
    }

    #[test]
    fn test_commit_identity_covers_metadata() {
        let tree = ObjectId::from_data(b"tree");
        let c1 = Commit::new(tree, None, "alice".into(), "one".into(), 1);
        let c2 = Commit::new(tree, None, "alice".into(), "two".into(), 1);
        assert_ne!(c1.id(), c2.id());
        assert!(c1.is_root());
    }
}
