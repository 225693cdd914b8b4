//! C2: the tree DAG and its operator.
//!
//! two object kinds live in the DAG: blobs (opaque byte strings) and trees
//! (sorted lists of named entries). both are addressed by the blake3 hash of
//! their canonical bytes and physically stored as ordinary rows in C1 — a
//! tree's "content" is just the CBOR encoding of its entries, posted like any
//! other blob. the `Ref` triple records which interpretation applies.

use std::collections::BTreeMap;

use rusqlite::Transaction;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::{BlobHasher, Hash};
use crate::store::{self, PartitionId};

/// marks an entry's mode as a symlink, in the spirit of S_IFLNK | 0o777.
pub const SYMLINK_MODE: u32 = 0o120777;

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & 0o170000 == 0o120000
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefKind {
    Blob,
    Tree,
}

/// a handle into the DAG: what kind of object, its content id, and its size.
/// two refs are equal iff all three fields are equal — this is the only
/// equality relation callers use for change detection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ref {
    pub kind: RefKind,
    pub content_id: Hash,
    pub size: u64,
}

impl Ref {
    pub fn blob(content_id: Hash, size: u64) -> Self {
        Self {
            kind: RefKind::Blob,
            content_id,
            size,
        }
    }

    pub fn tree(content_id: Hash, size: u64) -> Self {
        Self {
            kind: RefKind::Tree,
            content_id,
            size,
        }
    }

    pub fn is_symlink(&self, mode: u32) -> bool {
        self.kind == RefKind::Blob && is_symlink_mode(mode)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub name: String,
    pub mode: u32,
    pub r#ref: Ref,
}

impl TreeEntry {
    pub fn new(name: impl Into<String>, mode: u32, r#ref: Ref) -> Self {
        Self {
            name: name.into(),
            mode,
            r#ref,
        }
    }
}

/// ordered, validated list of entries; canonical CBOR serialization gives
/// identical logical trees identical content ids regardless of the order
/// entries were constructed in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    entries: Vec<TreeEntry>,
}

impl Tree {
    pub fn new(mut entries: Vec<TreeEntry>) -> Result<Self> {
        for entry in &entries {
            validate_entry_name(&entry.name)?;
        }
        entries.sort_by(|a, b| a.name.as_bytes().cmp(b.name.as_bytes()));
        for window in entries.windows(2) {
            if window[0].name == window[1].name {
                return Err(Error::DuplicateEntryName(window[0].name.clone()));
            }
        }
        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self { entries: vec![] }
    }

    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    pub fn get(&self, name: &str) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.as_bytes().cmp(name.as_bytes()))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn validate_entry_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidEntryName("empty name".to_string()));
    }
    if name.contains('/') {
        return Err(Error::InvalidEntryName(format!("name contains '/': {name}")));
    }
    if name.contains('\0') {
        return Err(Error::InvalidEntryName(format!("name contains null byte: {name}")));
    }
    if name == "." || name == ".." {
        return Err(Error::InvalidEntryName(format!("reserved name: {name}")));
    }
    Ok(())
}

/// a content-addressed sink/source pair. the real implementation posts into
/// a partition via C1; the void implementation (used for deterministic
/// snapshot identity) computes ids without persisting anything.
pub trait BlobStore {
    fn put(&mut self, bytes: &[u8]) -> Result<Hash>;
    fn fetch(&self, id: &Hash) -> Result<Vec<u8>>;
}

/// a `BlobStore` scoped to one partition within an open transaction.
pub struct PartitionStore<'a, 'c> {
    tx: &'a Transaction<'c>,
    pid: PartitionId,
}

impl<'a, 'c> PartitionStore<'a, 'c> {
    pub fn new(tx: &'a Transaction<'c>, pid: PartitionId) -> Self {
        Self { tx, pid }
    }
}

impl BlobStore for PartitionStore<'_, '_> {
    fn put(&mut self, bytes: &[u8]) -> Result<Hash> {
        store::post(self.tx, self.pid, bytes)
    }

    fn fetch(&self, id: &Hash) -> Result<Vec<u8>> {
        store::get(self.tx, self.pid, id)
    }
}

/// discards every byte it's given; used only to compute the content id a
/// real store would have produced, for deterministic snapshot identity.
pub struct VoidStore;

impl BlobStore for VoidStore {
    fn put(&mut self, bytes: &[u8]) -> Result<Hash> {
        Ok(Hash::of(bytes))
    }

    fn fetch(&self, id: &Hash) -> Result<Vec<u8>> {
        Err(Error::NotFound(*id))
    }
}

/// accumulates bytes for a single blob, hashing incrementally as they
/// arrive and posting the buffered content on `finish`. blobs are capped at
/// 2 MiB by C1, so buffering the whole blob before the store write is
/// acceptable; the hash itself is still streamed, not recomputed in one
/// shot over the finished buffer.
pub struct BlobWriter<'s, S: BlobStore> {
    store: &'s mut S,
    buf: Vec<u8>,
    hasher: BlobHasher,
}

impl<'s, S: BlobStore> BlobWriter<'s, S> {
    pub fn new(store: &'s mut S) -> Self {
        Self {
            store,
            buf: Vec::new(),
            hasher: BlobHasher::new(),
        }
    }

    pub fn write(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.buf.extend_from_slice(data);
    }

    pub fn finish(self) -> Result<Ref> {
        let size = self.buf.len() as u64;
        let streamed_id = self.hasher.finalize();
        let id = self.store.put(&self.buf)?;
        debug_assert_eq!(id, streamed_id, "streamed hash must match store's hash");
        Ok(Ref::blob(streamed_id, size))
    }
}

pub fn new_blob_writer<S: BlobStore>(store: &mut S) -> BlobWriter<'_, S> {
    BlobWriter::new(store)
}

pub fn get_blob<S: BlobStore>(store: &S, r: &Ref) -> Result<Vec<u8>> {
    debug_assert_eq!(r.kind, RefKind::Blob);
    store.fetch(&r.content_id)
}

pub fn get_tree<S: BlobStore>(store: &S, r: &Ref) -> Result<Tree> {
    debug_assert_eq!(r.kind, RefKind::Tree);
    let bytes = store.fetch(&r.content_id)?;
    let tree: Tree = ciborium::from_reader(bytes.as_slice())?;
    Ok(tree)
}

pub fn post_tree<S: BlobStore>(store: &mut S, tree: &Tree) -> Result<Ref> {
    let mut bytes = Vec::new();
    ciborium::into_writer(tree, &mut bytes)?;
    let size = bytes.len() as u64;
    let id = store.put(&bytes)?;
    Ok(Ref::tree(id, size))
}

/// build a tree from a `name -> Ref` map (used directly for snapshot
/// top-level-directory composition) and post it. entry mode is fixed at
/// `0o755` since TLD entries stand in for directories or arbitrary roots,
/// not individual files with a separately-tracked mode.
pub fn post_tree_from_map<S: BlobStore>(store: &mut S, map: &BTreeMap<String, Ref>) -> Result<Ref> {
    let entries = map
        .iter()
        .map(|(name, r)| TreeEntry::new(name.clone(), 0o755, *r))
        .collect();
    let tree = Tree::new(entries)?;
    post_tree(store, &tree)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tree_rejects_invalid_names() {
        assert!(Tree::new(vec![TreeEntry::new("", 0o644, Ref::blob(Hash::ZERO, 0))]).is_err());
        assert!(Tree::new(vec![TreeEntry::new("a/b", 0o644, Ref::blob(Hash::ZERO, 0))]).is_err());
        assert!(Tree::new(vec![TreeEntry::new(".", 0o644, Ref::blob(Hash::ZERO, 0))]).is_err());
        assert!(Tree::new(vec![
            TreeEntry::new("dup", 0o644, Ref::blob(Hash::ZERO, 0)),
            TreeEntry::new("dup", 0o644, Ref::blob(Hash::ZERO, 0)),
        ])
        .is_err());
    }

    #[test]
    fn canonical_serialization_ignores_insertion_order() {
        let mut void1 = VoidStore;
        let mut void2 = VoidStore;

        let t1 = Tree::new(vec![
            TreeEntry::new("b", 0o644, Ref::blob(Hash::of(b"b"), 1)),
            TreeEntry::new("a", 0o644, Ref::blob(Hash::of(b"a"), 1)),
        ])
        .unwrap();
        let t2 = Tree::new(vec![
            TreeEntry::new("a", 0o644, Ref::blob(Hash::of(b"a"), 1)),
            TreeEntry::new("b", 0o644, Ref::blob(Hash::of(b"b"), 1)),
        ])
        .unwrap();

        let r1 = post_tree(&mut void1, &t1).unwrap();
        let r2 = post_tree(&mut void2, &t2).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn post_tree_from_map_is_order_independent() {
        let mut void = VoidStore;
        let mut map1 = BTreeMap::new();
        map1.insert("a".to_string(), Ref::blob(Hash::of(b"a"), 1));
        map1.insert("b".to_string(), Ref::blob(Hash::of(b"b"), 1));

        let mut map2 = BTreeMap::new();
        map2.insert("b".to_string(), Ref::blob(Hash::of(b"b"), 1));
        map2.insert("a".to_string(), Ref::blob(Hash::of(b"a"), 1));

        let r1 = post_tree_from_map(&mut void, &map1).unwrap();
        let r2 = post_tree_from_map(&mut void, &map2).unwrap();
        assert_eq!(r1, r2);
    }

    #[test]
    fn void_store_never_errors_on_put_and_never_resolves_fetch() {
        let mut void = VoidStore;
        let r = void.put(b"anything").unwrap();
        assert_eq!(r, Hash::of(b"anything"));
        assert!(void.fetch(&r).is_err());
    }

    #[test]
    fn symlink_mode_detection() {
        assert!(is_symlink_mode(SYMLINK_MODE));
        assert!(!is_symlink_mode(0o100644));
        assert!(!is_symlink_mode(0o040755));
    }
}
