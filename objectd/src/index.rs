//! The concurrent URI → object-location index.
//!
//! The read path (`find`) is lock-free: `scc::HashMap`'s bucket-level
//! design lets readers of unrelated keys proceed without blocking each
//! other or the writer of some other bucket. The value each bucket holds
//! is an `Arc<ObjectEntry>`, so a reader that pulls a clone out of the map
//! keeps the entry (and its `DRef`) alive for as long as it holds that
//! clone, even if a concurrent `remove` unlinks the map's own reference in
//! the meantime. This is the reference-counted reclamation scheme the
//! data model allows as an alternative to hazard pointers or RCU.

use crate::{dref::DRef, uri::Uri};
use bitflags::bitflags;
use scc::HashMap as SccHashMap;
use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicI64, AtomicU64, Ordering},
        Arc,
    },
    time::{SystemTime, UNIX_EPOCH},
};

bitflags! {
    /// Object placement policy bits.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct PolicyFlags: u8 {
        /// Must never be placed on a persistent tier.
        const EPHEMERAL = 0b0000_0001;
        /// Exempt from LRU eviction and promoter-driven demotion.
        const PINNED    = 0b0000_0010;
    }
}

pub type TierId = u16;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum IndexError {
    #[error("duplicate entry for uri {0:?}")]
    Duplicate(Uri),
}

pub type Result<T> = std::result::Result<T, IndexError>;

struct Location {
    tier_id: TierId,
    storage_path: PathBuf,
}

/// One entry per URI present in the index.
///
/// `tier_id` and `storage_path` are protected as a pair behind a single
/// `RwLock` so that a concurrent reader always observes a coherent
/// `(tier_id, storage_path)` pair — never a tier id from after a
/// migration paired with a path from before it.
pub struct ObjectEntry {
    pub uri: Uri,
    location: parking_lot::RwLock<Location>,
    pub size_bytes: AtomicU64,
    pub mtime: AtomicI64,
    pub policy_flags: PolicyFlags,
    pub dref: Arc<DRef>,
    pub access_count: AtomicU64,
    pub last_access_monotonic: AtomicU64,
    hotness_bits: AtomicU64,
}

impl ObjectEntry {
    pub fn new(
        uri: Uri,
        tier_id: TierId,
        storage_path: PathBuf,
        size_bytes: u64,
        mtime: i64,
        policy_flags: PolicyFlags,
        dref: Arc<DRef>,
    ) -> Self {
        Self {
            uri,
            location: parking_lot::RwLock::new(Location {
                tier_id,
                storage_path,
            }),
            size_bytes: AtomicU64::new(size_bytes),
            mtime: AtomicI64::new(mtime),
            policy_flags,
            dref,
            access_count: AtomicU64::new(0),
            last_access_monotonic: AtomicU64::new(now_unix()),
            hotness_bits: AtomicU64::new(0),
        }
    }

    pub fn tier_id(&self) -> TierId {
        self.location.read().tier_id
    }

    pub fn storage_path(&self) -> PathBuf {
        self.location.read().storage_path.clone()
    }

    pub fn location(&self) -> (TierId, PathBuf) {
        let loc = self.location.read();
        (loc.tier_id, loc.storage_path.clone())
    }

    /// Atomically swaps both fields together; used by migration once
    /// the copy has landed on the destination tier.
    pub fn replace_location(&self, tier_id: TierId, storage_path: PathBuf) {
        let mut loc = self.location.write();
        loc.tier_id = tier_id;
        loc.storage_path = storage_path;
    }

    pub fn is_ephemeral(&self) -> bool {
        self.policy_flags.contains(PolicyFlags::EPHEMERAL)
    }

    pub fn is_pinned(&self) -> bool {
        self.policy_flags.contains(PolicyFlags::PINNED)
    }

    pub fn record_access(&self) {
        self.access_count.fetch_add(1, Ordering::Relaxed);
        self.last_access_monotonic
            .store(now_unix(), Ordering::Relaxed);
    }

    pub fn hotness(&self) -> f64 {
        f64::from_bits(self.hotness_bits.load(Ordering::Relaxed))
    }

    pub fn set_hotness(&self, value: f64) {
        self.hotness_bits.store(value.to_bits(), Ordering::Relaxed);
    }
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The concurrent URI index.
pub struct Index {
    table: SccHashMap<String, Arc<ObjectEntry>>,
}

impl Index {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            table: SccHashMap::with_capacity(capacity),
        }
    }

    /// Lock-free lookup. Returns a clone of the entry's `Arc`, pinning it
    /// (and its `DRef`) against reclamation for as long as the caller
    /// holds it.
    pub fn find(&self, uri: &str) -> Option<Arc<ObjectEntry>> {
        self.table.read(uri, |_, v| v.clone())
    }

    /// Writer-serialized. Fails if a live entry with the same URI exists.
    pub fn insert(&self, entry: ObjectEntry) -> Result<Arc<ObjectEntry>> {
        let key = entry.uri.as_str().to_owned();
        let arc = Arc::new(entry);
        match self.table.insert(key, arc.clone()) {
            Ok(()) => Ok(arc),
            Err(_) => Err(IndexError::Duplicate(arc.uri.clone())),
        }
    }

    /// Writer-serialized. Unlinks the entry from the table; the returned
    /// `Arc` defers its destruction past any reader that already holds a
    /// clone.
    pub fn remove(&self, uri: &str) -> Option<Arc<ObjectEntry>> {
        self.table.remove(uri).map(|(_, v)| v)
    }

    pub fn replace_location(&self, uri: &str, tier_id: TierId, storage_path: PathBuf) -> bool {
        match self.find(uri) {
            Some(entry) => {
                entry.replace_location(tier_id, storage_path);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    /// Visits every live entry. Used by the promoter to score hotness and
    /// by descriptor-budget eviction to find LRU candidates. Never held
    /// across I/O by callers: collect what's needed, release, then act.
    pub fn for_each(&self, mut visit: impl FnMut(&Arc<ObjectEntry>)) {
        self.table.scan(|_, v| visit(v));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::uri::Uri;

    fn dummy_dref() -> Arc<DRef> {
        DRef::new(PathBuf::from("/nonexistent"), |p| {
            std::fs::File::open(p)
        })
    }

    fn entry(uri: &str) -> ObjectEntry {
        ObjectEntry::new(
            Uri::parse(uri).unwrap(),
            0,
            PathBuf::from(uri),
            0,
            0,
            PolicyFlags::empty(),
            dummy_dref(),
        )
    }

    #[test]
    fn insert_find_remove() {
        let index = Index::with_capacity(16);
        index.insert(entry("/a")).unwrap();

        let found = index.find("/a").unwrap();
        assert_eq!(found.uri.as_str(), "/a");

        let removed = index.remove("/a").unwrap();
        assert_eq!(removed.uri.as_str(), "/a");
        assert!(index.find("/a").is_none());
    }

    #[test]
    fn duplicate_insert_rejected() {
        let index = Index::with_capacity(16);
        index.insert(entry("/a")).unwrap();
        assert_eq!(
            index.insert(entry("/a")).unwrap_err(),
            IndexError::Duplicate(Uri::parse("/a").unwrap())
        );
    }

    #[test]
    fn replace_location_is_observed_as_a_coherent_pair() {
        let index = Index::with_capacity(16);
        index.insert(entry("/a")).unwrap();

        assert!(index.replace_location("/a", 7, PathBuf::from("/new/path")));
        let found = index.find("/a").unwrap();
        assert_eq!(found.location(), (7, PathBuf::from("/new/path")));
    }

    #[test]
    fn removed_entry_stays_valid_for_a_reader_holding_it() {
        let index = Index::with_capacity(16);
        index.insert(entry("/a")).unwrap();

        let pinned = index.find("/a").unwrap();
        index.remove("/a");

        // the table no longer has it, but our clone is still good.
        assert!(index.find("/a").is_none());
        assert_eq!(pinned.uri.as_str(), "/a");
    }
}
