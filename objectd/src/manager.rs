//! The tier manager: owns the ordered set of tiers and the index,
//! mediates placement and lookup, and runs the promoter's hotness-driven
//! migration and eviction passes.

use crate::{
    dref::{DRef, DRefError},
    index::{Index, IndexError, ObjectEntry, PolicyFlags, TierId},
    tier::{OpenMode, Tier, TierError},
    uri::{Uri, UriError},
};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io,
    path::Path,
    sync::{atomic::Ordering, Arc},
    time::{SystemTime, UNIX_EPOCH},
};
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum ManagerError {
    #[error("{0:?} not found")]
    NotFound(String),
    #[error(transparent)]
    Uri(#[from] UriError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Tier(#[from] TierError),
    #[error(transparent)]
    DRef(#[from] DRefError),
    #[error("ephemeral objects may only be placed on a volatile tier")]
    EphemeralPolicyViolation,
    #[error("no tier has room for this object")]
    AllTiersExhausted,
    #[error("open descriptor budget exceeded and no descriptor could be evicted")]
    DescriptorBudgetExceeded,
}

pub type Result<T> = std::result::Result<T, ManagerError>;

/// Tunables for placement, promotion and eviction. Loaded from
/// [`crate::config::ServerConfig`] at the daemon entry point.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub promote_threshold: f64,
    pub demote_threshold: f64,
    pub hotness_halflife_secs: f64,
    pub high_water_mark: f64,
    pub low_water_target: f64,
    pub max_open_descriptors: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            promote_threshold: 0.7,
            demote_threshold: 0.2,
            hotness_halflife_secs: 300.0,
            high_water_mark: 0.9,
            low_water_target: 0.75,
            max_open_descriptors: 4096,
        }
    }
}

fn open_read(path: &Path) -> io::Result<File> {
    OpenOptions::new().read(true).open(path)
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Owns the tiers (sorted fastest-first by weight) and the index; the
/// single object the connection engine dispatches requests through.
pub struct TierManager {
    tiers: Vec<Arc<dyn Tier>>,
    index: Index,
    config: ManagerConfig,
}

impl TierManager {
    pub fn new(mut tiers: Vec<Arc<dyn Tier>>, index_capacity: usize, config: ManagerConfig) -> Self {
        tiers.sort_by_key(|t| t.weight());
        Self {
            tiers,
            index: Index::with_capacity(index_capacity),
            config,
        }
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn tiers(&self) -> &[Arc<dyn Tier>] {
        &self.tiers
    }

    fn tier_by_id(&self, id: TierId) -> Option<Arc<dyn Tier>> {
        self.tiers.iter().find(|t| t.id() == id).cloned()
    }

    /// One-shot startup population: enumerates every tier's mount root
    /// and inserts a discovered `ObjectEntry` for each file not already
    /// in the index. A re-scan after runtime is not supported (a later
    /// scan would not reconcile against already-open descriptors).
    pub fn scan(&self) -> Result<()> {
        debug!(tiers = self.tiers.len(), "starting startup scan");
        for tier in &self.tiers {
            let mut errors = Vec::new();
            tier.enumerate(&mut |scan| {
                let uri = match Uri::parse(path_to_uri(&scan.relative_path)) {
                    Ok(uri) => uri,
                    Err(_) => return,
                };
                if self.index.find(uri.as_str()).is_some() {
                    return;
                }
                let abs_path = tier.mount_root().join(&scan.relative_path);
                let dref = DRef::new(abs_path, open_read);
                let entry = ObjectEntry::new(
                    uri,
                    tier.id(),
                    scan.relative_path,
                    scan.size,
                    scan.mtime,
                    PolicyFlags::empty(),
                    dref,
                );
                if let Err(e) = self.index.insert(entry) {
                    errors.push(e);
                }
            })?;
            // races during startup scan are not expected (single-threaded
            // bring-up); surface the first duplicate as a bug if it happens.
            if let Some(e) = errors.into_iter().next() {
                return Err(e.into());
            }
        }
        debug!(entries = self.index.len(), "startup scan complete");
        Ok(())
    }

    /// Picks a tier for a new object by policy, without regard to current
    /// free space.
    fn preferred_tier(&self, flags: PolicyFlags) -> Result<Arc<dyn Tier>> {
        if flags.contains(PolicyFlags::EPHEMERAL) {
            self.tiers
                .iter()
                .find(|t| {
                    t.placement_roles()
                        .contains(crate::tier::PlacementRoles::EPHEMERAL_TARGET)
                        && t.is_volatile()
                })
                .cloned()
                .ok_or(ManagerError::EphemeralPolicyViolation)
        } else {
            self.tiers
                .iter()
                .find(|t| !t.is_volatile())
                .cloned()
                .ok_or(ManagerError::AllTiersExhausted)
        }
    }

    /// Picks a target tier by policy, first candidate with sufficient
    /// free capacity wins: ephemeral objects are confined to a volatile
    /// tier tagged `EPHEMERAL_TARGET`, everything else goes to the
    /// first non-volatile tier with room.
    pub fn select_tier_for(&self, flags: PolicyFlags, hint_bytes: u64) -> Result<Arc<dyn Tier>> {
        if flags.contains(PolicyFlags::EPHEMERAL) {
            self.tiers
                .iter()
                .find(|t| {
                    t.placement_roles()
                        .contains(crate::tier::PlacementRoles::EPHEMERAL_TARGET)
                        && t.is_volatile()
                        && t.has_space_for(hint_bytes)
                })
                .cloned()
                .ok_or(ManagerError::EphemeralPolicyViolation)
        } else {
            self.tiers
                .iter()
                .filter(|t| !t.is_volatile())
                .find(|t| t.has_space_for(hint_bytes))
                .cloned()
                .ok_or(ManagerError::AllTiersExhausted)
        }
    }

    /// Checks the live index first, then falls back to each tier's
    /// on-disk auxiliary index in fastest-first order, materializing a
    /// new `ObjectEntry` on a hit.
    ///
    /// Returns the crate's top-level error type: this is the boundary
    /// callers that don't need to match on a specific subsystem's error
    /// go through (the connection engine still matches the narrower
    /// `ManagerError` via `crate::error::Error::Manager`).
    pub fn lookup(&self, uri_str: &str) -> crate::error::Result<(Arc<ObjectEntry>, crate::dref::BorrowHandle)> {
        self.lookup_inner(uri_str).map_err(Into::into)
    }

    fn lookup_inner(&self, uri_str: &str) -> Result<(Arc<ObjectEntry>, crate::dref::BorrowHandle)> {
        if let Some(entry) = self.index.find(uri_str) {
            if !entry.dref.is_open() {
                self.admit_new_descriptor()?;
            }
            let borrow = entry.dref.borrow()?;
            entry.record_access();
            return Ok((entry, borrow));
        }

        for tier in &self.tiers {
            if let Some((rel_path, size, mtime)) = tier.aux_lookup(uri_str) {
                let uri = Uri::parse(uri_str)?;
                let abs_path = tier.mount_root().join(&rel_path);
                let dref = DRef::new(abs_path, open_read);
                let entry = ObjectEntry::new(
                    uri,
                    tier.id(),
                    rel_path,
                    size,
                    mtime,
                    PolicyFlags::empty(),
                    dref,
                );
                let entry = match self.index.insert(entry) {
                    Ok(e) => e,
                    Err(IndexError::Duplicate(_)) => self
                        .index
                        .find(uri_str)
                        .ok_or_else(|| ManagerError::NotFound(uri_str.to_owned()))?,
                };
                if !entry.dref.is_open() {
                    self.admit_new_descriptor()?;
                }
                let borrow = entry.dref.borrow()?;
                entry.record_access();
                return Ok((entry, borrow));
            }
        }

        Err(ManagerError::NotFound(uri_str.to_owned()))
    }

    /// Replace semantics: a prior entry for the same URI is deleted
    /// before the new one is placed.
    pub fn create(
        &self,
        uri_str: &str,
        flags: PolicyFlags,
        size_hint: u64,
    ) -> crate::error::Result<(Arc<ObjectEntry>, crate::dref::BorrowHandle)> {
        self.create_inner(uri_str, flags, size_hint).map_err(Into::into)
    }

    fn create_inner(
        &self,
        uri_str: &str,
        flags: PolicyFlags,
        size_hint: u64,
    ) -> Result<(Arc<ObjectEntry>, crate::dref::BorrowHandle)> {
        let uri = Uri::parse(uri_str)?;

        if let Some(prev) = self.index.remove(uri.as_str()) {
            self.delete_entry(&prev);
        }

        let tier = match self.select_tier_for(flags, size_hint) {
            Ok(tier) => tier,
            Err(_) => {
                let candidate = self.preferred_tier(flags)?;
                self.evict_on_tier(&candidate, self.config.low_water_target)?;
                self.select_tier_for(flags, size_hint)?
            }
        };

        self.admit_new_descriptor()?;
        let (rel_path, file) = tier.create(uri.as_str(), size_hint)?;
        let abs_path = tier.mount_root().join(&rel_path);
        let dref = DRef::preopened(abs_path, file, open_read);
        let entry = ObjectEntry::new(
            uri.clone(),
            tier.id(),
            rel_path,
            size_hint,
            now_unix(),
            flags,
            dref,
        );

        // concurrent first-writers can both observe "absent" above; the
        // loser here retries by removing whatever won and inserting its
        // own, matching the documented last-writer-wins race.
        let mut entry = entry;
        let inserted = loop {
            match self.index.insert(entry) {
                Ok(e) => break e,
                Err(IndexError::Duplicate(_)) => {
                    if let Some(winner) = self.index.remove(uri.as_str()) {
                        self.delete_entry(&winner);
                    }
                    self.admit_new_descriptor()?;
                    let (rel_path, file) = tier.create(uri.as_str(), size_hint)?;
                    let abs_path = tier.mount_root().join(&rel_path);
                    entry = ObjectEntry::new(
                        uri.clone(),
                        tier.id(),
                        rel_path,
                        size_hint,
                        now_unix(),
                        flags,
                        DRef::preopened(abs_path, file, open_read),
                    );
                }
            }
        };

        let borrow = inserted.dref.borrow()?;
        Ok((inserted, borrow))
    }

    /// Removes the index entry and unlinks its backing storage.
    pub fn delete(&self, uri_str: &str) -> crate::error::Result<()> {
        self.delete_inner(uri_str).map_err(Into::into)
    }

    fn delete_inner(&self, uri_str: &str) -> Result<()> {
        match self.index.remove(uri_str) {
            Some(entry) => {
                self.delete_entry(&entry);
                Ok(())
            }
            None => Err(ManagerError::NotFound(uri_str.to_owned())),
        }
    }

    fn delete_entry(&self, entry: &Arc<ObjectEntry>) {
        if let Some(tier) = self.tier_by_id(entry.tier_id()) {
            let _ = tier.delete(&entry.storage_path(), entry.size_bytes.load(Ordering::Relaxed));
        }
        entry.dref.request_close();
    }

    /// Copies `entry`'s bytes onto `dest_tier`, atomically swaps the
    /// index's `(tier_id, storage_path)` pair, then unlinks the old file.
    /// A reader holding a borrow taken before the swap keeps reading the
    /// old, still-open descriptor (unlinking an open file does not
    /// invalidate descriptors already open against it).
    fn migrate(&self, entry: &Arc<ObjectEntry>, dest_tier: &Arc<dyn Tier>) -> Result<()> {
        if entry.is_ephemeral() && !dest_tier.is_volatile() {
            return Err(ManagerError::EphemeralPolicyViolation);
        }

        let src_tier = self
            .tier_by_id(entry.tier_id())
            .ok_or(ManagerError::AllTiersExhausted)?;
        if src_tier.id() == dest_tier.id() {
            return Ok(());
        }

        let old_rel_path = entry.storage_path();
        let size = entry.size_bytes.load(Ordering::Relaxed);

        let mut src_file = src_tier.open(&old_rel_path, OpenMode::Read)?;
        let (dest_rel_path, mut dest_file) = dest_tier.create(entry.uri.as_str(), size)?;

        if let Err(e) = io::copy(&mut src_file, &mut dest_file) {
            let _ = dest_tier.delete(&dest_rel_path, size);
            warn!(uri = %entry.uri, error = %e, "migration copy failed, destination cleaned up");
            return Err(TierError::Io(e).into());
        }
        drop(dest_file);

        let dest_abs = dest_tier.mount_root().join(&dest_rel_path);
        entry.replace_location(dest_tier.id(), dest_rel_path);
        entry.dref.repoint(dest_abs);

        let _ = src_tier.delete(&old_rel_path, size);
        debug!(uri = %entry.uri, from = src_tier.id(), to = dest_tier.id(), "migrated");
        Ok(())
    }

    fn faster_tier_with_space(&self, current: &Arc<dyn Tier>, entry: &ObjectEntry) -> Option<Arc<dyn Tier>> {
        let size = entry.size_bytes.load(Ordering::Relaxed);
        self.tiers
            .iter()
            .filter(|t| t.weight() < current.weight())
            .filter(|t| !entry.is_ephemeral() || t.is_volatile())
            .filter(|t| t.has_space_for(size))
            .min_by_key(|t| t.weight())
            .cloned()
    }

    fn slower_tier_with_space(&self, current: &Arc<dyn Tier>, entry: &ObjectEntry) -> Option<Arc<dyn Tier>> {
        let size = entry.size_bytes.load(Ordering::Relaxed);
        self.tiers
            .iter()
            .filter(|t| t.weight() > current.weight())
            .filter(|t| !entry.is_ephemeral() || t.is_volatile())
            .filter(|t| t.has_space_for(size))
            .min_by_key(|t| t.weight())
            .cloned()
    }

    /// LRU eviction among unpinned entries on `tier`, until its
    /// utilization drops to `target` or no candidates remain. Volatile
    /// tiers delete outright; persistent tiers migrate down to a slower
    /// persistent tier when one can accept the entry.
    fn evict_on_tier(&self, tier: &Arc<dyn Tier>, target: f64) -> Result<()> {
        let mut candidates = Vec::new();
        self.index.for_each(|entry| {
            if entry.tier_id() == tier.id() && !entry.is_pinned() {
                candidates.push(entry.clone());
            }
        });
        candidates.sort_by_key(|e| e.last_access_monotonic.load(Ordering::Relaxed));

        for entry in candidates {
            if tier.status().utilization() <= target {
                break;
            }
            if tier.is_volatile() {
                if self.index.remove(entry.uri.as_str()).is_some() {
                    self.delete_entry(&entry);
                }
            } else if let Some(slower) = self.slower_tier_with_space(tier, &entry) {
                let _ = self.migrate(&entry, &slower);
            }
        }
        Ok(())
    }

    /// The promoter's scheduled tick: refresh hotness for every entry,
    /// migrate hot entries up and cold ones down, then sweep tiers over
    /// the high-water mark, and finally enforce the open-descriptor
    /// budget. A single long-lived worker runs this on an interval; an
    /// eviction worker is not run separately (folded into this tick).
    pub fn promoter_tick(&self) {
        debug!("promoter tick");
        let mut entries = Vec::new();
        let now = now_unix_f64();
        self.index.for_each(|entry| {
            let dt = (now - entry.last_access_monotonic.load(Ordering::Relaxed) as f64).max(0.0);
            let access = entry.access_count.load(Ordering::Relaxed) as f64;
            let hotness = 0.7 * (-std::f64::consts::LN_2 * dt / self.config.hotness_halflife_secs).exp()
                + 0.3 * (access / 1000.0).min(1.0);
            entry.set_hotness(hotness);
            entries.push(entry.clone());
        });

        for entry in entries {
            if entry.is_pinned() {
                continue;
            }
            let Some(current) = self.tier_by_id(entry.tier_id()) else {
                continue;
            };
            let hotness = entry.hotness();
            if hotness >= self.config.promote_threshold {
                if let Some(faster) = self.faster_tier_with_space(&current, &entry) {
                    let _ = self.migrate(&entry, &faster);
                }
            } else if hotness <= self.config.demote_threshold {
                if let Some(slower) = self.slower_tier_with_space(&current, &entry) {
                    let _ = self.migrate(&entry, &slower);
                }
            }
        }

        for tier in &self.tiers {
            if tier.status().utilization() >= self.config.high_water_mark {
                let _ = self.evict_on_tier(tier, self.config.low_water_target);
            }
        }

        self.enforce_descriptor_budget();
    }

    /// Synchronous counterpart to `enforce_descriptor_budget`, called on
    /// the lookup/create path right before it would open a new
    /// descriptor. Tries to free a slot by closing the coldest unborrowed
    /// open descriptor; if every open descriptor is currently borrowed,
    /// gives up so the caller can fail this one request with
    /// `INTERNAL_ERROR` instead of exceeding the configured budget.
    fn admit_new_descriptor(&self) -> Result<()> {
        let mut open = Vec::new();
        self.index.for_each(|entry| {
            if entry.dref.is_open() {
                open.push(entry.clone());
            }
        });
        if open.len() < self.config.max_open_descriptors {
            return Ok(());
        }
        open.sort_by_key(|e| e.last_access_monotonic.load(Ordering::Relaxed));
        for entry in &open {
            if entry.dref.borrow_count() == 0 {
                entry.dref.request_close();
                return Ok(());
            }
        }
        Err(ManagerError::DescriptorBudgetExceeded)
    }

    /// Closes open descriptors (not entries) in LRU order among cells
    /// with no outstanding borrow, until the open count is back under
    /// `max_open_descriptors`.
    fn enforce_descriptor_budget(&self) {
        let mut open = Vec::new();
        self.index.for_each(|entry| {
            if entry.dref.is_open() {
                open.push(entry.clone());
            }
        });
        if open.len() <= self.config.max_open_descriptors {
            return;
        }
        open.sort_by_key(|e| e.last_access_monotonic.load(Ordering::Relaxed));
        let excess = open.len() - self.config.max_open_descriptors;
        for entry in open.into_iter().take(excess) {
            if entry.dref.borrow_count() == 0 {
                entry.dref.request_close();
            }
        }
    }
}

fn now_unix_f64() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn path_to_uri(relative_path: &Path) -> String {
    let mut s = relative_path.to_string_lossy().replace('\\', "/");
    if !s.starts_with('/') {
        s.insert(0, '/');
    }
    s
}
