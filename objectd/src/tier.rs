//! A tier is one filesystem-backed storage region with a capacity limit
//! and a persistence policy. The [`Tier`] trait is the seam the manager
//! operates against; `objectd-backends` provides the concrete,
//! directory-mounted implementation.

use bitflags::bitflags;
use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
};

use crate::index::TierId;

#[derive(thiserror::Error, Debug)]
pub enum TierError {
    #[error("tier {0} has insufficient free capacity")]
    NoSpace(TierId),
    #[error("object not found at {0}")]
    NotFound(PathBuf),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, TierError>;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Policy {
    Persistent,
    Volatile,
}

bitflags! {
    /// What role a tier plays in placement decisions.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct PlacementRoles: u8 {
        const DEFAULT_TARGET   = 0b0000_0001;
        const EPHEMERAL_TARGET = 0b0000_0010;
        const PROMOTION_CACHE  = 0b0000_0100;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct TierStatus {
    pub capacity_bytes: u64,
    pub used_bytes: u64,
    pub object_count: u64,
}

impl TierStatus {
    pub fn utilization(&self) -> f64 {
        if self.capacity_bytes == 0 {
            return 1.0;
        }
        self.used_bytes as f64 / self.capacity_bytes as f64
    }

    pub fn free_bytes(&self) -> u64 {
        self.capacity_bytes.saturating_sub(self.used_bytes)
    }
}

/// A `(relative_path, size, mtime)` triple produced by a startup scan,
/// one per object file discovered under a tier's mount root.
pub struct ScanEntry {
    pub relative_path: PathBuf,
    pub size: u64,
    pub mtime: i64,
}

/// A mount-rooted directory with capacity accounting and a persistence
/// policy. Capacity accounting is best-effort: `used_bytes` is the sum of
/// sizes of entries the tier believes it owns, corrected on create/delete,
/// not a filesystem free-space query.
pub trait Tier: Send + Sync {
    fn id(&self) -> TierId;
    fn name(&self) -> &str;
    fn mount_root(&self) -> &Path;
    fn policy(&self) -> Policy;
    fn placement_roles(&self) -> PlacementRoles;

    /// Lower is faster; placement and promotion order tiers by this.
    fn weight(&self) -> u32;

    /// Deterministically derives a storage path for `uri`, creates the
    /// file exclusively, and reserves `hint_bytes` against capacity.
    /// Refuses with `NoSpace` if `used_bytes + hint_bytes > capacity_bytes`.
    fn create(&self, uri: &str, hint_bytes: u64) -> Result<(PathBuf, File)>;

    /// Opens an existing object at a tier-relative path.
    fn open(&self, storage_path: &Path, mode: OpenMode) -> Result<File>;

    /// Unlinks the file at `storage_path` and decrements `used_bytes` by
    /// `recorded_size` (the size the caller had on record for it).
    fn delete(&self, storage_path: &Path, recorded_size: u64) -> Result<()>;

    /// Walks the mount root, invoking `visit` for every object file found.
    /// Used once at startup to seed the index.
    fn enumerate(&self, visit: &mut dyn FnMut(ScanEntry)) -> Result<()>;

    fn status(&self) -> TierStatus;

    fn is_volatile(&self) -> bool {
        self.policy() == Policy::Volatile
    }

    fn has_space_for(&self, hint_bytes: u64) -> bool {
        let status = self.status();
        status.used_bytes + hint_bytes <= status.capacity_bytes
    }

    /// Consults this tier's own auxiliary URI → location index, if it
    /// maintains one (populated by the startup scan). The manager falls
    /// through to this, fastest tier first, on a miss in the global
    /// index. Default: not maintained.
    fn aux_lookup(&self, _uri: &str) -> Option<(PathBuf, u64, i64)> {
        None
    }
}
