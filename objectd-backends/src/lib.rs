//! Filesystem-backed [`objectd::tier::Tier`] implementations.
//!
//! [`DirectoryTier`] is the concrete tier the daemon binary wires up:
//! a mount-rooted directory with capacity accounting, one file per
//! URI, URI-derived path, open files owned by `objectd::dref::DRef`
//! instead of a local cache.

mod directory;
pub use directory::DirectoryTier;
