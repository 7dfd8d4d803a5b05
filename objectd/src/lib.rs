//! `objectd` is the core of a zero-copy, tiered object-storage daemon:
//! clients receive an open file descriptor to the kernel object backing
//! the bytes they asked for, passed as ancillary data over a Unix
//! domain socket. This crate holds the triplet of subsystems that make
//! that possible — the descriptor cache, the concurrent URI index, the
//! tiered placement manager — and the wire protocol and connection
//! engine that drive them. Concrete, filesystem-backed [`tier::Tier`]
//! implementations live in the sibling `objectd-backends` crate.

#![deny(clippy::all)]

pub mod config;
pub mod dref;
pub mod engine;
pub mod error;
pub mod index;
pub mod manager;
pub mod protocol;
pub mod tier;
pub mod uri;

pub use dref::{BorrowHandle, DRef};
pub use engine::{Engine, EngineConfig};
pub use error::{Error, Result};
pub use index::{Index, ObjectEntry, PolicyFlags, TierId};
pub use manager::{ManagerConfig, TierManager};
pub use tier::{OpenMode, PlacementRoles, Policy, Tier, TierStatus};
pub use uri::Uri;
