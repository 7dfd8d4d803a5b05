//! The top-level error type, composed from each module's own error via
//! `#[from]` conversions, rolling up `object`/`index`/`backends` errors
//! into one public `Result`. Individual subsystems keep their own
//! narrower error type
//! (`DRefError`, `IndexError`, `TierError`, `ManagerError`,
//! `ProtocolError`) for callers that want to match on specifics; this
//! one is for the binary/wiring boundary, where a single `?`-friendly
//! enum covering every subsystem is all that's needed.

use crate::{manager::ManagerError, protocol::ProtocolError, tier::TierError};
use std::io;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Tier(#[from] TierError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
