//! Live agent connections
//!
//! This module provides:
//! - Per-process connection state with copy-on-read access
//! - Heartbeat bookkeeping and stale-connection eviction
//! - Config fan-out that merges sections by name and rehashes

mod hash;
mod info;
mod registry;


pub use hash::{calc_config_hash, hash_hex, hashed_remote_config};
pub use info::ConnectionInfo;
pub use registry::{ConnectionRegistry, SectionUpdate, UpdateOutcome, HEARTBEAT_INTERVAL};
