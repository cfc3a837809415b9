#![forbid(unsafe_code)]
//! strata-io: concrete implementations of `strata_mem::Storage`.
//!
//! - [`FsStorage`]: files under a root directory.
//! - [`MemoryStorage`]: a process-local map, selected with `memory://`.
//!
//! [`build_storage_from_config`] picks one from the spill URI.

pub mod error;
pub mod memory_storage;
pub mod storage;

pub use error::{Error, Result};
pub use memory_storage::MemoryStorage;
pub use storage::{build_storage_from_config, FsStorage};
