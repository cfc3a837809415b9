//! Storage adapters implementing `strata_mem::Storage`, and the builder that
//! chooses one based on the configured spill URI (`file:///tmp/x`,
//! `memory://`, or a bare `spill_dir`).

mod fs;
pub use fs::FsStorage;

use std::sync::Arc;

use strata_core::config::StorageConfig;
use strata_mem::Storage;

use crate::error::{Error, Result};
use crate::memory_storage::MemoryStorage;

/// Build the storage backend for spill files.
pub fn build_storage_from_config(cfg: &StorageConfig) -> Result<Arc<dyn Storage>> {
    match cfg.scheme() {
        Some("memory") | Some("mem") => {
            tracing::debug!("using in-memory spill storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
        Some("file") | None => {
            tracing::debug!(root = %cfg.root, "using filesystem spill storage");
            Ok(Arc::new(FsStorage::new(&cfg.root)))
        }
        Some(other) => Err(Error::Config(format!("unsupported spill scheme '{other}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_selects_backend() {
        let memory = StorageConfig {
            uri: Some("memory://".into()),
            root: "memory:".into(),
        };
        assert!(build_storage_from_config(&memory).is_ok());
        let s3 = StorageConfig {
            uri: Some("s3://bucket".into()),
            root: "s3://bucket".into(),
        };
        assert!(matches!(build_storage_from_config(&s3), Err(Error::Config(_))));
    }
}
