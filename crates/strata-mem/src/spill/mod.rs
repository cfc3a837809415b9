//! Partitioned spilling.
//!
//! - [`partition`]: hash bit ranges, hierarchical partition ids, and the hash
//!   partition function mapping rows to partitions.
//! - [`state`]: per-partition append-only writers ([`SpillState`]) and the
//!   finished, readable [`SpillPartition`]s.
//! - [`spiller`]: the [`Spiller`] façade an operator drives for one spill run.
//! - [`segment`]: the on-storage segment format (header, codec, checksum).

pub mod codec;
pub mod partition;
pub mod segment;
pub mod spiller;
pub mod state;

use std::sync::Arc;

use parking_lot::Mutex;
use strata_core::SpillStats;

use crate::error::Result;

pub use codec::Codec;
pub use partition::{HashBitRange, HashPartitionFunction, SpillPartitionId};
pub use segment::{SegmentHeader, SegmentMeta, HEADER_LEN};
pub use spiller::Spiller;
pub use state::{SpillPartition, SpillPartitionReader, SpillPartitionSet, SpillState};

/// Spill counters shared between an operator, its spillers and readers.
pub type SharedSpillStats = Arc<Mutex<SpillStats>>;

/// Abstract storage interface for spill segments.
///
/// Implemented by `strata-io::FsStorage` for the local filesystem and by
/// `strata-io::MemoryStorage` for tests and in-memory spilling.
pub trait Storage: Send + Sync {
    /// Write bytes to a path. Creates parent directories if needed.
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Read a byte range from a path. Returns exactly `len` bytes or error.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    /// Delete a path. Idempotent (no error if path doesn't exist).
    fn delete(&self, path: &str) -> Result<()>;

    /// List all paths under a prefix.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Size of a path in bytes.
    fn size(&self, path: &str) -> Result<u64>;
}

#[cfg(test)]
pub(crate) mod test_storage {
    use std::collections::BTreeMap;

    use parking_lot::Mutex;

    use super::Storage;
    use crate::error::{Error, Result};

    /// Map-backed storage for unit tests in this crate.
    #[derive(Default)]
    pub struct MapStorage {
        pub files: Mutex<BTreeMap<String, Vec<u8>>>,
    }

    impl Storage for MapStorage {
        fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
            self.files.lock().insert(path.to_string(), bytes.to_vec());
            Ok(())
        }

        fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
            let files = self.files.lock();
            let data = files
                .get(path)
                .ok_or_else(|| Error::Storage(format!("missing {path}")))?;
            let start = offset as usize;
            data.get(start..start + len)
                .map(|s| s.to_vec())
                .ok_or_else(|| Error::Storage("short read".into()))
        }

        fn delete(&self, path: &str) -> Result<()> {
            self.files.lock().remove(path);
            Ok(())
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .files
                .lock()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }

        fn size(&self, path: &str) -> Result<u64> {
            self.files
                .lock()
                .get(path)
                .map(|d| d.len() as u64)
                .ok_or_else(|| Error::Storage(format!("missing {path}")))
        }
    }
}
