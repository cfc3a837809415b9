use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use strata_mem::error::{Error as MemError, Result as MemResult};
use strata_mem::Storage;

/// Filesystem storage. Relative paths resolve under `root`; absolute paths
/// are used as-is.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        }
    }
}

fn io_err(op: &str, path: &Path, e: std::io::Error) -> MemError {
    MemError::Storage(format!("{op} {}: {e}", path.display()))
}

impl Storage for FsStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> MemResult<()> {
        let p = self.resolve(path);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).map_err(|e| io_err("mkdir", parent, e))?;
        }
        let mut f = File::create(&p).map_err(|e| io_err("create", &p, e))?;
        f.write_all(bytes).map_err(|e| io_err("write", &p, e))?;
        f.flush().map_err(|e| io_err("flush", &p, e))?;
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> MemResult<Vec<u8>> {
        let p = self.resolve(path);
        let mut f = File::open(&p).map_err(|e| io_err("open", &p, e))?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err("seek", &p, e))?;
        let mut buf = vec![0u8; len];
        f.read_exact(&mut buf).map_err(|e| io_err("read", &p, e))?;
        Ok(buf)
    }

    fn delete(&self, path: &str) -> MemResult<()> {
        let p = self.resolve(path);
        match fs::remove_file(&p) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_err("delete", &p, e)),
        }
    }

    fn list(&self, prefix: &str) -> MemResult<Vec<String>> {
        let base = self.resolve(prefix);
        let mut results = Vec::new();
        if base.is_file() {
            results.push(base.to_string_lossy().into_owned());
            return Ok(results);
        }

        let mut stack = vec![base];
        while let Some(dir) = stack.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(io_err("list", &dir, e)),
            };
            for entry in entries {
                let path = entry.map_err(|e| io_err("list", &dir, e))?.path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    results.push(path.to_string_lossy().into_owned());
                }
            }
        }
        results.sort();
        Ok(results)
    }

    fn size(&self, path: &str) -> MemResult<u64> {
        let p = self.resolve(path);
        let meta = fs::metadata(&p).map_err(|e| io_err("stat", &p, e))?;
        Ok(meta.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_read_list_delete_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FsStorage::new(dir.path());
        storage.write("q1/op0/p0/000000.seg", b"hello world").unwrap();
        assert_eq!(storage.read_range("q1/op0/p0/000000.seg", 6, 5).unwrap(), b"world");
        assert_eq!(storage.size("q1/op0/p0/000000.seg").unwrap(), 11);
        assert_eq!(storage.list("q1").unwrap().len(), 1);
        storage.delete("q1/op0/p0/000000.seg").unwrap();
        storage.delete("q1/op0/p0/000000.seg").unwrap();
        assert!(storage.list("q1").unwrap().is_empty());
        assert!(storage.read_range("q1/op0/p0/000000.seg", 0, 1).is_err());
    }
}
