use super::Store;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// A store backed by a single on-disk file, grounded in `StoreFile`'s
/// `pread`/`pwrite` pair: positioned, blocking, no internal buffering.
pub struct FileStore {
    file: File,
    read_only: bool,
}

impl FileStore {
    pub fn from_path(path: impl AsRef<Path>, read_only: bool) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)?;
        Ok(Self { file, read_only })
    }

    pub fn from_file(file: File, read_only: bool) -> Self {
        Self { file, read_only }
    }
}

impl Store for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.read_exact_at(buf, offset)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        if self.read_only {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "store is read-only",
            ));
        }
        self.file.write_all_at(buf, offset)
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn round_trips_a_page() {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(8192).unwrap();
        let store = FileStore::from_path(tmp.path(), false).unwrap();

        let page = vec![0x42u8; 4096];
        store.write_at(4096, &page).unwrap();

        let mut back = vec![0u8; 4096];
        store.read_at(4096, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn read_only_rejects_writes() {
        let tmp = NamedTempFile::new().unwrap();
        tmp.as_file().set_len(4096).unwrap();
        let store = FileStore::from_path(tmp.path(), true).unwrap();
        assert!(store.write_at(0, &[0u8; 4096]).is_err());
    }
}
