//! Where array folders live.
//!
//! An array folder holds exactly two files: the data file, accessed with positioned
//! block I/O through [FsFile], and the metadata file, always replaced as a whole.
//! [MemFS] keeps everything in memory and can be shared between threads, which is
//! how parallel groups are exercised without real processes.
use std::{io, path::Path, sync::Arc};

mod mem;
#[cfg(unix)]
mod native;

pub use mem::{MemFS, MemFile};
#[cfg(unix)]
pub use native::{NativeFS, NativeFile};

/// Expected access pattern of a data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPattern {
    Normal,
    Random,
    Sequential,
}

/// A file of fixed address blocks.
pub trait FsFile: Send + Sync {
    /// Fills `buf` from `offset`, reading past the end of the file is an error.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()>;

    fn read_vec_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.read_at(&mut buf, offset)?;
        Ok(buf)
    }

    /// Writes all of `buf` at `offset`, extending the file if needed.
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()>;

    fn len(&self) -> io::Result<u64>;

    fn set_len(&self, len: u64) -> io::Result<()>;

    /// Makes the file at least `len` bytes long. Other handles may be growing the
    /// same file concurrently, so this never shrinks it.
    fn reserve(&self, len: u64) -> io::Result<()> {
        if self.len()? < len {
            self.set_len(len)?;
        }
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()>;

    fn advise(&self, _pattern: AccessPattern) -> io::Result<()> {
        Ok(())
    }
}

pub trait FileSystem: Send + Sync {
    /// Opens a file for reading and writing, creating it if missing.
    fn open(&self, path: &Path) -> io::Result<Arc<dyn FsFile>>;
    /// Creates an empty file, replacing any existing one.
    fn create(&self, path: &Path) -> io::Result<Arc<dyn FsFile>>;
    fn remove_file(&self, path: &Path) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn exists(&self, path: &Path) -> bool;
    fn create_dir_all(&self, path: &Path) -> io::Result<()>;
    fn remove_dir_all(&self, path: &Path) -> io::Result<()>;
    fn sync_dir(&self, path: &Path) -> io::Result<()>;

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        let file = self.open(path)?;
        let len = usize::try_from(file.len()?)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "file too large"))?;
        file.read_vec_at(0, len)
    }

    /// Replaces the contents of `path` so that readers observe either the old or
    /// the new contents. The parent directory isn't synced.
    fn replace_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);
        let file = self.create(&tmp_path)?;
        file.write_at(contents, 0)?;
        file.sync_data()?;
        drop(file);
        self.rename(&tmp_path, path)
    }
}

impl std::fmt::Debug for dyn FileSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FileSystem")
    }
}

fn failpoint_error(name: &str, config: Option<String>) -> io::Error {
    io::Error::new(io::ErrorKind::Other, format!("failpoint {name} {config:?}"))
}
