use std::{
    fs::{self, File, OpenOptions},
    io,
    os::{fd::AsRawFd, unix::fs::FileExt},
    path::Path,
    sync::Arc,
};

use super::{failpoint_error, AccessPattern, FileSystem, FsFile};

/// A data file on the host file system.
#[derive(Debug)]
pub struct NativeFile(File);

impl FsFile for NativeFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        fail::fail_point!("fread", |s| Err(failpoint_error("fread", s)));
        self.0.read_exact_at(buf, offset)
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        fail::fail_point!("fwrite", |s| Err(failpoint_error("fwrite", s)));
        self.0.write_all_at(buf, offset)
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.0.metadata()?.len())
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        fail::fail_point!("ftruncate", |s| Err(failpoint_error("ftruncate", s)));
        self.0.set_len(len)
    }

    fn reserve(&self, len: u64) -> io::Result<()> {
        fail::fail_point!("ftruncate", |s| Err(failpoint_error("ftruncate", s)));
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let len = libc::off64_t::try_from(len)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "file length overflow"))?;
            // mode 0 only ever extends the file
            let res = unsafe { libc::fallocate64(self.0.as_raw_fd(), 0, 0, len) };
            match nix::Error::result(res) {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EOPNOTSUPP) => (),
                Err(e) => return Err(e.into()),
            }
        }
        if self.len()? < len {
            self.0.set_len(len)?;
        }
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        fail::fail_point!("fsync", |s| Err(failpoint_error("fsync", s)));
        self.0.sync_data()
    }

    fn advise(&self, pattern: AccessPattern) -> io::Result<()> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            use nix::fcntl::{posix_fadvise, PosixFadviseAdvice};
            let advice = match pattern {
                AccessPattern::Normal => PosixFadviseAdvice::POSIX_FADV_NORMAL,
                AccessPattern::Random => PosixFadviseAdvice::POSIX_FADV_RANDOM,
                AccessPattern::Sequential => PosixFadviseAdvice::POSIX_FADV_SEQUENTIAL,
            };
            posix_fadvise(self.0.as_raw_fd(), 0, 0, advice)?;
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = pattern;
        Ok(())
    }
}

/// The host file system.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeFS;

impl NativeFS {
    fn open_file(path: &Path, truncate: bool) -> io::Result<Arc<dyn FsFile>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(path)?;
        Ok(Arc::new(NativeFile(file)))
    }
}

impl FileSystem for NativeFS {
    fn open(&self, path: &Path) -> io::Result<Arc<dyn FsFile>> {
        Self::open_file(path, false)
    }

    fn create(&self, path: &Path) -> io::Result<Arc<dyn FsFile>> {
        Self::open_file(path, true)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        fail::fail_point!("unlink", |s| Err(failpoint_error("unlink", s)));
        fs::remove_file(path)
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        fs::rename(from, to)
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::create_dir_all(path)
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        fs::remove_dir_all(path)
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        File::open(path)?.sync_all()
    }
}
