use std::{fmt, sync::Arc};

use crate::{
    error::{error_validation, Error},
    fs::{AccessPattern, FsFile},
    freespace::FreeSpace,
    utils::ByteSize,
};

/// The physical file is grown in steps of this size.
const FILE_GROWTH_STEP: u64 = 1024 * 1024;

/// Raw block I/O counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub allocations: u64,
    pub frees: u64,
}

/// The file holding an array's chunks and index nodes plus its space manager.
pub struct Storage {
    file: Arc<dyn FsFile>,
    space: FreeSpace,
    /// Physical length as last observed or set by us
    file_len: u64,
    stats: IoStats,
}

impl fmt::Debug for Storage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Storage")
            .field("eoa", &self.space.eoa())
            .field("free", &ByteSize(self.space.free_bytes()))
            .field("file_len", &ByteSize(self.file_len))
            .field("stats", &self.stats)
            .finish()
    }
}

impl Storage {
    pub fn new(file: Arc<dyn FsFile>, space: FreeSpace) -> Result<Self, Error> {
        let file_len = file.len()?;
        file.advise(AccessPattern::Random)?;
        Ok(Self {
            file,
            space,
            file_len,
            stats: IoStats::default(),
        })
    }

    pub fn space(&self) -> &FreeSpace {
        &self.space
    }

    pub fn stats(&self) -> IoStats {
        self.stats
    }

    pub fn alloc(&mut self, len: u64) -> Result<u64, Error> {
        let addr = self.space.alloc(len)?;
        self.stats.allocations += 1;
        let eoa = self.space.eoa();
        if eoa > self.file_len {
            let new_len = eoa.next_multiple_of(FILE_GROWTH_STEP);
            trace!(
                "Growing file from {} to {}",
                ByteSize(self.file_len),
                ByteSize(new_len)
            );
            self.file.reserve(new_len)?;
            self.file_len = new_len;
        }
        Ok(addr)
    }

    pub fn free(&mut self, addr: u64, len: u64) -> Result<(), Error> {
        self.space.free(addr, len)?;
        self.stats.frees += 1;
        Ok(())
    }

    pub fn read(&mut self, addr: u64, buf: &mut [u8]) -> Result<(), Error> {
        self.check_range(addr, buf.len())?;
        self.file.read_at(buf, addr)?;
        self.stats.reads += 1;
        self.stats.bytes_read += buf.len() as u64;
        Ok(())
    }

    /// Reads `len` bytes into a new buffer.
    pub fn read_to_vec(&mut self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.check_range(addr, len)?;
        let buf = self.file.read_vec_at(addr, len)?;
        self.stats.reads += 1;
        self.stats.bytes_read += len as u64;
        Ok(buf)
    }

    pub fn write(&mut self, addr: u64, buf: &[u8]) -> Result<(), Error> {
        self.check_range(addr, buf.len())?;
        self.file.write_at(buf, addr)?;
        self.stats.writes += 1;
        self.stats.bytes_written += buf.len() as u64;
        Ok(())
    }

    #[inline]
    fn check_range(&self, addr: u64, len: usize) -> Result<(), Error> {
        if addr.saturating_add(len as u64) > self.space.eoa() {
            return Err(error_validation!(
                "I/O at {addr}+{len} beyond end of allocation {}",
                self.space.eoa()
            ));
        }
        Ok(())
    }

    /// Trims the physical file to the end of allocation and syncs it.
    pub fn sync(&mut self, truncate: bool) -> Result<(), Error> {
        if truncate && self.file_len != self.space.eoa() {
            self.file.set_len(self.space.eoa())?;
            self.file_len = self.space.eoa();
        }
        self.file.sync_data()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MemFile;

    #[test]
    fn test_alloc_grows_file() {
        let file = Arc::new(MemFile::new());
        let mut storage = Storage::new(file.clone(), FreeSpace::default()).unwrap();
        let a = storage.alloc(100).unwrap();
        assert_eq!(file.len().unwrap(), FILE_GROWTH_STEP);
        storage.write(a, &[7; 100]).unwrap();
        let mut buf = [0; 10];
        storage.read(a + 90, &mut buf).unwrap();
        assert_eq!(buf, [7; 10]);
        assert!(storage.read(a + 95, &mut buf).is_err());
        storage.sync(true).unwrap();
        assert_eq!(file.len().unwrap(), 100);
        let stats = storage.stats();
        assert_eq!((stats.reads, stats.writes, stats.allocations), (1, 1, 1));
    }

    #[test]
    fn test_max_file_size() {
        let file = Arc::new(MemFile::new());
        let mut storage = Storage::new(file, FreeSpace::new(Some(1000))).unwrap();
        storage.alloc(600).unwrap();
        assert!(matches!(
            storage.alloc(600),
            Err(Error::AllocationFailure(_))
        ));
        storage.alloc(400).unwrap();
    }
}
