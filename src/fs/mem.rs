use std::{
    collections::BTreeMap,
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};

use super::{failpoint_error, FileSystem, FsFile};

/// A growable in-memory file.
#[derive(Debug, Default)]
pub struct MemFile {
    data: RwLock<Vec<u8>>,
}

impl MemFile {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FsFile for MemFile {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        fail::fail_point!("fread", |s| Err(failpoint_error("fread", s)));
        let data = self.data.read();
        let src = usize::try_from(offset)
            .ok()
            .and_then(|start| data.get(start..start.checked_add(buf.len())?))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("read of {}+{} past {}", offset, buf.len(), data.len()),
                )
            })?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<()> {
        fail::fail_point!("fwrite", |s| Err(failpoint_error("fwrite", s)));
        let start = offset as usize;
        let end = start + buf.len();
        let mut data = self.data.write();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn len(&self) -> io::Result<u64> {
        Ok(self.data.read().len() as u64)
    }

    fn set_len(&self, len: u64) -> io::Result<()> {
        fail::fail_point!("ftruncate", |s| Err(failpoint_error("ftruncate", s)));
        self.data.write().resize(len as usize, 0);
        Ok(())
    }

    fn reserve(&self, len: u64) -> io::Result<()> {
        let mut data = self.data.write();
        if (data.len() as u64) < len {
            data.resize(len as usize, 0);
        }
        Ok(())
    }

    fn sync_data(&self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug)]
enum Entry {
    Dir,
    File(Arc<MemFile>),
}

/// An in-memory file system. Paths must be absolute.
#[derive(Debug, Default)]
pub struct MemFS {
    entries: Mutex<BTreeMap<PathBuf, Entry>>,
}

fn not_found(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{} not found", path.display()),
    )
}

fn checked(path: &Path) -> io::Result<&Path> {
    if path.is_absolute() {
        Ok(path)
    } else {
        Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} isn't absolute", path.display()),
        ))
    }
}

/// The parent of `path` must be an existing directory, the root always is.
fn check_parent(entries: &BTreeMap<PathBuf, Entry>, path: &Path) -> io::Result<()> {
    match path.parent() {
        None => Ok(()),
        Some(parent) if parent.parent().is_none() => Ok(()),
        Some(parent) => match entries.get(parent) {
            Some(Entry::Dir) => Ok(()),
            _ => Err(not_found(parent)),
        },
    }
}

impl MemFS {
    fn file(&self, path: &Path, truncate: bool) -> io::Result<Arc<dyn FsFile>> {
        let path = checked(path)?;
        let mut entries = self.entries.lock();
        check_parent(&entries, path)?;
        if !truncate {
            match entries.get(path) {
                Some(Entry::File(file)) => return Ok(file.clone()),
                Some(Entry::Dir) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("{} is a directory", path.display()),
                    ))
                }
                None => (),
            }
        }
        let file = Arc::new(MemFile::new());
        entries.insert(path.to_path_buf(), Entry::File(file.clone()));
        Ok(file)
    }
}

impl FileSystem for MemFS {
    fn open(&self, path: &Path) -> io::Result<Arc<dyn FsFile>> {
        self.file(path, false)
    }

    fn create(&self, path: &Path) -> io::Result<Arc<dyn FsFile>> {
        self.file(path, true)
    }

    fn remove_file(&self, path: &Path) -> io::Result<()> {
        let mut entries = self.entries.lock();
        match entries.remove(checked(path)?) {
            Some(Entry::File(_)) => Ok(()),
            Some(dir) => {
                entries.insert(path.to_path_buf(), dir);
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("{} is a directory", path.display()),
                ))
            }
            None => Err(not_found(path)),
        }
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut entries = self.entries.lock();
        check_parent(&entries, checked(to)?)?;
        if let Some(Entry::Dir) = entries.get(to) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} is a directory", to.display()),
            ));
        }
        match entries.remove(checked(from)?) {
            Some(Entry::File(file)) => {
                entries.insert(to.to_path_buf(), Entry::File(file));
                Ok(())
            }
            Some(dir) => {
                entries.insert(from.to_path_buf(), dir);
                Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "renaming directories isn't supported",
                ))
            }
            None => Err(not_found(from)),
        }
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_absolute() && (path.parent().is_none() || self.entries.lock().contains_key(path))
    }

    fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let path = checked(path)?;
        let mut entries = self.entries.lock();
        for dir in path.ancestors().filter(|p| p.parent().is_some()) {
            match entries.get(dir) {
                Some(Entry::Dir) => (),
                Some(Entry::File(_)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::AlreadyExists,
                        format!("{} is a file", dir.display()),
                    ))
                }
                None => {
                    entries.insert(dir.to_path_buf(), Entry::Dir);
                }
            }
        }
        Ok(())
    }

    fn remove_dir_all(&self, path: &Path) -> io::Result<()> {
        let path = checked(path)?;
        let mut entries = self.entries.lock();
        if !entries.contains_key(path) {
            return Err(not_found(path));
        }
        entries.retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    fn sync_dir(&self, path: &Path) -> io::Result<()> {
        if self.exists(path) {
            Ok(())
        } else {
            Err(not_found(path))
        }
    }
}
