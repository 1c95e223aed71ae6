//! Backing stores for named shared-memory segments.
//!
//! A store maps segment names to files that can be memory-mapped by any
//! process that knows the name. Two stores are provided:
//!
//! - [`PosixShm`]: POSIX shared memory via `shm_open`, enumerated through
//!   `/dev/shm`. This is the production store.
//! - [`DirectoryStore`]: plain files in a directory. Used by tests and on
//!   hosts without a shared-memory filesystem.
//!
//! A [`StoreLocation`] describes a store in a form that can be sent to a
//! worker process, which reopens the same store on its side.

use crate::core::error::{SharedMemoryError, ShmResult};
use log::debug;
use rustix::fs::{FallocateFlags, Mode};
use rustix::io::Errno;
use rustix::shm::ShmOFlags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

/// Directory where Linux exposes POSIX shared-memory objects.
pub const DEV_SHM: &str = "/dev/shm";

/// Operations a segment store must support.
pub trait SegmentStore: Send + Sync + fmt::Debug {
    /// Describe this store so another process can reopen it.
    fn location(&self) -> StoreLocation;

    /// Create a new segment of `len` bytes. Fails if the name exists.
    fn create(&self, name: &str, len: usize) -> ShmResult<File>;

    /// Open an existing segment for reading and writing.
    fn open(&self, name: &str) -> ShmResult<File>;

    /// Names of every segment currently in the store.
    fn list(&self) -> ShmResult<Vec<String>>;

    /// Last modification time of a segment.
    fn modified(&self, name: &str) -> ShmResult<SystemTime>;

    /// Remove a segment. Removing a missing segment is an error.
    fn unlink(&self, name: &str) -> ShmResult<()>;
}

/// Serializable description of a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "path", rename_all = "snake_case")]
pub enum StoreLocation {
    /// POSIX shared memory.
    Posix,
    /// Files in a directory.
    Directory(PathBuf),
}

impl StoreLocation {
    /// Open the store this location describes.
    pub fn open(&self) -> Arc<dyn SegmentStore> {
        match self {
            StoreLocation::Posix => Arc::new(PosixShm::new()),
            StoreLocation::Directory(path) => Arc::new(DirectoryStore::new(path)),
        }
    }
}

/// POSIX shared-memory store.
#[derive(Debug, Clone, Default)]
pub struct PosixShm;

impl PosixShm {
    /// Create a handle to the system store.
    pub fn new() -> Self {
        Self
    }

    fn object_name(name: &str) -> String {
        format!("/{}", name)
    }

    fn path_of(name: &str) -> PathBuf {
        Path::new(DEV_SHM).join(name)
    }
}

impl SegmentStore for PosixShm {
    fn location(&self) -> StoreLocation {
        StoreLocation::Posix
    }

    fn create(&self, name: &str, len: usize) -> ShmResult<File> {
        let fd = rustix::shm::shm_open(
            Self::object_name(name).as_str(),
            ShmOFlags::CREATE | ShmOFlags::EXCL | ShmOFlags::RDWR,
            Mode::RUSR | Mode::WUSR,
        )
        .map_err(|e| SharedMemoryError::Create {
            name: name.to_string(),
            error: e.to_string(),
        })?;

        let file = File::from(fd);
        let sized = file
            .set_len(len as u64)
            .map_err(|e| SharedMemoryError::Create {
                name: name.to_string(),
                error: e.to_string(),
            })
            .and_then(|()| reserve(&file, name, len));
        if let Err(e) = sized {
            // The object exists now; do not leave it behind.
            let _ = rustix::shm::shm_unlink(Self::object_name(name).as_str());
            return Err(e);
        }
        debug!("Created shared memory segment {} ({} bytes)", name, len);
        Ok(file)
    }

    fn open(&self, name: &str) -> ShmResult<File> {
        let fd = rustix::shm::shm_open(
            Self::object_name(name).as_str(),
            ShmOFlags::RDWR,
            Mode::empty(),
        )
        .map_err(|e| SharedMemoryError::Open {
            name: name.to_string(),
            error: e.to_string(),
        })?;
        Ok(File::from(fd))
    }

    fn list(&self) -> ShmResult<Vec<String>> {
        list_directory(Path::new(DEV_SHM))
    }

    fn modified(&self, name: &str) -> ShmResult<SystemTime> {
        modified_time(&Self::path_of(name), name)
    }

    fn unlink(&self, name: &str) -> ShmResult<()> {
        rustix::shm::shm_unlink(Self::object_name(name).as_str()).map_err(|e| {
            SharedMemoryError::Unlink {
                name: name.to_string(),
                error: e.to_string(),
            }
        })?;
        debug!("Unlinked shared memory segment {}", name);
        Ok(())
    }
}

/// Store that keeps each segment as a file in one directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    /// Create a store rooted at `root`. The directory must already exist.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory holding the segments.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> ShmResult<PathBuf> {
        if name.is_empty() || name.contains('/') || name == "." || name == ".." {
            return Err(SharedMemoryError::InvalidName(name.to_string()));
        }
        Ok(self.root.join(name))
    }
}

impl SegmentStore for DirectoryStore {
    fn location(&self) -> StoreLocation {
        StoreLocation::Directory(self.root.clone())
    }

    fn create(&self, name: &str, len: usize) -> ShmResult<File> {
        let path = self.path_of(name)?;
        let create_error = |e: std::io::Error| SharedMemoryError::Create {
            name: name.to_string(),
            error: e.to_string(),
        };
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(create_error)?;
        let sized = file
            .set_len(len as u64)
            .map_err(create_error)
            .and_then(|()| reserve(&file, name, len));
        if let Err(e) = sized {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        Ok(file)
    }

    fn open(&self, name: &str) -> ShmResult<File> {
        let path = self.path_of(name)?;
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| SharedMemoryError::Open {
                name: name.to_string(),
                error: e.to_string(),
            })
    }

    fn list(&self) -> ShmResult<Vec<String>> {
        list_directory(&self.root)
    }

    fn modified(&self, name: &str) -> ShmResult<SystemTime> {
        modified_time(&self.path_of(name)?, name)
    }

    fn unlink(&self, name: &str) -> ShmResult<()> {
        fs::remove_file(self.path_of(name)?).map_err(|e| SharedMemoryError::Unlink {
            name: name.to_string(),
            error: e.to_string(),
        })
    }
}

/// Back every page of a new segment now.
///
/// Shared-memory filesystems hand out sparse files, so without this a full
/// filesystem surfaces as SIGBUS on first write instead of an error here.
fn reserve(file: &File, name: &str, len: usize) -> ShmResult<()> {
    if len == 0 {
        return Ok(());
    }
    match rustix::fs::fallocate(file, FallocateFlags::empty(), 0, len as u64) {
        Ok(()) => Ok(()),
        Err(Errno::OPNOTSUPP) => {
            debug!("Filesystem cannot preallocate segment {}", name);
            Ok(())
        }
        Err(e) => Err(SharedMemoryError::Create {
            name: name.to_string(),
            error: e.to_string(),
        }),
    }
}

fn list_directory(dir: &Path) -> ShmResult<Vec<String>> {
    let entries = fs::read_dir(dir)
        .map_err(|e| SharedMemoryError::List(format!("{}: {}", dir.display(), e)))?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| SharedMemoryError::List(e.to_string()))?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn modified_time(path: &Path, name: &str) -> ShmResult<SystemTime> {
    fs::metadata(path)
        .and_then(|meta| meta.modified())
        .map_err(|e| SharedMemoryError::Open {
            name: name.to_string(),
            error: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn test_directory_store_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());

        let mut file = store.create("TOMO_1_abc", 16).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 16);
        file.write_all(b"hello").unwrap();

        let mut reopened = store.open("TOMO_1_abc").unwrap();
        reopened.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 5];
        reopened.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(store.list().unwrap(), vec!["TOMO_1_abc".to_string()]);
        assert!(store.modified("TOMO_1_abc").is_ok());

        store.unlink("TOMO_1_abc").unwrap();
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_reserves_backing_blocks() {
        use std::os::unix::fs::MetadataExt;

        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let file = store.create("TOMO_1_reserved", 1 << 20).unwrap();
        // st_blocks counts 512-byte units
        assert!(file.metadata().unwrap().blocks() * 512 >= 1 << 20);
    }

    #[test]
    fn test_create_beyond_capacity_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let stats = rustix::fs::statvfs(dir.path()).unwrap();
        let free = stats.f_bavail.saturating_mul(stats.f_frsize);
        let len = free.saturating_mul(2).saturating_add(1 << 30);

        let err = store.create("TOMO_1_huge", len as usize).unwrap_err();
        assert!(matches!(err, SharedMemoryError::Create { .. }));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.create("seg", 8).unwrap();
        assert!(matches!(
            store.create("seg", 8),
            Err(SharedMemoryError::Create { .. })
        ));
    }

    #[test]
    fn test_double_unlink_surfaces_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        store.create("seg", 8).unwrap();
        store.unlink("seg").unwrap();
        assert!(matches!(
            store.unlink("seg"),
            Err(SharedMemoryError::Unlink { .. })
        ));
    }

    #[test]
    fn test_path_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        assert!(matches!(
            store.create("../escape", 8),
            Err(SharedMemoryError::InvalidName(_))
        ));
    }

    #[test]
    fn test_location_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path());
        let location = store.location();
        let json = serde_json::to_string(&location).unwrap();
        let back: StoreLocation = serde_json::from_str(&json).unwrap();
        assert_eq!(back, location);

        let reopened = back.open();
        reopened.create("seg", 4).unwrap();
        assert_eq!(store.list().unwrap(), vec!["seg".to_string()]);
    }
}
