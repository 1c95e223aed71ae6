//! Naming, ownership and reclamation of shared-memory segments.
//!
//! Every segment this engine creates is named `<prefix>_<pid>_<token>`, where
//! `pid` is the creating process and `token` is a UUID in simple (hex) form.
//! The name alone is enough to decide whether a segment belongs to us and
//! which process made it, so segments left behind by a crashed run can be
//! found and reclaimed on the next start.

use crate::core::config::available_memory;
use crate::core::error::{SharedMemoryError, ShmResult};
use crate::core::memory::full_footprint;
use crate::core::types::Dtype;
use crate::shm::array::SharedArray;
use crate::shm::process::{ProcessProbe, ProcessStatus, SystemProbe};
use crate::shm::store::{PosixShm, SegmentStore};
use log::{debug, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;
use uuid::Uuid;

/// Default name prefix for segments.
pub const DEFAULT_PREFIX: &str = "TOMO";

/// A segment created through the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedMemoryBlock {
    /// Segment name.
    pub name: String,
    /// Pid encoded in the name.
    pub owner_pid: u32,
    /// Size in bytes.
    pub len: usize,
    /// Modification time reported by the store, if available.
    pub modified: Option<SystemTime>,
}

/// Creates, enumerates and frees named segments.
pub struct SegmentRegistry {
    prefix: String,
    store: Arc<dyn SegmentStore>,
    probe: Arc<dyn ProcessProbe>,
}

impl SegmentRegistry {
    /// Registry over POSIX shared memory with the default prefix.
    pub fn new() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            store: Arc::new(PosixShm::new()),
            probe: Arc::new(SystemProbe),
        }
    }

    /// Use a different backing store.
    pub fn with_store(mut self, store: Arc<dyn SegmentStore>) -> Self {
        self.store = store;
        self
    }

    /// Use a different process probe.
    pub fn with_probe(mut self, probe: Arc<dyn ProcessProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Use a different name prefix. The prefix may not contain `_`.
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> ShmResult<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains('_') || prefix.contains('/') {
            return Err(SharedMemoryError::InvalidName(prefix));
        }
        self.prefix = prefix;
        Ok(self)
    }

    /// Name prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn SegmentStore> {
        &self.store
    }

    /// Build a fresh segment name for `owning_pid`.
    pub fn generate_name(&self, owning_pid: u32) -> String {
        format!("{}_{}_{}", self.prefix, owning_pid, Uuid::new_v4().simple())
    }

    /// Allocate a segment of `len` bytes on behalf of `owning_pid`.
    ///
    /// The caller is responsible for freeing it with [`free`](Self::free).
    pub fn create(&self, owning_pid: u32, len: usize) -> ShmResult<SharedMemoryBlock> {
        let name = self.generate_name(owning_pid);
        ensure_memory(&name, len as u64)?;
        self.store.create(&name, len)?;
        let modified = self.store.modified(&name).ok();
        Ok(SharedMemoryBlock {
            name,
            owner_pid: owning_pid,
            len,
            modified,
        })
    }

    /// Allocate a zero-filled array owned by the current process.
    ///
    /// The segment is unlinked when the returned array is dropped.
    pub fn create_array(&self, shape: [usize; 3], dtype: Dtype) -> ShmResult<SharedArray> {
        let name = self.generate_name(std::process::id());
        debug!("Allocating {:?} {} array in {}", shape, dtype, name);
        ensure_memory(&name, full_footprint(&shape, dtype.width()))?;
        SharedArray::create(self.store.clone(), name, shape, dtype)
    }

    /// Every segment name in the store, ours or not.
    pub fn list_all(&self) -> ShmResult<Vec<String>> {
        self.store.list()
    }

    /// Pid encoded in a name of ours, if the name follows the convention.
    pub fn owner_of(&self, name: &str) -> Option<u32> {
        let mut fields = name.split('_');
        let (Some(prefix), Some(pid), Some(token), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return None;
        };
        if prefix != self.prefix || token.is_empty() {
            return None;
        }
        if pid.is_empty() || !pid.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        pid.parse().ok()
    }

    /// Whether `name` follows our naming convention.
    pub fn is_ours_name(&self, name: &str) -> bool {
        self.owner_of(name).is_some()
    }

    /// Whether `name` is ours and was created by `pid`.
    pub fn is_mine(&self, name: &str, pid: u32) -> bool {
        self.owner_of(name) == Some(pid)
    }

    /// Segments in the store created by the current process.
    pub fn owned_by_current(&self) -> ShmResult<Vec<String>> {
        let pid = std::process::id();
        Ok(self
            .list_all()?
            .into_iter()
            .filter(|name| self.is_mine(name, pid))
            .collect())
    }

    /// Unlink every named segment.
    ///
    /// All names are attempted; the first failure is returned afterwards.
    pub fn free<S: AsRef<str>>(&self, names: &[S]) -> ShmResult<()> {
        let mut first_error = None;
        for name in names {
            if let Err(e) = self.store.unlink(name.as_ref()) {
                warn!("Failed to free segment: {}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Segments of ours whose creator is gone.
    ///
    /// A segment counts as orphaned only when its name follows the
    /// convention, it was last modified before the current process started,
    /// and the probe reports that its creating pid no longer exists. Any
    /// other probe answer, or a failure to read the modification time,
    /// leaves the segment alone.
    pub fn find_orphans(&self) -> ShmResult<Vec<String>> {
        let Some(started) = self.probe.current_start_time() else {
            warn!("Process start time unknown, not looking for orphaned segments");
            return Ok(Vec::new());
        };

        let mut orphans = Vec::new();
        for name in self.list_all()? {
            let Some(pid) = self.owner_of(&name) else {
                continue;
            };
            match self.store.modified(&name) {
                Ok(modified) if modified < started => {}
                Ok(_) => continue,
                Err(e) => {
                    debug!("Skipping {}: {}", name, e);
                    continue;
                }
            }
            match self.probe.lookup(pid) {
                ProcessStatus::NoSuchProcess => orphans.push(name),
                status => debug!("Keeping {}: owner {} is {:?}", name, pid, status),
            }
        }
        Ok(orphans)
    }

    /// Find orphaned segments and free them, returning their names.
    pub fn sweep_orphans(&self) -> ShmResult<Vec<String>> {
        let orphans = self.find_orphans()?;
        if !orphans.is_empty() {
            info!("Freeing {} orphaned shared memory segments", orphans.len());
            self.free(&orphans)?;
        }
        Ok(orphans)
    }
}

impl Default for SegmentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SegmentRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentRegistry")
            .field("prefix", &self.prefix)
            .field("store", &self.store)
            .finish()
    }
}

/// Refuse allocations the machine cannot back with physical memory.
fn ensure_memory(name: &str, requested: u64) -> ShmResult<()> {
    let available = available_memory();
    if requested >= available {
        return Err(SharedMemoryError::InsufficientMemory {
            name: name.to_string(),
            requested,
            available,
        });
    }
    Ok(())
}
