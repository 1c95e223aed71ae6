//! Shared-memory segments for handing arrays to worker processes.
//!
//! Large arrays never travel through the worker protocol. The parent copies
//! them into named segments, and workers attach to those segments by name.

pub mod store;
pub mod process;
pub mod array;
pub mod registry;

pub use array::{SegmentRef, SharedArray};
pub use process::{ProcessProbe, ProcessStatus, SystemProbe};
pub use registry::{SegmentRegistry, SharedMemoryBlock, DEFAULT_PREFIX};
pub use store::{DirectoryStore, PosixShm, SegmentStore, StoreLocation};
