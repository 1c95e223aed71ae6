//! Process liveness probing for orphan detection.

use log::debug;
use rustix::io::Errno;
use rustix::process::Pid;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What the OS reports about a pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    /// A process with this pid exists.
    Alive,
    /// No process with this pid exists.
    NoSuchProcess,
    /// A process exists but we may not inspect it.
    PermissionDenied,
    /// The pid could not be probed.
    Unknown,
}

/// Looks up processes by pid.
pub trait ProcessProbe: Send + Sync {
    /// Status of the process with `pid`.
    fn lookup(&self, pid: u32) -> ProcessStatus;

    /// When the current process started, if known.
    fn current_start_time(&self) -> Option<SystemTime>;
}

/// Probe backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn lookup(&self, pid: u32) -> ProcessStatus {
        let Some(pid) = i32::try_from(pid).ok().and_then(Pid::from_raw) else {
            return ProcessStatus::Unknown;
        };
        match rustix::process::test_kill_process(pid) {
            Ok(()) => ProcessStatus::Alive,
            Err(Errno::SRCH) => ProcessStatus::NoSuchProcess,
            Err(Errno::PERM) => ProcessStatus::PermissionDenied,
            Err(e) => {
                debug!("Probing pid {} failed: {}", pid.as_raw_nonzero(), e);
                ProcessStatus::Unknown
            }
        }
    }

    fn current_start_time(&self) -> Option<SystemTime> {
        let pid = sysinfo::get_current_pid().ok()?;
        let mut sys = sysinfo::System::new();
        sys.refresh_process(pid);
        let seconds = sys.process(pid)?.start_time();
        Some(UNIX_EPOCH + Duration::from_secs(seconds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        let probe = SystemProbe;
        assert_eq!(probe.lookup(std::process::id()), ProcessStatus::Alive);
    }

    #[test]
    fn test_start_time_is_in_the_past() {
        let probe = SystemProbe;
        let start = probe.current_start_time().unwrap();
        assert!(start <= SystemTime::now());
    }

    #[test]
    fn test_out_of_range_pid_is_unknown() {
        let probe = SystemProbe;
        assert_eq!(probe.lookup(u32::MAX), ProcessStatus::Unknown);
        assert_eq!(probe.lookup(0), ProcessStatus::Unknown);
    }
}
