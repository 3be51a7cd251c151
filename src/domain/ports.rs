//! Domain Ports - Host interface traits for the discovery engine
//!
//! These traits define the boundaries between the discovery logic and the
//! host it runs on. The `hardware::host` module implements them against the
//! real OS; `hardware::mock` provides scriptable doubles for tests.

use crate::crd::LocalVolumeDiscoveryResultStatus;
use crate::domain::events::DiscoveryEvent;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

// =============================================================================
// Command Execution Port
// =============================================================================

/// Output of a host command with stdout and stderr combined
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    /// Combined stdout and stderr
    pub output: String,
}

impl CommandOutput {
    /// Successful output with the given text
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            output: output.into(),
        }
    }

    /// Failed output with an exit code
    pub fn failed(code: i32, output: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            output: output.into(),
        }
    }

    /// Whether the command exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Port for running host introspection tools
///
/// Returns `Err` only when the command could not be started. A non-zero exit
/// code is reported through [`CommandOutput::code`] so callers can interpret
/// tool-specific codes.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

// =============================================================================
// Host Filesystem Port
// =============================================================================

/// Port for the filesystem queries the engine makes against `/dev`, `/sys`
/// and `/proc`
pub trait HostFs: Send + Sync {
    /// List paths matching a glob pattern, sorted
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>>;

    /// Resolve all symlinks in `path`
    fn eval_symlinks(&self, path: &Path) -> std::io::Result<PathBuf>;

    /// Read a whole file as text
    fn read_to_string(&self, path: &Path) -> std::io::Result<String>;

    /// Whether both paths refer to the same file after following symlinks
    fn same_file(&self, a: &Path, b: &Path) -> std::io::Result<bool>;
}

// =============================================================================
// Exclusive Open Port
// =============================================================================

/// An open, exclusively held device file
///
/// The descriptor is closed when the handle is dropped or closed.
#[derive(Debug, Default)]
pub struct DeviceHandle {
    file: Option<File>,
}

impl DeviceHandle {
    /// Wrap an open file
    pub fn from_file(file: File) -> Self {
        Self { file: Some(file) }
    }

    /// A handle with no underlying descriptor, used by test doubles
    pub fn detached() -> Self {
        Self { file: None }
    }

    /// Whether a descriptor is held
    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Close the descriptor
    pub fn close(mut self) {
        drop(self.file.take());
    }
}

/// Result of an exclusive open attempt
#[derive(Debug)]
pub enum OpenOutcome {
    /// The device was opened exclusively
    Acquired(DeviceHandle),
    /// Another holder has the device open (EBUSY)
    Busy,
}

/// Port for exclusive, non-blocking opens of device special files
pub trait DeviceOpener: Send + Sync {
    /// Any error other than "busy" is returned as `Err`
    fn open_exclusive(&self, path: &Path) -> std::io::Result<OpenOutcome>;
}

// =============================================================================
// Clock Port
// =============================================================================

/// Source of wall-clock time
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Clock backed by the system time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// =============================================================================
// Event and Result Ports
// =============================================================================

/// Port for user-visible discovery events
pub trait EventReporter: Send + Sync {
    fn report(&self, event: DiscoveryEvent);
}

/// Port receiving the discovery records assembled for this node
#[async_trait]
pub trait ResultPublisher: Send + Sync {
    async fn publish(&self, result: &LocalVolumeDiscoveryResultStatus) -> Result<()>;

    /// Publisher name for logs
    fn name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CommandRunnerRef = Arc<dyn CommandRunner>;
pub type HostFsRef = Arc<dyn HostFs>;
pub type DeviceOpenerRef = Arc<dyn DeviceOpener>;
pub type ClockRef = Arc<dyn Clock>;
pub type EventReporterRef = Arc<dyn EventReporter>;
pub type ResultPublisherRef = Arc<dyn ResultPublisher>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_output_success() {
        assert!(CommandOutput::ok("x").success());
        assert!(!CommandOutput::failed(2, "").success());
        assert!(!CommandOutput::default().success());
    }

    #[test]
    fn test_detached_handle_close() {
        let handle = DeviceHandle::detached();
        assert!(!handle.is_open());
        handle.close();
    }

    #[test]
    fn test_closed_handle_releases_exclusive_open() {
        use std::os::unix::fs::OpenOptionsExt;

        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("disk.img");
        std::fs::write(&path, b"data").unwrap();
        let open = || {
            std::fs::OpenOptions::new()
                .read(true)
                .custom_flags(libc::O_EXCL)
                .open(&path)
        };

        let handle = DeviceHandle::from_file(open().unwrap());
        assert!(handle.is_open());
        handle.close();

        let reopened = DeviceHandle::from_file(open().unwrap());
        assert!(reopened.is_open());
    }
}
