//! Host Adapters
//!
//! Implementations of the domain ports against the real operating system:
//! processes via tokio, the filesystem via `std::fs` and the `glob` crate,
//! and exclusive device opens via `O_EXCL`.

use crate::domain::ports::{CommandOutput, CommandRunner, DeviceHandle, DeviceOpener, HostFs, OpenOutcome};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs::OpenOptions;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

// =============================================================================
// Command Runner
// =============================================================================

/// Runs host tools with tokio, combining stdout and stderr
#[derive(Debug, Clone, Copy, Default)]
pub struct HostCommandRunner;

#[async_trait]
impl CommandRunner for HostCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(program).args(args).output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        let code = output.status.code();
        debug!(program, ?code, "Command finished");
        Ok(CommandOutput {
            code,
            output: if output.status.success() {
                combined.trim().to_string()
            } else {
                combined
            },
        })
    }
}

// =============================================================================
// Host Filesystem
// =============================================================================

/// The local filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalHostFs;

impl HostFs for LocalHostFs {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let entries = glob::glob(pattern).map_err(|e| Error::Glob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| match entry {
                Ok(path) => Some(path),
                Err(e) => {
                    // unreadable directories are skipped, not fatal
                    debug!(pattern, error = %e, "Skipping unreadable glob entry");
                    None
                }
            })
            .collect();
        paths.sort();
        Ok(paths)
    }

    fn eval_symlinks(&self, path: &Path) -> std::io::Result<PathBuf> {
        std::fs::canonicalize(path)
    }

    fn read_to_string(&self, path: &Path) -> std::io::Result<String> {
        std::fs::read_to_string(path)
    }

    fn same_file(&self, a: &Path, b: &Path) -> std::io::Result<bool> {
        let a = std::fs::metadata(a)?;
        let b = std::fs::metadata(b)?;
        Ok(a.dev() == b.dev() && a.ino() == b.ino())
    }
}

// =============================================================================
// Device Opener
// =============================================================================

/// Opens device nodes read-only with `O_EXCL`; the kernel answers EBUSY
/// while another holder has the block device
#[derive(Debug, Clone, Copy, Default)]
pub struct HostDeviceOpener;

impl DeviceOpener for HostDeviceOpener {
    fn open_exclusive(&self, path: &Path) -> std::io::Result<OpenOutcome> {
        let mut options = OpenOptions::new();
        options.read(true).custom_flags(libc::O_EXCL);

        match options.open(path) {
            Ok(file) => Ok(OpenOutcome::Acquired(DeviceHandle::from_file(file))),
            Err(e) if e.raw_os_error() == Some(libc::EBUSY) => Ok(OpenOutcome::Busy),
            Err(e) => Err(e),
        }
    }
}
