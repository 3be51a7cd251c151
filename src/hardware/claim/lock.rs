//! Exclusive Claim Lock
//!
//! Guards a device against concurrent claimants on the same host. The lock
//! is an `O_EXCL` open of the device node, which the kernel refuses with
//! EBUSY while anyone else holds the device (mounted, in a RAID, opened
//! exclusively by another process). Existing symlinks in the claim
//! directories show that the device was claimed by an earlier pass.

use crate::domain::ports::{DeviceHandle, DeviceOpener, DeviceOpenerRef, HostFs, HostFsRef, OpenOutcome};
use crate::error::{Error, Result};
use crate::hardware::discovery::{path_evals_to_device, BlockDevice};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

// =============================================================================
// Exclusive File Lock
// =============================================================================

/// Exclusive open of a device node, released on drop
#[derive(Debug)]
pub struct ExclusiveFileLock {
    path: PathBuf,
    handle: Option<DeviceHandle>,
}

impl ExclusiveFileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            handle: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Try to take the lock without blocking.
    ///
    /// `Ok(false)` means the device is busy; any other open failure is an error.
    pub fn lock(&mut self, opener: &dyn DeviceOpener) -> Result<bool> {
        if self.handle.is_some() {
            return Ok(true);
        }
        match opener.open_exclusive(&self.path)? {
            OpenOutcome::Acquired(handle) => {
                self.handle = Some(handle);
                Ok(true)
            }
            OpenOutcome::Busy => Ok(false),
        }
    }

    pub fn is_locked(&self) -> bool {
        self.handle.is_some()
    }

    /// Release the lock. Calling it again, or on a lock never taken, is a no-op.
    pub fn unlock(&mut self) {
        if let Some(handle) = self.handle.take() {
            debug!(device = %self.path.display(), "Releasing device lock");
            handle.close();
        }
    }
}

impl Drop for ExclusiveFileLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

// =============================================================================
// Claim Evaluation
// =============================================================================

/// Lock plus the claim symlinks already pointing at the device
#[derive(Debug)]
pub struct ClaimAttempt {
    pub lock: ExclusiveFileLock,
    pub existing_links: Vec<PathBuf>,
}

impl ClaimAttempt {
    pub fn decision(&self) -> ClaimDecision {
        if !self.existing_links.is_empty() {
            ClaimDecision::AlreadyClaimed {
                links: self.existing_links.clone(),
            }
        } else {
            ClaimDecision::Claimable
        }
    }
}

/// What to do with a device that passed filters, age gate and matchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimDecision {
    /// Locked and not linked anywhere; safe to claim
    Claimable,
    /// Claim symlinks already reference the device; do not claim again
    AlreadyClaimed { links: Vec<PathBuf> },
    /// Held by another process and not claimed by us
    InUse,
}

/// Acquires claim locks and inspects claim directories
pub struct ClaimLocker {
    fs: HostFsRef,
    opener: DeviceOpenerRef,
    symlink_dirs: Vec<PathBuf>,
}

impl ClaimLocker {
    pub fn new(fs: HostFsRef, opener: DeviceOpenerRef, symlink_dirs: Vec<PathBuf>) -> Self {
        Self {
            fs,
            opener,
            symlink_dirs,
        }
    }

    pub fn symlink_dirs(&self) -> &[PathBuf] {
        &self.symlink_dirs
    }

    /// Lock `device` and collect claim symlinks pointing at it.
    ///
    /// Fails with [`Error::DeviceBusy`] when the device is busy and no
    /// symlink references it. The returned lock must be released by the
    /// caller; dropping it is enough.
    pub fn acquire(&self, device: &str) -> Result<ClaimAttempt> {
        let mut lock = ExclusiveFileLock::new(device);
        let locked = lock.lock(self.opener.as_ref())?;
        let existing_links = self.matching_symlinks(Path::new(device))?;

        if existing_links.is_empty() && !locked {
            return Err(Error::DeviceBusy {
                device: device.to_string(),
            });
        }

        Ok(ClaimAttempt {
            lock,
            existing_links,
        })
    }

    /// Decide whether `device` can be claimed, releasing the lock afterwards
    pub fn evaluate(&self, device: &str) -> Result<ClaimDecision> {
        let mut attempt = match self.acquire(device) {
            Ok(attempt) => attempt,
            Err(Error::DeviceBusy { .. }) => {
                debug!(device, "Device is in use");
                return Ok(ClaimDecision::InUse);
            }
            Err(e) => return Err(e),
        };
        let decision = attempt.decision();
        attempt.lock.unlock();
        Ok(decision)
    }

    /// Every entry below the claim directories that is the same file as `device`
    pub fn matching_symlinks(&self, device: &Path) -> Result<Vec<PathBuf>> {
        let mut links = Vec::new();
        for dir in &self.symlink_dirs {
            let pattern = dir.join("**").join("*");
            for candidate in self.fs.glob(&pattern.to_string_lossy())? {
                match self.fs.same_file(&candidate, device) {
                    Ok(true) => links.push(candidate),
                    Ok(false) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => {
                        return Err(Error::SymlinkEval {
                            path: candidate.display().to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        }
        links.sort();
        links.dedup();
        Ok(links)
    }

    /// Symlinks in `symlink_dir` that no longer resolve to a valid device
    pub fn orphaned_symlinks(&self, symlink_dir: &Path, valid_devices: &[BlockDevice]) -> Result<Vec<PathBuf>> {
        orphaned_symlinks(self.fs.as_ref(), symlink_dir, valid_devices)
    }
}

impl std::fmt::Debug for ClaimLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimLocker")
            .field("symlink_dirs", &self.symlink_dirs)
            .finish()
    }
}

/// Symlinks in `symlink_dir` that resolve to none of `valid_devices`
pub fn orphaned_symlinks(fs: &dyn HostFs, symlink_dir: &Path, valid_devices: &[BlockDevice]) -> Result<Vec<PathBuf>> {
    let mut orphans = Vec::new();
    for link in fs.glob(&symlink_dir.join("*").to_string_lossy())? {
        let mut referenced = false;
        for device in valid_devices {
            if path_evals_to_device(fs, &link, &device.kname)? {
                referenced = true;
                break;
            }
        }
        if !referenced {
            orphans.push(link);
        }
    }
    Ok(orphans)
}
