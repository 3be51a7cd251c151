//! Identity Resolver
//!
//! Finds a stable `/dev/disk/by-id` (or, for multipath devices,
//! `/dev/mapper`) symlink for a block device.
//!
//! Candidates are tried in preference order:
//! 1. the caller-supplied existing identity
//! 2. `wwn-*` links
//! 3. `scsi-*` links
//! 4. `nvme-*` links
//! 5. everything else

use super::block_device::BlockDevice;
use crate::domain::ports::{HostFs, HostFsRef};
use crate::error::{Error, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Directory of persistent device symlinks
pub const DISK_BY_ID_DIR: &str = "/dev/disk/by-id";

/// Directory of device-mapper symlinks (e.g. multipath maps)
pub const DISK_DM_DIR: &str = "/dev/mapper";

/// Symlink name prefixes in preference order; the empty prefix catches the rest
const PREFERRED_PREFIXES: [&str; 4] = ["wwn", "scsi", "nvme", ""];

// =============================================================================
// Resolution Outcome
// =============================================================================

/// Outcome of identity resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityResolution {
    /// A symlink resolving to the device
    Found(String),
    /// No symlink resolves to the device; `fallback` is its `/dev/<kname>` path
    NotFound { fallback: String },
}

impl IdentityResolution {
    /// The identity, or the fallback path when none was found
    pub fn path(&self) -> &str {
        match self {
            IdentityResolution::Found(path) => path,
            IdentityResolution::NotFound { fallback } => fallback,
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, IdentityResolution::Found(_))
    }
}

// =============================================================================
// Resolver
// =============================================================================

/// Resolves persistent identities against the host's symlink directories
#[derive(Clone)]
pub struct IdentityResolver {
    fs: HostFsRef,
    by_id_dir: PathBuf,
    mapper_dir: PathBuf,
}

impl IdentityResolver {
    pub fn new(fs: HostFsRef) -> Self {
        Self::with_dirs(fs, DISK_BY_ID_DIR, DISK_DM_DIR)
    }

    pub fn with_dirs(fs: HostFsRef, by_id_dir: impl Into<PathBuf>, mapper_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            by_id_dir: by_id_dir.into(),
            mapper_dir: mapper_dir.into(),
        }
    }

    /// Resolve the by-id path of `device`, caching it on the device.
    ///
    /// `existing` is the base name of an identity recorded earlier (for
    /// example on a persistent volume); it wins over every prefix bucket
    /// when it still resolves to the device.
    pub fn path_by_id(&self, device: &mut BlockDevice, existing: Option<&str>) -> Result<IdentityResolution> {
        if !device.path_by_id.is_empty() && Path::new(&device.path_by_id).starts_with(&self.by_id_dir) {
            let cached = PathBuf::from(&device.path_by_id);
            if let Ok(true) = self.path_evals_to_device(&cached, &device.kname) {
                return Ok(IdentityResolution::Found(device.path_by_id.clone()));
            }
        }
        device.path_by_id.clear();

        let links = self.fs.glob(&self.by_id_dir.join("*").to_string_lossy())?;
        let existing = existing.filter(|id| !id.is_empty());

        let mut buckets: Vec<Vec<PathBuf>> = vec![Vec::new(); PREFERRED_PREFIXES.len()];
        for link in links {
            let name = link_name(&link);

            if existing == Some(name.as_str()) && self.path_evals_to_device(&link, &device.kname)? {
                return Ok(self.found(device, link));
            }

            if let Some(bucket) = PREFERRED_PREFIXES.iter().position(|p| name.starts_with(p)) {
                buckets[bucket].push(link);
            }
        }

        for link in buckets.into_iter().flatten() {
            if self.path_evals_to_device(&link, &device.kname)? {
                return Ok(self.found(device, link));
            }
        }

        if device.is_multipath() {
            if let Some(mapper) = self.mapper_path(device)? {
                debug!(kname = %device.kname, path = %mapper, "Using device-mapper identity");
                return Ok(IdentityResolution::Found(mapper));
            }
        }

        Ok(IdentityResolution::NotFound {
            fallback: device.dev_path()?,
        })
    }

    /// The `/dev/mapper` symlink resolving to `device`, if any
    pub fn mapper_path(&self, device: &BlockDevice) -> Result<Option<String>> {
        let links = self.fs.glob(&self.mapper_dir.join("*").to_string_lossy())?;
        for link in links {
            if self.path_evals_to_device(&link, &device.kname)? {
                return Ok(Some(link.to_string_lossy().into_owned()));
            }
        }
        Ok(None)
    }

    /// Whether `path` resolves to a file named `kname`.
    ///
    /// A dangling link is simply not a match.
    pub fn path_evals_to_device(&self, path: &Path, kname: &str) -> Result<bool> {
        path_evals_to_device(self.fs.as_ref(), path, kname)
    }

    fn found(&self, device: &mut BlockDevice, link: PathBuf) -> IdentityResolution {
        let path = link.to_string_lossy().into_owned();
        device.path_by_id = path.clone();
        IdentityResolution::Found(path)
    }
}

impl std::fmt::Debug for IdentityResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityResolver")
            .field("by_id_dir", &self.by_id_dir)
            .field("mapper_dir", &self.mapper_dir)
            .finish()
    }
}

/// Whether `path` resolves to a file named `kname`
pub fn path_evals_to_device(fs: &dyn HostFs, path: &Path, kname: &str) -> Result<bool> {
    match fs.eval_symlinks(path) {
        Ok(target) => Ok(target
            .file_name()
            .map(|name| name.to_string_lossy() == kname)
            .unwrap_or(false)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::SymlinkEval {
            path: path.display().to_string(),
            reason: e.to_string(),
        }),
    }
}

fn link_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
