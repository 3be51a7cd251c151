//! Scriptable host doubles
//!
//! In-memory implementations of the host ports so the engine can be driven
//! deterministically in unit tests, integration tests and benchmarks.

use crate::domain::ports::{Clock, CommandOutput, CommandRunner, DeviceHandle, DeviceOpener, HostFs, OpenOutcome};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use glob::{MatchOptions, Pattern};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};

/// Symlink hops followed before giving up
const MAX_SYMLINK_HOPS: usize = 40;

// =============================================================================
// Command Runner
// =============================================================================

/// Command runner answering from per-program scripts
#[derive(Debug, Default)]
pub struct ScriptedCommandRunner {
    defaults: RwLock<HashMap<String, CommandOutput>>,
    queued: Mutex<HashMap<String, VecDeque<CommandOutput>>>,
    calls: Mutex<Vec<(String, Vec<String>)>>,
}

impl ScriptedCommandRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every run of `program` with `output`
    pub fn respond(self, program: &str, output: CommandOutput) -> Self {
        self.set_response(program, output);
        self
    }

    /// Answer the next run of `program` with `output`, ahead of the default
    pub fn respond_once(self, program: &str, output: CommandOutput) -> Self {
        self.queued
            .lock()
            .entry(program.to_string())
            .or_default()
            .push_back(output);
        self
    }

    /// Replace the default answer for `program`
    pub fn set_response(&self, program: &str, output: CommandOutput) {
        self.defaults.write().insert(program.to_string(), output);
    }

    /// Every `(program, args)` run so far
    pub fn calls(&self) -> Vec<(String, Vec<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for ScriptedCommandRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        self.calls.lock().push((program.to_string(), args.to_vec()));

        if let Some(output) = self.queued.lock().get_mut(program).and_then(VecDeque::pop_front) {
            return Ok(output);
        }
        self.defaults.read().get(program).cloned().ok_or_else(|| {
            Error::Io(io::Error::new(
                ErrorKind::NotFound,
                format!("{}: command not found", program),
            ))
        })
    }
}

// =============================================================================
// Host Filesystem
// =============================================================================

#[derive(Debug, Default)]
struct FsState {
    files: BTreeMap<PathBuf, String>,
    symlinks: BTreeMap<PathBuf, PathBuf>,
    glob_errors: HashSet<String>,
    eval_errors: HashSet<PathBuf>,
}

/// In-memory view of `/dev`, `/sys` and `/proc`
#[derive(Debug, Default)]
pub struct FakeHostFs {
    state: RwLock<FsState>,
}

impl FakeHostFs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(self, path: impl Into<PathBuf>, content: &str) -> Self {
        self.add_file(path, content);
        self
    }

    pub fn with_symlink(self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        self.add_symlink(link, target);
        self
    }

    /// Make `glob(pattern)` fail
    pub fn with_glob_error(self, pattern: &str) -> Self {
        self.state.write().glob_errors.insert(pattern.to_string());
        self
    }

    /// Make symlink evaluation of `path` fail with a non-NotFound error
    pub fn with_eval_error(self, path: impl Into<PathBuf>) -> Self {
        self.state.write().eval_errors.insert(path.into());
        self
    }

    pub fn add_file(&self, path: impl Into<PathBuf>, content: &str) {
        self.state.write().files.insert(path.into(), content.to_string());
    }

    pub fn add_symlink(&self, link: impl Into<PathBuf>, target: impl Into<PathBuf>) {
        self.state.write().symlinks.insert(link.into(), target.into());
    }

    pub fn remove(&self, path: &Path) {
        let mut state = self.state.write();
        state.files.remove(path);
        state.symlinks.remove(path);
    }

    fn resolve(state: &FsState, path: &Path) -> io::Result<PathBuf> {
        let mut current = path.to_path_buf();
        for _ in 0..MAX_SYMLINK_HOPS {
            if state.eval_errors.contains(&current) {
                return Err(io::Error::new(
                    ErrorKind::PermissionDenied,
                    format!("permission denied: {}", current.display()),
                ));
            }
            match state.symlinks.get(&current) {
                Some(target) => current = target.clone(),
                None => return Ok(current),
            }
        }
        Err(io::Error::new(ErrorKind::Other, "too many levels of symbolic links"))
    }
}

impl HostFs for FakeHostFs {
    fn glob(&self, pattern: &str) -> Result<Vec<PathBuf>> {
        let state = self.state.read();
        if state.glob_errors.contains(pattern) {
            return Err(Error::Glob {
                pattern: pattern.to_string(),
                reason: "injected glob failure".into(),
            });
        }

        let compiled = Pattern::new(pattern).map_err(|e| Error::Glob {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;
        let options = MatchOptions {
            require_literal_separator: true,
            ..MatchOptions::new()
        };

        let matches: BTreeSet<PathBuf> = state
            .files
            .keys()
            .chain(state.symlinks.keys())
            .filter(|path| compiled.matches_path_with(path, options))
            .cloned()
            .collect();
        Ok(matches.into_iter().collect())
    }

    fn eval_symlinks(&self, path: &Path) -> io::Result<PathBuf> {
        let state = self.state.read();
        if !state.files.contains_key(path) && !state.symlinks.contains_key(path) {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("no such file: {}", path.display()),
            ));
        }
        Self::resolve(&state, path)
    }

    fn read_to_string(&self, path: &Path) -> io::Result<String> {
        let state = self.state.read();
        let resolved = Self::resolve(&state, path)?;
        state.files.get(&resolved).cloned().ok_or_else(|| {
            io::Error::new(ErrorKind::NotFound, format!("no such file: {}", path.display()))
        })
    }

    fn same_file(&self, a: &Path, b: &Path) -> io::Result<bool> {
        let state = self.state.read();
        Ok(Self::resolve(&state, a)? == Self::resolve(&state, b)?)
    }
}

// =============================================================================
// Device Opener
// =============================================================================

/// Scripted state of a device for exclusive opens
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Free,
    Busy,
    /// Open fails with this error kind
    Failing(ErrorKind),
}

/// Device opener answering from a per-path table; unknown paths are free
#[derive(Debug, Default)]
pub struct ScriptedDeviceOpener {
    states: RwLock<HashMap<PathBuf, DeviceState>>,
    opens: Mutex<Vec<PathBuf>>,
}

impl ScriptedDeviceOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(self, path: impl Into<PathBuf>, state: DeviceState) -> Self {
        self.set_state(path, state);
        self
    }

    pub fn set_state(&self, path: impl Into<PathBuf>, state: DeviceState) {
        self.states.write().insert(path.into(), state);
    }

    /// Paths opened so far, in order
    pub fn opens(&self) -> Vec<PathBuf> {
        self.opens.lock().clone()
    }
}

impl DeviceOpener for ScriptedDeviceOpener {
    fn open_exclusive(&self, path: &Path) -> io::Result<OpenOutcome> {
        self.opens.lock().push(path.to_path_buf());
        let state = self
            .states
            .read()
            .get(path)
            .copied()
            .unwrap_or(DeviceState::Free);

        match state {
            DeviceState::Free => Ok(OpenOutcome::Acquired(DeviceHandle::detached())),
            DeviceState::Busy => Ok(OpenOutcome::Busy),
            DeviceState::Failing(kind) => Err(io::Error::new(
                kind,
                format!("open {} failed", path.display()),
            )),
        }
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + by;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}
