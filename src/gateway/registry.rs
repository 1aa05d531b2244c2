//! Registry of live script processes, plus process-tree termination.
//!
//! Termination is advisory: failures are logged at debug level and
//! swallowed. If the kill does not land, grandchildren of the interpreter
//! may outlive the gateway.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

/// Unique key of one invocation: script path plus a monotonic counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey(String);

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Live processes keyed by invocation. Safe to share between tasks; the
/// lock is only held for single map operations.
#[derive(Default)]
pub struct ProcessRegistry {
    counter: AtomicU64,
    entries: Mutex<HashMap<ProcessKey, u32>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mints a fresh key for `script`.
    pub fn next_key(&self, script: &Path) -> ProcessKey {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        ProcessKey(format!("{}_{n}", script.display()))
    }

    pub fn insert(&self, key: ProcessKey, pid: u32) {
        self.lock().insert(key, pid);
    }

    pub fn remove(&self, key: &ProcessKey) -> Option<u32> {
        self.lock().remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Empties the registry and returns what was in it.
    pub fn drain(&self) -> Vec<(ProcessKey, u32)> {
        self.lock().drain().collect()
    }

    /// Kills every tracked tree and leaves the registry empty.
    pub fn terminate_all(&self) -> usize {
        let entries = self.drain();
        for (key, pid) in &entries {
            info!("Terminating process: {key} (pid {pid})");
            kill_tree(*pid);
        }
        entries.len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessKey, u32>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Kills the process group led by `pid` (children are spawned as group
/// leaders).
#[cfg(unix)]
pub fn kill_tree(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::{getpgrp, Pid};

    let Ok(raw) = i32::try_from(pid) else {
        debug!("Pid {pid} out of range, not signalling");
        return;
    };
    let pgid = Pid::from_raw(raw);
    // Never signal our own group.
    if raw <= 1 || pgid == getpgrp() {
        return;
    }
    if let Err(e) = killpg(pgid, Signal::SIGKILL) {
        debug!("killpg({pid}) failed: {e}");
    }
}

/// Kills `pid` and its descendants via `taskkill /T /F`.
#[cfg(windows)]
pub fn kill_tree(pid: u32) {
    let result = std::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .spawn();
    if let Err(e) = result {
        debug!("taskkill for {pid} failed: {e}");
    }
}

#[cfg(not(any(unix, windows)))]
pub fn kill_tree(pid: u32) {
    debug!("Process-tree termination unsupported on this platform (pid {pid})");
}
