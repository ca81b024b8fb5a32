//! Keyed process registry.
//!
//! Every process under our control is stored both in a hash keyed by
//! (grid, cluster, node) and in a dense slot array for iteration, under
//! one mutex. Start reconciles against live OS processes before it
//! claims a key: a registry entry whose pid is gone is evidence, not
//! truth, and the liveness probe decides.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::osutil;

/// Process key: grid, cluster and node names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub grid: String,
    pub cluster: String,
    pub node: String,
}

/// Partial key used by list queries. Empty fields match everything
/// below them: no grid lists every process, grid only lists the whole
/// grid, and so on.
#[derive(Debug, Clone, Default)]
pub struct ProcessFilter {
    pub grid: Option<String>,
    pub cluster: Option<String>,
    pub node: Option<String>,
}

impl ProcessFilter {
    pub fn matches(&self, key: &ProcessKey) -> bool {
        let Some(grid) = &self.grid else { return true };
        if grid != &key.grid {
            return false;
        }
        let Some(cluster) = &self.cluster else { return true };
        if cluster != &key.cluster {
            return false;
        }
        let Some(node) = &self.node else { return true };
        node == &key.node
    }
}

/// One controlled process.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub key: ProcessKey,
    pub program: String,
    pub version_string: String,
    pub autorestart: bool,
    pub parameters: Vec<String>,
    /// 0 while the start is in progress.
    pub pid: u32,
    /// Monotonic id distinguishing reuses of the same key.
    pub start_id: u64,
    /// When the running instance was registered.
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub kill_ongoing: bool,
}

struct Inner {
    by_key: HashMap<ProcessKey, usize>,
    slots: Vec<Option<ProcessEntry>>,
    next_start_id: u64,
}

/// The registry.
pub struct ProcessRegistry {
    inner: Mutex<Inner>,
}

impl Default for ProcessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Probe whether `pid` is alive and still runs `program`.
///
/// Distinguishes three outcomes: alive, dead, and "the probe itself
/// failed", which callers must not confuse with either.
pub fn verify_process(pid: u32, program: &str) -> Result<bool> {
    if !osutil::is_pid_alive(pid)? {
        return Ok(false);
    }
    match std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
        Ok(comm) => {
            let running = comm.trim();
            let expected = std::path::Path::new(program)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(program);
            // comm is truncated to 15 bytes by the kernel
            Ok(expected.starts_with(running) || running.starts_with(expected))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::ChildCheckFailed(format!(
            "cannot inspect pid {}: {}",
            pid, e
        ))),
    }
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                by_key: HashMap::new(),
                slots: Vec::new(),
                next_start_id: 1,
            }),
        }
    }

    /// Claim the key for a new start by inserting a reservation with
    /// pid 0. Reconciles against an existing entry: a starting entry
    /// declines, a dying entry is awaited, a dead one is replaced, a
    /// live one wins.
    pub async fn begin_start(&self, entry: ProcessEntry) -> Result<()> {
        let mut prev_start_id = 0u64;
        let mut kill_retries = 0u32;
        loop {
            enum Decision {
                Reserved,
                Probe { pid: u32, start_id: u64, program: String },
                WaitForKill,
            }
            let decision = {
                let mut g = self.inner.lock().expect("registry lock");
                match g.by_key.get(&entry.key).copied() {
                    None => {
                        let mut reservation = entry.clone();
                        reservation.pid = 0;
                        reservation.start_id = 0;
                        reservation.kill_ongoing = false;
                        let slot = g.slots.iter().position(|s| s.is_none()).unwrap_or_else(|| {
                            g.slots.push(None);
                            g.slots.len() - 1
                        });
                        g.slots[slot] = Some(reservation);
                        g.by_key.insert(entry.key.clone(), slot);
                        Decision::Reserved
                    }
                    Some(slot) => {
                        let existing = g.slots[slot].as_ref().expect("indexed entry");
                        if existing.pid == 0 {
                            return Err(Error::StartAlreadyOngoing);
                        }
                        if existing.kill_ongoing {
                            Decision::WaitForKill
                        } else if existing.start_id == prev_start_id {
                            // second look: the same dead instance is
                            // still registered, safe to replace it
                            let mut reservation = entry.clone();
                            reservation.pid = 0;
                            reservation.start_id = 0;
                            reservation.kill_ongoing = false;
                            g.slots[slot] = Some(reservation);
                            Decision::Reserved
                        } else {
                            Decision::Probe {
                                pid: existing.pid,
                                start_id: existing.start_id,
                                program: existing.program.clone(),
                            }
                        }
                    }
                }
            };
            match decision {
                Decision::Reserved => return Ok(()),
                Decision::WaitForKill => {
                    kill_retries += 1;
                    if kill_retries > 10 {
                        return Err(Error::ProcessAlreadyRunning);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Decision::Probe {
                    pid,
                    start_id,
                    program,
                } => {
                    // probe outside the lock so it is never a hotspot
                    if verify_process(pid, &program)? {
                        return Err(Error::ProcessAlreadyRunning);
                    }
                    debug!(pid, "registered process found dead, reclaiming key");
                    prev_start_id = start_id;
                }
            }
        }
    }

    /// Fill in the pid of a reservation and stamp a fresh start id.
    pub fn commit_start(&self, key: &ProcessKey, pid: u32) -> Result<u64> {
        let mut g = self.inner.lock().expect("registry lock");
        let slot = *g
            .by_key
            .get(key)
            .ok_or_else(|| Error::Internal("commit without reservation".into()))?;
        let start_id = g.next_start_id;
        g.next_start_id += 1;
        let entry = g.slots[slot].as_mut().expect("indexed entry");
        entry.pid = pid;
        entry.start_id = start_id;
        entry.started_at = chrono::Utc::now();
        info!(
            pid,
            start_id,
            program = %entry.program,
            started_at = %entry.started_at,
            "process registered"
        );
        Ok(start_id)
    }

    /// Drop a reservation after a failed spawn.
    pub fn abort_start(&self, key: &ProcessKey) {
        let mut g = self.inner.lock().expect("registry lock");
        if let Some(slot) = g.by_key.remove(key) {
            g.slots[slot] = None;
        }
    }

    /// Stop (`hard == false`) or kill (`hard == true`) the process
    /// under `key`. Stopping an absent process succeeds: the goal was
    /// for it not to run.
    pub async fn stop(&self, key: &ProcessKey, hard: bool) -> Result<()> {
        let mut start_retries = 0u32;
        let (pid, start_id, program) = loop {
            let found = {
                let mut g = self.inner.lock().expect("registry lock");
                match g.by_key.get(key).copied() {
                    None => return Ok(()),
                    Some(slot) => {
                        let entry = g.slots[slot].as_mut().expect("indexed entry");
                        if entry.pid == 0 {
                            None // still starting
                        } else if entry.kill_ongoing {
                            return Err(Error::ProcessAlreadyBeingKilled);
                        } else {
                            entry.kill_ongoing = true;
                            Some((entry.pid, entry.start_id, entry.program.clone()))
                        }
                    }
                }
            };
            match found {
                Some(triple) => break triple,
                None => {
                    start_retries += 1;
                    if start_retries >= 10 {
                        return Err(Error::ProcessStuckInStart);
                    }
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        };

        osutil::kill_pid(pid, hard)?;
        let mut alive = true;
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            match verify_process(pid, &program) {
                Ok(false) => {
                    alive = false;
                    break;
                }
                Ok(true) => {}
                Err(e) => {
                    self.clear_kill_flag(key);
                    return Err(e);
                }
            }
        }
        if alive {
            self.clear_kill_flag(key);
            return Err(Error::FailedToStopProcess);
        }
        // the kill_ongoing flag kept everyone else away; the same
        // instance must still be registered
        let mut g = self.inner.lock().expect("registry lock");
        match g.by_key.get(key).copied() {
            Some(slot)
                if g.slots[slot]
                    .as_ref()
                    .map(|e| e.pid == pid && e.start_id == start_id)
                    .unwrap_or(false) =>
            {
                g.by_key.remove(key);
                g.slots[slot] = None;
                info!(pid, "process stopped and removed");
                Ok(())
            }
            _ => Err(Error::Internal(
                "process entry changed while kill was ongoing".into(),
            )),
        }
    }

    fn clear_kill_flag(&self, key: &ProcessKey) {
        let mut g = self.inner.lock().expect("registry lock");
        if let Some(slot) = g.by_key.get(key).copied() {
            if let Some(entry) = g.slots[slot].as_mut() {
                entry.kill_ongoing = false;
            }
        }
    }

    /// Snapshot every entry matching the filter. Deep copies, so the
    /// caller iterates without the registry lock.
    pub fn list(&self, filter: &ProcessFilter) -> Vec<ProcessEntry> {
        let g = self.inner.lock().expect("registry lock");
        g.slots
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|e| filter.matches(&e.key))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        let g = self.inner.lock().expect("registry lock");
        g.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
