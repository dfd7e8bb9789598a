//! Persistent registry of spawned agent processes.
//!
//! Every spawn writes a record so that agents orphaned by a host crash can
//! be reaped on the next start. The file is a single JSON array rewritten
//! atomically on every change; an unreadable or unknown-shape file is
//! treated as empty and overwritten on the next write.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::time;
use tracing::{debug, warn};

pub const REGISTRY_FILE_NAME: &str = "acp-processes.json";

/// Records older than this are dropped without inspection.
const RECORD_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);
const REAP_TERM_WAIT: Duration = Duration::from_secs(2);
const REAP_KILL_WAIT: Duration = Duration::from_secs(1);
const REAP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One spawned peer, as persisted across host runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessRecord {
    pub pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pgid: Option<i32>,
    pub agent_path: PathBuf,
    /// Unix epoch seconds at spawn time.
    pub started_at: u64,
}

/// Handle on the registry file.
pub struct OrphanRegistry {
    path: PathBuf,
}

impl OrphanRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Registry at `<app-support>/ACP/acp-processes.json`.
    pub fn open_default() -> Self {
        let base = dirs::data_dir().unwrap_or_else(std::env::temp_dir);
        Self::new(base.join("ACP").join(REGISTRY_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<ProcessRecord> {
        match std::fs::read(&self.path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
                debug!(%error, path = %self.path.display(), "unreadable registry treated as empty");
                Vec::new()
            }),
            Err(_) => Vec::new(),
        }
    }

    fn store(&self, records: &[ProcessRecord]) -> std::io::Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent)?;
        let file = NamedTempFile::new_in(parent)?;
        serde_json::to_writer_pretty(file.as_file(), records)?;
        file.persist(&self.path).map_err(|error| error.error)?;
        Ok(())
    }

    /// Adds (or refreshes) the record for a freshly spawned peer.
    pub fn record(&self, record: ProcessRecord) {
        let mut records = self.load();
        records.retain(|existing| existing.pid != record.pid);
        records.push(record);
        if let Err(error) = self.store(&records) {
            warn!(%error, path = %self.path.display(), "failed to write process registry");
        }
    }

    /// Drops the record for a terminated peer.
    pub fn remove(&self, pid: u32) {
        let mut records = self.load();
        let before = records.len();
        records.retain(|existing| existing.pid != pid);
        if records.len() == before {
            return;
        }
        if let Err(error) = self.store(&records) {
            warn!(%error, path = %self.path.display(), "failed to write process registry");
        }
    }

    /// Terminates agents left over from prior runs. Entries older than seven
    /// days, already-dead pids, and pids reused by unrelated commands are
    /// dropped without signalling; only processes that survive SIGKILL stay
    /// in the registry. Errors are logged and never abort the caller.
    pub async fn reap_orphans(&self) -> usize {
        let records = self.load();
        if records.is_empty() {
            return 0;
        }

        let commands = match tokio::task::spawn_blocking(process_command_lines).await {
            Ok(commands) => commands,
            Err(error) => {
                warn!(%error, "process enumeration failed; skipping orphan reap");
                return 0;
            }
        };

        let now = epoch_seconds();
        let mut survivors = Vec::new();
        let mut reaped = 0;

        for record in records {
            if now.saturating_sub(record.started_at) > RECORD_MAX_AGE.as_secs() {
                debug!(pid = record.pid, "dropping stale registry record");
                continue;
            }
            let Some(command) = commands.get(&record.pid) else {
                continue;
            };
            let agent_path = record.agent_path.to_string_lossy();
            if !command.contains(agent_path.as_ref()) {
                debug!(pid = record.pid, "pid reused by an unrelated command");
                continue;
            }

            signal_record(&record, Signal::SIGTERM);
            if wait_for_death(record.pid, REAP_TERM_WAIT).await {
                reaped += 1;
                continue;
            }
            signal_record(&record, Signal::SIGKILL);
            if wait_for_death(record.pid, REAP_KILL_WAIT).await {
                reaped += 1;
                continue;
            }
            warn!(pid = record.pid, "orphaned agent resisted SIGKILL");
            survivors.push(record);
        }

        if let Err(error) = self.store(&survivors) {
            warn!(%error, path = %self.path.display(), "failed to write process registry");
        }
        reaped
    }
}

pub(crate) fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}

fn process_command_lines() -> HashMap<u32, String> {
    let system = sysinfo::System::new_all();
    system
        .processes()
        .iter()
        .map(|(pid, process)| (pid.as_u32(), process.cmd().join(" ")))
        .collect()
}

fn signal_record(record: &ProcessRecord, signal: Signal) {
    let outcome = match record.pgid {
        Some(pgid) => killpg(Pid::from_raw(pgid), signal),
        None => kill(Pid::from_raw(record.pid as i32), signal),
    };
    if let Err(errno) = outcome {
        if errno != Errno::ESRCH {
            debug!(pid = record.pid, %errno, ?signal, "failed to signal orphan");
        }
    }
}

async fn wait_for_death(pid: u32, limit: Duration) -> bool {
    let deadline = time::Instant::now() + limit;
    loop {
        if !process_alive(pid) {
            return true;
        }
        if time::Instant::now() >= deadline {
            return false;
        }
        time::sleep(REAP_POLL_INTERVAL).await;
    }
}

/// Zombies count as dead: the process can no longer hold any resources and
/// signal delivery to it is meaningless.
fn process_alive(pid: u32) -> bool {
    if kill(Pid::from_raw(pid as i32), None).is_err() {
        return false;
    }
    !is_zombie(pid)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // `/proc/<pid>/stat` is "pid (comm) state ..."; comm may contain ')'
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            stat.rsplit(')')
                .next()
                .map(|rest| rest.trim_start().starts_with('Z'))
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_registry() -> (tempfile::TempDir, OrphanRegistry) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = OrphanRegistry::new(dir.path().join(REGISTRY_FILE_NAME));
        (dir, registry)
    }

    fn record(pid: u32, path: &str, started_at: u64) -> ProcessRecord {
        ProcessRecord {
            pid,
            pgid: None,
            agent_path: PathBuf::from(path),
            started_at,
        }
    }

    #[test]
    fn records_round_trip() {
        let (_dir, registry) = temp_registry();
        registry.record(record(100, "/opt/agent", 1_700_000_000));
        registry.record(record(200, "/opt/other", 1_700_000_001));
        assert_eq!(registry.load().len(), 2);

        registry.remove(100);
        let remaining = registry.load();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].pid, 200);
    }

    #[test]
    fn recording_same_pid_replaces_entry() {
        let (_dir, registry) = temp_registry();
        registry.record(record(100, "/opt/agent", 1));
        registry.record(record(100, "/opt/agent", 2));
        let records = registry.load();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].started_at, 2);
    }

    #[test]
    fn unknown_shape_file_is_treated_as_empty() {
        let (_dir, registry) = temp_registry();
        std::fs::create_dir_all(registry.path().parent().unwrap()).unwrap();
        std::fs::write(registry.path(), b"{\"version\":9,\"entries\":[]}").unwrap();
        assert!(registry.load().is_empty());

        registry.record(record(5, "/opt/agent", 1));
        assert_eq!(registry.load().len(), 1);
    }

    #[tokio::test]
    async fn reap_drops_dead_and_stale_records() {
        let (_dir, registry) = temp_registry();
        // pid 0 is never a live agent; ancient started_at exercises pruning
        registry.record(record(u32::MAX - 7, "/opt/agent", epoch_seconds()));
        registry.record(record(u32::MAX - 8, "/opt/agent", 0));
        registry.reap_orphans().await;
        assert!(registry.load().is_empty());
    }

    #[tokio::test]
    async fn reap_kills_recorded_child() {
        let (_dir, registry) = temp_registry();
        let mut child = std::process::Command::new("/bin/sleep")
            .arg("60")
            .spawn()
            .expect("spawn sleep");
        registry.record(record(child.id(), "/bin/sleep", epoch_seconds()));

        let reaped = registry.reap_orphans().await;
        assert_eq!(reaped, 1);
        assert!(registry.load().is_empty());

        let status = child.wait().expect("reap test child");
        assert!(!status.success());
    }
}
