//! Spawning and terminating the remote agent process.
//!
//! The supervisor resolves the executable (one symlink hop, node-shebang
//! interpreter discovery), layers the launch environment over the login-shell
//! snapshot, starts the child in its own process group with piped stdio, and
//! records it in the orphan registry. Stdout and stdin become the connection
//! transport; stderr is logged line by line. Termination escalates from
//! SIGTERM to SIGKILL against the whole group.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use nix::{
    errno::Errno,
    sys::signal::{kill, killpg, Signal},
    unistd::Pid,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, BufReader},
    process::{Child, ChildStderr, Command},
    sync::{watch, Mutex},
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};

use crate::{
    error::AcpError,
    registry::{epoch_seconds, OrphanRegistry, ProcessRecord},
    shell_env,
    transport::Transport,
};

const TERMINATE_GRACE: Duration = Duration::from_secs(2);
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(50);

const NODE_SHEBANG: &[u8] = b"#!/usr/bin/env node";
const NODE_SEARCH_PREFIXES: &[&str] = &[
    "/usr/local/bin",
    "/opt/homebrew/bin",
    "/usr/bin",
    "/opt/local/bin",
];

/// Launch configuration for one agent process.
#[derive(Clone, Debug)]
pub struct PeerProcessConfig {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    /// Overrides layered on top of the shell environment snapshot.
    pub env: Vec<(String, String)>,
}

impl PeerProcessConfig {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// A running agent child plus its registry bookkeeping.
pub struct PeerProcess {
    pid: u32,
    pgid: Option<i32>,
    child: Arc<Mutex<Option<Child>>>,
    exit_rx: watch::Receiver<Option<Option<i32>>>,
    registry: Arc<OrphanRegistry>,
    transport: Option<Transport>,
    tasks: Vec<JoinHandle<()>>,
}

impl PeerProcess {
    pub async fn spawn(
        config: PeerProcessConfig,
        registry: Arc<OrphanRegistry>,
    ) -> Result<Self, AcpError> {
        let launch = resolve_launch(&config.executable).await?;

        let mut env = shell_env::snapshot().await;
        for (key, value) in &config.env {
            env.insert(key.clone(), value.clone());
        }
        if let Some(dir) = &config.working_dir {
            let dir = dir.display().to_string();
            env.insert("PWD".to_string(), dir.clone());
            env.insert("OLDPWD".to_string(), dir);
        }
        // sibling helper binaries next to the agent must stay discoverable
        if let Some(dir) = config.executable.parent().filter(|p| !p.as_os_str().is_empty()) {
            let existing = env.get("PATH").cloned().unwrap_or_default();
            let prefixed = if existing.is_empty() {
                dir.display().to_string()
            } else {
                format!("{}:{existing}", dir.display())
            };
            env.insert("PATH".to_string(), prefixed);
        }

        let mut command = Command::new(&launch.program);
        command
            .args(&launch.args)
            .args(&config.args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        if let Some(dir) = &config.working_dir {
            command.current_dir(dir);
        }

        let mut child = spawn_with_retry(&mut command, &launch.program).await?;
        let pid = child.id().ok_or_else(|| AcpError::Spawn {
            command: launch.program.display().to_string(),
            source: std::io::Error::other("child exited before its pid could be read"),
        })?;
        let pgid = Some(pid as i32);

        registry.record(ProcessRecord {
            pid,
            pgid,
            agent_path: config.executable.clone(),
            started_at: epoch_seconds(),
        });

        let stdin = child.stdin.take().ok_or_else(|| {
            AcpError::Transport(std::io::Error::other("child stdin unavailable"))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AcpError::Transport(std::io::Error::other("child stdout unavailable"))
        })?;
        let stderr = child.stderr.take();
        let transport = Transport::from_child_stdio(stdin, stdout);

        let mut tasks = Vec::new();
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(stderr_task(stderr)));
        }

        let child = Arc::new(Mutex::new(Some(child)));
        let (exit_tx, exit_rx) = watch::channel(None);
        tasks.push(tokio::spawn(monitor_task(
            Arc::clone(&child),
            exit_tx,
            Arc::clone(&registry),
            pid,
        )));

        Ok(Self {
            pid,
            pgid,
            child,
            exit_rx,
            registry,
            transport: Some(transport),
            tasks,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// The connection transport over the child's stdio; available once.
    pub fn take_transport(&mut self) -> Option<Transport> {
        self.transport.take()
    }

    /// `None` while running; `Some(code)` once exited.
    pub fn exit_status(&self) -> Option<Option<i32>> {
        *self.exit_rx.borrow()
    }

    /// Watch stream publishing the exit status exactly once.
    pub fn exit_watch(&self) -> watch::Receiver<Option<Option<i32>>> {
        self.exit_rx.clone()
    }

    /// Resolves with the exit code once the child is gone.
    pub async fn wait_exited(&self) -> Option<i32> {
        let mut rx = self.exit_rx.clone();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                return self.exit_status().flatten();
            }
        }
    }

    /// Graceful group termination: SIGTERM, a bounded wait, then SIGKILL.
    /// Pipes drain naturally as the reader hits end-of-stream. Idempotent.
    pub async fn terminate(&self) -> Result<Option<i32>, AcpError> {
        if let Some(code) = self.exit_status() {
            self.registry.remove(self.pid);
            return Ok(code);
        }

        self.signal(Signal::SIGTERM);
        if self.wait_with_limit(TERMINATE_GRACE).await.is_none() {
            self.signal(Signal::SIGKILL);
            let _ = self.wait_with_limit(TERMINATE_GRACE).await;
        }
        self.registry.remove(self.pid);
        Ok(self.exit_status().flatten())
    }

    fn signal(&self, signal: Signal) {
        let outcome = match self.pgid {
            Some(pgid) => killpg(Pid::from_raw(pgid), signal),
            None => kill(Pid::from_raw(self.pid as i32), signal),
        };
        if let Err(errno) = outcome {
            if errno != Errno::ESRCH {
                debug!(pid = self.pid, %errno, ?signal, "failed to signal peer");
            }
        }
    }

    async fn wait_with_limit(&self, limit: Duration) -> Option<Option<i32>> {
        let mut rx = self.exit_rx.clone();
        let deadline = time::Instant::now() + limit;
        loop {
            if let Some(code) = *rx.borrow() {
                return Some(code);
            }
            let remaining = deadline.checked_duration_since(time::Instant::now())?;
            match time::timeout(remaining, rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return *rx.borrow(),
                Err(_) => return None,
            }
        }
    }
}

impl Drop for PeerProcess {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                let _ = child.start_kill();
            }
        }
    }
}

struct Launch {
    program: PathBuf,
    args: Vec<OsString>,
}

/// Follows one symlink hop and sniffs the first 64 bytes for a
/// `#!/usr/bin/env node` shebang; such scripts launch through a discovered
/// `node` interpreter with the original path as first argument.
async fn resolve_launch(executable: &Path) -> Result<Launch, AcpError> {
    let resolved = match tokio::fs::read_link(executable).await {
        Ok(target) if target.is_absolute() => target,
        Ok(target) => executable
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(target),
        Err(_) => executable.to_path_buf(),
    };

    let head = read_head(&resolved).await;
    if head.starts_with(NODE_SHEBANG) {
        let node = find_node_interpreter(executable, &resolved)
            .await
            .ok_or_else(|| AcpError::ExecutableNotFound("node".to_string()))?;
        return Ok(Launch {
            program: node,
            args: vec![executable.as_os_str().to_os_string()],
        });
    }

    Ok(Launch {
        program: executable.to_path_buf(),
        args: Vec::new(),
    })
}

async fn read_head(path: &Path) -> Vec<u8> {
    let Ok(mut file) = tokio::fs::File::open(path).await else {
        return Vec::new();
    };
    let mut head = vec![0u8; 64];
    let mut filled = 0;
    while filled < head.len() {
        match file.read(&mut head[filled..]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => filled += n,
        }
    }
    head.truncate(filled);
    head
}

async fn find_node_interpreter(executable: &Path, resolved: &Path) -> Option<PathBuf> {
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Some(dir) = executable.parent() {
        dirs.push(dir.to_path_buf());
    }
    if let Some(dir) = resolved.parent() {
        dirs.push(dir.to_path_buf());
    }
    dirs.extend(NODE_SEARCH_PREFIXES.iter().map(PathBuf::from));

    for dir in dirs {
        let candidate = dir.join("node");
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Some(candidate);
        }
    }
    None
}

async fn spawn_with_retry(command: &mut Command, program: &Path) -> Result<Child, AcpError> {
    let mut backoff = Duration::from_millis(2);
    for attempt in 0..5 {
        match command.spawn() {
            Ok(child) => return Ok(child),
            Err(source) => {
                // ETXTBSY shows up when the binary was just written
                let is_busy = source.raw_os_error() == Some(26);
                if is_busy && attempt < 4 {
                    time::sleep(backoff).await;
                    backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                    continue;
                }
                return Err(AcpError::Spawn {
                    command: program.display().to_string(),
                    source,
                });
            }
        }
    }
    unreachable!("spawn retry loop returns before exhausting attempts")
}

async fn stderr_task(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(target: "acp::peer_stderr", "{line}");
    }
}

async fn monitor_task(
    child: Arc<Mutex<Option<Child>>>,
    exit_tx: watch::Sender<Option<Option<i32>>>,
    registry: Arc<OrphanRegistry>,
    pid: u32,
) {
    loop {
        {
            let mut guard = child.lock().await;
            match guard.as_mut() {
                None => {
                    let _ = exit_tx.send(Some(None));
                    return;
                }
                Some(running) => match running.try_wait() {
                    Ok(Some(status)) => {
                        let code = status.code();
                        *guard = None;
                        drop(guard);
                        registry.remove(pid);
                        let _ = exit_tx.send(Some(code));
                        return;
                    }
                    Ok(None) => {}
                    Err(error) => {
                        warn!(pid, %error, "failed to poll peer process");
                        drop(guard);
                        let _ = exit_tx.send(Some(None));
                        return;
                    }
                },
            }
        }
        time::sleep(EXIT_POLL_INTERVAL).await;
    }
}
