//! Shell command execution on behalf of the remote agent.
//!
//! Each `terminal/create` spawns a child whose stdout and stderr feed one
//! rolling output buffer with a byte cap; oldest bytes are dropped and the
//! truncation flag latches once anything is lost. Sessions outlive any single
//! RPC: callers poll output, await exit, kill, and finally release. Released
//! sessions keep their last output and exit status readable from a bounded
//! LRU until evicted.

use std::{
    collections::HashMap,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use lru::LruCache;
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use parking_lot::Mutex;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::oneshot,
    task::JoinHandle,
    time,
};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::AcpError, shell_env};

/// Default cap on a terminal's rolling output buffer.
pub const DEFAULT_OUTPUT_BYTE_LIMIT: usize = 1_000_000;
/// Default capacity of the released-terminal cache.
pub const DEFAULT_RELEASED_CAPACITY: usize = 50;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const TERMINATE_GRACE: Duration = Duration::from_secs(2);

/// Substrings that force interpretation through `sh -c`.
const SHELL_METACHARACTERS: &[&str] = &["|", "&&", "||", ";", ">", ">>", "<", "$(", "`", "&"];

/// Fixed search list for bare program names, tried before `which`.
const PROGRAM_SEARCH_PATHS: &[&str] = &[
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/opt/homebrew/bin",
    "/opt/local/bin",
];

/// Request shape for creating a terminal session.
#[derive(Clone, Debug, Default)]
pub struct CreateTerminalParams {
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub output_byte_limit: Option<usize>,
}

impl CreateTerminalParams {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }
}

/// Observed child exit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalExit {
    pub code: Option<i32>,
    pub signal: Option<i32>,
}

/// Snapshot returned by `terminal/output`.
#[derive(Clone, Debug)]
pub struct TerminalOutput {
    pub output: String,
    pub truncated: bool,
    pub exit: Option<TerminalExit>,
}

#[derive(Debug)]
struct OutputBuffer {
    data: Vec<u8>,
    limit: usize,
    truncated: bool,
}

impl OutputBuffer {
    fn new(limit: usize) -> Self {
        Self {
            data: Vec::new(),
            limit,
            truncated: false,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        self.data.extend_from_slice(chunk);
        if self.data.len() > self.limit {
            let excess = self.data.len() - self.limit;
            self.data.drain(..excess);
            self.truncated = true;
        }
    }
}

#[derive(Default)]
struct ExitState {
    exit: Option<TerminalExit>,
    waiters: Vec<oneshot::Sender<TerminalExit>>,
}

struct TerminalShared {
    id: String,
    pid: Option<u32>,
    buffer: Mutex<OutputBuffer>,
    exit: Mutex<ExitState>,
}

struct LiveTerminal {
    shared: Arc<TerminalShared>,
    pumps: Vec<JoinHandle<()>>,
    monitor: JoinHandle<()>,
}

struct ReleasedTerminal {
    output: Vec<u8>,
    truncated: bool,
    exit: Option<TerminalExit>,
}

struct ManagerState {
    live: HashMap<String, LiveTerminal>,
    released: LruCache<String, ReleasedTerminal>,
}

/// Owner of every live and released terminal session.
pub struct TerminalManager {
    state: Mutex<ManagerState>,
    default_byte_limit: usize,
}

impl Default for TerminalManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalManager {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_OUTPUT_BYTE_LIMIT, DEFAULT_RELEASED_CAPACITY)
    }

    pub fn with_limits(default_byte_limit: usize, released_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(released_capacity.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(ManagerState {
                live: HashMap::new(),
                released: LruCache::new(capacity),
            }),
            default_byte_limit,
        }
    }

    /// Spawns a command and returns the opaque terminal id.
    pub async fn create(&self, params: CreateTerminalParams) -> Result<String, AcpError> {
        let plan = plan_command(&params.command, &params.args)?;
        let (program, args) = match plan {
            CommandPlan::Shell { script } => {
                (PathBuf::from("/bin/sh"), vec!["-c".to_string(), script])
            }
            CommandPlan::Exec { program, args } => (resolve_program(&program).await?, args),
        };

        let mut env = shell_env::snapshot().await;
        for (key, value) in &params.env {
            env.insert(key.clone(), value.clone());
        }

        let mut command = Command::new(&program);
        command
            .args(&args)
            .env_clear()
            .envs(&env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &params.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                AcpError::ExecutableNotFound(program.display().to_string())
            } else {
                AcpError::Spawn {
                    command: program.display().to_string(),
                    source,
                }
            }
        })?;

        let id = Uuid::new_v4().to_string();
        let limit = params.output_byte_limit.unwrap_or(self.default_byte_limit);
        let shared = Arc::new(TerminalShared {
            id: id.clone(),
            pid: child.id(),
            buffer: Mutex::new(OutputBuffer::new(limit)),
            exit: Mutex::new(ExitState::default()),
        });

        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_output(stdout, Arc::clone(&shared))));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_output(stderr, Arc::clone(&shared))));
        }
        let monitor = tokio::spawn(monitor_exit(child, Arc::clone(&shared)));

        self.state.lock().live.insert(
            id.clone(),
            LiveTerminal {
                shared,
                pumps,
                monitor,
            },
        );
        Ok(id)
    }

    /// Returns the current output snapshot plus exit status if the child has
    /// exited. Works for live and released sessions; the pump tasks keep the
    /// buffer current so there is nothing further to drain here.
    pub fn output(&self, id: &str) -> Result<TerminalOutput, AcpError> {
        let mut state = self.state.lock();
        if let Some(live) = state.live.get(id) {
            let buffer = live.shared.buffer.lock();
            let exit = live.shared.exit.lock().exit.clone();
            return Ok(TerminalOutput {
                output: String::from_utf8_lossy(&buffer.data).into_owned(),
                truncated: buffer.truncated,
                exit,
            });
        }
        if let Some(released) = state.released.get(id) {
            return Ok(TerminalOutput {
                output: String::from_utf8_lossy(&released.output).into_owned(),
                truncated: released.truncated,
                exit: released.exit.clone(),
            });
        }
        Err(AcpError::TerminalNotFound(id.to_string()))
    }

    /// Resolves when the child exits; immediate if it already has.
    pub async fn wait_for_exit(&self, id: &str) -> Result<TerminalExit, AcpError> {
        let rx = {
            let state = self.state.lock();
            if let Some(live) = state.live.get(id) {
                let mut exit = live.shared.exit.lock();
                if let Some(done) = &exit.exit {
                    return Ok(done.clone());
                }
                let (tx, rx) = oneshot::channel();
                exit.waiters.push(tx);
                rx
            } else if state.released.contains(id) {
                return Err(AcpError::TerminalReleased(id.to_string()));
            } else {
                return Err(AcpError::TerminalNotFound(id.to_string()));
            }
        };
        rx.await.map_err(|_| AcpError::ChannelClosed)
    }

    /// Terminates the child and returns the observed exit; every pending
    /// waiter resolves with the same value.
    pub async fn kill(&self, id: &str) -> Result<TerminalExit, AcpError> {
        let shared = self.live_shared(id)?;
        terminate_child(&shared).await;
        self.wait_for_exit(id).await
    }

    /// Terminates the child if still running, drains its pipes, and demotes
    /// the session into the released cache.
    pub async fn release(&self, id: &str) -> Result<(), AcpError> {
        let live = {
            let mut state = self.state.lock();
            if state.released.contains(id) {
                return Err(AcpError::TerminalReleased(id.to_string()));
            }
            state
                .live
                .remove(id)
                .ok_or_else(|| AcpError::TerminalNotFound(id.to_string()))?
        };

        terminate_child(&live.shared).await;
        let exit = wait_exit(&live.shared).await;
        for pump in live.pumps {
            let _ = pump.await;
        }
        let _ = live.monitor.await;

        let (output, truncated) = {
            let buffer = live.shared.buffer.lock();
            (buffer.data.clone(), buffer.truncated)
        };
        self.state.lock().released.put(
            id.to_string(),
            ReleasedTerminal {
                output,
                truncated,
                exit: Some(exit),
            },
        );
        Ok(())
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    fn live_shared(&self, id: &str) -> Result<Arc<TerminalShared>, AcpError> {
        let state = self.state.lock();
        if let Some(live) = state.live.get(id) {
            Ok(Arc::clone(&live.shared))
        } else if state.released.contains(id) {
            Err(AcpError::TerminalReleased(id.to_string()))
        } else {
            Err(AcpError::TerminalNotFound(id.to_string()))
        }
    }
}

async fn pump_output<R: AsyncRead + Unpin>(mut reader: R, shared: Arc<TerminalShared>) {
    let mut chunk = [0u8; 4096];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => shared.buffer.lock().push(&chunk[..n]),
        }
    }
}

async fn monitor_exit(mut child: Child, shared: Arc<TerminalShared>) {
    let exit = loop {
        match child.try_wait() {
            Ok(Some(status)) => break exit_from_status(status),
            Ok(None) => time::sleep(EXIT_POLL_INTERVAL).await,
            Err(error) => {
                warn!(terminal = %shared.id, %error, "failed to poll terminal child");
                break TerminalExit {
                    code: None,
                    signal: None,
                };
            }
        }
    };

    let waiters = {
        let mut state = shared.exit.lock();
        state.exit = Some(exit.clone());
        std::mem::take(&mut state.waiters)
    };
    for waiter in waiters {
        let _ = waiter.send(exit.clone());
    }
}

/// Awaits the exit already being recorded, registering a waiter if needed.
async fn wait_exit(shared: &Arc<TerminalShared>) -> TerminalExit {
    let rx = {
        let mut state = shared.exit.lock();
        if let Some(done) = &state.exit {
            return done.clone();
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push(tx);
        rx
    };
    rx.await.unwrap_or(TerminalExit {
        code: None,
        signal: None,
    })
}

/// SIGTERM, bounded grace, then SIGKILL. No-op once the child has exited.
async fn terminate_child(shared: &Arc<TerminalShared>) {
    if shared.exit.lock().exit.is_some() {
        return;
    }
    signal_child(shared, Signal::SIGTERM);

    let deadline = time::Instant::now() + TERMINATE_GRACE;
    while time::Instant::now() < deadline {
        if shared.exit.lock().exit.is_some() {
            return;
        }
        time::sleep(Duration::from_millis(50)).await;
    }
    signal_child(shared, Signal::SIGKILL);
}

fn signal_child(shared: &TerminalShared, signal: Signal) {
    let Some(pid) = shared.pid else { return };
    if let Err(errno) = kill(Pid::from_raw(pid as i32), signal) {
        if errno != Errno::ESRCH {
            debug!(terminal = %shared.id, %errno, ?signal, "failed to signal terminal child");
        }
    }
}

fn exit_from_status(status: std::process::ExitStatus) -> TerminalExit {
    use std::os::unix::process::ExitStatusExt;
    TerminalExit {
        code: status.code(),
        signal: status.signal(),
    }
}

#[derive(Debug)]
enum CommandPlan {
    Shell { script: String },
    Exec { program: String, args: Vec<String> },
}

fn plan_command(command: &str, args: &[String]) -> Result<CommandPlan, AcpError> {
    if SHELL_METACHARACTERS
        .iter()
        .any(|meta| command.contains(meta))
    {
        let mut script = command.to_string();
        for arg in args {
            script.push(' ');
            script.push_str(arg);
        }
        return Ok(CommandPlan::Shell { script });
    }

    if args.is_empty() && (command.chars().any(char::is_whitespace) || command.contains('"')) {
        let mut tokens =
            shlex::split(command).ok_or_else(|| AcpError::CommandParse(command.to_string()))?;
        if tokens.is_empty() {
            return Err(AcpError::CommandParse(command.to_string()));
        }
        let program = tokens.remove(0);
        return Ok(CommandPlan::Exec {
            program,
            args: tokens,
        });
    }

    Ok(CommandPlan::Exec {
        program: command.to_string(),
        args: args.to_vec(),
    })
}

async fn resolve_program(program: &str) -> Result<PathBuf, AcpError> {
    if program.contains('/') {
        let candidate = PathBuf::from(program);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Ok(candidate);
        }
        return Err(AcpError::ExecutableNotFound(program.to_string()));
    }

    for dir in PROGRAM_SEARCH_PATHS {
        let candidate = Path::new(dir).join(program);
        if tokio::fs::metadata(&candidate).await.is_ok() {
            return Ok(candidate);
        }
    }

    if let Ok(output) = Command::new("which").arg(program).output().await {
        if output.status.success() {
            let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
    }
    Err(AcpError::ExecutableNotFound(program.to_string()))
}
