//! Process supervision for the proxy engine and the routing helper
//!
//! Each external binary is wrapped in a [`ManagedProcess`] state machine:
//!
//! ```text
//! Stopped -> Starting -> Running -> Stopping -> Stopped
//!               |           |
//!               +-> Crashed <+
//! ```
//!
//! Spawning, signalling and exit polling go through the [`Launcher`] and
//! [`ProcessHandle`] traits. [`CommandLauncher`] is the `tokio::process`
//! implementation; tests substitute a scripted fake.
//!
//! ## Output capture
//!
//! stdout and stderr are drained line by line by reader tasks into a bounded
//! [`LogBuffer`]. The buffer keeps the most recent lines only, and each line
//! is cut at [`MAX_LINE_BYTES`], so a noisy process cannot grow memory
//! without bound.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ProcessError, Result, StateError};

use super::config::LISTEN_ADDR;

/// Default window a freshly started process must survive
const DEFAULT_GRACE_MS: u64 = 1000;

/// Default wait after SIGTERM before escalating to SIGKILL
const DEFAULT_STOP_TIMEOUT_MS: u64 = 3000;

/// Default wait after SIGKILL
const DEFAULT_KILL_TIMEOUT_MS: u64 = 2000;

/// Default bound on waiting for the engine's SOCKS listener
const DEFAULT_LISTENER_TIMEOUT_MS: u64 = 5000;

/// Interval between listener connection attempts
const LISTENER_POLL_MS: u64 = 100;

/// Interval between exit polls inside the grace window
const GRACE_POLL_MS: u64 = 50;

/// Bound on draining reader tasks after an exit
const FLUSH_TIMEOUT_MS: u64 = 500;

/// Default number of captured output lines kept per process
pub const DEFAULT_LOG_CAPACITY: usize = 500;

/// Longest captured output line; the rest of the line is dropped
pub const MAX_LINE_BYTES: usize = 8192;

/// Lines of captured output attached to a startup failure
const STARTUP_OUTPUT_LINES: usize = 20;

/// Which supervised binary a process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The proxy engine (xray-core)
    Engine,
    /// The tun routing helper (tun2socks)
    Helper,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Engine => "engine",
            Role::Helper => "helper",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a managed process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessState {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    /// Exited without being asked to
    Crashed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Stopped => "stopped",
            ProcessState::Starting => "starting",
            ProcessState::Running => "running",
            ProcessState::Stopping => "stopping",
            ProcessState::Crashed => "crashed",
        }
    }

    /// Whether a new start is allowed from this state
    pub fn can_start(&self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observed process exit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Exited {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
}

/// Signal sent to stop a process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

// ==================== Log Capture ====================

/// Bounded ring buffer of captured output lines
#[derive(Debug)]
pub struct LogBuffer {
    lines: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl Default for LogBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// Append a line, evicting the oldest once full
    pub fn push(&self, line: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line.into());
    }

    /// The most recent `max` lines, oldest first
    pub fn tail(&self, max: usize) -> Vec<String> {
        let lines = self.lines.lock();
        let skip = lines.len().saturating_sub(max);
        lines.iter().skip(skip).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lines.lock().clear();
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

// ==================== Launch Primitives ====================

/// Program and arguments for one supervised process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub role: Role,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl LaunchSpec {
    /// `xray run -config <path>`
    pub fn engine(program: impl Into<PathBuf>, config: &Path) -> Self {
        Self {
            role: Role::Engine,
            program: program.into(),
            args: vec![
                "run".to_string(),
                "-config".to_string(),
                config.display().to_string(),
            ],
        }
    }

    /// `tun2socks -config <path>`
    pub fn helper(program: impl Into<PathBuf>, config: &Path) -> Self {
        Self {
            role: Role::Helper,
            program: program.into(),
            args: vec!["-config".to_string(), config.display().to_string()],
        }
    }
}

/// Spawns processes whose output is drained into a [`LogBuffer`]
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        logs: Arc<LogBuffer>,
    ) -> std::result::Result<Box<dyn ProcessHandle>, ProcessError>;
}

/// A live child process
#[async_trait]
pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Non-blocking exit poll
    fn try_exit(&mut self) -> Option<Exited>;

    fn signal(&mut self, signal: StopSignal) -> std::result::Result<(), ProcessError>;

    /// Wait for exit. Callers bound this with a timeout.
    async fn wait(&mut self) -> Exited;

    /// Let the output readers drain whatever the process wrote before exiting
    async fn flush_output(&mut self);
}

/// [`Launcher`] backed by `tokio::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

struct CommandHandle {
    role: Role,
    child: tokio::process::Child,
    readers: Vec<JoinHandle<()>>,
}

/// Read one `\n`-terminated line into `line`, keeping at most
/// [`MAX_LINE_BYTES`] of it. Returns `false` once the stream is exhausted.
async fn read_capped_line<R>(reader: &mut R, line: &mut Vec<u8>) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    line.clear();
    let mut read_any = false;
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(read_any);
        }
        read_any = true;

        let (chunk, used, complete) = match available.iter().position(|&b| b == b'\n') {
            Some(end) => (&available[..end], end + 1, true),
            None => (available, available.len(), false),
        };
        let room = MAX_LINE_BYTES.saturating_sub(line.len());
        line.extend_from_slice(&chunk[..chunk.len().min(room)]);
        reader.consume(used);

        if complete {
            return Ok(true);
        }
    }
}

/// Drain `stream` into `logs` until end of stream or a read error
async fn capture_lines<R>(role: Role, stream: R, logs: &LogBuffer)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    while let Ok(true) = read_capped_line(&mut reader, &mut line).await {
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        let text = String::from_utf8_lossy(&line).into_owned();
        tracing::trace!(%role, "{}", text);
        logs.push(text);
    }
}

fn spawn_reader<R>(role: Role, stream: R, logs: Arc<LogBuffer>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move { capture_lines(role, stream, &logs).await })
}

#[async_trait]
impl Launcher for CommandLauncher {
    async fn launch(
        &self,
        spec: &LaunchSpec,
        logs: Arc<LogBuffer>,
    ) -> std::result::Result<Box<dyn ProcessHandle>, ProcessError> {
        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                role: spec.role,
                program: spec.program.clone(),
                source,
            })?;

        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(spec.role, stdout, logs.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(spec.role, stderr, logs));
        }

        tracing::info!(role = %spec.role, pid = ?child.id(), program = %spec.program.display(), "launched");

        Ok(Box::new(CommandHandle {
            role: spec.role,
            child,
            readers,
        }))
    }
}

#[async_trait]
impl ProcessHandle for CommandHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Option<Exited> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(Exited {
                code: status.code(),
            }),
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(role = %self.role, "failed to poll process: {}", e);
                Some(Exited { code: None })
            }
        }
    }

    fn signal(&mut self, signal: StopSignal) -> std::result::Result<(), ProcessError> {
        let role = self.role;
        match signal {
            #[cfg(unix)]
            StopSignal::Terminate => {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                let Some(pid) = self.child.id() else {
                    return Ok(());
                };
                kill(Pid::from_raw(pid as i32), Signal::SIGTERM).map_err(|errno| ProcessError::Signal {
                    role,
                    source: errno.into(),
                })
            }
            #[cfg(not(unix))]
            StopSignal::Terminate => self
                .child
                .start_kill()
                .map_err(|source| ProcessError::Signal { role, source }),
            StopSignal::Kill => self
                .child
                .start_kill()
                .map_err(|source| ProcessError::Signal { role, source }),
        }
    }

    async fn wait(&mut self) -> Exited {
        match self.child.wait().await {
            Ok(status) => Exited {
                code: status.code(),
            },
            Err(e) => {
                tracing::warn!(role = %self.role, "failed to wait for process: {}", e);
                Exited { code: None }
            }
        }
    }

    async fn flush_output(&mut self) {
        for reader in self.readers.drain(..) {
            let _ = tokio::time::timeout(Duration::from_millis(FLUSH_TIMEOUT_MS), reader).await;
        }
    }
}

// ==================== Managed Process ====================

/// Timing bounds for every wait on a supervised process
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Window a freshly started process must survive
    pub grace: Duration,
    /// Wait after SIGTERM before SIGKILL
    pub stop_timeout: Duration,
    /// Wait after SIGKILL
    pub kill_timeout: Duration,
    /// Whether engine start waits for its SOCKS listener to accept connections
    pub await_listener: bool,
    pub listener_timeout: Duration,
    /// Captured output lines kept per process
    pub log_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            grace: Duration::from_millis(DEFAULT_GRACE_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            kill_timeout: Duration::from_millis(DEFAULT_KILL_TIMEOUT_MS),
            await_listener: true,
            listener_timeout: Duration::from_millis(DEFAULT_LISTENER_TIMEOUT_MS),
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    /// Builder method to set the start grace window
    pub fn grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Builder method to set the stop and kill timeouts
    pub fn stop_timeouts(mut self, stop: Duration, kill: Duration) -> Self {
        self.stop_timeout = stop;
        self.kill_timeout = kill;
        self
    }

    /// Builder method to enable/disable the listener readiness wait
    pub fn await_listener(mut self, enabled: bool) -> Self {
        self.await_listener = enabled;
        self
    }
}

/// One supervised process and its state machine
pub struct ManagedProcess {
    role: Role,
    state: ProcessState,
    handle: Option<Box<dyn ProcessHandle>>,
    logs: Arc<LogBuffer>,
    last_exit: Option<Exited>,
}

impl ManagedProcess {
    pub fn new(role: Role, log_capacity: usize) -> Self {
        Self {
            role,
            state: ProcessState::Stopped,
            handle: None,
            logs: Arc::new(LogBuffer::new(log_capacity)),
            last_exit: None,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    pub fn is_running(&self) -> bool {
        self.state == ProcessState::Running
    }

    pub fn pid(&self) -> Option<u32> {
        self.handle.as_ref().and_then(|h| h.pid())
    }

    /// Shared handle to the captured output
    pub fn log_buffer(&self) -> Arc<LogBuffer> {
        self.logs.clone()
    }

    /// Exit observed by the last crash or stop
    pub fn last_exit(&self) -> Option<Exited> {
        self.last_exit
    }

    /// Launch and require the process to survive the grace window
    pub async fn start(
        &mut self,
        launcher: &dyn Launcher,
        spec: &LaunchSpec,
        grace: Duration,
    ) -> Result<()> {
        if !self.state.can_start() {
            return Err(StateError::AlreadyRunning(self.role).into());
        }

        self.logs.clear();
        self.last_exit = None;
        self.state = ProcessState::Starting;

        let mut handle = match launcher.launch(spec, self.logs.clone()).await {
            Ok(handle) => handle,
            Err(e) => {
                self.state = ProcessState::Stopped;
                return Err(e.into());
            }
        };

        let deadline = Instant::now() + grace;
        loop {
            if let Some(exit) = handle.try_exit() {
                handle.flush_output().await;
                self.state = ProcessState::Crashed;
                self.last_exit = Some(exit);
                let output = self.logs.tail(STARTUP_OUTPUT_LINES).join("\n");
                tracing::error!(role = %self.role, code = ?exit.code, "exited during startup");
                return Err(ProcessError::ExitedDuringStartup {
                    role: self.role,
                    code: exit.code,
                    output,
                }
                .into());
            }

            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let step = Duration::from_millis(GRACE_POLL_MS).min(deadline - now);
            tokio::time::sleep(step).await;
        }

        tracing::info!(role = %self.role, pid = ?handle.pid(), "running");
        self.handle = Some(handle);
        self.state = ProcessState::Running;
        Ok(())
    }

    /// Poll for an unexpected exit; `Running` becomes `Crashed`
    pub async fn health_check(&mut self) -> ProcessState {
        if self.state != ProcessState::Running {
            return self.state;
        }
        let Some(handle) = self.handle.as_mut() else {
            return self.state;
        };
        if let Some(exit) = handle.try_exit() {
            handle.flush_output().await;
            tracing::warn!(role = %self.role, code = ?exit.code, "process exited unexpectedly");
            self.last_exit = Some(exit);
            self.state = ProcessState::Crashed;
        }
        self.state
    }

    /// SIGTERM, bounded wait, SIGKILL, bounded wait. Always ends `Stopped`.
    pub async fn stop(&mut self, stop_timeout: Duration, kill_timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            self.state = ProcessState::Stopped;
            return;
        };
        self.state = ProcessState::Stopping;

        let exit = match handle.try_exit() {
            Some(exit) => Some(exit),
            None => {
                if let Err(e) = handle.signal(StopSignal::Terminate) {
                    tracing::warn!(role = %self.role, "{}", e);
                }
                match tokio::time::timeout(stop_timeout, handle.wait()).await {
                    Ok(exit) => Some(exit),
                    Err(_) => {
                        tracing::warn!(role = %self.role, "did not exit after SIGTERM, killing");
                        if let Err(e) = handle.signal(StopSignal::Kill) {
                            tracing::warn!(role = %self.role, "{}", e);
                        }
                        tokio::time::timeout(kill_timeout, handle.wait()).await.ok()
                    }
                }
            }
        };

        match exit {
            Some(exit) => self.last_exit = Some(exit),
            None => tracing::error!(role = %self.role, "did not exit after SIGKILL"),
        }

        handle.flush_output().await;
        self.state = ProcessState::Stopped;
        tracing::info!(role = %self.role, "stopped");
    }

    /// Whether the live process has exited, without a state transition
    fn has_exited(&mut self) -> bool {
        self.handle
            .as_mut()
            .is_some_and(|handle| handle.try_exit().is_some())
    }

    /// Most recent captured output lines, oldest first
    pub fn capture_logs(&self, max: usize) -> Vec<String> {
        self.logs.tail(max)
    }
}

// ==================== Supervisor ====================

/// States of both supervised processes after a health check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SupervisorHealth {
    pub engine: ProcessState,
    pub helper: ProcessState,
}

impl SupervisorHealth {
    /// First crashed role, engine before helper
    pub fn crashed(&self) -> Option<Role> {
        if self.engine == ProcessState::Crashed {
            Some(Role::Engine)
        } else if self.helper == ProcessState::Crashed {
            Some(Role::Helper)
        } else {
            None
        }
    }
}

/// Owns the engine and the helper and enforces their ordering
pub struct Supervisor {
    launcher: Arc<dyn Launcher>,
    config: SupervisorConfig,
    engine: ManagedProcess,
    helper: ManagedProcess,
}

impl Supervisor {
    pub fn new(launcher: Arc<dyn Launcher>, config: SupervisorConfig) -> Self {
        let capacity = config.log_capacity;
        Self {
            launcher,
            config,
            engine: ManagedProcess::new(Role::Engine, capacity),
            helper: ManagedProcess::new(Role::Helper, capacity),
        }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn process(&self, role: Role) -> &ManagedProcess {
        match role {
            Role::Engine => &self.engine,
            Role::Helper => &self.helper,
        }
    }

    pub fn state(&self, role: Role) -> ProcessState {
        self.process(role).state()
    }

    /// Number of processes currently `Running`
    pub fn running_count(&self) -> usize {
        [&self.engine, &self.helper]
            .into_iter()
            .filter(|p| p.is_running())
            .count()
    }

    /// Start the engine; with `socks_port` set, also wait for its listener
    pub async fn start_engine(&mut self, spec: &LaunchSpec, socks_port: Option<u16>) -> Result<()> {
        let launcher = self.launcher.clone();
        self.engine
            .start(launcher.as_ref(), spec, self.config.grace)
            .await?;

        if let (true, Some(port)) = (self.config.await_listener, socks_port) {
            if let Err(e) = self.wait_for_listener(port).await {
                self.stop_engine().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Poll the SOCKS listener until it accepts a connection, bounded by
    /// `listener_timeout`. Polling stops early if the engine exits.
    async fn wait_for_listener(&mut self, port: u16) -> Result<()> {
        let delay = Duration::from_millis(LISTENER_POLL_MS);
        let attempts = (self.config.listener_timeout.as_millis() / delay.as_millis()).max(1) as usize;
        let backoff = ConstantBuilder::default()
            .with_delay(delay)
            .with_max_times(attempts);

        let engine = &mut self.engine;
        let connected = (|| async move { TcpStream::connect((LISTEN_ADDR, port)).await })
            .retry(backoff)
            .when(|_| !engine.has_exited())
            .await;

        match connected {
            Ok(_) => {
                tracing::debug!(port, "engine listener ready");
                Ok(())
            }
            Err(_) => {
                if self.engine.health_check().await == ProcessState::Crashed {
                    let exit = self.engine.last_exit();
                    return Err(ProcessError::ExitedDuringStartup {
                        role: Role::Engine,
                        code: exit.and_then(|e| e.code),
                        output: self.engine.capture_logs(STARTUP_OUTPUT_LINES).join("\n"),
                    }
                    .into());
                }
                Err(ProcessError::ListenerNotReady {
                    role: Role::Engine,
                    port,
                }
                .into())
            }
        }
    }

    /// Start the helper; the engine must already be `Running`
    pub async fn start_helper(&mut self, spec: &LaunchSpec) -> Result<()> {
        if !self.engine.is_running() {
            return Err(ProcessError::EngineNotRunning.into());
        }
        let launcher = self.launcher.clone();
        self.helper
            .start(launcher.as_ref(), spec, self.config.grace)
            .await
    }

    pub async fn stop_helper(&mut self) {
        let (stop, kill) = (self.config.stop_timeout, self.config.kill_timeout);
        self.helper.stop(stop, kill).await;
    }

    pub async fn stop_engine(&mut self) {
        let (stop, kill) = (self.config.stop_timeout, self.config.kill_timeout);
        self.engine.stop(stop, kill).await;
    }

    /// Stop helper, then engine
    pub async fn stop_all(&mut self) {
        self.stop_helper().await;
        self.stop_engine().await;
    }

    pub async fn health_check(&mut self) -> SupervisorHealth {
        SupervisorHealth {
            engine: self.engine.health_check().await,
            helper: self.helper.health_check().await,
        }
    }

    pub fn capture_logs(&self, role: Role, max: usize) -> Vec<String> {
        self.process(role).capture_logs(max)
    }
}

// ==================== Test Support ====================

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted [`Launcher`] used by unit tests across the crate

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    /// How a fake process behaves once launched
    #[derive(Debug, Clone)]
    pub enum FakePlan {
        /// Keeps running until signalled
        Run,
        /// Keeps running and ignores SIGTERM
        IgnoreTerm,
        /// Writes `output` and exits immediately with `code`
        ExitImmediately { code: i32, output: Vec<String> },
        /// Spawn itself fails
        FailSpawn,
    }

    #[derive(Debug, Default)]
    pub struct FakeState {
        exit: Mutex<Option<Exited>>,
        ignore_term: bool,
        term_received: AtomicBool,
    }

    impl FakeState {
        fn exit_with(&self, code: Option<i32>) {
            let mut exit = self.exit.lock();
            if exit.is_none() {
                *exit = Some(Exited { code });
            }
        }

        pub fn is_alive(&self) -> bool {
            self.exit.lock().is_none()
        }

        pub fn term_received(&self) -> bool {
            self.term_received.load(Ordering::SeqCst)
        }
    }

    #[derive(Default)]
    pub struct FakeLauncher {
        plans: Mutex<HashMap<Role, FakePlan>>,
        launched: Mutex<Vec<(Role, LaunchSpec, Arc<FakeState>)>>,
    }

    impl FakeLauncher {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn set_plan(&self, role: Role, plan: FakePlan) {
            self.plans.lock().insert(role, plan);
        }

        /// Number of launched fake processes that have not exited
        pub fn alive(&self) -> usize {
            self.launched.lock().iter().filter(|(_, _, s)| s.is_alive()).count()
        }

        pub fn launch_count(&self, role: Role) -> usize {
            self.launched.lock().iter().filter(|(r, _, _)| *r == role).count()
        }

        pub fn last_spec(&self, role: Role) -> Option<LaunchSpec> {
            self.launched
                .lock()
                .iter()
                .rev()
                .find(|(r, _, _)| *r == role)
                .map(|(_, spec, _)| spec.clone())
        }

        pub fn last_state(&self, role: Role) -> Option<Arc<FakeState>> {
            self.launched
                .lock()
                .iter()
                .rev()
                .find(|(r, _, _)| *r == role)
                .map(|(_, _, state)| state.clone())
        }

        /// Make the most recent process of `role` exit on its own
        pub fn crash(&self, role: Role, code: i32) {
            if let Some(state) = self.last_state(role) {
                state.exit_with(Some(code));
            }
        }
    }

    struct FakeHandle {
        state: Arc<FakeState>,
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        async fn launch(
            &self,
            spec: &LaunchSpec,
            logs: Arc<LogBuffer>,
        ) -> std::result::Result<Box<dyn ProcessHandle>, ProcessError> {
            let plan = self
                .plans
                .lock()
                .get(&spec.role)
                .cloned()
                .unwrap_or(FakePlan::Run);

            let state = match plan {
                FakePlan::FailSpawn => {
                    return Err(ProcessError::Spawn {
                        role: spec.role,
                        program: spec.program.clone(),
                        source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
                    })
                }
                FakePlan::Run => FakeState::default(),
                FakePlan::IgnoreTerm => FakeState {
                    ignore_term: true,
                    ..Default::default()
                },
                FakePlan::ExitImmediately { code, output } => {
                    for line in output {
                        logs.push(line);
                    }
                    let state = FakeState::default();
                    state.exit_with(Some(code));
                    state
                }
            };

            let state = Arc::new(state);
            self.launched
                .lock()
                .push((spec.role, spec.clone(), state.clone()));
            Ok(Box::new(FakeHandle { state }))
        }
    }

    #[async_trait]
    impl ProcessHandle for FakeHandle {
        fn pid(&self) -> Option<u32> {
            self.state.is_alive().then_some(4242)
        }

        fn try_exit(&mut self) -> Option<Exited> {
            *self.state.exit.lock()
        }

        fn signal(&mut self, signal: StopSignal) -> std::result::Result<(), ProcessError> {
            match signal {
                StopSignal::Terminate => {
                    self.state.term_received.store(true, Ordering::SeqCst);
                    if !self.state.ignore_term {
                        self.state.exit_with(None);
                    }
                }
                StopSignal::Kill => self.state.exit_with(None),
            }
            Ok(())
        }

        async fn wait(&mut self) -> Exited {
            loop {
                if let Some(exit) = *self.state.exit.lock() {
                    return exit;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        async fn flush_output(&mut self) {}
    }
}
