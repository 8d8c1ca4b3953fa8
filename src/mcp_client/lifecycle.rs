//! Local server process lifecycle.
//!
//! Spawns MCP servers as child processes speaking JSON-RPC over stdio,
//! watches them for unexpected exits, and shuts them down. Each process has
//! an exit watcher task that owns the `Child`; stopping a server closes its
//! stdin and signals the watcher, which waits for the grace period and then
//! kills.

use std::collections::{HashMap, VecDeque};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::{oneshot, watch, RwLock};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::session::{McpSession, SessionSettings};
use super::sync::{lock, KeyedLocks};
use super::transport::StdioTransport;
use super::types::CapabilitySet;
use crate::config::McpConfig;
use crate::service::{LocalCommand, Service, ServiceEndpoint};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Stderr lines kept for initialization failure messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr to drain after a failed start.
const STDERR_DRAIN: Duration = Duration::from_millis(500);

// ─── State ───────────────────────────────────────────────────────────────────

/// Lifecycle state of a local server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ProcessState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    /// The process exited without being asked to.
    #[serde(rename_all = "camelCase")]
    Crashed { exit_code: Option<i32> },
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExitInfo {
    code: Option<i32>,
    requested: bool,
}

/// Snapshot of a tracked local server.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalServerInfo {
    pub service_id: String,
    pub pid: Option<u32>,
    pub state: ProcessState,
    pub started_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub server_name: Option<String>,
    pub capabilities: CapabilitySet,
}

// ─── LocalProcess ────────────────────────────────────────────────────────────

/// A spawned server with its session and capability snapshot.
pub struct LocalProcess {
    service_id: String,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    last_activity: Mutex<DateTime<Utc>>,
    capabilities: Mutex<CapabilitySet>,
    session: McpSession,
    exit: watch::Receiver<Option<ExitInfo>>,
    stop_tx: Mutex<Option<oneshot::Sender<()>>>,
    stderr_task: JoinHandle<()>,
}

impl LocalProcess {
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn session(&self) -> &McpSession {
        &self.session
    }

    pub fn state(&self) -> ProcessState {
        match *self.exit.borrow() {
            None => ProcessState::Running,
            Some(ExitInfo { requested: true, .. }) => ProcessState::Stopped,
            Some(ExitInfo { code, .. }) => ProcessState::Crashed { exit_code: code },
        }
    }

    /// Record activity (observability only, nothing is evicted on idle).
    pub fn touch(&self) {
        *lock(&self.last_activity) = Utc::now();
    }

    pub fn capabilities(&self) -> CapabilitySet {
        lock(&self.capabilities).clone()
    }

    pub fn info(&self) -> LocalServerInfo {
        LocalServerInfo {
            service_id: self.service_id.clone(),
            pid: self.pid,
            state: self.state(),
            started_at: self.started_at,
            last_activity: *lock(&self.last_activity),
            server_name: self.session.server_info().and_then(|s| s.name.clone()),
            capabilities: self.capabilities(),
        }
    }

    /// Close stdin, signal the watcher and wait for the process to exit.
    async fn shutdown(&self) {
        if let Err(e) = self.session.close().await {
            tracing::debug!(service = %self.service_id, error = %e, "close failed");
        }
        if let Some(tx) = lock(&self.stop_tx).take() {
            let _ = tx.send(());
        }
        let mut exit = self.exit.clone();
        // Err only when the watcher is already gone.
        let _ = exit.wait_for(Option::is_some).await;
        self.stderr_task.abort();
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        self.stderr_task.abort();
    }
}

// ─── Spawning ────────────────────────────────────────────────────────────────

fn build_command(command: &LocalCommand) -> Command {
    let mut cmd = Command::new(&command.command);
    cmd.args(&command.args);
    // Inherited environment plus the service's own; the service wins.
    cmd.envs(&command.env);
    if let Some(dir) = command.working_dir.as_deref().filter(|d| !d.is_empty()) {
        cmd.current_dir(dir);
    }

    #[cfg(target_os = "windows")]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x08000000;
        cmd.creation_flags(CREATE_NO_WINDOW);
    }

    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    cmd
}

type StderrTail = Arc<Mutex<VecDeque<String>>>;

/// Forward stderr to tracing, keeping the last few lines.
fn forward_stderr(service_id: String, stderr: Option<ChildStderr>, tail: StderrTail) -> JoinHandle<()> {
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return;
        };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(service = %service_id, line = %line, "server stderr");
            let mut tail = lock(&tail);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

fn stderr_suffix(tail: &StderrTail) -> String {
    let tail = lock(tail);
    if tail.is_empty() {
        String::new()
    } else {
        format!(
            " | stderr: {}",
            tail.iter().map(String::as_str).collect::<Vec<_>>().join("\n").trim()
        )
    }
}

/// Owns the child until it exits, then publishes how it ended.
async fn watch_exit(
    service_id: String,
    mut child: Child,
    mut stop_rx: oneshot::Receiver<()>,
    grace: Duration,
    exit_tx: watch::Sender<Option<ExitInfo>>,
) {
    let (status, requested) = tokio::select! {
        status = child.wait() => (status, false),
        // A dropped sender means the record is gone; treat it as a stop.
        _ = &mut stop_rx => {
            let status = match tokio::time::timeout(grace, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    tracing::warn!(service = %service_id, "server did not exit in time, killing");
                    let _ = child.kill().await;
                    child.wait().await
                }
            };
            (status, true)
        }
    };

    let code = status.ok().and_then(|s| s.code());
    if requested {
        tracing::debug!(service = %service_id, exit_code = ?code, "server stopped");
    } else {
        tracing::warn!(service = %service_id, exit_code = ?code, "server exited unexpectedly");
    }
    let _ = exit_tx.send(Some(ExitInfo { code, requested }));
}

/// Spawn a server, run the handshake and discover what it offers.
async fn spawn_process(
    service_id: &str,
    command: &LocalCommand,
    settings: &SessionSettings,
    shutdown_timeout: Duration,
) -> Result<LocalProcess, McpError> {
    let mut child = build_command(command)
        .spawn()
        .map_err(|e| McpError::SpawnFailed {
            service: service_id.to_string(),
            reason: format!("{}: {e}", command.command),
        })?;

    let stdin = child.stdin.take().ok_or(McpError::SpawnFailed {
        service: service_id.to_string(),
        reason: "failed to capture stdin".into(),
    })?;
    let stdout = child.stdout.take().ok_or(McpError::SpawnFailed {
        service: service_id.to_string(),
        reason: "failed to capture stdout".into(),
    })?;

    let tail: StderrTail = Arc::default();
    let mut stderr_task = forward_stderr(service_id.to_string(), child.stderr.take(), tail.clone());
    let pid = child.id();

    let transport = StdioTransport::new(service_id, stdin, stdout);
    let started = async {
        let session = McpSession::initialize(service_id, Box::new(transport), settings).await?;
        let capabilities = session.discover_capabilities().await?;
        Ok::<_, McpError>((session, capabilities))
    }
    .await;

    let (session, capabilities) = match started {
        Ok(started) => started,
        Err(e) => {
            let _ = child.kill().await;
            if tokio::time::timeout(STDERR_DRAIN, &mut stderr_task).await.is_err() {
                stderr_task.abort();
            }
            let suffix = stderr_suffix(&tail);
            if !suffix.is_empty() {
                tracing::warn!(service = service_id, stderr = %suffix, "server stderr captured on failure");
            }
            return Err(McpError::InitFailed {
                service: service_id.to_string(),
                reason: format!("{e}{suffix}"),
            });
        }
    };

    let (exit_tx, exit_rx) = watch::channel(None);
    let (stop_tx, stop_rx) = oneshot::channel();
    tokio::spawn(watch_exit(
        service_id.to_string(),
        child,
        stop_rx,
        shutdown_timeout,
        exit_tx,
    ));

    let now = Utc::now();
    Ok(LocalProcess {
        service_id: service_id.to_string(),
        pid,
        started_at: now,
        last_activity: Mutex::new(now),
        capabilities: Mutex::new(capabilities),
        session,
        exit: exit_rx,
        stop_tx: Mutex::new(Some(stop_tx)),
        stderr_task,
    })
}

// ─── Supervisor ──────────────────────────────────────────────────────────────

/// Stopped servers whose state is still reported as `Stopped`.
const REMEMBERED_STOPS: usize = 256;

/// States of ids without a live record. `Stopped` entries are bounded,
/// oldest forgotten first.
#[derive(Debug)]
struct Phases {
    states: HashMap<String, ProcessState>,
    stopped: VecDeque<String>,
    capacity: usize,
}

impl Phases {
    fn new(capacity: usize) -> Self {
        Self {
            states: HashMap::new(),
            stopped: VecDeque::new(),
            capacity,
        }
    }

    fn set(&mut self, service_id: &str, state: ProcessState) {
        self.stopped.retain(|id| id != service_id);
        self.states.insert(service_id.to_string(), state);
        if state != ProcessState::Stopped {
            return;
        }
        self.stopped.push_back(service_id.to_string());
        while self.stopped.len() > self.capacity {
            if let Some(oldest) = self.stopped.pop_front() {
                self.states.remove(&oldest);
            }
        }
    }

    fn clear(&mut self, service_id: &str) {
        self.stopped.retain(|id| id != service_id);
        self.states.remove(service_id);
    }

    fn get(&self, service_id: &str) -> Option<ProcessState> {
        self.states.get(service_id).copied()
    }
}


/// Owns every local server process, at most one per service id.
pub struct LocalProcessSupervisor {
    settings: SessionSettings,
    shutdown_timeout: Duration,
    processes: RwLock<HashMap<String, Arc<LocalProcess>>>,
    phases: Mutex<Phases>,
    locks: KeyedLocks,
}

impl LocalProcessSupervisor {
    pub fn new(config: &McpConfig) -> Self {
        Self {
            settings: SessionSettings::from_config(config),
            shutdown_timeout: config.shutdown_timeout(),
            processes: RwLock::new(HashMap::new()),
            phases: Mutex::new(Phases::new(REMEMBERED_STOPS)),
            locks: KeyedLocks::new(),
        }
    }

    fn set_phase(&self, service_id: &str, state: ProcessState) {
        lock(&self.phases).set(service_id, state);
    }

    /// Spawn a service's server and return what it offers.
    ///
    /// Already running: the existing server's info is returned. A crashed
    /// record is replaced.
    pub async fn start_local_server(&self, service: &Service) -> Result<LocalServerInfo, McpError> {
        let ServiceEndpoint::LocalMcp(command) = &service.endpoint else {
            return Err(McpError::ConfigError {
                service: service.id.clone(),
                reason: format!("'{}' is a {} service, not local-mcp", service.name, service.kind()),
            });
        };
        if command.command.trim().is_empty() {
            return Err(McpError::MissingCommand {
                service: service.id.clone(),
            });
        }

        let _guard = self.locks.lock(&service.id).await;

        let existing = self.processes.read().await.get(&service.id).cloned();
        if let Some(process) = existing {
            if process.state() == ProcessState::Running {
                tracing::debug!(service = %service.id, "local server already running");
                return Ok(process.info());
            }
            tracing::info!(service = %service.id, state = ?process.state(), "replacing exited server");
            self.processes.write().await.remove(&service.id);
            process.shutdown().await;
        }

        self.set_phase(&service.id, ProcessState::Starting);
        tracing::info!(
            service = %service.id,
            command = %command.command,
            args = ?command.args,
            "starting local server"
        );

        let process = match spawn_process(&service.id, command, &self.settings, self.shutdown_timeout).await {
            Ok(process) => Arc::new(process),
            Err(e) => {
                lock(&self.phases).clear(&service.id);
                tracing::warn!(service = %service.id, error = %e, "local server failed to start");
                return Err(e);
            }
        };

        let info = process.info();
        self.processes
            .write()
            .await
            .insert(service.id.clone(), process);
        lock(&self.phases).clear(&service.id);

        tracing::info!(
            service = %service.id,
            pid = ?info.pid,
            tools = info.capabilities.tools.len(),
            "local server running"
        );
        Ok(info)
    }

    /// Stop a server. Returns `false` when nothing was tracked for the id.
    pub async fn stop_local_server(&self, service_id: &str) -> bool {
        let _guard = self.locks.lock(service_id).await;

        let Some(process) = self.processes.write().await.remove(service_id) else {
            tracing::debug!(service = service_id, "stop requested for untracked server");
            return false;
        };

        self.set_phase(service_id, ProcessState::Stopping);
        process.shutdown().await;
        self.set_phase(service_id, ProcessState::Stopped);
        tracing::info!(service = service_id, "local server stopped");
        true
    }

    /// True only while the process is alive and tracked.
    pub async fn is_running(&self, service_id: &str) -> bool {
        self.processes
            .read()
            .await
            .get(service_id)
            .is_some_and(|p| p.state() == ProcessState::Running)
    }

    pub async fn process_state(&self, service_id: &str) -> ProcessState {
        if let Some(process) = self.processes.read().await.get(service_id) {
            return process.state();
        }
        lock(&self.phases)
            .get(service_id)
            .unwrap_or(ProcessState::NotStarted)
    }

    /// Info for every tracked server that is still running.
    pub async fn running_servers(&self) -> Vec<LocalServerInfo> {
        let mut servers: Vec<LocalServerInfo> = self
            .processes
            .read()
            .await
            .values()
            .filter(|p| p.state() == ProcessState::Running)
            .map(|p| p.info())
            .collect();
        servers.sort_by(|a, b| a.service_id.cmp(&b.service_id));
        servers
    }

    /// The live process for an id.
    pub async fn process(&self, service_id: &str) -> Result<Arc<LocalProcess>, McpError> {
        let process = self
            .processes
            .read()
            .await
            .get(service_id)
            .cloned()
            .ok_or_else(|| McpError::NotRunning {
                service: service_id.to_string(),
            })?;
        match process.state() {
            ProcessState::Running => Ok(process),
            ProcessState::Crashed { exit_code } => Err(McpError::ServerCrashed {
                service: service_id.to_string(),
                exit_code,
            }),
            _ => Err(McpError::NotRunning {
                service: service_id.to_string(),
            }),
        }
    }

    pub async fn call_tool(&self, service_id: &str, name: &str, arguments: Value) -> Result<Value, McpError> {
        let process = self.process(service_id).await?;
        process.touch();
        process.session().call_tool(name, arguments).await
    }

    pub async fn get_resource(&self, service_id: &str, uri: &str) -> Result<Value, McpError> {
        let process = self.process(service_id).await?;
        process.touch();
        process.session().read_resource(uri).await
    }

    pub async fn get_prompt(
        &self,
        service_id: &str,
        name: &str,
        arguments: Option<Value>,
    ) -> Result<Value, McpError> {
        let process = self.process(service_id).await?;
        process.touch();
        process.session().get_prompt(name, arguments).await
    }

    /// Re-list capabilities and refresh the snapshot.
    pub async fn discover_capabilities(&self, service_id: &str) -> Result<CapabilitySet, McpError> {
        let process = self.process(service_id).await?;
        process.touch();
        let capabilities = process.session().discover_capabilities().await?;
        *lock(&process.capabilities) = capabilities.clone();
        Ok(capabilities)
    }

    /// Stop every tracked server concurrently and wait for all of them.
    pub async fn cleanup(&self) {
        let ids: Vec<String> = self.processes.read().await.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        tracing::info!(count = ids.len(), "stopping all local servers");
        join_all(ids.iter().map(|id| self.stop_local_server(id))).await;
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::local_mcp_service;

    fn supervisor() -> LocalProcessSupervisor {
        LocalProcessSupervisor::new(&McpConfig {
            init_timeout_ms: 5_000,
            request_timeout_ms: 5_000,
            shutdown_timeout_ms: 1_000,
            ..McpConfig::default()
        })
    }

    #[tokio::test]
    async fn test_start_discovers_then_stop() {
        let sup = supervisor();
        let service = local_mcp_service("files");

        let info = sup.start_local_server(&service).await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert_eq!(info.capabilities.tools.len(), 1);
        assert_eq!(info.capabilities.tools[0].name, "echo");
        assert!(sup.is_running("files").await);
        assert_eq!(sup.running_servers().await.len(), 1);

        assert!(sup.stop_local_server("files").await);
        assert!(!sup.is_running("files").await);
        assert!(sup.running_servers().await.is_empty());
        assert_eq!(sup.process_state("files").await, ProcessState::Stopped);
    }

    #[test]
    fn test_stopped_states_are_bounded() {
        let mut phases = Phases::new(2);
        for id in ["a", "b", "c"] {
            phases.set(id, ProcessState::Stopping);
            phases.set(id, ProcessState::Stopped);
        }
        assert_eq!(phases.get("a"), None);
        assert_eq!(phases.get("b"), Some(ProcessState::Stopped));
        assert_eq!(phases.get("c"), Some(ProcessState::Stopped));
        assert_eq!(phases.states.len(), 2);

        phases.clear("b");
        phases.set("d", ProcessState::Stopped);
        assert_eq!(phases.get("c"), Some(ProcessState::Stopped));
        assert_eq!(phases.stopped.len(), 2);
    }

    #[tokio::test]
    async fn test_restart_after_stop_clears_stopped_state() {
        let sup = supervisor();
        let service = local_mcp_service("files");
        sup.start_local_server(&service).await.unwrap();
        sup.stop_local_server("files").await;
        assert_eq!(lock(&sup.phases).states.len(), 1);

        sup.start_local_server(&service).await.unwrap();
        assert_eq!(sup.process_state("files").await, ProcessState::Running);
        assert!(lock(&sup.phases).states.is_empty());
        assert!(lock(&sup.phases).stopped.is_empty());
        sup.cleanup().await;
        assert!(sup.locks.len() <= 1);
    }

    #[tokio::test]
    async fn test_second_start_returns_existing() {
        let sup = supervisor();
        let service = local_mcp_service("files");
        let first = sup.start_local_server(&service).await.unwrap();
        let second = sup.start_local_server(&service).await.unwrap();
        assert_eq!(first.pid, second.pid);
        sup.cleanup().await;
    }

    #[tokio::test]
    async fn test_call_before_start_is_not_running() {
        let sup = supervisor();
        let err = sup
            .call_tool("files", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::NotRunning { .. }));
        assert_eq!(sup.process_state("files").await, ProcessState::NotStarted);
    }

    #[tokio::test]
    async fn test_stop_untracked_is_noop() {
        let sup = supervisor();
        assert!(!sup.stop_local_server("nothing").await);
    }

    #[tokio::test]
    async fn test_missing_command() {
        let sup = supervisor();
        let service = Service::local_mcp("empty", "Empty", LocalCommand::default());
        let err = sup.start_local_server(&service).await.unwrap_err();
        assert!(matches!(err, McpError::MissingCommand { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_command() {
        let sup = supervisor();
        let service = Service::local_mcp(
            "bogus",
            "Bogus",
            LocalCommand {
                command: "/definitely/not/a/real/binary".into(),
                ..LocalCommand::default()
            },
        );
        let err = sup.start_local_server(&service).await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert!(!sup.is_running("bogus").await);
    }

    #[tokio::test]
    async fn test_init_failure_carries_stderr() {
        let sup = supervisor();
        let service = Service::local_mcp(
            "broken",
            "Broken",
            LocalCommand {
                command: "sh".into(),
                args: vec!["-c".into(), "echo 'missing module foo' >&2; exit 1".into()],
                ..LocalCommand::default()
            },
        );
        match sup.start_local_server(&service).await.unwrap_err() {
            McpError::InitFailed { reason, .. } => assert!(reason.contains("missing module foo")),
            other => panic!("expected InitFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_service_env_reaches_child() {
        let sup = supervisor();
        let mut service = local_mcp_service("env");
        if let ServiceEndpoint::LocalMcp(cmd) = &mut service.endpoint {
            cmd.env.insert("MOCK_GREETING".into(), "hello-from-env".into());
        }
        sup.start_local_server(&service).await.unwrap();

        let result = sup.call_tool("env", "greet", serde_json::json!({})).await.unwrap();
        assert_eq!(result["content"][0]["text"], "hello-from-env");
        sup.cleanup().await;
    }

    #[tokio::test]
    async fn test_crash_is_detected() {
        let sup = supervisor();
        sup.start_local_server(&local_mcp_service("fragile")).await.unwrap();

        // The mock exits with status 3 on this tool.
        let err = sup
            .call_tool("fragile", "crash", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.is_transport_failure());

        let mut state = sup.process_state("fragile").await;
        for _ in 0..50 {
            if state != ProcessState::Running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
            state = sup.process_state("fragile").await;
        }
        assert_eq!(state, ProcessState::Crashed { exit_code: Some(3) });
        assert!(!sup.is_running("fragile").await);

        let err = sup
            .call_tool("fragile", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ServerCrashed { exit_code: Some(3), .. }));

        // A crashed record is replaced on the next start.
        let info = sup.start_local_server(&local_mcp_service("fragile")).await.unwrap();
        assert_eq!(info.state, ProcessState::Running);
        sup.cleanup().await;
    }

    #[tokio::test]
    async fn test_cleanup_under_concurrent_calls() {
        let sup = Arc::new(supervisor());
        for id in ["a", "b", "c"] {
            sup.start_local_server(&local_mcp_service(id)).await.unwrap();
        }

        let callers: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|id| {
                let sup = sup.clone();
                tokio::spawn(async move {
                    for _ in 0..20 {
                        let _ = sup.call_tool(id, "echo", serde_json::json!({})).await;
                    }
                })
            })
            .collect();

        sup.cleanup().await;
        for id in ["a", "b", "c"] {
            assert!(!sup.is_running(id).await);
        }
        for caller in callers {
            caller.await.unwrap();
        }
        assert!(sup.running_servers().await.is_empty());
    }
}
