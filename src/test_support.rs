//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use reqwest::Url;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::MutexGuard as AsyncMutexGuard;
use tokio::task::JoinHandle;

use crate::command::{CommandError, CommandOutput, CommandRunner};
use crate::provider::{
    MachineDescriptor, MachineId, MachineStatus, Provider, ProviderFuture, ProvisioningRequest,
    SshKeyId,
};
use crate::self_destruct::{RemoteExecutor, RemoteTarget, SelfDestructError};
use crate::tunnel::{
    ExitCallback, SessionSpec, Tunnel, TunnelError, TunnelExit, TunnelSession, tunnel_command_line,
};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Arc<Mutex<VecDeque<CommandOutput>>>,
    invocations: Arc<Mutex<Vec<CommandInvocation>>>,
}

/// Records a single invocation made through [`ScriptedRunner`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandInvocation {
    /// Program name as passed to the runner.
    pub program: String,
    /// Arguments passed to the program.
    pub args: Vec<OsString>,
}

impl CommandInvocation {
    /// Returns a shell-like command string for assertions.
    #[must_use]
    pub fn command_string(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.clone());
        parts.extend(
            self.args
                .iter()
                .map(|arg| arg.to_string_lossy().into_owned()),
        );
        parts.join(" ")
    }
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandInvocation> {
        lock(&self.invocations).clone()
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32, stderr: impl Into<String>) {
        self.push_output(Some(code), "", stderr);
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        lock(&self.responses).push_back(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        });
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        lock(&self.invocations).push(CommandInvocation {
            program: program.to_owned(),
            args: args.to_vec(),
        });
        lock(&self.responses)
            .pop_front()
            .ok_or_else(|| CommandError::Spawn {
                program: program.to_owned(),
                message: String::from("no scripted response available"),
            })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

/// Guard that holds the env mutex and restores variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: AsyncMutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Loopback HTTP responder serving canned JSON bodies, one per connection.
#[derive(Debug)]
pub struct CannedHttpServer {
    base_url: String,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl CannedHttpServer {
    /// Binds `127.0.0.1:0` and answers one request per body, in order.
    ///
    /// # Errors
    ///
    /// Returns the I/O error when the listener cannot be bound.
    pub async fn start(bodies: Vec<String>) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&requests);
        let task = tokio::spawn(async move {
            for body in bodies {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let head = read_request_head(&mut stream).await;
                let target = head
                    .lines()
                    .next()
                    .and_then(|line| line.split_whitespace().nth(1))
                    .unwrap_or_default()
                    .to_owned();
                lock(&recorded).push(target);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                if stream.write_all(response.as_bytes()).await.is_err() {
                    return;
                }
                if stream.shutdown().await.is_err() {
                    return;
                }
            }
        });
        Ok(Self {
            base_url: format!("http://{addr}"),
            requests,
            task,
        })
    }

    /// Base URL clients should target.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Request targets (path and query) received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<String> {
        lock(&self.requests).clone()
    }
}

impl Drop for CannedHttpServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn read_request_head(stream: &mut tokio::net::TcpStream) -> String {
    let mut head = Vec::new();
    let mut chunk = [0_u8; 1024];
    while !head.windows(4).any(|window| window == b"\r\n\r\n") {
        match stream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(read) => head.extend(chunk.iter().take(read)),
        }
    }
    String::from_utf8_lossy(&head).into_owned()
}

/// Error returned by [`FakeProvider`] when a failure is scripted.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("fake provider failure: {0}")]
pub struct FakeProviderError(pub String);

#[derive(Debug, Default)]
struct FakeProviderState {
    machine_id: String,
    statuses: VecDeque<(MachineStatus, Option<String>)>,
    keys: Vec<SshKeyId>,
    create_requests: Vec<ProvisioningRequest>,
    status_calls: usize,
    destroyed: Vec<(MachineId, bool)>,
    fail_create: bool,
    fail_status: bool,
    fail_keys: bool,
    fail_destroy: bool,
}

/// Scripted [`Provider`] recording every call. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<FakeProviderState>>,
}

impl FakeProvider {
    /// Creates a provider whose create call returns `machine_id`.
    #[must_use]
    pub fn new(machine_id: &str) -> Self {
        let provider = Self::default();
        lock(&provider.state).machine_id = machine_id.to_owned();
        provider
    }

    /// Queues the next status answer. Once the queue drains, `new` is
    /// returned.
    pub fn push_status(&self, status: MachineStatus, ip_address: Option<&str>) {
        lock(&self.state)
            .statuses
            .push_back((status, ip_address.map(str::to_owned)));
    }

    /// Sets the keys returned by `list_ssh_keys`.
    pub fn set_keys(&self, keys: &[&str]) {
        lock(&self.state).keys = keys.iter().copied().map(SshKeyId::from).collect();
    }

    /// Makes `create_machine` fail.
    pub fn fail_create(&self) {
        lock(&self.state).fail_create = true;
    }

    /// Makes `machine_status` fail.
    pub fn fail_status(&self) {
        lock(&self.state).fail_status = true;
    }

    /// Makes `list_ssh_keys` fail.
    pub fn fail_keys(&self) {
        lock(&self.state).fail_keys = true;
    }

    /// Makes `destroy` fail after recording the call.
    pub fn fail_destroy(&self) {
        lock(&self.state).fail_destroy = true;
    }

    /// Requests passed to `create_machine`.
    #[must_use]
    pub fn create_requests(&self) -> Vec<ProvisioningRequest> {
        lock(&self.state).create_requests.clone()
    }

    /// Number of `machine_status` calls.
    #[must_use]
    pub fn status_calls(&self) -> usize {
        lock(&self.state).status_calls
    }

    /// `(id, scrub)` pairs passed to `destroy`.
    #[must_use]
    pub fn destroyed(&self) -> Vec<(MachineId, bool)> {
        lock(&self.state).destroyed.clone()
    }
}

impl Provider for FakeProvider {
    type Error = FakeProviderError;

    fn create_machine<'a>(
        &'a self,
        request: &'a ProvisioningRequest,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.create_requests.push(request.clone());
            if state.fail_create {
                return Err(FakeProviderError(String::from("create rejected")));
            }
            Ok(MachineDescriptor {
                id: MachineId::from(state.machine_id.as_str()),
                ip_address: None,
                status: MachineStatus::New,
                created_at: None,
            })
        })
    }

    fn machine_status<'a>(
        &'a self,
        id: &'a MachineId,
    ) -> ProviderFuture<'a, MachineDescriptor, Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.status_calls += 1;
            if state.fail_status {
                return Err(FakeProviderError(String::from("status unavailable")));
            }
            let (status, ip) = state.statuses.pop_front().unwrap_or_default();
            Ok(MachineDescriptor {
                id: id.clone(),
                ip_address: ip.and_then(|raw| raw.parse().ok()),
                status,
                created_at: None,
            })
        })
    }

    fn list_ssh_keys(&self) -> ProviderFuture<'_, Vec<SshKeyId>, Self::Error> {
        Box::pin(async move {
            let state = lock(&self.state);
            if state.fail_keys {
                return Err(FakeProviderError(String::from("keys unavailable")));
            }
            Ok(state.keys.clone())
        })
    }

    fn destroy<'a>(
        &'a self,
        id: &'a MachineId,
        scrub: bool,
    ) -> ProviderFuture<'a, (), Self::Error> {
        Box::pin(async move {
            let mut state = lock(&self.state);
            state.destroyed.push((id.clone(), scrub));
            if state.fail_destroy {
                return Err(FakeProviderError(String::from("destroy rejected")));
            }
            Ok(())
        })
    }

    fn destruct_url(&self, id: &MachineId, scrub: bool) -> Result<Url, Self::Error> {
        Url::parse(&format!(
            "https://provider.invalid/droplets/{id}/destroy/?scrub={scrub}"
        ))
        .map_err(|err| FakeProviderError(err.to_string()))
    }
}

#[derive(Debug)]
struct FakeTunnelState {
    executable: Utf8PathBuf,
    exit: TunnelExit,
    resolve_error: Option<TunnelError>,
    sessions: Vec<Vec<String>>,
}

/// [`Tunnel`] double whose sessions exit immediately with a scripted code.
/// Clones share state.
#[derive(Clone, Debug)]
pub struct FakeTunnel {
    state: Arc<Mutex<FakeTunnelState>>,
}

impl FakeTunnel {
    /// Creates a tunnel whose sessions exit with `code`.
    #[must_use]
    pub fn exiting_with(code: Option<i32>) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeTunnelState {
                executable: Utf8PathBuf::from("/usr/bin/sshuttle"),
                exit: TunnelExit { code },
                resolve_error: None,
                sessions: Vec::new(),
            })),
        }
    }

    /// Makes `resolve_executable` fail with `err`.
    pub fn fail_resolution(&self, err: TunnelError) {
        lock(&self.state).resolve_error = Some(err);
    }

    /// Command lines of every started session.
    #[must_use]
    pub fn sessions(&self) -> Vec<Vec<String>> {
        lock(&self.state).sessions.clone()
    }
}

impl Tunnel for FakeTunnel {
    fn resolve_executable(&self) -> Result<Utf8PathBuf, TunnelError> {
        let state = lock(&self.state);
        state
            .resolve_error
            .clone()
            .map_or_else(|| Ok(state.executable.clone()), Err)
    }

    fn start_session(
        &self,
        executable: &Utf8Path,
        spec: &SessionSpec,
        on_exit: ExitCallback,
    ) -> Result<TunnelSession, TunnelError> {
        let command_line = tunnel_command_line(executable, spec)?;
        let exit = {
            let mut state = lock(&self.state);
            state.sessions.push(command_line.clone());
            state.exit
        };
        let task = tokio::spawn(async move {
            on_exit(exit).await;
            exit
        });
        Ok(TunnelSession::new(command_line, task))
    }
}

/// [`RemoteExecutor`] double recording every script it is asked to run.
#[derive(Clone, Debug, Default)]
pub struct RecordingExecutor {
    runs: Arc<Mutex<Vec<(RemoteTarget, String)>>>,
    failing: bool,
}

impl RecordingExecutor {
    /// Creates an executor that accepts every script.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an executor that records, then fails, every script.
    #[must_use]
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    /// `(target, script)` pairs received so far.
    #[must_use]
    pub fn runs(&self) -> Vec<(RemoteTarget, String)> {
        lock(&self.runs).clone()
    }
}

impl RemoteExecutor for RecordingExecutor {
    fn run_detached(&self, target: &RemoteTarget, script: &str) -> Result<(), SelfDestructError> {
        lock(&self.runs).push((target.clone(), script.to_owned()));
        if self.failing {
            return Err(SelfDestructError::Remote(CommandError::Spawn {
                program: String::from("ssh"),
                message: String::from("simulated failure"),
            }));
        }
        Ok(())
    }
}
