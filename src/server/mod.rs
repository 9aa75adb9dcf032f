//! Server instance - one supervised child process, its lifecycle latches,
//! output pipeline and event bus.

mod flag;
mod interact;
pub mod launcher;
mod pipeline;

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use regex::Regex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use flag::Flag;
pub use interact::InteractOptions;
pub use launcher::{LaunchArgs, LaunchConfig, LaunchError, ProcessHandle};

use crate::event::context::Ambient;
use crate::event::{Event, EventArgs, EventBus, Handler, NextEvent, ServerEventKind};
use crate::logger::{ConsoleLogger, LogSink};
use crate::tasks::AwareTasks;
use pipeline::{Exchange, LineQueue};

/// Marker a server prints once it finished loading. Unanchored, so it also
/// catches `Done (1.2s)!`, `Done!` and `Done in 3s`.
pub const DEFAULT_LOADED_PATTERN: &str = r"Done.";
pub const DEFAULT_STOP_COMMAND: &str = "/stop";
pub const DEFAULT_WORLD_FOLDER: &str = "world";

/// How long watchers may keep reading after the process exited, shared by all of them.
const WATCHER_GRACE: Duration = Duration::from_millis(500);

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("server '{0}' is not running")]
    NotRunning(String),

    #[error("invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    #[error("failed to signal server '{id}': {reason}")]
    Signal { id: String, reason: String },
}

/// Per-instance settings beyond the launch command.
#[derive(Clone)]
pub struct ServerOptions {
    /// Defaults to a [`ConsoleLogger`] prefixed with the server id.
    pub logger: Option<Arc<dyn LogSink>>,
    pub world_folder_name: String,
    pub loaded_pattern: String,
    pub stop_command: String,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            logger: None,
            world_folder_name: DEFAULT_WORLD_FOLDER.to_string(),
            loaded_pattern: DEFAULT_LOADED_PATTERN.to_string(),
            stop_command: DEFAULT_STOP_COMMAND.to_string(),
        }
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("world_folder_name", &self.world_folder_name)
            .field("loaded_pattern", &self.loaded_pattern)
            .field("stop_command", &self.stop_command)
            .finish_non_exhaustive()
    }
}

// ─── Server ──────────────────────────────────────────────────

/// Handle to one server instance. Clones refer to the same instance.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    id: String,
    launch: LaunchConfig,
    cwd: PathBuf,
    world_folder_name: String,
    logger: Arc<dyn LogSink>,
    loaded_marker: Regex,
    stop_command: String,

    running: Flag,
    loaded: Flag,
    stopped: Flag,

    queue: LineQueue,
    exchange: tokio::sync::Mutex<Exchange>,
    stdin: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pid: Mutex<Option<u32>>,
    /// stdin writer plus the two stream watchers of the current process
    watchers: Mutex<Vec<JoinHandle<()>>>,

    bus: EventBus<ServerEventKind>,
    tasks: AwareTasks,
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.inner.id)
            .field("running", &self.inner.running.is_set())
            .field("loaded", &self.inner.loaded.is_set())
            .finish_non_exhaustive()
    }
}

impl Server {
    pub fn new(id: impl Into<String>, launch: LaunchConfig, options: ServerOptions) -> Result<Self, ServerError> {
        let id = id.into();
        launch.validate()?;
        let cwd = launch.working_dir()?;
        let loaded_marker = Regex::new(&options.loaded_pattern)?;
        let logger = options
            .logger
            .unwrap_or_else(|| Arc::new(ConsoleLogger::new(id.clone())));
        let tasks = AwareTasks::new();

        Ok(Self {
            inner: Arc::new(ServerInner {
                id,
                launch,
                cwd,
                world_folder_name: options.world_folder_name,
                logger,
                loaded_marker,
                stop_command: options.stop_command,
                running: Flag::new(false),
                loaded: Flag::new(false),
                stopped: Flag::new(true),
                queue: LineQueue::default(),
                exchange: tokio::sync::Mutex::new(Exchange::default()),
                stdin: Mutex::new(None),
                pid: Mutex::new(None),
                watchers: Mutex::new(Vec::new()),
                bus: EventBus::new(tasks.clone()),
                tasks,
            }),
        })
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Working directory of the process.
    pub fn cwd(&self) -> &Path {
        &self.inner.cwd
    }

    pub fn world_folder_name(&self) -> &str {
        &self.inner.world_folder_name
    }

    pub fn launch_config(&self) -> &LaunchConfig {
        &self.inner.launch
    }

    pub fn logger(&self) -> Arc<dyn LogSink> {
        self.inner.logger.clone()
    }

    pub fn running(&self) -> &Flag {
        &self.inner.running
    }

    /// Set once the loaded marker was seen (or the process ended); never reset.
    pub fn loaded(&self) -> &Flag {
        &self.inner.loaded
    }

    pub fn stopped(&self) -> &Flag {
        &self.inner.stopped
    }

    pub fn pid(&self) -> Option<u32> {
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn ptr_eq(&self, other: &Server) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─── Handlers ────────────────────────────────────────────

    /// Register `callback` for `event` on this instance.
    pub fn on<F, Fut>(&self, event: impl Into<Event<ServerEventKind>>, callback: F, aware: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(Handler::new(event, callback).aware(aware));
    }

    pub fn register(&self, handler: Handler<ServerEventKind>) {
        self.inner.bus.register(handler);
    }

    /// Resolves at the next emission of `kind` on this instance.
    pub fn at(&self, kind: ServerEventKind) -> NextEvent {
        self.inner.bus.register_fut(kind)
    }

    pub fn handler_count(&self) -> usize {
        self.inner.bus.handler_count()
    }

    pub(crate) async fn emit(&self, kind: ServerEventKind, args: Option<EventArgs>, force_wait: bool) {
        self.inner.bus.emit(kind, args, force_wait, Some(self.clone())).await;
    }

    pub(crate) async fn emit_output(&self, line: String) {
        self.emit(ServerEventKind::Output, Some(EventArgs::with_output(line)), false)
            .await;
    }

    /// Spawn a task owned by this instance; it is cancelled when the
    /// process stops. The caller's handler context stays visible inside it.
    pub fn spawn_tracked<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ambient = Ambient::current();
        self.inner.tasks.spawn(ambient.scope(fut))
    }

    pub fn tracked_tasks(&self) -> usize {
        self.inner.tasks.len()
    }

    // ─── Commands ────────────────────────────────────────────

    /// Queue one line for the process stdin.
    ///
    /// Not coordinated with [`interact`](Self::interact): a reply to a
    /// command sent this way may be consumed by a running interaction.
    pub fn send(&self, text: &str) -> Result<(), ServerError> {
        let stdin = self.inner.stdin.lock().unwrap_or_else(|e| e.into_inner());
        let tx = stdin
            .as_ref()
            .ok_or_else(|| ServerError::NotRunning(self.inner.id.clone()))?;
        tx.send(text.to_string())
            .map_err(|_| ServerError::NotRunning(self.inner.id.clone()))
    }

    /// Graceful stop: `BeforeStop` (waited), the stop command, then wait for
    /// the process to exit. No-op on a stopped instance.
    pub async fn stop(&self) {
        if !self.running().is_set() {
            return;
        }
        self.emit(ServerEventKind::BeforeStop, None, true).await;
        if let Err(e) = self.send(&self.inner.stop_command) {
            tracing::debug!("Stop command not delivered: {}", e);
        }
        self.stopped().wait().await;
    }

    /// Terminate the process by signal and wait for it to exit.
    pub async fn force_stop(&self) -> Result<(), ServerError> {
        let Some(pid) = self.pid() else {
            return Ok(());
        };
        tracing::info!("Sending TERM signal to server '{}' (pid: {})", self.id(), pid);
        launcher::terminate(pid).map_err(|reason| ServerError::Signal {
            id: self.inner.id.clone(),
            reason,
        })?;
        self.stopped().wait().await;
        Ok(())
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Full run sequence of one process, returning once it has exited and
    /// the instance is torn down.
    pub(crate) async fn run(&self) {
        self.emit(ServerEventKind::BeforeStart, None, true).await;

        let handle = match launcher::load(&self.inner.launch) {
            Ok(handle) => handle,
            Err(e) => {
                tracing::error!("Server '{}' failed to start: {}", self.id(), e);
                self.inner.logger.log(&format!("Failed to start: {}", e), None);
                // nothing will ever print the marker; release the barrier
                self.inner.loaded.set();
                return;
            }
        };

        let ProcessHandle {
            mut child,
            stdin,
            stdout,
            stderr,
            pid,
        } = handle;
        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = pid;
        self.attach(stdin, stdout, stderr);

        match child.wait().await {
            Ok(status) => tracing::info!("Server '{}' exited with {}", self.id(), status),
            Err(e) => tracing::warn!("Failed to wait for server '{}': {}", self.id(), e),
        }

        self.teardown().await;
    }

    /// Wire the process streams: stdin writer plus one watcher per output.
    pub(crate) fn attach<W, O, E>(&self, stdin: W, stdout: O, stderr: E)
    where
        W: AsyncWrite + Unpin + Send + 'static,
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inner.stdin.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);

        self.inner.stopped.clear();
        self.inner.running.set();

        let handles = vec![
            tokio::spawn(pipeline::write_stdin(stdin, rx, self.inner.id.clone())),
            tokio::spawn(pipeline::watch(self.clone(), stdout, "stdout")),
            tokio::spawn(pipeline::watch(self.clone(), stderr, "stderr")),
        ];
        *self.inner.watchers.lock().unwrap_or_else(|e| e.into_inner()) = handles;
    }

    /// Quiesce after the process exited.
    pub(crate) async fn teardown(&self) {
        // dropping the sender ends the stdin writer
        self.inner.stdin.lock().unwrap_or_else(|e| e.into_inner()).take();

        let watchers = std::mem::take(&mut *self.inner.watchers.lock().unwrap_or_else(|e| e.into_inner()));
        let deadline = tokio::time::Instant::now() + WATCHER_GRACE;
        for mut handle in watchers {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                handle.abort();
            }
        }

        *self.inner.pid.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.inner.loaded.set();
        self.inner.running.clear();
        self.inner.stopped.set();

        self.emit(ServerEventKind::Stopped, None, false).await;
        self.inner.tasks.cancel_all();
    }
}
