//! Supervisor - owns every server instance, the supervisor-level event bus
//! and the startup/shutdown barriers across instances.

pub mod error;

pub use error::SupervisorError;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::event::{context, Event, EventArgs, EventBus, Handler, NextEvent, ServerEventKind, SupervisorEventKind};
use crate::extension::Extension;
use crate::logger::{ConsoleLogger, LogSink};
use crate::server::{LaunchConfig, Server, ServerOptions};
use crate::tasks::AwareTasks;

type ConsoleInput = Box<dyn AsyncRead + Send + Unpin>;

/// Cloneable handle; clones share the same supervisor.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

struct SupervisorInner {
    /// Insertion order; only mutated before `run`.
    servers: RwLock<Vec<Server>>,
    logger: Arc<dyn LogSink>,
    bus: EventBus<SupervisorEventKind>,
    tasks: AwareTasks,
    /// Server-scoped handlers waiting for `run`.
    deferred: Mutex<Vec<Handler<ServerEventKind>>>,
    console: Mutex<Option<ConsoleInput>>,
    started: AtomicBool,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Supervisor {
    pub fn new() -> Self {
        Self::with_logger(Arc::new(ConsoleLogger::new("Supervisor")))
    }

    pub fn with_logger(logger: Arc<dyn LogSink>) -> Self {
        let tasks = AwareTasks::new();
        Self {
            inner: Arc::new(SupervisorInner {
                servers: RwLock::new(Vec::new()),
                logger,
                bus: EventBus::new(tasks.clone()),
                tasks,
                deferred: Mutex::new(Vec::new()),
                console: Mutex::new(None),
                started: AtomicBool::new(false),
            }),
        }
    }

    pub fn logger(&self) -> Arc<dyn LogSink> {
        self.inner.logger.clone()
    }

    // ─── Instances ───────────────────────────────────────────

    pub fn add_server(
        &self,
        id: impl Into<String>,
        launch: LaunchConfig,
        options: ServerOptions,
    ) -> Result<Server, SupervisorError> {
        let id = id.into();
        if self.is_started() {
            return Err(SupervisorError::AlreadyRunning);
        }
        let mut servers = self.inner.servers.write().unwrap_or_else(|e| e.into_inner());
        if servers.iter().any(|s| s.id() == id) {
            return Err(SupervisorError::DuplicateServer(id));
        }
        let server = Server::new(id, launch, options)?;
        tracing::debug!("Registered server '{}'", server.id());
        servers.push(server.clone());
        Ok(server)
    }

    pub fn get_server(&self, id: &str) -> Option<Server> {
        let servers = self.inner.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.iter().find(|s| s.id() == id).cloned()
    }

    /// The first registered server.
    pub fn default_server(&self) -> Option<Server> {
        let servers = self.inner.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.first().cloned()
    }

    pub fn servers(&self) -> Vec<Server> {
        self.inner.servers.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn server_ids(&self) -> Vec<String> {
        let servers = self.inner.servers.read().unwrap_or_else(|e| e.into_inner());
        servers.iter().map(|s| s.id().to_string()).collect()
    }

    fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    // ─── Handlers ────────────────────────────────────────────

    /// Registration builder for server-scoped events: `Some(id)` targets one
    /// instance, `None` every instance.
    pub fn server(&self, id: Option<&str>) -> ServerRegistrar<'_> {
        ServerRegistrar {
            supervisor: self,
            server_id: id.map(str::to_string),
        }
    }

    /// Register a supervisor-scoped handler.
    pub fn register<F, Fut>(&self, event: impl Into<Event<SupervisorEventKind>>, aware: bool, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.inner.bus.register(Handler::new(event, callback).aware(aware));
    }

    pub fn on<F, Fut>(&self, event: impl Into<Event<SupervisorEventKind>>, callback: F, aware: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event, aware, callback);
    }

    /// Number of supervisor-scoped handlers.
    pub fn handler_count(&self) -> usize {
        self.inner.bus.handler_count()
    }

    /// Resolves at the next emission of `kind` on the supervisor bus.
    pub fn at(&self, kind: SupervisorEventKind) -> NextEvent {
        self.inner.bus.register_fut(kind)
    }

    fn defer(&self, handler: Handler<ServerEventKind>) {
        if self.is_started() {
            // instances are already wired; attach right away
            if let Err(e) = self.attach_handler(handler) {
                tracing::warn!("Dropping handler registration: {}", e);
            }
            return;
        }
        self.inner.deferred.lock().unwrap_or_else(|e| e.into_inner()).push(handler);
    }

    fn attach_handler(&self, handler: Handler<ServerEventKind>) -> Result<(), SupervisorError> {
        match handler.server_id() {
            Some(id) => {
                let server = self
                    .get_server(id)
                    .ok_or_else(|| SupervisorError::UnknownServer(id.to_string()))?;
                server.register(handler);
            }
            None => {
                for server in self.servers() {
                    server.register(handler.clone());
                }
            }
        }
        Ok(())
    }

    /// Check every target first so nothing is applied on error.
    pub(crate) fn apply_deferred(&self) -> Result<(), SupervisorError> {
        let deferred = std::mem::take(&mut *self.inner.deferred.lock().unwrap_or_else(|e| e.into_inner()));
        if let Some(missing) = deferred
            .iter()
            .filter_map(|h| h.server_id())
            .find(|id| self.get_server(id).is_none())
        {
            return Err(SupervisorError::UnknownServer(missing.to_string()));
        }
        for handler in deferred {
            self.attach_handler(handler)?;
        }
        Ok(())
    }

    /// Let `extension` register its handlers. Must happen before `run`.
    pub fn load_extension(&self, extension: &dyn Extension) -> Result<(), SupervisorError> {
        let name = extension.name().to_string();
        extension
            .load(self)
            .map_err(|source| SupervisorError::Extension { name: name.clone(), source })?;
        tracing::info!("Loaded extension '{}'", name);
        Ok(())
    }

    // ─── Output & commands ───────────────────────────────────

    pub(crate) async fn emit(&self, kind: SupervisorEventKind, args: Option<EventArgs>, force_wait: bool) {
        self.inner.bus.emit(kind, args, force_wait, None).await;
    }

    /// Log `message` and raise `Stdout` then `Output` with it.
    pub async fn stdout(&self, message: &str, prefix: Option<&str>) {
        self.inner.logger.log(message, prefix);
        self.emit(SupervisorEventKind::Stdout, Some(EventArgs::with_output(message)), false)
            .await;
        self.emit(SupervisorEventKind::Output, Some(EventArgs::with_output(message)), false)
            .await;
    }

    /// Log `message` and raise `Stderr` then `Output` with it.
    pub async fn stderr(&self, message: &str, prefix: Option<&str>) {
        self.inner.logger.log(message, prefix);
        self.emit(SupervisorEventKind::Stderr, Some(EventArgs::with_output(message)), false)
            .await;
        self.emit(SupervisorEventKind::Output, Some(EventArgs::with_output(message)), false)
            .await;
    }

    /// Send `message` to every running server; with `exclude_self` the
    /// server the calling handler is bound to is skipped. Returns how many
    /// servers it was sent to.
    pub fn broadcast(&self, message: &str, exclude_self: bool) -> usize {
        let current = if exclude_self { context::server() } else { None };
        let mut sent = 0;
        for server in self.servers() {
            if current.as_ref().is_some_and(|c| c.ptr_eq(&server)) {
                continue;
            }
            match server.send(message) {
                Ok(()) => sent += 1,
                Err(e) => tracing::debug!("Broadcast skipped: {}", e),
            }
        }
        sent
    }

    /// Spawn a task owned by the supervisor, cancelled after `AllStopped`.
    pub fn spawn_tracked<F>(&self, fut: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let ambient = context::Ambient::current();
        self.inner.tasks.spawn(ambient.scope(fut))
    }

    /// Read console lines from `reader` instead of the process stdin.
    pub fn set_console_input<R>(&self, reader: R)
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        *self.inner.console.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(reader));
    }

    // ─── Lifecycle ───────────────────────────────────────────

    /// Run every server until all of them stopped.
    pub async fn run(&self) -> Result<(), SupervisorError> {
        if self.is_started() {
            return Err(SupervisorError::AlreadyRunning);
        }
        self.apply_deferred()?;
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return Err(SupervisorError::AlreadyRunning);
        }

        let servers = self.servers();
        tracing::info!(
            "Starting {} server(s) with {} supervisor handler(s)",
            servers.len(),
            self.handler_count()
        );
        self.emit(SupervisorEventKind::ExtensionsLoaded, None, false).await;

        let mut instances = JoinSet::new();
        for server in &servers {
            let server = server.clone();
            instances.spawn(async move { server.run().await });
        }

        let cancel = CancellationToken::new();
        let console = self.forward_console(cancel.clone());

        for server in &servers {
            server.loaded().wait().await;
        }
        tracing::info!("All servers loaded");
        self.emit(SupervisorEventKind::AllLoaded, None, false).await;

        while let Some(joined) = instances.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Server task failed: {}", e);
            }
        }
        tracing::info!("All servers stopped");
        self.emit(SupervisorEventKind::AllStopped, None, true).await;

        self.inner.tasks.cancel_all();
        cancel.cancel();
        if let Err(e) = console.await {
            tracing::debug!("Console forwarder ended abnormally: {}", e);
        }
        Ok(())
    }

    /// Gracefully stop every server concurrently.
    pub async fn stop(&self) {
        let mut stops = JoinSet::new();
        for server in self.servers() {
            stops.spawn(async move { server.stop().await });
        }
        while stops.join_next().await.is_some() {}
    }

    /// Terminate every running server by signal.
    pub async fn force_stop(&self) {
        let mut stops = JoinSet::new();
        for server in self.servers() {
            stops.spawn(async move {
                if let Err(e) = server.force_stop().await {
                    tracing::warn!("{}", e);
                }
            });
        }
        while stops.join_next().await.is_some() {}
    }

    fn forward_console(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let reader: ConsoleInput = self
            .inner
            .console
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .unwrap_or_else(|| Box::new(tokio::io::stdin()));
        let supervisor = self.clone();

        tokio::spawn(async move {
            let mut lines = BufReader::new(reader).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            supervisor
                                .emit(SupervisorEventKind::Stdin, Some(EventArgs::with_output(line)), false)
                                .await;
                        }
                        Ok(None) => {
                            tracing::debug!("Console input closed");
                            break;
                        }
                        Err(e) => {
                            tracing::warn!("Console input error: {}", e);
                            break;
                        }
                    },
                }
            }
        })
    }
}

/// Builder returned by [`Supervisor::server`].
pub struct ServerRegistrar<'a> {
    supervisor: &'a Supervisor,
    server_id: Option<String>,
}

impl ServerRegistrar<'_> {
    pub fn register<F, Fut>(&self, event: impl Into<Event<ServerEventKind>>, aware: bool, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let handler = Handler::new(event, callback)
            .aware(aware)
            .for_server(self.server_id.clone());
        self.supervisor.defer(handler);
    }

    pub fn on<F, Fut>(&self, event: impl Into<Event<ServerEventKind>>, callback: F, aware: bool)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register(event, aware, callback);
    }
}
