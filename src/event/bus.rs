//! Event bus - ordered handler registry plus one-shot "next occurrence"
//! futures, and the single dispatch routine shared by every event kind.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use super::context::Ambient;
use super::{captures, Event, EventArgs, EventKind, MATCHED_FIELD};
use crate::server::Server;
use crate::tasks::AwareTasks;

/// Boxed future returned by a handler callback.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'static>>;

type Callback = Arc<dyn Fn() -> HandlerFuture + Send + Sync>;

// ─── Handler ─────────────────────────────────────────────────

/// A callback bound to an event.
///
/// Callbacks take no parameters; they read [`context::args`](super::context::args)
/// and [`context::server`](super::context::server) instead.
pub struct Handler<K: EventKind> {
    event: Event<K>,
    server_id: Option<String>,
    callback: Callback,
    aware: bool,
}

impl<K: EventKind> Clone for Handler<K> {
    fn clone(&self) -> Self {
        Self {
            event: self.event.clone(),
            server_id: self.server_id.clone(),
            callback: self.callback.clone(),
            aware: self.aware,
        }
    }
}

impl<K: EventKind> fmt::Debug for Handler<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handler")
            .field("event", &self.event)
            .field("server_id", &self.server_id)
            .field("aware", &self.aware)
            .finish_non_exhaustive()
    }
}

impl<K: EventKind> Handler<K> {
    pub fn new<F, Fut>(event: impl Into<Event<K>>, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            event: event.into(),
            server_id: None,
            callback: Arc::new(move || Box::pin(callback()) as HandlerFuture),
            aware: false,
        }
    }

    /// Track the invocation task so teardown can cancel it.
    pub fn aware(mut self, aware: bool) -> Self {
        self.aware = aware;
        self
    }

    /// Restrict a deferred server-scoped handler to one instance.
    pub fn for_server(mut self, server_id: Option<String>) -> Self {
        self.server_id = server_id;
        self
    }

    pub fn event(&self) -> &Event<K> {
        &self.event
    }

    pub fn server_id(&self) -> Option<&str> {
        self.server_id.as_deref()
    }

    pub fn is_aware(&self) -> bool {
        self.aware
    }

    /// The invocation future for one emission: filter check, then the
    /// callback inside its ambient scope.
    fn invocation(&self, args: EventArgs, server: Option<Server>) -> impl Future<Output = ()> + Send + 'static {
        let filter = self.event.filter().cloned();
        let callback = self.callback.clone();
        let name = self.event.kind().name();

        async move {
            let args = match filter {
                None => args,
                Some(re) => {
                    let Some(groups) = args.output().and_then(|line| captures(&re, &line)) else {
                        return;
                    };
                    let forked = args.fork();
                    forked.insert(MATCHED_FIELD, groups);
                    forked
                }
            };

            let result = Ambient::new(args, server).scope(async move { callback().await }).await;
            if let Err(e) = result {
                tracing::warn!("Handler for {} failed: {:#}", name, e);
            }
        }
    }
}

// ─── One-shot future ─────────────────────────────────────────

/// Resolves at the next emission of the kind it was registered for.
///
/// Also completes if the bus is dropped first.
#[must_use = "NextEvent does nothing unless awaited"]
pub struct NextEvent {
    rx: oneshot::Receiver<()>,
}

impl Future for NextEvent {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        Pin::new(&mut self.rx).poll(cx).map(|_| ())
    }
}

// ─── Bus ─────────────────────────────────────────────────────

pub struct EventBus<K: EventKind> {
    handlers: RwLock<HashMap<K, Vec<Handler<K>>>>,
    pending: Mutex<HashMap<K, Vec<oneshot::Sender<()>>>>,
    /// Aware-task registry of the bus owner.
    tasks: AwareTasks,
}

impl<K: EventKind> EventBus<K> {
    pub fn new(tasks: AwareTasks) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            tasks,
        }
    }

    /// Append a handler; registration order is emission order.
    pub fn register(&self, handler: Handler<K>) {
        let kind = handler.event().kind();
        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.entry(kind).or_default().push(handler);
    }

    /// Future resolving at the next emission of `kind`.
    pub fn register_fut(&self, kind: K) -> NextEvent {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending.entry(kind).or_default().push(tx);
        NextEvent { rx }
    }

    pub fn handler_count(&self) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.values().map(Vec::len).sum()
    }

    pub fn handlers_for(&self, kind: K) -> usize {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.get(&kind).map_or(0, Vec::len)
    }

    /// Schedule every handler of `kind` as its own task.
    ///
    /// With `force_wait` the caller suspends until all of them have finished
    /// (successfully or not). Pending one-shot futures for `kind` are resolved
    /// afterwards, whether or not any handler exists.
    pub(crate) async fn emit(&self, kind: K, args: Option<EventArgs>, force_wait: bool, server: Option<Server>) {
        let args = args.unwrap_or_default();
        let handlers: Vec<Handler<K>> = {
            let map = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            map.get(&kind).cloned().unwrap_or_default()
        };

        let mut spawned = Vec::with_capacity(handlers.len());
        for handler in &handlers {
            let fut = handler.invocation(args.clone(), server.clone());
            let handle = if handler.is_aware() {
                self.tasks.spawn(fut)
            } else {
                tokio::spawn(fut)
            };
            spawned.push(handle);
        }

        if force_wait {
            for handle in spawned {
                if let Err(e) = handle.await {
                    if e.is_panic() {
                        tracing::warn!("Handler for {} panicked", kind.name());
                    }
                }
            }
        }

        self.resolve_pending(kind);
    }

    fn resolve_pending(&self, kind: K) {
        let waiters = {
            let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
            pending.remove(&kind).unwrap_or_default()
        };
        for tx in waiters {
            let _ = tx.send(());
        }
    }
}
