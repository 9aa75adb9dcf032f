//! Ambient per-invocation context.
//!
//! Every handler invocation runs inside a task-local scope binding the event
//! args of its emission and, on a server bus, the server that emitted it.
//! Handlers read them through [`args`] and [`server`] instead of taking
//! parameters. The scope is popped on every exit path, including a panic, and
//! concurrently running invocations each see only their own bindings.

use std::future::Future;

use crate::event::EventArgs;
use crate::server::Server;

tokio::task_local! {
    static CURRENT_ARGS: EventArgs;
    static CURRENT_SERVER: Server;
}

/// Args of the emission the calling handler is running for.
pub fn args() -> Option<EventArgs> {
    CURRENT_ARGS.try_with(Clone::clone).ok()
}

/// Server the calling handler is bound to (server-scoped events only).
pub fn server() -> Option<Server> {
    CURRENT_SERVER.try_with(Clone::clone).ok()
}

/// Id of the bound server, if any.
pub fn server_id() -> Option<String> {
    CURRENT_SERVER.try_with(|s| s.id().to_string()).ok()
}

/// Snapshot of the bindings visible to the current task.
#[derive(Clone, Default)]
pub(crate) struct Ambient {
    args: Option<EventArgs>,
    server: Option<Server>,
}

impl Ambient {
    pub(crate) fn new(args: EventArgs, server: Option<Server>) -> Self {
        Self {
            args: Some(args),
            server,
        }
    }

    /// Captures whatever the caller currently sees, so a spawned task can
    /// re-bind it (task-locals are not inherited by `tokio::spawn`).
    pub(crate) fn current() -> Self {
        Self {
            args: args(),
            server: server(),
        }
    }

    pub(crate) async fn scope<F: Future>(self, fut: F) -> F::Output {
        match (self.args, self.server) {
            (Some(args), Some(server)) => {
                CURRENT_ARGS
                    .scope(args, CURRENT_SERVER.scope(server, fut))
                    .await
            }
            (Some(args), None) => CURRENT_ARGS.scope(args, fut).await,
            (None, Some(server)) => CURRENT_SERVER.scope(server, fut).await,
            (None, None) => fut.await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unbound_outside_handlers() {
        assert!(args().is_none());
        assert!(server().is_none());
        assert!(server_id().is_none());
    }

    #[tokio::test]
    async fn test_scope_binds_and_restores() {
        let outer = EventArgs::with_output("outer");
        let inner = EventArgs::with_output("inner");

        Ambient::new(outer.clone(), None)
            .scope(async {
                assert_eq!(args().and_then(|a| a.output()).as_deref(), Some("outer"));
                Ambient::new(inner.clone(), None)
                    .scope(async {
                        assert_eq!(args().and_then(|a| a.output()).as_deref(), Some("inner"));
                    })
                    .await;
                // inner scope popped
                assert_eq!(args().and_then(|a| a.output()).as_deref(), Some("outer"));
            })
            .await;

        assert!(args().is_none());
    }

    #[tokio::test]
    async fn test_scope_restored_after_panic() {
        let args_value = EventArgs::with_output("boom");
        let handle = tokio::spawn(async move {
            Ambient::new(args_value, None)
                .scope(async { panic!("handler failed") })
                .await
        });
        assert!(handle.await.is_err());
        assert!(args().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_scopes_are_isolated() {
        let mut handles = Vec::new();
        for i in 0..8 {
            handles.push(tokio::spawn(
                Ambient::new(EventArgs::with_output(format!("line {}", i)), None).scope(async move {
                    tokio::task::yield_now().await;
                    assert_eq!(args().and_then(|a| a.output()), Some(format!("line {}", i)));
                }),
            ));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }
}
