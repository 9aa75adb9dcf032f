//! Built-in console bridge: echoes server output to each server's log sink,
//! reports lifecycle milestones and forwards typed lines to the servers.
//!
//! A line starting with `@<id> ` goes to that server only; anything else
//! goes to every running server.

use crate::event::{context, ServerEventKind, SupervisorEventKind};
use crate::supervisor::Supervisor;

use super::Extension;

#[derive(Debug, Default, Clone, Copy)]
pub struct ConsoleBridge;

impl Extension for ConsoleBridge {
    fn name(&self) -> &str {
        "console"
    }

    fn load(&self, supervisor: &Supervisor) -> anyhow::Result<()> {
        let every_server = supervisor.server(None);

        every_server.on(
            ServerEventKind::Output,
            || async {
                let line = context::args().and_then(|a| a.output());
                if let (Some(server), Some(line)) = (context::server(), line) {
                    server.logger().log(&line, None);
                }
                Ok(())
            },
            false,
        );
        every_server.on(ServerEventKind::Loaded, || announce("Server loaded"), false);
        every_server.on(ServerEventKind::Stopped, || announce("Server stopped"), false);

        let sup = supervisor.clone();
        supervisor.on(
            SupervisorEventKind::AllLoaded,
            move || {
                let sup = sup.clone();
                async move {
                    sup.stdout("All servers loaded", None).await;
                    Ok(())
                }
            },
            false,
        );

        let sup = supervisor.clone();
        supervisor.on(
            SupervisorEventKind::AllStopped,
            move || {
                let sup = sup.clone();
                async move {
                    sup.stdout("All servers stopped", None).await;
                    Ok(())
                }
            },
            false,
        );

        let sup = supervisor.clone();
        supervisor.on(
            SupervisorEventKind::Stdin,
            move || {
                let sup = sup.clone();
                async move {
                    if let Some(line) = context::args().and_then(|a| a.output()) {
                        forward(&sup, &line).await;
                    }
                    Ok(())
                }
            },
            false,
        );

        Ok(())
    }
}

async fn announce(message: &'static str) -> anyhow::Result<()> {
    if let Some(server) = context::server() {
        server.logger().log(message, None);
    }
    Ok(())
}

/// Split `@id rest` into its target and command.
fn parse_target(line: &str) -> (Option<&str>, &str) {
    if let Some(rest) = line.strip_prefix('@') {
        if let Some((id, command)) = rest.split_once(char::is_whitespace) {
            if !id.is_empty() {
                return (Some(id), command.trim_start());
            }
        }
    }
    (None, line)
}

async fn forward(supervisor: &Supervisor, line: &str) {
    let (target, command) = parse_target(line);
    if command.is_empty() {
        return;
    }

    let servers = match target {
        Some(id) => match supervisor.get_server(id) {
            Some(server) => vec![server],
            None => {
                supervisor.stderr(&format!("Unknown server '{}'", id), None).await;
                return;
            }
        },
        None => supervisor.servers(),
    };

    for server in servers {
        if !server.running().is_set() {
            continue;
        }
        // an interaction is waiting for a reply; typed input would interleave
        if server.is_interacting() {
            supervisor
                .stderr(&format!("Server '{}' is busy, input ignored", server.id()), None)
                .await;
            continue;
        }
        if let Err(e) = server.send(command) {
            tracing::debug!("Console input not forwarded: {}", e);
        }
    }
}
