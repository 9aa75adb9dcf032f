//! Output pipeline - stream watchers feeding a shared line queue that is
//! drained into `Output` events under the exchange lock.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Notify};

use super::Server;
use crate::event::ServerEventKind;

// ─── Line queue ──────────────────────────────────────────────

/// Lines read from the process and not yet delivered.
#[derive(Debug, Default)]
pub(crate) struct LineQueue {
    lines: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl LineQueue {
    fn lock(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn push(&self, line: String) {
        self.lock().push_back(line);
        self.notify.notify_one();
    }

    pub(crate) fn pop(&self) -> Option<String> {
        self.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait for the next line. Only called with the exchange lock held, so
    /// there is a single consumer.
    pub(crate) async fn next(&self) -> String {
        loop {
            let notified = self.notify.notified();
            if let Some(line) = self.pop() {
                return line;
            }
            notified.await;
        }
    }
}

/// State guarded by the exchange lock.
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    /// Lines consumed by an interaction that still have to go out as `Output`.
    pub(crate) passed: VecDeque<String>,
}

// ─── Watchers ────────────────────────────────────────────────

/// Strip the line terminator and decode, replacing invalid UTF-8.
fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    if end > 0 && buf[end - 1] == b'\n' {
        end -= 1;
    }
    if end > 0 && buf[end - 1] == b'\r' {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// Read `reader` line by line until end of stream.
pub(crate) async fn watch<R>(server: Server, reader: R, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::with_capacity(256);

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => {
                tracing::debug!("{} of server '{}' closed", stream, server.id());
                break;
            }
            Ok(_) => {
                let line = decode_line(&buf);
                if line.is_empty() {
                    tokio::task::yield_now().await;
                    continue;
                }
                on_line(&server, line).await;
            }
            Err(e) => {
                tracing::debug!("{} of server '{}' read error: {}", stream, server.id(), e);
                break;
            }
        }
    }
}

async fn on_line(server: &Server, line: String) {
    let inner = &server.inner;
    if !inner.loaded.is_set() && inner.loaded_marker.is_match(&line) && inner.loaded.set_if_unset() {
        tracing::info!("Server '{}' loaded", server.id());
        server.emit(ServerEventKind::Loaded, None, false).await;
    }
    inner.queue.push(line);
    drain(server).await;
}

/// Deliver pending lines as `Output`: side queue first, then the shared
/// queue. Returns at once if an interaction or another drain holds the lock;
/// the holder delivers instead.
pub(crate) async fn drain(server: &Server) {
    let inner = &server.inner;
    loop {
        {
            let Ok(mut exchange) = inner.exchange.try_lock() else {
                return;
            };
            while let Some(line) = exchange.passed.pop_front() {
                server.emit_output(line).await;
            }
            while let Some(line) = inner.queue.pop() {
                server.emit_output(line).await;
            }
        }
        // a line pushed between the last pop and the unlock saw the lock
        // held and left it to us
        if inner.queue.is_empty() {
            return;
        }
    }
}

/// Forward queued commands to the process stdin, one per line.
pub(crate) async fn write_stdin<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<String>, id: String)
where
    W: AsyncWrite + Unpin,
{
    while let Some(command) = rx.recv().await {
        let result = async {
            writer.write_all(command.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = result {
            tracing::debug!("stdin of server '{}' closed: {}", id, e);
            break;
        }
    }
}
