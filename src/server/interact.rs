//! Request/response exchanges over the server's text channel.
//!
//! An interaction holds the exchange lock for its whole duration, so the
//! passive drain cannot consume the reply. Lines read while searching are
//! either the reply, discarded by the block pattern, or kept in the side
//! queue and re-emitted as ordinary `Output`.

use std::time::Duration;

use regex::Regex;

use super::pipeline::{drain, Exchange};
use super::{Server, ServerError};
use crate::event::captures;

#[derive(Debug, Clone, Default)]
pub struct InteractOptions {
    /// Give up after this long and return `None`.
    pub timeout: Option<Duration>,
    /// Also deliver the matching line as `Output` afterwards.
    pub match_reuse: bool,
    /// Lines matching this are swallowed instead of re-emitted.
    pub block_pattern: Option<String>,
}

impl InteractOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn match_reuse(mut self, reuse: bool) -> Self {
        self.match_reuse = reuse;
        self
    }

    pub fn block(mut self, pattern: impl Into<String>) -> Self {
        self.block_pattern = Some(pattern.into());
        self
    }
}

impl Server {
    /// Send `command` and wait for the first line matching `expect`.
    ///
    /// Returns the capture groups of the match (the whole match if `expect`
    /// has no groups), or `None` on timeout or if the process stops first.
    pub async fn interact(
        &self,
        command: &str,
        expect: &str,
        options: InteractOptions,
    ) -> Result<Option<Vec<String>>, ServerError> {
        let expect = Regex::new(expect)?;
        let block = options.block_pattern.as_deref().map(Regex::new).transpose()?;
        if !self.running().is_set() {
            return Err(ServerError::NotRunning(self.id().to_string()));
        }

        let outcome = self.exchange(command, &expect, block.as_ref(), &options).await;
        // retained and newly arrived lines go out now that the lock is free
        drain(self).await;
        outcome
    }

    async fn exchange(
        &self,
        command: &str,
        expect: &Regex,
        block: Option<&Regex>,
        options: &InteractOptions,
    ) -> Result<Option<Vec<String>>, ServerError> {
        let mut exchange = self.inner.exchange.lock().await;
        self.send(command)?;

        let search = async {
            tokio::select! {
                biased;
                groups = self.find(&mut exchange, expect, block, options.match_reuse) => Some(groups),
                _ = self.stopped().wait() => None,
            }
        };
        let found = match options.timeout {
            Some(limit) => tokio::time::timeout(limit, search).await.ok().flatten(),
            None => search.await,
        };
        if found.is_none() {
            tracing::debug!("No reply to '{}' on server '{}'", command, self.id());
        }
        Ok(found)
    }

    async fn find(
        &self,
        exchange: &mut Exchange,
        expect: &Regex,
        block: Option<&Regex>,
        match_reuse: bool,
    ) -> Vec<String> {
        loop {
            while let Some(line) = exchange.passed.pop_front() {
                self.emit_output(line).await;
            }

            let line = self.inner.queue.next().await;
            if let Some(groups) = captures(expect, &line) {
                if match_reuse {
                    exchange.passed.push_back(line);
                }
                return groups;
            }
            if block.is_some_and(|re| re.is_match(&line)) {
                continue;
            }
            exchange.passed.push_back(line);
        }
    }

    /// Whether an interaction currently holds the exchange lock.
    pub fn is_interacting(&self) -> bool {
        self.inner.exchange.try_lock().is_err()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ServerEventKind;
    use crate::server::testing::attached;
    use std::sync::{Arc, Mutex};
    use std::time::Instant;

    const LIST_REPLY: &str = r"There are (\d+) of a max of (\d+) players online";

    fn collect_output(server: &Server) -> Arc<Mutex<Vec<String>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        server.on(
            ServerEventKind::Output,
            move || {
                let sink = sink.clone();
                async move {
                    if let Some(line) = crate::event::context::args().and_then(|a| a.output()) {
                        sink.lock().unwrap().push(line);
                    }
                    Ok(())
                }
            },
            false,
        );
        seen
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    #[tokio::test]
    async fn test_interact_returns_capture_groups() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);

        let replier = tokio::spawn(async move {
            assert_eq!(peer.read_command().await.as_deref(), Some("list"));
            peer.write_stdout("[INFO]: Preparing spawn area").await;
            peer.write_stdout("[INFO]: There are 2 of a max of 20 players online").await;
            peer
        });

        let result = server
            .interact("list", LIST_REPLY, InteractOptions::new().timeout(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["2".to_string(), "20".to_string()]));

        let _peer = replier.await.unwrap();
        settle().await;
        // the noise line still reaches Output, the reply does not
        assert_eq!(*seen.lock().unwrap(), vec!["[INFO]: Preparing spawn area".to_string()]);
        assert!(!server.is_interacting());
    }

    #[tokio::test]
    async fn test_block_pattern_suppresses_lines() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);

        let replier = tokio::spawn(async move {
            peer.read_command().await;
            peer.write_stdout("Unknown command").await;
            peer.write_stdout("chat: hello").await;
            peer.write_stdout("Saved the game").await;
            peer
        });

        let result = server
            .interact(
                "save-all",
                "Saved the game",
                InteractOptions::new().block("Unknown command"),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["Saved the game".to_string()]));

        let _peer = replier.await.unwrap();
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec!["chat: hello".to_string()]);
    }

    #[tokio::test]
    async fn test_save_all_progress_line_blocked() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);

        let replier = tokio::spawn(async move {
            assert_eq!(peer.read_command().await.as_deref(), Some("/save-all flush"));
            peer.write_stdout("Saving the game (this may take a moment!)").await;
            peer.write_stdout("Saved the game").await;
            peer
        });

        let result = server
            .interact(
                "/save-all flush",
                "Saved the game",
                InteractOptions::new().block("Saving the game"),
            )
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["Saved the game".to_string()]));

        let _peer = replier.await.unwrap();
        settle().await;
        assert!(seen.lock().unwrap().is_empty());
        assert!(!server.is_interacting());
    }

    #[tokio::test]
    async fn test_match_reuse_replays_reply_once() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);

        let replier = tokio::spawn(async move {
            peer.read_command().await;
            peer.write_stdout("There are 0 of a max of 20 players online").await;
            peer
        });

        let result = server
            .interact("list", LIST_REPLY, InteractOptions::new().match_reuse(true))
            .await
            .unwrap();
        assert_eq!(result, Some(vec!["0".to_string(), "20".to_string()]));

        let _peer = replier.await.unwrap();
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["There are 0 of a max of 20 players online".to_string()]
        );
    }

    #[tokio::test]
    async fn test_timeout_returns_none_and_keeps_lines() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);
        let limit = Duration::from_millis(200);

        let replier = tokio::spawn(async move {
            peer.read_command().await;
            peer.write_stdout("noise one").await;
            peer.write_stdout("noise two").await;
            peer
        });

        let started = Instant::now();
        let result = server
            .interact("list", LIST_REPLY, InteractOptions::new().timeout(limit))
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result, None);
        assert!(elapsed >= limit);
        assert!(elapsed < limit + Duration::from_secs(1));

        let _peer = replier.await.unwrap();
        settle().await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["noise one".to_string(), "noise two".to_string()]
        );
    }

    #[tokio::test]
    async fn test_lines_during_interaction_wait_for_the_lock() {
        let (server, mut peer) = attached("main");
        let seen = collect_output(&server);

        let interaction = {
            let server = server.clone();
            tokio::spawn(async move {
                server
                    .interact("list", LIST_REPLY, InteractOptions::new().timeout(Duration::from_secs(5)))
                    .await
            })
        };

        assert_eq!(peer.read_command().await.as_deref(), Some("list"));
        assert!(server.is_interacting());
        peer.write_stdout("There are 1 of a max of 20 players online").await;

        let result = interaction.await.unwrap().unwrap();
        assert_eq!(result, Some(vec!["1".to_string(), "20".to_string()]));

        peer.write_stdout("after").await;
        settle().await;
        assert_eq!(*seen.lock().unwrap(), vec!["after".to_string()]);
    }

    #[tokio::test]
    async fn test_interact_requires_running_server() {
        let server = crate::server::testing::detached("idle");
        let err = server
            .interact("list", LIST_REPLY, InteractOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::NotRunning(ref id) if id == "idle"));
    }

    #[tokio::test]
    async fn test_invalid_expect_pattern() {
        let (server, _peer) = attached("main");
        let err = server
            .interact("list", "(unclosed", InteractOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ServerError::Pattern(_)));
        assert!(!server.is_interacting());
    }
}
