//! Console log sink used by instances and the supervisor for operator-facing
//! messages. Diagnostics go through `tracing`; this is the human console.

use std::borrow::Cow;
use std::io::Write;

/// Messages longer than this are cut and followed by an omission notice.
pub const MAX_MESSAGE_CHARS: usize = 2000;

pub trait LogSink: Send + Sync {
    /// Write one message, using `prefix` instead of the sink's default.
    fn log(&self, message: &str, prefix: Option<&str>);
}

/// Cut `message` to [`MAX_MESSAGE_CHARS`] characters, appending how many
/// were omitted.
pub fn truncate_message(message: &str) -> Cow<'_, str> {
    let total = message.chars().count();
    if total <= MAX_MESSAGE_CHARS {
        return Cow::Borrowed(message);
    }
    let head: String = message.chars().take(MAX_MESSAGE_CHARS).collect();
    Cow::Owned(format!(
        "{} ...({} characters omitted)",
        head,
        total - MAX_MESSAGE_CHARS
    ))
}

/// Writes `[HH:MM:SS] [prefix] message` lines to stdout.
#[derive(Debug, Clone)]
pub struct ConsoleLogger {
    prefix: String,
}

impl ConsoleLogger {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// The line `log` would print, without the timestamp.
    pub fn format_body(&self, message: &str, prefix: Option<&str>) -> String {
        format!(
            "[{}] {}",
            prefix.unwrap_or(&self.prefix),
            truncate_message(message)
        )
    }
}

impl LogSink for ConsoleLogger {
    fn log(&self, message: &str, prefix: Option<&str>) {
        let stamp = chrono::Local::now().format("%H:%M:%S");
        let mut out = std::io::stdout().lock();
        let _ = writeln!(out, "[{}] {}", stamp, self.format_body(message, prefix));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_message_untouched() {
        assert!(matches!(truncate_message("hello"), Cow::Borrowed("hello")));
        let exact = "a".repeat(MAX_MESSAGE_CHARS);
        assert_eq!(truncate_message(&exact), exact);
    }

    #[test]
    fn test_long_message_truncated_with_notice() {
        let long = "x".repeat(MAX_MESSAGE_CHARS + 345);
        let cut = truncate_message(&long);
        assert!(cut.starts_with(&"x".repeat(MAX_MESSAGE_CHARS)));
        assert!(cut.ends_with(" ...(345 characters omitted)"));
        assert_eq!(cut.chars().filter(|c| *c == 'x').count(), MAX_MESSAGE_CHARS);
    }

    #[test]
    fn test_truncation_counts_chars_not_bytes() {
        // 멀티바이트 문자도 한 글자로 센다
        let long = "가".repeat(MAX_MESSAGE_CHARS + 1);
        let cut = truncate_message(&long);
        assert!(cut.ends_with("(1 characters omitted)"));
    }

    #[test]
    fn test_prefix_override() {
        let logger = ConsoleLogger::new("main");
        assert_eq!(logger.format_body("Done", None), "[main] Done");
        assert_eq!(logger.format_body("Done", Some("autosave main")), "[autosave main] Done");
    }
}
