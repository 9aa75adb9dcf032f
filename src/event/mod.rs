//! Event model - closed catalog of event kinds, per-handler output filters and
//! the `EventArgs` bag carried by one emission.
//!
//! Server-scoped kinds live on each instance's bus, supervisor-scoped kinds on
//! the supervisor's bus. Output-like kinds may carry a regex filter; the filter
//! is data on the [`Event`] value a handler was registered with, so a single
//! dispatch routine in [`bus`] serves every kind.

pub mod bus;
pub mod context;

use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use regex::Regex;
use serde_json::{Map, Value};
use thiserror::Error;

pub use bus::{EventBus, Handler, HandlerFuture, NextEvent};

/// Field holding the raw line for output-like events.
pub const OUTPUT_FIELD: &str = "output";
/// Field holding the capture groups when a handler filter matched.
pub const MATCHED_FIELD: &str = "matched";

#[derive(Error, Debug)]
pub enum EventError {
    #[error("event '{0}' does not carry output and cannot be filtered")]
    NotFilterable(&'static str),
    #[error("invalid filter pattern: {0}")]
    Pattern(#[from] regex::Error),
}

/// Common behaviour of the two event kind families.
pub trait EventKind: fmt::Debug + Copy + Eq + Hash + Send + Sync + 'static {
    /// Stable name, used as the handler map key in logs.
    fn name(&self) -> &'static str;

    /// Whether this kind carries an `output` field that a filter can test.
    fn is_output(&self) -> bool;
}

// ─── Kinds ───────────────────────────────────────────────────

/// Events raised by a single server instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerEventKind {
    BeforeStart,
    Loaded,
    Output,
    BeforeStop,
    Stopped,
}

impl EventKind for ServerEventKind {
    fn name(&self) -> &'static str {
        match self {
            Self::BeforeStart => "ServerBeforeStart",
            Self::Loaded => "ServerLoaded",
            Self::Output => "ServerOutput",
            Self::BeforeStop => "ServerBeforeStop",
            Self::Stopped => "ServerStopped",
        }
    }

    fn is_output(&self) -> bool {
        matches!(self, Self::Output)
    }
}

/// Events raised by the supervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SupervisorEventKind {
    /// A line typed on the console.
    Stdin,
    ExtensionsLoaded,
    AllLoaded,
    Stdout,
    Stderr,
    /// Either of `Stdout` / `Stderr`.
    Output,
    AllStopped,
}

impl EventKind for SupervisorEventKind {
    fn name(&self) -> &'static str {
        match self {
            Self::Stdin => "SupervisorStdin",
            Self::ExtensionsLoaded => "ExtensionsLoaded",
            Self::AllLoaded => "AllLoaded",
            Self::Stdout => "SupervisorStdout",
            Self::Stderr => "SupervisorStderr",
            Self::Output => "SupervisorOutput",
            Self::AllStopped => "AllStopped",
        }
    }

    fn is_output(&self) -> bool {
        matches!(self, Self::Stdin | Self::Stdout | Self::Stderr | Self::Output)
    }
}

// ─── Event (kind + filter) ───────────────────────────────────

/// The event a handler subscribes to: a kind plus an optional output filter.
#[derive(Debug, Clone)]
pub struct Event<K: EventKind> {
    kind: K,
    filter: Option<Regex>,
}

impl<K: EventKind> Event<K> {
    pub fn new(kind: K) -> Self {
        Self { kind, filter: None }
    }

    /// Subscribe only to occurrences whose `output` matches `pattern`.
    pub fn matching(kind: K, pattern: &str) -> Result<Self, EventError> {
        if !kind.is_output() {
            return Err(EventError::NotFilterable(kind.name()));
        }
        Ok(Self {
            kind,
            filter: Some(Regex::new(pattern)?),
        })
    }

    pub fn kind(&self) -> K {
        self.kind
    }

    pub fn filter(&self) -> Option<&Regex> {
        self.filter.as_ref()
    }
}

impl<K: EventKind> From<K> for Event<K> {
    fn from(kind: K) -> Self {
        Self::new(kind)
    }
}

/// Capture groups of the first match of `re` in `text`.
///
/// Every group is returned in order (an unmatched optional group becomes an
/// empty string). A pattern without groups yields the whole match.
pub fn captures(re: &Regex, text: &str) -> Option<Vec<String>> {
    let caps = re.captures(text)?;
    if caps.len() == 1 {
        return Some(vec![caps[0].to_string()]);
    }
    Some(
        caps.iter()
            .skip(1)
            .map(|g| g.map(|m| m.as_str().to_string()).unwrap_or_default())
            .collect(),
    )
}

// ─── EventArgs ───────────────────────────────────────────────

/// Open bag of fields attached to one emission.
///
/// Clones share the same map: every handler of an emission sees mutations
/// made by its siblings.
#[derive(Debug, Clone, Default)]
pub struct EventArgs {
    fields: Arc<Mutex<Map<String, Value>>>,
}

impl EventArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Args for an output-like event.
    pub fn with_output(output: impl Into<String>) -> Self {
        let args = Self::new();
        args.insert(OUTPUT_FIELD, Value::String(output.into()));
        args
    }

    fn lock(&self) -> MutexGuard<'_, Map<String, Value>> {
        // 필드 맵은 짧게만 잠기므로 poison 되어도 내용은 그대로 사용한다
        self.fields.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert(&self, key: impl Into<String>, value: impl Into<Value>) {
        self.lock().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.lock().remove(key)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.lock().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// The triggering line, for output-like events.
    pub fn output(&self) -> Option<String> {
        self.lock()
            .get(OUTPUT_FIELD)
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Capture groups set by a matching handler filter.
    pub fn matched(&self) -> Option<Vec<String>> {
        let fields = self.lock();
        let groups = fields.get(MATCHED_FIELD)?.as_array()?;
        Some(
            groups
                .iter()
                .map(|v| v.as_str().unwrap_or_default().to_string())
                .collect(),
        )
    }

    /// A detached copy with its own map, used when a filtered handler needs
    /// its own `matched` field.
    pub fn fork(&self) -> Self {
        Self {
            fields: Arc::new(Mutex::new(self.lock().clone())),
        }
    }

    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.fields, &other.fields)
    }
}
