pub mod config;
pub mod event;
pub mod extension;
pub mod logger;
pub mod server;
pub mod supervisor;
pub mod tasks;

pub use event::{context, Event, EventArgs, ServerEventKind, SupervisorEventKind};
pub use extension::{ConsoleBridge, Extension};
pub use logger::{ConsoleLogger, LogSink};
pub use server::{InteractOptions, LaunchConfig, Server, ServerError, ServerOptions};
pub use supervisor::{Supervisor, SupervisorError};
