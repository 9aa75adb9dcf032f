//! Extension capability surface.
//!
//! An extension registers handlers on a [`Supervisor`] before it runs. It may
//! keep a clone of the supervisor handle for use inside those handlers;
//! handler context (current args, current server) is available through
//! [`crate::event::context`].

mod console;

pub use console::ConsoleBridge;

use crate::supervisor::Supervisor;

pub trait Extension: Send + Sync {
    fn name(&self) -> &str;

    fn load(&self, supervisor: &Supervisor) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::SupervisorEventKind;
    use crate::supervisor::SupervisorError;

    struct Greeter;

    impl Extension for Greeter {
        fn name(&self) -> &str {
            "greeter"
        }

        fn load(&self, supervisor: &Supervisor) -> anyhow::Result<()> {
            supervisor.on(SupervisorEventKind::AllLoaded, || async { Ok(()) }, false);
            Ok(())
        }
    }

    struct Broken;

    impl Extension for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn load(&self, _supervisor: &Supervisor) -> anyhow::Result<()> {
            anyhow::bail!("missing config")
        }
    }

    #[test]
    fn test_load_extension_registers_handlers() {
        let supervisor = Supervisor::new();
        supervisor.load_extension(&Greeter).unwrap();
        assert_eq!(supervisor.handler_count(), 1);

        let err = supervisor.load_extension(&Broken).unwrap_err();
        assert!(matches!(err, SupervisorError::Extension { ref name, .. } if name == "broken"));
    }
}
