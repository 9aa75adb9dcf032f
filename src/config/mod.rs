use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

use crate::server::{LaunchArgs, LaunchConfig, ServerOptions, DEFAULT_LOADED_PATTERN, DEFAULT_STOP_COMMAND, DEFAULT_WORLD_FOLDER};
use crate::supervisor::{Supervisor, SupervisorError};

pub const DEFAULT_CONFIG_PATH: &str = "config/servers.toml";
/// Environment variable overriding [`DEFAULT_CONFIG_PATH`].
pub const CONFIG_PATH_ENV: &str = "SABA_CONSOLE_CONFIG";

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ConsoleConfig {
    #[serde(default)]
    pub servers: Vec<ServerEntry>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct ServerEntry {
    pub id: String,
    pub executable: String,
    #[serde(default)]
    pub args: LaunchArgs,
    pub artifact: PathBuf,
    #[serde(default = "default_headless")]
    pub headless: bool,
    pub working_dir: Option<PathBuf>,
    #[serde(default = "default_world")]
    pub world: String,
    #[serde(default = "default_loaded_pattern")]
    pub loaded_pattern: String,
    #[serde(default = "default_stop_command")]
    pub stop_command: String,
}

fn default_headless() -> bool {
    true
}

fn default_world() -> String {
    DEFAULT_WORLD_FOLDER.to_string()
}

fn default_loaded_pattern() -> String {
    DEFAULT_LOADED_PATTERN.to_string()
}

fn default_stop_command() -> String {
    DEFAULT_STOP_COMMAND.to_string()
}

impl ServerEntry {
    pub fn launch_config(&self) -> LaunchConfig {
        LaunchConfig {
            executable: self.executable.clone(),
            args: self.args.clone(),
            artifact: self.artifact.clone(),
            headless: self.headless,
            working_dir: self.working_dir.clone(),
        }
    }

    pub fn options(&self) -> ServerOptions {
        ServerOptions {
            logger: None,
            world_folder_name: self.world.clone(),
            loaded_pattern: self.loaded_pattern.clone(),
            stop_command: self.stop_command.clone(),
        }
    }
}

impl ConsoleConfig {
    /// Load from `$SABA_CONSOLE_CONFIG`, or `config/servers.toml`.
    pub fn load() -> anyhow::Result<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    pub fn load_from(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml(&text).with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn get_server(&self, id: &str) -> Option<&ServerEntry> {
        self.servers.iter().find(|s| s.id == id)
    }

    /// Register every configured server on `supervisor`, in file order.
    pub fn apply(&self, supervisor: &Supervisor) -> Result<(), SupervisorError> {
        for entry in &self.servers {
            supervisor.add_server(entry.id.clone(), entry.launch_config(), entry.options())?;
        }
        Ok(())
    }
}
