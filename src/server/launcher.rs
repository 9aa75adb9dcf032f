//! Process launcher - starts a server child process with three piped streams.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("{what} must be an absolute path, got '{path}'")]
    RelativePath { what: &'static str, path: String },

    #[error("artifact '{0}' has no parent directory to run in")]
    MissingWorkingDir(String),

    #[error("failed to spawn process '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("spawned process is missing its {0} pipe")]
    MissingPipe(&'static str),
}

/// Extra arguments: either one whitespace-separated string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LaunchArgs {
    Line(String),
    List(Vec<String>),
}

impl Default for LaunchArgs {
    fn default() -> Self {
        LaunchArgs::List(Vec::new())
    }
}

impl LaunchArgs {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            LaunchArgs::Line(line) => line.split_whitespace().map(str::to_string).collect(),
            LaunchArgs::List(list) => list.clone(),
        }
    }
}

impl From<&str> for LaunchArgs {
    fn from(line: &str) -> Self {
        LaunchArgs::Line(line.to_string())
    }
}

impl From<Vec<String>> for LaunchArgs {
    fn from(list: Vec<String>) -> Self {
        LaunchArgs::List(list)
    }
}

/// How to start one server instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    pub executable: String,
    #[serde(default)]
    pub args: LaunchArgs,
    pub artifact: PathBuf,
    #[serde(default = "default_headless")]
    pub headless: bool,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_headless() -> bool {
    true
}

impl LaunchConfig {
    pub fn new(executable: impl Into<String>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: LaunchArgs::default(),
            artifact: artifact.into(),
            headless: true,
            working_dir: None,
        }
    }

    pub fn with_args(mut self, args: impl Into<LaunchArgs>) -> Self {
        self.args = args.into();
        self
    }

    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Check the path invariants; run before anything is started.
    pub fn validate(&self) -> Result<(), LaunchError> {
        require_absolute("artifact", &self.artifact)?;
        if let Some(dir) = &self.working_dir {
            require_absolute("working directory", dir)?;
        }
        self.working_dir().map(|_| ())
    }

    /// Explicit working directory, or the artifact's parent.
    pub fn working_dir(&self) -> Result<PathBuf, LaunchError> {
        if let Some(dir) = &self.working_dir {
            return Ok(dir.clone());
        }
        self.artifact
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .ok_or_else(|| LaunchError::MissingWorkingDir(self.artifact.display().to_string()))
    }

    /// Arguments passed after the executable.
    pub fn command_line(&self) -> Vec<String> {
        let mut argv = self.args.to_vec();
        argv.push("-jar".to_string());
        argv.push(self.artifact.display().to_string());
        if self.headless {
            argv.push("nogui".to_string());
        }
        argv
    }
}

fn require_absolute(what: &'static str, path: &Path) -> Result<(), LaunchError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(LaunchError::RelativePath {
            what,
            path: path.display().to_string(),
        })
    }
}

/// A started child with its streams taken out.
#[derive(Debug)]
pub struct ProcessHandle {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub pid: Option<u32>,
}

/// Spawn the process described by `config`.
pub fn load(config: &LaunchConfig) -> Result<ProcessHandle, LaunchError> {
    config.validate()?;
    let cwd = config.working_dir()?;

    let mut cmd = Command::new(&config.executable);
    cmd.args(config.command_line())
        .current_dir(&cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    hide_console_window(&mut cmd);

    let mut child = cmd.spawn().map_err(|source| LaunchError::Spawn {
        program: config.executable.clone(),
        source,
    })?;

    let pid = child.id();
    let stdin = child.stdin.take().ok_or(LaunchError::MissingPipe("stdin"))?;
    let stdout = child.stdout.take().ok_or(LaunchError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(LaunchError::MissingPipe("stderr"))?;

    tracing::info!(
        "Spawned '{}' in {} (pid: {:?})",
        config.executable,
        cwd.display(),
        pid
    );

    Ok(ProcessHandle {
        child,
        stdin,
        stdout,
        stderr,
        pid,
    })
}

/// Windows: hide the console window of the child.
#[cfg(target_os = "windows")]
fn hide_console_window(cmd: &mut Command) -> &mut Command {
    const CREATE_NO_WINDOW: u32 = 0x08000000;
    cmd.creation_flags(CREATE_NO_WINDOW)
}

#[cfg(not(target_os = "windows"))]
fn hide_console_window(cmd: &mut Command) -> &mut Command {
    cmd
}

/// Ask the process to terminate with TerminateProcess.
#[cfg(target_os = "windows")]
pub fn terminate(pid: u32) -> Result<(), String> {
    use winapi::um::handleapi::CloseHandle;
    use winapi::um::processthreadsapi::{OpenProcess, TerminateProcess};
    use winapi::um::winnt::PROCESS_TERMINATE;

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if handle.is_null() {
            return Err(format!("Failed to open process {}", pid));
        }
        let result = TerminateProcess(handle, 1);
        CloseHandle(handle);
        if result == 0 {
            return Err("TerminateProcess failed".to_string());
        }
    }
    Ok(())
}

/// Ask the process to terminate with SIGTERM.
#[cfg(not(target_os = "windows"))]
pub fn terminate(pid: u32) -> Result<(), String> {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| format!("pid {} out of range", pid))?;
    signal::kill(Pid::from_raw(raw), Signal::SIGTERM)
        .map_err(|e| format!("Failed to send SIGTERM to {}: {}", pid, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_string_or_list() {
        assert_eq!(
            LaunchArgs::from("-Xmx2G  -Xms1G").to_vec(),
            vec!["-Xmx2G".to_string(), "-Xms1G".to_string()]
        );
        let list = LaunchArgs::List(vec!["-Dfile.encoding=UTF-8".to_string()]);
        assert_eq!(list.to_vec(), vec!["-Dfile.encoding=UTF-8".to_string()]);
        assert!(LaunchArgs::default().to_vec().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_command_line_layout() {
        let config = LaunchConfig::new("/usr/bin/java", "/srv/mc/server.jar").with_args("-Xmx2G");
        assert_eq!(
            config.command_line(),
            vec!["-Xmx2G", "-jar", "/srv/mc/server.jar", "nogui"]
        );

        let windowed = config.headless(false);
        assert_eq!(windowed.command_line(), vec!["-Xmx2G", "-jar", "/srv/mc/server.jar"]);
    }

    #[cfg(unix)]
    #[test]
    fn test_working_dir_defaults_to_artifact_parent() {
        let config = LaunchConfig::new("java", "/srv/mc/server.jar");
        assert_eq!(config.working_dir().unwrap(), PathBuf::from("/srv/mc"));

        let explicit = config.with_working_dir("/srv/other");
        assert_eq!(explicit.working_dir().unwrap(), PathBuf::from("/srv/other"));
    }

    #[test]
    fn test_relative_paths_rejected() {
        let err = LaunchConfig::new("java", "server.jar").validate().unwrap_err();
        assert!(matches!(err, LaunchError::RelativePath { what: "artifact", .. }));

        #[cfg(unix)]
        {
            let err = LaunchConfig::new("java", "/srv/mc/server.jar")
                .with_working_dir("mc")
                .validate()
                .unwrap_err();
            assert!(matches!(err, LaunchError::RelativePath { what: "working directory", .. }));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_reported() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaunchConfig::new("/nonexistent/saba-java", dir.path().join("server.jar"));
        let err = load(&config).unwrap_err();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
