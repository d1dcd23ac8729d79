//! Shell command execution for profile stores, over SSH or on this machine.
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Best human-readable reason for a failed command.
    pub fn failure_reason(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        match self.code {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Runs one shell command line somewhere and collects its output.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Identity of the machine commands run on; used to key switch leases.
    fn host(&self) -> &str;

    async fn run(&self, command: &str) -> Result<ExecOutput, ExecError>;
}

pub fn quote_path(path: &Path) -> Cow<'_, str> {
    shell_escape::escape(path.to_string_lossy())
}

/// `ssh -o BatchMode=yes user@host -- <command>`.  Key-based auth only;
/// there is no way to answer a password prompt.
#[derive(Debug, Clone)]
pub struct SshExecutor {
    host: String,
    user: String,
    key_path: Option<PathBuf>,
    timeout: Duration,
}

impl SshExecutor {
    pub fn new(host: impl Into<String>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            key_path: None,
            timeout,
        }
    }

    pub fn with_key(mut self, key_path: Option<PathBuf>) -> Self {
        self.key_path = key_path;
        self
    }

    fn command(&self, remote: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new("ssh");
        cmd.arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.timeout.as_secs().max(1)));
        if let Some(key) = &self.key_path {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(format!("{}@{}", self.user, self.host))
            .arg("--")
            .arg(remote);
        cmd
    }
}

#[async_trait]
impl Executor for SshExecutor {
    fn host(&self) -> &str {
        &self.host
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, ExecError> {
        debug!("ssh {}@{}: {}", self.user, self.host, command);
        run_process(self.command(command), "ssh", self.timeout).await
    }
}

/// `sh -c <command>` on this machine.
#[derive(Debug, Clone)]
pub struct LocalExecutor {
    timeout: Duration,
}

impl LocalExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn host(&self) -> &str {
        "localhost"
    }

    async fn run(&self, command: &str) -> Result<ExecOutput, ExecError> {
        debug!("sh -c {}", command);
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command);
        run_process(cmd, "sh", self.timeout).await
    }
}

async fn run_process(
    mut cmd: tokio::process::Command,
    program: &str,
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    let child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: program.to_string(),
            source,
        })?;

    // On timeout the child is dropped and killed.
    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| ExecError::TimedOut(timeout))??;

    let output = ExecOutput {
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    };
    debug!("{} exited with {:?}", program, output.code);
    Ok(output)
}
