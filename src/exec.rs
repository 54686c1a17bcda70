// Remote Execution
//
// Everything the engine does on a machine goes through two seams: a local
// process runner (docker, lxc-*, aws, ssh binaries) and an SSH executor
// built on top of it.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::FileEntry;
use crate::error::{Error, ExitKind, Result};

/// Exit status `ssh` uses for its own failures
const SSH_TRANSPORT_FAILURE: i32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// None when killed by a signal
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> Vec<u8> {
        let mut out = self.stdout.clone();
        out.extend_from_slice(&self.stderr);
        out
    }

    pub fn exit_kind(&self) -> ExitKind {
        match self.status {
            Some(code) => ExitKind::Code(code),
            None => ExitKind::Signal,
        }
    }

    /// Turn a failed run into an `Exec` error
    pub fn check(self, target: &str, command: &str) -> Result<CommandOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::Exec {
            target: target.to_string(),
            command: command.to_string(),
            exit: self.exit_kind(),
            output: String::from_utf8_lossy(&self.combined()).trim().to_string(),
        })
    }
}

/// Stdio wiring for attached runs
#[derive(Debug)]
pub struct ExecStreams {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl ExecStreams {
    /// Use the caller's terminal
    pub fn inherit() -> Self {
        Self {
            stdin: Stdio::inherit(),
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
        }
    }

    /// Discard everything
    pub fn null() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion capturing stdout and stderr
    async fn run(&self, program: &str, args: &[String], stdin: Option<&[u8]>)
        -> Result<CommandOutput>;

    /// Run with caller-provided stdio, returning the exit code
    async fn run_attached(
        &self,
        program: &str,
        args: &[String],
        streams: ExecStreams,
    ) -> Result<Option<i32>>;
}

/// Runs programs on this machine
pub struct LocalRunner;

fn spawn_error(program: &str, err: std::io::Error) -> Error {
    Error::Exec {
        target: "localhost".to_string(),
        command: program.to_string(),
        exit: ExitKind::Transport,
        output: format!("failed to execute {}: {}", program, err),
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput> {
        debug!(program, args = ?args, "running command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(program, e))?;

        if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(input).await?;
            pipe.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn run_attached(
        &self,
        program: &str,
        args: &[String],
        streams: ExecStreams,
    ) -> Result<Option<i32>> {
        let status = Command::new(program)
            .args(args)
            .stdin(streams.stdin)
            .stdout(streams.stdout)
            .stderr(streams.stderr)
            .kill_on_drop(true)
            .status()
            .await
            .map_err(|e| spawn_error(program, e))?;
        Ok(status.code())
    }
}

/// Quote one argument for a POSIX shell
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Join argv into a single shell command line
pub fn shell_join(parts: &[String]) -> String {
    parts
        .iter()
        .map(|p| shell_quote(p))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Where and how to reach a machine over SSH
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
    pub key_path: PathBuf,
}

impl SshTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, key_path: &Path) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port: 22,
            key_path: key_path.to_path_buf(),
        }
    }
}

impl fmt::Display for SshTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run a shell command line; returns stdout and stderr combined
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>>;

    /// Write files to absolute paths, creating parent directories
    async fn copy(&self, target: &SshTarget, files: &[FileEntry]) -> Result<()>;

    /// Run with caller stdio, optionally allocating a terminal
    async fn attach(
        &self,
        target: &SshTarget,
        command: &str,
        streams: ExecStreams,
        interactive: bool,
    ) -> Result<()>;
}

/// Drives the system `ssh` client
pub struct SshExec {
    runner: Arc<dyn CommandRunner>,
    connect_timeout_secs: u64,
}

impl SshExec {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            connect_timeout_secs: 5,
        }
    }

    fn ssh_args(&self, target: &SshTarget, tty: bool) -> Vec<String> {
        let mut args = vec![
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout_secs),
        ];
        if tty {
            args.push("-t".to_string());
        } else {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push("-i".to_string());
        args.push(target.key_path.display().to_string());
        args.push(format!("{}@{}", target.user, target.host));
        args
    }

    fn classify(output: CommandOutput, target: &SshTarget, command: &str) -> Result<CommandOutput> {
        if output.status == Some(SSH_TRANSPORT_FAILURE) {
            return Err(Error::Exec {
                target: target.to_string(),
                command: command.to_string(),
                exit: ExitKind::Transport,
                output: output.stderr_str().trim().to_string(),
            });
        }
        output.check(&target.to_string(), command)
    }
}

#[async_trait]
impl RemoteExec for SshExec {
    async fn exec(&self, target: &SshTarget, command: &str) -> Result<Vec<u8>> {
        let mut args = self.ssh_args(target, false);
        args.push(command.to_string());
        let output = self.runner.run("ssh", &args, None).await?;
        Ok(Self::classify(output, target, command)?.combined())
    }

    async fn copy(&self, target: &SshTarget, files: &[FileEntry]) -> Result<()> {
        for file in files {
            let dir = Path::new(&file.path)
                .parent()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "/".to_string());
            let command = format!(
                "mkdir -p {} && cat > {}",
                shell_quote(&dir),
                shell_quote(&file.path)
            );
            let mut args = self.ssh_args(target, false);
            args.push(command.clone());

            let output = self.runner.run("ssh", &args, Some(&file.contents)).await?;
            if !output.success() {
                return Err(Error::transfer(
                    target.to_string(),
                    format!("{}: {}", file.path, output.stderr_str().trim()),
                ));
            }
        }
        Ok(())
    }

    async fn attach(
        &self,
        target: &SshTarget,
        command: &str,
        streams: ExecStreams,
        interactive: bool,
    ) -> Result<()> {
        let mut args = self.ssh_args(target, interactive);
        if !command.is_empty() {
            args.push(command.to_string());
        }
        let status = self.runner.run_attached("ssh", &args, streams).await?;
        match status {
            Some(0) => Ok(()),
            Some(SSH_TRANSPORT_FAILURE) => Err(Error::Exec {
                target: target.to_string(),
                command: command.to_string(),
                exit: ExitKind::Transport,
                output: String::new(),
            }),
            Some(code) => Err(Error::Exec {
                target: target.to_string(),
                command: command.to_string(),
                exit: ExitKind::Code(code),
                output: String::new(),
            }),
            None => Err(Error::Exec {
                target: target.to_string(),
                command: command.to_string(),
                exit: ExitKind::Signal,
                output: String::new(),
            }),
        }
    }
}
