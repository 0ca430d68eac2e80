//! Execution of privileged filesystem commands (mount, umount, mountpoint).

use std::process::{Command, Stdio};

use common::FailureKind;
use log::{debug, warn};
use thiserror::Error;

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to start `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{program} {args}` exited with {status:?}: {}", stderr_of(.output))]
    Failed {
        program: String,
        args: String,
        status: Option<i32>,
        output: CommandOutput,
    },
}

fn stderr_of(output: &CommandOutput) -> &str {
    output.stderr.trim()
}

impl CommandError {
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            CommandError::Spawn { .. } => None,
        }
    }

    /// umount reports the target is already gone.
    pub fn is_not_mounted(&self) -> bool {
        self.output()
            .map(|o| o.stderr.contains("not mounted") || o.stderr.contains("no mount point"))
            .unwrap_or(false)
    }

    pub fn is_permission_denied(&self) -> bool {
        match self {
            CommandError::Spawn { source, .. } => {
                source.kind() == std::io::ErrorKind::PermissionDenied
            }
            CommandError::Failed { output, .. } => {
                output.stderr.contains("ermission denied")
                    || output.stderr.contains("must be superuser")
            }
        }
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            CommandError::Spawn { .. } => FailureKind::Fatal,
            _ if self.is_permission_denied() => FailureKind::Fatal,
            CommandError::Failed { .. } => FailureKind::Retryable,
        }
    }
}

pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args`. Non-zero exits are returned as
    /// [`CommandError::Failed`] carrying whatever was captured.
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError>;

    /// Run with a whitespace separated argument string.
    fn run_args(&self, program: &str, args: &str) -> Result<CommandOutput, CommandError> {
        let args: Vec<&str> = args.split_whitespace().collect();
        self.run(program, &args)
    }
}

impl<R: CommandRunner + ?Sized> CommandRunner for std::sync::Arc<R> {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        (**self).run(program, args)
    }
}

/// Runs commands on the host through `std::process::Command`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput, CommandError> {
        debug!("[command] running: {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| {
                warn!("[command] failed to start {program}: {source}");
                CommandError::Spawn {
                    program: program.to_string(),
                    source,
                }
            })?;

        let captured = CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if captured.success() {
            Ok(captured)
        } else {
            warn!(
                "[command] {program} {} exited with {:?}: {}",
                args.join(" "),
                captured.status,
                captured.stderr.trim()
            );
            Err(CommandError::Failed {
                program: program.to_string(),
                args: args.join(" "),
                status: captured.status,
                output: captured,
            })
        }
    }
}
