//! External process invocation behind a narrow, mockable interface.

use std::ffi::OsString;
use std::process::Command;

use thiserror::Error;

/// Result of running an external command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CommandOutput {
    /// Exit code reported by the process, if available.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Returns `true` when the exit code equals zero.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self.code, Some(0))
    }
}

/// Errors raised while running host utilities.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum CommandError {
    /// Raised when the process cannot be started.
    #[error("failed to spawn {program}: {message}")]
    Spawn {
        /// Program that failed to start.
        program: String,
        /// Error reported by the operating system.
        message: String,
    },
    /// Raised when the process exits unsuccessfully.
    #[error("{program} exited with status {status}: {stderr}")]
    Failed {
        /// Program that failed.
        program: String,
        /// Exit status, or `unknown` when terminated by a signal.
        status: String,
        /// Captured standard error.
        stderr: String,
    },
}

impl CommandError {
    /// Builds a [`CommandError::Failed`] from a captured output.
    #[must_use]
    pub fn failed(program: &str, output: &CommandOutput) -> Self {
        Self::Failed {
            program: program.to_owned(),
            status: output
                .code
                .map_or_else(|| String::from("unknown"), |code| code.to_string()),
            stderr: output.stderr.trim().to_owned(),
        }
    }
}

/// Abstraction over command execution to support fakes in tests.
pub trait CommandRunner: Send + Sync {
    /// Runs `program` with the given arguments, capturing stdout and stderr.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Spawn`] if the command cannot be started.
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError>;

    /// Runs `program` and fails unless it exits with status zero.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::Failed`] on a non-zero exit.
    fn run_checked(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = self.run(program, args)?;
        if output.is_success() {
            Ok(output)
        } else {
            Err(CommandError::failed(program, &output))
        }
    }
}

/// Real command runner that shells out to the host operating system.
#[derive(Clone, Debug, Default)]
pub struct ProcessCommandRunner;

impl CommandRunner for ProcessCommandRunner {
    fn run(&self, program: &str, args: &[OsString]) -> Result<CommandOutput, CommandError> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|err| CommandError::Spawn {
                program: program.to_owned(),
                message: err.to_string(),
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Converts string arguments into the owned form expected by runners.
#[must_use]
pub fn args<I, S>(values: I) -> Vec<OsString>
where
    I: IntoIterator<Item = S>,
    S: Into<OsString>,
{
    values.into_iter().map(Into::into).collect()
}
