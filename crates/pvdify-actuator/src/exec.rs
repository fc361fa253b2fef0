//! Thin wrapper around `tokio::process::Command` that captures output.

use serde::Serialize;
use tokio::process::Command;
use tracing::trace;

use crate::error::{ActuatorError, ActuatorResult};

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `program args...` to completion. Non-zero exits are not errors here.
pub async fn run(program: &str, args: &[&str]) -> ActuatorResult<CommandOutput> {
    trace!(%program, ?args, "running command");
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ActuatorError::Spawn {
            program: program.to_string(),
            source,
        })?;
    Ok(CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// Run a command and fail with its captured output on non-zero exit.
pub async fn run_checked(program: &str, args: &[&str]) -> ActuatorResult<CommandOutput> {
    let output = run(program, args).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(failed(program, args, output))
    }
}

pub(crate) fn failed(program: &str, args: &[&str], output: CommandOutput) -> ActuatorError {
    ActuatorError::CommandFailed {
        command: render(program, args),
        exit_code: output.exit_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

pub(crate) fn render(program: &str, args: &[&str]) -> String {
    let mut s = program.to_string();
    for arg in args {
        s.push(' ');
        s.push_str(arg);
    }
    s
}
