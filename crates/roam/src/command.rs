use std::process::{ExitStatus, Stdio};

use serde::Serialize;
use tokio::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("empty command line")]
    Empty,
    #[error("could not start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{program}' exited with {status}")]
    Exit { program: String, status: ExitStatus },
}

impl CommandError {
    /// Exit code to hand back to the shell. A signal maps to 128 + signo.
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Empty => 2,
            CommandError::Spawn { .. } => 127,
            CommandError::Exit { status, .. } => status
                .code()
                .or_else(|| signal_exit_code(status))
                .unwrap_or(1),
        }
    }
}

#[cfg(unix)]
fn signal_exit_code(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal().map(|signo| 128 + signo)
}

#[cfg(not(unix))]
fn signal_exit_code(_status: &ExitStatus) -> Option<i32> {
    None
}

/// Template values for a wrapped command: `{program}` and `{command}`.
#[derive(Debug, Clone, Serialize)]
pub struct CommandArgs {
    pub program: String,
    pub command: String,
    #[serde(skip)]
    argv: Vec<String>,
}

impl CommandArgs {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            program: argv.first().cloned().unwrap_or_default(),
            command: argv.join(" "),
            argv,
        }
    }
}

/// Run to completion with inherited stdio. Non-zero exit is an error.
pub async fn run_command(args: CommandArgs) -> Result<ExitStatus, CommandError> {
    let (program, rest) = args.argv.split_first().ok_or(CommandError::Empty)?;
    let status = Command::new(program)
        .args(rest)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| CommandError::Spawn {
            program: program.clone(),
            source,
        })?;

    if status.success() {
        Ok(status)
    } else {
        Err(CommandError::Exit {
            program: program.clone(),
            status,
        })
    }
}
