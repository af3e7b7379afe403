use std::path::Path;

use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use crate::error::{GclError, Result};

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub exit_code: i32,
}

/// Process execution used for git metadata and project include archives.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput>;

    /// Runs a command and fails unless it exits with code 0.
    async fn run_checked(&self, program: &str, args: &[&str], cwd: &Path) -> Result<String> {
        let output = self.run(program, args, cwd).await?;
        if output.exit_code != 0 {
            return Err(GclError::Command {
                command: std::iter::once(program)
                    .chain(args.iter().copied())
                    .collect::<Vec<_>>()
                    .join(" "),
                code: output.exit_code,
            });
        }
        Ok(output.stdout)
    }
}

/// Runs commands as local child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellRunner;

#[async_trait]
impl CommandRunner for ShellRunner {
    async fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<CommandOutput> {
        debug!("Running {program} {}", args.join(" "));
        let output = Command::new(program)
            .args(args)
            .current_dir(cwd)
            .output()
            .await?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }
}
