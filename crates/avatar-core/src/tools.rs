//! External tools: `ffmpeg` (mp3 → wav) and `rhubarb` (wav → mouth-cue JSON).
//!
//! Commands are argument vectors handed straight to the OS, never shell strings,
//! and every invocation runs under a timeout. The child is killed if the wait
//! is abandoned.

use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::error::ExternalToolError;

/// A program plus its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// `ffmpeg -y -i <src> <dst>`
    pub fn transcode(ffmpeg: &Path, src: &Path, dst: &Path) -> Self {
        Self::new(ffmpeg).arg("-y").arg("-i").arg(src).arg(dst)
    }

    /// `rhubarb -f json -o <json> <wav> -r phonetic`
    pub fn lipsync(rhubarb: &Path, wav: &Path, json: &Path) -> Self {
        Self::new(rhubarb)
            .arg("-f")
            .arg("json")
            .arg("-o")
            .arg(json)
            .arg(wav)
            .arg("-r")
            .arg("phonetic")
    }

    /// Program name for logs and errors.
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Runs external commands. Implement for the OS or for tests.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion and return stdout.
    async fn run(&self, command: &ToolCommand) -> Result<String, ExternalToolError>;
}

/// Subprocess runner with a per-invocation timeout.
#[derive(Debug, Clone, Copy)]
pub struct SubprocessRunner {
    timeout: Duration,
}

impl SubprocessRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, command: &ToolCommand) -> Result<String, ExternalToolError> {
        let program = command.display_name();
        tracing::debug!(program = %program, args = ?command.args, "running external tool");
        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExternalToolError::Spawn {
                program: program.clone(),
                reason: e.to_string(),
            })?;

        // On timeout the output future is dropped, which drops (and kills) the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(ExternalToolError::Spawn {
                    program,
                    reason: e.to_string(),
                })
            }
            Err(_) => {
                return Err(ExternalToolError::Timeout {
                    program,
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(ExternalToolError::Exit {
                program,
                exit_code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}
