//! External tool invocation with timeout and output capture.

use std::ffi::OsString;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::debug;

use crate::error::{ToolError, ToolResult};
use crate::interfaces::ToolKind;

/// Captured result of a finished tool process.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    /// Exit code (0 = success).
    pub exit_code: i32,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,

    /// Duration in milliseconds.
    pub duration_ms: u64,
}

/// One blocking invocation of an external tool binary.
///
/// The child is spawned with `kill_on_drop`, so aborting the awaiting task
/// (batch timeout, halted dispatch) also terminates the process.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    tool: ToolKind,
    program: String,
    args: Vec<OsString>,
    timeout: Option<Duration>,
}

impl ToolInvocation {
    pub fn new(tool: ToolKind, program: impl Into<String>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.as_os_str().to_os_string())
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Per-invocation wall-clock limit. `None` or zero means unbounded.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn argv(&self) -> &[OsString] {
        &self.args
    }

    /// Run the tool to completion; a non-zero exit is an error.
    pub async fn run(&self) -> ToolResult<ToolOutput> {
        let output = self.run_unchecked().await?;
        if output.exit_code != 0 {
            return Err(ToolError::Failed {
                tool: self.tool,
                program: self.program.clone(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }

    /// Run the tool to completion and return whatever it produced.
    pub async fn run_unchecked(&self) -> ToolResult<ToolOutput> {
        let start = Instant::now();
        debug!(tool = %self.tool, program = %self.program, args = ?self.args, "invoking tool");

        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    ToolError::NotFound {
                        tool: self.tool,
                        program: self.program.clone(),
                    }
                } else {
                    ToolError::Io(e)
                }
            })?;

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ToolError::TimedOut {
                    tool: self.tool,
                    program: self.program.clone(),
                    secs: limit.as_secs(),
                })??,
            None => child.wait_with_output().await?,
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let exit_code = output.status.code().unwrap_or(-1);
        debug!(program = %self.program, exit_code, duration_ms, "tool finished");

        Ok(ToolOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = ToolInvocation::new(ToolKind::ImageInfo, "echo")
            .arg("dim1 256")
            .run()
            .await
            .expect("echo should run");
        assert_eq!(out.exit_code, 0);
        assert!(out.stdout.contains("dim1 256"));
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_failed() {
        let err = ToolInvocation::new(ToolKind::BiasCorrection, "false")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::Failed { code, .. } if code != 0));
    }

    #[tokio::test]
    async fn test_missing_binary_is_not_found() {
        let err = ToolInvocation::new(ToolKind::Registration, "brainx-no-such-binary")
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_timeout_kills_slow_tool() {
        let err = ToolInvocation::new(ToolKind::Segmentation, "sleep")
            .arg("5")
            .timeout(Some(Duration::from_millis(100)))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }));
    }
}
