//! External raster tool execution.
//!
//! Tiling, overview generation, inspection and COG repacking are delegated
//! to GDAL command-line programs. Stages build a [`ToolInvocation`] and hand
//! it to a [`ToolRunner`]; the production runner spawns the process on a
//! bounded pool so concurrent slices cannot exhaust the process table.

use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::error::ToolError;

/// One external program call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Append a GDAL creation option (`-co KEY=VALUE`).
    pub fn creation_option(self, key: &str, value: &str) -> Self {
        self.arg("-co").arg(format!("{}={}", key, value))
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Short tool name for logs and metrics (`/usr/bin/gdalinfo` -> `gdalinfo`).
    pub fn tool_name(&self) -> &str {
        Path::new(&self.program)
            .file_name()
            .and_then(OsStr::to_str)
            .unwrap_or(&self.program)
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }
}

impl fmt::Display for ToolInvocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Captured output of a successful invocation.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
}

/// Executes external tools.
///
/// Contract: zero exit code is success, anything else is
/// [`ToolError::Failed`] carrying the captured diagnostic output.
#[async_trait]
pub trait ToolRunner: Send + Sync {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError>;
}

/// Runs tools as child processes, at most `max_processes` at a time.
///
/// Processes are never killed once started: a half-written output is
/// worse than waiting for the tool to finish.
pub struct ProcessRunner {
    permits: Arc<Semaphore>,
}

impl ProcessRunner {
    pub fn new(max_processes: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_processes.max(1))),
        }
    }
}

#[async_trait]
impl ToolRunner for ProcessRunner {
    async fn run(&self, invocation: &ToolInvocation) -> Result<ToolOutput, ToolError> {
        let tool = invocation.tool_name().to_string();

        // The semaphore is never closed, so acquisition only fails if it is.
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|e| ToolError::Launch {
                tool: tool.clone(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?;

        debug!(command = %invocation, "Running external tool");
        let started = Instant::now();

        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .await
            .map_err(|source| {
                metrics::counter!("archive_tool_invocations_total", "tool" => tool.clone(), "status" => "launch_error")
                    .increment(1);
                ToolError::Launch {
                    tool: tool.clone(),
                    source,
                }
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !output.status.success() {
            metrics::counter!("archive_tool_invocations_total", "tool" => tool.clone(), "status" => "failed")
                .increment(1);
            warn!(
                tool = %tool,
                exit_code = ?output.status.code(),
                elapsed_ms = elapsed_ms,
                stderr = %stderr,
                "External tool failed"
            );
            return Err(ToolError::Failed {
                tool,
                exit_code: output.status.code(),
                stderr,
            });
        }

        metrics::counter!("archive_tool_invocations_total", "tool" => tool.clone(), "status" => "ok")
            .increment(1);
        debug!(tool = %tool, elapsed_ms = elapsed_ms, "External tool finished");

        Ok(ToolOutput {
            stdout: output.stdout,
            stderr,
        })
    }
}
