//! Error types for external tool invocations

use std::path::PathBuf;

use thiserror::Error;

use crate::interfaces::ToolKind;

/// Errors that can occur while driving an external imaging tool
#[derive(Error, Debug)]
pub enum ToolError {
    /// Executable could not be spawned (not installed or not in PATH)
    #[error("{program} is not installed or not in PATH")]
    NotFound { tool: ToolKind, program: String },

    /// Tool ran but exited with a non-zero status
    #[error("{program} exited with code {code}: {stderr}")]
    Failed {
        tool: ToolKind,
        program: String,
        code: i32,
        stderr: String,
    },

    /// Tool exceeded its wall-clock budget and was killed
    #[error("{program} timed out after {secs}s")]
    TimedOut {
        tool: ToolKind,
        program: String,
        secs: u64,
    },

    /// Tool output did not match the expected report format
    #[error("could not parse {tool} output: {detail}")]
    Parse { tool: ToolKind, detail: String },

    /// Tool reported success but the expected file is absent
    #[error("{tool} produced no output at {}", path.display())]
    MissingOutput { tool: ToolKind, path: PathBuf },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    /// The collaborator that raised this error, when known.
    pub fn tool(&self) -> Option<ToolKind> {
        match self {
            ToolError::NotFound { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::TimedOut { tool, .. }
            | ToolError::Parse { tool, .. }
            | ToolError::MissingOutput { tool, .. } => Some(*tool),
            ToolError::Io(_) => None,
        }
    }

    pub(crate) fn parse(tool: ToolKind, detail: impl Into<String>) -> Self {
        ToolError::Parse {
            tool,
            detail: detail.into(),
        }
    }
}

/// Result type for toolkit operations
pub type ToolResult<T> = std::result::Result<T, ToolError>;
