//! Domain-level error taxonomy for brainx.
//!
//! Every variant maps to exactly one process exit code (see
//! [`BrainxError::exit_code`]); the CLI reports that code plus the run's
//! error count, and the cause goes to the run log.

use std::path::PathBuf;

use brainx_toolkit::ToolError;

use crate::domain::stage::PipelineStage;

/// Process exit codes.
pub mod exit {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL: i32 = 1;
    pub const INVALID_ARGUMENT: i32 = 2;
    pub const FILE_NOT_FOUND: i32 = 3;
    pub const PERMISSION: i32 = 4;
    pub const IO: i32 = 5;
    pub const TIMEOUT: i32 = 6;
    pub const VALIDATION: i32 = 7;
    /// Stage errors occupy `STAGE_BASE + ordinal - 1`.
    pub const STAGE_BASE: i32 = 10;
    pub const DATA_CORRUPT: i32 = 30;
    pub const DATA_MISSING: i32 = 31;
    pub const DATA_INCOMPATIBLE: i32 = 32;
    pub const MISSING_DEPENDENCY: i32 = 127;
}

/// brainx domain errors.
#[derive(Debug, thiserror::Error)]
pub enum BrainxError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("missing dependency: {0}")]
    MissingDependency(String),

    #[error("data missing: {0}")]
    DataMissing(String),

    #[error("data corrupt: {0}")]
    DataCorrupt(String),

    #[error("data incompatible: {0}")]
    DataIncompatible(String),

    #[error("external tool error: {0}")]
    ExternalTool(ToolError),

    #[error(
        "validation failed for {stage}: {} missing, {} invalid",
        .missing.len(),
        .invalid.len()
    )]
    Validation {
        stage: String,
        missing: Vec<String>,
        invalid: Vec<String>,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    #[error("permission denied: {}", .0.display())]
    Permission(PathBuf),

    #[error("config error: {0}")]
    Config(String),

    #[error("stage {stage} failed: {reason}")]
    Stage {
        stage: PipelineStage,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrainxError {
    /// Exit code reported to the shell for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            BrainxError::InvalidArgument(_) | BrainxError::Config(_) => exit::INVALID_ARGUMENT,
            BrainxError::MissingDependency(_) => exit::MISSING_DEPENDENCY,
            BrainxError::DataMissing(_) => exit::DATA_MISSING,
            BrainxError::DataCorrupt(_) => exit::DATA_CORRUPT,
            BrainxError::DataIncompatible(_) => exit::DATA_INCOMPATIBLE,
            BrainxError::ExternalTool(err) => match err {
                ToolError::TimedOut { .. } => exit::TIMEOUT,
                ToolError::Io(io) => io_exit_code(io),
                other => other.tool().map_or(exit::GENERAL, |t| t.exit_code()),
            },
            BrainxError::Validation { .. } => exit::VALIDATION,
            BrainxError::Timeout { .. } => exit::TIMEOUT,
            BrainxError::FileNotFound(_) => exit::FILE_NOT_FOUND,
            BrainxError::Permission(_) => exit::PERMISSION,
            BrainxError::Stage { stage, .. } => exit::STAGE_BASE + i32::from(stage.ordinal()) - 1,
            BrainxError::Serialization(_) => exit::GENERAL,
            BrainxError::Io(io) => io_exit_code(io),
        }
    }

    /// Shorthand for a stage-level failure.
    pub fn stage(stage: PipelineStage, reason: impl Into<String>) -> Self {
        BrainxError::Stage {
            stage,
            reason: reason.into(),
        }
    }
}

fn io_exit_code(err: &std::io::Error) -> i32 {
    match err.kind() {
        std::io::ErrorKind::NotFound => exit::FILE_NOT_FOUND,
        std::io::ErrorKind::PermissionDenied => exit::PERMISSION,
        _ => exit::IO,
    }
}

impl From<ToolError> for BrainxError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::NotFound { program, .. } => BrainxError::MissingDependency(program),
            other => BrainxError::ExternalTool(other),
        }
    }
}

/// Result type for brainx domain operations.
pub type Result<T> = std::result::Result<T, BrainxError>;

#[cfg(test)]
mod tests {
    use super::*;
    use brainx_toolkit::ToolKind;

    #[test]
    fn test_data_errors_map_to_data_band() {
        assert_eq!(BrainxError::DataCorrupt("x".into()).exit_code(), 30);
        assert_eq!(BrainxError::DataMissing("x".into()).exit_code(), 31);
        assert_eq!(BrainxError::DataIncompatible("x".into()).exit_code(), 32);
    }

    #[test]
    fn test_stage_error_uses_ordinal() {
        let err = BrainxError::stage(PipelineStage::Import, "no DICOM");
        assert_eq!(err.exit_code(), 10);
        let err = BrainxError::stage(PipelineStage::Tracking, "summary");
        assert_eq!(err.exit_code(), 17);
        assert!(err.to_string().contains("tracking"));
    }

    #[test]
    fn test_missing_executable_becomes_missing_dependency() {
        let err: BrainxError = ToolError::NotFound {
            tool: ToolKind::Registration,
            program: "antsRegistrationSyNQuick.sh".into(),
        }
        .into();
        assert!(matches!(err, BrainxError::MissingDependency(_)));
        assert_eq!(err.exit_code(), 127);
    }

    #[test]
    fn test_tool_failure_uses_tool_band() {
        let err: BrainxError = ToolError::Failed {
            tool: ToolKind::Segmentation,
            program: "fslmaths".into(),
            code: 1,
            stderr: String::new(),
        }
        .into();
        assert_eq!(err.exit_code(), 25);
    }

    #[test]
    fn test_io_errors_split_by_kind() {
        let nf = BrainxError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "x"));
        let perm = BrainxError::from(std::io::Error::new(std::io::ErrorKind::PermissionDenied, "x"));
        let other = BrainxError::from(std::io::Error::new(std::io::ErrorKind::Other, "x"));
        assert_eq!(nf.exit_code(), 3);
        assert_eq!(perm.exit_code(), 4);
        assert_eq!(other.exit_code(), 5);
    }

    #[test]
    fn test_validation_display_counts() {
        let err = BrainxError::Validation {
            stage: "registration".into(),
            missing: vec!["registered/*_reg.nii.gz".into()],
            invalid: vec![],
        };
        assert!(err.to_string().contains("1 missing"));
        assert_eq!(err.exit_code(), 7);
    }
}
