//! Domain models for brainx.
//!
//! Canonical definitions for the core entities:
//! - `PipelineStage`: the eight ordered stages and their declared outputs
//! - `Modality`: imaging modalities and how files are matched to them
//! - `ScanCandidate`: one candidate file plus the metadata scoring needs
//! - `ReferenceDecision` / `ScanSelection`: persisted stage-2 decisions

pub mod candidate;
pub mod decision;
pub mod error;
pub mod modality;
pub mod quality;
pub mod stage;

pub use candidate::{AcquisitionDim, AcquisitionInfo, AcquisitionType, ScanCandidate};
pub use decision::{ReferenceDecision, ReferenceStrategy, ScanSelection, SelectedScan};
pub use error::{exit, BrainxError, Result};
pub use modality::{Modality, ModalityMatcher, ModalityPattern, ModalityPatterns, ModalityRole};
pub use quality::{PipelineKind, QualityParameters, QualityPreset};
pub use stage::{OutputPattern, PipelineStage, Prerequisite};
