//! brainx pipeline
//!
//! The eight stage bodies and the resumable orchestrator that drives them:
//! - runs stages in order from a start stage, rediscovering earlier outputs
//! - validates every stage's artifacts before moving on
//! - counts best-effort failures instead of aborting
//! - runs one subject, or every subject of a batch directory
//! - traces hyperintensity clusters back to the DICOM slices they fall on

pub mod batch;
pub mod env;
pub mod orchestrator;
pub mod overlap;
pub mod resume;
pub mod scanner;
pub mod stage;
pub mod steps;
pub mod summary;
pub mod trace;

pub use batch::{discover_subjects, run_batch, BatchOutcome, BatchSettings};
pub use env::{settle, StageEnv};
pub use orchestrator::{Orchestrator, RunOutcome};
pub use overlap::{find_overlaps, ClusterOverlap};
pub use resume::{rediscover, Rediscovered};
pub use scanner::ScannerParams;
pub use stage::{StageBody, StageOutput, StageReport, StageStatus};
pub use summary::PipelineSummary;
pub use trace::{ClusterDicomTrace, ClusterTrace};
