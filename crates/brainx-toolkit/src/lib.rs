//! brainx-toolkit: the external imaging collaborators brainx drives
//!
//! Every operation brainx delegates (DICOM conversion, bias correction,
//! skull stripping, registration, atlas segmentation, image probes, lesion
//! clustering, QC rendering) sits behind a narrow async trait with typed
//! request and response structs.
//!
//! ## Implementations
//!
//! - [`CommandToolkit`]: shells out to dcm2niix, DCMTK, ANTs and FSL.
//! - [`fakes::FakeToolkit`]: deterministic in-process fake for tests.

pub mod command;
pub mod error;
pub mod external;
pub mod fakes;
pub mod interfaces;
pub mod parse;

pub use command::{ToolInvocation, ToolOutput};
pub use error::{ToolError, ToolResult};
pub use external::{CommandToolkit, ToolPaths};
pub use interfaces::*;
