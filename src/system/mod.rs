//! Orchestration: the pipeline, the store shared with the refinement
//! worker, and the run report.

pub mod pipeline;
pub mod refinement_worker;
pub mod report;
pub mod shared_state;

pub use pipeline::Pipeline;
pub use refinement_worker::RefinementWorker;
pub use report::{FailureReason, PipelineCounters, PipelineReport, PipelineStatus};
pub use shared_state::SharedState;
