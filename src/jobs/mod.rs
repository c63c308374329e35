pub mod build;
pub mod task_runner;
pub mod tracker;

pub use build::{entry_document, IndexBuildPipeline, GENERIC_BUILD_FAILURE};
pub use task_runner::{start_queue, Task, Worker};
pub use tracker::{Admission, JobId, JobRecord, JobStatus, JobTarget, JobTracker, JobUpdate};
