pub mod model;

pub use model::{GitContext, Job, JobError, JobStatus, RetryRecord};
