pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod inventory;
pub mod job;
pub mod manager;
pub mod manifest;
pub mod plan;
pub mod planner;
pub mod tools;
pub mod util;
pub mod validate;
pub mod worker;

pub use error::{CreateJobError, ExecutionError, JobError, PlanningError, ValidationError};
pub use job::{Job, JobId, JobStatus, StepRecord, StepStatus};
pub use manager::{JobManager, ManagerOptions};
