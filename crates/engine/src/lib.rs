//! vidmerge batch engine
//!
//! Core batch job engine for the vidmerge desktop tool: schedules encode
//! jobs across a bounded worker pool, supervises external encoder
//! processes, classifies and retries failures, reclaims locked temp files,
//! and picks non-repeating material combinations.

pub mod classify;
pub mod executor;
pub mod naming;
pub mod reclaim;
pub mod runner;
pub mod scan;
pub mod scheduler;
pub mod selector;
pub mod supervisor;
pub mod tasks;

pub use vidmerge_config as config;
pub use vidmerge_config::EngineConfig;

pub use classify::{classify, should_retry, FailureReason};
pub use executor::RetryExecutor;
pub use naming::generate_unique_output_path;
pub use reclaim::{ReclaimError, ResourceReclaimer, TempFileClass};
pub use runner::{CancelToken, JobRunner, RunnerContext, RunnerError, RunnerFactory};
pub use scan::{is_material_file, list_materials, MATERIAL_EXTENSIONS};
pub use scheduler::{
    BatchJob, BatchScheduler, BatchStatistics, JobStatus, SchedulerEvent,
};
pub use selector::{SelectorError, SelectorStatistics, SequenceSelector};
pub use supervisor::{
    is_unfinished_output, monitor_progress, ManagedProcess, ProcessSupervisor,
};
pub use tasks::{
    BatchJobInfo, JobSpec, JobStatistics, TaskInfo, TaskStatus, TaskStore, TaskStoreError,
};
