//! Persistent batch caption queue: job model, validation, scheduling, storage
//! and the worker that drives jobs through a caption backend.

pub mod backend;
pub mod error;
pub mod model;
pub mod schedule;
pub mod store;
pub mod validate;
pub mod worker;

pub use backend::{CaptionBackend, CaptionError, CaptionRequest, CaptionResult, HttpCaptionBackend};
pub use error::{QueueError, ValidationErrors};
pub use model::{
    BatchJob, BatchJobItem, GenerationOptions, ItemStatus, JobConfig, JobFilter, JobStatus,
    JobType, NewBatchJob,
};
pub use store::BatchStore;
pub use worker::{QueueHandle, QueueWorker, WorkerSettings};
