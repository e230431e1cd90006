//! # Conveyor core
//!
//! Contracts and types for the conveyor persistent background job queue:
//!
//! - [`StateStore`]: the persistence plane holding durable job records
//! - [`DispatchLayer`]: the queueing plane that orders and hands out ids
//! - [`HandlerRegistry`] / [`JobHandler`]: job-type to executor mapping
//! - [`Dispatcher`]: producer-facing submission surface
//!
//! Substrate implementations live in `conveyor-store` and
//! `conveyor-dispatch`; the coordination loop lives in `conveyor-worker`.

pub mod dispatch;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod job;
pub mod store;

pub use dispatch::DispatchLayer;
pub use dispatcher::{DispatchRequest, Dispatcher, IdempotentDispatch};
pub use error::QueueError;
pub use handler::{HandlerProvider, HandlerRegistry, JobHandler, ProgressReporter};
pub use job::{JobId, JobRecord, JobStatus, NewJob, DEFAULT_MAX_ATTEMPTS, DEFAULT_QUEUE};
pub use store::{JobFilter, StateStore};
