//! Worker crate for the conveyor job queue: the scheduling/coordination
//! loop, singleton enforcement, and worker-side metrics.

pub mod config;
pub mod lock;
pub mod metrics;
pub mod worker;

pub use config::WorkerConfig;
pub use lock::SingletonLock;
pub use worker::Worker;
