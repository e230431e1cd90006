//! Dispatch layer substrates for the conveyor job queue.
//!
//! - [`RedisDispatch`]: list-and-sorted-set substrate with blocking dequeue,
//!   delayed promotion, and stale-claim recovery
//! - [`PollingDispatch`]: polls the state store; the store's `available_at`
//!   and `status` stand in for delayed and in-flight structures
//! - [`MemoryDispatch`]: process-local substrate with the full
//!   ready/in-flight/delayed semantics, for tests and embedded use

pub mod memory;
pub mod polling;
pub mod redis;

pub use memory::MemoryDispatch;
pub use polling::PollingDispatch;
pub use redis::RedisDispatch;
