//! Convoy Queue Library
//!
//! The queue and worker tier of the Convoy orchestrator: the durable broker
//! contract, an in-memory reference broker (plus an optional Redis broker
//! behind the `redis-backend` feature), per-lane worker pools, and the
//! public [`TaskQueue`] façade that accepts jobs, answers status lookups
//! and drives lifecycle effects.

pub mod broker;
pub mod memory;
pub mod queue;
pub mod worker;

#[cfg(feature = "redis-backend")]
pub mod redis;

pub use broker::{Broker, BrokerJob, BrokerState, JobOptions, RetryDisposition, StateChange};
pub use memory::MemoryBroker;
pub use queue::{TaskQueue, LANES};

#[cfg(feature = "redis-backend")]
pub use redis::RedisBroker;
