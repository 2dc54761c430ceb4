//! Workflow engine core: definitions, step executors, and durable execution.
//!
//! - `definition` -- JSON/YAML parsing, validation, plan resolution
//! - `steps` -- the eight step executors and their registry
//! - `retry` -- per-call timeout and exponential backoff
//! - `pool` -- bounded worker pool for per-item fan-out
//! - `state` -- in-memory state of a run being driven
//! - `checkpoint` -- durable run progress, step outputs, and leases
//! - `engine` -- sequential executor with pause/cancel, resume, and watchdog

pub mod checkpoint;
pub mod definition;
pub mod engine;
pub mod pool;
pub mod retry;
pub mod state;
pub mod steps;
