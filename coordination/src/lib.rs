//! Colloquy coordination library
//!
//! This library provides:
//! - A durable job queue with lease-based claiming, idempotent enqueue and
//!   exponential-backoff retry
//! - A worker loop that runs job handlers and records every outcome
//! - A run ledger: append-only events, run snapshots, token and cost totals
//! - A multi-persona debate orchestrator, run as the `RUN_DEBATE` job
//!
//! # Modules
//!
//! - [`queue`]: `JobQueue` trait, file-backed and in-memory stores
//! - [`worker`]: `Worker`, `JobHandler`, `HandlerRegistry`
//! - [`ledger`]: `EventLog`, `RunRepository`, run summaries
//! - [`debate`]: session state, prompts, providers, orchestrator
//! - [`events`]: run completed/failed broadcast for downstream subscribers
//! - [`scheduler`]: interval triggers that enqueue through the queue
//! - [`context`]: ambient request/run identity for the job being executed
//!
//! # Data directory
//!
//! ```text
//! <data>/
//!   jobs/<id>.json          queue records
//!   locks/<id>.lock         claim locks
//!   runs/<id>.json          run snapshots
//!   events/YYYY-MM-DD.jsonl ledger events
//!   sessions/<id>.json      debate sessions
//!   transcripts/<id>.md     debate transcripts
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod context;
pub mod debate;
pub mod events;
mod fs_store;
pub mod ledger;
pub mod queue;
pub mod scheduler;
pub mod worker;

pub use context::RunContext;
pub use queue::{JobQueue, QueueError, SharedJobQueue};
pub use worker::{Worker, WorkerError, WorkerOptions};
