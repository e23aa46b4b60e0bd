//! # toil-core - Core types and engine for the toil job queue
//!
//! This crate provides the core abstractions of the toil job-processing
//! system:
//! - `Backend` trait: the five-operation storage contract every persistence
//!   technology implements (insert, reserve, complete, fail, status)
//! - `Engine`: submissions, the handler registry, and the
//!   poll -> reserve -> execute -> resolve loop
//! - `Plugin` hooks and typed lifecycle notifications around the loop
//! - `MemoryBackend`: the in-process reference backend
//! - `Worker`: a thin driver re-invoking the engine loop
//!
//! Jobs are delivered at-least-once: a reservation is a soft, time-bounded
//! lease, and handlers must be idempotent.

mod backend;
mod config;
mod engine;
mod error;
mod events;
mod handler;
mod job;
mod memory;
mod plugin;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use engine::{Engine, EngineBuilder};
pub use error::{Result, ToilError};
pub use events::EventHooks;
pub use handler::{Handlers, JobContext, JobError, JobResult};
pub use job::{
    unix_now, JobId, JobMeta, JobRecord, JobStatus, SubmitOptions, DEFAULT_TTR_SECS,
};
pub use memory::MemoryBackend;
pub use plugin::{DisposeFuture, Disposer, Plugin, PluginContext, PollDirective};
pub use worker::{Worker, WorkerHandle};
