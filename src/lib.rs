//! scriptdeck - launch a batch of scripts and supervise them
//!
//! The library receives already-discovered script paths, starts the ones it
//! knows how to run, streams their output line by line and keeps run
//! counters. Presentation is left to subscribers of [`RunnerEvent`] and
//! [`StatsSnapshot`].

pub mod config;
pub mod core;
pub mod error;

// Re-exports
pub use crate::config::{InterpreterConfig, RunnerConfig};
pub use crate::core::{
    BatchHandle, BatchReport, DefaultResolver, LaunchSpec, ProcessEvent, ProcessHandle,
    ProcessLauncher, ProcessRecord, Resolver, RunnerEvent, ScriptRunner, SnapshotContext,
    StatsAggregator, StatsSnapshot, SubscriptionId,
};
pub use crate::error::{LaunchError, RunnerError, TerminationError};

/// Result type alias
pub type Result<T> = anyhow::Result<T>;
