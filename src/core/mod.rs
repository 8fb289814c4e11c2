//! Core engine - process launch, script runner, run statistics

mod events;
mod launch;
mod process;
mod record;
mod runner;
mod stats;

pub use events::{Observers, RunnerEvent, SubscriptionId};
pub use launch::{extension_of, DefaultResolver, LaunchSpec, Resolver, ScriptKind};
pub use process::{
    ProcessEvent, ProcessHandle, ProcessLauncher, SpawnedProcess, DEFAULT_DRAIN_GRACE,
    UNTRACKED_PID,
};
pub use record::ProcessRecord;
pub use runner::{BatchHandle, BatchReport, ScriptRunner};
pub use stats::{SnapshotContext, StatsAggregator, StatsSnapshot};
