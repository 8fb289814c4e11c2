//! Bookkeeping for one launched process

use super::launch::extension_of;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A process started by the runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub path: PathBuf,
    pub extension: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

impl ProcessRecord {
    /// Record a process that started just now
    pub fn new(pid: u32, path: PathBuf) -> Self {
        let extension = extension_of(&path);
        Self {
            pid,
            path,
            extension,
            started_at: Utc::now(),
            ended_at: None,
            exit_code: None,
        }
    }

    /// Stamp the exit. Only the first call has an effect.
    pub fn finish(&mut self, exit_code: Option<i32>) {
        if self.ended_at.is_some() {
            return;
        }
        self.ended_at = Some(Utc::now());
        self.exit_code = exit_code;
    }

    pub fn is_running(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Exited with code 0
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Wall time between start and exit, if it has exited
    pub fn duration(&self) -> Option<Duration> {
        self.ended_at.map(|end| end - self.started_at)
    }
}
