//! Typed errors for the process layer
//!
//! Configuration loading and the binary use `anyhow`; these are the
//! failures callers are expected to match on.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The OS could not create a process for a launch specification
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("program not found: {program}")]
    NotFound { program: String },

    #[error("working directory is not a directory: {}", dir.display())]
    InvalidWorkingDir { dir: PathBuf },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// A forced-kill request could not be delivered
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TerminationError {
    #[error("process {pid} has already exited")]
    AlreadyExited { pid: u32 },

    #[error("termination of process {pid} was already requested")]
    AlreadyRequested { pid: u32 },
}

/// Misuse of the script runner itself
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RunnerError {
    #[error("script runner has been disposed")]
    Disposed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_messages() {
        let err = LaunchError::NotFound {
            program: "pwsh".to_string(),
        };
        assert_eq!(err.to_string(), "program not found: pwsh");

        let err = LaunchError::InvalidWorkingDir {
            dir: PathBuf::from("/nope"),
        };
        assert!(err.to_string().contains("/nope"));
    }

    #[test]
    fn test_termination_error_messages() {
        let err = TerminationError::AlreadyExited { pid: 42 };
        assert_eq!(err.to_string(), "process 42 has already exited");
    }
}
