//! Runner configuration - interpreters and cancel behaviour
//!
//! Loaded from YAML. Lookup order for [`RunnerConfig::load`]:
//! 1. an explicit path (must exist)
//! 2. ~/.scriptdeck/config.yml
//! 3. built-in platform defaults

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// How to invoke the interpreter for one kind of script.
///
/// The script path is appended after `args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl InterpreterConfig {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Command shell used for `.bat` scripts
    pub fn default_shell() -> Self {
        if cfg!(windows) {
            Self::new("cmd.exe", &["/C"])
        } else {
            Self::new("sh", &[])
        }
    }

    /// Script host used for `.ps1` scripts
    pub fn default_powershell() -> Self {
        if cfg!(windows) {
            Self::new(
                "powershell.exe",
                &["-NoProfile", "-ExecutionPolicy", "Bypass", "-File"],
            )
        } else {
            Self::new("pwsh", &["-NoProfile", "-File"])
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub shell: InterpreterConfig,
    pub powershell: InterpreterConfig,
    /// Force-kill live scripts when a run is cancelled (Ctrl-C)
    pub kill_on_cancel: bool,
    /// env_logger filter used when RUST_LOG is not set
    pub log_filter: String,
    /// How long to keep draining output after a process has exited
    pub output_drain_grace_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: InterpreterConfig::default_shell(),
            powershell: InterpreterConfig::default_powershell(),
            kill_on_cancel: true,
            log_filter: "info".to_string(),
            output_drain_grace_ms: 2000,
        }
    }
}

impl RunnerConfig {
    /// Get the default config path
    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".scriptdeck")
            .join("config.yml")
    }

    /// Load config from YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_yaml(&content).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document is valid and means "all defaults".
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: RunnerConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Resolve the config for this run
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::from_file(path);
        }

        let default_path = Self::default_path();
        if default_path.exists() {
            log::debug!("Loading config from {}", default_path.display());
            return Self::from_file(&default_path);
        }

        Ok(Self::default())
    }

    pub fn output_drain_grace(&self) -> Duration {
        Duration::from_millis(self.output_drain_grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_empty_yaml_is_default() {
        let config = assert_ok!(RunnerConfig::from_yaml(""));
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let yaml = "kill_on_cancel: false\nshell:\n  program: bash\n  args: [\"-e\"]\n";
        let config = RunnerConfig::from_yaml(yaml).unwrap();

        assert!(!config.kill_on_cancel);
        assert_eq!(config.shell, InterpreterConfig::new("bash", &["-e"]));
        assert_eq!(config.powershell, InterpreterConfig::default_powershell());
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.output_drain_grace(), Duration::from_secs(2));
    }

    #[test]
    fn test_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.yml");
        std::fs::write(&path, "log_filter: debug\npowershell:\n  program: pwsh\n").unwrap();

        let config = RunnerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.log_filter, "debug");
        assert!(config.powershell.args.is_empty());
    }

    #[test]
    fn test_missing_explicit_file_fails() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("nope.yml");
        assert_err!(RunnerConfig::load(Some(&missing)));
    }

    #[test]
    fn test_invalid_yaml_fails() {
        assert_err!(RunnerConfig::from_yaml("shell: [1, 2"));
    }
}
