//! Launch specifications and the extension-based default resolver

use crate::config::{InterpreterConfig, RunnerConfig};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Resolves a script path to a launch specification; `None` means skip.
pub type Resolver = Arc<dyn Fn(&Path) -> Option<LaunchSpec> + Send + Sync>;

/// How to start one process. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    program: String,
    args: Vec<OsString>,
    working_dir: Option<PathBuf>,
    capture_output: bool,
    show_window: bool,
}

impl LaunchSpec {
    /// Spec for `program` with captured output and no window
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
            capture_output: true,
            show_window: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn capture_output(mut self, capture: bool) -> Self {
        self.capture_output = capture;
        self
    }

    pub fn show_window(mut self, show: bool) -> Self {
        self.show_window = show;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[OsString] {
        &self.args
    }

    pub fn dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    pub fn captures_output(&self) -> bool {
        self.capture_output
    }

    pub fn shows_window(&self) -> bool {
        self.show_window
    }
}

impl fmt::Display for LaunchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Script kinds the default resolver knows how to run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    /// `.bat`, run through the command shell
    Shell,
    /// `.ps1`, run through the PowerShell host
    PowerShell,
}

impl ScriptKind {
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension().and_then(OsStr::to_str)?;
        if ext.eq_ignore_ascii_case("bat") {
            Some(Self::Shell)
        } else if ext.eq_ignore_ascii_case("ps1") {
            Some(Self::PowerShell)
        } else {
            None
        }
    }
}

/// Lower-cased extension of `path`, empty when it has none
pub fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(OsStr::to_str)
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Maps `.bat` and `.ps1` to their interpreters; everything else is skipped.
#[derive(Debug, Clone)]
pub struct DefaultResolver {
    shell: InterpreterConfig,
    powershell: InterpreterConfig,
}

impl DefaultResolver {
    pub fn new(shell: InterpreterConfig, powershell: InterpreterConfig) -> Self {
        Self { shell, powershell }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.shell.clone(), config.powershell.clone())
    }

    pub fn resolve(&self, path: &Path) -> Option<LaunchSpec> {
        let interpreter = match ScriptKind::from_path(path)? {
            ScriptKind::Shell => &self.shell,
            ScriptKind::PowerShell => &self.powershell,
        };

        let mut spec = LaunchSpec::new(interpreter.program.clone())
            .args(interpreter.args.iter().cloned())
            .arg(path);

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            spec = spec.working_dir(parent);
        }

        Some(spec)
    }
}

impl Default for DefaultResolver {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> DefaultResolver {
        DefaultResolver::new(
            InterpreterConfig::new("cmd.exe", &["/C"]),
            InterpreterConfig::new("powershell.exe", &["-File"]),
        )
    }

    #[test]
    fn test_script_kind_from_extension() {
        assert_eq!(ScriptKind::from_path(Path::new("a.ps1")), Some(ScriptKind::PowerShell));
        assert_eq!(ScriptKind::from_path(Path::new("B.BAT")), Some(ScriptKind::Shell));
        assert_eq!(ScriptKind::from_path(Path::new("c.txt")), None);
        assert_eq!(ScriptKind::from_path(Path::new("Makefile")), None);
        // Compiled binaries are not recognised either.
        assert_eq!(ScriptKind::from_path(Path::new("tool.exe")), None);
    }

    #[test]
    fn test_resolve_bat() {
        let spec = resolver().resolve(Path::new("/scripts/build.bat")).unwrap();
        assert_eq!(spec.program(), "cmd.exe");
        assert_eq!(spec.arguments(), ["/C", "/scripts/build.bat"]);
        assert_eq!(spec.dir(), Some(Path::new("/scripts")));
        assert!(spec.captures_output());
        assert!(!spec.shows_window());
    }

    #[test]
    fn test_resolve_ps1() {
        let spec = resolver().resolve(Path::new("/scripts/deploy.ps1")).unwrap();
        assert_eq!(spec.program(), "powershell.exe");
        assert_eq!(spec.arguments(), ["-File", "/scripts/deploy.ps1"]);
    }

    #[test]
    fn test_resolve_unknown_is_none() {
        assert!(resolver().resolve(Path::new("/scripts/notes.txt")).is_none());
    }

    #[test]
    fn test_bare_file_name_has_no_working_dir() {
        let spec = resolver().resolve(Path::new("run.bat")).unwrap();
        assert_eq!(spec.dir(), None);
    }

    #[test]
    fn test_display() {
        let spec = LaunchSpec::new("sh").arg("-c").arg("true");
        assert_eq!(spec.to_string(), "sh -c true");
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_path_is_passed_unchanged() {
        use std::os::unix::ffi::OsStrExt;

        let path = Path::new(OsStr::from_bytes(b"/scripts/caf\xe9.bat"));
        let spec = resolver().resolve(path).unwrap();

        assert_eq!(spec.arguments()[1], path.as_os_str());
        assert_eq!(spec.arguments()[1].as_bytes(), b"/scripts/caf\xe9.bat");
        assert_eq!(spec.to_string(), "cmd.exe /C /scripts/caf\u{FFFD}.bat");
    }

    #[test]
    fn test_extension_of() {
        assert_eq!(extension_of(Path::new("x/Y.PS1")), "ps1");
        assert_eq!(extension_of(Path::new("noext")), "");
    }
}
