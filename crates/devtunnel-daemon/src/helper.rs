//! Location of the external helper tool that lists devices and runs tunnels.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{info, warn};

/// Executable name searched on `PATH`.
pub const HELPER_NAME: &str = "pymobiledevice3";

/// Interpreter used to run the helper as a module when no executable exists.
const PYTHON_NAME: &str = "python3";

/// Resolved helper invocation: a program plus leading arguments that come
/// before every sub-command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelperCommand {
    program: PathBuf,
    prefix: Vec<OsString>,
}

impl HelperCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix: Vec::new(),
        }
    }

    /// Add arguments placed before the sub-command on every invocation.
    #[must_use]
    pub fn with_prefix<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix.extend(args.into_iter().map(Into::into));
        self
    }

    /// Resolve the helper once at startup.
    ///
    /// An explicit path wins. Otherwise the helper executable is looked up on
    /// `PATH`, falling back to running it as a Python module.
    pub fn resolve(explicit: Option<&Path>) -> Self {
        if let Some(path) = explicit {
            info!(helper = %path.display(), "Using configured tunnel helper");
            return Self::new(path);
        }

        if let Ok(path) = which::which(HELPER_NAME) {
            info!(helper = %path.display(), "Found tunnel helper on PATH");
            return Self::new(path);
        }

        let python = which::which(PYTHON_NAME).unwrap_or_else(|_| PathBuf::from(PYTHON_NAME));
        warn!(
            python = %python.display(),
            "{HELPER_NAME} not found on PATH, running it as a module"
        );
        Self::new(python).with_prefix(["-m", HELPER_NAME])
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Full argument list for a sub-command invocation.
    pub fn args_for<I, S>(&self, args: I) -> Vec<OsString>
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.prefix
            .iter()
            .cloned()
            .chain(args.into_iter().map(Into::into))
            .collect()
    }

    /// Build a command with stdin detached and the given trailing arguments.
    pub fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(args)).stdin(Stdio::null());
        cmd
    }

    /// Human-readable command line, for logs.
    pub fn display_args<I, S>(&self, args: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        std::iter::once(self.program.as_os_str().to_string_lossy().into_owned())
            .chain(
                self.args_for(args)
                    .iter()
                    .map(|a| a.to_string_lossy().into_owned()),
            )
            .collect::<Vec<_>>()
            .join(" ")
    }
}
