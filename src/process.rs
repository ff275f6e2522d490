//! External command execution.
//!
//! Every host tool (losetup, mount, sfdisk, ...) is invoked through [`Cmd`].
//! The actual spawning is delegated to a [`CommandRunner`] so the pipeline
//! can be driven against a fake host in tests.

use std::ffi::{OsStr, OsString};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use tracing::debug;

use crate::error::{ExitStatusDisplay, ToolError};

/// Something that can execute a [`Cmd`] and locate programs.
pub trait CommandRunner {
    /// Run the command to completion and capture its output.
    ///
    /// Exit status is *not* checked here; see [`Cmd::run`].
    fn execute(&self, cmd: &Cmd) -> io::Result<CmdResult>;

    /// Resolve a program name to a path, if it is installed.
    fn locate(&self, program: &str) -> Option<PathBuf>;
}

/// Runs commands on the real host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn execute(&self, cmd: &Cmd) -> io::Result<CmdResult> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command.stdin(if cmd.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn()?;
        if let Some(input) = &cmd.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input.as_bytes())?;
            }
        }

        let output = child.wait_with_output()?;
        Ok(CmdResult {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Exit code; `None` when terminated by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CmdResult {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }
}

/// Builder for a single external command invocation.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    stdin: Option<String>,
    error_msg: Option<String>,
    allow_fail: bool,
}

impl Cmd {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            stdin: None,
            error_msg: None,
            allow_fail: false,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.as_os_str())
    }

    /// Feed `input` to the command's stdin.
    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Message used as the head of the error when the command fails.
    pub fn error_msg(mut self, msg: &str) -> Self {
        self.error_msg = Some(msg.to_string());
        self
    }

    /// Return the result even when the exit status is non-zero.
    pub fn allow_fail(mut self) -> Self {
        self.allow_fail = true;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_list(&self) -> &[OsString] {
        &self.args
    }

    pub fn stdin_data(&self) -> Option<&str> {
        self.stdin.as_deref()
    }

    /// Command line rendered for logs and error messages.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    /// Execute through `runner`, failing on non-zero exit unless
    /// [`allow_fail`](Self::allow_fail) was set.
    pub fn run(&self, runner: &dyn CommandRunner) -> Result<CmdResult, ToolError> {
        debug!(command = %self.display(), "exec");
        let result = runner.execute(self).map_err(|source| ToolError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        if result.success() || self.allow_fail {
            return Ok(result);
        }

        Err(ToolError::Failed {
            message: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("{} failed", self.program)),
            command: self.display(),
            status: ExitStatusDisplay(result.status),
            stderr: result.stderr,
        })
    }
}
