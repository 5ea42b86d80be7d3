//! Subprocess layer for driving the `git` command-line tool.

use std::{
    io,
    path::{Path, PathBuf},
    process::{Child, Command, Stdio},
};

use thiserror::Error;

/// How a subprocess finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    Exited(i32),
    Signaled(i32),
}

impl ExitKind {
    fn from_status(status: std::process::ExitStatus) -> ExitKind {
        match status.code() {
            Some(code) => ExitKind::Exited(code),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    ExitKind::Signaled(status.signal().unwrap_or(-1))
                }
                #[cfg(not(unix))]
                ExitKind::Signaled(-1)
            }
        }
    }
}

impl std::fmt::Display for ExitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitKind::Exited(code) => write!(f, "exit code {code}"),
            ExitKind::Signaled(sig) => write!(f, "signal {sig}"),
        }
    }
}

/// Captured outcome of a finished subprocess.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit: ExitKind,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit == ExitKind::Exited(0)
    }

    /// Stdout with trailing whitespace removed.
    pub fn trimmed(&self) -> &str {
        self.stdout.trim_end()
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program} {args}' failed with {exit}: {detail}")]
    Failed {
        program: String,
        args: String,
        exit: ExitKind,
        detail: String,
    },
    #[error("I/O error while running '{program}': {source}")]
    Io {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Per-invocation options.
#[derive(Default)]
pub struct RunOptions {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    /// Fold stderr into [`ProcessOutput::stdout`] for callers that classify
    /// git by its error text.
    pub merge_stderr: bool,
}

impl RunOptions {
    pub fn in_dir(dir: &Path) -> RunOptions {
        RunOptions {
            cwd: Some(dir.to_path_buf()),
            ..RunOptions::default()
        }
    }
}

/// Runs `git` subprocesses with interactive prompting disabled.
#[derive(Debug, Clone)]
pub struct GitRunner {
    program: String,
}

impl Default for GitRunner {
    fn default() -> Self {
        GitRunner::new()
    }
}

impl GitRunner {
    pub fn new() -> GitRunner {
        GitRunner {
            program: "git".to_string(),
        }
    }

    fn command(&self, opts: &RunOptions) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.stdin(Stdio::null());
        if let Some(cwd) = &opts.cwd {
            cmd.current_dir(cwd);
        }
        for (key, value) in &opts.env {
            cmd.env(key, value);
        }
        cmd
    }

    /// Run to completion, capturing output. Non-zero exits are *not* errors
    /// here; callers inspect [`ProcessOutput::exit`].
    pub fn run(&self, args: &[&str], opts: RunOptions) -> Result<ProcessOutput, ExecError> {
        trace!("running {} {}", self.program, args.join(" "));
        let output = self
            .command(&opts)
            .args(args)
            .output()
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        let mut stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if opts.merge_stderr {
            stdout.push_str(&stderr);
        }

        Ok(ProcessOutput {
            exit: ExitKind::from_status(output.status),
            stdout,
            stderr,
        })
    }

    /// Run and require a clean exit, returning trimmed stdout.
    pub fn run_ok(&self, args: &[&str], opts: RunOptions) -> Result<String, ExecError> {
        let output = self.run(args, opts)?;
        if output.success() {
            Ok(output.trimmed().to_string())
        } else {
            Err(self.failure(args, &output))
        }
    }

    /// Spawn with stdout piped, for callers that stream the output (e.g.
    /// `git archive`).
    pub fn spawn_piped(&self, args: &[&str], opts: RunOptions) -> Result<Child, ExecError> {
        trace!("spawning {} {}", self.program, args.join(" "));
        self.command(&opts)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| ExecError::Spawn {
                program: self.program.clone(),
                source,
            })
    }

    pub fn failure(&self, args: &[&str], output: &ProcessOutput) -> ExecError {
        let detail = if output.stderr.trim().is_empty() {
            output.trimmed().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        ExecError::Failed {
            program: self.program.clone(),
            args: args.join(" "),
            exit: output.exit,
            detail,
        }
    }
}
