// External process port: every kernel interaction goes through a CommandRunner
use crate::error::{Error, Result};
use std::fmt;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tracing::debug;

/// One fully-built tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub stdin: Option<Vec<u8>>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn push(&mut self, arg: impl Into<String>) {
        self.args.push(arg.into());
    }

    /// Push `flag value`, skipping the pair entirely when `value` is `None`.
    pub fn push_opt(&mut self, flag: &str, value: Option<&str>) {
        if let Some(value) = value {
            self.args.push(flag.to_string());
            self.args.push(value.to_string());
        }
    }

    pub fn with_stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " \"{}\"", arg.replace('"', "\\\""))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            status: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout followed by stderr, the way a terminal would have shown them
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs external tools. Implementations must not retry or reinterpret failures.
pub trait CommandRunner: Send + Sync {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send;
}

impl<R: CommandRunner> CommandRunner for Arc<R> {
    fn run(&self, invocation: &Invocation) -> impl Future<Output = Result<CommandOutput>> + Send {
        (**self).run(invocation)
    }
}

/// Run and turn a non-zero exit into [`Error::Execution`] carrying the combined output.
pub async fn checked<R>(runner: &R, invocation: &Invocation) -> Result<CommandOutput>
where
    R: CommandRunner + ?Sized,
{
    let output = runner.run(invocation).await?;
    if output.success() {
        return Ok(output);
    }

    debug!(command = %invocation, status = ?output.status, "command failed");
    Err(Error::Execution {
        program: invocation.program.clone(),
        status: output.status,
        output: output.combined(),
    })
}

/// [`CommandRunner`] backed by real processes.
///
/// Dropping the returned future kills the child, which is how callers bound
/// execution time; the resulting kernel state must then be re-listed.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        debug!(command = %invocation, "exec");

        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if invocation.stdin.is_some() {
            command.stdin(Stdio::piped());
        } else {
            command.stdin(Stdio::null());
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::io(format!("failed to spawn {}", invocation.program), e))?;

        // Output is drained while stdin is still being written, so a tool that
        // echoes a large dump back cannot stall on a full pipe.
        let stdin = child.stdin.take();
        let payload = invocation.stdin.as_deref();
        let feed = async move {
            let (Some(mut stdin), Some(payload)) = (stdin, payload) else {
                return Ok(());
            };
            match stdin.write_all(payload).await {
                Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => Err(e),
                // The child stopped reading early; its exit status tells the rest.
                _ => Ok(()),
            }
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output =
            output.map_err(|e| Error::io(format!("failed to wait for {}", invocation.program), e))?;
        fed.map_err(|e| Error::io(format!("failed to feed {}", invocation.program), e))?;

        Ok(CommandOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}
