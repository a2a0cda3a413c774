//! External command execution with a hard deadline

use crate::{Error, Result};
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::runtime::{Handle, Runtime};
use tokio::time::Instant;

/// Default deadline for management calls
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long output pipes may stay open once the child has been reaped
pub const PIPE_GRACE: Duration = Duration::from_millis(500);

/// One external command: program, argument vector and deadline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
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

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Value following `flag` in the argument vector
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            if arg.contains(' ') {
                write!(f, " '{}'", arg)?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

/// What a finished (or killed) command produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the process was ended by a signal
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl CommandOutput {
    /// A clean exit with the given stdout
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            exit_code: Some(0),
            ..Default::default()
        }
    }

    /// A non-zero exit with the given stderr
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stderr: stderr.into(),
            exit_code: Some(code),
            ..Default::default()
        }
    }

    pub fn is_success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }

    /// Turn a non-zero or timed out record into [`Error::CommandFailed`].
    pub fn check(self, invocation: &Invocation) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(Error::CommandFailed {
                command: invocation.to_string(),
                code: self.exit_code,
                timed_out: self.timed_out,
                stderr: self.stderr.trim().to_string(),
            })
        }
    }
}

/// Runs external commands
#[cfg_attr(test, mockall::automock)]
pub trait Executor: Send + Sync {
    /// Run to completion or deadline. A non-zero exit is not an error here.
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Executes real child processes on a private current-thread tokio runtime
///
/// `run` blocks the calling thread. Called from inside another tokio
/// runtime it drives its own runtime on a scoped helper thread, so it is
/// safe there but still occupies the calling worker until the command ends.
pub struct SystemExecutor {
    runtime: Runtime,
}

impl SystemExecutor {
    pub fn new() -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Self { runtime })
    }
}

impl fmt::Debug for SystemExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemExecutor").finish_non_exhaustive()
    }
}

impl Executor for SystemExecutor {
    fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        tracing::debug!(command = %invocation, timeout = ?invocation.timeout, "running");
        let output = if Handle::try_current().is_ok() {
            // block_on panics on a thread that is already driving a runtime
            std::thread::scope(|scope| {
                scope
                    .spawn(|| self.runtime.block_on(run_with_deadline(invocation)))
                    .join()
            })
            .unwrap_or_else(|panic| std::panic::resume_unwind(panic))?
        } else {
            self.runtime.block_on(run_with_deadline(invocation))?
        };
        if output.timed_out {
            tracing::warn!(command = %invocation, "command timed out and was killed");
        } else {
            tracing::debug!(command = %invocation, code = ?output.exit_code, "finished");
        }
        Ok(output)
    }
}

/// The deadline covers the child and its output pipes. After the child is
/// reaped, pipes still held open by a background grandchild get
/// [`PIPE_GRACE`] to drain before they are closed and the partial output
/// is returned.
async fn run_with_deadline(invocation: &Invocation) -> Result<CommandOutput> {
    let deadline = Instant::now() + invocation.timeout;
    let mut child = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();

    let (status, timed_out) = {
        let pipes = async {
            tokio::try_join!(
                drain(stdout_pipe, &mut stdout),
                drain(stderr_pipe, &mut stderr)
            )
        };
        tokio::pin!(pipes);

        let mut drained = false;
        let exited = loop {
            tokio::select! {
                status = child.wait() => break Some(status?),
                result = &mut pipes, if !drained => {
                    result?;
                    drained = true;
                }
                _ = tokio::time::sleep_until(deadline) => break None,
            }
        };

        let (status, timed_out) = match exited {
            Some(status) => (status, false),
            None => {
                // Already-exited children make this a no-op
                let _ = child.start_kill();
                (child.wait().await?, true)
            }
        };

        if !drained {
            match tokio::time::timeout(PIPE_GRACE, &mut pipes).await {
                Ok(result) => {
                    result?;
                }
                Err(_) => {
                    tracing::warn!(command = %invocation, "output pipes held open after exit, closing them");
                }
            }
        }
        (status, timed_out)
    };

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code: status.code(),
        timed_out,
    })
}

/// Append everything readable from `pipe` to `buf`; partial reads survive cancellation.
async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) -> std::io::Result<()> {
    let Some(mut pipe) = pipe else {
        return Ok(());
    };
    let mut chunk = [0u8; 4096];
    loop {
        let n = pipe.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
