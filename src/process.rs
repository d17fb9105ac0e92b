//! Subprocess pipeline
//!
//! One reader thread per invocation forwards stdout fragments over a channel
//! as soon as they are read, then reports the exit status. The owner polls
//! the channel from its own loop and never blocks on the child.

use crate::error::ViewError;
use crossbeam_channel::{unbounded, Receiver, Sender, TryRecvError};
use std::io::{ErrorKind, Read};
use std::path::PathBuf;
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use tempfile::TempPath;

const READ_CHUNK: usize = 8192;

static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

/// A fully resolved command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl std::fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// How the child ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Exit {
    pub code: Option<i32>,
    pub success: bool,
    pub stderr: String,
}

impl Exit {
    /// The reader went away without reporting (it panicked).
    fn lost() -> Self {
        Self {
            code: None,
            success: false,
            stderr: String::new(),
        }
    }
}

#[derive(Debug)]
pub enum PipelineEvent {
    Output(Vec<u8>),
    Exited(Exit),
}

/// A live subprocess and the channel its output arrives on
#[derive(Debug)]
pub struct RunningInvocation {
    id: u64,
    command: String,
    events: Receiver<PipelineEvent>,
}

impl RunningInvocation {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event without blocking. A vanished reader is reported as an exit.
    pub fn try_event(&self) -> Option<PipelineEvent> {
        match self.events.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(PipelineEvent::Exited(Exit::lost())),
        }
    }

    /// Next event, waiting for it.
    pub fn wait_event(&self) -> PipelineEvent {
        self.events
            .recv()
            .unwrap_or(PipelineEvent::Exited(Exit::lost()))
    }

    /// Stop listening. The child keeps running; its output is drained and dropped.
    pub fn detach(self) {
        tracing::debug!(target: "process", id = self.id, command = %self.command, "invocation_detached");
    }
}

/// Start `spec`. Temp files in `keep_alive` are removed once the child has exited.
pub fn spawn(spec: &CommandSpec, keep_alive: Vec<TempPath>) -> Result<RunningInvocation, ViewError> {
    let id = NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed);
    let command = spec.to_string();

    let mut child = spec.to_command().spawn().map_err(|source| ViewError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    tracing::info!(target: "process", id, %command, pid = child.id(), "spawned");

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let (tx, rx) = unbounded();

    thread::Builder::new()
        .name(format!("difftview-proc-{}", id))
        .spawn(move || pump(id, child, stdout, stderr, tx, keep_alive))
        .map_err(|source| ViewError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    Ok(RunningInvocation {
        id,
        command,
        events: rx,
    })
}

fn pump(
    id: u64,
    mut child: Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
    tx: Sender<PipelineEvent>,
    keep_alive: Vec<TempPath>,
) {
    let stderr_reader = stderr.map(|mut err| {
        thread::spawn(move || {
            let mut text = String::new();
            let _ = err.read_to_string(&mut text);
            text
        })
    });

    let mut bytes = 0usize;
    if let Some(mut out) = stdout {
        let mut listening = true;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match out.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    bytes += n;
                    if listening && tx.send(PipelineEvent::Output(buf[..n].to_vec())).is_err() {
                        listening = false;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::warn!(target: "process", id, error = %err, "stdout_read_failed");
                    break;
                }
            }
        }
        // Closing our end makes a still-writing child fail instead of block.
        drop(out);
    }

    let status = child.wait();
    let stderr = stderr_reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default();
    drop(keep_alive);

    let exit = match status {
        Ok(status) => Exit {
            code: status.code(),
            success: status.success(),
            stderr,
        },
        Err(err) => {
            tracing::warn!(target: "process", id, error = %err, "wait_failed");
            Exit {
                code: None,
                success: false,
                stderr,
            }
        }
    };

    if !exit.stderr.trim().is_empty() {
        tracing::warn!(target: "process", id, stderr = %exit.stderr.trim(), "stderr");
    }
    tracing::info!(target: "process", id, code = ?exit.code, bytes, "exited");
    let _ = tx.send(PipelineEvent::Exited(exit));
}

/// Run `spec` to completion on the calling thread, handing each fragment to
/// `on_fragment` in arrival order and the exit to `on_complete`.
pub fn run<F, G, T>(
    spec: &CommandSpec,
    keep_alive: Vec<TempPath>,
    mut on_fragment: F,
    on_complete: G,
) -> Result<T, ViewError>
where
    F: FnMut(&[u8]),
    G: FnOnce(Exit) -> T,
{
    let invocation = spawn(spec, keep_alive)?;
    loop {
        match invocation.wait_event() {
            PipelineEvent::Output(bytes) => on_fragment(&bytes),
            PipelineEvent::Exited(exit) => return Ok(on_complete(exit)),
        }
    }
}
