// src/process/io.rs

//! Output and exit plumbing shared by every process driver.
//!
//! A driver reports into a [`ProcessIo`]; consumers read from it:
//!
//! - stdout / stderr lines go out on `broadcast` channels, so every
//!   [`LineStream`] subscriber receives its own copy,
//! - the exit code is a single-fire `watch` value ([`ExitSignal`]); the first
//!   reported code wins and later reports are ignored,
//! - a [`Transcript`] keeps the last stdout line and a bounded stderr tail for
//!   status reporting.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Exit code as reported by a backend. Negative values are synthetic
/// (`-signal` for signal termination).
pub type ExitCode = i32;

/// Exit code recorded when a forced kill could not be confirmed.
pub const FORCED_KILL_EXIT_CODE: ExitCode = -9;

/// Number of stderr lines kept for fault summaries.
pub const STDERR_TAIL_LINES: usize = 20;

const LINE_CHANNEL_CAPACITY: usize = 256;

/// Which output stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputChannel {
    Stdout,
    Stderr,
}

/// Summary of what a process printed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub last_stdout: Option<String>,
    pub stderr_tail: VecDeque<String>,
    pub stdout_lines: u64,
    pub stderr_lines: u64,
}

impl Transcript {
    fn record(&mut self, channel: OutputChannel, line: &str) {
        match channel {
            OutputChannel::Stdout => {
                self.stdout_lines += 1;
                if !line.trim().is_empty() {
                    self.last_stdout = Some(line.to_string());
                }
            }
            OutputChannel::Stderr => {
                self.stderr_lines += 1;
                if self.stderr_tail.len() == STDERR_TAIL_LINES {
                    self.stderr_tail.pop_front();
                }
                self.stderr_tail.push_back(line.to_string());
            }
        }
    }
}

#[derive(Debug)]
struct IoInner {
    stdout: broadcast::Sender<String>,
    stderr: broadcast::Sender<String>,
    exit: watch::Sender<Option<ExitCode>>,
    activity: watch::Sender<Instant>,
    transcript: Mutex<Transcript>,
}

/// Cloneable reporting/consuming endpoint for one process.
#[derive(Debug, Clone)]
pub struct ProcessIo {
    inner: Arc<IoInner>,
}

impl Default for ProcessIo {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessIo {
    pub fn new() -> Self {
        let (stdout, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let (stderr, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        let (exit, _) = watch::channel(None);
        let (activity, _) = watch::channel(Instant::now());
        Self {
            inner: Arc::new(IoInner {
                stdout,
                stderr,
                exit,
                activity,
                transcript: Mutex::new(Transcript::default()),
            }),
        }
    }

    /// Report one output line. Lines reported after exit are dropped.
    pub fn emit_line(&self, channel: OutputChannel, line: impl Into<String>) {
        if self.exit_code().is_some() {
            return;
        }
        let line = line.into();
        if let Ok(mut transcript) = self.inner.transcript.lock() {
            transcript.record(channel, &line);
        }
        self.inner.activity.send_replace(Instant::now());
        let sender = match channel {
            OutputChannel::Stdout => &self.inner.stdout,
            OutputChannel::Stderr => &self.inner.stderr,
        };
        // No subscribers is fine; the transcript still has the line.
        let _ = sender.send(line);
    }

    pub fn emit_stdout(&self, line: impl Into<String>) {
        self.emit_line(OutputChannel::Stdout, line);
    }

    pub fn emit_stderr(&self, line: impl Into<String>) {
        self.emit_line(OutputChannel::Stderr, line);
    }

    /// Report process exit. Returns `false` if an exit was already reported.
    pub fn emit_exit(&self, code: ExitCode) -> bool {
        self.inner.exit.send_if_modified(|current| {
            if current.is_some() {
                false
            } else {
                *current = Some(code);
                true
            }
        })
    }

    pub fn exit_code(&self) -> Option<ExitCode> {
        *self.inner.exit.borrow()
    }

    pub fn exit_signal(&self) -> ExitSignal {
        ExitSignal {
            rx: self.inner.exit.subscribe(),
        }
    }

    pub fn subscribe(&self, channel: OutputChannel) -> LineStream {
        let rx = match channel {
            OutputChannel::Stdout => self.inner.stdout.subscribe(),
            OutputChannel::Stderr => self.inner.stderr.subscribe(),
        };
        LineStream {
            rx,
            exit: self.inner.exit.subscribe(),
        }
    }

    /// Watch channel bumped on every output line.
    pub fn activity(&self) -> watch::Receiver<Instant> {
        self.inner.activity.subscribe()
    }

    pub fn transcript(&self) -> Transcript {
        self.inner
            .transcript
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default()
    }
}

/// Single-fire exit notification.
#[derive(Debug, Clone)]
pub struct ExitSignal {
    rx: watch::Receiver<Option<ExitCode>>,
}

impl ExitSignal {
    /// Wait for the exit code. Returns immediately if the process already
    /// exited; `None` only if the reporting side went away without exiting.
    pub async fn wait(&mut self) -> Option<ExitCode> {
        let code = match self.rx.wait_for(|code| code.is_some()).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        code.or_else(|| *self.rx.borrow())
    }

    pub fn code(&self) -> Option<ExitCode> {
        *self.rx.borrow()
    }
}

/// Per-subscriber line stream; ends once the process has exited and the
/// buffered lines are drained.
#[derive(Debug)]
pub struct LineStream {
    rx: broadcast::Receiver<String>,
    exit: watch::Receiver<Option<ExitCode>>,
}

impl LineStream {
    pub async fn next_line(&mut self) -> Option<String> {
        loop {
            if self.exit.borrow().is_some() {
                return self.drain_one();
            }
            let exit_closed = tokio::select! {
                biased;
                received = self.rx.recv() => match received {
                    Ok(line) => return Some(line),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "line stream subscriber lagged; lines dropped");
                        false
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
                changed = self.exit.changed() => changed.is_err(),
            };
            if exit_closed {
                return self.drain_one();
            }
        }
    }

    fn drain_one(&mut self) -> Option<String> {
        loop {
            match self.rx.try_recv() {
                Ok(line) => return Some(line),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Collect every remaining line until the stream completes.
    pub async fn collect(mut self) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = self.next_line().await {
            lines.push(line);
        }
        lines
    }
}

/// Spawn a task forwarding every line of `reader` into `io`.
///
/// Drivers await the returned handle before reporting exit so that no line
/// is lost after the exit signal fires.
pub fn spawn_line_pump<R>(
    reader: R,
    io: ProcessIo,
    channel: OutputChannel,
    label: String,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    debug!(process = %label, ?channel, "{}", line);
                    io.emit_line(channel, line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(process = %label, ?channel, error = %e, "output pipe read failed");
                    break;
                }
            }
        }
    })
}
