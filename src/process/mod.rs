// src/process/mod.rs

//! Uniform process abstraction.
//!
//! - [`handle`] defines [`ProcessHandle`], the lifecycle surface the
//!   controller works with, and the [`ProcessDriver`] trait each backend
//!   implements underneath it.
//! - [`io`] carries output lines (broadcast) and the single-fire exit signal
//!   from drivers to consumers.
//! - [`error`] holds the start/stop error types.

pub mod error;
pub mod handle;
pub mod io;

pub use error::{StartError, StopError};
pub use handle::{KILL_CONFIRM_TIMEOUT, ProcessDriver, ProcessHandle, deadline_after};
pub use io::{
    ExitCode, ExitSignal, FORCED_KILL_EXIT_CODE, LineStream, OutputChannel, ProcessIo,
    STDERR_TAIL_LINES, Transcript, spawn_line_pump,
};
