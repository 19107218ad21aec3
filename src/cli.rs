// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for the `flowhost` daemon.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "flowhost",
    version,
    about = "Launch, supervise and reconcile workflow runner processes.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    #[arg(long, value_name = "PATH", default_value = "Flowhost.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `FLOWHOST_LOG` or `info` is used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Load and validate everything, print the resolved setup, run nothing.
    #[arg(long)]
    pub dry_run: bool,

    /// Exit once every instance is in a terminal state.
    #[arg(long)]
    pub once: bool,

    /// Create one manual instance of this definition (`id@version`) at
    /// startup.
    #[arg(long, value_name = "ID@VERSION")]
    pub start: Option<String>,

    /// JSON input for `--start`.
    #[arg(long, value_name = "JSON", default_value = "{}", requires = "start")]
    pub input: String,

    /// Instance id for `--start`; generated when omitted.
    #[arg(long, value_name = "ID", requires = "start")]
    pub instance_id: Option<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_flags_parse() {
        let args = CliArgs::try_parse_from([
            "flowhost",
            "--start",
            "echo@v1",
            "--input",
            "{\"x\":1}",
            "--once",
        ])
        .unwrap();
        assert_eq!(args.start.as_deref(), Some("echo@v1"));
        assert_eq!(args.input, "{\"x\":1}");
        assert!(args.once);
        assert_eq!(args.config, "Flowhost.toml");
    }

    #[test]
    fn instance_id_needs_start() {
        assert!(CliArgs::try_parse_from(["flowhost", "--instance-id", "wf-1"]).is_err());
    }
}
