//! Command-line interface for svcinit.
use clap::{Parser, Subcommand};
use std::str::FromStr;
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for svcinit.
#[derive(Parser)]
#[command(name = "svcinit", version, author)]
#[command(about = "An init-style service supervisor and property service", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// Opt into privileged system mode. Requires running as root.
    #[arg(long = "sys", global = true)]
    pub sys: bool,

    /// Drop privileges after performing privileged setup.
    #[arg(long = "drop-privileges", global = true)]
    pub drop_privileges: bool,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for svcinit.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor and property service in the foreground. This is
    /// the PID-1-shaped entry point; it does not return until a termination
    /// signal arrives.
    Run {
        /// Path to the service configuration file.
        #[arg(short, long, default_value = "svcinit.yaml")]
        config: String,
    },

    /// Start a named service via a `ctl.start` control request.
    Start {
        /// Name of the service to start.
        service: String,
    },

    /// Stop a named service via a `ctl.stop` control request.
    Stop {
        /// Name of the service to stop.
        service: String,
    },

    /// Restart a named service via a `ctl.restart` control request.
    Restart {
        /// Name of the service to restart.
        service: String,
    },

    /// Show the `init.svc.<name>` state of a named service.
    Status {
        /// Name of the service to query.
        service: String,
    },

    /// Set a property to a given value.
    Setprop {
        /// Property name.
        name: String,

        /// Property value.
        value: String,
    },

    /// Read the current value of a property, if set.
    Getprop {
        /// Property name.
        name: String,
    },

    /// Launch an anonymous one-shot service via `MakeTemporaryOneshotService`.
    /// Takes the same argv grammar the control request does:
    /// `[seclabel [uid [gid supp_gid*]] -- cmd args...]`.
    Exec {
        /// `[seclabel [uid [gid supp_gid*]] --] cmd args...`
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
