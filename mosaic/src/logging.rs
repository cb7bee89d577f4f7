//! Tracing setup.
//!
//! Mosaic logs through `tracing`. Embedders that already install a
//! subscriber need nothing from here; others can call [`init`] once.

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Log verbosity, mirroring the classic err/wrn/inf/dbg levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[serde(alias = "err")]
    Error,
    #[serde(alias = "wrn")]
    Warn,
    #[default]
    #[serde(alias = "inf")]
    Info,
    #[serde(alias = "dbg")]
    Debug,
}

impl LogLevel {
    /// Filter directive understood by `EnvFilter`.
    pub fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
        }
    }

    /// Parse the short or long spelling (`wrn`, `warn`, ...).
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "err" | "error" => Some(LogLevel::Error),
            "wrn" | "warn" => Some(LogLevel::Warn),
            "inf" | "info" => Some(LogLevel::Info),
            "dbg" | "debug" => Some(LogLevel::Debug),
            _ => None,
        }
    }
}

/// Install a global subscriber writing to stderr.
///
/// `RUST_LOG` wins over `level` when set. Returns the appender guard, which
/// must be kept alive for buffered lines to be flushed. Installing twice is
/// harmless: the second attempt is ignored.
pub fn init(level: LogLevel) -> WorkerGuard {
    let (non_blocking, guard) = tracing_appender::non_blocking(std::io::stderr());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    register_to_tracing(non_blocking, env_filter);
    guard
}

fn register_to_tracing(non_blocking: NonBlocking, env_filter: EnvFilter) {
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(non_blocking)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .with_ansi(false),
        )
        .try_init();
}
