//! Tracing subscriber setup for the daemon.
//!
//! The `[server]` section picks the output: production writes JSON to daily
//! files plus compact stdout for the journal, development prints pretty
//! stdout with span events. The filter comes from `RUST_LOG`, then
//! `HIKESENSE_LOG_LEVEL`, then `server.log_level`.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::Context;
use hikesense_core::config::ServerConfig;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Writer guards; dropping them loses buffered lines.
static GUARDS: OnceLock<[WorkerGuard; 2]> = OnceLock::new();

/// Overrides `server.log_level` when `RUST_LOG` is unset.
pub const LOG_LEVEL_ENV: &str = "HIKESENSE_LOG_LEVEL";

const LOG_FILE_PREFIX: &str = "hikesense.log";

/// Where the subscriber sends its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Pretty console output.
    Console,
    /// JSON files under the directory, plus compact stdout.
    Files(PathBuf),
}

impl LogTarget {
    /// Pick the target for `server`.
    #[must_use]
    pub fn for_server(server: &ServerConfig) -> Self {
        if !server.production {
            return Self::Console;
        }
        Self::Files(
            server
                .log_dir
                .clone()
                .unwrap_or_else(default_log_directory),
        )
    }
}

/// Install the global subscriber for `server` and return where logs go.
///
/// # Errors
///
/// Returns an error if the filter directive is invalid or the log directory
/// cannot be created.
pub fn init(server: &ServerConfig) -> anyhow::Result<LogTarget> {
    let env_filter = filter(
        std::env::var(LOG_LEVEL_ENV).ok().as_deref(),
        &server.log_level,
    )?;
    let target = LogTarget::for_server(server);

    match &target {
        LogTarget::Console => init_console(env_filter),
        LogTarget::Files(dir) => init_files(env_filter, dir)?,
    }
    Ok(target)
}

/// `RUST_LOG` wins, then `override_level`, then `configured`.
fn filter(override_level: Option<&str>, configured: &str) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    let directive = override_level
        .map(str::trim)
        .filter(|level| !level.is_empty())
        .unwrap_or(configured);
    EnvFilter::try_new(directive).with_context(|| format!("Invalid log filter '{directive}'"))
}

fn init_files(env_filter: EnvFilter, dir: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;

    let appender = RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE_PREFIX);
    let (file_writer, file_guard) = tracing_appender::non_blocking(appender);
    let (stdout_writer, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    let file_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(file_writer)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // journald stamps each line itself
    let stdout_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_writer(stdout_writer)
        .without_time()
        .with_target(true)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stdout_layer)
        .init();

    let _ = GUARDS.set([file_guard, stdout_guard]);
    Ok(())
}

fn init_console(env_filter: EnvFilter) {
    let layer = tracing_subscriber::fmt::layer()
        .pretty()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(layer)
        .init();
}

fn default_log_directory() -> PathBuf {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from("/var/log/hikesense")
    }
    #[cfg(not(target_os = "linux"))]
    {
        directories::ProjectDirs::from("dev", "hikesense", "hikesense")
            .map_or_else(|| PathBuf::from("./logs"), |dirs| dirs.data_dir().join("logs"))
    }
}
