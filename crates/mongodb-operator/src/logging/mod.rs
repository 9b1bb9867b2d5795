//! Subscriber setup for binaries. Library code only emits events through `tracing`.

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use tracing_appender::rolling::{InitError, RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer as _, Registry,
    filter::ParseError,
    layer::SubscriberExt,
    util::{SubscriberInitExt, TryInitError},
};

/// Log files kept in the log directory, older ones are deleted on rotation.
pub const MAX_LOG_FILES: usize = 6;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse the default filter directive"))]
    DefaultFilter { source: ParseError },

    #[snafu(display("failed to create a log file appender in {}", directory.display()))]
    FileAppender {
        source: InitError,
        directory: PathBuf,
    },

    #[snafu(display("a global tracing subscriber is already installed"))]
    SetGlobalSubscriber { source: TryInitError },
}

/// How log lines are rendered on stdout.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum LogFormat {
    /// Human readable lines.
    #[default]
    Plain,

    /// One JSON object per line, for log shippers.
    Json,
}

/// Installs the global subscriber. Filter directives are read from the environment variable
/// `env`, e.g. `MONGODB_OPERATOR_LOG=mongodb_operator=debug`, falling back to INFO.
///
/// When `{env}_DIRECTORY` names a directory, events are also written there as JSON, into
/// hourly rotated files named after `app_name`.
pub fn initialize_logging(env: &str, app_name: &str, format: LogFormat) -> Result<(), Error> {
    let filter = match EnvFilter::try_from_env(env) {
        Ok(filter) => filter,
        Err(_) => {
            EnvFilter::try_new(tracing::Level::INFO.to_string()).context(DefaultFilterSnafu)?
        }
    };

    let log_directory = std::env::var_os(format!("{env}_DIRECTORY")).map(PathBuf::from);
    let file_layer = log_directory
        .as_deref()
        .map(|directory| file_appender(directory, app_name))
        .transpose()?
        .map(|appender| {
            tracing_subscriber::fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(appender)
        });

    let stdout_layer = match format {
        LogFormat::Plain => tracing_subscriber::fmt::layer().boxed(),
        LogFormat::Json => tracing_subscriber::fmt::layer().json().boxed(),
    };

    Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .context(SetGlobalSubscriberSnafu)?;

    match log_directory {
        Some(directory) => tracing::info!(directory = %directory.display(), "file logging enabled"),
        None => tracing::debug!("file logging disabled, no log directory set"),
    }
    Ok(())
}

fn file_appender(directory: &Path, app_name: &str) -> Result<RollingFileAppender, Error> {
    RollingFileAppender::builder()
        .rotation(Rotation::HOURLY)
        .filename_prefix(app_name)
        .filename_suffix("log")
        .max_log_files(MAX_LOG_FILES)
        .build(directory)
        .context(FileAppenderSnafu { directory })
}
