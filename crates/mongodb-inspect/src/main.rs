use std::path::PathBuf;

use clap::Parser;
use mongodb_operator::logging::{self, LogFormat};
use snafu::{ResultExt, Snafu};

mod inspect;

const APP_NAME: &str = "mongodb-inspect";

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("failed to initialize logging"))]
    Logging { source: logging::Error },

    #[snafu(display("failed to read {}", path.display()))]
    ReadDocument {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to inspect {}", path.display()))]
    Inspect {
        source: inspect::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to print the normalized document"))]
    Print { source: serde_json::Error },
}

/// Decodes a deployment document the way the operator reads it, reports what it contains and
/// prints it the way it would be written back.
#[derive(Debug, Parser)]
#[command(name = APP_NAME, version, about)]
struct Opts {
    /// The deployment document (the project's automation config), as JSON or YAML.
    document: PathBuf,

    #[arg(long, env, value_enum, default_value_t = LogFormat::default())]
    log_format: LogFormat,

    /// Only log the summary, don't print the normalized document.
    #[arg(long)]
    summary_only: bool,
}

#[snafu::report]
fn main() -> Result<(), Error> {
    let opts = Opts::parse();
    logging::initialize_logging("MONGODB_INSPECT_LOG", APP_NAME, opts.log_format)
        .context(LoggingSnafu)?;

    let path = &opts.document;
    let bytes = std::fs::read(path).context(ReadDocumentSnafu { path })?;
    let inspection = inspect::inspect(&bytes).context(InspectSnafu { path })?;
    inspection.summary.log();

    if !opts.summary_only {
        let document = serde_json::to_string_pretty(&inspection.document).context(PrintSnafu)?;
        println!("{document}");
    }
    Ok(())
}
