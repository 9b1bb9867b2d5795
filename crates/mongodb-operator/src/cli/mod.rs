//! Command line options shared by binaries that talk to Ops Manager.
//!
//! ```no_run
//! use clap::Parser;
//! use mongodb_operator::cli;
//!
//! #[derive(clap::Parser)]
//! #[command(name = "MongoDB Operator", version)]
//! struct Opts {
//!     #[clap(subcommand)]
//!     command: cli::Command,
//! }
//!
//! let opts = Opts::parse();
//! match opts.command {
//!     cli::Command::Run(cli::RunArguments { ops_manager, .. }) => {
//!         let (project, retry) = ops_manager.project();
//!         // Connect to the project
//!     }
//! }
//! ```

use std::time::Duration;

use clap::{Args, Parser};
use mongodb_shared::retry::RetrySettings;

use crate::{logging::LogFormat, om::lock::ProjectKey};

#[derive(Debug, PartialEq, Eq, Parser)]
pub enum Command<Run: Args = RunArguments> {
    Run(Run),
}

#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunArguments {
    #[arg(long, env, value_enum, default_value_t = LogFormat::default())]
    pub log_format: LogFormat,

    // IMPORTANT: All (flattened) sub structs should be placed at the end to ensure the help
    // headings are correct.
    #[command(flatten)]
    pub ops_manager: OpsManagerOptions,
}

#[derive(Clone, Debug, PartialEq, Eq, Args)]
#[command(next_help_heading = "Ops Manager Options")]
pub struct OpsManagerOptions {
    /// Base URL of the Ops Manager instance, e.g. `https://ops-manager.example.com:8443`.
    #[arg(long, env)]
    pub ops_manager_url: String,

    /// Name of the project the deployment lives in.
    #[arg(long, env)]
    pub project_name: String,

    /// Organization owning the project.
    #[arg(long, env)]
    pub org_id: String,

    /// Ops Manager's identifier of the project, used to build request paths.
    #[arg(long, env)]
    pub project_id: String,

    /// How often to check whether the agents reached goal state before giving up.
    #[arg(long, env, default_value_t = RetrySettings::default().attempts)]
    pub goal_state_retries: usize,

    /// Pause between two goal state checks.
    #[arg(long, env, default_value = "3s", value_parser = humantime::parse_duration)]
    pub goal_state_interval: Duration,
}

impl OpsManagerOptions {
    /// The lock key and the goal state retry settings of the configured project.
    pub fn project(&self) -> (ProjectKey, RetrySettings) {
        (
            ProjectKey::new(&self.project_name, &self.org_id),
            RetrySettings::new(self.goal_state_retries, self.goal_state_interval),
        )
    }
}
