// crates/convoy-cli/src/args.rs

//! Command-line interface definition

use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "convoy",
    about = "Declarative job orchestrator for remote compute backends",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Execute a job file in-process and print its result
    Run {
        /// Path to a JSON or YAML job file ("-" reads stdin)
        file: String,
        /// Pretty-print the result
        #[arg(long)]
        pretty: bool,
    },
    /// Submit a job file to the configured broker and print its id
    Submit {
        /// Path to a JSON or YAML job file ("-" reads stdin)
        file: String,
    },
    /// Look up the status of a submitted job
    Status {
        /// Job id returned at submission
        id: String,
        /// Restrict the lookup to one lane
        #[arg(long)]
        queue: Option<String>,
    },
    /// Request cancellation of a job
    Cancel {
        /// Job id returned at submission
        id: String,
        /// Restrict the lookup to one lane
        #[arg(long)]
        queue: Option<String>,
    },
    /// Run worker pools for all lanes until interrupted
    Worker,
    /// Validate a job file without submitting it
    Validate {
        /// Path to a JSON or YAML job file ("-" reads stdin)
        file: String,
    },
}
