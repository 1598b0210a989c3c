//! Convoy CLI Library
//!
//! Command-line driver for the Convoy orchestrator: submit and validate job
//! files, look up job status, and run worker pools.

pub mod args;
pub mod cli;

pub use cli::run;
