//! Command line interface
//!
//! Argument parsing plus the runner that wires a filesystem-backed local
//! registry behind the pull-through cache and drives it.

pub mod args;
pub mod runner;

pub use args::{Args, Command};
pub use runner::Runner;
