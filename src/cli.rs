//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the taskmill engine.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// taskmill - Remote task execution and status tracking
///
/// Stages task files onto configured execution hosts (local shell,
/// containers, batch schedulers), submits the tasks, polls them to a
/// terminal state and retrieves their outputs. Previously completed
/// tasks are skipped when their recorded signature still matches.
#[derive(Parser, Debug)]
#[command(name = "taskmill")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to configuration file
    #[arg(short, long, global = true, env = "TASKMILL_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit tasks and wait for them to finish
    Run {
        /// Task descriptor files (TOML)
        #[arg(required_unless_present = "command")]
        tasks: Vec<PathBuf>,

        /// Run a bare shell command instead of task files
        #[arg(short = 'e', long)]
        command: Option<String>,

        /// Target queue (host) overriding the task descriptors
        #[arg(long)]
        queue: Option<String>,

        /// Signature mode: default, force, ignore, build
        #[arg(long)]
        sig_mode: Option<String>,

        /// Wait on tasks that are already running from another session
        #[arg(long)]
        resume: bool,

        /// Cap on concurrently submitted jobs per host
        #[arg(long, value_name = "N")]
        max_running: Option<usize>,

        /// Submit without waiting for completion
        #[arg(long)]
        no_wait: bool,
    },

    /// Submit tasks without waiting (alias for run --no-wait)
    Submit {
        /// Task descriptor files (TOML)
        #[arg(required_unless_present = "command")]
        tasks: Vec<PathBuf>,

        /// Run a bare shell command instead of task files
        #[arg(short = 'e', long)]
        command: Option<String>,

        /// Target queue (host) overriding the task descriptors
        #[arg(long)]
        queue: Option<String>,

        /// Signature mode: default, force, ignore, build
        #[arg(long)]
        sig_mode: Option<String>,

        /// Cap on concurrently submitted jobs per host
        #[arg(long, value_name = "N")]
        max_running: Option<usize>,
    },

    /// Report task status
    Status {
        /// Only these fingerprints (default: every record)
        fingerprints: Vec<String>,

        /// Only this host
        #[arg(long)]
        host: Option<String>,

        /// Report detail level (0-4)
        #[arg(short = 'd', long, default_value = "1")]
        verbosity: u8,

        /// Render the report as HTML
        #[arg(long)]
        html: bool,

        /// Include terminal tasks (default shows live and recent only)
        #[arg(long)]
        all: bool,
    },

    /// Remove finished task records, signatures and staged files
    Purge {
        /// Fingerprints to purge (default: every terminal record)
        fingerprints: Vec<String>,

        /// Only this host
        #[arg(long)]
        host: Option<String>,

        /// Kill and purge live tasks too
        #[arg(long)]
        force: bool,
    },

    /// Cancel live tasks
    Kill {
        /// Fingerprints to kill (default: every live task)
        fingerprints: Vec<String>,

        /// Only this host
        #[arg(long)]
        host: Option<String>,
    },

    /// Re-run a previously seen task, ignoring its signature
    Execute {
        /// Fingerprint of the task to re-run
        fingerprint: String,

        /// Only this host
        #[arg(long)]
        host: Option<String>,
    },

    /// List configured execution hosts
    Hosts,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Display version and build information
    Version,
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show,

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        // Verifies that the CLI definition is valid
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_with_command() {
        let cli = Cli::parse_from(["taskmill", "run", "-e", "echo hi", "--queue", "pbs"]);
        match cli.command {
            Commands::Run { command, queue, tasks, .. } => {
                assert_eq!(command.as_deref(), Some("echo hi"));
                assert_eq!(queue.as_deref(), Some("pbs"));
                assert!(tasks.is_empty());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_status_verbosity_flag() {
        let cli = Cli::parse_from(["taskmill", "status", "-d", "3", "--html"]);
        match cli.command {
            Commands::Status { verbosity, html, .. } => {
                assert_eq!(verbosity, 3);
                assert!(html);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags() {
        let cli = Cli::parse_from(["taskmill", "-vv", "status"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }
}
