//! CLI command definitions.

use crate::config::OutputFormat;
use clap::{Args, Subcommand, ValueEnum};

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline declaration
    Validate {
        /// Path to pipeline file
        #[arg(default_value = "trunkline.yaml")]
        path: String,
    },

    /// Show what a run would do for a trigger, without running anything
    Plan {
        /// Path to pipeline file
        #[arg(default_value = "trunkline.yaml")]
        path: String,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Output format (overrides config)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,
    },

    /// Run a pipeline on this host
    Run {
        /// Path to pipeline file
        #[arg(default_value = "trunkline.yaml")]
        path: String,

        #[command(flatten)]
        trigger: TriggerArgs,

        /// Output format (overrides config)
        #[arg(short, long, value_enum)]
        format: Option<OutputFormat>,

        /// Maximum concurrent jobs per matrix stage
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Run compiling steps without the cache accelerator
        #[arg(long)]
        no_cache: bool,
    },

    /// Print a JSON schema
    Schema {
        #[arg(value_enum, default_value_t = SchemaTarget::Outcome)]
        target: SchemaTarget,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

/// The event a run reacts to.
#[derive(Args, Debug, Clone)]
pub struct TriggerArgs {
    /// Trigger kind: push, pull_request, or anything else
    #[arg(short, long, default_value = "push")]
    pub event: String,

    /// Git ref, e.g. refs/heads/main or refs/tags/v1.0.0
    #[arg(short = 'r', long = "ref", default_value = "refs/heads/main")]
    pub git_ref: String,

    /// Treat the ref as a tag
    #[arg(long)]
    pub tag: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy)]
pub enum SchemaTarget {
    /// Pipeline declaration
    Pipeline,
    /// Run outcome report
    Outcome,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value (`none` clears optional keys)
        value: String,
    },
}
