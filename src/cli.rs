//! CLI argument parsing for validation runs.
//!
//! Every `run` flag mirrors a configuration-file key; values given here win
//! over the config file, which in turn wins over the metadata JSON.
use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Root CLI entrypoint.
#[derive(Parser, Debug)]
#[command(
    name = "valkyrie",
    version,
    about = "Validate and rank candidate patches for automated program repair",
    after_help = "Examples:\n  valkyrie run --conf repair.conf\n  valkyrie run --meta meta.json --patch-mode compile --exec-mode parallel\n  valkyrie script --conf repair.conf --patch-file patches/llm/0001.patch",
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct RootArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    Run(RunArgs),
    Script(ScriptArgs),
}

/// Configuration sources and overrides shared by every command.
#[derive(Parser, Debug, Default, Clone)]
pub struct ConfigArgs {
    /// Line-oriented `key:value` configuration file
    #[arg(long, value_name = "PATH")]
    pub conf: Option<PathBuf>,

    /// Metadata JSON describing the repair task
    #[arg(long, value_name = "PATH")]
    pub meta: Option<PathBuf>,

    /// Program binary to validate against
    #[arg(long, value_name = "PATH")]
    pub binary: Option<PathBuf>,

    /// Source file the patches apply to (overrides diff headers)
    #[arg(long)]
    pub source_file: Option<String>,

    /// Source tree root for recompilation
    #[arg(long, value_name = "DIR")]
    pub source_dir: Option<PathBuf>,

    /// Directory for results, snapshots, partitions, and scripts
    #[arg(long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory of candidate patches (sub-directories name generator tools)
    #[arg(long, value_name = "DIR", conflicts_with = "patch_file")]
    pub patch_dir: Option<PathBuf>,

    /// Single candidate patch
    #[arg(long, value_name = "PATH")]
    pub patch_file: Option<PathBuf>,

    /// Originally failing test ids as a JSON array
    #[arg(long, value_name = "JSON")]
    pub test_id_list: Option<String>,

    /// Oracle script invoked as `<oracle> <test-id> <program>`
    #[arg(long, value_name = "PATH")]
    pub test_oracle: Option<PathBuf>,

    /// Test suite invoked as `<suite> <test-id>` when no binary is given
    #[arg(long, value_name = "PATH")]
    pub test_suite: Option<PathBuf>,

    /// Backend: rewrite, compile, or gdb
    #[arg(long, value_name = "MODE")]
    pub patch_mode: Option<String>,

    /// Worker pool: sequential, semi-parallel, parallel (or 0, 1, 2)
    #[arg(long, value_name = "MODE")]
    pub exec_mode: Option<String>,

    /// Namespace for generated scripts when runs share an output directory
    #[arg(long)]
    pub tag: Option<String>,

    /// Emit debug logging
    #[arg(long)]
    pub debug: bool,
}

/// Full validation and ranking run.
#[derive(Parser, Debug, Default, Clone)]
#[command(about = "Validate, classify, and rank a patch population")]
pub struct RunArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Global budget in minutes; no new patches start after it expires
    #[arg(long, value_name = "MINUTES")]
    pub timeout: Option<u64>,

    /// Per-test timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub test_timeout: Option<u64>,

    /// Per-patch timeout in seconds
    #[arg(long, value_name = "SECONDS")]
    pub task_timeout: Option<u64>,

    /// Maximum number of patch files considered
    #[arg(long)]
    pub limit: Option<usize>,

    /// Maximum number of patch files considered per generator directory
    #[arg(long)]
    pub patch_per_dir_limit: Option<usize>,

    /// Enable the snapshot signature cache
    #[arg(long)]
    pub partition: bool,

    /// Stop after classification (no ranking)
    #[arg(long)]
    pub only_validate: bool,

    /// Collect instruction traces for the trace-distance metric
    #[arg(long)]
    pub trace_distance: bool,
}

/// Print the compiled debugger script for one patch.
#[derive(Parser, Debug, Clone)]
#[command(about = "Print the debugger script compiled from a patch")]
pub struct ScriptArgs {
    #[command(flatten)]
    pub config: ConfigArgs,

    /// Include snapshot hooks for the signature run
    #[arg(long)]
    pub snapshot: bool,
}
