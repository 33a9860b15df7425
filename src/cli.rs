use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use crate::config_file::DEFAULT_CONFIG_FILE;

#[derive(Parser)]
#[command(name = "acfml")]
#[command(
    about = "Find and repair post meta corrupted by self-nesting (ACFML 1.6.0)",
    long_about = None
)]
#[command(version)]
pub(crate) struct Cli {
    /// SQLite database holding the WordPress tables
    #[arg(long, global = true)]
    pub(crate) db: Option<PathBuf>,
    /// Table prefix. Default: wp_
    #[arg(long, global = true)]
    pub(crate) prefix: Option<String>,
    /// Post ids per page. Default: 1000
    #[arg(long, global = true)]
    pub(crate) chunk_size: Option<u64>,
    /// JSON config file (missing file means defaults)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    pub(crate) config: PathBuf,
    /// Log more (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub(crate) verbose: u8,
    #[command(subcommand)]
    pub(crate) command: Command,
}

#[derive(Subcommand)]
pub(crate) enum Command {
    /// Repair every affected post meta record.
    Clear,

    /// Append affected post meta records to a report file; changes nothing.
    List {
        /// Report file. Default: affected.cvs
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run one incremental repair step (bounded work, resumes where the last left off).
    Step,

    /// Show incremental repair progress.
    Status {
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Check one post meta record by id.
    Inspect {
        meta_id: u64,
        /// Repair the record if it is affected
        #[arg(long)]
        fix: bool,
        /// Output JSON
        #[arg(long)]
        json: bool,
    },

    /// Release the step lock left behind by an interrupted run.
    Unlock,
}
