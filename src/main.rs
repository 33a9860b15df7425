// Module declarations
mod cli;
mod commands;
mod config_file;
mod detect;
mod error;
mod gate;
mod meta_db;
mod pages;
mod progress_bar;
mod repair;
mod report;
mod serialized;
mod store;

use std::io;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Command};
use crate::commands::{inspect, run_clear, run_list, status, to_json};
use crate::config_file::{Overrides, Settings, load_file_config};
use crate::gate::{ProgressGate, StepOutcome, trigger_step};
use crate::meta_db::MetaDb;
use crate::report::Reporter;

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let report_override = match &cli.command {
        Command::List { output } => output.clone(),
        _ => None,
    };
    let overrides = Overrides {
        database: cli.db.clone(),
        table_prefix: cli.prefix.clone(),
        chunk_size: cli.chunk_size,
        report_path: report_override,
    };
    let settings = Settings::resolve(overrides, load_file_config(&cli.config))?;
    let db = MetaDb::open(&settings.database, &settings.table_prefix)?;

    match cli.command {
        Command::Clear => {
            let summary = run_clear(&db, settings.chunk_size, io::stderr())?;
            println!(
                "Scanned {} records in {} pages; repaired {}",
                summary.records, summary.pages, summary.affected
            );
            println!("Success: All posts cleared");
            Ok(())
        }

        Command::List { .. } => {
            let reporter = Reporter::new(&settings.report_path);
            let summary = run_list(&db, settings.chunk_size, &reporter, io::stderr())?;
            println!(
                "Scanned {} records in {} pages; {} affected, listed in {}",
                summary.records,
                summary.pages,
                summary.affected,
                reporter.path().display()
            );
            println!("Success: List of affected posts has been generated");
            Ok(())
        }

        Command::Step => {
            let chunk_nums = settings.chunk_nums_for_trigger();
            match trigger_step(&db, settings.chunk_size, chunk_nums)? {
                StepOutcome::Ran(report) => println!("{}", report.notice()),
                StepOutcome::Busy => println!("Another repair step is running; nothing done"),
                StepOutcome::AlreadyFinished => println!("Incremental repair has already finished"),
            }
            Ok(())
        }

        Command::Status { json } => {
            let report = status(&db)?;
            if json {
                println!("{}", to_json(&report)?);
            } else {
                println!("{}", report.render());
            }
            Ok(())
        }

        Command::Inspect { meta_id, fix, json } => {
            let Some(inspection) = inspect(&db, meta_id, fix)? else {
                eprintln!("No post meta with id {meta_id}");
                std::process::exit(1);
            };
            if json {
                println!("{}", to_json(&inspection)?);
            } else {
                println!("{}", inspection.render());
            }
            Ok(())
        }

        Command::Unlock => {
            if ProgressGate::new(&db).force_unlock()? {
                println!("Released the repair step lock");
            } else {
                println!("The repair step lock was not held");
            }
            Ok(())
        }
    }
}
