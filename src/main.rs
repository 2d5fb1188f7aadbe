use anyhow::Result;
use clap::Parser;
use std::process::ExitCode;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

mod backend;
mod cache;
mod classify;
mod cli;
mod config;
mod exec;
mod gdb;
mod interpreter;
mod partition;
mod patch;
mod paths;
mod rank;
mod report;
mod run;
mod scheduler;
mod snapshot;
mod util;

use cli::{Command, RootArgs};

fn init_tracing(debug: bool) {
    let level = if debug { LevelFilter::DEBUG } else { LevelFilter::INFO };
    let filter = EnvFilter::builder()
        .with_default_directive(level.into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn dispatch(args: RootArgs) -> Result<()> {
    match args.command {
        Command::Run(run_args) => {
            init_tracing(run_args.config.debug);
            scheduler::install_signal_handlers();
            run::run(&run_args)?;
            Ok(())
        }
        Command::Script(script_args) => {
            init_tracing(script_args.config.debug);
            run::script(&script_args)
        }
    }
}

fn main() -> ExitCode {
    let args = RootArgs::parse();
    match dispatch(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
