mod cli;
mod config;
mod run;

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Parser;
use common::{
    exit::{EXIT, TERM},
    log::init_log,
};

use crate::{
    cli::{Arguments, Command},
    config::{FuzzConfig, RunConfig},
};

fn main() -> Result<()> {
    let opt = Arguments::parse();

    init_log(&opt.log_config)?;
    log::trace!("Args: {:#?}", opt);

    set_signal_handler().context("Failed to set signal handler")?;

    let corpus_dir = opt.corpus.corpus_dir;
    let shard = opt.shard.shard;

    match opt.command {
        Command::Fuzz(args) => {
            let config = FuzzConfig::from_cli(&opt.name, corpus_dir, shard, args)
                .context("Failed to create fuzz config")?;
            run::fuzz(config)
        }
        Command::Run(args) => {
            let config = RunConfig::from_cli(&opt.name, corpus_dir, shard, args)
                .context("Failed to create run config")?;
            run::run_once(config)
        }
        Command::Distill => run::distill(&corpus_dir, shard),
    }
    .map_err(|e| {
        log::error!("{:?}", e);
        e
    })
}

fn set_signal_handler() -> Result<()> {
    for signal in signal_hook::consts::TERM_SIGNALS {
        // NOTE: do not use log inside the signal handler, this may deadlock
        unsafe {
            signal_hook::low_level::register(*signal, || {
                if !EXIT.swap(true, Ordering::SeqCst) {
                    eprintln!("exit requested, stopping at the next batch boundary");
                } else if !TERM.swap(true, Ordering::SeqCst) {
                    eprintln!("termination requested");
                } else {
                    signal_hook::low_level::exit(1);
                }
            })
        }
        .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }

    Ok(())
}
