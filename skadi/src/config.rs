use std::{
    fs::File,
    io::{self, Read},
    path::PathBuf,
    time::Duration,
};

use anyhow::{Context, Result};
use fuzzer::engine::EngineConfig;
use runner::{DriverConfig, TargetCommand};

use crate::cli::{FuzzArguments, RunArguments};

#[derive(Debug)]
pub struct FuzzConfig {
    pub engine: EngineConfig,
    pub driver: DriverConfig,
    pub corpus_dir: PathBuf,
    pub dictionary: Option<PathBuf>,
    pub import_seeds: Vec<PathBuf>,
}

impl FuzzConfig {
    pub fn from_cli(
        name: &str,
        corpus_dir: PathBuf,
        shard: u32,
        args: FuzzArguments,
    ) -> Result<Self> {
        let seed = match args.seed {
            Some(path) => read_seed_file(&path)
                .with_context(|| format!("Failed to read seed file {path:?}"))?,
            None => fastrand::u64(..),
        };
        log::info!("seed = {seed:#018x}");

        let mut engine = EngineConfig::new(shard, seed);
        if let Some(batch_size) = args.batch_size {
            engine.batch_size = batch_size;
        }
        if let Some(max_input_len) = args.max_input_len {
            engine.max_input_len = max_input_len;
        }
        engine.iteration_budget = args.iterations;
        engine.time_budget = args.time_limit.map(Duration::from_secs);

        let mut command = TargetCommand::new(args.target.target).args(args.target.target_args);
        if let Some(rss_limit_mb) = args.rss_limit_mb {
            command = command.rss_limit_mb(rss_limit_mb);
        }

        let mut driver =
            DriverConfig::new(command, std::env::temp_dir(), run_prefix(name, shard));
        if let Some(timeout) = args.timeout {
            driver.batch_timeout = Duration::from_secs(timeout);
        }
        driver.use_fork_server = !args.no_fork_server;

        Ok(Self {
            engine,
            driver,
            corpus_dir,
            dictionary: args.dictionary,
            import_seeds: args.import_seeds,
        })
    }
}

#[derive(Debug)]
pub struct RunConfig {
    pub driver: DriverConfig,
    pub corpus_dir: PathBuf,
    pub shard: u32,
}

impl RunConfig {
    pub fn from_cli(
        name: &str,
        corpus_dir: PathBuf,
        shard: u32,
        args: RunArguments,
    ) -> Result<Self> {
        let command = TargetCommand::new(args.target.target).args(args.target.target_args);

        let mut driver =
            DriverConfig::new(command, std::env::temp_dir(), run_prefix(name, shard));
        if let Some(timeout) = args.timeout {
            driver.batch_timeout = Duration::from_secs(timeout);
        }

        Ok(Self {
            driver,
            corpus_dir,
            shard,
        })
    }
}

/// namespaces the shm objects and fifos of this process
fn run_prefix(name: &str, shard: u32) -> String {
    format!("{}-{}-{}", name, shard, std::process::id())
}

fn read_seed_file(path: &PathBuf) -> Result<u64> {
    let mut seed = [0u8; 8];

    let mut file = File::open(path).context("Failed to open file")?;
    if let Err(e) = file.read_exact(&mut seed) {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            log::warn!("seed file {path:?} is shorter than 8 bytes, filling with zero");
        } else {
            return Err(e).context("Failed to read file");
        }
    }

    Ok(u64::from_be_bytes(seed))
}
