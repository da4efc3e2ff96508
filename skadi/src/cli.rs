use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint};
use common::log::LOG_INFO;

const INPUT: &str = "INPUT";
const PATH: &str = "PATH";
const SECONDS: &str = "SECONDS";

#[derive(Parser, Debug)]
#[command(name = "skadi", rename_all = "kebab-case")]
pub struct Arguments {
    /// Run name, namespaces shared memory objects and pipes
    #[arg(long, global = true, default_value = "skadi", display_order = 1)]
    pub name: String,

    #[command(flatten)]
    pub corpus: CorpusDir,

    #[command(flatten)]
    pub shard: Shard,

    #[arg(long, default_value = LOG_INFO, value_hint = ValueHint::FilePath, display_order = 700)]
    pub log_config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
pub enum Command {
    /// Fuzz a target binary
    #[command(name = "fuzz")]
    Fuzz(FuzzArguments),

    /// Execute the stored corpus once and print a coverage report
    #[command(name = "run")]
    Run(RunArguments),

    /// Rewrite the stored corpus keeping only frontier members
    #[command(name = "distill")]
    Distill,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct FuzzArguments {
    #[command(flatten)]
    pub target: TargetArguments,

    /// Use seed file for a deterministic fuzzing run
    #[arg(long, value_name = PATH, value_hint = ValueHint::FilePath, display_order = 120)]
    pub seed: Option<PathBuf>,

    /// Inputs per execution batch
    #[arg(long, value_name = "N", display_order = 130)]
    pub batch_size: Option<usize>,

    /// Maximum mutated input length in bytes
    #[arg(long, value_name = "BYTES", display_order = 131)]
    pub max_input_len: Option<usize>,

    /// Stop after this many executions
    #[arg(long, value_name = "N", display_order = 140)]
    pub iterations: Option<u64>,

    /// Stop after this many seconds
    #[arg(long, value_name = SECONDS, display_order = 141)]
    pub time_limit: Option<u64>,

    /// Wall-clock deadline per batch
    #[arg(long, value_name = SECONDS, display_order = 150)]
    pub timeout: Option<u64>,

    /// Target RSS ceiling in MiB
    #[arg(long, value_name = "MIB", display_order = 151)]
    pub rss_limit_mb: Option<u64>,

    /// Spawn a fresh target process per batch instead of probing for the
    /// fork server protocol
    #[arg(long, display_order = 152)]
    pub no_fork_server: bool,

    /// Dictionary file with one token per line
    #[arg(long, value_name = PATH, value_hint = ValueHint::FilePath, display_order = 160)]
    pub dictionary: Option<PathBuf>,

    /// Seed input file(s) or directories
    #[arg(long, value_name = INPUT, num_args = 1, value_hint = ValueHint::AnyPath, display_order = 104)]
    pub import_seeds: Vec<PathBuf>,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct RunArguments {
    #[command(flatten)]
    pub target: TargetArguments,

    /// Wall-clock deadline per batch
    #[arg(long, value_name = SECONDS, display_order = 150)]
    pub timeout: Option<u64>,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct TargetArguments {
    /// Path to the target binary
    #[arg(value_name = "TARGET", value_hint = ValueHint::CommandName, display_order = 20)]
    pub target: PathBuf,

    /// Arguments passed to the target binary
    #[arg(last = true, value_name = "ARGS", display_order = 21)]
    pub target_args: Vec<String>,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct CorpusDir {
    /// Corpus storage directory
    #[arg(
        long,
        global = true,
        value_name = PATH,
        default_value = "./corpus",
        value_hint = ValueHint::DirPath,
        display_order = 11
    )]
    pub corpus_dir: PathBuf,
}

#[derive(Args, Debug)]
#[command(rename_all = "kebab-case")]
pub struct Shard {
    /// Shard index, keys the corpus files
    #[arg(long, global = true, value_name = "N", default_value_t = 0, display_order = 12)]
    pub shard: u32,
}
