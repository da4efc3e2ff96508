use std::{fs, path::Path};

use anyhow::{bail, Context, Result};
use common::{config::engine::DEFAULT_BATCH_SIZE, error::LogError};
use fuzzer::{
    dict::Dictionary,
    engine::EngineConfig,
    store::{self, BlobStore},
    ByteMutator, Coverage, Engine, FeatureSet, LogSink, SymbolIndex,
};
use ipc::message::{BatchExecutor, BatchOutcome, ExecutionRequest};
use runner::ProcessDriver;

use crate::config::{FuzzConfig, RunConfig};

const SYMBOLS_KEY: &str = "symbols.bin";

pub fn fuzz(config: FuzzConfig) -> Result<()> {
    let store = store::DirectoryStore::new(&config.corpus_dir)
        .with_context(|| format!("Failed to open corpus dir {:?}", config.corpus_dir))?;

    let mut dictionary = Dictionary::default();
    if let Some(path) = &config.dictionary {
        load_dictionary(&mut dictionary, path)
            .with_context(|| format!("Failed to load dictionary {path:?}"))?;
    }
    let mutator = ByteMutator::new(dictionary).context("Failed to create mutator")?;

    log::info!("target: {}", config.driver.command);
    let driver = ProcessDriver::new(config.driver).context("Failed to create process driver")?;

    let mut engine = Engine::new(config.engine, driver, store, mutator)
        .context("Failed to create fuzzing engine")?;

    for path in &config.import_seeds {
        for file in seed_files(path)? {
            let input = fs::read(&file)
                .with_context(|| format!("Failed to read seed input {file:?}"))?;
            log::debug!("imported seed {:?} ({} bytes)", file, input.len());
            engine.add_seed(input);
        }
    }

    engine.run(&mut LogSink).context("Fuzzer run failed")?;

    let findings_dir = config.corpus_dir.join("findings");
    if !engine.findings().is_empty() {
        fs::create_dir_all(&findings_dir)
            .with_context(|| format!("Failed to create findings dir {findings_dir:?}"))?;
    }
    let run_epoch = common::time::epoch().context("Failed to read system time")?;
    for (index, finding) in engine.findings().iter().enumerate() {
        let path = findings_dir.join(format!(
            "{}-{}-{:04}.bin",
            finding.failure.kind.as_str(),
            run_epoch,
            index
        ));
        log::info!(
            "finding {:?}: {} ({} bytes)",
            path,
            finding.failure.diagnostic,
            finding.input.len()
        );
        fs::write(&path, &finding.input)
            .with_context(|| format!("Failed to write finding {path:?}"))?;
    }

    Ok(())
}

/// replay the stored corpus once and report the coverage it reaches
pub fn run_once(config: RunConfig) -> Result<()> {
    let store = store::DirectoryStore::new(&config.corpus_dir)
        .with_context(|| format!("Failed to open corpus dir {:?}", config.corpus_dir))?;
    let inputs = store::load_corpus(&store, config.shard).context("Failed to load corpus")?;
    if inputs.is_empty() {
        bail!("no corpus entries for shard {}", config.shard);
    }

    // a broken symbol index degrades the report, it does not block the replay
    let symbols = load_symbols(&store).log_error().flatten();
    let mut driver =
        ProcessDriver::new(config.driver).context("Failed to create process driver")?;

    let mut coverage = Coverage::new();
    let mut executed = 0usize;
    let mut failures = 0usize;

    let requests: Vec<ExecutionRequest> = inputs
        .into_iter()
        .enumerate()
        .map(|(seq, (input, _))| ExecutionRequest {
            seq: seq as u64,
            input,
        })
        .collect();

    for batch in requests.chunks(DEFAULT_BATCH_SIZE) {
        common::exit::signal_exit_point()?;

        let BatchOutcome { results, fault } = driver
            .execute_batch(batch)
            .context("Failed to execute corpus batch")?;

        for result in &results {
            executed += 1;
            if let Some(failure) = &result.failure {
                failures += 1;
                log::warn!("input {} failed: {}", result.seq, failure.diagnostic);
                continue;
            }

            match FeatureSet::decode(&result.features) {
                Ok(features) => {
                    coverage.record(&features);
                }
                Err(e) => log::warn!("malformed feature data for input {}: {}", result.seq, e),
            }
        }

        if let Some(fault) = fault {
            failures += 1;
            log::warn!("target fault while replaying the corpus: {:?}", fault);
        }
    }

    for feature in coverage.take_newly_seen() {
        match symbols.as_ref().and_then(|index| index.resolve(feature.payload())) {
            Some(info) => log::debug!(
                "feature {:#x} -> {}:{}",
                feature.raw(),
                info.module,
                info.function
            ),
            None => log::debug!("feature {:#x}", feature.raw()),
        }
    }
    log::info!(
        "replayed {} corpus entries: {} features, {} failures",
        executed,
        coverage.feature_count(),
        failures
    );

    Ok(())
}

/// offline frontier pass over the stored corpus, no target involved
pub fn distill(corpus_dir: &Path, shard: u32) -> Result<()> {
    let store = store::DirectoryStore::new(corpus_dir)
        .with_context(|| format!("Failed to open corpus dir {corpus_dir:?}"))?;

    // entries without feature data cannot be ranked offline; refuse instead
    // of rewriting the corpus without them
    let stored = store::load_corpus(&store, shard).context("Failed to load corpus")?;
    if stored.is_empty() {
        bail!("no corpus entries for shard {shard}");
    }
    if stored.iter().any(|(_, features)| features.is_none()) {
        bail!("corpus of shard {shard} is missing feature data, fuzz it first to recover coverage");
    }

    let mut engine = Engine::new(
        EngineConfig::new(shard, 0),
        OfflineExecutor,
        store,
        ByteMutator::new(Dictionary::default()).context("Failed to create mutator")?,
    )
    .context("Failed to load corpus")?;

    let kept = engine.distill().context("Failed to distill corpus")?;
    log::info!("distilled corpus of shard {} down to {} entries", shard, kept);

    Ok(())
}

/// corpus passes never execute the target
struct OfflineExecutor;

impl BatchExecutor for OfflineExecutor {
    fn execute_batch(&mut self, _batch: &[ExecutionRequest]) -> Result<BatchOutcome> {
        bail!("offline corpus pass cannot execute inputs")
    }
}

fn seed_files(path: &Path) -> Result<Vec<std::path::PathBuf>> {
    if path.is_dir() {
        common::fs::find_files(path, None, None)
            .with_context(|| format!("Failed to list seed dir {path:?}"))
    } else {
        Ok(vec![path.to_path_buf()])
    }
}

/// one token per line, `#` comments and blank lines skipped
fn load_dictionary(dictionary: &mut Dictionary, path: &Path) -> Result<()> {
    let content = fs::read_to_string(path).context("Failed to read file")?;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        dictionary.add_token(line.as_bytes());
    }

    Ok(())
}

fn load_symbols(store: &store::DirectoryStore) -> Result<Option<SymbolIndex>> {
    match store.get(SYMBOLS_KEY)? {
        Some(data) => {
            let symbols: SymbolIndex =
                bincode::deserialize(&data).context("Failed to decode symbol index")?;
            log::info!("loaded {} symbols", symbols.len());
            Ok(Some(symbols))
        }
        None => Ok(None),
    }
}
