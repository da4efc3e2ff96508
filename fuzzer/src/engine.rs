use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use common::{
    config::engine::{DEFAULT_BATCH_SIZE, DEFAULT_MAX_INPUT_LEN},
    random::DeriveRandomSeed,
    FxHashSet,
};
use ipc::message::{BatchExecutor, ExecutionRequest, ExecutionResult, Failure};

use crate::{
    corpus::{Corpus, Verdict},
    coverage::Coverage,
    feature::FeatureSet,
    mutation::ByteMutator,
    statistics::{Statistics, StatsSink},
    store::{self, BlobStore},
};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub shard: u32,
    pub batch_size: usize,
    pub max_input_len: usize,
    /// base seed, per-input seeds are derived from it and the sequence number
    pub seed: u64,
    /// stop after this many executions
    pub iteration_budget: Option<u64>,
    pub time_budget: Option<Duration>,
}

impl EngineConfig {
    pub fn new(shard: u32, seed: u64) -> Self {
        Self {
            shard,
            batch_size: DEFAULT_BATCH_SIZE,
            max_input_len: DEFAULT_MAX_INPUT_LEN,
            seed,
            iteration_budget: None,
            time_budget: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    BatchPrepare,
    BatchExecute,
    BatchIngest,
    Stopped,
}

/// isolated faulting input
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub input: Vec<u8>,
    pub failure: Failure,
}

/// One shard's fuzzing run. Owns corpus, coverage, statistics, store and
/// executor; there is no shared mutable state outside this struct.
pub struct Engine<E: BatchExecutor, S: BlobStore> {
    config: EngineConfig,
    executor: E,
    store: S,
    corpus: Corpus,
    coverage: Coverage,
    statistics: Statistics,
    mutator: ByteMutator,
    rng: fastrand::Rng,
    /// inputs awaiting their first execution (seeds, reloads without
    /// feature data)
    pending: VecDeque<Vec<u8>>,
    findings: Vec<Finding>,
    state: EngineState,
    next_seq: u64,
}

impl<E: BatchExecutor, S: BlobStore> Engine<E, S> {
    pub fn new(config: EngineConfig, executor: E, store: S, mutator: ByteMutator) -> Result<Self> {
        let mut engine = Self {
            rng: fastrand::Rng::with_seed(config.seed),
            config,
            executor,
            store,
            corpus: Corpus::new(),
            coverage: Coverage::new(),
            statistics: Statistics::new(),
            mutator,
            pending: VecDeque::new(),
            findings: vec![],
            state: EngineState::Idle,
            next_seq: 0,
        };
        engine.reload_corpus()?;

        Ok(engine)
    }

    /// reload persisted inputs; entries without usable feature data go back
    /// through execution to recover their coverage
    fn reload_corpus(&mut self) -> Result<()> {
        let stored = store::load_corpus(&self.store, self.config.shard)
            .context("Failed to load stored corpus")?;
        if stored.is_empty() {
            return Ok(());
        }

        let mut reloaded = 0;
        for (input, features) in stored {
            match features {
                Some(features) => {
                    self.coverage.record(&features);
                    self.corpus.consider(input, features, 0);
                    reloaded += 1;
                }
                None => self.pending.push_back(input),
            }
        }

        log::info!(
            "reloaded {} corpus entries, {} queued for re-execution",
            reloaded,
            self.pending.len()
        );

        Ok(())
    }

    pub fn add_seed(&mut self, input: Vec<u8>) {
        self.mutator.dictionary_mut().scan_input(&input);
        self.pending.push_back(input);
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn corpus(&self) -> &Corpus {
        &self.corpus
    }

    pub fn coverage(&self) -> &Coverage {
        &self.coverage
    }

    pub fn statistics(&self) -> &Statistics {
        &self.statistics
    }

    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    fn budget_exhausted(&self, started: Instant) -> bool {
        if let Some(iterations) = self.config.iteration_budget {
            if self.statistics.executions() >= iterations {
                return true;
            }
        }
        if let Some(time_budget) = self.config.time_budget {
            if started.elapsed() >= time_budget {
                return true;
            }
        }

        common::exit::exit_requested()
    }

    /// main loop: prepare, execute, ingest until a budget or exit flag stops
    /// the run; the corpus is persisted on the way out
    pub fn run(&mut self, sink: &mut dyn StatsSink) -> Result<()> {
        let started = Instant::now();

        loop {
            if self.budget_exhausted(started) {
                break;
            }

            self.state = EngineState::BatchPrepare;
            let batch = self.prepare_batch();

            self.state = EngineState::BatchExecute;
            let accepted = self.run_batch(batch)?;

            self.statistics
                .set_corpus(self.corpus.len(), self.corpus.feature_count());
            self.statistics.maybe_report(sink);

            if accepted > 0 {
                self.persist().context("Failed to persist corpus")?;
            }
        }

        self.state = EngineState::Stopped;
        self.persist().context("Failed to persist corpus")?;
        log::info!("{}", self.statistics);

        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        store::save_corpus(&mut self.store, self.config.shard, &self.corpus)?;
        Ok(())
    }

    fn next_request(&mut self, input: Vec<u8>) -> ExecutionRequest {
        let seq = self.next_seq;
        self.next_seq += 1;

        ExecutionRequest { seq, input }
    }

    fn prepare_batch(&mut self) -> Vec<ExecutionRequest> {
        let mut batch = Vec::with_capacity(self.config.batch_size);

        // seeds and re-executions first
        while batch.len() < self.config.batch_size {
            match self.pending.pop_front() {
                Some(input) => {
                    let request = self.next_request(input);
                    batch.push(request);
                }
                None => break,
            }
        }

        // cold start without seeds: the empty input
        if batch.is_empty() && self.corpus.is_empty() {
            let request = self.next_request(vec![]);
            batch.push(request);
        }

        while batch.len() < self.config.batch_size && !self.corpus.is_empty() {
            let seq = self.next_seq;
            // reproducible per-input randomness
            let mut rng = fastrand::Rng::with_seed(self.config.seed.derive(&seq));

            let base = match self.corpus.select_for_mutation(&mut self.rng) {
                Some(entry) => entry.input().to_vec(),
                None => break,
            };
            let cross_over = self
                .corpus
                .random_entry(&mut self.rng)
                .map(|entry| entry.input().to_vec());

            let mutated = self.mutator.mutate(
                &base,
                cross_over.as_deref(),
                self.config.max_input_len,
                &mut rng,
            );
            let request = self.next_request(mutated);
            batch.push(request);
        }

        batch
    }

    /// execute one batch, ingest its results, and bisect on a fault;
    /// returns how many inputs the corpus accepted
    fn run_batch(&mut self, batch: Vec<ExecutionRequest>) -> Result<usize> {
        if batch.is_empty() {
            return Ok(0);
        }

        let outcome = self.executor.execute_batch(&batch)?;
        self.statistics.add_executions(batch.len() as u64);

        let acked: FxHashSet<u64> = outcome.results.iter().map(|result| result.seq).collect();
        let mut accepted = self.ingest(&batch, &outcome.results);

        if let Some(fault) = outcome.fault {
            // unacknowledged inputs are the suspects
            let suspects: Vec<ExecutionRequest> = batch
                .into_iter()
                .filter(|request| !acked.contains(&request.seq))
                .collect();

            log::debug!(
                "{} inputs swallowed by target death, bisecting: {:?}",
                suspects.len(),
                fault
            );

            self.state = EngineState::BatchIngest;
            accepted += self.bisect(suspects, fault)?;
        }

        Ok(accepted)
    }

    /// halve the suspect batch until the faulting input is isolated; inputs
    /// from fault-free sub-batches are ingested normally
    fn bisect(&mut self, suspects: Vec<ExecutionRequest>, fault: Failure) -> Result<usize> {
        match suspects.len() {
            0 => {
                // fault without a missing result, attribute it to the batch
                log::warn!("target fault with a complete batch: {:?}", fault);
                self.statistics.add_failure(fault.kind);
                return Ok(0);
            }
            1 => {
                let request = &suspects[0];
                log::info!(
                    "isolated faulting input ({} bytes): {}",
                    request.input.len(),
                    fault.diagnostic
                );
                // attribute the fault as a synthetic result so it runs
                // through the same bookkeeping as a target-reported failure
                let result =
                    ExecutionResult::synthetic_failure(request.seq, fault.kind, fault.diagnostic);
                return Ok(self.ingest(&suspects, &[result]));
            }
            _ => {}
        }

        let mut accepted = 0;
        let mid = suspects.len() / 2;
        let mut suspects = suspects;
        let right = suspects.split_off(mid);

        for half in [suspects, right] {
            let outcome = self.executor.execute_batch(&half)?;
            self.statistics.add_executions(half.len() as u64);

            let acked: FxHashSet<u64> = outcome.results.iter().map(|result| result.seq).collect();
            accepted += self.ingest(&half, &outcome.results);

            if let Some(half_fault) = outcome.fault {
                let unacked: Vec<ExecutionRequest> = half
                    .into_iter()
                    .filter(|request| !acked.contains(&request.seq))
                    .collect();
                accepted += self.bisect(unacked, half_fault)?;
            }
        }

        Ok(accepted)
    }

    /// feed results into coverage and corpus; malformed feature data is
    /// dropped and logged, never fatal
    fn ingest(&mut self, batch: &[ExecutionRequest], results: &[ExecutionResult]) -> usize {
        self.state = EngineState::BatchIngest;
        let mut accepted = 0;

        for result in results {
            let input = match batch.iter().find(|request| request.seq == result.seq) {
                Some(request) => &request.input,
                None => {
                    log::warn!("result for unknown sequence {}, dropping", result.seq);
                    continue;
                }
            };

            if let Some(failure) = &result.failure {
                self.statistics.add_failure(failure.kind);
                self.findings.push(Finding {
                    input: input.clone(),
                    failure: failure.clone(),
                });
                continue;
            }

            let features = match FeatureSet::decode(&result.features) {
                Ok(features) => features,
                Err(e) => {
                    log::warn!("malformed feature data for input {}: {}", result.seq, e);
                    continue;
                }
            };

            self.coverage.record(&features);
            let verdict =
                self.corpus
                    .consider(input.clone(), features, result.stats.wall_micros.max(1));
            if matches!(verdict, Verdict::Accepted | Verdict::Replaced) {
                accepted += 1;
            }
        }

        accepted
    }

    /// offline frontier pass: rewrite the stored corpus keeping only the
    /// entries the frontier still needs
    pub fn distill(&mut self) -> Result<usize> {
        let kept: Vec<(Vec<u8>, FeatureSet)> = self
            .corpus
            .distill()
            .into_iter()
            .map(|entry| (entry.input().to_vec(), entry.features().clone()))
            .collect();

        let mut distilled = Corpus::new();
        for (input, features) in kept {
            distilled.consider(input, features, 0);
        }

        let removed = self.corpus.len() - distilled.len();
        self.corpus = distilled;
        self.persist().context("Failed to persist distilled corpus")?;

        log::info!("distilled corpus: {} entries removed", removed);
        Ok(self.corpus.len())
    }
}

#[cfg(test)]
mod tests {
    use common::FxHashMap;
    use ipc::message::{BatchOutcome, ExecStats, FailureKind};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        dict::Dictionary,
        feature::{Domain, Feature},
        statistics::LogSink,
        store::DirectoryStore,
    };

    /// deterministic in-test target: every distinct input yields one
    /// distinct feature; inputs equal to `poison` kill the "process"
    struct ScriptedExecutor {
        poison: Option<Vec<u8>>,
        batches: usize,
    }

    impl ScriptedExecutor {
        fn new(poison: Option<Vec<u8>>) -> Self {
            Self { poison, batches: 0 }
        }

        fn feature_for(input: &[u8]) -> Feature {
            Feature::new(Domain::Edge, 0u64.derive(&input))
        }
    }

    impl BatchExecutor for ScriptedExecutor {
        fn execute_batch(&mut self, batch: &[ExecutionRequest]) -> Result<BatchOutcome> {
            self.batches += 1;
            let mut results = vec![];

            for request in batch {
                if self.poison.as_deref() == Some(&request.input) {
                    return Ok(BatchOutcome {
                        results,
                        fault: Some(Failure {
                            kind: FailureKind::Crash,
                            diagnostic: "killed by signal 11".into(),
                        }),
                    });
                }

                let features: FeatureSet =
                    [Self::feature_for(&request.input)].into_iter().collect();
                results.push(ExecutionResult {
                    seq: request.seq,
                    features: features.encode(),
                    stats: ExecStats {
                        wall_micros: 100,
                        cpu_micros: 80,
                        peak_rss: 1 << 20,
                    },
                    failure: None,
                });
            }

            Ok(BatchOutcome {
                results,
                fault: None,
            })
        }
    }

    fn engine(
        poison: Option<Vec<u8>>,
        dir: &std::path::Path,
        budget: u64,
    ) -> Engine<ScriptedExecutor, DirectoryStore> {
        let mut config = EngineConfig::new(0, 1234);
        config.batch_size = 10;
        config.iteration_budget = Some(budget);

        Engine::new(
            config,
            ScriptedExecutor::new(poison),
            DirectoryStore::new(dir).unwrap(),
            ByteMutator::new(Dictionary::default()).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn fault_free_run_grows_the_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(None, dir.path(), 50);
        engine.add_seed(b"seed".to_vec());

        engine.run(&mut LogSink).unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.statistics().executions() >= 50);
        assert!(!engine.corpus().is_empty());
        assert!(engine.findings().is_empty());
    }

    #[test]
    fn empty_corpus_bootstraps_from_the_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(None, dir.path(), 1);

        engine.run(&mut LogSink).unwrap();

        // the empty input's feature entered the corpus
        assert_eq!(engine.corpus().len(), 1);
    }

    #[test]
    fn bisection_isolates_the_faulting_input() {
        let dir = tempfile::tempdir().unwrap();
        let poison = vec![6u8];
        let mut engine = engine(Some(poison.clone()), dir.path(), 1);

        for i in 1u8..=10 {
            engine.add_seed(vec![i]);
        }
        engine.run(&mut LogSink).unwrap();

        // exactly the poison input isolated, the 9 good inputs ingested
        assert_eq!(engine.findings().len(), 1);
        assert_eq!(engine.findings()[0].input, poison);
        assert_eq!(engine.findings()[0].failure.kind, FailureKind::Crash);
        assert_eq!(engine.findings()[0].failure.diagnostic, "killed by signal 11");
        assert_eq!(engine.corpus().len(), 9);
        assert_eq!(engine.statistics().crashes(), 1);
    }

    #[test]
    fn faults_do_not_terminate_the_run() {
        let dir = tempfile::tempdir().unwrap();
        let poison = vec![3u8];
        let mut engine = engine(Some(poison.clone()), dir.path(), 60);

        for i in 1u8..=5 {
            engine.add_seed(vec![i]);
        }
        engine.run(&mut LogSink).unwrap();

        assert_eq!(engine.state(), EngineState::Stopped);
        assert!(engine.statistics().executions() >= 60);
        assert!(!engine.findings().is_empty());
    }

    #[test]
    fn corpus_survives_restart_without_reexecution() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut engine = engine(None, dir.path(), 30);
            engine.add_seed(b"persistent seed".to_vec());
            engine.run(&mut LogSink).unwrap();
            assert!(engine.corpus().len() > 1);
        }

        let engine = engine(None, dir.path(), 0);
        assert!(engine.corpus().len() > 1);
        assert!(engine.pending.is_empty());
    }

    #[test]
    fn per_input_mutations_are_reproducible() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();

        let mut run = |dir: &std::path::Path| {
            let mut engine = engine(None, dir, 40);
            engine.add_seed(b"determinism seed".to_vec());
            engine.run(&mut LogSink).unwrap();

            let mut inputs: Vec<Vec<u8>> = engine
                .corpus()
                .entries()
                .map(|entry| entry.input().to_vec())
                .collect();
            inputs.sort_unstable();
            inputs
        };

        assert_eq!(run(dir_a.path()), run(dir_b.path()));
    }

    #[test]
    fn distill_drops_redundant_entries() {
        let dir = tempfile::tempdir().unwrap();
        let mut engine = engine(None, dir.path(), 0);

        let features =
            |values: &[u64]| -> FeatureSet {
                values
                    .iter()
                    .map(|payload| Feature::new(Domain::Edge, *payload))
                    .collect()
            };
        engine.corpus.consider(b"a".to_vec(), features(&[1, 2, 3]), 100);
        engine.corpus.consider(b"b".to_vec(), features(&[2, 4]), 100);

        let before_features = engine.corpus.feature_count();
        engine.distill().unwrap();

        assert_eq!(engine.corpus.feature_count(), before_features);

        // a FxHashMap keyed sanity check: every feature still witnessed
        let mut witnessed: FxHashMap<u64, usize> = FxHashMap::default();
        for entry in engine.corpus.entries() {
            for feature in entry.features().iter() {
                *witnessed.entry(feature.raw()).or_default() += 1;
            }
        }
        assert_eq!(witnessed.len(), before_features);
    }
}
