use std::fmt;

use common::{config::corpus::*, random::SeededRand, FxHashMap, FxHashSet};
use rand::distributions::{Distribution, WeightedIndex};

use crate::feature::{Feature, FeatureSet};

pub type EntryId = u64;

/// Retained input with the coverage it witnessed. Logically immutable,
/// only selection weights and frontier metadata around it change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorpusEntry {
    input: Vec<u8>,
    features: FeatureSet,
    /// exec cost estimate (wall time)
    cost_micros: u64,
    /// monotone insertion sequence, doubles as the entry id
    added_at: EntryId,
}

impl CorpusEntry {
    pub fn input(&self) -> &[u8] {
        &self.input
    }

    pub fn features(&self) -> &FeatureSet {
        &self.features
    }

    pub fn cost_micros(&self) -> u64 {
        self.cost_micros
    }

    pub fn added_at(&self) -> EntryId {
        self.added_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// input witnessed at least one feature the frontier did not cover
    Accepted,
    /// identical coverage at strictly lower cost, incumbent evicted
    Replaced,
    Rejected,
}

/// Corpus with per-feature witness bookkeeping: every retained feature has
/// at least one non-evicted witness at all times.
#[derive(Debug, Default)]
pub struct Corpus {
    entries: FxHashMap<EntryId, CorpusEntry>,
    /// insertion order, parallel to the cached weighted index
    order: Vec<EntryId>,
    witnesses: FxHashMap<Feature, FxHashSet<EntryId>>,
    /// canonical feature encoding -> incumbent entry
    signatures: FxHashMap<Vec<u8>, EntryId>,
    weighted_index: Option<WeightedIndex<f64>>,
    rebuilt_at: usize,
    considerations: usize,
    next_id: EntryId,
}

impl fmt::Display for Corpus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "corpus: {} inputs, {} features, {} frontier members",
            self.entries.len(),
            self.witnesses.len(),
            self.order
                .iter()
                .filter(|id| self.is_frontier(**id))
                .count(),
        )
    }
}

impl Corpus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn feature_count(&self) -> usize {
        self.witnesses.len()
    }

    /// entries in insertion order
    pub fn entries(&self) -> impl Iterator<Item = &CorpusEntry> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    pub fn consider(&mut self, input: Vec<u8>, features: FeatureSet, cost_micros: u64) -> Verdict {
        self.considerations += 1;

        let uncovered = features
            .iter()
            .any(|feature| !self.witnesses.contains_key(feature));
        if uncovered {
            let id = self.insert(input, features, cost_micros);
            log::debug!("corpus accepted entry {}", id);

            if self.entries.len() > MAX_CORPUS_SIZE {
                self.evict();
            }
            self.weighted_index = None;
            return Verdict::Accepted;
        }

        let signature = features.encode();
        if let Some(incumbent_id) = self.signatures.get(&signature).copied() {
            let incumbent_cost = self
                .entries
                .get(&incumbent_id)
                .map(CorpusEntry::cost_micros);

            // on equal cost the incumbent wins
            if incumbent_cost.is_some_and(|cost| cost_micros < cost) {
                let id = self.insert(input, features, cost_micros);
                self.remove(incumbent_id);
                log::debug!("corpus entry {} replaced by cheaper {}", incumbent_id, id);

                self.weighted_index = None;
                return Verdict::Replaced;
            }
        }

        Verdict::Rejected
    }

    fn insert(&mut self, input: Vec<u8>, features: FeatureSet, cost_micros: u64) -> EntryId {
        let id = self.next_id;
        self.next_id += 1;

        for feature in features.iter() {
            self.witnesses.entry(*feature).or_default().insert(id);
        }
        self.signatures.insert(features.encode(), id);

        self.entries.insert(
            id,
            CorpusEntry {
                input,
                features,
                cost_micros,
                added_at: id,
            },
        );
        self.order.push(id);

        id
    }

    fn remove(&mut self, id: EntryId) {
        let entry = match self.entries.remove(&id) {
            Some(entry) => entry,
            None => return,
        };
        self.order.retain(|other| *other != id);

        for feature in entry.features.iter() {
            if let Some(witnesses) = self.witnesses.get_mut(feature) {
                witnesses.remove(&id);
                // callers only remove entries whose features stay witnessed
                debug_assert!(!witnesses.is_empty());
            }
        }

        let signature = entry.features.encode();
        if self.signatures.get(&signature) == Some(&id) {
            self.signatures.remove(&signature);
        }
    }

    /// entry is the only witness of at least one feature
    fn is_frontier(&self, id: EntryId) -> bool {
        self.entries
            .get(&id)
            .map(|entry| {
                entry.features.iter().any(|feature| {
                    self.witnesses
                        .get(feature)
                        .is_some_and(|witnesses| witnesses.len() == 1)
                })
            })
            .unwrap_or(false)
    }

    /// every feature of the entry has another witness
    fn is_redundant(&self, id: EntryId) -> bool {
        !self.is_frontier(id) && self.entries.contains_key(&id)
    }

    fn weight(&self, id: EntryId, position: usize) -> f64 {
        let mut weight = MIN_WEIGHT;

        if self.is_frontier(id) {
            weight += FRONTIER_WEIGHT;
        }
        if position + RECENCY_WINDOW >= self.order.len() {
            weight += RECENCY_WEIGHT;
        }

        weight
    }

    /// drop lowest-weight fully redundant entries down to the size bound,
    /// never the last witness of any feature, never below the retention floor
    fn evict(&mut self) {
        while self.entries.len() > MAX_CORPUS_SIZE && self.entries.len() > MIN_CORPUS_SIZE {
            let candidate = self
                .order
                .iter()
                .enumerate()
                .filter(|(_, id)| self.is_redundant(**id))
                .min_by(|(pos_a, a), (pos_b, b)| {
                    self.weight(**a, *pos_a).total_cmp(&self.weight(**b, *pos_b))
                })
                .map(|(_, id)| *id);

            match candidate {
                Some(id) => {
                    log::debug!("evicting redundant corpus entry {}", id);
                    self.remove(id);
                }
                // everything left is a frontier witness
                None => break,
            }
        }

        self.weighted_index = None;
    }

    /// weighted draw favoring frontier members and recent entries; the
    /// minimum weight keeps every entry reachable
    pub fn select_for_mutation(&mut self, rng: &mut fastrand::Rng) -> Option<&CorpusEntry> {
        if self.order.is_empty() {
            return None;
        }

        if self.weighted_index.is_none()
            || self.considerations >= self.rebuilt_at + UPDATE_WEIGHT_INTERVAL
        {
            let weights: Vec<f64> = self
                .order
                .iter()
                .enumerate()
                .map(|(position, id)| self.weight(*id, position))
                .collect();

            match WeightedIndex::new(weights) {
                Ok(index) => {
                    self.weighted_index = Some(index);
                    self.rebuilt_at = self.considerations;
                }
                Err(e) => log::warn!("failed to build corpus weight index: {}", e),
            }
        }

        let position = match &self.weighted_index {
            Some(index) => index.sample(&mut SeededRand(rng)),
            None => rng.usize(0..self.order.len()),
        };

        self.entries.get(&self.order[position])
    }

    /// uniform draw, used as the cross-over second input
    pub fn random_entry(&self, rng: &mut fastrand::Rng) -> Option<&CorpusEntry> {
        if self.order.is_empty() {
            return None;
        }

        self.entries.get(&self.order[rng.usize(0..self.order.len())])
    }

    /// greedy frontier pass: the minimal prefix-greedy subset that still
    /// witnesses every retained feature, in insertion order
    pub fn distill(&self) -> Vec<&CorpusEntry> {
        let mut covered: FxHashSet<Feature> = FxHashSet::default();
        let mut kept = vec![];

        for entry in self.entries() {
            if entry
                .features
                .iter()
                .any(|feature| !covered.contains(feature))
            {
                covered.extend(entry.features.iter().copied());
                kept.push(entry);
            }
        }

        kept
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::feature::Domain;

    fn features(values: &[u64]) -> FeatureSet {
        values
            .iter()
            .map(|payload| Feature::new(Domain::Edge, *payload))
            .collect()
    }

    #[test]
    fn new_coverage_is_accepted() {
        let mut corpus = Corpus::new();

        assert_eq!(
            corpus.consider(b"a".to_vec(), features(&[1, 2]), 100),
            Verdict::Accepted
        );
        assert_eq!(
            corpus.consider(b"b".to_vec(), features(&[2, 3]), 100),
            Verdict::Accepted
        );

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.feature_count(), 3);
    }

    #[test]
    fn covered_subset_is_rejected() {
        let mut corpus = Corpus::new();
        corpus.consider(b"a".to_vec(), features(&[1, 2]), 100);
        corpus.consider(b"b".to_vec(), features(&[2, 3]), 100);

        // {1, 3} is covered but matches no entry's signature
        assert_eq!(
            corpus.consider(b"c".to_vec(), features(&[1, 3]), 1),
            Verdict::Rejected
        );
        assert_eq!(corpus.len(), 2);
    }

    #[test]
    fn cheaper_identical_coverage_replaces() {
        let mut corpus = Corpus::new();
        corpus.consider(b"a".to_vec(), features(&[1, 2]), 100);
        corpus.consider(b"b".to_vec(), features(&[2, 3]), 100);

        assert_eq!(
            corpus.consider(b"c".to_vec(), features(&[1, 2]), 50),
            Verdict::Replaced
        );

        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.feature_count(), 3);

        let inputs: Vec<&[u8]> = corpus.entries().map(CorpusEntry::input).collect();
        assert!(inputs.contains(&&b"c"[..]));
        assert!(!inputs.contains(&&b"a"[..]));
    }

    #[test]
    fn equal_cost_keeps_the_incumbent() {
        let mut corpus = Corpus::new();
        corpus.consider(b"a".to_vec(), features(&[1, 2]), 100);

        assert_eq!(
            corpus.consider(b"b".to_vec(), features(&[1, 2]), 100),
            Verdict::Rejected
        );

        let inputs: Vec<&[u8]> = corpus.entries().map(CorpusEntry::input).collect();
        assert_eq!(inputs, vec![&b"a"[..]]);
    }

    #[test]
    fn consider_is_idempotent_for_covered_inputs() {
        let mut corpus = Corpus::new();
        corpus.consider(b"a".to_vec(), features(&[1, 2]), 100);

        for _ in 0..3 {
            assert_eq!(
                corpus.consider(b"a".to_vec(), features(&[1, 2]), 100),
                Verdict::Rejected
            );
            assert_eq!(corpus.len(), 1);
        }
    }

    #[test]
    fn featureless_input_is_rejected() {
        let mut corpus = Corpus::new();

        assert_eq!(
            corpus.consider(b"a".to_vec(), FeatureSet::new(), 100),
            Verdict::Rejected
        );
        assert!(corpus.is_empty());
    }

    #[test]
    fn selection_reaches_every_entry() {
        let mut corpus = Corpus::new();
        for i in 0..8u64 {
            corpus.consider(vec![i as u8], features(&[i]), 100);
        }

        let mut rng = fastrand::Rng::with_seed(42);
        let mut seen = FxHashSet::default();
        for _ in 0..2000 {
            let entry = corpus.select_for_mutation(&mut rng).unwrap();
            seen.insert(entry.added_at());
        }

        assert_eq!(seen.len(), 8);
    }

    #[test]
    fn selection_is_deterministic_for_fixed_seed() {
        let mut build = || {
            let mut corpus = Corpus::new();
            for i in 0..8u64 {
                corpus.consider(vec![i as u8], features(&[i]), 100);
            }
            corpus
        };
        let mut a = build();
        let mut b = build();

        let mut rng_a = fastrand::Rng::with_seed(7);
        let mut rng_b = fastrand::Rng::with_seed(7);
        for _ in 0..64 {
            assert_eq!(
                a.select_for_mutation(&mut rng_a).map(CorpusEntry::added_at),
                b.select_for_mutation(&mut rng_b).map(CorpusEntry::added_at),
            );
        }
    }

    #[test]
    fn eviction_never_drops_the_last_witness() {
        let mut corpus = Corpus::new();

        // unique witnesses beyond the size bound, nothing is redundant
        for i in 0..(MAX_CORPUS_SIZE as u64 + 10) {
            corpus.consider(vec![], features(&[i]), 100);
        }

        assert_eq!(corpus.len(), MAX_CORPUS_SIZE + 10);
        for i in 0..(MAX_CORPUS_SIZE as u64 + 10) {
            assert!(corpus
                .witnesses
                .contains_key(&Feature::new(Domain::Edge, i)));
        }
    }

    #[test]
    fn distill_keeps_full_coverage() {
        let mut corpus = Corpus::new();
        corpus.consider(b"a".to_vec(), features(&[1, 2]), 100);
        corpus.consider(b"b".to_vec(), features(&[2, 3]), 100);
        corpus.consider(b"c".to_vec(), features(&[1, 4]), 100);

        let kept = corpus.distill();
        let mut covered = FxHashSet::default();
        for entry in &kept {
            covered.extend(entry.features().iter().copied());
        }

        assert_eq!(covered.len(), corpus.feature_count());
        assert_eq!(kept.len(), 3);
    }
}
