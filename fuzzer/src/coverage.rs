use common::{hashbrown::hash_map::Entry, FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::feature::{Feature, FeatureSet};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub module: String,
    pub function: String,
    pub line: Option<u32>,
}

/// Address to symbol mapping, append-only within a run. Unknown addresses
/// resolve to `None`, never an error; on duplicate addresses the first
/// added entry wins (lossless for a single build, best-effort across
/// mixed builds).
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SymbolIndex {
    symbols: FxHashMap<u64, SymbolInfo>,
}

impl SymbolIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, addr: u64, info: SymbolInfo) {
        if let Entry::Vacant(entry) = self.symbols.entry(addr) {
            entry.insert(info);
        }
    }

    pub fn resolve(&self, addr: u64) -> Option<&SymbolInfo> {
        self.symbols.get(&addr)
    }

    pub fn merge(&mut self, other: &SymbolIndex) {
        for (addr, info) in &other.symbols {
            self.add(*addr, info.clone());
        }
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

/// union of observed features with per-feature hit counts
#[derive(Debug, Default)]
pub struct Coverage {
    hit_counts: FxHashMap<Feature, u64>,
    newly_seen: FxHashSet<Feature>,
}

impl Coverage {
    pub fn new() -> Self {
        Self::default()
    }

    /// fold one execution's features in, returns how many were new
    pub fn record(&mut self, features: &FeatureSet) -> usize {
        let mut new = 0;

        for feature in features.iter() {
            match self.hit_counts.entry(*feature) {
                Entry::Occupied(mut entry) => *entry.get_mut() += 1,
                Entry::Vacant(entry) => {
                    entry.insert(1);
                    self.newly_seen.insert(*feature);
                    new += 1;
                }
            }
        }

        new
    }

    pub fn contains(&self, feature: &Feature) -> bool {
        self.hit_counts.contains_key(feature)
    }

    pub fn hits(&self, feature: &Feature) -> u64 {
        self.hit_counts.get(feature).copied().unwrap_or(0)
    }

    pub fn feature_count(&self) -> usize {
        self.hit_counts.len()
    }

    pub fn features(&self) -> impl Iterator<Item = &Feature> {
        self.hit_counts.keys()
    }

    /// features first seen since the last call, for reporting
    pub fn take_newly_seen(&mut self) -> Vec<Feature> {
        let mut new: Vec<Feature> = self.newly_seen.drain().collect();
        new.sort_unstable();
        new
    }
}
