pub mod corpus;
pub mod coverage;
pub mod dict;
pub mod engine;
pub mod feature;
pub mod mutation;
pub mod statistics;
pub mod store;

pub use corpus::{Corpus, CorpusEntry, Verdict};
pub use coverage::{Coverage, SymbolIndex, SymbolInfo};
pub use engine::{Engine, EngineConfig, EngineState, Finding};
pub use feature::{Domain, Feature, FeatureDecodeError, FeatureSet};
pub use mutation::ByteMutator;
pub use statistics::{Counter, LogSink, Statistics, StatsSink};
pub use store::{BlobStore, CorpusStorageError, DirectoryStore};
