use std::{
    fs,
    io::{Read, Write},
    path::{Path, PathBuf},
    thread,
};

use anyhow::{Context, Result};
use common::config::storage::{MAX_RECORD_SIZE, PUT_RETRY_BACKOFF, PUT_RETRY_LIMIT};
use thiserror::Error;

use crate::{corpus::Corpus, feature::FeatureSet};

#[derive(Debug, Error)]
pub enum CorpusStorageError {
    #[error("storage put {key:?} failed after {attempts} attempts")]
    RetriesExhausted {
        key: String,
        attempts: usize,
        #[source]
        source: anyhow::Error,
    },
    #[error("corpus record exceeds size limit ({len} > {max})")]
    OversizedRecord { len: u32, max: u32 },
    #[error("corpus file truncated")]
    Truncated,
}

/// key/value blob storage for corpus persistence
pub trait BlobStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&mut self, key: &str, data: &[u8]) -> Result<()>;
    fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// local directory store, values zstd-compressed at rest
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create storage directory {root:?}"))?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, key: &str) -> PathBuf {
        self.root.join(key)
    }
}

impl BlobStore for DirectoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(key);
        if !path.is_file() {
            return Ok(None);
        }

        let mut data = vec![];
        common::fs::decoder(&path)?
            .read_to_end(&mut data)
            .with_context(|| format!("Failed to read blob {key:?}"))?;

        Ok(Some(data))
    }

    fn put(&mut self, key: &str, data: &[u8]) -> Result<()> {
        let mut encoder = common::fs::encoder(&self.path(key))?;
        encoder
            .write_all(data)
            .with_context(|| format!("Failed to write blob {key:?}"))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(common::fs::find_files(&self.root, Some(prefix), None)?
            .into_iter()
            .filter_map(|path| {
                path.file_name()
                    .map(|name| name.to_string_lossy().into_owned())
            })
            .collect())
    }
}

/// bounded-backoff retry; persistent failure is for the caller to treat as
/// fatal
pub fn put_with_retry(
    store: &mut dyn BlobStore,
    key: &str,
    data: &[u8],
) -> Result<(), CorpusStorageError> {
    let mut last_error = None;

    for attempt in 1..=PUT_RETRY_LIMIT {
        match store.put(key, data) {
            Ok(()) => return Ok(()),
            Err(e) => {
                log::warn!("storage put {:?} attempt {} failed: {:#}", key, attempt, e);
                last_error = Some(e);

                if attempt < PUT_RETRY_LIMIT {
                    thread::sleep(PUT_RETRY_BACKOFF);
                }
            }
        }
    }

    Err(CorpusStorageError::RetriesExhausted {
        key: key.into(),
        attempts: PUT_RETRY_LIMIT,
        source: last_error.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
    })
}

pub fn corpus_key(shard: u32) -> String {
    format!("corpus-{shard:04}.bin")
}

pub fn features_key(shard: u32) -> String {
    format!("features-{shard:04}.bin")
}

fn encode_records<'a>(records: impl Iterator<Item = &'a [u8]>) -> Result<Vec<u8>, CorpusStorageError> {
    let mut data = vec![];

    for record in records {
        let len = record.len() as u32;
        if record.len() > MAX_RECORD_SIZE as usize {
            return Err(CorpusStorageError::OversizedRecord {
                len,
                max: MAX_RECORD_SIZE,
            });
        }

        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(record);
    }

    Ok(data)
}

fn decode_records(data: &[u8]) -> Result<Vec<Vec<u8>>, CorpusStorageError> {
    let mut records = vec![];
    let mut cursor = 0;

    while cursor < data.len() {
        let len_bytes: [u8; 4] = data
            .get(cursor..cursor + 4)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or(CorpusStorageError::Truncated)?;
        cursor += 4;

        let len = u32::from_le_bytes(len_bytes);
        if len > MAX_RECORD_SIZE {
            return Err(CorpusStorageError::OversizedRecord {
                len,
                max: MAX_RECORD_SIZE,
            });
        }

        let record = data
            .get(cursor..cursor + len as usize)
            .ok_or(CorpusStorageError::Truncated)?;
        cursor += len as usize;

        records.push(record.to_vec());
    }

    Ok(records)
}

/// persist the retained inputs plus a parallel, index-aligned feature file
/// so reloads do not have to re-execute every input
pub fn save_corpus(
    store: &mut dyn BlobStore,
    shard: u32,
    corpus: &Corpus,
) -> Result<(), CorpusStorageError> {
    let inputs = encode_records(corpus.entries().map(|entry| entry.input()))?;

    let features: Vec<Vec<u8>> = corpus
        .entries()
        .map(|entry| entry.features().encode())
        .collect();
    let features = encode_records(features.iter().map(Vec::as_slice))?;

    put_with_retry(store, &corpus_key(shard), &inputs)?;
    put_with_retry(store, &features_key(shard), &features)
}

/// Reload a shard's inputs. `None` features mean the feature file was
/// missing, misaligned or malformed for that input and it has to be
/// re-executed to recover its coverage.
pub fn load_corpus(
    store: &dyn BlobStore,
    shard: u32,
) -> Result<Vec<(Vec<u8>, Option<FeatureSet>)>> {
    let inputs = match store.get(&corpus_key(shard))? {
        Some(data) => decode_records(&data).context("decode corpus file")?,
        None => return Ok(vec![]),
    };

    let features = match store.get(&features_key(shard))? {
        Some(data) => match decode_records(&data) {
            Ok(records) if records.len() == inputs.len() => records
                .into_iter()
                .map(|record| FeatureSet::decode(&record).ok())
                .collect(),
            Ok(records) => {
                log::warn!(
                    "feature file for shard {} has {} records, corpus has {}, re-executing",
                    shard,
                    records.len(),
                    inputs.len()
                );
                vec![None; inputs.len()]
            }
            Err(e) => {
                log::warn!("feature file for shard {} is malformed: {}", shard, e);
                vec![None; inputs.len()]
            }
        },
        None => vec![None; inputs.len()],
    };

    Ok(inputs.into_iter().zip(features).collect())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::feature::{Domain, Feature};

    #[test]
    fn directory_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path()).unwrap();

        assert_eq!(store.get("missing").unwrap(), None);

        store.put("blob-a", b"payload").unwrap();
        assert_eq!(store.get("blob-a").unwrap(), Some(b"payload".to_vec()));
    }

    #[test]
    fn list_filters_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path()).unwrap();

        store.put("corpus-0001.bin", b"a").unwrap();
        store.put("corpus-0002.bin", b"b").unwrap();
        store.put("features-0001.bin", b"c").unwrap();

        assert_eq!(
            store.list("corpus-").unwrap(),
            vec!["corpus-0001.bin", "corpus-0002.bin"]
        );
    }

    #[test]
    fn corpus_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path()).unwrap();

        let mut corpus = Corpus::new();
        let features: FeatureSet = [Feature::new(Domain::Edge, 1)].into_iter().collect();
        corpus.consider(b"seed input".to_vec(), features.clone(), 100);

        save_corpus(&mut store, 0, &corpus).unwrap();

        let loaded = load_corpus(&store, 0).unwrap();
        assert_eq!(loaded, vec![(b"seed input".to_vec(), Some(features))]);
    }

    #[test]
    fn missing_feature_file_degrades_to_reexecution() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path()).unwrap();

        let inputs = encode_records([&b"one"[..], b"two"].into_iter()).unwrap();
        store.put(&corpus_key(3), &inputs).unwrap();

        let loaded = load_corpus(&store, 3).unwrap();
        assert_eq!(
            loaded,
            vec![(b"one".to_vec(), None), (b"two".to_vec(), None)]
        );
    }

    #[test]
    fn misaligned_feature_file_degrades_to_reexecution() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = DirectoryStore::new(dir.path()).unwrap();

        let inputs = encode_records([&b"one"[..], b"two"].into_iter()).unwrap();
        store.put(&corpus_key(1), &inputs).unwrap();

        let features: FeatureSet = [Feature::new(Domain::Edge, 1)].into_iter().collect();
        let encoded = features.encode();
        let feature_records = encode_records([encoded.as_slice()].into_iter()).unwrap();
        store.put(&features_key(1), &feature_records).unwrap();

        let loaded = load_corpus(&store, 1).unwrap();
        assert!(loaded.iter().all(|(_, features)| features.is_none()));
    }

    #[test]
    fn truncated_corpus_file_is_an_error() {
        let mut data = encode_records([&b"record"[..]].into_iter()).unwrap();
        data.pop();

        assert!(matches!(
            decode_records(&data),
            Err(CorpusStorageError::Truncated)
        ));
    }

    #[test]
    fn empty_store_loads_empty_corpus() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();

        assert!(load_corpus(&store, 0).unwrap().is_empty());
    }

    struct FlakyStore {
        inner: DirectoryStore,
        failures_left: usize,
    }

    impl BlobStore for FlakyStore {
        fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
            self.inner.get(key)
        }

        fn put(&mut self, key: &str, data: &[u8]) -> Result<()> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                anyhow::bail!("transient storage failure");
            }
            self.inner.put(key, data)
        }

        fn list(&self, prefix: &str) -> Result<Vec<String>> {
            self.inner.list(prefix)
        }
    }

    #[test]
    fn put_retries_transient_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlakyStore {
            inner: DirectoryStore::new(dir.path()).unwrap(),
            failures_left: PUT_RETRY_LIMIT - 1,
        };

        put_with_retry(&mut store, "blob", b"data").unwrap();
        assert_eq!(store.get("blob").unwrap(), Some(b"data".to_vec()));
    }

    #[test]
    fn persistent_put_failure_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FlakyStore {
            inner: DirectoryStore::new(dir.path()).unwrap(),
            failures_left: usize::MAX,
        };

        assert!(matches!(
            put_with_retry(&mut store, "blob", b"data"),
            Err(CorpusStorageError::RetriesExhausted { attempts, .. }) if attempts == PUT_RETRY_LIMIT
        ));
    }
}
