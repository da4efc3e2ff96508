use std::fmt;

use common::FxHashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const PAYLOAD_BITS: u32 = 56;
const PAYLOAD_MASK: u64 = (1 << PAYLOAD_BITS) - 1;

/// A single coverage observation. The high byte carries the domain tag, the
/// remaining 56 bit the domain payload; features from different domains can
/// never collide.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Feature(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Domain {
    Edge,
    IndirectCall,
    Comparison,
    MemoryAccess,
    UserDefined,
}

impl Domain {
    fn tag(self) -> u64 {
        match self {
            Self::Edge => 0,
            Self::IndirectCall => 1,
            Self::Comparison => 2,
            Self::MemoryAccess => 3,
            Self::UserDefined => 4,
        }
    }

    fn from_tag(tag: u64) -> Option<Self> {
        Some(match tag {
            0 => Self::Edge,
            1 => Self::IndirectCall,
            2 => Self::Comparison,
            3 => Self::MemoryAccess,
            4 => Self::UserDefined,
            _ => return None,
        })
    }
}

impl Feature {
    /// payload wider than 56 bit is clamped into the domain's value space
    pub fn new(domain: Domain, payload: u64) -> Self {
        Self((domain.tag() << PAYLOAD_BITS) | (payload & PAYLOAD_MASK))
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    /// `None` for values whose domain tag no known domain claims
    pub fn domain(self) -> Option<Domain> {
        Domain::from_tag(self.0 >> PAYLOAD_BITS)
    }

    pub fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }
}

impl fmt::Debug for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.domain() {
            Some(domain) => write!(f, "Feature({:?}, {:#x})", domain, self.payload()),
            None => write!(f, "Feature({:#x})", self.0),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FeatureDecodeError {
    #[error("feature data truncated")]
    Truncated,
    #[error("trailing bytes after feature data")]
    TrailingBytes,
    #[error("varint overflows 64 bit")]
    VarintOverflow,
    #[error("duplicate feature value")]
    Duplicate,
}

/// Unordered set of unique features with a canonical wire encoding: element
/// count, smallest value, then successor deltas over the sorted values, all
/// as LEB128 varints. The encoding is injective, equal sets encode to equal
/// bytes.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet {
    features: FxHashSet<Feature>,
}

impl FeatureSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, feature: Feature) -> bool {
        self.features.insert(feature)
    }

    pub fn contains(&self, feature: &Feature) -> bool {
        self.features.contains(feature)
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.features.iter()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut sorted: Vec<u64> = self.features.iter().map(|feature| feature.0).collect();
        sorted.sort_unstable();

        let mut data = vec![];
        write_varint(&mut data, sorted.len() as u64);

        let mut previous = None;
        for value in sorted {
            match previous {
                None => write_varint(&mut data, value),
                // sorted + unique, the delta is always non-zero
                Some(previous) => write_varint(&mut data, value - previous),
            }
            previous = Some(value);
        }

        data
    }

    pub fn decode(data: &[u8]) -> Result<Self, FeatureDecodeError> {
        let mut cursor = 0;
        let count = read_varint(data, &mut cursor)?;

        let mut features = FxHashSet::default();
        let mut previous: Option<u64> = None;
        for _ in 0..count {
            let value = match previous {
                None => read_varint(data, &mut cursor)?,
                Some(previous) => {
                    let delta = read_varint(data, &mut cursor)?;
                    if delta == 0 {
                        return Err(FeatureDecodeError::Duplicate);
                    }
                    previous
                        .checked_add(delta)
                        .ok_or(FeatureDecodeError::VarintOverflow)?
                }
            };

            features.insert(Feature(value));
            previous = Some(value);
        }

        if cursor != data.len() {
            return Err(FeatureDecodeError::TrailingBytes);
        }

        Ok(Self { features })
    }
}

impl FromIterator<Feature> for FeatureSet {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self {
            features: iter.into_iter().collect(),
        }
    }
}

fn write_varint(data: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;

        if value == 0 {
            data.push(byte);
            return;
        }
        data.push(byte | 0x80);
    }
}

fn read_varint(data: &[u8], cursor: &mut usize) -> Result<u64, FeatureDecodeError> {
    let mut value = 0u64;
    let mut shift = 0u32;

    loop {
        let byte = *data.get(*cursor).ok_or(FeatureDecodeError::Truncated)?;
        *cursor += 1;

        let bits = (byte & 0x7f) as u64;
        if shift >= 64 || (shift == 63 && bits > 1) {
            return Err(FeatureDecodeError::VarintOverflow);
        }
        value |= bits << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn set(values: &[u64]) -> FeatureSet {
        values.iter().copied().map(Feature::from_raw).collect()
    }

    #[test]
    fn domains_are_disjoint() {
        let payload = 0x1234_5678;

        let edge = Feature::new(Domain::Edge, payload);
        let cmp = Feature::new(Domain::Comparison, payload);

        assert_ne!(edge, cmp);
        assert_eq!(edge.domain(), Some(Domain::Edge));
        assert_eq!(cmp.domain(), Some(Domain::Comparison));
        assert_eq!(edge.payload(), payload);
    }

    #[test]
    fn wide_payload_is_clamped() {
        let feature = Feature::new(Domain::UserDefined, u64::MAX);

        assert_eq!(feature.domain(), Some(Domain::UserDefined));
        assert_eq!(feature.payload(), (1 << 56) - 1);
    }

    #[test]
    fn encode_decode_roundtrip() {
        for values in [
            vec![],
            vec![0],
            vec![u64::MAX],
            vec![1, 2, 3],
            vec![0x42, 0xffff_ffff, 1 << 60, u64::MAX],
            (0..500).map(|i| i * i * 7919).collect(),
        ] {
            let original = set(&values);
            let decoded = FeatureSet::decode(&original.encode()).unwrap();
            assert_eq!(decoded, original);
        }
    }

    #[test]
    fn encoding_is_canonical() {
        // insertion order must not leak into the encoding
        let a = set(&[10, 20, 30]);
        let b = set(&[30, 10, 20]);

        assert_eq!(a.encode(), b.encode());
    }

    #[test]
    fn truncated_data_is_rejected() {
        let mut data = set(&[100, 200, 300]).encode();
        data.pop();

        assert_eq!(FeatureSet::decode(&data), Err(FeatureDecodeError::Truncated));
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut data = set(&[100, 200]).encode();
        data.push(0);

        assert_eq!(
            FeatureSet::decode(&data),
            Err(FeatureDecodeError::TrailingBytes)
        );
    }

    #[test]
    fn zero_delta_is_rejected() {
        // count 2, first value 5, delta 0 (a duplicate)
        let data = vec![2, 5, 0];

        assert_eq!(FeatureSet::decode(&data), Err(FeatureDecodeError::Duplicate));
    }

    #[test]
    fn varint_overflow_is_rejected() {
        // count 1, then 10 continuation bytes pushing past 64 bit
        let mut data = vec![1];
        data.extend([0xff; 9]);
        data.push(0x7f);

        assert_eq!(
            FeatureSet::decode(&data),
            Err(FeatureDecodeError::VarintOverflow)
        );
    }

    #[test]
    fn delta_sum_overflow_is_rejected() {
        // count 2, first value u64::MAX, delta 1
        let mut data = vec![2];
        super::write_varint(&mut data, u64::MAX);
        data.push(1);

        assert_eq!(
            FeatureSet::decode(&data),
            Err(FeatureDecodeError::VarintOverflow)
        );
    }
}
