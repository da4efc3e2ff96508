use std::cmp;

use anyhow::{Context, Result};
use common::{config::mutation::*, random::SeededRand};
use rand_distr::{Distribution, WeightedAliasIndex};

use crate::dict::Dictionary;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operator {
    FlipBit,
    SetByte,
    InsertBytes,
    EraseBytes,
    CopyPart,
    ShuffleRange,
    Arithmetic,
    InterestingValue,
    DictSplice,
    CrossOver,
}

const OPERATOR_WEIGHTS: [(Operator, usize); 10] = [
    (Operator::FlipBit, 10),
    (Operator::SetByte, 10),
    (Operator::InsertBytes, 10),
    (Operator::EraseBytes, 10),
    (Operator::CopyPart, 10),
    (Operator::ShuffleRange, 5),
    (Operator::Arithmetic, 15),
    (Operator::InterestingValue, 15),
    (Operator::DictSplice, 10),
    (Operator::CrossOver, 5),
];

/// Stacked byte-array mutator. All randomness is drawn from the caller's
/// `fastrand::Rng`, a fixed seed yields a fixed mutation for fixed inputs.
#[derive(Debug)]
pub struct ByteMutator {
    dictionary: Dictionary,
    operators: Vec<Operator>,
    operator_distribution: WeightedAliasIndex<usize>,
    block_size_distribution: WeightedAliasIndex<usize>,
}

impl ByteMutator {
    pub fn new(dictionary: Dictionary) -> Result<Self> {
        let (operators, weights): (Vec<_>, Vec<_>) = OPERATOR_WEIGHTS.into_iter().unzip();

        Ok(Self {
            dictionary,
            operators,
            operator_distribution: WeightedAliasIndex::new(weights)
                .context("Failed to create operator distribution")?,
            block_size_distribution: WeightedAliasIndex::new(BLOCK_SIZES_DISTRIBUTION.to_vec())
                .context("Failed to create block size distribution")?,
        })
    }

    pub fn dictionary_mut(&mut self) -> &mut Dictionary {
        &mut self.dictionary
    }

    /// mutate a copy of `data`, output clamped to `max_len` and never
    /// byte-identical to the input
    pub fn mutate(
        &self,
        data: &[u8],
        cross_over: Option<&[u8]>,
        max_len: usize,
        rng: &mut fastrand::Rng,
    ) -> Vec<u8> {
        if max_len == 0 {
            return vec![];
        }

        let mut out = data.to_vec();
        let count = 1usize << rng.u32(MUTATION_COUNT_POW2);

        for _ in 0..count {
            for _ in 0..MAX_RETRY {
                let operator =
                    self.operators[self.operator_distribution.sample(&mut SeededRand(rng))];
                if self.apply(operator, &mut out, cross_over, rng) {
                    break;
                }
            }
        }

        out.truncate(max_len);

        // stacked operators may cancel out (e.g. the same bit flipped twice)
        if out == data {
            if out.is_empty() || out.len() >= max_len {
                let idx = rng.usize(0..out.len().max(1).min(max_len.max(1)));
                match out.get_mut(idx) {
                    Some(byte) => *byte ^= 1 << rng.u8(0..8),
                    None => out.push(rng.u8(..)),
                }
            } else {
                out.insert(rng.usize(0..=out.len()), rng.u8(..));
            }
        }

        out
    }

    fn apply(
        &self,
        operator: Operator,
        data: &mut Vec<u8>,
        cross_over: Option<&[u8]>,
        rng: &mut fastrand::Rng,
    ) -> bool {
        match operator {
            Operator::FlipBit => flip_bit(data, rng),
            Operator::SetByte => set_byte(data, rng),
            Operator::InsertBytes => self.insert_bytes(data, rng),
            Operator::EraseBytes => self.erase_bytes(data, rng),
            Operator::CopyPart => self.copy_part(data, rng),
            Operator::ShuffleRange => self.shuffle_range(data, rng),
            Operator::Arithmetic => arithmetic(data, rng),
            Operator::InterestingValue => interesting_value(data, rng),
            Operator::DictSplice => self.dict_splice(data, rng),
            Operator::CrossOver => self.cross_over_part(data, cross_over, rng),
        }
    }

    fn random_block_len(&self, min_len: usize, max_len: usize, rng: &mut fastrand::Rng) -> usize {
        // upper block size limit (2^N)
        let block_len_pow2 = BLOCK_SIZES_POW2[self.block_size_distribution.sample(&mut SeededRand(rng))];

        let min_len = min_len.min(max_len);
        let block_len_max = (1usize << block_len_pow2).clamp(min_len, max_len);

        rng.usize(min_len..=block_len_max)
    }

    fn insert_bytes(&self, data: &mut Vec<u8>, rng: &mut fastrand::Rng) -> bool {
        let count = self.random_block_len(1, usize::MAX, rng);
        let index = rng.usize(0..=data.len());

        data.splice(index..index, (0..count).map(|_| rng.u8(..)));
        true
    }

    fn erase_bytes(&self, data: &mut Vec<u8>, rng: &mut fastrand::Rng) -> bool {
        if data.is_empty() {
            return false;
        }

        let count = self.random_block_len(1, data.len(), rng);
        let index = rng.usize(0..data.len());
        let end = cmp::min(index + count, data.len());

        data.drain(index..end);
        true
    }

    /// copy a range elsewhere in the same input, inserting or overwriting
    fn copy_part(&self, data: &mut Vec<u8>, rng: &mut fastrand::Rng) -> bool {
        if data.len() < 2 {
            return false;
        }

        let count = self.random_block_len(1, data.len(), rng);
        let source = rng.usize(0..=(data.len() - count));
        let block = data[source..source + count].to_vec();

        let index = rng.usize(0..=data.len());
        if rng.bool() {
            data.splice(index..index, block);
            true
        } else {
            let end = cmp::min(index + count, data.len());
            if data[index..end] == block[..end - index] {
                return false;
            }
            data.splice(index..end, block[..end - index].iter().copied());
            true
        }
    }

    fn shuffle_range(&self, data: &mut Vec<u8>, rng: &mut fastrand::Rng) -> bool {
        if data.len() < 2 {
            return false;
        }

        let count = self.random_block_len(2, data.len(), rng);
        let index = rng.usize(0..=(data.len() - count));
        let block = &mut data[index..index + count];

        let mut shuffled = false;
        for i in (1..block.len()).rev() {
            let j = rng.usize(0..=i);
            if block[i] != block[j] {
                shuffled = true;
            }
            block.swap(i, j);
        }

        shuffled
    }

    fn dict_splice(&self, data: &mut Vec<u8>, rng: &mut fastrand::Rng) -> bool {
        let entry = match self.dictionary.random_entry(rng) {
            Some(entry) => entry.as_ref().to_vec(),
            None => return false,
        };

        splice_block(data, &entry, rng)
    }

    fn cross_over_part(
        &self,
        data: &mut Vec<u8>,
        cross_over: Option<&[u8]>,
        rng: &mut fastrand::Rng,
    ) -> bool {
        let cross_over = match cross_over {
            Some(cross_over) if !cross_over.is_empty() => cross_over,
            _ => return false,
        };

        let count = self.random_block_len(1, cross_over.len(), rng);
        let source = rng.usize(0..=(cross_over.len() - count));
        let block = cross_over[source..source + count].to_vec();

        splice_block(data, &block, rng)
    }
}

/// insert the block, or overwrite in place when that actually changes bytes
fn splice_block(data: &mut Vec<u8>, block: &[u8], rng: &mut fastrand::Rng) -> bool {
    let index = rng.usize(0..=data.len());

    if rng.bool() {
        data.splice(index..index, block.iter().copied());
        true
    } else {
        let end = cmp::min(index + block.len(), data.len());
        if data[index..end] == block[..end - index] {
            return false;
        }
        data.splice(index..end, block[..end - index].iter().copied());
        true
    }
}

fn flip_bit(data: &mut [u8], rng: &mut fastrand::Rng) -> bool {
    if data.is_empty() {
        return false;
    }

    let index = rng.usize(0..data.len());
    data[index] ^= 1 << rng.u8(0..8);
    true
}

fn set_byte(data: &mut [u8], rng: &mut fastrand::Rng) -> bool {
    if data.is_empty() {
        return false;
    }

    let index = rng.usize(0..data.len());
    let value = rng.u8(..);
    if data[index] == value {
        return false;
    }

    data[index] = value;
    true
}

/// add/sub on a 1/2/4-byte little-endian window
fn arithmetic(data: &mut [u8], rng: &mut fastrand::Rng) -> bool {
    let width = match *data {
        [] => return false,
        [_] => 1,
        [_, _] | [_, _, _] => 1 << rng.u8(0..2),
        _ => 1 << rng.u8(0..3),
    };

    let offset = if rng.bool() {
        rng.i8(1..=10)
    } else {
        rng.i8(-10..=-1)
    } as i64;
    let index = rng.usize(0..=(data.len() - width));
    let window = &mut data[index..index + width];

    match width {
        1 => window[0] = (window[0] as i64).wrapping_add(offset) as u8,
        2 => {
            let value = u16::from_le_bytes([window[0], window[1]]);
            let value = (value as i64).wrapping_add(offset) as u16;
            window.copy_from_slice(&value.to_le_bytes());
        }
        _ => {
            let value = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
            let value = (value as i64).wrapping_add(offset) as u32;
            window.copy_from_slice(&value.to_le_bytes());
        }
    }

    true
}

fn interesting_value(data: &mut [u8], rng: &mut fastrand::Rng) -> bool {
    let width = match *data {
        [] => return false,
        [_] => 1,
        [_, _] | [_, _, _] => 1 << rng.u8(0..2),
        _ => 1 << rng.u8(0..3),
    };

    let index = rng.usize(0..=(data.len() - width));
    let window = &mut data[index..index + width];

    let value: Vec<u8> = match width {
        1 => vec![INTERESTING_VALUES_U8[rng.usize(0..INTERESTING_VALUES_U8.len())]],
        2 => INTERESTING_VALUES_U16[rng.usize(0..INTERESTING_VALUES_U16.len())]
            .to_le_bytes()
            .to_vec(),
        _ => INTERESTING_VALUES_U32[rng.usize(0..INTERESTING_VALUES_U32.len())]
            .to_le_bytes()
            .to_vec(),
    };

    if window == &value[..] {
        return false;
    }

    window.copy_from_slice(&value);
    true
}
