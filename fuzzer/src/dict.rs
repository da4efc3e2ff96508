use std::{
    ascii::escape_default,
    fmt::{self, Write},
};

use common::{config::mutation::{DICT_MAX_LEN, DICT_MIN_LEN}, random::SeededRand};
use rand_distr::{Distribution, Uniform};

#[derive(Debug, Default)]
pub struct Dictionary {
    entries: Vec<Entry>,
    distribution: Option<Uniform<usize>>,
}

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Entry(Vec<u8>);

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_char('"')?;

        for c in self
            .0
            .iter()
            .copied()
            .flat_map(escape_default)
            .flat_map(|byte| char::from_u32(byte as u32))
        {
            f.write_char(c)?;
        }

        f.write_char('"')
    }
}

impl AsRef<[u8]> for Entry {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl Dictionary {
    /// externally supplied token, e.g. from a dictionary file
    pub fn add_token(&mut self, token: &[u8]) {
        if token.is_empty() || token.len() > DICT_MAX_LEN {
            return;
        }

        self.entries.push(Entry(token.to_vec()));
        self.rebuild();
    }

    /// scan a seed input for printable ASCII strings worth splicing
    pub fn scan_input(&mut self, input: &[u8]) {
        let mut buffer = vec![];
        let mut heuristic_bad = 0;
        let mut heuristic_good = 0;
        let mut valid = false;

        for (idx, byte) in input.iter().copied().enumerate() {
            // is valid ascii (printable + newline + tab)
            let valid_byte = matches!(byte, b'\r' | b'\n' | b'\t' | 0x20..=0x7e);
            if valid_byte {
                // heuristic for "good" chars
                if byte.is_ascii_alphanumeric()
                    || matches!(byte, b' ' | b'_' | b'-' | b'=' | b'/' | b'.' | b'\'' | b'"')
                {
                    heuristic_good += 1;
                } else if buffer.last() == Some(&b'\r') && byte == b'\n' {
                    // special case: count '\r\n' as one bad char (newline)
                } else {
                    heuristic_bad += 1;
                }

                buffer.push(byte);
                valid = true;
            }

            // add (valid) strings after last byte / invalid next byte
            let last_byte = idx == input.len() - 1;
            if valid && (!valid_byte || last_byte) {
                let entry = Entry(buffer);
                log::trace!("found printable ASCII string: {:?}", entry);

                // string within length limits
                if entry.0.len() >= DICT_MIN_LEN && entry.0.len() <= DICT_MAX_LEN {
                    // string has >=75% "good" chars
                    if heuristic_bad * 3 < heuristic_good {
                        log::debug!("add dict entry: {:?}", entry);
                        self.entries.push(entry);
                    }
                }

                // reset buffer
                buffer = vec![];
                heuristic_bad = 0;
                heuristic_good = 0;
                valid = false;
            }
        }

        self.rebuild();
    }

    fn rebuild(&mut self) {
        self.entries.sort_unstable();
        self.entries.dedup();

        self.distribution = (!self.entries.is_empty()).then(|| Uniform::new(0, self.entries.len()));
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn random_entry(&self, rng: &mut fastrand::Rng) -> Option<&Entry> {
        self.distribution
            .map(|dist| dist.sample(&mut SeededRand(rng)))
            .and_then(|idx| self.entries.get(idx))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn scan_finds_good_strings() {
        let mut dict = Dictionary::default();
        dict.scan_input(b"\x00\x01magic_header\xff\xfeGET /index.html\x00ab\x00");

        let tokens: Vec<&[u8]> = dict.entries.iter().map(AsRef::as_ref).collect();
        assert_eq!(tokens, vec![&b"GET /index.html"[..], &b"magic_header"[..]]);
    }

    #[test]
    fn scan_skips_noise() {
        let mut dict = Dictionary::default();

        // too short, then mostly non-"good" punctuation
        dict.scan_input(b"ab\x00{}[]!!{}[]!!\x00");
        assert!(dict.is_empty());
    }

    #[test]
    fn entries_are_deduplicated() {
        let mut dict = Dictionary::default();
        dict.add_token(b"token");
        dict.add_token(b"token");

        assert_eq!(dict.len(), 1);
    }

    #[test]
    fn random_entry_is_deterministic() {
        let mut dict = Dictionary::default();
        for token in [&b"alpha"[..], b"bravo", b"charlie"] {
            dict.add_token(token);
        }

        let mut a = fastrand::Rng::with_seed(7);
        let mut b = fastrand::Rng::with_seed(7);
        for _ in 0..16 {
            assert_eq!(dict.random_entry(&mut a), dict.random_entry(&mut b));
        }
    }

    #[test]
    fn empty_dictionary_has_no_entry() {
        let dict = Dictionary::default();
        let mut rng = fastrand::Rng::with_seed(0);

        assert!(dict.random_entry(&mut rng).is_none());
    }
}
