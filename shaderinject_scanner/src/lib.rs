//! Masked byte signatures and a single-pattern scanner.
//!
//! Patterns are written as space separated words, each either two hex digits or a
//! wildcard (`?` or `??`):
//!
//! ```
//! use shaderinject_scanner::{pattern, scan};
//!
//! let p = pattern!("48 8B ? 18 C3");
//! assert_eq!(scan(&p, b"\x90\x48\x8B\x05\x18\xC3"), Some(1));
//! ```
//!
//! `pattern!` parses its argument during constant evaluation, so a malformed
//! signature is rejected by the compiler:
//!
//! ```compile_fail
//! let p = shaderinject_scanner::pattern!("48 8B ?A");
//! ```

use std::{fmt::Display, ops::Range};

use anyhow::{bail, Error, Result};

/// Width of one candidate block. Each block produces a 32 bit candidate mask.
const BLOCK: usize = 32;

#[derive(Clone, Eq, PartialEq, Hash)]
pub struct Pattern {
    pub sig: Vec<u8>,
    pub mask: Vec<u8>,
}

impl TryFrom<String> for Pattern {
    type Error = Error;
    fn try_from(string: String) -> Result<Self, <Self as TryFrom<String>>::Error> {
        Self::new(string)
    }
}
impl TryFrom<&str> for Pattern {
    type Error = Error;
    fn try_from(string: &str) -> Result<Self, <Self as TryFrom<&str>>::Error> {
        Self::new(string)
    }
}

const fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

const fn is_space(c: u8) -> bool {
    matches!(c, b' ' | b'\t' | b'\n' | b'\r')
}

/// Parse `s[start..end]` into `(sig, mask)`.
const fn parse_word(s: &[u8], start: usize, end: usize) -> Option<(u8, u8)> {
    match end - start {
        1 if s[start] == b'?' => Some((0, 0)),
        2 if s[start] == b'?' && s[start + 1] == b'?' => Some((0, 0)),
        2 => match (hex_digit(s[start]), hex_digit(s[start + 1])) {
            (Some(hi), Some(lo)) => Some(((hi << 4) | lo, 0xff)),
            _ => None,
        },
        _ => None,
    }
}

/// Bounds of the next word at or after `i`.
const fn next_word(s: &[u8], mut i: usize) -> Option<(usize, usize)> {
    while i < s.len() && is_space(s[i]) {
        i += 1;
    }
    if i == s.len() {
        return None;
    }
    let start = i;
    while i < s.len() && !is_space(s[i]) {
        i += 1;
    }
    Some((start, i))
}

/// Number of bytes matched by `pattern`. Panics on a malformed pattern, which
/// becomes a compile error when evaluated through [`pattern!`].
#[doc(hidden)]
pub const fn count_words(pattern: &str) -> usize {
    let s = pattern.as_bytes();
    let mut count = 0;
    let mut i = 0;
    while let Some((start, end)) = next_word(s, i) {
        if parse_word(s, start, end).is_none() {
            panic!("bad pattern word: expected two hex digits, `?` or `??`");
        }
        count += 1;
        i = end;
    }
    if count == 0 {
        panic!("pattern must match at least one byte");
    }
    count
}

#[doc(hidden)]
pub const fn parse_words<const N: usize>(pattern: &str) -> ([u8; N], [u8; N]) {
    let s = pattern.as_bytes();
    let mut sig = [0; N];
    let mut mask = [0; N];
    let mut n = 0;
    let mut i = 0;
    while let Some((start, end)) = next_word(s, i) {
        match parse_word(s, start, end) {
            Some((v, m)) if n < N => {
                sig[n] = v;
                mask[n] = m;
            }
            _ => panic!("bad pattern word"),
        }
        n += 1;
        i = end;
    }
    if n != N {
        panic!("pattern length mismatch");
    }
    (sig, mask)
}

/// Compile a pattern literal at build time.
#[macro_export]
macro_rules! pattern {
    ($pattern:expr) => {{
        const WORDS: usize = $crate::count_words($pattern);
        const PARSED: ([u8; WORDS], [u8; WORDS]) = $crate::parse_words::<WORDS>($pattern);
        $crate::Pattern::from_parts(&PARSED.0, &PARSED.1)
    }};
}

impl Pattern {
    pub fn new<S: AsRef<str>>(s: S) -> Result<Self> {
        let mut sig = vec![];
        let mut mask = vec![];

        for w in s.as_ref().split_whitespace() {
            if let Some((s, m)) = parse_word(w.as_bytes(), 0, w.len()) {
                sig.push(s);
                mask.push(m);
            } else {
                bail!("bad pattern word \"{}\"", w)
            }
        }
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }

        Ok(Self { sig, mask })
    }
    /// Build from already parsed signature and mask (mask `0xff` = exact, `0` = wildcard).
    pub fn from_parts(sig: &[u8], mask: &[u8]) -> Self {
        assert_eq!(sig.len(), mask.len(), "signature and mask differ in length");
        Self {
            sig: sig.to_vec(),
            mask: mask.to_vec(),
        }
    }
    /// Create a pattern from a literal `Vec<u8>` with `mask` filled with 0xff.
    pub fn from_bytes(sig: Vec<u8>) -> Result<Self> {
        if sig.is_empty() {
            bail!("pattern must match at least one byte");
        }
        Ok(Self {
            mask: vec![0xff; sig.len()],
            sig,
        })
    }
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.sig.len()
    }
    pub fn is_wildcard(&self, index: usize) -> bool {
        self.mask[index] == 0
    }
    pub fn iter(&self) -> std::iter::Zip<std::slice::Iter<u8>, std::slice::Iter<u8>> {
        self.sig.iter().zip(&self.mask)
    }
    /// Full verification of the pattern at `data[index..]`, wildcards included.
    #[inline(always)]
    pub fn is_match(&self, data: &[u8], index: usize) -> bool {
        let Some(window) = data.get(index..index + self.len()) else {
            return false;
        };
        window
            .iter()
            .zip(self.iter())
            .all(|(byte, (sig, mask))| byte & mask == *sig)
    }
    /// Longest contiguous run of non-wildcard bytes, the first one on ties.
    /// Empty if every byte is a wildcard.
    pub fn longest_run(&self) -> Range<usize> {
        let mut best = 0..0;
        let mut i = 0;
        while i < self.len() {
            if self.is_wildcard(i) {
                i += 1;
                continue;
            }
            let start = i;
            while i < self.len() && !self.is_wildcard(i) {
                i += 1;
            }
            if i - start > best.len() {
                best = start..i;
            }
        }
        best
    }
}

impl Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (sig, mask)) in self.iter().enumerate() {
            if i != 0 {
                write!(f, " ")?;
            }
            if *mask == 0 {
                write!(f, "??")?;
            } else {
                write!(f, "{:02X}", sig)?;
            }
        }
        Ok(())
    }
}
impl std::fmt::Debug for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Pattern(\"{self}\")")
    }
}

#[cfg(any(target_arch = "x86_64", all(target_arch = "x86", target_feature = "sse2")))]
#[inline(always)]
fn block_mask(data: &[u8], head_at: usize, tail_at: usize, head: u8, tail: u8) -> u32 {
    #[cfg(target_arch = "x86")]
    use std::arch::x86::*;
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::*;

    let heads = &data[head_at..head_at + BLOCK];
    let tails = &data[tail_at..tail_at + BLOCK];

    // SAFETY: both slices are BLOCK bytes long and the loads are unaligned
    unsafe {
        let head = _mm_set1_epi8(head as i8);
        let tail = _mm_set1_epi8(tail as i8);
        let half = |offset: usize| {
            let h = _mm_loadu_si128(heads.as_ptr().add(offset) as *const __m128i);
            let t = _mm_loadu_si128(tails.as_ptr().add(offset) as *const __m128i);
            let eq = _mm_and_si128(_mm_cmpeq_epi8(head, h), _mm_cmpeq_epi8(tail, t));
            (_mm_movemask_epi8(eq) as u32) & 0xffff
        };
        half(0) | (half(16) << 16)
    }
}

#[cfg(not(any(target_arch = "x86_64", all(target_arch = "x86", target_feature = "sse2"))))]
#[inline(always)]
fn block_mask(data: &[u8], head_at: usize, tail_at: usize, head: u8, tail: u8) -> u32 {
    let heads = &data[head_at..head_at + BLOCK];
    let tails = &data[tail_at..tail_at + BLOCK];
    heads
        .iter()
        .zip(tails)
        .enumerate()
        .fold(0, |mask, (i, (h, t))| {
            mask | (((*h == head) & (*t == tail)) as u32) << i
        })
}

/// Find the first offset in `data` where `pattern` matches.
///
/// Candidates come from the head and tail byte of the longest exact run of the
/// pattern and every candidate is verified against the full pattern.
pub fn scan(pattern: &Pattern, data: &[u8]) -> Option<usize> {
    let len = pattern.len();
    if len > data.len() {
        return None;
    }
    let run = pattern.longest_run();
    if run.is_empty() {
        return Some(0);
    }

    // last valid start of the whole pattern
    let last = data.len() - len;
    let head = pattern.sig[run.start];
    let tail = pattern.sig[run.end - 1];

    if run.len() == 1 {
        return memchr::memchr_iter(head, &data[run.start..=run.start + last])
            .find(|&i| pattern.is_match(data, i));
    }

    let mut pos = 0;
    while pos + BLOCK <= last + 1 {
        let mut mask = block_mask(data, pos + run.start, pos + run.end - 1, head, tail);
        while mask != 0 {
            let bit = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            if pattern.is_match(data, pos + bit) {
                return Some(pos + bit);
            }
        }
        pos += BLOCK;
    }

    (pos..=last).find(|&i| pattern.is_match(data, i))
}

#[cfg(test)]
mod test {
    use super::*;
    use rand::prelude::*;

    fn naive(pattern: &Pattern, data: &[u8]) -> Option<usize> {
        (0..(data.len() + 1).saturating_sub(pattern.len())).find(|&i| pattern.is_match(data, i))
    }

    #[test]
    fn test_parse_word() {
        assert_eq!(Some((0xff, 0xff)), parse_word(b"ff", 0, 2));
        assert_eq!(Some((0x4c, 0xff)), parse_word(b"4C", 0, 2));
        assert_eq!(Some((0, 0)), parse_word(b"?", 0, 1));
        assert_eq!(Some((0, 0)), parse_word(b"??", 0, 2));
        assert_eq!(None, parse_word(b"?f", 0, 2));
        assert_eq!(None, parse_word(b"0?", 0, 2));
        assert_eq!(None, parse_word(b"z0", 0, 2));
        assert_eq!(None, parse_word(b"0", 0, 1));
        assert_eq!(None, parse_word(b"000", 0, 3));
        assert_eq!(None, parse_word(b"???", 0, 3));
    }

    #[test]
    fn test_build_pattern() {
        assert!(Pattern::new("?? ??").is_ok());
        assert!(Pattern::new("").is_err());
        assert!(Pattern::new("   ").is_err());
        assert!(Pattern::new("48 8B ?A").is_err());
        assert!(Pattern::new("48 8B5").is_err());
        assert_eq!(
            Pattern {
                sig: vec![0x10, 0, 0xc3],
                mask: vec![0xff, 0, 0xff],
            },
            Pattern::new("10 ? C3").unwrap()
        );
    }

    #[test]
    fn test_const_pattern() {
        let p = pattern!("FF 50 68 85 C0 0F 89 ? ? ? ? 49");
        assert_eq!(p, Pattern::new("FF 50 68 85 C0 0F 89 ?? ?? ?? ?? 49").unwrap());
        assert_eq!(12, p.len());
    }

    #[test]
    fn test_display_pattern() {
        assert_eq!(Pattern::new("12 34 56").unwrap().to_string(), "12 34 56");
        assert_eq!(Pattern::new("12 ? 5a").unwrap().to_string(), "12 ?? 5A");
        assert_eq!(
            format!("{:?}", Pattern::new("?? 01").unwrap()),
            "Pattern(\"?? 01\")"
        );
    }

    #[test]
    fn test_longest_run() {
        assert_eq!(0..0, Pattern::new("?? ??").unwrap().longest_run());
        assert_eq!(0..1, Pattern::new("01").unwrap().longest_run());
        assert_eq!(3..6, Pattern::new("01 02 ? 03 04 05 ? 06").unwrap().longest_run());
        // ties resolve to the first run
        assert_eq!(0..2, Pattern::new("01 02 ? 03 04").unwrap().longest_run());
    }

    #[test]
    fn test_wildcard_only() {
        let p = Pattern::new("? ? ?").unwrap();
        assert_eq!(Some(0), scan(&p, &[9, 8, 7, 6]));
        assert_eq!(Some(0), scan(&p, &[9, 8, 7]));
        assert_eq!(None, scan(&p, &[9, 8]));
    }

    #[test]
    fn test_scan_first_match() {
        let p = Pattern::new("01").unwrap();
        let data = vec![1; 96];
        for i in 0..32 {
            assert_eq!(Some(0), scan(&p, &data[i..]));
        }

        // every combination of block boundaries
        let p = Pattern::new("01 02").unwrap();
        let data: Vec<u8> = std::iter::repeat([1, 2, 3]).take(32).flatten().collect();
        for i in 0..64 {
            let expected = (3 - (i % 3)) % 3;
            assert_eq!(Some(expected), scan(&p, &data[i..]));
        }
    }

    #[test]
    fn test_scan_no_match() {
        let p = Pattern::new("AA ? BB").unwrap();
        assert_eq!(None, scan(&p, &[0; 1000]));
        assert_eq!(None, scan(&p, &[]));
        // head and tail present but the middle exact byte differs
        let p = Pattern::new("AA 01 BB").unwrap();
        let mut data = vec![0; 200];
        data[100..103].copy_from_slice(&[0xaa, 0x02, 0xbb]);
        assert_eq!(None, scan(&p, &data));
    }

    #[test]
    fn test_scan_round_trip() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        for _ in 0..200 {
            let len = rng.gen_range(1..24);
            let words: Vec<String> = (0..len)
                .map(|_| {
                    if rng.gen_bool(0.25) {
                        "?".to_string()
                    } else {
                        format!("{:02X}", rng.gen::<u8>())
                    }
                })
                .collect();
            let pattern = Pattern::new(words.join(" ")).unwrap();

            let size = rng.gen_range(len..400);
            // bytes that never equal any concrete pattern byte make the only hit our own
            let filler = (0..=255u8)
                .find(|b| !pattern.iter().any(|(s, m)| *m != 0 && s == b))
                .unwrap();
            let mut data = vec![filler; size];
            let offset = rng.gen_range(0..=size - len);
            for (i, (sig, mask)) in pattern.iter().enumerate() {
                if *mask != 0 {
                    data[offset + i] = *sig;
                }
            }

            let found = scan(&pattern, &data);
            assert_eq!(naive(&pattern, &data), found, "{pattern}");
            if pattern.longest_run().is_empty() {
                assert_eq!(Some(0), found);
            } else {
                assert_eq!(Some(offset), found, "{pattern}");
            }
        }
    }

    #[test]
    fn test_scan_matches_naive_on_noise() {
        let mut rng = StdRng::seed_from_u64(42);
        let data: Vec<u8> = (0..4096).map(|_| rng.gen_range(0..4)).collect();
        for pattern in ["01 02", "00 ? 03", "03 03 ? ? 00 01", "? 02 ? ? 01 ?", "02"] {
            let pattern = Pattern::new(pattern).unwrap();
            assert_eq!(naive(&pattern, &data), scan(&pattern, &data), "{pattern}");
        }
    }

    #[test]
    fn test_anchor_choice_does_not_change_result() {
        // two runs of equal length; the first is the anchor, the second must still be verified
        let a = Pattern::new("10 11 ? 20 21").unwrap();
        let b = Pattern::new("10 11 ? 20 22").unwrap();
        let mut data = vec![0; 128];
        data[70..75].copy_from_slice(&[0x10, 0x11, 0x99, 0x20, 0x21]);
        assert_eq!(Some(70), scan(&a, &data));
        assert_eq!(None, scan(&b, &data));
    }
}
