use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FrameRangeError;

/// A 32-byte BLAKE3 hash of file contents.
///
/// Used by the copy engine when checksum verification is requested, to prove
/// that a destination file is byte-identical to its source.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub(crate) struct Hash32([u8; 32]);

impl<T> From<T> for Hash32
where
    T: Into<[u8; 32]>,
{
    fn from(value: T) -> Self {
        Hash32(value.into())
    }
}

impl Hash32 {
    pub(crate) fn hash_file(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        Ok(blake3::Hasher::new().update_mmap(path)?.finalize().into())
    }

    pub(crate) fn to_hex(self) -> String {
        const HEX: &[u8; 16] = b"0123456789abcdef";
        let mut acc = String::with_capacity(64);

        for &byte in self.0.iter() {
            acc.push(HEX[(byte >> 4) as usize] as char);
            acc.push(HEX[(byte & 0xF) as usize] as char);
        }

        acc
    }
}

impl std::fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Hash32({})", self.to_hex())
    }
}

/// The mode in which the archiver is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Copy files and write the final script.
    #[default]
    Archive,
    /// Run the full pipeline but only simulate copying and script output.
    DryRun,
}

/// Shot identity used to build the archive folder structure.
///
/// `season` is optional; when absent the season level is omitted from every
/// generated path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub vendor: String,
    pub show: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub season: Option<String>,
    pub episode: String,
    pub shot: String,
}

/// An inclusive range of frame numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameRange {
    pub start: i64,
    pub end: i64,
}

impl FrameRange {
    pub fn new(start: i64, end: i64) -> Result<Self, FrameRangeError> {
        if end < start {
            return Err(FrameRangeError::Reversed { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn single(frame: i64) -> Self {
        Self {
            start: frame,
            end: frame,
        }
    }

    /// Number of frames, saturating at `u64::MAX` for the full `i64` span.
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            return 0;
        }
        self.end.abs_diff(self.start).saturating_add(1)
    }

    /// Only possible for ranges built from their public fields.
    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn frames(&self) -> impl Iterator<Item = i64> + use<> {
        self.start..=self.end
    }
}

impl std::fmt::Display for FrameRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Parses `"1001-1100"`, `"1050"` and negative frames such as `"-5--1"`.
impl FromStr for FrameRange {
    type Err = FrameRangeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        let invalid = || FrameRangeError::Format(input.to_string());

        // the separator is the first '-' that follows at least one digit
        let body_start = usize::from(text.starts_with('-'));
        let split = text[body_start..]
            .char_indices()
            .find(|&(i, c)| c == '-' && i > 0)
            .map(|(i, _)| i + body_start);

        let (start, end) = match split {
            Some(at) => (&text[..at], &text[at + 1..]),
            None => (text, text),
        };

        let parse = |s: &str| -> Result<i64, FrameRangeError> {
            let digits = s.strip_prefix('-').unwrap_or(s);
            if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            s.parse().map_err(|_| invalid())
        };

        FrameRange::new(parse(start)?, parse(end)?)
    }
}
