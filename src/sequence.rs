//! Frame sequence patterns.
//!
//! A file reference is a sequence when its file name carries a padding token:
//!
//! | token          | digits               |
//! |----------------|----------------------|
//! | `%0Nd`, `%Nd`  | `N`                  |
//! | `%d`           | 4                    |
//! | `###`          | one per `#`          |
//! | `$FN`          | `N`                  |
//! | `$F`           | 4                    |
//!
//! Only the first token of the file name counts, tokens in directory names are
//! taken literally.

use std::fmt;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::FrameRange;

const DEFAULT_WIDTH: usize = 4;

/// A file path with a frame number placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SequencePattern {
    /// Everything before the token, including the directory.
    prefix: String,
    token: String,
    suffix: String,
    width: usize,
}

impl SequencePattern {
    /// Returns `None` when `path` has no padding token.
    pub fn detect(path: &str) -> Option<Self> {
        let name_start = path.rfind('/').map_or(0, |i| i + 1);
        let name = &path[name_start..];

        let (start, end, width) = find_printf(name)
            .or_else(|| find_hashes(name))
            .or_else(|| find_houdini(name))?;

        Some(Self {
            prefix: path[..name_start + start].to_string(),
            token: name[start..end].to_string(),
            suffix: name[end..].to_string(),
            width,
        })
    }

    /// Number of digits a frame number is padded to.
    pub fn width(&self) -> usize {
        self.width
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// The pattern itself, token included.
    pub fn as_path(&self) -> Utf8PathBuf {
        Utf8PathBuf::from(self.to_string())
    }

    /// Concrete path of a single frame.
    pub fn frame(&self, frame: i64) -> Utf8PathBuf {
        let width = self.width;
        Utf8PathBuf::from(format!("{}{frame:0width$}{}", self.prefix, self.suffix))
    }

    /// Searches the pattern's directory for frames with exactly `width` digits
    /// and returns the span from the lowest to the highest one found.
    pub fn scan_range(&self) -> Option<FrameRange> {
        let digits = "[0-9]".repeat(self.width);
        let pattern = format!(
            "{}{digits}{}",
            glob::Pattern::escape(&self.prefix),
            glob::Pattern::escape(&self.suffix)
        );

        let paths = match glob::glob(&pattern) {
            Ok(paths) => paths,
            Err(err) => {
                tracing::debug!(%pattern, %err, "invalid sequence scan pattern");
                return None;
            }
        };

        let frames = paths
            .filter_map(Result::ok)
            .filter_map(|path| {
                let path = path.to_str()?.replace('\\', "/");
                let number = path.strip_prefix(&self.prefix)?.strip_suffix(&self.suffix)?;
                number.parse::<i64>().ok()
            });

        let (min, max) = frames.fold(None, |acc: Option<(i64, i64)>, f| match acc {
            Some((lo, hi)) => Some((lo.min(f), hi.max(f))),
            None => Some((f, f)),
        })?;

        tracing::debug!(pattern = %self, min, max, "scanned sequence on disk");
        FrameRange::new(min, max).ok()
    }

    /// The file name portion of the pattern, token included.
    pub fn file_name(&self) -> String {
        let path = self.to_string();
        Utf8Path::new(&path).file_name().unwrap_or_default().to_string()
    }

    /// The file name with the token spelled as hashes, so patterns naming
    /// the same frames compare equal whatever token they use.
    pub fn normalized_file_name(&self) -> String {
        let name_start = self.prefix.rfind('/').map_or(0, |i| i + 1);
        format!("{}{}{}", &self.prefix[name_start..], "#".repeat(self.width), self.suffix)
    }
}

impl fmt::Display for SequencePattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{}", self.prefix, self.token, self.suffix)
    }
}

/// `%d`, `%4d`, `%04d`
fn find_printf(name: &str) -> Option<(usize, usize, usize)> {
    let bytes = name.as_bytes();

    for (start, _) in name.match_indices('%') {
        let mut i = start + 1;
        while i < bytes.len() && bytes[i] == b'0' {
            i += 1;
        }
        let digits_start = i;
        while i < bytes.len() && bytes[i].is_ascii_digit() {
            i += 1;
        }
        if i < bytes.len() && bytes[i] == b'd' {
            let width = name[digits_start..i].parse().unwrap_or(DEFAULT_WIDTH);
            return Some((start, i + 1, width.max(1)));
        }
    }

    None
}

/// `####`
fn find_hashes(name: &str) -> Option<(usize, usize, usize)> {
    let start = name.find('#')?;
    let width = name[start..].bytes().take_while(|&b| b == b'#').count();
    Some((start, start + width, width))
}

/// `$F`, `$F4`
fn find_houdini(name: &str) -> Option<(usize, usize, usize)> {
    let start = name.find("$F")?;
    let digits = name[start + 2..]
        .bytes()
        .take_while(u8::is_ascii_digit)
        .count();
    let width = match digits {
        0 => DEFAULT_WIDTH,
        _ => name[start + 2..start + 2 + digits]
            .parse()
            .unwrap_or(DEFAULT_WIDTH),
    };
    Some((start, start + 2 + digits, width.max(1)))
}
