//! Text patches for cell content.
//!
//! Cell content updates travel as diff-match-patch patch text:
//!
//! ```text
//! @@ -1,8 +1,9 @@
//!  print(
//! -1
//! +42
//!  )
//! ```
//!
//! Each hunk is a list of context (` `), delete (`-`) and insert (`+`)
//! segments whose text is URI-escaped. Positions count Unicode scalar
//! values. Hunks are applied in order; a hunk whose old text cannot be
//! found means the local copy diverged from the server's, and the caller
//! resyncs instead of guessing.

use std::fmt::{self, Write as _};

/// Context characters kept around a generated hunk.
const PATCH_MARGIN: usize = 4;

/// Characters left unescaped when encoding patch text.
const UNESCAPED: &str = "!~*'();/?:@&=+$,# -_.";

/// Failure to parse or apply a patch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PatchError {
    /// Patch text is not in diff-match-patch format.
    #[error("malformed patch at line {line}: {reason}")]
    Malformed {
        /// 1-based line number in the patch text.
        line: usize,
        /// What was wrong.
        reason: String,
    },
    /// A hunk's expected text was not found in the target.
    #[error("hunk {hunk} does not match the current text")]
    NoMatch {
        /// 0-based hunk index.
        hunk: usize,
    },
}

/// One segment of a hunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Text present before and after.
    Equal(String),
    /// Text removed.
    Delete(String),
    /// Text added.
    Insert(String),
}

/// One `@@ ... @@` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 0-based position of the hunk in the old text.
    pub start: usize,
    /// Ordered segments.
    pub segments: Vec<Segment>,
}

impl Hunk {
    fn old_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Equal(text) | Segment::Delete(text) => Some(text.as_str()),
                Segment::Insert(_) => None,
            })
            .collect()
    }

    fn new_text(&self) -> String {
        self.segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Equal(text) | Segment::Insert(text) => Some(text.as_str()),
                Segment::Delete(_) => None,
            })
            .collect()
    }
}

/// Parsed patch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextPatch {
    hunks: Vec<Hunk>,
}

impl TextPatch {
    /// Hunks in application order.
    pub fn hunks(&self) -> &[Hunk] {
        &self.hunks
    }

    /// Patch with no hunks.
    pub fn is_empty(&self) -> bool {
        self.hunks.is_empty()
    }

    /// Parse diff-match-patch patch text.
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        let mut hunks: Vec<Hunk> = Vec::new();

        for (index, line) in text.split('\n').enumerate() {
            let line_no = index + 1;
            if line.is_empty() {
                continue;
            }
            let malformed = |reason: &str| PatchError::Malformed {
                line: line_no,
                reason: reason.to_string(),
            };

            if line.starts_with("@@") {
                hunks.push(Hunk {
                    start: parse_header(line).ok_or_else(|| malformed("bad hunk header"))?,
                    segments: Vec::new(),
                });
                continue;
            }

            let hunk = hunks
                .last_mut()
                .ok_or_else(|| malformed("segment before first hunk header"))?;
            let mut chars = line.chars();
            let sign = chars.next();
            let body = unescape(chars.as_str()).ok_or_else(|| malformed("bad escape sequence"))?;
            let segment = match sign {
                Some(' ') => Segment::Equal(body),
                Some('-') => Segment::Delete(body),
                Some('+') => Segment::Insert(body),
                _ => return Err(malformed("unknown segment marker")),
            };
            hunk.segments.push(segment);
        }

        Ok(Self { hunks })
    }

    /// Apply every hunk to `text`.
    ///
    /// A hunk is placed at its recorded position, shifted by the net length
    /// change of earlier hunks. If the old text is not there, the nearest
    /// exact occurrence is used instead. No match at all is an error and
    /// `text` is left untouched (the result is built separately).
    pub fn apply(&self, text: &str) -> Result<String, PatchError> {
        let mut current: Vec<char> = text.chars().collect();
        let mut drift: isize = 0;

        for (index, hunk) in self.hunks.iter().enumerate() {
            let old: Vec<char> = hunk.old_text().chars().collect();
            let new: Vec<char> = hunk.new_text().chars().collect();
            let expected = hunk.start.saturating_add_signed(drift);

            let at = locate(&current, &old, expected).ok_or(PatchError::NoMatch { hunk: index })?;
            current.splice(at..at + old.len(), new.iter().copied());
            drift += signed_len(new.len()) - signed_len(old.len());
        }

        Ok(current.into_iter().collect())
    }

    /// Single-hunk patch turning `old` into `new`.
    ///
    /// Keeps up to four characters of context on each side of the changed
    /// region, like diff-match-patch does for small edits.
    pub fn between(old: &str, new: &str) -> Self {
        let old_chars: Vec<char> = old.chars().collect();
        let new_chars: Vec<char> = new.chars().collect();

        let prefix = old_chars
            .iter()
            .zip(&new_chars)
            .take_while(|(a, b)| a == b)
            .count();
        let max_suffix = old_chars.len().min(new_chars.len()) - prefix;
        let suffix = old_chars
            .iter()
            .rev()
            .zip(new_chars.iter().rev())
            .take(max_suffix)
            .take_while(|(a, b)| a == b)
            .count();

        if prefix == old_chars.len() && prefix == new_chars.len() {
            return Self::default();
        }

        let lead = prefix.saturating_sub(PATCH_MARGIN);
        let trail_old = (old_chars.len() - suffix + PATCH_MARGIN).min(old_chars.len());

        let collect = |chars: &[char]| chars.iter().collect::<String>();
        let mut segments = Vec::new();
        if lead < prefix {
            segments.push(Segment::Equal(collect(&old_chars[lead..prefix])));
        }
        if prefix < old_chars.len() - suffix {
            segments.push(Segment::Delete(collect(&old_chars[prefix..old_chars.len() - suffix])));
        }
        if prefix < new_chars.len() - suffix {
            segments.push(Segment::Insert(collect(&new_chars[prefix..new_chars.len() - suffix])));
        }
        if old_chars.len() - suffix < trail_old {
            segments.push(Segment::Equal(collect(&old_chars[old_chars.len() - suffix..trail_old])));
        }

        Self {
            hunks: vec![Hunk {
                start: lead,
                segments,
            }],
        }
    }
}

impl fmt::Display for TextPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut drift: isize = 0;
        for hunk in &self.hunks {
            let old_len = hunk.old_text().chars().count();
            let new_len = hunk.new_text().chars().count();
            let new_start = hunk.start.saturating_add_signed(drift);
            writeln!(
                f,
                "@@ -{} +{} @@",
                format_range(hunk.start, old_len),
                format_range(new_start, new_len)
            )?;
            for segment in &hunk.segments {
                let (sign, text) = match segment {
                    Segment::Equal(text) => (' ', text),
                    Segment::Delete(text) => ('-', text),
                    Segment::Insert(text) => ('+', text),
                };
                writeln!(f, "{sign}{}", escape(text))?;
            }
            drift += signed_len(new_len) - signed_len(old_len);
        }
        Ok(())
    }
}

fn signed_len(len: usize) -> isize {
    isize::try_from(len).unwrap_or(isize::MAX)
}

/// Start of the old range from `@@ -start[,len] +start[,len] @@`, 0-based.
fn parse_header(line: &str) -> Option<usize> {
    let inner = line.strip_prefix("@@ -")?.strip_suffix(" @@")?;
    let (old, new) = inner.split_once(" +")?;
    let old_start = parse_range(old)?;
    parse_range(new)?;
    Some(old_start)
}

fn parse_range(range: &str) -> Option<usize> {
    match range.split_once(',') {
        // Empty ranges record the position before the gap, already 0-based.
        Some((start, "0")) => start.parse().ok(),
        Some((start, len)) => {
            len.parse::<usize>().ok()?;
            start.parse::<usize>().ok()?.checked_sub(1)
        }
        None => range.parse::<usize>().ok()?.checked_sub(1),
    }
}

fn format_range(start: usize, len: usize) -> String {
    match len {
        0 => format!("{start},0"),
        1 => format!("{}", start + 1),
        _ => format!("{},{}", start + 1, len),
    }
}

/// Index of the occurrence of `needle` in `haystack` closest to `expected`.
fn locate(haystack: &[char], needle: &[char], expected: usize) -> Option<usize> {
    if needle.is_empty() {
        return Some(expected.min(haystack.len()));
    }
    if needle.len() > haystack.len() {
        return None;
    }
    let matches_at = |at: usize| haystack[at..at + needle.len()] == *needle;
    let last = haystack.len() - needle.len();
    if expected <= last && matches_at(expected) {
        return Some(expected);
    }
    (0..=last)
        .filter(|&at| matches_at(at))
        .min_by_key(|&at| at.abs_diff(expected))
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for ch in text.chars() {
        if ch.is_ascii_alphanumeric() || UNESCAPED.contains(ch) {
            out.push(ch);
        } else {
            let mut buf = [0u8; 4];
            for byte in ch.encode_utf8(&mut buf).bytes() {
                // Writing to a String cannot fail.
                let _ = write!(out, "%{byte:02X}");
            }
        }
    }
    out
}

fn unescape(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = text.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}
