//! Access-token codec.
//!
//! A token is a content-addressed capability over a line range of one file.
//! The wire form is a fixed prefix plus five colon-separated fields:
//!
//! ````text
//! sat1:<path hash, 8 hex>:<start>:<end>:<range crc, 8 hex>:<line count>
//! ````
//!
//! Tokens are opaque to the agent. Equality and coverage are defined on the
//! `(path, start, end)` triple; validity is defined by the range CRC, which
//! is CRC32C over the `\n`-joined raw lines of the range.

use std::path::Path;

use crate::error::TokenError;
use crate::lineage::LineageTracker;
use crate::util::path_hash;

pub const TOKEN_PREFIX: &str = "sat1";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub path_hash: String,
    /// 1-based, inclusive.
    pub start: u32,
    /// 1-based, inclusive.
    pub end: u32,
    pub range_crc: u32,
    /// Total line count of the file when the token was issued.
    pub line_count: u32,
}

pub fn compute_range_crc(text: &str) -> u32 {
    crc32c::crc32c(text.as_bytes())
}

/// CRC over `lines[start..=end]` (1-based, inclusive), `\n`-joined, without
/// line numbers. Lines past the end of the file are ignored.
pub fn range_crc_of_lines(lines: &[String], start: u32, end: u32) -> u32 {
    let from = (start.max(1) - 1) as usize;
    let to = (end as usize).min(lines.len());
    if from >= to {
        return compute_range_crc("");
    }
    compute_range_crc(&lines[from..to].join("\n"))
}

impl AccessToken {
    pub fn new(path: &Path, start: u32, end: u32, lines: &[String]) -> Self {
        Self {
            path_hash: path_hash(path),
            start,
            end,
            range_crc: range_crc_of_lines(lines, start, end),
            line_count: lines.len() as u32,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{TOKEN_PREFIX}:{}:{}:{}:{:08x}:{}",
            self.path_hash, self.start, self.end, self.range_crc, self.line_count
        )
    }

    /// Decode a wire token bound to `bound_path`. The embedded path hash must
    /// match the bound path, or — via the lineage tracker — any prior path of
    /// the file identity now living at `bound_path`. This is how tokens
    /// survive move/rename without re-issuance.
    pub fn decode(
        s: &str,
        bound_path: &Path,
        lineage: &LineageTracker,
    ) -> Result<Self, TokenError> {
        let token = Self::parse(s)?;
        if token.path_hash == path_hash(bound_path) {
            return Ok(token);
        }
        let aliased = lineage
            .prior_paths(bound_path)
            .iter()
            .any(|prior| path_hash(prior) == token.path_hash);
        if aliased {
            Ok(token)
        } else {
            Err(TokenError::WrongFile)
        }
    }

    /// Syntactic parse only; no path binding.
    pub fn parse(s: &str) -> Result<Self, TokenError> {
        let malformed = |why: &str| TokenError::Malformed(why.to_string());
        let mut fields = s.split(':');
        let prefix = fields.next().ok_or_else(|| malformed("empty token"))?;
        if prefix != TOKEN_PREFIX {
            return Err(malformed("bad prefix"));
        }
        let parts: Vec<&str> = fields.collect();
        let [hash, start, end, crc, line_count] = parts.as_slice() else {
            return Err(malformed("expected five fields"));
        };
        if hash.len() != 8 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(malformed("path hash must be 8 hex chars"));
        }
        if crc.len() != 8 {
            return Err(malformed("range crc must be 8 hex chars"));
        }
        let range_crc = u32::from_str_radix(crc, 16).map_err(|_| malformed("bad range crc"))?;
        let start: u32 = start.parse().map_err(|_| malformed("bad start line"))?;
        let end: u32 = end.parse().map_err(|_| malformed("bad end line"))?;
        let line_count: u32 = line_count
            .parse()
            .map_err(|_| malformed("bad line count"))?;
        if start == 0 || end < start {
            return Err(malformed("bad line range"));
        }
        Ok(Self {
            path_hash: hash.to_string(),
            start,
            end,
            range_crc,
            line_count,
        })
    }

    /// True iff the token's range fully contains `[start..=end]`.
    pub fn covers(&self, start: u32, end: u32) -> bool {
        self.start <= start && end <= self.end
    }

    /// Re-check the range CRC against the file's current lines.
    pub fn validate(&self, current_lines: &[String]) -> Result<(), TokenError> {
        if (self.end as usize) > current_lines.len() {
            return Err(TokenError::LineCountMismatch {
                recorded: self.line_count,
                current: current_lines.len() as u32,
            });
        }
        let found = range_crc_of_lines(current_lines, self.start, self.end);
        if found != self.range_crc {
            return Err(TokenError::RangeCrcMismatch {
                expected: self.range_crc,
                found,
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }
}
