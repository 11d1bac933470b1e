use std::cmp::Ordering;

use crate::hash::{HASH_LEN, HashDigest};

/// One `HASH:COUNT` line of a dump.
///
/// The line is kept as read (trimmed) so output preserves the input's case.
/// Dumps of the first HIBP release carry no count; those records are bare
/// hashes and [`DumpRecord::count`] returns `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpRecord {
    line: String,
}

impl DumpRecord {
    /// Parses a dump line, returning `None` for anything that does not start
    /// with a 40 character hex hash followed by end of line or `:`.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        parse_hash(line)?;
        Some(Self { line: line.to_owned() })
    }

    /// The hash column, case preserved.
    #[inline]
    pub fn hash(&self) -> &str {
        &self.line[..HASH_LEN]
    }

    pub fn digest(&self) -> HashDigest {
        // parse() already checked the hex column
        HashDigest::from_hex_bytes(self.hash().as_bytes())
    }

    /// The occurrence count, if the line has a well formed one.
    pub fn count(&self) -> Option<u64> {
        self.line.get(HASH_LEN + 1..)?.parse().ok()
    }

    /// Case-insensitive comparison of the hash columns.
    pub fn cmp_hash(&self, other: &Self) -> Ordering {
        let lhs = self.hash().bytes().map(|b| b.to_ascii_uppercase());
        let rhs = other.hash().bytes().map(|b| b.to_ascii_uppercase());
        lhs.cmp(rhs)
    }

    /// Collapses two records with the same hash into one carrying the larger
    /// count. The hash column of `self` is kept.
    pub fn collapse(self, other: &Self) -> Self {
        let count = match (self.count(), other.count()) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        match count {
            Some(count) => Self { line: format!("{}:{}", self.hash(), count) },
            None => Self { line: self.hash().to_owned() },
        }
    }

    #[inline]
    pub fn as_line(&self) -> &str {
        &self.line
    }
}

/// Extracts the normalized hash of a dump line without allocating.
///
/// Accepts the same lines as [`DumpRecord::parse`].
pub fn parse_hash(line: &str) -> Option<HashDigest> {
    let bytes = line.trim().as_bytes();
    if bytes.len() < HASH_LEN || !bytes[..HASH_LEN].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    if bytes.len() > HASH_LEN && bytes[HASH_LEN] != b':' {
        return None;
    }
    Some(HashDigest::from_hex_bytes(&bytes[..HASH_LEN]))
}
