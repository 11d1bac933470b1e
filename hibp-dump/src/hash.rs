use std::fmt;
use std::str::FromStr;

use sha1::{Digest, Sha1};

use crate::error::Error;

/// Length of a hex encoded SHA-1 digest.
pub const HASH_LEN: usize = 40;

/// Length of the k-anonymity prefix sent to the range API.
pub const PREFIX_LEN: usize = 5;

/// Length of the suffix returned by the range API.
pub const SUFFIX_LEN: usize = HASH_LEN - PREFIX_LEN;

/// Hex lookup table for uppercase encoding.
pub const HEX_CHARS: &[u8; 16] = b"0123456789ABCDEF";

/// A hex encoded SHA-1 digest, normalized to uppercase.
///
/// Ordering is byte-wise, which for uppercase hex is the same as the
/// lexicographic order used by dumps "ordered by hash".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HashDigest([u8; HASH_LEN]);

impl HashDigest {
    /// Parses a 40 character hex string in either case.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let bytes = s.as_bytes();
        if bytes.len() != HASH_LEN || !bytes.iter().all(u8::is_ascii_hexdigit) {
            return Err(Error::InvalidInput(format!("not a SHA-1 hex digest: {s:?}")));
        }

        Ok(Self::from_hex_bytes(bytes))
    }

    /// Builds a digest from bytes already known to be 40 hex digits.
    pub(crate) fn from_hex_bytes(bytes: &[u8]) -> Self {
        let mut out = [0u8; HASH_LEN];
        for (dst, src) in out.iter_mut().zip(bytes) {
            *dst = src.to_ascii_uppercase();
        }
        Self(out)
    }

    /// Computes the SHA-1 digest of a plaintext secret.
    pub fn of_password(password: &str) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(password.as_bytes());
        let hash: [u8; 20] = hasher.finalize().into();

        let mut out = [0u8; HASH_LEN];
        for (i, byte) in hash.iter().enumerate() {
            out[i * 2] = HEX_CHARS[(byte >> 4) as usize];
            out[i * 2 + 1] = HEX_CHARS[(byte & 0x0f) as usize];
        }
        Self(out)
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        // SAFETY: constructed only from ASCII hex digits
        unsafe { std::str::from_utf8_unchecked(&self.0) }
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// The first five characters, used as the range query.
    #[inline]
    pub fn prefix(&self) -> &str {
        &self.as_str()[..PREFIX_LEN]
    }

    /// The remaining 35 characters, matched locally against range rows.
    #[inline]
    pub fn suffix(&self) -> &str {
        &self.as_str()[PREFIX_LEN..]
    }
}

impl FromStr for HashDigest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for HashDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HashDigest({})", self.as_str())
    }
}
