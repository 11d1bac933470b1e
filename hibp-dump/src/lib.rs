//! Scans and merges Have I Been Pwned SHA-1 password dumps.
//!
//! The dumps published at <https://haveibeenpwned.com/Passwords> are tens of
//! gigabytes of `HASH:COUNT` lines. Nothing here loads a dump into memory:
//! every operation streams lines through a decompression adapter and keeps
//! only the records under comparison.
//!
//! # Dump formats
//!
//! - plain text (`.txt` or anything else)
//! - gzip (`.gz`), the format produced by `hibp-range`'s downloader and by
//!   [`merge`]
//! - single-entry 7z archives (`.7z`), streamed through the `7z` tool
//!
//! # Lookups
//!
//! [`Scanner::lookup_batch`] classifies each dump by sampling its first lines
//! (see [`classify`]). Dumps "ordered by hash" are matched with a linear
//! merge-join against the sorted queries; dumps in any other order are
//! fanned out to a worker pool and take much longer.
//!
//! # Merging
//!
//! [`merge`] combines two sorted dumps into one, keeping the larger count
//! when both contain the same hash. Merging more dumps means merging
//! pairwise.

pub mod classify;
pub mod error;
pub mod file;
pub mod hash;
pub mod merge;
pub mod record;
pub mod scanner;
pub mod writer;

pub use error::Error;
pub use file::{Container, DumpFile, DumpLines};
pub use hash::{HASH_LEN, HashDigest, PREFIX_LEN, SUFFIX_LEN};
pub use merge::{MergeReport, merge};
pub use record::DumpRecord;
pub use scanner::Scanner;
pub use writer::{DumpWriter, with_gz_suffix};
