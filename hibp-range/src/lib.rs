//! Client for the Have I Been Pwned Pwned Passwords range API, and a
//! downloader that rebuilds the full SHA-1 dump from it.
//!
//! # k-anonymity lookups
//!
//! [`RangeClient::lookup`] sends only the first five hex characters of a
//! SHA-1 hash to `GET <base>/range/<prefix>` and matches the remaining 35
//! characters locally against the returned `SUFFIX:COUNT` rows.
//!
//! ```no_run
//! # async fn run() -> Result<(), hibp_range::Error> {
//! use hibp_range::{ClientConfig, RangeClient};
//!
//! let client = RangeClient::new(ClientConfig::default())?;
//! let count = client.lookup("CBFDAC6008F9CAB4083784CBD1874F76618D2A97").await?;
//! println!("seen {count} times");
//! # Ok(())
//! # }
//! ```
//!
//! # Downloading the dump
//!
//! [`ChunkDownloader`] issues one request per prefix, 16^5 = 1,048,576 in
//! total, and assembles the responses into a single gzip file ordered by
//! hash, the same layout as the official "ordered by hash" download. The
//! result can be scanned and merged with `hibp-dump`.
//!
//! Failed chunks are retried with exponential backoff and, once the budget is
//! spent, left out of the dump. Re-running with `resume` only fetches what is
//! missing.

pub mod client;
pub mod conversion;
pub mod download;
pub mod error;
pub mod retry;

pub use client::{ClientConfig, DEFAULT_BASE_URL, RangeClient, RangeEntry, range_entries};
pub use conversion::{hex_to_prefix, prefix_str, prefix_to_hex};
pub use download::{ChunkDownloader, DownloadConfig, DownloadReport, STAGING_DIR};
pub use error::Error;
pub use retry::Backoff;

/// Total number of prefixes (16^5 = 1,048,576)
pub const TOTAL_PREFIXES: u32 = 0x100000;
