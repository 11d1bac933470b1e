use hibp_dump::{HashDigest, SUFFIX_LEN};
use reqwest::StatusCode;
use tracing::{debug, trace};

use crate::conversion::hex_to_prefix;
use crate::error::Error;
use crate::retry::Backoff;

/// Public Pwned Passwords API.
pub const DEFAULT_BASE_URL: &str = "https://api.pwnedpasswords.com";

/// Settings for a [`RangeClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Scheme and host of the API, without the `/range` path.
    pub base_url: String,
    pub retry: Backoff,
    pub user_agent: String,
    /// Idle connections kept per host; match this to the download concurrency.
    pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            retry: Backoff::default(),
            user_agent: concat!("hibp-range/", env!("CARGO_PKG_VERSION")).to_string(),
            max_idle_per_host: 64,
        }
    }
}

impl ClientConfig {
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into(), ..Self::default() }
    }
}

/// One `SUFFIX:COUNT` row of a range response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeEntry<'a> {
    pub suffix: &'a str,
    pub count: u64,
}

impl<'a> RangeEntry<'a> {
    /// Parses a row, returning `None` for anything malformed.
    pub fn parse(line: &'a str) -> Option<Self> {
        let (suffix, count) = line.trim().split_once(':')?;
        if suffix.len() != SUFFIX_LEN || !suffix.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        if count.is_empty() || !count.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        Some(Self { suffix, count: count.parse().ok()? })
    }
}

/// Well formed rows of a range response body. Malformed rows are skipped.
pub fn range_entries(body: &str) -> impl Iterator<Item = RangeEntry<'_>> {
    body.lines().filter_map(|line| {
        let entry = RangeEntry::parse(line);
        if entry.is_none() && !line.trim().is_empty() {
            trace!(line, "discarding malformed range row");
        }
        entry
    })
}

/// k-anonymity client for `GET <base>/range/<prefix>`.
///
/// Only the first five hex characters of a hash leave the process. The client
/// is cheap to clone and safe to share between tasks.
#[derive(Debug, Clone)]
pub struct RangeClient {
    http: reqwest::Client,
    base_url: String,
    retry: Backoff,
}

impl RangeClient {
    pub fn new(config: ClientConfig) -> Result<Self, Error> {
        let http = reqwest::Client::builder()
            .user_agent(config.user_agent)
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()
            .map_err(Error::Client)?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            retry: config.retry,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns how often `hash` (40 hex characters, any case) appears in the
    /// breach corpus; 0 if it does not.
    pub async fn lookup(&self, hash: &str) -> Result<u64, Error> {
        let hash = HashDigest::parse(hash).map_err(|e| Error::InvalidInput(e.to_string()))?;
        self.lookup_digest(&hash).await
    }

    pub async fn lookup_digest(&self, hash: &HashDigest) -> Result<u64, Error> {
        let body = self.fetch_range(hash.prefix()).await?;
        let count = range_entries(&body)
            .find(|entry| entry.suffix.eq_ignore_ascii_case(hash.suffix()))
            .map_or(0, |entry| entry.count);

        debug!(prefix = hash.prefix(), count, "range lookup");
        Ok(count)
    }

    /// Hashes a plaintext with SHA-1 and looks it up.
    pub async fn lookup_password(&self, password: &str) -> Result<u64, Error> {
        self.lookup_digest(&HashDigest::of_password(password)).await
    }

    /// Fetches the raw body for a 5 hex character prefix, retrying transport
    /// failures within the configured budget. A 404 is an empty range.
    pub async fn fetch_range(&self, prefix: &str) -> Result<String, Error> {
        if hex_to_prefix(prefix).is_none() {
            return Err(Error::InvalidInput(format!("not a 5 character hex prefix: {prefix:?}")));
        }

        let url = format!("{}/range/{}", self.base_url, prefix);
        self.retry.retry(|| self.fetch_once(&url, prefix)).await.map_err(|exhausted| {
            Error::Transport {
                prefix: prefix.to_string(),
                attempts: exhausted.attempts,
                source: Box::new(exhausted.last),
            }
        })
    }

    async fn fetch_once(&self, url: &str, prefix: &str) -> Result<String, Error> {
        trace!(url, "HTTP request");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|source| Error::HttpRequest { prefix: prefix.to_string(), source })?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(String::new());
        }
        if !status.is_success() {
            return Err(Error::HttpStatus { prefix: prefix.to_string(), status: status.as_u16() });
        }

        response
            .text()
            .await
            .map_err(|source| Error::HttpRequest { prefix: prefix.to_string(), source })
    }
}
