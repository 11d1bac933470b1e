use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{Local, NaiveDate};
use hibp_dump::{DumpFile, DumpWriter, SUFFIX_LEN, with_gz_suffix};
use tokio::fs;
use tokio::sync::Semaphore;
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::TOTAL_PREFIXES;
use crate::client::RangeClient;
use crate::conversion::{hex_to_prefix, prefix_str, prefix_to_hex};
use crate::error::Error;

/// Per-chunk segments are staged here, next to the output file.
pub const STAGING_DIR: &str = ".hibp-dl";

/// Shortest range row worth keeping: a full suffix, `:` and one digit.
pub const MIN_LINE_LEN: usize = SUFFIX_LEN + 2;

/// Settings for a [`ChunkDownloader`].
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Chunk fetches in flight at once.
    pub concurrency: usize,
    /// Prefixes to download, `0..TOTAL_PREFIXES` for the full dump.
    pub prefixes: Range<u32>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self { concurrency: cores * 4, prefixes: 0..TOTAL_PREFIXES }
    }
}

/// Outcome of [`ChunkDownloader::download`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    /// The assembled dump; `None` if the download was canceled before
    /// assembly.
    pub output: Option<PathBuf>,
    pub staging: PathBuf,
    /// Chunks fetched from the API in this run.
    pub fetched: u64,
    /// Chunks whose segment was kept from an earlier run.
    pub reused: u64,
    /// Chunks that ran out of retries, ascending. Their ranges are missing
    /// from the output.
    pub failed: Vec<u32>,
    pub canceled: bool,
}

/// Rebuilds the full "ordered by hash" dump from the range API.
///
/// Every prefix is fetched into its own gzip segment under [`STAGING_DIR`];
/// once all chunks are done the segments are concatenated in prefix order
/// into a single gzip dump. Chunks that keep failing are logged and left out
/// rather than failing the run.
pub struct ChunkDownloader {
    client: RangeClient,
    config: DownloadConfig,
    progress: Arc<AtomicU64>,
}

impl ChunkDownloader {
    pub fn new(client: RangeClient, config: DownloadConfig) -> Self {
        Self { client, config, progress: Arc::new(AtomicU64::new(0)) }
    }

    /// Chunks finished so far (fetched, reused or failed).
    pub fn progress(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.progress)
    }

    /// Number of chunks a download covers.
    pub fn total(&self) -> u64 {
        self.config.prefixes.len() as u64
    }

    /// Downloads every configured prefix and assembles the dump at `output`.
    ///
    /// With `resume`, segments left by an earlier run are trusted as complete
    /// and the staging directory is kept after assembly. On cancellation no
    /// new chunks are started, in-flight ones finish, and the staging
    /// directory is left in place for a later resume.
    pub async fn download(
        &self,
        output: impl AsRef<Path>,
        resume: bool,
        cancel: &CancellationToken,
    ) -> Result<DownloadReport, Error> {
        let output = resolve_output_path(output.as_ref()).await?;
        let staging = staging_dir(&output);
        if !resume && fs::try_exists(&staging).await? {
            debug!(staging = %staging.display(), "discarding stale segments");
            fs::remove_dir_all(&staging).await?;
        }
        fs::create_dir_all(&staging).await?;

        let completed = if resume { completed_segments(&staging).await? } else { HashSet::new() };
        if resume && !completed.is_empty() {
            info!(completed = completed.len(), "resuming, re-using existing segments");
        }
        info!(
            staging = %staging.display(),
            chunks = self.total(),
            concurrency = self.config.concurrency,
            "downloading hashes"
        );

        let mut report = DownloadReport { staging: staging.clone(), ..DownloadReport::default() };
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut chunks = JoinSet::new();
        let mut in_flight: HashMap<Id, u32> = HashMap::new();

        for prefix in self.config.prefixes.clone() {
            if completed.contains(&prefix) {
                report.reused += 1;
                self.progress.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.map_err(|e| Error::Io(std::io::Error::other(e)))?
                }
            };

            let client = self.client.clone();
            let staging = staging.clone();
            let progress = Arc::clone(&self.progress);
            let task = chunks.spawn(async move {
                let _permit = permit;
                let outcome = download_chunk(&client, &staging, prefix).await;
                progress.fetch_add(1, Ordering::Relaxed);
                outcome
            });
            in_flight.insert(task.id(), prefix);

            while let Some(joined) = chunks.try_join_next_with_id() {
                report.record(joined, &mut in_flight);
            }
        }

        while let Some(joined) = chunks.join_next_with_id().await {
            report.record(joined, &mut in_flight);
        }
        report.failed.sort_unstable();

        if cancel.is_cancelled() {
            report.canceled = true;
            warn!(staging = %staging.display(), "download canceled, keeping partial chunks");
            return Ok(report);
        }

        info!(
            fetched = report.fetched,
            reused = report.reused,
            failed = report.failed.len(),
            "download done, assembling chunks"
        );
        let output = assemble(&staging, &output, self.config.prefixes.clone()).await?;
        info!(output = %output.display(), "chunks assembled");

        if !resume {
            fs::remove_dir_all(&staging).await?;
        }
        report.output = Some(output);
        Ok(report)
    }
}

impl DownloadReport {
    fn record(
        &mut self,
        joined: Result<(Id, Result<u64, Error>), JoinError>,
        in_flight: &mut HashMap<Id, u32>,
    ) {
        let (id, outcome) = match joined {
            Ok((id, outcome)) => (id, outcome.map_err(|e| e.to_string())),
            Err(e) => (e.id(), Err(format!("chunk task failed: {e}"))),
        };
        let Some(prefix) = in_flight.remove(&id) else {
            warn!(task = %id, "finished chunk task was not tracked");
            return;
        };

        match outcome {
            Ok(_) => self.fetched += 1,
            Err(error) => {
                let hex = prefix_to_hex(prefix);
                warn!(prefix = prefix_str(&hex), %error, "chunk failed, skipping");
                self.failed.push(prefix);
            }
        }
    }
}

/// Fetches one prefix and writes it to `<staging>/<PREFIX>.gz` as full
/// `HASH:COUNT` lines. Returns the number of lines written.
async fn download_chunk(client: &RangeClient, staging: &Path, prefix: u32) -> Result<u64, Error> {
    let prefix_hex = prefix_to_hex(prefix);
    let prefix_str = prefix_str(&prefix_hex);
    let segment = segment_path(staging, prefix);

    let body = client.fetch_range(prefix_str).await?;

    let mut writer = DumpWriter::create(&segment).await?;
    let mut line = String::with_capacity(64);
    for row in body.lines() {
        let row = row.trim();
        if row.len() < MIN_LINE_LEN {
            continue;
        }
        line.clear();
        line.push_str(prefix_str);
        line.push_str(row);
        if let Err(e) = writer.write_line(&line).await {
            writer.abandon().await;
            return Err(e.into());
        }
    }

    let lines = writer.lines();
    writer.finish().await?;
    debug!(prefix = prefix_str, lines, "chunk written");
    Ok(lines)
}

/// Concatenates the segments of `prefixes` in ascending prefix order.
/// Missing segments (failed chunks) are skipped.
async fn assemble(staging: &Path, output: &Path, prefixes: Range<u32>) -> Result<PathBuf, Error> {
    let present = completed_segments(staging).await?;
    let mut writer = DumpWriter::create(output).await?;

    for prefix in prefixes.filter(|p| present.contains(p)) {
        let segment = DumpFile::new(segment_path(staging, prefix));
        let copied = async {
            let mut reader = segment.reader().await?;
            writer.copy_from(&mut reader).await
        }
        .await;

        if let Err(e) = copied {
            writer.abandon().await;
            return Err(e.into());
        }
    }

    Ok(writer.finish().await?)
}

fn segment_path(staging: &Path, prefix: u32) -> PathBuf {
    let hex = prefix_to_hex(prefix);
    staging.join(format!("{}.gz", prefix_str(&hex)))
}

fn staging_dir(output: &Path) -> PathBuf {
    output.parent().unwrap_or_else(|| Path::new(".")).join(STAGING_DIR)
}

/// Scan the staging directory for finished `XXXXX.gz` segments and return
/// their prefixes
pub async fn completed_segments(staging: &Path) -> Result<HashSet<u32>, Error> {
    let mut completed = HashSet::new();
    if !fs::try_exists(staging).await? {
        return Ok(completed);
    }

    let mut entries = fs::read_dir(staging).await?;

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let prefix = path
            .extension()
            .filter(|ext| *ext == "gz")
            .and_then(|_| path.file_stem())
            .and_then(|stem| stem.to_str())
            .and_then(hex_to_prefix);

        if let Some(p) = prefix {
            completed.insert(p);
        }
    }

    Ok(completed)
}

/// Where the assembled dump goes: directories get a dated default file name,
/// and a `.gz` suffix is appended when missing.
pub async fn resolve_output_path(path: &Path) -> Result<PathBuf, Error> {
    if path.as_os_str().is_empty() {
        return Err(Error::InvalidInput("need output path".to_string()));
    }

    let is_dir = fs::metadata(path).await.is_ok_and(|meta| meta.is_dir());
    if is_dir {
        return Ok(path.join(default_file_name(Local::now().date_naive())));
    }
    Ok(with_gz_suffix(path))
}

pub fn default_file_name(date: NaiveDate) -> String {
    format!("pwned-passwords-sha1-ordered-by-hash-{}.txt.gz", date.format("%Y-%m-%d"))
}
