use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use clap::{Parser, Subcommand};
use hibp_dump::{HashDigest, MergeReport, Scanner, with_gz_suffix};
use hibp_range::{
    ChunkDownloader, ClientConfig, DEFAULT_BASE_URL, DownloadConfig, RangeClient, TOTAL_PREFIXES,
};
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod error;

use error::Error;

#[derive(Parser, Debug)]
#[command(name = "hibp-check")]
#[command(version, about = "Check password hashes against Have I Been Pwned")]
struct Args {
    /// Base URL of the Pwned Passwords API
    #[arg(long, env = "HIBP_API_URL", default_value = DEFAULT_BASE_URL, global = true)]
    api_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check SHA-1 hashes read from stdin against the range API
    Api {
        /// Read plaintext passwords instead of hashes
        #[arg(long)]
        passwords: bool,
    },

    /// Check SHA-1 hashes read from stdin against local dumps
    Dump {
        /// One or more HIBP dumps (plain, .gz or .7z)
        #[arg(long = "files", required = true, num_args = 1..)]
        files: Vec<PathBuf>,

        /// Read plaintext passwords instead of hashes
        #[arg(long)]
        passwords: bool,
    },

    /// Download the full dump, ordered by hash, from the range API
    Download {
        /// Output file or directory
        #[arg(short, long)]
        output: PathBuf,

        /// Keep and re-use partial downloads
        #[arg(short, long)]
        keep: bool,

        /// Overwrite an existing output file
        #[arg(long)]
        force: bool,

        /// Number of concurrent chunk downloads (default: 4 per core)
        #[arg(short = 'j', long)]
        concurrent_workers: Option<usize>,

        /// Number of prefixes to download, starting at 00000
        #[arg(long, default_value_t = TOTAL_PREFIXES)]
        limit: u32,

        /// Disable progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Merge two dumps ordered by hash
    Merge {
        /// Exactly two HIBP dumps
        #[arg(long = "files", required = true, num_args = 1..)]
        files: Vec<PathBuf>,

        /// Output location
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    // Ctrl+C cancels whatever is running
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, stopping");
                cancel.cancel();
            }
        }
    });

    match args.command {
        Command::Api { passwords } => {
            let client = RangeClient::new(ClientConfig::with_base_url(&args.api_url))?;
            for hash in read_hashes(passwords).await? {
                if cancel.is_cancelled() {
                    break;
                }
                match client.lookup_digest(&hash).await {
                    Ok(0) => {}
                    Ok(count) => println!("{hash}:{count}"),
                    Err(e) => warn!(%hash, error = %e, "lookup failed"),
                }
            }
        }
        Command::Dump { files, passwords } => {
            let scanner = Scanner::new(files)?;
            let hashes = read_hashes(passwords).await?;
            info!(hashes = hashes.len(), dumps = scanner.dumps().len(), "checking dumps");
            for hash in scanner.lookup_batch(hashes, &cancel).await {
                println!("{hash}");
            }
        }
        Command::Download { output, keep, force, concurrent_workers, limit, no_progress } => {
            let existing = with_gz_suffix(&output);
            if existing.is_file() && !force {
                return Err(Error::FileExists { path: existing });
            }

            let mut config =
                DownloadConfig { prefixes: 0..limit.min(TOTAL_PREFIXES), ..Default::default() };
            if let Some(workers) = concurrent_workers {
                config.concurrency = workers;
            }
            let client_config = ClientConfig {
                max_idle_per_host: config.concurrency,
                ..ClientConfig::with_base_url(&args.api_url)
            };
            let downloader = ChunkDownloader::new(RangeClient::new(client_config)?, config);

            let progress = (!no_progress)
                .then(|| spawn_progress(downloader.progress(), downloader.total()));
            let report = downloader.download(&output, keep, &cancel).await;
            if let Some((bar, task)) = progress {
                task.abort();
                bar.finish_with_message("done");
            }

            let report = report?;
            if let Some(output) = &report.output {
                println!("Chunks assembled at {}", output.display());
            }
            if !report.failed.is_empty() {
                warn!(failed = report.failed.len(), "dump is missing the ranges of failed chunks");
            }
        }
        Command::Merge { files, output } => {
            let scanner = Scanner::new(files)?;
            let report = scanner.merge(&output, &cancel).await?;
            if report.canceled {
                warn!(
                    output = %report.output.display(),
                    "merge was interrupted, output only holds the records up to that point"
                );
            }
            println!("{}", merge_summary(&report));
        }
    }

    Ok(())
}

/// Reads one hash (or password) per line from stdin. Lines that are not a
/// valid SHA-1 hex digest are reported and skipped.
async fn read_hashes(passwords: bool) -> Result<Vec<HashDigest>, Error> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut hashes = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if passwords {
            hashes.push(HashDigest::of_password(&line));
            continue;
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match HashDigest::parse(line) {
            Ok(hash) => hashes.push(hash),
            Err(e) => warn!(error = %e, "skipping input"),
        }
    }

    Ok(hashes)
}

fn merge_summary(report: &MergeReport) -> String {
    let summary = format!(
        "Merged {} records into {} ({} duplicates collapsed)",
        report.records,
        report.output.display(),
        report.collapsed
    );
    if report.canceled {
        format!("{summary}, interrupted before the end of input")
    } else {
        summary
    }
}

fn spawn_progress(
    counter: Arc<AtomicU64>,
    total: u64,
) -> (ProgressBar, tokio::task::JoinHandle<()>) {
    let bar = ProgressBar::new(total);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}")
            .expect("Invalid progress bar template")
            .progress_chars("#>-"),
    );

    let task = tokio::spawn({
        let bar = bar.clone();
        async move {
            loop {
                tokio::time::sleep(Duration::from_millis(100)).await;
                let current = counter.load(Ordering::Relaxed);
                bar.set_position(current);
                if current >= total {
                    break;
                }
            }
        }
    });

    (bar, task)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(canceled: bool) -> MergeReport {
        MergeReport { output: PathBuf::from("out.gz"), records: 3, collapsed: 1, canceled }
    }

    #[test]
    fn test_merge_summary() {
        assert_eq!(
            merge_summary(&report(false)),
            "Merged 3 records into out.gz (1 duplicates collapsed)"
        );
    }

    #[test]
    fn test_merge_summary_flags_interrupted_merge() {
        let summary = merge_summary(&report(true));
        assert!(summary.starts_with("Merged 3 records into out.gz"));
        assert!(summary.ends_with("interrupted before the end of input"));
    }
}
