use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::file::DumpFile;
use crate::hash::HashDigest;
use crate::merge::{self, MergeReport};
use crate::record::parse_hash;

/// Capacity of the shared match sink.
const RESULTS_CAPACITY: usize = 1024;

/// Capacity of each unsorted-scan worker's line queue.
const LINE_QUEUE_CAPACITY: usize = 1024;

/// Matches batches of hashes against one or more HIBP dumps.
///
/// Dumps ordered by hash are scanned with a single-pass merge-join. Dumps in
/// any other order (e.g. "ordered by prevalence") fall back to fanning every
/// line out to a worker pool, which takes much, much longer.
#[derive(Debug, Clone)]
pub struct Scanner {
    dumps: Vec<Arc<DumpFile>>,
}

impl Scanner {
    /// Keeps the paths that are regular files. Fails if none are.
    pub fn new<I, P>(paths: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let mut dumps = Vec::new();
        for path in paths {
            let path = path.into();
            if !is_file(&path) {
                warn!(path = %path.display(), "ignoring dump, not a file");
                continue;
            }
            dumps.push(Arc::new(DumpFile::new(path)));
        }

        if dumps.is_empty() {
            return Err(Error::InvalidInput("no valid dumps given".to_string()));
        }
        Ok(Self { dumps })
    }

    pub fn dumps(&self) -> &[Arc<DumpFile>] {
        &self.dumps
    }

    /// Returns the queries found in any dump.
    ///
    /// Every dump is scanned by its own task. Results arrive in no particular
    /// order, and a hash present in several dumps is reported once per dump.
    /// Dumps that cannot be read are logged and skipped. Cancellation stops
    /// all scans at the next line and returns the matches found so far.
    pub async fn lookup_batch<I>(&self, queries: I, cancel: &CancellationToken) -> Vec<HashDigest>
    where
        I: IntoIterator<Item = HashDigest>,
    {
        let mut queries: Vec<HashDigest> = queries.into_iter().collect();
        if queries.is_empty() {
            return Vec::new();
        }
        queries.sort_unstable();
        let queries: Arc<[HashDigest]> = queries.into();

        let (results_tx, mut results_rx) = mpsc::channel(RESULTS_CAPACITY);
        let mut scans = JoinSet::new();
        for dump in &self.dumps {
            let dump = Arc::clone(dump);
            let queries = Arc::clone(&queries);
            let results = results_tx.clone();
            let cancel = cancel.clone();
            scans.spawn(async move { scan_file(&dump, queries, results, &cancel).await });
        }
        drop(results_tx);

        let mut out = Vec::with_capacity(queries.len());
        while let Some(hash) = results_rx.recv().await {
            out.push(hash);
        }

        while let Some(joined) = scans.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "scan task failed");
            }
        }

        out
    }

    /// Merges this scanner's dumps, which must be exactly two sorted ones.
    pub async fn merge(
        &self,
        output: impl AsRef<Path>,
        cancel: &CancellationToken,
    ) -> Result<MergeReport, Error> {
        merge::merge(&self.dumps, output, cancel).await
    }
}

fn is_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|meta| meta.is_file())
}

async fn scan_file(
    dump: &DumpFile,
    queries: Arc<[HashDigest]>,
    results: mpsc::Sender<HashDigest>,
    cancel: &CancellationToken,
) {
    let path = dump.path().display();
    let scanned = if dump.is_sorted().await {
        debug!(%path, "dump appears to be sorted");
        scan_sorted(dump, &queries, &results, cancel).await
    } else {
        debug!(%path, "dump is not sorted");
        scan_unsorted(dump, queries, &results, cancel).await
    };

    match scanned {
        Ok(matches) => info!(%path, matches, "finished checking dump"),
        Err(e) => warn!(%path, error = %e, "skipping dump"),
    }
}

/// Merge-join of the sorted queries against a dump ordered by hash.
///
/// Both sides are read once in ascending order. Duplicate queries collapse
/// into a single match.
pub(crate) async fn scan_sorted(
    dump: &DumpFile,
    queries: &[HashDigest],
    results: &mpsc::Sender<HashDigest>,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let mut lines = dump.open().await?;
    let mut next = 0usize;
    let mut line_no = 0u64;
    let mut matches = 0u64;

    while next < queries.len() {
        if cancel.is_cancelled() {
            debug!(path = %dump.path().display(), line_no, "scan canceled");
            break;
        }

        let Some(line) = lines.next_line().await.map_err(|e| Error::file(dump.path(), e))? else {
            break;
        };
        line_no += 1;

        let Some(hash) = parse_hash(&line) else {
            trace!(line_no, "skipping malformed line");
            continue;
        };

        // catch the query cursor up with the file without consuming the line
        while next < queries.len() && queries[next] < hash {
            next += 1;
        }

        if next < queries.len() && queries[next] == hash {
            trace!(path = %dump.path().display(), line_no, %hash, "match");
            matches += 1;
            next += 1;
            if results.send(hash).await.is_err() {
                break;
            }
        }
    }

    Ok(matches)
}

/// Brute-force scan of a dump in arbitrary order.
///
/// Lines are dealt round-robin to one matcher per available core over bounded
/// queues, so a slow pool stalls the reader instead of buffering the file.
pub(crate) async fn scan_unsorted(
    dump: &DumpFile,
    queries: Arc<[HashDigest]>,
    results: &mpsc::Sender<HashDigest>,
    cancel: &CancellationToken,
) -> Result<u64, Error> {
    let mut lines = dump.open().await?;

    let workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let mut queues = Vec::with_capacity(workers);
    let mut pool = JoinSet::new();
    for id in 0..workers {
        let (tx, rx) = mpsc::channel(LINE_QUEUE_CAPACITY);
        queues.push(tx);
        pool.spawn(matcher(id, Arc::clone(&queries), rx, results.clone(), cancel.clone()));
    }

    let mut line_no = 0usize;
    let read = loop {
        if cancel.is_cancelled() {
            debug!(path = %dump.path().display(), line_no, "scan canceled");
            break Ok(());
        }

        match lines.next_line().await {
            Ok(Some(line)) => {
                if queues[line_no % workers].send(line).await.is_err() {
                    break Ok(());
                }
                line_no += 1;
            }
            Ok(None) => break Ok(()),
            Err(e) => break Err(Error::file(dump.path(), e)),
        }
    };
    drop(queues);

    let mut matches = 0u64;
    while let Some(joined) = pool.join_next().await {
        match joined {
            Ok(found) => matches += found,
            Err(e) => warn!(error = %e, "matcher task failed"),
        }
    }

    read.map(|()| matches)
}

async fn matcher(
    id: usize,
    queries: Arc<[HashDigest]>,
    mut lines: mpsc::Receiver<String>,
    results: mpsc::Sender<HashDigest>,
    cancel: CancellationToken,
) -> u64 {
    trace!(worker = id, "starting matcher");
    let mut matches = 0u64;

    while let Some(line) = lines.recv().await {
        if cancel.is_cancelled() {
            break;
        }

        let Some(hash) = parse_hash(&line) else {
            continue;
        };

        if queries.binary_search(&hash).is_ok() {
            matches += 1;
            if results.send(hash).await.is_err() {
                break;
            }
        }
    }

    matches
}
