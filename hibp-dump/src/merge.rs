use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::error::Error;
use crate::file::{DumpFile, DumpLines};
use crate::record::DumpRecord;
use crate::writer::{DumpWriter, with_gz_suffix};

/// Records buffered between each reader and the merge loop.
pub const MERGE_QUEUE_CAPACITY: usize = 1024;

/// Outcome of a two-way merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeReport {
    pub output: PathBuf,
    /// Records written.
    pub records: u64,
    /// Records folded into a preceding record with the same hash.
    pub collapsed: u64,
    /// The merge stopped early; the output holds a sorted prefix of the result.
    pub canceled: bool,
}

/// Merges exactly two dumps ordered by hash into one gzip compressed, sorted
/// and deduplicated dump.
///
/// Records with the same hash are collapsed into one carrying the larger of
/// their counts. Preconditions are checked before the output is created; on
/// any failure after that the partial output is removed.
pub async fn merge(
    dumps: &[Arc<DumpFile>],
    output: impl AsRef<Path>,
    cancel: &CancellationToken,
) -> Result<MergeReport, Error> {
    let [left, right] = dumps else {
        let reason = if dumps.len() < 2 {
            "nothing to merge".to_string()
        } else {
            format!("can only merge two dumps at a time, got {}", dumps.len())
        };
        return Err(Error::InvalidInput(reason));
    };

    for dump in [left, right] {
        if !dump.sortedness().await? {
            return Err(Error::UnsupportedInput(format!(
                "merging unsorted dumps is not supported: {}",
                dump.path().display()
            )));
        }
    }

    let output = with_gz_suffix(output.as_ref());
    info!(
        left = %left.path().display(),
        right = %right.path().display(),
        output = %output.display(),
        "merging dumps"
    );

    let left_lines = left.open().await?;
    let right_lines = right.open().await?;
    let mut writer = DumpWriter::create(&output).await?;

    let (left_tx, mut left_rx) = mpsc::channel(MERGE_QUEUE_CAPACITY);
    let (right_tx, mut right_rx) = mpsc::channel(MERGE_QUEUE_CAPACITY);
    let left_reader =
        tokio::spawn(read_records(left.path().to_owned(), left_lines, left_tx, cancel.clone()));
    let right_reader =
        tokio::spawn(read_records(right.path().to_owned(), right_lines, right_tx, cancel.clone()));

    let merged = merge_streams(&mut left_rx, &mut right_rx, &mut writer).await;

    // unblock the readers if the merge loop bailed out early
    drop(left_rx);
    drop(right_rx);
    let left_read = join_reader(left_reader).await;
    let right_read = join_reader(right_reader).await;

    let stats = match merged.and_then(|stats| left_read.and(right_read).map(|_| stats)) {
        Ok(stats) => stats,
        Err(e) => {
            writer.abandon().await;
            return Err(e);
        }
    };

    let output = writer.finish().await?;
    let canceled = cancel.is_cancelled();
    if canceled {
        warn!(output = %output.display(), "merge canceled, output is incomplete");
    }

    Ok(MergeReport { output, records: stats.records, collapsed: stats.collapsed, canceled })
}

#[derive(Debug, Default)]
struct MergeStats {
    records: u64,
    collapsed: u64,
}

async fn read_records(
    path: PathBuf,
    mut lines: DumpLines,
    records: mpsc::Sender<DumpRecord>,
    cancel: CancellationToken,
) -> Result<u64, Error> {
    let mut line_no = 0u64;
    while !cancel.is_cancelled() {
        let Some(line) = lines.next_line().await.map_err(|e| Error::file(&path, e))? else {
            break;
        };
        line_no += 1;

        let Some(record) = DumpRecord::parse(&line) else {
            trace!(path = %path.display(), line_no, "skipping malformed line");
            continue;
        };
        if records.send(record).await.is_err() {
            break;
        }
    }

    debug!(path = %path.display(), lines = line_no, "finished reading dump");
    Ok(line_no)
}

async fn join_reader(handle: tokio::task::JoinHandle<Result<u64, Error>>) -> Result<u64, Error> {
    handle.await.map_err(|e| Error::Io(std::io::Error::other(format!("reader task failed: {e}"))))?
}

/// Two-pointer merge over two ascending record streams.
async fn merge_streams(
    left: &mut mpsc::Receiver<DumpRecord>,
    right: &mut mpsc::Receiver<DumpRecord>,
    writer: &mut DumpWriter,
) -> Result<MergeStats, Error> {
    let mut out = Deduplicated::new(writer);
    let mut lv = left.recv().await;
    let mut rv = right.recv().await;

    loop {
        let record = match (lv.take(), rv.take()) {
            (None, None) => break,
            (Some(l), None) => {
                lv = left.recv().await;
                l
            }
            (None, Some(r)) => {
                rv = right.recv().await;
                r
            }
            (Some(l), Some(r)) => match l.cmp_hash(&r) {
                Ordering::Less => {
                    lv = left.recv().await;
                    rv = Some(r);
                    l
                }
                Ordering::Greater => {
                    rv = right.recv().await;
                    lv = Some(l);
                    r
                }
                Ordering::Equal => {
                    out.stats.collapsed += 1;
                    lv = left.recv().await;
                    rv = right.recv().await;
                    l.collapse(&r)
                }
            },
        };
        out.push(record).await?;
    }

    out.finish().await
}

/// Holds back the last record so duplicates inside a single input collapse
/// the same way as duplicates across inputs.
struct Deduplicated<'a> {
    writer: &'a mut DumpWriter,
    pending: Option<DumpRecord>,
    stats: MergeStats,
}

impl<'a> Deduplicated<'a> {
    fn new(writer: &'a mut DumpWriter) -> Self {
        Self { writer, pending: None, stats: MergeStats::default() }
    }

    async fn push(&mut self, record: DumpRecord) -> Result<(), Error> {
        match self.pending.take() {
            Some(prev) if prev.cmp_hash(&record) == Ordering::Equal => {
                self.stats.collapsed += 1;
                self.pending = Some(prev.collapse(&record));
            }
            Some(prev) => {
                self.write(&prev).await?;
                self.pending = Some(record);
            }
            None => self.pending = Some(record),
        }
        Ok(())
    }

    async fn write(&mut self, record: &DumpRecord) -> Result<(), Error> {
        self.writer.write_line(record.as_line()).await?;
        self.stats.records += 1;
        Ok(())
    }

    async fn finish(mut self) -> Result<MergeStats, Error> {
        if let Some(last) = self.pending.take() {
            self.write(&last).await?;
        }
        Ok(self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u32) -> String {
        format!("{n:040X}")
    }

    fn dump(dir: &tempfile::TempDir, name: &str, lines: &[String]) -> Arc<DumpFile> {
        let path = dir.path().join(name);
        let body: String = lines.iter().map(|l| format!("{l}\n")).collect();
        std::fs::write(&path, body).unwrap();
        Arc::new(DumpFile::new(path))
    }

    async fn read_output(path: &Path) -> Vec<String> {
        let mut lines = DumpFile::new(path).open().await.unwrap();
        let mut out = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            out.push(line);
        }
        out
    }

    #[tokio::test]
    async fn test_merge_interleaves_and_takes_max() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[format!("{}:5", hash(1)), format!("{}:2", hash(3))]);
        let b = dump(
            &dir,
            "b.txt",
            &[format!("{}:9", hash(1)), format!("{}:4", hash(2)), format!("{}:7", hash(4))],
        );

        let report =
            merge(&[a, b], dir.path().join("out.txt"), &CancellationToken::new()).await.unwrap();

        assert_eq!(report.output, dir.path().join("out.txt.gz"));
        assert_eq!(report.records, 4);
        assert_eq!(report.collapsed, 1);
        assert!(!report.canceled);
        assert_eq!(
            read_output(&report.output).await,
            vec![
                format!("{}:9", hash(1)),
                format!("{}:4", hash(2)),
                format!("{}:2", hash(3)),
                format!("{}:7", hash(4)),
            ]
        );
    }

    #[tokio::test]
    async fn test_same_hash_keeps_larger_count_not_sum() {
        let dir = tempfile::tempdir().unwrap();
        let h = format!("{}0001", "A".repeat(36));
        let a = dump(&dir, "a.txt", &[format!("{h}:5")]);
        let b = dump(&dir, "b.txt", &[format!("{h}:9")]);

        let report =
            merge(&[a, b], dir.path().join("out.gz"), &CancellationToken::new()).await.unwrap();
        assert_eq!(read_output(&report.output).await, vec![format!("{h}:9")]);
    }

    #[tokio::test]
    async fn test_counts_compare_numerically() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[format!("{}:9", hash(1))]);
        let b = dump(&dir, "b.txt", &[format!("{}:10", hash(1))]);

        let report =
            merge(&[a, b], dir.path().join("out.gz"), &CancellationToken::new()).await.unwrap();
        assert_eq!(read_output(&report.output).await, vec![format!("{}:10", hash(1))]);
    }

    #[tokio::test]
    async fn test_duplicates_within_one_input_collapse() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[format!("{}:1", hash(1)), format!("{}:3", hash(1))]);
        let b = dump(&dir, "b.txt", &[format!("{}:2", hash(2))]);

        let report =
            merge(&[a, b], dir.path().join("out.gz"), &CancellationToken::new()).await.unwrap();
        assert_eq!(
            read_output(&report.output).await,
            vec![format!("{}:3", hash(1)), format!("{}:2", hash(2))]
        );
    }

    #[tokio::test]
    async fn test_drains_longer_input() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[format!("{}:1", hash(5))]);
        let lines: Vec<String> = (0..3000).map(|n| format!("{}:1", hash(n * 2))).collect();
        let b = dump(&dir, "b.txt", &lines);

        let report =
            merge(&[a, b], dir.path().join("out.gz"), &CancellationToken::new()).await.unwrap();
        let out = read_output(&report.output).await;
        assert_eq!(out.len(), 3001);
        assert!(out.windows(2).all(|w| w[0][..40] < w[1][..40]));
    }

    #[tokio::test]
    async fn test_rejects_wrong_number_of_dumps() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[hash(1)]);
        let b = dump(&dir, "b.txt", &[hash(2)]);
        let c = dump(&dir, "c.txt", &[hash(3)]);
        let out = dir.path().join("out.gz");
        let cancel = CancellationToken::new();

        let err = merge(&[a.clone(), b, c], &out, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        let err = merge(&[a], &out, &cancel).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(ref msg) if msg.contains("nothing to merge")));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_rejects_unsorted_dump() {
        let dir = tempfile::tempdir().unwrap();
        let sorted = dump(&dir, "a.txt", &[hash(1), hash(2)]);
        let unsorted = dump(&dir, "b.txt", &[hash(2), hash(1)]);
        let out = dir.path().join("out.gz");

        let err = merge(&[sorted, unsorted], &out, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::UnsupportedInput(_)));
        assert!(!out.exists());
        assert!(!dir.path().join("out.gz.partial").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unreadable_archive_fails_merge() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let archiver = dir.path().join("7z-broken");
        std::fs::write(&archiver, "#!/bin/sh\necho 'ERROR: not an archive' >&2\nexit 2\n").unwrap();
        std::fs::set_permissions(&archiver, std::fs::Permissions::from_mode(0o755)).unwrap();

        let a = dump(&dir, "a.txt", &[format!("{}:1", hash(1)), format!("{}:2", hash(2))]);
        let b_path = dir.path().join("b.7z");
        std::fs::write(&b_path, b"garbage").unwrap();
        let b = Arc::new(DumpFile::new(&b_path).with_archiver(&archiver));
        let out = dir.path().join("out.gz");

        let err = merge(&[a, b], &out, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, Error::File { ref path, .. } if *path == b_path));
        assert!(!out.exists());
        assert!(!dir.path().join("out.gz.partial").exists());
    }

    #[tokio::test]
    async fn test_scanner_merge_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = dump(&dir, "a.txt", &[format!("{}:1", hash(1))]);
        let b = dump(&dir, "b.txt", &[format!("{}:1", hash(2))]);

        let scanner = crate::Scanner::new([a.path(), b.path()]).unwrap();
        let report = scanner.merge(dir.path().join("out.gz"), &CancellationToken::new()).await.unwrap();

        let merged = crate::Scanner::new([report.output]).unwrap();
        let found = merged
            .lookup_batch(
                [crate::HashDigest::parse(&hash(2)).unwrap()],
                &CancellationToken::new(),
            )
            .await;
        assert_eq!(found.len(), 1);
    }
}
