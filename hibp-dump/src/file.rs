use std::future::Future;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::{ExitStatus, Stdio};
use std::task::{Context, Poll, ready};

use async_compression::tokio::bufread::GzipDecoder;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines, ReadBuf};
use tokio::process::{ChildStdout, Command};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::classify;
use crate::error::Error;

/// External tool used to stream the entry out of a `.7z` archive.
pub const SEVEN_ZIP_BIN: &str = "7z";

/// Line stream over a decompressed dump.
pub type DumpLines = Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>;

/// How a dump is stored on disk, inferred from the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Plain,
    Gzip,
    /// A compressed archive holding a single text entry, e.g. the official
    /// `pwned-passwords-sha1-ordered-by-hash-v8.7z`.
    Archive,
}

impl Container {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("gz") => Container::Gzip,
            Some(ext) if ext.eq_ignore_ascii_case("7z") => Container::Archive,
            _ => Container::Plain,
        }
    }
}

/// A dump on disk. Read-only; the sortedness classification is computed at
/// most once per `DumpFile` value and never persisted.
#[derive(Debug)]
pub struct DumpFile {
    path: PathBuf,
    container: Container,
    archiver: PathBuf,
    sorted: OnceCell<bool>,
}

impl DumpFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let container = Container::from_path(&path);
        Self { path, container, archiver: PathBuf::from(SEVEN_ZIP_BIN), sorted: OnceCell::new() }
    }

    /// Uses `program` instead of `7z` from `PATH` to unpack archives. It is
    /// invoked as `program e -so <archive>`.
    pub fn with_archiver(mut self, program: impl Into<PathBuf>) -> Self {
        self.archiver = program.into();
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn container(&self) -> Container {
        self.container
    }

    /// Opens the dump as lines, through the decompression adapter for its
    /// container.
    pub async fn open(&self) -> Result<DumpLines, Error> {
        Ok(BufReader::new(self.reader().await?).lines())
    }

    /// Opens the decompressed byte stream of the dump.
    pub async fn reader(&self) -> Result<Box<dyn AsyncRead + Send + Unpin>, Error> {
        Ok(match self.container {
            Container::Plain => Box::new(self.open_file().await?),
            Container::Gzip => {
                let mut decoder = GzipDecoder::new(BufReader::new(self.open_file().await?));
                decoder.multiple_members(true);
                Box::new(decoder)
            }
            Container::Archive => Box::new(ArchiveEntry::spawn(&self.archiver, &self.path)?),
        })
    }

    /// Whether the leading sample of the dump is ordered by hash.
    ///
    /// Errors while reading are propagated; see [`DumpFile::is_sorted`] for
    /// the lenient variant.
    pub async fn sortedness(&self) -> Result<bool, Error> {
        self.sorted.get_or_try_init(|| classify::classify(self)).await.copied()
    }

    /// Like [`DumpFile::sortedness`], but an unreadable dump counts as unsorted.
    pub async fn is_sorted(&self) -> bool {
        match self.sortedness().await {
            Ok(sorted) => sorted,
            Err(e) => {
                debug!(path = %self.path.display(), error = %e, "cannot classify dump");
                false
            }
        }
    }

    async fn open_file(&self) -> Result<File, Error> {
        File::open(&self.path).await.map_err(|e| Error::file(&self.path, e))
    }
}

type ExitFuture = Pin<Box<dyn Future<Output = io::Result<ExitStatus>> + Send>>;

/// Stdout of `7z e -so <archive>`, which writes the archive's entries to
/// standard output. The child is killed if the reader is dropped early.
///
/// End of output is only reported once the child exited successfully; a
/// failing `7z` (corrupt or unreadable archive) surfaces as a read error.
struct ArchiveEntry {
    path: PathBuf,
    stdout: ChildStdout,
    exit: Option<ExitFuture>,
}

impl ArchiveEntry {
    fn spawn(program: &Path, path: &Path) -> Result<Self, Error> {
        let mut child = Command::new(program)
            .arg("e")
            .arg("-so")
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::file(path, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::file(path, io::Error::other("7z stdout not captured")))?;

        Ok(Self {
            path: path.to_owned(),
            stdout,
            exit: Some(Box::pin(async move { child.wait().await })),
        })
    }
}

impl AsyncRead for ArchiveEntry {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let filled = buf.filled().len();
        ready!(Pin::new(&mut this.stdout).poll_read(cx, buf))?;
        if buf.filled().len() > filled || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        // stdout hit EOF, the result depends on how 7z exited
        let Some(exit) = this.exit.as_mut() else {
            return Poll::Ready(Ok(()));
        };
        let status = ready!(exit.as_mut().poll(cx));
        this.exit = None;

        match status {
            Ok(status) if status.success() => Poll::Ready(Ok(())),
            Ok(status) => Poll::Ready(Err(io::Error::other(format!(
                "cannot unpack {}: 7z {status}",
                this.path.display()
            )))),
            Err(e) => Poll::Ready(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::DumpWriter;

    #[test]
    fn test_container_from_path() {
        assert_eq!(Container::from_path(Path::new("dump.txt")), Container::Plain);
        assert_eq!(Container::from_path(Path::new("dump.txt.gz")), Container::Gzip);
        assert_eq!(Container::from_path(Path::new("dump.TXT.GZ")), Container::Gzip);
        assert_eq!(Container::from_path(Path::new("pwned-v8.7z")), Container::Archive);
        assert_eq!(Container::from_path(Path::new("dump")), Container::Plain);
    }

    #[tokio::test]
    async fn test_open_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.txt");
        tokio::fs::write(&path, "first\nsecond\r\n").await.unwrap();

        let mut lines = DumpFile::new(&path).open().await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dump.txt.gz");
        let mut writer = DumpWriter::create(&path).await.unwrap();
        writer.write_line("first").await.unwrap();
        writer.write_line("second").await.unwrap();
        writer.finish().await.unwrap();

        let mut lines = DumpFile::new(&path).open().await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_open_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let Err(err) = DumpFile::new(dir.path().join("missing.txt")).open().await else {
            panic!("opened a missing dump");
        };
        assert!(matches!(err, Error::File { .. }));
    }

    /// Writes an executable stand-in for `7z` that runs `body`. The archive
    /// path is `$3`.
    #[cfg(unix)]
    fn fake_archiver(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archiver = fake_archiver(dir.path(), "7z-ok", r#"exec cat "$3""#);
        let path = dir.path().join("dump.7z");
        tokio::fs::write(&path, "first\nsecond\n").await.unwrap();

        let dump = DumpFile::new(&path).with_archiver(&archiver);
        assert_eq!(dump.container(), Container::Archive);
        let mut lines = dump.open().await.unwrap();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("first"));
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("second"));
        assert_eq!(lines.next_line().await.unwrap(), None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failing_archiver_is_a_read_error() {
        let dir = tempfile::tempdir().unwrap();
        let archiver =
            fake_archiver(dir.path(), "7z-broken", "echo 'ERROR: not an archive' >&2\nexit 2");
        let path = dir.path().join("dump.7z");
        tokio::fs::write(&path, b"garbage").await.unwrap();

        let dump = DumpFile::new(&path).with_archiver(&archiver);
        let mut lines = dump.open().await.unwrap();
        assert!(lines.next_line().await.is_err());

        // an empty stream must not be mistaken for a sorted dump
        assert!(dump.sortedness().await.is_err());
        assert!(!dump.is_sorted().await);
    }
}
