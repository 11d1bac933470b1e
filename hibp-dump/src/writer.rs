use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_compression::tokio::write::GzipEncoder;
use tokio::fs::{self, File};
use tokio::io::{AsyncRead, AsyncWriteExt, BufWriter};
use tracing::debug;

use crate::error::Error;

/// Gzip compressed dump output.
///
/// Everything is written to a `<name>.partial` sibling, which is renamed onto
/// the real path only by [`DumpWriter::finish`]. A writer that is abandoned or
/// dropped never leaves a file under the final name.
pub struct DumpWriter {
    path: PathBuf,
    partial: PathBuf,
    encoder: GzipEncoder<BufWriter<File>>,
    lines: u64,
}

impl DumpWriter {
    pub async fn create(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let partial = partial_path(&path)?;
        let file = File::create(&partial).await.map_err(|e| Error::file(&partial, e))?;

        Ok(Self { path, partial, encoder: GzipEncoder::new(BufWriter::new(file)), lines: 0 })
    }

    pub async fn write_line(&mut self, line: &str) -> Result<(), Error> {
        self.encoder.write_all(line.as_bytes()).await?;
        self.encoder.write_all(b"\n").await?;
        self.lines += 1;
        Ok(())
    }

    /// Copies an already line-formatted stream verbatim.
    pub async fn copy_from<R>(&mut self, reader: &mut R) -> Result<u64, Error>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        Ok(tokio::io::copy(reader, &mut self.encoder).await?)
    }

    /// Lines written through [`DumpWriter::write_line`].
    pub fn lines(&self) -> u64 {
        self.lines
    }

    /// Flushes the gzip trailer and moves the file into place.
    pub async fn finish(mut self) -> Result<PathBuf, Error> {
        self.encoder.shutdown().await?;
        fs::rename(&self.partial, &self.path).await?;
        debug!(path = %self.path.display(), lines = self.lines, "dump finalized");
        Ok(self.path)
    }

    /// Discards everything written so far.
    pub async fn abandon(self) {
        let Self { partial, encoder, .. } = self;
        drop(encoder);
        if let Err(e) = fs::remove_file(&partial).await {
            debug!(path = %partial.display(), error = %e, "cannot remove partial dump");
        }
    }
}

fn partial_path(path: &Path) -> Result<PathBuf, Error> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidInput(format!("not a file path: {}", path.display())))?;
    let mut partial = OsString::from(name);
    partial.push(".partial");
    Ok(path.with_file_name(partial))
}

/// Appends `.gz` unless the path already ends with it.
pub fn with_gz_suffix(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|ext| ext == "gz") {
        return path.to_path_buf();
    }
    let mut out = path.as_os_str().to_os_string();
    out.push(".gz");
    PathBuf::from(out)
}
