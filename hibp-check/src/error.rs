use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Range(#[from] hibp_range::Error),

    #[error(transparent)]
    Dump(#[from] hibp_dump::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("File '{path}' exists. Use --force to overwrite.")]
    FileExists { path: PathBuf },
}
