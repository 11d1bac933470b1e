//! Sortedness heuristic for dumps.
//!
//! Only the first [`SAMPLE_LINES`] lines are inspected. A dump that is
//! ordered within the sample but not beyond it is classified as sorted and
//! the merge-join will silently miss matches past the first disorder. Full
//! verification would mean reading tens of gigabytes before every scan.

use tracing::debug;

use crate::error::Error;
use crate::file::DumpFile;
use crate::hash::HASH_LEN;

/// Number of leading lines compared.
pub const SAMPLE_LINES: usize = 100;

/// Returns `false` as soon as a sampled line's hash column sorts below the
/// previous one. Lines shorter than a hash compare by what they have.
pub async fn classify(file: &DumpFile) -> Result<bool, Error> {
    let mut lines = file.open().await?;
    let mut last: Vec<u8> = Vec::new();

    for line_no in 1..=SAMPLE_LINES {
        let Some(line) = lines.next_line().await.map_err(|e| Error::file(file.path(), e))? else {
            break;
        };

        let key: Vec<u8> =
            line.trim().bytes().take(HASH_LEN).map(|b| b.to_ascii_uppercase()).collect();
        if key < last {
            debug!(path = %file.path().display(), line_no, "dump is not sorted");
            return Ok(false);
        }
        last = key;
    }

    Ok(true)
}
