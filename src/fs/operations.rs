use std::{
    io::Write,
    path::{Path, PathBuf},
};

use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

/// Finds where an unterminated last line starts. Returns `None` when the file is empty or ends
/// with a newline, which means every line was completely written.
///
/// A crash in the middle of an append leaves such a torn line behind. The position can be used to
/// truncate it away before appending again.
pub async fn find_torn_tail(
    file: &mut (impl AsyncSeek + AsyncRead + Unpin),
    buffer: &mut [u8],
) -> Result<Option<u64>, io::Error> {
    let len = file.seek(std::io::SeekFrom::End(0)).await?;
    if len == 0 {
        return Ok(None);
    }

    let mut end = len;
    while end > 0 {
        let chunk = u64::min(end, buffer.len() as u64) as usize;
        let start = end - chunk as u64;
        file.seek(std::io::SeekFrom::Start(start)).await?;
        file.read_exact(&mut buffer[..chunk]).await?;

        if end == len && buffer[chunk - 1] == b'\n' {
            return Ok(None);
        }

        if let Some(index) = buffer[..chunk].iter().rposition(|v| *v == b'\n') {
            return Ok(Some(start + index as u64 + 1));
        }
        end = start;
    }

    Ok(Some(0))
}

/// Write bytes to a file atomically: write to a temp file in the same directory, sync it, then
/// rename over the target.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let parent = path.parent().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no parent")
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.as_file().sync_data()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// [atomic_write] on the blocking pool, so the fsync doesn't stall runtime workers.
pub async fn spawn_atomic_write(path: PathBuf, data: Vec<u8>) -> Result<(), std::io::Error> {
    tokio::task::spawn_blocking(move || atomic_write(&path, &data))
        .await
        .map_err(std::io::Error::other)?
}
