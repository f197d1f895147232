//! Local on-disk chunk storage: chunk files are named
//! `<server_index>_<stem>_<chunk_index>` under a server-local directory.

use std::path::{Path, PathBuf};

use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Where chunk files for this file server live.
pub struct ChunkStore {
    base_dir: PathBuf,
}

impl ChunkStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn chunk_path(&self, chunk_filename: &str) -> PathBuf {
        self.base_dir.join(chunk_filename)
    }

    /// Writes `buf` into the chunk file at the byte offset `start` within
    /// that chunk, creating and zero-extending the file as needed.
    pub async fn write(&self, chunk_filename: &str, start: u64, buf: &[u8]) -> std::io::Result<u64> {
        fs::create_dir_all(&self.base_dir).await?;
        let path = self.chunk_path(chunk_filename);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await?;

        file.seek(std::io::SeekFrom::Start(start)).await?;
        file.write_all(buf).await?;
        file.flush().await?;
        Ok(buf.len() as u64)
    }

    /// Reads `len` bytes starting at `start` within the chunk file. Missing
    /// files and short reads (reading past what was ever written) both
    /// yield fewer bytes than requested; read plans are clipped to the
    /// file's extent before they reach this server, so callers only ask
    /// for ranges known to exist.
    pub async fn read(&self, chunk_filename: &str, start: u64, len: u64) -> std::io::Result<Vec<u8>> {
        let path = self.chunk_path(chunk_filename);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let start = start as usize;
        if start >= bytes.len() {
            return Ok(Vec::new());
        }
        let end = (start + len as usize).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    /// Removes every chunk file belonging to `stem` on this server
    /// (filenames `<server_index>_<stem>_<k>`).
    pub async fn delete_all(&self, server_index: u32, stem: &str) -> std::io::Result<()> {
        let prefix = format!("{server_index}_{stem}_");
        let mut entries = match fs::read_dir(&self.base_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            if file_name_matches(&entry.path(), &prefix) {
                fs::remove_file(entry.path()).await?;
            }
        }
        Ok(())
    }
}

fn file_name_matches(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(prefix))
}

/// The chunk filename a client/metaserver addresses a chunk by.
pub fn chunk_filename(server_index: u32, stem: &str, chunk_index: u64) -> String {
    format!("{server_index}_{stem}_{chunk_index}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let name = chunk_filename(0, "f", 2);

        store.write(&name, 10, b"hello").await.unwrap();
        let got = store.read(&name, 10, 5).await.unwrap();
        assert_eq!(got, b"hello");
    }

    #[tokio::test]
    async fn read_past_written_range_is_clipped() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let name = chunk_filename(0, "f", 0);

        store.write(&name, 0, b"abc").await.unwrap();
        let got = store.read(&name, 0, 100).await.unwrap();
        assert_eq!(got, b"abc");
    }

    #[tokio::test]
    async fn read_missing_chunk_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        let got = store.read("0_f_0", 0, 10).await.unwrap();
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn delete_all_removes_only_matching_stem() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChunkStore::new(dir.path());
        store.write(&chunk_filename(0, "f", 0), 0, b"x").await.unwrap();
        store.write(&chunk_filename(0, "f", 1), 0, b"x").await.unwrap();
        store.write(&chunk_filename(0, "g", 0), 0, b"x").await.unwrap();

        store.delete_all(0, "f").await.unwrap();

        assert!(store.read(&chunk_filename(0, "f", 0), 0, 1).await.unwrap().is_empty());
        assert!(store.read(&chunk_filename(0, "f", 1), 0, 1).await.unwrap().is_empty());
        assert_eq!(store.read(&chunk_filename(0, "g", 0), 0, 1).await.unwrap(), b"x");
    }
}
