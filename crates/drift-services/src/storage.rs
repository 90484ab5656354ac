//! Reading outgoing files and landing incoming ones in the download directory.
//!
//! Incoming bytes are written to a hidden temporary file first and linked
//! into place under a free name only once exactly the declared number of
//! bytes has arrived. An existing file is never overwritten; the new one
//! gets a numeric suffix instead (`notes (1).txt`).

use std::io;
use std::path::{Path, PathBuf};

use drift_core::message::{self, MessageError, Offer};
use rand::RngCore;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};

use crate::progress::{ProgressFn, ProgressReader, ProgressWriter};

/// Buffer used when streaming file contents.
pub const COPY_BUFFER_LEN: usize = 64 * 1024;

const MAX_SUFFIX: u32 = 10_000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{0}")]
    InvalidName(#[from] MessageError),
    #[error("{0} is not a regular file")]
    NotAFile(PathBuf),
    #[error("expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },
    #[error("no free name for {0} in the download directory")]
    NoFreeName(String),
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ── Outgoing ──────────────────────────────────────────────────────────────────

/// An opened local file ready to be offered.
#[derive(Debug)]
pub struct OutgoingFile {
    pub path: PathBuf,
    pub offer: Offer,
    file: File,
}

impl OutgoingFile {
    /// Open `path` and describe it as an offer. Fails before anything is
    /// sent if the file's name could not be carried on the wire.
    pub async fn open(path: &Path) -> Result<Self, StorageError> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MessageError::InvalidFilename(path.display().to_string()))?;
        message::validate_filename(name)?;

        let file = File::open(path).await.map_err(io_err(path))?;
        let meta = file.metadata().await.map_err(io_err(path))?;
        if !meta.is_file() {
            return Err(StorageError::NotAFile(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            offer: Offer::new(name, meta.len()),
            file,
        })
    }

    /// Stream exactly `offer.size` bytes into `writer`.
    pub async fn send<W>(self, writer: &mut W, progress: Option<ProgressFn>) -> Result<u64, StorageError>
    where
        W: AsyncWrite + Unpin,
    {
        let expected = self.offer.size;
        let mut source = BufReader::with_capacity(COPY_BUFFER_LEN, self.file.take(expected));
        let mut sink = ProgressWriter::new(writer, expected, progress);

        let sent = tokio::io::copy_buf(&mut source, &mut sink)
            .await
            .map_err(io_err(&self.path))?;
        if sent != expected {
            return Err(StorageError::SizeMismatch {
                expected,
                actual: sent,
            });
        }
        sink.flush().await.map_err(io_err(&self.path))?;
        Ok(sent)
    }
}

// ── Incoming ──────────────────────────────────────────────────────────────────

/// Removes the temporary file when dropped, whatever happened to it.
struct TempFile(PathBuf);

impl Drop for TempFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

/// Read exactly `size` bytes from `reader` into `dir/<filename>` (or a
/// suffixed variant) and return the final path.
///
/// If the stream ends early or any write fails, nothing is left in `dir`.
/// Bytes after the first `size` are left unread in `reader`.
pub async fn store_file<R>(
    reader: &mut R,
    dir: &Path,
    filename: &str,
    size: u64,
    progress: Option<ProgressFn>,
) -> Result<PathBuf, StorageError>
where
    R: AsyncRead + Unpin,
{
    message::validate_filename(filename)?;
    tokio::fs::create_dir_all(dir).await.map_err(io_err(dir))?;

    let temp = TempFile(dir.join(temp_name()));
    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&temp.0)
        .await
        .map_err(io_err(&temp.0))?;

    let mut source = ProgressReader::new(reader.take(size), size, progress);
    let mut sink = BufWriter::with_capacity(COPY_BUFFER_LEN, file);
    let received = tokio::io::copy(&mut source, &mut sink)
        .await
        .map_err(io_err(&temp.0))?;
    if received != size {
        return Err(StorageError::SizeMismatch {
            expected: size,
            actual: received,
        });
    }
    sink.flush().await.map_err(io_err(&temp.0))?;
    sink.get_ref().sync_all().await.map_err(io_err(&temp.0))?;
    drop(sink);

    place(&temp.0, dir, filename).await
}

/// Link the finished temp file to the first free name.
async fn place(temp: &Path, dir: &Path, filename: &str) -> Result<PathBuf, StorageError> {
    for n in 0..MAX_SUFFIX {
        let candidate = dir.join(numbered_name(filename, n));
        match tokio::fs::hard_link(temp, &candidate).await {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => {
                tracing::debug!(error = %e, "hard link failed, falling back to rename");
                if tokio::fs::try_exists(&candidate).await.map_err(io_err(&candidate))? {
                    continue;
                }
                tokio::fs::rename(temp, &candidate)
                    .await
                    .map_err(io_err(&candidate))?;
                return Ok(candidate);
            }
        }
    }
    Err(StorageError::NoFreeName(filename.to_string()))
}

fn temp_name() -> String {
    let mut tag = [0u8; 8];
    rand::thread_rng().fill_bytes(&mut tag);
    format!(".drift-{}.part", hex::encode(tag))
}

/// `report.pdf` → `report (n).pdf`; `n == 0` keeps the name as is.
pub fn numbered_name(filename: &str, n: u32) -> String {
    if n == 0 {
        return filename.to_string();
    }
    match filename.rfind('.') {
        Some(dot) if dot > 0 => format!("{} ({n}){}", &filename[..dot], &filename[dot..]),
        _ => format!("{filename} ({n})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn stores_exact_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = &b"hello, world"[..];
        let path = store_file(&mut source, dir.path(), "hello.txt", 12, None).await.unwrap();

        assert_eq!(path, dir.path().join("hello.txt"));
        assert_eq!(std::fs::read(&path).unwrap(), b"hello, world");
        assert_eq!(entries(dir.path()), vec!["hello.txt"]);
    }

    #[tokio::test]
    async fn leaves_trailing_bytes_unread() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = &b"abcdeOFFER"[..];
        store_file(&mut source, dir.path(), "a.bin", 5, None).await.unwrap();
        assert_eq!(source, b"OFFER");
    }

    #[tokio::test]
    async fn short_stream_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = &b"only ten b"[..];
        let err = store_file(&mut source, dir.path(), "big.bin", 1000, None)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::SizeMismatch {
                expected: 1000,
                actual: 10
            }
        ));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn zero_byte_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = &b""[..];
        let path = store_file(&mut source, dir.path(), "empty", 0, None).await.unwrap();
        assert_eq!(std::fs::metadata(path).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn collisions_get_numeric_suffix() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"original").unwrap();

        for _ in 0..2 {
            let mut source = &b"new"[..];
            store_file(&mut source, dir.path(), "notes.txt", 3, None).await.unwrap();
        }

        assert_eq!(
            entries(dir.path()),
            vec!["notes (1).txt", "notes (2).txt", "notes.txt"]
        );
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"original");
    }

    #[tokio::test]
    async fn creates_missing_download_dir() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("Downloads").join("Drift");
        let mut source = &b"x"[..];
        store_file(&mut source, &nested, "x", 1, None).await.unwrap();
        assert!(nested.join("x").exists());
    }

    #[tokio::test]
    async fn rejects_unsafe_names() {
        let dir = tempfile::tempdir().unwrap();
        let mut source = &b"x"[..];
        let err = store_file(&mut source, dir.path(), "../x", 1, None).await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidName(_)));
        assert!(entries(dir.path()).is_empty());
    }

    #[tokio::test]
    async fn outgoing_file_sends_declared_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpg");
        std::fs::write(&path, vec![0x5a; 200_000]).unwrap();

        let outgoing = OutgoingFile::open(&path).await.unwrap();
        assert_eq!(outgoing.offer, Offer::new("photo.jpg", 200_000));

        let mut sink = Vec::new();
        let sent = outgoing.send(&mut sink, None).await.unwrap();
        assert_eq!(sent, 200_000);
        assert_eq!(sink.len(), 200_000);
    }

    #[tokio::test]
    async fn outgoing_rejects_directories_and_bad_names() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            OutgoingFile::open(dir.path()).await.unwrap_err(),
            StorageError::NotAFile(_)
        ));

        let piped = dir.path().join("a|b");
        std::fs::write(&piped, b"x").unwrap();
        assert!(matches!(
            OutgoingFile::open(&piped).await.unwrap_err(),
            StorageError::InvalidName(_)
        ));
    }

    #[test]
    fn numbered_names() {
        assert_eq!(numbered_name("a.txt", 0), "a.txt");
        assert_eq!(numbered_name("a.txt", 1), "a (1).txt");
        assert_eq!(numbered_name("archive.tar.gz", 2), "archive.tar (2).gz");
        assert_eq!(numbered_name("README", 3), "README (3)");
        assert_eq!(numbered_name(".bashrc", 1), ".bashrc (1)");
    }
}
