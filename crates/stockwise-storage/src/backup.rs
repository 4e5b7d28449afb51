use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use flate2::write::{GzDecoder, GzEncoder};
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::StorageError;

const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";
const EXTENSION: &str = ".csv.gz";
const CHUNK_BYTES: usize = 64 * 1024;

/// A finished, renamed backup file plus the digest of its uncompressed content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub created_at: NaiveDateTime,
}

/// Directory of gzip-compressed, timestamped table snapshots with bounded retention.
#[derive(Debug, Clone)]
pub struct BackupStore {
    root: PathBuf,
    keep: usize,
}

impl BackupStore {
    /// `keep` is raised to at least one artifact per table.
    pub fn new(root: impl Into<PathBuf>, keep: usize) -> Self {
        Self {
            root: root.into(),
            keep: keep.max(1),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn keep(&self) -> usize {
        self.keep
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn file_name(table: &str, created_at: NaiveDateTime) -> String {
        format!("{table}_{}{EXTENSION}", created_at.format(STAMP_FORMAT))
    }

    /// Opens a temp file next to the final artifact; `finish` renames it into place.
    pub async fn begin(&self, table: &str, created_at: NaiveDateTime) -> Result<BackupWriter> {
        fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("creating backup directory {}", self.root.display()))?;

        let final_path = self.root.join(Self::file_name(table, created_at));
        let temp_path = self.root.join(format!(".{}.{table}.tmp", Uuid::new_v4()));
        let file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp backup file {}", temp_path.display()))?;

        Ok(BackupWriter {
            encoder: GzEncoder::new(Vec::new(), Compression::default()),
            file,
            hasher: Sha256::new(),
            bytes: 0,
            temp_path,
            final_path,
            created_at,
        })
    }

    /// Artifacts of `table`, newest first.
    pub async fn artifacts(&self, table: &str) -> Result<Vec<BackupArtifact>> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("listing backups in {}", self.root.display()))
            }
        };

        let prefix = format!("{table}_");
        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("reading {}", self.root.display()))?
        {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(stamp) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(EXTENSION))
            else {
                continue;
            };
            let Ok(created_at) = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT) else {
                continue;
            };
            let path = entry.path();
            let bytes = entry.metadata().await.map(|m| m.len()).unwrap_or(0);
            let sha256 = read_sidecar(&path).await.unwrap_or_default();
            found.push(BackupArtifact {
                path,
                sha256,
                bytes,
                created_at,
            });
        }

        found.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.path.cmp(&a.path)));
        Ok(found)
    }

    /// Deletes all but the newest `keep` artifacts of `table`; returns the removed paths.
    pub async fn prune(&self, table: &str) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        for artifact in self.artifacts(table).await?.into_iter().skip(self.keep) {
            fs::remove_file(&artifact.path)
                .await
                .with_context(|| format!("removing old backup {}", artifact.path.display()))?;
            let _ = fs::remove_file(sidecar_path(&artifact.path)).await;
            info!(path = %artifact.path.display(), "pruned old backup");
            removed.push(artifact.path);
        }
        Ok(removed)
    }

    pub async fn open(&self, artifact: &BackupArtifact) -> Result<BackupReader> {
        let file = File::open(&artifact.path)
            .await
            .with_context(|| format!("opening backup {}", artifact.path.display()))?;
        let expected = if artifact.sha256.is_empty() {
            read_sidecar(&artifact.path).await
        } else {
            Some(artifact.sha256.clone())
        };
        if expected.is_none() {
            warn!(path = %artifact.path.display(), "backup has no checksum; restoring unverified");
        }
        Ok(BackupReader {
            file,
            decoder: GzDecoder::new(Vec::new()),
            hasher: Sha256::new(),
            expected,
            path: artifact.path.clone(),
            done: false,
        })
    }
}

fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".sha256");
    PathBuf::from(name)
}

async fn read_sidecar(path: &Path) -> Option<String> {
    let text = fs::read_to_string(sidecar_path(path)).await.ok()?;
    text.split_whitespace().next().map(str::to_string)
}

/// Streaming writer for one artifact. Compressed output is buffered in memory and
/// flushed to the temp file in chunks; dropping the writer without `finish` leaves only
/// the temp file.
pub struct BackupWriter {
    encoder: GzEncoder<Vec<u8>>,
    file: File,
    hasher: Sha256,
    bytes: u64,
    temp_path: PathBuf,
    final_path: PathBuf,
    created_at: NaiveDateTime,
}

impl BackupWriter {
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.encoder
            .write_all(chunk)
            .with_context(|| format!("compressing backup {}", self.temp_path.display()))?;
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
        if self.encoder.get_ref().len() >= CHUNK_BYTES {
            self.flush_compressed().await?;
        }
        Ok(())
    }

    async fn flush_compressed(&mut self) -> Result<()> {
        let pending = std::mem::take(self.encoder.get_mut());
        self.file
            .write_all(&pending)
            .await
            .with_context(|| format!("writing backup {}", self.temp_path.display()))
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub async fn finish(mut self) -> Result<BackupArtifact> {
        self.encoder
            .try_finish()
            .with_context(|| format!("finishing gzip stream {}", self.temp_path.display()))?;
        self.flush_compressed().await?;
        self.file
            .flush()
            .await
            .with_context(|| format!("flushing backup {}", self.temp_path.display()))?;
        self.file
            .sync_all()
            .await
            .with_context(|| format!("syncing backup {}", self.temp_path.display()))?;

        let BackupWriter {
            file,
            hasher,
            bytes,
            temp_path,
            final_path,
            created_at,
            ..
        } = self;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &final_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming backup {} -> {}",
                    temp_path.display(),
                    final_path.display()
                )
            });
        }

        let sha256 = hex::encode(hasher.finalize());
        let file_name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        fs::write(sidecar_path(&final_path), format!("{sha256}  {file_name}\n"))
            .await
            .with_context(|| format!("writing checksum for {}", final_path.display()))?;

        debug!(path = %final_path.display(), bytes, "backup written");
        Ok(BackupArtifact {
            path: final_path,
            sha256,
            bytes,
            created_at,
        })
    }

    /// Removes the partial temp file.
    pub async fn discard(self) {
        let temp_path = self.temp_path.clone();
        drop(self);
        let _ = fs::remove_file(temp_path).await;
    }
}

/// Streaming reader over an artifact's decompressed content. The checksum is verified
/// when the end of the stream is reached.
pub struct BackupReader {
    file: File,
    decoder: GzDecoder<Vec<u8>>,
    hasher: Sha256,
    expected: Option<String>,
    path: PathBuf,
    done: bool,
}

impl BackupReader {
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>> {
        let mut compressed = vec![0u8; CHUNK_BYTES];
        loop {
            if self.done {
                return Ok(None);
            }

            let read = self
                .file
                .read(&mut compressed)
                .await
                .with_context(|| format!("reading backup {}", self.path.display()))?;

            if read == 0 {
                self.decoder
                    .try_finish()
                    .with_context(|| format!("truncated backup {}", self.path.display()))?;
                let tail = std::mem::take(self.decoder.get_mut());
                self.hasher.update(&tail);
                self.done = true;
                self.verify()?;
                return Ok((!tail.is_empty()).then_some(tail));
            }

            self.decoder
                .write_all(&compressed[..read])
                .with_context(|| format!("decompressing backup {}", self.path.display()))?;
            let chunk = std::mem::take(self.decoder.get_mut());
            if !chunk.is_empty() {
                self.hasher.update(&chunk);
                return Ok(Some(chunk));
            }
        }
    }

    fn verify(&mut self) -> Result<()> {
        let actual = hex::encode(std::mem::take(&mut self.hasher).finalize());
        match &self.expected {
            Some(expected) if *expected != actual => Err(StorageError::BackupChecksum {
                path: self.path.display().to_string(),
                expected: expected.clone(),
                actual,
            }
            .into()),
            _ => Ok(()),
        }
    }

    /// Reads the remaining content into memory.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut all = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            all.extend_from_slice(&chunk);
        }
        Ok(all)
    }
}
