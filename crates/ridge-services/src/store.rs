//! On-disk chunk store for a storage server.
//!
//! One file per chunk, named `{filename}_{sequence}`, holding the chunk in
//! its wire encoding (digests included) so a read can be verified:
//!   {root}/report.pdf_0
//!   {root}/report.pdf_1
//!
//! A newer version overwrites the older file in place. Keys whose file name
//! is not a bare file name are refused, so nothing is read or written
//! outside the root.

use std::ffi::CString;
use std::fs;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;

use anyhow::{Context, Result};
use bytes::Bytes;
use memmap2::Mmap;

use ridge_core::{is_bare_file_name, ChunkKey, Metadata};

const TMP_SUFFIX: &str = ".tmp";

#[derive(Clone)]
pub struct ChunkStore {
    root: PathBuf,
}

impl ChunkStore {
    /// Create a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store root: {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn has(&self, key: &ChunkKey) -> bool {
        self.chunk_path(key).is_ok_and(|p| p.exists())
    }

    /// Read a stored chunk. `None` if absent.
    pub fn get(&self, key: &ChunkKey) -> Result<Option<Bytes>> {
        let path = self.chunk_path(key)?;
        if !path.exists() {
            return Ok(None);
        }

        let file = fs::File::open(&path)
            .with_context(|| format!("failed to open chunk: {}", path.display()))?;

        // Safety: file is opened read-only and we don't mutate the mmap
        let mmap = unsafe {
            Mmap::map(&file).with_context(|| format!("failed to mmap chunk: {}", path.display()))?
        };

        Ok(Some(Bytes::copy_from_slice(&mmap)))
    }

    /// Store an encoded chunk, replacing any previous version.
    ///
    /// Writes are atomic: write to temp file, sync, then rename.
    pub fn put(&self, key: &ChunkKey, encoded: &[u8]) -> Result<()> {
        let path = self.chunk_path(key)?;
        let tmp_path = self.root.join(format!("{key}{TMP_SUFFIX}"));
        {
            let mut file = fs::File::create(&tmp_path)
                .with_context(|| format!("failed to create temp file: {}", tmp_path.display()))?;
            file.write_all(encoded).context("failed to write chunk data")?;
            file.sync_all().context("failed to sync chunk to disk")?;
        }

        fs::rename(&tmp_path, &path).with_context(|| {
            format!(
                "failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        tracing::trace!(chunk = %key, len = encoded.len(), "chunk stored");
        Ok(())
    }

    /// Metadata of every stored chunk, read from the file headers.
    /// Unreadable files and leftover temp files are skipped.
    pub fn scan(&self) -> Result<Vec<Metadata>> {
        let entries = fs::read_dir(&self.root)
            .with_context(|| format!("failed to list {}", self.root.display()))?;
        let mut found = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.to_string_lossy().ends_with(TMP_SUFFIX) {
                let _ = fs::remove_file(&path);
                continue;
            }
            let meta = fs::read(&path)
                .map_err(anyhow::Error::from)
                .and_then(|bytes| Metadata::peek(&bytes).map_err(anyhow::Error::from));
            match meta {
                Ok(m) if self.chunk_path(&m.key()).is_ok_and(|p| p == path) => found.push(m),
                Ok(m) => {
                    tracing::warn!(path = %path.display(), chunk = %m.key(), "stored chunk name does not match its header");
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable chunk file");
                }
            }
        }
        Ok(found)
    }

    /// Bytes available to unprivileged users on the store's filesystem.
    pub fn free_space(&self) -> Result<u64> {
        let c_path = CString::new(self.root.as_os_str().as_bytes())
            .context("store path contains null byte")?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error()).context("statvfs failed");
        }
        Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
    }

    fn chunk_path(&self, key: &ChunkKey) -> Result<PathBuf> {
        anyhow::ensure!(
            is_bare_file_name(&key.filename),
            "chunk name {:?} is not a bare file name",
            key.filename
        );
        Ok(self.root.join(key.to_string()))
    }

    /// Number of chunk files held. Temp files and anything not named
    /// `{filename}_{sequence}` are skipped.
    pub fn count(&self) -> usize {
        fs::read_dir(&self.root)
            .map(|entries| {
                entries
                    .flatten()
                    .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
                    .filter(|e| is_chunk_file_name(&e.file_name().to_string_lossy()))
                    .count()
            })
            .unwrap_or(0)
    }
}

fn is_chunk_file_name(name: &str) -> bool {
    if name.ends_with(TMP_SUFFIX) {
        return false;
    }
    name.rsplit_once('_').is_some_and(|(file, seq)| {
        !file.is_empty() && !seq.is_empty() && seq.bytes().all(|b| b.is_ascii_digit())
    })
}
