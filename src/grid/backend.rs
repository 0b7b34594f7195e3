//! Pluggable persistence for share containers.
//!
//! A backend stores opaque byte containers keyed by
//! `(storage-index, share-number)`. Immutable shares are written in chunks
//! into an incoming area and become visible only when finalized; mutable
//! slots are replaced whole, atomically. Eventually consistent stores must
//! serialize operations per key to preserve read-after-write; both bundled
//! backends are strongly consistent.

use crate::cap::BASE32;
use crate::{ShareNum, StorageIndex};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Errors raised by backends, the storage server, and server connections.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// No shares exist for the storage index.
    #[error("unknown storage index")]
    UnknownStorageIndex,
    /// The named share does not exist.
    #[error("share {0} not found")]
    ShareNotFound(ShareNum),
    /// The share exists but is not open for writing.
    #[error("share {0} is not being written")]
    NotWritable(ShareNum),
    /// A write would exceed the allocated share size.
    #[error("write of {length} at {offset} exceeds allocation {allocated}")]
    PastEof {
        /// Write offset.
        offset: u64,
        /// Write length.
        length: u64,
        /// Allocated share size.
        allocated: u64,
    },
    /// A bucket was closed before its allocation was fully written.
    #[error("share closed with {written} of {allocated} bytes written")]
    Incomplete {
        /// High-water mark of written bytes.
        written: u64,
        /// Allocated share size.
        allocated: u64,
    },
    /// A read was outside the share.
    #[error("read of {length} at {offset} is outside the share")]
    BadRange {
        /// Read offset.
        offset: u64,
        /// Read length.
        length: u64,
    },
    /// The server has no room for the requested allocation.
    #[error("server out of space")]
    OutOfSpace,
    /// The supplied write enabler did not match the slot.
    #[error("bad write enabler")]
    BadWriteEnabler,
    /// No lease matched the supplied renewal secret.
    #[error("no matching lease")]
    LeaseNotFound,
    /// Underlying filesystem failure.
    #[error("storage I/O error: {0}")]
    Io(String),
    /// The server could not be reached or failed mid-operation.
    #[error("server unavailable: {0}")]
    Unavailable(String),
    /// The operation exceeded its deadline.
    #[error("operation timed out")]
    Timeout,
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Persistence contract for share containers.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens an incoming (not yet visible) share of `allocated` bytes.
    async fn create_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        allocated: u64,
    ) -> Result<(), StorageError>;

    /// Writes a chunk into an incoming share.
    async fn write_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Promotes an incoming share to the visible area.
    async fn finalize(&self, si: StorageIndex, sharenum: ShareNum) -> Result<(), StorageError>;

    /// Discards an incoming share.
    async fn abort_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError>;

    /// Share numbers visible for `si`, with their sizes.
    async fn list_shares(
        &self,
        si: StorageIndex,
    ) -> Result<Vec<(ShareNum, u64)>, StorageError>;

    /// Reads up to `length` bytes at `offset`, clamped at the share end.
    async fn read_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError>;

    /// Atomically replaces (or creates) a visible share.
    async fn replace_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        contents: &[u8],
    ) -> Result<(), StorageError>;

    /// Removes a visible share.
    async fn delete_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError>;

    /// Every storage index with at least one visible share.
    async fn list_storage_indices(&self) -> Result<Vec<StorageIndex>, StorageError>;
}

#[derive(Default)]
struct MemState {
    incoming: HashMap<(StorageIndex, ShareNum), Vec<u8>>,
    shares: HashMap<(StorageIndex, ShareNum), Vec<u8>>,
}

/// In-memory backend used by tests and simulations.
#[derive(Default)]
pub struct MemBackend {
    state: Mutex<MemState>,
}

impl MemBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Flips one byte of a stored share; test hook for corruption scenarios.
    pub fn corrupt_share(&self, si: StorageIndex, sharenum: ShareNum, offset: usize) -> bool {
        let mut state = self.state.lock().expect("mem backend lock");
        match state.shares.get_mut(&(si, sharenum)) {
            Some(bytes) if offset < bytes.len() => {
                bytes[offset] ^= 0x01;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl Backend for MemBackend {
    async fn create_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        allocated: u64,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        state.incoming.insert((si, sharenum), vec![0u8; allocated as usize]);
        Ok(())
    }

    async fn write_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        let share = state
            .incoming
            .get_mut(&(si, sharenum))
            .ok_or(StorageError::NotWritable(sharenum))?;
        let end = offset as usize + data.len();
        if end > share.len() {
            return Err(StorageError::PastEof {
                offset,
                length: data.len() as u64,
                allocated: share.len() as u64,
            });
        }
        share[offset as usize..end].copy_from_slice(data);
        Ok(())
    }

    async fn finalize(&self, si: StorageIndex, sharenum: ShareNum) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        let share = state
            .incoming
            .remove(&(si, sharenum))
            .ok_or(StorageError::NotWritable(sharenum))?;
        state.shares.insert((si, sharenum), share);
        Ok(())
    }

    async fn abort_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        state.incoming.remove(&(si, sharenum));
        Ok(())
    }

    async fn list_shares(
        &self,
        si: StorageIndex,
    ) -> Result<Vec<(ShareNum, u64)>, StorageError> {
        let state = self.state.lock().expect("mem backend lock");
        let mut shares: Vec<(ShareNum, u64)> = state
            .shares
            .iter()
            .filter(|((index, _), _)| *index == si)
            .map(|((_, num), bytes)| (*num, bytes.len() as u64))
            .collect();
        shares.sort_unstable();
        Ok(shares)
    }

    async fn read_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let state = self.state.lock().expect("mem backend lock");
        let share = state
            .shares
            .get(&(si, sharenum))
            .ok_or(StorageError::ShareNotFound(sharenum))?;
        let start = (offset as usize).min(share.len());
        let end = (offset as usize).saturating_add(length as usize).min(share.len());
        Ok(share[start..end].to_vec())
    }

    async fn replace_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        state.shares.insert((si, sharenum), contents.to_vec());
        Ok(())
    }

    async fn delete_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let mut state = self.state.lock().expect("mem backend lock");
        state
            .shares
            .remove(&(si, sharenum))
            .ok_or(StorageError::ShareNotFound(sharenum))?;
        Ok(())
    }

    async fn list_storage_indices(&self) -> Result<Vec<StorageIndex>, StorageError> {
        let state = self.state.lock().expect("mem backend lock");
        let mut indices: Vec<StorageIndex> =
            state.shares.keys().map(|(si, _)| *si).collect();
        indices.sort_unstable();
        indices.dedup();
        Ok(indices)
    }
}

/// Filesystem backend storing one file per share.
///
/// Visible shares live under `shares/<prefix>/<si>/<num>` where `<si>` is
/// the base32 storage index and `<prefix>` its first two characters;
/// in-progress shares live under `shares/incoming/` until finalized.
/// Mutable replacement writes a sibling temp file and renames over the
/// target, so readers never observe a torn container.
pub struct DiskBackend {
    base: PathBuf,
}

impl DiskBackend {
    /// Creates a backend rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn incoming_path(&self, si: &StorageIndex, sharenum: ShareNum) -> PathBuf {
        self.base
            .join("shares")
            .join("incoming")
            .join(BASE32.encode(si))
            .join(sharenum.to_string())
    }

    fn share_dir(&self, si: &StorageIndex) -> PathBuf {
        let b32 = BASE32.encode(si);
        self.base.join("shares").join(&b32[..2]).join(b32)
    }

    fn share_path(&self, si: &StorageIndex, sharenum: ShareNum) -> PathBuf {
        self.share_dir(si).join(sharenum.to_string())
    }
}

async fn ensure_parent(path: &Path) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

#[async_trait]
impl Backend for DiskBackend {
    async fn create_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        allocated: u64,
    ) -> Result<(), StorageError> {
        let path = self.incoming_path(&si, sharenum);
        ensure_parent(&path).await?;
        let file = tokio::fs::File::create(&path).await?;
        file.set_len(allocated).await?;
        Ok(())
    }

    async fn write_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let path = self.incoming_path(&si, sharenum);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|_| StorageError::NotWritable(sharenum))?;
        let allocated = file.metadata().await?.len();
        if offset + data.len() as u64 > allocated {
            return Err(StorageError::PastEof {
                offset,
                length: data.len() as u64,
                allocated,
            });
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        file.write_all(data).await?;
        file.flush().await?;
        Ok(())
    }

    async fn finalize(&self, si: StorageIndex, sharenum: ShareNum) -> Result<(), StorageError> {
        let incoming = self.incoming_path(&si, sharenum);
        if !incoming.exists() {
            return Err(StorageError::NotWritable(sharenum));
        }
        let target = self.share_path(&si, sharenum);
        ensure_parent(&target).await?;
        tokio::fs::rename(&incoming, &target).await?;
        Ok(())
    }

    async fn abort_incoming(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let incoming = self.incoming_path(&si, sharenum);
        if incoming.exists() {
            tokio::fs::remove_file(&incoming).await?;
        }
        Ok(())
    }

    async fn list_shares(
        &self,
        si: StorageIndex,
    ) -> Result<Vec<(ShareNum, u64)>, StorageError> {
        let dir = self.share_dir(&si);
        let mut shares = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(shares),
        };
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            if let Some(num) = name.to_str().and_then(|s| s.parse::<ShareNum>().ok()) {
                let size = entry.metadata().await?.len();
                shares.push((num, size));
            }
        }
        shares.sort_unstable();
        Ok(shares)
    }

    async fn read_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        let path = self.share_path(&si, sharenum);
        let mut file = tokio::fs::File::open(&path)
            .await
            .map_err(|_| StorageError::ShareNotFound(sharenum))?;
        let size = file.metadata().await?.len();
        let start = offset.min(size);
        let end = offset.saturating_add(length).min(size);
        let mut buf = vec![0u8; (end - start) as usize];
        file.seek(std::io::SeekFrom::Start(start)).await?;
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }

    async fn replace_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        contents: &[u8],
    ) -> Result<(), StorageError> {
        let target = self.share_path(&si, sharenum);
        ensure_parent(&target).await?;
        let tmp = target.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &target).await?;
        Ok(())
    }

    async fn delete_share(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let path = self.share_path(&si, sharenum);
        tokio::fs::remove_file(&path)
            .await
            .map_err(|_| StorageError::ShareNotFound(sharenum))?;
        // Drop the directory once the last share is gone; harmless if not empty.
        let _ = tokio::fs::remove_dir(self.share_dir(&si)).await;
        Ok(())
    }

    async fn list_storage_indices(&self) -> Result<Vec<StorageIndex>, StorageError> {
        let shares_dir = self.base.join("shares");
        let mut indices = Vec::new();
        let mut prefixes = match tokio::fs::read_dir(&shares_dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(indices),
        };
        while let Some(prefix) = prefixes.next_entry().await? {
            if prefix.file_name() == "incoming" || !prefix.path().is_dir() {
                continue;
            }
            let mut dirs = tokio::fs::read_dir(prefix.path()).await?;
            while let Some(dir) = dirs.next_entry().await? {
                let name = dir.file_name();
                let Some(b32) = name.to_str() else { continue };
                if let Ok(bytes) = BASE32.decode(b32.as_bytes()) {
                    if let Ok(si) = <StorageIndex>::try_from(bytes.as_slice()) {
                        indices.push(si);
                    }
                }
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn si(byte: u8) -> StorageIndex {
        [byte; 16]
    }

    #[tokio::test]
    async fn mem_backend_share_lifecycle() {
        let backend = MemBackend::new();
        backend.create_incoming(si(1), 0, 10).await.unwrap();
        backend.write_incoming(si(1), 0, 0, b"hello").await.unwrap();
        backend.write_incoming(si(1), 0, 5, b"world").await.unwrap();
        // Not visible until finalized.
        assert!(backend.list_shares(si(1)).await.unwrap().is_empty());
        backend.finalize(si(1), 0).await.unwrap();
        assert_eq!(backend.list_shares(si(1)).await.unwrap(), vec![(0, 10)]);
        assert_eq!(
            backend.read_share(si(1), 0, 0, 10).await.unwrap(),
            b"helloworld"
        );
        // Reads clamp at the end of the share.
        assert_eq!(backend.read_share(si(1), 0, 7, 100).await.unwrap(), b"rld");
    }

    #[tokio::test]
    async fn mem_backend_rejects_out_of_bounds_writes() {
        let backend = MemBackend::new();
        backend.create_incoming(si(2), 1, 4).await.unwrap();
        assert!(matches!(
            backend.write_incoming(si(2), 1, 2, b"abc").await,
            Err(StorageError::PastEof { .. })
        ));
    }

    #[tokio::test]
    async fn disk_backend_share_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path());
        backend.create_incoming(si(3), 4, 8).await.unwrap();
        backend.write_incoming(si(3), 4, 0, b"datadata").await.unwrap();
        backend.finalize(si(3), 4).await.unwrap();
        assert_eq!(backend.list_shares(si(3)).await.unwrap(), vec![(4, 8)]);
        assert_eq!(
            backend.read_share(si(3), 4, 4, 4).await.unwrap(),
            b"data"
        );
        assert_eq!(backend.list_storage_indices().await.unwrap(), vec![si(3)]);
        backend.delete_share(si(3), 4).await.unwrap();
        assert!(backend.list_shares(si(3)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn disk_backend_replace_is_whole_container() {
        let dir = tempfile::tempdir().unwrap();
        let backend = DiskBackend::new(dir.path());
        backend.replace_share(si(4), 0, b"version one").await.unwrap();
        backend.replace_share(si(4), 0, b"v2").await.unwrap();
        assert_eq!(backend.read_share(si(4), 0, 0, 64).await.unwrap(), b"v2");
        assert_eq!(backend.list_shares(si(4)).await.unwrap(), vec![(0, 2)]);
    }
}
