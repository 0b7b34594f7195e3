//! The storage server: bucket allocation, leases, and the atomic slot
//! operation.
//!
//! A server never interprets share contents. It serializes all work on a
//! storage-index, enforces write enablers on mutable slots, and garbage
//! collects shares whose leases have all expired via an incremental crawler
//! that survives restarts.

use crate::grid::backend::{Backend, StorageError};
use crate::slot::MutableContainer;
use crate::{ServerId, ShareNum, StorageIndex};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(31 * 24 * 60 * 60);
const DEFAULT_MAX_SHARE_SIZE: u64 = 1 << 40;
const LEASE_FILE: &str = "leases.json";
const CRAWLER_FILE: &str = "lease_crawler.json";

/// Storage server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// This server's stable 20-byte identity.
    pub server_id: ServerId,
    /// How long a fresh or renewed lease lasts.
    pub lease_duration: Duration,
    /// Largest share allocation the server will accept.
    pub max_share_size: u64,
    /// Advertised free space; `None` means unaccounted.
    pub available_space: Option<u64>,
    /// Directory for the lease table and crawler cursor; `None` keeps them
    /// in memory only.
    pub state_dir: Option<PathBuf>,
}

impl ServerConfig {
    /// Builds a config with production defaults.
    pub fn new(server_id: ServerId) -> Self {
        Self {
            server_id,
            lease_duration: DEFAULT_LEASE_DURATION,
            max_share_size: DEFAULT_MAX_SHARE_SIZE,
            available_space: None,
            state_dir: None,
        }
    }
}

/// Capability record a server advertises to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    /// Largest immutable share the server accepts.
    pub maximum_immutable_share_size: u64,
    /// Largest mutable container the server accepts.
    pub maximum_mutable_share_size: u64,
    /// Advertised free space, if accounted.
    pub available_space: Option<u64>,
}

/// Result of a bucket allocation request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationResult {
    /// Shares the server already holds closed; the uploader treats these as
    /// successfully placed.
    pub already_have: BTreeSet<ShareNum>,
    /// Shares the server opened (or re-opened) for writing.
    pub allocated: BTreeSet<ShareNum>,
}

/// Secrets accompanying a mutable slot operation.
#[derive(Debug, Clone)]
pub struct SlotSecrets {
    /// Gates writes; checked against the stored container header.
    pub write_enabler: [u8; 32],
    /// Lease renewal secret, upserted on successful writes.
    pub renew_secret: [u8; 32],
    /// Lease cancellation secret recorded alongside.
    pub cancel_secret: [u8; 32],
}

/// Comparison applied by a test vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestOp {
    /// Observed bytes must equal the specimen.
    Eq,
    /// Observed bytes must be lexicographically at most the specimen.
    Le,
    /// Observed bytes must be lexicographically at least the specimen.
    Ge,
}

/// A single condition over the current data area of one share.
#[derive(Debug, Clone)]
pub struct TestVector {
    /// Byte offset into the data area.
    pub offset: u64,
    /// Comparison operator.
    pub op: TestOp,
    /// Bytes the observed range is compared against.
    pub specimen: Vec<u8>,
}

impl TestVector {
    fn passes(&self, data: &[u8]) -> bool {
        let observed = read_window(data, self.offset, self.specimen.len() as u64);
        match self.op {
            TestOp::Eq => observed == self.specimen,
            TestOp::Le => observed <= self.specimen,
            TestOp::Ge => observed >= self.specimen,
        }
    }
}

/// Tests and writes for one share inside a slot operation.
#[derive(Debug, Clone, Default)]
pub struct SlotTestWrite {
    /// Conditions that must all hold before anything is written.
    pub tests: Vec<TestVector>,
    /// Write vectors applied on success, in order.
    pub writes: Vec<(u64, Vec<u8>)>,
    /// Final data-area length, truncating or zero-extending if set.
    pub new_length: Option<u64>,
}

/// Report of one lease crawler step.
#[derive(Debug, Clone, Default)]
pub struct CrawlReport {
    /// Storage indexes examined in this step.
    pub examined: usize,
    /// Shares deleted because every lease had expired.
    pub deleted_shares: usize,
    /// True when the step wrapped around the end of the keyspace.
    pub cycle_completed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct LeaseRecord {
    renew_secret: [u8; 32],
    cancel_secret: [u8; 32],
    expiration: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseTable {
    leases: HashMap<String, Vec<LeaseRecord>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct CrawlerCursor {
    last: Option<String>,
}

struct InProgress {
    allocated: u64,
    written: u64,
}

#[derive(Default)]
struct ServerState {
    in_progress: HashMap<(StorageIndex, ShareNum), InProgress>,
    leases: HashMap<StorageIndex, Vec<LeaseRecord>>,
    si_locks: HashMap<StorageIndex, Arc<tokio::sync::Mutex<()>>>,
}

/// A storage server bound to a backend.
pub struct StorageServer {
    cfg: ServerConfig,
    backend: Arc<dyn Backend>,
    state: Mutex<ServerState>,
}

impl StorageServer {
    /// Builds a server, loading any persisted lease table.
    pub fn new(cfg: ServerConfig, backend: Arc<dyn Backend>) -> Self {
        let mut state = ServerState::default();
        if let Some(dir) = &cfg.state_dir {
            if let Ok(contents) = std::fs::read_to_string(dir.join(LEASE_FILE)) {
                if let Ok(table) = serde_json::from_str::<LeaseTable>(&contents) {
                    for (key, records) in table.leases {
                        if let Some(si) = si_from_hex(&key) {
                            state.leases.insert(si, records);
                        }
                    }
                }
            }
        }
        Self {
            cfg,
            backend,
            state: Mutex::new(state),
        }
    }

    /// This server's identity.
    pub fn server_id(&self) -> ServerId {
        self.cfg.server_id
    }

    /// The capability record advertised to clients.
    pub fn version(&self) -> ServerCapabilities {
        ServerCapabilities {
            maximum_immutable_share_size: self.cfg.max_share_size,
            maximum_mutable_share_size: self.cfg.max_share_size,
            available_space: self.cfg.available_space,
        }
    }

    fn si_lock(&self, si: StorageIndex) -> Arc<tokio::sync::Mutex<()>> {
        let mut state = self.state.lock().expect("server state lock");
        state
            .si_locks
            .entry(si)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn upsert_lease(&self, si: StorageIndex, renew: [u8; 32], cancel: [u8; 32]) {
        let expiration = unix_now() + self.cfg.lease_duration.as_secs();
        let mut state = self.state.lock().expect("server state lock");
        let records = state.leases.entry(si).or_default();
        match records.iter_mut().find(|r| r.renew_secret == renew) {
            // Expiration only ever moves forward.
            Some(record) => record.expiration = record.expiration.max(expiration),
            None => records.push(LeaseRecord {
                renew_secret: renew,
                cancel_secret: cancel,
                expiration,
            }),
        }
        drop(state);
        self.persist_leases();
    }

    fn persist_leases(&self) {
        let Some(dir) = &self.cfg.state_dir else { return };
        let table = {
            let state = self.state.lock().expect("server state lock");
            LeaseTable {
                leases: state
                    .leases
                    .iter()
                    .map(|(si, records)| (hex::encode(si), records.clone()))
                    .collect(),
            }
        };
        if std::fs::create_dir_all(dir).is_err() {
            return;
        }
        let path = dir.join(LEASE_FILE);
        let tmp = dir.join(format!("{LEASE_FILE}.tmp"));
        if let Ok(contents) = serde_json::to_string_pretty(&table) {
            if std::fs::write(&tmp, contents).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
    }

    /// Opens buckets for the named shares.
    ///
    /// Shares already written and closed come back in `already_have`;
    /// partially written shares are re-offered for writing, matching what
    /// an interrupted uploader needs to resume.
    pub async fn allocate_buckets(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
        sharenums: &[ShareNum],
        allocated_size: u64,
    ) -> Result<AllocationResult, StorageError> {
        if allocated_size > self.cfg.max_share_size {
            return Err(StorageError::OutOfSpace);
        }
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;

        let existing: BTreeSet<ShareNum> = self
            .backend
            .list_shares(si)
            .await?
            .into_iter()
            .map(|(num, _)| num)
            .collect();
        if let Some(available) = self.cfg.available_space {
            let fresh = sharenums
                .iter()
                .filter(|num| !existing.contains(num))
                .count() as u64;
            if fresh * allocated_size > available {
                return Err(StorageError::OutOfSpace);
            }
        }

        let mut result = AllocationResult::default();
        for &num in sharenums {
            if existing.contains(&num) {
                result.already_have.insert(num);
                continue;
            }
            let reopened = {
                let state = self.state.lock().expect("server state lock");
                state.in_progress.contains_key(&(si, num))
            };
            if !reopened {
                self.backend.create_incoming(si, num, allocated_size).await?;
                let mut state = self.state.lock().expect("server state lock");
                state.in_progress.insert(
                    (si, num),
                    InProgress {
                        allocated: allocated_size,
                        written: 0,
                    },
                );
            }
            result.allocated.insert(num);
        }
        self.upsert_lease(si, renew_secret, cancel_secret);
        println!(
            "GRID|mod=SERVER|evt=ALLOCATE|si={}|new={}|have={}|size={}",
            hex::encode(si),
            result.allocated.len(),
            result.already_have.len(),
            allocated_size
        );
        Ok(result)
    }

    /// Writes a chunk into an open bucket.
    pub async fn bucket_write(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;
        {
            let state = self.state.lock().expect("server state lock");
            let progress = state
                .in_progress
                .get(&(si, sharenum))
                .ok_or(StorageError::NotWritable(sharenum))?;
            if offset + data.len() as u64 > progress.allocated {
                return Err(StorageError::PastEof {
                    offset,
                    length: data.len() as u64,
                    allocated: progress.allocated,
                });
            }
        }
        self.backend.write_incoming(si, sharenum, offset, data).await?;
        let mut state = self.state.lock().expect("server state lock");
        if let Some(progress) = state.in_progress.get_mut(&(si, sharenum)) {
            progress.written = progress.written.max(offset + data.len() as u64);
        }
        Ok(())
    }

    /// Closes an open bucket, making the share visible to readers.
    pub async fn bucket_close(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;
        {
            let state = self.state.lock().expect("server state lock");
            let progress = state
                .in_progress
                .get(&(si, sharenum))
                .ok_or(StorageError::NotWritable(sharenum))?;
            if progress.written < progress.allocated {
                return Err(StorageError::Incomplete {
                    written: progress.written,
                    allocated: progress.allocated,
                });
            }
        }
        self.backend.finalize(si, sharenum).await?;
        let mut state = self.state.lock().expect("server state lock");
        state.in_progress.remove(&(si, sharenum));
        println!(
            "GRID|mod=SERVER|evt=CLOSE|si={}|share={sharenum}",
            hex::encode(si)
        );
        Ok(())
    }

    /// Abandons an open bucket, discarding whatever was written.
    pub async fn bucket_abort(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;
        self.backend.abort_incoming(si, sharenum).await?;
        let mut state = self.state.lock().expect("server state lock");
        state.in_progress.remove(&(si, sharenum));
        Ok(())
    }

    /// Closed shares held for `si`, with sizes.
    pub async fn get_buckets(
        &self,
        si: StorageIndex,
    ) -> Result<BTreeMap<ShareNum, u64>, StorageError> {
        Ok(self.backend.list_shares(si).await?.into_iter().collect())
    }

    /// Reads from a closed share; the range is clamped at the share end.
    pub async fn bucket_read(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        self.backend.read_share(si, sharenum, offset, length).await
    }

    /// Attaches a lease to every share of `si`.
    pub async fn add_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
    ) -> Result<(), StorageError> {
        if self.backend.list_shares(si).await?.is_empty() {
            return Err(StorageError::UnknownStorageIndex);
        }
        self.upsert_lease(si, renew_secret, cancel_secret);
        Ok(())
    }

    /// Extends an existing lease; the matching record's expiration moves
    /// forward, never back.
    pub async fn renew_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
    ) -> Result<(), StorageError> {
        let expiration = unix_now() + self.cfg.lease_duration.as_secs();
        {
            let mut state = self.state.lock().expect("server state lock");
            let records = state
                .leases
                .get_mut(&si)
                .ok_or(StorageError::UnknownStorageIndex)?;
            let record = records
                .iter_mut()
                .find(|r| r.renew_secret == renew_secret)
                .ok_or(StorageError::LeaseNotFound)?;
            record.expiration = record.expiration.max(expiration);
        }
        self.persist_leases();
        Ok(())
    }

    /// Reads ranges from the data areas of mutable shares without secrets.
    ///
    /// `shares` limits the result; `None` reads every share present.
    pub async fn slot_readv(
        &self,
        si: StorageIndex,
        shares: Option<Vec<ShareNum>>,
        readv: Vec<(u64, u64)>,
    ) -> Result<BTreeMap<ShareNum, Vec<Vec<u8>>>, StorageError> {
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;
        let present: Vec<ShareNum> = self
            .backend
            .list_shares(si)
            .await?
            .into_iter()
            .map(|(num, _)| num)
            .filter(|num| shares.as_ref().map_or(true, |wanted| wanted.contains(num)))
            .collect();
        let mut out = BTreeMap::new();
        for num in present {
            let container = self.load_container(si, num).await?;
            let reads = readv
                .iter()
                .map(|&(offset, length)| read_window(&container.data, offset, length))
                .collect();
            out.insert(num, reads);
        }
        Ok(out)
    }

    /// The atomic test-and-set over a storage-index's mutable shares.
    ///
    /// All test vectors are evaluated against the current data areas. If
    /// every one passes, all write vectors apply and the reads observe the
    /// written state; otherwise nothing is written and the reads return the
    /// pre-existing bytes. This is the grid's only concurrency primitive
    /// for mutable files.
    pub async fn slot_testv_and_readv_and_writev(
        &self,
        si: StorageIndex,
        secrets: SlotSecrets,
        tw_vectors: BTreeMap<ShareNum, SlotTestWrite>,
        readv: Vec<(u64, u64)>,
    ) -> Result<(bool, BTreeMap<ShareNum, Vec<Vec<u8>>>), StorageError> {
        let lock = self.si_lock(si);
        let _guard = lock.lock().await;

        let present: Vec<ShareNum> = self
            .backend
            .list_shares(si)
            .await?
            .into_iter()
            .map(|(num, _)| num)
            .collect();
        let mut containers: HashMap<ShareNum, MutableContainer> = HashMap::new();
        for &num in &present {
            containers.insert(num, self.load_container(si, num).await?);
        }

        let any_write = tw_vectors.values().any(|tw| !tw.writes.is_empty());
        if any_write {
            for num in tw_vectors.keys() {
                if let Some(container) = containers.get(num) {
                    if container.write_enabler != secrets.write_enabler {
                        return Err(StorageError::BadWriteEnabler);
                    }
                }
            }
        }

        let empty = Vec::new();
        let success = tw_vectors.iter().all(|(num, tw)| {
            let data = containers.get(num).map(|c| c.data.as_slice()).unwrap_or(&empty);
            tw.tests.iter().all(|test| test.passes(data))
        });

        if success {
            for (num, tw) in &tw_vectors {
                if tw.writes.is_empty() && tw.new_length.is_none() {
                    continue;
                }
                let mut data = containers
                    .get(num)
                    .map(|c| c.data.clone())
                    .unwrap_or_default();
                for (offset, bytes) in &tw.writes {
                    let end = *offset as usize + bytes.len();
                    if data.len() < end {
                        data.resize(end, 0);
                    }
                    data[*offset as usize..end].copy_from_slice(bytes);
                }
                if let Some(new_length) = tw.new_length {
                    data.resize(new_length as usize, 0);
                }
                let container = MutableContainer {
                    write_enabler_nodeid: self.cfg.server_id,
                    write_enabler: secrets.write_enabler,
                    data,
                };
                self.backend
                    .replace_share(si, *num, &container.encode())
                    .await?;
                containers.insert(*num, container);
            }
            self.upsert_lease(si, secrets.renew_secret, secrets.cancel_secret);
        }

        let mut reads = BTreeMap::new();
        let mut read_targets: BTreeSet<ShareNum> = containers.keys().copied().collect();
        read_targets.extend(tw_vectors.keys());
        for num in read_targets {
            let data = containers.get(&num).map(|c| c.data.as_slice()).unwrap_or(&empty);
            reads.insert(
                num,
                readv
                    .iter()
                    .map(|&(offset, length)| read_window(data, offset, length))
                    .collect(),
            );
        }
        println!(
            "GRID|mod=SERVER|evt=SLOT_TSET|si={}|shares={}|ok={}",
            hex::encode(si),
            tw_vectors.len(),
            success
        );
        Ok((success, reads))
    }

    async fn load_container(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<MutableContainer, StorageError> {
        let bytes = self
            .backend
            .read_share(si, sharenum, 0, u64::MAX)
            .await?;
        MutableContainer::decode(&bytes)
            .map_err(|err| StorageError::Io(format!("share {sharenum}: {err}")))
    }

    /// Advances the lease crawler by up to `batch` storage indexes,
    /// deleting shares whose leases have all expired.
    ///
    /// The cursor persists across restarts when a state directory is
    /// configured, so a long keyspace is ground down incrementally.
    pub async fn crawl_leases(&self, batch: usize) -> Result<CrawlReport, StorageError> {
        let cursor_path = self.cfg.state_dir.as_ref().map(|d| d.join(CRAWLER_FILE));
        let mut cursor = CrawlerCursor::default();
        if let Some(path) = &cursor_path {
            if let Ok(contents) = std::fs::read_to_string(path) {
                cursor = serde_json::from_str(&contents).unwrap_or_default();
            }
        }
        let last = cursor.last.as_deref().and_then(si_from_hex);

        let mut indices = self.backend.list_storage_indices().await?;
        indices.sort_unstable();
        let start = match last {
            Some(si) => indices.partition_point(|&x| x <= si),
            None => 0,
        };
        let now = unix_now();
        let mut report = CrawlReport::default();
        let mut position = start;
        while report.examined < batch {
            if position >= indices.len() {
                report.cycle_completed = true;
                cursor.last = None;
                break;
            }
            let si = indices[position];
            position += 1;
            report.examined += 1;
            cursor.last = Some(hex::encode(si));

            let expired = {
                let state = self.state.lock().expect("server state lock");
                match state.leases.get(&si) {
                    Some(records) => records.iter().all(|r| r.expiration <= now),
                    // No lease was ever recorded; nothing holds the shares.
                    None => true,
                }
            };
            if !expired {
                continue;
            }
            let lock = self.si_lock(si);
            let _guard = lock.lock().await;
            for (num, _) in self.backend.list_shares(si).await? {
                self.backend.delete_share(si, num).await?;
                report.deleted_shares += 1;
            }
            {
                let mut state = self.state.lock().expect("server state lock");
                state.leases.remove(&si);
            }
            self.persist_leases();
            println!("GRID|mod=SERVER|evt=EXPIRE|si={}", hex::encode(si));
            tokio::task::yield_now().await;
        }
        if let Some(path) = &cursor_path {
            if let Some(dir) = path.parent() {
                let _ = std::fs::create_dir_all(dir);
            }
            if let Ok(contents) = serde_json::to_string(&cursor) {
                let _ = std::fs::write(path, contents);
            }
        }
        Ok(report)
    }
}

fn read_window(data: &[u8], offset: u64, length: u64) -> Vec<u8> {
    let start = (offset as usize).min(data.len());
    let end = (offset as usize).saturating_add(length as usize).min(data.len());
    data[start..end].to_vec()
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn si_from_hex(input: &str) -> Option<StorageIndex> {
    let bytes = hex::decode(input).ok()?;
    StorageIndex::try_from(bytes.as_slice()).ok()
}
