//! The client value: configuration, the known-server set, and connection
//! plumbing.
//!
//! All shared state of a storage client hangs off one [`Client`] value that
//! is passed explicitly; there are no process-wide mutables. Connections to
//! servers are trait objects so the transport can be swapped without
//! touching the engines.

use crate::cap::{Capability, ChkRead, MutableRead, MutableWrite};
use crate::crypto::{tagged_hash, LEASE_CANCEL_TAG, LEASE_RENEW_TAG};
use crate::grid::backend::StorageError;
use crate::grid::download::{self, DownloadError};
use crate::grid::mutable::{self, PublishError, RepairReport, RetrieveError};
use crate::grid::select::permute_servers;
use crate::grid::server::{
    AllocationResult, ServerCapabilities, SlotSecrets, SlotTestWrite, StorageServer,
};
use crate::grid::upload::{self, UploadError};
use crate::grid::ServerAnnouncement;
use crate::{ServerId, ShareNum, StorageIndex};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const DEFAULT_SEGMENT_SIZE: u64 = 128 * 1024;
const DEFAULT_RPC_DEADLINE: Duration = Duration::from_secs(240);
const DEFAULT_COOLDOWN_BASE: Duration = Duration::from_secs(10);
const DEFAULT_COOLDOWN_CAP: Duration = Duration::from_secs(300);
const DEFAULT_PUBLISH_RETRIES: u32 = 7;

/// Client-side configuration for uploads, downloads, and mutable files.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Shares needed to reconstruct.
    pub k: u8,
    /// Distinct servers an upload must reach to be accepted.
    pub happy: u8,
    /// Total shares produced.
    pub n: u8,
    /// Segment size for immutable files; a power of two.
    pub segment_size: u64,
    /// Convergence secret; `None` gives every upload a random key.
    pub convergence_secret: Option<[u8; 32]>,
    /// Master secret the per-file lease secrets derive from.
    pub lease_secret: [u8; 32],
    /// Deadline applied to each server operation.
    pub rpc_deadline: Duration,
    /// First cooldown after a server failure; doubles per failure.
    pub cooldown_base: Duration,
    /// Upper bound on the failure cooldown.
    pub cooldown_cap: Duration,
    /// Servers moved to the front of every permutation.
    pub preferred_servers: Vec<ServerId>,
    /// Attempts before a contended mutable publish gives up.
    pub publish_retries: u32,
}

impl ClientConfig {
    /// Builds a config with the given encoding parameters and defaults for
    /// everything else.
    pub fn new(k: u8, happy: u8, n: u8) -> Self {
        Self {
            k,
            happy,
            n,
            segment_size: DEFAULT_SEGMENT_SIZE,
            convergence_secret: Some([0u8; 32]),
            lease_secret: crate::crypto::random_bytes32(),
            rpc_deadline: DEFAULT_RPC_DEADLINE,
            cooldown_base: DEFAULT_COOLDOWN_BASE,
            cooldown_cap: DEFAULT_COOLDOWN_CAP,
            preferred_servers: Vec::new(),
            publish_retries: DEFAULT_PUBLISH_RETRIES,
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new(3, 7, 10)
    }
}

/// Client-side view of the storage server protocol.
///
/// Implementations carry the transport; the engines only ever see this
/// trait. Errors of kind [`StorageError::Unavailable`] and
/// [`StorageError::Timeout`] mark the server cold and make the engines try
/// an alternate.
#[async_trait]
pub trait ServerConnection: Send + Sync {
    /// Advertised server limits.
    async fn version(&self) -> Result<ServerCapabilities, StorageError>;

    /// Opens buckets for the named shares.
    async fn allocate_buckets(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
        sharenums: Vec<ShareNum>,
        allocated_size: u64,
    ) -> Result<AllocationResult, StorageError>;

    /// Closed shares held for `si`, with sizes.
    async fn get_buckets(
        &self,
        si: StorageIndex,
    ) -> Result<BTreeMap<ShareNum, u64>, StorageError>;

    /// Writes a chunk into an open bucket.
    async fn bucket_write(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), StorageError>;

    /// Closes an open bucket.
    async fn bucket_close(&self, si: StorageIndex, sharenum: ShareNum)
        -> Result<(), StorageError>;

    /// Abandons an open bucket.
    async fn bucket_abort(&self, si: StorageIndex, sharenum: ShareNum)
        -> Result<(), StorageError>;

    /// Reads from a closed share.
    async fn bucket_read(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError>;

    /// Attaches a lease to every share of `si`.
    async fn add_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
    ) -> Result<(), StorageError>;

    /// Extends an existing lease.
    async fn renew_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
    ) -> Result<(), StorageError>;

    /// Reads ranges from mutable share data areas.
    async fn slot_readv(
        &self,
        si: StorageIndex,
        shares: Option<Vec<ShareNum>>,
        readv: Vec<(u64, u64)>,
    ) -> Result<BTreeMap<ShareNum, Vec<Vec<u8>>>, StorageError>;

    /// The atomic slot test-and-set.
    async fn slot_testv_and_readv_and_writev(
        &self,
        si: StorageIndex,
        secrets: SlotSecrets,
        tw_vectors: BTreeMap<ShareNum, SlotTestWrite>,
        readv: Vec<(u64, u64)>,
    ) -> Result<(bool, BTreeMap<ShareNum, Vec<Vec<u8>>>), StorageError>;
}

/// Connection to a storage server living in the same process.
///
/// Remote transports implement [`ServerConnection`] elsewhere; this adapter
/// serves tests, simulations, and colocated deployments, and still enforces
/// the per-operation deadline.
pub struct LocalConnection {
    server: Arc<StorageServer>,
    deadline: Duration,
}

impl LocalConnection {
    /// Wraps an in-process server.
    pub fn new(server: Arc<StorageServer>, deadline: Duration) -> Self {
        Self { server, deadline }
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = Result<T, StorageError>> + Send,
    {
        match tokio::time::timeout(self.deadline, fut).await {
            Ok(result) => result,
            Err(_) => Err(StorageError::Timeout),
        }
    }
}

#[async_trait]
impl ServerConnection for LocalConnection {
    async fn version(&self) -> Result<ServerCapabilities, StorageError> {
        Ok(self.server.version())
    }

    async fn allocate_buckets(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
        sharenums: Vec<ShareNum>,
        allocated_size: u64,
    ) -> Result<AllocationResult, StorageError> {
        self.bounded(self.server.allocate_buckets(
            si,
            renew_secret,
            cancel_secret,
            &sharenums,
            allocated_size,
        ))
        .await
    }

    async fn get_buckets(
        &self,
        si: StorageIndex,
    ) -> Result<BTreeMap<ShareNum, u64>, StorageError> {
        self.bounded(self.server.get_buckets(si)).await
    }

    async fn bucket_write(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        data: Vec<u8>,
    ) -> Result<(), StorageError> {
        self.bounded(self.server.bucket_write(si, sharenum, offset, &data))
            .await
    }

    async fn bucket_close(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        self.bounded(self.server.bucket_close(si, sharenum)).await
    }

    async fn bucket_abort(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
    ) -> Result<(), StorageError> {
        self.bounded(self.server.bucket_abort(si, sharenum)).await
    }

    async fn bucket_read(
        &self,
        si: StorageIndex,
        sharenum: ShareNum,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, StorageError> {
        self.bounded(self.server.bucket_read(si, sharenum, offset, length))
            .await
    }

    async fn add_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
        cancel_secret: [u8; 32],
    ) -> Result<(), StorageError> {
        self.bounded(self.server.add_lease(si, renew_secret, cancel_secret))
            .await
    }

    async fn renew_lease(
        &self,
        si: StorageIndex,
        renew_secret: [u8; 32],
    ) -> Result<(), StorageError> {
        self.bounded(self.server.renew_lease(si, renew_secret)).await
    }

    async fn slot_readv(
        &self,
        si: StorageIndex,
        shares: Option<Vec<ShareNum>>,
        readv: Vec<(u64, u64)>,
    ) -> Result<BTreeMap<ShareNum, Vec<Vec<u8>>>, StorageError> {
        self.bounded(self.server.slot_readv(si, shares, readv)).await
    }

    async fn slot_testv_and_readv_and_writev(
        &self,
        si: StorageIndex,
        secrets: SlotSecrets,
        tw_vectors: BTreeMap<ShareNum, SlotTestWrite>,
        readv: Vec<(u64, u64)>,
    ) -> Result<(bool, BTreeMap<ShareNum, Vec<Vec<u8>>>), StorageError> {
        self.bounded(
            self.server
                .slot_testv_and_readv_and_writev(si, secrets, tw_vectors, readv),
        )
        .await
    }
}

/// A known server: its announcement plus a live connection.
#[derive(Clone)]
pub struct GridServer {
    /// Identity, location, and permutation seed.
    pub announcement: ServerAnnouncement,
    /// Connection used for protocol operations.
    pub connection: Arc<dyn ServerConnection>,
}

impl GridServer {
    /// The server's stable identity.
    pub fn id(&self) -> ServerId {
        self.announcement.server_id
    }
}

struct ColdEntry {
    failures: u32,
    until: Instant,
}

/// A storage grid client.
pub struct Client {
    config: ClientConfig,
    servers: RwLock<Vec<GridServer>>,
    cold: Mutex<HashMap<ServerId, ColdEntry>>,
}

impl Client {
    /// Builds a client with no servers yet.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(Vec::new()),
            cold: Mutex::new(HashMap::new()),
        }
    }

    /// The active configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Registers a server; the introducer subscription is the single writer
    /// of this set.
    pub fn add_server(&self, announcement: ServerAnnouncement, connection: Arc<dyn ServerConnection>) {
        let mut servers = self.servers.write().expect("server set lock");
        servers.retain(|s| s.announcement.server_id != announcement.server_id);
        servers.push(GridServer {
            announcement,
            connection,
        });
    }

    /// Removes a server from the set.
    pub fn remove_server(&self, server_id: &ServerId) {
        let mut servers = self.servers.write().expect("server set lock");
        servers.retain(|s| &s.announcement.server_id != server_id);
    }

    /// Snapshot of every known server.
    pub fn known_servers(&self) -> Vec<GridServer> {
        self.servers.read().expect("server set lock").clone()
    }

    /// The permuted candidate list for `si`: preferred servers first, cold
    /// servers pushed to the back, permuted order preserved within each
    /// group.
    pub fn candidate_servers(&self, si: &StorageIndex) -> Vec<GridServer> {
        let servers = self.known_servers();
        let announcements: Vec<ServerAnnouncement> =
            servers.iter().map(|s| s.announcement.clone()).collect();
        let by_id: HashMap<ServerId, GridServer> =
            servers.into_iter().map(|s| (s.id(), s)).collect();
        let permuted = permute_servers(si, &announcements, &self.config.preferred_servers);
        let now = Instant::now();
        let cold = self.cold.lock().expect("cold table lock");
        let (warm, chilled): (Vec<_>, Vec<_>) = permuted
            .into_iter()
            .filter_map(|a| by_id.get(&a.server_id).cloned())
            .partition(|s| match cold.get(&s.id()) {
                Some(entry) => entry.until <= now,
                None => true,
            });
        warm.into_iter().chain(chilled).collect()
    }

    /// Marks a server failed, doubling its cooldown up to the cap.
    pub fn note_failure(&self, server_id: ServerId) {
        let mut cold = self.cold.lock().expect("cold table lock");
        let entry = cold.entry(server_id).or_insert(ColdEntry {
            failures: 0,
            until: Instant::now(),
        });
        entry.failures += 1;
        let backoff = self
            .config
            .cooldown_base
            .saturating_mul(1u32 << entry.failures.min(16).saturating_sub(1))
            .min(self.config.cooldown_cap);
        entry.until = Instant::now() + backoff;
        eprintln!(
            "server {} marked cold for {}ms after {} failures",
            hex::encode(server_id),
            backoff.as_millis(),
            entry.failures
        );
    }

    /// Clears a server's failure history after a successful operation.
    pub fn note_success(&self, server_id: ServerId) {
        let mut cold = self.cold.lock().expect("cold table lock");
        cold.remove(&server_id);
    }

    /// Lease renewal secret for `si`, derived from the client master secret.
    pub fn renew_secret_for(&self, si: &StorageIndex) -> [u8; 32] {
        tagged_hash(LEASE_RENEW_TAG, &[&self.config.lease_secret, si])
    }

    /// Lease cancellation secret for `si`.
    pub fn cancel_secret_for(&self, si: &StorageIndex) -> [u8; 32] {
        tagged_hash(LEASE_CANCEL_TAG, &[&self.config.lease_secret, si])
    }

    /// Uploads an immutable file and returns its capability.
    pub async fn upload(&self, plaintext: &[u8]) -> Result<Capability, UploadError> {
        upload::upload(self, plaintext).await
    }

    /// Downloads a whole file named by `cap`.
    pub async fn download(&self, cap: &Capability) -> Result<Vec<u8>, DownloadError> {
        // A directory is just a file whose plaintext is the serialized
        // directory, so unwrap any DIR2 layers first.
        let mut cap = cap;
        while let Capability::Dir2(inner) = cap {
            cap = inner;
        }
        match cap {
            Capability::Lit(lit) => Ok(lit.data.clone()),
            Capability::Chk(chk) => download::download(self, chk).await,
            other => Err(DownloadError::NotDownloadable(format!("{other:?}"))),
        }
    }

    /// Downloads `length` bytes at `offset` of an immutable file.
    pub async fn download_range(
        &self,
        cap: &ChkRead,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, DownloadError> {
        download::download_range(self, cap, offset, length).await
    }

    /// Creates a mutable file holding `contents` and returns its write cap.
    pub async fn create_mutable(&self, contents: &[u8]) -> Result<MutableWrite, PublishError> {
        mutable::create(self, contents).await
    }

    /// Publishes a new version of a mutable file, returning its seqnum.
    pub async fn publish(
        &self,
        writecap: &MutableWrite,
        contents: &[u8],
    ) -> Result<u64, PublishError> {
        mutable::publish(self, writecap, contents).await
    }

    /// Retrieves the best recoverable version of a mutable file.
    pub async fn retrieve(
        &self,
        readcap: &MutableRead,
    ) -> Result<(u64, Vec<u8>), RetrieveError> {
        mutable::retrieve(self, readcap).await
    }

    /// Restores full share coverage of a mutable file's best version.
    pub async fn repair(&self, writecap: &MutableWrite) -> Result<RepairReport, PublishError> {
        mutable::repair(self, writecap).await
    }

    /// Renews this client's leases on `si` across all reachable servers.
    pub async fn renew_leases(&self, si: &StorageIndex) -> usize {
        let renew = self.renew_secret_for(si);
        let mut renewed = 0;
        for server in self.candidate_servers(si) {
            if server.connection.renew_lease(*si, renew).await.is_ok() {
                renewed += 1;
            }
        }
        renewed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::backend::MemBackend;
    use crate::grid::server::ServerConfig;

    fn local_server(id: u8) -> (ServerAnnouncement, Arc<dyn ServerConnection>) {
        let server = Arc::new(StorageServer::new(
            ServerConfig::new([id; 20]),
            Arc::new(MemBackend::new()),
        ));
        let announcement = ServerAnnouncement {
            server_id: [id; 20],
            furl: format!("local:{id}"),
            permutation_seed: [id; 32],
        };
        (
            announcement,
            Arc::new(LocalConnection::new(server, Duration::from_secs(240))),
        )
    }

    #[test]
    fn add_server_replaces_by_identity() {
        let client = Client::new(ClientConfig::default());
        let (a, conn_a) = local_server(1);
        client.add_server(a.clone(), conn_a);
        let (mut b, conn_b) = local_server(1);
        b.furl = "local:relocated".to_string();
        client.add_server(b, conn_b);
        let servers = client.known_servers();
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].announcement.furl, "local:relocated");
    }

    #[test]
    fn cold_servers_sink_to_the_back() {
        let client = Client::new(ClientConfig::default());
        for id in 1..=4 {
            let (a, conn) = local_server(id);
            client.add_server(a, conn);
        }
        let si = [0x55; 16];
        let order = client.candidate_servers(&si);
        let first = order[0].id();
        client.note_failure(first);
        let reordered = client.candidate_servers(&si);
        assert_eq!(reordered.last().unwrap().id(), first);
        // Membership unchanged.
        assert_eq!(reordered.len(), 4);
        client.note_success(first);
        assert_eq!(client.candidate_servers(&si)[0].id(), first);
    }

    #[test]
    fn lease_secrets_differ_by_storage_index_and_kind() {
        let client = Client::new(ClientConfig::default());
        let a = client.renew_secret_for(&[1u8; 16]);
        let b = client.renew_secret_for(&[2u8; 16]);
        assert_ne!(a, b);
        assert_ne!(a, client.cancel_secret_for(&[1u8; 16]));
        // Stable for the same index.
        assert_eq!(a, client.renew_secret_for(&[1u8; 16]));
    }

    #[tokio::test]
    async fn lit_caps_download_without_servers() {
        let client = Client::new(ClientConfig::default());
        let cap = Capability::Lit(crate::cap::LitCap {
            data: b"Hello\n".to_vec(),
        });
        assert_eq!(client.download(&cap).await.unwrap(), b"Hello\n");
    }
}
