//! The storage grid: server protocol, peer selection, and the engines that
//! move shares.
//!
//! Servers are untrusted with content and semi-trusted with availability:
//! they only ever see opaque share containers keyed by storage-index. The
//! client engines in this module place, fetch, and update those shares, and
//! verify everything they accept against the capability in hand.

/// Pluggable persistence for share containers.
pub mod backend;
/// The client value, configuration, and server connections.
pub mod client;
/// Verified immutable download engine.
pub mod download;
/// Mutable slot publish, retrieve, and repair.
pub mod mutable;
/// Server permutation and the happiness predicate.
pub mod select;
/// The storage server and its share protocol.
pub mod server;
/// Immutable encode-and-upload engine.
pub mod upload;

pub use backend::{Backend, DiskBackend, MemBackend, StorageError};
pub use client::{Client, ClientConfig, GridServer, LocalConnection, ServerConnection};
pub use download::DownloadError;
pub use mutable::{PublishError, RepairReport, RetrieveError};
pub use select::servers_of_happiness;
pub use server::{
    AllocationResult, CrawlReport, ServerCapabilities, ServerConfig, SlotSecrets, SlotTestWrite,
    StorageServer, TestOp, TestVector,
};
pub use upload::UploadError;

use crate::ServerId;

/// Announcement describing a reachable storage server.
///
/// Produced by the introduction subsystem, which is outside this crate; the
/// grid only needs a stable identity, a way to reach the server, and the
/// seed that places it on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAnnouncement {
    /// Stable 20-byte server identity.
    pub server_id: ServerId,
    /// Opaque location string understood by the transport layer.
    pub furl: String,
    /// Seed mixed with each storage-index to permute the ring.
    pub permutation_seed: [u8; 32],
}

#[cfg(test)]
mod tests {
    use super::backend::{Backend, MemBackend, StorageError};
    use super::client::{Client, ClientConfig, LocalConnection, ServerConnection};
    use super::download::DownloadError;
    use super::mutable::PublishError;
    use super::server::{
        AllocationResult, ServerCapabilities, ServerConfig, SlotSecrets, SlotTestWrite,
        StorageServer,
    };
    use super::upload::UploadError;
    use super::ServerAnnouncement;
    use crate::cap::Capability;
    use crate::{ShareNum, StorageIndex};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    struct TestGrid {
        client: Client,
        servers: Vec<(Arc<StorageServer>, Arc<MemBackend>)>,
    }

    fn announcement(id: u8) -> ServerAnnouncement {
        ServerAnnouncement {
            server_id: [id; 20],
            furl: format!("local:{id}"),
            permutation_seed: [id; 32],
        }
    }

    fn grid(cfg: ClientConfig, count: u8) -> TestGrid {
        let client = Client::new(cfg);
        let mut servers = Vec::new();
        for id in 1..=count {
            let backend = Arc::new(MemBackend::new());
            let server = Arc::new(StorageServer::new(
                ServerConfig::new([id; 20]),
                backend.clone(),
            ));
            client.add_server(
                announcement(id),
                Arc::new(LocalConnection::new(server.clone(), Duration::from_secs(240))),
            );
            servers.push((server, backend));
        }
        TestGrid { client, servers }
    }

    /// A client that can only reach the given subset of an existing grid.
    fn subset_client(cfg: ClientConfig, grid: &TestGrid, ids: &[u8]) -> Client {
        let client = Client::new(cfg);
        for (server, _) in &grid.servers {
            let id = server.server_id()[0];
            if ids.contains(&id) {
                client.add_server(
                    announcement(id),
                    Arc::new(LocalConnection::new(server.clone(), Duration::from_secs(240))),
                );
            }
        }
        client
    }

    fn chk_of(cap: &Capability) -> &crate::cap::ChkRead {
        match cap {
            Capability::Chk(chk) => chk,
            other => panic!("expected CHK capability, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn tiny_files_become_literals_without_servers() {
        // No servers registered at all; a literal upload must not care.
        let client = Client::new(ClientConfig::default());
        let cap = client.upload(b"Hello\n").await.unwrap();
        assert!(cap.to_string().starts_with("URI:LIT:"));
        assert_eq!(client.download(&cap).await.unwrap(), b"Hello\n");
    }

    #[tokio::test]
    async fn upload_is_convergent_and_any_k_servers_reconstruct() {
        let cfg = ClientConfig::new(3, 7, 10);
        let grid = grid(cfg.clone(), 10);
        let plaintext = vec![0u8; 1 << 20];

        let cap = grid.client.upload(&plaintext).await.unwrap();
        let chk = chk_of(&cap);
        assert_eq!((chk.k, chk.n, chk.size), (3, 10, 1 << 20));

        // Same bytes, same convergence secret: the capability is identical
        // and servers report the shares as already present.
        let cap2 = grid.client.upload(&plaintext).await.unwrap();
        assert_eq!(cap.to_string(), cap2.to_string());

        assert_eq!(grid.client.download(&cap).await.unwrap(), plaintext);

        // Any three servers are enough for k = 3.
        let si = chk.storage_index();
        let mut holding = Vec::new();
        for (server, _) in &grid.servers {
            if !server.get_buckets(si).await.unwrap().is_empty() {
                holding.push(server.server_id()[0]);
            }
        }
        assert_eq!(holding.len(), 10);
        let narrow = subset_client(cfg, &grid, &holding[..3]);
        assert_eq!(narrow.download(&cap).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn boundary_sizes_roundtrip() {
        let mut cfg = ClientConfig::new(3, 4, 5);
        cfg.segment_size = 1024;
        let grid = grid(cfg, 5);
        let segment = 1024usize;
        for size in [0, 1, 55, 56, segment, segment + 1, 5 * segment + 17] {
            let plaintext: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let cap = grid.client.upload(&plaintext).await.unwrap();
            if size <= 55 {
                assert!(matches!(cap, Capability::Lit(_)), "size {size}");
            } else {
                assert!(matches!(cap, Capability::Chk(_)), "size {size}");
            }
            assert_eq!(grid.client.download(&cap).await.unwrap(), plaintext, "size {size}");
        }
    }

    #[tokio::test]
    async fn partial_range_reads_fetch_only_overlap() {
        let mut cfg = ClientConfig::new(2, 3, 4);
        cfg.segment_size = 1024;
        let grid = grid(cfg, 4);
        let plaintext: Vec<u8> = (0..5000).map(|i| (i % 241) as u8).collect();
        let cap = grid.client.upload(&plaintext).await.unwrap();
        let chk = chk_of(&cap);

        for (offset, length) in [(0u64, 10u64), (1000, 100), (1023, 2), (4990, 100), (6000, 5)] {
            let got = grid.client.download_range(chk, offset, length).await.unwrap();
            let start = (offset as usize).min(plaintext.len());
            let end = ((offset + length) as usize).min(plaintext.len());
            assert_eq!(got, &plaintext[start..end], "range {offset}+{length}");
        }
    }

    #[tokio::test]
    async fn corrupt_share_is_evicted_and_download_succeeds() {
        let cfg = ClientConfig::new(3, 7, 10);
        let grid = grid(cfg, 10);
        let plaintext: Vec<u8> = (0..300_000).map(|i| (i % 239) as u8).collect();
        let cap = grid.client.upload(&plaintext).await.unwrap();
        let chk = chk_of(&cap);
        let si = chk.storage_index();

        // Flip a data byte of share 0 wherever it lives.
        let mut corrupted = false;
        for (server, backend) in &grid.servers {
            if server.get_buckets(si).await.unwrap().contains_key(&0) {
                corrupted = backend.corrupt_share(si, 0, 100);
                break;
            }
        }
        assert!(corrupted);
        assert_eq!(grid.client.download(&cap).await.unwrap(), plaintext);
    }

    #[tokio::test]
    async fn too_few_servers_is_unrecoverable() {
        let cfg = ClientConfig::new(3, 7, 10);
        let grid = grid(cfg.clone(), 10);
        let plaintext = vec![7u8; 100_000];
        let cap = grid.client.upload(&plaintext).await.unwrap();
        let chk = chk_of(&cap);

        let narrow = subset_client(cfg, &grid, &[1, 2]);
        match narrow.download(&cap).await {
            Err(DownloadError::Unrecoverable { needed: 3, usable }) => assert!(usable < 3),
            other => panic!("expected unrecoverable, got {other:?}"),
        }
        // Still fine with the full grid.
        assert_eq!(grid.client.download_range(chk, 0, 16).await.unwrap(), &plaintext[..16]);
    }

    #[tokio::test]
    async fn happiness_boundary_is_exact() {
        // Exactly `happy` servers succeeds.
        let cfg = ClientConfig::new(3, 7, 10);
        let grid7 = grid(cfg.clone(), 7);
        let plaintext = vec![1u8; 70_000];
        assert!(grid7.client.upload(&plaintext).await.is_ok());

        // One fewer fails with the placement error.
        let grid6 = grid(cfg, 6);
        match grid6.client.upload(&plaintext).await {
            Err(UploadError::NotEnoughShares { happiness, happy, .. }) => {
                assert_eq!(happiness, 6);
                assert_eq!(happy, 7);
            }
            other => panic!("expected NotEnoughShares, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn mutable_publish_and_retrieve_versions() {
        let cfg = ClientConfig::new(3, 5, 10);
        let grid = grid(cfg, 10);
        let writecap = grid.client.create_mutable(b"v1").await.unwrap();
        let readcap = writecap.readcap();

        let (seq, contents) = grid.client.retrieve(&readcap).await.unwrap();
        assert_eq!((seq, contents.as_slice()), (1, b"v1".as_slice()));

        let seq = grid.client.publish(&writecap, b"v2").await.unwrap();
        assert_eq!(seq, 2);
        let (seq, contents) = grid.client.retrieve(&readcap).await.unwrap();
        assert_eq!((seq, contents.as_slice()), (2, b"v2".as_slice()));

        // A longer and then a shorter version; the slot must truncate.
        grid.client
            .publish(&writecap, b"a considerably longer third version")
            .await
            .unwrap();
        let seq = grid.client.publish(&writecap, b"x").await.unwrap();
        assert_eq!(seq, 4);
        let (seq, contents) = grid.client.retrieve(&readcap).await.unwrap();
        assert_eq!((seq, contents.as_slice()), (4, b"x".as_slice()));
    }

    #[tokio::test]
    async fn mutable_empty_contents_roundtrip() {
        let cfg = ClientConfig::new(3, 5, 10);
        let grid = grid(cfg, 10);
        let writecap = grid.client.create_mutable(b"").await.unwrap();
        let (seq, contents) = grid.client.retrieve(&writecap.readcap()).await.unwrap();
        assert_eq!(seq, 1);
        assert!(contents.is_empty());
    }

    #[tokio::test]
    async fn repair_restores_coverage_and_is_idempotent() {
        let cfg = ClientConfig::new(3, 5, 10);
        let grid = grid(cfg, 10);
        let writecap = grid.client.create_mutable(b"durable contents").await.unwrap();
        let si = writecap.storage_index();

        // Lose four shares.
        let mut lost = 0;
        for (server, backend) in &grid.servers {
            if lost == 4 {
                break;
            }
            let shares: Vec<ShareNum> = server
                .slot_readv(si, None, vec![(0, 1)])
                .await
                .unwrap()
                .keys()
                .copied()
                .collect();
            for num in shares {
                backend.delete_share(si, num).await.unwrap();
                lost += 1;
            }
        }
        assert_eq!(lost, 4);

        let report = grid.client.repair(&writecap).await.unwrap();
        assert_eq!(report.seqnum, 1);
        assert_eq!(report.newly_written, 4);
        assert_eq!(report.present, 10);

        // A second pass finds nothing to do.
        let again = grid.client.repair(&writecap).await.unwrap();
        assert_eq!(again.newly_written, 0);
        assert_eq!(again.present, 10);

        let (seq, contents) = grid.client.retrieve(&writecap.readcap()).await.unwrap();
        assert_eq!((seq, contents.as_slice()), (1, b"durable contents".as_slice()));
    }

    /// Wraps a connection and pins `slot_readv` to its first answer, which
    /// makes the wrapped client publish against a stale view of the slot.
    struct StaleReads {
        inner: Arc<dyn ServerConnection>,
        cache: tokio::sync::Mutex<Option<BTreeMap<ShareNum, Vec<Vec<u8>>>>>,
    }

    #[async_trait]
    impl ServerConnection for StaleReads {
        async fn version(&self) -> Result<ServerCapabilities, StorageError> {
            self.inner.version().await
        }
        async fn allocate_buckets(
            &self,
            si: StorageIndex,
            renew_secret: [u8; 32],
            cancel_secret: [u8; 32],
            sharenums: Vec<ShareNum>,
            allocated_size: u64,
        ) -> Result<AllocationResult, StorageError> {
            self.inner
                .allocate_buckets(si, renew_secret, cancel_secret, sharenums, allocated_size)
                .await
        }
        async fn get_buckets(
            &self,
            si: StorageIndex,
        ) -> Result<BTreeMap<ShareNum, u64>, StorageError> {
            self.inner.get_buckets(si).await
        }
        async fn bucket_write(
            &self,
            si: StorageIndex,
            sharenum: ShareNum,
            offset: u64,
            data: Vec<u8>,
        ) -> Result<(), StorageError> {
            self.inner.bucket_write(si, sharenum, offset, data).await
        }
        async fn bucket_close(
            &self,
            si: StorageIndex,
            sharenum: ShareNum,
        ) -> Result<(), StorageError> {
            self.inner.bucket_close(si, sharenum).await
        }
        async fn bucket_abort(
            &self,
            si: StorageIndex,
            sharenum: ShareNum,
        ) -> Result<(), StorageError> {
            self.inner.bucket_abort(si, sharenum).await
        }
        async fn bucket_read(
            &self,
            si: StorageIndex,
            sharenum: ShareNum,
            offset: u64,
            length: u64,
        ) -> Result<Vec<u8>, StorageError> {
            self.inner.bucket_read(si, sharenum, offset, length).await
        }
        async fn add_lease(
            &self,
            si: StorageIndex,
            renew_secret: [u8; 32],
            cancel_secret: [u8; 32],
        ) -> Result<(), StorageError> {
            self.inner.add_lease(si, renew_secret, cancel_secret).await
        }
        async fn renew_lease(
            &self,
            si: StorageIndex,
            renew_secret: [u8; 32],
        ) -> Result<(), StorageError> {
            self.inner.renew_lease(si, renew_secret).await
        }
        async fn slot_readv(
            &self,
            si: StorageIndex,
            shares: Option<Vec<ShareNum>>,
            readv: Vec<(u64, u64)>,
        ) -> Result<BTreeMap<ShareNum, Vec<Vec<u8>>>, StorageError> {
            let mut cache = self.cache.lock().await;
            if let Some(stale) = cache.as_ref() {
                return Ok(stale.clone());
            }
            let fresh = self.inner.slot_readv(si, shares, readv).await?;
            *cache = Some(fresh.clone());
            Ok(fresh)
        }
        async fn slot_testv_and_readv_and_writev(
            &self,
            si: StorageIndex,
            secrets: SlotSecrets,
            tw_vectors: BTreeMap<ShareNum, SlotTestWrite>,
            readv: Vec<(u64, u64)>,
        ) -> Result<(bool, BTreeMap<ShareNum, Vec<Vec<u8>>>), StorageError> {
            self.inner
                .slot_testv_and_readv_and_writev(si, secrets, tw_vectors, readv)
                .await
        }
    }

    #[tokio::test]
    async fn uncoordinated_writer_sees_the_winning_seqnum() {
        let mut cfg = ClientConfig::new(3, 5, 10);
        cfg.publish_retries = 2;
        let grid10 = grid(cfg.clone(), 10);
        let writecap = grid10.client.create_mutable(b"base").await.unwrap();

        // A second writer whose view of the slot is frozen at seqnum 1.
        let stale_client = Client::new(cfg);
        for (server, _) in &grid10.servers {
            let id = server.server_id()[0];
            stale_client.add_server(
                announcement(id),
                Arc::new(StaleReads {
                    inner: Arc::new(LocalConnection::new(
                        server.clone(),
                        Duration::from_secs(240),
                    )),
                    cache: tokio::sync::Mutex::new(None),
                }),
            );
        }
        // Prime the stale caches with the seqnum-1 state.
        let (seq, _) = stale_client.retrieve(&writecap.readcap()).await.unwrap();
        assert_eq!(seq, 1);

        // The live writer moves the slot to seqnum 2.
        assert_eq!(grid10.client.publish(&writecap, b"winner").await.unwrap(), 2);

        // The stale writer keeps proposing seqnum 2 and must report the
        // winner instead of clobbering it.
        match stale_client.publish(&writecap, b"loser").await {
            Err(PublishError::Uncoordinated { winning_seqnum }) => {
                assert_eq!(winning_seqnum, 2)
            }
            other => panic!("expected uncoordinated write, got {other:?}"),
        }
        let (seq, contents) = grid10.client.retrieve(&writecap.readcap()).await.unwrap();
        assert_eq!((seq, contents.as_slice()), (2, b"winner".as_slice()));
    }
}
