#![deny(missing_docs)]

//! **grid_vault** is the client-side engine of a decentralized,
//! provider-independent secure file store. Files are split into
//! erasure-coded shares, each encrypted with client-held keys, and dispersed
//! across a set of storage servers; any sufficiently large subset of
//! surviving shares reconstructs the file. Servers see only opaque
//! ciphertext containers and are trusted for availability, never for
//! content.
//!
//! ## Features
//!
//! * **Capability URIs** via the [`cap`](cap/index.html) module: immutable
//!   `CHK`, literal `LIT`, mutable `SSK`/`MDMF`, directory `DIR2` wrappers,
//!   and the one-way lattice `writekey -> readkey -> storage-index` that
//!   lets a holder hand out weaker access.
//! * **Convergent encryption and erasure coding**: identical plaintext
//!   uploaded with the same convergence secret yields the same capability
//!   and byte-identical shares, so the grid deduplicates across uploaders.
//! * **Merkle integrity** end to end: every byte returned to the caller is
//!   covered by a verified hash chain rooted in the capability.
//! * **A storage server** ([`grid::server`](grid/server/index.html)) with
//!   bucket allocation, leases with crawler-driven garbage collection, and
//!   the atomic slot test-and-set that coordinates mutable writers.
//! * **Pluggable share persistence** behind the
//!   [`grid::Backend`](grid/backend/trait.Backend.html) trait, with local
//!   filesystem and in-memory implementations bundled.
//!
//! ## Example
//!
//! ```rust
//! use grid_vault::cap::{Capability, LitCap};
//!
//! // Tiny files inline their bytes into the capability itself.
//! let cap = Capability::Lit(LitCap { data: b"Hello\n".to_vec() });
//! let parsed = Capability::parse(&cap.to_string()).unwrap();
//! assert_eq!(parsed, cap);
//! ```
//!
//! The transport that carries the server protocol, the introducer that
//! discovers servers, and the application frontends are all outside this
//! crate; they meet it at [`grid::ServerConnection`](grid/client/trait.ServerConnection.html),
//! [`grid::ServerAnnouncement`](grid/struct.ServerAnnouncement.html), and
//! the capability types.

pub mod cap;
pub mod crypto;
pub mod erasure;
pub mod grid;
pub mod hashtree;
pub mod layout;
pub mod slot;

pub use cap::{Capability, CapabilityParseError};
pub use erasure::{CodingError, DecodingError, ErasureCodec};
pub use grid::{
    Backend, Client, ClientConfig, DiskBackend, DownloadError, GridServer, LocalConnection,
    MemBackend, PublishError, RetrieveError, ServerAnnouncement, ServerConnection, StorageError,
    StorageServer, UploadError,
};
pub use hashtree::{HashTree, IncompleteHashTree, IntegrityError};
pub use layout::{LayoutError, UriExtension};

/// 16-byte identifier servers key all share state by.
pub type StorageIndex = [u8; 16];

/// Number of one share within a file's `n` shares.
pub type ShareNum = u8;

/// Stable 20-byte storage server identity.
pub type ServerId = [u8; 20];
