//! # Line Transports and Persistence
//!
//! Concrete implementations of the seams in [`crate::protocols`]:
//!
//! - [`MemoryHub`] / [`MemoryTransport`]: in-process delivery between nodes
//!   of the same test or demo binary, routed purely by identifier.
//! - [`UdpLineTransport`]: one protocol line per datagram. A transport-level
//!   envelope prefixes each datagram with the sender's identifier, because
//!   the protocol grammar itself never names the author; receive learns the
//!   sender's address so replies can route by identifier alone.
//! - [`BincodeSnapshotStore`] / [`DiscardSnapshots`]: routing-table
//!   persistence, written atomically via a sibling temp file.
//! - [`StaticSeeds`]: bootstrap contacts fixed at configuration time.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock as StdRwLock};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use lru::LruCache;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace};

use crate::identity::{Identifier, NodeRef, ID_HEX_LEN};
use crate::messages::MAX_LINE_LEN;
use crate::protocols::{SeedDiscovery, SnapshotStore, Transport};
use crate::routing::TableSnapshot;

/// One inbound line with its authenticated-by-transport sender.
pub type Inbound = (Identifier, String);

/// Per-node inbox capacity for the in-process hub. Senders block when a
/// receiver falls this far behind.
const MEMORY_CHANNEL_SIZE: usize = 1024;

/// Maximum peers in the learned UDP address book.
/// SECURITY: bounds reply-routing state regardless of how many distinct
/// identifiers show up in envelopes.
const MAX_PEER_ADDRS: usize = 10_000;

/// Largest accepted datagram: identifier envelope, separator, line.
const MAX_DATAGRAM_SIZE: usize = ID_HEX_LEN + 1 + MAX_LINE_LEN;

/// Largest accepted snapshot file. A full table with every backup slot
/// occupied stays well under this.
const MAX_SNAPSHOT_BYTES: u64 = 1024 * 1024;

// ============================================================================
// In-process transport
// ============================================================================

/// Registry connecting in-process nodes by identifier. Clone the `Arc`,
/// attach each node, and every [`MemoryTransport::send`] becomes a channel
/// push into the recipient's inbox.
#[derive(Default)]
pub struct MemoryHub {
    peers: StdRwLock<HashMap<Identifier, mpsc::Sender<Inbound>>>,
}

impl MemoryHub {
    pub fn new() -> Arc<MemoryHub> {
        Arc::new(MemoryHub::default())
    }

    /// Register `id` and return its transport plus the inbox to drain.
    pub fn attach(self: &Arc<Self>, id: Identifier) -> (MemoryTransport, mpsc::Receiver<Inbound>) {
        let (tx, rx) = mpsc::channel(MEMORY_CHANNEL_SIZE);
        if let Ok(mut peers) = self.peers.write() {
            peers.insert(id, tx);
        }
        (MemoryTransport { hub: Arc::clone(self), local: id }, rx)
    }

    /// Drop `id` from the registry; subsequent sends to it fail.
    pub fn detach(&self, id: &Identifier) {
        if let Ok(mut peers) = self.peers.write() {
            peers.remove(id);
        }
    }

    fn sender_for(&self, id: &Identifier) -> Option<mpsc::Sender<Inbound>> {
        self.peers.read().ok()?.get(id).cloned()
    }
}

/// Sending half handed to one attached node.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    local: Identifier,
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, to: &NodeRef, line: &str) -> Result<()> {
        let tx = self
            .hub
            .sender_for(&to.id())
            .with_context(|| format!("peer {} not attached", to.id().short()))?;
        tx.send((self.local, line.to_string()))
            .await
            .map_err(|_| anyhow!("peer {} hung up", to.id().short()))
    }
}

// ============================================================================
// UDP transport
// ============================================================================

/// Datagram transport: `<sender-id-hex> <line>` per packet. The identifier
/// envelope is transport framing, not part of the protocol grammar.
pub struct UdpLineTransport {
    socket: Arc<UdpSocket>,
    local: Identifier,
    book: Arc<Mutex<LruCache<Identifier, SocketAddr>>>,
}

/// Receiving half: drain with [`UdpLineReceiver::recv`] and feed the node.
pub struct UdpLineReceiver {
    socket: Arc<UdpSocket>,
    book: Arc<Mutex<LruCache<Identifier, SocketAddr>>>,
    buf: Vec<u8>,
}

impl UdpLineTransport {
    /// Bind `addr` and return the send and receive halves.
    pub async fn bind(local: Identifier, addr: SocketAddr) -> Result<(UdpLineTransport, UdpLineReceiver)> {
        let socket = Arc::new(
            UdpSocket::bind(addr)
                .await
                .with_context(|| format!("binding udp socket on {addr}"))?,
        );
        let book = Arc::new(Mutex::new(LruCache::new(
            NonZeroUsize::new(MAX_PEER_ADDRS).unwrap_or(NonZeroUsize::MIN),
        )));
        debug!(addr = %socket.local_addr()?, "udp transport bound");
        Ok((
            UdpLineTransport {
                socket: Arc::clone(&socket),
                local,
                book: Arc::clone(&book),
            },
            UdpLineReceiver { socket, book, buf: vec![0u8; MAX_DATAGRAM_SIZE] },
        ))
    }

    /// The bound local address, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Pre-seed the address book, e.g. from bootstrap configuration.
    pub async fn learn(&self, id: Identifier, addr: SocketAddr) {
        self.book.lock().await.put(id, addr);
    }
}

#[async_trait]
impl Transport for UdpLineTransport {
    async fn send(&self, to: &NodeRef, line: &str) -> Result<()> {
        let addr = match to.addr() {
            Some(addr) => addr,
            None => self
                .book
                .lock()
                .await
                .get(&to.id())
                .copied()
                .with_context(|| format!("no address for peer {}", to.id().short()))?,
        };
        if line.len() > MAX_LINE_LEN {
            bail!("line exceeds {MAX_LINE_LEN} bytes");
        }
        let mut datagram = String::with_capacity(ID_HEX_LEN + 1 + line.len());
        datagram.push_str(&self.local.to_hex());
        datagram.push(' ');
        datagram.push_str(line);
        self.socket
            .send_to(datagram.as_bytes(), addr)
            .await
            .with_context(|| format!("sending to {addr}"))?;
        Ok(())
    }
}

impl UdpLineReceiver {
    /// Next well-formed inbound line. Datagrams without a valid identifier
    /// envelope are dropped and the wait continues; the sender's source
    /// address is learned for reply routing.
    pub async fn recv(&mut self) -> Result<Inbound> {
        loop {
            let (len, src) = self.socket.recv_from(&mut self.buf).await?;
            let Ok(datagram) = std::str::from_utf8(&self.buf[..len]) else {
                trace!(%src, "dropping non-utf8 datagram");
                continue;
            };
            let Some((id_hex, line)) = datagram.split_once(' ') else {
                trace!(%src, "dropping datagram without envelope");
                continue;
            };
            let Ok(sender) = Identifier::from_hex(id_hex) else {
                trace!(%src, "dropping datagram with bad sender id");
                continue;
            };
            self.book.lock().await.put(sender, src);
            return Ok((sender, line.to_string()));
        }
    }
}

// ============================================================================
// Snapshot persistence
// ============================================================================

/// Routing snapshots serialized with bincode to a single file. Writes go
/// through a sibling temp file and a rename so a crash never leaves a
/// half-written snapshot behind.
pub struct BincodeSnapshotStore {
    path: PathBuf,
}

impl BincodeSnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> BincodeSnapshotStore {
        BincodeSnapshotStore { path: path.into() }
    }
}

#[async_trait]
impl SnapshotStore for BincodeSnapshotStore {
    async fn save(&self, snapshot: &TableSnapshot) -> Result<()> {
        let bytes = bincode::serialize(snapshot).context("encoding snapshot")?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("replacing {}", self.path.display()))?;
        trace!(path = %self.path.display(), bytes = bytes.len(), "snapshot saved");
        Ok(())
    }

    async fn load(&self) -> Result<Option<TableSnapshot>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err).with_context(|| format!("reading {}", self.path.display())),
        };
        // Size check before decode bounds allocation from a corrupt file.
        if bytes.len() as u64 > MAX_SNAPSHOT_BYTES {
            bail!("snapshot exceeds {MAX_SNAPSHOT_BYTES} bytes");
        }
        let snapshot = bincode::deserialize(&bytes).context("decoding snapshot")?;
        Ok(Some(snapshot))
    }
}

/// Persistence disabled: saves vanish, loads find nothing.
pub struct DiscardSnapshots;

#[async_trait]
impl SnapshotStore for DiscardSnapshots {
    async fn save(&self, _snapshot: &TableSnapshot) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<TableSnapshot>> {
        Ok(None)
    }
}

// ============================================================================
// Seed discovery
// ============================================================================

/// Seeds known up front, from flags or a config file.
pub struct StaticSeeds {
    seeds: Vec<NodeRef>,
}

impl StaticSeeds {
    pub fn new(seeds: Vec<NodeRef>) -> StaticSeeds {
        StaticSeeds { seeds }
    }

    /// No seeds: the node starts its own ring.
    pub fn none() -> StaticSeeds {
        StaticSeeds { seeds: Vec::new() }
    }
}

#[async_trait]
impl SeedDiscovery for StaticSeeds {
    async fn resolve_seeds(&self) -> Result<Vec<NodeRef>> {
        Ok(self.seeds.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
