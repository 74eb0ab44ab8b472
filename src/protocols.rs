//! Seam traits between the ring logic and the outside world.
//!
//! The dispatcher in [`crate::dispatch`] is synchronous and I/O-free; the
//! node actor drives it and crosses these traits for everything that
//! touches a socket, a disk, or a resolver.
//!
//! | Concern | Trait | Purpose |
//! |---------|-------|---------|
//! | Wire | [`Transport`] | Deliver one line to one peer |
//! | Persistence | [`SnapshotStore`] | Save and load routing snapshots |
//! | Bootstrap | [`SeedDiscovery`] | Resolve initial ring contacts |
//!
//! Traits live here, apart from their implementations in
//! [`crate::transport`], so the node depends only on the seams and tests
//! can swap in-process doubles for any of them.

use anyhow::Result;
use async_trait::async_trait;

use crate::identity::NodeRef;
use crate::routing::TableSnapshot;

/// One-way line delivery. Implementations resolve the recipient from the
/// node reference (address book, in-process registry) and must reject
/// rather than block forever when the peer is unknown.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver one protocol line to `to`. The line already carries its
    /// trailing newline.
    async fn send(&self, to: &NodeRef, line: &str) -> Result<()>;
}

/// Durable routing-state snapshots, written whenever the ring state
/// changed during a dispatch round.
#[async_trait]
pub trait SnapshotStore: Send + Sync + 'static {
    /// Persist the latest snapshot, replacing any previous one.
    async fn save(&self, snapshot: &TableSnapshot) -> Result<()>;

    /// Load the most recent snapshot, if one exists.
    async fn load(&self) -> Result<Option<TableSnapshot>>;
}

/// Bootstrap contact resolution, done once at startup before joining.
#[async_trait]
pub trait SeedDiscovery: Send + Sync {
    /// Resolve the configured seeds to concrete ring contacts. An empty
    /// result means the node starts a ring of its own.
    async fn resolve_seeds(&self) -> Result<Vec<NodeRef>>;
}
