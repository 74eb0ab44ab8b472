//! # Torc - Chord Ring Routing Overlay
//!
//! Torc arranges nodes on a 512-bit identifier ring and routes lookups to
//! the node responsible for a key in logarithmically many hops:
//!
//! - **Identity**: SHA-512 identifiers; modular ring arithmetic
//! - **Routing**: 512-row finger table with backup candidates per row
//! - **Protocol**: plain-text lines, two-letter verbs, token correlation
//! - **Maintenance**: stabilization, notify, and finger repair rounds
//! - **Transport**: UDP datagram framing plus an in-process test hub
//!
//! ## Architecture
//!
//! The protocol engine is **sans-IO**: [`dispatch`]'s `Core` is a plain
//! synchronous state machine that consumes lines and emits lines, so every
//! ring behavior can be tested without sockets or time. The **actor
//! pattern** wraps it for concurrent use:
//! - [`Node`] is the public handle, cheap to clone
//! - A private actor owns the core and processes commands sequentially
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | High-level API driving the core over a transport |
//! | `identity` | 512-bit identifiers, ring intervals, node references |
//! | `routing` | Finger table rows, candidate queues, snapshots |
//! | `chord` | Ring membership state and maintenance decisions |
//! | `jobs` | Pending-operation queue and token correlation |
//! | `messages` | Line grammar: verbs, operands, field framing |
//! | `dispatch` | The sans-IO engine tying state, jobs, and messages |
//! | `protocols` | Trait seams: transport, snapshot store, seeds |
//! | `transport` | UDP and in-memory transports, snapshot persistence |

mod chord;
mod dispatch;
mod identity;
mod jobs;
mod messages;
mod node;
mod protocols;
mod routing;
mod transport;

pub use dispatch::ExtensionHandler;
pub use identity::{Identifier, IdentifierError, NodeRef};
pub use node::{Node, NodeConfig};
pub use protocols::{SeedDiscovery, SnapshotStore, Transport};
pub use routing::TableSnapshot;
pub use transport::{
    BincodeSnapshotStore, DiscardSnapshots, Inbound, MemoryHub, MemoryTransport, StaticSeeds,
    UdpLineReceiver, UdpLineTransport,
};
