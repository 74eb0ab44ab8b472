//! # High-Level Node API
//!
//! A [`Node`] is the runnable form of the ring logic: it owns a
//! [`Core`](crate::dispatch::Core) inside an actor task and wires it to a
//! [`Transport`] and a [`SnapshotStore`].
//!
//! ## Architecture
//!
//! The **actor pattern** keeps the protocol single-threaded:
//! - [`Node`]: public handle (cheap to clone), sends commands
//! - `NodeActor`: owns the core, the only place state is touched
//!
//! Inbound lines are pushed in with [`Node::deliver`]; whoever drains the
//! transport (see `main.rs` or the integration tests) decides how lines
//! reach the node. Outbound lines produced by a dispatch round are handed
//! to the transport from a background task so a slow peer never stalls
//! the actor.
//!
//! ## Quick start
//!
//! ```ignore
//! let hub = MemoryHub::new();
//! let (transport, mut inbox) = hub.attach(id);
//! let node = Node::spawn(NodeRef::new(id), Arc::new(transport), Arc::new(DiscardSnapshots), NodeConfig::manual());
//! node.join(Some(seed)).await?;
//! node.joined().await;
//! let holder = node.locate(key).await?;
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::dispatch::{Core, DispatchOutcome, ExtensionHandler, FLAG_OWN};
use crate::identity::{Identifier, NodeRef};
use crate::jobs::Token;
use crate::messages::split_fields;
use crate::protocols::{SnapshotStore, Transport};
use crate::routing::{TableSnapshot, FINGER_ROWS};

/// Command channel capacity. Back-pressure applies when the actor falls
/// behind instead of queueing without bound.
const NODE_COMMAND_CHANNEL_SIZE: usize = 256;

/// Maximum lookups and extension calls awaiting a reply at once.
/// SECURITY: bounds waiter-table growth when peers never answer.
const MAX_PENDING_WAITERS: usize = 1024;

/// Stand-in period for disabled maintenance timers.
const DISABLED_TICK: Duration = Duration::from_secs(86_400);

// ============================================================================
// Configuration
// ============================================================================

/// Maintenance cadence. `None` disables a timer, leaving the schedule to
/// explicit [`Node::stabilize`] / [`Node::fix_fingers`] calls.
#[derive(Clone, Copy, Debug)]
pub struct NodeConfig {
    pub stabilize_interval: Option<Duration>,
    pub fix_fingers_interval: Option<Duration>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            stabilize_interval: Some(Duration::from_secs(2)),
            fix_fingers_interval: Some(Duration::from_secs(1)),
        }
    }
}

impl NodeConfig {
    /// No timers; every maintenance round is driven by the caller. Used by
    /// the deterministic tests.
    pub fn manual() -> NodeConfig {
        NodeConfig { stabilize_interval: None, fix_fingers_interval: None }
    }
}

// ============================================================================
// Actor commands
// ============================================================================

enum NodeCommand {
    /// One inbound line, sender named by the transport.
    Deliver { from: Identifier, line: String },
    /// Enter the ring, optionally through a seed.
    Join { seed: Option<NodeRef> },
    /// One stabilization round now.
    Stabilize,
    /// Re-resolve one finger row; `None` picks a random row.
    FixFingers { row: Option<usize> },
    /// Resolve the holder of a key.
    Locate { key: Identifier, reply: oneshot::Sender<Result<NodeRef>> },
    /// Operator-defined request with an awaited reply operand.
    Extension {
        to: NodeRef,
        code: [u8; 2],
        operand: String,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Install the handler for operator-defined verbs.
    SetExtensionHandler { handler: ExtensionHandler },
    /// The successor stopped answering; promote a backup.
    SuccessorFailed,
    /// Point-in-time copy of the routing state.
    Ring { reply: oneshot::Sender<TableSnapshot> },
    /// Stop the actor.
    Quit,
}

enum Waiter {
    Locate(oneshot::Sender<Result<NodeRef>>),
    Extension(oneshot::Sender<Result<String>>),
}

// ============================================================================
// Node handle
// ============================================================================

/// Public handle to a running ring node. Cheap to clone; all clones talk
/// to the same actor.
#[derive(Clone)]
pub struct Node {
    self_ref: NodeRef,
    commands: mpsc::Sender<NodeCommand>,
    joined: watch::Receiver<bool>,
}

impl Node {
    /// Start the actor and return its handle. The node is not part of any
    /// ring until [`Node::join`] is called.
    pub fn spawn(
        self_ref: NodeRef,
        transport: Arc<dyn Transport>,
        snapshots: Arc<dyn SnapshotStore>,
        config: NodeConfig,
    ) -> Node {
        let (commands, command_rx) = mpsc::channel(NODE_COMMAND_CHANNEL_SIZE);
        let (joined_tx, joined) = watch::channel(false);
        let actor = NodeActor {
            core: Core::new(self_ref),
            transport,
            snapshots,
            joined: joined_tx,
            waiters: HashMap::new(),
        };
        tokio::spawn(actor.run(command_rx, config));
        Node { self_ref, commands, joined }
    }

    #[inline]
    pub fn id(&self) -> Identifier {
        self.self_ref.id()
    }

    #[inline]
    pub fn self_ref(&self) -> NodeRef {
        self.self_ref
    }

    /// Feed one inbound line into the dispatcher.
    pub async fn deliver(&self, from: Identifier, line: impl Into<String>) -> Result<()> {
        self.send(NodeCommand::Deliver { from, line: line.into() }).await
    }

    /// Enter the ring. Completion is observable via [`Node::joined`];
    /// without a seed the node is its own ring and joined immediately.
    pub async fn join(&self, seed: Option<NodeRef>) -> Result<()> {
        self.send(NodeCommand::Join { seed }).await
    }

    /// Wait until the finger table finished building.
    pub async fn joined(&self) {
        let mut joined = self.joined.clone();
        // Closed channel means the actor is gone; nothing left to wait for.
        let _ = joined.wait_for(|ready| *ready).await;
    }

    /// True once the finger table finished building.
    pub fn is_joined(&self) -> bool {
        *self.joined.borrow()
    }

    /// Run one stabilization round now.
    pub async fn stabilize(&self) -> Result<()> {
        self.send(NodeCommand::Stabilize).await
    }

    /// Re-resolve one finger row now; `None` picks a random row.
    pub async fn fix_fingers(&self, row: Option<usize>) -> Result<()> {
        self.send(NodeCommand::FixFingers { row }).await
    }

    /// Resolve the node responsible for `key`. Fails when the walk ends
    /// without reaching the holder.
    pub async fn locate(&self, key: Identifier) -> Result<NodeRef> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Locate { key, reply }).await?;
        rx.await.context("node stopped during lookup")?
    }

    /// Send an operator-defined request and await the reply operand.
    pub async fn extension_request(
        &self,
        to: NodeRef,
        code: [u8; 2],
        operand: impl Into<String>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Extension { to, code, operand: operand.into(), reply })
            .await?;
        rx.await.context("node stopped during extension call")?
    }

    /// Install the handler invoked for verbs outside the catalog.
    pub async fn set_extension_handler(&self, handler: ExtensionHandler) -> Result<()> {
        self.send(NodeCommand::SetExtensionHandler { handler }).await
    }

    /// Tell the node its successor stopped answering.
    pub async fn report_successor_failure(&self) -> Result<()> {
        self.send(NodeCommand::SuccessorFailed).await
    }

    /// Point-in-time copy of the routing state.
    pub async fn ring(&self) -> Result<TableSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.send(NodeCommand::Ring { reply }).await?;
        rx.await.context("node stopped during snapshot")
    }

    /// Stop the actor. Pending waiters resolve with errors.
    pub async fn quit(&self) {
        let _ = self.commands.send(NodeCommand::Quit).await;
    }

    async fn send(&self, command: NodeCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| anyhow!("node actor stopped"))
    }
}

// ============================================================================
// Actor
// ============================================================================

struct NodeActor {
    core: Core,
    transport: Arc<dyn Transport>,
    snapshots: Arc<dyn SnapshotStore>,
    joined: watch::Sender<bool>,
    waiters: HashMap<Token, Waiter>,
}

impl NodeActor {
    async fn run(mut self, mut commands: mpsc::Receiver<NodeCommand>, config: NodeConfig) {
        let mut stabilize_tick =
            tokio::time::interval(config.stabilize_interval.unwrap_or(DISABLED_TICK));
        let mut fix_tick =
            tokio::time::interval(config.fix_fingers_interval.unwrap_or(DISABLED_TICK));
        stabilize_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        fix_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let auto_stabilize = config.stabilize_interval.is_some();
        let auto_fix = config.fix_fingers_interval.is_some();

        info!(id = %self.core.state().id().short(), "node actor started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    match command {
                        None | Some(NodeCommand::Quit) => break,
                        Some(command) => self.handle(command).await,
                    }
                }
                _ = stabilize_tick.tick(), if auto_stabilize => {
                    let outcome = self.core.stabilize();
                    self.apply(outcome).await;
                }
                _ = fix_tick.tick(), if auto_fix => {
                    let row = rand::thread_rng().gen_range(0..FINGER_ROWS);
                    let outcome = self.core.fix_fingers(row);
                    self.apply(outcome).await;
                    self.drop_abandoned_waiters();
                }
            }
        }
        debug!(id = %self.core.state().id().short(), "node actor stopped");
    }

    async fn handle(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Deliver { from, line } => {
                let outcome = self.core.receive(from, &line);
                self.apply(outcome).await;
            }
            NodeCommand::Join { seed } => {
                let outcome = self.core.join(seed);
                self.apply(outcome).await;
            }
            NodeCommand::Stabilize => {
                let outcome = self.core.stabilize();
                self.apply(outcome).await;
            }
            NodeCommand::FixFingers { row } => {
                let row = row.unwrap_or_else(|| rand::thread_rng().gen_range(0..FINGER_ROWS));
                let outcome = self.core.fix_fingers(row);
                self.apply(outcome).await;
            }
            NodeCommand::Locate { key, reply } => {
                if self.waiters.len() >= MAX_PENDING_WAITERS {
                    let _ = reply.send(Err(anyhow!("too many pending lookups")));
                    return;
                }
                let (token, outcome) = self.core.locate(key);
                self.waiters.insert(token, Waiter::Locate(reply));
                self.apply(outcome).await;
            }
            NodeCommand::Extension { to, code, operand, reply } => {
                if self.waiters.len() >= MAX_PENDING_WAITERS {
                    let _ = reply.send(Err(anyhow!("too many pending extension calls")));
                    return;
                }
                match self.core.send_extension(to, code, operand) {
                    Some((token, outcome)) => {
                        self.waiters.insert(token, Waiter::Extension(reply));
                        self.apply(outcome).await;
                    }
                    None => {
                        let _ = reply.send(Err(anyhow!(
                            "extension code collides with a protocol verb"
                        )));
                    }
                }
            }
            NodeCommand::SetExtensionHandler { handler } => {
                self.core.set_extension_handler(handler);
            }
            NodeCommand::SuccessorFailed => {
                let outcome = self.core.report_successor_failure();
                self.apply(outcome).await;
            }
            NodeCommand::Ring { reply } => {
                let _ = reply.send(self.core.state().snapshot());
            }
            NodeCommand::Quit => unreachable!("handled in run loop"),
        }
    }

    /// Act on one dispatch round: resolve waiters, flip the joined flag,
    /// persist if dirty, and ship outbound lines from a background task.
    async fn apply(&mut self, outcome: DispatchOutcome) {
        for (token, result) in outcome.completed {
            match self.waiters.remove(&token) {
                Some(Waiter::Locate(reply)) => {
                    let _ = reply.send(parse_holder(&result));
                }
                Some(Waiter::Extension(reply)) => {
                    let _ = reply.send(Ok(result));
                }
                // Internal chains (build, propagation) complete without a
                // registered waiter.
                None => {}
            }
        }
        if outcome.build_completed {
            self.joined.send_replace(true);
        }
        if self.core.take_dirty() {
            let snapshot = self.core.state().snapshot();
            let snapshots = Arc::clone(&self.snapshots);
            tokio::spawn(async move {
                if let Err(err) = snapshots.save(&snapshot).await {
                    warn!(error = %err, "routing snapshot save failed");
                }
            });
        }
        if !outcome.outbound.is_empty() {
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                for envelope in outcome.outbound {
                    if let Err(err) = transport.send(&envelope.to, &envelope.line).await {
                        debug!(
                            to = %envelope.to.id().short(),
                            error = %err,
                            "line delivery failed"
                        );
                    }
                }
            });
        }
    }

    /// Forget waiters whose caller went away, so abandoned lookups cannot
    /// pin table entries forever.
    fn drop_abandoned_waiters(&mut self) {
        self.waiters.retain(|_, waiter| match waiter {
            Waiter::Locate(reply) => !reply.is_closed(),
            Waiter::Extension(reply) => !reply.is_closed(),
        });
    }
}

/// Read the holder out of a finished lookup operand.
fn parse_holder(operand: &str) -> Result<NodeRef> {
    let fields = split_fields(operand).context("unreadable lookup result")?;
    if fields.len() != 3 {
        bail!("unexpected lookup result shape");
    }
    if fields[2] != FLAG_OWN {
        bail!("lookup did not reach the holder");
    }
    let holder = Identifier::from_hex(&fields[1]).context("bad holder identifier")?;
    Ok(NodeRef::new(holder))
}
