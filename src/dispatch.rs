//! # Command Dispatch
//!
//! The synchronous heart of a node: consumes wire lines, mutates ring state,
//! and emits wire lines to send. No sockets, no clocks, no tasks; the actor
//! in [`crate::node`] owns a [`Core`] and wires it to real I/O, which keeps
//! every protocol rule in this module testable without a runtime.
//!
//! ## Dispatch pipeline
//!
//! Every inbound line goes through four steps:
//!
//! 1. **Parse** into a [`WireMessage`]; anything malformed is dropped without
//!    a reply so a hostile or buggy peer cannot make the node talk back.
//! 2. **Correlate**: replies settle the matching queued job (request verbs
//!    instead record a `Delegated` job under the sender's token).
//! 3. **Handle** per verb, reading and mutating [`ChordState`].
//! 4. **Answer**: a handler that produces an operand gets it sent back under
//!    the inbound token; a handler that forwarded instead stays silent and
//!    the eventual reply is re-wrapped hop by hop toward the original asker.
//!
//! ## Verb catalog
//!
//! | Code | Operation                         | Answered by              |
//! |------|-----------------------------------|--------------------------|
//! | `FS` | find the successor of an id       | holder, or forwarded     |
//! | `CP` | closest preceding finger          | always local             |
//! | `QS` | current successor                 | always local             |
//! | `QP` | current predecessor               | always local             |
//! | `NP` | notify: sender claims predecessor | always local             |
//! | `FP` | find the predecessor of an id     | holder, or forwarded     |
//! | `IF` | finger-table build driver         | local only, never wire   |
//! | `UO` | pointer-propagation driver        | local only, never wire   |
//! | `UF` | offer a finger-row candidate      | local, then propagated   |
//! | `US` | adopt sender as predecessor       | always local             |
//! | `UP` | adopt sender as successor         | always local             |
//! | `FR` | locate the holder of a key        | owner, or forwarded      |
//! | `ZZ` | extension, operator-defined       | installed handler        |
//!
//! Candidate fields of `NP`, `US` and `UP` must match the transport-supplied
//! sender identity; the operand is never trusted to name the author.

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::chord::{BuildStep, ChordState};
use crate::identity::{Identifier, NodeRef};
use crate::jobs::{Job, JobKind, JobQueue, JobStatus, Token};
use crate::messages::{split_fields, unify_fields, Verb, WireMessage};
use crate::routing::FINGER_ROWS;

/// Reply flag: a lookup terminated at the authoritative node.
pub const FLAG_FOUND: &str = "found";

/// Reply flag: the answering node itself holds the requested key.
pub const FLAG_OWN: &str = "own";

/// Reply flag: a finger-row candidate was accepted.
pub const FLAG_UPDATED: &str = "updated";

/// Result recorded on the build driver once every row is resolved.
const RESULT_BUILT: &str = "built";

/// Result recorded on the propagation driver once the walk and the
/// successor/predecessor stitch are through.
const RESULT_PROPAGATED: &str = "propagated";

/// Hook for operator-defined verbs. Called with the two-character code,
/// whether the line was a reply, the raw operand blob, and the sender.
/// Returning an operand answers a request; return values for replies are
/// ignored.
pub type ExtensionHandler =
    Box<dyn FnMut([u8; 2], bool, &str, Identifier) -> Option<String> + Send>;

// ============================================================================
// Outcome of one dispatch round
// ============================================================================

/// One line addressed to one peer, ready for the transport.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub to: NodeRef,
    pub line: String,
}

/// Everything a dispatch round asks the embedding layer to do.
#[derive(Debug, Default)]
pub struct DispatchOutcome {
    /// Lines to hand to the transport, in order.
    pub outbound: Vec<Envelope>,
    /// Root jobs that settled this round, with their result operand. The
    /// node actor resolves pending `locate`/extension waiters from these.
    pub completed: Vec<(Token, String)>,
    /// Set in the round where the finger table finished building.
    pub build_completed: bool,
}

#[derive(Default)]
struct Effects {
    completed: Vec<(Token, String)>,
    build_completed: bool,
}

fn parse_row(field: &str) -> Option<usize> {
    field.parse::<usize>().ok().filter(|row| *row < FINGER_ROWS)
}

// ============================================================================
// Core
// ============================================================================

/// Ring state, job ledger and outbox behind a single exclusive handle.
pub struct Core {
    state: ChordState,
    jobs: JobQueue,
    outbox: VecDeque<(NodeRef, Job)>,
    extension: Option<ExtensionHandler>,
}

impl Core {
    pub fn new(self_ref: NodeRef) -> Core {
        Core {
            state: ChordState::new(self_ref),
            jobs: JobQueue::new(),
            outbox: VecDeque::new(),
            extension: None,
        }
    }

    #[inline]
    pub fn state(&self) -> &ChordState {
        &self.state
    }

    #[inline]
    pub fn jobs(&self) -> &JobQueue {
        &self.jobs
    }

    /// Install the handler invoked for verbs outside the catalog.
    pub fn set_extension_handler(&mut self, handler: ExtensionHandler) {
        self.extension = Some(handler);
    }

    /// True once the routing state changed since the last call. The caller
    /// persists a snapshot when this reports true.
    pub fn take_dirty(&mut self) -> bool {
        self.state.take_dirty()
    }

    // ------------------------------------------------------------------------
    // Driver entry points (invoked by the owning actor, never by the wire)
    // ------------------------------------------------------------------------

    /// Enter the ring. Without a seed (or with itself as seed) the node
    /// boots a ring of one; otherwise the incremental table build starts
    /// against the seed and completes asynchronously.
    pub fn join(&mut self, seed: Option<NodeRef>) -> DispatchOutcome {
        let mut fx = Effects::default();
        match seed {
            Some(seed) if seed.id() != self.state.id() => {
                info!(
                    id = %self.state.id().short(),
                    seed = %seed.id().short(),
                    "joining ring"
                );
                self.state.begin_join(seed);
                let build = self.jobs.enqueue(Job::new(
                    Verb::InitFingerTable,
                    "",
                    self.state.id(),
                    self.state.id(),
                    JobKind::Local,
                ));
                self.advance_build(&build, &mut fx);
            }
            _ => {
                info!(id = %self.state.id().short(), "booting a ring of one");
                self.state.boot_alone();
                fx.build_completed = true;
            }
        }
        self.finish(fx)
    }

    /// One stabilization round: ask the successor for its predecessor,
    /// adopt a closer successor if one is reported, then notify.
    pub fn stabilize(&mut self) -> DispatchOutcome {
        let fx = Effects::default();
        match self.state.successor() {
            None => {}
            Some(succ) if succ.id() == self.state.id() => {
                // Successor loops back to this node. If a predecessor is
                // known the ring has two members and the loop must open.
                if let Some(pred) = self.state.predecessor() {
                    if pred.id() != self.state.id() && self.state.adopt_successor(pred) {
                        let operand = unify_fields(&[self.state.id().to_hex()]);
                        self.send_request(Verb::NotifyPredecessor, operand, pred, None);
                    }
                }
            }
            Some(succ) => {
                self.send_request(Verb::QueryPredecessor, String::new(), succ, None);
            }
        }
        self.finish(fx)
    }

    /// Re-resolve one finger row. Rows whose start maps between this node
    /// and its successor refresh locally; anything else goes through a
    /// successor lookup.
    pub fn fix_fingers(&mut self, row: usize) -> DispatchOutcome {
        let fx = Effects::default();
        if self.state.is_stable() {
            let row = row % FINGER_ROWS;
            let start = *self.state.fingers().row(row).start();
            if let Some(holder) = self.state.successor_holds(&start) {
                self.state.refresh_row(row, holder);
            } else {
                let hop = self.state.closest_preceding_finger(&start);
                if hop.id() != self.state.id() {
                    let operand = unify_fields(&[row.to_string(), start.to_hex()]);
                    self.send_request(Verb::FindSuccessor, operand, hop, None);
                }
            }
        }
        self.finish(fx)
    }

    /// Resolve the node responsible for `key`. Returns the root job token;
    /// the result lands in [`DispatchOutcome::completed`] under that token,
    /// either immediately (own key) or after the forwarded walk returns.
    pub fn locate(&mut self, key: Identifier) -> (Token, DispatchOutcome) {
        let mut fx = Effects::default();
        let root = self.jobs.enqueue(Job::new(
            Verb::FetchResource,
            unify_fields(&[key.to_hex()]),
            self.state.id(),
            self.state.id(),
            JobKind::Local,
        ));
        if self.state.owns(&key) {
            let operand =
                unify_fields(&[key.to_hex(), self.state.id().to_hex(), FLAG_OWN.to_string()]);
            self.jobs.set_result(&root, &[JobKind::Local], &operand);
            self.jobs.dequeue(&root, &[JobKind::Local]);
            fx.completed.push((root.clone(), operand));
        } else if let Some(hop) = self.forward_hop(&key) {
            let operand = unify_fields(&[key.to_hex()]);
            self.send_request(Verb::FetchResource, operand, hop, Some(root.clone()));
            self.jobs.mark_waiting(&root);
        } else {
            // No route yet (table still building). The job stays open and
            // the caller's wait runs into its own deadline.
            debug!(id = %self.state.id().short(), key = %key.short(), "no route for key");
        }
        (root, self.finish(fx))
    }

    /// Send an operator-defined request. Fails when the code collides with
    /// a protocol verb.
    pub fn send_extension(
        &mut self,
        to: NodeRef,
        code: [u8; 2],
        operand: impl Into<String>,
    ) -> Option<(Token, DispatchOutcome)> {
        let verb = Verb::from_code(code);
        if !matches!(verb, Verb::Extension(_)) {
            warn!(
                code = %String::from_utf8_lossy(&code),
                "extension code collides with a protocol verb"
            );
            return None;
        }
        let token = self.send_request(verb, operand.into(), to, None);
        Some((token, self.finish(Effects::default())))
    }

    /// The transport observed the successor go dark: rotate the next backup
    /// into place and introduce ourselves to it.
    pub fn report_successor_failure(&mut self) -> DispatchOutcome {
        let fx = Effects::default();
        if let Some(next) = self.state.successor_failed() {
            let operand = unify_fields(&[self.state.id().to_hex()]);
            self.send_request(Verb::NotifyPredecessor, operand, next, None);
        }
        self.finish(fx)
    }

    // ------------------------------------------------------------------------
    // Wire entry point
    // ------------------------------------------------------------------------

    /// Dispatch one raw line from `from`. The sender identity comes from the
    /// transport, never from the line itself.
    pub fn receive(&mut self, from: Identifier, line: &str) -> DispatchOutcome {
        let mut fx = Effects::default();
        match WireMessage::parse(line) {
            Some(msg) if msg.reply => self.on_reply(from, msg, &mut fx),
            Some(msg) => self.on_request(from, msg),
            None => trace!(from = %from.short(), "dropping malformed line"),
        }
        self.finish(fx)
    }

    fn on_request(&mut self, from: Identifier, msg: WireMessage) {
        if let Verb::Extension(code) = msg.verb {
            let Some(mut handler) = self.extension.take() else {
                debug!(verb = %msg.verb.wire(false), "no extension handler installed, dropping");
                return;
            };
            self.jobs.enqueue(Job::with_token(
                msg.token.clone(),
                msg.verb,
                msg.operand.clone(),
                from,
                self.state.id(),
                JobKind::Delegated,
            ));
            let reply = handler(code, false, &msg.operand, from);
            self.extension = Some(handler);
            if let Some(operand) = reply {
                self.jobs.dequeue(&msg.token, &[JobKind::Delegated]);
                self.send_reply(msg.verb, operand, from, msg.token);
            }
            return;
        }
        let Some(fields) = msg.fields() else {
            trace!(from = %from.short(), "unbalanced operand, dropping");
            return;
        };
        // Record the delegated job first so forwarding handlers can chain
        // off the inbound token.
        self.jobs.enqueue(Job::with_token(
            msg.token.clone(),
            msg.verb,
            msg.operand.clone(),
            from,
            self.state.id(),
            JobKind::Delegated,
        ));
        if let Some(operand) = self.handle_request(from, msg.verb, &fields, &msg.token) {
            self.jobs.dequeue(&msg.token, &[JobKind::Delegated]);
            self.send_reply(msg.verb, operand, from, msg.token);
        }
    }

    fn on_reply(&mut self, from: Identifier, msg: WireMessage, fx: &mut Effects) {
        let Some(job) = self
            .jobs
            .dequeue(&msg.token, &[JobKind::Local, JobKind::Delegate])
        else {
            debug!(from = %from.short(), "reply with no matching job, dropping");
            return;
        };
        self.jobs
            .set_result(&msg.token, &[JobKind::Local, JobKind::Delegate], &msg.operand);
        if let Verb::Extension(code) = msg.verb {
            if let Some(mut handler) = self.extension.take() {
                handler(code, true, &msg.operand, from);
                self.extension = Some(handler);
            }
            if job.previous.is_none() {
                fx.completed.push((job.token.clone(), msg.operand.clone()));
            }
            return;
        }
        match job.previous.clone() {
            None => {
                self.on_root_reply(&msg);
                fx.completed.push((job.token.clone(), msg.operand.clone()));
            }
            Some(prev_token) => {
                let Some(prev) = self.jobs.get(&prev_token, &[]).cloned() else {
                    return;
                };
                match prev.kind {
                    JobKind::Local => self.on_driver_reply(prev, &msg, fx),
                    // A hop answered a lookup this node forwarded on behalf
                    // of a peer: re-wrap the operand under the peer's own
                    // token. Already-answered delegations stay silent.
                    JobKind::Delegated if prev.status != JobStatus::Dequeued => {
                        self.jobs.dequeue(&prev_token, &[JobKind::Delegated]);
                        self.send_reply(msg.verb, msg.operand.clone(), prev.from, prev_token);
                    }
                    _ => {}
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Request handlers
    // ------------------------------------------------------------------------

    /// Returns the reply operand, or `None` when the request was forwarded
    /// or rejected. Field-count or identifier parse failures abort the
    /// branch silently.
    fn handle_request(
        &mut self,
        from: Identifier,
        verb: Verb,
        fields: &[String],
        token: &Token,
    ) -> Option<String> {
        match verb {
            Verb::FindSuccessor => {
                if fields.len() != 2 {
                    return None;
                }
                parse_row(&fields[0])?;
                let target = Identifier::from_hex(&fields[1]).ok()?;
                if let Some(holder) = self.state.successor_holds(&target) {
                    return Some(unify_fields(&[
                        fields[0].clone(),
                        fields[1].clone(),
                        holder.id().to_hex(),
                        FLAG_FOUND.to_string(),
                    ]));
                }
                let hop = self.state.closest_preceding_finger(&target);
                if hop.id() == self.state.id() {
                    // Nothing closer is known; answer with the best guess
                    // and leave the flag clear.
                    let guess = self.state.successor().unwrap_or_else(|| self.state.self_ref());
                    return Some(unify_fields(&[
                        fields[0].clone(),
                        fields[1].clone(),
                        guess.id().to_hex(),
                        String::new(),
                    ]));
                }
                self.send_request(verb, unify_fields(fields), hop, Some(token.clone()));
                None
            }
            Verb::ClosestPrecedingFinger => {
                if fields.len() != 1 {
                    return None;
                }
                let target = Identifier::from_hex(&fields[0]).ok()?;
                let hop = self.state.closest_preceding_finger(&target);
                Some(unify_fields(&[fields[0].clone(), hop.id().to_hex()]))
            }
            Verb::QuerySuccessor => {
                if !fields.is_empty() {
                    return None;
                }
                let succ = self
                    .state
                    .successor()
                    .map(|s| s.id().to_hex())
                    .unwrap_or_default();
                Some(unify_fields(&[succ]))
            }
            Verb::QueryPredecessor => {
                if !fields.is_empty() {
                    return None;
                }
                let pred = self
                    .state
                    .predecessor()
                    .map(|p| p.id().to_hex())
                    .unwrap_or_default();
                Some(unify_fields(&[pred]))
            }
            Verb::NotifyPredecessor => {
                if fields.len() != 1 {
                    return None;
                }
                let candidate = Identifier::from_hex(&fields[0]).ok()?;
                if candidate != from {
                    debug!(from = %from.short(), "notify candidate does not match sender");
                    return None;
                }
                self.state.adopt_predecessor(NodeRef::new(candidate));
                let pred = self
                    .state
                    .predecessor()
                    .map(|p| p.id().to_hex())
                    .unwrap_or_default();
                Some(unify_fields(&[pred]))
            }
            Verb::FindPredecessor => {
                if fields.len() != 2 {
                    return None;
                }
                parse_row(&fields[0])?;
                let target = Identifier::from_hex(&fields[1]).ok()?;
                if let Some(succ) = self.state.successor_holds(&target) {
                    // Target falls between this node and its successor, so
                    // this node is the target's predecessor.
                    return Some(unify_fields(&[
                        fields[0].clone(),
                        fields[1].clone(),
                        self.state.id().to_hex(),
                        succ.id().to_hex(),
                        FLAG_FOUND.to_string(),
                    ]));
                }
                let hop = self.state.closest_preceding_finger(&target);
                if hop.id() == self.state.id() {
                    let guess = self.state.successor().unwrap_or_else(|| self.state.self_ref());
                    return Some(unify_fields(&[
                        fields[0].clone(),
                        fields[1].clone(),
                        self.state.id().to_hex(),
                        guess.id().to_hex(),
                        String::new(),
                    ]));
                }
                self.send_request(verb, unify_fields(fields), hop, Some(token.clone()));
                None
            }
            Verb::InitFingerTable | Verb::UpdateOthers => {
                debug!(
                    id = %self.state.id().short(),
                    verb = %verb.wire(false),
                    "driver verb from peer, dropping"
                );
                None
            }
            Verb::UpdateFingerTable => {
                if fields.len() != 2 {
                    return None;
                }
                let candidate = Identifier::from_hex(&fields[0]).ok()?;
                let row = parse_row(&fields[1])?;
                let accepted = self.state.update_finger(NodeRef::new(candidate), row);
                if accepted {
                    // Counter-clockwise propagation: the predecessor may
                    // cover the same candidate from further back.
                    if let Some(pred) = self.state.predecessor() {
                        if pred.id() != self.state.id() && pred.id() != candidate {
                            self.send_request(
                                verb,
                                unify_fields(fields),
                                pred,
                                Some(token.clone()),
                            );
                        }
                    }
                }
                Some(unify_fields(&[
                    fields[0].clone(),
                    fields[1].clone(),
                    if accepted { FLAG_UPDATED } else { "" }.to_string(),
                ]))
            }
            Verb::UpdateSuccessorsPredecessor => {
                if fields.len() != 1 {
                    return None;
                }
                let candidate = Identifier::from_hex(&fields[0]).ok()?;
                if candidate != from {
                    debug!(from = %from.short(), "stitch candidate does not match sender");
                    return None;
                }
                let former = self.state.predecessor();
                let adopted = self.state.adopt_predecessor(NodeRef::new(candidate));
                // The displaced predecessor goes back to the joiner so it
                // can link itself in behind.
                let former = if adopted {
                    former.map(|p| p.id().to_hex()).unwrap_or_default()
                } else {
                    String::new()
                };
                Some(unify_fields(&[former]))
            }
            Verb::UpdatePredecessorsSuccessor => {
                if fields.len() != 1 {
                    return None;
                }
                let candidate = Identifier::from_hex(&fields[0]).ok()?;
                if candidate != from {
                    debug!(from = %from.short(), "stitch candidate does not match sender");
                    return None;
                }
                self.state.adopt_successor(NodeRef::new(candidate));
                let succ = self.state.successor().unwrap_or_else(|| self.state.self_ref());
                Some(unify_fields(&[succ.id().to_hex()]))
            }
            Verb::FetchResource => {
                if fields.len() != 1 {
                    return None;
                }
                let key = Identifier::from_hex(&fields[0]).ok()?;
                if self.state.owns(&key) {
                    return Some(unify_fields(&[
                        fields[0].clone(),
                        self.state.id().to_hex(),
                        FLAG_OWN.to_string(),
                    ]));
                }
                if let Some(hop) = self.forward_hop(&key) {
                    self.send_request(verb, unify_fields(fields), hop, Some(token.clone()));
                    return None;
                }
                let guess = self
                    .state
                    .successor()
                    .map(|s| s.id().to_hex())
                    .unwrap_or_default();
                Some(unify_fields(&[fields[0].clone(), guess, String::new()]))
            }
            // Handled before job bookkeeping.
            Verb::Extension(_) => None,
        }
    }

    // ------------------------------------------------------------------------
    // Reply handlers
    // ------------------------------------------------------------------------

    /// Replies to requests this node sent on its own behalf, outside any
    /// driver chain.
    fn on_root_reply(&mut self, msg: &WireMessage) {
        match msg.verb {
            // Stabilization, second half: the successor reported its
            // predecessor. A closer node slots in as successor, then the
            // successor gets notified either way.
            Verb::QueryPredecessor => {
                if let Some(fields) = split_fields(&msg.operand) {
                    if let Some(reported) = fields.first() {
                        if let Ok(id) = Identifier::from_hex(reported) {
                            if id != self.state.id() {
                                self.state.adopt_successor(NodeRef::new(id));
                            }
                        }
                    }
                    if let Some(succ) = self.state.successor() {
                        if succ.id() != self.state.id() {
                            let operand = unify_fields(&[self.state.id().to_hex()]);
                            self.send_request(Verb::NotifyPredecessor, operand, succ, None);
                        }
                    }
                }
            }
            // Fix-fingers lookup came back: overwrite the row.
            Verb::FindSuccessor => {
                if let Some(fields) = split_fields(&msg.operand) {
                    if fields.len() == 4 {
                        if let (Some(row), Ok(id)) =
                            (parse_row(&fields[0]), Identifier::from_hex(&fields[2]))
                        {
                            self.state.refresh_row(row, NodeRef::new(id));
                        }
                    }
                }
            }
            _ => {}
        }
    }

    /// Replies whose job chains off a local driver job.
    fn on_driver_reply(&mut self, prev: Job, msg: &WireMessage, fx: &mut Effects) {
        match prev.verb {
            Verb::InitFingerTable => {
                if msg.verb == Verb::FindSuccessor {
                    if let Some(fields) = split_fields(&msg.operand) {
                        if fields.len() == 4 {
                            if let (Some(row), Ok(id)) =
                                (parse_row(&fields[0]), Identifier::from_hex(&fields[2]))
                            {
                                self.state.apply_build_resolution(row, NodeRef::new(id));
                            }
                        }
                    }
                }
                self.advance_build(&prev.token, fx);
                self.try_finalize_build(&prev.token, fx);
            }
            Verb::UpdateOthers => self.on_update_others_reply(prev, msg, fx),
            // Any other local chain settles its root with the operand.
            _ => {
                if self.jobs.dequeue(&prev.token, &[JobKind::Local]).is_some() {
                    self.jobs
                        .set_result(&prev.token, &[JobKind::Local], &msg.operand);
                    fx.completed.push((prev.token.clone(), msg.operand.clone()));
                }
            }
        }
    }

    fn on_update_others_reply(&mut self, prev: Job, msg: &WireMessage, fx: &mut Effects) {
        let uo = prev.token;
        match msg.verb {
            // The predecessor of `self - 2^i` answered: offer ourselves for
            // its row `i`, or skip the row when the walk fell short.
            Verb::FindPredecessor => {
                let Some(fields) = split_fields(&msg.operand) else {
                    return;
                };
                if fields.len() != 5 {
                    return;
                }
                let Some(row) = parse_row(&fields[0]) else {
                    return;
                };
                if fields[4] == FLAG_FOUND {
                    if let Ok(pred) = Identifier::from_hex(&fields[2]) {
                        if pred != self.state.id() {
                            let operand =
                                unify_fields(&[self.state.id().to_hex(), row.to_string()]);
                            self.send_request(
                                Verb::UpdateFingerTable,
                                operand,
                                NodeRef::new(pred),
                                Some(uo),
                            );
                            return;
                        }
                    }
                }
                self.advance_update_others(row as u16 + 1, &uo, fx);
            }
            Verb::UpdateFingerTable => {
                let Some(fields) = split_fields(&msg.operand) else {
                    return;
                };
                if fields.len() != 3 {
                    return;
                }
                let Some(row) = parse_row(&fields[1]) else {
                    return;
                };
                self.advance_update_others(row as u16 + 1, &uo, fx);
            }
            // The successor acknowledged the stitch and named its former
            // predecessor; link in behind it.
            Verb::UpdateSuccessorsPredecessor => {
                if let Some(fields) = split_fields(&msg.operand) {
                    if let Some(former) = fields.first().filter(|f| !f.is_empty()) {
                        if let Ok(former_id) = Identifier::from_hex(former) {
                            if former_id != self.state.id() {
                                let former_ref = NodeRef::new(former_id);
                                if self.state.adopt_predecessor(former_ref) {
                                    let operand = unify_fields(&[self.state.id().to_hex()]);
                                    self.send_request(
                                        Verb::UpdatePredecessorsSuccessor,
                                        operand,
                                        former_ref,
                                        None,
                                    );
                                }
                            }
                        }
                    }
                }
                self.finish_update_others(&uo, fx);
            }
            _ => {
                debug!(verb = %msg.verb.wire(true), "unexpected reply in pointer update chain");
            }
        }
    }

    // ------------------------------------------------------------------------
    // Finger-table build (join)
    // ------------------------------------------------------------------------

    fn advance_build(&mut self, build: &Token, fx: &mut Effects) {
        match self.state.next_build_step() {
            BuildStep::Resolve { row, start } => {
                let Some(seed) = self.state.seed() else {
                    return;
                };
                let operand = unify_fields(&[row.to_string(), start.to_hex()]);
                self.send_request(Verb::FindSuccessor, operand, seed, Some(build.clone()));
            }
            BuildStep::Done => self.try_finalize_build(build, fx),
            BuildStep::Idle => {}
        }
    }

    fn try_finalize_build(&mut self, build: &Token, fx: &mut Effects) {
        if !self.state.is_stable() || !self.jobs.fan_out_drained(build) {
            return;
        }
        if self.jobs.dequeue(build, &[JobKind::Local]).is_none() {
            return;
        }
        self.jobs.set_result(build, &[JobKind::Local], RESULT_BUILT);
        info!(
            id = %self.state.id().short(),
            successor = %self
                .state
                .successor()
                .map(|s| s.id().short())
                .unwrap_or_default(),
            "finger table complete"
        );
        fx.build_completed = true;
        fx.completed.push((build.clone(), RESULT_BUILT.to_string()));
        self.start_update_others(fx);
    }

    // ------------------------------------------------------------------------
    // Pointer propagation (update others)
    // ------------------------------------------------------------------------

    fn start_update_others(&mut self, fx: &mut Effects) {
        let uo = self.jobs.enqueue(Job::new(
            Verb::UpdateOthers,
            "",
            self.state.id(),
            self.state.id(),
            JobKind::Local,
        ));
        debug!(id = %self.state.id().short(), "propagating into peer finger tables");
        self.advance_update_others(0, &uo, fx);
    }

    /// Walk rows starting at `from_row`. For each row the node whose table
    /// may need us is the predecessor of `self - 2^row`; rows whose update
    /// would land on this node itself are skipped. One lookup is in flight
    /// at a time; the walk resumes from the reply.
    fn advance_update_others(&mut self, from_row: u16, uo: &Token, fx: &mut Effects) {
        let mut row = from_row;
        while (row as usize) < FINGER_ROWS {
            let target = self.state.update_others_target(row);
            if self.state.successor_holds(&target).is_some() {
                // Target maps between this node and its successor, so the
                // predecessor of the target is this node.
                row += 1;
                continue;
            }
            let hop = self.state.closest_preceding_finger(&target);
            if hop.id() == self.state.id() {
                row += 1;
                continue;
            }
            let operand = unify_fields(&[row.to_string(), target.to_hex()]);
            self.send_request(Verb::FindPredecessor, operand, hop, Some(uo.clone()));
            return;
        }
        // Walk finished: hand the successor its new predecessor.
        match self.state.successor() {
            Some(succ) if succ.id() != self.state.id() => {
                let operand = unify_fields(&[self.state.id().to_hex()]);
                self.send_request(
                    Verb::UpdateSuccessorsPredecessor,
                    operand,
                    succ,
                    Some(uo.clone()),
                );
            }
            _ => self.finish_update_others(uo, fx),
        }
    }

    fn finish_update_others(&mut self, uo: &Token, fx: &mut Effects) {
        if self.jobs.dequeue(uo, &[JobKind::Local]).is_none() {
            return;
        }
        self.jobs.set_result(uo, &[JobKind::Local], RESULT_PROPAGATED);
        debug!(id = %self.state.id().short(), "pointer propagation finished");
        fx.completed.push((uo.clone(), RESULT_PROPAGATED.to_string()));
    }

    // ------------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------------

    /// Next hop for a key lookup: the finger row whose interval contains
    /// the key, falling back to the closest preceding finger.
    fn forward_hop(&self, key: &Identifier) -> Option<NodeRef> {
        let own = self.state.id();
        self.state
            .fingers()
            .row_containing(key)
            .and_then(|(_, row)| row.candidate().copied())
            .filter(|c| c.id() != own)
            .or_else(|| {
                let c = self.state.closest_preceding_finger(key);
                (c.id() != own).then_some(c)
            })
    }

    /// Mint a delegate job, queue it, and stage the request line.
    fn send_request(
        &mut self,
        verb: Verb,
        operand: String,
        to: NodeRef,
        previous: Option<Token>,
    ) -> Token {
        let mut job = Job::new(verb, operand.clone(), self.state.id(), to.id(), JobKind::Delegate);
        if let Some(prev) = previous {
            job = job.after(prev);
        }
        let token = self.jobs.enqueue(job);
        self.jobs.mark_waiting(&token);
        self.push_line(to, WireMessage::request(verb, operand, token.clone()));
        token
    }

    fn send_reply(&mut self, verb: Verb, operand: String, to: Identifier, token: Token) {
        self.push_line(NodeRef::new(to), WireMessage::reply(verb, operand, token));
    }

    /// Stage an encoded line on the transport queue.
    fn push_line(&mut self, to: NodeRef, msg: WireMessage) {
        let record = Job::with_token(
            msg.token.clone(),
            msg.verb,
            msg.encode(),
            self.state.id(),
            to.id(),
            JobKind::Signaling,
        );
        self.outbox.push_back((to, record));
    }

    /// Drain the staged lines into an outcome. Handing a line to the
    /// transport removes it from the queue.
    fn finish(&mut self, fx: Effects) -> DispatchOutcome {
        let outbound = self
            .outbox
            .drain(..)
            .map(|(to, job)| Envelope { to, line: job.operand })
            .collect();
        DispatchOutcome {
            outbound,
            completed: fx.completed,
            build_completed: fx.build_completed,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn id(v: u64) -> Identifier {
        Identifier::from_low_u64(v)
    }

    fn nref(v: u64) -> NodeRef {
        NodeRef::new(id(v))
    }

    /// In-process ring: cores wired directly to each other, messages pumped
    /// synchronously to quiescence.
    struct TestNet {
        cores: Vec<Core>,
        completions: Vec<(usize, Token, String)>,
        build_events: Vec<usize>,
    }

    impl TestNet {
        fn new(ids: &[u64]) -> TestNet {
            TestNet {
                cores: ids.iter().map(|v| Core::new(nref(*v))).collect(),
                completions: Vec::new(),
                build_events: Vec::new(),
            }
        }

        fn index_of(&self, id: Identifier) -> Option<usize> {
            self.cores.iter().position(|c| c.state.id() == id)
        }

        fn absorb(
            &mut self,
            i: usize,
            out: DispatchOutcome,
            queue: &mut VecDeque<(Identifier, Envelope)>,
        ) {
            let DispatchOutcome { outbound, completed, build_completed } = out;
            let from = self.cores[i].state.id();
            for env in outbound {
                queue.push_back((from, env));
            }
            for (token, result) in completed {
                self.completions.push((i, token, result));
            }
            if build_completed {
                self.build_events.push(i);
            }
        }

        fn pump_from(&mut self, origin: usize, out: DispatchOutcome) {
            let mut queue = VecDeque::new();
            self.absorb(origin, out, &mut queue);
            let mut hops = 0usize;
            while let Some((from, env)) = queue.pop_front() {
                hops += 1;
                assert!(hops < 200_000, "message storm");
                let Some(i) = self.index_of(env.to.id()) else {
                    continue;
                };
                let out = self.cores[i].receive(from, &env.line);
                self.absorb(i, out, &mut queue);
            }
        }

        fn boot(&mut self, i: usize) {
            let out = self.cores[i].join(None);
            assert!(out.build_completed);
            assert!(out.outbound.is_empty());
            self.build_events.push(i);
        }

        fn join(&mut self, i: usize, seed: usize) {
            let seed_ref = self.cores[seed].state.self_ref();
            let out = self.cores[i].join(Some(seed_ref));
            self.pump_from(i, out);
        }

        fn stabilize_round(&mut self) {
            for i in 0..self.cores.len() {
                let out = self.cores[i].stabilize();
                self.pump_from(i, out);
            }
        }

        fn successor_of(&self, i: usize) -> Identifier {
            self.cores[i].state.successor().unwrap().id()
        }

        fn predecessor_of(&self, i: usize) -> Identifier {
            self.cores[i].state.predecessor().unwrap().id()
        }

        fn locate(&mut self, i: usize, key: u64) -> Identifier {
            let (token, out) = self.cores[i].locate(id(key));
            self.pump_from(i, out);
            let (_, _, result) = self
                .completions
                .iter()
                .rev()
                .find(|(ci, t, _)| *ci == i && *t == token)
                .expect("lookup did not complete");
            let fields = split_fields(result).unwrap();
            Identifier::from_hex(&fields[1]).unwrap()
        }
    }

    fn three_ring() -> TestNet {
        let mut net = TestNet::new(&[100, 500, 900]);
        net.boot(0);
        net.join(1, 0);
        net.join(2, 0);
        net.stabilize_round();
        net
    }

    #[test]
    fn sole_node_answers_find_successor_with_itself() {
        let mut core = Core::new(nref(100));
        let out = core.join(None);
        assert!(out.build_completed);

        let target = id(42).to_hex();
        let out = core.receive(id(500), &format!("FS 3,{target} cafef00d\n"));
        assert_eq!(out.outbound.len(), 1);
        let env = &out.outbound[0];
        assert_eq!(env.to.id(), id(500));

        let msg = WireMessage::parse(&env.line).unwrap();
        assert!(msg.reply);
        assert_eq!(msg.verb, Verb::FindSuccessor);
        assert_eq!(msg.token.as_str(), "cafef00d");
        let fields = msg.fields().unwrap();
        assert_eq!(
            fields,
            vec!["3".to_string(), target, id(100).to_hex(), FLAG_FOUND.to_string()]
        );
    }

    #[test]
    fn malformed_lines_never_produce_output() {
        let mut core = Core::new(nref(100));
        core.join(None);
        let bad = [
            "",
            "\n",
            "FS\n",
            "FS 1,2\n",
            "fs 1,2 tok\n",
            "FSX 1,2 tok\n",
            "FS 1,2 tok extra\n",
            "F_ x tok\n",
            "FS {a,b tok\n",
        ];
        for line in bad {
            let out = core.receive(id(500), line);
            assert!(out.outbound.is_empty(), "line {line:?} produced output");
        }
    }

    #[test]
    fn unparseable_operand_gets_no_reply() {
        let mut core = Core::new(nref(100));
        core.join(None);
        // Well-formed line, but the target is not an identifier.
        let out = core.receive(id(500), "FS 1,zz tok1\n");
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn unknown_reply_token_is_dropped() {
        let mut core = Core::new(nref(100));
        core.join(None);
        let out = core.receive(id(500), "FS_ 1,aa,bb,found deadbeef\n");
        assert!(out.outbound.is_empty());
        assert!(out.completed.is_empty());
    }

    #[test]
    fn forwarded_lookup_reply_is_rewrapped_for_the_original_asker() {
        // b(500) routes toward c(900); c holds (900, 100] and answers.
        let mut b = Core::new(nref(500));
        b.join(None);
        assert!(b.state.adopt_successor(nref(900)));
        let mut c = Core::new(nref(900));
        c.join(None);
        assert!(c.state.adopt_successor(nref(100)));
        assert!(c.state.adopt_predecessor(nref(500)));

        let target = id(950).to_hex();
        let out = b.receive(id(100), &format!("FS 0,{target} tok-origin\n"));
        assert_eq!(out.outbound.len(), 1);
        let fwd = &out.outbound[0];
        assert_eq!(fwd.to.id(), id(900));
        let fwd_msg = WireMessage::parse(&fwd.line).unwrap();
        assert!(!fwd_msg.reply);
        assert_ne!(fwd_msg.token.as_str(), "tok-origin");

        let out = c.receive(id(500), &fwd.line);
        assert_eq!(out.outbound.len(), 1);
        let rep = &out.outbound[0];
        assert_eq!(rep.to.id(), id(500));

        let out = b.receive(id(900), &rep.line);
        assert_eq!(out.outbound.len(), 1);
        let final_env = &out.outbound[0];
        assert_eq!(final_env.to.id(), id(100));
        let final_msg = WireMessage::parse(&final_env.line).unwrap();
        assert!(final_msg.reply);
        assert_eq!(final_msg.token.as_str(), "tok-origin");
        let fields = final_msg.fields().unwrap();
        assert_eq!(fields[2], id(100).to_hex());
        assert_eq!(fields[3], FLAG_FOUND);

        // The delegated record is settled; a duplicate reply stays silent.
        let record = b.jobs.get(&Token::from_wire("tok-origin"), &[]).unwrap();
        assert_eq!(record.status, JobStatus::Dequeued);
        let out = b.receive(id(900), &rep.line);
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn join_stitches_a_two_node_ring() {
        let mut net = TestNet::new(&[100, 500]);
        net.boot(0);
        net.join(1, 0);

        assert!(net.cores[1].state.is_stable());
        assert!(net.build_events.contains(&1));
        assert_eq!(net.successor_of(1), id(100));
        assert_eq!(net.predecessor_of(1), id(100));
        assert_eq!(net.successor_of(0), id(500));
        assert_eq!(net.predecessor_of(0), id(500));

        // Both driver jobs ran to completion and the ledger keeps them.
        let drivers: Vec<_> = net.cores[1]
            .jobs
            .iter()
            .filter(|j| j.kind == JobKind::Local)
            .collect();
        assert!(drivers.len() >= 2);
        assert!(drivers.iter().all(|j| j.status == JobStatus::Dequeued));
        assert!(net.cores[1].state.fingers().is_complete());
    }

    #[test]
    fn three_nodes_form_an_ordered_ring() {
        let mut net = three_ring();

        assert_eq!(net.successor_of(0), id(500));
        assert_eq!(net.successor_of(1), id(900));
        assert_eq!(net.successor_of(2), id(100));
        assert_eq!(net.predecessor_of(0), id(900));
        assert_eq!(net.predecessor_of(1), id(100));
        assert_eq!(net.predecessor_of(2), id(500));

        // Another stabilization round must not churn the pointers.
        net.stabilize_round();
        assert_eq!(net.successor_of(0), id(500));
        assert_eq!(net.successor_of(1), id(900));
        assert_eq!(net.successor_of(2), id(100));

        // Every finger candidate is a real member.
        let members = [id(100), id(500), id(900)];
        for core in &net.cores {
            for row in (0..FINGER_ROWS).step_by(37) {
                if let Some(c) = core.state.fingers().row(row).candidate() {
                    assert!(members.contains(&c.id()));
                }
            }
        }
    }

    #[test]
    fn lookups_agree_on_key_ownership() {
        let mut net = TestNet::new(&[100, 500, 900]);
        net.boot(0);
        net.join(1, 0);

        // Two members: the wrap interval (500, 100] belongs to 100.
        assert_eq!(net.locate(0, 700), id(100));

        net.join(2, 0);
        net.stabilize_round();

        // 900 took over (500, 900]; every member agrees.
        assert_eq!(net.locate(0, 700), id(900));
        assert_eq!(net.locate(1, 300), id(500));
        assert_eq!(net.locate(2, 950), id(100));
        assert_eq!(net.locate(1, 100), id(100));
        assert_eq!(net.locate(2, 500), id(500));
    }

    #[test]
    fn fix_fingers_heals_a_stale_row() {
        let mut net = three_ring();

        // Row 9 of node 100 starts at 612, so its successor is 900.
        net.cores[0].state.refresh_row(9, nref(500));
        let out = net.cores[0].fix_fingers(9);
        net.pump_from(0, out);
        assert_eq!(
            net.cores[0].state.fingers().row(9).candidate().unwrap().id(),
            id(900)
        );

        // Row 5 of node 900 starts at 932, inside (900, 100]: no wire
        // traffic, the successor is adopted directly.
        net.cores[2].state.refresh_row(5, nref(500));
        let out = net.cores[2].fix_fingers(5);
        assert!(out.outbound.is_empty());
        assert_eq!(
            net.cores[2].state.fingers().row(5).candidate().unwrap().id(),
            id(100)
        );
    }

    #[test]
    fn stabilize_and_notify_link_two_booted_nodes() {
        let mut a = Core::new(nref(100));
        a.join(None);
        let mut b = Core::new(nref(500));
        b.join(None);
        assert!(a.state.adopt_successor(nref(500)));

        // a asks its successor for the successor's predecessor.
        let out = a.stabilize();
        assert_eq!(out.outbound.len(), 1);
        let qp = WireMessage::parse(&out.outbound[0].line).unwrap();
        assert_eq!(qp.verb, Verb::QueryPredecessor);
        assert!(!qp.reply);

        // b reports itself; a keeps its successor and notifies.
        let out_b = b.receive(id(100), &out.outbound[0].line);
        let out_a = a.receive(id(500), &out_b.outbound[0].line);
        assert_eq!(out_a.outbound.len(), 1);
        let np = WireMessage::parse(&out_a.outbound[0].line).unwrap();
        assert_eq!(np.verb, Verb::NotifyPredecessor);

        let out_b = b.receive(id(100), &out_a.outbound[0].line);
        assert_eq!(b.state.predecessor().unwrap().id(), id(100));
        let out_a = a.receive(id(500), &out_b.outbound[0].line);
        assert!(out_a.outbound.is_empty());
        assert_eq!(out_a.completed.len(), 1);

        // b's successor still loops onto itself; its next round opens the
        // loop using the predecessor it just learned.
        let out_b = b.stabilize();
        assert_eq!(b.state.successor().unwrap().id(), id(100));
        let out_a = a.receive(id(500), &out_b.outbound[0].line);
        assert_eq!(a.state.predecessor().unwrap().id(), id(500));
        assert_eq!(out_a.outbound.len(), 1);
    }

    #[test]
    fn finger_offer_is_accepted_once_and_propagated_nowhere_alone() {
        let mut core = Core::new(nref(500));
        core.join(None);

        let candidate = id(950).to_hex();
        let out = core.receive(id(950), &format!("UF {candidate},3 tok-a\n"));
        assert_eq!(out.outbound.len(), 1);
        let msg = WireMessage::parse(&out.outbound[0].line).unwrap();
        let fields = msg.fields().unwrap();
        assert_eq!(fields[2], FLAG_UPDATED);
        assert_eq!(
            core.state.fingers().row(3).candidate().unwrap().id(),
            id(950)
        );

        // Same offer again: the row already points there, flag stays clear.
        let out = core.receive(id(950), &format!("UF {candidate},3 tok-b\n"));
        let msg = WireMessage::parse(&out.outbound[0].line).unwrap();
        let fields = msg.fields().unwrap();
        assert_eq!(fields[2], "");
    }

    #[test]
    fn extension_requests_reach_the_installed_handler() {
        let mut a = Core::new(nref(100));
        a.join(None);
        a.set_extension_handler(Box::new(|code, reply, operand, _from| {
            assert_eq!(code, *b"ZZ");
            (!reply).then(|| format!("echo,{operand}"))
        }));

        let out = a.receive(id(500), "ZZ ping cafebabe\n");
        assert_eq!(out.outbound.len(), 1);
        let msg = WireMessage::parse(&out.outbound[0].line).unwrap();
        assert!(msg.reply);
        assert_eq!(msg.verb, Verb::EXTENSION);
        assert_eq!(msg.operand, "echo,ping");
        assert_eq!(msg.token.as_str(), "cafebabe");

        // Without a handler the request is dropped outright.
        let mut bare = Core::new(nref(900));
        bare.join(None);
        let out = bare.receive(id(500), "ZZ ping cafebabe\n");
        assert!(out.outbound.is_empty());
    }

    #[test]
    fn extension_round_trip_completes_the_root_job() {
        let mut a = Core::new(nref(100));
        a.join(None);
        a.set_extension_handler(Box::new(|_, reply, operand, _| {
            (!reply).then(|| format!("echo,{operand}"))
        }));
        let mut b = Core::new(nref(500));
        b.join(None);

        // A code that collides with a protocol verb is refused.
        assert!(b.send_extension(nref(100), *b"FS", "x").is_none());

        let (token, out) = b.send_extension(nref(100), *b"ZZ", "ping").unwrap();
        assert_eq!(out.outbound.len(), 1);
        let out_a = a.receive(id(500), &out.outbound[0].line);
        let out_b = b.receive(id(100), &out_a.outbound[0].line);
        assert_eq!(out_b.completed, vec![(token, "echo,ping".to_string())]);
    }

    #[test]
    fn successor_failure_promotes_backup_and_notifies_it() {
        let mut core = Core::new(nref(100));
        core.join(None);
        assert!(core.state.adopt_successor(nref(900)));
        assert!(core.state.adopt_successor(nref(500)));

        let out = core.report_successor_failure();
        assert_eq!(core.state.successor().unwrap().id(), id(900));
        assert_eq!(out.outbound.len(), 1);
        assert_eq!(out.outbound[0].to.id(), id(900));
        let msg = WireMessage::parse(&out.outbound[0].line).unwrap();
        assert_eq!(msg.verb, Verb::NotifyPredecessor);
    }
}
