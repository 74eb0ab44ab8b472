//! # Chord State Machine
//!
//! Protocol state of one node and the synchronous decision rules the
//! dispatcher consults: successor/predecessor adoption, responsibility,
//! the incremental finger-table build, and the propagation targets.
//!
//! Nothing here suspends or touches the network. Every multi-hop
//! operation is expressed as "decide, hand an outbound job to the
//! dispatcher, return"; a later reply dispatch resumes it. That keeps the
//! node responsive while a lookup crosses many peers, and keeps these
//! rules unit-testable in isolation.
//!
//! ## Build Progress
//!
//! ```text
//! Unjoined ── boot_alone() ────────────────────────► Stable
//!     │                                                ▲
//!     └─ begin_join(seed) ─► Building{row 0..511} ─────┘
//! ```
//!
//! A boot node fills all 512 rows with itself synchronously. A joining
//! node resolves rows incrementally, one outstanding lookup at a time,
//! reusing the previous row's candidate whenever it already covers the
//! next row's start (most high rows collapse this way, so a join is far
//! fewer than 512 round trips).

use tracing::debug;

use crate::identity::{Identifier, Interval, NodeRef, RING_BITS};
use crate::routing::{FingerTable, TableSnapshot, FINGER_ROWS};

/// Where a node stands in the join/build lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildProgress {
    /// Constructed, not yet part of any ring.
    Unjoined,
    /// Incremental build in progress; `row` is the next unresolved row.
    Building { row: usize },
    /// Table complete; periodic stabilization keeps it honest.
    Stable,
}

/// Next action for the incremental build.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildStep {
    /// Row `row` needs a network lookup for the successor of `start`.
    Resolve { row: usize, start: Identifier },
    /// The last row just resolved; the table is complete.
    Done,
    /// No build in progress.
    Idle,
}

/// Aggregate protocol state of one node. Owned exclusively by that node's
/// actor; peers only ever see [`NodeRef`] value copies of it.
pub struct ChordState {
    self_ref: NodeRef,
    predecessor: Option<NodeRef>,
    fingers: FingerTable,
    progress: BuildProgress,
    seed: Option<NodeRef>,
    dirty: bool,
}

impl ChordState {
    pub fn new(self_ref: NodeRef) -> ChordState {
        ChordState {
            self_ref,
            predecessor: None,
            fingers: FingerTable::new(self_ref.id()),
            progress: BuildProgress::Unjoined,
            seed: None,
            dirty: false,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    #[inline]
    pub fn id(&self) -> Identifier {
        self.self_ref.id()
    }

    #[inline]
    pub fn self_ref(&self) -> NodeRef {
        self.self_ref
    }

    #[inline]
    pub fn predecessor(&self) -> Option<NodeRef> {
        self.predecessor
    }

    /// The ring successor (row 0's preferred candidate).
    #[inline]
    pub fn successor(&self) -> Option<NodeRef> {
        self.fingers.successor().copied()
    }

    #[inline]
    pub fn fingers(&self) -> &FingerTable {
        &self.fingers
    }

    #[inline]
    pub fn progress(&self) -> BuildProgress {
        self.progress
    }

    #[inline]
    pub fn seed(&self) -> Option<NodeRef> {
        self.seed
    }

    /// True once the table is complete and stabilization is running.
    #[inline]
    pub fn is_stable(&self) -> bool {
        self.progress == BuildProgress::Stable
    }

    // ------------------------------------------------------------------
    // Join / build
    // ------------------------------------------------------------------

    /// Become the sole ring member: every row points at self, predecessor
    /// is self, and the node is immediately stable.
    pub fn boot_alone(&mut self) {
        self.fingers.fill_all(self.self_ref);
        self.predecessor = Some(self.self_ref);
        self.progress = BuildProgress::Stable;
        self.seed = None;
        self.dirty = true;
        debug!(id = %self.id().short(), "booted as sole ring member");
    }

    /// Start the incremental build against `seed`.
    pub fn begin_join(&mut self, seed: NodeRef) {
        self.seed = Some(seed);
        self.progress = BuildProgress::Building { row: 0 };
        debug!(id = %self.id().short(), seed = %seed.id().short(), "joining via seed");
    }

    /// Advance the build to the next row that actually needs the network.
    ///
    /// Rows whose start already lies inside `[self, previous candidate)`
    /// reuse that candidate without a round trip. Returns the lookup to
    /// perform, or [`BuildStep::Done`] exactly once when row 511 has
    /// resolved.
    pub fn next_build_step(&mut self) -> BuildStep {
        loop {
            let row = match self.progress {
                BuildProgress::Building { row } => row,
                _ => return BuildStep::Idle,
            };
            if row >= FINGER_ROWS {
                self.progress = BuildProgress::Stable;
                debug!(id = %self.id().short(), "finger table build complete");
                return BuildStep::Done;
            }
            let start = *self.fingers.row(row).start();
            if row > 0 {
                let prev = self.fingers.row(row - 1).candidate().copied();
                if let Some(prev) = prev {
                    if Interval::ClosedOpen.contains(&self.id(), &prev.id(), &start) {
                        self.fingers.set_candidate(row, prev);
                        self.dirty = true;
                        self.progress = BuildProgress::Building { row: row + 1 };
                        continue;
                    }
                }
            }
            return BuildStep::Resolve { row, start };
        }
    }

    /// Apply a resolved successor for the row the build is waiting on.
    /// Replies for any other row are stale and ignored (idempotence).
    pub fn apply_build_resolution(&mut self, row: usize, node: NodeRef) -> bool {
        match self.progress {
            BuildProgress::Building { row: expected } if expected == row => {
                self.fingers.set_candidate(row, node);
                self.progress = BuildProgress::Building { row: row + 1 };
                self.dirty = true;
                true
            }
            _ => false,
        }
    }

    // ------------------------------------------------------------------
    // Routing decisions
    // ------------------------------------------------------------------

    /// If `target` falls in `(self, successor]`, the successor is its
    /// holder and the lookup ends here.
    pub fn successor_holds(&self, target: &Identifier) -> Option<NodeRef> {
        let succ = self.successor()?;
        Interval::OpenClosed
            .contains(&self.id(), &succ.id(), target)
            .then_some(succ)
    }

    /// The logarithmic routing step, falling back to self.
    pub fn closest_preceding_finger(&self, target: &Identifier) -> NodeRef {
        let hit = self.fingers.closest_preceding_finger(target);
        if hit.id() == self.id() {
            self.self_ref
        } else {
            hit
        }
    }

    /// Responsibility: a key in `(predecessor, self]` is owned here. With
    /// no predecessor known the node answers for everything it sees.
    pub fn owns(&self, key: &Identifier) -> bool {
        match &self.predecessor {
            Some(p) => Interval::OpenClosed.contains(&p.id(), &self.id(), key),
            None => true,
        }
    }

    /// Target identifier whose predecessor should learn about this node
    /// for row `i`: `(self - 2^i) mod 2^512`.
    pub fn update_others_target(&self, i: u16) -> Identifier {
        self.id().sub_pow2(i).modulo(RING_BITS)
    }

    // ------------------------------------------------------------------
    // Pointer adoption
    // ------------------------------------------------------------------

    /// Notify rule: adopt `candidate` as predecessor if none is set or it
    /// lies strictly between the current predecessor and self.
    pub fn adopt_predecessor(&mut self, candidate: NodeRef) -> bool {
        let adopt = match &self.predecessor {
            None => true,
            Some(p) => Interval::Open.contains(&p.id(), &self.id(), &candidate.id()),
        };
        if adopt {
            debug!(
                id = %self.id().short(),
                predecessor = %candidate.id().short(),
                "adopted predecessor"
            );
            self.predecessor = Some(candidate);
            self.dirty = true;
        }
        adopt
    }

    /// Stabilize rule: a reported predecessor of our successor that lies
    /// strictly between self and successor becomes the new successor; the
    /// displaced one is kept as a backup.
    pub fn adopt_successor(&mut self, candidate: NodeRef) -> bool {
        let Some(current) = self.successor() else {
            self.fingers.set_candidate(0, candidate);
            self.dirty = true;
            return true;
        };
        if candidate == current {
            return false;
        }
        if !Interval::Open.contains(&self.id(), &current.id(), &candidate.id()) {
            return false;
        }
        debug!(
            id = %self.id().short(),
            successor = %candidate.id().short(),
            "adopted successor"
        );
        self.fingers.set_candidate(0, candidate);
        self.fingers.push_backup(0, current);
        self.dirty = true;
        true
    }

    /// Update-finger rule for row `i`: accept `candidate` when it is not
    /// this node and improves on the current entry, i.e. lies in
    /// `[row start, current candidate)`. An unresolved row accepts any
    /// non-self candidate. A `true` return obliges the caller to forward
    /// the same update toward the predecessor.
    pub fn update_finger(&mut self, candidate: NodeRef, i: usize) -> bool {
        if candidate.id() == self.id() || i >= FINGER_ROWS {
            return false;
        }
        let row = self.fingers.row(i);
        let accept = match row.candidate() {
            Some(current) => {
                Interval::ClosedOpen.contains(row.start(), &current.id(), &candidate.id())
            }
            None => true,
        };
        if accept {
            self.fingers.set_candidate(i, candidate);
            self.dirty = true;
        }
        accept
    }

    /// Overwrite row `i` with a freshly resolved successor (fix-fingers
    /// path: a new resolution beats whatever is there).
    pub fn refresh_row(&mut self, i: usize, node: NodeRef) {
        if i < FINGER_ROWS {
            self.fingers.set_candidate(i, node);
            self.dirty = true;
        }
    }

    /// Successor failure: rotate the next backup into place. Returns the
    /// new successor if one was available.
    pub fn successor_failed(&mut self) -> Option<NodeRef> {
        let promoted = self.fingers.promote_next_candidate(0);
        if promoted.is_some() {
            self.dirty = true;
        }
        promoted
    }

    // ------------------------------------------------------------------
    // Persistence hooks
    // ------------------------------------------------------------------

    /// Consume the dirty flag; the caller schedules a snapshot save when
    /// this returns true.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }

    pub fn snapshot(&self) -> TableSnapshot {
        self.fingers.snapshot(self.predecessor)
    }
}

// ============================================================================
// Tests
// ============================================================================
