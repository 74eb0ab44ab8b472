//! # Finger Table
//!
//! Per-node routing state: 512 fixed interval rows over the identifier
//! ring, each holding a ranked list of candidate successors for its
//! interval. Row `i` starts at `(self + 2^i) mod 2^512` and covers
//! `[start_i, start_{i+1})`; row 511's interval ends at the owner itself,
//! so the rows jointly cover the whole ring except the owner's own point.
//!
//! Row geometry is fixed at construction. Protocol updates only ever
//! replace the preferred candidate (`candidates[0]`); stabilization may
//! keep a displaced successor as a backup, and a dead primary is handled
//! by rotating the next backup into first place rather than editing the
//! row.
//!
//! The logarithmic routing step is [`FingerTable::closest_preceding_finger`]:
//! scan rows from the widest interval down and return the first candidate
//! strictly between the owner and the lookup target.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::identity::{Identifier, Interval, NodeRef, RING_BITS};

/// Number of finger rows; one per ring bit.
pub const FINGER_ROWS: usize = RING_BITS as usize;

/// Backup candidates retained per row beyond the preferred one.
pub const MAX_ROW_BACKUPS: usize = 3;

// ============================================================================
// FingerEntry
// ============================================================================

/// One routing row: a fixed interval and its candidate successors,
/// most-preferred first.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FingerEntry {
    start: Identifier,
    end: Identifier,
    candidates: VecDeque<NodeRef>,
}

impl FingerEntry {
    /// Build row `i` for `owner`. Start and interval never change after
    /// this.
    pub fn build(owner: &Identifier, i: u16) -> FingerEntry {
        FingerEntry {
            start: owner.add_pow2(i).modulo(RING_BITS),
            end: owner.add_pow2(i + 1).modulo(RING_BITS),
            candidates: VecDeque::new(),
        }
    }

    #[inline]
    pub fn start(&self) -> &Identifier {
        &self.start
    }

    /// Exclusive end of the interval, the next row's start.
    #[inline]
    pub fn end(&self) -> &Identifier {
        &self.end
    }

    /// The preferred candidate, if the row is resolved.
    #[inline]
    pub fn candidate(&self) -> Option<&NodeRef> {
        self.candidates.front()
    }

    /// All candidates, most-preferred first.
    #[inline]
    pub fn candidates(&self) -> impl Iterator<Item = &NodeRef> {
        self.candidates.iter()
    }

    /// Interval membership for this row: `[start, end)` on the ring.
    pub fn covers(&self, key: &Identifier) -> bool {
        Interval::ClosedOpen.contains(&self.start, &self.end, key)
    }

    /// Replace the preferred candidate. The displaced one is dropped;
    /// backups keep their order.
    fn set_candidate(&mut self, node: NodeRef) {
        if self.candidates.is_empty() {
            self.candidates.push_front(node);
        } else {
            self.candidates[0] = node;
        }
        self.candidates.truncate(1 + MAX_ROW_BACKUPS);
    }

    /// Keep a node as the first backup unless already listed. A freshly
    /// displaced successor is the best fallback, so it goes right behind
    /// the primary.
    fn push_backup(&mut self, node: NodeRef) {
        if self.candidates.contains(&node) {
            return;
        }
        let at = 1.min(self.candidates.len());
        self.candidates.insert(at, node);
        self.candidates.truncate(1 + MAX_ROW_BACKUPS);
    }

    /// Rotate the next backup into first place. Returns the new preferred
    /// candidate if a rotation happened.
    fn promote_next(&mut self) -> Option<NodeRef> {
        if self.candidates.len() < 2 {
            return None;
        }
        self.candidates.rotate_left(1);
        self.candidates.front().copied()
    }
}

// ============================================================================
// FingerTable
// ============================================================================

/// The 512-row routing table of one node.
#[derive(Clone, Debug)]
pub struct FingerTable {
    owner: Identifier,
    rows: Vec<FingerEntry>,
}

impl FingerTable {
    /// Build the full row skeleton for `owner`; every interval is fixed
    /// here, candidates are resolved by the protocol afterwards.
    pub fn new(owner: Identifier) -> FingerTable {
        let rows = (0..FINGER_ROWS as u16)
            .map(|i| FingerEntry::build(&owner, i))
            .collect();
        FingerTable { owner, rows }
    }

    #[inline]
    pub fn owner(&self) -> &Identifier {
        &self.owner
    }

    #[inline]
    pub fn row(&self, i: usize) -> &FingerEntry {
        &self.rows[i]
    }

    /// The ring successor: row 0's preferred candidate.
    #[inline]
    pub fn successor(&self) -> Option<&NodeRef> {
        self.rows[0].candidate()
    }

    /// Replace row `i`'s preferred candidate.
    pub fn set_candidate(&mut self, i: usize, node: NodeRef) {
        trace!(row = i, candidate = %node.id().short(), "finger candidate set");
        self.rows[i].set_candidate(node);
    }

    /// Keep `node` as a backup on row `i`.
    pub fn push_backup(&mut self, i: usize, node: NodeRef) {
        self.rows[i].push_backup(node);
    }

    /// Rotate row `i`'s next backup into first place after the primary is
    /// known dead.
    pub fn promote_next_candidate(&mut self, i: usize) -> Option<NodeRef> {
        let promoted = self.rows[i].promote_next();
        if let Some(node) = &promoted {
            debug!(row = i, promoted = %node.id().short(), "promoted backup candidate");
        }
        promoted
    }

    /// Point every row at `node`. Boot path for the first ring member, and
    /// the reset state for a node alone again.
    pub fn fill_all(&mut self, node: NodeRef) {
        for row in self.rows.iter_mut() {
            row.set_candidate(node);
        }
    }

    /// Lowest row index with no candidate yet.
    pub fn first_unresolved_row(&self) -> Option<usize> {
        self.rows.iter().position(|r| r.candidate().is_none())
    }

    /// True when every row has a candidate.
    pub fn is_complete(&self) -> bool {
        self.first_unresolved_row().is_none()
    }

    /// The logarithmic routing step: scanning from row 511 down, the first
    /// candidate strictly between the owner and `target`. Falls back to the
    /// owner when no finger qualifies.
    pub fn closest_preceding_finger(&self, target: &Identifier) -> NodeRef {
        for row in self.rows.iter().rev() {
            if let Some(candidate) = row.candidate() {
                if Interval::Open.contains(&self.owner, target, &candidate.id()) {
                    return *candidate;
                }
            }
        }
        NodeRef::new(self.owner)
    }

    /// The row whose interval contains `key`. `None` only for the owner's
    /// own identifier, which no row covers.
    pub fn row_containing(&self, key: &Identifier) -> Option<(usize, &FingerEntry)> {
        self.rows
            .iter()
            .enumerate()
            .find(|(_, row)| row.covers(key))
    }

    /// Serializable copy for the persistence collaborator.
    pub fn snapshot(&self, predecessor: Option<NodeRef>) -> TableSnapshot {
        TableSnapshot {
            owner: self.owner,
            predecessor,
            rows: self
                .rows
                .iter()
                .map(|r| SnapshotRow {
                    start: r.start,
                    candidates: r.candidates.iter().copied().collect(),
                })
                .collect(),
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// Point-in-time copy of a node's routing state, as handed to the
/// persistence collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TableSnapshot {
    pub owner: Identifier,
    pub predecessor: Option<NodeRef>,
    pub rows: Vec<SnapshotRow>,
}

/// One persisted row: interval start plus candidates in preference order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SnapshotRow {
    pub start: Identifier,
    pub candidates: Vec<NodeRef>,
}

// ============================================================================
// Tests
// ============================================================================
