//! # Jobs, Tokens, and the Causal Queue
//!
//! Every protocol operation in flight is a [`Job`]: one record per command,
//! local or remote, keyed by an opaque [`Token`]. A reply is matched to its
//! request purely by token, and relayed hops are linked through
//! `previous`/`next` token references so a reply can be re-wrapped back
//! through every hop to the original asker.
//!
//! ## Job Kinds
//!
//! | Kind | Meaning |
//! |------|---------|
//! | `Local` | a driver operation this node runs against itself (build, propagation) |
//! | `Delegate` | a request this node sent to a peer and awaits a reply for |
//! | `Delegated` | an inbound request being processed on a peer's behalf (reuses the inbound token) |
//! | `Signaling` | a rendered line waiting in the transport-facing queue |
//!
//! ## Queue Discipline
//!
//! The command queue is append-only: completed jobs are marked
//! [`JobStatus::Dequeued`], never erased, so causal lookups along a chain
//! stay valid for as long as the operation can still produce traffic. The
//! transport-facing queue is a plain FIFO owned by the node actor; its
//! entries are gone once handed to the transport.
//!
//! ## Token Minting
//!
//! When a job is created without an explicit token, one is minted
//! deterministically as the SHA-512 of (verb, from, to, kind, timestamp).
//! Identical tuples yield identical tokens; any differing field yields a
//! different token.

use sha2::{Digest, Sha512};
use std::collections::HashMap;
use std::fmt;

use crate::identity::{now_ms, Identifier};
use crate::messages::Verb;

/// Domain prefix for token minting, so job tokens can never collide with
/// other SHA-512 uses of the same field material.
const TOKEN_DOMAIN: &[u8] = b"torc-job-token-v1";

// ============================================================================
// Token
// ============================================================================

/// Opaque causal correlation id. Minted tokens are 128 hex characters;
/// tokens received from the wire are carried verbatim.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Token(String);

impl Token {
    /// Adopt a token exactly as it appeared on the wire.
    pub fn from_wire(s: impl Into<String>) -> Token {
        Token(s.into())
    }

    /// Mint the deterministic token for a job tuple.
    pub fn mint(verb: Verb, from: Identifier, to: Identifier, kind: JobKind, timestamp_ms: u64) -> Token {
        let mut hasher = Sha512::new();
        hasher.update(TOKEN_DOMAIN);
        hasher.update(verb.code());
        hasher.update(from.as_bytes());
        hasher.update(to.as_bytes());
        hasher.update([kind.tag()]);
        hasher.update(timestamp_ms.to_be_bytes());
        Token(hex::encode(hasher.finalize()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = self.0.get(..8).unwrap_or(&self.0);
        write!(f, "Token({head}..)")
    }
}

// ============================================================================
// Job
// ============================================================================

/// Role a job plays in the dispatch machinery.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum JobKind {
    Local,
    Delegate,
    Delegated,
    Signaling,
}

impl JobKind {
    /// Stable one-byte tag, part of the token minting input.
    pub(crate) fn tag(self) -> u8 {
        match self {
            JobKind::Local => b'l',
            JobKind::Delegate => b'd',
            JobKind::Delegated => b'g',
            JobKind::Signaling => b's',
        }
    }
}

/// Lifecycle state of a job.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// Enqueued and eligible to make progress.
    Running,
    /// Terminal: completed or superseded; record retained for causal lookups.
    Dequeued,
    /// Sent to a peer; progress resumes when the reply dispatches.
    WaitingForReply,
    /// Constructed but not yet enqueued.
    Undefined,
}

/// One in-flight protocol operation.
#[derive(Clone, Debug)]
pub struct Job {
    pub token: Token,
    pub verb: Verb,
    /// Comma-joined positional operand blob as sent or received.
    pub operand: String,
    pub from: Identifier,
    pub to: Identifier,
    pub kind: JobKind,
    pub status: JobStatus,
    /// Reply payload, set at most once.
    pub result: Option<String>,
    /// Token of the job this one causally continues.
    pub previous: Option<Token>,
    /// Token of the most recent job chained from this one.
    pub next: Option<Token>,
}

impl Job {
    /// New job with a freshly minted token.
    pub fn new(
        verb: Verb,
        operand: impl Into<String>,
        from: Identifier,
        to: Identifier,
        kind: JobKind,
    ) -> Job {
        let token = Token::mint(verb, from, to, kind, now_ms());
        Job::with_token(token, verb, operand, from, to, kind)
    }

    /// New job adopting an existing token (inbound requests keep the
    /// sender's token so causal identity is preserved end-to-end).
    pub fn with_token(
        token: Token,
        verb: Verb,
        operand: impl Into<String>,
        from: Identifier,
        to: Identifier,
        kind: JobKind,
    ) -> Job {
        Job {
            token,
            verb,
            operand: operand.into(),
            from,
            to,
            kind,
            status: JobStatus::Undefined,
            result: None,
            previous: None,
            next: None,
        }
    }

    /// Chain this job after `previous`.
    pub fn after(mut self, previous: Token) -> Job {
        self.previous = Some(previous);
        self
    }
}

// ============================================================================
// JobQueue
// ============================================================================

/// Append-only store of jobs with token-indexed lookup.
#[derive(Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
    by_token: HashMap<Token, Vec<usize>>,
}

impl JobQueue {
    pub fn new() -> JobQueue {
        JobQueue::default()
    }

    /// Append a job, link it to its causal predecessor, and mark it running.
    /// Returns the job's token.
    pub fn enqueue(&mut self, mut job: Job) -> Token {
        job.status = JobStatus::Running;
        let token = job.token.clone();
        if let Some(prev) = job.previous.clone() {
            if let Some(parent) = self.find_any_mut(&prev) {
                parent.next = Some(token.clone());
            }
        }
        let idx = self.jobs.len();
        self.by_token.entry(token.clone()).or_default().push(idx);
        self.jobs.push(job);
        token
    }

    /// Find the first non-dequeued job matching token and kind filter, mark
    /// it dequeued, and return a copy of the record. Unknown tokens are a
    /// no-op returning `None`.
    pub fn dequeue(&mut self, token: &Token, kinds: &[JobKind]) -> Option<Job> {
        let idx = self.position(token, kinds, true)?;
        self.jobs[idx].status = JobStatus::Dequeued;
        Some(self.jobs[idx].clone())
    }

    /// Attach a reply payload to the matching job without removing it.
    /// Set at most once; repeats and unknown tokens are no-ops returning
    /// `false`.
    pub fn set_result(&mut self, token: &Token, kinds: &[JobKind], result: &str) -> bool {
        let Some(idx) = self.position(token, kinds, false) else {
            return false;
        };
        if self.jobs[idx].result.is_some() {
            return false;
        }
        self.jobs[idx].result = Some(result.to_string());
        true
    }

    /// Mark a job as having been sent and now awaiting its reply.
    pub fn mark_waiting(&mut self, token: &Token) {
        if let Some(job) = self.find_any_mut(token) {
            if job.status == JobStatus::Running {
                job.status = JobStatus::WaitingForReply;
            }
        }
    }

    /// First job matching token and kind filter, regardless of status.
    pub fn get(&self, token: &Token, kinds: &[JobKind]) -> Option<&Job> {
        let idx = self.position(token, kinds, false)?;
        Some(&self.jobs[idx])
    }

    /// All jobs chained directly from `token` (their `previous` equals it).
    pub fn fetch_following(&self, token: &Token) -> Vec<&Job> {
        self.jobs
            .iter()
            .filter(|j| j.previous.as_ref() == Some(token))
            .collect()
    }

    /// True when every job chained from `token` has reached a terminal
    /// state. Gates finger-table-build completion.
    pub fn fan_out_drained(&self, token: &Token) -> bool {
        self.fetch_following(token)
            .iter()
            .all(|j| j.status == JobStatus::Dequeued)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Every record, for telemetry and tests.
    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }

    fn position(&self, token: &Token, kinds: &[JobKind], skip_dequeued: bool) -> Option<usize> {
        let candidates = self.by_token.get(token)?;
        candidates
            .iter()
            .copied()
            .find(|&idx| {
                let job = &self.jobs[idx];
                (kinds.is_empty() || kinds.contains(&job.kind))
                    && (!skip_dequeued || job.status != JobStatus::Dequeued)
            })
    }

    fn find_any_mut(&mut self, token: &Token) -> Option<&mut Job> {
        let idx = self.by_token.get(token)?.first().copied()?;
        Some(&mut self.jobs[idx])
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (Identifier, Identifier) {
        (Identifier::digest(b"from"), Identifier::digest(b"to"))
    }

    #[test]
    fn token_minting_is_deterministic() {
        let (from, to) = ids();
        let a = Token::mint(Verb::FindSuccessor, from, to, JobKind::Delegate, 1234);
        let b = Token::mint(Verb::FindSuccessor, from, to, JobKind::Delegate, 1234);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 128);
    }

    #[test]
    fn token_differs_per_field() {
        let (from, to) = ids();
        let base = Token::mint(Verb::FindSuccessor, from, to, JobKind::Delegate, 1234);
        assert_ne!(
            base,
            Token::mint(Verb::FindPredecessor, from, to, JobKind::Delegate, 1234)
        );
        assert_ne!(
            base,
            Token::mint(Verb::FindSuccessor, to, to, JobKind::Delegate, 1234)
        );
        assert_ne!(
            base,
            Token::mint(Verb::FindSuccessor, from, from, JobKind::Delegate, 1234)
        );
        assert_ne!(
            base,
            Token::mint(Verb::FindSuccessor, from, to, JobKind::Local, 1234)
        );
        assert_ne!(
            base,
            Token::mint(Verb::FindSuccessor, from, to, JobKind::Delegate, 1235)
        );
    }

    #[test]
    fn enqueue_marks_running_and_links_parent() {
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let a = q.enqueue(Job::new(Verb::InitFingerTable, "", from, from, JobKind::Local));
        let b_job = Job::new(Verb::FindSuccessor, "0,aa", from, to, JobKind::Delegate).after(a.clone());
        let b = q.enqueue(b_job);
        assert_eq!(q.get(&a, &[]).unwrap().status, JobStatus::Running);
        assert_eq!(q.get(&a, &[]).unwrap().next, Some(b.clone()));
        assert_eq!(q.get(&b, &[]).unwrap().previous, Some(a));
    }

    #[test]
    fn causal_chain_tracks_drain() {
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let a = q.enqueue(Job::new(Verb::InitFingerTable, "", from, from, JobKind::Local));
        let b = q.enqueue(
            Job::new(Verb::FindSuccessor, "0,aa", from, to, JobKind::Delegate).after(a.clone()),
        );

        let following = q.fetch_following(&a);
        assert_eq!(following.len(), 1);
        assert_eq!(following[0].token, b);
        assert!(!q.fan_out_drained(&a));

        q.dequeue(&b, &[JobKind::Delegate]).unwrap();
        assert!(q.fan_out_drained(&a));
        // Still present for causal lookups, just terminal.
        assert_eq!(q.fetch_following(&a).len(), 1);
        assert_eq!(q.get(&b, &[]).unwrap().status, JobStatus::Dequeued);
    }

    #[test]
    fn dequeue_respects_kind_filter() {
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let token = Token::from_wire("shared");
        q.enqueue(Job::with_token(
            token.clone(),
            Verb::FindSuccessor,
            "",
            from,
            to,
            JobKind::Delegated,
        ));
        assert!(q.dequeue(&token, &[JobKind::Local, JobKind::Delegate]).is_none());
        let got = q.dequeue(&token, &[JobKind::Delegated]).unwrap();
        assert_eq!(got.kind, JobKind::Delegated);
        // Second dequeue finds nothing live.
        assert!(q.dequeue(&token, &[JobKind::Delegated]).is_none());
    }

    #[test]
    fn shared_token_resolves_by_kind() {
        // An inbound request and the relay it spawns can share a token
        // lineage; kind filters keep lookups unambiguous.
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let token = Token::from_wire("t-shared");
        q.enqueue(Job::with_token(
            token.clone(),
            Verb::FindPredecessor,
            "1,aa",
            from,
            to,
            JobKind::Delegated,
        ));
        q.enqueue(Job::with_token(
            token.clone(),
            Verb::FindPredecessor,
            "1,aa",
            to,
            from,
            JobKind::Delegate,
        ));
        assert_eq!(q.get(&token, &[JobKind::Delegate]).unwrap().kind, JobKind::Delegate);
        assert_eq!(
            q.get(&token, &[JobKind::Delegated]).unwrap().kind,
            JobKind::Delegated
        );
    }

    #[test]
    fn set_result_happens_once() {
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let t = q.enqueue(Job::new(Verb::QueryPredecessor, "", from, to, JobKind::Delegate));
        assert!(q.set_result(&t, &[JobKind::Delegate], "first"));
        assert!(!q.set_result(&t, &[JobKind::Delegate], "second"));
        assert_eq!(q.get(&t, &[]).unwrap().result.as_deref(), Some("first"));
    }

    #[test]
    fn unknown_token_is_a_noop() {
        let mut q = JobQueue::new();
        let ghost = Token::from_wire("ghost");
        assert!(q.dequeue(&ghost, &[]).is_none());
        assert!(!q.set_result(&ghost, &[], "x"));
        assert!(q.get(&ghost, &[]).is_none());
        assert!(q.fetch_following(&ghost).is_empty());
        // An empty fan-out counts as drained.
        assert!(q.fan_out_drained(&ghost));
    }

    #[test]
    fn mark_waiting_transitions_running_only() {
        let (from, to) = ids();
        let mut q = JobQueue::new();
        let t = q.enqueue(Job::new(Verb::FindSuccessor, "", from, to, JobKind::Delegate));
        q.mark_waiting(&t);
        assert_eq!(q.get(&t, &[]).unwrap().status, JobStatus::WaitingForReply);
        q.dequeue(&t, &[]).unwrap();
        q.mark_waiting(&t);
        assert_eq!(q.get(&t, &[]).unwrap().status, JobStatus::Dequeued);
    }
}
