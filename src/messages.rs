//! # Wire Protocol Grammar
//!
//! This module defines the line-oriented wire protocol: the verb catalog,
//! message parsing/encoding, and the positional operand codec.
//!
//! ## Line Grammar
//!
//! Every message is one newline-terminated line of exactly three
//! space-separated fields:
//!
//! ```text
//! <verb> <operand-blob> <token>\n
//! ```
//!
//! The verb is a two-character uppercase code; its reply is the same code
//! with a trailing `_` marker. The operand blob is comma-joined positional
//! fields (may be empty). The token is an opaque correlation id minted by
//! the sender.
//!
//! ## Verb Catalog
//!
//! | Code | Operation |
//! |------|-----------|
//! | `FS` | find successor |
//! | `CP` | closest preceding finger |
//! | `QS` | query your successor |
//! | `QP` | query your predecessor |
//! | `NP` | notify predecessor |
//! | `FP` | find predecessor |
//! | `IF` | init finger table (local driver) |
//! | `UO` | update others (local driver) |
//! | `UF` | update finger table |
//! | `US` | update successor's predecessor |
//! | `UP` | update predecessor's successor |
//! | `FR` | fetch resource (holder lookup) |
//! | `ZZ` | unknown / extension |
//!
//! Codes outside the catalog parse as [`Verb::Extension`] and route to the
//! node's registered extension handler, `ZZ` being the conventional slot.
//!
//! ## Operand Codec
//!
//! [`split_fields`] splits the blob on commas while treating `{`/`}`
//! nesting as non-splitting, so JSON-valued extension fields survive
//! intact. [`unify_fields`] is its inverse. Unbalanced braces reject the
//! whole blob.
//!
//! ## Rejection Policy
//!
//! Parsing is total and silent: wrong field count, malformed verb, empty
//! token, oversized line, unbalanced braces all yield `None`. A single
//! corrupt datagram must never affect liveness.

use crate::jobs::Token;

/// Maximum accepted line length in bytes. Longer input is dropped during
/// parsing to bound per-message memory.
pub const MAX_LINE_LEN: usize = 8 * 1024;

/// Trailing marker distinguishing a reply verb from its request form.
pub const REPLY_MARKER: char = '_';

// ============================================================================
// Verbs
// ============================================================================

/// A protocol operation, addressed on the wire by a two-character code.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Verb {
    /// `FS` - resolve the successor of an identifier.
    FindSuccessor,
    /// `CP` - one-hop query for the closest preceding finger.
    ClosestPrecedingFinger,
    /// `QS` - ask a node for its current successor.
    QuerySuccessor,
    /// `QP` - ask a node for its current predecessor.
    QueryPredecessor,
    /// `NP` - claim to be a node's predecessor (stabilization notify).
    NotifyPredecessor,
    /// `FP` - resolve the predecessor of an identifier (multi-hop walk).
    FindPredecessor,
    /// `IF` - drive the incremental finger-table build. Local only.
    InitFingerTable,
    /// `UO` - drive propagation into peers' tables. Local only.
    UpdateOthers,
    /// `UF` - offer a candidate for a specific finger row.
    UpdateFingerTable,
    /// `US` - tell the successor to adopt the sender as predecessor.
    UpdateSuccessorsPredecessor,
    /// `UP` - tell the predecessor to adopt the sender as successor.
    UpdatePredecessorsSuccessor,
    /// `FR` - locate the node responsible for a resource key.
    FetchResource,
    /// Any code outside the catalog, carried verbatim. `ZZ` by convention.
    Extension([u8; 2]),
}

impl Verb {
    /// The conventional extension code.
    pub const EXTENSION: Verb = Verb::Extension(*b"ZZ");

    /// Map a two-character code to its verb. Total: unknown codes become
    /// [`Verb::Extension`].
    pub fn from_code(code: [u8; 2]) -> Verb {
        match &code {
            b"FS" => Verb::FindSuccessor,
            b"CP" => Verb::ClosestPrecedingFinger,
            b"QS" => Verb::QuerySuccessor,
            b"QP" => Verb::QueryPredecessor,
            b"NP" => Verb::NotifyPredecessor,
            b"FP" => Verb::FindPredecessor,
            b"IF" => Verb::InitFingerTable,
            b"UO" => Verb::UpdateOthers,
            b"UF" => Verb::UpdateFingerTable,
            b"US" => Verb::UpdateSuccessorsPredecessor,
            b"UP" => Verb::UpdatePredecessorsSuccessor,
            b"FR" => Verb::FetchResource,
            _ => Verb::Extension(code),
        }
    }

    /// The two-character wire code.
    pub fn code(&self) -> [u8; 2] {
        match self {
            Verb::FindSuccessor => *b"FS",
            Verb::ClosestPrecedingFinger => *b"CP",
            Verb::QuerySuccessor => *b"QS",
            Verb::QueryPredecessor => *b"QP",
            Verb::NotifyPredecessor => *b"NP",
            Verb::FindPredecessor => *b"FP",
            Verb::InitFingerTable => *b"IF",
            Verb::UpdateOthers => *b"UO",
            Verb::UpdateFingerTable => *b"UF",
            Verb::UpdateSuccessorsPredecessor => *b"US",
            Verb::UpdatePredecessorsSuccessor => *b"UP",
            Verb::FetchResource => *b"FR",
            Verb::Extension(code) => *code,
        }
    }

    /// Wire rendering, with the reply marker when `reply` is set.
    pub fn wire(&self, reply: bool) -> String {
        let code = self.code();
        let mut s = String::with_capacity(3);
        s.push(code[0] as char);
        s.push(code[1] as char);
        if reply {
            s.push(REPLY_MARKER);
        }
        s
    }
}

// ============================================================================
// Wire messages
// ============================================================================

/// One parsed protocol line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WireMessage {
    pub verb: Verb,
    /// Request (`false`) or reply (`true`, trailing marker on the wire).
    pub reply: bool,
    /// Raw comma-joined operand blob; may be empty.
    pub operand: String,
    pub token: Token,
}

impl WireMessage {
    /// Build a request line.
    pub fn request(verb: Verb, operand: impl Into<String>, token: Token) -> Self {
        WireMessage { verb, reply: false, operand: operand.into(), token }
    }

    /// Build a reply line.
    pub fn reply(verb: Verb, operand: impl Into<String>, token: Token) -> Self {
        WireMessage { verb, reply: true, operand: operand.into(), token }
    }

    /// Parse one line. `None` for anything malformed: wrong field count,
    /// bad verb shape, empty token, oversized input.
    pub fn parse(line: &str) -> Option<WireMessage> {
        if line.len() > MAX_LINE_LEN {
            return None;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        let mut parts = line.split(' ');
        let verb_field = parts.next()?;
        let operand = parts.next()?;
        let token_field = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let (code, reply) = match verb_field.len() {
            2 => (verb_field.as_bytes(), false),
            3 if verb_field.ends_with(REPLY_MARKER) => (&verb_field.as_bytes()[..2], true),
            _ => return None,
        };
        if !code.iter().all(|b| b.is_ascii_uppercase()) {
            return None;
        }
        if token_field.is_empty() {
            return None;
        }
        Some(WireMessage {
            verb: Verb::from_code([code[0], code[1]]),
            reply,
            operand: operand.to_string(),
            token: Token::from_wire(token_field),
        })
    }

    /// Render the newline-terminated line.
    pub fn encode(&self) -> String {
        format!(
            "{} {} {}\n",
            self.verb.wire(self.reply),
            self.operand,
            self.token
        )
    }

    /// Split this message's operand blob into positional fields.
    pub fn fields(&self) -> Option<Vec<String>> {
        split_fields(&self.operand)
    }
}

// ============================================================================
// Operand codec
// ============================================================================

/// Split an operand blob on commas, depth-aware for `{`/`}` so JSON-valued
/// fields survive intact.
///
/// An empty blob has no fields. A trailing comma yields a trailing empty
/// field. Unbalanced braces reject the whole blob.
pub fn split_fields(blob: &str) -> Option<Vec<String>> {
    if blob.is_empty() {
        return Some(Vec::new());
    }
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    for c in blob.chars() {
        match c {
            '{' => {
                depth += 1;
                current.push(c);
            }
            '}' => {
                depth = depth.checked_sub(1)?;
                current.push(c);
            }
            ',' if depth == 0 => {
                fields.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    if depth != 0 {
        return None;
    }
    fields.push(current);
    Some(fields)
}

/// Join positional fields into an operand blob. Inverse of [`split_fields`]
/// for fields that contain no unbraced commas.
pub fn unify_fields<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| f.as_ref())
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Tests
// ============================================================================
