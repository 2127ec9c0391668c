//! # reassembly
//!
//! Turns notification fragments of one channel back into JSON documents.
//!
//! The wearable writes each message as a UTF-8 JSON object cut into MTU-sized
//! fragments. Fragments carry no framing, so completeness is judged by trying
//! to parse the accumulated bytes and, on failure, by brace balance:
//!   - parse ok            → emit the document, clear
//!   - more `{` than `}`   → plausibly incomplete, keep and arm the staleness deadline
//!   - otherwise           → a fragment went missing and the join is corrupt, clear
//!
//! A lost tail fragment leaves the buffer permanently short of `}`. To stop it
//! from swallowing every later message, the offsets of fragments starting with
//! `{` are remembered. When the whole buffer fails to parse, the bytes from each
//! such offset are tried on their own; if they form a document, the prefix was
//! an orphan and is dropped. A `{` right after `:` `,` or `[` may be a nested
//! value of the message in progress and is not treated as a boundary.
//!
//! ## Invariants
//! - At most one logical message is in flight per buffer (no pipelining)
//! - Every fragment bumps a generation counter; a staleness ticket only clears
//!   the buffer if no fragment arrived since it was issued
//! - Bytes, not strings, are accumulated so a multi-byte character split across
//!   two fragments still joins correctly

use std::time::Duration;

use sentry_types::Channel;
use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    /// Braces balanced (or close > open) yet the text does not parse.
    Unbalanced,
    /// Grew past the channel's maximum message length without parsing.
    Overflow,
    /// No fragment arrived within the staleness window.
    Stale,
    /// Head of a message whose tail never arrived, dropped once a later
    /// message completed behind it.
    Orphaned,
}

/// Issued while a partial message is held. Hand it back to
/// [`ReassemblyBuffer::expire`] once `deadline` passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaleTicket {
    pub generation: u64,
    pub deadline: Instant,
}

pub struct ReassemblyBuffer {
    channel: Channel,
    bytes: Vec<u8>,
    /// Offsets of fragments that begin with `{`, excluding offset 0.
    starts: Vec<usize>,
    opens: usize,
    closes: usize,
    generation: u64,
    deadline: Option<Instant>,
    stale_after: Duration,
    max_len: usize,
    discarded: u64,
    last_discard: Option<DiscardReason>,
}

impl ReassemblyBuffer {
    pub fn new(channel: Channel, stale_after: Duration, max_len: usize) -> Self {
        Self {
            channel,
            bytes: Vec::new(),
            starts: Vec::new(),
            opens: 0,
            closes: 0,
            generation: 0,
            deadline: None,
            stale_after,
            max_len,
            discarded: 0,
            last_discard: None,
        }
    }

    /// Append one fragment and try to complete a document.
    pub fn ingest(&mut self, fragment: &[u8], now: Instant) -> Option<Value> {
        self.generation = self.generation.wrapping_add(1);
        let opens_object = fragment.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{');
        if opens_object && !self.bytes.is_empty() {
            self.starts.push(self.bytes.len());
        }
        self.bytes.extend_from_slice(fragment);
        for b in fragment {
            match b {
                b'{' => self.opens += 1,
                b'}' => self.closes += 1,
                _ => {}
            }
        }

        let err = match serde_json::from_slice::<Value>(&self.bytes) {
            Ok(doc) => {
                self.reset();
                return Some(doc);
            }
            Err(e) => e,
        };
        if let Some(doc) = self.recover() {
            return Some(doc);
        }

        if self.opens <= self.closes {
            debug!("{} buffer unparseable: {err}", self.channel);
            self.discard(DiscardReason::Unbalanced);
            return None;
        }
        if self.bytes.len() > self.max_len {
            self.discard(DiscardReason::Overflow);
            return None;
        }
        debug!(
            "{} buffer holding {} bytes ({} open / {} close): {err}",
            self.channel,
            self.bytes.len(),
            self.opens,
            self.closes
        );
        self.deadline = Some(now + self.stale_after);
        None
    }

    /// Find a complete document that starts at a later fragment boundary and
    /// drop the orphaned bytes ahead of it.
    fn recover(&mut self) -> Option<Value> {
        let (offset, doc) = self.starts.iter().find_map(|&off| {
            if continues_value(&self.bytes[..off]) {
                return None;
            }
            serde_json::from_slice::<Value>(&self.bytes[off..]).ok().map(|doc| (off, doc))
        })?;
        warn!(
            "{} buffer discarded ({:?}): {offset} bytes of an incomplete message dropped",
            self.channel,
            DiscardReason::Orphaned
        );
        self.discarded += 1;
        self.last_discard = Some(DiscardReason::Orphaned);
        self.reset();
        Some(doc)
    }

    /// Deadline for the partial message currently held, if any.
    pub fn stale_ticket(&self) -> Option<StaleTicket> {
        self.deadline.map(|deadline| StaleTicket {
            generation: self.generation,
            deadline,
        })
    }

    /// Discard the partial message if nothing arrived since `ticket` was issued.
    /// Returns whether the buffer was cleared.
    pub fn expire(&mut self, ticket: StaleTicket) -> bool {
        if self.bytes.is_empty() || ticket.generation != self.generation {
            return false;
        }
        self.discard(DiscardReason::Stale);
        true
    }

    /// Drop any partial message and cancel its deadline.
    pub fn clear(&mut self) {
        self.reset();
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    /// Number of partial messages thrown away so far.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn last_discard(&self) -> Option<DiscardReason> {
        self.last_discard
    }

    fn discard(&mut self, reason: DiscardReason) {
        warn!(
            "{} buffer discarded ({reason:?}): {} bytes dropped",
            self.channel,
            self.bytes.len()
        );
        self.discarded += 1;
        self.last_discard = Some(reason);
        self.reset();
    }

    fn reset(&mut self) {
        self.bytes.clear();
        self.starts.clear();
        self.opens = 0;
        self.closes = 0;
        self.deadline = None;
    }
}

/// Whether a `{` following `prefix` could be a nested value of it.
fn continues_value(prefix: &[u8]) -> bool {
    matches!(
        prefix.iter().rev().find(|b| !b.is_ascii_whitespace()),
        Some(b':' | b',' | b'[')
    )
}
