use std::collections::BTreeMap;
use tokio::time::Instant;

use crate::envelope::Envelope;

struct Held {
    envelope: Envelope,
    arrived_at: Instant,
    arrival: u64,
}

/// Restores sequence order for one sender's stream within a session.
pub(crate) struct ReorderBuffer {
    next_expected: u64,
    /// Set once `u64::MAX` was delivered; nothing can follow it
    exhausted: bool,
    held: BTreeMap<u64, Held>,
    arrivals: u64,
}

impl ReorderBuffer {
    pub(crate) fn new() -> Self {
        Self {
            next_expected: 0,
            exhausted: false,
            held: BTreeMap::new(),
            arrivals: 0,
        }
    }

    /// Accept an envelope. Returns `false` for a sequence number already
    /// delivered or already held.
    pub(crate) fn offer(&mut self, envelope: Envelope, now: Instant) -> bool {
        let sequence = envelope.sequence;
        if self.exhausted || sequence < self.next_expected || self.held.contains_key(&sequence) {
            return false;
        }
        self.arrivals += 1;
        self.held.insert(
            sequence,
            Held {
                envelope,
                arrived_at: now,
                arrival: self.arrivals,
            },
        );
        true
    }

    /// The next in-order envelope, if it has arrived.
    pub(crate) fn pop_ready(&mut self) -> Option<Envelope> {
        let (&sequence, _) = self.held.first_key_value()?;
        if sequence > self.next_expected {
            return None;
        }
        self.take(sequence)
    }

    /// When the oldest envelope stuck behind a gap arrived.
    pub(crate) fn blocked_since(&self) -> Option<Instant> {
        self.held.values().map(|h| h.arrived_at).min()
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Give up on the gap: release the earliest-arrived envelope.
    pub(crate) fn force_flush(&mut self) -> Option<Envelope> {
        let sequence = self
            .held
            .iter()
            .min_by_key(|(_, held)| held.arrival)
            .map(|(sequence, _)| *sequence)?;
        self.take(sequence)
    }

    pub(crate) fn next_expected(&self) -> u64 {
        self.next_expected
    }

    fn take(&mut self, sequence: u64) -> Option<Envelope> {
        let held = self.held.remove(&sequence)?;
        match sequence.checked_add(1) {
            Some(next) => self.next_expected = self.next_expected.max(next),
            None => {
                self.next_expected = u64::MAX;
                self.exhausted = true;
            }
        }
        Some(held.envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{EnvelopeKind, SessionId};
    use moltlink_core::PeerRef;
    use serde_json::json;

    fn envelope(sequence: u64) -> Envelope {
        Envelope::new(
            EnvelopeKind::Reply,
            PeerRef::new("alpha"),
            SessionId::default(),
            sequence,
            json!(sequence),
        )
    }

    #[test]
    fn test_in_order_passthrough() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();
        assert!(buffer.offer(envelope(0), now));
        assert_eq!(buffer.pop_ready().unwrap().sequence, 0);
        assert!(buffer.offer(envelope(1), now));
        assert_eq!(buffer.pop_ready().unwrap().sequence, 1);
        assert!(buffer.pop_ready().is_none());
    }

    #[test]
    fn test_gap_holds_delivery() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();
        buffer.offer(envelope(2), now);
        buffer.offer(envelope(1), now);
        assert!(buffer.pop_ready().is_none());

        buffer.offer(envelope(0), now);
        let order: Vec<u64> = std::iter::from_fn(|| buffer.pop_ready())
            .map(|e| e.sequence)
            .collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_duplicates_rejected() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();
        assert!(buffer.offer(envelope(1), now));
        assert!(!buffer.offer(envelope(1), now));
        buffer.offer(envelope(0), now);
        buffer.pop_ready();
        assert!(!buffer.offer(envelope(0), now));
    }

    #[test]
    fn test_force_flush_uses_arrival_order() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();
        buffer.offer(envelope(3), now);
        buffer.offer(envelope(2), now);

        assert_eq!(buffer.force_flush().unwrap().sequence, 3);
        assert_eq!(buffer.next_expected(), 4);
        // 2 was held before the flush, so it is still handed out
        assert_eq!(buffer.pop_ready().unwrap().sequence, 2);
        assert!(buffer.is_empty());
        // late arrivals behind the flushed point are dropped
        assert!(!buffer.offer(envelope(1), now));
    }

    #[test]
    fn test_max_sequence_ends_stream() {
        let mut buffer = ReorderBuffer::new();
        let now = Instant::now();
        buffer.offer(envelope(1), now);
        assert!(buffer.offer(envelope(u64::MAX), now));

        assert_eq!(buffer.force_flush().unwrap().sequence, 1);
        assert_eq!(buffer.force_flush().unwrap().sequence, u64::MAX);
        assert_eq!(buffer.next_expected(), u64::MAX);
        assert!(buffer.is_empty());
        // nothing can follow the last possible sequence number
        assert!(!buffer.offer(envelope(u64::MAX), now));
        assert!(!buffer.offer(envelope(5), now));
    }
}
