//! Per-sender jitter buffer: trades a few tens of milliseconds of playout
//! delay for tolerance to reordering and short bursts of loss.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::config::{JITTER_MAX, JITTER_MIN, JITTER_TARGET};
use crate::wire::seq_is_later;

const STALE_PACKET_AGE: Duration = Duration::from_secs(1);
const SKIP_GAP_EXTRA_DELAY: Duration = Duration::from_millis(100);

struct Buffered {
    opus: Bytes,
    received_at: Instant,
}

/// What a playout tick got back from the buffer.
pub enum Selected {
    /// A packet to decode and play.
    Packet(Bytes),
    /// A gap was detected but the buffer isn't ready to skip it yet: stall.
    Stall,
    /// Fewer than `JITTER_MIN` packets buffered: nothing to play yet.
    Empty,
}

pub struct JitterBuffer {
    packets: BTreeMap<u32, Buffered>,
    last_played_seq: Option<u32>,
    playout_delay: Duration,
}

impl JitterBuffer {
    pub fn new() -> Self {
        Self {
            packets: BTreeMap::new(),
            last_played_seq: None,
            playout_delay: Duration::ZERO,
        }
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn last_played_seq(&self) -> Option<u32> {
        self.last_played_seq
    }

    /// Insert a received packet. Returns `true` if it was a duplicate
    /// (already played, or already buffered) and was discarded without
    /// disturbing existing state.
    pub fn put(&mut self, seq: u32, opus: Bytes, received_at: Instant) -> bool {
        if let Some(last) = self.last_played_seq {
            if seq == last || !seq_is_later(seq, last) {
                return true;
            }
        }
        if self.packets.contains_key(&seq) {
            return true;
        }
        self.packets.insert(seq, Buffered { opus, received_at });
        while self.packets.len() > JITTER_MAX {
            if let Some(&oldest) = self.packets.keys().next() {
                self.packets.remove(&oldest);
            } else {
                break;
            }
        }
        false
    }

    /// Run one playout tick's selection. Returns whether a gap was skipped
    /// (caller should count that as a missed-packet event).
    pub fn select(&mut self, now: Instant) -> (Selected, bool) {
        let stale: Vec<u32> = self
            .packets
            .iter()
            .filter(|(_, p)| now.duration_since(p.received_at) > STALE_PACKET_AGE)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in stale {
            self.packets.remove(&seq);
        }

        if self.packets.len() < JITTER_MIN {
            return (Selected::Empty, false);
        }

        let expected = match self.last_played_seq {
            Some(s) => s.wrapping_add(1),
            None => *self
                .packets
                .keys()
                .next()
                .expect("len checked above is non-zero"),
        };

        if let Some(pkt) = self.packets.remove(&expected) {
            self.last_played_seq = Some(expected);
            return (Selected::Packet(pkt.opus), false);
        }

        let earliest_later = self
            .packets
            .keys()
            .copied()
            .find(|&seq| seq_is_later(seq, expected));

        if let Some(later_seq) = earliest_later {
            let oldest_age = self
                .packets
                .values()
                .next()
                .map(|p| now.duration_since(p.received_at));
            let delay_exceeded =
                oldest_age.map_or(false, |age| age > self.playout_delay + SKIP_GAP_EXTRA_DELAY);
            let buffer_full_enough = self.packets.len() >= JITTER_TARGET;

            if delay_exceeded || buffer_full_enough {
                let pkt = self
                    .packets
                    .remove(&later_seq)
                    .expect("later_seq was just found in the map");
                self.last_played_seq = Some(later_seq);
                return (Selected::Packet(pkt.opus), true);
            }
        }

        (Selected::Stall, false)
    }
}

impl Default for JitterBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(ms: u64) -> Instant {
        // Tests only ever compare relative durations between instants
        // produced through this helper, never an absolute wall time.
        Instant::now() + Duration::from_millis(ms)
    }

    #[test]
    fn plays_in_order_with_no_loss() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        for seq in 1..=50u32 {
            jb.put(seq, Bytes::from(vec![seq as u8]), base);
        }
        let mut played = Vec::new();
        loop {
            match jb.select(base).0 {
                Selected::Packet(p) => played.push(p[0] as u32),
                Selected::Empty | Selected::Stall => break,
            }
        }
        let expected: Vec<u32> = (1..=50).collect();
        assert_eq!(played, expected);
    }

    #[test]
    fn skips_a_single_loss_once_target_reached() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        for seq in (1..=9).chain(11..=20) {
            jb.put(seq, Bytes::from(vec![seq as u8]), base);
        }
        let mut played = Vec::new();
        let mut skipped_any = false;
        loop {
            match jb.select(base) {
                (Selected::Packet(p), skipped) => {
                    played.push(p[0] as u32);
                    skipped_any |= skipped;
                }
                (Selected::Empty, _) => break,
                (Selected::Stall, _) => {
                    // buffer hasn't reached JITTER_TARGET yet for seq 10's gap
                    continue;
                }
            }
        }
        assert!(played.starts_with(&[1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert!(played.contains(&11));
        assert!(!played.contains(&10));
        assert!(skipped_any);
    }

    #[test]
    fn duplicate_insert_is_discarded() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        assert!(!jb.put(5, Bytes::from_static(b"a"), base));
        assert!(jb.put(5, Bytes::from_static(b"b"), base));
        assert_eq!(jb.len(), 1);
    }

    #[test]
    fn reordered_packets_play_in_sequence() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        for seq in [1u32, 2, 4, 3, 5] {
            jb.put(seq, Bytes::from(vec![seq as u8]), base);
        }
        let mut played = Vec::new();
        loop {
            match jb.select(base).0 {
                Selected::Packet(p) => played.push(p[0] as u32),
                _ => break,
            }
        }
        assert_eq!(played, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn below_minimum_plays_nothing() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        jb.put(1, Bytes::from_static(b"a"), base);
        assert!(matches!(jb.select(base).0, Selected::Empty));
    }

    #[test]
    fn buffer_overflow_drops_oldest_not_newest() {
        let mut jb = JitterBuffer::new();
        let base = Instant::now();
        for seq in 0..(JITTER_MAX as u32 + 5) {
            jb.put(seq, Bytes::from(seq.to_be_bytes().to_vec()), base);
        }
        assert_eq!(jb.len(), JITTER_MAX);
        assert!(jb.packets.contains_key(&(JITTER_MAX as u32 + 4)));
        assert!(!jb.packets.contains_key(&0));
    }

    #[test]
    fn stale_packets_are_pruned_after_one_second() {
        let mut jb = JitterBuffer::new();
        let old = t(0);
        jb.put(1, Bytes::from_static(b"a"), old);
        let later = old + Duration::from_millis(1100);
        let _ = jb.select(later);
        assert!(jb.is_empty());
    }

    #[test]
    fn tx_seq_wrap_is_later_than_max() {
        assert!(seq_is_later(0, u32::MAX));
    }
}
