// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Per-Dispatcher Reorder Window
//!
//! A ring of `cache_size` slots absorbs limited UDP reordering for one
//! (trident, dispatcher) stream. Slot `i` holds the packet with sequence
//! `start_seq + ((i - start_index) mod cache_size)`; the head slot is
//! always empty between calls. Expiry runs off the packet-borne sender
//! clock, so replays of the same traffic behave identically.
//!
//! The window distinguishes three kinds of backward motion:
//! loss (a gap the window moved past, counted in `dropped`), stale
//! reorder (late packet behind the window, counted by the caller as
//! expired) and a trident restart (sequence reset while the sender clock
//! kept advancing; the cache is purged without touching loss counters).

use std::net::Ipv4Addr;

use crate::adapter::buffer_pool::PacketBuffer;
use crate::adapter::slave::Slave;
use crate::adapter::REORDER_TIMEOUT_NS;
use crate::logging::{Facility, Logger};

pub struct ReorderWindow {
    cache: Vec<Option<PacketBuffer>>,
    /// Per-slot worst-known arrival time while the slot is empty;
    /// 0 means no later packet has constrained it yet.
    timestamp: Vec<u64>,
    /// Largest sender timestamp ever seen; the restart detector.
    max_timestamp: u64,
    /// Sequence corresponding to `cache[start_index]`; 0 until seeded.
    start_seq: u64,
    start_index: u64,
    /// Cumulative packets declared lost by this window.
    dropped: u64,
}

impl ReorderWindow {
    /// `cache_size` must be a power of two; the adapter rounds its
    /// configuration up before building windows.
    pub fn new(cache_size: u64) -> Self {
        debug_assert!(cache_size.is_power_of_two());
        Self {
            cache: (0..cache_size).map(|_| None).collect(),
            timestamp: vec![0; cache_size as usize],
            max_timestamp: 0,
            start_seq: 0,
            start_index: 0,
            dropped: 0,
        }
    }

    /// Absorb one packet: enqueue it, flush whatever became deliverable in
    /// sequence order, and account loss. Returns packets declared lost and
    /// stale reorders discarded by this call.
    pub fn insert(
        &mut self,
        packet: PacketBuffer,
        slaves: &[Slave],
        logger: &Logger,
    ) -> (u64, u64) {
        debug_assert!(slaves.len().is_power_of_two());
        let seq = packet.decoder().seq();
        let timestamp = packet.decoder().timestamp();
        let trident = Ipv4Addr::from(packet.trident_ip());
        let index = packet.decoder().dispatcher_index();
        let size = self.cache.len() as u64;
        let mask = size - 1;

        if self.start_seq == 0 {
            self.start_seq = seq;
            logger.info(
                Facility::Reorder,
                &format!(
                    "first packet from trident {} dispatcher {}, window seeded at seq {}",
                    trident, index, seq
                ),
            );
        }
        let mut dropped = 0u64;

        if seq < self.start_seq {
            if timestamp > self.max_timestamp {
                // Sequence went backward while the sender clock advanced:
                // the trident restarted. Whatever is cached straddles the
                // reset and is unusable; purge it without counting loss,
                // the restart itself is the louder signal.
                logger.warning(
                    Facility::Reorder,
                    &format!(
                        "trident {} dispatcher {} restarted, timestamp {} > {}, \
                         reseating window at seq {}",
                        trident,
                        index,
                        timestamp,
                        self.max_timestamp,
                        if seq > size { seq - size } else { 1 }
                    ),
                );
                for i in 0..size as usize {
                    self.cache[i] = None;
                    self.timestamp[i] = 0;
                }
                self.start_seq = if seq > size { seq - size } else { 1 };
                self.start_index = 0;
            } else {
                // Legitimately late packet; the loss was already counted
                // when the window moved past it.
                logger.warning(
                    Facility::Reorder,
                    &format!(
                        "trident {} dispatcher {} seq {} behind window start {}, dropping",
                        trident, index, seq, self.start_seq
                    ),
                );
                drop(packet);
                return (dropped, 1);
            }
        }
        if timestamp > self.max_timestamp {
            self.max_timestamp = timestamp;
        }

        // Slide the window until the incoming packet fits.
        let mut offset = seq - self.start_seq;
        let mut steps = 0;
        while steps < size && offset >= size {
            let head = self.start_index as usize;
            if let Some(cached) = self.cache[head].take() {
                slaves[(cached.hash() as usize) & (slaves.len() - 1)].put(cached);
            } else {
                dropped += 1;
            }
            self.timestamp[head] = 0;
            self.start_seq += 1;
            self.start_index = (self.start_index + 1) & mask;
            offset -= 1;
            steps += 1;
        }
        if offset >= size {
            // Pathological jump far past the window; skip the dead range
            // in one move.
            let gap = offset - size + 1;
            self.start_seq += gap;
            self.start_index = (self.start_index + gap) & mask;
            dropped += gap;
            offset -= gap;
        }

        let current = ((self.start_index + offset) & mask) as usize;
        self.cache[current] = Some(packet);
        self.timestamp[current] = timestamp;
        // Walk back over the still-missing slots and record this packet's
        // timestamp as their worst-known arrival bound.
        let mut i = current as u64;
        while i != self.start_index {
            i = (i + mask) & mask;
            if self.cache[i as usize].is_some() {
                break;
            }
            self.timestamp[i as usize] = timestamp;
        }

        // Flush in order until the head is a hole we cannot yet judge.
        for _ in 0..size {
            let head = self.start_index as usize;
            if let Some(cached) = self.cache[head].take() {
                slaves[(cached.hash() as usize) & (slaves.len() - 1)].put(cached);
            } else if self.timestamp[head] == 0 {
                break;
            } else if timestamp.saturating_sub(self.timestamp[head]) > REORDER_TIMEOUT_NS {
                dropped += 1;
            } else {
                break;
            }
            self.timestamp[head] = 0;
            self.start_seq += 1;
            self.start_index = (self.start_index + 1) & mask;
        }

        if dropped > 0 {
            self.dropped += dropped;
            logger.debug(
                Facility::Reorder,
                &format!(
                    "trident {} dispatcher {} lost {} packets, received seq {}, \
                     window now starts at seq {}",
                    trident, index, dropped, seq, self.start_seq
                ),
            );
        }
        (dropped, 0)
    }

    /// Cumulative loss attributed to this window.
    pub fn total_dropped(&self) -> u64 {
        self.dropped
    }

    pub fn start_seq(&self) -> u64 {
        self.start_seq
    }

    #[cfg(test)]
    pub(crate) fn occupied(&self) -> usize {
        self.cache.iter().filter(|slot| slot.is_some()).count()
    }

    /// Every cached packet must sit at the slot its sequence dictates and
    /// the head slot must be empty between calls.
    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        let size = self.cache.len() as u64;
        assert!(size.is_power_of_two());
        assert!(self.start_index < size);
        assert!(self.cache[self.start_index as usize].is_none());
        for (i, slot) in self.cache.iter().enumerate() {
            if let Some(packet) = slot {
                let expected =
                    self.start_seq + ((i as u64 + size - self.start_index) & (size - 1));
                assert_eq!(packet.decoder().seq(), expected, "slot {}", i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::buffer_pool::{make_packet, BufferPool};
    use crate::adapter::slave::testing::capture_slave;
    use crate::logging::Severity;
    use std::sync::Arc;

    const TRIDENT_IP: u32 = 0xc0a80a01; // 192.168.10.1
    const TIMEOUT: u64 = REORDER_TIMEOUT_NS;

    struct Harness {
        pool: Arc<BufferPool>,
        window: ReorderWindow,
        slaves: Vec<Slave>,
        handle: Option<std::thread::JoinHandle<()>>,
        delivered: crate::adapter::slave::testing::Delivered,
        logger: Logger,
        dropped: u64,
        expired: u64,
    }

    impl Harness {
        fn new(cache_size: u64) -> Self {
            let (slave, handle, delivered) = capture_slave(4096);
            Self {
                pool: BufferPool::new(),
                window: ReorderWindow::new(cache_size),
                slaves: vec![slave],
                handle: Some(handle),
                delivered,
                logger: Logger::stderr(Severity::Error).unwrap(),
                dropped: 0,
                expired: 0,
            }
        }

        fn insert(&mut self, seq: u64, timestamp: u64) {
            let packet = make_packet(&self.pool, TRIDENT_IP, seq, timestamp, 0);
            let (dropped, expired) = self.window.insert(packet, &self.slaves, &self.logger);
            self.dropped += dropped;
            self.expired += expired;
            self.window.assert_invariants();
        }

        /// Stop the slave and return the delivered sequence numbers.
        fn finish(mut self) -> (Vec<u64>, u64, u64, ReorderWindow, Arc<BufferPool>) {
            self.slaves.clear();
            self.handle.take().unwrap().join().unwrap();
            let delivered = self.delivered.lock().unwrap();
            let seqs = delivered.iter().map(|&(seq, _)| seq).collect();
            (seqs, self.dropped, self.expired, self.window, self.pool)
        }
    }

    #[test]
    fn test_in_order_stream_flushes_immediately() {
        let mut h = Harness::new(8);
        for seq in 1..=20 {
            h.insert(seq, seq);
        }
        assert_eq!(h.window.occupied(), 0);
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, (1..=20).collect::<Vec<_>>());
        assert_eq!((dropped, expired), (0, 0));
    }

    #[test]
    fn test_reorder_within_window() {
        let mut h = Harness::new(8);
        for (ts, &seq) in [1u64, 2, 4, 3, 5, 6, 7, 8].iter().enumerate() {
            h.insert(seq, ts as u64 + 1);
        }
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, (1..=8).collect::<Vec<_>>());
        assert_eq!((dropped, expired), (0, 0));
    }

    #[test]
    fn test_block_shuffled_permutation_delivers_in_order() {
        // Seq 1 seeds the window, then every block of four arrives
        // reversed; displacement stays below the window size.
        let mut h = Harness::new(8);
        h.insert(1, 1);
        let mut ts = 1;
        for chunk in (2..=33u64).collect::<Vec<_>>().chunks(4) {
            for &seq in chunk.iter().rev() {
                ts += 1;
                h.insert(seq, ts);
            }
        }
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, (1..=33).collect::<Vec<_>>());
        assert_eq!((dropped, expired), (0, 0));
    }

    #[test]
    fn test_loss_detected_by_overflow() {
        let mut h = Harness::new(4);
        for (ts, &seq) in [1u64, 2, 3, 5, 6, 7, 8, 9].iter().enumerate() {
            h.insert(seq, ts as u64 + 1);
        }
        let (delivered, dropped, expired, window, _) = h.finish();
        assert_eq!(delivered, vec![1, 2, 3, 5, 6, 7, 8, 9]);
        assert_eq!(dropped, 1);
        assert_eq!(expired, 0);
        assert_eq!(window.total_dropped(), 1);
    }

    #[test]
    fn test_stale_reorder_counts_expired() {
        let mut h = Harness::new(4);
        for seq in 1..=6 {
            h.insert(seq, seq);
        }
        h.insert(2, 6); // behind the window, clock not advanced
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(dropped, 0);
        assert_eq!(expired, 1);
    }

    #[test]
    fn test_slot_timeout_declares_loss() {
        let mut h = Harness::new(8);
        h.insert(1, 100);
        h.insert(2, 101);
        h.insert(4, 102); // 3 missing; its slot inherits ts 102
        h.insert(5, 102 + TIMEOUT + 1);
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, vec![1, 2, 4, 5]);
        assert_eq!(dropped, 1);
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_slot_within_tolerance_is_not_flushed() {
        let mut h = Harness::new(8);
        h.insert(1, 100);
        h.insert(3, 200);
        h.insert(4, 200 + TIMEOUT); // exactly at the bound: still waiting
        assert_eq!(h.window.occupied(), 2);
        let (delivered, dropped, ..) = h.finish();
        assert_eq!(delivered, vec![1]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_restart_purges_without_counting_loss() {
        let mut h = Harness::new(8);
        for seq in 995..=1000u64 {
            h.insert(seq, seq);
        }
        // Sequence collapses while the clock moves on: restart.
        h.insert(5, 1001);
        assert_eq!(h.window.start_seq(), 1);
        for seq in 1..=4u64 {
            h.insert(seq, 1001 + seq);
        }
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(
            delivered,
            vec![995, 996, 997, 998, 999, 1000, 1, 2, 3, 4, 5]
        );
        assert_eq!((dropped, expired), (0, 0));
    }

    #[test]
    fn test_restart_with_cached_packets_releases_them() {
        let mut h = Harness::new(8);
        h.insert(1, 10); // delivered
        h.insert(3, 11); // cached, waiting for 2
        h.insert(5, 12); // cached
        assert_eq!(h.window.occupied(), 2);
        h.insert(1, 13); // seq fell behind while the clock advanced: restart
        assert_eq!(h.window.occupied(), 0);
        let (delivered, dropped, expired, window, pool) = h.finish();
        assert_eq!(delivered, vec![1, 1]);
        assert_eq!((dropped, expired), (0, 0));
        drop(window);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pre_restart_straggler_is_not_delivered() {
        let mut h = Harness::new(8);
        for seq in 100..=110u64 {
            h.insert(seq, seq);
        }
        h.insert(5, 200); // restart, window reseats at 1 and delivers 5 on overrun
        h.insert(104, 109); // pre-restart straggler: seq far ahead, clock behind
        let (delivered, _, expired, window, pool) = h.finish();
        // The straggler lands deep in the reseated sequence space and
        // stays cached; the pre-restart deliveries never repeat.
        assert_eq!(
            delivered,
            (100..=110).chain(std::iter::once(5)).collect::<Vec<_>>()
        );
        assert_eq!(expired, 0);
        assert_eq!(window.occupied(), 1);
        drop(window);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_degenerate_window_of_one() {
        let mut h = Harness::new(1);
        h.insert(1, 1);
        h.insert(3, 2); // 2 skipped: immediate loss
        h.insert(2, 2); // now stale (clock did not advance past the max)
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, vec![1, 3]);
        assert_eq!(dropped, 1);
        assert_eq!(expired, 1);
    }

    #[test]
    fn test_last_slot_placement_needs_no_flush() {
        let mut h = Harness::new(4);
        h.insert(1, 1); // start_seq -> 2
        h.insert(5, 2); // offset 3: last slot
        assert_eq!(h.window.occupied(), 1);
        assert_eq!(h.window.start_seq(), 2);
        let (delivered, dropped, ..) = h.finish();
        assert_eq!(delivered, vec![1]);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn test_one_past_window_forces_single_advance() {
        let mut h = Harness::new(4);
        h.insert(1, 1); // start_seq -> 2
        h.insert(6, 2); // offset 4: one forced advance, seq 2 lost
        assert_eq!(h.window.start_seq(), 3);
        let (delivered, dropped, ..) = h.finish();
        assert_eq!(delivered, vec![1]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_bulk_gap_advance() {
        let mut h = Harness::new(4);
        h.insert(1, 1); // start_seq -> 2
        h.insert(42, 2); // offset 40: 4 stepped + 33 bulk-skipped
        assert_eq!(h.dropped, 37);
        assert_eq!(h.window.start_seq(), 39);
        let (delivered, dropped, ..) = h.finish();
        assert_eq!(delivered, vec![1]);
        assert_eq!(dropped, 37);
    }

    #[test]
    fn test_forced_flush_delivers_cached_before_dropping() {
        let mut h = Harness::new(4);
        h.insert(1, 1); // start_seq -> 2
        h.insert(3, 2); // cached
        h.insert(7, 3); // offset 5: slides over empty 2 (loss) and cached 3
        let (delivered, dropped, ..) = h.finish();
        assert_eq!(delivered, vec![1, 3]);
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_single_missing_seq_eventually_single_drop() {
        // Omit seq 4 from 1..=12 with C = 4; the drop lands when seq 8
        // arrives and nothing else is ever counted.
        let mut h = Harness::new(4);
        for (ts, seq) in (1..=12u64).filter(|&s| s != 4).enumerate() {
            h.insert(seq, ts as u64 + 1);
        }
        let (delivered, dropped, expired, ..) = h.finish();
        assert_eq!(delivered, vec![1, 2, 3, 5, 6, 7, 8, 9, 10, 11, 12]);
        assert_eq!(dropped, 1);
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_mixed_stream_accounting() {
        // Loss, reorder, a stale duplicate and recovery in one stream.
        let mut h = Harness::new(4);
        let feed = [
            (1u64, 1u64),
            (2, 2),
            (5, 3),
            (3, 4),
            (9, 5),
            (8, 6),
            (2, 5), // behind the window with an old timestamp: stale
            (10, 7),
            (11, 8),
            (12, 9),
            (13, 10),
        ];
        for &(seq, ts) in &feed {
            h.insert(seq, ts);
        }
        let (delivered, dropped, expired, window, pool) = h.finish();
        assert_eq!(delivered, vec![1, 2, 3, 5, 8, 9, 10, 11, 12, 13]);
        assert_eq!(dropped, 3); // seqs 4, 6 and 7
        assert_eq!(expired, 1);
        // Delivered sequences strictly increase.
        assert!(delivered.windows(2).all(|w| w[0] < w[1]));
        // Every inserted buffer is delivered, expired or still cached.
        assert_eq!(
            feed.len(),
            delivered.len() + expired as usize + window.occupied()
        );
        drop(window);
        assert_eq!(pool.outstanding(), 0);
    }
}
