// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Adapter counters.
//!
//! The receive loop and every slave own a `CounterCell`; snapshots merge
//! them into one `PacketCounter` on read. A reporter thread logs the
//! per-interval delta and feeds the same numbers to the `metrics` facade.

use metrics::counter;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::logging::{Facility, Logger};

/// Point-in-time counter snapshot; the adapter's observability contract.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PacketCounter {
    /// Datagrams with a valid trident header.
    pub rx_packets: u64,
    /// Packets declared lost by a reorder window (overflow or timeout).
    pub rx_dropped: u64,
    /// Stale out-of-order packets discarded behind the window.
    pub rx_expired: u64,
    /// Datagrams with a malformed trident header.
    pub rx_errors: u64,
    /// Packets handed to downstream queues.
    pub tx_packets: u64,
}

impl PacketCounter {
    pub fn add(&mut self, other: &PacketCounter) {
        self.rx_packets += other.rx_packets;
        self.rx_dropped += other.rx_dropped;
        self.rx_expired += other.rx_expired;
        self.rx_errors += other.rx_errors;
        self.tx_packets += other.tx_packets;
    }

    /// Field-wise difference against an earlier snapshot of the same cells.
    pub fn delta_since(&self, earlier: &PacketCounter) -> PacketCounter {
        PacketCounter {
            rx_packets: self.rx_packets - earlier.rx_packets,
            rx_dropped: self.rx_dropped - earlier.rx_dropped,
            rx_expired: self.rx_expired - earlier.rx_expired,
            rx_errors: self.rx_errors - earlier.rx_errors,
            tx_packets: self.tx_packets - earlier.tx_packets,
        }
    }
}

/// Cumulative counters, written by one thread and read by any.
#[derive(Debug, Default)]
pub struct CounterCell {
    rx_packets: AtomicU64,
    rx_dropped: AtomicU64,
    rx_expired: AtomicU64,
    rx_errors: AtomicU64,
    tx_packets: AtomicU64,
}

impl CounterCell {
    pub fn add_rx_packets(&self, n: u64) -> u64 {
        self.rx_packets.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn add_rx_dropped(&self, n: u64) -> u64 {
        self.rx_dropped.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn add_rx_expired(&self, n: u64) -> u64 {
        self.rx_expired.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn add_rx_errors(&self, n: u64) -> u64 {
        self.rx_errors.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn add_tx_packets(&self, n: u64) -> u64 {
        self.tx_packets.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn snapshot(&self) -> PacketCounter {
        PacketCounter {
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            rx_expired: self.rx_expired.load(Ordering::Relaxed),
            rx_errors: self.rx_errors.load(Ordering::Relaxed),
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
        }
    }
}

/// Merge any number of cells into one snapshot.
pub fn merge_counters<'a, I>(cells: I) -> PacketCounter
where
    I: IntoIterator<Item = &'a Arc<CounterCell>>,
{
    let mut merged = PacketCounter::default();
    for cell in cells {
        merged.add(&cell.snapshot());
    }
    merged
}

/// Spawn the periodic counter reporter. Logs the per-interval delta and
/// increments the `metrics` counters by the same amounts; exits once
/// `running` goes false.
pub fn spawn_reporter(
    cells: Vec<Arc<CounterCell>>,
    interval: Duration,
    running: Arc<AtomicBool>,
    logger: Logger,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut last = merge_counters(&cells);
        let mut deadline = Instant::now() + interval;
        while running.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
            if Instant::now() < deadline {
                continue;
            }
            deadline += interval;

            let current = merge_counters(&cells);
            let delta = current.delta_since(&last);
            last = current;

            counter!("trident_adapter_rx_packets_total").increment(delta.rx_packets);
            counter!("trident_adapter_rx_dropped_total").increment(delta.rx_dropped);
            counter!("trident_adapter_rx_expired_total").increment(delta.rx_expired);
            counter!("trident_adapter_rx_errors_total").increment(delta.rx_errors);
            counter!("trident_adapter_tx_packets_total").increment(delta.tx_packets);

            logger.info(
                Facility::Stats,
                &format!(
                    "rx={} dropped={} expired={} errors={} tx={} (cumulative rx={} tx={})",
                    delta.rx_packets,
                    delta.rx_dropped,
                    delta.rx_expired,
                    delta.rx_errors,
                    delta.tx_packets,
                    current.rx_packets,
                    current.tx_packets
                ),
            );
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_merge() {
        let master = Arc::new(CounterCell::default());
        let slave = Arc::new(CounterCell::default());

        master.add_rx_packets(10);
        master.add_rx_dropped(2);
        master.add_rx_errors(1);
        slave.add_tx_packets(7);

        let merged = merge_counters(&[master, slave]);
        assert_eq!(
            merged,
            PacketCounter {
                rx_packets: 10,
                rx_dropped: 2,
                rx_expired: 0,
                rx_errors: 1,
                tx_packets: 7,
            }
        );
    }

    #[test]
    fn test_delta_since() {
        let cell = Arc::new(CounterCell::default());
        cell.add_rx_packets(5);
        let first = cell.snapshot();
        cell.add_rx_packets(3);
        cell.add_rx_expired(1);

        let delta = cell.snapshot().delta_since(&first);
        assert_eq!(delta.rx_packets, 3);
        assert_eq!(delta.rx_expired, 1);
        assert_eq!(delta.rx_dropped, 0);
    }

    #[test]
    fn test_add_returns_new_total() {
        let cell = CounterCell::default();
        assert_eq!(cell.add_rx_errors(1), 1);
        assert_eq!(cell.add_rx_errors(2), 3);
    }

    #[test]
    fn test_reporter_stops_on_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let handle = spawn_reporter(
            vec![Arc::new(CounterCell::default())],
            Duration::from_secs(60),
            running.clone(),
            Logger::stderr(crate::logging::Severity::Error).unwrap(),
        );
        running.store(false, Ordering::Release);
        handle.join().unwrap();
    }
}
