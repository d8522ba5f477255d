// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Trident Adapter Data Plane
//!
//! One receive thread pulls UDP datagrams in batches, validates the
//! trident header, and routes each packet into the reorder window keyed
//! by (sender IP, dispatcher index). Windows deliver in-sequence packets
//! to slave workers picked by the packet hash; slaves decapsulate and
//! hand off downstream. The receive thread is the sole writer to the
//! sender table and every window, so the hot path takes no locks.

pub mod buffer_pool;
pub mod decoder;
pub mod metrics;
pub mod reorder;
pub mod slave;
pub mod stats;

use anyhow::{ensure, Context, Result};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::Config;
use crate::logging::{Facility, Logger};

use self::buffer_pool::{BufferPool, PacketBuffer};
use self::decoder::DISPATCHER_MAX;
use self::reorder::ReorderWindow;
use self::slave::{QueueWriter, Slave};
use self::stats::{merge_counters, CounterCell, PacketCounter};

/// UDP port tridents send to.
pub const LISTEN_PORT: u16 = 20033;

/// Datagrams pulled from the socket per batch.
pub const BATCH_SIZE: usize = 128;

/// Packets a slave worker drains from its queue in one go.
pub const QUEUE_BATCH_SIZE: usize = 4096;

/// Reorder tolerance, and the receive deadline that paces idle windows.
pub const REORDER_TIMEOUT: Duration = Duration::from_secs(2);
pub(crate) const REORDER_TIMEOUT_NS: u64 = REORDER_TIMEOUT.as_nanos() as u64;

/// Sample rate for logging malformed-frame details.
const DECODE_ERROR_SAMPLE: u64 = 100;

/// Senders are keyed by their IPv4 address.
pub type TridentKey = u32;

/// Round up to the next power of two, capped at 2^30.
pub fn min_power_of_two(v: u32) -> u32 {
    for i in 0..30 {
        if v <= 1 << i {
            return 1 << i;
        }
    }
    1 << 30
}

/// Reorder state for one sender: a window per dispatcher sub-stream,
/// allocated the first time that sub-stream is heard from.
#[derive(Default)]
struct TridentInstance {
    windows: [Option<ReorderWindow>; DISPATCHER_MAX],
}

/// The adapter before `start`: owns the socket, the pool, the slaves and
/// the sender table. `start` moves it onto its receive thread.
pub struct TridentAdapter {
    socket: UdpSocket,
    local_addr: SocketAddr,
    cache_size: u64,
    pool: Arc<BufferPool>,
    instances: HashMap<TridentKey, TridentInstance>,
    slaves: Vec<Slave>,
    slave_handles: Vec<thread::JoinHandle<()>>,
    counter: Arc<CounterCell>,
    running: Arc<AtomicBool>,
    logger: Logger,
}

impl TridentAdapter {
    /// Bind the listen socket and spawn one slave worker per downstream
    /// queue. The queue count must be a power of two no larger than 256
    /// so `hash & (N-1)` reaches every queue.
    pub fn new(
        config: &Config,
        queues: Vec<Box<dyn QueueWriter>>,
        logger: Logger,
    ) -> Result<Self> {
        ensure!(
            !queues.is_empty() && queues.len().is_power_of_two() && queues.len() <= 256,
            "downstream queue count {} must be a power of two in 1..=256",
            queues.len()
        );

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .context("create udp listen socket")?;
        socket
            .set_recv_buffer_size(config.listen_buffer_size)
            .context("set listen buffer size")?;
        let bind_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.listen_port));
        socket
            .bind(&bind_addr.into())
            .with_context(|| format!("bind udp socket to {}", bind_addr))?;
        let socket: UdpSocket = socket.into();
        socket
            .set_read_timeout(Some(REORDER_TIMEOUT))
            .context("arm receive deadline")?;
        let local_addr = socket.local_addr().context("query bound address")?;

        let mut slaves = Vec::with_capacity(queues.len());
        let mut slave_handles = Vec::with_capacity(queues.len());
        for (id, queue) in queues.into_iter().enumerate() {
            let (slave, handle) = Slave::spawn(id, config.queue_depth, queue, logger.clone());
            slaves.push(slave);
            slave_handles.push(handle);
        }

        Ok(Self {
            socket,
            local_addr,
            cache_size: u64::from(min_power_of_two(config.cache_size)),
            pool: BufferPool::new(),
            instances: HashMap::new(),
            slaves,
            slave_handles,
            counter: Arc::new(CounterCell::default()),
            running: Arc::new(AtomicBool::new(true)),
            logger,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Spawn the receive thread and hand back the control surface.
    pub fn start(mut self) -> Result<AdapterHandle> {
        let running = self.running.clone();
        let master = self.counter.clone();
        let slave_counters: Vec<_> = self.slaves.iter().map(|s| s.counter().clone()).collect();
        let pool = self.pool.clone();
        let local_addr = self.local_addr;
        let slave_handles = std::mem::take(&mut self.slave_handles);

        let recv_thread = thread::Builder::new()
            .name("trident-recv".into())
            .spawn(move || self.run())
            .context("spawn receive thread")?;

        Ok(AdapterHandle {
            running,
            local_addr,
            master,
            slave_counters,
            pool,
            recv_thread,
            slave_handles,
        })
    }

    fn run(mut self) -> Result<()> {
        self.logger.notice(
            Facility::Adapter,
            &format!("trident adapter listening on {}", self.local_addr),
        );
        let mut batch: Vec<PacketBuffer> = Vec::with_capacity(BATCH_SIZE);
        while self.running.load(Ordering::Acquire) {
            for _ in 0..BATCH_SIZE {
                let mut packet = self.pool.acquire();
                match self.socket.recv_from(packet.buffer_mut()) {
                    Ok((len, SocketAddr::V4(remote))) => {
                        packet.init(u32::from(*remote.ip()), len);
                        batch.push(packet);
                    }
                    Ok((_, remote)) => {
                        self.logger.debug(
                            Facility::Adapter,
                            &format!("ignoring datagram from non-IPv4 source {}", remote),
                        );
                    }
                    Err(e)
                        if e.kind() == ErrorKind::WouldBlock
                            || e.kind() == ErrorKind::TimedOut =>
                    {
                        // Deadline reached: flush what we have and re-arm.
                        break;
                    }
                    Err(e) => {
                        self.logger.error(
                            Facility::Adapter,
                            &format!("fatal udp read error: {}", e),
                        );
                        self.running.store(false, Ordering::Release);
                        return Err(e).context("udp receive failed");
                    }
                }
            }
            for packet in batch.drain(..) {
                self.process_packet(packet);
            }
        }
        self.logger.notice(Facility::Adapter, "trident adapter stopped");
        Ok(())
    }

    fn process_packet(&mut self, mut packet: PacketBuffer) {
        if let Err(e) = packet.decode_header() {
            let errors = self.counter.add_rx_errors(1);
            if errors % DECODE_ERROR_SAMPLE == 1 {
                self.logger.debug(
                    Facility::Decoder,
                    &format!(
                        "invalid frame from trident {}: {} (total errors {})",
                        Ipv4Addr::from(packet.trident_ip()),
                        e,
                        errors
                    ),
                );
            }
            return;
        }
        packet.calc_hash();
        self.counter.add_rx_packets(1);
        self.find_and_insert(packet);
    }

    fn find_and_insert(&mut self, packet: PacketBuffer) {
        let key = packet.trident_ip();
        let index = usize::from(packet.decoder().dispatcher_index());
        let cache_size = self.cache_size;
        let instance = self.instances.entry(key).or_default();
        let window =
            instance.windows[index].get_or_insert_with(|| ReorderWindow::new(cache_size));

        let (dropped, expired) = window.insert(packet, &self.slaves, &self.logger);
        if dropped > 0 {
            self.counter.add_rx_dropped(dropped);
        }
        if expired > 0 {
            self.counter.add_rx_expired(expired);
        }
    }
}

/// Control surface of a started adapter: counters, shutdown and joins.
pub struct AdapterHandle {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    master: Arc<CounterCell>,
    slave_counters: Vec<Arc<CounterCell>>,
    pool: Arc<BufferPool>,
    recv_thread: thread::JoinHandle<Result<()>>,
    slave_handles: Vec<thread::JoinHandle<()>>,
}

impl AdapterHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Merged adapter counters: the receive loop plus every slave.
    pub fn counters(&self) -> PacketCounter {
        let mut cells = vec![self.master.clone()];
        cells.extend(self.slave_counters.iter().cloned());
        merge_counters(&cells)
    }

    /// Every counter cell, for the periodic reporter.
    pub fn counter_cells(&self) -> Vec<Arc<CounterCell>> {
        let mut cells = vec![self.master.clone()];
        cells.extend(self.slave_counters.iter().cloned());
        cells
    }

    /// Shared shutdown flag; reporters key off the same one.
    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Buffers currently owned by the data plane.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    /// Request shutdown; the receive loop notices at the next deadline.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait for the data plane to wind down and surface the receive
    /// loop's outcome.
    pub fn join(self) -> Result<()> {
        let outcome = self
            .recv_thread
            .join()
            .map_err(|_| anyhow::anyhow!("receive thread panicked"))?;
        for handle in self.slave_handles {
            let _ = handle.join();
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_min_power_of_two() {
        assert_eq!(min_power_of_two(0), 1);
        assert_eq!(min_power_of_two(1), 1);
        assert_eq!(min_power_of_two(3), 4);
        assert_eq!(min_power_of_two(64), 64);
        assert_eq!(min_power_of_two(65), 128);
        assert_eq!(min_power_of_two(u32::MAX), 1 << 30);
    }

    #[test]
    fn test_queue_count_must_be_power_of_two() {
        let config = Config::default();
        let logger = Logger::stderr(crate::logging::Severity::Error).unwrap();
        let queues: Vec<Box<dyn QueueWriter>> = (0..3)
            .map(|_| Box::new(DiscardQueue) as Box<dyn QueueWriter>)
            .collect();
        assert!(TridentAdapter::new(&config, queues, logger).is_err());
    }

    struct DiscardQueue;

    impl QueueWriter for DiscardQueue {
        fn put(&self, _packet: PacketBuffer) {}
    }
}
