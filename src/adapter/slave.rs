//! Slave Fan-Out Workers
//!
//! Reorder windows deliver packets to slaves selected by `hash & (N-1)`.
//! Each slave is a bounded hand-off queue plus one worker thread that
//! decapsulates the captured frame and pushes the packet into its
//! downstream `QueueWriter`. `put` blocks when the queue is full; that
//! stall is the adapter's backpressure.

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TryRecvError};
use std::sync::Arc;
use std::thread;

use crate::adapter::buffer_pool::PacketBuffer;
use crate::adapter::stats::CounterCell;
use crate::adapter::QUEUE_BATCH_SIZE;
use crate::decap::{TunnelInfo, ETH_HEADER_SIZE};
use crate::logging::{Facility, Logger};

/// Downstream queue handle. The only operation the adapter consumes;
/// implementations own everything past this point.
pub trait QueueWriter: Send + 'static {
    fn put(&self, packet: PacketBuffer);
}

/// Hand-off endpoint owned by the receive thread.
pub struct Slave {
    id: usize,
    tx: SyncSender<PacketBuffer>,
    counter: Arc<CounterCell>,
}

impl Slave {
    /// Spawn the worker thread and return its hand-off endpoint.
    pub fn spawn(
        id: usize,
        depth: usize,
        writer: Box<dyn QueueWriter>,
        logger: Logger,
    ) -> (Self, thread::JoinHandle<()>) {
        let (tx, rx) = sync_channel(depth);
        let counter = Arc::new(CounterCell::default());
        let worker_counter = counter.clone();
        let handle = thread::spawn(move || run_worker(id, rx, writer, worker_counter, logger));
        (Self { id, tx, counter }, handle)
    }

    /// Enqueue a packet for this slave, blocking under backpressure.
    /// During shutdown the worker may already be gone; the packet then
    /// drops straight back to the pool.
    pub fn put(&self, packet: PacketBuffer) {
        let _ = self.tx.send(packet);
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn counter(&self) -> &Arc<CounterCell> {
        &self.counter
    }
}

fn run_worker(
    id: usize,
    rx: Receiver<PacketBuffer>,
    writer: Box<dyn QueueWriter>,
    counter: Arc<CounterCell>,
    logger: Logger,
) {
    logger.debug(Facility::Slave, &format!("slave {} started", id));
    let mut batch = Vec::with_capacity(QUEUE_BATCH_SIZE);
    loop {
        match rx.recv() {
            Ok(packet) => batch.push(packet),
            Err(_) => break,
        }
        while batch.len() < QUEUE_BATCH_SIZE {
            match rx.try_recv() {
                Ok(packet) => batch.push(packet),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        counter.add_tx_packets(batch.len() as u64);
        for mut packet in batch.drain(..) {
            let mut tunnel = TunnelInfo::default();
            let frame = packet.payload();
            if frame.len() > ETH_HEADER_SIZE {
                tunnel.decapsulate(&frame[ETH_HEADER_SIZE..]);
            }
            packet.tunnel = tunnel;
            writer.put(packet);
        }
    }
    logger.debug(Facility::Slave, &format!("slave {} stopped", id));
}
