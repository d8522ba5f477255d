// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Packet Buffer Pool
//!
//! The receive loop acquires one `PacketBuffer` per datagram; ownership
//! then moves through the reorder window to a slave queue without copying
//! the bytes. The pool is lock-free (`crossbeam-queue`) and is the sole
//! allocator on the hot path: buffers return on drop and are reused
//! without zeroing.

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::adapter::decoder::{HeaderError, SequentialDecoder, HEADER_SIZE};
use crate::decap::TunnelInfo;

/// Receive buffer capacity; large enough for any jumbo datagram.
pub const UDP_BUFFER_SIZE: usize = 65536;

/// How many buffers to pre-allocate at startup.
const PREWARM_COUNT: usize = 64;

/// Lock-free pool of receive buffers. Cheap to share; grows on demand and
/// never shrinks.
pub struct BufferPool {
    free: SegQueue<Box<[u8]>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        let pool = Arc::new(Self {
            free: SegQueue::new(),
            outstanding: AtomicUsize::new(0),
        });
        for _ in 0..PREWARM_COUNT {
            pool.free.push(vec![0u8; UDP_BUFFER_SIZE].into_boxed_slice());
        }
        pool
    }

    /// Acquire a buffer. Content is undefined; callers must `init` after
    /// filling it. Allocates a fresh buffer when the free list is empty.
    pub fn acquire(self: &Arc<Self>) -> PacketBuffer {
        let buffer = self
            .free
            .pop()
            .unwrap_or_else(|| vec![0u8; UDP_BUFFER_SIZE].into_boxed_slice());
        self.outstanding.fetch_add(1, Ordering::Relaxed);
        PacketBuffer {
            buffer,
            len: 0,
            trident_ip: 0,
            decoder: SequentialDecoder::default(),
            hash: 0,
            tunnel: TunnelInfo::default(),
            pool: self.clone(),
        }
    }

    fn release(&self, buffer: Box<[u8]>) {
        self.free.push(buffer);
        self.outstanding.fetch_sub(1, Ordering::Relaxed);
    }

    /// Buffers currently held by the data plane. Returns to zero once
    /// every path (delivery, drop, purge, timeout) has run its course.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Buffers on the free list.
    pub fn available(&self) -> usize {
        self.free.len()
    }
}

/// One received datagram plus its decoded state.
///
/// Exactly one owner at a time; the backing storage returns to the pool
/// when the buffer is dropped, on whichever path that happens.
pub struct PacketBuffer {
    buffer: Box<[u8]>,
    len: usize,
    trident_ip: u32,
    decoder: SequentialDecoder,
    hash: u8,
    /// Outer tunnel metadata, populated by the slave worker.
    pub tunnel: TunnelInfo,
    pool: Arc<BufferPool>,
}

impl PacketBuffer {
    /// Reset decoded state for a freshly received datagram.
    pub fn init(&mut self, trident_ip: u32, len: usize) {
        self.trident_ip = trident_ip;
        self.len = len.min(self.buffer.len());
        self.hash = 0;
        self.tunnel = TunnelInfo::default();
        self.decoder.reset();
    }

    /// Whole receive buffer, for the socket to fill.
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// The received datagram.
    pub fn datagram(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Captured frame carried after the trident header.
    pub fn payload(&self) -> &[u8] {
        &self.buffer[HEADER_SIZE.min(self.len)..self.len]
    }

    pub fn decode_header(&mut self) -> Result<(), HeaderError> {
        self.decoder.decode_header(&self.buffer[..self.len])
    }

    /// Dispatch hash over (sender, dispatcher): fold the 32-bit mix to a
    /// byte, then squeeze the entropy into the low bits the fan-out mask
    /// actually uses.
    pub fn calc_hash(&mut self) -> u8 {
        let mix = self.trident_ip ^ u32::from(self.decoder.dispatcher_index());
        let mut hash =
            (mix >> 24) as u8 ^ (mix >> 16) as u8 ^ (mix >> 8) as u8 ^ mix as u8;
        hash = (hash >> 6) ^ (hash >> 4) ^ (hash >> 2) ^ hash;
        self.hash = hash;
        hash
    }

    #[inline]
    pub fn trident_ip(&self) -> u32 {
        self.trident_ip
    }

    #[inline]
    pub fn hash(&self) -> u8 {
        self.hash
    }

    #[inline]
    pub fn decoder(&self) -> &SequentialDecoder {
        &self.decoder
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        // Move the storage out and hand it back; the empty replacement
        // satisfies the borrow checker and is never pooled.
        let buffer = std::mem::replace(&mut self.buffer, Box::new([]));
        if !buffer.is_empty() {
            self.pool.release(buffer);
        }
    }
}

/// Craft a decoded packet straight from header fields; unit-test plumbing
/// shared by the reorder and adapter tests.
#[cfg(test)]
pub(crate) fn make_packet(
    pool: &Arc<BufferPool>,
    trident_ip: u32,
    seq: u64,
    timestamp: u64,
    dispatcher_index: u8,
) -> PacketBuffer {
    let header = crate::adapter::decoder::encode_header(seq, timestamp, dispatcher_index);
    let mut packet = pool.acquire();
    packet.buffer_mut()[..HEADER_SIZE].copy_from_slice(&header);
    packet.init(trident_ip, HEADER_SIZE);
    packet.decode_header().unwrap();
    packet.calc_hash();
    packet
}
