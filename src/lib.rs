// SPDX-License-Identifier: Apache-2.0 OR MIT
//! Trident adapter: UDP ingest for remote capture probes.
//!
//! Tridents stream captured frames over UDP, each datagram carrying a
//! sequence number, a sender timestamp and a dispatcher index. This crate
//! receives those streams, absorbs bounded reordering per (sender,
//! dispatcher) while counting loss and surviving sender restarts,
//! decapsulates common tunnel headers (ERSPAN II/III, VXLAN) and fans the
//! packets out to downstream queues by a stable hash.
//!
//! The data plane is plain blocking threads: one receive loop that owns
//! all reorder state, plus one worker per downstream queue. Buffers come
//! from a lock-free pool and move through the pipeline without copying.

pub mod adapter;
pub mod config;
pub mod decap;
pub mod logging;

pub use adapter::buffer_pool::PacketBuffer;
pub use adapter::slave::QueueWriter;
pub use adapter::stats::PacketCounter;
pub use adapter::{AdapterHandle, TridentAdapter};
pub use config::Config;
pub use decap::{TunnelInfo, TunnelType};
