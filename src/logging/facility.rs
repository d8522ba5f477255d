// SPDX-License-Identifier: Apache-2.0 OR MIT
// Logging facilities (component identifiers)

use serde::{Deserialize, Serialize};

/// Logging facility - identifies which component generated the log message
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Facility {
    /// Receive loop, sender table, counters
    Adapter = 0,
    /// Trident wire header parsing
    Decoder = 1,
    /// Per-dispatcher reordering window
    Reorder = 2,
    /// Tunnel decapsulation
    Decap = 3,
    /// Downstream fan-out workers
    Slave = 4,
    /// Packet buffer acquisition/release
    BufferPool = 5,
    /// Counter reporting
    Stats = 6,
    /// Configuration loading and validation
    Config = 7,
    /// Test harness and fixtures
    Test = 8,

    /// Fallback for uncategorized messages
    Unknown = 255,
}

impl Facility {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Facility::Adapter => "Adapter",
            Facility::Decoder => "Decoder",
            Facility::Reorder => "Reorder",
            Facility::Decap => "Decap",
            Facility::Slave => "Slave",
            Facility::BufferPool => "BufferPool",
            Facility::Stats => "Stats",
            Facility::Config => "Config",
            Facility::Test => "Test",
            Facility::Unknown => "Unknown",
        }
    }

    /// Create from u8 value (returns Unknown if invalid)
    pub const fn from_u8(value: u8) -> Self {
        match value {
            0 => Facility::Adapter,
            1 => Facility::Decoder,
            2 => Facility::Reorder,
            3 => Facility::Decap,
            4 => Facility::Slave,
            5 => Facility::BufferPool,
            6 => Facility::Stats,
            7 => Facility::Config,
            8 => Facility::Test,
            _ => Facility::Unknown,
        }
    }
}

impl std::fmt::Display for Facility {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
