//! Flash addressing: block/page pairs and storage identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Sentinel block index terminating intrusive lists and marking unset cursors.
pub const INVALID_BLOCK: u32 = u32::MAX;

/// A page-granular flash address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageAddr {
    /// Logical block number.
    pub block: u32,
    /// Page index within the block.
    pub page: u32,
}

impl PageAddr {
    /// Creates an address from a block number and a page index.
    pub fn new(block: u32, page: u32) -> Self {
        Self { block, page }
    }

    /// Returns the address used for unset cursors and list terminators.
    pub fn invalid() -> Self {
        Self {
            block: INVALID_BLOCK,
            page: 0,
        }
    }

    /// True when the block component names a real block.
    pub fn is_valid(&self) -> bool {
        self.block != INVALID_BLOCK
    }
}

impl fmt::Display for PageAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block, self.page)
    }
}

/// Storage identifier: a stable, one-based name for the first page of an
/// object on the device.
///
/// A SID encodes a page address as
/// `block * pages_per_block + page + 1`, so zero never names an object.
/// Callers must not manufacture SIDs; they round-trip the value returned by
/// enqueue or read from an object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sid(u64);

impl Sid {
    /// Encodes a page address as a SID under the given geometry.
    pub fn from_addr(addr: PageAddr, pages_per_block: u32) -> Self {
        Sid(addr.block as u64 * pages_per_block as u64 + addr.page as u64 + 1)
    }

    /// Wraps a raw SID value, e.g. one decoded from an object header.
    pub fn from_raw(raw: u64) -> Self {
        Sid(raw)
    }

    /// The raw SID value.
    pub fn raw(self) -> u64 {
        self.0
    }

    /// Decodes the SID back into the page address it names.
    pub fn to_addr(self, pages_per_block: u32) -> PageAddr {
        let linear = self.0.saturating_sub(1);
        PageAddr {
            block: (linear / pages_per_block as u64) as u32,
            page: (linear % pages_per_block as u64) as u32,
        }
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
