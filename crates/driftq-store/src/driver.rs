//! Flash driver capability and the in-memory NAND simulator.
//!
//! The store consumes a [`FlashDriver`]: a blocking, page-addressable,
//! erase-before-write device. [`SimFlash`] implements the trait over RAM
//! with NAND program-once semantics and injectable faults, and is what the
//! test suites run against.

use std::collections::HashSet;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::addr::PageAddr;
use crate::error::{StoreError, StoreResult};

/// Compile-time bound on pages per block; sizes the per-block page-use
/// bitmap. The device-reported `pages_per_block` must not exceed this.
pub const MAX_PAGES_PER_BLOCK: u32 = 128;

/// Device-reported flash geometry, captured at initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashGeometry {
    /// Number of erase blocks on the device.
    pub num_blocks: u32,
    /// Pages per erase block.
    pub pages_per_block: u32,
    /// Bytes per page.
    pub page_size: usize,
}

impl FlashGeometry {
    /// Total pages on the device.
    pub fn total_pages(&self) -> u64 {
        self.num_blocks as u64 * self.pages_per_block as u64
    }

    /// Bytes held by one erase block.
    pub fn block_bytes(&self) -> u64 {
        self.pages_per_block as u64 * self.page_size as u64
    }
}

/// Abstract capability over a raw NAND flash device.
///
/// Reads and writes are page-granular, erases are block-granular, and a
/// programmed page cannot be rewritten until its block is erased. All
/// primitives are blocking; erase in particular may take a long time on
/// real parts.
pub trait FlashDriver: Send + Sync {
    /// The device geometry. Must not change over the driver's lifetime.
    fn geometry(&self) -> FlashGeometry;

    /// Reads `buf.len()` bytes from the start of the addressed page.
    fn page_read(&self, addr: PageAddr, buf: &mut [u8]) -> StoreResult<()>;

    /// Programs `data.len()` bytes at the start of the addressed page.
    fn page_write(&self, addr: PageAddr, data: &[u8]) -> StoreResult<()>;

    /// Erases a block, returning every page in it to the unprogrammed state.
    fn block_erase(&self, block: u32) -> StoreResult<()>;

    /// True when the device marks the block as bad.
    fn is_bad(&self, block: u32) -> bool;

    /// Translates a logical block number to the physical block id, for
    /// diagnostics only.
    fn phys_block(&self, block: u32) -> u32;
}

/// Operation counters reported by [`SimFlash::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverStats {
    /// Pages read.
    pub page_reads: u64,
    /// Pages programmed.
    pub page_writes: u64,
    /// Blocks erased.
    pub block_erases: u64,
    /// Operations refused: injected faults, program-twice, out of range.
    pub faults: u64,
}

struct SimInner {
    /// One entry per page; `None` is the erased state.
    pages: Vec<Option<Vec<u8>>>,
    bad: HashSet<u32>,
    write_faults: HashSet<(u32, u32)>,
    erase_faults: HashSet<u32>,
    stats: DriverStats,
}

/// In-memory NAND flash simulator.
///
/// Erased pages read back as `0xFF`; programming an already-programmed page
/// fails until the block is erased. Faults can be injected per page write
/// and per block erase, and blocks can be marked factory-bad.
pub struct SimFlash {
    geometry: FlashGeometry,
    inner: Mutex<SimInner>,
}

impl SimFlash {
    /// Creates a simulator with every block healthy and erased.
    pub fn new(geometry: FlashGeometry) -> Self {
        let total = geometry.total_pages() as usize;
        Self {
            geometry,
            inner: Mutex::new(SimInner {
                pages: (0..total).map(|_| None).collect(),
                bad: HashSet::new(),
                write_faults: HashSet::new(),
                erase_faults: HashSet::new(),
                stats: DriverStats::default(),
            }),
        }
    }

    /// Marks a block factory-bad: `is_bad` reports it from now on.
    pub fn mark_bad(&self, block: u32) {
        self.inner.lock().bad.insert(block);
    }

    /// Makes every future write to the given page fail.
    pub fn fail_page_write(&self, block: u32, page: u32) {
        self.inner.lock().write_faults.insert((block, page));
    }

    /// Makes every future erase of the given block fail.
    pub fn fail_block_erase(&self, block: u32) {
        self.inner.lock().erase_faults.insert(block);
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> DriverStats {
        self.inner.lock().stats
    }

    fn page_index(&self, addr: PageAddr) -> Option<usize> {
        if addr.block >= self.geometry.num_blocks || addr.page >= self.geometry.pages_per_block {
            return None;
        }
        Some((addr.block as u64 * self.geometry.pages_per_block as u64 + addr.page as u64) as usize)
    }
}

impl FlashDriver for SimFlash {
    fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    fn page_read(&self, addr: PageAddr, buf: &mut [u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let index = match self.page_index(addr) {
            Some(index) if buf.len() <= self.geometry.page_size => index,
            _ => {
                inner.stats.faults += 1;
                return Err(StoreError::InvalidAddress {
                    block: addr.block,
                    page: addr.page,
                });
            }
        };
        inner.stats.page_reads += 1;
        match &inner.pages[index] {
            Some(data) => buf.copy_from_slice(&data[..buf.len()]),
            None => buf.fill(0xFF),
        }
        Ok(())
    }

    fn page_write(&self, addr: PageAddr, data: &[u8]) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        let index = match self.page_index(addr) {
            Some(index) if data.len() <= self.geometry.page_size => index,
            _ => {
                inner.stats.faults += 1;
                return Err(StoreError::InvalidAddress {
                    block: addr.block,
                    page: addr.page,
                });
            }
        };
        if inner.write_faults.contains(&(addr.block, addr.page)) {
            inner.stats.faults += 1;
            return Err(StoreError::DriverFault {
                op: "write",
                block: addr.block,
                page: addr.page,
            });
        }
        if inner.pages[index].is_some() {
            // NAND cannot reprogram a page within the same erase cycle
            inner.stats.faults += 1;
            return Err(StoreError::DriverFault {
                op: "write",
                block: addr.block,
                page: addr.page,
            });
        }
        let mut page = vec![0xFF; self.geometry.page_size];
        page[..data.len()].copy_from_slice(data);
        inner.pages[index] = Some(page);
        inner.stats.page_writes += 1;
        Ok(())
    }

    fn block_erase(&self, block: u32) -> StoreResult<()> {
        let mut inner = self.inner.lock();
        if block >= self.geometry.num_blocks || inner.erase_faults.contains(&block) {
            inner.stats.faults += 1;
            return Err(StoreError::DriverFault {
                op: "erase",
                block,
                page: 0,
            });
        }
        let start = (block as u64 * self.geometry.pages_per_block as u64) as usize;
        let end = start + self.geometry.pages_per_block as usize;
        for page in &mut inner.pages[start..end] {
            *page = None;
        }
        inner.stats.block_erases += 1;
        debug!(block, "simulated block erase");
        Ok(())
    }

    fn is_bad(&self, block: u32) -> bool {
        self.inner.lock().bad.contains(&block)
    }

    fn phys_block(&self, block: u32) -> u32 {
        block
    }
}
