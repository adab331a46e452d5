//! Block registry: per-block control records and the free/bad lists.
//!
//! The registry is a dense array of control records indexed by logical
//! block number. The free and bad lists are intrusive doubly-linked lists
//! threaded through that array by index, with an invalid-index sentinel as
//! the terminator. Used blocks are not listed here; they form per-store
//! chains reachable from each store's write cursor.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::addr::INVALID_BLOCK;
use crate::driver::{FlashDriver, FlashGeometry, MAX_PAGES_PER_BLOCK};
use crate::error::{StoreError, StoreResult};

/// Bytes in the per-block page-use bitmap.
const PAGE_USE_BYTES: usize = (MAX_PAGES_PER_BLOCK as usize) / 8;

/// Per-block control record.
#[derive(Debug, Clone)]
pub(crate) struct BlockControl {
    /// Forward link in whichever list or chain owns the block.
    pub next: u32,
    /// Backward link; `INVALID_BLOCK` when detached or at the head.
    pub prev: u32,
    /// One past the highest usable page index. Equal to `pages_per_block`
    /// for healthy blocks; reduced to the failing page on a mid-block
    /// write failure.
    pub max_pages: u32,
    /// Page-use bitmap, MSB first. Set means live or unprogrammed; clear
    /// means deleted.
    pub page_use: [u8; PAGE_USE_BYTES],
}

impl BlockControl {
    fn detached(pages_per_block: u32) -> Self {
        Self {
            next: INVALID_BLOCK,
            prev: INVALID_BLOCK,
            max_pages: pages_per_block,
            page_use: [0xFF; PAGE_USE_BYTES],
        }
    }

    /// True when the page's use bit is still set.
    pub fn page_in_use(&self, page: u32) -> bool {
        let byte = (page / 8) as usize;
        let bit = 0x80u8 >> (page % 8);
        self.page_use[byte] & bit != 0
    }

    /// Clears the page's use bit. Returns true when the bit was set.
    pub fn clear_page(&mut self, page: u32) -> bool {
        let byte = (page / 8) as usize;
        let bit = 0x80u8 >> (page % 8);
        let was_set = self.page_use[byte] & bit != 0;
        self.page_use[byte] &= !bit;
        was_set
    }

    /// Number of deleted pages in `[0, pages_per_block)`.
    pub fn deleted_pages(&self, pages_per_block: u32) -> u32 {
        (0..pages_per_block).filter(|&p| !self.page_in_use(p)).count() as u32
    }
}

/// Intrusive list descriptor threaded through the registry.
///
/// `head` is the dequeue end, `tail` the enqueue end.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockList {
    pub head: u32,
    pub tail: u32,
    pub count: u32,
}

impl BlockList {
    fn empty() -> Self {
        Self {
            head: INVALID_BLOCK,
            tail: INVALID_BLOCK,
            count: 0,
        }
    }
}

/// Aggregate device statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlashStats {
    /// Blocks on the free list.
    pub free_blocks: u32,
    /// Blocks owned by store chains.
    pub used_blocks: u32,
    /// Blocks on the bad list.
    pub bad_blocks: u32,
    /// Driver I/O failures observed since init or the last reset.
    pub error_count: u64,
}

/// Registry of every block on the device.
pub(crate) struct BlockRegistry {
    pub geometry: FlashGeometry,
    pub blocks: Vec<BlockControl>,
    pub free: BlockList,
    pub bad: BlockList,
    pub used_blocks: u32,
    pub error_count: u64,
}

impl BlockRegistry {
    /// Creates a registry with every block detached from both lists.
    pub fn new(geometry: FlashGeometry) -> Self {
        Self {
            geometry,
            blocks: (0..geometry.num_blocks)
                .map(|_| BlockControl::detached(geometry.pages_per_block))
                .collect(),
            free: BlockList::empty(),
            bad: BlockList::empty(),
            used_blocks: 0,
            error_count: 0,
        }
    }

    /// Appends a block at the enqueue end of a list.
    fn push(list: &mut BlockList, blocks: &mut [BlockControl], block: u32) {
        if list.head == INVALID_BLOCK {
            list.head = block;
        } else {
            blocks[list.tail as usize].next = block;
        }
        blocks[block as usize].prev = list.tail;
        list.tail = block;
        list.count += 1;
    }

    /// Resets a block's control record and returns it to the free list, or
    /// to the bad list when the driver reports it bad. Returns true when
    /// the block went to the free list.
    ///
    /// The block is not erased here; erase is deferred to allocation so
    /// erase failures are handled in one place.
    pub fn reclaim<D: FlashDriver>(&mut self, driver: &D, block: u32) -> bool {
        let control = &mut self.blocks[block as usize];
        control.next = INVALID_BLOCK;
        control.prev = INVALID_BLOCK;
        control.max_pages = self.geometry.pages_per_block;
        control.page_use = [0xFF; PAGE_USE_BYTES];

        self.used_blocks = self.used_blocks.saturating_sub(1);

        if !driver.is_bad(block) {
            Self::push(&mut self.free, &mut self.blocks, block);
            true
        } else {
            debug!(block = driver.phys_block(block), "reclaimed block is bad");
            Self::push(&mut self.bad, &mut self.blocks, block);
            false
        }
    }

    /// Pops a block from the free list, erasing it lazily. A candidate that
    /// fails to erase is demoted to the bad list and the next free block is
    /// tried. Fails once the free list is exhausted.
    pub fn allocate<D: FlashDriver>(&mut self, driver: &D) -> StoreResult<u32> {
        while self.free.head != INVALID_BLOCK {
            let candidate = self.free.head;
            let next = self.blocks[candidate as usize].next;
            self.free.head = next;
            if next == INVALID_BLOCK {
                self.free.tail = INVALID_BLOCK;
            } else {
                self.blocks[next as usize].prev = INVALID_BLOCK;
            }
            self.free.count -= 1;
            self.blocks[candidate as usize].next = INVALID_BLOCK;
            self.blocks[candidate as usize].prev = INVALID_BLOCK;

            match driver.block_erase(candidate) {
                Ok(()) => {
                    self.used_blocks += 1;
                    debug!(block = driver.phys_block(candidate), "allocated block");
                    return Ok(candidate);
                }
                Err(err) => {
                    self.error_count += 1;
                    warn!(
                        block = driver.phys_block(candidate),
                        %err,
                        "failed to erase block during allocation, marking bad"
                    );
                    Self::push(&mut self.bad, &mut self.blocks, candidate);
                }
            }
        }

        Err(StoreError::failed("no free blocks available"))
    }

    /// Bytes available on the free list.
    pub fn free_bytes(&self) -> u64 {
        self.free.count as u64 * self.geometry.block_bytes()
    }

    /// Snapshot of the list counters.
    pub fn stats(&self) -> FlashStats {
        FlashStats {
            free_blocks: self.free.count,
            used_blocks: self.used_blocks,
            bad_blocks: self.bad.count,
            error_count: self.error_count,
        }
    }

    /// The bad list in list order, for diagnostics.
    pub fn bad_block_list(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.bad.count as usize);
        let mut block = self.bad.head;
        while block != INVALID_BLOCK {
            out.push(block);
            block = self.blocks[block as usize].next;
        }
        out
    }
}
