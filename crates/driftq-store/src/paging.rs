//! Page-level engine: walks page addresses through the block-linked chain
//! topology, growing the chain on writes and recovering locally from
//! page-write failures.

use tracing::warn;

use crate::addr::{PageAddr, INVALID_BLOCK};
use crate::driver::FlashDriver;
use crate::error::{StoreError, StoreResult};
use crate::registry::BlockRegistry;

fn check_addr(registry: &BlockRegistry, addr: PageAddr) -> StoreResult<()> {
    if addr.block >= registry.geometry.num_blocks
        || addr.page >= registry.blocks[addr.block as usize].max_pages
    {
        return Err(StoreError::InvalidAddress {
            block: addr.block,
            page: addr.page,
        });
    }
    Ok(())
}

/// Writes `data` page by page starting at `addr`, leaving `addr` one page
/// past the final byte written.
///
/// Filling the last usable page of a block allocates a fresh block and
/// chains it in, so the cursor always lands on a writable page. A failed
/// page write truncates the current block (or reclaims it when nothing was
/// written to it yet), splices in a replacement block, and retries the same
/// bytes there.
pub(crate) fn data_write<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    addr: &mut PageAddr,
    data: &[u8],
) -> StoreResult<()> {
    check_addr(registry, *addr)?;

    let page_size = registry.geometry.page_size;
    let mut index = 0;

    while index < data.len() {
        let chunk = (data.len() - index).min(page_size);
        match driver.page_write(*addr, &data[index..index + chunk]) {
            Ok(()) => {
                index += chunk;
            }
            Err(err) => {
                registry.error_count += 1;
                warn!(
                    block = driver.phys_block(addr.block),
                    page = addr.page,
                    %err,
                    "page write failed, moving to a fresh block"
                );

                let failed = addr.block as usize;
                let replacement;
                if addr.page > 0 {
                    // The written prefix stays readable: cap the block at
                    // the failing page and chain the replacement after it.
                    registry.blocks[failed].max_pages = addr.page;
                    replacement = registry.allocate(driver)?;
                    registry.blocks[failed].next = replacement;
                    registry.blocks[replacement as usize].prev = addr.block;
                } else {
                    // Nothing readable in this block: reclaim it and bridge
                    // its previous neighbor straight to the replacement.
                    let prev = registry.blocks[failed].prev;
                    registry.reclaim(driver, addr.block);
                    replacement = registry.allocate(driver)?;
                    if prev != INVALID_BLOCK {
                        registry.blocks[prev as usize].next = replacement;
                    }
                    registry.blocks[replacement as usize].prev = prev;
                }

                *addr = PageAddr::new(replacement, 0);
                continue;
            }
        }

        // Data never starts mid-page, so the cursor always advances a whole
        // page; filling the block chains in the next one eagerly.
        addr.page += 1;
        if addr.page == registry.blocks[addr.block as usize].max_pages {
            let next = registry.allocate(driver)?;
            registry.blocks[addr.block as usize].next = next;
            registry.blocks[next as usize].prev = addr.block;
            *addr = PageAddr::new(next, 0);
        }
    }

    Ok(())
}

/// Reads `buf.len()` bytes page by page starting at `addr`, following the
/// chain's forward links, and leaves `addr` one page past the final byte
/// read. Running off the end of the chain mid-read is a hard error; driver
/// read failures are counted and surfaced.
pub(crate) fn data_read<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    addr: &mut PageAddr,
    buf: &mut [u8],
) -> StoreResult<()> {
    check_addr(registry, *addr)?;

    let page_size = registry.geometry.page_size;
    let mut index = 0;

    while index < buf.len() {
        let chunk = (buf.len() - index).min(page_size);
        if let Err(err) = driver.page_read(*addr, &mut buf[index..index + chunk]) {
            registry.error_count += 1;
            warn!(
                block = driver.phys_block(addr.block),
                page = addr.page,
                %err,
                "page read failed"
            );
            return Err(err);
        }
        index += chunk;
        addr.page += 1;

        if addr.page == registry.blocks[addr.block as usize].max_pages {
            let next = registry.blocks[addr.block as usize].next;
            if next == INVALID_BLOCK {
                return Err(StoreError::failed(format!(
                    "no next block in middle of read at block {}",
                    driver.phys_block(addr.block)
                )));
            }
            *addr = PageAddr::new(next, 0);
        }
    }

    Ok(())
}

/// Advances `addr` by `pages` pages along the chain without touching the
/// device. Used to step over relinquished objects.
pub(crate) fn advance_pages(
    registry: &BlockRegistry,
    addr: &mut PageAddr,
    pages: u32,
) -> StoreResult<()> {
    for _ in 0..pages {
        addr.page += 1;
        if addr.page == registry.blocks[addr.block as usize].max_pages {
            let next = registry.blocks[addr.block as usize].next;
            if next == INVALID_BLOCK {
                return Err(StoreError::failed(format!(
                    "no next block while skipping deleted pages at block {}",
                    addr.block
                )));
            }
            *addr = PageAddr::new(next, 0);
        }
    }
    Ok(())
}
