//! On-flash object framing: the header codec, validation, and the
//! object-level write, read, scan, and delete operations.
//!
//! Every object starts on a page boundary with a fixed little-endian
//! header, followed immediately by the payload. The header's sync magic is
//! what `object_scan` keys on to resynchronize a read cursor after a
//! failed dequeue.

use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, warn};

use crate::addr::{PageAddr, Sid, INVALID_BLOCK};
use crate::driver::FlashDriver;
use crate::error::{StoreError, StoreResult};
use crate::paging;
use crate::registry::BlockRegistry;
use crate::store::StoreSlot;

/// Sync magic marking the first page of every object: "BP FLASH".
pub const OBJECT_SYNC: u64 = 0x4250_2046_4C41_5348;

/// Bytes of framing prepended to every object payload.
pub const HEADER_SIZE: usize = 32;

/// Decoded on-flash object header.
///
/// Layout, all integers little-endian:
/// bytes 0..8 sync, 8..16 timestamp, 16..20 handle, 20..24 payload size,
/// 24..32 SID echo.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    /// Sync magic; must equal [`OBJECT_SYNC`].
    pub sync: u64,
    /// Wall-clock seconds since the epoch at enqueue.
    pub timestamp: u64,
    /// Store handle index recorded at enqueue.
    pub handle: u32,
    /// Payload length in bytes, excluding the header.
    pub size: u32,
    /// SID echo of the object's first page.
    pub sid: Sid,
}

impl ObjectHeader {
    /// Encodes the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> StoreResult<()> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::failed("header buffer too small"));
        }
        buf[0..8].copy_from_slice(&self.sync.to_le_bytes());
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[16..20].copy_from_slice(&self.handle.to_le_bytes());
        buf[20..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.sid.raw().to_le_bytes());
        Ok(())
    }

    /// Decodes a header from the first [`HEADER_SIZE`] bytes of `buf`.
    /// Decoding does not validate; see the read path for the checks.
    pub fn decode(buf: &[u8]) -> StoreResult<Self> {
        if buf.len() < HEADER_SIZE {
            return Err(StoreError::failed("header buffer too small"));
        }
        let word = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[range]);
            u64::from_le_bytes(bytes)
        };
        let half = |range: std::ops::Range<usize>| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&buf[range]);
            u32::from_le_bytes(bytes)
        };
        Ok(Self {
            sync: word(0..8),
            timestamp: word(8..16),
            handle: half(16..20),
            size: half(20..24),
            sid: Sid::from_raw(word(24..32)),
        })
    }

    /// Pages the framed object occupies on flash.
    pub fn occupied_pages(&self, page_size: usize) -> u32 {
        ((HEADER_SIZE + self.size as usize).div_ceil(page_size)) as u32
    }
}

/// An object checked out of a store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Object {
    /// Store handle index recorded at enqueue.
    pub handle: u32,
    /// Storage identifier naming the object on the device.
    pub sid: Sid,
    /// Wall-clock seconds since the epoch at enqueue.
    pub timestamp: u64,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Object {
    /// Payload length in bytes.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Frames `d1 ++ d2` in the store's write stage and writes it at the
/// store's write cursor. Fails up front when the free list cannot hold the
/// object or the store's attribute bound is exceeded.
pub(crate) fn object_write<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    slot: &mut StoreSlot,
    handle: u32,
    d1: &[u8],
    d2: &[u8],
) -> StoreResult<Sid> {
    let needed = HEADER_SIZE + d1.len() + d2.len();
    let available = registry.free_bytes();
    if needed as u64 > available || needed > slot.attributes.max_data_size {
        debug!(needed, available, "insufficient room for object");
        return Err(StoreError::StoreFull {
            needed: needed as u64,
            available,
        });
    }

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let sid = Sid::from_addr(slot.write_addr, registry.geometry.pages_per_block);

    let header = ObjectHeader {
        sync: OBJECT_SYNC,
        timestamp,
        handle,
        size: (d1.len() + d2.len()) as u32,
        sid,
    };
    header.encode(&mut slot.write_stage[..HEADER_SIZE])?;
    slot.write_stage[HEADER_SIZE..HEADER_SIZE + d1.len()].copy_from_slice(d1);
    slot.write_stage[HEADER_SIZE + d1.len()..needed].copy_from_slice(d2);

    paging::data_write(
        registry,
        driver,
        &mut slot.write_addr,
        &slot.write_stage[..needed],
    )?;

    Ok(sid)
}

/// Reads and validates one object at `addr` into the store's read stage,
/// locking the stage on success. Refuses while a previous checkout is
/// still outstanding. `addr` is advanced past the pages read, including on
/// validation failure, so the caller can resynchronize from there.
pub(crate) fn object_read<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    slot: &mut StoreSlot,
    handle: u32,
    addr: &mut PageAddr,
) -> StoreResult<Object> {
    if slot.stage_locked {
        return Err(StoreError::failed(
            "object read cannot proceed while the stage is checked out",
        ));
    }

    let page_size = registry.geometry.page_size;
    paging::data_read(registry, driver, addr, &mut slot.read_stage[..page_size])?;

    let header = ObjectHeader::decode(&slot.read_stage[..HEADER_SIZE])?;
    if header.size as usize > slot.attributes.max_data_size
        || header.handle != handle
        || header.sync != OBJECT_SYNC
    {
        debug!(
            size = header.size,
            header_handle = header.handle,
            expected_handle = handle,
            sync_ok = (header.sync == OBJECT_SYNC),
            "object failed validation"
        );
        return Err(StoreError::failed(format!(
            "object at sid {} failed validation",
            header.sid
        )));
    }

    // The first page already carried the start of the payload.
    let bytes_read = page_size - HEADER_SIZE;
    if header.size as usize > bytes_read {
        let remaining = header.size as usize - bytes_read;
        paging::data_read(
            registry,
            driver,
            addr,
            &mut slot.read_stage[page_size..page_size + remaining],
        )?;
    }

    slot.stage_locked = true;
    Ok(Object {
        handle: header.handle,
        sid: header.sid,
        timestamp: header.timestamp,
        data: slot.read_stage[HEADER_SIZE..HEADER_SIZE + header.size as usize].to_vec(),
    })
}

/// Walks `addr` forward one page at a time until a page starts with the
/// sync magic, leaving `addr` on that page. Fails when the chain runs out
/// first.
pub(crate) fn object_scan<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    addr: &mut PageAddr,
) -> StoreResult<()> {
    let mut header_buf = [0u8; HEADER_SIZE];

    while addr.block != INVALID_BLOCK {
        let mut probe = *addr;
        if paging::data_read(registry, driver, &mut probe, &mut header_buf).is_ok() {
            let header = ObjectHeader::decode(&header_buf)?;
            if header.sync == OBJECT_SYNC {
                return Ok(());
            }
        }

        addr.page += 1;
        if addr.page >= registry.blocks[addr.block as usize].max_pages {
            addr.block = registry.blocks[addr.block as usize].next;
            addr.page = 0;
        }
    }

    Err(StoreError::failed(
        "scan exhausted the chain without finding an object",
    ))
}

/// Marks every page of the object named by `sid` as deleted, reclaiming
/// any block whose pages are all deleted. Deletion is bookkeeping only; no
/// page is rewritten within the erase cycle.
pub(crate) fn object_delete<D: FlashDriver>(
    registry: &mut BlockRegistry,
    driver: &D,
    sid: Sid,
) -> StoreResult<()> {
    let geometry = registry.geometry;
    let mut addr = sid.to_addr(geometry.pages_per_block);
    if addr.block >= geometry.num_blocks
        || addr.page >= registry.blocks[addr.block as usize].max_pages
    {
        return Err(StoreError::InvalidAddress {
            block: addr.block,
            page: addr.page,
        });
    }

    let mut header_buf = [0u8; HEADER_SIZE];
    let mut header_addr = addr;
    paging::data_read(registry, driver, &mut header_addr, &mut header_buf)?;
    let header = ObjectHeader::decode(&header_buf)?;
    if header.sid != sid {
        return Err(StoreError::failed(format!(
            "delete sid mismatch: header names {}, requested {}",
            header.sid, sid
        )));
    }

    let mut current_block = INVALID_BLOCK;
    let mut deleted_in_block = 0u32;
    let mut bytes_left = HEADER_SIZE + header.size as usize;

    while bytes_left > 0 {
        if current_block != addr.block {
            current_block = addr.block;
            deleted_in_block =
                registry.blocks[current_block as usize].deleted_pages(geometry.pages_per_block);
        }

        if registry.blocks[addr.block as usize].clear_page(addr.page) {
            deleted_in_block += 1;
        }

        bytes_left -= bytes_left.min(geometry.page_size);
        addr.page += 1;
        if addr.page == registry.blocks[addr.block as usize].max_pages {
            let next = registry.blocks[addr.block as usize].next;
            if next == INVALID_BLOCK && bytes_left > 0 {
                return Err(StoreError::failed(format!(
                    "no next block in middle of delete at block {}",
                    driver.phys_block(addr.block)
                )));
            }
            if next != INVALID_BLOCK {
                addr = PageAddr::new(next, 0);
            }
        }

        if deleted_in_block >= registry.blocks[current_block as usize].max_pages {
            if bytes_left > 0 {
                return Err(StoreError::failed(format!(
                    "reclaiming block {} which still contains undeleted data",
                    driver.phys_block(current_block)
                )));
            }

            // Splice the emptied block out of the chain before resetting it.
            let prev = registry.blocks[current_block as usize].prev;
            let next = registry.blocks[current_block as usize].next;
            if prev != INVALID_BLOCK {
                registry.blocks[prev as usize].next = next;
            }
            if next != INVALID_BLOCK {
                registry.blocks[next as usize].prev = prev;
            }

            if !registry.reclaim(driver, current_block) {
                warn!(
                    block = driver.phys_block(current_block),
                    "fully deleted block reports bad on reclaim"
                );
            }
        }
    }

    Ok(())
}
