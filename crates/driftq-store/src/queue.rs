//! Public queue API: initialization, store lifecycle, and the
//! enqueue/dequeue/retrieve/release/relinquish operations.
//!
//! A [`FlashStore`] owns the driver, the block registry, and the store
//! table. Every operation that touches device or registry state serializes
//! on one process-wide lock, matching the single-device contention model.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::addr::{PageAddr, Sid};
use crate::driver::{FlashDriver, FlashGeometry, MAX_PAGES_PER_BLOCK};
use crate::error::{StoreError, StoreResult};
use crate::object::{self, Object, ObjectHeader, HEADER_SIZE, OBJECT_SYNC};
use crate::paging;
use crate::registry::{BlockRegistry, FlashStats};
use crate::store::{StoreAttributes, StoreSlot, MAX_STORES};

/// Initialization mode for [`FlashStore::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitMode {
    /// Reclaim every block on the device, rebuilding the free list from
    /// scratch. Mandatory on first use.
    Format,
    /// Reserved. Recovery of a previously written device is not
    /// implemented: both lists are left empty and any queue contents from
    /// before the restart are lost.
    Recover,
}

/// Handle naming a store slot returned by [`FlashStore::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StoreHandle(pub u32);

struct DeviceState {
    registry: BlockRegistry,
    stores: Vec<Option<StoreSlot>>,
}

impl DeviceState {
    fn slot_mut(&mut self, handle: StoreHandle) -> StoreResult<&mut StoreSlot> {
        self.stores
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StoreError::InvalidHandle)
    }
}

/// A multiplexed set of persistent queues sharing one flash device.
pub struct FlashStore<D: FlashDriver> {
    driver: D,
    geometry: FlashGeometry,
    reclaimed: usize,
    state: Mutex<DeviceState>,
}

impl<D: FlashDriver> FlashStore<D> {
    /// Initializes the store over the given driver.
    ///
    /// `Format` reclaims every block, classifying each as free or bad; the
    /// number of blocks reclaimed as free is available from
    /// [`reclaimed_blocks`](Self::reclaimed_blocks). Fails when the
    /// device geometry cannot be represented.
    pub fn init(driver: D, mode: InitMode) -> StoreResult<Self> {
        let geometry = driver.geometry();
        if geometry.num_blocks == 0
            || geometry.num_blocks >= crate::addr::INVALID_BLOCK
            || geometry.pages_per_block == 0
            || geometry.pages_per_block > MAX_PAGES_PER_BLOCK
            || geometry.page_size < HEADER_SIZE
        {
            return Err(StoreError::failed(format!(
                "unsupported geometry: {} blocks x {} pages x {} bytes",
                geometry.num_blocks, geometry.pages_per_block, geometry.page_size
            )));
        }

        let mut registry = BlockRegistry::new(geometry);
        let mut reclaimed = 0;
        match mode {
            InitMode::Format => {
                for block in 0..geometry.num_blocks {
                    if registry.reclaim(&driver, block) {
                        reclaimed += 1;
                    }
                }
            }
            InitMode::Recover => {
                // Recovery scan not implemented: the queue starts cold.
            }
        }
        registry.used_blocks = 0;
        registry.error_count = 0;

        info!(
            blocks = geometry.num_blocks,
            pages_per_block = geometry.pages_per_block,
            page_size = geometry.page_size,
            reclaimed,
            "flash store initialized"
        );

        Ok(Self {
            driver,
            geometry,
            reclaimed,
            state: Mutex::new(DeviceState {
                registry,
                stores: (0..MAX_STORES).map(|_| None).collect(),
            }),
        })
    }

    /// Number of blocks reclaimed as free during a `Format` init.
    pub fn reclaimed_blocks(&self) -> usize {
        self.reclaimed
    }

    /// The geometry captured from the driver at init.
    pub fn geometry(&self) -> FlashGeometry {
        self.geometry
    }

    /// Snapshot of the device counters. Optionally logs them (including an
    /// enumeration of the bad list) and optionally resets the error count.
    pub fn stats(&self, log_stats: bool, reset_stats: bool) -> FlashStats {
        let mut state = self.state.lock();
        let stats = state.registry.stats();

        if log_stats {
            debug!(
                free = stats.free_blocks,
                used = stats.used_blocks,
                bad = stats.bad_blocks,
                errors = stats.error_count,
                "flash store stats"
            );
            for block in state.registry.bad_block_list() {
                debug!(block = self.driver.phys_block(block), "bad block");
            }
        }

        if reset_stats {
            state.registry.error_count = 0;
        }

        stats
    }

    /// Creates a store, returning its handle. Uses the first free slot;
    /// default attributes allow one page of payload. Rejects attributes
    /// whose payload bound is smaller than a page.
    pub fn create(&self, attributes: Option<StoreAttributes>) -> StoreResult<StoreHandle> {
        let mut state = self.state.lock();

        let mut attributes = attributes.unwrap_or(StoreAttributes {
            max_data_size: self.geometry.page_size,
        });
        if attributes.max_data_size < self.geometry.page_size {
            return Err(StoreError::InvalidHandle);
        }
        // From here on the bound covers the whole framed object.
        attributes.max_data_size += HEADER_SIZE;

        for (index, slot) in state.stores.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(StoreSlot::new(attributes));
                debug!(handle = index, max_data_size = attributes.max_data_size, "store created");
                return Ok(StoreHandle(index as u32));
            }
        }

        Err(StoreError::InvalidHandle)
    }

    /// Destroys a store, releasing its staging buffers.
    ///
    /// Blocks still referenced by the store's chain are not reclaimed; the
    /// caller is expected to drain the queue first.
    pub fn destroy(&self, handle: StoreHandle) -> StoreResult<()> {
        let mut state = self.state.lock();
        let slot = state
            .stores
            .get_mut(handle.0 as usize)
            .ok_or(StoreError::InvalidHandle)?;
        if slot.is_none() {
            return Err(StoreError::InvalidHandle);
        }
        *slot = None;
        Ok(())
    }

    /// Enqueues an object assembled from up to two payload slices, returning
    /// its SID. The timeout is accepted for interface stability and ignored;
    /// the write never blocks beyond the driver.
    pub fn enqueue(
        &self,
        handle: StoreHandle,
        d1: &[u8],
        d2: &[u8],
        _timeout: u32,
    ) -> StoreResult<Sid> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let slot = state
            .stores
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StoreError::InvalidHandle)?;

        if !slot.write_addr.is_valid() {
            slot.write_addr = PageAddr::new(state.registry.allocate(&self.driver)?, 0);
        }
        if !slot.read_addr.is_valid() {
            slot.read_addr = slot.write_addr;
        }

        let sid = object::object_write(&mut state.registry, &self.driver, slot, handle.0, d1, d2)?;
        slot.object_count += 1;
        Ok(sid)
    }

    /// Dequeues the next object in rough FIFO order.
    ///
    /// Returns [`StoreError::Timeout`] immediately when the queue is empty
    /// (the timeout argument is ignored). Relinquished objects are stepped
    /// over. On a read or validation failure the read cursor is scanned
    /// forward to the next object boundary so later dequeues can make
    /// progress, and the failure is still surfaced.
    ///
    /// A successful dequeue checks the object out of the store's read
    /// stage: the caller must [`release`](Self::release) it before the next
    /// dequeue or retrieve.
    pub fn dequeue(&self, handle: StoreHandle, _timeout: u32) -> StoreResult<Object> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let slot = state
            .stores
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StoreError::InvalidHandle)?;

        loop {
            if slot.read_addr == slot.write_addr {
                return Err(StoreError::Timeout);
            }

            // Step over objects relinquished before they were dequeued.
            if !state.registry.blocks[slot.read_addr.block as usize].page_in_use(slot.read_addr.page)
            {
                let mut probe = slot.read_addr;
                let mut header_buf = [0u8; HEADER_SIZE];
                paging::data_read(&mut state.registry, &self.driver, &mut probe, &mut header_buf)?;
                let header = ObjectHeader::decode(&header_buf)?;
                let expected =
                    Sid::from_addr(slot.read_addr, self.geometry.pages_per_block);
                if header.sync == OBJECT_SYNC && header.sid == expected {
                    debug!(sid = %header.sid, "skipping relinquished object");
                    paging::advance_pages(
                        &state.registry,
                        &mut slot.read_addr,
                        header.occupied_pages(self.geometry.page_size),
                    )?;
                    continue;
                }
                // A cleared page that is not an object start falls through
                // to the normal failure path below.
            }

            let mut addr = slot.read_addr;
            let result =
                object::object_read(&mut state.registry, &self.driver, slot, handle.0, &mut addr);
            slot.read_addr = addr;

            return match result {
                Ok(object) => Ok(object),
                Err(err) => {
                    // Scan to the next object boundary, but still report
                    // the failure so the caller sees the loss.
                    warn!(handle = handle.0, %err, "dequeue failed, resynchronizing read cursor");
                    let _ = object::object_scan(
                        &mut state.registry,
                        &self.driver,
                        &mut slot.read_addr,
                    );
                    Err(err)
                }
            };
        }
    }

    /// Reads the object named by `sid` without moving the store's read
    /// cursor. The object is checked out of the read stage exactly as with
    /// [`dequeue`](Self::dequeue). The timeout argument is ignored.
    pub fn retrieve(
        &self,
        handle: StoreHandle,
        sid: Sid,
        _timeout: u32,
    ) -> StoreResult<Object> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        let slot = state
            .stores
            .get_mut(handle.0 as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(StoreError::InvalidHandle)?;

        let mut addr = sid.to_addr(self.geometry.pages_per_block);
        object::object_read(&mut state.registry, &self.driver, slot, handle.0, &mut addr)
    }

    /// Returns a checked-out object to the store. The SID must match the
    /// object currently held in the read stage; on mismatch the stage
    /// stays checked out.
    pub fn release(&self, handle: StoreHandle, sid: Sid) -> StoreResult<()> {
        let mut state = self.state.lock();
        let slot = state.slot_mut(handle)?;

        let header = ObjectHeader::decode(&slot.read_stage[..HEADER_SIZE])?;
        if header.sid != sid {
            return Err(StoreError::failed(format!(
                "release sid mismatch: stage holds {}, requested {}",
                header.sid, sid
            )));
        }

        slot.stage_locked = false;
        Ok(())
    }

    /// Relinquishes the object named by `sid`, marking its pages deleted
    /// and reclaiming any block this leaves fully deleted. Valid whether or
    /// not the object was ever dequeued.
    pub fn relinquish(&self, handle: StoreHandle, sid: Sid) -> StoreResult<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if state
            .stores
            .get(handle.0 as usize)
            .and_then(|slot| slot.as_ref())
            .is_none()
        {
            return Err(StoreError::InvalidHandle);
        }

        object::object_delete(&mut state.registry, &self.driver, sid)?;

        if let Some(Some(slot)) = state.stores.get_mut(handle.0 as usize) {
            slot.object_count = slot.object_count.saturating_sub(1);
        }
        Ok(())
    }

    /// Number of objects currently stored: successful enqueues minus
    /// successful relinquishes.
    pub fn object_count(&self, handle: StoreHandle) -> StoreResult<u64> {
        let mut state = self.state.lock();
        Ok(state.slot_mut(handle)?.object_count)
    }
}
