//! Store table records: attributes, cursors, and staging buffers.

use serde::{Deserialize, Serialize};

use crate::addr::PageAddr;

/// Number of store slots multiplexed over one device.
pub const MAX_STORES: usize = 16;

/// User-supplied store attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreAttributes {
    /// Largest object payload the store accepts, in bytes. Must be at
    /// least one page.
    pub max_data_size: usize,
}

/// One logical queue over the shared device.
///
/// `attributes.max_data_size` here is the total staging bound: the
/// user-supplied payload limit plus the framing header, fixed at creation.
pub(crate) struct StoreSlot {
    pub attributes: StoreAttributes,
    pub write_addr: PageAddr,
    pub read_addr: PageAddr,
    /// Holding buffer where an object is framed before the write.
    pub write_stage: Vec<u8>,
    /// Lockable buffer holding the most recently read object.
    pub read_stage: Vec<u8>,
    pub stage_locked: bool,
    pub object_count: u64,
}

impl StoreSlot {
    /// Creates a slot with unset cursors and zeroed stages sized to the
    /// (already header-adjusted) attribute bound.
    pub fn new(attributes: StoreAttributes) -> Self {
        Self {
            attributes,
            write_addr: PageAddr::invalid(),
            read_addr: PageAddr::invalid(),
            write_stage: vec![0; attributes.max_data_size],
            read_stage: vec![0; attributes.max_data_size],
            stage_locked: false,
            object_count: 0,
        }
    }
}
