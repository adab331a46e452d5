//! Error types for the flash store.

use thiserror::Error;

/// Result type alias for flash store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Error variants for flash store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Structural or invariant violation in the store or on the device.
    #[error("store failure: {reason}")]
    FailedStore {
        /// Description of the violation.
        reason: String,
    },

    /// Insufficient free pages to hold the object.
    #[error("store full: needed {needed} bytes, available {available}")]
    StoreFull {
        /// Bytes required for the framed object.
        needed: u64,
        /// Bytes available on the free list.
        available: u64,
    },

    /// No object available to dequeue.
    #[error("no object available")]
    Timeout,

    /// The handle does not name a live store, or no store slot was available.
    #[error("invalid store handle")]
    InvalidHandle,

    /// The address does not fall within the device geometry or the block's
    /// usable page range.
    #[error("invalid flash address {block}.{page}")]
    InvalidAddress {
        /// Logical block number of the offending address.
        block: u32,
        /// Page index of the offending address.
        page: u32,
    },

    /// The driver reported an I/O failure.
    #[error("flash {op} failure at block {block} page {page}")]
    DriverFault {
        /// Which driver primitive failed: "read", "write", or "erase".
        op: &'static str,
        /// Logical block number of the failed operation.
        block: u32,
        /// Page index of the failed operation (0 for erase).
        page: u32,
    },
}

impl StoreError {
    /// Shorthand for a [`StoreError::FailedStore`] with a formatted reason.
    pub(crate) fn failed(reason: impl Into<String>) -> Self {
        StoreError::FailedStore {
            reason: reason.into(),
        }
    }
}
