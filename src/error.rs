use thiserror::Error;

/// Status codes returned by the store. Marked as non-exhaustive to allow for
/// future additions without breaking the API. Callers typically only need to
/// distinguish `Flash` and `Crc` (worth a retry or a format) from the static
/// argument errors.
#[derive(Error, Debug, PartialEq, Eq, Copy, Clone)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// The region offset has to be aligned to the flash page size.
    #[error("region offset not page aligned")]
    InvalidRegionOffset,

    /// The store geometry is unusable: fewer than two pages, a region that
    /// does not fit the device, no record slots, or a maximum payload that
    /// cannot leave an erased word at the end of a page.
    #[error("invalid store geometry")]
    InvalidConfig,

    /// The page sequence layout is corrupted: duplicate sequence numbers,
    /// a broken sequence chain, or a spare page that is not erased.
    #[error("page layout corrupted")]
    Layout,

    /// The store has not been initialized and was not allowed to format.
    #[error("store not initialized")]
    NotReady,

    /// The payload size is zero or exceeds the configured maximum.
    #[error("payload size out of range")]
    PayloadSize,

    /// The record id is outside the configured id space.
    #[error("record id out of range")]
    InvalidId,

    /// The flash adapter reported a hardware failure. On-flash state may be
    /// partially written; the next scan reports the torn record as `Crc`.
    #[error("internal flash error")]
    Flash,

    /// A checksum mismatch on write-back verification or during a scan.
    #[error("checksum mismatch")]
    Crc,

    /// Structurally impossible on-flash content, e.g. a record id outside
    /// the id space or a record claiming to cross a page boundary.
    #[error("invalid on-flash data")]
    Data,
}
