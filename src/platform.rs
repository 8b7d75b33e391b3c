use embedded_storage::nor_flash::NorFlash;

/// Everything the store needs from the target: NOR flash access plus the
/// board's CRC-8 primitive. See README.md for an example implementation.
///
/// The flash implementation is expected to pair any unlock/lock sequence
/// inside each `erase`/`write` call; the store never keeps the flash
/// unlocked across operations.
pub trait Platform: Crc + NorFlash {}

impl<T: Crc + NorFlash> Platform for T {}

pub type FnCrc8 = fn(init: u8, data: &[u8]) -> u8;

/// Streaming CRC-8 over arbitrary byte spans. The checksum is resumed by
/// passing the previous value as `init` (seeded with zero), and appending a
/// span's checksum to the span makes the whole thing check to zero. Both the
/// writer and the scanner rely on that, so the polynomial must be plain:
/// no reflection, no output XOR.
pub trait Crc {
    fn crc8(init: u8, data: &[u8]) -> u8;
}

impl<T: Crc> Crc for &mut T {
    fn crc8(init: u8, data: &[u8]) -> u8 {
        T::crc8(init, data)
    }
}
