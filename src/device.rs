//! Block device interface

use core::any::Any;
use core::marker::{Send, Sync};
use core::result::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceErr {
    ReadError,
    WriteError,
}

/// The sector-addressed storage a volume is mounted on.
///
/// The driver only ever issues whole-sector transfers through the block
/// cache; a device is free to back this with anything from an SD card
/// to a plain file.
pub trait BlockDevice: Send + Sync + Any {
    /// Read blocks from the device.
    ///
    /// - `offset` must be a multiple of BLOCK_SIZE
    /// - block_cnt = buf.len() / BLOCK_SIZE
    fn read_blocks(
        &self,
        buf: &mut [u8],
        offset: usize,
        _block_cnt: usize,
    ) -> Result<(), DeviceErr>;

    /// Write blocks back to the device.
    ///
    /// - buf.len() must be a multiple of BLOCK_SIZE
    /// - `offset` must be a multiple of BLOCK_SIZE
    /// - block_cnt = buf.len() / BLOCK_SIZE
    fn write_blocks(&self, buf: &[u8], offset: usize, _block_cnt: usize) -> Result<(), DeviceErr>;
}
