//! The block device presented in front of the IDB store: a small partitioned disk whose only
//! partition is the IDB.
//!
//! ```text
//! LBA 0           protective MBR
//! LBA 1           primary GPT header
//! LBA 2           partition entry array
//! LBA 64..L-33    data window: the 512 sectors of the IDB buffer
//! LBA L-33        backup partition entry array
//! LBA L-1         backup GPT header
//! ```
//!
//! Every other block reads as zeros.

mod device;
pub mod gpt;

pub use device::{BlockInfo, RkmtdDevice};
pub use gpt::{Guid, SyntheticPartitionTable};

use crate::idb::IDB_SECTORS;

/// Size of a logical block
pub const BLOCK_SIZE: usize = 512;

pub const GPT_HEADER_LBA: u64 = 1;
pub const GPT_ENTRIES_LBA: u64 = 2;

/// First block of the data window (and of the partition)
pub const DATA_START_LBA: u64 = 64;

/// Total logical blocks of the device ("L")
pub const TOTAL_BLOCKS: u64 = DATA_START_LBA + IDB_SECTORS as u64 + gpt::GPT_BACKUP_BLOCKS;

/// A device addressed in fixed-size logical blocks
///
/// Transfers return how many blocks were transferred; zero means the request was rejected.
pub trait BlockDevice {
    /// How many bytes per block?
    fn block_size(&self) -> usize;

    /// How many blocks in this device?
    fn block_count(&self) -> u64;

    /// Read `count` blocks starting at `start` into the front of `dst`
    fn read_blocks(&mut self, start: u64, count: u64, dst: &mut [u8]) -> u64;

    /// Write `count` blocks starting at `start` from the front of `src`
    fn write_blocks(&mut self, start: u64, count: u64, src: &[u8]) -> u64;
}

#[test]
fn test_layout() {
    assert_eq!(TOTAL_BLOCKS, 609);
    assert_eq!(TOTAL_BLOCKS - gpt::GPT_BACKUP_BLOCKS - DATA_START_LBA, IDB_SECTORS as u64);
}
