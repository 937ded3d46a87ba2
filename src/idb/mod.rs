//! This module implements storage of the IDB (Initial Device Block), the Rockchip bootstrap image
//! that the boot ROM loads straight from raw NAND.
//!
//! Several redundant copies of the IDB live in the first eraseblocks of the flash. Each copy
//! looks like this:
//!
//! ```text
//! +- Eraseblock ------------------------------------------------+
//! | Page 0:        header group (obfuscated descriptor sector)  | spare: blank
//! | Page P1:       payload group 1                              | spare: link -> page P2
//! | Page P2:       payload group 2                              | spare: link -> page P3
//! |   ...                                                       |
//! | Page Pn:       payload group n                              | spare: end of chain
//! +-------------------------------------------------------------+
//! ```
//!
//! A "group" is the slice of the IDB that one physical page carries (2 KiB, unless the pages are
//! smaller). The physical pages follow the part's [PageOrderTable](crate::page_table). The first
//! payload page is where the table puts the first payload group, and from there each page's
//! spare area links to the page of the next group, so the rest of a copy can be read back
//! without knowing which table wrote it.
//!
//! Links are relative to the payload offset: a link `L` in a copy whose payload starts at sector
//! `offset` leads to page `(offset + L) / 4`. This is how the boot ROM and loaders read them.

mod header;
mod rc4;
mod read;
mod scan;
mod store;
mod write;

use std::ops::{Deref, DerefMut, Range};

use thiserror::Error;

use crate::chip::ChipGeometry;

pub use header::{IdbDescriptor, IDB_MAGIC, IDB_TAG};
pub use rc4::rc4;
pub use read::read_copy;
pub use scan::scan_idb;
pub use store::{CommitReport, IdbStore};
pub use write::{invalidate, write_copy};

/// Size of a logical sector
pub const SECTOR_SIZE: usize = 512;

/// Capacity of the IDB buffer, in sectors; `offset + size` of a payload may not exceed this
pub const IDB_SECTORS: u32 = 512;

/// Capacity of the IDB buffer, in bytes
pub const IDB_BUF_SIZE: usize = IDB_SECTORS as usize * SECTOR_SIZE;

/// The most copies a scan will collect
pub const MAX_COPIES: usize = 5;

/// Blocks that receive copies when the flash holds no IDB yet
pub const DEFAULT_TARGETS: [u32; MAX_COPIES] = [2, 3, 4, 5, 6];

/// Forward links count pages in units of this many sectors
pub const LINK_SCALE: u32 = 4;

/// Forward link value that ends the chain (an unprogrammed spare slot)
pub const LINK_END: u32 = u32::MAX;

/// Convert a sector number within the IDB to the group containing it
pub fn sector_to_group(sector: u32, group_sectors: u32) -> u32 {
    sector / group_sectors
}

/// Byte offset, within the IDB buffer, of the first byte of `group`
pub fn group_to_byte_offset(group: u32, group_sectors: u32) -> usize {
    let offset = group as usize * group_sectors as usize * SECTOR_SIZE;
    assert!(offset < IDB_BUF_SIZE, "group {group} lies outside the IDB buffer");
    offset
}

/// Byte offset, within the IDB buffer, of the first byte of `sector`
pub fn sector_to_byte_offset(sector: u32) -> usize {
    assert!(sector <= IDB_SECTORS, "sector {sector} lies outside the IDB buffer");
    sector as usize * SECTOR_SIZE
}

/// The page a link of zero leads to, for a payload starting at sector `offset`
fn link_base(offset: u32) -> u32 {
    offset / LINK_SCALE
}

/// Encode the forward link to `page`, or the end of the chain, for a payload starting at sector
/// `offset`
///
/// `page` must not come before `offset / LINK_SCALE`; payload pages never do, since page tables
/// are strictly increasing from 0.
pub fn encode_link(page: Option<u32>, offset: u32) -> u32 {
    page.map_or(LINK_END, |page| (page - link_base(offset)) * LINK_SCALE)
}

/// Decode a forward link into a payload page of a block with `pages_per_block` pages, for a
/// payload starting at sector `offset`
///
/// Returns None for the end marker and for anything that cannot be a payload page.
pub fn decode_link(link: u32, offset: u32, pages_per_block: u32) -> Option<u32> {
    if link == LINK_END || link % LINK_SCALE != 0 {
        return None;
    }

    offset
        .checked_add(link)
        .map(|x| x / LINK_SCALE)
        .filter(|&page| page > 0 && page < pages_per_block)
}

/// Where the payload lies within the IDB, in sectors
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct PayloadExtent {
    pub offset: u32,
    pub size: u32,
}

impl PayloadExtent {
    pub fn new(offset: u32, size: u32) -> Self {
        Self { offset, size }
    }

    /// The sector following the last payload sector
    pub fn end(&self) -> u32 {
        self.offset + self.size
    }

    /// Is the payload non-empty and within the IDB buffer?
    pub fn is_valid(&self) -> bool {
        self.size > 0 && self.offset.checked_add(self.size).is_some_and(|end| end <= IDB_SECTORS)
    }

    /// The groups holding payload, excluding the header group (whose bytes travel with the
    /// header page)
    pub fn groups(&self, group_sectors: u32) -> Range<u32> {
        let first = sector_to_group(self.offset, group_sectors).max(1);
        let last = sector_to_group(self.end() - 1, group_sectors);
        first..(last + 1).max(first)
    }

    /// Byte range of the payload within the IDB buffer
    pub fn byte_range(&self) -> Range<usize> {
        sector_to_byte_offset(self.offset)..sector_to_byte_offset(self.end())
    }
}

/// One copy of the IDB found on flash
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub struct IdbEntry {
    pub block: u32,
    pub extent: PayloadExtent,
}

/// The copies found by the last scan, in block order. A map of the IDB copies that are
/// currently live, which should be rebuilt (with [scan_idb]) whenever copies are rewritten.
pub type Directory = Vec<IdbEntry>;

/// An IDB-sized byte buffer, with accessors for its groups and sectors
#[derive(Clone, Eq, PartialEq)]
pub struct IdbBuffer(Box<[u8]>);

impl IdbBuffer {
    /// Allocate a zero-filled buffer
    pub fn new() -> Self {
        Self(vec![0u8; IDB_BUF_SIZE].into_boxed_slice())
    }

    pub fn clear(&mut self) {
        self.0.fill(0);
    }

    fn group_range(group: u32, group_sectors: u32) -> Range<usize> {
        let begin = group_to_byte_offset(group, group_sectors);
        begin..begin + group_sectors as usize * SECTOR_SIZE
    }

    /// The bytes carried by one physical page
    pub fn group(&self, group: u32, group_sectors: u32) -> &[u8] {
        &self.0[Self::group_range(group, group_sectors)]
    }

    pub fn group_mut(&mut self, group: u32, group_sectors: u32) -> &mut [u8] {
        &mut self.0[Self::group_range(group, group_sectors)]
    }

    /// The bytes carried by the header page
    pub fn header(&self, group_sectors: u32) -> &[u8] {
        self.group(0, group_sectors)
    }

    /// The payload bytes
    pub fn payload(&self, extent: PayloadExtent) -> &[u8] {
        &self.0[extent.byte_range()]
    }

    /// One 512-byte sector
    pub fn sector(&self, sector: u32) -> &[u8] {
        let begin = sector_to_byte_offset(sector);
        &self.0[begin..begin + SECTOR_SIZE]
    }

    pub fn sector_mut(&mut self, sector: u32) -> &mut [u8] {
        let begin = sector_to_byte_offset(sector);
        &mut self.0[begin..begin + SECTOR_SIZE]
    }
}

impl Default for IdbBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for IdbBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdbBuffer")
            .field("len", &self.0.len())
            .finish_non_exhaustive()
    }
}

impl Deref for IdbBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl DerefMut for IdbBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// Reasons a copy could not be reconstructed. None of these are trustworthy partial results.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("block {0} is marked bad")]
    BadBlock(u32),

    #[error("payload extent {0:?} does not fit the IDB buffer")]
    BadExtent(PayloadExtent),

    #[error("reading block {block} page {page} failed: {cause:#}")]
    Flash {
        block: u32,
        page: u32,
        cause: anyhow::Error,
    },

    #[error("block {block} page {page} links to {link:#x}, which is not a payload page")]
    BadLink { block: u32, page: u32, link: u32 },

    #[error("chain ended after {read} of {expected} payload groups")]
    ChainTruncated { read: u32, expected: u32 },
}

/// Reasons a copy could not be written
#[derive(Debug, Error)]
pub enum CopyError {
    #[error("block {0} is marked bad")]
    BadBlock(u32),

    #[error("payload extent {0:?} does not fit in one eraseblock")]
    TooLarge(PayloadExtent),

    /// The copy was written but did not read back identically, so it has been invalidated
    #[error("copy in block {block} failed verification (first bad byte: {offset:?}) and was invalidated")]
    Invalidated { block: u32, offset: Option<usize> },

    #[error("flash operation on block {block} failed: {cause:#}")]
    Flash { block: u32, cause: anyhow::Error },
}

/// Check that a flash layout can hold IDB copies laid out for `geometry`
pub(crate) fn check_layout(
    layout: &crate::nand::NandLayout,
    geometry: &ChipGeometry,
) -> anyhow::Result<()> {
    anyhow::ensure!(
        layout.bytes_per_page >= geometry.group_sectors() as usize * SECTOR_SIZE,
        "{} byte pages cannot hold a {} sector group",
        layout.bytes_per_page,
        geometry.group_sectors()
    );
    anyhow::ensure!(
        layout.spare_bytes_per_page >= geometry.spare_bytes_per_page(),
        "{} spare bytes per page cannot hold {} ECC steps of system data",
        layout.spare_bytes_per_page,
        geometry.ecc_steps
    );
    anyhow::ensure!(
        layout.pages_per_block == geometry.pages_per_block,
        "flash has {} pages per block, but the chip has {}",
        layout.pages_per_block,
        geometry.pages_per_block
    );
    anyhow::ensure!(
        geometry.pages_per_block < (1 << 16),
        "forward links cannot address {} pages",
        geometry.pages_per_block
    );
    Ok(())
}

#[cfg(test)]
pub(crate) mod testutil {
    //! Fixtures shared by the IDB tests

    use super::*;
    use crate::nand::SimNand;
    use crate::page_table::PageScheme;

    /// A small 2 KiB-page part with four-sector groups and an 8-byte spare area
    pub fn geometry() -> ChipGeometry {
        ChipGeometry {
            sectors_per_page: 4,
            pages_per_block: 256,
            blocks: 16,
            ecc_steps: 2,
            scheme: PageScheme::Paired4,
        }
    }

    pub fn sim() -> SimNand {
        SimNand::new(geometry().nand_layout())
    }

    /// An IDB whose descriptor describes `extent`, with a recognizable pattern in every other
    /// byte of the header group and payload
    pub fn sample(extent: PayloadExtent) -> anyhow::Result<IdbBuffer> {
        let mut buf = IdbBuffer::new();
        let pattern = |i: usize| (i * 7 + i / SECTOR_SIZE) as u8;

        let header_len = geometry().group_sectors() as usize * SECTOR_SIZE;
        for i in (0..header_len).chain(extent.byte_range()) {
            buf[i] = pattern(i);
        }

        IdbDescriptor::new(extent).encode(&mut buf)?;
        Ok(buf)
    }

    /// A page-sized buffer holding just an obfuscated descriptor
    pub fn header_page(extent: PayloadExtent) -> anyhow::Result<Vec<u8>> {
        let mut page = vec![0xFF; geometry().bytes_per_page()];
        IdbDescriptor::new(extent).encode(&mut page)?;
        Ok(page)
    }
}

#[test]
fn test_extent_groups() {
    // Offset 4 (one group in): groups 1..=3 for 12 sectors
    assert_eq!(PayloadExtent::new(4, 12).groups(4), 1..4);

    // Payload starting in the header group skips it
    assert_eq!(PayloadExtent::new(0, 12).groups(4), 1..3);

    // Unaligned payloads cover every group they touch
    assert_eq!(PayloadExtent::new(5, 8).groups(4), 1..4);

    // Entirely inside the header group
    assert!(PayloadExtent::new(1, 2).groups(4).is_empty());

    // Whole buffer
    assert_eq!(PayloadExtent::new(4, 508).groups(4), 1..128);
}

#[test]
fn test_extent_validity() {
    assert!(PayloadExtent::new(4, 508).is_valid());
    assert!(!PayloadExtent::new(4, 509).is_valid());
    assert!(!PayloadExtent::new(4, 0).is_valid());
    assert!(!PayloadExtent::new(u32::MAX, 2).is_valid());
}

#[test]
fn test_links() {
    // The usual payload offset of 4 stores each link as (page - 1) * 4
    assert_eq!(encode_link(None, 4), LINK_END);
    assert_eq!(encode_link(Some(5), 4), 16);
    assert_eq!(decode_link(16, 4, 64), Some(5));

    // Other offsets shift the base page
    assert_eq!(encode_link(Some(5), 0), 20);
    assert_eq!(decode_link(20, 0, 64), Some(5));
    assert_eq!(encode_link(Some(9), 13), 24);
    assert_eq!(decode_link(24, 13, 64), Some(9));

    assert_eq!(decode_link(LINK_END, 4, 64), None);
    assert_eq!(decode_link(0, 0, 64), None);
    assert_eq!(decode_link(21, 4, 64), None);
    assert_eq!(decode_link(63 * LINK_SCALE, 4, 64), None);

    // The largest possible link is still distinguishable from the end marker
    assert_ne!(encode_link(Some((1 << 16) - 1), 0), LINK_END);
}

#[test]
fn test_buffer_offsets() {
    assert_eq!(group_to_byte_offset(0, 4), 0);
    assert_eq!(group_to_byte_offset(3, 4), 3 * 2048);
    assert_eq!(sector_to_group(7, 4), 1);
    assert_eq!(sector_to_byte_offset(IDB_SECTORS), IDB_BUF_SIZE);

    let mut buf = IdbBuffer::new();
    buf.group_mut(127, 4).fill(0xAB);
    assert_eq!(buf[IDB_BUF_SIZE - 1], 0xAB);
    assert_eq!(buf.sector(508), [0xAB; SECTOR_SIZE]);
    buf.clear();
    assert!(buf.iter().all(|&x| x == 0));
}

#[test]
#[should_panic]
fn test_group_out_of_bounds() {
    group_to_byte_offset(128, 4);
}
