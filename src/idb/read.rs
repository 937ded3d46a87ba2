//! Code for reconstructing an IDB copy by following its chain of forward links

use super::{decode_link, IdbBuffer, IdbEntry, ReadError, LINK_END, SECTOR_SIZE};
use crate::chip::ChipGeometry;
use crate::nand::{Nand, NandBlock};

/// Read one page, returning the forward link from its spare area
fn read_link<B: NandBlock>(
    block: &B,
    index: u32,
    page: u32,
    geometry: &ChipGeometry,
    data: &mut [u8],
    spare: &mut [u8],
) -> Result<u32, ReadError> {
    block
        .read(page, data, spare)
        .map_err(|cause| ReadError::Flash {
            block: index,
            page,
            cause,
        })?;

    let offset = geometry.link_offset();
    let mut link = [0; 4];
    link.copy_from_slice(&spare[offset..offset + 4]);
    Ok(u32::from_le_bytes(link))
}

/// Reconstruct the copy described by `entry` into `dst`
///
/// The header page fills the first group of `dst`. The first payload group is read from the page
/// the part's page scheme assigns it, and each later one from the page the previous page links
/// to. Bytes outside of these groups are left untouched. On error, `dst` holds partial data and
/// must not be trusted.
pub fn read_copy<N: Nand>(
    nand: &mut N,
    geometry: &ChipGeometry,
    entry: &IdbEntry,
    dst: &mut IdbBuffer,
) -> Result<(), ReadError> {
    let IdbEntry {
        block: index,
        extent,
    } = *entry;

    if !extent.is_valid() {
        return Err(ReadError::BadExtent(extent));
    }

    let block = nand
        .block(index)
        .map_err(|cause| ReadError::Flash {
            block: index,
            page: 0,
            cause,
        })?
        .ok_or(ReadError::BadBlock(index))?;

    let group_sectors = geometry.group_sectors();
    let group_len = group_sectors as usize * SECTOR_SIZE;
    let mut data = vec![0; block.page_size()];
    let mut spare = vec![0; geometry.spare_bytes_per_page()];
    if data.len() < group_len {
        return Err(ReadError::Flash {
            block: index,
            page: 0,
            cause: anyhow::anyhow!("{} byte pages cannot hold a group", data.len()),
        });
    }

    // The header page's spare area is left blank
    read_link(&block, index, 0, geometry, &mut data, &mut spare)?;
    dst.group_mut(0, group_sectors)
        .copy_from_slice(&data[..group_len]);

    let groups = extent.groups(group_sectors);
    let expected = groups.len() as u32;
    let mut page = geometry.scheme.physical_page(groups.start);
    if !groups.is_empty() && page >= geometry.pages_per_block {
        return Err(ReadError::BadExtent(extent));
    }

    // Only the pages before the last need to link onward
    let mut link = LINK_END;
    for (read, group) in groups.enumerate() {
        if read > 0 {
            if link == LINK_END {
                return Err(ReadError::ChainTruncated {
                    read: read as u32,
                    expected,
                });
            }

            let prev = page;
            page = decode_link(link, extent.offset, geometry.pages_per_block).ok_or(
                ReadError::BadLink {
                    block: index,
                    page: prev,
                    link,
                },
            )?;
        }

        link = read_link(&block, index, page, geometry, &mut data, &mut spare)?;
        dst.group_mut(group, group_sectors)
            .copy_from_slice(&data[..group_len]);
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::{encode_link, write_copy, PayloadExtent, LINK_SCALE};
    use super::*;
    use crate::nand::{Fault, SimNand};
    use crate::page_table::PageOrderTable;

    fn write_sample(nand: &mut SimNand, index: u32, extent: PayloadExtent) -> IdbBuffer {
        let geometry = geometry();
        let table = PageOrderTable::build(geometry.scheme);
        let src = sample(extent).unwrap();
        let mut check = IdbBuffer::new();
        write_copy(nand, &geometry, &table, index, &src, extent, &mut check).unwrap();
        src
    }

    #[test]
    fn test_read_copy() -> anyhow::Result<()> {
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 508);
        let src = write_sample(&mut nand, 2, extent);

        let mut dst = IdbBuffer::new();
        read_copy(&mut nand, &geometry(), &IdbEntry { block: 2, extent }, &mut dst)?;
        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn test_read_follows_links() -> anyhow::Result<()> {
        // The reader must go where the links say, not where the page table says
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 8);
        let src = write_sample(&mut nand, 2, extent);

        // Move group 2 from its page (2) to page 40, and repoint group 1's link there
        let mut moved = (vec![0; 2048], vec![0; 8]);
        nand.block(2)?
            .unwrap()
            .read(2, &mut moved.0, &mut moved.1)?;
        nand.block(2)?.unwrap().program(40, &moved.0, &moved.1)?;
        nand.tamper(2, 2, |data, _| data.fill(0));
        nand.tamper(2, 1, |_, spare| {
            spare[4..8].copy_from_slice(&encode_link(Some(40), 4).to_le_bytes())
        });

        let mut dst = IdbBuffer::new();
        read_copy(&mut nand, &geometry(), &IdbEntry { block: 2, extent }, &mut dst)?;
        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn test_truncated_chain() {
        // Offset 0 puts the first four payload sectors in the header group, so the other twelve
        // need groups 1 to 3
        let mut nand = sim();
        let extent = PayloadExtent::new(0, 16);
        write_sample(&mut nand, 2, extent);

        // Cut the chain after the first payload group (on page 1)
        nand.tamper(2, 1, |_, spare| spare[4..8].fill(0xFF));

        let mut dst = IdbBuffer::new();
        let result = read_copy(&mut nand, &geometry(), &IdbEntry { block: 2, extent }, &mut dst);
        assert!(matches!(
            result,
            Err(ReadError::ChainTruncated {
                read: 1,
                expected: 3
            })
        ));
    }

    #[test]
    fn test_bad_link() {
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 8);
        write_sample(&mut nand, 2, extent);

        nand.tamper(2, 1, |_, spare| spare[4..8].copy_from_slice(&3u32.to_le_bytes()));

        let mut dst = IdbBuffer::new();
        let result = read_copy(&mut nand, &geometry(), &IdbEntry { block: 2, extent }, &mut dst);
        assert!(matches!(
            result,
            Err(ReadError::BadLink {
                block: 2,
                page: 1,
                link: 3
            })
        ));
    }

    #[test]
    fn test_header_spare_ignored() -> anyhow::Result<()> {
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 8);
        let src = write_sample(&mut nand, 2, extent);

        nand.tamper(2, 0, |_, spare| spare.fill(0));

        let mut dst = IdbBuffer::new();
        read_copy(&mut nand, &geometry(), &IdbEntry { block: 2, extent }, &mut dst)?;
        assert_eq!(dst, src);
        Ok(())
    }

    #[test]
    fn test_read_loader_layout() -> anyhow::Result<()> {
        // Lay a copy out the way Rockchip loaders do: blank header spare, group g on page
        // table[g], each payload page linking to table[g + 1] as (page - 1) * 4, even the last
        let geometry = geometry();
        let table = PageOrderTable::build(geometry.scheme);
        let extent = PayloadExtent::new(4, 20);
        let src = sample(extent)?;

        let mut nand = sim();
        let mut block = nand.block(2)?.unwrap();
        block.program(0, src.header(4), &[0xFF; 8])?;
        for group in 1..=5 {
            let mut spare = [0xFF; 8];
            let link = (table.page(group + 1) - 1) * LINK_SCALE;
            spare[4..8].copy_from_slice(&link.to_le_bytes());
            block.program(table.page(group), src.group(group, 4), &spare)?;
        }

        let mut dst = IdbBuffer::new();
        read_copy(&mut nand, &geometry, &IdbEntry { block: 2, extent }, &mut dst)?;
        assert_eq!(dst.header(4), src.header(4));
        assert_eq!(dst.payload(extent), src.payload(extent));
        Ok(())
    }

    #[test]
    fn test_written_links_resolve_from_offset() -> anyhow::Result<()> {
        // A loader starts at page offset / 4 and follows (offset + link) / 4 for a count of
        // groups, never consulting a page table
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 20);
        let src = write_sample(&mut nand, 2, extent);

        let block = nand.block(2)?.unwrap();
        let (mut data, mut spare) = (vec![0; 2048], [0; 8]);
        let mut page = extent.offset / LINK_SCALE;
        for group in 1..=5 {
            block.read(page, &mut data, &mut spare)?;
            assert_eq!(data, src.group(group, 4));

            let link = u32::from_le_bytes([spare[4], spare[5], spare[6], spare[7]]);
            if group < 5 {
                page = (extent.offset + link) / LINK_SCALE;
            } else {
                assert_eq!(link, LINK_END);
            }
        }
        Ok(())
    }

    #[test]
    fn test_read_errors() {
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 8);
        write_sample(&mut nand, 2, extent);
        let entry = IdbEntry { block: 2, extent };
        let mut dst = IdbBuffer::new();

        nand.inject_fault(2, 2, Fault::ReadError);
        assert!(matches!(
            read_copy(&mut nand, &geometry(), &entry, &mut dst),
            Err(ReadError::Flash { block: 2, page: 2, .. })
        ));

        let bad = IdbEntry {
            block: 2,
            extent: PayloadExtent::new(500, 13),
        };
        assert!(matches!(
            read_copy(&mut nand, &geometry(), &bad, &mut dst),
            Err(ReadError::BadExtent(_))
        ));
    }
}
