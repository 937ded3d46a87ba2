//! Code for programming an IDB copy into an eraseblock, with read-back verification

use log::{debug, warn};

use super::{
    encode_link, read_copy, CopyError, IdbBuffer, IdbEntry, PayloadExtent, SECTOR_SIZE,
};
use crate::chip::ChipGeometry;
use crate::nand::{Nand, NandBlock};
use crate::page_table::PageOrderTable;

/// Destroy the copy in block `index` by clearing its descriptor sector, so no scan will find it
///
/// This needs no erase: programming can always clear bits.
pub fn invalidate<N: Nand>(nand: &mut N, index: u32) -> anyhow::Result<()> {
    let mut block = nand
        .block(index)?
        .ok_or(anyhow::anyhow!("block {index} went bad"))?;

    let mut data = vec![0xFF; block.page_size()];
    data[..SECTOR_SIZE].fill(0);
    block.program(0, &data, &[])
}

/// Erase the block and program the header page and every payload group, in ascending page order
///
/// `plan` lists each payload group with the page that receives it. `tagged` is set once the
/// header page has been programmed, after which the block holds a (possibly incomplete) copy.
fn program_copy<N: Nand>(
    nand: &mut N,
    geometry: &ChipGeometry,
    index: u32,
    src: &IdbBuffer,
    extent: PayloadExtent,
    plan: &[(u32, u32)],
    tagged: &mut bool,
) -> Result<(), CopyError> {
    let flash = |cause| CopyError::Flash {
        block: index,
        cause,
    };

    let mut block = nand
        .block(index)
        .map_err(flash)?
        .ok_or(CopyError::BadBlock(index))?;
    block.erase().map_err(flash)?;

    let group_sectors = geometry.group_sectors();
    let group_len = group_sectors as usize * SECTOR_SIZE;
    let link_offset = geometry.link_offset();
    let mut data = vec![0xFF; block.page_size()];
    let mut spare = vec![0xFF; geometry.spare_bytes_per_page()];

    // The header page carries no link
    data[..group_len].copy_from_slice(src.header(group_sectors));
    block.program(0, &data, &spare).map_err(flash)?;
    *tagged = true;

    // Each payload page links to the page of the following group
    let links = plan
        .iter()
        .skip(1)
        .map(|&(_, page)| Some(page))
        .chain(std::iter::once(None));

    for (&(group, page), next) in plan.iter().zip(links) {
        data.fill(0xFF);
        data[..group_len].copy_from_slice(src.group(group, group_sectors));

        spare.fill(0xFF);
        spare[link_offset..link_offset + 4]
            .copy_from_slice(&encode_link(next, extent.offset).to_le_bytes());

        block.program(page, &data, &spare).map_err(flash)?;
    }

    Ok(())
}

/// Offset of the first byte that the header group or payload of `check` gets wrong
fn first_mismatch(
    src: &IdbBuffer,
    check: &IdbBuffer,
    extent: PayloadExtent,
    group_sectors: u32,
) -> Option<usize> {
    let differ = |a: &[u8], b: &[u8]| a.iter().zip(b).position(|(x, y)| x != y);

    differ(src.header(group_sectors), check.header(group_sectors)).or_else(|| {
        differ(src.payload(extent), check.payload(extent)).map(|o| o + extent.byte_range().start)
    })
}

/// Write the IDB in `src` (whose payload lies at `extent`) into block `index`, then read it back
/// into `check` and compare
///
/// A copy that cannot be verified is invalidated before returning [CopyError::Invalidated], as
/// is a copy whose programming failed partway. The caller should rescan afterward.
pub fn write_copy<N: Nand>(
    nand: &mut N,
    geometry: &ChipGeometry,
    table: &PageOrderTable,
    index: u32,
    src: &IdbBuffer,
    extent: PayloadExtent,
    check: &mut IdbBuffer,
) -> Result<(), CopyError> {
    if !extent.is_valid() {
        return Err(CopyError::TooLarge(extent));
    }

    let group_sectors = geometry.group_sectors();
    let plan: Vec<(u32, u32)> = extent
        .groups(group_sectors)
        .map(|group| (group, table.page(group)))
        .collect();
    if plan
        .last()
        .is_some_and(|&(_, page)| page >= geometry.pages_per_block)
    {
        return Err(CopyError::TooLarge(extent));
    }

    let mut tagged = false;
    if let Err(e) = program_copy(nand, geometry, index, src, extent, &plan, &mut tagged) {
        if tagged {
            if let Err(e) = invalidate(nand, index) {
                warn!("block {index}: could not invalidate partial copy: {e:#}");
            }
        }
        return Err(e);
    }

    check.clear();
    let entry = IdbEntry {
        block: index,
        extent,
    };
    let mismatch = match read_copy(nand, geometry, &entry, check) {
        Ok(()) => first_mismatch(src, check, extent, group_sectors).map(Some),
        Err(e) => {
            debug!("block {index}: read-back failed: {e}");
            Some(None)
        }
    };

    if let Some(offset) = mismatch {
        invalidate(nand, index).map_err(|cause| CopyError::Flash {
            block: index,
            cause,
        })?;
        return Err(CopyError::Invalidated {
            block: index,
            offset,
        });
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::super::{scan_idb, IdbDescriptor, LINK_END, LINK_SCALE};
    use super::*;
    use crate::nand::{Fault, SimNand};

    fn write(
        nand: &mut SimNand,
        index: u32,
        extent: PayloadExtent,
    ) -> Result<IdbBuffer, CopyError> {
        let geometry = geometry();
        let table = PageOrderTable::build(geometry.scheme);
        let src = sample(extent).unwrap();
        let mut check = IdbBuffer::new();
        write_copy(nand, &geometry, &table, index, &src, extent, &mut check)?;
        assert_eq!(check.payload(extent), src.payload(extent));
        Ok(src)
    }

    fn link_at(nand: &mut SimNand, index: u32, page: u32) -> u32 {
        let mut data = vec![0; 2048];
        let mut spare = [0; 8];
        nand.block(index)
            .unwrap()
            .unwrap()
            .read(page, &mut data, &mut spare)
            .unwrap();
        u32::from_le_bytes(spare[4..8].try_into().unwrap())
    }

    #[test]
    fn test_write_layout() -> anyhow::Result<()> {
        let mut nand = sim();
        let extent = PayloadExtent::new(4, 20);
        write(&mut nand, 3, extent)?;

        // Groups 1..=5 land on pages 1, 2, 3, 6, 7, each linked to the next as (page - 1) * 4;
        // the header page has no link
        assert_eq!(link_at(&mut nand, 3, 0), LINK_END);
        assert_eq!(link_at(&mut nand, 3, 1), LINK_SCALE);
        assert_eq!(link_at(&mut nand, 3, 2), 2 * LINK_SCALE);
        assert_eq!(link_at(&mut nand, 3, 3), 5 * LINK_SCALE);
        assert_eq!(link_at(&mut nand, 3, 6), 6 * LINK_SCALE);
        assert_eq!(link_at(&mut nand, 3, 7), LINK_END);

        // Skipped pages stay erased
        assert_eq!(link_at(&mut nand, 3, 4), LINK_END);
        assert_eq!(link_at(&mut nand, 3, 5), LINK_END);

        assert_eq!(scan_idb(&mut nand, 8), [IdbEntry { block: 3, extent }]);
        Ok(())
    }

    #[test]
    fn test_write_header_only() -> anyhow::Result<()> {
        // A payload entirely within the header group needs no payload pages
        let mut nand = sim();
        let extent = PayloadExtent::new(1, 3);
        write(&mut nand, 2, extent)?;
        assert_eq!(link_at(&mut nand, 2, 0), LINK_END);
        Ok(())
    }

    #[test]
    fn test_write_replaces_old_copy() -> anyhow::Result<()> {
        let mut nand = sim();
        write(&mut nand, 2, PayloadExtent::new(4, 100))?;
        let extent = PayloadExtent::new(4, 8);
        write(&mut nand, 2, extent)?;
        assert_eq!(scan_idb(&mut nand, 8), [IdbEntry { block: 2, extent }]);
        Ok(())
    }

    #[test]
    fn test_verify_invalidates() {
        let mut nand = sim();
        nand.inject_fault(2, 2, Fault::CorruptProgram);

        let result = write(&mut nand, 2, PayloadExtent::new(4, 20));
        assert!(matches!(
            result,
            Err(CopyError::Invalidated {
                block: 2,
                offset: Some(4096)
            })
        ));

        // Nothing recognizable is left behind
        let mut data = vec![0; 2048];
        nand.block(2)
            .unwrap()
            .unwrap()
            .read(0, &mut data, &mut [])
            .unwrap();
        assert!(IdbDescriptor::decode(&data).is_none());
        assert!(scan_idb(&mut nand, 8).is_empty());
    }

    #[test]
    fn test_dropped_program_invalidates() {
        let mut nand = sim();
        nand.inject_fault(2, 3, Fault::DropProgram);

        let result = write(&mut nand, 2, PayloadExtent::new(4, 20));
        assert!(matches!(
            result,
            Err(CopyError::Invalidated {
                block: 2,
                offset: None
            })
        ));
        assert!(scan_idb(&mut nand, 8).is_empty());
    }

    #[test]
    fn test_write_failures() {
        let mut nand = sim();

        nand.inject_fault(4, 0, Fault::EraseError);
        assert!(matches!(
            write(&mut nand, 4, PayloadExtent::new(4, 8)),
            Err(CopyError::Flash { block: 4, .. })
        ));

        nand.block(5).unwrap().unwrap().mark_bad().unwrap();
        assert!(matches!(
            write(&mut nand, 5, PayloadExtent::new(4, 8)),
            Err(CopyError::BadBlock(5))
        ));

        let geometry = geometry();
        let table = PageOrderTable::build(geometry.scheme);
        let (src, mut check) = (IdbBuffer::new(), IdbBuffer::new());
        let extent = PayloadExtent::new(4, 509);
        assert!(matches!(
            write_copy(&mut nand, &geometry, &table, 2, &src, extent, &mut check),
            Err(CopyError::TooLarge(_))
        ));
    }

    #[test]
    fn test_write_too_large_for_block() {
        let mut geometry = geometry();
        geometry.pages_per_block = 16;
        let mut nand = SimNand::new(geometry.nand_layout());
        let table = PageOrderTable::build(geometry.scheme);
        let extent = PayloadExtent::new(4, 40);
        let src = sample(extent).unwrap();
        let mut check = IdbBuffer::new();

        // Group 10 would need page 18
        assert!(matches!(
            write_copy(&mut nand, &geometry, &table, 2, &src, extent, &mut check),
            Err(CopyError::TooLarge(_))
        ));
    }
}
