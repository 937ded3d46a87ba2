//! Code for locating the IDB copies present on flash

use log::{debug, warn};

use super::{Directory, IdbDescriptor, IdbEntry, MAX_COPIES};
use crate::nand::{Nand, NandBlock};

/// Read the first page of a block (if it isn't bad), decoding any descriptor found there
fn probe_block<N: Nand>(
    nand: &mut N,
    index: u32,
    data: &mut [u8],
) -> anyhow::Result<Option<IdbDescriptor>> {
    let Some(block) = nand.block(index)? else {
        return Ok(None);
    };

    block.read(0, data, &mut [])?;
    Ok(IdbDescriptor::decode(data))
}

/// Examine the first `boot_blocks` blocks of the NAND and return the [Directory] of IDB copies,
/// stopping once [MAX_COPIES] have been found
///
/// Unreadable and bad blocks are treated as holding no copy.
pub fn scan_idb<N: Nand>(nand: &mut N, boot_blocks: u32) -> Directory {
    let layout = nand.get_layout();
    let block_count = boot_blocks.min(layout.blocks);
    let rpt = howudoin::new()
        .label("Scanning for IDB copies")
        .set_len(u64::from(block_count));

    let mut data = vec![0; layout.bytes_per_page];
    let mut directory = Directory::new();
    for index in 0..block_count {
        rpt.inc();

        match probe_block(nand, index, &mut data) {
            Ok(Some(descriptor)) if descriptor.extent.is_valid() => {
                debug!("block {index}: IDB copy, payload {:?}", descriptor.extent);
                directory.push(IdbEntry {
                    block: index,
                    extent: descriptor.extent,
                });
            }
            Ok(Some(descriptor)) => {
                warn!(
                    "block {index}: ignoring IDB copy with unusable payload {:?}",
                    descriptor.extent
                );
            }
            Ok(None) => (),
            Err(e) => debug!("block {index}: unreadable ({e:#}), skipping"),
        }

        if directory.len() >= MAX_COPIES {
            break;
        }
    }

    rpt.close();

    directory
}

#[test]
fn test_scan() -> anyhow::Result<()> {
    use super::testutil::*;
    use super::PayloadExtent;
    use crate::nand::Fault;

    let mut nand = sim();
    let extent = PayloadExtent::new(4, 12);
    let header = header_page(extent)?;

    for index in [1, 2, 4, 5] {
        nand.block(index)?.unwrap().program(0, &header, &[])?;
    }

    // A tagged block with an impossible payload doesn't count
    nand.block(3)?
        .unwrap()
        .program(0, &header_page(PayloadExtent::new(4, 600))?, &[])?;

    // Neither do unreadable or bad blocks
    nand.inject_fault(4, 0, Fault::ReadError);
    nand.block(5)?.unwrap().mark_bad()?;

    let directory = scan_idb(&mut nand, 8);
    assert_eq!(
        directory,
        [1, 2].map(|block| IdbEntry { block, extent }).to_vec()
    );

    // Blocks past the boot area are never examined
    assert!(scan_idb(&mut nand, 2).iter().all(|e| e.block < 2));

    // Scanning is idempotent
    assert_eq!(scan_idb(&mut nand, 8), directory);
    Ok(())
}

#[test]
fn test_scan_limit() -> anyhow::Result<()> {
    use super::testutil::*;
    use super::PayloadExtent;

    let mut nand = sim();
    let header = header_page(PayloadExtent::new(4, 4))?;
    for index in 0..8 {
        nand.block(index)?.unwrap().program(0, &header, &[])?;
    }

    let directory = scan_idb(&mut nand, 8);
    assert_eq!(directory.len(), MAX_COPIES);
    assert_eq!(
        directory.iter().map(|e| e.block).collect::<Vec<_>>(),
        [0, 1, 2, 3, 4]
    );
    Ok(())
}
