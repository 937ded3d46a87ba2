//! The IDB store: everything needed to find, load, and rewrite the redundant IDB copies of one
//! NAND device

use log::{debug, info, warn};

use super::{
    check_layout, read_copy, scan_idb, write_copy, CopyError, Directory, IdbBuffer, IdbEntry,
    PayloadExtent, ReadError, DEFAULT_TARGETS,
};
use crate::chip::{self, ChipGeometry, NandParaInfo};
use crate::nand::Nand;
use crate::page_table::PageOrderTable;

/// The outcome of writing every target block
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct CommitReport {
    /// Blocks now holding a verified copy
    pub written: Vec<u32>,

    /// Blocks whose copy failed verification (and was invalidated)
    pub invalidated: Vec<u32>,

    /// Blocks that could not be written at all
    pub failed: Vec<u32>,

    /// The copy the buffer was reloaded from after the rescan, if any
    pub restored: Option<IdbEntry>,
}

impl CommitReport {
    /// How many copies were written and verified
    pub fn copies(&self) -> usize {
        self.written.len()
    }
}

/// A NAND device together with its resolved geometry and current [Directory]
pub struct IdbStore<N> {
    nand: N,
    info: Option<&'static NandParaInfo>,
    geometry: ChipGeometry,
    table: PageOrderTable,
    boot_blocks: u32,
    directory: Directory,
    check: IdbBuffer,
}

impl<N: Nand> IdbStore<N> {
    /// Identify the NAND part, build its page table, and scan for copies
    pub fn open(mut nand: N, boot_blocks: u32) -> anyhow::Result<Self> {
        let id = nand.read_id()?;
        let (info, geometry) = chip::resolve(&id)?;
        info!(
            "NAND {:02x?}: {} blocks of {} pages, {} sectors per page, page scheme {:?}",
            id,
            geometry.blocks,
            geometry.pages_per_block,
            geometry.sectors_per_page,
            geometry.scheme
        );

        let mut store = Self::with_geometry(nand, geometry, boot_blocks)?;
        store.info = Some(info);
        Ok(store)
    }

    /// Use a known geometry instead of identifying the part, then scan for copies
    pub fn with_geometry(
        nand: N,
        geometry: ChipGeometry,
        boot_blocks: u32,
    ) -> anyhow::Result<Self> {
        check_layout(&nand.get_layout(), &geometry)?;

        let table = PageOrderTable::build(geometry.scheme);
        debug!(
            "IDB groups of {} sectors, forward links at spare offset {}",
            geometry.group_sectors(),
            geometry.link_offset()
        );

        let mut store = Self {
            nand,
            info: None,
            geometry,
            table,
            boot_blocks,
            directory: Directory::new(),
            check: IdbBuffer::new(),
        };
        store.rescan();
        Ok(store)
    }

    /// Rebuild the [Directory] from flash
    pub fn rescan(&mut self) -> &Directory {
        self.directory = scan_idb(&mut self.nand, self.boot_blocks);
        info!("found {} IDB copies", self.directory.len());
        &self.directory
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn geometry(&self) -> &ChipGeometry {
        &self.geometry
    }

    pub fn table(&self) -> &PageOrderTable {
        &self.table
    }

    pub fn boot_blocks(&self) -> u32 {
        self.boot_blocks
    }

    /// The parameter table row of the part, when it was identified by [IdbStore::open]
    pub fn chip_info(&self) -> Option<&'static NandParaInfo> {
        self.info
    }

    pub fn nand_mut(&mut self) -> &mut N {
        &mut self.nand
    }

    pub fn into_nand(self) -> N {
        self.nand
    }

    /// Reconstruct one specific copy
    pub fn read_entry(
        &mut self,
        entry: &IdbEntry,
        dst: &mut IdbBuffer,
    ) -> Result<(), ReadError> {
        read_copy(&mut self.nand, &self.geometry, entry, dst)
    }

    /// Fill `dst` from the first copy in the [Directory] that can be read completely
    ///
    /// Returns the copy used, or None (with `dst` zeroed) when no copy is readable.
    pub fn load(&mut self, dst: &mut IdbBuffer) -> Option<IdbEntry> {
        dst.clear();

        for entry in self.directory.clone() {
            match self.read_entry(&entry, dst) {
                Ok(()) => {
                    debug!("loaded IDB from block {}", entry.block);
                    return Some(entry);
                }
                Err(e) => {
                    warn!("IDB copy in block {} unreadable: {e}", entry.block);
                    dst.clear();
                }
            }
        }

        None
    }

    /// The blocks a commit will write: those holding copies now, or [DEFAULT_TARGETS] when there
    /// are none; either way, limited to the boot area
    pub fn targets(&self) -> Vec<u32> {
        let candidates: Vec<u32> = if self.directory.is_empty() {
            DEFAULT_TARGETS.to_vec()
        } else {
            self.directory.iter().map(|entry| entry.block).collect()
        };

        candidates
            .into_iter()
            .filter(|&block| block < self.boot_blocks)
            .collect()
    }

    /// Write the IDB in `buf` (whose payload lies at `extent`) to every target block, then rescan
    /// and reload `buf` from flash
    ///
    /// A failure on one block never stops the others from being written.
    pub fn commit(&mut self, buf: &mut IdbBuffer, extent: PayloadExtent) -> CommitReport {
        let targets = self.targets();
        let rpt = howudoin::new()
            .label("Writing IDB copies")
            .set_len(u64::try_from(targets.len()).ok());

        let mut report = CommitReport::default();
        for block in targets {
            let result = write_copy(
                &mut self.nand,
                &self.geometry,
                &self.table,
                block,
                buf,
                extent,
                &mut self.check,
            );

            match result {
                Ok(()) => {
                    debug!("block {block}: IDB copy written and verified");
                    report.written.push(block);
                }
                Err(e @ CopyError::Invalidated { .. }) => {
                    warn!("{e}");
                    report.invalidated.push(block);
                }
                Err(e) => {
                    warn!("block {block}: IDB copy not written: {e}");
                    report.failed.push(block);
                }
            }

            rpt.inc();
        }

        rpt.close();

        self.rescan();
        report.restored = self.load(buf);
        report
    }
}

#[cfg(test)]
mod test {
    use super::super::testutil::*;
    use super::*;
    use crate::nand::{Fault, NandBlock, SimNand};

    fn store(nand: SimNand) -> IdbStore<SimNand> {
        IdbStore::with_geometry(nand, geometry(), 8).unwrap()
    }

    #[test]
    fn test_open_identifies() -> anyhow::Result<()> {
        // A real part from the table, with 8 KiB pages
        let id = [0x2c, 0x88, 0x04, 0x4b, 0xa9, 0x00];
        let (_, geometry) = chip::resolve(&id)?;
        let nand = SimNand::new(geometry.nand_layout()).with_id(&id);

        let store = IdbStore::open(nand, 8)?;
        assert_eq!(store.geometry(), &geometry);
        assert!(store.chip_info().is_some());
        assert!(store.directory().is_empty());
        Ok(())
    }

    #[test]
    fn test_open_rejects_mismatched_layout() {
        let mut layout = geometry().nand_layout();
        layout.spare_bytes_per_page = 4;
        assert!(IdbStore::with_geometry(SimNand::new(layout), geometry(), 8).is_err());

        assert!(IdbStore::open(sim(), 8).is_err());
    }

    #[test]
    fn test_commit_fresh() -> anyhow::Result<()> {
        let mut store = store(sim());
        assert_eq!(store.targets(), DEFAULT_TARGETS);

        let extent = PayloadExtent::new(4, 60);
        let mut buf = sample(extent)?;
        let expected = buf.clone();

        let report = store.commit(&mut buf, extent);
        assert_eq!(report.written, DEFAULT_TARGETS);
        assert_eq!(report.copies(), 5);
        assert_eq!(report.restored, Some(IdbEntry { block: 2, extent }));
        assert_eq!(buf, expected);

        assert_eq!(
            store.directory().iter().map(|e| e.block).collect::<Vec<_>>(),
            DEFAULT_TARGETS
        );
        Ok(())
    }

    #[test]
    fn test_targets_limited_to_boot_area() {
        let store = IdbStore::with_geometry(sim(), geometry(), 4).unwrap();
        assert_eq!(store.targets(), [2, 3]);
    }

    #[test]
    fn test_redundancy() -> anyhow::Result<()> {
        let mut store = store(sim());
        let extent = PayloadExtent::new(4, 60);
        let mut buf = sample(extent)?;
        let expected = buf.clone();
        store.commit(&mut buf, extent);

        // Break the chain of the first copy; the next one is used instead
        store
            .nand_mut()
            .tamper(2, 1, |_, spare| spare[4..8].fill(0xFF));
        store.rescan();

        let mut dst = IdbBuffer::new();
        assert_eq!(store.load(&mut dst), Some(IdbEntry { block: 3, extent }));
        assert_eq!(dst, expected);
        Ok(())
    }

    #[test]
    fn test_load_nothing_readable() {
        let mut store = store(sim());
        let mut dst = IdbBuffer::new();
        dst.fill(0xAA);
        assert_eq!(store.load(&mut dst), None);
        assert!(dst.iter().all(|&x| x == 0));
    }

    #[test]
    fn test_commit_partial_failure() -> anyhow::Result<()> {
        let mut nand = sim();
        nand.inject_fault(3, 1, Fault::CorruptProgram);
        nand.inject_fault(4, 0, Fault::EraseError);
        nand.block(5)?.unwrap().mark_bad()?;

        let mut store = store(nand);
        let extent = PayloadExtent::new(4, 12);
        let mut buf = sample(extent)?;
        let report = store.commit(&mut buf, extent);

        assert_eq!(report.written, [2, 6]);
        assert_eq!(report.invalidated, [3]);
        assert_eq!(report.failed, [4, 5]);
        assert_eq!(
            store.directory().iter().map(|e| e.block).collect::<Vec<_>>(),
            [2, 6]
        );

        // Later commits reuse only the surviving copies
        assert_eq!(store.targets(), [2, 6]);
        Ok(())
    }

    #[test]
    fn test_commit_rewrites_existing() -> anyhow::Result<()> {
        let mut nand = sim();
        let header = header_page(PayloadExtent::new(4, 4))?;
        nand.block(1)?.unwrap().program(0, &header, &[])?;
        nand.block(7)?.unwrap().program(0, &header, &[])?;

        let mut store = store(nand);
        assert_eq!(store.targets(), [1, 7]);

        let extent = PayloadExtent::new(4, 8);
        let mut buf = sample(extent)?;
        let report = store.commit(&mut buf, extent);
        assert_eq!(report.written, [1, 7]);
        assert_eq!(
            store.directory(),
            &[1, 7].map(|block| IdbEntry { block, extent }).to_vec()
        );
        Ok(())
    }

    #[test]
    fn test_survives_lost_tag() -> anyhow::Result<()> {
        let mut store = store(sim());
        let extent = PayloadExtent::new(4, 60);
        let mut buf = sample(extent)?;
        let expected = buf.clone();
        assert_eq!(store.commit(&mut buf, extent).copies(), 5);

        // Destroy the tag of the first copy; the other four are still found
        store.nand_mut().tamper(2, 0, |data, _| data[..4].fill(0));
        let blocks: Vec<u32> = store.rescan().iter().map(|e| e.block).collect();
        assert_eq!(blocks, [3, 4, 5, 6]);

        let mut dst = IdbBuffer::new();
        assert_eq!(store.load(&mut dst), Some(IdbEntry { block: 3, extent }));
        assert_eq!(dst, expected);
        Ok(())
    }
}
