//! The block device facade over an [IdbStore]

use std::ops::Range;

use log::{debug, info, warn};

use super::gpt::GPT_BACKUP_BLOCKS;
use super::{BlockDevice, Guid, SyntheticPartitionTable, BLOCK_SIZE, DATA_START_LBA, TOTAL_BLOCKS};
use crate::config::DeviceConfig;
use crate::idb::{CommitReport, IdbBuffer, IdbDescriptor, IdbEntry, IdbStore, PayloadExtent};
use crate::nand::Nand;

/// Identification of the block device, as a host would present it
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct BlockInfo {
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub removable: bool,
    pub block_size: usize,
    pub block_count: u64,
}

/// A partitioned block device whose one partition reads from, and writes through to, the IDB
///
/// Reads of the partition are served from an in-memory copy of the IDB. Writes to the partition
/// are staged in that copy: a write to its first block starts a new image, and once the block
/// holding the end of the image's payload (per its header) is written, every copy on flash is
/// rewritten before the write returns.
pub struct RkmtdDevice<N> {
    store: IdbStore<N>,
    table: SyntheticPartitionTable,
    buffer: IdbBuffer,
    loaded: Option<IdbEntry>,

    /// The payload of the image being staged, if any
    staging: Option<PayloadExtent>,
}

impl<N: Nand> RkmtdDevice<N> {
    /// Identify the NAND, find its IDB copies, and load the first readable one
    pub fn open(nand: N, config: &DeviceConfig) -> anyhow::Result<Self> {
        let store = IdbStore::open(nand, config.boot_blocks)?;
        Self::with_store(store, config)
    }

    /// Put a device in front of an already-opened store
    pub fn with_store(mut store: IdbStore<N>, config: &DeviceConfig) -> anyhow::Result<Self> {
        let table = SyntheticPartitionTable::new(
            TOTAL_BLOCKS,
            config.disk_guid.unwrap_or_else(Guid::random),
            config.partition_guid.unwrap_or_else(Guid::random),
            &config.partition_name,
        )?;
        debug!(
            "disk GUID {}, partition GUID {}",
            table.disk_guid(),
            table.partition_guid()
        );

        let mut buffer = IdbBuffer::new();
        let loaded = store.load(&mut buffer);
        match loaded {
            Some(entry) => info!("serving IDB from block {}", entry.block),
            None => info!("no readable IDB copy; partition reads as zeros"),
        }

        Ok(Self {
            store,
            table,
            buffer,
            loaded,
            staging: None,
        })
    }

    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            vendor: format!("0x{:04x}", 0x2207),
            product: "RKMTD".to_string(),
            revision: "V1.00".to_string(),
            removable: true,
            block_size: BLOCK_SIZE,
            block_count: TOTAL_BLOCKS,
        }
    }

    pub fn store(&self) -> &IdbStore<N> {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut IdbStore<N> {
        &mut self.store
    }

    pub fn into_store(self) -> IdbStore<N> {
        self.store
    }

    pub fn partition_table(&self) -> &SyntheticPartitionTable {
        &self.table
    }

    /// The in-memory IDB the partition currently shows
    pub fn buffer(&self) -> &IdbBuffer {
        &self.buffer
    }

    /// The copy the in-memory IDB was last loaded from
    pub fn loaded(&self) -> Option<IdbEntry> {
        self.loaded
    }

    /// Is an image partway through being written?
    pub fn is_staging(&self) -> bool {
        self.staging.is_some()
    }

    /// The blocks served from the IDB buffer
    fn data_window() -> Range<u64> {
        DATA_START_LBA..TOTAL_BLOCKS - GPT_BACKUP_BLOCKS
    }

    /// Is a transfer of `count` blocks from `start`, with a `len` byte buffer, acceptable?
    fn accepts(start: u64, count: u64, len: usize) -> bool {
        let in_range = start
            .checked_add(count)
            .is_some_and(|end| count > 0 && end <= TOTAL_BLOCKS);
        let fits = usize::try_from(count)
            .ok()
            .and_then(|count| count.checked_mul(BLOCK_SIZE))
            .is_some_and(|need| len >= need);

        in_range && fits
    }

    /// Discard anything staged and reload the in-memory IDB from flash
    fn restore(&mut self) {
        self.loaded = self.store.load(&mut self.buffer);
    }

    /// Decode the header of a newly started image, returning its payload extent if it is usable
    fn detect(&self) -> Option<PayloadExtent> {
        let Some(descriptor) = IdbDescriptor::decode(self.buffer.sector(0)) else {
            info!("no IDB header at block {DATA_START_LBA}; not staging");
            return None;
        };

        if !descriptor.extent.is_valid() {
            warn!("IDB payload {:?} exceeds the size limit; not staging", descriptor.extent);
            return None;
        }

        debug!("staging IDB with payload {:?}", descriptor.extent);
        Some(descriptor.extent)
    }

    fn commit(&mut self, extent: PayloadExtent) -> CommitReport {
        info!(
            "IDB image complete ({} sectors at sector {}), writing copies",
            extent.size, extent.offset
        );

        let report = self.store.commit(&mut self.buffer, extent);
        self.loaded = report.restored;
        info!(
            "IDB copies written to {:?}; {} invalidated, {} failed",
            report.written,
            report.invalidated.len(),
            report.failed.len()
        );
        report
    }

    /// Handle a write of one block, returning the report if it completed an image
    fn write_block(&mut self, lba: u64, data: &[u8]) -> Option<CommitReport> {
        if !Self::data_window().contains(&lba) {
            if let Some(extent) = self.staging.take() {
                warn!("write to block {lba} interrupted staging of IDB {extent:?}; discarding it");
                self.restore();
            }
            return None;
        }

        let sector = (lba - DATA_START_LBA) as u32;
        if sector == 0 {
            self.buffer.clear();
            self.buffer.sector_mut(0).copy_from_slice(data);
            self.staging = self.detect();
        } else if self.staging.is_some() {
            self.buffer.sector_mut(sector).copy_from_slice(data);
        } else {
            debug!("ignoring write to block {lba}: no IDB being staged");
        }

        let extent = self.staging?;
        if sector + 1 != extent.end() {
            return None;
        }

        self.staging = None;
        Some(self.commit(extent))
    }
}

impl<N: Nand> BlockDevice for RkmtdDevice<N> {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn block_count(&self) -> u64 {
        TOTAL_BLOCKS
    }

    fn read_blocks(&mut self, start: u64, count: u64, dst: &mut [u8]) -> u64 {
        if !Self::accepts(start, count, dst.len()) {
            return 0;
        }

        for (lba, block) in (start..start + count).zip(dst.chunks_exact_mut(BLOCK_SIZE)) {
            if Self::data_window().contains(&lba) {
                block.copy_from_slice(self.buffer.sector((lba - DATA_START_LBA) as u32));
            } else {
                self.table.read_block(lba, block);
            }
        }

        count
    }

    fn write_blocks(&mut self, start: u64, count: u64, src: &[u8]) -> u64 {
        if !Self::accepts(start, count, src.len()) {
            return 0;
        }

        for (lba, block) in (start..start + count).zip(src.chunks_exact(BLOCK_SIZE)) {
            if let Some(report) = self.write_block(lba, block) {
                if report.written.is_empty() {
                    warn!("no IDB copy could be written");
                    return lba - start;
                }
            }
        }

        count
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::disk::gpt::GptHeader;
    use crate::idb::testutil::{geometry, sample, sim};
    use crate::idb::{scan_idb, DEFAULT_TARGETS, IDB_BUF_SIZE};
    use crate::nand::{Fault, NandBlock, SimNand};

    fn device(nand: SimNand) -> RkmtdDevice<SimNand> {
        let store = IdbStore::with_geometry(nand, geometry(), 8).unwrap();
        RkmtdDevice::with_store(store, &DeviceConfig::default()).unwrap()
    }

    /// An IDB image file, as a host would write it to the partition
    fn image(extent: PayloadExtent) -> Vec<u8> {
        let buf = sample(extent).unwrap();
        buf[..extent.end() as usize * BLOCK_SIZE].to_vec()
    }

    fn read_window(dev: &mut RkmtdDevice<SimNand>) -> Vec<u8> {
        let mut out = vec![0; IDB_BUF_SIZE];
        assert_eq!(dev.read_blocks(DATA_START_LBA, 512, &mut out), 512);
        out
    }

    #[test]
    fn test_metadata_blocks() {
        let mut dev = device(sim());
        let mut block = [0u8; BLOCK_SIZE];

        assert_eq!(dev.read_blocks(0, 1, &mut block), 1);
        assert_eq!(block[510..], [0x55, 0xAA]);
        assert_eq!(block[446 + 4], 0xEE);

        assert_eq!(dev.read_blocks(1, 1, &mut block), 1);
        assert!(GptHeader::parse(&block).unwrap().check_crc());

        assert_eq!(dev.read_blocks(TOTAL_BLOCKS - 1, 1, &mut block), 1);
        let backup = GptHeader::parse(&block).unwrap();
        assert!(backup.check_crc());
        assert_eq!(backup.my_lba, TOTAL_BLOCKS - 1);

        // Writes outside the data window are accepted, but change nothing
        let junk = [0x5Au8; BLOCK_SIZE];
        assert_eq!(dev.write_blocks(1, 1, &junk), 1);
        assert_eq!(dev.read_blocks(1, 1, &mut block), 1);
        assert!(GptHeader::parse(&block).unwrap().check_crc());

        // Gaps read as zeros
        block.fill(0xFF);
        assert_eq!(dev.read_blocks(10, 1, &mut block), 1);
        assert!(block.iter().all(|&x| x == 0));

        let info = dev.info();
        assert_eq!(info.vendor, "0x2207");
        assert_eq!(info.product, "RKMTD");
        assert_eq!(info.revision, "V1.00");
        assert_eq!(info.block_count, 609);
        assert!(info.removable);
    }

    #[test]
    fn test_rejected_requests() {
        let mut dev = device(sim());
        let mut buf = vec![0u8; 4 * BLOCK_SIZE];

        assert_eq!(dev.read_blocks(0, 0, &mut buf), 0);
        assert_eq!(dev.read_blocks(TOTAL_BLOCKS, 1, &mut buf), 0);
        assert_eq!(dev.read_blocks(TOTAL_BLOCKS - 2, 3, &mut buf), 0);
        assert_eq!(dev.read_blocks(0, 5, &mut buf), 0);
        assert_eq!(dev.read_blocks(u64::MAX, 2, &mut buf), 0);
        assert_eq!(dev.write_blocks(0, 0, &buf), 0);
        assert_eq!(dev.write_blocks(TOTAL_BLOCKS - 1, 2, &buf), 0);
        assert_eq!(dev.write_blocks(64, 5, &buf), 0);

        assert_eq!(dev.read_blocks(TOTAL_BLOCKS - 4, 4, &mut buf), 4);
    }

    #[test]
    fn test_write_image() -> anyhow::Result<()> {
        let mut dev = device(sim());
        let extent = PayloadExtent::new(4, 60);
        let image = image(extent);

        // Written in two pieces; nothing reaches flash until the last block
        assert_eq!(dev.write_blocks(64, 40, &image[..40 * BLOCK_SIZE]), 40);
        assert!(dev.is_staging());
        assert!(dev.store().directory().is_empty());

        assert_eq!(dev.write_blocks(104, 24, &image[40 * BLOCK_SIZE..]), 24);
        assert!(!dev.is_staging());
        assert_eq!(
            dev.store()
                .directory()
                .iter()
                .map(|e| e.block)
                .collect::<Vec<_>>(),
            DEFAULT_TARGETS
        );
        assert_eq!(dev.loaded(), Some(IdbEntry { block: 2, extent }));

        let window = read_window(&mut dev);
        assert_eq!(window[..image.len()], image);
        assert!(window[image.len()..].iter().all(|&x| x == 0));

        // A fresh device over the same flash sees the same image
        let nand = dev.into_store().into_nand();
        let mut dev = device(nand);
        assert_eq!(read_window(&mut dev)[..image.len()], image);
        Ok(())
    }

    #[test]
    fn test_write_not_an_image() {
        let mut dev = device(sim());
        let junk = vec![0x11u8; 8 * BLOCK_SIZE];

        assert_eq!(dev.write_blocks(64, 8, &junk), 8);
        assert!(!dev.is_staging());
        assert!(dev.store().directory().is_empty());

        // The first block stays visible, but later ones were never staged
        let window = read_window(&mut dev);
        assert!(window[..BLOCK_SIZE].iter().all(|&x| x == 0x11));
        assert!(window[BLOCK_SIZE..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_write_oversized_image() -> anyhow::Result<()> {
        let mut dev = device(sim());
        let mut header = [0u8; BLOCK_SIZE];
        IdbDescriptor::new(PayloadExtent::new(4, 600)).encode(&mut header)?;

        assert_eq!(dev.write_blocks(64, 1, &header), 1);
        assert!(!dev.is_staging());
        Ok(())
    }

    #[test]
    fn test_interrupted_staging() {
        let mut dev = device(sim());
        let extent = PayloadExtent::new(4, 60);
        let old = image(extent);
        assert_eq!(dev.write_blocks(64, 64, &old), 64);

        // Start a different image, then wander off before it is complete
        let new = image(PayloadExtent::new(4, 100));
        assert_eq!(dev.write_blocks(64, 10, &new[..10 * BLOCK_SIZE]), 10);
        assert!(dev.is_staging());
        assert_ne!(read_window(&mut dev)[..old.len()], old);

        assert_eq!(dev.write_blocks(0, 1, &[0u8; BLOCK_SIZE]), 1);
        assert!(!dev.is_staging());
        assert_eq!(read_window(&mut dev)[..old.len()], old);
        assert_eq!(dev.store().directory().len(), DEFAULT_TARGETS.len());
    }

    #[test]
    fn test_stray_window_writes_ignored() {
        let mut dev = device(sim());
        let extent = PayloadExtent::new(4, 12);
        let img = image(extent);
        assert_eq!(dev.write_blocks(64, 16, &img), 16);

        assert_eq!(dev.write_blocks(70, 1, &[0xEEu8; BLOCK_SIZE]), 1);
        assert_eq!(read_window(&mut dev)[..img.len()], img);
    }

    #[test]
    fn test_commit_writes_nothing() -> anyhow::Result<()> {
        let mut nand = sim();
        for index in DEFAULT_TARGETS {
            nand.block(index)?.unwrap().mark_bad()?;
        }
        let mut dev = device(nand);

        let extent = PayloadExtent::new(4, 60);
        let image = image(extent);
        assert_eq!(dev.write_blocks(64, 64, &image), 63);
        assert_eq!(dev.loaded(), None);
        assert!(read_window(&mut dev).iter().all(|&x| x == 0));
        Ok(())
    }

    #[test]
    fn test_reads_follow_surviving_copy() -> anyhow::Result<()> {
        // The first target fails verification, so the image is served from the second
        let mut nand = sim();
        nand.inject_fault(2, 2, Fault::CorruptProgram);
        let mut dev = device(nand);

        let extent = PayloadExtent::new(4, 60);
        let image = image(extent);
        assert_eq!(dev.write_blocks(64, 64, &image), 64);
        assert_eq!(dev.loaded(), Some(IdbEntry { block: 3, extent }));

        let window = read_window(&mut dev);
        assert_eq!(window[..image.len()], image);

        // The invalidated copy is gone for good
        let mut nand = dev.into_store().into_nand();
        let blocks: Vec<u32> = scan_idb(&mut nand, 8).iter().map(|e| e.block).collect();
        assert_eq!(blocks, [3, 4, 5, 6]);
        Ok(())
    }
}
