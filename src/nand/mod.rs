//! Abstractions and code to access NAND flash

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::{bail, ensure};

#[cfg(target_os = "linux")]
pub mod mtd;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,
    pub spare_bytes_per_page: usize,
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTESxSPARE"
///
/// When the spare size is omitted, 1/32 of the page size is assumed.
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('x').collect();
        let (blocks, pages_per_block, bytes_per_page, spare) = match parts[..] {
            [b, p, n] => (b, p, n, None),
            [b, p, n, s] => (b, p, n, Some(s)),
            _ => bail!("expected #x#x# or #x#x#x#"),
        };
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page: usize = bytes_per_page.parse()?;
        let spare_bytes_per_page = match spare {
            Some(s) => s.parse()?,
            None => bytes_per_page / 32,
        };

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            spare_bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;

    /// Read the chip's identification bytes (the response to a READ ID command)
    fn read_id(&mut self) -> anyhow::Result<Vec<u8>>;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// How many spare (OOB) bytes accompany each page?
    fn spare_size(&self) -> usize;

    /// Read one page and its spare area
    ///
    /// `data` must be exactly page-sized; `spare` may be shorter than the spare area, in which
    /// case only its leading bytes are returned.
    fn read(&self, page: u32, data: &mut [u8], spare: &mut [u8]) -> anyhow::Result<()>;

    /// Program one page and its spare area
    ///
    /// Programming can only clear bits; any bit already 0 stays 0 until the next erase. Pages
    /// should be programmed in ascending order to comply with the sequential-write requirements
    /// of MLC NANDs, except for rewrites that only clear further bits.
    fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// Failure modes that can be injected into a [SimNand] page
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Fault {
    /// Programming the page reports success but stores nothing
    DropProgram,

    /// Programming the page reports success but stores data with its first byte inverted
    CorruptProgram,

    /// Reading the page fails
    ReadError,

    /// Erasing the page's block fails
    EraseError,
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
    id: Vec<u8>,
}

/// One programmed page of a [SimBlock]
#[derive(Debug, Clone)]
struct SimPage {
    data: Box<[u8]>,
    spare: Box<[u8]>,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// Pages that have been programmed since the last erase; absent pages read as erased
    pages: BTreeMap<u32, SimPage>,

    /// Injected faults, by page
    faults: BTreeMap<u32, Fault>,

    /// How many pages in this block
    page_count: u32,

    /// How many bytes per page
    page_size: usize,

    /// How many spare bytes per page
    spare_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self {
            blocks,
            layout,
            id: Vec::new(),
        }
    }

    /// Set the identification bytes reported by [Nand::read_id]
    pub fn with_id(mut self, id: &[u8]) -> Self {
        self.id = id.to_vec();
        self
    }

    /// Arrange for an operation on `page` of `block` to misbehave
    pub fn inject_fault(&mut self, block: u32, page: u32, fault: Fault) {
        self.blocks[block as usize].faults.insert(page, fault);
    }

    /// Remove every injected fault
    pub fn clear_faults(&mut self) {
        self.blocks.iter_mut().for_each(|b| b.faults.clear());
    }

    /// Rewrite the stored bytes of a page directly, bypassing program semantics
    ///
    /// This models corruption after the fact (e.g. disturb errors), which a real program
    /// operation could never produce.
    pub fn tamper<F: FnOnce(&mut [u8], &mut [u8])>(&mut self, block: u32, page: u32, f: F) {
        let block = &mut self.blocks[block as usize];
        let (page_size, spare_size) = (block.page_size, block.spare_size);
        let page = block
            .pages
            .entry(page)
            .or_insert_with(|| SimPage::erased(page_size, spare_size));
        f(&mut page.data, &mut page.spare);
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// The stream holds every page of every block, each page's data followed by its spare area.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut data = vec![0; self.layout.bytes_per_page];
        let mut spare = vec![0; self.layout.spare_bytes_per_page];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.pages.clear();
            for page in 0..self.layout.pages_per_block {
                read.read_exact(&mut data)?;
                read.read_exact(&mut spare)?;
                block.write_page(page, &data, &spare)?;
            }
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File), in
    /// the format accepted by [SimNand::load]
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut data = vec![0; self.layout.bytes_per_page];
        let mut spare = vec![0; self.layout.spare_bytes_per_page];

        let pages_per_block = self.layout.pages_per_block;
        for block in 0..self.layout.blocks {
            let block = self.block(block)?;
            for page in 0..pages_per_block {
                match &block {
                    None => {
                        data.fill(0xBD);
                        spare.fill(0xBD);
                    }
                    Some(block) => block.read_page(page, &mut data, &mut spare)?,
                };

                write.write_all(&data)?;
                write.write_all(&spare)?;
            }
        }

        Ok(())
    }
}

impl SimPage {
    fn erased(page_size: usize, spare_size: usize) -> Self {
        Self {
            data: vec![0xFF; page_size].into(),
            spare: vec![0xFF; spare_size].into(),
        }
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            pages: Default::default(),
            faults: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            spare_size: layout.spare_bytes_per_page,
            marked_bad: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8], spare: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(spare.len() <= self.spare_size, "spare larger than spare area");
        ensure!(index < self.page_count, "page index out of bounds");

        let fault = self.faults.get(&index).copied();
        if fault == Some(Fault::DropProgram) {
            return Ok(());
        }

        // Writing fully-erased content is a no-op.
        if content.is_erased() && spare.is_erased() {
            return Ok(());
        }

        let (page_size, spare_size) = (self.page_size, self.spare_size);
        let page = self
            .pages
            .entry(index)
            .or_insert_with(|| SimPage::erased(page_size, spare_size));

        // Programming can only clear bits.
        page.data
            .iter_mut()
            .zip(content)
            .for_each(|(cell, &bits)| *cell &= bits);
        page.spare
            .iter_mut()
            .zip(spare)
            .for_each(|(cell, &bits)| *cell &= bits);

        if fault == Some(Fault::CorruptProgram) {
            page.data[0] = !content[0];
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8], spare: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(spare.len() <= self.spare_size, "spare larger than spare area");
        ensure!(index < self.page_count, "page index out of bounds");

        if self.faults.get(&index) == Some(&Fault::ReadError) {
            bail!("uncorrectable ECC error on page {index}");
        }

        if let Some(page) = self.pages.get(&index) {
            content.copy_from_slice(&page.data);
            spare.copy_from_slice(&page.spare[..spare.len()]);
        } else {
            content.fill(0xFF);
            spare.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read_id(&mut self) -> anyhow::Result<Vec<u8>> {
        ensure!(!self.id.is_empty(), "simulated NAND has no ID configured");
        Ok(self.id.clone())
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }
    fn spare_size(&self) -> usize {
        self.spare_size
    }

    fn read(&self, page: u32, data: &mut [u8], spare: &mut [u8]) -> anyhow::Result<()> {
        self.read_page(page, data, spare)
    }

    fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> anyhow::Result<()> {
        self.write_page(page, data, spare)
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        if self.faults.values().any(|&f| f == Fault::EraseError) {
            bail!("erase failed");
        }

        self.pages.clear();

        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.pages.clear();
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    spare_bytes_per_page: 8,
};

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    assert_eq!("8x16x256x8".parse::<NandLayout>()?, TEST_LAYOUT);
    assert_eq!("8x16x256".parse::<NandLayout>()?, TEST_LAYOUT);
    assert!("8x16".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let spare_in = [0x12u8, 0x34, 0x56, 0x78];
    let mut data_out = data_in.clone();
    let mut spare_out = [0u8; 8];

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in, &spare_in).unwrap();

    block.read(1, &mut data_out, &mut spare_out).unwrap();
    assert!(data_out.is_erased());
    assert!(spare_out.is_erased());

    block.read(2, &mut data_out, &mut spare_out).unwrap();
    assert_eq!(data_out, data_in);
    assert_eq!(spare_out[..4], spare_in);
    assert!(spare_out[4..].is_erased());

    // Reprogramming can only clear more bits
    block.program(2, &vec![0x0F; data_in.len()], &[]).unwrap();
    block.read(2, &mut data_out, &mut spare_out).unwrap();
    assert!(data_out.iter().all(|&x| x == 0x05));
    assert_eq!(spare_out[..4], spare_in);

    block.erase().unwrap();
    block.read(2, &mut data_out, &mut spare_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_faults() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.inject_fault(1, 3, Fault::DropProgram);
    nand.inject_fault(1, 4, Fault::CorruptProgram);
    nand.inject_fault(1, 5, Fault::ReadError);

    let data_in = vec![0x5Au8; TEST_LAYOUT.bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(1).unwrap().unwrap();
    block.program(3, &data_in, &[]).unwrap();
    block.program(4, &data_in, &[]).unwrap();

    block.read(3, &mut data_out, &mut []).unwrap();
    assert!(data_out.is_erased());

    block.read(4, &mut data_out, &mut []).unwrap();
    assert_eq!(data_out[0], 0xA5);
    assert_eq!(data_out[1..], data_in[1..]);

    assert!(block.read(5, &mut data_out, &mut []).is_err());

    nand.clear_faults();
    let block = nand.block(1).unwrap().unwrap();
    assert!(block.read(5, &mut data_out, &mut []).is_ok());
}

#[test]
fn test_sim_load_save() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8))?;

    let mut data = vec![0u8; TEST_LAYOUT.bytes_per_page];
    let mut spare = vec![0u8; TEST_LAYOUT.spare_bytes_per_page];
    let block = nand.block(3)?.unwrap();
    block.read(7, &mut data, &mut spare)?;
    assert!(data.iter().all(|&x| x == 0x55u8));
    assert!(spare.iter().all(|&x| x == 0x55u8));

    let mut image = Vec::new();
    nand.save(&mut image)?;
    let page_bytes = TEST_LAYOUT.bytes_per_page + TEST_LAYOUT.spare_bytes_per_page;
    assert_eq!(
        image.len(),
        page_bytes * (TEST_LAYOUT.pages_per_block * TEST_LAYOUT.blocks) as usize
    );
    assert!(image.iter().all(|&x| x == 0x55u8));

    Ok(())
}

#[test]
fn test_sim_save_bad_block() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.block(1)?.unwrap().mark_bad()?;

    let mut image = Vec::new();
    nand.save(&mut image)?;
    let page_bytes = TEST_LAYOUT.bytes_per_page + TEST_LAYOUT.spare_bytes_per_page;
    let block_bytes = page_bytes * TEST_LAYOUT.pages_per_block as usize;
    assert!(image[..block_bytes].iter().all(|&x| x == 0xFF));
    assert!(image[block_bytes..2 * block_bytes].iter().all(|&x| x == 0xBD));
    Ok(())
}
