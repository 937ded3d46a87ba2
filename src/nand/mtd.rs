//! NAND abstraction layer implementation over the Linux MTD subsystem

use super::{Nand, NandBlock, NandLayout};

use anyhow::{bail, ensure};

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::mem::MaybeUninit;
use std::os::{fd::AsRawFd, unix::fs::FileExt};
use std::path::Path;

/// NAND flash that wraps an open /dev/mtdX file
#[derive(Debug)]
pub struct MtdNand {
    file: File,
    layout: NandLayout,
    id: Option<Vec<u8>>,
}

impl MtdNand {
    /// Open an `mtd` device, by path (e.g. "/dev/mtd0")
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let file = File::options().read(true).write(true).open(path)?;
        let layout = unsafe {
            let mut info = MaybeUninit::<ioctl::mtd_info_user>::uninit();
            ioctl::memgetinfo(file.as_raw_fd(), info.as_mut_ptr())?;
            info.assume_init()
        }
        .try_into()?;

        Ok(Self {
            file,
            layout,
            id: None,
        })
    }

    /// Open an `mtd` device by its name, by searching `/proc/mtd`
    pub fn open_named(name: &str) -> anyhow::Result<Self> {
        // Put `name` in quotes
        let name = format!("\"{name}\"");

        let proc_mtd = File::open("/proc/mtd")?;
        let proc_mtd = BufReader::new(proc_mtd);
        for line in proc_mtd.lines() {
            let line = line?;
            if line.contains(&name) {
                if let Some(mtd_dev) = line.split(':').next() {
                    return Self::open(Path::new("/dev").join(mtd_dev));
                }
            }
        }

        bail!("MTD device {name} could not be found");
    }

    /// Supply the chip's identification bytes
    ///
    /// MTD has no userspace interface for issuing READ ID, so they must come from elsewhere
    /// (e.g. the kernel log or the board's documentation).
    pub fn with_id(mut self, id: &[u8]) -> Self {
        self.id = Some(id.to_vec());
        self
    }
}

impl Nand for MtdNand {
    type Block<'a> = MtdBlock<'a>;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<MtdBlock<'_>>> {
        ensure!(index < self.layout.blocks, "block {index} out of range");

        let block_size = self.layout.pages_per_block as u64 * self.layout.bytes_per_page as u64;
        let block_base: u64 = block_size * index as u64;
        let bad = unsafe { ioctl::memgetbadblock(self.file.as_raw_fd(), &block_base)? };
        if bad == 0 {
            Ok(Some(MtdBlock { nand: self, index }))
        } else {
            Ok(None)
        }
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }

    fn read_id(&mut self) -> anyhow::Result<Vec<u8>> {
        self.id
            .clone()
            .ok_or(anyhow::anyhow!("chip ID of MTD device is unknown"))
    }
}

pub struct MtdBlock<'a> {
    nand: &'a MtdNand,
    index: u32,
}

impl MtdBlock<'_> {
    /// Compute the number of bytes in this block
    fn size(&self) -> u64 {
        self.nand.layout.pages_per_block as u64 * self.nand.layout.bytes_per_page as u64
    }

    /// Compute the offset of the first byte of this block
    fn base(&self) -> u64 {
        self.size() * self.index as u64
    }

    /// Ensure that the page and buffer sizes are valid, and compute the /dev/mtdX offset for the
    /// page
    fn offset_for(&self, page: u32, data: usize, spare: usize) -> anyhow::Result<u64> {
        ensure!(data == self.page_size(), "buffer not page-sized");
        ensure!(spare <= self.spare_size(), "spare buffer larger than OOB area");
        ensure!(
            page < self.page_count(),
            "block {0}, page {page} out of bounds",
            self.index
        );

        Ok(self.base() + self.page_size() as u64 * page as u64)
    }
}

impl NandBlock for MtdBlock<'_> {
    fn page_count(&self) -> u32 {
        self.nand.layout.pages_per_block
    }
    fn page_size(&self) -> usize {
        self.nand.layout.bytes_per_page
    }
    fn spare_size(&self) -> usize {
        self.nand.layout.spare_bytes_per_page
    }
    fn read(&self, page: u32, data: &mut [u8], spare: &mut [u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(page, data.len(), spare.len())?;
        self.nand.file.read_exact_at(data, offset)?;

        if !spare.is_empty() {
            let mut oob = ioctl::mtd_oob_buf64 {
                start: offset,
                pad: 0,
                length: spare.len() as u32,
                usr_ptr: spare.as_mut_ptr() as u64,
            };
            unsafe {
                ioctl::memreadoob64(self.nand.file.as_raw_fd(), &mut oob)?;
            }
        }

        Ok(())
    }
    fn program(&mut self, page: u32, data: &[u8], spare: &[u8]) -> anyhow::Result<()> {
        let offset = self.offset_for(page, data.len(), spare.len())?;
        let mut req = ioctl::mtd_write_req {
            start: offset,
            len: data.len() as u64,
            ooblen: spare.len() as u64,
            usr_data: data.as_ptr() as u64,
            usr_oob: if spare.is_empty() {
                0
            } else {
                spare.as_ptr() as u64
            },
            mode: ioctl::MTD_OPS_PLACE_OOB,
            padding: [0; 7],
        };
        unsafe {
            ioctl::memwrite(self.nand.file.as_raw_fd(), &mut req)?;
        }
        Ok(())
    }
    fn erase(&mut self) -> anyhow::Result<()> {
        let erase_info = ioctl::erase_info_user {
            start: self.base().try_into()?,
            length: self.size().try_into()?,
        };
        unsafe {
            ioctl::memerase(self.nand.file.as_raw_fd(), &erase_info)?;
        }
        Ok(())
    }
    fn mark_bad(self) -> anyhow::Result<()> {
        let block_base: u64 = self.base();
        unsafe {
            ioctl::memsetbadblock(self.nand.file.as_raw_fd(), &block_base)?;
        }
        Ok(())
    }
}

mod ioctl {
    //! The private ioctls for interfacing with MTD devices

    use super::NandLayout;

    use anyhow::ensure;
    use nix::{ioctl_read, ioctl_readwrite, ioctl_write_ptr};

    const MTD_IOC_MAGIC: u8 = b'M';

    /// Place OOB bytes at the given offsets, without ECC layout translation
    pub const MTD_OPS_PLACE_OOB: u8 = 0;

    #[repr(C)]
    pub struct mtd_info_user {
        pub r#type: u8,
        pub flags: u32,
        pub size: u32,
        pub erasesize: u32,
        pub writesize: u32,
        pub oobsize: u32,
        pub padding: u64,
    }
    ioctl_read!(memgetinfo, MTD_IOC_MAGIC, 1, mtd_info_user);

    impl TryInto<NandLayout> for mtd_info_user {
        type Error = anyhow::Error;

        fn try_into(self) -> anyhow::Result<NandLayout> {
            ensure!(self.writesize > 1, "MTD device is not page-addressed NAND");
            ensure!(
                self.size % self.erasesize == 0,
                "MTD size not multiple of erasesize"
            );
            ensure!(
                self.erasesize % self.writesize == 0,
                "MTD erasesize not multiple of writesize"
            );

            let blocks = self.size / self.erasesize;
            let pages_per_block = self.erasesize / self.writesize;
            let bytes_per_page = self.writesize as usize;
            let spare_bytes_per_page = self.oobsize as usize;

            Ok(NandLayout {
                blocks,
                pages_per_block,
                bytes_per_page,
                spare_bytes_per_page,
            })
        }
    }

    #[repr(C)]
    pub struct erase_info_user {
        pub start: u32,
        pub length: u32,
    }
    ioctl_write_ptr!(memerase, MTD_IOC_MAGIC, 2, erase_info_user);

    ioctl_write_ptr!(memgetbadblock, MTD_IOC_MAGIC, 11, u64);
    ioctl_write_ptr!(memsetbadblock, MTD_IOC_MAGIC, 12, u64);

    #[repr(C)]
    pub struct mtd_oob_buf64 {
        pub start: u64,
        pub pad: u32,
        pub length: u32,
        pub usr_ptr: u64,
    }
    ioctl_readwrite!(memreadoob64, MTD_IOC_MAGIC, 22, mtd_oob_buf64);

    #[repr(C)]
    pub struct mtd_write_req {
        pub start: u64,
        pub len: u64,
        pub ooblen: u64,
        pub usr_data: u64,
        pub usr_oob: u64,
        pub mode: u8,
        pub padding: [u8; 7],
    }
    ioctl_readwrite!(memwrite, MTD_IOC_MAGIC, 24, mtd_write_req);
}
