//! Inspect and rewrite the IDB of a Rockchip raw NAND.
//!
//! Every command goes through the same block device a host would see, so `dump` produces a disk
//! image with the IDB partition in it, and `write` updates the IDB exactly as writing that
//! partition would.

use anyhow::{bail, ensure, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{info, warn};

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

#[cfg(target_os = "linux")]
use rkmtd::nand::mtd::MtdNand;
use rkmtd::{
    chip::{resolve, ChipId},
    config::{DeviceConfig, DEFAULT_BOOT_BLOCKS, DEFAULT_PARTITION_NAME},
    disk::{BlockDevice, Guid, RkmtdDevice, BLOCK_SIZE, DATA_START_LBA},
    idb::{IdbDescriptor, IDB_BUF_SIZE},
    nand::{Nand, SimNand},
    page_table::PageOrderTable,
    registry::Registry,
    util::read_image,
};

#[derive(Args, Debug)]
#[group(required = true)]
struct NandOptions {
    /// Name of the MTD device or partition
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options", requires = "chip_id")]
    mtd_name: Option<String>,

    /// Path to a `/dev/mtdX` device
    #[cfg(target_os = "linux")]
    #[clap(long, group = "nand-options", requires = "chip_id")]
    mtd_dev: Option<PathBuf>,

    /// Identification bytes of the MTD device's chip, in hex (e.g. 2c88044ba900)
    #[cfg(target_os = "linux")]
    #[clap(long)]
    chip_id: Option<ChipId>,

    /// Path to the NAND image to use; a blank NAND is simulated if it doesn't exist yet
    #[clap(long, group = "nand-options", requires = "sim_chip_id")]
    sim_path: Option<PathBuf>,

    /// Identification bytes of the chip to simulate, in hex
    #[clap(long)]
    sim_chip_id: Option<ChipId>,

    /// Write back the NAND file when done
    #[clap(long, requires = "sim_path")]
    sim_write: bool,
}

impl NandOptions {
    fn open(&self) -> Result<NandImpl> {
        let nandimpl = if let Some(id) = &self.sim_chip_id {
            let (_, geometry) = resolve(&id.0)?;
            let mut sim = SimNand::new(geometry.nand_layout()).with_id(&id.0);
            if let Some(path) = &self.sim_path {
                if path.exists() {
                    sim.load(&mut File::open(path)?)?;
                } else {
                    info!("{} does not exist; starting from a blank NAND", path.display());
                }
            }

            NandImpl::Sim(sim)
        } else {
            #[cfg(target_os = "linux")]
            {
                let mtd = {
                    if let Some(name) = &self.mtd_name {
                        MtdNand::open_named(name)?
                    } else if let Some(dev) = &self.mtd_dev {
                        MtdNand::open(dev)?
                    } else {
                        unreachable!()
                    }
                };

                match &self.chip_id {
                    Some(id) => NandImpl::Mtd(mtd.with_id(&id.0)),
                    None => NandImpl::Mtd(mtd),
                }
            }

            #[cfg(not(target_os = "linux"))]
            unreachable!()
        };

        Ok(nandimpl)
    }

    fn cleanup(&self, nand: NandImpl) -> Result<()> {
        if self.sim_write {
            if let Some(path) = &self.sim_path {
                if let NandImpl::Sim(mut sim_nand) = nand {
                    sim_nand.save(&mut File::create(path)?)?;
                    info!("saved NAND to {}", path.display());
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug)]
enum NandImpl {
    Sim(SimNand),

    #[cfg(target_os = "linux")]
    Mtd(MtdNand),
}

/// How to present the NAND as a device
#[derive(Args, Debug)]
struct DeviceOptions {
    /// Label to attach the device under (it is named "rkmtd-LABEL")
    #[clap(long, default_value = "nand")]
    label: String,

    /// Number of eraseblocks at the start of the NAND that hold IDB copies
    #[clap(long, default_value_t = DEFAULT_BOOT_BLOCKS)]
    boot_blocks: u32,

    /// GUID of the disk, instead of a random one
    #[clap(long)]
    disk_guid: Option<Guid>,

    /// Unique GUID of the IDB partition, instead of a random one
    #[clap(long)]
    partition_guid: Option<Guid>,

    /// Name of the IDB partition
    #[clap(long, default_value = DEFAULT_PARTITION_NAME)]
    partition_name: String,
}

impl DeviceOptions {
    fn config(&self) -> DeviceConfig {
        DeviceConfig {
            boot_blocks: self.boot_blocks,
            disk_guid: self.disk_guid,
            partition_guid: self.partition_guid,
            partition_name: self.partition_name.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the IDB copies on the NAND
    Scan,

    /// Show which physical pages hold the first groups of an IDB copy
    PageTable {
        /// Number of groups to show
        #[clap(long, default_value_t = 32)]
        count: usize,
    },

    /// Describe the device and its partition table
    Gpt,

    /// Save the device's contents to a file
    Dump {
        /// Save only the IDB partition, rather than the whole disk
        #[clap(long)]
        partition: bool,

        /// The file to write
        output: PathBuf,
    },

    /// Write an IDB image to every copy on the NAND
    Write {
        /// The image, starting with its header sector
        image: PathBuf,
    },
}

impl Command {
    fn execute<N: Nand>(&self, device: &mut RkmtdDevice<N>) -> Result<()> {
        match self {
            Command::Scan => {
                let store = device.store();
                let geometry = store.geometry();
                println!(
                    "{} blocks x {} pages x {} sectors, page scheme {:?}",
                    geometry.blocks,
                    geometry.pages_per_block,
                    geometry.sectors_per_page,
                    geometry.scheme
                );

                if store.directory().is_empty() {
                    println!("No IDB copies in the first {} blocks", store.boot_blocks());
                }
                for entry in store.directory() {
                    let loaded = if device.loaded() == Some(*entry) {
                        " (loaded)"
                    } else {
                        ""
                    };
                    println!(
                        "Block {}: payload {} sectors at sector {}{loaded}",
                        entry.block, entry.extent.size, entry.extent.offset
                    );
                }
            }

            Command::PageTable { count } => {
                let table: &PageOrderTable = device.store().table();
                println!("Page scheme {:?}", table.scheme());
                for (group, page) in table.as_slice().iter().take(*count).enumerate() {
                    println!("Group {group:3} -> page {page}");
                }
            }

            Command::Gpt => {
                let info = device.info();
                let table = device.partition_table();
                let range = table.partition_range();
                println!(
                    "{} {} {}{}",
                    info.vendor,
                    info.product,
                    info.revision,
                    if info.removable { " (removable)" } else { "" }
                );
                println!("{} blocks of {} bytes", info.block_count, info.block_size);
                println!("Disk GUID {}", table.disk_guid());
                println!(
                    "Partition {}..={}, GUID {}",
                    range.start(),
                    range.end(),
                    table.partition_guid()
                );
            }

            Command::Dump { partition, output } => {
                let (start, count) = if *partition {
                    let range = device.partition_table().partition_range();
                    (*range.start(), range.end() - range.start() + 1)
                } else {
                    (0, device.block_count())
                };

                let mut data = vec![0u8; count as usize * device.block_size()];
                let read = device.read_blocks(start, count, &mut data);
                ensure!(read == count, "read {read} of {count} blocks");

                File::create(output)?.write_all(&data)?;
                println!("Wrote {count} blocks to {}", output.display());
            }

            Command::Write { image } => {
                let data = read_image(&mut File::open(image)?, IDB_BUF_SIZE, BLOCK_SIZE)
                    .with_context(|| format!("reading {}", image.display()))?;
                let Some(descriptor) = IdbDescriptor::decode(&data[..BLOCK_SIZE]) else {
                    bail!("{} does not start with an IDB header", image.display());
                };
                ensure!(
                    descriptor.extent.is_valid(),
                    "IDB payload {:?} does not fit",
                    descriptor.extent
                );
                let needed = descriptor.extent.end() as usize * BLOCK_SIZE;
                ensure!(
                    data.len() >= needed,
                    "image is {} bytes but its header describes {needed}",
                    data.len()
                );

                let count = (data.len() / BLOCK_SIZE) as u64;
                let written = device.write_blocks(DATA_START_LBA, count, &data);
                if device.is_staging() {
                    warn!("image did not complete; nothing was written");
                }
                ensure!(written == count, "only {written} of {count} blocks were written");

                let blocks: Vec<u32> = device.store().directory().iter().map(|x| x.block).collect();
                println!("IDB copies now in blocks {blocks:?}");
            }
        };

        Ok(())
    }
}

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// The NAND to use
    #[clap(flatten)]
    nand: NandOptions,

    #[clap(flatten)]
    device: DeviceOptions,

    /// The command to run against the device
    #[clap(subcommand)]
    cmd: Command,
}

impl Cli {
    /// Attach `nand` as a device, run the command on it, and hand the NAND back
    fn run<N: Nand>(&self, nand: N) -> Result<N> {
        let label = &self.device.label;
        let config = self.device.config();

        let mut registry = Registry::new();
        let attached = registry.create_attach(label, || RkmtdDevice::open(nand, &config))?;
        info!("attached {}", attached.name());
        registry.set_current(label)?;

        let current = registry
            .current_mut()
            .context("attached device is missing")?;
        self.cmd.execute(current.device_mut())?;

        let device = registry.detach(label).context("attached device is missing")?;
        Ok(device.into_store().into_nand())
    }
}

fn main() -> Result<()> {
    let args = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    howudoin::init(howudoin::consumers::TermLine::default());

    let nand = match args.nand.open()? {
        NandImpl::Sim(nand) => NandImpl::Sim(args.run(nand)?),

        #[cfg(target_os = "linux")]
        NandImpl::Mtd(nand) => NandImpl::Mtd(args.run(nand)?),
    };
    args.nand.cleanup(nand)?;
    Ok(())
}
