//! Synthesis of the partition table presented in front of the IDB: a protective MBR, primary and
//! backup GPT headers, and a single-entry partition array.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure};
use crc::{Crc, CRC_32_ISO_HDLC};
use deku::prelude::*;

use super::{BLOCK_SIZE, DATA_START_LBA, GPT_ENTRIES_LBA, GPT_HEADER_LBA};

pub const GPT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

const GPT_REVISION_V1: u32 = 0x0001_0000;
const GPT_HEADER_SIZE: u32 = 92;
const GPT_ENTRY_SIZE: u32 = 128;
const MBR_SIGNATURE: u16 = 0xAA55;
const MBR_OSTYPE_EFI_GPT: u8 = 0xEE;

/// Blocks at the end of the disk occupied by the backup entry array and backup header
pub const GPT_BACKUP_BLOCKS: u64 = 33;

/// Longest partition name, in UTF-16 code units
pub const MAX_NAME_LEN: usize = 36;

/// A GUID, stored in the mixed-endian byte order used on disk
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct Guid([u8; 16]);

impl Guid {
    /// The "basic data" partition type, EBD0A0A2-B9E5-4433-87C0-68B6B72699C7
    pub const BASIC_DATA: Guid = Guid::from_fields(
        0xEBD0A0A2,
        0xB9E5,
        0x4433,
        [0x87, 0xC0, 0x68, 0xB6, 0xB7, 0x26, 0x99, 0xC7],
    );

    /// Build a GUID from its textual fields
    pub const fn from_fields(d1: u32, d2: u16, d3: u16, d4: [u8; 8]) -> Self {
        let (a, b, c) = (d1.to_le_bytes(), d2.to_le_bytes(), d3.to_le_bytes());
        Self([
            a[0], a[1], a[2], a[3], b[0], b[1], c[0], c[1], d4[0], d4[1], d4[2], d4[3], d4[4],
            d4[5], d4[6], d4[7],
        ])
    }

    /// Generate a random (version 4) GUID
    pub fn random() -> Self {
        let mut bytes: [u8; 16] = rand::random();
        bytes[7] = (bytes[7] & 0x0F) | 0x40;
        bytes[8] = (bytes[8] & 0x3F) | 0x80;
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9]
        )?;
        b[10..].iter().try_for_each(|x| write!(f, "{x:02X}"))
    }
}

/// Parse strings like "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7"
impl FromStr for Guid {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let parts: Vec<&str> = s.split('-').collect();
        let lens: Vec<usize> = parts.iter().map(|p| p.len()).collect();
        if lens != [8, 4, 4, 4, 12] {
            bail!("expected a GUID like XXXXXXXX-XXXX-XXXX-XXXX-XXXXXXXXXXXX");
        }

        let tail = u64::from_str_radix(&format!("{}{}", parts[3], parts[4]), 16)?;
        Ok(Self::from_fields(
            u32::from_str_radix(parts[0], 16)?,
            u16::from_str_radix(parts[1], 16)?,
            u16::from_str_radix(parts[2], 16)?,
            tail.to_be_bytes(),
        ))
    }
}

/// Raw layout of a protective MBR, with a single partition record in use
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
struct ProtectiveMbr {
    boot_code: [u8; 440],
    unique_mbr_signature: u32,
    unknown: u16,
    boot_ind: u8,
    start_chs: [u8; 3],
    sys_ind: u8,
    end_chs: [u8; 3],
    start_sect: u32,
    nr_sects: u32,
    unused_records: [u8; 48],
    signature: u16,
}

/// Raw layout of a GPT header
#[derive(Debug, Clone, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"EFI PART")]
pub struct GptHeader {
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved1: u32,
    pub my_lba: u64,
    pub alternate_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub num_partition_entries: u32,
    pub sizeof_partition_entry: u32,
    pub partition_entry_array_crc32: u32,
}

impl GptHeader {
    fn compute_crc(&self) -> anyhow::Result<u32> {
        let mut header = self.clone();
        header.header_crc32 = 0;
        Ok(GPT_CRC.checksum(&header.to_bytes()?))
    }

    /// Recompute the header checksum, which covers every other field
    fn fix_crc(&mut self) -> anyhow::Result<()> {
        self.header_crc32 = self.compute_crc()?;
        Ok(())
    }

    /// Does the stored checksum match the header contents?
    pub fn check_crc(&self) -> bool {
        self.compute_crc().is_ok_and(|crc| crc == self.header_crc32)
    }

    /// Parse a header from a byte slice
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (_, header) = Self::from_bytes((bytes, 0)).ok()?;
        Some(header)
    }
}

/// Raw layout of a GPT partition entry
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GptEntry {
    pub partition_type_guid: [u8; 16],
    pub unique_partition_guid: [u8; 16],
    pub starting_lba: u64,
    pub ending_lba: u64,
    pub attributes: u64,
    pub partition_name: [u8; 72],
}

/// Encode a partition name as the fixed-size UTF-16LE field of a [GptEntry]
fn encode_name(name: &str) -> anyhow::Result<[u8; 72]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    ensure!(
        units.len() <= MAX_NAME_LEN,
        "partition name {name:?} longer than {MAX_NAME_LEN} UTF-16 code units"
    );

    let mut out = [0u8; 72];
    for (slot, unit) in out.chunks_exact_mut(2).zip(units) {
        slot.copy_from_slice(&unit.to_le_bytes());
    }
    Ok(out)
}

/// The metadata blocks of a disk holding one partition over the data window
///
/// Everything is computed once, at construction; the metadata is regenerated rather than stored,
/// so it never changes afterward.
#[derive(Debug, Clone)]
pub struct SyntheticPartitionTable {
    total_blocks: u64,
    disk_guid: Guid,
    partition_guid: Guid,
    mbr: Vec<u8>,
    primary: Vec<u8>,
    backup: Vec<u8>,
    entries: Vec<u8>,
}

impl SyntheticPartitionTable {
    /// Lay out a disk of `total_blocks` blocks with one basic data partition named `name`,
    /// spanning from [DATA_START_LBA] to the last usable block
    pub fn new(
        total_blocks: u64,
        disk_guid: Guid,
        partition_guid: Guid,
        name: &str,
    ) -> anyhow::Result<Self> {
        ensure!(
            total_blocks > DATA_START_LBA + GPT_BACKUP_BLOCKS,
            "{total_blocks} blocks leave no room for a partition"
        );
        let last_usable_lba = total_blocks - GPT_BACKUP_BLOCKS - 1;
        let nr_sects = u32::try_from(total_blocks - 1)?;

        let mbr = ProtectiveMbr {
            boot_code: [0; 440],
            unique_mbr_signature: 0,
            unknown: 0,
            boot_ind: 0,
            start_chs: [0x00, 0x02, 0x00],
            sys_ind: MBR_OSTYPE_EFI_GPT,
            end_chs: [0xFF; 3],
            start_sect: 1,
            nr_sects,
            unused_records: [0; 48],
            signature: MBR_SIGNATURE,
        }
        .to_bytes()?;

        let entries = GptEntry {
            partition_type_guid: *Guid::BASIC_DATA.as_bytes(),
            unique_partition_guid: *partition_guid.as_bytes(),
            starting_lba: DATA_START_LBA,
            ending_lba: last_usable_lba,
            attributes: 0,
            partition_name: encode_name(name)?,
        }
        .to_bytes()?;

        let mut header = GptHeader {
            revision: GPT_REVISION_V1,
            header_size: GPT_HEADER_SIZE,
            header_crc32: 0,
            reserved1: 0,
            my_lba: GPT_HEADER_LBA,
            alternate_lba: total_blocks - 1,
            first_usable_lba: DATA_START_LBA,
            last_usable_lba,
            disk_guid: *disk_guid.as_bytes(),
            partition_entry_lba: GPT_ENTRIES_LBA,
            num_partition_entries: 1,
            sizeof_partition_entry: GPT_ENTRY_SIZE,
            partition_entry_array_crc32: GPT_CRC.checksum(&entries),
        };
        header.fix_crc()?;
        let primary = header.to_bytes()?;

        header.my_lba = total_blocks - 1;
        header.alternate_lba = GPT_HEADER_LBA;
        header.partition_entry_lba = last_usable_lba + 1;
        header.fix_crc()?;
        let backup = header.to_bytes()?;

        Ok(Self {
            total_blocks,
            disk_guid,
            partition_guid,
            mbr,
            primary,
            backup,
            entries,
        })
    }

    /// The metadata held by block `lba`, if it holds any (the rest of the block reads as zero)
    pub fn block(&self, lba: u64) -> Option<&[u8]> {
        let last = self.total_blocks - 1;
        match lba {
            0 => Some(&self.mbr),
            GPT_HEADER_LBA => Some(&self.primary),
            GPT_ENTRIES_LBA => Some(&self.entries),
            _ if lba == last => Some(&self.backup),
            _ if lba == last - 32 => Some(&self.entries),
            _ => None,
        }
    }

    /// The block range covered by the partition
    pub fn partition_range(&self) -> std::ops::RangeInclusive<u64> {
        DATA_START_LBA..=self.total_blocks - GPT_BACKUP_BLOCKS - 1
    }

    pub fn disk_guid(&self) -> Guid {
        self.disk_guid
    }

    pub fn partition_guid(&self) -> Guid {
        self.partition_guid
    }

    /// Render the whole metadata block at `lba`, as a reader would see it
    pub fn read_block(&self, lba: u64, out: &mut [u8]) {
        let out = &mut out[..BLOCK_SIZE];
        out.fill(0);
        if let Some(meta) = self.block(lba) {
            out[..meta.len()].copy_from_slice(meta);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const TOTAL: u64 = 609;

    fn table() -> SyntheticPartitionTable {
        SyntheticPartitionTable::new(TOTAL, Guid::random(), Guid::random(), "loader1").unwrap()
    }

    fn read(table: &SyntheticPartitionTable, lba: u64) -> Vec<u8> {
        let mut block = vec![0xAA; BLOCK_SIZE];
        table.read_block(lba, &mut block);
        block
    }

    #[test]
    fn test_guid_text() -> anyhow::Result<()> {
        let guid: Guid = "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7".parse()?;
        assert_eq!(guid, Guid::BASIC_DATA);
        assert_eq!(
            guid.as_bytes(),
            &[
                0xA2, 0xA0, 0xD0, 0xEB, 0xE5, 0xB9, 0x33, 0x44, 0x87, 0xC0, 0x68, 0xB6, 0xB7,
                0x26, 0x99, 0xC7
            ]
        );
        assert_eq!(guid.to_string(), "EBD0A0A2-B9E5-4433-87C0-68B6B72699C7");

        assert!("EBD0A0A2-B9E5-4433-87C068B6B72699C7".parse::<Guid>().is_err());
        assert!("EBD0A0A2-B9E5-4433-87C0-68B6B72699CG".parse::<Guid>().is_err());
        Ok(())
    }

    #[test]
    fn test_guid_random() {
        let (a, b) = (Guid::random(), Guid::random());
        assert_ne!(a, b);
        assert_eq!(a.as_bytes()[7] >> 4, 4);
        assert_eq!(a.as_bytes()[8] >> 6, 2);
        assert_eq!(a.to_string().parse::<Guid>().unwrap(), a);
    }

    #[test]
    fn test_protective_mbr() {
        let mbr = read(&table(), 0);

        assert_eq!(mbr[510..], [0x55, 0xAA]);
        let record = &mbr[446..462];
        assert_eq!(record[0], 0);
        assert_eq!(record[4], MBR_OSTYPE_EFI_GPT);
        assert_eq!(record[8..12], 1u32.to_le_bytes());
        assert_eq!(record[12..16], (TOTAL as u32 - 1).to_le_bytes());
        assert!(mbr[462..510].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_primary_header() {
        let table = table();
        let block = read(&table, 1);
        assert_eq!(&block[..8], b"EFI PART");

        // Recompute the checksum by hand, over the header with its checksum field zeroed
        let mut bytes = block[..92].to_vec();
        let stored = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        bytes[16..20].fill(0);
        assert_eq!(GPT_CRC.checksum(&bytes), stored);
        assert!(block[92..].iter().all(|&x| x == 0));

        let header = GptHeader::parse(&block).unwrap();
        assert!(header.check_crc());
        assert_eq!(header.my_lba, 1);
        assert_eq!(header.alternate_lba, TOTAL - 1);
        assert_eq!(header.partition_entry_lba, 2);
        assert_eq!(header.first_usable_lba, 64);
        assert_eq!(header.last_usable_lba, TOTAL - 34);
        assert_eq!(header.disk_guid, *table.disk_guid().as_bytes());

        let entries = read(&table, 2);
        assert_eq!(
            GPT_CRC.checksum(&entries[..128]),
            header.partition_entry_array_crc32
        );
    }

    #[test]
    fn test_backup_header() {
        let table = table();
        let primary = GptHeader::parse(&read(&table, 1)).unwrap();
        let backup = GptHeader::parse(&read(&table, TOTAL - 1)).unwrap();

        assert!(backup.check_crc());
        assert_eq!(backup.my_lba, TOTAL - 1);
        assert_eq!(backup.alternate_lba, 1);
        assert_eq!(backup.partition_entry_lba, TOTAL - 33);
        assert_eq!(
            backup.partition_entry_array_crc32,
            primary.partition_entry_array_crc32
        );
        assert_eq!(read(&table, TOTAL - 33), read(&table, 2));
    }

    #[test]
    fn test_entry() {
        let table = table();
        let entry = read(&table, 2);

        assert_eq!(entry[..16], *Guid::BASIC_DATA.as_bytes());
        assert_eq!(entry[16..32], *table.partition_guid().as_bytes());
        assert_eq!(entry[32..40], 64u64.to_le_bytes());
        assert_eq!(entry[40..48], (TOTAL - 34).to_le_bytes());
        assert_eq!(entry[56..70], *b"l\0o\0a\0d\0e\0r\01\0");
        assert!(entry[70..].iter().all(|&x| x == 0));
        assert_eq!(table.partition_range(), 64..=TOTAL - 34);
    }

    #[test]
    fn test_other_blocks_empty() {
        let table = table();
        for lba in [3, 33, 63, 64, 300, TOTAL - 34, TOTAL - 32, TOTAL - 2] {
            assert!(table.block(lba).is_none(), "{lba}");
            assert!(read(&table, lba).iter().all(|&x| x == 0));
        }
    }

    #[test]
    fn test_bad_names() {
        let long = "x".repeat(MAX_NAME_LEN + 1);
        let new = |total, name: &str| {
            SyntheticPartitionTable::new(total, Guid::random(), Guid::random(), name)
        };
        assert!(new(TOTAL, &long).is_err());
        assert!(new(90, "x").is_err());
        assert!(new(TOTAL, &"x".repeat(MAX_NAME_LEN)).is_ok());
    }
}
