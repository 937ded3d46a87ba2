//! This module contains the code to read and write the IDB descriptor ("sector 0"), which is
//! stored RC4-obfuscated in the first sector of every copy.

use deku::prelude::*;

use super::{rc4, PayloadExtent, SECTOR_SIZE};

/// The descriptor's magic number, before obfuscation
pub const IDB_MAGIC: u32 = 0x0FF0_AA55;

/// The first four bytes of every IDB copy as stored on flash (the obfuscated magic)
pub const IDB_TAG: [u8; 4] = [0x3b, 0x8c, 0xdc, 0xfc];

/// Raw layout of the descriptor sector
#[derive(Debug, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little", magic = b"\x55\xaa\xf0\x0f")]
struct Sector0 {
    reserved: [u8; 4],
    rc4_flag: u32,
    boot_code1_offset: u16,
    boot_code2_offset: u16,
    reserved1: [u8; 490],
    flash_data_size: u16,
    flash_boot_size: u16,
    reserved2: [u8; 2],
}

/// This represents the descriptor fields we care about
///
/// This is meant to be more ergonomic to work with than Sector0, which represents the raw data
#[derive(Debug, Default, Eq, PartialEq, Copy, Clone)]
pub struct IdbDescriptor {
    /// Where the payload (`boot_code1`) lies, and how long it is
    pub extent: PayloadExtent,

    /// Offset of the secondary loader, in sectors
    pub boot_code2_offset: u16,

    /// Size of the DDR init stage, in sectors
    pub data_size: u16,

    /// Nonzero when the payload itself is stored without RC4
    pub rc4_flag: u32,
}

impl IdbDescriptor {
    pub fn new(extent: PayloadExtent) -> Self {
        Self {
            extent,
            ..Default::default()
        }
    }

    /// Do these flash bytes begin with the obfuscated magic?
    pub fn is_tagged(raw: &[u8]) -> bool {
        raw.starts_with(&IDB_TAG)
    }

    /// Convert from obfuscated bytes, as stored on flash
    pub fn decode(raw: &[u8]) -> Option<Self> {
        if !Self::is_tagged(raw) {
            return None;
        }

        let mut sector = raw.get(..SECTOR_SIZE)?.to_vec();
        rc4(&mut sector);

        let (_, header) = Sector0::from_bytes((sector.as_slice(), 0)).ok()?;
        Some(header.into())
    }

    /// Write into a byte slice, obfuscated
    pub fn encode(self, out_bytes: &mut [u8]) -> anyhow::Result<()> {
        let mut bytes = Sector0::try_from(self)?.to_bytes()?;
        rc4(&mut bytes);

        let out_bytes = out_bytes
            .get_mut(..bytes.len())
            .ok_or(anyhow::anyhow!("out_bytes too small"))?;
        out_bytes.copy_from_slice(&bytes);
        Ok(())
    }
}

impl From<Sector0> for IdbDescriptor {
    fn from(value: Sector0) -> Self {
        Self {
            extent: PayloadExtent::new(
                value.boot_code1_offset.into(),
                value.flash_boot_size.into(),
            ),
            boot_code2_offset: value.boot_code2_offset,
            data_size: value.flash_data_size,
            rc4_flag: value.rc4_flag,
        }
    }
}

impl TryFrom<IdbDescriptor> for Sector0 {
    type Error = anyhow::Error;

    fn try_from(value: IdbDescriptor) -> anyhow::Result<Self> {
        Ok(Self {
            reserved: [0; 4],
            rc4_flag: value.rc4_flag,
            boot_code1_offset: value.extent.offset.try_into()?,
            boot_code2_offset: value.boot_code2_offset,
            reserved1: [0; 490],
            flash_data_size: value.data_size,
            flash_boot_size: value.extent.size.try_into()?,
            reserved2: [0; 2],
        })
    }
}

#[test]
fn test_tag_is_obfuscated_magic() {
    let mut magic = IDB_MAGIC.to_le_bytes();
    rc4(&mut magic);
    assert_eq!(magic, IDB_TAG);
}

#[test]
fn test_encode() -> anyhow::Result<()> {
    let mut raw = [0u8; SECTOR_SIZE];
    IdbDescriptor::new(PayloadExtent::new(4, 508)).encode(&mut raw)?;

    assert_eq!(
        raw[..16],
        [
            0x3b, 0x8c, 0xdc, 0xfc, 0xbe, 0x9f, 0x9d, 0x51, 0xea, 0x30, 0x34, 0xce, 0x24, 0x51,
            0x1f, 0x98
        ]
    );
    assert_eq!(raw[504..], [0x91, 0x8d, 0x6f, 0x93, 0xe0, 0x29, 0x27, 0x45]);
    Ok(())
}

#[test]
fn test_decode() -> anyhow::Result<()> {
    let descriptor = IdbDescriptor {
        extent: PayloadExtent::new(4, 100),
        boot_code2_offset: 64,
        data_size: 36,
        rc4_flag: 1,
    };

    let mut raw = vec![0xFFu8; 2048];
    descriptor.encode(&mut raw)?;
    assert!(IdbDescriptor::is_tagged(&raw));
    assert_eq!(IdbDescriptor::decode(&raw), Some(descriptor));

    // Anything else is not a descriptor
    raw[1] ^= 1;
    assert_eq!(IdbDescriptor::decode(&raw), None);
    assert_eq!(IdbDescriptor::decode(&[0xFF; SECTOR_SIZE]), None);
    assert_eq!(IdbDescriptor::decode(&IDB_TAG), None);
    Ok(())
}

#[test]
fn test_encode_out_of_range() {
    let mut raw = [0u8; SECTOR_SIZE];
    let descriptor = IdbDescriptor::new(PayloadExtent::new(0x1_0000, 4));
    assert!(descriptor.encode(&mut raw).is_err());
    assert!(descriptor.encode(&mut raw[..100]).is_err());
}
