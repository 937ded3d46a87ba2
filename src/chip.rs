//! Identification of Rockchip-supported raw NAND parts.
//!
//! The boot ROM and loader only accept the parts listed in [NAND_PARA_TABLE]; each entry tells
//! us the page geometry and, most importantly, which [PageScheme] the part's MLC pairing
//! requires when laying out an IDB.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, ensure};
use thiserror::Error;

use crate::nand::NandLayout;
use crate::page_table::PageScheme;

/// Bytes of system data the NAND controller exposes in the spare area per ECC step
pub const NFC_SYS_DATA_SIZE: usize = 4;

/// Bytes of page data covered by one ECC step
pub const ECC_STEP_SIZE: usize = 1024;

/// Sectors of each physical page that carry IDB data; the boot ROM reads 2 KiB per page
pub const IDB_PAGE_SECTORS: u32 = 4;

/// One row of the parameter table, describing a known NAND part
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandParaInfo {
    /// How many leading bytes of `nand_id` are significant
    pub id_bytes: u8,
    pub nand_id: [u8; 6],
    pub vendor: u8,
    pub die_per_chip: u8,
    pub sec_per_page: u8,
    pub page_per_blk: u16,
    pub cell: u8,
    pub plane_per_die: u8,
    pub blk_per_plane: u16,
    pub operation_opt: u16,
    /// The page-pairing scheme; see [PageScheme]
    pub lsb_mode: u8,
    pub read_retry_mode: u8,
    pub ecc_bits: u8,
    pub access_freq: u8,
    pub opt_mode: u8,
    pub die_gap: u8,
    pub bad_block_mode: u8,
    pub multi_plane_mode: u8,
    pub slc_mode: u8,
}

#[allow(clippy::too_many_arguments)]
const fn para(
    id_bytes: u8,
    nand_id: [u8; 6],
    vendor: u8,
    die_per_chip: u8,
    sec_per_page: u8,
    page_per_blk: u16,
    cell: u8,
    plane_per_die: u8,
    blk_per_plane: u16,
    operation_opt: u16,
    lsb_mode: u8,
    read_retry_mode: u8,
    ecc_bits: u8,
    access_freq: u8,
    opt_mode: u8,
    die_gap: u8,
    bad_block_mode: u8,
    multi_plane_mode: u8,
    slc_mode: u8,
) -> NandParaInfo {
    NandParaInfo {
        id_bytes,
        nand_id,
        vendor,
        die_per_chip,
        sec_per_page,
        page_per_blk,
        cell,
        plane_per_die,
        blk_per_plane,
        operation_opt,
        lsb_mode,
        read_retry_mode,
        ecc_bits,
        access_freq,
        opt_mode,
        die_gap,
        bad_block_mode,
        multi_plane_mode,
        slc_mode,
    }
}

/// Every NAND part known to the Rockchip loader
#[rustfmt::skip]
pub const NAND_PARA_TABLE: &[NandParaInfo] = &[
    para(6, [0x2c, 0x64, 0x44, 0x4b, 0xa9, 0x00], 4, 1, 16, 256, 2, 2, 2048, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x44, 0x44, 0x4b, 0xa9, 0x00], 4, 1, 16, 256, 2, 2, 1064, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x68, 0x04, 0x4a, 0xa9, 0x00], 4, 1, 8, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x88, 0x04, 0x4b, 0xa9, 0x00], 4, 1, 16, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0xa8, 0x05, 0xcb, 0xa9, 0x00], 4, 2, 16, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x68, 0x04, 0x46, 0x89, 0x00], 4, 1, 8, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x48, 0x04, 0x4a, 0xa5, 0x00], 4, 1, 8, 256, 2, 2, 1024, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x84, 0x64, 0x3c, 0xa5, 0x00], 4, 1, 32, 512, 2, 2, 1024, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x84, 0x64, 0x54, 0xa9, 0x00], 4, 1, 32, 512, 2, 2, 1024, 0x01df, 4, 18, 60, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0xd7, 0x94, 0x3e, 0x84, 0x00], 4, 1, 8, 128, 2, 2, 4096, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x48, 0x04, 0x46, 0x85, 0x00], 4, 1, 8, 256, 2, 2, 1024, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x88, 0x05, 0xc6, 0x89, 0x00], 4, 2, 8, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x88, 0x24, 0x4b, 0xa9, 0x00], 4, 1, 16, 256, 2, 2, 2048, 0x011f, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x68, 0x00, 0x27, 0xa9, 0x00], 4, 1, 16, 128, 1, 2, 2048, 0x011f, 0, 0, 24, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x64, 0x64, 0x56, 0xa5, 0x00], 4, 1, 24, 512, 2, 2, 700, 0x01df, 4, 18, 60, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0x84, 0xc5, 0x4b, 0xa9, 0x00], 4, 2, 16, 256, 2, 2, 2048, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0xd5, 0xd1, 0xa6, 0x68, 0x00], 4, 2, 8, 64, 1, 2, 2048, 0x0117, 0, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0xdc, 0x90, 0xa6, 0x54, 0x00], 4, 1, 8, 64, 1, 2, 1024, 0x0117, 0, 0, 24, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x64, 0x64, 0x54, 0xa4, 0x00], 4, 1, 32, 512, 2, 1, 1024, 0x01df, 4, 18, 60, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x84, 0x44, 0x32, 0xaa, 0x00], 4, 1, 32, 512, 2, 1, 2184, 0x05c7, 5, 19, 60, 32, 1, 0, 1, 0, 1),
    para(5, [0x2c, 0x64, 0x44, 0x32, 0xa5, 0x00], 4, 1, 32, 512, 2, 1, 1048, 0x05c7, 5, 19, 60, 32, 1, 0, 1, 0, 1),
    para(5, [0x2c, 0x64, 0x64, 0x3c, 0xa5, 0x00], 4, 1, 32, 512, 2, 1, 1044, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(5, [0x2c, 0x84, 0x44, 0x32, 0xaa, 0x00], 4, 1, 32, 512, 2, 1, 2184, 0x05c7, 5, 19, 60, 32, 1, 0, 4, 0, 1),
    para(5, [0x2c, 0x84, 0x44, 0x34, 0xaa, 0x00], 4, 1, 32, 512, 2, 1, 2184, 0x05c7, 5, 19, 60, 32, 1, 0, 4, 0, 1),
    para(5, [0x2c, 0x84, 0xc4, 0x34, 0xaa, 0x00], 4, 1, 32, 512, 2, 1, 2184, 0x05c7, 5, 19, 60, 32, 1, 0, 1, 0, 1),
    para(5, [0x2c, 0x84, 0x44, 0x34, 0xa4, 0x00], 4, 1, 32, 512, 2, 1, 2184, 0x05c7, 5, 19, 60, 32, 1, 0, 1, 0, 1),
    para(5, [0x2c, 0x84, 0x64, 0x3c, 0xa9, 0x00], 4, 1, 32, 512, 2, 2, 1024, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x2c, 0xa4, 0x64, 0x32, 0xaa, 0x04], 4, 1, 32, 1024, 2, 1, 2192, 0x05c7, 10, 19, 60, 32, 1, 0, 4, 0, 1),
    para(6, [0xad, 0xde, 0x94, 0xd2, 0x04, 0x43], 2, 1, 16, 256, 2, 2, 2048, 0x01d9, 1, 1, 24, 32, 4, 0, 3, 0, 0),
    para(6, [0xad, 0xd7, 0x94, 0xda, 0x74, 0xc3], 2, 1, 16, 256, 2, 2, 1024, 0x01d9, 1, 2, 40, 32, 4, 0, 3, 0, 0),
    para(6, [0xad, 0xd7, 0x94, 0x91, 0x60, 0x44], 2, 1, 16, 256, 2, 2, 1046, 0x01d9, 1, 3, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xde, 0x94, 0xda, 0x74, 0xc4], 2, 1, 16, 256, 2, 2, 2090, 0x01d9, 1, 4, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xde, 0x94, 0xeb, 0x74, 0x44], 2, 1, 32, 256, 2, 2, 1066, 0x01d9, 1, 7, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xd5, 0x94, 0xda, 0x74, 0xc4], 2, 1, 16, 256, 2, 2, 530, 0x01d9, 1, 3, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xd7, 0x94, 0x9a, 0x74, 0x42], 2, 1, 16, 256, 2, 2, 1024, 0x0119, 1, 0, 24, 32, 4, 0, 3, 0, 0),
    para(6, [0xad, 0xde, 0x14, 0xa7, 0x42, 0x4a], 2, 1, 32, 256, 2, 2, 1060, 0x01d9, 2, 5, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xd7, 0x14, 0x9e, 0x34, 0x4a], 2, 1, 16, 256, 2, 2, 1056, 0x01d9, 2, 5, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xde, 0x94, 0xa7, 0x42, 0x48], 2, 1, 32, 256, 2, 2, 1060, 0x01d9, 2, 5, 40, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0xde, 0x14, 0xab, 0x42, 0x4a], 2, 1, 32, 256, 2, 2, 1056, 0x01d9, 2, 6, 40, 32, 3, 1, 3, 0, 0),
    para(6, [0xad, 0x3a, 0x14, 0xab, 0x42, 0x4a], 2, 1, 32, 256, 2, 2, 2092, 0x01d9, 2, 5, 40, 32, 3, 1, 3, 0, 0),
    para(6, [0xad, 0xd5, 0x94, 0x9a, 0x74, 0x42], 2, 1, 16, 256, 2, 1, 1024, 0x0111, 1, 0, 24, 32, 4, 1, 3, 0, 0),
    para(6, [0xad, 0x3a, 0x14, 0x03, 0x08, 0x50], 2, 1, 32, 388, 2, 2, 1362, 0x01d9, 9, 8, 40, 32, 3, 1, 3, 0, 0),
    para(6, [0x89, 0x64, 0x44, 0x4b, 0xa9, 0x00], 7, 1, 16, 256, 2, 2, 2048, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x88, 0x24, 0x4b, 0xa9, 0x84], 7, 1, 16, 256, 2, 2, 2048, 0x01df, 3, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x88, 0x24, 0x4b, 0xa9, 0x00], 7, 1, 16, 256, 2, 2, 2048, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x68, 0x24, 0x4a, 0xa9, 0x00], 7, 1, 8, 256, 2, 2, 2048, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x68, 0x04, 0x4a, 0xa9, 0x00], 7, 1, 8, 256, 2, 2, 2048, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0xd7, 0x94, 0x3e, 0x84, 0x00], 7, 1, 8, 256, 2, 2, 2048, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x68, 0x04, 0x46, 0xa9, 0x00], 7, 1, 8, 256, 2, 2, 2048, 0x0117, 1, 0, 24, 32, 1, 0, 1, 0, 0),
    para(5, [0x89, 0x64, 0x64, 0x3c, 0xa1, 0x00], 7, 1, 32, 512, 2, 1, 1024, 0x01c7, 4, 17, 40, 32, 1, 0, 1, 0, 0),
    para(5, [0x89, 0x84, 0x64, 0x3c, 0xa5, 0x00], 7, 1, 32, 512, 2, 2, 1024, 0x01c7, 4, 17, 40, 32, 1, 0, 1, 0, 0),
    para(6, [0x89, 0x88, 0x24, 0x3b, 0xa9, 0x00], 7, 1, 16, 192, 2, 2, 2048, 0x0117, 12, 0, 24, 32, 1, 0, 1, 0, 0),
    para(6, [0x98, 0xd7, 0x84, 0x93, 0x72, 0x57], 1, 1, 32, 256, 2, 1, 1060, 0x05c1, 2, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0xde, 0x84, 0x93, 0x72, 0x57], 1, 1, 32, 256, 2, 1, 2092, 0x05c1, 2, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0x3a, 0x85, 0x93, 0x76, 0x57], 1, 2, 32, 256, 2, 1, 2092, 0x05e1, 2, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0xd5, 0x84, 0x32, 0x72, 0x56], 1, 1, 16, 128, 2, 1, 2056, 0x05c1, 2, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0xd7, 0x94, 0x32, 0x76, 0x56], 1, 1, 16, 128, 2, 2, 2058, 0x05d1, 2, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0xde, 0x94, 0x82, 0x76, 0x56], 1, 1, 16, 256, 2, 2, 2062, 0x05d1, 1, 33, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x98, 0xde, 0x94, 0x93, 0x76, 0x50], 1, 1, 32, 256, 2, 2, 1066, 0x05d9, 2, 34, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x98, 0x3a, 0x95, 0x93, 0x7a, 0x50], 1, 2, 32, 256, 2, 2, 1066, 0x05d9, 2, 34, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x98, 0xd7, 0x94, 0x32, 0x76, 0x55], 1, 1, 16, 128, 2, 2, 2050, 0x0191, 2, 0, 24, 32, 1, 1, 1, 0, 0),
    para(6, [0x98, 0xde, 0x94, 0x93, 0x76, 0x57], 1, 1, 32, 256, 2, 2, 1058, 0x05d9, 2, 33, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x98, 0xd7, 0x84, 0x93, 0x72, 0x50], 1, 1, 32, 256, 2, 1, 1060, 0x05c1, 2, 34, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x98, 0xde, 0x94, 0x93, 0x76, 0x51], 1, 1, 32, 256, 2, 2, 1074, 0x05d9, 2, 35, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x98, 0x3a, 0x94, 0x93, 0x76, 0x51], 1, 1, 32, 256, 2, 2, 2106, 0x05d9, 2, 35, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x98, 0xd7, 0x84, 0x93, 0x72, 0x51], 1, 1, 32, 256, 2, 1, 1056, 0x05d9, 2, 35, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x98, 0xde, 0x94, 0x93, 0x76, 0xd1], 1, 1, 32, 256, 2, 2, 1074, 0x05d9, 2, 35, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x45, 0xde, 0x94, 0x93, 0x76, 0x57], 8, 1, 32, 256, 2, 2, 1058, 0x05d9, 2, 66, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xd7, 0x84, 0x93, 0x72, 0x57], 8, 1, 32, 256, 2, 1, 1060, 0x05c1, 2, 66, 40, 32, 2, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0xa4, 0x82, 0x76, 0x56], 8, 1, 16, 256, 2, 2, 2082, 0x01d9, 1, 65, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0x94, 0x93, 0x76, 0x50], 8, 1, 32, 256, 2, 2, 1066, 0x05d9, 2, 67, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xd7, 0x84, 0x93, 0x72, 0x50], 8, 1, 32, 256, 2, 1, 1060, 0x05c1, 2, 67, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0xa4, 0x82, 0x76, 0xd7], 8, 1, 16, 256, 2, 2, 2090, 0x04d9, 1, 66, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0x84, 0x93, 0x72, 0x57], 8, 1, 32, 256, 2, 1, 2092, 0x05c1, 2, 66, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0x3a, 0x94, 0x93, 0x76, 0x51], 8, 1, 32, 256, 2, 2, 2106, 0x01d9, 2, 68, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x45, 0xde, 0x94, 0x93, 0x76, 0x51], 8, 1, 32, 256, 2, 2, 1074, 0x01d9, 2, 68, 40, 32, 3, 1, 4, 0, 0),
    para(6, [0x45, 0x3a, 0xa4, 0x93, 0x7a, 0x50], 8, 1, 32, 256, 2, 2, 2138, 0x05d9, 2, 0, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0x94, 0x82, 0x76, 0x56], 8, 1, 16, 256, 2, 2, 2062, 0x01d9, 1, 0, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0x45, 0xde, 0x94, 0x93, 0x76, 0xd7], 8, 1, 32, 256, 2, 2, 1058, 0x05d9, 2, 66, 40, 32, 3, 1, 1, 0, 0),
    para(6, [0xec, 0xd7, 0x94, 0x7e, 0x64, 0x44], 0, 1, 16, 128, 2, 2, 2048, 0x01d9, 2, 49, 60, 36, 3, 0, 3, 0, 0),
    para(6, [0xec, 0xde, 0xd5, 0x7e, 0x68, 0x44], 0, 2, 16, 128, 2, 2, 2048, 0x01f9, 2, 49, 60, 36, 3, 0, 3, 0, 0),
    para(6, [0xec, 0xd7, 0x94, 0x7a, 0x54, 0x43], 0, 1, 16, 128, 2, 2, 2076, 0x0199, 2, 0, 40, 36, 3, 1, 3, 0, 0),
    para(6, [0xec, 0xde, 0xd5, 0x7a, 0x58, 0x43], 0, 2, 16, 128, 2, 2, 2076, 0x01b9, 2, 0, 40, 36, 3, 1, 3, 0, 0),
    para(6, [0xec, 0xd5, 0x94, 0x76, 0x54, 0x43], 0, 1, 16, 128, 2, 2, 1038, 0x0119, 2, 0, 24, 36, 3, 1, 3, 0, 0),
    para(6, [0xec, 0xd7, 0x14, 0x76, 0x54, 0xc2], 0, 1, 16, 128, 2, 2, 2076, 0x0491, 2, 0, 24, 40, 3, 1, 3, 0, 0),
    para(6, [0xec, 0xde, 0x94, 0xc3, 0xa4, 0xca], 0, 1, 32, 792, 2, 1, 688, 0x04c1, 11, 50, 40, 32, 3, 1, 1, 0, 1),
];

#[derive(Debug, Error)]
pub enum IdentifyError {
    #[error("no known NAND part matches ID {0:02x?}")]
    UnknownId(Vec<u8>),

    #[error("NAND part {id:02x?} uses unsupported page scheme {lsb_mode}")]
    UnsupportedScheme { id: Vec<u8>, lsb_mode: u8 },
}

/// The geometry of a NAND part, as far as IDB layout is concerned
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChipGeometry {
    pub sectors_per_page: u32,
    pub pages_per_block: u32,
    pub blocks: u32,
    pub ecc_steps: u32,
    pub scheme: PageScheme,
}

impl ChipGeometry {
    /// Build the geometry described by a parameter table row
    pub fn from_para(info: &NandParaInfo) -> Result<Self, IdentifyError> {
        let scheme = PageScheme::try_from(info.lsb_mode).map_err(|_| {
            IdentifyError::UnsupportedScheme {
                id: info.nand_id[..info.id_bytes as usize].to_vec(),
                lsb_mode: info.lsb_mode,
            }
        })?;

        let sectors_per_page = u32::from(info.sec_per_page);
        let bytes_per_page = sectors_per_page as usize * 512;

        Ok(Self {
            sectors_per_page,
            pages_per_block: u32::from(info.page_per_blk),
            blocks: u32::from(info.blk_per_plane)
                * u32::from(info.plane_per_die)
                * u32::from(info.die_per_chip),
            ecc_steps: (bytes_per_page / ECC_STEP_SIZE).max(1) as u32,
            scheme,
        })
    }

    pub fn bytes_per_page(&self) -> usize {
        self.sectors_per_page as usize * 512
    }

    /// Spare bytes the controller exposes per page (one system-data slot per ECC step)
    pub fn spare_bytes_per_page(&self) -> usize {
        self.ecc_steps as usize * NFC_SYS_DATA_SIZE
    }

    /// How many logical 512-byte sectors one physical page holds in an IDB
    pub fn group_sectors(&self) -> u32 {
        self.sectors_per_page.min(IDB_PAGE_SECTORS)
    }

    /// Byte offset, within the spare area, of the slot holding the forward link
    pub fn link_offset(&self) -> usize {
        (self.ecc_steps as usize - 1) * NFC_SYS_DATA_SIZE
    }

    /// The flash layout a part of this geometry presents
    pub fn nand_layout(&self) -> NandLayout {
        NandLayout {
            blocks: self.blocks,
            pages_per_block: self.pages_per_block,
            bytes_per_page: self.bytes_per_page(),
            spare_bytes_per_page: self.spare_bytes_per_page(),
        }
    }
}

/// Look up identification bytes in the parameter table; the first entry whose significant
/// bytes all match wins.
pub fn lookup(id: &[u8]) -> Option<&'static NandParaInfo> {
    NAND_PARA_TABLE.iter().find(|info| {
        let len = info.id_bytes as usize;
        id.get(..len) == Some(&info.nand_id[..len])
    })
}

/// Resolve identification bytes to the part's geometry
pub fn resolve(id: &[u8]) -> Result<(&'static NandParaInfo, ChipGeometry), IdentifyError> {
    let info = lookup(id).ok_or_else(|| IdentifyError::UnknownId(id.to_vec()))?;
    Ok((info, ChipGeometry::from_para(info)?))
}

/// Identification bytes as written on a command line: hex, optionally split by ':' or '-'
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ChipId(pub Vec<u8>);

impl FromStr for ChipId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let s = s.trim();
        let s = s.strip_prefix("0x").unwrap_or(s);
        let digits: Vec<char> = s.chars().filter(|c| !matches!(c, ':' | '-')).collect();
        ensure!(!digits.is_empty(), "chip ID must not be empty");
        ensure!(digits.len() % 2 == 0, "chip ID must be whole bytes");

        let mut id = Vec::with_capacity(digits.len() / 2);
        for pair in digits.chunks(2) {
            let byte: String = pair.iter().collect();
            match u8::from_str_radix(&byte, 16) {
                Ok(x) => id.push(x),
                Err(_) => bail!("{byte:?} is not a hex byte"),
            }
        }
        Ok(Self(id))
    }
}

impl fmt::Display for ChipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[test]
fn test_resolve_first_match() -> anyhow::Result<()> {
    // Listed twice with different retry modes; the first entry must win
    let (info, geometry) = resolve(&[0x2c, 0x84, 0x44, 0x32, 0xaa, 0x00])?;
    assert_eq!(info.lsb_mode, 5);
    assert_eq!(info.bad_block_mode, 1);
    assert_eq!(geometry.scheme, PageScheme::Even16);
    assert_eq!(geometry.sectors_per_page, 32);
    assert_eq!(geometry.pages_per_block, 512);
    assert_eq!(geometry.blocks, 2184);
    assert_eq!(geometry.ecc_steps, 16);
    assert_eq!(geometry.group_sectors(), IDB_PAGE_SECTORS);
    assert_eq!(geometry.link_offset(), 60);
    Ok(())
}

#[test]
fn test_resolve_short_id() -> anyhow::Result<()> {
    // Only five bytes are significant for this part, so the sixth is ignored
    let (info, geometry) = resolve(&[0x2c, 0x88, 0x04, 0x4b, 0xa9, 0x77])?;
    assert_eq!(info.id_bytes, 5);
    assert_eq!(geometry.scheme, PageScheme::Paired4);

    // ...but a truncated ID matches nothing
    assert!(matches!(
        resolve(&[0x2c, 0x88, 0x04]),
        Err(IdentifyError::UnknownId(_))
    ));
    Ok(())
}

#[test]
fn test_resolve_unknown() {
    assert!(matches!(
        resolve(&[0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
        Err(IdentifyError::UnknownId(_))
    ));
}

#[test]
fn test_table_schemes_supported() {
    for info in NAND_PARA_TABLE {
        let geometry = ChipGeometry::from_para(info).unwrap();
        assert!(geometry.spare_bytes_per_page() >= NFC_SYS_DATA_SIZE);
        assert_eq!(geometry.nand_layout().bytes_per_page, info.sec_per_page as usize * 512);
    }
}

#[test]
fn test_chip_id_parse() -> anyhow::Result<()> {
    let id: ChipId = "2c88044ba900".parse()?;
    assert_eq!(id.0, [0x2c, 0x88, 0x04, 0x4b, 0xa9, 0x00]);
    assert_eq!("0x2c:88:04:4B:a9:00".parse::<ChipId>()?, id);
    assert_eq!(id.to_string(), "2c88044ba900");

    assert!("".parse::<ChipId>().is_err());
    assert!("2c8".parse::<ChipId>().is_err());
    assert!("2cxx".parse::<ChipId>().is_err());
    Ok(())
}
