//! Access to the IDB (the first-stage boot image) of Rockchip raw NAND flash, presented as a
//! small partitioned block device.

pub mod chip;
pub mod config;
pub mod disk;
pub mod idb;
pub mod nand;
pub mod page_table;
pub mod registry;
pub mod util;
