//! Settings for opening a device

use crate::disk::Guid;

/// How many eraseblocks at the start of the flash make up the boot area, when not configured
pub const DEFAULT_BOOT_BLOCKS: u32 = 8;

/// Name of the partition holding the IDB, when not configured
pub const DEFAULT_PARTITION_NAME: &str = "loader1";

/// A pub-fields struct of everything that can be chosen when opening a device
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DeviceConfig {
    /// Only this many eraseblocks at the start of the flash are scanned and written
    pub boot_blocks: u32,

    /// GUID of the synthetic disk; random when None
    pub disk_guid: Option<Guid>,

    /// Unique GUID of the IDB partition; random when None
    pub partition_guid: Option<Guid>,

    pub partition_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            boot_blocks: DEFAULT_BOOT_BLOCKS,
            disk_guid: None,
            partition_guid: None,
            partition_name: DEFAULT_PARTITION_NAME.to_string(),
        }
    }
}
