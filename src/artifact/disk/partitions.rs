//! Boot sector and MBR partition table.

use std::fs::{self, File};
use std::io::Read;
use std::path::Path;

use tracing::info;

use crate::error::{StageError, StageResult};
use crate::process::{Cmd, CommandRunner};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Bytes of the first sector available to boot code (disk signature and
/// partition table follow).
pub const BOOT_CODE_MAX: usize = 440;

const PARTITION_TABLE_OFFSET: usize = 446;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];
const BOOTABLE_FLAG: u8 = 0x80;
const LINUX_PARTITION_TYPE: u8 = 0x83;

/// First entry of an MBR partition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrPartition {
    pub bootable: bool,
    pub part_type: u8,
    pub start_lba: u32,
    pub sectors: u32,
}

/// Copy the boot code blob onto the first sector of `device`.
pub fn write_boot_sector(runner: &dyn CommandRunner, blob: &Path, device: &str) -> StageResult<()> {
    let len = boot_code_len(blob)?;
    Cmd::new("dd")
        .arg(format!("if={}", blob.display()))
        .arg(format!("of={}", device))
        .arg(format!("bs={}", len))
        .args(["count=1", "conv=notrunc"])
        .error_msg("dd failed writing boot sector")
        .run(runner)?;
    info!(device, bytes = len, "boot sector written");
    Ok(())
}

/// sfdisk script: one bootable Linux primary partition from `start_sector`
/// to the end of the device.
pub fn partition_script(start_sector: u64) -> String {
    format!(
        "label: dos\n\
         unit: sectors\n\
         \n\
         start={}, type={:x}, bootable\n",
        start_sector, LINUX_PARTITION_TYPE
    )
}

/// Write a DOS label with a single partition starting at `start_sector`.
pub fn write_partition_table(
    runner: &dyn CommandRunner,
    device: &str,
    start_sector: u64,
) -> StageResult<()> {
    Cmd::new("sfdisk")
        .args(["--no-reread", "--no-tell-kernel"])
        .arg(device)
        .stdin(partition_script(start_sector))
        .error_msg("sfdisk failed to create partition table")
        .run(runner)?;
    info!(device, start_sector, "partition table written");
    Ok(())
}

/// Read the first sector of `image` back and check boot code, signature and
/// the partition entry written by [`write_partition_table`].
pub fn verify_mbr(image: &Path, blob: &Path, start_sector: u64) -> StageResult<MbrPartition> {
    let mismatch = |reason: String| StageError::BootSector {
        path: image.to_path_buf(),
        reason,
    };

    let code = fs::read(blob)
        .map_err(|e| StageError::io(format!("reading boot code '{}'", blob.display()), e))?;
    let mut sector = [0u8; SECTOR_SIZE as usize];
    File::open(image)
        .and_then(|mut f| f.read_exact(&mut sector))
        .map_err(|e| StageError::io(format!("reading first sector of '{}'", image.display()), e))?;

    let code_len = code.len().min(BOOT_CODE_MAX);
    if sector[..code_len] != code[..code_len] {
        return Err(mismatch("boot code does not match blob".to_string()));
    }
    if sector[510..512] != BOOT_SIGNATURE {
        return Err(mismatch("missing 0x55AA boot signature".to_string()));
    }

    let partition = parse_first_entry(&sector);
    if !partition.bootable {
        return Err(mismatch("partition 1 is not flagged bootable".to_string()));
    }
    if u64::from(partition.start_lba) != start_sector {
        return Err(mismatch(format!(
            "partition 1 starts at sector {}, expected {}",
            partition.start_lba, start_sector
        )));
    }
    if partition.sectors == 0 {
        return Err(mismatch("partition 1 is empty".to_string()));
    }
    Ok(partition)
}

fn parse_first_entry(sector: &[u8; SECTOR_SIZE as usize]) -> MbrPartition {
    let entry = &sector[PARTITION_TABLE_OFFSET..PARTITION_TABLE_OFFSET + 16];
    let le_u32 = |at: usize| u32::from_le_bytes([entry[at], entry[at + 1], entry[at + 2], entry[at + 3]]);
    MbrPartition {
        bootable: entry[0] == BOOTABLE_FLAG,
        part_type: entry[4],
        start_lba: le_u32(8),
        sectors: le_u32(12),
    }
}

fn boot_code_len(blob: &Path) -> StageResult<u64> {
    let len = fs::metadata(blob)
        .map_err(|e| StageError::io(format!("reading boot code '{}'", blob.display()), e))?
        .len();
    if len == 0 || len > BOOT_CODE_MAX as u64 {
        return Err(StageError::BootSector {
            path: blob.to_path_buf(),
            reason: format!("boot code must be 1..={} bytes, got {}", BOOT_CODE_MAX, len),
        });
    }
    Ok(len)
}
