use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{FveError, Result};
use crate::io::ByteSource;

/// Size of the boot sector region read from the start of the volume.
pub const BOOT_SECTOR_SIZE: usize = 512;

/// Boot entry point + OEM identifier combinations that mark a
/// BitLocker-encrypted NTFS volume. BitLocker To Go media carry a FAT32
/// boot sector (`MSWIN4.1` OEM id) with a different field layout and are
/// rejected rather than mis-parsed at NTFS offsets.
const VISTA_SIGNATURE: &[u8] = b"\xeb\x52\x90-FVE-FS-";
const SEVEN_SIGNATURE: &[u8] = b"\xeb\x58\x90-FVE-FS-";

/// Geometry and metadata pointers recovered from the NTFS boot sector.
///
/// This component only locates things; it performs no cryptography.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    /// Bytes per sector, a power of two in 512..=4096.
    pub bytes_per_sector: u16,
    /// Total volume size in bytes.
    pub volume_size: u64,
    /// BitLocker identifier GUID from the boot sector.
    pub identifier: Uuid,
    /// Offsets of the three redundant FVE metadata block copies.
    pub metadata_offsets: [u64; 3],
}

impl VolumeHeader {
    /// Reads and validates the boot sector of `source`.
    pub fn read(source: &dyn ByteSource) -> Result<Self> {
        let mut sector = [0u8; BOOT_SECTOR_SIZE];
        source.read_at(0, &mut sector)?;
        let header = Self::parse(&sector)?;
        if header.volume_size > source.len() {
            return Err(FveError::InvalidVolumeHeader(
                "declared volume size exceeds medium size",
            ));
        }
        for offset in header.metadata_offsets {
            if offset >= source.len() {
                return Err(FveError::InvalidVolumeHeader(
                    "metadata block offset beyond medium",
                ));
            }
        }
        Ok(header)
    }

    /// Parses a raw 512-byte boot sector.
    pub fn parse(sector: &[u8]) -> Result<Self> {
        if sector.len() < BOOT_SECTOR_SIZE {
            return Err(FveError::InvalidVolumeHeader("boot sector truncated"));
        }
        let signature = &sector[0..11];
        if signature != SEVEN_SIGNATURE && signature != VISTA_SIGNATURE {
            return Err(FveError::InvalidVolumeHeader(
                "missing -FVE-FS- boot signature",
            ));
        }

        let bytes_per_sector = LittleEndian::read_u16(&sector[11..13]);
        if bytes_per_sector == 0
            || !bytes_per_sector.is_power_of_two()
            || !(512..=4096).contains(&bytes_per_sector)
        {
            return Err(FveError::InvalidVolumeHeader("invalid sector size"));
        }

        let total_sectors = LittleEndian::read_u64(&sector[0x28..0x30]);
        let volume_size = total_sectors
            .checked_mul(u64::from(bytes_per_sector))
            .ok_or(FveError::InvalidVolumeHeader("volume size overflow"))?;
        if volume_size == 0 {
            return Err(FveError::InvalidVolumeHeader("zero volume size"));
        }

        let mut identifier_raw = [0u8; 16];
        identifier_raw.copy_from_slice(&sector[160..176]);
        let identifier = Uuid::from_bytes_le(identifier_raw);

        let metadata_offsets = [
            LittleEndian::read_u64(&sector[176..184]),
            LittleEndian::read_u64(&sector[184..192]),
            LittleEndian::read_u64(&sector[192..200]),
        ];

        log::debug!(
            "boot sector: {} bytes/sector, {} bytes total, identifier {}",
            bytes_per_sector,
            volume_size,
            identifier
        );

        Ok(Self {
            bytes_per_sector,
            volume_size,
            identifier,
            metadata_offsets,
        })
    }
}
