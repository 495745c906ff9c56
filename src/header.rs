// Import the ByteOrder trait and LittleEndian struct from the byteorder crate.
// All BitLocker on-disk integers are little-endian.
use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{FormatError, Result};
use crate::metadata::{MetadataBlockHeader, METADATA_MINIMUM_SIZE};
use crate::source::{ByteSource, SourceWindow};

// Size of the boot sector that carries the BitLocker volume header.
pub const BOOT_SECTOR_SIZE: usize = 512;

// Signature shared by the Vista and Windows 7+ volume headers.
pub const BDE_SIGNATURE: &[u8; 8] = b"-FVE-FS-";
// Signature of BitLocker To Go volumes (FAT compatible header).
pub const TO_GO_SIGNATURE: &[u8; 8] = b"MSWIN4.1";
// Boot entry point used by Vista volumes; Windows 7 uses EB 58 90.
const VISTA_ENTRY_POINT: [u8; 3] = [0xeb, 0x52, 0x90];
// Original NTFS signature restored into the Vista boot sector.
const NTFS_SIGNATURE: &[u8; 8] = b"NTFS    ";
// Offset of the MFT mirror cluster number inside an NTFS boot sector.
const NTFS_MFT_MIRROR_OFFSET: usize = 0x38;

/// On-disk layout family of a BitLocker volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatVersion {
    /// Windows Vista (version 1).
    Vista,
    /// Windows 7 and later (version 2).
    Seven,
    /// BitLocker To Go removable media (version 2 with a FAT header).
    ToGo,
}

impl FormatVersion {
    /// Numeric format version (1 or 2).
    pub fn number(&self) -> u16 {
        match self {
            FormatVersion::Vista => 1,
            FormatVersion::Seven | FormatVersion::ToGo => 2,
        }
    }
}

/// Fields decoded from the boot sector alone.
#[derive(Debug, Clone)]
pub struct BootSector {
    // Layout family, from the signature and the boot entry point.
    pub version: FormatVersion,
    // Bytes per sector at offset 0x0b (2 bytes).
    pub bytes_per_sector: u16,
    // Sectors per cluster block at offset 0x0d (1 byte).
    pub sectors_per_cluster_block: u8,
    // Number of sectors as reported by the boot sector (0 when not stored).
    pub total_number_of_sectors: u64,
    // Volume identifier, only stored in version 2 headers.
    pub volume_identifier: Option<Uuid>,
    // Metadata offsets known from the boot sector. For Vista only the first
    // one is stored; the others come from the metadata block header.
    pub metadata_offsets: [u64; 3],
}

impl BootSector {
    /// Decode the boot sector of a BitLocker volume.
    pub fn parse(data: &[u8]) -> Result<Self> {
        // The header must cover a full 512-byte boot sector.
        if data.len() < BOOT_SECTOR_SIZE {
            return Err(FormatError::Truncated.into());
        }

        // The signature follows the 3-byte boot entry point.
        let signature = &data[3..11];
        let version = if signature == BDE_SIGNATURE {
            if data[0..3] == VISTA_ENTRY_POINT {
                FormatVersion::Vista
            } else {
                FormatVersion::Seven
            }
        } else if signature == TO_GO_SIGNATURE {
            FormatVersion::ToGo
        } else {
            return Err(FormatError::BadSignature.into());
        };

        // Read the sector geometry.
        let bytes_per_sector = LittleEndian::read_u16(&data[0x0b..0x0d]);
        let sectors_per_cluster_block = data[0x0d];

        // Sectors must be a power of two large enough to hold the boot sector.
        if !bytes_per_sector.is_power_of_two() || (bytes_per_sector as usize) < BOOT_SECTOR_SIZE {
            return Err(FormatError::Invalid("bytes per sector").into());
        }
        if sectors_per_cluster_block == 0 {
            return Err(FormatError::Invalid("sectors per cluster block").into());
        }

        // The 16-bit and 32-bit counts are FAT fields; NTFS style headers
        // store a 64-bit count at 0x28 instead.
        let sectors_16 = LittleEndian::read_u16(&data[0x13..0x15]) as u64;
        let sectors_32 = LittleEndian::read_u32(&data[0x20..0x24]) as u64;
        let sectors_64 = if version == FormatVersion::ToGo {
            0
        } else {
            LittleEndian::read_u64(&data[0x28..0x30])
        };
        let total_number_of_sectors = [sectors_16, sectors_32, sectors_64]
            .into_iter()
            .find(|&count| count != 0)
            .unwrap_or(0);

        let (volume_identifier, metadata_offsets) = match version {
            FormatVersion::Vista => {
                // Vista stores the cluster block number of the first metadata copy.
                let cluster_block_number = LittleEndian::read_u64(&data[0x38..0x40]);
                let cluster_block_size =
                    bytes_per_sector as u64 * sectors_per_cluster_block as u64;
                let first = cluster_block_number
                    .checked_mul(cluster_block_size)
                    .ok_or(FormatError::SizeOutOfBounds)?;
                (None, [first, 0, 0])
            }
            FormatVersion::Seven => (
                Some(read_guid(&data[0xa0..0xb0])),
                read_offsets(&data[0xb0..0xc8]),
            ),
            FormatVersion::ToGo => (
                Some(read_guid(&data[0x1a8..0x1b8])),
                read_offsets(&data[0x1b8..0x1d0]),
            ),
        };

        Ok(BootSector {
            version,
            bytes_per_sector,
            sectors_per_cluster_block,
            total_number_of_sectors,
            volume_identifier,
            metadata_offsets,
        })
    }

    /// Read and decode the boot sector at the start of `source`.
    pub(crate) fn read<S: ByteSource>(source: &mut SourceWindow<S>) -> Result<Self> {
        let mut data = [0u8; BOOT_SECTOR_SIZE];
        source.read_exact_at(0, &mut data)?;
        Self::parse(&data)
    }
}

/// Fields whose meaning depends on the format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionSpecific {
    /// Vista keeps the NTFS MFT mirror location in the metadata instead of
    /// the boot sector.
    Vista { mft_mirror_cluster_block_number: u64 },
    /// Windows 7+ relocates the original boot sectors to an encrypted area.
    Seven {
        volume_header_offset: u64,
        volume_header_size: u64,
    },
}

/// The volume geometry: boot sector plus the metadata block header of the
/// accepted metadata copy. Immutable once built.
#[derive(Debug, Clone)]
pub struct VolumeHeader {
    // Layout family of the volume.
    pub version: FormatVersion,
    // Size of one sector in bytes, the unit of encryption.
    pub bytes_per_sector: u16,
    // Cluster block size in sectors.
    pub sectors_per_cluster_block: u8,
    // Byte offsets of the three metadata copies (0 when absent).
    pub metadata_offsets: [u64; 3],
    // Size of each metadata block in bytes.
    pub metadata_size: u64,
    // Size of the decrypted volume in bytes.
    pub volume_size: u64,
    // Bytes from the start of the volume that are encrypted; the rest is
    // still stored in the clear.
    pub encrypted_volume_size: u64,
    // Version dependent location of the original boot sectors.
    pub version_specific: VersionSpecific,
}

impl VolumeHeader {
    /// Combine the boot sector with a metadata block header.
    ///
    /// `source_size` is used as the volume size when the boot sector does not
    /// record a sector count. For Windows 7+ volumes the relocated volume
    /// header must be sector aligned and fit inside both the volume and the
    /// source, otherwise `FormatError::SizeOutOfBounds` is returned.
    pub fn new(boot: &BootSector, block: &MetadataBlockHeader, source_size: u64) -> Result<Self> {
        // The block header version has to agree with the boot sector.
        if block.version != boot.version.number() {
            return Err(FormatError::UnsupportedVersion(block.version).into());
        }

        // Metadata blocks must at least hold the block and metadata headers.
        let metadata_size = block.block_size();
        if metadata_size < METADATA_MINIMUM_SIZE as u64 {
            return Err(FormatError::Invalid("metadata size").into());
        }

        let bytes_per_sector = boot.bytes_per_sector as u64;

        // Prefer the sector count of the boot sector, fall back on the source.
        let volume_size = if boot.total_number_of_sectors != 0 {
            boot.total_number_of_sectors
                .checked_mul(bytes_per_sector)
                .ok_or(FormatError::SizeOutOfBounds)?
        } else {
            // A trailing partial sector is not addressable.
            source_size - source_size % bytes_per_sector
        };

        // Vista only knows the first offset from the boot sector.
        let metadata_offsets = match boot.version {
            FormatVersion::Vista => block.metadata_offsets,
            _ => boot.metadata_offsets,
        };

        let version_specific = match boot.version {
            FormatVersion::Vista => VersionSpecific::Vista {
                mft_mirror_cluster_block_number: block.volume_header_offset,
            },
            _ => {
                let volume_header_offset = block.volume_header_offset;
                let volume_header_size = (block.volume_header_sectors as u64)
                    .checked_mul(bytes_per_sector)
                    .ok_or(FormatError::SizeOutOfBounds)?;

                // The relocated boot sectors are read sector by sector from
                // the source, so they must lie inside both the volume and
                // the source.
                let volume_header_end = volume_header_offset
                    .checked_add(volume_header_size)
                    .ok_or(FormatError::SizeOutOfBounds)?;
                if volume_header_size > volume_size
                    || volume_header_end > volume_size
                    || volume_header_end > source_size
                {
                    return Err(FormatError::SizeOutOfBounds.into());
                }
                if volume_header_offset % bytes_per_sector != 0 {
                    return Err(FormatError::Invalid("volume header alignment").into());
                }
                VersionSpecific::Seven { volume_header_offset, volume_header_size }
            }
        };

        Ok(VolumeHeader {
            version: boot.version,
            bytes_per_sector: boot.bytes_per_sector,
            sectors_per_cluster_block: boot.sectors_per_cluster_block,
            metadata_offsets,
            metadata_size,
            volume_size,
            encrypted_volume_size: block.encrypted_volume_size,
            version_specific,
        })
    }

    /// Size of the logical volume header region that is not decrypted in
    /// place: the restored boot sector (Vista) or the relocated boot
    /// sectors (Windows 7+).
    pub fn volume_header_size(&self) -> u64 {
        match self.version_specific {
            VersionSpecific::Vista { .. } => self.bytes_per_sector as u64,
            VersionSpecific::Seven { volume_header_size, .. } => volume_header_size,
        }
    }

    /// Physical location of the relocated boot sectors, if any.
    pub fn volume_header_offset(&self) -> Option<u64> {
        match self.version_specific {
            VersionSpecific::Vista { .. } => None,
            VersionSpecific::Seven { volume_header_offset, .. } => Some(volume_header_offset),
        }
    }

    /// Read the plaintext boot sector of a Vista volume.
    ///
    /// Vista keeps the NTFS boot sector unencrypted, with the signature and
    /// MFT mirror field overwritten; both are restored here. Windows 7+
    /// volumes return `None`: their boot sectors are decrypted on demand
    /// from the volume header offset.
    pub(crate) fn read_unencrypted_volume_header<S: ByteSource>(
        &self,
        source: &mut SourceWindow<S>,
    ) -> Result<Option<Vec<u8>>> {
        let VersionSpecific::Vista { mft_mirror_cluster_block_number } = self.version_specific
        else {
            return Ok(None);
        };

        let mut data = vec![0u8; self.bytes_per_sector as usize];
        source.read_exact_at(0, &mut data)?;

        // Restore the NTFS signature (8 bytes at 0x03).
        data[3..11].copy_from_slice(NTFS_SIGNATURE);
        // Restore the MFT mirror cluster number (8 bytes at 0x38).
        LittleEndian::write_u64(
            &mut data[NTFS_MFT_MIRROR_OFFSET..NTFS_MFT_MIRROR_OFFSET + 8],
            mft_mirror_cluster_block_number,
        );
        log::debug!("Restored NTFS boot sector of Vista volume");
        Ok(Some(data))
    }
}

// GUIDs are stored in the mixed-endian Windows layout.
pub(crate) fn read_guid(data: &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&data[..16]);
    Uuid::from_bytes_le(bytes)
}

fn read_offsets(data: &[u8]) -> [u64; 3] {
    [
        LittleEndian::read_u64(&data[0..8]),
        LittleEndian::read_u64(&data[8..16]),
        LittleEndian::read_u64(&data[16..24]),
    ]
}
