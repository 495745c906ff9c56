//! FVE metadata blocks.
//!
//! Each of the three metadata copies starts with a 64-byte block header,
//! followed by a 48-byte metadata header and the entry array:
//!
//! ```text
//! [0x00] Block header     "-FVE-FS-", size, version, geometry
//! [0x40] Metadata header  size, version, volume GUID, method, FILETIME
//! [0x70] Entries          until 0x40 + metadata header size
//! ```

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::crypto::EncryptionMethod;
use crate::entry::{
    parse_entries, AesCcmEncryptedKey, EntryType, EntryValue, MetadataEntry, ProtectionType,
    VolumeMasterKeyValue,
};
use crate::error::{FormatError, Result};
use crate::header::{read_guid, BDE_SIGNATURE};
use crate::source::{ByteSource, SourceWindow};

pub const METADATA_BLOCK_HEADER_SIZE: usize = 64;
pub const METADATA_HEADER_SIZE: usize = 48;
// Block header plus metadata header; the smallest meaningful block.
pub const METADATA_MINIMUM_SIZE: usize = METADATA_BLOCK_HEADER_SIZE + METADATA_HEADER_SIZE;

// FILETIME ticks (100 ns) between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH: u64 = 116_444_736_000_000_000;

/// The 64-byte header in front of every metadata copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataBlockHeader {
    // Format version at 0x0a, 1 (Vista) or 2 (2 bytes).
    pub version: u16,
    // Raw size field at 0x08 (2 bytes); see `block_size`.
    pub size: u16,
    // Number of bytes already encrypted at 0x10 (8 bytes).
    pub encrypted_volume_size: u64,
    // Number of relocated boot sectors at 0x1c (4 bytes).
    pub volume_header_sectors: u32,
    // Offsets of the three metadata copies at 0x20 (3 x 8 bytes).
    pub metadata_offsets: [u64; 3],
    // Volume header offset (version 2) or MFT mirror cluster block number
    // (version 1) at 0x38 (8 bytes).
    pub volume_header_offset: u64,
}

impl MetadataBlockHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_BLOCK_HEADER_SIZE {
            return Err(FormatError::Truncated.into());
        }
        if &data[0..8] != BDE_SIGNATURE {
            return Err(FormatError::BadSignature.into());
        }

        let version = LittleEndian::read_u16(&data[10..12]);
        if version != 1 && version != 2 {
            return Err(FormatError::UnsupportedVersion(version).into());
        }

        Ok(MetadataBlockHeader {
            version,
            size: LittleEndian::read_u16(&data[8..10]),
            encrypted_volume_size: LittleEndian::read_u64(&data[16..24]),
            volume_header_sectors: LittleEndian::read_u32(&data[28..32]),
            metadata_offsets: [
                LittleEndian::read_u64(&data[32..40]),
                LittleEndian::read_u64(&data[40..48]),
                LittleEndian::read_u64(&data[48..56]),
            ],
            volume_header_offset: LittleEndian::read_u64(&data[56..64]),
        })
    }

    /// Size of the whole metadata block in bytes.
    pub fn block_size(&self) -> u64 {
        match self.version {
            1 => self.size as u64,
            _ => self.size as u64 * 16,
        }
    }
}

/// The 48-byte header that precedes an entry array, shared by metadata
/// blocks and startup key files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataHeader {
    // Size of the header plus entries (4 bytes).
    pub size: u32,
    // Always 1 (4 bytes).
    pub version: u32,
    // Volume GUID at 0x10 (16 bytes).
    pub volume_identifier: Uuid,
    // Counter for the next AES-CCM nonce at 0x20 (4 bytes).
    pub next_nonce_counter: u32,
    // Sector encryption method at 0x24 (2 bytes).
    pub encryption_method: EncryptionMethod,
    // FILETIME of the creation at 0x28 (8 bytes).
    pub creation_time: u64,
}

impl MetadataHeader {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < METADATA_HEADER_SIZE {
            return Err(FormatError::Truncated.into());
        }
        let size = LittleEndian::read_u32(&data[0..4]);
        let version = LittleEndian::read_u32(&data[4..8]);
        let header_size = LittleEndian::read_u32(&data[8..12]);

        if version != 1 {
            return Err(FormatError::UnsupportedVersion(version as u16).into());
        }
        if (size as usize) < METADATA_HEADER_SIZE || header_size as usize != METADATA_HEADER_SIZE {
            return Err(FormatError::Invalid("metadata header size").into());
        }

        Ok(MetadataHeader {
            size,
            version,
            volume_identifier: read_guid(&data[16..32]),
            next_nonce_counter: LittleEndian::read_u32(&data[32..36]),
            encryption_method: EncryptionMethod::from(LittleEndian::read_u16(&data[36..38])),
            creation_time: LittleEndian::read_u64(&data[40..48]),
        })
    }

    /// Parse the header and the entry array that follows it in `data`.
    pub(crate) fn parse_with_entries(data: &[u8]) -> Result<(Self, Vec<MetadataEntry>)> {
        let header = Self::parse(data)?;
        let end = header.size as usize;
        if end > data.len() {
            return Err(FormatError::SizeOutOfBounds.into());
        }
        let entries = parse_entries(&data[METADATA_HEADER_SIZE..end])?;
        Ok((header, entries))
    }
}

/// A key protector as reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyProtector {
    // Identifier of the volume master key.
    pub identifier: Uuid,
    pub protection_type: ProtectionType,
}

/// One decoded metadata copy.
#[derive(Debug, Clone)]
pub struct Metadata {
    // Geometry of the copy this was read from.
    pub block_header: MetadataBlockHeader,
    pub volume_identifier: Uuid,
    // FILETIME.
    pub creation_time: u64,
    pub encryption_method: EncryptionMethod,
    // Computer name, drive letter and date, as set by Windows.
    pub description: Option<String>,
    // Key protectors in on-disk order.
    pub volume_master_keys: Vec<VolumeMasterKeyValue>,
    // The FVEK wrapped with the volume master key.
    pub full_volume_encryption_key: Option<AesCcmEncryptedKey>,
    // The complete top-level entry array, including entries not lifted
    // into the fields above.
    pub entries: Vec<MetadataEntry>,
}

impl Metadata {
    /// Decode a complete metadata block.
    pub fn parse(block: &[u8]) -> Result<Self> {
        let block_header = MetadataBlockHeader::parse(block)?;

        let block_size = usize::try_from(block_header.block_size())
            .map_err(|_| FormatError::SizeOutOfBounds)?;
        if block_size < METADATA_MINIMUM_SIZE {
            return Err(FormatError::Invalid("metadata size").into());
        }
        if block_size > block.len() {
            return Err(FormatError::Truncated.into());
        }

        let (header, entries) =
            MetadataHeader::parse_with_entries(&block[METADATA_BLOCK_HEADER_SIZE..block_size])?;

        let mut description = None;
        let mut volume_master_keys = Vec::new();
        let mut full_volume_encryption_key = None;

        for entry in &entries {
            match (entry.entry_type, &entry.value) {
                (EntryType::Description, EntryValue::UnicodeString(text)) => {
                    description = Some(text.clone());
                }
                (EntryType::VolumeMasterKey, EntryValue::VolumeMasterKey(vmk)) => {
                    log::debug!(
                        "Volume master key {} protected by {}",
                        vmk.identifier,
                        vmk.protection_type
                    );
                    volume_master_keys.push(vmk.clone());
                }
                (EntryType::FullVolumeEncryptionKey, EntryValue::AesCcmEncryptedKey(key)) => {
                    // The first FVEK entry is authoritative.
                    if full_volume_encryption_key.is_none() {
                        full_volume_encryption_key = Some(key.clone());
                    }
                }
                _ => {}
            }
        }

        Ok(Metadata {
            block_header,
            volume_identifier: header.volume_identifier,
            creation_time: header.creation_time,
            encryption_method: header.encryption_method,
            description,
            volume_master_keys,
            full_volume_encryption_key,
            entries,
        })
    }

    /// Read and decode the metadata copy at `offset`.
    pub(crate) fn read<S: ByteSource>(source: &mut SourceWindow<S>, offset: u64) -> Result<Self> {
        let mut header_data = [0u8; METADATA_BLOCK_HEADER_SIZE];
        source.read_exact_at(offset, &mut header_data)?;
        let block_header = MetadataBlockHeader::parse(&header_data)?;

        // The size field is 16 bits wide, so a block never exceeds 1 MiB.
        let block_size = block_header.block_size() as usize;
        if block_size < METADATA_MINIMUM_SIZE {
            return Err(FormatError::Invalid("metadata size").into());
        }
        let mut block = vec![0u8; block_size];
        source.read_exact_at(offset, &mut block)?;
        Self::parse(&block)
    }

    pub fn key_protectors(&self) -> impl Iterator<Item = KeyProtector> + '_ {
        self.volume_master_keys.iter().map(|vmk| KeyProtector {
            identifier: vmk.identifier,
            protection_type: vmk.protection_type,
        })
    }
}

/// Convert a FILETIME (100 ns ticks since 1601-01-01) to `SystemTime`.
pub fn filetime_to_system_time(filetime: u64) -> SystemTime {
    if filetime >= FILETIME_UNIX_EPOCH {
        let ticks = filetime - FILETIME_UNIX_EPOCH;
        UNIX_EPOCH + Duration::new(ticks / 10_000_000, (ticks % 10_000_000) as u32 * 100)
    } else {
        let ticks = FILETIME_UNIX_EPOCH - filetime;
        let before = Duration::new(ticks / 10_000_000, (ticks % 10_000_000) as u32 * 100);
        UNIX_EPOCH.checked_sub(before).unwrap_or(UNIX_EPOCH)
    }
}
