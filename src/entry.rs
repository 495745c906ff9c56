//! Metadata entries: the typed, sized records that make up BitLocker
//! metadata, startup key files and unwrapped key payloads.
//!
//! ```text
//! [0x00] Size        (u16, includes this header)
//! [0x02] EntryType   (u16, role of a top-level entry; 0 for properties)
//! [0x04] ValueType   (u16, layout of the payload)
//! [0x06] Version     (u16)
//! [0x08] Payload     (Size - 8 bytes)
//! ```
//!
//! Container values (volume master keys, stretch keys, external keys, use
//! keys) carry a nested entry array in their payload. Every nested array is
//! parsed against the payload slice of its parent, so a declared size can
//! never reach past the enclosing entry.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::error::{FormatError, Result};
use crate::header::read_guid;

pub const ENTRY_HEADER_SIZE: usize = 8;

// Containers nest a couple of levels deep on real volumes.
const MAX_NESTING_DEPTH: usize = 16;

/// Role of an entry inside a metadata entry array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    Property,
    VolumeMasterKey,
    FullVolumeEncryptionKey,
    Validation,
    StartupKey,
    Description,
    FullVolumeEncryptionKeyBackup,
    VolumeHeaderBlock,
    Unknown(u16),
}

impl From<u16> for EntryType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => EntryType::Property,
            0x0002 => EntryType::VolumeMasterKey,
            0x0003 => EntryType::FullVolumeEncryptionKey,
            0x0004 => EntryType::Validation,
            0x0006 => EntryType::StartupKey,
            0x0007 => EntryType::Description,
            0x000b => EntryType::FullVolumeEncryptionKeyBackup,
            0x000f => EntryType::VolumeHeaderBlock,
            other => EntryType::Unknown(other),
        }
    }
}

/// Payload layout tag of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Erased,
    Key,
    UnicodeString,
    StretchKey,
    UseKey,
    AesCcmEncryptedKey,
    TpmEncodedKey,
    Validation,
    VolumeMasterKey,
    ExternalKey,
    Update,
    Error,
    OffsetAndSize,
    Unknown(u16),
}

impl From<u16> for ValueType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ValueType::Erased,
            0x0001 => ValueType::Key,
            0x0002 => ValueType::UnicodeString,
            0x0003 => ValueType::StretchKey,
            0x0004 => ValueType::UseKey,
            0x0005 => ValueType::AesCcmEncryptedKey,
            0x0006 => ValueType::TpmEncodedKey,
            0x0007 => ValueType::Validation,
            0x0008 => ValueType::VolumeMasterKey,
            0x0009 => ValueType::ExternalKey,
            0x000a => ValueType::Update,
            0x000b => ValueType::Error,
            0x000f => ValueType::OffsetAndSize,
            other => ValueType::Unknown(other),
        }
    }
}

/// Mechanism protecting a volume master key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtectionType {
    ClearKey,
    Tpm,
    StartupKey,
    TpmAndPin,
    RecoveryPassword,
    Password,
    Unknown(u16),
}

impl ProtectionType {
    pub fn as_u16(&self) -> u16 {
        match self {
            ProtectionType::ClearKey => 0x0000,
            ProtectionType::Tpm => 0x0100,
            ProtectionType::StartupKey => 0x0200,
            ProtectionType::TpmAndPin => 0x0500,
            ProtectionType::RecoveryPassword => 0x0800,
            ProtectionType::Password => 0x2000,
            ProtectionType::Unknown(value) => *value,
        }
    }
}

impl From<u16> for ProtectionType {
    fn from(value: u16) -> Self {
        match value {
            0x0000 => ProtectionType::ClearKey,
            0x0100 => ProtectionType::Tpm,
            0x0200 => ProtectionType::StartupKey,
            0x0500 => ProtectionType::TpmAndPin,
            0x0800 => ProtectionType::RecoveryPassword,
            0x2000 => ProtectionType::Password,
            other => ProtectionType::Unknown(other),
        }
    }
}

impl fmt::Display for ProtectionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtectionType::ClearKey => write!(f, "Clear key"),
            ProtectionType::Tpm => write!(f, "TPM"),
            ProtectionType::StartupKey => write!(f, "Startup key"),
            ProtectionType::TpmAndPin => write!(f, "TPM and PIN"),
            ProtectionType::RecoveryPassword => write!(f, "Recovery password"),
            ProtectionType::Password => write!(f, "Password"),
            ProtectionType::Unknown(value) => write!(f, "Unknown (0x{:04x})", value),
        }
    }
}

/// A key value: method identifier plus raw key bytes.
#[derive(Clone)]
pub struct KeyValue {
    pub method: u32,
    pub data: Zeroizing<Vec<u8>>,
}

impl fmt::Debug for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("KeyValue")
            .field("method", &format_args!("0x{:04x}", self.method))
            .field("size", &self.data.len())
            .finish()
    }
}

/// An AES-CCM wrapped key: 12-byte nonce, 16-byte MAC, ciphertext.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AesCcmEncryptedKey {
    pub nonce: [u8; 12],
    pub mac: [u8; 16],
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct StretchKeyValue {
    pub method: u32,
    pub salt: [u8; 16],
    pub entries: Vec<MetadataEntry>,
}

/// A volume master key with its protector chain.
#[derive(Debug, Clone)]
pub struct VolumeMasterKeyValue {
    pub identifier: Uuid,
    // FILETIME of the last modification.
    pub modification_time: u64,
    pub protection_type: ProtectionType,
    pub entries: Vec<MetadataEntry>,
}

#[derive(Debug, Clone)]
pub struct ExternalKeyValue {
    pub identifier: Uuid,
    pub modification_time: u64,
    pub entries: Vec<MetadataEntry>,
}

/// Decoded payload of an entry.
#[derive(Debug, Clone)]
pub enum EntryValue {
    Erased,
    Key(KeyValue),
    UnicodeString(String),
    StretchKey(StretchKeyValue),
    UseKey { method: u32, entries: Vec<MetadataEntry> },
    AesCcmEncryptedKey(AesCcmEncryptedKey),
    VolumeMasterKey(VolumeMasterKeyValue),
    ExternalKey(ExternalKeyValue),
    OffsetAndSize { offset: u64, size: u64 },
    // Recognised but uninterpreted values (TPM blobs, validation, update,
    // error) and unknown tags are kept as raw bytes.
    Opaque { value_type: ValueType, data: Vec<u8> },
}

#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub entry_type: EntryType,
    pub version: u16,
    pub value: EntryValue,
}

impl MetadataEntry {
    /// Decode the entry at the start of `data`.
    ///
    /// Returns the entry and the number of bytes it occupies. `data` is the
    /// remaining budget: a declared size beyond it fails with
    /// `FormatError::SizeOutOfBounds`.
    pub fn parse(data: &[u8]) -> Result<(MetadataEntry, usize)> {
        Self::parse_at_depth(data, 0)
    }

    fn parse_at_depth(data: &[u8], depth: usize) -> Result<(MetadataEntry, usize)> {
        if data.len() < ENTRY_HEADER_SIZE {
            return Err(FormatError::Truncated.into());
        }
        let size = LittleEndian::read_u16(&data[0..2]) as usize;
        let entry_type = EntryType::from(LittleEndian::read_u16(&data[2..4]));
        let value_type = ValueType::from(LittleEndian::read_u16(&data[4..6]));
        let version = LittleEndian::read_u16(&data[6..8]);

        if size < ENTRY_HEADER_SIZE {
            return Err(FormatError::Invalid("entry size smaller than header").into());
        }
        if size > data.len() {
            return Err(FormatError::SizeOutOfBounds.into());
        }

        let payload = &data[ENTRY_HEADER_SIZE..size];
        let value = parse_value(value_type, payload, depth)?;
        log::debug!(
            "Entry {:?}/{:?} version {} size {}",
            entry_type,
            value_type,
            version,
            size
        );

        Ok((MetadataEntry { entry_type, version, value }, size))
    }

    pub fn value_type(&self) -> ValueType {
        match &self.value {
            EntryValue::Erased => ValueType::Erased,
            EntryValue::Key(_) => ValueType::Key,
            EntryValue::UnicodeString(_) => ValueType::UnicodeString,
            EntryValue::StretchKey(_) => ValueType::StretchKey,
            EntryValue::UseKey { .. } => ValueType::UseKey,
            EntryValue::AesCcmEncryptedKey(_) => ValueType::AesCcmEncryptedKey,
            EntryValue::VolumeMasterKey(_) => ValueType::VolumeMasterKey,
            EntryValue::ExternalKey(_) => ValueType::ExternalKey,
            EntryValue::OffsetAndSize { .. } => ValueType::OffsetAndSize,
            EntryValue::Opaque { value_type, .. } => *value_type,
        }
    }

    /// Nested entries of a container value; empty for leaf values.
    pub fn children(&self) -> &[MetadataEntry] {
        match &self.value {
            EntryValue::StretchKey(stretch) => &stretch.entries,
            EntryValue::UseKey { entries, .. } => entries,
            EntryValue::VolumeMasterKey(vmk) => &vmk.entries,
            EntryValue::ExternalKey(external) => &external.entries,
            _ => &[],
        }
    }
}

/// Parse an entry array until the data runs out or the all-zero
/// terminator entry is reached.
pub fn parse_entries(data: &[u8]) -> Result<Vec<MetadataEntry>> {
    parse_entries_at_depth(data, 0)
}

fn parse_entries_at_depth(data: &[u8], depth: usize) -> Result<Vec<MetadataEntry>> {
    if depth > MAX_NESTING_DEPTH {
        return Err(FormatError::Invalid("entries nested too deeply").into());
    }

    let mut entries = Vec::new();
    let mut remaining = data;
    while remaining.len() >= ENTRY_HEADER_SIZE {
        if remaining[..ENTRY_HEADER_SIZE].iter().all(|&b| b == 0) {
            break;
        }
        let (entry, size) = MetadataEntry::parse_at_depth(remaining, depth)?;
        entries.push(entry);
        remaining = &remaining[size..];
    }
    Ok(entries)
}

fn parse_value(value_type: ValueType, payload: &[u8], depth: usize) -> Result<EntryValue> {
    let value = match value_type {
        ValueType::Erased => EntryValue::Erased,
        ValueType::Key => {
            require(payload, 4)?;
            EntryValue::Key(KeyValue {
                method: LittleEndian::read_u32(&payload[0..4]),
                data: Zeroizing::new(payload[4..].to_vec()),
            })
        }
        ValueType::UnicodeString => EntryValue::UnicodeString(read_utf16_string(payload)),
        ValueType::StretchKey => {
            require(payload, 20)?;
            let mut salt = [0u8; 16];
            salt.copy_from_slice(&payload[4..20]);
            EntryValue::StretchKey(StretchKeyValue {
                method: LittleEndian::read_u32(&payload[0..4]),
                salt,
                entries: parse_entries_at_depth(&payload[20..], depth + 1)?,
            })
        }
        ValueType::UseKey => {
            require(payload, 4)?;
            EntryValue::UseKey {
                method: LittleEndian::read_u32(&payload[0..4]),
                entries: parse_entries_at_depth(&payload[4..], depth + 1)?,
            }
        }
        ValueType::AesCcmEncryptedKey => {
            require(payload, 28)?;
            let mut nonce = [0u8; 12];
            nonce.copy_from_slice(&payload[0..12]);
            let mut mac = [0u8; 16];
            mac.copy_from_slice(&payload[12..28]);
            EntryValue::AesCcmEncryptedKey(AesCcmEncryptedKey {
                nonce,
                mac,
                data: payload[28..].to_vec(),
            })
        }
        ValueType::VolumeMasterKey => {
            require(payload, 28)?;
            // Bytes 24..26 are an unknown field.
            EntryValue::VolumeMasterKey(VolumeMasterKeyValue {
                identifier: read_guid(&payload[0..16]),
                modification_time: LittleEndian::read_u64(&payload[16..24]),
                protection_type: ProtectionType::from(LittleEndian::read_u16(&payload[26..28])),
                entries: parse_entries_at_depth(&payload[28..], depth + 1)?,
            })
        }
        ValueType::ExternalKey => {
            require(payload, 24)?;
            EntryValue::ExternalKey(ExternalKeyValue {
                identifier: read_guid(&payload[0..16]),
                modification_time: LittleEndian::read_u64(&payload[16..24]),
                entries: parse_entries_at_depth(&payload[24..], depth + 1)?,
            })
        }
        ValueType::OffsetAndSize => {
            require(payload, 16)?;
            EntryValue::OffsetAndSize {
                offset: LittleEndian::read_u64(&payload[0..8]),
                size: LittleEndian::read_u64(&payload[8..16]),
            }
        }
        other => EntryValue::Opaque { value_type: other, data: payload.to_vec() },
    };
    Ok(value)
}

// Fixed payload fields must fit in the entry.
fn require(payload: &[u8], size: usize) -> Result<()> {
    if payload.len() < size {
        return Err(FormatError::SizeOutOfBounds.into());
    }
    Ok(())
}

// UTF-16LE without the terminating NUL characters.
fn read_utf16_string(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(LittleEndian::read_u16)
        .collect();
    let end = units.iter().rposition(|&unit| unit != 0).map_or(0, |pos| pos + 1);
    String::from_utf16_lossy(&units[..end])
}
