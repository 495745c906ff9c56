//! Key protectors: turning credentials into the full volume encryption key.
//!
//! Every protector ends in the same two AES-CCM unwraps:
//!
//! ```text
//! credential --(stretch / clear / external key)--> unwrap key
//! unwrap key --AES-CCM--> volume master key (VMK)
//! VMK        --AES-CCM--> full volume encryption key (FVEK) + tweak key
//! ```

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{AeadInPlace, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use sha2::{Digest, Sha256};
use uuid::Uuid;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::crypto::EncryptionMethod;
use crate::entry::{
    AesCcmEncryptedKey, EntryType, EntryValue, KeyValue, MetadataEntry, ProtectionType,
    VolumeMasterKeyValue,
};
use crate::error::{CryptoError, Error, FormatError, KeyError, Result};
use crate::metadata::{Metadata, MetadataHeader};

type Aes256Ccm = Ccm<Aes256, U16, U12>;

pub const STRETCH_ROUNDS: u64 = 0x100000;
// Rounds between two polls of the abort signal.
const ABORT_POLL_INTERVAL: u64 = 4096;

const RECOVERY_PASSWORD_GROUPS: usize = 8;
const RECOVERY_PASSWORD_GROUP_DIGITS: usize = 6;
const RECOVERY_PASSWORD_GROUP_LIMIT: u32 = 11 << 16;

pub const EXTERNAL_KEY_SIZE: usize = 32;

/// Cancellation flag shared between a volume and the code driving it.
///
/// Cloning yields a handle to the same flag, so another thread can raise
/// it while `open` or `unlock` is stretching a password.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal(Arc<AtomicBool>);

impl AbortSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_signaled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Clear the flag so the next long-running call can proceed.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub(crate) fn check(&self) -> Result<()> {
        if self.is_signaled() {
            Err(Error::Aborted)
        } else {
            Ok(())
        }
    }
}

/// An external key read from a startup key (.BEK) file.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct StartupKey {
    // Identifier of the volume master key this key unlocks.
    #[zeroize(skip)]
    pub identifier: Uuid,
    key: [u8; EXTERNAL_KEY_SIZE],
}

impl StartupKey {
    pub fn new(identifier: Uuid, key: [u8; EXTERNAL_KEY_SIZE]) -> Self {
        StartupKey { identifier, key }
    }

    /// Decode the contents of a .BEK file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (_, entries) = MetadataHeader::parse_with_entries(data).map_err(|err| {
            log::warn!("Startup key file rejected: {}", err);
            KeyError::InvalidStartupKey
        })?;

        for entry in &entries {
            let EntryValue::ExternalKey(external) = &entry.value else {
                continue;
            };
            if entry.entry_type != EntryType::StartupKey {
                continue;
            }
            let key = external.entries.iter().find_map(|child| match &child.value {
                EntryValue::Key(key) if key.data.len() == EXTERNAL_KEY_SIZE => Some(key),
                _ => None,
            });
            if let Some(key) = key {
                let mut bytes = [0u8; EXTERNAL_KEY_SIZE];
                bytes.copy_from_slice(&key.data);
                return Ok(StartupKey { identifier: external.identifier, key: bytes });
            }
        }
        Err(KeyError::InvalidStartupKey.into())
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = Zeroizing::new(fs::read(path)?);
        Self::parse(&data)
    }

    pub fn key(&self) -> &[u8; EXTERNAL_KEY_SIZE] {
        &self.key
    }
}

impl fmt::Debug for StartupKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StartupKey").field("identifier", &self.identifier).finish()
    }
}

/// A secret supplied by the caller to unlock a volume.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum Credential {
    Password(String),
    /// 48 digits in 8 dash separated groups.
    RecoveryPassword(String),
    StartupKey(StartupKey),
    /// The decrypted FVEK and tweak key, bypassing the key protectors.
    Keys { fvek: Vec<u8>, tweak: Vec<u8> },
}

impl Credential {
    pub fn password(password: &str) -> Self {
        Credential::Password(password.to_string())
    }

    pub fn recovery_password(recovery_password: &str) -> Self {
        Credential::RecoveryPassword(recovery_password.to_string())
    }

    /// Raw keys given as hexadecimal strings; the tweak key may be empty for
    /// methods that do not use one.
    pub fn keys_from_hex(fvek: &str, tweak: &str) -> Result<Self> {
        let fvek = hex::decode(fvek.trim()).map_err(|_| FormatError::Invalid("hexadecimal key"))?;
        let tweak =
            hex::decode(tweak.trim()).map_err(|_| FormatError::Invalid("hexadecimal key"))?;
        Ok(Credential::Keys { fvek, tweak })
    }

    /// Whether this credential can open a protector of the given type.
    fn satisfies(&self, vmk: &VolumeMasterKeyValue) -> bool {
        match self {
            Credential::Password(_) => vmk.protection_type == ProtectionType::Password,
            Credential::RecoveryPassword(_) => {
                vmk.protection_type == ProtectionType::RecoveryPassword
            }
            Credential::StartupKey(key) => {
                vmk.protection_type == ProtectionType::StartupKey && vmk.identifier == key.identifier
            }
            Credential::Keys { .. } => false,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Credential::Password(_) => write!(f, "Password(..)"),
            Credential::RecoveryPassword(_) => write!(f, "RecoveryPassword(..)"),
            Credential::StartupKey(key) => write!(f, "StartupKey({})", key.identifier),
            Credential::Keys { .. } => write!(f, "Keys(..)"),
        }
    }
}

/// Sector keys ready to key an `EncryptionContext`.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ResolvedKeyMaterial {
    #[zeroize(skip)]
    pub method: EncryptionMethod,
    pub key: Vec<u8>,
    pub tweak_key: Option<Vec<u8>>,
}

impl ResolvedKeyMaterial {
    /// Split the decrypted FVEK key data the way `method` lays it out.
    ///
    /// Diffuser methods keep the FVEK in the first 32 bytes and the tweak key
    /// in the next 32; XTS concatenates both keys; plain CBC has no tweak key.
    pub fn from_fvek(method: EncryptionMethod, data: &[u8]) -> Result<Self> {
        let size = method
            .key_size()
            .ok_or(FormatError::Invalid("unsupported encryption method"))?;

        let (key, tweak_key) = match method {
            EncryptionMethod::Aes128CbcDiffuser | EncryptionMethod::Aes256CbcDiffuser => {
                if data.len() < 32 + size {
                    return Err(CryptoError::InvalidKeySize.into());
                }
                (&data[..size], Some(&data[32..32 + size]))
            }
            EncryptionMethod::Aes128Xts | EncryptionMethod::Aes256Xts => {
                if data.len() < 2 * size {
                    return Err(CryptoError::InvalidKeySize.into());
                }
                (&data[..size], Some(&data[size..2 * size]))
            }
            _ => {
                if data.len() < size {
                    return Err(CryptoError::InvalidKeySize.into());
                }
                (&data[..size], None)
            }
        };

        Ok(ResolvedKeyMaterial {
            method,
            key: key.to_vec(),
            tweak_key: tweak_key.map(<[u8]>::to_vec),
        })
    }

    /// Material from separately supplied FVEK and tweak keys.
    pub fn from_keys(method: EncryptionMethod, fvek: &[u8], tweak: &[u8]) -> Result<Self> {
        let size = method
            .key_size()
            .ok_or(FormatError::Invalid("unsupported encryption method"))?;
        if fvek.len() < size || (method.uses_tweak_key() && tweak.len() < size) {
            return Err(CryptoError::InvalidKeySize.into());
        }
        Ok(ResolvedKeyMaterial {
            method,
            key: fvek[..size].to_vec(),
            tweak_key: method.uses_tweak_key().then(|| tweak[..size].to_vec()),
        })
    }
}

impl fmt::Debug for ResolvedKeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ResolvedKeyMaterial").field("method", &self.method).finish()
    }
}

/// `SHA-256(SHA-256(UTF-16LE(password)))`.
pub fn password_digest(password: &str) -> Zeroizing<[u8; 32]> {
    let encoded: Zeroizing<Vec<u8>> = Zeroizing::new(
        password
            .encode_utf16()
            .flat_map(|unit| unit.to_le_bytes())
            .collect(),
    );
    let first: Zeroizing<[u8; 32]> = Zeroizing::new(Sha256::digest(encoded.as_slice()).into());
    Zeroizing::new(Sha256::digest(first.as_slice()).into())
}

/// Validate a recovery password and hash its 16-byte binary form.
///
/// Each group must be a multiple of 11 below 720896; the group divided by
/// 11 is one little-endian 16-bit word of the key.
pub fn recovery_password_digest(recovery_password: &str) -> Result<Zeroizing<[u8; 32]>> {
    let groups: Vec<&str> = recovery_password.trim().split('-').collect();
    if groups.len() != RECOVERY_PASSWORD_GROUPS {
        return Err(KeyError::InvalidRecoveryPassword.into());
    }

    let mut binary = Zeroizing::new([0u8; 16]);
    for (index, group) in groups.iter().enumerate() {
        if group.len() != RECOVERY_PASSWORD_GROUP_DIGITS || !group.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(KeyError::InvalidRecoveryPassword.into());
        }
        let value: u32 = group.parse().map_err(|_| KeyError::InvalidRecoveryPassword)?;
        if value % 11 != 0 || value >= RECOVERY_PASSWORD_GROUP_LIMIT {
            return Err(KeyError::InvalidRecoveryPassword.into());
        }
        LittleEndian::write_u16(&mut binary[index * 2..index * 2 + 2], (value / 11) as u16);
    }

    Ok(Zeroizing::new(Sha256::digest(binary.as_slice()).into()))
}

/// Stretch a secret digest with a salt (1,048,576 SHA-256 rounds).
pub fn stretch_key(
    secret_digest: &[u8; 32],
    salt: &[u8; 16],
    abort: &AbortSignal,
) -> Result<Zeroizing<[u8; 32]>> {
    stretch_key_rounds(secret_digest, salt, STRETCH_ROUNDS, abort)
}

// Hashed block: last hash | secret digest | salt | round counter.
fn stretch_key_rounds(
    secret_digest: &[u8; 32],
    salt: &[u8; 16],
    rounds: u64,
    abort: &AbortSignal,
) -> Result<Zeroizing<[u8; 32]>> {
    let mut block = Zeroizing::new([0u8; 88]);
    block[32..64].copy_from_slice(secret_digest);
    block[64..80].copy_from_slice(salt);

    for counter in 0..rounds {
        if counter % ABORT_POLL_INTERVAL == 0 {
            abort.check()?;
        }
        LittleEndian::write_u64(&mut block[80..88], counter);
        let hash = Sha256::digest(block.as_slice());
        block[0..32].copy_from_slice(&hash);
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&block[0..32]);
    Ok(key)
}

/// Decrypt and authenticate an AES-CCM wrapped key.
///
/// Nothing is returned unless the MAC verifies.
pub fn unwrap_aes_ccm(key: &[u8], encrypted: &AesCcmEncryptedKey) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Ccm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;
    let mut data = Zeroizing::new(encrypted.data.clone());
    cipher
        .decrypt_in_place_detached(
            GenericArray::from_slice(&encrypted.nonce),
            &[],
            data.as_mut_slice(),
            GenericArray::from_slice(&encrypted.mac),
        )
        .map_err(|_| CryptoError::WrongKey)?;
    Ok(data)
}

/// Encrypt a key payload with AES-CCM; the inverse of `unwrap_aes_ccm`.
pub fn wrap_aes_ccm(key: &[u8], nonce: [u8; 12], plaintext: &[u8]) -> Result<AesCcmEncryptedKey> {
    let cipher = Aes256Ccm::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize)?;
    let mut data = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(GenericArray::from_slice(&nonce), &[], &mut data)
        .map_err(|_| CryptoError::InvalidKeySize)?;
    let mut mac = [0u8; 16];
    mac.copy_from_slice(&tag);
    Ok(AesCcmEncryptedKey { nonce, mac, data })
}

// The unwrapped payload is a key entry.
fn unwrap_key_entry(key: &[u8], encrypted: &AesCcmEncryptedKey) -> Result<KeyValue> {
    let plaintext = unwrap_aes_ccm(key, encrypted)?;
    let (entry, _) = MetadataEntry::parse(&plaintext)?;
    match entry.value {
        EntryValue::Key(key) => Ok(key),
        _ => Err(FormatError::Invalid("unwrapped key is not a key entry").into()),
    }
}

fn first_child<'a, T>(
    vmk: &'a VolumeMasterKeyValue,
    select: impl Fn(&'a EntryValue) -> Option<&'a T>,
) -> Option<&'a T> {
    vmk.entries.iter().find_map(|entry| select(&entry.value))
}

fn encrypted_vmk(vmk: &VolumeMasterKeyValue) -> Result<&AesCcmEncryptedKey> {
    first_child(vmk, |value| match value {
        EntryValue::AesCcmEncryptedKey(key) => Some(key),
        _ => None,
    })
    .ok_or_else(|| FormatError::Invalid("volume master key without encrypted key").into())
}

// Derive the key that unwraps `vmk` from `credential`.
fn protector_key(
    vmk: &VolumeMasterKeyValue,
    credential: &Credential,
    abort: &AbortSignal,
) -> Result<Zeroizing<[u8; 32]>> {
    let stretch_salt = || {
        first_child(vmk, |value| match value {
            EntryValue::StretchKey(stretch) => Some(&stretch.salt),
            _ => None,
        })
        .ok_or_else(|| Error::from(FormatError::Invalid("protector without stretch key")))
    };

    match credential {
        Credential::Password(password) => {
            let digest = password_digest(password);
            stretch_key(&digest, stretch_salt()?, abort)
        }
        Credential::RecoveryPassword(recovery_password) => {
            let digest = recovery_password_digest(recovery_password)?;
            stretch_key(&digest, stretch_salt()?, abort)
        }
        Credential::StartupKey(startup_key) => Ok(Zeroizing::new(startup_key.key)),
        Credential::Keys { .. } => Err(KeyError::NoMatchingProtector.into()),
    }
}

fn clear_key(vmk: &VolumeMasterKeyValue) -> Result<Zeroizing<Vec<u8>>> {
    first_child(vmk, |value| match value {
        EntryValue::Key(key) => Some(key),
        _ => None,
    })
    .map(|key| key.data.clone())
    .ok_or_else(|| FormatError::Invalid("clear key protector without key").into())
}

// Unwrap the VMK with `unwrap_key`, then the FVEK with the VMK.
fn unlock_with(
    metadata: &Metadata,
    vmk: &VolumeMasterKeyValue,
    unwrap_key: &[u8],
) -> Result<ResolvedKeyMaterial> {
    let vmk_key = unwrap_key_entry(unwrap_key, encrypted_vmk(vmk)?)?;
    let fvek = metadata
        .full_volume_encryption_key
        .as_ref()
        .ok_or(FormatError::Invalid("missing full volume encryption key"))?;
    let fvek_key = unwrap_key_entry(&vmk_key.data, fvek)?;

    // Older volumes leave the method in the metadata header unset.
    let method = match metadata.encryption_method {
        EncryptionMethod::Unknown(_) => EncryptionMethod::from(fvek_key.method as u16),
        method => method,
    };
    ResolvedKeyMaterial::from_fvek(method, &fvek_key.data)
}

/// Resolve the sector keys of a volume.
///
/// Clear key protectors are tried first, then every credential in order
/// against each protector it can satisfy. The first protector that fully
/// unwraps wins.
pub fn resolve_keys(
    metadata: &Metadata,
    credentials: &[Credential],
    abort: &AbortSignal,
) -> Result<ResolvedKeyMaterial> {
    let mut attempted = false;

    for vmk in &metadata.volume_master_keys {
        if vmk.protection_type != ProtectionType::ClearKey {
            continue;
        }
        attempted = true;
        match clear_key(vmk).and_then(|key| unlock_with(metadata, vmk, &key)) {
            Ok(material) => {
                log::info!("Volume unlocked by clear key protector {}", vmk.identifier);
                return Ok(material);
            }
            Err(err) => log::warn!("Clear key protector {} failed: {}", vmk.identifier, err),
        }
    }

    for credential in credentials {
        if let Credential::Keys { fvek, tweak } = credential {
            attempted = true;
            match ResolvedKeyMaterial::from_keys(metadata.encryption_method, fvek, tweak) {
                Ok(material) => {
                    log::info!("Using supplied volume keys");
                    return Ok(material);
                }
                Err(err) => {
                    log::warn!("Supplied volume keys rejected: {}", err);
                    continue;
                }
            }
        }

        for vmk in metadata.volume_master_keys.iter().filter(|vmk| credential.satisfies(vmk)) {
            attempted = true;
            let result = protector_key(vmk, credential, abort)
                .and_then(|key| unlock_with(metadata, vmk, key.as_slice()));
            match result {
                Ok(material) => {
                    log::info!(
                        "Volume unlocked by {} protector {}",
                        vmk.protection_type,
                        vmk.identifier
                    );
                    return Ok(material);
                }
                Err(Error::Aborted) => return Err(Error::Aborted),
                Err(err @ Error::Key(KeyError::InvalidRecoveryPassword)) => return Err(err),
                Err(err) => log::warn!(
                    "{} protector {} failed: {}",
                    vmk.protection_type,
                    vmk.identifier,
                    err
                ),
            }
        }
    }

    if attempted {
        Err(KeyError::WrongKeyOrNoMatch.into())
    } else {
        Err(KeyError::NoMatchingProtector.into())
    }
}
