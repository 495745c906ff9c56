use std::fmt;

use aes::{Aes128, Aes256};
use cipher::consts::U16;
use cipher::generic_array::GenericArray;
use cipher::{
    BlockCipher, BlockDecrypt, BlockDecryptMut, BlockEncrypt, BlockEncryptMut, BlockSizeUser,
    InnerIvInit, KeyInit,
};
use xts_mode::{get_tweak_default, Xts128};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::diffuser::{diffuser_a_decrypt, diffuser_a_encrypt, diffuser_b_decrypt, diffuser_b_encrypt};
use crate::error::{CryptoError, FormatError, KeyError, Result};
use crate::keys::ResolvedKeyMaterial;

const AES_BLOCK_SIZE: usize = 16;

/// Sector encryption method recorded in the metadata header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EncryptionMethod {
    Aes128CbcDiffuser,
    Aes256CbcDiffuser,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Xts,
    Aes256Xts,
    Unknown(u16),
}

impl EncryptionMethod {
    pub fn as_u16(&self) -> u16 {
        match self {
            EncryptionMethod::Aes128CbcDiffuser => 0x8000,
            EncryptionMethod::Aes256CbcDiffuser => 0x8001,
            EncryptionMethod::Aes128Cbc => 0x8002,
            EncryptionMethod::Aes256Cbc => 0x8003,
            EncryptionMethod::Aes128Xts => 0x8004,
            EncryptionMethod::Aes256Xts => 0x8005,
            EncryptionMethod::Unknown(value) => *value,
        }
    }

    /// AES key size in bytes, `None` for unsupported methods.
    pub fn key_size(&self) -> Option<usize> {
        match self {
            EncryptionMethod::Aes128CbcDiffuser
            | EncryptionMethod::Aes128Cbc
            | EncryptionMethod::Aes128Xts => Some(16),
            EncryptionMethod::Aes256CbcDiffuser
            | EncryptionMethod::Aes256Cbc
            | EncryptionMethod::Aes256Xts => Some(32),
            EncryptionMethod::Unknown(_) => None,
        }
    }

    /// Whether the method needs a second (tweak) key.
    pub fn uses_tweak_key(&self) -> bool {
        matches!(
            self,
            EncryptionMethod::Aes128CbcDiffuser
                | EncryptionMethod::Aes256CbcDiffuser
                | EncryptionMethod::Aes128Xts
                | EncryptionMethod::Aes256Xts
        )
    }

    pub fn is_xts(&self) -> bool {
        matches!(self, EncryptionMethod::Aes128Xts | EncryptionMethod::Aes256Xts)
    }
}

impl From<u16> for EncryptionMethod {
    fn from(value: u16) -> Self {
        match value {
            0x8000 => EncryptionMethod::Aes128CbcDiffuser,
            0x8001 => EncryptionMethod::Aes256CbcDiffuser,
            0x8002 => EncryptionMethod::Aes128Cbc,
            0x8003 => EncryptionMethod::Aes256Cbc,
            0x8004 => EncryptionMethod::Aes128Xts,
            0x8005 => EncryptionMethod::Aes256Xts,
            other => EncryptionMethod::Unknown(other),
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptionMethod::Aes128CbcDiffuser => write!(f, "AES-CBC 128-bit with diffuser"),
            EncryptionMethod::Aes256CbcDiffuser => write!(f, "AES-CBC 256-bit with diffuser"),
            EncryptionMethod::Aes128Cbc => write!(f, "AES-CBC 128-bit"),
            EncryptionMethod::Aes256Cbc => write!(f, "AES-CBC 256-bit"),
            EncryptionMethod::Aes128Xts => write!(f, "AES-XTS 128-bit"),
            EncryptionMethod::Aes256Xts => write!(f, "AES-XTS 256-bit"),
            EncryptionMethod::Unknown(value) => write!(f, "Unknown (0x{:04x})", value),
        }
    }
}

// Key schedules zeroize themselves through the aes "zeroize" feature.
#[derive(Zeroize, ZeroizeOnDrop)]
enum SectorCipher {
    Aes128Cbc {
        #[zeroize(skip)]
        key: Aes128,
        #[zeroize(skip)]
        tweak: Option<Aes128>,
    },
    Aes256Cbc {
        #[zeroize(skip)]
        key: Aes256,
        #[zeroize(skip)]
        tweak: Option<Aes256>,
    },
    Aes128Xts(#[zeroize(skip)] Xts128<Aes128>),
    Aes256Xts(#[zeroize(skip)] Xts128<Aes256>),
}

impl SectorCipher {
    fn new(material: &ResolvedKeyMaterial) -> Result<Self> {
        let method = material.method;
        let tweak_key = material.tweak_key.as_deref();
        if method.uses_tweak_key() && tweak_key.is_none() {
            return Err(CryptoError::InvalidKeySize.into());
        }

        let cipher = match method {
            EncryptionMethod::Aes128Cbc | EncryptionMethod::Aes128CbcDiffuser => {
                SectorCipher::Aes128Cbc {
                    key: new_block_cipher(&material.key)?,
                    tweak: tweak_key.map(new_block_cipher).transpose()?,
                }
            }
            EncryptionMethod::Aes256Cbc | EncryptionMethod::Aes256CbcDiffuser => {
                SectorCipher::Aes256Cbc {
                    key: new_block_cipher(&material.key)?,
                    tweak: tweak_key.map(new_block_cipher).transpose()?,
                }
            }
            EncryptionMethod::Aes128Xts => SectorCipher::Aes128Xts(Xts128::new(
                new_block_cipher(&material.key)?,
                new_block_cipher(tweak_key.unwrap_or_default())?,
            )),
            EncryptionMethod::Aes256Xts => SectorCipher::Aes256Xts(Xts128::new(
                new_block_cipher(&material.key)?,
                new_block_cipher(tweak_key.unwrap_or_default())?,
            )),
            EncryptionMethod::Unknown(_) => {
                return Err(FormatError::Invalid("unsupported encryption method").into())
            }
        };
        Ok(cipher)
    }

    fn decrypt(&self, sector_number: u64, byte_offset: u64, data: &mut [u8]) {
        match self {
            SectorCipher::Aes128Cbc { key, tweak } => {
                decrypt_cbc(key, tweak.as_ref(), byte_offset, data)
            }
            SectorCipher::Aes256Cbc { key, tweak } => {
                decrypt_cbc(key, tweak.as_ref(), byte_offset, data)
            }
            SectorCipher::Aes128Xts(xts) => {
                xts.decrypt_sector(data, get_tweak_default(sector_number as u128))
            }
            SectorCipher::Aes256Xts(xts) => {
                xts.decrypt_sector(data, get_tweak_default(sector_number as u128))
            }
        }
    }

    fn encrypt(&self, sector_number: u64, byte_offset: u64, data: &mut [u8]) {
        match self {
            SectorCipher::Aes128Cbc { key, tweak } => {
                encrypt_cbc(key, tweak.as_ref(), byte_offset, data)
            }
            SectorCipher::Aes256Cbc { key, tweak } => {
                encrypt_cbc(key, tweak.as_ref(), byte_offset, data)
            }
            SectorCipher::Aes128Xts(xts) => {
                xts.encrypt_sector(data, get_tweak_default(sector_number as u128))
            }
            SectorCipher::Aes256Xts(xts) => {
                xts.encrypt_sector(data, get_tweak_default(sector_number as u128))
            }
        }
    }
}

fn new_block_cipher<C: KeyInit>(key: &[u8]) -> Result<C> {
    C::new_from_slice(key).map_err(|_| CryptoError::InvalidKeySize.into())
}

// Little-endian byte offset of the sector, zero padded to one block.
fn offset_block(byte_offset: u64) -> GenericArray<u8, U16> {
    let mut block = GenericArray::default();
    block[..8].copy_from_slice(&byte_offset.to_le_bytes());
    block
}

fn sector_iv<C>(key: &C, byte_offset: u64) -> GenericArray<u8, U16>
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut iv = offset_block(byte_offset);
    key.encrypt_block(&mut iv);
    iv
}

// The 32-byte sector key XORed over the plaintext by the diffuser methods.
fn apply_sector_key<C>(tweak: &C, byte_offset: u64, data: &mut [u8])
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut first = offset_block(byte_offset);
    let mut second = first;
    second[15] = 0x80;
    tweak.encrypt_block(&mut first);
    tweak.encrypt_block(&mut second);

    let mut sector_key = [0u8; 2 * AES_BLOCK_SIZE];
    sector_key[..AES_BLOCK_SIZE].copy_from_slice(&first);
    sector_key[AES_BLOCK_SIZE..].copy_from_slice(&second);

    for (byte, key) in data.iter_mut().zip(sector_key.iter().cycle()) {
        *byte ^= key;
    }
    sector_key.zeroize();
}

fn decrypt_cbc<C>(key: &C, tweak: Option<&C>, byte_offset: u64, data: &mut [u8])
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16> + Clone,
{
    let iv = sector_iv(key, byte_offset);
    let mut decryptor = cbc::Decryptor::<C>::inner_iv_init(key.clone(), &iv);
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        decryptor.decrypt_block_mut(GenericArray::from_mut_slice(block));
    }

    if let Some(tweak) = tweak {
        diffuser_b_decrypt(data);
        diffuser_a_decrypt(data);
        apply_sector_key(tweak, byte_offset, data);
    }
}

fn encrypt_cbc<C>(key: &C, tweak: Option<&C>, byte_offset: u64, data: &mut [u8])
where
    C: BlockCipher + BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16> + Clone,
{
    if let Some(tweak) = tweak {
        apply_sector_key(tweak, byte_offset, data);
        diffuser_a_encrypt(data);
        diffuser_b_encrypt(data);
    }

    let iv = sector_iv(key, byte_offset);
    let mut encryptor = cbc::Encryptor::<C>::inner_iv_init(key.clone(), &iv);
    for block in data.chunks_exact_mut(AES_BLOCK_SIZE) {
        encryptor.encrypt_block_mut(GenericArray::from_mut_slice(block));
    }
}

/// Sector cipher state of a volume: unkeyed until key resolution
/// succeeds, keyed for the rest of the session.
#[derive(Default)]
pub enum EncryptionContext {
    #[default]
    Unkeyed,
    Keyed {
        method: EncryptionMethod,
        cipher: SectorCipherHandle,
    },
}

/// Opaque keyed sector cipher.
pub struct SectorCipherHandle(SectorCipher);

impl EncryptionContext {
    /// Build a keyed context. The material is fully validated first, so a
    /// failure leaves nothing half keyed.
    pub fn new(material: &ResolvedKeyMaterial) -> Result<Self> {
        let cipher = SectorCipher::new(material)?;
        Ok(EncryptionContext::Keyed {
            method: material.method,
            cipher: SectorCipherHandle(cipher),
        })
    }

    pub fn is_keyed(&self) -> bool {
        matches!(self, EncryptionContext::Keyed { .. })
    }

    pub fn method(&self) -> Option<EncryptionMethod> {
        match self {
            EncryptionContext::Unkeyed => None,
            EncryptionContext::Keyed { method, .. } => Some(*method),
        }
    }

    /// Decrypt one sector in place.
    ///
    /// `data` must be exactly one sector; its length is the sector size
    /// used to derive the byte offset for the CBC IV.
    pub fn decrypt_sector(&self, sector_number: u64, data: &mut [u8]) -> Result<()> {
        let (cipher, byte_offset) = self.prepare(sector_number, data)?;
        cipher.decrypt(sector_number, byte_offset, data);
        Ok(())
    }

    /// Encrypt one sector in place; the inverse of `decrypt_sector`.
    pub fn encrypt_sector(&self, sector_number: u64, data: &mut [u8]) -> Result<()> {
        let (cipher, byte_offset) = self.prepare(sector_number, data)?;
        cipher.encrypt(sector_number, byte_offset, data);
        Ok(())
    }

    fn prepare(&self, sector_number: u64, data: &[u8]) -> Result<(&SectorCipher, u64)> {
        let cipher = match self {
            EncryptionContext::Unkeyed => return Err(KeyError::KeysNotSet.into()),
            EncryptionContext::Keyed { cipher, .. } => &cipher.0,
        };
        if data.is_empty() || data.len() % AES_BLOCK_SIZE != 0 {
            return Err(FormatError::Invalid("sector size").into());
        }
        let byte_offset = sector_number
            .checked_mul(data.len() as u64)
            .ok_or(FormatError::SizeOutOfBounds)?;
        Ok((cipher, byte_offset))
    }
}

impl fmt::Debug for EncryptionContext {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EncryptionContext::Unkeyed => write!(f, "EncryptionContext::Unkeyed"),
            EncryptionContext::Keyed { method, .. } => {
                write!(f, "EncryptionContext::Keyed({})", method)
            }
        }
    }
}
