// Synthetic BitLocker images for the integration tests.
//
// The builder lays out a small volume the way Windows does: BitLocker boot
// sector, three metadata copies, the relocated (encrypted) volume header
// for version 2, and encrypted data sectors. It also produces the plaintext
// image a reader is expected to return.
#![allow(dead_code)]

use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use bdecrypt::keys::{password_digest, recovery_password_digest, stretch_key, wrap_aes_ccm};
use bdecrypt::{AbortSignal, EncryptionContext, EncryptionMethod, ResolvedKeyMaterial};

pub const PASSWORD: &str = "Secret123!";
pub const RECOVERY_PASSWORD: &str = "236808-089419-192665-495704-618299-073414-538373-542366";
pub const DESCRIPTION: &str = "TESTPC C: 2024-01-01";
pub const CREATION_TIME: u64 = 133_485_408_000_000_000;
pub const MFT_MIRROR_CLUSTER: u64 = 0x1234;
pub const FIRST_COPY_DESCRIPTION: &str = "OTHERPC D: 2023-06-30";

const METADATA_OFFSETS: [u64; 3] = [0x2000, 0x6000, 0xa000];
const METADATA_BLOCK_SIZE: usize = 0x1000;
const VOLUME_HEADER_OFFSET: u64 = 0xe000;
const VOLUME_HEADER_SECTORS: u64 = 16;
const VOLUME_SIZE: u64 = 0x20000;
pub const BYTES_PER_SECTOR: u64 = 512;

const VMK: [u8; 32] = [0x56; 32];

#[derive(Clone)]
pub enum Protector {
    Password(String),
    RecoveryPassword(String),
    ClearKey,
    StartupKey(Uuid, [u8; 32]),
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Vista,
    Seven,
}

pub struct ImageBuilder {
    layout: Layout,
    method: EncryptionMethod,
    protectors: Vec<Protector>,
    encrypted_volume_size: u64,
    corrupt_copies: Vec<usize>,
    divergent_first_copy: bool,
}

pub struct TestImage {
    pub image: Vec<u8>,
    // What the decrypted volume must read as.
    pub plaintext: Vec<u8>,
    pub volume_identifier: Uuid,
    // Identifier written into metadata copy 1 only, see `divergent_first_copy`.
    pub first_copy_volume_identifier: Uuid,
    pub vmk_identifiers: Vec<Uuid>,
    pub fvek_data: Vec<u8>,
    pub metadata_offsets: [u64; 3],
    pub volume_header_offset: u64,
}

impl ImageBuilder {
    pub fn new(method: EncryptionMethod) -> Self {
        ImageBuilder {
            layout: Layout::Seven,
            method,
            protectors: Vec::new(),
            encrypted_volume_size: VOLUME_SIZE,
            corrupt_copies: Vec::new(),
            divergent_first_copy: false,
        }
    }

    pub fn vista(mut self) -> Self {
        self.layout = Layout::Vista;
        self
    }

    pub fn protector(mut self, protector: Protector) -> Self {
        self.protectors.push(protector);
        self
    }

    // Leave everything from `size` on stored in the clear.
    pub fn encrypted_volume_size(mut self, size: u64) -> Self {
        self.encrypted_volume_size = size;
        self
    }

    // Overwrite the signature of metadata copy `index` (0-based).
    pub fn corrupt_copy(mut self, index: usize) -> Self {
        self.corrupt_copies.push(index);
        self
    }

    // Give metadata copy 1 its own volume identifier and description; copies
    // 2 and 3 keep the regular ones.
    pub fn divergent_first_copy(mut self) -> Self {
        self.divergent_first_copy = true;
        self
    }

    pub fn build(&self) -> TestImage {
        let bps = BYTES_PER_SECTOR;
        let volume_identifier = Uuid::from_u128(0x0a1b2c3d_4e5f_6071_8293_a4b5c6d7e8f9);
        let first_copy_volume_identifier = Uuid::from_u128(0xfeed_0000_0000_0000_0000_0000_0000_0001);
        let fvek_data = fvek_data(self.method);
        let material = ResolvedKeyMaterial::from_fvek(self.method, &fvek_data)
            .expect("valid key material");
        let context = EncryptionContext::new(&material).expect("keyed context");

        // 1. The plaintext file system image: every sector gets a distinct
        //    pattern, the first one looks like an NTFS boot sector.
        let mut original = vec![0u8; VOLUME_SIZE as usize];
        for (index, sector) in original.chunks_mut(bps as usize).enumerate() {
            for (offset, byte) in sector.iter_mut().enumerate() {
                *byte = (index as u8).wrapping_mul(31) ^ (offset as u8).wrapping_add(7);
            }
        }
        original[0..3].copy_from_slice(&[0xeb, 0x52, 0x90]);
        original[3..11].copy_from_slice(b"NTFS    ");

        // 2. Metadata entries shared by all three copies.
        let mut vmk_identifiers = Vec::new();
        let mut entries = Vec::new();
        for (index, protector) in self.protectors.iter().enumerate() {
            let identifier = match protector {
                Protector::StartupKey(identifier, _) => *identifier,
                _ => Uuid::from_u128(0x1000 + index as u128),
            };
            vmk_identifiers.push(identifier);
            write_entry(&mut entries, 0x0002, 0x0008, 1, &vmk_payload(identifier, protector, index));
        }
        let fvek_plain = key_entry(self.method.as_u16() as u32, &fvek_data);
        let fvek = wrap_aes_ccm(&VMK, nonce(0xff), &fvek_plain).expect("wrap fvek");
        write_entry(&mut entries, 0x0003, 0x0005, 1, &ccm_payload(&fvek));

        // 3. The on-disk image.
        let mut image = original.clone();
        let mut plaintext = original.clone();

        let volume_header_size = match self.layout {
            Layout::Seven => VOLUME_HEADER_SECTORS * bps,
            Layout::Vista => bps,
        };

        // Encrypt data sectors.
        for (index, sector) in image.chunks_mut(bps as usize).enumerate() {
            if (index as u64) * bps < self.encrypted_volume_size {
                context
                    .encrypt_sector(index as u64, sector)
                    .expect("encrypt sector");
            }
        }

        // BitLocker boot sector.
        let boot = boot_sector(self.layout, bps, volume_identifier);
        image[..512].copy_from_slice(&boot);
        if self.layout == Layout::Seven {
            for byte in &mut image[512..volume_header_size as usize] {
                *byte = 0xee;
            }

            // The original boot sectors move to the volume header offset.
            let start = VOLUME_HEADER_OFFSET as usize;
            let mut relocated = original[..volume_header_size as usize].to_vec();
            for (index, sector) in relocated.chunks_mut(bps as usize).enumerate() {
                context
                    .encrypt_sector(VOLUME_HEADER_OFFSET / bps + index as u64, sector)
                    .expect("encrypt volume header");
            }
            image[start..start + relocated.len()].copy_from_slice(&relocated);
            plaintext[start..start + relocated.len()].fill(0);
        } else {
            // Vista keeps the BitLocker boot sector in place; the reader
            // restores the NTFS fields.
            plaintext[..512].copy_from_slice(&boot);
            plaintext[3..11].copy_from_slice(b"NTFS    ");
            LittleEndian::write_u64(&mut plaintext[0x38..0x40], MFT_MIRROR_CLUSTER);
        }

        for (index, &offset) in METADATA_OFFSETS.iter().enumerate() {
            let (identifier, description) = if index == 0 && self.divergent_first_copy {
                (first_copy_volume_identifier, FIRST_COPY_DESCRIPTION)
            } else {
                (volume_identifier, DESCRIPTION)
            };
            let mut copy_entries = Vec::new();
            write_entry(&mut copy_entries, 0x0007, 0x0002, 1, &utf16(description));
            copy_entries.extend_from_slice(&entries);

            let mut block = metadata_block(
                self.layout,
                &copy_entries,
                identifier,
                self.method,
                self.encrypted_volume_size,
            );
            if self.corrupt_copies.contains(&index) {
                block[0..8].copy_from_slice(b"CORRUPT!");
            }
            let start = offset as usize;
            image[start..start + block.len()].copy_from_slice(&block);
            plaintext[start..start + block.len()].fill(0);
        }

        TestImage {
            image,
            plaintext,
            volume_identifier,
            first_copy_volume_identifier,
            vmk_identifiers,
            fvek_data,
            metadata_offsets: METADATA_OFFSETS,
            volume_header_offset: VOLUME_HEADER_OFFSET,
        }
    }
}

pub fn fvek_data(method: EncryptionMethod) -> Vec<u8> {
    let size = match method {
        EncryptionMethod::Aes128Cbc => 16,
        EncryptionMethod::Aes256Cbc | EncryptionMethod::Aes128Xts => 32,
        _ => 64,
    };
    (0..size as u8).map(|b| b.wrapping_mul(13).wrapping_add(1)).collect()
}

fn nonce(counter: u8) -> [u8; 12] {
    let mut nonce = [0x10u8; 12];
    nonce[11] = counter;
    nonce
}

fn utf16(text: &str) -> Vec<u8> {
    text.encode_utf16()
        .chain(std::iter::once(0))
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

pub fn write_entry(out: &mut Vec<u8>, entry_type: u16, value_type: u16, version: u16, payload: &[u8]) {
    let mut header = [0u8; 8];
    LittleEndian::write_u16(&mut header[0..2], (8 + payload.len()) as u16);
    LittleEndian::write_u16(&mut header[2..4], entry_type);
    LittleEndian::write_u16(&mut header[4..6], value_type);
    LittleEndian::write_u16(&mut header[6..8], version);
    out.extend_from_slice(&header);
    out.extend_from_slice(payload);
}

fn key_entry(method: u32, key: &[u8]) -> Vec<u8> {
    let mut payload = method.to_le_bytes().to_vec();
    payload.extend_from_slice(key);
    let mut entry = Vec::new();
    write_entry(&mut entry, 0x0000, 0x0001, 1, &payload);
    entry
}

fn ccm_payload(key: &bdecrypt::entry::AesCcmEncryptedKey) -> Vec<u8> {
    let mut payload = key.nonce.to_vec();
    payload.extend_from_slice(&key.mac);
    payload.extend_from_slice(&key.data);
    payload
}

fn vmk_payload(identifier: Uuid, protector: &Protector, index: usize) -> Vec<u8> {
    let salt = [0x40 + index as u8; 16];
    let abort = AbortSignal::new();
    let vmk_plain = key_entry(0x2000, &VMK);

    let (protection_type, mut children) = match protector {
        Protector::Password(password) => {
            let key = stretch_key(&password_digest(password), &salt, &abort).expect("stretch");
            (0x2000u16, stretched_children(&salt, &key, &vmk_plain, index))
        }
        Protector::RecoveryPassword(recovery_password) => {
            let digest = recovery_password_digest(recovery_password).expect("recovery password");
            let key = stretch_key(&digest, &salt, &abort).expect("stretch");
            (0x0800u16, stretched_children(&salt, &key, &vmk_plain, index))
        }
        Protector::ClearKey => {
            let clear_key = [0x77u8; 32];
            let mut children = key_entry(0x2000, &clear_key);
            let wrapped = wrap_aes_ccm(&clear_key, nonce(index as u8), &vmk_plain).expect("wrap");
            write_entry(&mut children, 0x0000, 0x0005, 1, &ccm_payload(&wrapped));
            (0x0000u16, children)
        }
        Protector::StartupKey(_, external_key) => {
            let mut children = Vec::new();
            let wrapped =
                wrap_aes_ccm(external_key, nonce(index as u8), &vmk_plain).expect("wrap");
            write_entry(&mut children, 0x0000, 0x0005, 1, &ccm_payload(&wrapped));
            (0x0200u16, children)
        }
    };

    let mut payload = identifier.to_bytes_le().to_vec();
    payload.extend_from_slice(&CREATION_TIME.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&protection_type.to_le_bytes());
    payload.append(&mut children);
    payload
}

// Stretch key entry followed by the VMK wrapped with the stretched key.
fn stretched_children(salt: &[u8; 16], key: &[u8; 32], vmk_plain: &[u8], index: usize) -> Vec<u8> {
    let mut children = Vec::new();
    let mut stretch = 0x1000u32.to_le_bytes().to_vec();
    stretch.extend_from_slice(salt);
    write_entry(&mut children, 0x0000, 0x0003, 1, &stretch);

    let wrapped = wrap_aes_ccm(key, nonce(index as u8), vmk_plain).expect("wrap vmk");
    write_entry(&mut children, 0x0000, 0x0005, 1, &ccm_payload(&wrapped));
    children
}

fn boot_sector(layout: Layout, bps: u64, volume_identifier: Uuid) -> [u8; 512] {
    let mut data = [0u8; 512];
    match layout {
        Layout::Vista => data[0..3].copy_from_slice(&[0xeb, 0x52, 0x90]),
        Layout::Seven => data[0..3].copy_from_slice(&[0xeb, 0x58, 0x90]),
    }
    data[3..11].copy_from_slice(b"-FVE-FS-");
    LittleEndian::write_u16(&mut data[0x0b..0x0d], bps as u16);
    data[0x0d] = 8;
    LittleEndian::write_u64(&mut data[0x28..0x30], VOLUME_SIZE / bps);

    match layout {
        Layout::Vista => {
            let cluster_size = bps * 8;
            LittleEndian::write_u64(&mut data[0x38..0x40], METADATA_OFFSETS[0] / cluster_size);
        }
        Layout::Seven => {
            data[0xa0..0xb0].copy_from_slice(&volume_identifier.to_bytes_le());
            for (index, offset) in METADATA_OFFSETS.iter().enumerate() {
                let start = 0xb0 + index * 8;
                LittleEndian::write_u64(&mut data[start..start + 8], *offset);
            }
        }
    }
    data[510] = 0x55;
    data[511] = 0xaa;
    data
}

fn metadata_block(
    layout: Layout,
    entries: &[u8],
    volume_identifier: Uuid,
    method: EncryptionMethod,
    encrypted_volume_size: u64,
) -> Vec<u8> {
    let mut block = vec![0u8; METADATA_BLOCK_SIZE];
    block[0..8].copy_from_slice(b"-FVE-FS-");
    let (version, size) = match layout {
        Layout::Vista => (1u16, METADATA_BLOCK_SIZE as u16),
        Layout::Seven => (2u16, (METADATA_BLOCK_SIZE / 16) as u16),
    };
    LittleEndian::write_u16(&mut block[8..10], size);
    LittleEndian::write_u16(&mut block[10..12], version);
    LittleEndian::write_u16(&mut block[12..14], 4);
    LittleEndian::write_u16(&mut block[14..16], 4);
    LittleEndian::write_u64(&mut block[16..24], encrypted_volume_size);
    LittleEndian::write_u32(&mut block[28..32], VOLUME_HEADER_SECTORS as u32);
    for (index, offset) in METADATA_OFFSETS.iter().enumerate() {
        let start = 32 + index * 8;
        LittleEndian::write_u64(&mut block[start..start + 8], *offset);
    }
    let version_specific = match layout {
        Layout::Vista => MFT_MIRROR_CLUSTER,
        Layout::Seven => VOLUME_HEADER_OFFSET,
    };
    LittleEndian::write_u64(&mut block[56..64], version_specific);

    let header = &mut block[64..112];
    LittleEndian::write_u32(&mut header[0..4], (48 + entries.len()) as u32);
    LittleEndian::write_u32(&mut header[4..8], 1);
    LittleEndian::write_u32(&mut header[8..12], 48);
    LittleEndian::write_u32(&mut header[12..16], (48 + entries.len()) as u32);
    header[16..32].copy_from_slice(&volume_identifier.to_bytes_le());
    LittleEndian::write_u32(&mut header[32..36], 16);
    LittleEndian::write_u16(&mut header[36..38], method.as_u16());
    LittleEndian::write_u64(&mut header[40..48], CREATION_TIME);

    block[112..112 + entries.len()].copy_from_slice(entries);
    block
}

// Contents of a .BEK file for `identifier`.
pub fn startup_key_file(identifier: Uuid, key: &[u8; 32]) -> Vec<u8> {
    let mut external = identifier.to_bytes_le().to_vec();
    external.extend_from_slice(&CREATION_TIME.to_le_bytes());
    external.extend(key_entry(0x2002, key));

    let mut entries = Vec::new();
    write_entry(&mut entries, 0x0006, 0x0009, 1, &external);

    let mut data = vec![0u8; 48];
    LittleEndian::write_u32(&mut data[0..4], (48 + entries.len()) as u32);
    LittleEndian::write_u32(&mut data[4..8], 1);
    LittleEndian::write_u32(&mut data[8..12], 48);
    LittleEndian::write_u32(&mut data[12..16], (48 + entries.len()) as u32);
    data[16..32].copy_from_slice(&identifier.to_bytes_le());
    LittleEndian::write_u64(&mut data[40..48], CREATION_TIME);
    data.extend(entries);
    data
}
