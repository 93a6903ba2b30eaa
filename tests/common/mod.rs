//! Synthetic BitLocker volume images for the integration tests.
//!
//! The builder lays out a 256 KiB volume with three metadata copies,
//! password / recovery-password / clear-key protectors all wrapping the
//! same volume master key, a relocated first-sector region, and every data
//! sector encrypted under the chosen method.

use aes::Aes256;
use byteorder::{ByteOrder, LittleEndian};
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;

use fvelock::keys::{intermediate_key, UnlockedKeys};
use fvelock::{Credential, EncryptionMethod, SectorCipher};

pub const SECTOR: usize = 512;
pub const TOTAL_SECTORS: u64 = 512;
pub const IMAGE_LEN: usize = SECTOR * TOTAL_SECTORS as usize;

pub const META_OFFSETS: [u64; 3] = [0x10000, 0x18000, 0x20000];
pub const RELOC_OFFSET: u64 = 0x28000;
pub const RELOC_SECTORS: u64 = 16;

pub const PASSWORD: &str = "hunter2";
pub const RECOVERY: &str = "480095-135795-720885-000000-000011-363000-597531-022286";
pub const DESCRIPTION: &str = "TESTVOL";

pub const VOLUME_GUID_RAW: [u8; 16] = [
    0xa0, 0xa1, 0xa2, 0xa3, 0xb0, 0xb1, 0xc0, 0xc1, 0xd0, 0xd1, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4,
    0xe5,
];

const FILETIME: u64 = 0x01d9_8000_0000_0000;
const PASSWORD_SALT: [u8; 16] = [0x31; 16];
const RECOVERY_SALT: [u8; 16] = [0x52; 16];
const CLEAR_KEY: [u8; 32] = [0x77; 32];

fn vmk_bytes() -> [u8; 32] {
    let mut vmk = [0u8; 32];
    for (i, byte) in vmk.iter_mut().enumerate() {
        *byte = (i as u8).wrapping_mul(3).wrapping_add(1);
    }
    vmk
}

fn fvek_bytes(method: EncryptionMethod) -> (Vec<u8>, Vec<u8>) {
    let fvek: Vec<u8> = (0..method.key_len()).map(|i| (i as u8) ^ 0x9c).collect();
    let tweak: Vec<u8> = (0..method.key_len()).map(|i| (i as u8) ^ 0x4d).collect();
    (fvek, tweak)
}

/// Deterministic plaintext for each logical sector.
pub fn pattern_sector(index: u64) -> Vec<u8> {
    (0..SECTOR)
        .map(|j| (index as u8).wrapping_mul(7).wrapping_add((j as u8).wrapping_mul(13)))
        .collect()
}

fn entry(entry_type: u16, value_type: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.extend_from_slice(&((8 + payload.len()) as u16).to_le_bytes());
    out.extend_from_slice(&entry_type.to_le_bytes());
    out.extend_from_slice(&value_type.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// key datum: entry-shaped header, u32 method, raw key bytes.
fn key_datum(method_raw: u32, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + key.len());
    out.extend_from_slice(&((12 + key.len()) as u16).to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes());
    out.extend_from_slice(&method_raw.to_le_bytes());
    out.extend_from_slice(key);
    out
}

/// AES-CCM wrap, laid out as stored on disk: nonce, tag, ciphertext.
fn ccm_wrap(key: &[u8; 32], nonce: &[u8; 12], plaintext: &[u8]) -> Vec<u8> {
    let cipher = Ccm::<Aes256, U16, U12>::new(GenericArray::from_slice(key));
    let sealed = cipher
        .encrypt(GenericArray::from_slice(nonce), plaintext)
        .expect("CCM encrypt");
    let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);
    let mut out = Vec::with_capacity(12 + 16 + ciphertext.len());
    out.extend_from_slice(nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(ciphertext);
    out
}

/// VMK entry for a salted protector (password or recovery password).
fn salted_vmk_entry(
    kind: u16,
    protector_guid: [u8; 16],
    salt: &[u8; 16],
    wrapping_key: &[u8; 32],
    nonce: &[u8; 12],
) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&protector_guid);
    payload.extend_from_slice(&FILETIME.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&kind.to_le_bytes());

    let mut stretch = Vec::with_capacity(20);
    stretch.extend_from_slice(&0x1000u32.to_le_bytes());
    stretch.extend_from_slice(salt);
    payload.extend(entry(0x0000, 0x0003, &stretch));

    let wrapped = ccm_wrap(wrapping_key, nonce, &key_datum(0x2005, &vmk_bytes()));
    payload.extend(entry(0x0000, 0x0005, &wrapped));

    entry(0x0002, 0x0008, &payload)
}

/// VMK entry for a clear-key protector: the wrapping key is stored beside
/// the wrapped VMK.
fn clear_key_vmk_entry(protector_guid: [u8; 16], nonce: &[u8; 12]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&protector_guid);
    payload.extend_from_slice(&FILETIME.to_le_bytes());
    payload.extend_from_slice(&0u16.to_le_bytes());
    payload.extend_from_slice(&0x0000u16.to_le_bytes());

    let mut stored = Vec::with_capacity(4 + CLEAR_KEY.len());
    stored.extend_from_slice(&0x2005u32.to_le_bytes());
    stored.extend_from_slice(&CLEAR_KEY);
    payload.extend(entry(0x0000, 0x0001, &stored));
    let wrapped = ccm_wrap(&CLEAR_KEY, nonce, &key_datum(0x2005, &vmk_bytes()));
    payload.extend(entry(0x0000, 0x0005, &wrapped));

    entry(0x0002, 0x0008, &payload)
}

fn description_entry() -> Vec<u8> {
    let utf16: Vec<u8> = DESCRIPTION
        .encode_utf16()
        .flat_map(|u| u.to_le_bytes())
        .collect();
    entry(0x0007, 0x0002, &utf16)
}

fn fvek_entry(method: EncryptionMethod, nonce: &[u8; 12]) -> Vec<u8> {
    let (fvek, tweak) = fvek_bytes(method);
    let key_data = if method.is_xts() {
        let mut data = vec![0u8; 32 + method.key_len()];
        data[..method.key_len()].copy_from_slice(&fvek);
        data[32..32 + method.key_len()].copy_from_slice(&tweak);
        data
    } else {
        fvek.clone()
    };
    let wrapped = ccm_wrap(&vmk_bytes(), nonce, &key_datum(method.raw(), &key_data));
    entry(0x0003, 0x0005, &wrapped)
}

/// The recovery-password stretch is deliberately slow; derive it once per
/// test binary.
fn recovery_wrapping_key() -> [u8; 32] {
    static KEY: std::sync::OnceLock<[u8; 32]> = std::sync::OnceLock::new();
    *KEY.get_or_init(|| {
        let credential = Credential::recovery_password(RECOVERY).expect("recovery credential");
        *intermediate_key(&credential, &RECOVERY_SALT).expect("recovery derivation")
    })
}

fn metadata_block(method: EncryptionMethod, defective_first: bool) -> Vec<u8> {
    let password_key = intermediate_key(&Credential::password(PASSWORD), &PASSWORD_SALT)
        .expect("password derivation");
    let recovery_key = recovery_wrapping_key();

    let mut entries = Vec::new();
    entries.extend(description_entry());
    if defective_first {
        // Well-formed VMK entry carrying no salt and no wrapped key; it
        // decodes but can never unwrap anything.
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0x44; 16]);
        payload.extend_from_slice(&FILETIME.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes());
        payload.extend_from_slice(&0x2000u16.to_le_bytes());
        entries.extend(entry(0x0002, 0x0008, &payload));
    }
    entries.extend(salted_vmk_entry(
        0x2000,
        [0x11; 16],
        &PASSWORD_SALT,
        &password_key,
        &[0xa1; 12],
    ));
    entries.extend(salted_vmk_entry(
        0x0800,
        [0x22; 16],
        &RECOVERY_SALT,
        &recovery_key,
        &[0xa2; 12],
    ));
    entries.extend(clear_key_vmk_entry([0x33; 16], &[0xa3; 12]));
    entries.extend(fvek_entry(method, &[0xa4; 12]));

    let metadata_size = (48 + entries.len()) as u32;
    let mut block = vec![0u8; 64 + 48];
    block[0..8].copy_from_slice(b"-FVE-FS-");
    LittleEndian::write_u16(&mut block[8..10], 64 + 48);
    LittleEndian::write_u16(&mut block[10..12], 2);
    LittleEndian::write_u64(&mut block[16..24], IMAGE_LEN as u64);
    LittleEndian::write_u32(&mut block[28..32], RELOC_SECTORS as u32);
    LittleEndian::write_u64(&mut block[32..40], META_OFFSETS[0]);
    LittleEndian::write_u64(&mut block[40..48], META_OFFSETS[1]);
    LittleEndian::write_u64(&mut block[48..56], META_OFFSETS[2]);
    LittleEndian::write_u64(&mut block[56..64], RELOC_OFFSET);

    LittleEndian::write_u32(&mut block[64..68], metadata_size);
    LittleEndian::write_u32(&mut block[68..72], 1);
    LittleEndian::write_u32(&mut block[72..76], 48);
    LittleEndian::write_u32(&mut block[76..80], metadata_size);
    block[80..96].copy_from_slice(&VOLUME_GUID_RAW);
    LittleEndian::write_u32(&mut block[96..100], 0x20);
    LittleEndian::write_u32(&mut block[100..104], method.raw());
    LittleEndian::write_u64(&mut block[104..112], FILETIME);
    block.extend_from_slice(&entries);
    block
}

fn boot_sector() -> [u8; SECTOR] {
    let mut sector = [0u8; SECTOR];
    sector[0..11].copy_from_slice(b"\xeb\x58\x90-FVE-FS-");
    LittleEndian::write_u16(&mut sector[11..13], SECTOR as u16);
    LittleEndian::write_u64(&mut sector[0x28..0x30], TOTAL_SECTORS);
    sector[160..176].copy_from_slice(&VOLUME_GUID_RAW);
    LittleEndian::write_u64(&mut sector[176..184], META_OFFSETS[0]);
    LittleEndian::write_u64(&mut sector[184..192], META_OFFSETS[1]);
    LittleEndian::write_u64(&mut sector[192..200], META_OFFSETS[2]);
    sector
}

/// Builds a complete volume image encrypted under `method`.
pub fn build_image(method: EncryptionMethod) -> Vec<u8> {
    build(method, false)
}

/// Like [`build_image`], but a broken password-kind protector precedes the
/// working ones.
pub fn build_image_with_defective_protector(method: EncryptionMethod) -> Vec<u8> {
    build(method, true)
}

fn build(method: EncryptionMethod, defective_first: bool) -> Vec<u8> {
    let mut image = vec![0u8; IMAGE_LEN];
    image[..SECTOR].copy_from_slice(&boot_sector());

    let block = metadata_block(method, defective_first);
    for &offset in &META_OFFSETS {
        image[offset as usize..offset as usize + block.len()].copy_from_slice(&block);
    }
    let reserved_sectors = (block.len() as u64).div_ceil(SECTOR as u64);

    // Relocated first sectors, stored raw at RELOC_OFFSET.
    for s in 0..RELOC_SECTORS {
        let dst = (RELOC_OFFSET + s * SECTOR as u64) as usize;
        image[dst..dst + SECTOR].copy_from_slice(&pattern_sector(s));
    }

    let (fvek, tweak) = fvek_bytes(method);
    let keys = UnlockedKeys::from_raw(method, &fvek, method.is_xts().then_some(tweak.as_slice()))
        .expect("fixture keys");
    let cipher = SectorCipher::new(&keys);

    let mut skip: Vec<std::ops::Range<u64>> = META_OFFSETS
        .iter()
        .map(|&o| {
            let first = o / SECTOR as u64;
            first..first + reserved_sectors
        })
        .collect();
    let reloc_first = RELOC_OFFSET / SECTOR as u64;
    skip.push(reloc_first..reloc_first + RELOC_SECTORS);

    for index in RELOC_SECTORS..TOTAL_SECTORS {
        if skip.iter().any(|r| r.contains(&index)) {
            continue;
        }
        let mut sector = pattern_sector(index);
        cipher.encrypt_sector(&mut sector, SECTOR, index);
        let dst = index as usize * SECTOR;
        image[dst..dst + SECTOR].copy_from_slice(&sector);
    }

    image
}
