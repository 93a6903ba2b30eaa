use aes::{Aes128, Aes256};
use cipher::consts::U16;
use cipher::{Block, BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};
use xts_mode::Xts128;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::diffuser;
use crate::keys::UnlockedKeys;
use crate::metadata::EncryptionMethod;

/// Per-sector cipher selected from the metadata's encryption method.
///
/// A closed set known at parse time, so an enum with a matching function
/// rather than trait objects. The AES contexts hold round keys; the
/// underlying crates wipe them on drop via their `zeroize` features.
#[derive(Zeroize, ZeroizeOnDrop)]
pub enum SectorCipher {
    Cbc128 {
        #[zeroize(skip)]
        cipher: Aes128,
        diffuser: bool,
    },
    Cbc256 {
        #[zeroize(skip)]
        cipher: Aes256,
        diffuser: bool,
    },
    Xts128(#[zeroize(skip)] Xts128<Aes128>),
    Xts256(#[zeroize(skip)] Xts128<Aes256>),
}

impl SectorCipher {
    pub fn new(keys: &UnlockedKeys) -> Self {
        let fvek = keys.fvek();
        match keys.method() {
            EncryptionMethod::Aes128Cbc | EncryptionMethod::Aes128CbcDiffuser => {
                SectorCipher::Cbc128 {
                    cipher: Aes128::new(fvek.into()),
                    diffuser: keys.method().has_diffuser(),
                }
            }
            EncryptionMethod::Aes256Cbc | EncryptionMethod::Aes256CbcDiffuser => {
                SectorCipher::Cbc256 {
                    cipher: Aes256::new(fvek.into()),
                    diffuser: keys.method().has_diffuser(),
                }
            }
            EncryptionMethod::Aes128Xts => SectorCipher::Xts128(Xts128::new(
                Aes128::new(fvek.into()),
                Aes128::new(keys.tweak().into()),
            )),
            EncryptionMethod::Aes256Xts => SectorCipher::Xts256(Xts128::new(
                Aes256::new(fvek.into()),
                Aes256::new(keys.tweak().into()),
            )),
        }
    }

    /// Decrypts one sector in place. Never crosses a sector boundary.
    pub fn decrypt_sector(&self, data: &mut [u8], sector_size: usize, sector_index: u64) {
        debug_assert_eq!(data.len(), sector_size);
        match self {
            SectorCipher::Cbc128 { cipher, diffuser } => {
                cbc_decrypt_sector(cipher, data, sector_size, sector_index, *diffuser)
            }
            SectorCipher::Cbc256 { cipher, diffuser } => {
                cbc_decrypt_sector(cipher, data, sector_size, sector_index, *diffuser)
            }
            SectorCipher::Xts128(xts) => {
                xts.decrypt_area(data, sector_size, 0, |_| xts_tweak(sector_index))
            }
            SectorCipher::Xts256(xts) => {
                xts.decrypt_area(data, sector_size, 0, |_| xts_tweak(sector_index))
            }
        }
    }

    /// Encrypts one sector in place, the exact inverse of
    /// [`Self::decrypt_sector`].
    pub fn encrypt_sector(&self, data: &mut [u8], sector_size: usize, sector_index: u64) {
        debug_assert_eq!(data.len(), sector_size);
        match self {
            SectorCipher::Cbc128 { cipher, diffuser } => {
                cbc_encrypt_sector(cipher, data, sector_size, sector_index, *diffuser)
            }
            SectorCipher::Cbc256 { cipher, diffuser } => {
                cbc_encrypt_sector(cipher, data, sector_size, sector_index, *diffuser)
            }
            SectorCipher::Xts128(xts) => {
                xts.encrypt_area(data, sector_size, 0, |_| xts_tweak(sector_index))
            }
            SectorCipher::Xts256(xts) => {
                xts.encrypt_area(data, sector_size, 0, |_| xts_tweak(sector_index))
            }
        }
    }
}

/// XTS tweak value: the logical sector index, little-endian.
fn xts_tweak(sector_index: u64) -> [u8; 16] {
    let mut tweak = [0u8; 16];
    tweak[..8].copy_from_slice(&sector_index.to_le_bytes());
    tweak
}

/// CBC initialization vector: the sector's byte offset, little-endian in a
/// zero block, encrypted once with the data key.
fn derive_iv<C>(cipher: &C, sector_size: usize, sector_index: u64) -> [u8; 16]
where
    C: BlockEncrypt + BlockSizeUser<BlockSize = U16>,
{
    let byte_offset = sector_index.wrapping_mul(sector_size as u64);
    let mut iv = [0u8; 16];
    iv[..8].copy_from_slice(&byte_offset.to_le_bytes());
    cipher.encrypt_block(Block::<C>::from_mut_slice(&mut iv));
    iv
}

fn cbc_decrypt_sector<C>(
    cipher: &C,
    data: &mut [u8],
    sector_size: usize,
    sector_index: u64,
    diffused: bool,
) where
    C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>,
{
    let mut prev = derive_iv(cipher, sector_size, sector_index);
    for chunk in data.chunks_exact_mut(16) {
        let mut saved = [0u8; 16];
        saved.copy_from_slice(chunk);
        cipher.decrypt_block(Block::<C>::from_mut_slice(chunk));
        for (byte, key) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= key;
        }
        prev = saved;
    }
    // Diffuser undo comes after the CBC decrypt; reversing the order does
    // not invert the encode path.
    if diffused {
        diffuser::diffuser_b_decrypt(data);
        diffuser::diffuser_a_decrypt(data);
    }
}

fn cbc_encrypt_sector<C>(
    cipher: &C,
    data: &mut [u8],
    sector_size: usize,
    sector_index: u64,
    diffused: bool,
) where
    C: BlockEncrypt + BlockDecrypt + BlockSizeUser<BlockSize = U16>,
{
    if diffused {
        diffuser::diffuser_a_encrypt(data);
        diffuser::diffuser_b_encrypt(data);
    }
    let mut prev = derive_iv(cipher, sector_size, sector_index);
    for chunk in data.chunks_exact_mut(16) {
        for (byte, key) in chunk.iter_mut().zip(prev.iter()) {
            *byte ^= key;
        }
        cipher.encrypt_block(Block::<C>::from_mut_slice(chunk));
        prev.copy_from_slice(chunk);
    }
}
