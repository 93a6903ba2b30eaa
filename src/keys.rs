use aes::Aes256;
use ccm::aead::generic_array::GenericArray;
use ccm::aead::{Aead, KeyInit};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::credential::Credential;
use crate::error::{FveError, Result};
use crate::metadata::EncryptionMethod;

/// Round count of the recovery-password stretching chain. Fixed by the
/// on-disk format; a different count derives keys that match nothing.
pub const STRETCH_ROUNDS: u32 = 0x0010_0000;

/// AES-CCM construction used for every key unwrap: 256-bit key, 16-byte tag,
/// 12-byte nonce.
type Aes256Ccm = Ccm<Aes256, U16, U12>;

/// The 88-byte chain state hashed on every stretch round:
/// last digest, initial digest, salt, little-endian round counter.
const CHAIN_STATE_LEN: usize = 32 + 32 + 16 + 8;

/// Stretches an initial SHA-256 digest into a key-unwrapping key.
///
/// Each round hashes the running state and bumps the counter; the cost is
/// the point, so the round count is never negotiable.
fn stretch(initial: &[u8; 32], salt: &[u8; 16]) -> Zeroizing<[u8; 32]> {
    let mut state = Zeroizing::new([0u8; CHAIN_STATE_LEN]);
    state[32..64].copy_from_slice(initial);
    state[64..80].copy_from_slice(salt);

    for round in 0..u64::from(STRETCH_ROUNDS) {
        state[80..88].copy_from_slice(&round.to_le_bytes());
        let digest = Sha256::digest(state.as_ref());
        state[0..32].copy_from_slice(&digest);
    }

    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&state[0..32]);
    key
}

/// Stage 1 of the derivation chain: credential + protector salt → 256-bit
/// intermediate key. The result only ever unwraps other keys.
///
/// Clear-key protectors skip this stage; the resolver feeds the stored key
/// straight into stage 2.
pub fn intermediate_key(credential: &Credential, salt: &[u8; 16]) -> Result<Zeroizing<[u8; 32]>> {
    match credential {
        Credential::ClearKey => Err(FveError::InvalidCredential(
            "clear-key credentials carry no derivable secret",
        )),
        Credential::Password(utf16) => {
            let mut hasher = Sha256::new();
            hasher.update(utf16);
            hasher.update(salt);
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&hasher.finalize());
            Ok(key)
        }
        Credential::StartupKey(blob) => {
            let mut hasher = Sha256::new();
            hasher.update(blob);
            hasher.update(salt);
            let mut key = Zeroizing::new([0u8; 32]);
            key.copy_from_slice(&hasher.finalize());
            Ok(key)
        }
        Credential::RecoveryPassword(binary) => {
            let mut initial = Zeroizing::new([0u8; 32]);
            initial.copy_from_slice(&Sha256::digest(binary));
            Ok(stretch(&initial, salt))
        }
    }
}

/// AEAD-unwraps a wrapped key: ciphertext + MAC under `key` and `nonce`.
///
/// Authentication failure maps to `WrongCredential`; the ccm crate releases
/// no plaintext on failure and the joined buffer is wiped either way.
pub(crate) fn ccm_unwrap(
    key: &[u8; 32],
    nonce: &[u8; 12],
    mac: &[u8; 16],
    payload: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Ccm::new(GenericArray::from_slice(key));
    let mut joined = Zeroizing::new(Vec::with_capacity(payload.len() + mac.len()));
    joined.extend_from_slice(payload);
    joined.extend_from_slice(mac);
    cipher
        .decrypt(GenericArray::from_slice(nonce), joined.as_slice())
        .map(Zeroizing::new)
        .map_err(|_| FveError::WrongCredential)
}

/// An unwrapped AES-CCM plaintext is itself a key datum: an entry header
/// whose declared size must equal the plaintext length, a key value type,
/// a u32 method field, then the key bytes.
pub(crate) fn parse_key_datum(plaintext: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
    if plaintext.len() < 12 {
        return Err(FveError::CorruptMetadata("unwrapped key datum too short"));
    }
    let declared = usize::from(u16::from_le_bytes([plaintext[0], plaintext[1]]));
    if declared != plaintext.len() {
        return Err(FveError::CorruptMetadata(
            "unwrapped key datum size mismatch",
        ));
    }
    let value_type = u16::from_le_bytes([plaintext[4], plaintext[5]]);
    if value_type != 0x0001 {
        return Err(FveError::CorruptMetadata(
            "unwrapped datum is not a key value",
        ));
    }
    Ok(Zeroizing::new(plaintext[12..].to_vec()))
}

/// The data keys recovered by a successful unlock. Held in memory only, for
/// the lifetime of the session, and wiped on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct UnlockedKeys {
    #[zeroize(skip)]
    method: EncryptionMethod,
    fvek: Vec<u8>,
    tweak: Vec<u8>,
}

impl UnlockedKeys {
    /// Splits the unwrapped FVEK datum key data according to the method:
    /// FVEK first, and for XTS methods an equal-length tweak key at offset
    /// 32.
    pub(crate) fn from_fvek_data(method: EncryptionMethod, key_data: &[u8]) -> Result<Self> {
        let key_len = method.key_len();
        if method.is_xts() {
            if key_data.len() < 32 + key_len {
                return Err(FveError::CorruptMetadata("FVEK datum too short for XTS"));
            }
            Ok(Self {
                method,
                fvek: key_data[..key_len].to_vec(),
                tweak: key_data[32..32 + key_len].to_vec(),
            })
        } else {
            if key_data.len() < key_len {
                return Err(FveError::CorruptMetadata("FVEK datum too short"));
            }
            Ok(Self {
                method,
                fvek: key_data[..key_len].to_vec(),
                tweak: Vec::new(),
            })
        }
    }

    /// Builds keys directly from raw material, for callers that already hold
    /// an FVEK (and tweak key for XTS methods).
    pub fn from_raw(method: EncryptionMethod, fvek: &[u8], tweak: Option<&[u8]>) -> Result<Self> {
        let key_len = method.key_len();
        if fvek.len() != key_len {
            return Err(FveError::InvalidCredential("FVEK length mismatch"));
        }
        let tweak = match (method.is_xts(), tweak) {
            (true, Some(t)) if t.len() == key_len => t.to_vec(),
            (true, _) => return Err(FveError::InvalidCredential("tweak key length mismatch")),
            (false, _) => Vec::new(),
        };
        Ok(Self {
            method,
            fvek: fvek.to_vec(),
            tweak,
        })
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    pub(crate) fn fvek(&self) -> &[u8] {
        &self.fvek
    }

    pub(crate) fn tweak(&self) -> &[u8] {
        &self.tweak
    }
}
