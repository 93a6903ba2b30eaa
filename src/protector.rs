use uuid::Uuid;
use zeroize::Zeroizing;

use crate::credential::Credential;
use crate::error::{FveError, Result};
use crate::keys::{self, UnlockedKeys};
use crate::metadata::{EntryType, MetadataBlock, MetadataEntry, ValueType};

/// Protection scheme of a key protector, from the u16 tag inside a VMK
/// entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectorKind {
    ClearKey,
    Tpm,
    StartupKey,
    TpmAndPin,
    RecoveryPassword,
    Password,
    Unknown(u16),
}

impl ProtectorKind {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ProtectorKind::ClearKey,
            0x0100 => ProtectorKind::Tpm,
            0x0200 => ProtectorKind::StartupKey,
            0x0500 => ProtectorKind::TpmAndPin,
            0x0800 => ProtectorKind::RecoveryPassword,
            0x2000 => ProtectorKind::Password,
            other => ProtectorKind::Unknown(other),
        }
    }
}

/// An AEAD-wrapped key as stored on disk: nonce, authentication tag and
/// ciphertext.
#[derive(Debug, Clone)]
pub struct WrappedKey {
    pub nonce: [u8; 12],
    pub mac: [u8; 16],
    pub payload: Vec<u8>,
}

impl WrappedKey {
    /// Decodes an AES-CCM encrypted key datum payload.
    pub(crate) fn parse(data: &[u8]) -> Result<Self> {
        if data.len() <= 28 {
            return Err(FveError::CorruptMetadata("wrapped key datum too short"));
        }
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&data[0..12]);
        let mut mac = [0u8; 16];
        mac.copy_from_slice(&data[12..28]);
        Ok(Self {
            nonce,
            mac,
            payload: data[28..].to_vec(),
        })
    }
}

/// One key protector decoded from a VMK entry: a credential-specific
/// wrapping of the same volume master key.
pub struct KeyProtector {
    pub guid: Uuid,
    pub kind: ProtectorKind,
    salt: Option<[u8; 16]>,
    clear_key: Option<Zeroizing<Vec<u8>>>,
    wrapped_vmk: Option<WrappedKey>,
}

impl KeyProtector {
    /// Decodes a VMK entry: GUID, timestamp, protection tag, then nested
    /// property entries (display string, stretch-key salt or clear key, and
    /// the wrapped VMK itself).
    fn parse(entry: &MetadataEntry) -> Result<Self> {
        if entry.data.len() < 28 {
            return Err(FveError::CorruptMetadata("VMK entry too short"));
        }
        let mut guid_raw = [0u8; 16];
        guid_raw.copy_from_slice(&entry.data[0..16]);
        let guid = Uuid::from_bytes_le(guid_raw);
        let kind = ProtectorKind::from_raw(u16::from_le_bytes([entry.data[26], entry.data[27]]));

        let mut salt = None;
        let mut clear_key = None;
        let mut wrapped_vmk = None;
        for property in entry.nested(28)? {
            match property.value_type {
                ValueType::StretchKey => {
                    // u32 method, then the 16-byte salt.
                    if property.data.len() < 20 {
                        return Err(FveError::CorruptMetadata("stretch key datum too short"));
                    }
                    let mut bytes = [0u8; 16];
                    bytes.copy_from_slice(&property.data[4..20]);
                    salt = Some(bytes);
                }
                ValueType::Key => {
                    // u32 method, then raw key bytes (clear-key protectors).
                    if property.data.len() <= 4 {
                        return Err(FveError::CorruptMetadata("key datum too short"));
                    }
                    clear_key = Some(Zeroizing::new(property.data[4..].to_vec()));
                }
                ValueType::AesCcmEncryptedKey => {
                    wrapped_vmk = Some(WrappedKey::parse(&property.data)?);
                }
                _ => {}
            }
        }

        Ok(Self {
            guid,
            kind,
            salt,
            clear_key,
            wrapped_vmk,
        })
    }

    /// Whether this protector can be attempted with the given credential.
    pub fn matches(&self, credential: &Credential) -> bool {
        matches!(
            (self.kind, credential),
            (ProtectorKind::ClearKey, Credential::ClearKey)
                | (ProtectorKind::Password, Credential::Password(_))
                | (ProtectorKind::RecoveryPassword, Credential::RecoveryPassword(_))
                | (ProtectorKind::StartupKey, Credential::StartupKey(_))
        )
    }

    /// Attempts to unwrap the VMK with `credential`. `WrongCredential`
    /// covers both derivation mismatch and AEAD authentication failure.
    fn unwrap_vmk(&self, credential: &Credential) -> Result<Zeroizing<Vec<u8>>> {
        let wrapped = self
            .wrapped_vmk
            .as_ref()
            .ok_or(FveError::CorruptMetadata("protector holds no wrapped key"))?;

        let intermediate: Zeroizing<[u8; 32]> = match credential {
            Credential::ClearKey => {
                let stored = self
                    .clear_key
                    .as_ref()
                    .ok_or(FveError::CorruptMetadata("clear-key protector holds no key"))?;
                if stored.len() != 32 {
                    return Err(FveError::CorruptMetadata("clear key length mismatch"));
                }
                let mut key = Zeroizing::new([0u8; 32]);
                key.copy_from_slice(stored);
                key
            }
            _ => {
                let salt = self
                    .salt
                    .ok_or(FveError::CorruptMetadata("protector holds no salt"))?;
                keys::intermediate_key(credential, &salt)?
            }
        };

        let plaintext = keys::ccm_unwrap(
            &intermediate,
            &wrapped.nonce,
            &wrapped.mac,
            &wrapped.payload,
        )?;
        let vmk = keys::parse_key_datum(&plaintext)?;
        if vmk.len() != 32 {
            return Err(FveError::CorruptMetadata("volume master key length mismatch"));
        }
        Ok(vmk)
    }
}

/// Decodes every key protector in the block, skipping entries the engine
/// does not understand rather than failing the whole block.
pub fn collect(block: &MetadataBlock) -> Vec<KeyProtector> {
    block
        .entries_of(EntryType::Vmk, ValueType::Vmk)
        .filter_map(|entry| match KeyProtector::parse(entry) {
            Ok(protector) => Some(protector),
            Err(err) => {
                log::warn!("skipping undecodable key protector: {err}");
                None
            }
        })
        .collect()
}

/// Tries every registered credential against every matching protector, in
/// caller-supplied order, and resolves the first successful unwrap all the
/// way to the data keys.
pub(crate) fn unlock(block: &MetadataBlock, credentials: &[Credential]) -> Result<UnlockedKeys> {
    let protectors = collect(block);
    let mut rejected = false;
    let mut structural: Option<FveError> = None;

    for credential in credentials {
        for protector in protectors.iter().filter(|p| p.matches(credential)) {
            match protector.unwrap_vmk(credential) {
                Ok(vmk) => {
                    log::info!(
                        "unwrapped VMK via {:?} protector {{{}}}",
                        protector.kind,
                        protector.guid
                    );
                    return unwrap_fvek(block, &vmk);
                }
                Err(FveError::WrongCredential) => {
                    rejected = true;
                    log::debug!(
                        "{} rejected by protector {{{}}}",
                        credential.kind_name(),
                        protector.guid
                    );
                }
                // A structurally broken protector must not block the
                // remaining ones; keep the error in case nothing succeeds.
                Err(other) => {
                    log::warn!("protector {{{}}} unusable: {other}", protector.guid);
                    structural.get_or_insert(other);
                }
            }
        }
    }

    if rejected {
        Err(FveError::WrongCredential)
    } else if let Some(err) = structural {
        Err(err)
    } else {
        Err(FveError::NoMatchingProtector)
    }
}

/// Stage 2, second hop: VMK → FVEK (+ tweak key for XTS methods).
fn unwrap_fvek(block: &MetadataBlock, vmk: &Zeroizing<Vec<u8>>) -> Result<UnlockedKeys> {
    let entry = block
        .entries_of(EntryType::Fvek, ValueType::AesCcmEncryptedKey)
        .next()
        .ok_or(FveError::CorruptMetadata("metadata holds no FVEK entry"))?;
    let wrapped = WrappedKey::parse(&entry.data)?;

    let mut vmk_key = Zeroizing::new([0u8; 32]);
    vmk_key.copy_from_slice(vmk);
    // The VMK already authenticated; an FVEK that fails to unwrap under it
    // means the metadata is inconsistent, not that the credential was wrong.
    let plaintext = keys::ccm_unwrap(&vmk_key, &wrapped.nonce, &wrapped.mac, &wrapped.payload)
        .map_err(|_| FveError::CorruptMetadata("FVEK failed to unwrap under the VMK"))?;
    let key_data = keys::parse_key_datum(&plaintext)?;
    UnlockedKeys::from_fvek_data(block.method, &key_data)
}
