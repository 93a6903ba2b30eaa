use std::io;
use std::ops::Range;
use std::sync::RwLock;

use uuid::Uuid;

use crate::boot::VolumeHeader;
use crate::cipher::SectorCipher;
use crate::credential::Credential;
use crate::error::{FveError, Result};
use crate::io::ByteSource;
use crate::keys::UnlockedKeys;
use crate::metadata::{EncryptionMethod, MetadataBlock};
use crate::protector;

/// Volume facts available as soon as the metadata is located, independent
/// of unlock state.
#[derive(Debug, Clone)]
pub struct VolumeInfo {
    pub guid: Uuid,
    pub method: EncryptionMethod,
    pub volume_size: u64,
    pub bytes_per_sector: u16,
    /// FILETIME of volume creation.
    pub creation_time: u64,
    pub description: Option<String>,
}

struct Unlocked {
    keys: UnlockedKeys,
    cipher: SectorCipher,
}

/// An open BitLocker volume: medium handle, located metadata, registered
/// credentials and, once unlocked, the resolved data keys.
///
/// Sector reads on an unlocked session only take the read lock, so callers
/// may issue them concurrently; `unlock` takes the write lock, so at most
/// one attempt is in flight.
pub struct VolumeSession<S: ByteSource> {
    source: S,
    header: VolumeHeader,
    metadata: MetadataBlock,
    /// Byte ranges of the metadata block copies; reads here pass through
    /// undecrypted.
    reserved: Vec<Range<u64>>,
    /// Length of the leading region relocated to `relocated_offset`
    /// (version 2 volumes), zero otherwise.
    relocated_len: u64,
    relocated_offset: u64,
    credentials: Vec<Credential>,
    state: RwLock<Option<Unlocked>>,
}

impl<S: ByteSource> VolumeSession<S> {
    /// Opens the volume: locates the boot sector, then the first valid
    /// metadata block copy. No credential is needed yet.
    pub fn open(source: S) -> Result<Self> {
        let header = VolumeHeader::read(&source)?;
        let metadata = MetadataBlock::read(&source, &header.metadata_offsets)?;

        let span = metadata.reserved_len(header.bytes_per_sector);
        let reserved = header
            .metadata_offsets
            .iter()
            .map(|&offset| offset..offset + span)
            .collect();

        let (relocated_len, relocated_offset) = if metadata.version >= 2 {
            let len = u64::from(metadata.volume_header_sectors)
                * u64::from(header.bytes_per_sector);
            let end = metadata
                .volume_header_offset
                .checked_add(len)
                .ok_or(FveError::CorruptMetadata("relocated header overflow"))?;
            if end > source.len() {
                return Err(FveError::CorruptMetadata(
                    "relocated volume header beyond medium",
                ));
            }
            (len, metadata.volume_header_offset)
        } else {
            (0, 0)
        };

        log::info!(
            "opened volume {{{}}}: {}, {} bytes",
            metadata.guid,
            metadata.method,
            header.volume_size
        );

        Ok(Self {
            source,
            header,
            metadata,
            reserved,
            relocated_len,
            relocated_offset,
            credentials: Vec::new(),
            state: RwLock::new(None),
        })
    }

    /// Registers a candidate credential. May be called repeatedly before
    /// unlocking; `unlock` tries credentials in registration order.
    pub fn set_credential(&mut self, credential: Credential) {
        log::debug!("registered {} credential", credential.kind_name());
        self.credentials.push(credential);
    }

    /// Attempts every registered credential against every matching key
    /// protector. Succeeds at most once; unlocking an already-unlocked
    /// session is a no-op, not a re-derivation.
    pub fn unlock(&self) -> Result<()> {
        let mut state = match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if state.is_some() {
            return Ok(());
        }
        let keys = protector::unlock(&self.metadata, &self.credentials)?;
        let cipher = SectorCipher::new(&keys);
        *state = Some(Unlocked { keys, cipher });
        log::info!("volume {{{}}} unlocked", self.metadata.guid);
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        match self.state.read() {
            Ok(guard) => guard.is_some(),
            Err(poisoned) => poisoned.into_inner().is_some(),
        }
    }

    /// Decrypts `count` sectors starting at `start_sector`.
    ///
    /// Sectors inside the reserved metadata regions are returned as stored;
    /// on version 2 volumes the leading relocated sectors are served raw
    /// from the relocation area. Everything else is decrypted per sector.
    pub fn read_sectors(&self, start_sector: u64, count: u64) -> Result<Vec<u8>> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let unlocked = state.as_ref().ok_or(FveError::NotUnlocked)?;

        let sector_size = u64::from(self.header.bytes_per_sector);
        let end_byte = start_sector
            .checked_add(count)
            .and_then(|end| end.checked_mul(sector_size))
            .ok_or_else(io_eof)?;
        if end_byte > self.header.volume_size {
            return Err(io_eof());
        }

        let sector_len = sector_size as usize;
        let mut out = vec![0u8; count as usize * sector_len];
        for (slot, index) in (start_sector..start_sector + count).enumerate() {
            let offset = index * sector_size;
            let buf = &mut out[slot * sector_len..(slot + 1) * sector_len];
            if self.is_reserved(offset, sector_size) {
                // Metadata region: pass-through, never ciphertext.
                self.source.read_at(offset, buf)?;
            } else if offset < self.relocated_len {
                self.source.read_at(self.relocated_offset + offset, buf)?;
            } else {
                self.source.read_at(offset, buf)?;
                unlocked.cipher.decrypt_sector(buf, sector_len, index);
            }
        }
        Ok(out)
    }

    /// Volume facts; available before unlock.
    pub fn describe(&self) -> VolumeInfo {
        VolumeInfo {
            guid: self.metadata.guid,
            method: self.metadata.method,
            volume_size: self.header.volume_size,
            bytes_per_sector: self.header.bytes_per_sector,
            creation_time: self.metadata.creation_time,
            description: self.metadata.description(),
        }
    }

    /// The data keys, for callers that need to hand them elsewhere.
    /// `None` while locked.
    pub fn with_keys<T>(&self, f: impl FnOnce(&UnlockedKeys) -> T) -> Option<T> {
        let state = match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.as_ref().map(|unlocked| f(&unlocked.keys))
    }

    /// Releases the medium handle and wipes all key material.
    pub fn close(self) {
        log::debug!("closing volume {{{}}}", self.metadata.guid);
        // Credentials and unlocked keys zeroize on drop.
        drop(self);
    }

    fn is_reserved(&self, offset: u64, len: u64) -> bool {
        let end = offset + len;
        self.reserved
            .iter()
            .any(|range| offset < range.end && end > range.start)
    }
}

fn io_eof() -> FveError {
    FveError::Io(io::Error::from(io::ErrorKind::UnexpectedEof))
}
