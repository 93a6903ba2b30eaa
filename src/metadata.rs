use byteorder::{ByteOrder, LittleEndian};
use uuid::Uuid;

use crate::error::{FveError, Result};
use crate::io::ByteSource;

/// Magic value at the start of every FVE metadata block.
pub const BLOCK_SIGNATURE: &[u8; 8] = b"-FVE-FS-";
/// Fixed block header size preceding the metadata header.
pub const BLOCK_HEADER_SIZE: usize = 64;
/// Fixed metadata header size preceding the entries.
pub const METADATA_HEADER_SIZE: usize = 48;
/// Wire size of a metadata entry header.
pub const ENTRY_HEADER_SIZE: usize = 8;

/// Semantic role of a top-level metadata entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    None,
    Vmk,
    Fvek,
    Validation,
    StartupKey,
    Description,
    FvekBackup,
    VolumeHeaderBlock,
    Unknown(u16),
}

impl EntryType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => EntryType::None,
            0x0002 => EntryType::Vmk,
            0x0003 => EntryType::Fvek,
            0x0004 => EntryType::Validation,
            0x0006 => EntryType::StartupKey,
            0x0007 => EntryType::Description,
            0x000b => EntryType::FvekBackup,
            0x000f => EntryType::VolumeHeaderBlock,
            other => EntryType::Unknown(other),
        }
    }
}

/// Wire encoding of an entry's payload.
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
    Vmk,
    ExternalKey,
    Update,
    Error,
    OffsetAndSize,
    Unknown(u16),
}

impl ValueType {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0x0000 => ValueType::Erased,
            0x0001 => ValueType::Key,
            0x0002 => ValueType::UnicodeString,
            0x0003 => ValueType::StretchKey,
            0x0004 => ValueType::UseKey,
            0x0005 => ValueType::AesCcmEncryptedKey,
            0x0006 => ValueType::TpmEncodedKey,
            0x0007 => ValueType::Validation,
            0x0008 => ValueType::Vmk,
            0x0009 => ValueType::ExternalKey,
            0x000a => ValueType::Update,
            0x000b => ValueType::Error,
            0x000f => ValueType::OffsetAndSize,
            other => ValueType::Unknown(other),
        }
    }
}

/// Full-volume encryption methods recorded in the metadata header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes128CbcDiffuser,
    Aes256CbcDiffuser,
    Aes128Cbc,
    Aes256Cbc,
    Aes128Xts,
    Aes256Xts,
}

impl EncryptionMethod {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0x8000 => Some(EncryptionMethod::Aes128CbcDiffuser),
            0x8001 => Some(EncryptionMethod::Aes256CbcDiffuser),
            0x8002 => Some(EncryptionMethod::Aes128Cbc),
            0x8003 => Some(EncryptionMethod::Aes256Cbc),
            0x8004 => Some(EncryptionMethod::Aes128Xts),
            0x8005 => Some(EncryptionMethod::Aes256Xts),
            _ => None,
        }
    }

    pub fn raw(self) -> u32 {
        match self {
            EncryptionMethod::Aes128CbcDiffuser => 0x8000,
            EncryptionMethod::Aes256CbcDiffuser => 0x8001,
            EncryptionMethod::Aes128Cbc => 0x8002,
            EncryptionMethod::Aes256Cbc => 0x8003,
            EncryptionMethod::Aes128Xts => 0x8004,
            EncryptionMethod::Aes256Xts => 0x8005,
        }
    }

    /// AES key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            EncryptionMethod::Aes128CbcDiffuser
            | EncryptionMethod::Aes128Cbc
            | EncryptionMethod::Aes128Xts => 16,
            EncryptionMethod::Aes256CbcDiffuser
            | EncryptionMethod::Aes256Cbc
            | EncryptionMethod::Aes256Xts => 32,
        }
    }

    pub fn has_diffuser(self) -> bool {
        matches!(
            self,
            EncryptionMethod::Aes128CbcDiffuser | EncryptionMethod::Aes256CbcDiffuser
        )
    }

    pub fn is_xts(self) -> bool {
        matches!(
            self,
            EncryptionMethod::Aes128Xts | EncryptionMethod::Aes256Xts
        )
    }
}

impl std::fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EncryptionMethod::Aes128CbcDiffuser => "AES-128-CBC with diffuser",
            EncryptionMethod::Aes256CbcDiffuser => "AES-256-CBC with diffuser",
            EncryptionMethod::Aes128Cbc => "AES-128-CBC",
            EncryptionMethod::Aes256Cbc => "AES-256-CBC",
            EncryptionMethod::Aes128Xts => "AES-128-XTS",
            EncryptionMethod::Aes256Xts => "AES-256-XTS",
        };
        f.write_str(name)
    }
}

/// One decoded metadata entry. `data` is the payload after the 8-byte entry
/// header; nested property entries (inside VMK entries) reuse the same wire
/// format.
#[derive(Debug, Clone)]
pub struct MetadataEntry {
    pub entry_type: EntryType,
    pub value_type: ValueType,
    pub data: Vec<u8>,
}

impl MetadataEntry {
    /// Decodes a sequence of entries that must exactly exhaust `bytes`.
    pub fn parse_sequence(bytes: &[u8]) -> Result<Vec<MetadataEntry>> {
        let mut entries = Vec::new();
        let mut cursor = 0usize;
        while cursor < bytes.len() {
            let remaining = &bytes[cursor..];
            if remaining.len() < ENTRY_HEADER_SIZE {
                return Err(FveError::CorruptMetadata("truncated metadata entry"));
            }
            let size = usize::from(LittleEndian::read_u16(&remaining[0..2]));
            if size < ENTRY_HEADER_SIZE || size > remaining.len() {
                return Err(FveError::CorruptMetadata(
                    "metadata entry size out of bounds",
                ));
            }
            let entry_type = EntryType::from_raw(LittleEndian::read_u16(&remaining[2..4]));
            let value_type = ValueType::from_raw(LittleEndian::read_u16(&remaining[4..6]));
            let version = LittleEndian::read_u16(&remaining[6..8]);
            if version != 1 {
                return Err(FveError::CorruptMetadata("unknown metadata entry version"));
            }
            entries.push(MetadataEntry {
                entry_type,
                value_type,
                data: remaining[ENTRY_HEADER_SIZE..size].to_vec(),
            });
            cursor += size;
        }
        Ok(entries)
    }

    /// Decodes the nested property entries that follow `skip` bytes of
    /// fixed payload.
    pub fn nested(&self, skip: usize) -> Result<Vec<MetadataEntry>> {
        if skip > self.data.len() {
            return Err(FveError::CorruptMetadata("nested entries out of bounds"));
        }
        Self::parse_sequence(&self.data[skip..])
    }
}

/// A validated FVE metadata block: block header, metadata header and the
/// decoded entry sequence.
#[derive(Debug, Clone)]
pub struct MetadataBlock {
    /// Offset of this copy on the medium.
    pub block_offset: u64,
    /// Block format version (1 = Vista, 2 = Windows 7).
    pub version: u16,
    pub encrypted_volume_size: u64,
    /// Number of leading sectors relocated to `volume_header_offset`
    /// (version 2 volumes).
    pub volume_header_sectors: u32,
    pub volume_header_offset: u64,
    /// Declared size of metadata header + entries.
    pub metadata_size: u32,
    pub guid: Uuid,
    pub next_nonce_counter: u32,
    pub method: EncryptionMethod,
    /// Volume creation time as a FILETIME value.
    pub creation_time: u64,
    pub entries: Vec<MetadataEntry>,
}

impl MetadataBlock {
    /// Reads the redundant metadata copies at `candidates` and returns the
    /// first structurally valid one.
    ///
    /// All valid copies must agree on volume GUID and encryption method; a
    /// disagreement is corruption, not something to resolve silently.
    pub fn read(source: &dyn ByteSource, candidates: &[u64]) -> Result<Self> {
        let mut chosen: Option<Self> = None;
        let mut unsupported: Option<FveError> = None;
        for &offset in candidates {
            match Self::read_one(source, offset) {
                Ok(block) => match &chosen {
                    None => chosen = Some(block),
                    Some(first) => {
                        if first.guid != block.guid || first.method != block.method {
                            return Err(FveError::CorruptMetadata(
                                "metadata copies disagree on GUID or method",
                            ));
                        }
                    }
                },
                Err(err @ FveError::UnsupportedVersion(_)) => {
                    log::warn!("metadata copy at {offset:#x} unsupported: {err}");
                    unsupported.get_or_insert(err);
                }
                Err(err) => {
                    log::warn!("metadata copy at {offset:#x} invalid: {err}");
                }
            }
        }
        match chosen {
            Some(block) => Ok(block),
            None => Err(unsupported
                .unwrap_or(FveError::CorruptMetadata("no valid metadata block copy"))),
        }
    }

    /// Reads and validates a single metadata block copy.
    pub fn read_one(source: &dyn ByteSource, offset: u64) -> Result<Self> {
        let mut fixed = [0u8; BLOCK_HEADER_SIZE + METADATA_HEADER_SIZE];
        source.read_at(offset, &mut fixed)?;

        if &fixed[0..8] != BLOCK_SIGNATURE {
            return Err(FveError::CorruptMetadata("bad metadata block signature"));
        }
        let version = LittleEndian::read_u16(&fixed[10..12]);
        if version != 1 && version != 2 {
            return Err(FveError::UnsupportedVersion(u32::from(version)));
        }
        let encrypted_volume_size = LittleEndian::read_u64(&fixed[16..24]);
        let volume_header_sectors = LittleEndian::read_u32(&fixed[28..32]);
        let recorded_offsets = [
            LittleEndian::read_u64(&fixed[32..40]),
            LittleEndian::read_u64(&fixed[40..48]),
            LittleEndian::read_u64(&fixed[48..56]),
        ];
        if !recorded_offsets.contains(&offset) {
            return Err(FveError::CorruptMetadata(
                "block does not record its own offset",
            ));
        }
        let volume_header_offset = LittleEndian::read_u64(&fixed[56..64]);

        let header = &fixed[BLOCK_HEADER_SIZE..];
        let metadata_size = LittleEndian::read_u32(&header[0..4]);
        let metadata_version = LittleEndian::read_u32(&header[4..8]);
        if metadata_version != 1 {
            return Err(FveError::UnsupportedVersion(metadata_version));
        }
        let header_size = LittleEndian::read_u32(&header[8..12]);
        let metadata_size_copy = LittleEndian::read_u32(&header[12..16]);
        if header_size != METADATA_HEADER_SIZE as u32 {
            return Err(FveError::CorruptMetadata("unexpected metadata header size"));
        }
        // Duplicated size field doubles as the block's redundancy check.
        if metadata_size != metadata_size_copy {
            return Err(FveError::CorruptMetadata("metadata size fields disagree"));
        }
        if (metadata_size as usize) < METADATA_HEADER_SIZE {
            return Err(FveError::CorruptMetadata("declared metadata size too small"));
        }
        let total = offset
            .checked_add(BLOCK_HEADER_SIZE as u64)
            .and_then(|v| v.checked_add(u64::from(metadata_size)))
            .ok_or(FveError::CorruptMetadata("metadata size overflow"))?;
        if total > source.len() {
            return Err(FveError::CorruptMetadata(
                "declared metadata size exceeds medium",
            ));
        }

        let mut guid_raw = [0u8; 16];
        guid_raw.copy_from_slice(&header[16..32]);
        let guid = Uuid::from_bytes_le(guid_raw);
        let next_nonce_counter = LittleEndian::read_u32(&header[32..36]);
        let method_raw = LittleEndian::read_u32(&header[36..40]);
        let method = EncryptionMethod::from_raw(method_raw)
            .ok_or(FveError::UnsupportedVersion(method_raw))?;
        let creation_time = LittleEndian::read_u64(&header[40..48]);

        let entries_len = metadata_size as usize - METADATA_HEADER_SIZE;
        let mut entry_bytes = vec![0u8; entries_len];
        source.read_at(
            offset + (BLOCK_HEADER_SIZE + METADATA_HEADER_SIZE) as u64,
            &mut entry_bytes,
        )?;
        let entries = MetadataEntry::parse_sequence(&entry_bytes)?;

        log::debug!(
            "metadata block at {:#x}: version {}, method {}, {} entries",
            offset,
            version,
            method,
            entries.len()
        );

        Ok(Self {
            block_offset: offset,
            version,
            encrypted_volume_size,
            volume_header_sectors,
            volume_header_offset,
            metadata_size,
            guid,
            next_nonce_counter,
            method,
            creation_time,
            entries,
        })
    }

    /// Bytes occupied on disk by one metadata copy, rounded up to a sector.
    pub fn reserved_len(&self, bytes_per_sector: u16) -> u64 {
        let raw = BLOCK_HEADER_SIZE as u64 + u64::from(self.metadata_size);
        let sector = u64::from(bytes_per_sector);
        raw.div_ceil(sector) * sector
    }

    /// Iterates over entries with the given type tags.
    pub fn entries_of(
        &self,
        entry_type: EntryType,
        value_type: ValueType,
    ) -> impl Iterator<Item = &MetadataEntry> {
        self.entries
            .iter()
            .filter(move |e| e.entry_type == entry_type && e.value_type == value_type)
    }

    /// UTF-16LE volume description, when present.
    pub fn description(&self) -> Option<String> {
        let entry = self
            .entries_of(EntryType::Description, ValueType::UnicodeString)
            .next()?;
        let units: Vec<u16> = entry
            .data
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .take_while(|&u| u != 0)
            .collect();
        String::from_utf16(&units).ok()
    }
}
