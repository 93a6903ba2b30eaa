use std::io;

use thiserror::Error;

/// Error kinds surfaced by the unlock and sector-decryption engine.
///
/// Structural errors (`InvalidVolumeHeader`, `CorruptMetadata`,
/// `UnsupportedVersion`) are fatal to the open attempt. Credential errors
/// (`NoMatchingProtector`, `WrongCredential`) leave the session locked; the
/// caller may register another credential and retry `unlock`.
#[derive(Debug, Error)]
pub enum FveError {
    /// Medium read failure. Never retried by the engine.
    #[error("volume I/O error: {0}")]
    Io(#[from] io::Error),

    /// The boot sector does not describe a BitLocker-encrypted volume.
    #[error("invalid volume header: {0}")]
    InvalidVolumeHeader(&'static str),

    /// No metadata block copy passed validation, or the copies disagree.
    #[error("corrupt FVE metadata: {0}")]
    CorruptMetadata(&'static str),

    /// The metadata declares a format version or encryption method this
    /// engine does not understand.
    #[error("unsupported FVE version or method: {0:#06x}")]
    UnsupportedVersion(u32),

    /// The metadata holds no key protector of the requested kind.
    #[error("no key protector matches the supplied credential")]
    NoMatchingProtector,

    /// A matching protector exists but every unwrap attempt failed
    /// authentication.
    #[error("credential failed to unwrap the volume master key")]
    WrongCredential,

    /// The supplied credential is malformed (rejected before any key
    /// derivation work).
    #[error("malformed credential: {0}")]
    InvalidCredential(&'static str),

    /// Sector access was requested on a locked session.
    #[error("volume is not unlocked")]
    NotUnlocked,
}

pub type Result<T> = std::result::Result<T, FveError>;
