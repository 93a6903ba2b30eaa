//! BitLocker (FVE) volume unlocking and sector decryption.
//!
//! The crate reads the on-disk Full Volume Encryption format directly: it
//! locates the metadata block copies from the boot sector, resolves a key
//! protector with a caller-supplied credential, unwraps the volume master
//! key and then the full-volume encryption key, and decrypts sectors on
//! demand. AES-CBC (with and without the Elephant diffuser) and AES-XTS
//! volumes are supported, with 128- and 256-bit keys.
//!
//! ```no_run
//! use fvelock::{Credential, FileSource, VolumeSession};
//!
//! # fn main() -> fvelock::Result<()> {
//! let source = FileSource::open("/dev/sdb1")?;
//! let mut session = VolumeSession::open(source)?;
//! session.set_credential(Credential::password("hunter2"));
//! session.unlock()?;
//! let boot = session.read_sectors(0, 1)?;
//! # let _ = boot;
//! # Ok(())
//! # }
//! ```
//!
//! All key material is wiped on drop.

pub mod boot;
pub mod cipher;
pub mod credential;
pub mod diffuser;
pub mod error;
pub mod io;
pub mod keys;
pub mod metadata;
pub mod protector;
pub mod session;

pub use crate::boot::VolumeHeader;
pub use crate::cipher::SectorCipher;
pub use crate::credential::Credential;
pub use crate::error::{FveError, Result};
pub use crate::io::{ByteSource, FileSource};
pub use crate::keys::UnlockedKeys;
pub use crate::metadata::{EncryptionMethod, MetadataBlock};
pub use crate::protector::{KeyProtector, ProtectorKind};
pub use crate::session::{VolumeInfo, VolumeSession};
