use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{FveError, Result};

/// Number of digit groups in a recovery password.
pub const RECOVERY_GROUPS: usize = 8;
/// Digits per group.
pub const RECOVERY_GROUP_DIGITS: usize = 6;

/// A caller-supplied unlock credential.
///
/// Owned by the caller, handed to the resolver by reference for one unlock
/// attempt, wiped on drop, never persisted.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub enum Credential {
    /// Administrative/testing unlock: the stored protector key is used
    /// directly as the unwrapping key.
    ClearKey,
    /// User password, kept as the raw UTF-16LE byte stream the key
    /// derivation consumes.
    Password(Vec<u8>),
    /// Recovery password reduced to its 16-byte binary form (each digit
    /// group divided by 11, stored as consecutive little-endian u16 values).
    RecoveryPassword([u8; 16]),
    /// External startup-key blob read from a .BEK file.
    StartupKey(Vec<u8>),
}

impl Credential {
    /// Builds a password credential from a UTF-8 string, re-encoding it as
    /// the UTF-16LE stream the on-disk format hashes.
    pub fn password(password: &str) -> Self {
        let mut bytes = Vec::with_capacity(password.len() * 2);
        for unit in password.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        Credential::Password(bytes)
    }

    /// Parses and validates a 48-digit recovery password.
    ///
    /// Accepts `-` or whitespace between groups. Each group must be
    /// divisible by 11 and, once divided, fit in 16 bits. Validation happens
    /// here, before any stretching work is spent on the credential.
    pub fn recovery_password(text: &str) -> Result<Self> {
        let mut digits: Vec<u8> = Vec::with_capacity(RECOVERY_GROUPS * RECOVERY_GROUP_DIGITS);
        for ch in text.chars() {
            match ch {
                '0'..='9' => digits.push(ch as u8 - b'0'),
                '-' | ' ' | '\t' => {}
                _ => {
                    digits.zeroize();
                    return Err(FveError::InvalidCredential(
                        "recovery password contains a non-digit character",
                    ));
                }
            }
        }
        if digits.len() != RECOVERY_GROUPS * RECOVERY_GROUP_DIGITS {
            digits.zeroize();
            return Err(FveError::InvalidCredential(
                "recovery password must hold 48 digits in 8 groups of 6",
            ));
        }

        let mut key = [0u8; 16];
        for (index, group) in digits.chunks_exact(RECOVERY_GROUP_DIGITS).enumerate() {
            let mut value: u32 = 0;
            for &digit in group {
                value = value * 10 + u32::from(digit);
            }
            if value % 11 != 0 {
                digits.zeroize();
                key.zeroize();
                return Err(FveError::InvalidCredential(
                    "recovery password group is not divisible by 11",
                ));
            }
            let reduced = value / 11;
            if reduced > u32::from(u16::MAX) {
                digits.zeroize();
                key.zeroize();
                return Err(FveError::InvalidCredential(
                    "recovery password group out of range",
                ));
            }
            key[index * 2..index * 2 + 2].copy_from_slice(&(reduced as u16).to_le_bytes());
        }
        digits.zeroize();
        Ok(Credential::RecoveryPassword(key))
    }

    /// Wraps the raw content of an external startup-key file.
    pub fn startup_key(blob: Vec<u8>) -> Self {
        Credential::StartupKey(blob)
    }

    pub(crate) fn kind_name(&self) -> &'static str {
        match self {
            Credential::ClearKey => "clear key",
            Credential::Password(_) => "password",
            Credential::RecoveryPassword(_) => "recovery password",
            Credential::StartupKey(_) => "startup key",
        }
    }
}

impl std::fmt::Debug for Credential {
    // Never expose credential bytes through Debug output.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.kind_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = "480095-135795-720885-000000-000011-363000-597531-022286";

    #[test]
    fn accepts_valid_recovery_password() {
        let credential = Credential::recovery_password(VALID).unwrap();
        let Credential::RecoveryPassword(key) = credential else {
            panic!("wrong variant");
        };
        // First group: 480095 / 11 = 43645 = 0xaa7d, little-endian.
        assert_eq!(key[0], 0x7d);
        assert_eq!(key[1], 0xaa);
        // Third group: 720885 / 11 = 65535.
        assert_eq!(&key[4..6], &[0xff, 0xff]);
    }

    #[test]
    fn accepts_space_separated_groups() {
        let spaced = VALID.replace('-', " ");
        assert!(Credential::recovery_password(&spaced).is_ok());
    }

    #[test]
    fn rejects_group_not_divisible_by_11() {
        // First group off by one.
        let bad = "480096-135795-720885-000000-000011-363000-597531-022286";
        assert!(matches!(
            Credential::recovery_password(bad),
            Err(FveError::InvalidCredential(_))
        ));
    }

    #[test]
    fn rejects_group_exceeding_16_bits() {
        // 720907 = 11 * 65537, reduced value overflows u16.
        let bad = "720907-135795-720885-000000-000011-363000-597531-022286";
        assert!(matches!(
            Credential::recovery_password(bad),
            Err(FveError::InvalidCredential(_))
        ));
    }

    #[test]
    fn rejects_wrong_digit_count_and_garbage() {
        assert!(Credential::recovery_password("123456").is_err());
        assert!(Credential::recovery_password(
            "48009a-135795-720885-000000-000011-363000-597531-022286"
        )
        .is_err());
    }

    #[test]
    fn password_is_utf16le() {
        // The drop impl wipes the buffer, so inspect it in place.
        let credential = Credential::password("Ab");
        let Credential::Password(ref bytes) = credential else {
            panic!("wrong variant");
        };
        assert_eq!(*bytes, [0x41, 0x00, 0x62, 0x00]);
    }

    #[test]
    fn debug_never_prints_key_material() {
        let credential = Credential::recovery_password(VALID).unwrap();
        assert_eq!(format!("{credential:?}"), "recovery password");
    }
}
