use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const CODE_FLOOR: u64 = 10_000_000;
const CODE_SPAN: u64 = 90_000_000;

/// Stable 8-digit identifier a device registers under on the signaling
/// channel. Derived deterministically from the local user id, so the same
/// install keeps the same code across restarts. Collisions inside the
/// 8-digit space are an accepted limitation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceCode(String);

impl DeviceCode {
    pub fn derive(user_id: &str) -> Self {
        let digest = Sha256::digest(user_id.as_bytes());
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&digest[..8]);
        let folded = CODE_FLOOR + u64::from_be_bytes(raw) % CODE_SPAN;
        Self(folded.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceCode {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 8 || !s.chars().all(|c| c.is_ascii_digit()) {
            return Err(IdentityError::InvalidDeviceCode(s.to_string()));
        }
        // First digit is never zero by construction.
        if s.starts_with('0') {
            return Err(IdentityError::InvalidDeviceCode(s.to_string()));
        }
        Ok(Self(s.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("device code must be eight digits, got '{0}'")]
    InvalidDeviceCode(String),
}

/// What a device advertises about itself during the post-connect handshake.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub user_id: String,
    pub device_code: DeviceCode,
    pub device_name: String,
}

impl DeviceIdentity {
    pub fn new(user_id: impl Into<String>, device_name: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let device_code = DeviceCode::derive(&user_id);
        Self {
            user_id,
            device_code,
            device_name: device_name.into(),
        }
    }

    pub fn device_code(&self) -> &DeviceCode {
        &self.device_code
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_stable() {
        let a = DeviceCode::derive("user-314159");
        let b = DeviceCode::derive("user-314159");
        assert_eq!(a, b);
    }

    #[test]
    fn derived_codes_are_eight_digits_in_range() {
        for user in ["", "a", "user-1", "some much longer identifier value"] {
            let code = DeviceCode::derive(user);
            assert_eq!(code.as_str().len(), 8, "code for {user:?}");
            let numeric: u64 = code.as_str().parse().unwrap();
            assert!((10_000_000..=99_999_999).contains(&numeric));
        }
    }

    #[test]
    fn distinct_users_get_distinct_codes() {
        assert_ne!(DeviceCode::derive("alice"), DeviceCode::derive("bob"));
    }

    #[test]
    fn parse_rejects_malformed_codes() {
        assert!("1234567".parse::<DeviceCode>().is_err());
        assert!("123456789".parse::<DeviceCode>().is_err());
        assert!("12a45678".parse::<DeviceCode>().is_err());
        assert!("01234567".parse::<DeviceCode>().is_err());
        assert!("81234567".parse::<DeviceCode>().is_ok());
    }
}
