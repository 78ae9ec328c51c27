//! Password gate for privileged picker actions.

use alloc::vec::Vec;

use subtle::ConstantTimeEq;
use tracing::{info, warn};
use zeroize::Zeroize;

use crate::config::misc::SecurityConfig;
use crate::firmware::BootPicker;

/// Prompts allowed before a privileged action is refused.
pub const MAX_PASSWORD_ATTEMPTS: u32 = 3;

/// Chained blake3 rounds per password digest.
pub const PASSWORD_HASH_ROUNDS: u32 = 4096;

const PASSWORD_CONTEXT: &str = "chrysalis 2026-10 privileged picker password";

/// Salted password digest the picker checks against.
pub struct PrivilegeContext {
    salt: Vec<u8>,
    hash: [u8; blake3::OUT_LEN],
}

/// Stretched password digest.
///
/// The first round derives a key from `salt || password` under a fixed
/// context string. Each further round keys blake3 with the previous digest
/// and hashes `salt || password` again, so an offline guess costs
/// [`PASSWORD_HASH_ROUNDS`] hashes.
pub fn hash_password(salt: &[u8], password: &[u8]) -> [u8; blake3::OUT_LEN] {
    let mut hasher = blake3::Hasher::new_derive_key(PASSWORD_CONTEXT);
    hasher.update(salt);
    hasher.update(password);
    let mut digest = *hasher.finalize().as_bytes();
    for _ in 1..PASSWORD_HASH_ROUNDS {
        let mut round = blake3::Hasher::new_keyed(&digest);
        round.update(salt);
        round.update(password);
        digest.zeroize();
        digest = *round.finalize().as_bytes();
    }
    digest
}

impl PrivilegeContext {
    /// Context accepting `password`.
    pub fn new(salt: &[u8], password: &[u8]) -> Self {
        Self {
            salt: salt.to_vec(),
            hash: hash_password(salt, password),
        }
    }

    /// Context described by `Misc.Security`, if a password is enabled.
    pub fn from_config(security: &SecurityConfig) -> Option<Self> {
        if !security.enable_password {
            return None;
        }
        let hash = security.password_hash.as_slice().try_into().ok()?;
        Some(Self {
            salt: security.password_salt.clone(),
            hash,
        })
    }

    /// Constant-time password check.
    pub fn verify(&self, password: &[u8]) -> bool {
        let mut candidate = hash_password(&self.salt, password);
        let matches = bool::from(candidate[..].ct_eq(&self.hash[..]));
        candidate.zeroize();
        matches
    }

    /// Prompt through `picker` until the password matches or attempts run out.
    pub fn authorize(&self, picker: &mut dyn BootPicker) -> bool {
        for attempt in 1..=MAX_PASSWORD_ATTEMPTS {
            let password = match picker.read_password() {
                Some(password) => password,
                None => return false,
            };
            if self.verify(password.as_bytes()) {
                info!(attempt, "privileged action authorized");
                return true;
            }
            warn!(attempt, "wrong password");
        }
        false
    }
}

impl Drop for PrivilegeContext {
    fn drop(&mut self) {
        self.salt.zeroize();
        self.hash.zeroize();
    }
}
