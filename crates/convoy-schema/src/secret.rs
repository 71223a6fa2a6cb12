use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A secret as it is stored: ciphertext plus the vault that can open it.
///
/// There is no plaintext form of this type. Code that needs the value must
/// go through [`Vault::decrypt`], which returns a [`Secret`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultSecret {
    pub ciphertext: String,
    pub vault_id: String,
}

impl VaultSecret {
    pub fn new(ciphertext: impl Into<String>, vault_id: impl Into<String>) -> Self {
        Self {
            ciphertext: ciphertext.into(),
            vault_id: vault_id.into(),
        }
    }
}

/// Decrypted secret material. `Debug` and `Display` never print the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault '{vault_id}' could not decrypt secret: {reason}")]
    Decrypt { vault_id: String, reason: String },
    #[error("no vault configured to decrypt secrets from '{0}'")]
    Unavailable(String),
}

/// External decryption service.
pub trait Vault: Send + Sync {
    fn decrypt(&self, secret: &VaultSecret) -> Result<Secret, VaultError>;
}

/// Vault that returns ciphertext unchanged. Useful for fleets whose
/// secrets are already stored in clear and for tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughVault;

impl Vault for PassthroughVault {
    fn decrypt(&self, secret: &VaultSecret) -> Result<Secret, VaultError> {
        Ok(Secret::new(secret.ciphertext.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_debug_is_redacted() {
        let s = Secret::new("hunter2");
        assert_eq!(format!("{s:?}"), "Secret(***)");
        assert_eq!(format!("{s}"), "***");
        assert_eq!(s.expose(), "hunter2");
    }

    #[test]
    fn passthrough_returns_ciphertext() {
        let vault = PassthroughVault;
        let out = vault.decrypt(&VaultSecret::new("abc", "default")).unwrap();
        assert_eq!(out.expose(), "abc");
    }

    #[test]
    fn vault_secret_deserializes_from_toml() {
        let s: VaultSecret = toml::from_str("ciphertext = \"x\"\nvault_id = \"ops\"").unwrap();
        assert_eq!(s.vault_id, "ops");
    }
}
