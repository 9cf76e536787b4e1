use crate::pairing::PairingTokenSource;
use rand::Rng;
use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use std::fmt;
use thiserror::Error;

pub const DEFAULT_PASSWORD_LENGTH: usize = 7;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("password length must be at least 1")]
    EmptyPassword,
    #[error("pairing token source produced an empty token")]
    EmptyToken,
}

/// One-time credential that lets a peer join the recovery network.
#[derive(Clone, PartialEq, Eq)]
pub struct PairingToken(String);

impl PairingToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PairingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PairingToken")
            .field(&format_args!("<{} bytes>", self.0.len()))
            .finish()
    }
}

/// Shared secret for the remote shell. Never persisted.
#[derive(Clone, PartialEq, Eq)]
pub struct ShellPassword(String);

impl ShellPassword {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for ShellPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShellPassword(<redacted>)")
    }
}

impl fmt::Display for ShellPassword {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn generate_pairing_token(
    source: &dyn PairingTokenSource,
) -> Result<PairingToken, CredentialError> {
    let token = source.generate();
    if token.as_str().is_empty() {
        return Err(CredentialError::EmptyToken);
    }
    Ok(token)
}

pub fn generate_shell_password(length: usize) -> Result<ShellPassword, CredentialError> {
    if length == 0 {
        return Err(CredentialError::EmptyPassword);
    }
    let value: String = OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect();
    Ok(ShellPassword(value))
}
