use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecryptionError {
    #[error("credential is empty")]
    Empty,

    #[error("unsupported credential envelope: {0}")]
    UnsupportedEnvelope(String),

    #[error("credential payload is not valid base64: {0}")]
    InvalidEncoding(#[from] base64::DecodeError),

    #[error("credential payload is not UTF-8")]
    InvalidUtf8,
}

/// Turns a stored credential ciphertext back into the agent private key.
pub trait CredentialVault: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptionError>;
}

/// Development vault: credentials stored as `b64:<base64 of the secret>`.
///
/// Real deployments plug their KMS-backed implementation in behind
/// [`CredentialVault`].
#[derive(Debug, Default, Clone)]
pub struct EnvelopeVault;

impl EnvelopeVault {
    const PREFIX: &'static str = "b64:";

    pub fn seal(secret: &str) -> String {
        format!("{}{}", Self::PREFIX, STANDARD.encode(secret.as_bytes()))
    }
}

impl CredentialVault for EnvelopeVault {
    fn decrypt(&self, ciphertext: &str) -> Result<String, DecryptionError> {
        let ciphertext = ciphertext.trim();
        if ciphertext.is_empty() {
            return Err(DecryptionError::Empty);
        }
        let Some(payload) = ciphertext.strip_prefix(Self::PREFIX) else {
            let scheme = ciphertext.split(':').next().unwrap_or_default();
            return Err(DecryptionError::UnsupportedEnvelope(scheme.to_string()));
        };
        let bytes = STANDARD.decode(payload)?;
        String::from_utf8(bytes).map_err(|_| DecryptionError::InvalidUtf8)
    }
}
