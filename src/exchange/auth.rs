use ed25519_dalek::{Signer, SigningKey};
use serde_json::{json, Value};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("private key is not valid base58: {0}")]
    InvalidEncoding(#[from] bs58::decode::Error),

    #[error("private key must be 32 or 64 bytes, got {0}")]
    InvalidLength(usize),

    #[error("keypair bytes are inconsistent: {0}")]
    InvalidKeypair(String),

    #[error("failed to serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Agent key that signs trading actions on behalf of a copier account.
///
/// The exchange verifies the signature against `agent_wallet` and checks that
/// the agent has been authorized by `account`.
#[derive(Clone)]
pub struct AgentSigner {
    key: SigningKey,
    agent_wallet: String,
}

impl std::fmt::Debug for AgentSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSigner")
            .field("agent_wallet", &self.agent_wallet)
            .finish_non_exhaustive()
    }
}

impl AgentSigner {
    /// Load a key from base58 text holding either a 32-byte seed or a
    /// 64-byte keypair (seed followed by public key).
    pub fn from_base58(secret: &str) -> Result<Self, AuthError> {
        let bytes = bs58::decode(secret.trim()).into_vec()?;
        let key = match bytes.len() {
            32 => {
                let mut seed = [0u8; 32];
                seed.copy_from_slice(&bytes);
                SigningKey::from_bytes(&seed)
            }
            64 => {
                let mut pair = [0u8; 64];
                pair.copy_from_slice(&bytes);
                SigningKey::from_keypair_bytes(&pair)
                    .map_err(|e| AuthError::InvalidKeypair(e.to_string()))?
            }
            n => return Err(AuthError::InvalidLength(n)),
        };
        Ok(Self::from_signing_key(key))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let agent_wallet = bs58::encode(key.verifying_key().to_bytes()).into_string();
        Self { key, agent_wallet }
    }

    /// Base58 public key of the agent.
    pub fn agent_wallet(&self) -> &str {
        &self.agent_wallet
    }

    /// Sign a trading action.
    ///
    /// The signed message is the canonical form of
    /// `{timestamp, expiry_window, type, data}`. Returns the base58 signature.
    pub fn sign_action(
        &self,
        action_type: &str,
        timestamp: i64,
        expiry_window: u64,
        data: &Value,
    ) -> Result<String, AuthError> {
        let message = json!({
            "timestamp": timestamp,
            "expiry_window": expiry_window,
            "type": action_type,
            "data": data,
        });
        let text = canonical_json(&message)?;
        let signature = self.key.sign(text.as_bytes());
        Ok(bs58::encode(signature.to_bytes()).into_string())
    }
}

/// Serialize a JSON value with every object's keys sorted, recursively, and
/// no insignificant whitespace. Array order is preserved; each element is
/// canonicalized in place.
pub fn canonical_json(value: &Value) -> Result<String, AuthError> {
    let mut out = String::new();
    write_canonical(value, &mut out)?;
    Ok(out)
}

// Writes keys in sorted order even if serde_json is built with preserve_order.
fn write_canonical(value: &Value, out: &mut String) -> Result<(), AuthError> {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (k, v)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&serde_json::to_string(k)?);
                out.push(':');
                write_canonical(v, out)?;
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, v) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(v, out)?;
            }
            out.push(']');
        }
        scalar => out.push_str(&serde_json::to_string(scalar)?),
    }
    Ok(())
}
