//! Public-key challenge signing (ECDSA-NIST256P-CHALLENGE).
//!
//! The client sends its account name, the server replies with random
//! challenge bytes, and the client answers with a signature over them.

use p256::ecdsa::signature::Signer;
use p256::ecdsa::{Signature, SigningKey};

use crate::error::{Error, Result};

/// Signs SASL challenges on behalf of an account.
pub trait ChallengeSigner: Send + Sync {
    /// Account name sent in the first step.
    fn account(&self) -> &str;

    /// Produce the response bytes for a server challenge.
    fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>>;
}

/// NIST P-256 key, DER-encoded signatures.
pub struct P256Signer {
    account: String,
    key: SigningKey,
}

impl P256Signer {
    pub fn new(account: &str, key: SigningKey) -> Self {
        Self {
            account: account.to_string(),
            key,
        }
    }

    /// Key given as hex of the 32-byte private scalar.
    pub fn from_hex(account: &str, hex_key: &str) -> Result<Self> {
        let bytes = hex::decode(hex_key.trim())
            .map_err(|e| Error::Sasl(format!("challenge key is not hex: {e}")))?;
        let key = SigningKey::from_slice(&bytes)
            .map_err(|e| Error::Sasl(format!("invalid P-256 key: {e}")))?;
        Ok(Self::new(account, key))
    }

    /// SEC1 compressed public key, hex. This is what gets registered with
    /// services.
    pub fn public_key_hex(&self) -> String {
        let point = self.key.verifying_key().to_encoded_point(true);
        hex::encode(point.as_bytes())
    }
}

impl ChallengeSigner for P256Signer {
    fn account(&self) -> &str {
        &self.account
    }

    fn sign(&self, challenge: &[u8]) -> Result<Vec<u8>> {
        let sig: Signature = self.key.sign(challenge);
        Ok(sig.to_der().as_bytes().to_vec())
    }
}

/// Two-step mechanism state around a [`ChallengeSigner`].
pub struct ChallengeMechanism {
    signer: Box<dyn ChallengeSigner>,
    sent_account: bool,
}

impl ChallengeMechanism {
    pub fn new(signer: Box<dyn ChallengeSigner>) -> Self {
        Self {
            signer,
            sent_account: false,
        }
    }

    pub fn step(&mut self, challenge: &[u8]) -> std::result::Result<Vec<u8>, String> {
        if !self.sent_account {
            self.sent_account = true;
            return Ok(self.signer.account().as_bytes().to_vec());
        }
        if challenge.is_empty() {
            return Err("empty challenge".into());
        }
        self.signer.sign(challenge).map_err(|e| e.to_string())
    }
}
