//! SCRAM-SHA-1 / SCRAM-SHA-256 client (RFC 5802, RFC 7677).
//!
//! No channel binding (`n,,` GS2 header). Passwords are used as-is without
//! SASLprep, which matches what IRC services accept for ASCII passwords.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use sha2::{Digest, Sha256};

/// Highest iteration count accepted from a server; `Hi` runs inline on the
/// session task.
pub const MAX_ITERATIONS: u32 = 1_000_000;

/// Hash function backing a SCRAM exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScramHash {
    Sha1,
    Sha256,
}

impl ScramHash {
    pub fn mechanism(&self) -> &'static str {
        match self {
            Self::Sha1 => "SCRAM-SHA-1",
            Self::Sha256 => "SCRAM-SHA-256",
        }
    }

    fn hmac(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, String> {
        match self {
            Self::Sha1 => {
                let mut mac =
                    Hmac::<Sha1>::new_from_slice(key).map_err(|e| format!("hmac key: {e}"))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            Self::Sha256 => {
                let mut mac =
                    Hmac::<Sha256>::new_from_slice(key).map_err(|e| format!("hmac key: {e}"))?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
        }
    }

    fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(data).to_vec(),
            Self::Sha256 => Sha256::digest(data).to_vec(),
        }
    }

    /// `Hi(str, salt, i)`: PBKDF2 with HMAC as the PRF, one block.
    fn hi(&self, password: &[u8], salt: &[u8], iterations: u32) -> Result<Vec<u8>, String> {
        let mut block = salt.to_vec();
        block.extend_from_slice(&1u32.to_be_bytes());
        let mut u = self.hmac(password, &block)?;
        let mut out = u.clone();
        for _ in 1..iterations {
            u = self.hmac(password, &u)?;
            xor_in_place(&mut out, &u);
        }
        Ok(out)
    }
}

fn xor_in_place(acc: &mut [u8], other: &[u8]) {
    for (a, b) in acc.iter_mut().zip(other) {
        *a ^= b;
    }
}

/// `=` → `=3D`, `,` → `=2C`.
fn escape_username(name: &str) -> String {
    name.replace('=', "=3D").replace(',', "=2C")
}

enum State {
    Initial,
    ClientFirstSent { client_first_bare: String },
    ClientFinalSent { server_signature: Vec<u8> },
    Done,
}

/// Client side of one SCRAM exchange.
pub struct ScramClient {
    hash: ScramHash,
    username: String,
    password: String,
    client_nonce: String,
    state: State,
}

impl ScramClient {
    pub fn new(hash: ScramHash, username: &str, password: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::thread_rng().fill_bytes(&mut raw);
        Self::with_nonce(hash, username, password, &B64.encode(raw))
    }

    /// Fixed client nonce, for reproducible exchanges.
    pub fn with_nonce(hash: ScramHash, username: &str, password: &str, nonce: &str) -> Self {
        Self {
            hash,
            username: username.to_string(),
            password: password.to_string(),
            client_nonce: nonce.to_string(),
            state: State::Initial,
        }
    }

    pub fn hash(&self) -> ScramHash {
        self.hash
    }

    /// True once the server signature has been verified.
    pub fn is_done(&self) -> bool {
        matches!(self.state, State::Done)
    }

    /// `n,,n=<user>,r=<cnonce>`
    pub fn client_first(&mut self) -> String {
        let bare = format!(
            "n={},r={}",
            escape_username(&self.username),
            self.client_nonce
        );
        let msg = format!("n,,{bare}");
        self.state = State::ClientFirstSent {
            client_first_bare: bare,
        };
        msg
    }

    /// Consume server-first, return client-final.
    pub fn handle_server_first(&mut self, server_first: &str) -> Result<String, String> {
        let State::ClientFirstSent { client_first_bare } = &self.state else {
            return Err("unexpected server-first message".into());
        };

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = Some(v),
                Some(("m", _)) => return Err("unsupported mandatory extension".into()),
                Some(("e", v)) => return Err(format!("server error: {v}")),
                _ => {}
            }
        }
        let nonce = nonce.ok_or("server-first without nonce")?;
        let salt = salt.ok_or("server-first without salt")?;
        let iterations: u32 = iterations
            .ok_or("server-first without iteration count")?
            .parse()
            .map_err(|_| "invalid iteration count".to_string())?;
        if iterations == 0 {
            return Err("iteration count must be positive".into());
        }
        if iterations > MAX_ITERATIONS {
            return Err(format!("iteration count too large ({iterations})"));
        }
        if !nonce.starts_with(&self.client_nonce) || nonce.len() <= self.client_nonce.len() {
            return Err("server nonce does not extend client nonce".into());
        }
        let salt = B64
            .decode(salt)
            .map_err(|e| format!("invalid salt encoding: {e}"))?;

        let h = self.hash;
        let salted = h.hi(self.password.as_bytes(), &salt, iterations)?;
        let client_key = h.hmac(&salted, b"Client Key")?;
        let stored_key = h.digest(&client_key);
        let server_key = h.hmac(&salted, b"Server Key")?;

        // "biws" is base64("n,,").
        let without_proof = format!("c=biws,r={nonce}");
        let auth_message = format!("{client_first_bare},{server_first},{without_proof}");

        let client_signature = h.hmac(&stored_key, auth_message.as_bytes())?;
        let mut proof = client_key;
        xor_in_place(&mut proof, &client_signature);
        let server_signature = h.hmac(&server_key, auth_message.as_bytes())?;

        self.state = State::ClientFinalSent { server_signature };
        Ok(format!("{without_proof},p={}", B64.encode(proof)))
    }

    /// Verify server-final (`v=<signature>`).
    pub fn handle_server_final(&mut self, server_final: &str) -> Result<(), String> {
        let State::ClientFinalSent { server_signature } = &self.state else {
            return Err("unexpected server-final message".into());
        };
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(format!("server error: {err}"));
        }
        let Some(v) = server_final
            .split(',')
            .find_map(|attr| attr.strip_prefix("v="))
        else {
            return Err("server-final without verifier".into());
        };
        let received = B64
            .decode(v)
            .map_err(|e| format!("invalid verifier encoding: {e}"))?;
        if &received != server_signature {
            return Err("server signature mismatch".into());
        }
        self.state = State::Done;
        Ok(())
    }

    /// Drive the exchange from a decoded server payload.
    pub fn step(&mut self, challenge: &[u8]) -> Result<Vec<u8>, String> {
        match self.state {
            State::Initial => Ok(self.client_first().into_bytes()),
            State::ClientFirstSent { .. } => {
                let text = std::str::from_utf8(challenge)
                    .map_err(|_| "server-first is not UTF-8".to_string())?;
                self.handle_server_first(text).map(String::into_bytes)
            }
            State::ClientFinalSent { .. } => {
                let text = std::str::from_utf8(challenge)
                    .map_err(|_| "server-final is not UTF-8".to_string())?;
                self.handle_server_final(text)?;
                Ok(Vec::new())
            }
            State::Done => Err("exchange already complete".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc5802_sha1_vector() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(c.client_first(), "n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        let final_msg = c
            .handle_server_first(
                "r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096",
            )
            .unwrap();
        assert_eq!(
            final_msg,
            "c=biws,r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="
        );
        c.handle_server_final("v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap();
        assert!(c.is_done());
    }

    #[test]
    fn rfc7677_sha256_vector() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha256, "user", "pencil", "rOprNGfwEbeRWgbNEkqO");
        assert_eq!(c.client_first(), "n,,n=user,r=rOprNGfwEbeRWgbNEkqO");
        let final_msg = c
            .handle_server_first(
                "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
            )
            .unwrap();
        assert_eq!(
            final_msg,
            "c=biws,r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,p=dHzbZapWIk4jUhN+Ute9ytag9zjfMHgsqmmiz7AndVQ="
        );
        c.handle_server_final("v=6rriTRBi23WpRR/wtup+mMhUZUn/dB5nLTJRsjl95G4=")
            .unwrap();
    }

    #[test]
    fn wrong_server_signature_fails() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha256, "user", "pencil", "rOprNGfwEbeRWgbNEkqO");
        c.client_first();
        c.handle_server_first(
            "r=rOprNGfwEbeRWgbNEkqO%hvYDpWUa2RaTCAfuxFIlj)hNlF$k0,s=W22ZaJ0SNY7soEsUEjb6gQ==,i=4096",
        )
        .unwrap();
        let err = c
            .handle_server_final("v=AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=")
            .unwrap_err();
        assert!(err.contains("mismatch"));
        assert!(!c.is_done());
    }

    #[test]
    fn rejects_nonce_not_extending_ours() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "abc");
        c.client_first();
        assert!(c.handle_server_first("r=xyz123,s=QSXCR+Q6sek8bf92,i=4096").is_err());
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "abc");
        c.client_first();
        assert!(c.handle_server_first("r=abc,s=QSXCR+Q6sek8bf92,i=4096").is_err());
    }

    #[test]
    fn rejects_excessive_iteration_count() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha256, "user", "pencil", "abc");
        c.client_first();
        let err = c
            .handle_server_first("r=abcXYZ,s=QSXCR+Q6sek8bf92,i=4294967295")
            .unwrap_err();
        assert!(err.contains("too large"), "{err}");

        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "abc");
        c.client_first();
        let over = format!("r=abcXYZ,s=QSXCR+Q6sek8bf92,i={}", MAX_ITERATIONS + 1);
        assert!(c.handle_server_first(&over).is_err());
        assert!(!c.is_done());
    }

    #[test]
    fn escapes_username() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "a=b,c", "pw", "n");
        assert_eq!(c.client_first(), "n,,n=a=3Db=2Cc,r=n");
    }

    #[test]
    fn step_drives_full_exchange() {
        let mut c = ScramClient::with_nonce(ScramHash::Sha1, "user", "pencil", "fyko+d2lbbFgONRv9qkxdawL");
        assert_eq!(c.step(b"").unwrap(), b"n,,n=user,r=fyko+d2lbbFgONRv9qkxdawL");
        let fin = c
            .step(b"r=fyko+d2lbbFgONRv9qkxdawL3rfcNHYJY1ZVvWVs7j,s=QSXCR+Q6sek8bf92,i=4096")
            .unwrap();
        assert!(fin.ends_with(b"p=v0X8v3Bz2T0CJGbJQyF0X+HI4Ts="));
        assert!(c.step(b"v=rmF9pqV8S7suAoZWja4dJRkFsKQ=").unwrap().is_empty());
        assert!(c.step(b"").is_err());
    }

    #[test]
    fn random_nonces_differ() {
        let mut a = ScramClient::new(ScramHash::Sha256, "u", "p");
        let mut b = ScramClient::new(ScramHash::Sha256, "u", "p");
        assert_ne!(a.client_first(), b.client_first());
    }
}
