//! Client-side SASL over `AUTHENTICATE`.
//!
//! A [`SaslSession`] lives for one connection attempt. It resolves the
//! configured mechanism, reassembles chunked server payloads, runs the
//! mechanism step and frames the response into `AUTHENTICATE` lines.

pub mod challenge;
pub mod scram;

use std::fmt;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as B64;
use serde::{Deserialize, Serialize};

use crate::config::SaslConfig;
use crate::error::{Error, Result};

use self::challenge::{ChallengeMechanism, P256Signer};
use self::scram::{ScramClient, ScramHash};

/// Maximum base64 bytes per `AUTHENTICATE` line.
pub const CHUNK_SIZE: usize = 400;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "PLAIN", alias = "plain")]
    Plain,
    #[serde(rename = "EXTERNAL", alias = "external")]
    External,
    #[serde(rename = "SCRAM-SHA-1", alias = "scram-sha-1")]
    ScramSha1,
    #[serde(rename = "SCRAM-SHA-256", alias = "scram-sha-256")]
    ScramSha256,
    #[serde(rename = "ECDSA-NIST256P-CHALLENGE", alias = "ecdsa-nist256p-challenge")]
    EcdsaNist256pChallenge,
    /// Pick from what the server offers.
    #[default]
    #[serde(rename = "AUTO", alias = "auto")]
    Auto,
}

impl SaslMechanism {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::Plain => "PLAIN",
            Self::External => "EXTERNAL",
            Self::ScramSha1 => "SCRAM-SHA-1",
            Self::ScramSha256 => "SCRAM-SHA-256",
            Self::EcdsaNist256pChallenge => "ECDSA-NIST256P-CHALLENGE",
            Self::Auto => "AUTO",
        }
    }

    /// Reject configs that cannot possibly authenticate.
    pub fn check_config(&self, config: &SaslConfig) -> std::result::Result<(), String> {
        let has_password = config.password.as_deref().is_some_and(|p| !p.is_empty());
        match self {
            Self::Plain | Self::ScramSha1 | Self::ScramSha256 if !has_password => {
                Err(format!("{} requires a password", self.wire_name()))
            }
            Self::EcdsaNist256pChallenge if config.key.is_none() => {
                Err("ECDSA-NIST256P-CHALLENGE requires a key".into())
            }
            _ if config.account.is_empty() && *self != Self::External && *self != Self::Auto => {
                Err("SASL account must not be empty".into())
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Split a mechanism list (`sasl=` cap value or 908 param) into names.
pub fn parse_mechanism_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|m| m.trim().to_ascii_uppercase())
        .filter(|m| !m.is_empty())
        .collect()
}

/// Resolve `Auto` against the server's offered mechanisms.
///
/// EXTERNAL when no secret is configured; otherwise the strongest of
/// SCRAM-SHA-256, SCRAM-SHA-1 and PLAIN that the server lists. With no list
/// (or no overlap) this falls back to PLAIN.
pub fn select_mechanism(config: &SaslConfig, offered: Option<&[String]>) -> SaslMechanism {
    if config.mechanism != SaslMechanism::Auto {
        return config.mechanism;
    }
    if !config.has_secret() {
        return SaslMechanism::External;
    }
    if !config.password.as_deref().is_some_and(|p| !p.is_empty()) {
        return SaslMechanism::EcdsaNist256pChallenge;
    }
    let Some(offered) = offered.filter(|o| !o.is_empty()) else {
        return SaslMechanism::Plain;
    };
    [
        SaslMechanism::ScramSha256,
        SaslMechanism::ScramSha1,
        SaslMechanism::Plain,
    ]
    .into_iter()
    .find(|m| offered.iter().any(|o| o.eq_ignore_ascii_case(m.wire_name())))
    .unwrap_or(SaslMechanism::Plain)
}

/// Frame a response payload as `AUTHENTICATE` lines.
///
/// Empty payloads are sent as `+`. A trailing `+` follows when the last
/// chunk is exactly [`CHUNK_SIZE`] bytes.
pub fn encode_chunks(payload: &[u8]) -> Vec<String> {
    if payload.is_empty() {
        return vec!["AUTHENTICATE +".to_string()];
    }
    let encoded = B64.encode(payload);
    let mut lines = Vec::with_capacity(encoded.len() / CHUNK_SIZE + 1);
    let mut start = 0;
    while start < encoded.len() {
        let end = (start + CHUNK_SIZE).min(encoded.len());
        lines.push(format!("AUTHENTICATE {}", &encoded[start..end]));
        start = end;
    }
    if encoded.len() % CHUNK_SIZE == 0 {
        lines.push("AUTHENTICATE +".to_string());
    }
    lines
}

enum Mechanism {
    Plain { account: String, password: String },
    External,
    Scram(ScramClient),
    Challenge(ChallengeMechanism),
}

impl Mechanism {
    fn step(&mut self, challenge: &[u8]) -> std::result::Result<Vec<u8>, String> {
        match self {
            // authzid, authcid and password, NUL separated.
            Self::Plain { account, password } => {
                Ok(format!("{account}\0{account}\0{password}").into_bytes())
            }
            Self::External => Ok(Vec::new()),
            Self::Scram(client) => client.step(challenge),
            Self::Challenge(mech) => mech.step(challenge),
        }
    }
}

/// Result of feeding one `AUTHENTICATE` line.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SaslOutput {
    pub lines: Vec<String>,
    /// Set when the mechanism failed locally and `AUTHENTICATE *` was sent.
    pub aborted: Option<String>,
}

/// One SASL exchange.
pub struct SaslSession {
    mechanism: SaslMechanism,
    inner: Mechanism,
    inbound: String,
    terminal: bool,
}

impl SaslSession {
    /// Build the session for `config`, resolving `Auto` against `offered`.
    pub fn start(config: &SaslConfig, offered: Option<&[String]>) -> Result<Self> {
        let mechanism = select_mechanism(config, offered);
        let password = config.password.clone().unwrap_or_default();
        let inner = match mechanism {
            SaslMechanism::Plain => Mechanism::Plain {
                account: config.account.clone(),
                password,
            },
            SaslMechanism::External => Mechanism::External,
            SaslMechanism::ScramSha1 => {
                Mechanism::Scram(ScramClient::new(ScramHash::Sha1, &config.account, &password))
            }
            SaslMechanism::ScramSha256 => {
                Mechanism::Scram(ScramClient::new(ScramHash::Sha256, &config.account, &password))
            }
            SaslMechanism::EcdsaNist256pChallenge => {
                let key = config
                    .key
                    .as_deref()
                    .ok_or_else(|| Error::Sasl("no challenge key configured".into()))?;
                let signer = P256Signer::from_hex(&config.account, key)?;
                Mechanism::Challenge(ChallengeMechanism::new(Box::new(signer)))
            }
            SaslMechanism::Auto => {
                return Err(Error::Sasl("mechanism selection did not resolve".into()));
            }
        };
        tracing::debug!(mechanism = %mechanism, "SASL session started");
        Ok(Self {
            mechanism,
            inner,
            inbound: String::new(),
            terminal: false,
        })
    }

    /// Start with a pre-built SCRAM client (fixed nonce).
    pub fn with_scram(client: ScramClient) -> Self {
        let mechanism = match client.hash() {
            ScramHash::Sha1 => SaslMechanism::ScramSha1,
            ScramHash::Sha256 => SaslMechanism::ScramSha256,
        };
        Self {
            mechanism,
            inner: Mechanism::Scram(client),
            inbound: String::new(),
            terminal: false,
        }
    }

    pub fn mechanism(&self) -> SaslMechanism {
        self.mechanism
    }

    /// `AUTHENTICATE <MECHANISM>`
    pub fn initial_line(&self) -> String {
        format!("AUTHENTICATE {}", self.mechanism.wire_name())
    }

    /// False while a SCRAM server signature is still unverified.
    pub fn verified(&self) -> bool {
        match self.inner {
            Mechanism::Scram(ref client) => client.is_done(),
            _ => true,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// Mark the exchange finished (success or failure numeric seen).
    pub fn finish(&mut self) {
        self.terminal = true;
        self.inbound.clear();
    }

    /// Feed the parameter of one inbound `AUTHENTICATE` line.
    pub fn on_authenticate(&mut self, param: &str) -> SaslOutput {
        if self.terminal {
            return SaslOutput::default();
        }
        if param != "+" {
            self.inbound.push_str(param);
            if param.len() == CHUNK_SIZE {
                return SaslOutput::default();
            }
        }
        let encoded = std::mem::take(&mut self.inbound);
        let challenge = match B64.decode(encoded.as_bytes()) {
            Ok(c) => c,
            Err(e) => return self.abort(format!("invalid base64 from server: {e}")),
        };
        match self.inner.step(&challenge) {
            Ok(response) => SaslOutput {
                lines: encode_chunks(&response),
                aborted: None,
            },
            Err(reason) => self.abort(reason),
        }
    }

    fn abort(&mut self, reason: String) -> SaslOutput {
        tracing::warn!(mechanism = %self.mechanism, %reason, "Aborting SASL mechanism");
        self.terminal = true;
        SaslOutput {
            lines: vec!["AUTHENTICATE *".to_string()],
            aborted: Some(reason),
        }
    }
}
