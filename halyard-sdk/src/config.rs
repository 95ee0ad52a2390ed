//! Engine configuration.
//!
//! Loaded from TOML. Every section has defaults, so a file only needs its
//! `[[servers]]` entries:
//!
//! ```toml
//! [[servers]]
//! id = "libera"
//! host = "irc.libera.chat"
//! nick = "halyard"
//!
//! [servers.sasl]
//! account = "halyard"
//! password = "hunter2"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::ServerId;
use crate::sasl::SaslMechanism;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub liveness: LivenessConfig,
    #[serde(default)]
    pub correlation: CorrelationConfig,
    /// JSON file holding secure-transport policies. In-memory when unset.
    #[serde(default)]
    pub sts_store: Option<PathBuf>,
}

/// One IRC network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub id: ServerId,
    pub host: String,
    /// Defaults to 6697 with TLS, 6667 without.
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_true")]
    pub tls: bool,
    /// Skip TLS certificate verification (for self-signed certs).
    #[serde(default)]
    pub tls_insecure: bool,
    /// PEM client certificate chain, for CertFP / SASL EXTERNAL.
    #[serde(default)]
    pub client_cert: Option<PathBuf>,
    /// PEM private key matching `client_cert`.
    #[serde(default)]
    pub client_key: Option<PathBuf>,
    pub nick: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub realname: Option<String>,
    /// Server password (PASS).
    #[serde(default)]
    pub password: Option<String>,
    /// Replaces the default desired capability set.
    #[serde(default)]
    pub caps: Option<Vec<String>>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default = "default_quit_message")]
    pub quit_message: String,
}

impl ServerConfig {
    pub fn new(id: impl Into<ServerId>, host: &str, nick: &str) -> Self {
        Self {
            id: id.into(),
            host: host.to_string(),
            port: None,
            tls: true,
            tls_insecure: false,
            client_cert: None,
            client_key: None,
            nick: nick.to_string(),
            user: None,
            realname: None,
            password: None,
            caps: None,
            sasl: None,
            quit_message: default_quit_message(),
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 6697 } else { 6667 })
    }

    pub fn username(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.nick)
    }

    pub fn realname(&self) -> &str {
        self.realname.as_deref().unwrap_or(&self.nick)
    }
}

/// SASL credentials for one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    #[serde(default)]
    pub mechanism: SaslMechanism,
    pub account: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Hex-encoded P-256 private key for ECDSA-NIST256P-CHALLENGE.
    #[serde(default)]
    pub key: Option<String>,
    /// Close the connection and skip the next reconnect when SASL fails.
    #[serde(default)]
    pub fatal_on_failure: bool,
}

impl SaslConfig {
    /// True when a password or key is configured.
    pub fn has_secret(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
            || self.key.as_deref().is_some_and(|k| !k.is_empty())
    }
}

/// Backoff parameters for automatic reconnection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay used as ± jitter, in `[0, 1)`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Give up after this many consecutive attempts. Unlimited when unset.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Heartbeat settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LivenessConfig {
    #[serde(default = "default_tick_secs")]
    pub tick_secs: u64,
    /// Send a keepalive PING after this much inbound silence.
    #[serde(default = "default_ping_after_secs")]
    pub ping_after_secs: u64,
    /// Force-close after this much inbound silence.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Upper bound on a graceful QUIT before the socket is dropped.
    #[serde(default = "default_goodbye_timeout_ms")]
    pub goodbye_timeout_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            tick_secs: default_tick_secs(),
            ping_after_secs: default_ping_after_secs(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            goodbye_timeout_ms: default_goodbye_timeout_ms(),
        }
    }
}

impl LivenessConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs)
    }

    pub fn ping_after(&self) -> Duration {
        Duration::from_secs(self.ping_after_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn goodbye_timeout(&self) -> Duration {
        Duration::from_millis(self.goodbye_timeout_ms)
    }
}

/// Windows, TTLs and caps for the correlation layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationConfig {
    /// A labeled reply matches only within this window.
    #[serde(default = "default_label_window_ms")]
    pub label_window_ms: u64,
    /// Unmatched labels are reported as timed out after this.
    #[serde(default = "default_label_timeout_ms")]
    pub label_timeout_ms: u64,
    #[serde(default = "default_echo_timeout_ms")]
    pub echo_timeout_ms: u64,
    #[serde(default = "default_multiline_ttl_ms")]
    pub multiline_ttl_ms: u64,
    #[serde(default = "default_netsplit_window_ms")]
    pub netsplit_window_ms: u64,
    #[serde(default = "default_netsplit_cap")]
    pub netsplit_cap: usize,
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    #[serde(default = "default_history_max_age_secs")]
    pub history_max_age_secs: u64,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            label_window_ms: default_label_window_ms(),
            label_timeout_ms: default_label_timeout_ms(),
            echo_timeout_ms: default_echo_timeout_ms(),
            multiline_ttl_ms: default_multiline_ttl_ms(),
            netsplit_window_ms: default_netsplit_window_ms(),
            netsplit_cap: default_netsplit_cap(),
            history_capacity: default_history_capacity(),
            history_max_age_secs: default_history_max_age_secs(),
            sweep_interval_ms: default_sweep_interval_ms(),
        }
    }
}

impl CorrelationConfig {
    pub fn label_window(&self) -> Duration {
        Duration::from_millis(self.label_window_ms)
    }

    pub fn label_timeout(&self) -> Duration {
        Duration::from_millis(self.label_timeout_ms)
    }

    pub fn echo_timeout(&self) -> Duration {
        Duration::from_millis(self.echo_timeout_ms)
    }

    pub fn multiline_ttl(&self) -> Duration {
        Duration::from_millis(self.multiline_ttl_ms)
    }

    pub fn netsplit_window(&self) -> Duration {
        Duration::from_millis(self.netsplit_window_ms)
    }

    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

fn default_true() -> bool {
    true
}

fn default_quit_message() -> String {
    "halyard".to_string()
}

fn default_initial_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.2
}

fn default_tick_secs() -> u64 {
    5
}

fn default_ping_after_secs() -> u64 {
    60
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_goodbye_timeout_ms() -> u64 {
    2_000
}

fn default_label_window_ms() -> u64 {
    15_000
}

fn default_label_timeout_ms() -> u64 {
    30_000
}

fn default_echo_timeout_ms() -> u64 {
    30_000
}

fn default_multiline_ttl_ms() -> u64 {
    10_000
}

fn default_netsplit_window_ms() -> u64 {
    30_000
}

fn default_netsplit_cap() -> usize {
    256
}

fn default_history_capacity() -> usize {
    2_048
}

fn default_history_max_age_secs() -> u64 {
    600
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

impl EngineConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&text)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), servers = config.servers.len(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn server(&self, id: &ServerId) -> Option<&ServerConfig> {
        self.servers.iter().find(|s| &s.id == id)
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for s in &self.servers {
            if s.id.as_str().is_empty() {
                return Err(Error::Config("server id must not be empty".into()));
            }
            if !seen.insert(s.id.clone()) {
                return Err(Error::Config(format!("duplicate server id {}", s.id)));
            }
            if s.host.trim().is_empty() {
                return Err(Error::Config(format!("server {} has no host", s.id)));
            }
            if s.nick.trim().is_empty() || s.nick.contains(' ') {
                return Err(Error::Config(format!("server {} has an invalid nick", s.id)));
            }
            if s.client_cert.is_some() != s.client_key.is_some() {
                return Err(Error::Config(format!(
                    "server {}: client_cert and client_key must be set together",
                    s.id
                )));
            }
            if let Some(ref sasl) = s.sasl {
                sasl.mechanism.check_config(sasl).map_err(|e| {
                    Error::Config(format!("server {}: {e}", s.id))
                })?;
            }
        }

        let r = &self.reconnect;
        if r.initial_delay_ms == 0 || r.max_delay_ms < r.initial_delay_ms {
            return Err(Error::Config(
                "reconnect delays must satisfy 0 < initial_delay_ms <= max_delay_ms".into(),
            ));
        }
        if r.multiplier.is_nan() || r.multiplier < 1.0 {
            return Err(Error::Config("reconnect multiplier must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&r.jitter) {
            return Err(Error::Config("reconnect jitter must be in [0, 1)".into()));
        }

        let l = &self.liveness;
        if l.tick_secs == 0 || l.timeout_secs <= l.ping_after_secs {
            return Err(Error::Config(
                "liveness requires tick_secs > 0 and timeout_secs > ping_after_secs".into(),
            ));
        }

        let c = &self.correlation;
        if c.label_timeout_ms <= c.label_window_ms {
            return Err(Error::Config(
                "label_timeout_ms must be longer than label_window_ms".into(),
            ));
        }
        if c.sweep_interval_ms == 0 || c.netsplit_cap < 2 || c.history_capacity == 0 {
            return Err(Error::Config(
                "correlation sweep interval and caps must be positive".into(),
            ));
        }
        Ok(())
    }
}
