//! Strict Transport Security (STS) policy cache.
//!
//! A server advertises `sts=duration=N[,port=P][,preload]` in its capability
//! list. Over a secure session the policy is stored per host; later
//! connections to that host are forced onto TLS. Observations over plain
//! connections are ignored. Expired entries are evicted when looked up.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Endpoint;

/// A stored secure-transport policy for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StsPolicy {
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub preload: bool,
    /// Value as advertised, for diagnostics.
    pub raw: String,
}

impl StsPolicy {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Persistent backing for policies. The cache is the only writer.
pub trait StsStore: Send + Sync {
    fn read_policies(&self) -> Result<HashMap<String, StsPolicy>>;
    fn remember_policy(&self, host: &str, policy: &StsPolicy) -> Result<()>;
    fn forget_policy(&self, host: &str) -> Result<()>;
}

/// Non-persistent store, for tests and embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStsStore {
    policies: Mutex<HashMap<String, StsPolicy>>,
}

impl MemoryStsStore {
    pub fn with_policies(policies: HashMap<String, StsPolicy>) -> Self {
        Self {
            policies: Mutex::new(policies),
        }
    }
}

impl StsStore for MemoryStsStore {
    fn read_policies(&self) -> Result<HashMap<String, StsPolicy>> {
        Ok(self.policies.lock().clone())
    }

    fn remember_policy(&self, host: &str, policy: &StsPolicy) -> Result<()> {
        self.policies.lock().insert(host.to_string(), policy.clone());
        Ok(())
    }

    fn forget_policy(&self, host: &str) -> Result<()> {
        self.policies.lock().remove(host);
        Ok(())
    }
}

/// JSON file store: the whole map is rewritten on every change.
#[derive(Debug)]
pub struct JsonStsStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonStsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_unlocked(&self) -> Result<HashMap<String, StsPolicy>> {
        match std::fs::read_to_string(&self.path) {
            Ok(text) if text.trim().is_empty() => Ok(HashMap::new()),
            Ok(text) => Ok(serde_json::from_str(&text)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_unlocked(&self, policies: &HashMap<String, StsPolicy>) -> Result<()> {
        if let Some(dir) = self.path.parent()
            && !dir.as_os_str().is_empty()
        {
            std::fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(policies)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl StsStore for JsonStsStore {
    fn read_policies(&self) -> Result<HashMap<String, StsPolicy>> {
        let _guard = self.lock.lock();
        self.read_unlocked()
    }

    fn remember_policy(&self, host: &str, policy: &StsPolicy) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read_unlocked()?;
        all.insert(host.to_string(), policy.clone());
        self.write_unlocked(&all)
    }

    fn forget_policy(&self, host: &str) -> Result<()> {
        let _guard = self.lock.lock();
        let mut all = self.read_unlocked()?;
        if all.remove(host).is_some() {
            self.write_unlocked(&all)?;
        }
        Ok(())
    }
}

// ── Parsing ────────────────────────────────────────────────────────

/// Parsed attributes of an `sts=` capability value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StsValue {
    pub duration: Option<u64>,
    pub port: Option<u16>,
    pub preload: bool,
}

/// Parse `key[=value],...`. Unknown keys are ignored.
pub fn parse_sts_value(value: &str) -> Result<StsValue> {
    let mut out = StsValue {
        duration: None,
        port: None,
        preload: false,
    };
    for attr in value.split(',').map(str::trim).filter(|a| !a.is_empty()) {
        let (key, val) = match attr.split_once('=') {
            Some((k, v)) => (k, Some(v)),
            None => (attr, None),
        };
        match key.to_ascii_lowercase().as_str() {
            "duration" => {
                let v = val.ok_or_else(|| Error::Config("sts duration without value".into()))?;
                let secs = v
                    .parse::<u64>()
                    .map_err(|_| Error::Config(format!("invalid sts duration {v:?}")))?;
                out.duration = Some(secs);
            }
            "port" => {
                let v = val.ok_or_else(|| Error::Config("sts port without value".into()))?;
                let port = v
                    .parse::<u16>()
                    .ok()
                    .filter(|p| *p != 0)
                    .ok_or_else(|| Error::Config(format!("invalid sts port {v:?}")))?;
                out.port = Some(port);
            }
            "preload" => out.preload = true,
            _ => {}
        }
    }
    Ok(out)
}

/// What the cache did with an observed `sts=` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StsObservation {
    Stored(StsPolicy),
    Removed,
    /// Seen over a plain connection.
    IgnoredInsecure,
    /// Missing or malformed duration.
    Invalid(String),
}

// ── Cache ──────────────────────────────────────────────────────────

/// Process-wide policy cache keyed by lowercase host.
pub struct StsCache {
    policies: DashMap<String, StsPolicy>,
    store: Arc<dyn StsStore>,
}

impl StsCache {
    /// Load persisted policies. Already-expired ones are skipped.
    pub fn load(store: Arc<dyn StsStore>, now: DateTime<Utc>) -> Result<Self> {
        let policies = DashMap::new();
        for (host, policy) in store.read_policies()? {
            if !policy.is_expired(now) {
                policies.insert(host.to_ascii_lowercase(), policy);
            }
        }
        tracing::debug!(count = policies.len(), "Loaded STS policies");
        Ok(Self { policies, store })
    }

    /// Live policy for `host`, evicting it if expired.
    pub fn lookup(&self, host: &str, now: DateTime<Utc>) -> Option<StsPolicy> {
        let key = host.to_ascii_lowercase();
        {
            let entry = self.policies.get(&key)?;
            if !entry.is_expired(now) {
                return Some(entry.value().clone());
            }
        }
        if self.policies.remove(&key).is_some() {
            tracing::debug!(host = %key, "STS policy expired");
            if let Err(e) = self.store.forget_policy(&key) {
                tracing::warn!(host = %key, error = %e, "Failed to forget expired STS policy");
            }
        }
        None
    }

    /// Record an `sts=` value seen on a connection to `host`.
    pub fn observe(
        &self,
        host: &str,
        value: &str,
        secure: bool,
        now: DateTime<Utc>,
    ) -> StsObservation {
        let key = host.to_ascii_lowercase();
        if !secure {
            tracing::info!(host = %key, value, "Ignoring STS policy advertised over plaintext");
            return StsObservation::IgnoredInsecure;
        }
        let parsed = match parse_sts_value(value) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(host = %key, value, error = %e, "Malformed STS value");
                return StsObservation::Invalid(e.to_string());
            }
        };
        let Some(duration) = parsed.duration else {
            tracing::warn!(host = %key, value, "STS value has no duration");
            return StsObservation::Invalid("missing duration".into());
        };

        if duration == 0 {
            self.policies.remove(&key);
            if let Err(e) = self.store.forget_policy(&key) {
                tracing::warn!(host = %key, error = %e, "Failed to forget STS policy");
            }
            tracing::info!(host = %key, "STS policy removed");
            return StsObservation::Removed;
        }

        let expires_at = i64::try_from(duration)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let policy = StsPolicy {
            expires_at,
            port: parsed.port,
            preload: parsed.preload,
            raw: value.to_string(),
        };
        self.policies.insert(key.clone(), policy.clone());
        if let Err(e) = self.store.remember_policy(&key, &policy) {
            tracing::warn!(host = %key, error = %e, "Failed to persist STS policy");
        }
        tracing::info!(host = %key, duration, port = ?policy.port, "STS policy stored");
        StsObservation::Stored(policy)
    }

    /// Force TLS (and the policy port) onto `endpoint` if a live policy
    /// exists. Returns true only when the endpoint actually changed.
    pub fn apply(&self, endpoint: &mut Endpoint, now: DateTime<Utc>) -> bool {
        let Some(policy) = self.lookup(&endpoint.host, now) else {
            return false;
        };
        let port = match policy.port {
            Some(p) => p,
            None if !endpoint.tls && endpoint.port == 6667 => 6697,
            None => endpoint.port,
        };
        if endpoint.tls && endpoint.port == port {
            return false;
        }
        tracing::info!(
            host = %endpoint.host,
            from_port = endpoint.port,
            to_port = port,
            "STS upgrade"
        );
        endpoint.tls = true;
        endpoint.port = port;
        true
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn endpoint(port: u16, tls: bool) -> Endpoint {
        Endpoint {
            host: "irc.example.org".into(),
            port,
            tls,
            tls_insecure: false,
            client_cert: None,
            client_key: None,
        }
    }

    fn cache() -> (StsCache, Arc<MemoryStsStore>) {
        let store = Arc::new(MemoryStsStore::default());
        let cache = StsCache::load(store.clone(), now()).unwrap();
        (cache, store)
    }

    #[test]
    fn parses_attributes() {
        let v = parse_sts_value("duration=300,port=6697,preload,future=x").unwrap();
        assert_eq!(v.duration, Some(300));
        assert_eq!(v.port, Some(6697));
        assert!(v.preload);
        assert!(parse_sts_value("duration=-1").is_err());
        assert!(parse_sts_value("duration=abc").is_err());
        assert!(parse_sts_value("port=0,duration=5").is_err());
    }

    #[test]
    fn stores_over_secure_session() {
        let (cache, store) = cache();
        let obs = cache.observe("IRC.Example.org", "duration=3600", true, now());
        assert!(matches!(obs, StsObservation::Stored(_)));
        assert!(cache.lookup("irc.example.org", now()).is_some());
        assert!(store.read_policies().unwrap().contains_key("irc.example.org"));
    }

    #[test]
    fn duration_zero_deletes() {
        let (cache, store) = cache();
        cache.observe("irc.example.org", "duration=3600", true, now());
        let obs = cache.observe("irc.example.org", "duration=0", true, now());
        assert_eq!(obs, StsObservation::Removed);
        assert!(cache.lookup("irc.example.org", now()).is_none());
        assert!(store.read_policies().unwrap().is_empty());
    }

    #[test]
    fn insecure_observation_leaves_policy_untouched() {
        let (cache, _) = cache();
        cache.observe("irc.example.org", "duration=3600", true, now());
        let obs = cache.observe("irc.example.org", "duration=0", false, now());
        assert_eq!(obs, StsObservation::IgnoredInsecure);
        assert!(cache.lookup("irc.example.org", now()).is_some());

        let obs = cache.observe("other.example.org", "duration=60", false, now());
        assert_eq!(obs, StsObservation::IgnoredInsecure);
        assert!(cache.lookup("other.example.org", now()).is_none());
    }

    #[test]
    fn missing_duration_is_invalid() {
        let (cache, _) = cache();
        let obs = cache.observe("h", "port=6697", true, now());
        assert!(matches!(obs, StsObservation::Invalid(_)));
        assert!(cache.is_empty());
    }

    #[test]
    fn expired_entries_evicted_on_lookup() {
        let (cache, store) = cache();
        cache.observe("irc.example.org", "duration=10", true, now());
        let later = now() + TimeDelta::seconds(11);
        assert!(cache.lookup("irc.example.org", later).is_none());
        assert!(cache.is_empty());
        assert!(store.read_policies().unwrap().is_empty());
    }

    #[test]
    fn apply_rewrites_only_when_it_changes_something() {
        let (cache, _) = cache();
        let mut ep = endpoint(6667, false);
        assert!(!cache.apply(&mut ep, now()));

        cache.observe("irc.example.org", "duration=3600,port=6697", true, now());
        assert!(cache.apply(&mut ep, now()));
        assert!(ep.tls);
        assert_eq!(ep.port, 6697);

        // Already secure on the policy port: no rewrite.
        assert!(!cache.apply(&mut ep, now()));
    }

    #[test]
    fn json_store_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sts.json");
        let store = Arc::new(JsonStsStore::new(&path));
        {
            let cache = StsCache::load(store.clone(), now()).unwrap();
            cache.observe("irc.example.org", "duration=3600,preload", true, now());
        }
        let reopened = StsCache::load(Arc::new(JsonStsStore::new(&path)), now()).unwrap();
        let policy = reopened.lookup("irc.example.org", now()).unwrap();
        assert!(policy.preload);
        assert_eq!(policy.raw, "duration=3600,preload");
    }
}
