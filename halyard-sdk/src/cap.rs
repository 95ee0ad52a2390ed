//! Capability negotiation and SASL driver.
//!
//! Sans-IO: the session feeds every `CAP`, `AUTHENTICATE` and SASL numeric
//! line in and writes out whatever lines come back. All desired
//! capabilities go out in a single `CAP REQ`; registration ends once the
//! pending set drains and any SASL exchange reaches a terminal numeric.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::{SaslConfig, ServerConfig};
use crate::event::Event;
use crate::irc::{self, Message};
use crate::sasl::{self, SaslSession};
use crate::sts::{StsCache, StsObservation};

/// Capabilities requested when the server config does not override them.
pub const DEFAULT_CAPS: &[&str] = &[
    "message-tags",
    "server-time",
    "batch",
    "echo-message",
    "labeled-response",
    "draft/multiline",
    "cap-notify",
    "away-notify",
    "account-notify",
    "account-tag",
    "extended-join",
    "multi-prefix",
    "chghost",
    "invite-notify",
    "setname",
    "standard-replies",
    "draft/chathistory",
    "chathistory",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Listing,
    Requesting,
    Authenticating,
    Done,
}

/// Lines to write and events to publish after one inbound line.
#[derive(Debug, Default)]
pub struct Outcome {
    pub lines: Vec<String>,
    pub events: Vec<Event>,
    /// SASL failed and the server is configured to treat that as fatal.
    pub fatal: Option<String>,
}

impl Outcome {
    fn line(&mut self, line: impl Into<String>) {
        self.lines.push(line.into());
    }
}

pub struct CapNegotiator {
    host: String,
    secure: bool,
    desired: Vec<String>,
    sasl_config: Option<SaslConfig>,
    sts: Arc<StsCache>,
    phase: Phase,
    offered: BTreeMap<String, Option<String>>,
    pending: HashSet<String>,
    enabled: BTreeSet<String>,
    sasl: Option<SaslSession>,
    sasl_mechs: Option<Vec<String>>,
    abort_reason: Option<String>,
    account: Option<String>,
}

impl CapNegotiator {
    pub fn new(config: &ServerConfig, secure: bool, sts: Arc<StsCache>) -> Self {
        let desired = match config.caps {
            Some(ref caps) => caps.iter().map(|c| c.to_ascii_lowercase()).collect(),
            None => DEFAULT_CAPS.iter().map(|c| c.to_string()).collect(),
        };
        Self {
            host: config.host.clone(),
            secure,
            desired,
            sasl_config: config.sasl.clone(),
            sts,
            phase: Phase::Listing,
            offered: BTreeMap::new(),
            pending: HashSet::new(),
            enabled: BTreeSet::new(),
            sasl: None,
            sasl_mechs: None,
            abort_reason: None,
            account: None,
        }
    }

    /// True for lines this negotiator consumes.
    pub fn intercepts(msg: &Message) -> bool {
        matches!(msg.command.as_str(), "CAP" | "AUTHENTICATE")
            || msg.numeric().is_some_and(|n| (900..=908).contains(&n))
    }

    pub fn is_done(&self) -> bool {
        self.phase == Phase::Done
    }

    pub fn has_cap(&self, name: &str) -> bool {
        self.enabled.contains(&name.to_ascii_lowercase())
    }

    pub fn enabled(&self) -> Vec<String> {
        self.enabled.iter().cloned().collect()
    }

    /// Registration finished without the server ever answering `CAP LS`.
    pub fn on_registered(&mut self) {
        tracing::debug!(host = %self.host, "Registered before negotiation finished");
        self.phase = Phase::Done;
    }

    pub fn handle(&mut self, msg: &Message, now: DateTime<Utc>) -> Outcome {
        let mut out = Outcome::default();
        if msg.command == "CAP" {
            self.handle_cap(msg, now, &mut out);
        } else if msg.command == "AUTHENTICATE" {
            self.handle_authenticate(msg, &mut out);
        } else if let Some(code) = msg.numeric() {
            self.handle_sasl_numeric(code, msg, &mut out);
        }
        out
    }

    // ── CAP ────────────────────────────────────────────────────────

    fn handle_cap(&mut self, msg: &Message, now: DateTime<Utc>, out: &mut Outcome) {
        let args = msg.args();
        let Some(sub) = args.get(1).map(|s| s.to_ascii_uppercase()) else {
            return;
        };
        let list = if args.len() > 2 {
            args.last().copied().unwrap_or("")
        } else {
            ""
        };
        let continued = args.len() >= 4 && args[2] == "*";

        match sub.as_str() {
            "LS" => {
                let caps = irc::parse_cap_list(list);
                self.observe_sts(&caps, now, out);
                self.offered.extend(caps);
                if continued || self.phase != Phase::Listing {
                    return;
                }
                self.request_initial(out);
            }
            "ACK" => {
                for tok in list.split_whitespace() {
                    let (disable, name) = match tok.strip_prefix('-') {
                        Some(n) => (true, n.to_ascii_lowercase()),
                        None => (false, tok.to_ascii_lowercase()),
                    };
                    self.pending.remove(&name);
                    if disable {
                        self.enabled.remove(&name);
                    } else {
                        self.enabled.insert(name);
                    }
                }
                self.after_reply(out);
            }
            "NAK" => {
                for tok in list.split_whitespace() {
                    self.pending.remove(&tok.trim_start_matches('-').to_ascii_lowercase());
                }
                tracing::debug!(host = %self.host, caps = list, "Capabilities rejected");
                self.after_reply(out);
            }
            "NEW" => {
                let caps = irc::parse_cap_list(list);
                self.observe_sts(&caps, now, out);
                let mut want = Vec::new();
                for (name, value) in caps {
                    if name == "sasl"
                        && let Some(ref v) = value
                    {
                        self.sasl_mechs = Some(sasl::parse_mechanism_list(v));
                    }
                    if self.desired.contains(&name)
                        && !self.enabled.contains(&name)
                        && !self.pending.contains(&name)
                    {
                        want.push(name.clone());
                    }
                    self.offered.insert(name, value);
                }
                if !want.is_empty() {
                    self.pending.extend(want.iter().cloned());
                    out.line(format!("CAP REQ :{}", want.join(" ")));
                }
            }
            "DEL" => {
                let mut changed = false;
                for tok in list.split_whitespace() {
                    let name = tok.to_ascii_lowercase();
                    self.offered.remove(&name);
                    changed |= self.enabled.remove(&name);
                }
                if changed {
                    out.events.push(Event::CapsNegotiated {
                        enabled: self.enabled(),
                    });
                }
            }
            "LIST" => {}
            other => tracing::debug!(host = %self.host, sub = other, "Unhandled CAP subcommand"),
        }
    }

    fn observe_sts(
        &mut self,
        caps: &[(String, Option<String>)],
        now: DateTime<Utc>,
        out: &mut Outcome,
    ) {
        let Some(value) = caps
            .iter()
            .find(|(n, _)| n == "sts")
            .map(|(_, v)| v.clone().unwrap_or_default())
        else {
            return;
        };
        match self.sts.observe(&self.host, &value, self.secure, now) {
            StsObservation::Stored(policy) => out.events.push(Event::StsPolicyStored {
                host: self.host.to_ascii_lowercase(),
                port: policy.port,
                expires_at: policy.expires_at,
            }),
            StsObservation::Removed => out.events.push(Event::StsPolicyRemoved {
                host: self.host.to_ascii_lowercase(),
            }),
            StsObservation::IgnoredInsecure | StsObservation::Invalid(_) => {}
        }
    }

    fn wants_sasl(&self) -> bool {
        self.sasl_config.is_some() && self.offered.contains_key("sasl")
    }

    fn request_initial(&mut self, out: &mut Outcome) {
        if let Some(Some(v)) = self.offered.get("sasl") {
            self.sasl_mechs = Some(sasl::parse_mechanism_list(v));
        }

        let mut want: Vec<String> = self
            .desired
            .iter()
            .filter(|c| self.offered.contains_key(c.as_str()))
            .cloned()
            .collect();
        if self.wants_sasl() && !want.iter().any(|c| c == "sasl") {
            want.push("sasl".to_string());
        }

        if want.is_empty() {
            tracing::debug!(host = %self.host, "No capabilities to request");
            self.phase = Phase::Done;
            out.events.push(Event::CapsNegotiated { enabled: Vec::new() });
            out.line("CAP END");
            return;
        }

        tracing::debug!(host = %self.host, caps = ?want, "Requesting capabilities");
        self.pending = want.iter().cloned().collect();
        self.phase = Phase::Requesting;
        out.line(format!("CAP REQ :{}", want.join(" ")));
    }

    fn after_reply(&mut self, out: &mut Outcome) {
        if !self.pending.is_empty() {
            return;
        }
        out.events.push(Event::CapsNegotiated {
            enabled: self.enabled(),
        });
        if self.phase != Phase::Requesting {
            return;
        }
        if self.enabled.contains("sasl")
            && let Some(ref config) = self.sasl_config
        {
            match SaslSession::start(config, self.sasl_mechs.as_deref()) {
                Ok(session) => {
                    out.line(session.initial_line());
                    self.sasl = Some(session);
                    self.phase = Phase::Authenticating;
                    return;
                }
                Err(e) => {
                    let reason = e.to_string();
                    let fatal = config.fatal_on_failure;
                    out.events.push(Event::AuthFailed {
                        reason: reason.clone(),
                        fatal,
                    });
                    if fatal {
                        out.fatal = Some(reason);
                    }
                }
            }
        }
        self.phase = Phase::Done;
        out.line("CAP END");
    }

    // ── SASL ───────────────────────────────────────────────────────

    fn handle_authenticate(&mut self, msg: &Message, out: &mut Outcome) {
        let Some(session) = self.sasl.as_mut() else {
            tracing::debug!(host = %self.host, "AUTHENTICATE without a SASL session");
            return;
        };
        let param = msg.arg(0).unwrap_or("+");
        let result = session.on_authenticate(param);
        out.lines.extend(result.lines);
        if let Some(reason) = result.aborted {
            self.abort_reason = Some(reason);
        }
    }

    fn handle_sasl_numeric(&mut self, code: u16, msg: &Message, out: &mut Outcome) {
        match code {
            900 => {
                self.account = msg.arg(2).map(String::from);
                tracing::info!(host = %self.host, account = ?self.account, "Logged in");
            }
            901 => {
                self.account = None;
            }
            903 => {
                let Some(mut session) = self.sasl.take() else {
                    return;
                };
                if !session.verified() {
                    tracing::warn!(host = %self.host, "SASL succeeded before the server signature was verified");
                }
                session.finish();
                out.events.push(Event::Authenticated {
                    account: self.account.clone(),
                    mechanism: session.mechanism().to_string(),
                });
                self.finish_sasl(out);
            }
            902 | 904 | 905 | 906 | 907 => {
                let Some(mut session) = self.sasl.take() else {
                    return;
                };
                session.finish();
                let reason = self
                    .abort_reason
                    .take()
                    .unwrap_or_else(|| failure_reason(code, msg));
                let fatal = self
                    .sasl_config
                    .as_ref()
                    .is_some_and(|c| c.fatal_on_failure);
                tracing::warn!(host = %self.host, code, %reason, fatal, "SASL failed");
                out.events.push(Event::AuthFailed {
                    reason: reason.clone(),
                    fatal,
                });
                if fatal {
                    out.fatal = Some(reason);
                }
                self.finish_sasl(out);
            }
            908 => {
                if let Some(list) = msg.arg(1) {
                    self.sasl_mechs = Some(sasl::parse_mechanism_list(list));
                }
            }
            _ => {}
        }
    }

    fn finish_sasl(&mut self, out: &mut Outcome) {
        if self.phase == Phase::Authenticating {
            self.phase = Phase::Done;
            out.line("CAP END");
        }
    }
}

fn failure_reason(code: u16, msg: &Message) -> String {
    let fallback = match code {
        902 => "nick locked",
        904 => "authentication failed",
        905 => "SASL message too long",
        906 => "authentication aborted",
        907 => "already authenticated",
        _ => "authentication failed",
    };
    match msg.trailing.as_deref() {
        Some(t) if !t.trim().is_empty() => t.to_string(),
        _ => fallback.to_string(),
    }
}
