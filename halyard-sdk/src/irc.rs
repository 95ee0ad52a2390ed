//! IRC line codec.
//!
//! Tokenizes raw protocol lines into tags, prefix, command, middle params and
//! trailing. Parsing never fails: malformed input comes back as a partial
//! `Message` with empty fields, and the caller decides whether it cares.

use std::collections::HashMap;
use std::fmt;

// ── Numerics ───────────────────────────────────────────────────────

pub const RPL_WELCOME: &str = "001";
pub const RPL_ISUPPORT: &str = "005";
pub const RPL_WHOSPCRPL: &str = "354";
pub const ERR_NICKNAMEINUSE: &str = "433";
pub const RPL_LOGGEDIN: &str = "900";
pub const RPL_LOGGEDOUT: &str = "901";
pub const ERR_NICKLOCKED: &str = "902";
pub const RPL_SASLSUCCESS: &str = "903";
pub const ERR_SASLFAIL: &str = "904";
pub const ERR_SASLTOOLONG: &str = "905";
pub const ERR_SASLABORTED: &str = "906";
pub const ERR_SASLALREADY: &str = "907";
pub const RPL_SASLMECHS: &str = "908";

// ── Tags ───────────────────────────────────────────────────────────

/// A single message tag as it appeared on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tag {
    /// Key exactly as received (client-tag `+` included).
    pub key: String,
    /// Unescaped value; empty when the tag had no value.
    pub value: String,
}

/// Message tag map with case-insensitive lookup.
///
/// Keys are normalized by lowercasing and stripping the client-tag `+`, so
/// `+draft/reply`, `DRAFT/REPLY` and `draft/reply` address the same entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tags {
    entries: HashMap<String, Tag>,
}

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalized form of a tag key.
    pub fn normalize_key(key: &str) -> String {
        key.strip_prefix('+').unwrap_or(key).to_ascii_lowercase()
    }

    /// Parse the tag section of a line (without the leading `@`).
    pub fn parse(section: &str) -> Self {
        let mut tags = Self::new();
        for item in section.split(';') {
            if item.is_empty() {
                continue;
            }
            let (key, value) = match item.split_once('=') {
                Some((k, v)) => (k, unescape_tag_value(v)),
                None => (item, String::new()),
            };
            if key.is_empty() || key == "+" {
                continue;
            }
            tags.insert(key, value);
        }
        tags
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(&Self::normalize_key(key))
            .map(|t| t.value.as_str())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(&Self::normalize_key(key))
    }

    pub fn insert(&mut self, key: &str, value: impl Into<String>) {
        self.entries.insert(
            Self::normalize_key(key),
            Tag {
                key: key.to_string(),
                value: value.into(),
            },
        );
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.entries
            .remove(&Self::normalize_key(key))
            .map(|t| t.value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tag> {
        self.entries.values()
    }

    /// Copy every tag from `other`, overwriting entries with the same key.
    pub fn merge_from(&mut self, other: &Tags) {
        for (k, t) in &other.entries {
            self.entries.insert(k.clone(), t.clone());
        }
    }
}

/// Return the first non-blank value among `names`, in order.
///
/// Lets callers accept both the draft and the ratified name of a tag.
pub fn first_tag_value<'a>(tags: &'a Tags, names: &[&str]) -> Option<&'a str> {
    names
        .iter()
        .filter_map(|n| tags.get(n))
        .find(|v| !v.trim().is_empty())
}

/// Undo the IRCv3 tag value escapes.
pub fn unescape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(':') => out.push(';'),
            Some('s') => out.push(' '),
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => out.push(other),
            // A lone trailing backslash is dropped.
            None => {}
        }
    }
    out
}

/// Apply the IRCv3 tag value escapes.
pub fn escape_tag_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("\\:"),
            ' ' => out.push_str("\\s"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            '\\' => out.push_str("\\\\"),
            other => out.push(other),
        }
    }
    out
}

// ── Prefix ─────────────────────────────────────────────────────────

/// Message source: `nick!user@host` or a bare server name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prefix {
    pub nick: String,
    pub user: Option<String>,
    pub host: Option<String>,
}

impl Prefix {
    pub fn parse(raw: &str) -> Self {
        let (nick_user, host) = match raw.split_once('@') {
            Some((nu, h)) => (nu, Some(h.to_string())),
            None => (raw, None),
        };
        let (nick, user) = match nick_user.split_once('!') {
            Some((n, u)) => (n.to_string(), Some(u.to_string())),
            None => (nick_user.to_string(), None),
        };
        Self { nick, user, host }
    }

    /// True for a server source (no user or host part, dotted name).
    pub fn is_server(&self) -> bool {
        self.user.is_none() && self.host.is_none() && self.nick.contains('.')
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.nick)?;
        if let Some(ref u) = self.user {
            write!(f, "!{u}")?;
        }
        if let Some(ref h) = self.host {
            write!(f, "@{h}")?;
        }
        Ok(())
    }
}

// ── Message ────────────────────────────────────────────────────────

/// One IRC protocol line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    pub tags: Tags,
    pub prefix: Option<Prefix>,
    /// Command, uppercased. Numerics keep their three digits.
    pub command: String,
    /// Middle parameters (everything before the trailing `:` parameter).
    pub params: Vec<String>,
    pub trailing: Option<String>,
}

fn split_word(s: &str) -> (&str, &str) {
    match s.find(' ') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    }
}

impl Message {
    /// Build an outbound message. The last parameter is sent as trailing.
    pub fn new(command: &str, params: Vec<String>) -> Self {
        let mut params = params;
        let trailing = params.pop();
        Self {
            tags: Tags::new(),
            prefix: None,
            command: command.to_ascii_uppercase(),
            params,
            trailing,
        }
    }

    pub fn with_tag(mut self, key: &str, value: impl Into<String>) -> Self {
        self.tags.insert(key, value);
        self
    }

    /// Parse a raw line. Never fails; see module docs.
    pub fn parse(raw: &str) -> Self {
        let mut msg = Message::default();
        let mut rest = raw.trim_end_matches(['\r', '\n']).trim_start_matches(' ');

        if let Some(stripped) = rest.strip_prefix('@') {
            let (section, after) = split_word(stripped);
            msg.tags = Tags::parse(section);
            rest = after.trim_start_matches(' ');
        }

        if let Some(stripped) = rest.strip_prefix(':') {
            let (source, after) = split_word(stripped);
            if !source.is_empty() {
                msg.prefix = Some(Prefix::parse(source));
            }
            rest = after.trim_start_matches(' ');
        }

        let (command, after) = split_word(rest);
        msg.command = command.to_ascii_uppercase();
        rest = after;

        loop {
            rest = rest.trim_start_matches(' ');
            if rest.is_empty() {
                break;
            }
            if let Some(trailing) = rest.strip_prefix(':') {
                msg.trailing = Some(trailing.to_string());
                break;
            }
            let (param, after) = split_word(rest);
            msg.params.push(param.to_string());
            rest = after;
        }

        if msg.command.is_empty() {
            tracing::debug!(line = %raw, "Unparseable IRC line");
        }
        msg
    }

    /// Parameter `i`, counting the trailing parameter last.
    pub fn arg(&self, i: usize) -> Option<&str> {
        if i < self.params.len() {
            Some(self.params[i].as_str())
        } else if i == self.params.len() {
            self.trailing.as_deref()
        } else {
            None
        }
    }

    /// All parameters including trailing.
    pub fn args(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.params.iter().map(|s| s.as_str()).collect();
        if let Some(ref t) = self.trailing {
            out.push(t.as_str());
        }
        out
    }

    pub fn arg_count(&self) -> usize {
        self.params.len() + usize::from(self.trailing.is_some())
    }

    pub fn last_arg(&self) -> Option<&str> {
        self.trailing
            .as_deref()
            .or_else(|| self.params.last().map(|s| s.as_str()))
    }

    /// Three-digit numeric reply code, if this is one.
    pub fn numeric(&self) -> Option<u16> {
        if self.command.len() == 3 && self.command.bytes().all(|b| b.is_ascii_digit()) {
            self.command.parse().ok()
        } else {
            None
        }
    }

    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key)
    }

    pub fn source_nick(&self) -> Option<&str> {
        self.prefix.as_ref().map(|p| p.nick.as_str())
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.tags.is_empty() {
            let mut tags: Vec<&Tag> = self.tags.iter().collect();
            tags.sort_by(|a, b| a.key.cmp(&b.key));
            write!(f, "@")?;
            for (i, tag) in tags.iter().enumerate() {
                if i > 0 {
                    write!(f, ";")?;
                }
                if tag.value.is_empty() {
                    write!(f, "{}", tag.key)?;
                } else {
                    write!(f, "{}={}", tag.key, escape_tag_value(&tag.value))?;
                }
            }
            write!(f, " ")?;
        }
        if let Some(ref p) = self.prefix {
            write!(f, ":{p} ")?;
        }
        write!(f, "{}", self.command)?;
        for p in &self.params {
            write!(f, " {p}")?;
        }
        if let Some(ref t) = self.trailing {
            if t.is_empty() || t.contains(' ') || t.starts_with(':') {
                write!(f, " :{t}")?;
            } else {
                write!(f, " {t}")?;
            }
        }
        Ok(())
    }
}

// ── Capability lists, ISUPPORT, casemapping ────────────────────────

/// Split a `CAP LS`/`CAP NEW` list into `(name, value)` pairs.
///
/// Names are lowercased; negated entries (`-name`) are dropped.
pub fn parse_cap_list(list: &str) -> Vec<(String, Option<String>)> {
    list.split_whitespace()
        .filter(|tok| !tok.starts_with('-'))
        .map(|tok| {
            let tok = tok.trim_start_matches(['=', '~']);
            match tok.split_once('=') {
                Some((name, value)) => (name.to_ascii_lowercase(), Some(value.to_string())),
                None => (tok.to_ascii_lowercase(), None),
            }
        })
        .filter(|(name, _)| !name.is_empty())
        .collect()
}

/// Parse the tokens of an RPL_ISUPPORT line into an uppercased key map.
///
/// `params` are the middle params after the target nick; `-KEY` entries map
/// to `None` so callers can drop a previously advertised token.
pub fn parse_isupport(params: &[String]) -> HashMap<String, Option<String>> {
    let mut out = HashMap::new();
    for tok in params {
        if let Some(key) = tok.strip_prefix('-') {
            out.insert(key.to_ascii_uppercase(), None);
            continue;
        }
        match tok.split_once('=') {
            Some((k, v)) => {
                out.insert(k.to_ascii_uppercase(), Some(v.replace("\\x20", " ")));
            }
            None => {
                out.insert(tok.to_ascii_uppercase(), Some(String::new()));
            }
        }
    }
    out
}

/// RFC 1459 case folding used for nick and channel comparisons.
pub fn irc_lower(s: &str) -> String {
    s.chars()
        .map(|c| match c {
            '[' => '{',
            ']' => '}',
            '\\' => '|',
            '~' => '^',
            other => other.to_ascii_lowercase(),
        })
        .collect()
}

// ── WHOX ───────────────────────────────────────────────────────────

/// Fields recovered from a WHOX (354) reply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WhoxFields {
    pub flags: Option<String>,
    pub account: Option<String>,
}

/// Characters a WHO flags field may contain after the leading H/G.
const WHO_FLAG_CHARS: &str = "*@%+~&!rBdbx";

fn looks_like_who_flags(field: &str) -> bool {
    let mut chars = field.chars();
    matches!(chars.next(), Some('H') | Some('G')) && chars.all(|c| WHO_FLAG_CHARS.contains(c))
}

/// Recover flags and account from the middle fields of a WHOX reply.
///
/// The requested field set is not echoed back, so this scans the fields:
/// the first one shaped like WHO flags (H/G followed only by flag chars) is
/// the flags field, and the field right after it is the account when it is
/// a single token (`0` meaning "not logged in"). A one-letter account named
/// `H` or `G` therefore reads as flags.
pub fn parse_whox(fields: &[String]) -> WhoxFields {
    let mut out = WhoxFields::default();
    let Some(pos) = fields.iter().position(|f| looks_like_who_flags(f)) else {
        return out;
    };
    out.flags = Some(fields[pos].clone());
    if let Some(next) = fields.get(pos + 1)
        && !next.is_empty()
        && !next.contains(' ')
        && next != "0"
    {
        out.account = Some(next.clone());
    }
    out
}
