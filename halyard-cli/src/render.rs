//! One-line text rendering of refined events.

use halyard_sdk::event::{LabelOutcome, MessageKind};
use halyard_sdk::{Event, ServerEvent};

/// Render `ev` for the terminal. Batch framing and other plumbing return `None`.
pub fn render(ev: &ServerEvent) -> Option<String> {
    let body = match &ev.event {
        Event::Connecting { host, port, tls } => {
            format!("connecting to {host}:{port}{}", if *tls { " (tls)" } else { "" })
        }
        Event::Connected { host, port, .. } => format!("connected to {host}:{port}"),
        Event::Registered { nick } => format!("registered as {nick}"),
        Event::Reconnecting { attempt, delay, reason } => {
            format!("reconnect #{attempt} in {}ms ({reason})", delay.as_millis())
        }
        Event::Disconnected { reason } => format!("disconnected: {reason}"),
        Event::Fatal { reason } => format!("fatal: {reason}"),
        Event::CapsNegotiated { enabled } => format!("caps: {}", enabled.join(" ")),
        Event::Authenticated { account, mechanism } => {
            format!("logged in as {} via {mechanism}", account.as_deref().unwrap_or("?"))
        }
        Event::AuthFailed { reason, fatal } => {
            format!("sasl failed{}: {reason}", if *fatal { " (fatal)" } else { "" })
        }
        Event::StsPolicyStored { host, port, expires_at } => match port {
            Some(port) => format!("sts policy for {host} (port {port}) until {expires_at}"),
            None => format!("sts policy for {host} until {expires_at}"),
        },
        Event::StsPolicyRemoved { host } => format!("sts policy for {host} removed"),
        Event::StsUpgraded { host, port } => format!("sts upgrade: {host}:{port} over tls"),
        Event::Message { from, target, text, kind, .. } => message(from, target, text, *kind),
        Event::Joined { channel, nick, account } => match account {
            Some(acct) => format!("{nick} [{acct}] joined {channel}"),
            None => format!("{nick} joined {channel}"),
        },
        Event::Parted { channel, nick, reason } => {
            format!("{nick} left {channel}{}", suffix(reason.as_deref()))
        }
        Event::Kicked { channel, nick, by, reason } => format!("{by} kicked {nick} from {channel} ({reason})"),
        Event::UserQuit { nick, reason } => format!("{nick} quit ({reason})"),
        Event::NickChanged { old_nick, new_nick } => format!("{old_nick} is now {new_nick}"),
        Event::Numeric { code, params, .. } => format!("{code:03} {}", params.join(" ")),
        Event::WhoxReply { fields, account, .. } => match account {
            Some(acct) => format!("who: {} [{acct}]", fields.join(" ")),
            None => format!("who: {}", fields.join(" ")),
        },
        Event::StandardReply { severity, command, code, description, .. } => {
            format!("{severity:?} {command} {code}: {description}")
        }
        Event::ServerNotice { text } => format!("-server- {text}"),
        Event::RawLine(line) => line.clone(),
        Event::LabeledReply { context, preview, outcome, .. } => {
            let outcome = match outcome {
                LabelOutcome::Failure => "failed",
                _ => "ok",
            };
            format!("[{context}] {preview}: {outcome}")
        }
        Event::LabeledTimeout { context, preview, .. } => format!("[{context}] {preview}: no reply"),
        Event::EchoResolved { target, text, .. } => message("you", target, text, MessageKind::Privmsg),
        Event::EchoFailed { target, reason, .. } => format!("message to {target} not confirmed: {reason}"),
        Event::NetsplitDetected { server1, server2 } => format!("netsplit {server1} <-> {server2}"),
        Event::TagMsg { .. }
        | Event::BatchStart { .. }
        | Event::BatchEnd { .. }
        | Event::Ack { .. }
        | Event::OutboundMessage { .. }
        | Event::LabeledRequestSent { .. } => return None,
    };
    Some(format!("[{}] {body}", ev.server))
}

fn message(from: &str, target: &str, text: &str, kind: MessageKind) -> String {
    let mut out = String::new();
    for (i, line) in text.split('\n').enumerate() {
        if i > 0 {
            out.push_str("\n    ");
        }
        match kind {
            MessageKind::Privmsg => out.push_str(&format!("{target} <{from}> {line}")),
            MessageKind::Notice => out.push_str(&format!("{target} -{from}- {line}")),
            MessageKind::Action => out.push_str(&format!("{target} * {from} {line}")),
        }
    }
    out
}

fn suffix(reason: Option<&str>) -> String {
    reason.map(|r| format!(" ({r})")).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use halyard_sdk::irc::Tags;

    fn wrap(event: Event) -> ServerEvent {
        ServerEvent {
            server: "libera".into(),
            seq: 1,
            event,
        }
    }

    #[test]
    fn renders_messages_per_kind() {
        let ev = wrap(Event::Message {
            from: "bob".into(),
            target: "#rust".into(),
            text: "waves".into(),
            tags: Tags::new(),
            kind: MessageKind::Action,
            self_authored: false,
        });
        assert_eq!(render(&ev).as_deref(), Some("[libera] #rust * bob waves"));
    }

    #[test]
    fn multiline_is_indented() {
        let ev = wrap(Event::Message {
            from: "bob".into(),
            target: "#rust".into(),
            text: "a\nb".into(),
            tags: Tags::new(),
            kind: MessageKind::Privmsg,
            self_authored: false,
        });
        assert_eq!(render(&ev).as_deref(), Some("[libera] #rust <bob> a\n    #rust <bob> b"));
    }

    #[test]
    fn plumbing_is_hidden() {
        assert!(render(&wrap(Event::Ack { tags: Tags::new() })).is_none());
        assert_eq!(
            render(&wrap(Event::Disconnected { reason: "bye".into() })).as_deref(),
            Some("[libera] disconnected: bye")
        );
    }
}
