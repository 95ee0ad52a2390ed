//! Stdin line commands.
//!
//!   /msg <server> <target> <text>
//!   /notice <server> <target> <text>
//!   /me <server> <target> <text>
//!   /quote <server> <raw line>
//!   /labeled <server> <context> <raw line>
//!   /connect <server>
//!   /disconnect <server> [reason]
//!   /quit

use halyard_sdk::ServerId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Message {
        server: ServerId,
        target: String,
        text: String,
    },
    Notice {
        server: ServerId,
        target: String,
        text: String,
    },
    Action {
        server: ServerId,
        target: String,
        text: String,
    },
    Quote {
        server: ServerId,
        line: String,
    },
    Labeled {
        server: ServerId,
        context: String,
        line: String,
    },
    Connect(ServerId),
    Disconnect {
        server: ServerId,
        reason: Option<String>,
    },
    Quit,
}

pub const USAGE: &str = "commands: /msg /notice /me <server> <target> <text> | \
/quote <server> <line> | /labeled <server> <context> <line> | \
/connect <server> | /disconnect <server> [reason] | /quit";

/// Parse one input line. Blank lines are `Ok(None)`.
pub fn parse(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Err(USAGE.to_string());
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim_start();

    let name = name.to_ascii_lowercase();
    let cmd = match name.as_str() {
        "msg" | "notice" | "me" => {
            let [server, target, text] = split3(args).ok_or_else(|| format!("/{name} <server> <target> <text>"))?;
            let (server, target, text) = (ServerId::from(server), target.to_string(), text.to_string());
            match name.as_str() {
                "msg" => Command::Message { server, target, text },
                "notice" => Command::Notice { server, target, text },
                _ => Command::Action { server, target, text },
            }
        }
        "quote" => {
            let (server, line) = args
                .split_once(' ')
                .filter(|(_, l)| !l.trim().is_empty())
                .ok_or("/quote <server> <line>")?;
            Command::Quote {
                server: server.into(),
                line: line.trim_start().to_string(),
            }
        }
        "labeled" => {
            let [server, context, line] = split3(args).ok_or("/labeled <server> <context> <line>")?;
            Command::Labeled {
                server: server.into(),
                context: context.to_string(),
                line: line.to_string(),
            }
        }
        "connect" if !args.is_empty() => Command::Connect(args.into()),
        "disconnect" if !args.is_empty() => {
            let (server, reason) = match args.split_once(' ') {
                Some((s, r)) if !r.trim().is_empty() => (s, Some(r.trim().to_string())),
                Some((s, _)) => (s, None),
                None => (args, None),
            };
            Command::Disconnect {
                server: server.into(),
                reason,
            }
        }
        "quit" => Command::Quit,
        _ => return Err(USAGE.to_string()),
    };
    Ok(Some(cmd))
}

/// Two words and a non-empty remainder.
fn split3(args: &str) -> Option<[&str; 3]> {
    let (a, rest) = args.split_once(' ')?;
    let (b, rest) = rest.trim_start().split_once(' ')?;
    let rest = rest.trim_start();
    (!a.is_empty() && !b.is_empty() && !rest.is_empty()).then_some([a, b, rest])
}
