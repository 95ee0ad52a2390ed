//! One connection attempt: transport, registration and the read loop.
//!
//! The session owns the socket. It never changes connection state itself;
//! it reports to its supervisor (opened, inbound activity, nick changes,
//! fatal auth, ended) and publishes protocol events onto the server bus.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::bus::ServerBus;
use crate::cap::CapNegotiator;
use crate::config::ServerConfig;
use crate::event::{Event, MessageKind, ReplySeverity, ServerId};
use crate::irc::{self, Message};
use crate::sts::StsCache;
use crate::transport::{Connector, Endpoint};

/// Inbound activity is reported at most this often.
pub const ACTIVITY_COALESCE: Duration = Duration::from_secs(1);

/// Registration gives up after this many alternative nicks.
pub const MAX_NICK_RETRIES: u32 = 5;

/// Longest accepted inbound line: 8191 bytes of tags plus a 512-byte body.
pub const MAX_LINE: usize = 8191 + 512;

const PREVIEW_LEN: usize = 80;

/// Work the supervisor hands to a live session.
#[derive(Debug, Clone)]
pub enum SessionCommand {
    Message {
        pending_id: u64,
        target: String,
        text: String,
        kind: MessageKind,
    },
    Labeled {
        line: String,
        context: String,
    },
    Raw(String),
    Ping,
    Quit(String),
}

/// What a session tells its supervisor.
#[derive(Debug, Clone)]
pub enum Report {
    Opened { secure: bool },
    Activity(Instant),
    Nick(String),
    AuthFatal(String),
    Ended(String),
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub generation: u64,
    pub report: Report,
}

/// Everything a session needs, fixed at spawn time.
pub struct Session {
    pub server: ServerId,
    pub generation: u64,
    pub config: ServerConfig,
    pub endpoint: Endpoint,
    pub connect_timeout: Duration,
    pub goodbye_timeout: Duration,
    pub connector: Arc<dyn Connector>,
    pub sts: Arc<StsCache>,
    pub bus: ServerBus,
    pub reports: mpsc::UnboundedSender<SessionReport>,
    pub labels: Arc<AtomicU64>,
}

/// Per-connection protocol state.
struct Live {
    negotiator: CapNegotiator,
    nick: String,
    nick_tries: u32,
    registered: bool,
    queued: Vec<SessionCommand>,
    network: Option<String>,
}

enum Flow {
    Continue,
    End(String),
}

impl Session {
    fn report(&self, report: Report) {
        let _ = self.reports.send(SessionReport {
            generation: self.generation,
            report,
        });
    }

    /// Run until the connection ends, then report why.
    pub async fn run(self, mut commands: mpsc::UnboundedReceiver<SessionCommand>) {
        let reason = self.run_inner(&mut commands).await;
        tracing::info!(server = %self.server, generation = self.generation, %reason, "Session ended");
        self.report(Report::Ended(reason));
    }

    async fn run_inner(&self, commands: &mut mpsc::UnboundedReceiver<SessionCommand>) -> String {
        let connect = tokio::time::timeout(self.connect_timeout, self.connector.connect(&self.endpoint));
        let conn = tokio::select! {
            res = connect => match res {
                Ok(Ok(conn)) => conn,
                Ok(Err(e)) => return format!("connect to {} failed: {e}", self.endpoint.addr()),
                Err(_) => return format!("connect to {} timed out", self.endpoint.addr()),
            },
            cmd = commands.recv() => {
                return match cmd {
                    Some(SessionCommand::Quit(reason)) => reason,
                    _ => "cancelled while connecting".to_string(),
                };
            }
        };

        let secure = conn.secure;
        self.report(Report::Opened { secure });
        tracing::info!(server = %self.server, addr = %self.endpoint.addr(), secure, "Transport open");

        let (read_half, mut writer) = tokio::io::split(conn.stream);
        let mut reader = BufReader::new(read_half);

        let mut live = Live {
            negotiator: CapNegotiator::new(&self.config, secure, self.sts.clone()),
            nick: self.config.nick.clone(),
            nick_tries: 0,
            registered: false,
            queued: Vec::new(),
            network: None,
        };

        if let Err(e) = self.register(&mut writer).await {
            return format!("write error: {e}");
        }

        let mut buf: Vec<u8> = Vec::with_capacity(512);
        let mut last_activity_report: Option<Instant> = None;
        let mut discarding = false;

        loop {
            // `buf` stays below MAX_LINE between reads, so the limit is never zero.
            let mut limited = (&mut reader).take((MAX_LINE - buf.len()) as u64);
            tokio::select! {
                result = limited.read_until(b'\n', &mut buf) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => return format!("read error: {e}"),
                    };
                    if n == 0 {
                        return "connection closed by server".to_string();
                    }

                    let now = Instant::now();
                    if last_activity_report.is_none_or(|t| now.duration_since(t) >= ACTIVITY_COALESCE) {
                        self.report(Report::Activity(now));
                        last_activity_report = Some(now);
                    }

                    if buf.last() != Some(&b'\n') {
                        if buf.len() >= MAX_LINE {
                            if !discarding {
                                tracing::warn!(server = %self.server, limit = MAX_LINE, "Dropping oversized line");
                            }
                            discarding = true;
                            buf.clear();
                        }
                        continue;
                    }
                    if discarding {
                        // Tail of the oversized line.
                        discarding = false;
                        buf.clear();
                        continue;
                    }

                    let line = String::from_utf8_lossy(&buf)
                        .trim_end_matches(['\r', '\n'])
                        .to_string();
                    buf.clear();
                    if line.is_empty() {
                        continue;
                    }
                    tracing::trace!(server = %self.server, %line, "<<");

                    let msg = Message::parse(&line);
                    match self.handle_line(&msg, &line, &mut live, &mut writer).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::End(reason)) => return reason,
                        Err(e) => return format!("write error: {e}"),
                    }
                }
                cmd = commands.recv() => {
                    match cmd {
                        None => return "session dropped".to_string(),
                        Some(SessionCommand::Quit(reason)) => {
                            self.goodbye(&mut reader, &mut writer, &reason).await;
                            return reason;
                        }
                        Some(cmd) if !live.registered && !matches!(cmd, SessionCommand::Ping) => {
                            live.queued.push(cmd);
                        }
                        Some(cmd) => {
                            if let Err(e) = self.execute(cmd, &live, &mut writer).await {
                                return format!("write error: {e}");
                            }
                        }
                    }
                }
            }
        }
    }

    async fn register<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> std::io::Result<()> {
        send_line(writer, "CAP LS 302").await?;
        if let Some(ref pass) = self.config.password {
            send_line(writer, &format!("PASS {pass}")).await?;
        }
        send_line(writer, &format!("NICK {}", self.config.nick)).await?;
        send_line(
            writer,
            &format!(
                "USER {} 0 * :{}",
                self.config.username(),
                self.config.realname()
            ),
        )
        .await
    }

    async fn goodbye<R, W>(&self, reader: &mut R, writer: &mut W, reason: &str)
    where
        R: tokio::io::AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let graceful = tokio::time::timeout(self.goodbye_timeout, async {
            send_line(writer, &format!("QUIT :{reason}")).await?;
            writer.flush().await?;
            // Wait for the server to close its side.
            let mut sink = Vec::new();
            loop {
                sink.clear();
                if (&mut *reader).take(MAX_LINE as u64).read_until(b'\n', &mut sink).await? == 0 {
                    break;
                }
            }
            Ok::<_, std::io::Error>(())
        })
        .await;
        match graceful {
            Ok(Ok(())) => tracing::debug!(server = %self.server, "Server closed after QUIT"),
            Ok(Err(e)) => tracing::debug!(server = %self.server, error = %e, "Error during QUIT"),
            Err(_) => tracing::debug!(server = %self.server, "QUIT timed out, dropping socket"),
        }
    }

    async fn handle_line<W: AsyncWrite + Unpin>(
        &self,
        msg: &Message,
        line: &str,
        live: &mut Live,
        writer: &mut W,
    ) -> std::io::Result<Flow> {
        if CapNegotiator::intercepts(msg) {
            let outcome = live.negotiator.handle(msg, Utc::now());
            for l in &outcome.lines {
                send_line(writer, l).await?;
            }
            for ev in outcome.events {
                self.bus.publish(ev);
            }
            if let Some(reason) = outcome.fatal {
                self.report(Report::AuthFatal(reason));
            }
            return Ok(Flow::Continue);
        }

        let from = msg.source_nick().unwrap_or("").to_string();
        match msg.command.as_str() {
            "PING" => {
                let token = msg.last_arg().unwrap_or("");
                send_line(writer, &format!("PONG :{token}")).await?;
            }
            "PONG" => {}
            irc::RPL_WELCOME => {
                live.registered = true;
                if !live.negotiator.is_done() {
                    live.negotiator.on_registered();
                }
                if let Some(nick) = msg.arg(0) {
                    live.nick = nick.to_string();
                }
                self.report(Report::Nick(live.nick.clone()));
                self.bus.publish(Event::Registered {
                    nick: live.nick.clone(),
                });
                for cmd in std::mem::take(&mut live.queued) {
                    self.execute(cmd, live, writer).await?;
                }
            }
            irc::ERR_NICKNAMEINUSE if !live.registered => {
                live.nick_tries += 1;
                if live.nick_tries > MAX_NICK_RETRIES {
                    return Ok(Flow::End("nickname in use".to_string()));
                }
                let alt = format!("{}{}", self.config.nick, live.nick_tries);
                tracing::debug!(server = %self.server, nick = %alt, "Nick in use, retrying");
                live.nick = alt.clone();
                send_line(writer, &format!("NICK {alt}")).await?;
            }
            irc::RPL_ISUPPORT => {
                let tokens: Vec<String> = msg.params.iter().skip(1).cloned().collect();
                let isupport = irc::parse_isupport(&tokens);
                if let Some(Some(network)) = isupport.get("NETWORK") {
                    tracing::info!(server = %self.server, %network, "Network name");
                    live.network = Some(network.clone());
                }
                self.publish_numeric(msg);
            }
            irc::RPL_WHOSPCRPL => {
                let fields: Vec<String> = msg.args().iter().skip(1).map(|s| s.to_string()).collect();
                let whox = irc::parse_whox(&fields);
                self.bus.publish(Event::WhoxReply {
                    fields,
                    flags: whox.flags,
                    account: whox.account,
                });
            }
            "NICK" => {
                let new_nick = msg.arg(0).unwrap_or("").to_string();
                if irc::irc_lower(&from) == irc::irc_lower(&live.nick) {
                    live.nick = new_nick.clone();
                    self.report(Report::Nick(new_nick.clone()));
                }
                if !from.is_empty() && !new_nick.is_empty() {
                    self.bus.publish(Event::NickChanged {
                        old_nick: from,
                        new_nick,
                    });
                }
            }
            "PRIVMSG" | "NOTICE" => {
                let target = msg.arg(0).unwrap_or("").to_string();
                let text = msg.arg(1).unwrap_or("");
                let from_server = msg.prefix.as_ref().is_none_or(|p| p.is_server());
                if msg.command == "NOTICE" && from_server {
                    self.bus.publish(Event::ServerNotice {
                        text: text.to_string(),
                    });
                } else {
                    let (kind, text) = classify(&msg.command, text);
                    let self_authored = irc::irc_lower(&from) == irc::irc_lower(&live.nick);
                    self.bus.publish(Event::Message {
                        from,
                        target,
                        text,
                        tags: msg.tags.clone(),
                        kind,
                        self_authored,
                    });
                }
            }
            "TAGMSG" => {
                self.bus.publish(Event::TagMsg {
                    from,
                    target: msg.arg(0).unwrap_or("").to_string(),
                    tags: msg.tags.clone(),
                });
            }
            "JOIN" => {
                let account = msg
                    .arg(1)
                    .filter(|a| *a != "*" && msg.arg_count() >= 3)
                    .map(String::from);
                self.bus.publish(Event::Joined {
                    channel: msg.arg(0).unwrap_or("").to_string(),
                    nick: from,
                    account,
                });
            }
            "PART" => {
                self.bus.publish(Event::Parted {
                    channel: msg.arg(0).unwrap_or("").to_string(),
                    nick: from,
                    reason: msg.arg(1).map(String::from),
                });
            }
            "KICK" => {
                self.bus.publish(Event::Kicked {
                    channel: msg.arg(0).unwrap_or("").to_string(),
                    nick: msg.arg(1).unwrap_or("").to_string(),
                    by: from,
                    reason: msg.arg(2).unwrap_or("").to_string(),
                });
            }
            "QUIT" => {
                self.bus.publish(Event::UserQuit {
                    nick: from,
                    reason: msg.arg(0).unwrap_or("").to_string(),
                });
            }
            "BATCH" => {
                let reference = msg.arg(0).unwrap_or("");
                if let Some(id) = reference.strip_prefix('+') {
                    let args = msg.args();
                    self.bus.publish(Event::BatchStart {
                        id: id.to_string(),
                        batch_type: args.get(1).unwrap_or(&"").to_string(),
                        params: args.iter().skip(2).map(|s| s.to_string()).collect(),
                        tags: msg.tags.clone(),
                    });
                } else if let Some(id) = reference.strip_prefix('-') {
                    self.bus.publish(Event::BatchEnd {
                        id: id.to_string(),
                        tags: msg.tags.clone(),
                    });
                }
            }
            "ACK" => {
                self.bus.publish(Event::Ack {
                    tags: msg.tags.clone(),
                });
            }
            "FAIL" | "WARN" | "NOTE" => {
                let severity = match msg.command.as_str() {
                    "FAIL" => ReplySeverity::Fail,
                    "WARN" => ReplySeverity::Warn,
                    _ => ReplySeverity::Note,
                };
                let args = msg.args();
                let context = if args.len() > 3 {
                    args[2..args.len() - 1].iter().map(|s| s.to_string()).collect()
                } else {
                    Vec::new()
                };
                self.bus.publish(Event::StandardReply {
                    severity,
                    command: args.first().unwrap_or(&"").to_string(),
                    code: args.get(1).unwrap_or(&"").to_string(),
                    context,
                    description: msg.last_arg().unwrap_or("").to_string(),
                    tags: msg.tags.clone(),
                });
            }
            "ERROR" => {
                self.bus.publish(Event::ServerNotice {
                    text: msg.last_arg().unwrap_or("").to_string(),
                });
            }
            "" => {
                tracing::debug!(server = %self.server, %line, "Ignoring line without command");
            }
            _ if msg.numeric().is_some() => self.publish_numeric(msg),
            _ => {
                self.bus.publish(Event::RawLine(line.to_string()));
            }
        }
        Ok(Flow::Continue)
    }

    fn publish_numeric(&self, msg: &Message) {
        let Some(code) = msg.numeric() else {
            return;
        };
        self.bus.publish(Event::Numeric {
            code,
            params: msg.args().iter().map(|s| s.to_string()).collect(),
            tags: msg.tags.clone(),
        });
    }

    async fn execute<W: AsyncWrite + Unpin>(
        &self,
        cmd: SessionCommand,
        live: &Live,
        writer: &mut W,
    ) -> std::io::Result<()> {
        match cmd {
            SessionCommand::Message {
                pending_id,
                target,
                text,
                kind,
            } => {
                let echo = live.negotiator.has_cap("echo-message");
                for (i, part) in text.split('\n').enumerate() {
                    let part = part.trim_end_matches('\r');
                    if part.is_empty() {
                        continue;
                    }
                    if echo {
                        // Continuation lines get their own ids above the reserved one.
                        let id = if i == 0 {
                            pending_id
                        } else {
                            self.labels.fetch_add(1, Ordering::Relaxed)
                        };
                        self.bus.publish(Event::OutboundMessage {
                            pending_id: id,
                            target: target.clone(),
                            text: part.to_string(),
                            kind,
                        });
                    }
                    let line = match kind {
                        MessageKind::Privmsg => format!("PRIVMSG {target} :{part}"),
                        MessageKind::Notice => format!("NOTICE {target} :{part}"),
                        MessageKind::Action => format!("PRIVMSG {target} :\x01ACTION {part}\x01"),
                    };
                    send_line(writer, &line).await?;
                }
            }
            SessionCommand::Labeled { line, context } => {
                if live.negotiator.has_cap("labeled-response") {
                    let label = format!("hl{}", self.labels.fetch_add(1, Ordering::Relaxed));
                    self.bus.publish(Event::LabeledRequestSent {
                        label: label.clone(),
                        context,
                        preview: preview(&line),
                    });
                    send_line(writer, &format!("@label={label} {line}")).await?;
                } else {
                    send_line(writer, &line).await?;
                }
            }
            SessionCommand::Raw(line) => send_line(writer, &line).await?,
            SessionCommand::Ping => send_line(writer, "PING :keepalive").await?,
            SessionCommand::Quit(reason) => send_line(writer, &format!("QUIT :{reason}")).await?,
        }
        Ok(())
    }
}

/// PRIVMSG/NOTICE kind, with CTCP ACTION unwrapped.
fn classify(command: &str, text: &str) -> (MessageKind, String) {
    if command == "NOTICE" {
        return (MessageKind::Notice, text.to_string());
    }
    match text.strip_prefix("\x01ACTION ") {
        Some(body) => (MessageKind::Action, body.trim_end_matches('\x01').to_string()),
        None => (MessageKind::Privmsg, text.to_string()),
    }
}

fn preview(line: &str) -> String {
    if line.chars().count() <= PREVIEW_LEN {
        line.to_string()
    } else {
        let cut: String = line.chars().take(PREVIEW_LEN).collect();
        format!("{cut}…")
    }
}

/// Write one protocol line. Embedded CR/LF are flattened to spaces.
pub async fn send_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    let clean = line.replace(['\r', '\n'], " ");
    tracing::trace!(line = %clean, ">>");
    writer.write_all(clean.as_bytes()).await?;
    writer.write_all(b"\r\n").await?;
    writer.flush().await
}
