//! Per-server connection supervisor.
//!
//! One actor task per configured server owns that server's
//! [`ConnectionState`] and reconnect bookkeeping. Everything that can
//! change state (API calls, session reports, timer firings) arrives as a
//! message on its mailbox, so transitions are serialized without locks.
//!
//! Timer and session messages carry the generation they were created for.
//! Anything stamped with a stale generation is dropped, which is what keeps
//! a late report from a replaced session or a cancelled timer from acting
//! twice.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Duration, Instant, MissedTickBehavior};

use crate::backoff::Backoff;
use crate::bus::ServerBus;
use crate::config::{LivenessConfig, ReconnectConfig, ServerConfig};
use crate::error::{Error, Result};
use crate::event::{ConnectionState, Event, ServerId};
use crate::session::{Report, Session, SessionCommand, SessionReport};
use crate::sts::StsCache;
use crate::transport::{Connector, Endpoint};

/// Observable state of one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub state: ConnectionState,
    pub nick: Option<String>,
}

enum Command {
    Connect,
    Disconnect {
        reason: Option<String>,
    },
    Send {
        command: SessionCommand,
        reply: oneshot::Sender<Result<()>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
    Tick {
        generation: u64,
    },
    ReconnectDue {
        generation: u64,
    },
    GoodbyeDeadline {
        generation: u64,
    },
}

struct Timer {
    generation: u64,
    handle: JoinHandle<()>,
}

/// Reconnect and liveness bookkeeping for the current connection cycle.
#[derive(Default)]
struct ReconnectContext {
    attempt: u32,
    last_inbound: Option<Instant>,
    last_ping: Option<Instant>,
    reconnect_timer: Option<Timer>,
    goodbye_timer: Option<Timer>,
    ticker: Option<JoinHandle<()>>,
    /// Set by an explicit disconnect; blocks automatic reconnection.
    manual_disconnect: bool,
    /// Skip exactly one automatic reconnect (fatal auth failure).
    suppress_next_reconnect: bool,
}

impl ReconnectContext {
    fn cancel_reconnect_timer(&mut self) {
        if let Some(timer) = self.reconnect_timer.take() {
            timer.handle.abort();
        }
    }

    fn cancel_goodbye_timer(&mut self) {
        if let Some(timer) = self.goodbye_timer.take() {
            timer.handle.abort();
        }
    }

    fn stop_ticker(&mut self) {
        if let Some(handle) = self.ticker.take() {
            handle.abort();
        }
    }

    fn cancel_all(&mut self) {
        self.cancel_reconnect_timer();
        self.cancel_goodbye_timer();
        self.stop_ticker();
    }
}

struct SessionHandle {
    generation: u64,
    endpoint: Endpoint,
    commands: mpsc::UnboundedSender<SessionCommand>,
    task: JoinHandle<()>,
}

/// Shared pieces every supervisor needs.
#[derive(Clone)]
pub struct SupervisorDeps {
    pub bus: ServerBus,
    pub sts: Arc<StsCache>,
    pub connector: Arc<dyn Connector>,
    pub labels: Arc<AtomicU64>,
    pub reconnect: ReconnectConfig,
    pub liveness: LivenessConfig,
}

struct Supervisor {
    id: ServerId,
    config: ServerConfig,
    deps: SupervisorDeps,
    backoff: Backoff,
    state: ConnectionState,
    nick: Option<String>,
    ctx: ReconnectContext,
    session: Option<SessionHandle>,
    session_generation: u64,
    timer_generation: u64,
    /// A connect request that arrived while disconnecting.
    pending_connect: bool,
    disconnect_reason: Option<String>,
    mailbox: mpsc::WeakUnboundedSender<Command>,
    reports_tx: mpsc::UnboundedSender<SessionReport>,
    snapshot: watch::Sender<Snapshot>,
}

/// Handle to a running supervisor.
pub struct SupervisorHandle {
    id: ServerId,
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Snapshot>,
}

impl SupervisorHandle {
    /// Spawn the supervisor task for `config`. It starts disconnected.
    pub fn spawn(config: ServerConfig, deps: SupervisorDeps) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot_rx) = watch::channel(Snapshot::default());
        let id = config.id.clone();
        let supervisor = Supervisor {
            id: id.clone(),
            backoff: Backoff::new(&deps.reconnect),
            config,
            deps,
            state: ConnectionState::Disconnected,
            nick: None,
            ctx: ReconnectContext::default(),
            session: None,
            session_generation: 0,
            timer_generation: 0,
            pending_connect: false,
            disconnect_reason: None,
            mailbox: tx.downgrade(),
            reports_tx,
            snapshot: snapshot_tx,
        };
        tokio::spawn(supervisor.run(rx, reports_rx));
        Self {
            id,
            tx,
            snapshot: snapshot_rx,
        }
    }

    pub fn id(&self) -> &ServerId {
        &self.id
    }

    fn post(&self, command: Command) -> Result<()> {
        self.tx.send(command).map_err(|_| Error::Closed)
    }

    /// Request a connection. No-op unless disconnected; queued while a
    /// graceful disconnect is still in progress.
    pub fn connect(&self) -> Result<()> {
        self.post(Command::Connect)
    }

    /// Close gracefully and stop reconnecting.
    pub fn disconnect(&self, reason: Option<String>) -> Result<()> {
        self.post(Command::Disconnect { reason })
    }

    /// Hand a command to the live session.
    pub async fn send(&self, command: SessionCommand) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.post(Command::Send { command, reply })?;
        rx.await.map_err(|_| Error::Closed)?
    }

    pub fn state(&self) -> ConnectionState {
        self.snapshot.borrow().state
    }

    pub fn nick(&self) -> Option<String> {
        self.snapshot.borrow().nick.clone()
    }

    /// Watch state and nick changes.
    pub fn watch(&self) -> watch::Receiver<Snapshot> {
        self.snapshot.clone()
    }

    /// Stop the supervisor, closing any connection within the goodbye
    /// timeout. No timer of this supervisor fires afterwards.
    pub async fn shutdown(&self) {
        let (done, rx) = oneshot::channel();
        if self.post(Command::Shutdown { done }).is_ok() {
            let _ = rx.await;
        }
    }
}

impl Supervisor {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<Command>,
        mut reports: mpsc::UnboundedReceiver<SessionReport>,
    ) {
        tracing::debug!(server = %self.id, "Supervisor started");
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        Command::Connect => self.connect(),
                        Command::Disconnect { reason } => self.disconnect(reason),
                        Command::Send { command, reply } => {
                            let _ = reply.send(self.forward(command));
                        }
                        Command::Shutdown { done } => {
                            self.shutdown().await;
                            let _ = done.send(());
                            return;
                        }
                        Command::Tick { generation } => self.on_tick(generation),
                        Command::ReconnectDue { generation } => self.on_reconnect_due(generation),
                        Command::GoodbyeDeadline { generation } => self.on_goodbye_deadline(generation),
                    }
                }
                Some(report) = reports.recv() => self.on_report(report),
            }
        }
        // Every handle is gone.
        self.shutdown().await;
    }

    // ── State ──────────────────────────────────────────────────────

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            tracing::debug!(server = %self.id, from = %self.state, to = %state, "State change");
            self.state = state;
        }
        self.publish_snapshot();
    }

    fn publish_snapshot(&self) {
        let snapshot = Snapshot {
            state: self.state,
            nick: self.nick.clone(),
        };
        self.snapshot.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn publish(&self, event: Event) {
        self.deps.bus.publish(event);
    }

    fn next_timer_generation(&mut self) -> u64 {
        self.timer_generation += 1;
        self.timer_generation
    }

    /// Post `command` to our own mailbox after `delay`.
    fn after(&self, delay: Duration, command: Command) -> Option<JoinHandle<()>> {
        let tx = self.mailbox.upgrade()?;
        Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(command);
        }))
    }

    // ── API ────────────────────────────────────────────────────────

    fn connect(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                self.ctx.manual_disconnect = false;
                self.ctx.attempt = 0;
                self.open_session();
            }
            ConnectionState::Disconnecting => {
                tracing::debug!(server = %self.id, "Connect queued behind disconnect");
                self.pending_connect = true;
            }
            state => {
                tracing::debug!(server = %self.id, %state, "Connect ignored");
            }
        }
    }

    fn disconnect(&mut self, reason: Option<String>) {
        self.ctx.manual_disconnect = true;
        self.pending_connect = false;
        self.ctx.cancel_reconnect_timer();
        match self.state {
            ConnectionState::Disconnected => {
                tracing::debug!(server = %self.id, "Already disconnected");
            }
            ConnectionState::Disconnecting => {
                if reason.is_some() {
                    self.disconnect_reason = reason;
                }
            }
            ConnectionState::Reconnecting => {
                self.set_state(ConnectionState::Disconnected);
                self.publish(Event::Disconnected {
                    reason: reason.unwrap_or_else(|| "reconnect cancelled".to_string()),
                });
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                self.ctx.stop_ticker();
                self.set_state(ConnectionState::Disconnecting);
                let quit = reason.clone().unwrap_or_else(|| self.config.quit_message.clone());
                self.disconnect_reason = reason;
                if let Some(ref session) = self.session {
                    if session.commands.send(SessionCommand::Quit(quit)).is_err() {
                        tracing::debug!(server = %self.id, "Session already gone, command dropped");
                    }
                    // Bound the goodbye even if the session is wedged.
                    let generation = session.generation;
                    let deadline = self.deps.liveness.goodbye_timeout() + Duration::from_secs(1);
                    if let Some(handle) = self.after(deadline, Command::GoodbyeDeadline { generation }) {
                        self.ctx.cancel_goodbye_timer();
                        self.ctx.goodbye_timer = Some(Timer { generation, handle });
                    }
                } else {
                    self.finish_disconnect(None);
                }
            }
        }
    }

    fn forward(&self, command: SessionCommand) -> Result<()> {
        match self.session {
            Some(ref session) if self.state == ConnectionState::Connected => session
                .commands
                .send(command)
                .map_err(|_| Error::NotConnected(self.id.clone())),
            _ => Err(Error::NotConnected(self.id.clone())),
        }
    }

    async fn shutdown(&mut self) {
        self.ctx.cancel_all();
        self.pending_connect = false;
        if let Some(session) = self.session.take() {
            let quit = self.config.quit_message.clone();
            if session.commands.send(SessionCommand::Quit(quit)).is_err() {
                tracing::debug!(server = %self.id, "Session already gone, command dropped");
            }
            let mut task = session.task;
            let limit = self.deps.liveness.goodbye_timeout() + Duration::from_millis(500);
            if tokio::time::timeout(limit, &mut task).await.is_err() {
                task.abort();
            }
        }
        if self.state != ConnectionState::Disconnected {
            self.nick = None;
            self.set_state(ConnectionState::Disconnected);
            self.publish(Event::Disconnected {
                reason: "shutdown".to_string(),
            });
        }
        tracing::debug!(server = %self.id, "Supervisor stopped");
    }

    // ── Sessions ───────────────────────────────────────────────────

    fn open_session(&mut self) {
        self.ctx.cancel_reconnect_timer();
        self.set_state(ConnectionState::Connecting);

        let mut endpoint = Endpoint::from_config(&self.config);
        if self.deps.sts.apply(&mut endpoint, Utc::now()) {
            self.publish(Event::StsUpgraded {
                host: endpoint.host.clone(),
                port: endpoint.port,
            });
        }
        self.publish(Event::Connecting {
            host: endpoint.host.clone(),
            port: endpoint.port,
            tls: endpoint.tls,
        });

        self.session_generation += 1;
        let generation = self.session_generation;
        let (commands, commands_rx) = mpsc::unbounded_channel();
        let session = Session {
            server: self.id.clone(),
            generation,
            config: self.config.clone(),
            endpoint: endpoint.clone(),
            connect_timeout: self.deps.liveness.connect_timeout(),
            goodbye_timeout: self.deps.liveness.goodbye_timeout(),
            connector: self.deps.connector.clone(),
            sts: self.deps.sts.clone(),
            bus: self.deps.bus.clone(),
            reports: self.reports_tx.clone(),
            labels: self.deps.labels.clone(),
        };
        tracing::info!(server = %self.id, generation, attempt = self.ctx.attempt, "Opening session");
        let task = tokio::spawn(session.run(commands_rx));
        self.session = Some(SessionHandle {
            generation,
            endpoint,
            commands,
            task,
        });
    }

    fn on_report(&mut self, report: SessionReport) {
        let current = self.session.as_ref().map(|s| s.generation);
        if current != Some(report.generation) {
            tracing::trace!(server = %self.id, generation = report.generation, "Stale session report");
            return;
        }
        match report.report {
            Report::Opened { secure } => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                self.ctx.attempt = 0;
                self.ctx.last_inbound = Some(Instant::now());
                self.ctx.last_ping = None;
                self.set_state(ConnectionState::Connected);
                if let Some(ref session) = self.session {
                    self.publish(Event::Connected {
                        host: session.endpoint.host.clone(),
                        port: session.endpoint.port,
                        tls: secure,
                    });
                }
                self.start_ticker(report.generation);
            }
            Report::Activity(at) => {
                self.ctx.last_inbound = Some(at);
            }
            Report::Nick(nick) => {
                self.nick = Some(nick);
                self.publish_snapshot();
            }
            Report::AuthFatal(reason) => {
                tracing::warn!(server = %self.id, %reason, "Fatal authentication failure");
                self.ctx.suppress_next_reconnect = true;
                self.force_close(reason);
            }
            Report::Ended(reason) => {
                if let Some(session) = self.session.take() {
                    drop(session.commands);
                }
                if self.state == ConnectionState::Disconnecting {
                    self.finish_disconnect(Some(reason));
                } else {
                    self.connection_lost(reason);
                }
            }
        }
    }

    /// Drop the session locally without waiting on the OS.
    fn force_close(&mut self, reason: String) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
        if self.state == ConnectionState::Disconnecting {
            self.finish_disconnect(Some(reason));
        } else {
            self.connection_lost(reason);
        }
    }

    /// Unsolicited end of a connection cycle.
    fn connection_lost(&mut self, reason: String) {
        self.ctx.stop_ticker();
        self.ctx.cancel_goodbye_timer();
        self.nick = None;
        self.set_state(ConnectionState::Disconnected);
        tracing::info!(server = %self.id, %reason, "Disconnected");
        self.publish(Event::Disconnected {
            reason: reason.clone(),
        });

        if self.ctx.manual_disconnect {
            return;
        }
        if self.ctx.suppress_next_reconnect {
            self.ctx.suppress_next_reconnect = false;
            tracing::info!(server = %self.id, "Automatic reconnect suppressed");
            return;
        }

        let attempt = self.ctx.attempt + 1;
        if self.backoff.exhausted(attempt) {
            let reason = format!("gave up after {} attempts: {reason}", self.ctx.attempt);
            tracing::error!(server = %self.id, %reason, "Reconnect attempts exhausted");
            self.publish(Event::Fatal { reason });
            return;
        }
        self.ctx.attempt = attempt;
        let delay = self.backoff.delay(attempt, &mut rand::thread_rng());
        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(server = %self.id, attempt, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.publish(Event::Reconnecting {
            attempt,
            delay,
            reason,
        });

        let generation = self.next_timer_generation();
        match self.after(delay, Command::ReconnectDue { generation }) {
            Some(handle) => self.ctx.reconnect_timer = Some(Timer { generation, handle }),
            None => tracing::debug!(server = %self.id, "Mailbox closed, not reconnecting"),
        }
    }

    /// End of a graceful disconnect.
    fn finish_disconnect(&mut self, observed: Option<String>) {
        if let Some(session) = self.session.take() {
            session.task.abort();
        }
        self.ctx.stop_ticker();
        self.ctx.cancel_goodbye_timer();
        self.nick = None;
        self.set_state(ConnectionState::Disconnected);
        let reason = self
            .disconnect_reason
            .take()
            .or(observed)
            .unwrap_or_else(|| "disconnected".to_string());
        tracing::info!(server = %self.id, %reason, "Disconnected");
        self.publish(Event::Disconnected { reason });

        if std::mem::take(&mut self.pending_connect) {
            self.ctx.manual_disconnect = false;
            self.ctx.attempt = 0;
            self.open_session();
        }
    }

    // ── Timers ─────────────────────────────────────────────────────

    fn start_ticker(&mut self, generation: u64) {
        self.ctx.stop_ticker();
        let Some(tx) = self.mailbox.upgrade() else {
            return;
        };
        let period = self.deps.liveness.tick();
        self.ctx.ticker = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                if tx.send(Command::Tick { generation }).is_err() {
                    break;
                }
            }
        }));
    }

    fn on_tick(&mut self, generation: u64) {
        if generation != self.session_generation || self.state != ConnectionState::Connected {
            return;
        }
        let Some(last_inbound) = self.ctx.last_inbound else {
            return;
        };
        let now = Instant::now();
        let idle = now.duration_since(last_inbound);
        if idle > self.deps.liveness.timeout() {
            tracing::warn!(server = %self.id, idle_secs = idle.as_secs(), "Ping timeout");
            self.force_close("ping timeout".to_string());
            return;
        }
        let pinged_since_activity = self.ctx.last_ping.is_some_and(|p| p >= last_inbound);
        if idle >= self.deps.liveness.ping_after() && !pinged_since_activity {
            tracing::debug!(server = %self.id, idle_secs = idle.as_secs(), "Idle, sending keepalive");
            if let Some(ref session) = self.session {
                if session.commands.send(SessionCommand::Ping).is_err() {
                    tracing::debug!(server = %self.id, "Session already gone, command dropped");
                }
            }
            self.ctx.last_ping = Some(now);
        }
    }

    fn on_reconnect_due(&mut self, generation: u64) {
        let due = self
            .ctx
            .reconnect_timer
            .as_ref()
            .is_some_and(|t| t.generation == generation);
        if !due {
            return;
        }
        self.ctx.reconnect_timer = None;
        if self.state == ConnectionState::Reconnecting && !self.ctx.manual_disconnect {
            self.open_session();
        }
    }

    fn on_goodbye_deadline(&mut self, generation: u64) {
        let due = self
            .ctx
            .goodbye_timer
            .as_ref()
            .is_some_and(|t| t.generation == generation);
        if !due || self.state != ConnectionState::Disconnecting {
            return;
        }
        self.ctx.goodbye_timer = None;
        tracing::debug!(server = %self.id, "Goodbye deadline passed");
        self.finish_disconnect(Some("goodbye timed out".to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn context_cancel_all_clears_timers() {
        let mut ctx = ReconnectContext {
            reconnect_timer: Some(Timer {
                generation: 1,
                handle: tokio::spawn(std::future::pending::<()>()),
            }),
            ticker: Some(tokio::spawn(std::future::pending::<()>())),
            ..Default::default()
        };
        ctx.cancel_all();
        assert!(ctx.reconnect_timer.is_none());
        assert!(ctx.ticker.is_none());
        assert!(ctx.goodbye_timer.is_none());
    }
}
