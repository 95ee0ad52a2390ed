//! Engine facade: one supervisor per configured server, a shared STS
//! cache, and the correlator between the raw and refined buses.
//!
//! The engine spawns tasks, so it must be created inside a tokio runtime.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bus::{EventBus, EventStream, ServerBus};
use crate::config::EngineConfig;
use crate::correlate::{self, Correlator};
use crate::error::{Error, Result};
use crate::event::{ConnectionState, MessageKind, ServerId};
use crate::session::SessionCommand;
use crate::sts::{JsonStsStore, MemoryStsStore, StsCache, StsStore};
use crate::supervisor::{Snapshot, SupervisorDeps, SupervisorHandle};
use crate::transport::{Connector, TcpConnector};

struct Server {
    bus: ServerBus,
    supervisor: SupervisorHandle,
}

pub struct Engine {
    order: Vec<ServerId>,
    servers: HashMap<ServerId, Server>,
    raw: EventBus,
    refined: EventBus,
    sts: Arc<StsCache>,
    ids: Arc<AtomicU64>,
    correlator: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build an engine over real TCP/TLS connections.
    pub fn new(config: EngineConfig, sts_store: impl StsStore + 'static) -> Result<Self> {
        Self::with_connector(config, Arc::new(sts_store), Arc::new(TcpConnector))
    }

    /// Pick the STS store from `config.sts_store`: a JSON file when set,
    /// memory otherwise.
    pub fn from_config(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn StsStore> = match config.sts_store {
            Some(ref path) => Arc::new(JsonStsStore::new(path.clone())),
            None => Arc::new(MemoryStsStore::default()),
        };
        Self::with_connector(config, store, Arc::new(TcpConnector))
    }

    /// Build an engine with a custom transport.
    pub fn with_connector(
        config: EngineConfig,
        sts_store: Arc<dyn StsStore>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        let sts = Arc::new(StsCache::load(sts_store, Utc::now())?);

        let raw = EventBus::new();
        let refined = EventBus::new();
        let correlator = Arc::new(Correlator::new(&config.correlation));
        let task = correlate::spawn(correlator, raw.subscribe(), refined.clone(), &config.correlation);

        let ids = Arc::new(AtomicU64::new(1));
        let mut order = Vec::with_capacity(config.servers.len());
        let mut servers = HashMap::with_capacity(config.servers.len());
        for server in &config.servers {
            let bus = ServerBus::new(server.id.clone(), raw.clone());
            let deps = SupervisorDeps {
                bus: bus.clone(),
                sts: sts.clone(),
                connector: connector.clone(),
                labels: ids.clone(),
                reconnect: config.reconnect.clone(),
                liveness: config.liveness.clone(),
            };
            let supervisor = SupervisorHandle::spawn(server.clone(), deps);
            order.push(server.id.clone());
            servers.insert(server.id.clone(), Server { bus, supervisor });
        }
        tracing::info!(servers = order.len(), sts_policies = sts.len(), "Engine started");

        Ok(Self {
            order,
            servers,
            raw,
            refined,
            sts,
            ids,
            correlator: Mutex::new(Some(task)),
        })
    }

    fn server(&self, id: &ServerId) -> Result<&Server> {
        self.servers
            .get(id)
            .ok_or_else(|| Error::UnknownServer(id.clone()))
    }

    /// Configured server ids, in config order.
    pub fn server_ids(&self) -> Vec<ServerId> {
        self.order.clone()
    }

    pub async fn connect(&self, id: &ServerId) -> Result<()> {
        self.server(id)?.supervisor.connect()
    }

    pub async fn disconnect(&self, id: &ServerId, reason: Option<&str>) -> Result<()> {
        self.server(id)?
            .supervisor
            .disconnect(reason.map(String::from))
    }

    /// Refined event stream for every server.
    pub fn events(&self) -> EventStream {
        self.refined.subscribe()
    }

    /// Uncorrelated events for every server, as sessions publish them.
    pub fn raw_events(&self) -> EventStream {
        self.raw.subscribe()
    }

    /// Uncorrelated events of one server.
    pub fn server_events(&self, id: &ServerId) -> Result<EventStream> {
        Ok(self.server(id)?.bus.subscribe())
    }

    /// Nick confirmed by the server, if registered.
    pub fn current_nick(&self, id: &ServerId) -> Option<String> {
        self.servers.get(id)?.supervisor.nick()
    }

    pub fn state(&self, id: &ServerId) -> Option<ConnectionState> {
        Some(self.servers.get(id)?.supervisor.state())
    }

    /// Watch state and nick changes of one server.
    pub fn watch(&self, id: &ServerId) -> Option<watch::Receiver<Snapshot>> {
        Some(self.servers.get(id)?.supervisor.watch())
    }

    pub fn sts(&self) -> &StsCache {
        &self.sts
    }

    /// Send a PRIVMSG. Returns the id an `OutboundMessage`/`EchoResolved`
    /// pair will carry when the server echoes messages.
    pub async fn send_message(&self, id: &ServerId, target: &str, text: &str) -> Result<u64> {
        self.send_text(id, target, text, MessageKind::Privmsg).await
    }

    pub async fn send_notice(&self, id: &ServerId, target: &str, text: &str) -> Result<u64> {
        self.send_text(id, target, text, MessageKind::Notice).await
    }

    pub async fn send_action(&self, id: &ServerId, target: &str, text: &str) -> Result<u64> {
        self.send_text(id, target, text, MessageKind::Action).await
    }

    async fn send_text(&self, id: &ServerId, target: &str, text: &str, kind: MessageKind) -> Result<u64> {
        let server = self.server(id)?;
        let pending_id = self.ids.fetch_add(1, Ordering::Relaxed);
        server
            .supervisor
            .send(SessionCommand::Message {
                pending_id,
                target: target.to_string(),
                text: text.to_string(),
                kind,
            })
            .await?;
        Ok(pending_id)
    }

    /// Send a command, labeled when the server supports it. Replies come
    /// back as `LabeledReply` events carrying `context`.
    pub async fn send_labeled(&self, id: &ServerId, line: &str, context: &str) -> Result<()> {
        self.server(id)?
            .supervisor
            .send(SessionCommand::Labeled {
                line: line.to_string(),
                context: context.to_string(),
            })
            .await
    }

    pub async fn send_raw(&self, id: &ServerId, line: &str) -> Result<()> {
        self.server(id)?
            .supervisor
            .send(SessionCommand::Raw(line.to_string()))
            .await
    }

    /// Close every connection, stop all timers and end every stream.
    pub async fn shutdown(&self) {
        futures::future::join_all(self.servers.values().map(|s| s.supervisor.shutdown())).await;
        for server in self.servers.values() {
            server.bus.close();
        }
        self.raw.close();
        let task = self.correlator.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        tracing::info!("Engine shut down");
    }
}
