//! Shared helpers: an in-memory connector and a scripted fake server.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;

use halyard_sdk::bus::EventStream;
use halyard_sdk::config::{EngineConfig, ServerConfig};
use halyard_sdk::engine::Engine;
use halyard_sdk::sts::{MemoryStsStore, StsStore};
use halyard_sdk::transport::{Connection, Connector, Endpoint};
use halyard_sdk::{Error, Event, ServerId};

/// Generous: paused-clock tests auto-advance through long waits.
pub const TIMEOUT: Duration = Duration::from_secs(600);

/// Hands the server end of every connection to the test.
pub struct DuplexConnector {
    accepted: mpsc::UnboundedSender<(Endpoint, DuplexStream)>,
    refuse: bool,
}

impl Connector for DuplexConnector {
    fn connect<'a>(&'a self, endpoint: &'a Endpoint) -> BoxFuture<'a, halyard_sdk::Result<Connection>> {
        Box::pin(async move {
            if self.refuse {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    "refused",
                )));
            }
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.accepted
                .send((endpoint.clone(), server))
                .map_err(|_| Error::Closed)?;
            Ok(Connection {
                stream: Box::new(client),
                secure: endpoint.tls,
            })
        })
    }
}

pub struct Harness {
    pub engine: Engine,
    pub id: ServerId,
    pub accepted: mpsc::UnboundedReceiver<(Endpoint, DuplexStream)>,
}

impl Harness {
    /// Wait for the engine to open the next connection.
    pub async fn accept(&mut self) -> FakeServer {
        let (endpoint, stream) = timeout(TIMEOUT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("connector dropped");
        FakeServer::new(endpoint, stream)
    }
}

pub fn server_config(nick: &str) -> ServerConfig {
    let mut config = ServerConfig::new("test", "irc.example.net", nick);
    config.tls = false;
    config.port = Some(6667);
    config
}

pub fn harness(server: ServerConfig, tweak: impl FnOnce(&mut EngineConfig)) -> Harness {
    harness_with_store(server, tweak, Arc::new(MemoryStsStore::default()), false)
}

pub fn harness_with_store(
    server: ServerConfig,
    tweak: impl FnOnce(&mut EngineConfig),
    store: Arc<dyn StsStore>,
    refuse: bool,
) -> Harness {
    let id = server.id.clone();
    let mut config = EngineConfig {
        servers: vec![server],
        ..Default::default()
    };
    // The fake server never closes on its own after QUIT.
    config.liveness.goodbye_timeout_ms = 200;
    tweak(&mut config);
    let (tx, rx) = mpsc::unbounded_channel();
    let connector = Arc::new(DuplexConnector {
        accepted: tx,
        refuse,
    });
    let engine = Engine::with_connector(config, store, connector).expect("engine");
    Harness {
        engine,
        id,
        accepted: rx,
    }
}

/// Server side of one connection.
pub struct FakeServer {
    pub endpoint: Endpoint,
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    pub fn new(endpoint: Endpoint, stream: DuplexStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            endpoint,
            reader: BufReader::new(r),
            writer: w,
        }
    }

    /// Next line from the client, `None` at EOF.
    pub async fn read_line(&mut self) -> Option<String> {
        let mut line = String::new();
        let n = timeout(TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("timed out reading from client")
            .ok()?;
        if n == 0 {
            return None;
        }
        Some(line.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read until a line starts with `prefix`.
    pub async fn expect(&mut self, prefix: &str) -> String {
        loop {
            match self.read_line().await {
                Some(line) if line.starts_with(prefix) => return line,
                Some(_) => continue,
                None => panic!("client closed before sending {prefix:?}"),
            }
        }
    }

    /// Everything the client still sends until it closes.
    pub async fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(line) = self.read_line().await {
            out.push(line);
        }
        out
    }

    pub async fn send(&mut self, line: &str) {
        self.writer
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .expect("write to client");
    }

    /// Offer `caps`, ACK whatever is requested, then welcome `nick`.
    pub async fn register(&mut self, nick: &str, caps: &str) -> Vec<String> {
        self.expect("CAP LS").await;
        self.send(&format!(":srv CAP * LS :{caps}")).await;
        let mut requested = Vec::new();
        loop {
            let line = self.read_line().await.expect("client closed during CAP");
            if let Some(list) = line.strip_prefix("CAP REQ :") {
                requested.extend(list.split(' ').map(String::from));
                self.send(&format!(":srv CAP {nick} ACK :{list}")).await;
            } else if line == "CAP END" {
                break;
            }
        }
        self.send(&format!(":srv 001 {nick} :Welcome")).await;
        requested
    }
}

/// Wait for an event matching `predicate`, skipping others.
pub async fn wait_for<F: Fn(&Event) -> bool>(events: &mut EventStream, predicate: F, desc: &str) -> Event {
    let result = timeout(TIMEOUT, async {
        while let Some(ev) = events.recv().await {
            if predicate(&ev.event) {
                return Some(ev.event);
            }
        }
        None
    })
    .await;
    match result {
        Ok(Some(ev)) => ev,
        Ok(None) => panic!("stream ended waiting for {desc}"),
        Err(_) => panic!("timed out waiting for {desc}"),
    }
}

/// Collect events up to and including the first match.
pub async fn collect_until<F: Fn(&Event) -> bool>(
    events: &mut EventStream,
    predicate: F,
    desc: &str,
) -> Vec<Event> {
    let result = timeout(TIMEOUT, async {
        let mut seen = Vec::new();
        while let Some(ev) = events.recv().await {
            let done = predicate(&ev.event);
            seen.push(ev.event);
            if done {
                return Some(seen);
            }
        }
        None
    })
    .await;
    match result {
        Ok(Some(seen)) => seen,
        Ok(None) => panic!("stream ended waiting for {desc}"),
        Err(_) => panic!("timed out waiting for {desc}"),
    }
}

/// Everything already buffered on `events`.
pub fn drain_events(events: &mut EventStream) -> Vec<Event> {
    let mut out = Vec::new();
    while let Some(ev) = events.try_recv() {
        out.push(ev.event);
    }
    out
}
