//! # halyard-sdk
//!
//! Multi-server IRC protocol engine.
//!
//! The engine owns the connection lifecycle to one or more IRC networks,
//! negotiates capabilities, SASL and secure-transport policies, and
//! republishes everything as an ordered, server-tagged event stream.
//!
//! ## Quick start
//!
//! ```no_run
//! # async fn example() -> halyard_sdk::Result<()> {
//! use halyard_sdk::config::EngineConfig;
//! use halyard_sdk::engine::Engine;
//! use halyard_sdk::sts::MemoryStsStore;
//!
//! let config = EngineConfig::load("halyard.toml")?;
//! let engine = Engine::new(config, MemoryStsStore::default())?;
//! let mut events = engine.events();
//! for id in engine.server_ids() {
//!     engine.connect(&id).await?;
//! }
//! while let Some(ev) = events.recv().await {
//!     println!("[{}] {:?}", ev.server, ev.event);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod bus;
pub mod cap;
pub mod config;
pub mod correlate;
pub mod engine;
pub mod error;
pub mod event;
pub mod irc;
pub mod sasl;
pub mod session;
pub mod sts;
pub mod supervisor;
pub mod transport;

pub use error::{Error, Result};
pub use event::{ConnectionState, Event, ServerEvent, ServerId};
