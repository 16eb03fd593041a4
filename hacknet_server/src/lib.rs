//! hacknet server
//!
//! Drives every World of a hacknet server from one tick loop and connects
//! players to it over TCP.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  JSON lines  ┌──────────────┐
//! │  client    │─────────────►│ net (tokio)  │── enqueue ──┐
//! └────────────┘◄─────────────└──────────────┘             ▼
//!        ▲        OutputEvent                      ┌──────────────┐
//!        │                                         │ CommandQueue │
//!        │                                         └──────┬───────┘
//!        │                                                │ drain_into
//!        │           ┌────────────────────────────────────▼───────┐
//!        └───────────│ TickDriver: World::tick for every World    │
//!          flush     │ periodic Persistence::sync                 │
//!                    └────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hacknet_server::{bootstrap, ServerConfig, TickDriver};
//!
//! let config = ServerConfig::default();
//! let store = Arc::new(SledStore::open(&config.db_path)?);
//! let queue = Arc::new(CommandQueue::new());
//! let worlds = bootstrap::load_worlds(&config, store.as_ref(), bootstrap::builtin_registry(), queue.clone())?;
//!
//! let mut driver = TickDriver::new(TokioClock::shared(), worlds, queue, store, &config);
//! driver.run().await;
//! ```

pub mod bootstrap;
mod clock;
mod config;
mod driver;
mod error;
pub mod net;

pub use clock::ManualClock;
pub use config::ServerConfig;
pub use driver::{DriverStats, TickDriver};
pub use error::ServerError;
