//! hacknet Environment Abstraction Layer
//!
//! This crate holds the contracts between the simulation core and the
//! outside world, so the scheduler can run against real connections and
//! wall-clock time in production, and against in-memory contexts and a
//! manually advanced clock in tests.
//!
//! # What is abstracted
//!
//! - Time (`now()`, `sleep()`) through [`WorldClock`]
//! - Per-connection I/O through [`PersonContext`]: buffered output events,
//!   and the pending-input / response maps filled by network tasks
//!
//! # Example
//!
//! ```ignore
//! use hacknet_env::{PersonContext, SessionContext, ContextId, OutputEvent, OperationId};
//!
//! let ctx = SessionContext::new(ContextId::new());
//! ctx.write_event(OutputEvent::OperationComplete { operation_id: OperationId(1) });
//! ctx.flush()?;
//! ```

mod context;
mod error;
mod event;
mod person;
mod tokio_impl;
mod types;

pub use context::WorldClock;
pub use error::EnvError;
pub use event::OutputEvent;
pub use person::{PersonContext, SessionContext};
pub use tokio_impl::TokioClock;
pub use types::{ContextId, OperationId, Pid, SystemId, WorldId};
