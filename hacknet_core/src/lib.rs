//! hacknet Core - cooperative process scheduler for a multi-tenant hacking world
//!
//! Many users issue shell commands that run as cooperatively scheduled
//! processes against simulated machines. This crate is the kernel that keeps
//! that deterministic:
//! 1. **Suspension**: tasks advance one step at a time and wait on [`YieldToken`]s
//! 2. **Lifecycle**: processes complete exactly once; kills cascade children first
//! 3. **Scheduling**: a [`World`] dispatches queued commands and updates every
//!    [`Operation`] once per tick, on a single thread
//!
//! Network tasks never touch World state; they push into the shared
//! [`CommandQueue`] and the tick driver drains it.

pub mod error;
pub mod executable;
pub mod operation;
pub mod persistence;
pub mod plugin;
pub mod process;
pub mod programs;
pub mod queue;
pub mod system;
pub mod world;
pub mod yield_token;

use std::sync::{Mutex, MutexGuard, PoisonError};

// Re-export key types for convenience
pub use error::{DispatchError, FsError, KillError, PersistError, TaskError};
pub use executable::{
    task_fn, CompletionContext, Executable, ExecutableFactory, ExecutableRegistry, FnExecutable, Invocation, Step,
    StepContext, Task,
};
pub use operation::Operation;
pub use persistence::{MemoryStore, Persistence, SledStore, WorldSnapshot};
pub use plugin::{CronPlugin, PluginContext, WorldPlugin};
pub use process::{ChildHandle, CompletionKind, ExitWatch, Origin, Process, ProcessInfo, ProcessKey, ProcessTable};
pub use queue::{CommandQueue, KillTicket, QueuedCommand, QueuedRequest};
pub use system::{Account, Filesystem, Login, SystemDirectory, VirtualSystem};
pub use world::{World, WorldStats};
pub use yield_token::{InputSlot, YieldToken};

/// Locks a mutex shared with network tasks, recovering from poisoning.
///
/// A panic on another thread must not take the tick loop down with it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
