//! Output events delivered from the simulation back to a person context.

use crate::types::{OperationId, Pid, SystemId};
use serde::{Deserialize, Serialize};

/// An event written by the simulation to a person context.
///
/// The transport decides how events are framed on the wire; the scheduler
/// only ever produces these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    /// One line of program output
    Output {
        operation_id: OperationId,
        text: String,
    },

    /// A dispatch or program error shown to the user
    Error {
        operation_id: OperationId,
        message: String,
    },

    /// A program is waiting for input keyed by `operation_id`
    Prompt {
        operation_id: OperationId,
        prompt: String,
    },

    /// The process behind `pid` was killed before finishing
    ProcessTerminated {
        operation_id: OperationId,
        pid: Pid,
    },

    /// The operation finished; no further events follow for it
    OperationComplete { operation_id: OperationId },

    /// The context is now logged in on `system`
    Bind {
        system: SystemId,
        hostname: String,
        user: String,
    },

    /// The login on `system` ended and was popped from the login stack
    Unbind { system: SystemId, user: String },
}

impl OutputEvent {
    /// Returns the operation this event belongs to, if any.
    pub fn operation_id(&self) -> Option<OperationId> {
        match self {
            OutputEvent::Output { operation_id, .. }
            | OutputEvent::Error { operation_id, .. }
            | OutputEvent::Prompt { operation_id, .. }
            | OutputEvent::ProcessTerminated { operation_id, .. }
            | OutputEvent::OperationComplete { operation_id } => Some(*operation_id),
            OutputEvent::Bind { .. } | OutputEvent::Unbind { .. } => None,
        }
    }

    /// Returns the text of an `Output` event.
    pub fn as_output(&self) -> Option<&str> {
        match self {
            OutputEvent::Output { text, .. } => Some(text),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_id_lookup() {
        let op = OperationId(3);
        let evt = OutputEvent::OperationComplete { operation_id: op };
        assert_eq!(evt.operation_id(), Some(op));

        let unbind = OutputEvent::Unbind {
            system: SystemId(1),
            user: "root".to_string(),
        };
        assert_eq!(unbind.operation_id(), None);
    }
}
