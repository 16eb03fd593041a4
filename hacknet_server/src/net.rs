//! TCP front end.
//!
//! Clients send one JSON request per line:
//!
//! ```text
//! {"type":"login","operation_id":1,"hostname":"localhost","user":"user"}
//! {"type":"command","operation_id":2,"line":"ls"}
//! {"type":"input","operation_id":3,"text":"yes"}
//! {"type":"response","key":"confirm:2","value":"y"}
//! {"type":"kill","operation_id":4,"pid":2}
//! ```
//!
//! and receive every [`OutputEvent`] as one JSON line. Connection tasks
//! never touch a World: they only enqueue requests or fill the context's
//! input and response maps. Each connection owns one [`SessionContext`]
//! whose flushes feed a writer task.

use crate::error::ServerError;

use hacknet_core::{CommandQueue, CompletionKind};
use hacknet_env::{ContextId, OperationId, OutputEvent, PersonContext, Pid, SessionContext, WorldId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// A request read from a client connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Log in and start a shell. `world` defaults to the connection's current World.
    Login {
        operation_id: OperationId,
        #[serde(default)]
        world: Option<WorldId>,
        hostname: String,
        user: String,
    },

    /// Run a command line on the current system
    Command { operation_id: OperationId, line: String },

    /// Answer the prompt of the operation `operation_id`
    Input { operation_id: OperationId, text: String },

    /// Answer an interactive prompt keyed by name
    Response { key: String, value: String },

    /// Kill a process (and its children) on the current system
    Kill { operation_id: OperationId, pid: Pid },
}

/// Per-connection state: the context and the World requests go to.
pub struct Session {
    context: Arc<dyn PersonContext>,
    queue: Arc<CommandQueue>,
    world: WorldId,
    /// Worlds this connection has logged into
    joined: BTreeSet<WorldId>,
}

impl Session {
    pub fn new(context: Arc<dyn PersonContext>, queue: Arc<CommandQueue>, world: WorldId) -> Self {
        Self {
            context,
            queue,
            world,
            joined: BTreeSet::new(),
        }
    }

    pub fn context(&self) -> &Arc<dyn PersonContext> {
        &self.context
    }

    pub fn world(&self) -> WorldId {
        self.world
    }

    /// Translates a request into a queue entry or a context write.
    pub fn handle(&mut self, message: ClientMessage) {
        match message {
            ClientMessage::Login {
                operation_id,
                world,
                hostname,
                user,
            } => {
                if let Some(world) = world {
                    self.world = world;
                }
                self.joined.insert(self.world);
                self.queue
                    .enqueue_login(self.world, self.context.clone(), operation_id, hostname, user);
            }
            ClientMessage::Command { operation_id, line } => {
                self.queue.enqueue(self.world, self.context.clone(), operation_id, line);
            }
            ClientMessage::Input { operation_id, text } => {
                self.context.submit_input(operation_id, text);
            }
            ClientMessage::Response { key, value } => {
                self.context.submit_response(key, value);
            }
            ClientMessage::Kill { operation_id, pid } => {
                self.queue.enqueue_kill(
                    self.world,
                    self.context.clone(),
                    operation_id,
                    None,
                    pid,
                    CompletionKind::KillLocal,
                    None,
                );
            }
        }
    }

    /// Queues the teardown of every login this connection made.
    pub fn disconnect(&mut self) {
        for world in std::mem::take(&mut self.joined) {
            self.queue.enqueue_disconnect(world, self.context.clone());
        }
    }
}

/// Pause after a failed accept, so running out of descriptors does not spin.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(50);

/// Accepts connections forever, one task per client.
pub async fn serve(listener: TcpListener, queue: Arc<CommandQueue>, default_world: WorldId) {
    info!(addr = ?listener.local_addr().ok(), "listening");
    accept_forever(
        || listener.accept(),
        |(stream, peer): (TcpStream, SocketAddr)| {
            info!(%peer, "client connected");
            let queue = queue.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, queue, default_world).await {
                    warn!(%peer, "connection ended with error: {}", e);
                }
                info!(%peer, "client disconnected");
            });
        },
    )
    .await
}

/// Hands every accepted connection to `on_connection`. Accept errors
/// (aborted handshakes, descriptor exhaustion) are logged and retried.
async fn accept_forever<T, A, F>(mut accept: A, mut on_connection: impl FnMut(T))
where
    A: FnMut() -> F,
    F: Future<Output = io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(connection) => on_connection(connection),
            Err(e) => {
                error!("Failed to accept connection: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

/// Serves one client until it closes the connection.
pub async fn handle_connection(
    stream: TcpStream,
    queue: Arc<CommandQueue>,
    default_world: WorldId,
) -> Result<(), ServerError> {
    let (reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Vec<OutputEvent>>();
    let replies = tx.clone();
    let context: Arc<dyn PersonContext> = Arc::new(SessionContext::with_sink(ContextId::new(), tx));
    let id = context.id();

    tokio::spawn(write_events(id, writer, rx));

    let mut session = Session::new(context, queue, default_world);
    let mut lines = BufReader::new(reader).lines();
    let result = loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break Ok(()),
            Err(e) => break Err(ServerError::from(e)),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<ClientMessage>(line) {
            Ok(message) => {
                debug!(context = %id, ?message, "request");
                session.handle(message);
            }
            Err(e) => {
                debug!(context = %id, "bad request: {}", e);
                let error = OutputEvent::Error {
                    operation_id: OperationId(0),
                    message: format!("bad request: {}", e),
                };
                if replies.send(vec![error]).is_err() {
                    break Ok(());
                }
            }
        }
    };

    session.disconnect();
    result
}

/// Writes flushed event batches as JSON lines until every sender is gone.
async fn write_events(id: ContextId, mut writer: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Vec<OutputEvent>>) {
    while let Some(batch) = rx.recv().await {
        let mut buf = Vec::new();
        for event in &batch {
            if let Err(e) = serde_json::to_writer(&mut buf, event) {
                warn!(context = %id, "failed to encode event: {}", e);
                continue;
            }
            buf.push(b'\n');
        }
        if let Err(e) = writer.write_all(&buf).await {
            debug!(context = %id, "write failed: {}", e);
            break;
        }
    }
}
