//! Worker server: connects out to the registry and serves calls.
//!
//! Lifecycle: `Stopped → Registering → Listening → (ConnectionLost →)
//! CleaningUp → Stopped`. Reconnecting is left to the caller: subscribe to
//! [`WorkerEvent::ConnectionLost`] and call [`WorkerServer::start`] again.
//! Every start is a new session, and each session reports its loss at most
//! once no matter how many paths (read failure, send failure, `stop`) race
//! to end it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{Envelope, RegisterWorkerRequest};
use crate::bridge::transport::connect;
use crate::connection::{Connection, ConnectionReader};
use crate::correlation::ResponseChannel;
use crate::dispatch::{Dispatch, MethodTable, RequestHandler, handle_guarded};
use crate::error::{Result, RpcError};
use crate::registry::DEFAULT_REGISTRY_PIPE;

pub const DEFAULT_WORKER_PIPE_PREFIX: &str = "pipe-rpc.worker.";

const EVENT_CAPACITY: usize = 16;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub registry_pipe_name: String,
    pub worker_id: String,
    /// The worker's own channel name is this prefix followed by its id.
    pub pipe_prefix: String,
    /// How long to keep retrying while the registry is not listening yet.
    pub connect_timeout: Duration,
    /// Timeout for calls made to the registry.
    pub request_timeout: Duration,
    /// How long `stop` waits for the listen loop to exit.
    pub stop_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_PIPE)
    }
}

impl WorkerConfig {
    pub fn new(registry_pipe_name: impl Into<String>) -> Self {
        Self {
            registry_pipe_name: registry_pipe_name.into(),
            worker_id: uuid::Uuid::new_v4().simple().to_string(),
            pipe_prefix: DEFAULT_WORKER_PIPE_PREFIX.to_string(),
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(2),
        }
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_pipe_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.pipe_prefix = prefix.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn pipe_name(&self) -> String {
        format!("{}{}", self.pipe_prefix, self.worker_id)
    }

    fn validate(&self) -> Result<()> {
        if self.registry_pipe_name.trim().is_empty() {
            return Err(RpcError::protocol("registry pipe name must not be empty"));
        }
        if self.worker_id.trim().is_empty() {
            return Err(RpcError::protocol("worker id must not be empty"));
        }
        if self.pipe_prefix.trim().is_empty() {
            return Err(RpcError::protocol("worker pipe prefix must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Stopped,
    Registering,
    Listening,
    ConnectionLost,
    CleaningUp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    ConnectionLost { worker_id: String, reason: String },
}

struct Session {
    connection: Arc<Connection>,
    cancel: CancellationToken,
    listen: Option<JoinHandle<()>>,
    ended: Arc<AtomicBool>,
}

struct Shared {
    config: WorkerConfig,
    methods: MethodTable,
    fallback: RwLock<Option<Arc<dyn RequestHandler>>>,
    responses: ResponseChannel,
    session: Mutex<Option<Session>>,
    state: watch::Sender<WorkerState>,
    events: broadcast::Sender<WorkerEvent>,
}

/// Handle to a worker. Clones share the same server.
#[derive(Clone)]
pub struct WorkerServer {
    shared: Arc<Shared>,
}

impl WorkerServer {
    /// Create a worker that serves `methods`.
    pub fn new(config: WorkerConfig, methods: MethodTable) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(WorkerState::Stopped);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                methods,
                fallback: RwLock::new(None),
                responses: ResponseChannel::new(),
                session: Mutex::new(None),
                state,
                events,
            }),
        })
    }

    /// Handler for inbound calls whose method is not in the method table.
    pub fn set_fallback(&self, handler: impl RequestHandler) {
        match self.shared.fallback.write() {
            Ok(mut slot) => *slot = Some(Arc::new(handler)),
            Err(_) => tracing::error!("Worker fallback lock poisoned"),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.shared.config
    }

    pub fn worker_id(&self) -> &str {
        &self.shared.config.worker_id
    }

    pub fn state(&self) -> WorkerState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == WorkerState::Listening
    }

    pub fn watch_state(&self) -> watch::Receiver<WorkerState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Connect to the registry, register, and start serving in the background.
    pub async fn start(&self) -> Result<()> {
        let mut session = self.shared.session.lock().await;
        if self.state() != WorkerState::Stopped {
            return Err(RpcError::protocol("worker is already started"));
        }
        // A previous session that ended on its own; its task is already done.
        session.take();

        let config = &self.shared.config;
        let hello = Envelope::register_worker(&RegisterWorkerRequest {
            worker_id: config.worker_id.clone(),
            pipe_name: config.pipe_name(),
        })?;
        self.shared.state.send_replace(WorkerState::Registering);
        tracing::debug!(
            worker_id = %config.worker_id,
            registry = %config.registry_pipe_name,
            "Connecting to registry"
        );

        let stream = match connect(&config.registry_pipe_name, config.connect_timeout).await {
            Ok(stream) => stream,
            Err(e) => {
                self.shared.state.send_replace(WorkerState::Stopped);
                return Err(e.into());
            }
        };

        let cancel = CancellationToken::new();
        let (connection, reader) = Connection::with_parent(stream, &cancel);
        if let Err(e) = connection.send(&hello).await {
            connection.close();
            self.shared.state.send_replace(WorkerState::Stopped);
            return Err(e);
        }

        let ended = Arc::new(AtomicBool::new(false));
        self.shared.state.send_replace(WorkerState::Listening);
        let listen = tokio::spawn(listen_loop(
            Arc::clone(&self.shared),
            Arc::clone(&connection),
            reader,
            cancel.clone(),
            Arc::clone(&ended),
        ));
        *session = Some(Session {
            connection,
            cancel,
            listen: Some(listen),
            ended,
        });

        tracing::info!(
            worker_id = %config.worker_id,
            registry = %config.registry_pipe_name,
            "Worker registered with registry"
        );
        Ok(())
    }

    /// Cancel the session, give the listen loop `stop_grace` to exit, then
    /// tear down the connection. Does not publish `ConnectionLost`.
    pub async fn stop(&self) {
        let mut guard = self.shared.session.lock().await;
        let Some(mut session) = guard.take() else {
            return;
        };
        session.cancel.cancel();

        if let Some(mut listen) = session.listen.take() {
            let grace = self.shared.config.stop_grace;
            if tokio::time::timeout(grace, &mut listen).await.is_err() {
                tracing::warn!(?grace, "Listen loop did not exit in time, aborting");
                listen.abort();
            }
        }

        self.shared
            .end_session(&session.connection, &session.ended, "worker stopped", false);
        session.connection.shutdown().await;
        tracing::info!(worker_id = %self.shared.config.worker_id, "Worker stopped");
    }

    /// Send `request` to the registry and wait for the reply.
    pub async fn send_request(&self, request: &Envelope, timeout: Duration) -> Result<Envelope> {
        let (connection, ended) = self.current_session().await?;
        let pending = self
            .shared
            .responses
            .register(request, timeout, Some(connection.id()))?;
        tracing::trace!(
            method = request.kind(),
            request_id = %request.request_id(),
            message_id = %request.message_id(),
            "Sending request to registry"
        );
        if let Err(e) = connection.send(request).await {
            self.shared.responses.fail(request, e.clone());
            self.shared
                .end_session(&connection, &ended, &e.to_string(), true);
        }
        pending.wait().await
    }

    /// Send `request` to the registry without waiting for anything back.
    pub async fn post(&self, request: &Envelope) -> Result<()> {
        let (connection, ended) = self.current_session().await?;
        connection.send(request).await.inspect_err(|e| {
            self.shared
                .end_session(&connection, &ended, &e.to_string(), true);
        })
    }

    async fn current_session(&self) -> Result<(Arc<Connection>, Arc<AtomicBool>)> {
        let guard = self.shared.session.lock().await;
        match guard.as_ref() {
            Some(session) if !session.ended.load(Ordering::Acquire) => Ok((
                Arc::clone(&session.connection),
                Arc::clone(&session.ended),
            )),
            _ => Err(RpcError::NotConnected),
        }
    }

    #[cfg(test)]
    pub(crate) fn responses(&self) -> &ResponseChannel {
        &self.shared.responses
    }
}

impl Shared {
    fn fallback(&self) -> Option<Arc<dyn RequestHandler>> {
        self.fallback.read().ok().and_then(|slot| slot.clone())
    }

    /// Tear down one session. Only the first caller per session does anything.
    fn end_session(&self, connection: &Connection, ended: &AtomicBool, reason: &str, lost: bool) {
        if ended.swap(true, Ordering::AcqRel) {
            return;
        }
        let worker_id = &self.config.worker_id;
        if lost {
            self.state.send_replace(WorkerState::ConnectionLost);
            tracing::warn!(%worker_id, %reason, "Connection to registry lost");
            let _ = self.events.send(WorkerEvent::ConnectionLost {
                worker_id: worker_id.clone(),
                reason: reason.to_string(),
            });
        }
        self.state.send_replace(WorkerState::CleaningUp);
        connection.close();
        self.responses
            .fail_connection(connection.id(), RpcError::connection_lost(reason));
        self.state.send_replace(WorkerState::Stopped);
    }
}

async fn listen_loop(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut reader: ConnectionReader,
    cancel: CancellationToken,
    ended: Arc<AtomicBool>,
) {
    let reason = loop {
        let envelope = match reader.next().await {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => break format!("read failed: {e}"),
            None => break "registry closed the connection".to_string(),
        };
        tracing::trace!(
            method = envelope.kind(),
            message_id = %envelope.message_id(),
            "Received envelope"
        );

        let Some(request) = shared.responses.offer(envelope) else {
            continue;
        };
        if let Some(tag) = request.control_tag() {
            tracing::debug!(%tag, message_id = %request.message_id(), "Dropping unsolicited control message");
            continue;
        }

        tokio::spawn(handle_request(
            Arc::clone(&shared),
            Arc::clone(&connection),
            request,
        ));
    };

    // An explicit stop is not a lost connection.
    let lost = !cancel.is_cancelled();
    shared.end_session(&connection, &ended, &reason, lost);
}

async fn handle_request(shared: Arc<Shared>, connection: Arc<Connection>, request: Envelope) {
    let reply = match shared.methods.dispatch(&request).await {
        Dispatch::Reply(reply) => Some(reply),
        Dispatch::NoReply => None,
        Dispatch::NotFound => match shared.fallback() {
            Some(fallback) => {
                handle_guarded(fallback.as_ref(), request, connection.close_signal()).await
            }
            None => {
                let message = RpcError::MethodNotFound(request.kind().to_string()).to_string();
                Some(request.error_reply(message))
            }
        },
    };

    if let Some(reply) = reply
        && let Err(e) = connection.send(&reply).await
    {
        tracing::debug!(message_id = %reply.message_id(), error = %e, "Failed to send reply");
    }
}
