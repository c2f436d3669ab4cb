//! Registry server: accepts worker connections and routes calls to them.
//!
//! Lifecycle: `Stopped → Starting → Listening → Stopping → Stopped`.
//!
//! Each accepted connection gets its own task which
//! 1. waits for the `RegisterWorker` handshake (bounded by `handshake_timeout`),
//! 2. records the worker in the directory and publishes `WorkerConnected`,
//! 3. reads envelopes until the stream ends: replies go to the correlation
//!    table, anything else to the request handler on a task of its own,
//! 4. on exit removes the directory entry, fails calls still pending on the
//!    connection, and publishes `WorkerDisconnected`.

use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{Mutex, broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{ControlTag, Envelope, RegisterWorkerRequest};
use crate::bridge::transport::PipeListener;
use crate::connection::{Connection, ConnectionId, ConnectionReader};
use crate::correlation::ResponseChannel;
use crate::dispatch::{RequestHandler, handle_guarded};
use crate::error::{Result, RpcError};

pub const DEFAULT_REGISTRY_PIPE: &str = "pipe-rpc.registry";

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);
const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub pipe_name: String,
    /// Per-call response timeout.
    pub request_timeout: Duration,
    /// How long a new connection may take to send `RegisterWorker`.
    pub handshake_timeout: Duration,
    /// How long `stop` lets connections drain before closing them.
    pub shutdown_grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_PIPE)
    }
}

impl RegistryConfig {
    pub fn new(pipe_name: impl Into<String>) -> Self {
        Self {
            pipe_name: pipe_name.into(),
            request_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.pipe_name.trim().is_empty() {
            return Err(RpcError::protocol("registry pipe name must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryState {
    Stopped,
    Starting,
    Listening,
    Stopping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    WorkerConnected(String),
    WorkerDisconnected(String),
}

/// Directory entry for one registered worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub worker_id: String,
    /// The worker's own channel name, as announced in the handshake.
    pub pipe_name: String,
    pub connection_id: ConnectionId,
}

struct Lifecycle {
    accept_stop: CancellationToken,
    connections_stop: CancellationToken,
    accept: Option<JoinHandle<JoinSet<()>>>,
}

struct Shared {
    config: RegistryConfig,
    /// Keyed by ASCII-lowercased worker id.
    workers: DashMap<String, WorkerEntry>,
    connections: DashMap<ConnectionId, Arc<Connection>>,
    responses: ResponseChannel,
    handler: RwLock<Option<Arc<dyn RequestHandler>>>,
    events: broadcast::Sender<RegistryEvent>,
    state: watch::Sender<RegistryState>,
    lifecycle: Mutex<Lifecycle>,
}

/// Handle to a registry. Clones share the same server.
#[derive(Clone)]
pub struct RegistryServer {
    shared: Arc<Shared>,
}

/// Handle that does not keep the registry alive. Handlers installed on a
/// registry should hold this instead of a [`RegistryServer`].
#[derive(Clone)]
pub struct WeakRegistryServer {
    shared: Weak<Shared>,
}

impl WeakRegistryServer {
    pub fn upgrade(&self) -> Option<RegistryServer> {
        self.shared.upgrade().map(|shared| RegistryServer { shared })
    }
}

fn worker_key(worker_id: &str) -> String {
    worker_id.to_ascii_lowercase()
}

impl RegistryServer {
    pub fn new(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(RegistryState::Stopped);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                workers: DashMap::new(),
                connections: DashMap::new(),
                responses: ResponseChannel::new(),
                handler: RwLock::new(None),
                events,
                state,
                lifecycle: Mutex::new(Lifecycle {
                    accept_stop: CancellationToken::new(),
                    connections_stop: CancellationToken::new(),
                    accept: None,
                }),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakRegistryServer {
        WeakRegistryServer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Install the handler for inbound calls made by workers.
    pub fn set_handler(&self, handler: impl RequestHandler) {
        self.set_shared_handler(Arc::new(handler));
    }

    pub fn set_shared_handler(&self, handler: Arc<dyn RequestHandler>) {
        match self.shared.handler.write() {
            Ok(mut slot) => *slot = Some(handler),
            Err(_) => tracing::error!("Registry handler lock poisoned"),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.shared.config
    }

    pub fn state(&self) -> RegistryState {
        *self.shared.state.borrow()
    }

    pub fn is_started(&self) -> bool {
        self.state() == RegistryState::Listening
    }

    /// Observe lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<RegistryState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.shared.events.subscribe()
    }

    /// Ids of the workers currently registered, sorted.
    pub fn connected_workers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .shared
            .workers
            .iter()
            .map(|entry| entry.worker_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn worker(&self, worker_id: &str) -> Option<WorkerEntry> {
        self.shared
            .workers
            .get(&worker_key(worker_id))
            .map(|entry| entry.value().clone())
    }

    pub fn is_registered(&self, worker_id: &str) -> bool {
        self.shared.workers.contains_key(&worker_key(worker_id))
    }

    /// Bind the registry channel and start accepting workers.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        if self.state() != RegistryState::Stopped {
            return Err(RpcError::protocol("registry is already started"));
        }
        self.shared.state.send_replace(RegistryState::Starting);

        let listener = match PipeListener::bind(&self.shared.config.pipe_name) {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.state.send_replace(RegistryState::Stopped);
                return Err(e.into());
            }
        };

        lifecycle.accept_stop = CancellationToken::new();
        lifecycle.connections_stop = CancellationToken::new();
        lifecycle.accept = Some(tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            lifecycle.accept_stop.clone(),
            lifecycle.connections_stop.clone(),
        )));

        self.shared.state.send_replace(RegistryState::Listening);
        tracing::info!(pipe = %self.shared.config.pipe_name, "Registry listening");
        Ok(())
    }

    /// Stop accepting, let connections drain for `shutdown_grace`, then
    /// close whatever is left. Calls still pending fail with `Shutdown`.
    pub async fn stop(&self) {
        let mut lifecycle = self.shared.lifecycle.lock().await;
        let Some(accept) = lifecycle.accept.take() else {
            return;
        };
        self.shared.state.send_replace(RegistryState::Stopping);
        tracing::info!(pipe = %self.shared.config.pipe_name, "Registry stopping");

        lifecycle.accept_stop.cancel();
        let mut tasks = match accept.await {
            Ok(tasks) => tasks,
            Err(e) => {
                tracing::error!(error = %e, "Accept loop task failed");
                JoinSet::new()
            }
        };

        let grace = self.shared.config.shutdown_grace;
        let drained = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        // Calls still waiting fail before their connections are torn down.
        self.shared.responses.fail_all(RpcError::Shutdown);
        if !drained {
            tracing::warn!(
                remaining = tasks.len(),
                ?grace,
                "Connections did not drain in time, closing"
            );
            lifecycle.connections_stop.cancel();
            while tasks.join_next().await.is_some() {}
        }

        self.shared.state.send_replace(RegistryState::Stopped);
        tracing::info!("Registry stopped");
    }

    /// Send `request` to one worker and wait for its reply.
    pub async fn send_to_worker(
        &self,
        worker_id: &str,
        request: &Envelope,
        timeout: Duration,
    ) -> Result<Envelope> {
        let connection = self.connection_for(worker_id)?;
        let pending = self
            .shared
            .responses
            .register(request, timeout, Some(connection.id()))?;

        tracing::trace!(
            %worker_id,
            method = request.kind(),
            request_id = %request.request_id(),
            message_id = %request.message_id(),
            "Sending request to worker"
        );
        if let Err(e) = connection.send(request).await {
            self.shared.responses.fail(request, e.clone());
            self.shared.drop_worker(worker_id, &connection, &e);
        }
        pending.wait().await
    }

    /// Send `request` to one worker without waiting for anything back.
    pub async fn post_to_worker(&self, worker_id: &str, request: &Envelope) -> Result<()> {
        let connection = self.connection_for(worker_id)?;
        tracing::trace!(
            %worker_id,
            method = request.kind(),
            message_id = %request.message_id(),
            "Posting one-way request to worker"
        );
        connection.send(request).await.inspect_err(|e| {
            self.shared.drop_worker(worker_id, &connection, e);
        })
    }

    fn connection_for(&self, worker_id: &str) -> Result<Arc<Connection>> {
        let Some(connection_id) = self
            .shared
            .workers
            .get(&worker_key(worker_id))
            .map(|entry| entry.connection_id)
        else {
            return Err(RpcError::WorkerNotRegistered(worker_id.to_string()));
        };

        let connection = self
            .shared
            .connections
            .get(&connection_id)
            .map(|c| Arc::clone(c.value()));
        match connection.filter(|c| !c.is_closed()) {
            Some(connection) => Ok(connection),
            None => {
                self.shared.unregister(worker_id, connection_id);
                Err(RpcError::connection_lost(format!(
                    "connection to worker {worker_id} is gone"
                )))
            }
        }
    }

    /// Send a copy of `request` to every registered worker, one after another.
    ///
    /// Each copy shares the request id but is its own exchange. A failing
    /// worker does not stop the sweep.
    pub async fn send_to_all_workers(&self, request: &Envelope) -> Vec<(String, Result<Envelope>)> {
        let timeout = self.shared.config.request_timeout;
        let mut results = Vec::new();
        for worker_id in self.connected_workers() {
            let copy = request.fan_out_copy();
            let result = self.send_to_worker(&worker_id, &copy, timeout).await;
            results.push((worker_id, result));
        }
        results
    }

    /// Wait until `worker_id` is registered.
    pub async fn wait_for_worker(&self, worker_id: &str, timeout: Duration) -> Result<()> {
        let mut events = self.subscribe();
        if self.is_registered(worker_id) {
            return Ok(());
        }
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(RegistryEvent::WorkerConnected(id)) if id.eq_ignore_ascii_case(worker_id) => {
                        return Ok(());
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.is_registered(worker_id) {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(RpcError::Shutdown),
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| RpcError::Timeout(timeout))?
    }

    #[cfg(test)]
    pub(crate) fn responses(&self) -> &ResponseChannel {
        &self.shared.responses
    }
}

impl Shared {
    fn handler(&self) -> Option<Arc<dyn RequestHandler>> {
        self.handler.read().ok().and_then(|slot| slot.clone())
    }

    /// A send to `worker_id` failed: forget the worker and close its connection.
    fn drop_worker(&self, worker_id: &str, connection: &Connection, error: &RpcError) {
        tracing::warn!(%worker_id, error = %error, "Send to worker failed, unregistering");
        self.unregister(worker_id, connection.id());
        connection.close();
    }

    /// Remove the entry for `worker_id` if it still belongs to `connection_id`.
    fn unregister(&self, worker_id: &str, connection_id: ConnectionId) -> bool {
        let removed = self
            .workers
            .remove_if(&worker_key(worker_id), |_, entry| {
                entry.connection_id == connection_id
            });
        match removed {
            Some((_, entry)) => {
                tracing::info!(worker_id = %entry.worker_id, %connection_id, "Worker unregistered");
                let _ = self
                    .events
                    .send(RegistryEvent::WorkerDisconnected(entry.worker_id));
                true
            }
            None => false,
        }
    }

    async fn handshake(
        &self,
        connection: &Connection,
        reader: &mut ConnectionReader,
    ) -> Result<WorkerEntry> {
        let first = tokio::time::timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| {
                RpcError::protocol(format!(
                    "no RegisterWorker within {:?}",
                    self.config.handshake_timeout
                ))
            })?;
        let envelope = match first {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => return Err(e.into()),
            None => return Err(RpcError::connection_lost("closed before registering")),
        };

        if envelope.control_tag() != Some(ControlTag::RegisterWorker) {
            return Err(RpcError::protocol(format!(
                "expected RegisterWorker, got {}",
                envelope.kind()
            )));
        }
        let request: RegisterWorkerRequest = envelope.decode()?;
        if request.worker_id.trim().is_empty() {
            return Err(RpcError::protocol("RegisterWorker with empty worker id"));
        }

        let entry = WorkerEntry {
            worker_id: request.worker_id,
            pipe_name: request.pipe_name,
            connection_id: connection.id(),
        };
        let previous = self
            .workers
            .insert(worker_key(&entry.worker_id), entry.clone());
        if let Some(previous) = previous
            && previous.connection_id != connection.id()
        {
            tracing::warn!(
                worker_id = %entry.worker_id,
                old_connection = %previous.connection_id,
                "Worker re-registered, closing previous connection"
            );
            let old = self
                .connections
                .get(&previous.connection_id)
                .map(|c| Arc::clone(c.value()));
            if let Some(old) = old {
                old.close();
            }
        }

        tracing::info!(
            worker_id = %entry.worker_id,
            connection_id = %entry.connection_id,
            worker_pipe = %entry.pipe_name,
            "Worker registered"
        );
        let _ = self
            .events
            .send(RegistryEvent::WorkerConnected(entry.worker_id.clone()));
        Ok(entry)
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    mut listener: PipeListener,
    stop: CancellationToken,
    connections_stop: CancellationToken,
) -> JoinSet<()> {
    let mut tasks = JoinSet::new();
    loop {
        let stream = tokio::select! {
            _ = stop.cancelled() => break,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => continue,
            accepted = listener.accept() => match accepted {
                Ok(stream) => stream,
                Err(e) => {
                    tracing::warn!(pipe = %listener.name(), error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            },
        };

        let (connection, reader) = Connection::with_parent(stream, &connections_stop);
        tracing::debug!(connection_id = %connection.id(), "Accepted connection");
        shared
            .connections
            .insert(connection.id(), Arc::clone(&connection));
        tasks.spawn(serve_connection(Arc::clone(&shared), connection, reader));
    }
    tracing::debug!(pipe = %listener.name(), "Accept loop exiting");
    tasks
}

async fn serve_connection(
    shared: Arc<Shared>,
    connection: Arc<Connection>,
    mut reader: ConnectionReader,
) {
    let connection_id = connection.id();
    let entry = match shared.handshake(&connection, &mut reader).await {
        Ok(entry) => entry,
        Err(e) => {
            tracing::warn!(%connection_id, error = %e, "Rejected connection");
            shared.connections.remove(&connection_id);
            connection.shutdown().await;
            return;
        }
    };

    read_loop(&shared, &connection, &mut reader, &entry.worker_id).await;

    shared.unregister(&entry.worker_id, connection_id);
    shared.responses.fail_connection(
        connection_id,
        RpcError::connection_lost(format!("worker {} disconnected", entry.worker_id)),
    );
    shared.connections.remove(&connection_id);
    connection.shutdown().await;
}

async fn read_loop(
    shared: &Arc<Shared>,
    connection: &Arc<Connection>,
    reader: &mut ConnectionReader,
    worker_id: &str,
) {
    loop {
        let envelope = match reader.next().await {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                tracing::warn!(%worker_id, error = %e, "Read failed, dropping connection");
                return;
            }
            None => {
                tracing::debug!(%worker_id, "Connection closed");
                return;
            }
        };
        tracing::trace!(
            %worker_id,
            method = envelope.kind(),
            message_id = %envelope.message_id(),
            "Received envelope"
        );

        let Some(request) = shared.responses.offer(envelope) else {
            continue;
        };
        match request.control_tag() {
            None => {}
            Some(ControlTag::RegisterWorker) => {
                tracing::warn!(%worker_id, "Ignoring repeated RegisterWorker");
                continue;
            }
            Some(tag) => {
                tracing::debug!(%worker_id, %tag, message_id = %request.message_id(), "Dropping unsolicited reply");
                continue;
            }
        }

        tokio::spawn(handle_request(
            Arc::clone(shared),
            Arc::clone(connection),
            request,
        ));
    }
}

async fn handle_request(shared: Arc<Shared>, connection: Arc<Connection>, request: Envelope) {
    let reply = match shared.handler() {
        Some(handler) => handle_guarded(handler.as_ref(), request, connection.close_signal()).await,
        None => {
            let message = RpcError::MethodNotFound(request.kind().to_string()).to_string();
            Some(request.error_reply(message))
        }
    };
    if let Some(reply) = reply
        && let Err(e) = connection.send(&reply).await
    {
        tracing::debug!(
            connection_id = %connection.id(),
            message_id = %reply.message_id(),
            error = %e,
            "Failed to send reply"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{read_envelope, write_envelope};
    use crate::bridge::transport::{PipeStream, connect};

    fn unique_pipe() -> String {
        format!("pipe-rpc-registry-test-{}", uuid::Uuid::new_v4().simple())
    }

    fn config(pipe: &str) -> RegistryConfig {
        RegistryConfig::new(pipe)
            .with_request_timeout(Duration::from_secs(2))
            .with_handshake_timeout(Duration::from_millis(200))
            .with_shutdown_grace(Duration::from_millis(100))
    }

    async fn raw_worker(pipe: &str, worker_id: &str) -> PipeStream {
        let stream = connect(pipe, Duration::from_secs(2)).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let hello = Envelope::register_worker(&RegisterWorkerRequest {
            worker_id: worker_id.to_string(),
            pipe_name: format!("pipe-rpc.worker.{worker_id}"),
        })
        .unwrap();
        write_envelope(&mut writer, &hello).await.unwrap();
        PipeStream::new(reader, writer)
    }

    #[test]
    fn empty_pipe_name_is_rejected() {
        let err = RegistryServer::new(RegistryConfig::new(" ")).err().unwrap();
        assert!(matches!(err, RpcError::Protocol(_)));
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let registry = RegistryServer::new(config(&unique_pipe())).unwrap();
        assert_eq!(registry.state(), RegistryState::Stopped);
        registry.start().await.unwrap();
        assert!(registry.is_started());
        assert!(registry.start().await.is_err());
        registry.stop().await;
        assert_eq!(registry.state(), RegistryState::Stopped);
        // Restartable on the same name.
        registry.start().await.unwrap();
        registry.stop().await;
    }

    #[tokio::test]
    async fn watch_state_follows_lifecycle() {
        let registry = RegistryServer::new(config(&unique_pipe())).unwrap();
        let mut state = registry.watch_state();
        assert_eq!(*state.borrow_and_update(), RegistryState::Stopped);

        registry.start().await.unwrap();
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), RegistryState::Listening);

        registry.stop().await;
        assert!(state.has_changed().unwrap());
        assert_eq!(*state.borrow_and_update(), RegistryState::Stopped);
    }

    #[tokio::test]
    async fn weak_handle_does_not_keep_registry_alive() {
        use crate::dispatch::{Method, MethodTable};
        const COUNT: Method<(), usize> = Method::returning("Count");

        let registry = RegistryServer::new(config(&unique_pipe())).unwrap();
        let weak = registry.downgrade();
        let mut methods = MethodTable::new();
        methods.register(&COUNT, {
            let weak = weak.clone();
            move |()| {
                let count = weak
                    .upgrade()
                    .map(|registry| registry.connected_workers().len())
                    .unwrap_or_default();
                async move { Ok(count) }
            }
        });
        registry.set_handler(methods);

        assert!(weak.upgrade().is_some());
        drop(registry);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn unknown_worker_is_not_registered() {
        let registry = RegistryServer::new(config(&unique_pipe())).unwrap();
        registry.start().await.unwrap();
        let req = Envelope::request("Echo", &("hi",)).unwrap();
        let err = registry
            .send_to_worker("nobody", &req, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, RpcError::WorkerNotRegistered("nobody".into()));
        assert_eq!(err.to_string(), "worker nobody is not registered");
        registry.stop().await;
    }

    #[tokio::test]
    async fn registers_and_routes_to_raw_worker() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        let mut events = registry.subscribe();
        registry.start().await.unwrap();

        let worker = raw_worker(&pipe, "W1").await;
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::WorkerConnected("W1".into())
        );
        // Directory lookups ignore case.
        assert!(registry.is_registered("w1"));
        assert_eq!(registry.connected_workers(), vec!["W1".to_string()]);

        let (mut reader, mut writer) = worker.into_split();
        let echo = tokio::spawn(async move {
            let request = read_envelope(&mut reader).await.unwrap();
            let reply = request.reply(request.kind(), "pong").unwrap();
            write_envelope(&mut writer, &reply).await.unwrap();
            (reader, writer)
        });

        let req = Envelope::request("Ping", &()).unwrap();
        let reply = registry
            .send_to_worker("w1", &req, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.decode::<String>().unwrap(), "pong");
        assert_eq!(reply.message_id(), req.message_id());

        drop(echo.await.unwrap());
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::WorkerDisconnected("W1".into())
        );
        assert!(registry.connected_workers().is_empty());
        registry.stop().await;
    }

    #[tokio::test]
    async fn first_frame_must_be_register_worker() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();

        let stream = connect(&pipe, Duration::from_secs(2)).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let bogus = Envelope::request("Echo", &("hi",)).unwrap();
        write_envelope(&mut writer, &bogus).await.unwrap();

        // The registry closes the connection without answering.
        let err = read_envelope(&mut reader).await.unwrap_err();
        assert!(matches!(
            err,
            crate::bridge::codec::CodecError::EndOfStream
                | crate::bridge::codec::CodecError::Io(_)
        ));
        assert!(registry.connected_workers().is_empty());
        registry.stop().await;
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_after_handshake_timeout() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();

        let stream = connect(&pipe, Duration::from_secs(2)).await.unwrap();
        let (mut reader, _writer) = stream.into_split();
        let err = tokio::time::timeout(Duration::from_secs(2), read_envelope(&mut reader))
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(
            err,
            crate::bridge::codec::CodecError::EndOfStream
                | crate::bridge::codec::CodecError::Io(_)
        ));
        registry.stop().await;
    }

    #[tokio::test]
    async fn re_registration_replaces_old_connection() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();

        let first = raw_worker(&pipe, "W1").await;
        registry
            .wait_for_worker("W1", Duration::from_secs(2))
            .await
            .unwrap();
        let first_connection = registry.worker("W1").unwrap().connection_id;

        let mut events = registry.subscribe();
        let _second = raw_worker(&pipe, "w1").await;
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::WorkerConnected("w1".into())
        );

        // The old stream is closed by the registry.
        let (mut old_reader, _old_writer) = first.into_split();
        assert!(read_envelope(&mut old_reader).await.is_err());

        let entry = registry.worker("W1").unwrap();
        assert_ne!(entry.connection_id, first_connection);
        assert_eq!(registry.connected_workers().len(), 1);
        registry.stop().await;
    }

    #[tokio::test]
    async fn worker_requests_reach_the_handler() {
        use crate::dispatch::{Method, MethodTable};
        const GREET: Method<(String,), String> = Method::returning("Greet");

        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        let mut methods = MethodTable::new();
        methods.register(&GREET, |(name,)| async move { Ok(format!("hello {name}")) });
        registry.set_handler(methods);
        registry.start().await.unwrap();

        let worker = raw_worker(&pipe, "W1").await;
        let (mut reader, mut writer) = worker.into_split();
        let req = Envelope::request("greet", &("bob",)).unwrap();
        write_envelope(&mut writer, &req).await.unwrap();
        let reply = read_envelope(&mut reader).await.unwrap();
        assert_eq!(reply.message_id(), req.message_id());
        assert_eq!(reply.decode::<String>().unwrap(), "hello bob");

        let req = Envelope::request("Unknown", &()).unwrap();
        write_envelope(&mut writer, &req).await.unwrap();
        let reply = read_envelope(&mut reader).await.unwrap();
        assert_eq!(
            reply.error_message().as_deref(),
            Some("method Unknown not found")
        );
        registry.stop().await;
    }

    #[tokio::test]
    async fn pending_calls_fail_when_worker_disconnects() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();

        let worker = raw_worker(&pipe, "W1").await;
        registry
            .wait_for_worker("W1", Duration::from_secs(2))
            .await
            .unwrap();

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                let req = Envelope::request("Slow", &()).unwrap();
                registry
                    .send_to_worker("W1", &req, Duration::from_secs(10))
                    .await
            }
        });
        let (mut reader, writer) = worker.into_split();
        read_envelope(&mut reader).await.unwrap();
        drop((reader, writer));

        let err = call.await.unwrap().unwrap_err();
        assert!(matches!(err, RpcError::ConnectionLost(_)));
        assert!(registry.responses().is_empty());
        registry.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_connections_after_grace() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();
        let worker = raw_worker(&pipe, "W1").await;
        registry
            .wait_for_worker("W1", Duration::from_secs(2))
            .await
            .unwrap();

        let started = tokio::time::Instant::now();
        registry.stop().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert!(registry.connected_workers().is_empty());

        let (mut reader, _writer) = worker.into_split();
        assert!(read_envelope(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn stop_fails_pending_calls_with_shutdown() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(config(&pipe)).unwrap();
        registry.start().await.unwrap();
        let worker = raw_worker(&pipe, "W1").await;
        registry
            .wait_for_worker("W1", Duration::from_secs(2))
            .await
            .unwrap();

        let call = tokio::spawn({
            let registry = registry.clone();
            async move {
                let req = Envelope::request("Slow", &()).unwrap();
                registry
                    .send_to_worker("W1", &req, Duration::from_secs(10))
                    .await
            }
        });
        // The worker reads the request and keeps its stream open.
        let (mut reader, _writer) = worker.into_split();
        read_envelope(&mut reader).await.unwrap();

        registry.stop().await;
        assert_eq!(call.await.unwrap().unwrap_err(), RpcError::Shutdown);
        assert!(registry.responses().is_empty());
    }

    #[tokio::test]
    async fn send_to_all_workers_sweeps_past_a_silent_worker() {
        let pipe = unique_pipe();
        let registry = RegistryServer::new(
            config(&pipe).with_request_timeout(Duration::from_millis(300)),
        )
        .unwrap();
        registry.start().await.unwrap();

        let mut peers = Vec::new();
        for id in ["W1", "W2", "W3"] {
            let worker = raw_worker(&pipe, id).await;
            registry
                .wait_for_worker(id, Duration::from_secs(2))
                .await
                .unwrap();
            let (mut reader, mut writer) = worker.into_split();
            peers.push(tokio::spawn(async move {
                let request = read_envelope(&mut reader).await.unwrap();
                if id != "W2" {
                    let reply = request.reply(request.kind(), &format!("ok {id}")).unwrap();
                    write_envelope(&mut writer, &reply).await.unwrap();
                }
                (request, reader, writer)
            }));
        }

        let req = Envelope::request("Ping", &()).unwrap();
        let results = registry.send_to_all_workers(&req).await;
        let ids: Vec<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["W1", "W2", "W3"]);
        assert_eq!(results[0].1.as_ref().unwrap().decode::<String>().unwrap(), "ok W1");
        assert_eq!(
            results[1].1.as_ref().unwrap_err(),
            &RpcError::Timeout(Duration::from_millis(300))
        );
        assert_eq!(results[2].1.as_ref().unwrap().decode::<String>().unwrap(), "ok W3");

        let mut message_ids = Vec::new();
        for peer in peers {
            let (copy, _reader, _writer) = peer.await.unwrap();
            assert_eq!(copy.request_id(), req.request_id());
            assert_ne!(copy.message_id(), req.message_id());
            assert!(!message_ids.contains(&copy.message_id()));
            message_ids.push(copy.message_id());
        }
        registry.stop().await;
    }

    #[tokio::test]
    async fn failed_send_unregisters_the_worker() {
        let registry = RegistryServer::new(config(&unique_pipe())).unwrap();
        let mut events = registry.subscribe();

        let (local, remote) = tokio::io::duplex(64);
        let (connection, _reader) = Connection::new(PipeStream::from_io(local));
        registry
            .shared
            .connections
            .insert(connection.id(), Arc::clone(&connection));
        registry.shared.workers.insert(
            worker_key("W1"),
            WorkerEntry {
                worker_id: "W1".into(),
                pipe_name: "pipe-rpc.worker.W1".into(),
                connection_id: connection.id(),
            },
        );
        drop(remote);

        let req = Envelope::request("Echo", &("hi",)).unwrap();
        let err = registry
            .send_to_worker("W1", &req, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(!matches!(err, RpcError::Timeout(_)));
        assert!(!registry.is_registered("W1"));
        assert!(connection.is_closed());
        assert_eq!(
            events.recv().await.unwrap(),
            RegistryEvent::WorkerDisconnected("W1".into())
        );
        assert!(registry.responses().is_empty());
    }
}
