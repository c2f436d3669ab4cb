//! Call proxy: turns a typed method call into envelope traffic.
//!
//! A [`CallProxy`] is bound to a target (one worker, every worker, or the
//! registry as seen from a worker). Whether to wait for a reply comes from
//! the [`Method`] descriptor alone, never from what comes back on the wire.
//!
//! Fan-out calls send one copy per registered worker, all sharing the
//! request id, and settle on the first decisive reply:
//! - an `Error` reply, or a worker that fails to answer, fails the call at once,
//! - a value reply yields that value at once,
//! - if every worker answers `Null`, the call yields no value.
//!
//! Waits still outstanding when the call settles are dropped. Their
//! correlation entries become tombstones, so late replies are discarded.

use std::time::Duration;

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::de::DeserializeOwned;

use crate::bridge::protocol::Envelope;
use crate::dispatch::{Args, Method, ReturnShape};
use crate::error::{Result, RpcError};
use crate::registry::RegistryServer;
use crate::worker::WorkerServer;

#[derive(Clone)]
enum Target {
    Worker {
        registry: RegistryServer,
        worker_id: String,
    },
    AllWorkers {
        registry: RegistryServer,
    },
    Registry {
        worker: WorkerServer,
    },
}

#[derive(Clone)]
pub struct CallProxy {
    target: Target,
    timeout: Duration,
}

impl CallProxy {
    /// Calls go to one registered worker.
    pub fn worker(registry: &RegistryServer, worker_id: impl Into<String>) -> Self {
        Self {
            timeout: registry.config().request_timeout,
            target: Target::Worker {
                registry: registry.clone(),
                worker_id: worker_id.into(),
            },
        }
    }

    /// Calls fan out to every worker registered at call time.
    pub fn broadcast(registry: &RegistryServer) -> Self {
        Self {
            timeout: registry.config().request_timeout,
            target: Target::AllWorkers {
                registry: registry.clone(),
            },
        }
    }

    /// Calls go from a worker to its registry.
    pub fn registry(worker: &WorkerServer) -> Self {
        Self {
            timeout: worker.config().request_timeout,
            target: Target::Registry {
                worker: worker.clone(),
            },
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Invoke `method` remotely.
    ///
    /// Yields `None` for one-way methods, for methods without a value, and
    /// when the remote side answered `Null`.
    pub async fn call<A, R>(&self, method: &Method<A, R>, args: A) -> Result<Option<R>>
    where
        A: Args,
        R: DeserializeOwned,
    {
        let payload = serde_json::to_vec(&args.into_values()?)?;
        let request = Envelope::from_raw(method.name(), payload);
        tracing::debug!(
            method = method.name(),
            request_id = %request.request_id(),
            shape = ?method.shape(),
            "Proxy call"
        );

        if method.shape() == ReturnShape::FireAndForget {
            self.post(&request).await?;
            return Ok(None);
        }

        let reply = match &self.target {
            Target::Worker {
                registry,
                worker_id,
            } => Some(
                registry
                    .send_to_worker(worker_id, &request, self.timeout)
                    .await?,
            ),
            Target::AllWorkers { registry } => self.fan_out(registry, &request).await?,
            Target::Registry { worker } => {
                Some(worker.send_request(&request, self.timeout).await?)
            }
        };

        match reply {
            Some(reply) => decode_reply(method.shape(), &reply),
            None => Ok(None),
        }
    }

    /// Like [`CallProxy::call`], but a missing value is an error.
    pub async fn call_value<A, R>(&self, method: &Method<A, R>, args: A) -> Result<R>
    where
        A: Args,
        R: DeserializeOwned,
    {
        self.call(method, args).await?.ok_or_else(|| {
            RpcError::Payload(format!("{} returned no value", method.name()))
        })
    }

    async fn post(&self, request: &Envelope) -> Result<()> {
        match &self.target {
            Target::Worker {
                registry,
                worker_id,
            } => registry.post_to_worker(worker_id, request).await,
            Target::AllWorkers { registry } => {
                let workers = registry.connected_workers();
                if workers.is_empty() {
                    return Err(RpcError::NoWorkersConnected);
                }
                for worker_id in workers {
                    if let Err(e) = registry
                        .post_to_worker(&worker_id, &request.fan_out_copy())
                        .await
                    {
                        tracing::debug!(%worker_id, error = %e, "One-way fan-out send failed");
                    }
                }
                Ok(())
            }
            Target::Registry { worker } => worker.post(request).await,
        }
    }

    /// Send a copy of `request` to every worker and settle on the first
    /// decisive reply.
    ///
    /// A worker that cannot be reached, drops its connection or times out
    /// fails the whole call with that error, the same way an `Error` reply
    /// does.
    async fn fan_out(
        &self,
        registry: &RegistryServer,
        request: &Envelope,
    ) -> Result<Option<Envelope>> {
        let workers = registry.connected_workers();
        if workers.is_empty() {
            return Err(RpcError::NoWorkersConnected);
        }

        let timeout = self.timeout;
        let mut replies: FuturesUnordered<_> = workers
            .into_iter()
            .map(|worker_id| {
                let copy = request.fan_out_copy();
                async move {
                    let result = registry.send_to_worker(&worker_id, &copy, timeout).await;
                    (worker_id, result)
                }
            })
            .collect();

        while let Some((worker_id, result)) = replies.next().await {
            let reply = result.inspect_err(|e| {
                tracing::debug!(%worker_id, error = %e, "Fan-out target failed");
            })?;
            if let Some(message) = reply.error_message() {
                tracing::debug!(%worker_id, %message, "Fan-out call failed");
                return Err(RpcError::Remote(message));
            }
            if !reply.is_null() {
                tracing::trace!(%worker_id, "Fan-out call answered");
                return Ok(Some(reply));
            }
        }
        Ok(None)
    }
}

fn decode_reply<R: DeserializeOwned>(shape: ReturnShape, reply: &Envelope) -> Result<Option<R>> {
    if let Some(message) = reply.error_message() {
        return Err(RpcError::Remote(message));
    }
    if reply.is_null() || shape != ReturnShape::Value {
        return Ok(None);
    }
    reply.decode().map(Some)
}

/// A typed client for one RPC interface, built on a [`CallProxy`].
///
/// ```ignore
/// struct Greeter(CallProxy);
///
/// impl RemoteInterface for Greeter {
///     fn from_proxy(proxy: CallProxy) -> Self {
///         Self(proxy)
///     }
/// }
///
/// impl Greeter {
///     async fn greet(&self, name: &str) -> Result<Option<String>> {
///         self.0.call(&GREET, (name.to_string(),)).await
///     }
/// }
/// ```
pub trait RemoteInterface: Sized {
    fn from_proxy(proxy: CallProxy) -> Self;
}

impl RegistryServer {
    /// Interface `T` fanned out to every registered worker.
    pub fn interface<T: RemoteInterface>(&self) -> T {
        T::from_proxy(CallProxy::broadcast(self))
    }

    /// Interface `T` served by one worker.
    pub fn worker_interface<T: RemoteInterface>(&self, worker_id: impl Into<String>) -> T {
        T::from_proxy(CallProxy::worker(self, worker_id))
    }
}

impl WorkerServer {
    /// Interface `T` served by the registry.
    pub fn registry_interface<T: RemoteInterface>(&self) -> T {
        T::from_proxy(CallProxy::registry(self))
    }
}
