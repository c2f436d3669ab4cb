//! Demo interface served by `pipe-rpc worker` and called by `pipe-rpc registry`.

use pipe_rpc::{CallProxy, Method, MethodTable, RemoteInterface, Result, WeakRegistryServer};

pub const ECHO: Method<(String,), String> = Method::returning("Echo");
pub const ADD: Method<(i64, i64), i64> = Method::returning("Add");
pub const PING: Method<(String,), ()> = Method::notification("Ping");
pub const WHO_AM_I: Method<(), String> = Method::returning("WhoAmI");

pub const LIST_WORKERS: Method<(), Vec<String>> = Method::returning("ListWorkers");
pub const REPORT: Method<(String, String), ()> = Method::unit("Report");

/// Methods a demo worker serves.
pub fn worker_methods(worker_id: String) -> MethodTable {
    let mut methods = MethodTable::new();
    methods
        .register(&ECHO, |(text,)| async move { Ok(text) })
        .register(&ADD, |(a, b): (i64, i64)| async move {
            a.checked_add(b)
                .ok_or_else(|| anyhow::anyhow!("{a} + {b} overflows"))
        })
        .register(&PING, |(message,)| async move {
            tracing::info!(%message, "Ping from registry");
            Ok(())
        })
        .register(&WHO_AM_I, move |()| {
            let worker_id = worker_id.clone();
            async move { Ok(worker_id) }
        });
    methods
}

/// Methods the registry serves to its workers.
pub fn registry_methods(registry: WeakRegistryServer) -> MethodTable {
    let mut methods = MethodTable::new();
    methods
        .register(&LIST_WORKERS, move |()| {
            let workers = registry
                .upgrade()
                .map(|registry| registry.connected_workers())
                .unwrap_or_default();
            async move { Ok(workers) }
        })
        .register(&REPORT, |(worker_id, status)| async move {
            tracing::info!(%worker_id, %status, "Worker report");
            Ok(())
        });
    methods
}

/// Client side of the worker interface.
pub struct DemoClient(CallProxy);

impl RemoteInterface for DemoClient {
    fn from_proxy(proxy: CallProxy) -> Self {
        Self(proxy)
    }
}

impl DemoClient {
    pub async fn echo(&self, text: &str) -> Result<Option<String>> {
        self.0.call(&ECHO, (text.to_string(),)).await
    }

    pub async fn add(&self, a: i64, b: i64) -> Result<i64> {
        self.0.call_value(&ADD, (a, b)).await
    }

    pub async fn ping(&self, message: &str) -> Result<()> {
        self.0.call(&PING, (message.to_string(),)).await.map(|_| ())
    }

    pub async fn who_am_i(&self) -> Result<String> {
        self.0.call_value(&WHO_AM_I, ()).await
    }
}

/// Client side of the registry interface.
pub struct RegistryClient(CallProxy);

impl RemoteInterface for RegistryClient {
    fn from_proxy(proxy: CallProxy) -> Self {
        Self(proxy)
    }
}

impl RegistryClient {
    pub async fn list_workers(&self) -> Result<Vec<String>> {
        self.0.call_value(&LIST_WORKERS, ()).await
    }

    pub async fn report(&self, worker_id: &str, status: &str) -> Result<()> {
        self.0
            .call(&REPORT, (worker_id.to_string(), status.to_string()))
            .await
            .map(|_| ())
    }
}
