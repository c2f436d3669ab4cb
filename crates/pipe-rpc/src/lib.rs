//! pipe-rpc: bidirectional RPC between a registry process and its workers
//! over local named channels.

pub mod bridge;
pub mod connection;
pub mod correlation;
pub mod dispatch;
pub mod error;
pub mod proxy;
pub mod registry;
pub mod worker;

pub use bridge::protocol::{ControlTag, Envelope, MessageId, RequestId};
pub use connection::ConnectionId;
pub use dispatch::{Args, Method, MethodTable, RequestHandler, ReturnShape, handler_fn};
pub use error::{Result, RpcError};
pub use proxy::{CallProxy, RemoteInterface};
pub use registry::{
    DEFAULT_REGISTRY_PIPE, RegistryConfig, RegistryEvent, RegistryServer, RegistryState,
    WeakRegistryServer, WorkerEntry,
};
pub use worker::{
    DEFAULT_WORKER_PIPE_PREFIX, WorkerConfig, WorkerEvent, WorkerServer, WorkerState,
};
