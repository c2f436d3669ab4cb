//! Method descriptors and the inbound request dispatcher.
//!
//! An RPC interface is a set of [`Method`] constants. Each one fixes the
//! method's name, argument tuple and return shape at compile time. The same
//! constant is used by the calling side (see [`crate::proxy::CallProxy`])
//! and the serving side ([`MethodTable::register`]), so both agree on arity
//! and on whether a reply is expected.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::Envelope;
use crate::error::RpcError;

/// What the caller of a method waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnShape {
    /// Nothing is sent back and the caller does not wait.
    FireAndForget,
    /// The caller waits for completion; the reply carries no value.
    NoValue,
    /// The caller waits for a value of the declared return type.
    Value,
}

/// Static description of one remote method.
pub struct Method<A, R> {
    name: &'static str,
    shape: ReturnShape,
    _types: PhantomData<fn(A) -> R>,
}

impl<A, R> Method<A, R> {
    /// A call that yields a value of type `R`.
    pub const fn returning(name: &'static str) -> Self {
        Self {
            name,
            shape: ReturnShape::Value,
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn shape(&self) -> ReturnShape {
        self.shape
    }
}

impl<A> Method<A, ()> {
    /// A call the caller waits on, answered with `Null`.
    pub const fn unit(name: &'static str) -> Self {
        Self {
            name,
            shape: ReturnShape::NoValue,
            _types: PhantomData,
        }
    }

    /// A one-way call. No reply is sent, even on failure.
    pub const fn notification(name: &'static str) -> Self {
        Self {
            name,
            shape: ReturnShape::FireAndForget,
            _types: PhantomData,
        }
    }
}

impl<A, R> Clone for Method<A, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<A, R> Copy for Method<A, R> {}

impl<A, R> std::fmt::Debug for Method<A, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("shape", &self.shape)
            .finish()
    }
}

/// A positional argument list, encoded on the wire as a JSON array.
pub trait Args: Sized + Send + 'static {
    const ARITY: usize;

    fn into_values(self) -> Result<Vec<Value>, RpcError>;

    fn from_values(values: Vec<Value>) -> Result<Self, RpcError>;
}

macro_rules! impl_args {
    ($arity:expr; $($ty:ident),*) => {
        impl<$($ty),*> Args for ($($ty,)*)
        where
            $($ty: Serialize + DeserializeOwned + Send + 'static),*
        {
            const ARITY: usize = $arity;

            #[allow(non_snake_case)]
            fn into_values(self) -> Result<Vec<Value>, RpcError> {
                let ($($ty,)*) = self;
                Ok(vec![$(serde_json::to_value($ty)?),*])
            }

            #[allow(unused_mut, unused_variables)]
            fn from_values(values: Vec<Value>) -> Result<Self, RpcError> {
                if values.len() != $arity {
                    return Err(RpcError::ParameterCountMismatch {
                        expected: $arity,
                        actual: values.len(),
                    });
                }
                let mut values = values.into_iter();
                Ok(($(serde_json::from_value::<$ty>(values.next().unwrap_or(Value::Null))?,)*))
            }
        }
    };
}

impl_args!(0;);
impl_args!(1; A1);
impl_args!(2; A1, A2);
impl_args!(3; A1, A2, A3);
impl_args!(4; A1, A2, A3, A4);
impl_args!(5; A1, A2, A3, A4, A5);
impl_args!(6; A1, A2, A3, A4, A5, A6);

/// Callback for inbound requests that no response waiter consumed.
///
/// Returning `None` sends nothing back. A caller blocked on the request then
/// only unblocks through its own timeout, so handlers should answer every
/// request they do not know to be one-way.
#[async_trait::async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, request: Envelope, cancel: CancellationToken) -> Option<Envelope>;
}

/// Adapts an async closure into a [`RequestHandler`].
pub struct HandlerFn<F>(F);

pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Envelope>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait::async_trait]
impl<F, Fut> RequestHandler for HandlerFn<F>
where
    F: Fn(Envelope, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Option<Envelope>> + Send + 'static,
{
    async fn handle(&self, request: Envelope, cancel: CancellationToken) -> Option<Envelope> {
        (self.0)(request, cancel).await
    }
}

type BoxedCall = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, anyhow::Result<Value>> + Send + Sync>;

struct Registered {
    arity: usize,
    shape: ReturnShape,
    call: BoxedCall,
}

/// Outcome of [`MethodTable::dispatch`].
#[derive(Debug)]
pub enum Dispatch {
    Reply(Envelope),
    /// One-way method; nothing goes back.
    NoReply,
    NotFound,
}

/// Local implementations keyed by method name, matched case-insensitively.
#[derive(Default)]
pub struct MethodTable {
    methods: HashMap<String, Registered>,
}

impl MethodTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `method` with `f`. A later registration under the same name
    /// replaces the earlier one.
    pub fn register<A, R, F, Fut>(&mut self, method: &Method<A, R>, f: F) -> &mut Self
    where
        A: Args,
        R: Serialize + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let call: BoxedCall = Arc::new(move |values: Vec<Value>| {
            match A::from_values(values) {
                Ok(args) => {
                    let fut = f(args);
                    async move {
                        let result = fut.await?;
                        Ok::<Value, anyhow::Error>(serde_json::to_value(result)?)
                    }
                    .boxed()
                }
                Err(e) => futures::future::ready(Err(anyhow::Error::from(e))).boxed(),
            }
        });

        self.methods.insert(
            method.name().to_lowercase(),
            Registered {
                arity: A::ARITY,
                shape: method.shape(),
                call,
            },
        );
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.methods.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    /// Run the method named by `request.kind()` and build its reply.
    ///
    /// Handler failures, panics included, become `Error` replies. A handler
    /// yielding JSON null is answered with `Null`.
    pub async fn dispatch(&self, request: &Envelope) -> Dispatch {
        let Some(method) = self.methods.get(&request.kind().to_lowercase()) else {
            return Dispatch::NotFound;
        };

        let outcome = match request.decode_args(method.arity) {
            Ok(values) => {
                let call = Arc::clone(&method.call);
                AssertUnwindSafe(async move { call(values).await })
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic))))
            }
            Err(e) => Err(e.into()),
        };

        match (method.shape, outcome) {
            (ReturnShape::FireAndForget, Ok(_)) => Dispatch::NoReply,
            (ReturnShape::FireAndForget, Err(e)) => {
                tracing::warn!(method = request.kind(), error = %format!("{e:#}"), "One-way call failed");
                Dispatch::NoReply
            }
            (_, Ok(Value::Null)) => Dispatch::Reply(request.null_reply()),
            (_, Ok(value)) => Dispatch::Reply(
                request.reply_raw(request.kind(), value.to_string().into_bytes()),
            ),
            (_, Err(e)) => {
                tracing::debug!(method = request.kind(), error = %format!("{e:#}"), "Call failed");
                Dispatch::Reply(request.error_reply(format!("{e:#}")))
            }
        }
    }
}

#[async_trait::async_trait]
impl RequestHandler for MethodTable {
    async fn handle(&self, request: Envelope, _cancel: CancellationToken) -> Option<Envelope> {
        match self.dispatch(&request).await {
            Dispatch::Reply(reply) => Some(reply),
            Dispatch::NoReply => None,
            Dispatch::NotFound => Some(
                request.error_reply(RpcError::MethodNotFound(request.kind().to_string()).to_string()),
            ),
        }
    }
}

/// Run `handler`, turning a panic into an `Error` reply.
pub(crate) async fn handle_guarded(
    handler: &dyn RequestHandler,
    request: Envelope,
    cancel: CancellationToken,
) -> Option<Envelope> {
    // Ids and method name only; the payload is moved into the handler.
    let skeleton = request.reply_raw(request.kind(), Vec::new());
    match AssertUnwindSafe(handler.handle(request, cancel))
        .catch_unwind()
        .await
    {
        Ok(reply) => reply,
        Err(panic) => {
            let message = panic_message(panic);
            tracing::error!(method = skeleton.kind(), %message, "Request handler panicked");
            Some(skeleton.error_reply(message))
        }
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("handler panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("handler panicked: {s}")
    } else {
        "handler panicked".to_string()
    }
}
