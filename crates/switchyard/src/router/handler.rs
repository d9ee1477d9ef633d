//! Typed handler registration and the context handlers run with.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::Router;
use crate::bridge::protocol::{BufferRef, CorrelationId, Params, validate_method_name};
use crate::error::IpcError;
use crate::process::ProcessRef;
use crate::shm::{BufferPool, BufferView, Payload};

/// Request handler after its parameter and result types have been erased.
#[async_trait]
pub(crate) trait MethodHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, params: Params) -> Result<Value, IpcError>;
}

#[async_trait]
pub(crate) trait EventHandler: Send + Sync {
    async fn call(&self, ctx: CallContext, params: Params) -> Result<(), IpcError>;
}

struct TypedMethod<P, R, F, Fut> {
    f: F,
    _types: PhantomData<fn(P) -> (R, Fut)>,
}

#[async_trait]
impl<P, R, F, Fut> MethodHandler for TypedMethod<P, R, F, Fut>
where
    P: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Params) -> Result<Value, IpcError> {
        let params = decode_params::<P>(&ctx.method, params)?;
        let result = (self.f)(ctx, params).await.map_err(handler_error)?;
        serde_json::to_value(result)
            .map_err(|e| IpcError::internal(format!("failed to serialize result: {e}")))
    }
}

struct TypedEvent<P, F, Fut> {
    f: F,
    _types: PhantomData<fn(P) -> Fut>,
}

#[async_trait]
impl<P, F, Fut> EventHandler for TypedEvent<P, F, Fut>
where
    P: DeserializeOwned + Send + 'static,
    F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, params: Params) -> Result<(), IpcError> {
        let params = decode_params::<P>(&ctx.method, params)?;
        (self.f)(ctx, params).await.map_err(handler_error)
    }
}

fn decode_params<P: DeserializeOwned>(method: &str, params: Params) -> Result<P, IpcError> {
    serde_json::from_value(Value::Object(params))
        .map_err(|e| IpcError::protocol(format!("invalid parameters for {method}: {e}")))
}

/// Handler bodies return `anyhow`; an `IpcError` inside is passed through,
/// anything else becomes an internal error.
fn handler_error(err: anyhow::Error) -> IpcError {
    match err.downcast::<IpcError>() {
        Ok(ipc) => ipc,
        Err(other) => IpcError::internal(format!("{other:#}")),
    }
}

#[derive(Debug, thiserror::Error)]
#[error("handler registration failed: {}", .problems.join("; "))]
pub struct RegistrationError {
    pub problems: Vec<String>,
}

/// Method name to handler mapping, built once before the router starts.
///
/// ```ignore
/// let handlers = HandlerRegistry::new()
///     .handle("worker.echo", |_ctx, p: EchoParams| async move { Ok(p) })
///     .on_event("ui.themeChanged", |_ctx, p: Theme| async move { apply(p) });
/// ```
#[derive(Default)]
pub struct HandlerRegistry {
    methods: HashMap<String, Arc<dyn MethodHandler>>,
    events: HashMap<String, Vec<Arc<dyn EventHandler>>>,
    problems: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the request handler for `method`. One per method.
    pub fn handle<P, R, F, Fut>(mut self, method: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if let Err(e) = validate_method_name(method) {
            self.problems.push(e.to_string());
            return self;
        }
        if self.methods.contains_key(method) {
            self.problems.push(format!("duplicate handler for {method}"));
            return self;
        }
        self.methods.insert(
            method.to_string(),
            Arc::new(TypedMethod {
                f,
                _types: PhantomData,
            }),
        );
        self
    }

    /// Add a handler for event `name`. Handlers run in registration order.
    pub fn on_event<P, F, Fut>(mut self, name: &str, f: F) -> Self
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(CallContext, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if let Err(e) = validate_method_name(name) {
            self.problems.push(e.to_string());
            return self;
        }
        self.events
            .entry(name.to_string())
            .or_default()
            .push(Arc::new(TypedEvent {
                f,
                _types: PhantomData,
            }));
        self
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.keys().map(String::as_str)
    }

    pub(crate) fn validate(&self) -> Result<(), RegistrationError> {
        if self.problems.is_empty() {
            Ok(())
        } else {
            Err(RegistrationError {
                problems: self.problems.clone(),
            })
        }
    }

    pub(crate) fn method(&self, name: &str) -> Option<Arc<dyn MethodHandler>> {
        self.methods.get(name).cloned()
    }

    pub(crate) fn event_handlers(&self, name: &str) -> &[Arc<dyn EventHandler>] {
        self.events.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// What a handler sees of the call it is serving.
#[derive(Clone)]
pub struct CallContext {
    pub caller: ProcessRef,
    pub method: String,
    pub id: CorrelationId,
    cancel: CancellationToken,
    payload: Arc<Mutex<Option<InboundPayload>>>,
    reply: Arc<Mutex<Option<Payload>>>,
    router: Router,
}

impl CallContext {
    pub(crate) fn new(
        caller: ProcessRef,
        method: String,
        id: CorrelationId,
        cancel: CancellationToken,
        payload: Option<InboundPayload>,
        router: Router,
    ) -> Self {
        Self {
            caller,
            method,
            id,
            cancel,
            payload: Arc::new(Mutex::new(payload)),
            reply: Arc::new(Mutex::new(None)),
            router,
        }
    }

    /// Cancelled when the caller gives up on this call or the peer goes away.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Take the payload that came with the call. Event handlers share one
    /// payload; the first to take it gets it.
    pub fn take_payload(&self) -> Option<InboundPayload> {
        self.payload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Attach bulk data to the response.
    pub fn reply_with(&self, payload: Payload) {
        *self.reply.lock().unwrap_or_else(PoisonError::into_inner) = Some(payload);
    }

    pub(crate) fn take_reply(&self) -> Option<Payload> {
        self.reply.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// The router serving this call, for calls back out.
    pub fn router(&self) -> &Router {
        &self.router
    }
}

/// Bulk data received with a message.
#[derive(Debug)]
pub enum InboundPayload {
    Inline(Payload),
    Shared(SharedPayload),
}

impl InboundPayload {
    pub fn content_type(&self) -> &str {
        match self {
            Self::Inline(p) => &p.content_type,
            Self::Shared(s) => &s.meta.content_type,
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Self::Inline(p) => p.len() as u64,
            Self::Shared(s) => s.meta.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// Copy the bytes out. Shared buffers are verified, copied and released.
    pub fn into_payload(self) -> Result<Payload, IpcError> {
        match self {
            Self::Inline(p) => Ok(p),
            Self::Shared(s) => {
                let view = s.lease()?;
                let bytes = Bytes::copy_from_slice(view.read_verified()?);
                let payload = Payload::new(view.content_type().to_string(), bytes);
                view.release();
                Ok(payload)
            }
        }
    }
}

/// A shared buffer the owner has granted us a lease on.
///
/// Mapping it with [`SharedPayload::lease`] hands the grant to the view;
/// dropping it unmapped gives the grant back.
pub struct SharedPayload {
    meta: BufferRef,
    pool: Arc<BufferPool>,
    settled: bool,
}

impl std::fmt::Debug for SharedPayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedPayload").field("meta", &self.meta).finish()
    }
}

impl SharedPayload {
    pub(crate) fn new(meta: BufferRef, pool: Arc<BufferPool>) -> Self {
        Self {
            meta,
            pool,
            settled: false,
        }
    }

    pub fn meta(&self) -> &BufferRef {
        &self.meta
    }

    pub fn lease(mut self) -> Result<BufferView, IpcError> {
        self.settled = true;
        match self.pool.open_view(&self.meta) {
            Ok(view) => Ok(view),
            Err(e) => {
                self.pool.forfeit(&self.meta);
                Err(e)
            }
        }
    }
}

impl Drop for SharedPayload {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.forfeit(&self.meta);
        }
    }
}
