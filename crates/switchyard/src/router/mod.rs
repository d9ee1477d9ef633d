//! Request/response and event routing over attached channels.
//!
//! A [`Router`] owns one peer per attached [`Channel`]. Outbound, it
//! correlates requests with responses and applies timeouts. Inbound, every
//! request or event passes input limits and the permission enforcer before a
//! handler sees it; handlers for one peer run one at a time, in arrival order.
//!
//! Payloads below the inline threshold travel base64-encoded inside the
//! envelope; larger ones are published to the shared-memory pool and the
//! receiver is granted a lease before the message goes out.

mod handler;
mod peer;
mod pending;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

pub use handler::{CallContext, HandlerRegistry, InboundPayload, RegistrationError, SharedPayload};
pub use pending::Reply;

use self::peer::Peer;
use self::pending::{Outcome, PendingCalls};
use crate::bridge::channel::Channel;
use crate::bridge::protocol::{
    BufferHandle, CorrelationId, InlinePayload, Message, Params, control, validate_method_name,
};
use crate::capability::CapabilityTable;
use crate::config::RouterConfig;
use crate::enforcer::PermissionEnforcer;
use crate::error::IpcError;
use crate::process::{ProcessId, ProcessRef, Role};
use crate::shm::{BufferPool, Payload, ReleaseNotice};

/// Where a call or event goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Process(ProcessId),
    /// The attached peer with this role and the lowest id.
    Role(Role),
}

impl From<ProcessId> for Target {
    fn from(id: ProcessId) -> Self {
        Self::Process(id)
    }
}

impl From<&ProcessId> for Target {
    fn from(id: &ProcessId) -> Self {
        Self::Process(id.clone())
    }
}

impl From<Role> for Target {
    fn from(role: Role) -> Self {
        Self::Role(role)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Process(id) => write!(f, "process {id}"),
            Self::Role(role) => write!(f, "role {role}"),
        }
    }
}

/// Liveness signals for whoever supervises the peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerNotice {
    Heartbeat(ProcessId),
    /// The connection dropped without an explicit detach.
    Disconnected(ProcessId),
}

#[derive(Debug, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub payload: Option<Payload>,
    pub cancel: Option<CancellationToken>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct RouterInner {
    local: ProcessRef,
    config: RouterConfig,
    enforcer: PermissionEnforcer,
    buffers: Arc<BufferPool>,
    handlers: HandlerRegistry,
    peers: DashMap<ProcessId, Peer>,
    pending: PendingCalls,
    /// Cancellation tokens of inbound requests not yet answered.
    inbound: DashMap<(ProcessId, CorrelationId), CancellationToken>,
    notices: Mutex<Option<mpsc::UnboundedSender<PeerNotice>>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("local", &self.inner.local)
            .field("peers", &self.inner.peers.len())
            .field("pending", &self.inner.pending.len())
            .finish()
    }
}

impl Router {
    /// Must be called from within a tokio runtime.
    pub fn new(
        local: ProcessRef,
        grants: Arc<CapabilityTable>,
        buffers: Arc<BufferPool>,
        config: RouterConfig,
        handlers: HandlerRegistry,
    ) -> Result<Self, RegistrationError> {
        handlers.validate()?;

        let releases = buffers.subscribe_releases();
        let router = Self {
            inner: Arc::new(RouterInner {
                local,
                config,
                enforcer: PermissionEnforcer::new(grants),
                buffers,
                handlers,
                peers: DashMap::new(),
                pending: PendingCalls::default(),
                inbound: DashMap::new(),
                notices: Mutex::new(None),
                next_generation: AtomicU64::new(1),
                shutdown: CancellationToken::new(),
            }),
        };
        router.spawn_release_forwarder(releases);
        Ok(router)
    }

    pub fn local(&self) -> &ProcessRef {
        &self.inner.local
    }

    pub fn config(&self) -> &RouterConfig {
        &self.inner.config
    }

    pub fn buffers(&self) -> &Arc<BufferPool> {
        &self.inner.buffers
    }

    /// Heartbeat and disconnect notices. Replaces any earlier subscriber.
    pub fn subscribe_notices(&self) -> mpsc::UnboundedReceiver<PeerNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .inner
            .notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Start routing messages on `channel`, which must lead to `remote`.
    ///
    /// Replaces any peer already attached under the same id.
    pub fn attach(&self, remote: ProcessRef, channel: Channel) {
        if self.inner.shutdown.is_cancelled() {
            tracing::debug!(peer = %remote.id, "Router shut down; refusing peer");
            channel.close();
            return;
        }
        self.detach(&remote.id);

        let peer = Peer {
            remote,
            channel,
            cancel: self.inner.shutdown.child_token(),
            generation: self.inner.next_generation.fetch_add(1, Ordering::Relaxed),
        };
        self.inner
            .peers
            .insert(peer.remote.id.clone(), peer.clone());
        tracing::info!(
            local = %self.inner.local.id,
            peer = %peer.remote.id,
            role = %peer.remote.role,
            "Peer attached"
        );
        peer::start(self.clone(), peer);
    }

    /// Stop routing to `id`: close its channel and fail its pending calls
    /// with `ConnectionLost`. Returns false if it was not attached.
    pub fn detach(&self, id: &ProcessId) -> bool {
        let Some((_, peer)) = self.inner.peers.remove(id) else {
            return false;
        };
        peer.cancel.cancel();
        peer.channel.close();
        let failed = self.cleanup_peer(id);
        tracing::info!(peer = %id, failed_calls = failed, "Peer detached");
        true
    }

    pub fn peers(&self) -> Vec<ProcessRef> {
        let mut peers: Vec<ProcessRef> = self
            .inner
            .peers
            .iter()
            .map(|p| p.value().remote.clone())
            .collect();
        peers.sort_by(|a, b| a.id.cmp(&b.id));
        peers
    }

    pub fn is_attached(&self, id: &ProcessId) -> bool {
        self.inner.peers.contains_key(id)
    }

    /// Calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    /// Call `method` on `target` and wait for its result.
    pub async fn call(
        &self,
        target: impl Into<Target>,
        method: &str,
        params: Params,
        timeout: Duration,
    ) -> Result<Value, IpcError> {
        let reply = self
            .call_with(target, method, params, CallOptions::new().with_timeout(timeout))
            .await?;
        Ok(reply.value)
    }

    /// Call with a payload, a cancellation token, or the default timeout.
    ///
    /// Resolves exactly once: with the response, a timeout, a cancellation or
    /// a lost connection. Dropping the future abandons the call the same way
    /// cancelling it does.
    pub async fn call_with(
        &self,
        target: impl Into<Target>,
        method: &str,
        params: Params,
        options: CallOptions,
    ) -> Result<Reply, IpcError> {
        validate_method_name(method).map_err(|e| IpcError::protocol(e.to_string()))?;
        let peer = self.peer_for(&target.into())?;
        let timeout = options.timeout.unwrap_or(self.inner.config.call_timeout);
        let cancel = options.cancel.unwrap_or_default();
        if cancel.is_cancelled() {
            return Err(IpcError::Cancelled);
        }

        let (id, mut rx) = self.inner.pending.register(&peer.remote.id, method);
        let mut guard = PendingGuard {
            router: self,
            id,
            peer: peer.clone(),
            armed: true,
            sent: false,
        };

        let request = Message::request(id, method, params);
        let (request, shared) =
            self.attach_payload(request, options.payload.as_ref(), &peer.remote.id)?;
        if let Err(e) = peer.channel.send(request).await {
            self.unlease(shared, &peer.remote.id);
            return Err(e);
        }
        guard.sent = true;
        tracing::trace!(correlation_id = %id, peer = %peer.remote.id, method, "Request sent");

        let outcome = tokio::select! {
            biased;
            outcome = &mut rx => outcome.unwrap_or_else(|_| Err(lost(&peer.remote.id))),
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(
                    correlation_id = %id,
                    peer = %peer.remote.id,
                    method,
                    timeout_ms = timeout.as_millis() as u64,
                    "Call timed out"
                );
                let err = IpcError::Timeout(format!(
                    "{method} on {} got no response within {timeout:?}",
                    peer.remote.id
                ));
                self.abandon(&mut guard, &mut rx, err).await
            }
            _ = cancel.cancelled() => {
                self.abandon(&mut guard, &mut rx, IpcError::Cancelled).await
            }
        };
        guard.armed = false;
        outcome
    }

    /// Send an event. No response is expected.
    pub async fn emit(
        &self,
        target: impl Into<Target>,
        method: &str,
        params: Params,
    ) -> Result<(), IpcError> {
        self.emit_with(target, method, params, None).await
    }

    pub async fn emit_with(
        &self,
        target: impl Into<Target>,
        method: &str,
        params: Params,
        payload: Option<Payload>,
    ) -> Result<(), IpcError> {
        validate_method_name(method).map_err(|e| IpcError::protocol(e.to_string()))?;
        let peer = self.peer_for(&target.into())?;
        self.send_event(&peer, method, params, payload.as_ref()).await
    }

    /// Send an event to every attached peer. Returns how many accepted it.
    pub async fn broadcast(&self, method: &str, params: Params) -> Result<usize, IpcError> {
        validate_method_name(method).map_err(|e| IpcError::protocol(e.to_string()))?;
        let peers: Vec<Peer> = self.inner.peers.iter().map(|p| p.value().clone()).collect();
        let mut delivered = 0;
        for peer in peers {
            match self.send_event(&peer, method, params.clone(), None).await {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(peer = %peer.remote.id, method, error = %e, "Broadcast send failed")
                }
            }
        }
        Ok(delivered)
    }

    /// Detach every peer and fail every pending call.
    pub fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let ids: Vec<ProcessId> = self.inner.peers.iter().map(|p| p.key().clone()).collect();
        for id in &ids {
            self.detach(id);
        }
        self.inner
            .pending
            .fail_all(&IpcError::ConnectionLost("router shut down".to_string()));
        tracing::debug!(local = %self.inner.local.id, peers = ids.len(), "Router shut down");
    }

    async fn send_event(
        &self,
        peer: &Peer,
        method: &str,
        params: Params,
        payload: Option<&Payload>,
    ) -> Result<(), IpcError> {
        let event = Message::event(method, params);
        let (event, shared) = self.attach_payload(event, payload, &peer.remote.id)?;
        if let Err(e) = peer.channel.send(event).await {
            self.unlease(shared, &peer.remote.id);
            return Err(e);
        }
        Ok(())
    }

    fn peer_for(&self, target: &Target) -> Result<Peer, IpcError> {
        let found = match target {
            Target::Process(id) => self.inner.peers.get(id).map(|p| p.value().clone()),
            Target::Role(role) => self
                .inner
                .peers
                .iter()
                .filter(|p| p.value().remote.role == *role)
                .map(|p| p.value().clone())
                .min_by(|a, b| a.remote.id.cmp(&b.remote.id)),
        };
        found.ok_or_else(|| IpcError::transport(format!("no attached peer for {target}")))
    }

    /// Inline small payloads; publish large ones and lease them to `target`.
    ///
    /// Returns the handle of a published buffer so a failed send can give the
    /// lease back.
    fn attach_payload(
        &self,
        msg: Message,
        payload: Option<&Payload>,
        target: &ProcessId,
    ) -> Result<(Message, Option<BufferHandle>), IpcError> {
        let Some(payload) = payload else {
            return Ok((msg, None));
        };
        if payload.len() < self.inner.config.inline_threshold {
            let inline = InlinePayload::encode(payload.content_type.clone(), &payload.bytes);
            return Ok((msg.with_inline(inline), None));
        }

        let pool = &self.inner.buffers;
        let meta = pool.publish(payload)?;
        let local = &self.inner.local.id;
        if let Err(e) = pool.lease(&meta.handle, target) {
            pool.release(&meta.handle, local);
            return Err(e);
        }
        // From here on the receiver's lease alone keeps the buffer alive.
        pool.release(&meta.handle, local);
        tracing::debug!(
            handle = %meta.handle,
            size = meta.size,
            peer = %target,
            "Payload routed through shared buffer"
        );
        let handle = meta.handle.clone();
        Ok((msg.with_buffer(meta), Some(handle)))
    }

    fn unlease(&self, shared: Option<BufferHandle>, holder: &ProcessId) {
        if let Some(handle) = shared {
            self.inner.buffers.release(&handle, holder);
        }
    }

    async fn abandon(
        &self,
        guard: &mut PendingGuard<'_>,
        rx: &mut oneshot::Receiver<Outcome>,
        err: IpcError,
    ) -> Outcome {
        if self.inner.pending.remove(&guard.id) {
            guard.armed = false;
            self.send_cancel(&guard.peer, guard.id);
            Err(err)
        } else {
            // Someone else removed the slot first; their outcome is on its way.
            rx.await.unwrap_or_else(|_| Err(lost(&guard.peer.remote.id)))
        }
    }

    /// Best effort: tell the peer to stop working on `id`.
    fn send_cancel(&self, peer: &Peer, id: CorrelationId) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let mut params = Params::new();
        params.insert("id".to_string(), Value::String(id.to_string()));
        let channel = peer.channel.clone();
        runtime.spawn(async move {
            if let Err(e) = channel.send(Message::event(control::CANCEL, params)).await {
                tracing::trace!(correlation_id = %id, error = %e, "Cancel notice not sent");
            }
        });
    }

    fn spawn_release_forwarder(&self, mut releases: mpsc::UnboundedReceiver<ReleaseNotice>) {
        let weak = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let notice = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    notice = releases.recv() => match notice {
                        Some(notice) => notice,
                        None => break,
                    },
                };
                let Some(inner) = weak.upgrade() else { break };
                Router { inner }.forward_release(notice).await;
            }
        });
    }

    async fn forward_release(&self, notice: ReleaseNotice) {
        let Some(peer) = self
            .inner
            .peers
            .get(&notice.owner)
            .map(|p| p.value().clone())
        else {
            tracing::debug!(handle = %notice.handle, owner = %notice.owner, "Owner gone; release dropped");
            return;
        };
        let mut params = Params::new();
        params.insert(
            "handle".to_string(),
            Value::String(notice.handle.to_string()),
        );
        if let Err(e) = peer
            .channel
            .send(Message::event(control::RELEASE, params))
            .await
        {
            tracing::debug!(handle = %notice.handle, error = %e, "Release notice not sent");
        }
    }

    fn notify(&self, notice: PeerNotice) {
        let mut guard = self
            .inner
            .notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = guard.as_ref() {
            if tx.send(notice).is_err() {
                *guard = None;
            }
        }
    }

    /// Fail pending calls to `id` and cancel its in-flight inbound requests.
    fn cleanup_peer(&self, id: &ProcessId) -> usize {
        let failed = self
            .inner
            .pending
            .fail_peer(id, &lost(id));
        self.inner.inbound.retain(|(peer, _), token| {
            if peer == id {
                token.cancel();
                false
            } else {
                true
            }
        });
        failed
    }
}

fn lost(id: &ProcessId) -> IpcError {
    IpcError::ConnectionLost(format!("connection to {id} lost"))
}

/// Removes the pending slot if the call future is dropped before resolving.
struct PendingGuard<'a> {
    router: &'a Router,
    id: CorrelationId,
    peer: Peer,
    armed: bool,
    sent: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed && self.router.inner.pending.remove(&self.id) && self.sent {
            tracing::debug!(correlation_id = %self.id, peer = %self.peer.remote.id, "Call abandoned");
            self.router.send_cancel(&self.peer, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::DEFAULT_MAX_FRAME_LENGTH;
    use crate::error::ErrorKind;
    use serde_json::json;
    use tokio::net::UnixStream;

    fn pref(id: &str, role: Role) -> ProcessRef {
        ProcessRef::new(ProcessId::new(id).unwrap(), role)
    }

    fn router(me: &ProcessRef, handlers: HandlerRegistry) -> Router {
        let grants = CapabilityTable::new()
            .grant("worker.echo", [Role::Controller])
            .grant("worker.wait", [Role::Controller]);
        Router::new(
            me.clone(),
            Arc::new(grants),
            BufferPool::new(me.id.clone()),
            RouterConfig::default(),
            handlers,
        )
        .unwrap()
    }

    fn connect(a: &Router, b: &Router) {
        let (left, right) = UnixStream::pair().unwrap();
        let (ra, rb) = (a.local().clone(), b.local().clone());
        a.attach(
            rb.clone(),
            Channel::accepted(ra.clone(), rb.clone(), left, DEFAULT_MAX_FRAME_LENGTH, 16),
        );
        b.attach(
            ra.clone(),
            Channel::accepted(rb, ra, right, DEFAULT_MAX_FRAME_LENGTH, 16),
        );
    }

    fn worker_handlers() -> HandlerRegistry {
        HandlerRegistry::new()
            .handle("worker.echo", |_ctx, p: Value| async move { Ok::<_, anyhow::Error>(p) })
            .handle("worker.wait", |ctx: CallContext, _p: Value| async move {
                ctx.cancellation().cancelled().await;
                Ok::<_, anyhow::Error>(Value::Null)
            })
    }

    #[tokio::test]
    async fn unknown_target_is_a_transport_error() {
        let controller = router(&pref("controller", Role::Controller), HandlerRegistry::new());
        let err = controller
            .call(Role::Worker, "worker.echo", Params::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transport);
        assert_eq!(controller.pending_calls(), 0);
    }

    #[tokio::test]
    async fn invalid_method_is_rejected_before_sending() {
        let controller = router(&pref("controller", Role::Controller), HandlerRegistry::new());
        let err = controller
            .call(Role::Worker, "no spaces allowed", Params::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn call_by_role_reaches_the_worker() {
        let controller = router(&pref("controller", Role::Controller), HandlerRegistry::new());
        let worker = router(&pref("worker-1", Role::Worker), worker_handlers());
        connect(&controller, &worker);

        let mut params = Params::new();
        params.insert("text".into(), json!("hello"));
        let value = controller
            .call(Role::Worker, "worker.echo", params, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, json!({"text": "hello"}));
        assert_eq!(controller.pending_calls(), 0);
        assert_eq!(controller.peers(), vec![pref("worker-1", Role::Worker)]);
    }

    #[tokio::test]
    async fn detach_fails_calls_in_flight() {
        let controller = router(&pref("controller", Role::Controller), HandlerRegistry::new());
        let worker = router(&pref("worker-1", Role::Worker), worker_handlers());
        connect(&controller, &worker);

        let caller = controller.clone();
        let call = tokio::spawn(async move {
            caller
                .call(Role::Worker, "worker.wait", Params::new(), Duration::from_secs(30))
                .await
        });
        while controller.pending_calls() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(controller.detach(&ProcessId::new("worker-1").unwrap()));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectionLost);
        assert!(controller.peers().is_empty());
    }

    #[tokio::test]
    async fn remote_close_is_reported() {
        let controller = router(&pref("controller", Role::Controller), HandlerRegistry::new());
        let worker = router(&pref("worker-1", Role::Worker), worker_handlers());
        let mut notices = controller.subscribe_notices();
        connect(&controller, &worker);

        worker.shutdown();
        let notice = tokio::time::timeout(Duration::from_secs(5), notices.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            notice,
            PeerNotice::Disconnected(ProcessId::new("worker-1").unwrap())
        );
        assert!(!controller.is_attached(&ProcessId::new("worker-1").unwrap()));
    }
}
