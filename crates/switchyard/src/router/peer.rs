//! Per-peer tasks: the frame reader, the sequential dispatcher and the
//! heartbeat sender.
//!
//! The reader hands requests and events to the dispatcher over a bounded
//! queue. It never waits for room: when the queue is full, or the peer has
//! spent its rate budget, the message is refused on the spot so responses and
//! control frames from the same peer keep flowing.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handler::{CallContext, InboundPayload, SharedPayload};
use super::pending::Reply;
use super::{PeerNotice, Router};
use crate::bridge::channel::Channel;
use crate::bridge::protocol::{
    BufferRef, InlinePayload, Message, MessageKind, MessageParts, Params, control,
};
use crate::config::RateLimit;
use crate::error::IpcError;
use crate::process::ProcessRef;
use crate::shm::Payload;

#[derive(Clone)]
pub(super) struct Peer {
    pub remote: ProcessRef,
    pub channel: Channel,
    /// Cancelled on detach; parent of every inbound request token.
    pub cancel: CancellationToken,
    pub generation: u64,
}

enum Work {
    Request {
        parts: MessageParts,
        cancel: CancellationToken,
    },
    Event(MessageParts),
}

type Served = Result<(Value, Option<Payload>), IpcError>;

/// Fixed-window budget for the requests and events of one peer.
struct RateWindow {
    limit: RateLimit,
    started: Instant,
    used: u32,
}

impl RateWindow {
    fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            started: Instant::now(),
            used: 0,
        }
    }

    /// Counts one message; false once the current window is spent.
    fn admit(&mut self, now: Instant) -> bool {
        if now.duration_since(self.started) >= self.limit.per {
            self.started = now;
            self.used = 0;
        }
        if self.used >= self.limit.max_requests {
            return false;
        }
        self.used += 1;
        true
    }
}

pub(super) fn start(router: Router, peer: Peer) {
    let (tx, rx) = mpsc::channel(router.inner.config.inbound_queue.max(1));
    if let Some(interval) = router.inner.config.heartbeat_interval {
        tokio::spawn(heartbeat_loop(peer.clone(), interval));
    }
    tokio::spawn(dispatch_loop(router.clone(), peer.clone(), rx));
    tokio::spawn(read_loop(router, peer, tx));
}

async fn read_loop(router: Router, peer: Peer, work: mpsc::Sender<Work>) {
    let mut inbound = peer.channel.receive();
    let mut window = router.inner.config.rate_limit.map(RateWindow::new);
    loop {
        let msg = tokio::select! {
            biased;
            _ = peer.cancel.cancelled() => break,
            msg = inbound.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        router.on_message(&peer, msg, &work, window.as_mut()).await;
    }
    drop(work);
    router.peer_lost(&peer);
}

/// Runs handlers one at a time so a peer observes them in send order.
async fn dispatch_loop(router: Router, peer: Peer, mut work: mpsc::Receiver<Work>) {
    while let Some(item) = work.recv().await {
        match item {
            Work::Request { parts, cancel } => router.serve_request(&peer, parts, cancel).await,
            Work::Event(parts) => router.serve_event(&peer, parts).await,
        }
    }
}

async fn heartbeat_loop(peer: Peer, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            biased;
            _ = peer.cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let beat = Message::event(control::HEARTBEAT, Params::new());
        if peer.channel.send(beat).await.is_err() {
            break;
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl Router {
    async fn on_message(
        &self,
        peer: &Peer,
        msg: Message,
        work: &mpsc::Sender<Work>,
        window: Option<&mut RateWindow>,
    ) {
        let parts = msg.into_parts();
        if parts.kind == MessageKind::Response {
            return self.on_response(peer, parts);
        }
        if control::is_control(&parts.method) {
            return self.on_control(peer, parts);
        }
        if let Some(window) = window
            && !window.admit(Instant::now())
        {
            let error = IpcError::Authorization {
                message: format!("{} exceeded its request rate", peer.remote.id),
                details: Some(json!({"method": parts.method, "reason": "rate_limited"})),
            };
            return self.refuse(peer, parts, error).await;
        }

        let item = if parts.kind == MessageKind::Request {
            let cancel = peer.cancel.child_token();
            self.inner
                .inbound
                .insert((peer.remote.id.clone(), parts.id), cancel.clone());
            Work::Request { parts, cancel }
        } else {
            Work::Event(parts)
        };

        match work.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                let parts = match item {
                    Work::Request { parts, .. } => {
                        self.inner
                            .inbound
                            .remove(&(peer.remote.id.clone(), parts.id));
                        parts
                    }
                    Work::Event(parts) => parts,
                };
                let error = IpcError::Internal {
                    message: format!("inbound queue for {} is full", peer.remote.id),
                    details: Some(json!({"method": parts.method, "reason": "overloaded"})),
                };
                self.refuse(peer, parts, error).await;
            }
            // The dispatcher is gone, so the peer is going away.
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Answer a request with `error` without running it; drop an event.
    async fn refuse(&self, peer: &Peer, parts: MessageParts, error: IpcError) {
        let MessageParts {
            id,
            kind,
            method,
            buffer,
            inline,
            ..
        } = parts;
        tracing::warn!(
            target: "switchyard::audit",
            peer = %peer.remote.id,
            method = %method,
            correlation_id = %id,
            error = %error,
            "Refusing inbound message"
        );
        // Hands any shared buffer straight back to its owner.
        drop(self.inbound_payload(peer, buffer, inline));
        if kind != MessageKind::Request {
            return;
        }
        let response = Message::error_response(id, method.as_str(), error.to_payload());
        if let Err(e) = peer.channel.send(response).await {
            tracing::debug!(correlation_id = %id, peer = %peer.remote.id, error = %e, "Refusal not delivered");
        }
    }

    fn on_response(&self, peer: &Peer, parts: MessageParts) {
        let MessageParts {
            id,
            method,
            result,
            buffer,
            inline,
            error,
            ..
        } = parts;

        let payload = self.inbound_payload(peer, buffer, inline);
        let outcome = match (error, payload) {
            (Some(error), _) => Err(IpcError::from_payload(error)),
            (None, Err(e)) => Err(e),
            (None, Ok(payload)) => Ok(Reply {
                value: result.unwrap_or(Value::Null),
                payload,
            }),
        };

        if let Err(orphan) = self.inner.pending.resolve(id, &peer.remote.id, outcome) {
            tracing::warn!(
                target: "switchyard::protocol",
                correlation_id = %id,
                peer = %peer.remote.id,
                method = %method,
                "Response matches no pending call; discarding"
            );
            // Dropping an unclaimed payload hands its lease back to the owner.
            drop(orphan);
        }
    }

    fn on_control(&self, peer: &Peer, parts: MessageParts) {
        let params = Value::Object(parts.params);
        match parts.method.as_str() {
            control::HEARTBEAT => self.notify(PeerNotice::Heartbeat(peer.remote.id.clone())),
            control::CANCEL => match serde_json::from_value::<control::Cancel>(params) {
                Ok(cancel) => {
                    let key = (peer.remote.id.clone(), cancel.id);
                    if let Some((_, token)) = self.inner.inbound.remove(&key) {
                        tracing::debug!(correlation_id = %cancel.id, peer = %peer.remote.id, "Inbound call cancelled by caller");
                        token.cancel();
                    }
                }
                Err(e) => self.bad_control(peer, &parts.method, &e),
            },
            control::RELEASE => match serde_json::from_value::<control::Release>(params) {
                Ok(release) => {
                    if !self.inner.buffers.release(&release.handle, &peer.remote.id) {
                        tracing::debug!(handle = %release.handle, peer = %peer.remote.id, "Release for buffer not held");
                    }
                }
                Err(e) => self.bad_control(peer, &parts.method, &e),
            },
            other => tracing::warn!(
                target: "switchyard::protocol",
                peer = %peer.remote.id,
                method = other,
                "Unknown control message"
            ),
        }
    }

    fn bad_control(&self, peer: &Peer, method: &str, error: &serde_json::Error) {
        tracing::warn!(
            target: "switchyard::protocol",
            peer = %peer.remote.id,
            method,
            error = %error,
            "Malformed control message"
        );
    }

    /// Take ownership of the payload a peer sent along with a message.
    fn inbound_payload(
        &self,
        peer: &Peer,
        buffer: Option<BufferRef>,
        inline: Option<InlinePayload>,
    ) -> Result<Option<InboundPayload>, IpcError> {
        if let Some(meta) = buffer {
            if meta.owner != peer.remote.id {
                return Err(IpcError::protocol(format!(
                    "buffer {} is owned by {}, not the sender {}",
                    meta.handle, meta.owner, peer.remote.id
                )));
            }
            let shared = SharedPayload::new(meta, self.inner.buffers.clone());
            return Ok(Some(InboundPayload::Shared(shared)));
        }
        match inline {
            Some(inline) => {
                let bytes = inline
                    .decode()
                    .map_err(|e| IpcError::protocol(format!("invalid inline payload: {e}")))?;
                Ok(Some(InboundPayload::Inline(Payload::new(
                    inline.content_type,
                    bytes,
                ))))
            }
            None => Ok(None),
        }
    }

    async fn serve_request(&self, peer: &Peer, parts: MessageParts, cancel: CancellationToken) {
        let id = parts.id;
        let method = parts.method.clone();
        let served = self.run_request(peer, parts, &cancel).await;
        self.inner.inbound.remove(&(peer.remote.id.clone(), id));

        let Some(served) = served else {
            tracing::debug!(correlation_id = %id, peer = %peer.remote.id, method = %method, "Call cancelled; not responding");
            return;
        };

        let (response, mut shared) = match served {
            Ok((value, reply)) => {
                match self.attach_payload(
                    Message::response(id, method.as_str(), value),
                    reply.as_ref(),
                    &peer.remote.id,
                ) {
                    Ok(attached) => attached,
                    Err(e) => (Message::error_response(id, method.as_str(), e.to_payload()), None),
                }
            }
            Err(e) => {
                tracing::debug!(
                    correlation_id = %id,
                    peer = %peer.remote.id,
                    method = %method,
                    kind = e.kind().as_str(),
                    error = %e,
                    "Call failed"
                );
                (Message::error_response(id, method.as_str(), e.to_payload()), None)
            }
        };

        match peer.channel.send(response).await {
            Ok(()) => {}
            Err(IpcError::Protocol(reason)) => {
                // The channel refused the frame but is still up; the caller is
                // owed an answer it can receive.
                self.unlease(shared.take(), &peer.remote.id);
                tracing::warn!(
                    target: "switchyard::protocol",
                    correlation_id = %id,
                    peer = %peer.remote.id,
                    method = %method,
                    reason = %reason,
                    "Response too large to send"
                );
                let error = IpcError::protocol(format!(
                    "response to {method} could not be framed: {reason}"
                ));
                let fallback = Message::error_response(id, method.as_str(), error.to_payload());
                if let Err(e) = peer.channel.send(fallback).await {
                    tracing::debug!(correlation_id = %id, peer = %peer.remote.id, error = %e, "Response not delivered");
                }
            }
            Err(e) => {
                self.unlease(shared, &peer.remote.id);
                tracing::debug!(correlation_id = %id, peer = %peer.remote.id, error = %e, "Response not delivered");
            }
        }
    }

    /// `None` when the caller cancelled and no response is owed.
    async fn run_request(
        &self,
        peer: &Peer,
        parts: MessageParts,
        cancel: &CancellationToken,
    ) -> Option<Served> {
        let MessageParts {
            id,
            method,
            params,
            buffer,
            inline,
            ..
        } = parts;

        let payload = match self.inbound_payload(peer, buffer, inline) {
            Ok(payload) => payload,
            Err(e) => return Some(Err(e)),
        };
        if cancel.is_cancelled() {
            return None;
        }
        if let Err(e) = self.admit(peer, &method, &params) {
            return Some(Err(e));
        }
        let Some(handler) = self.inner.handlers.method(&method) else {
            return Some(Err(IpcError::protocol(format!("no handler for {method}"))));
        };

        let ctx = CallContext::new(
            peer.remote.clone(),
            method,
            id,
            cancel.clone(),
            payload,
            self.clone(),
        );
        let call = AssertUnwindSafe(handler.call(ctx.clone(), params)).catch_unwind();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = call => Some(match result {
                Ok(Ok(value)) => Ok((value, ctx.take_reply())),
                Ok(Err(e)) => Err(e),
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::error!(correlation_id = %id, method = %ctx.method, panic = %message, "Handler panicked");
                    Err(IpcError::internal(format!("handler panicked: {message}")))
                }
            }),
        }
    }

    async fn serve_event(&self, peer: &Peer, parts: MessageParts) {
        if peer.cancel.is_cancelled() {
            return;
        }
        let MessageParts {
            id,
            method,
            params,
            buffer,
            inline,
            ..
        } = parts;

        let payload = match self.inbound_payload(peer, buffer, inline) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(target: "switchyard::protocol", peer = %peer.remote.id, method = %method, error = %e, "Dropping event");
                return;
            }
        };
        if self.admit(peer, &method, &params).is_err() {
            return;
        }
        let handlers = self.inner.handlers.event_handlers(&method);
        if handlers.is_empty() {
            tracing::debug!(peer = %peer.remote.id, method = %method, "No handler for event");
            return;
        }

        let ctx = CallContext::new(
            peer.remote.clone(),
            method,
            id,
            peer.cancel.child_token(),
            payload,
            self.clone(),
        );
        for handler in handlers {
            let call = AssertUnwindSafe(handler.call(ctx.clone(), params.clone())).catch_unwind();
            let result = tokio::select! {
                biased;
                _ = peer.cancel.cancelled() => return,
                result = call => result,
            };
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!(peer = %peer.remote.id, method = %ctx.method, error = %e, "Event handler failed")
                }
                Err(panic) => tracing::error!(
                    peer = %peer.remote.id,
                    method = %ctx.method,
                    panic = %panic_message(panic.as_ref()),
                    "Event handler panicked"
                ),
            }
        }
    }

    /// Input limits, then the permission enforcer.
    fn admit(&self, peer: &Peer, method: &str, params: &Params) -> Result<(), IpcError> {
        if let Err(violation) = self.inner.config.limits.check(params) {
            tracing::warn!(
                target: "switchyard::protocol",
                peer = %peer.remote.id,
                method,
                violation = %violation,
                "Parameters exceed input limits"
            );
            return Err(IpcError::protocol(format!("{method}: {violation}")));
        }
        self.inner
            .enforcer
            .authorize(&peer.remote, method, params)
            .map_err(IpcError::from)
    }

    /// The connection ended without a detach.
    fn peer_lost(&self, peer: &Peer) {
        let removed = self
            .inner
            .peers
            .remove_if(&peer.remote.id, |_, current| {
                current.generation == peer.generation
            })
            .is_some();
        if !removed {
            return;
        }
        peer.cancel.cancel();
        peer.channel.close();
        let failed = self.cleanup_peer(&peer.remote.id);
        tracing::warn!(peer = %peer.remote.id, failed_calls = failed, "Peer disconnected");
        self.notify(PeerNotice::Disconnected(peer.remote.id.clone()));
    }
}
