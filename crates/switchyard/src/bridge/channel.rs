//! One bidirectional connection to one remote process.
//!
//! A channel frames and deframes [`Message`]s and nothing else. Outbound
//! messages are serialized and size-checked by [`Channel::send`], then go
//! through a bounded queue drained by a writer task that owns the write half;
//! inbound frames are handed out once through [`Channel::receive`]. A message
//! too large to frame is refused to its sender and the connection stays up.
//!
//! State moves `Connecting -> Open -> Closed`. The move to `Closed` happens
//! exactly once per connection and is observable through [`Channel::subscribe`]
//! and [`Channel::closed`]. Calling [`Channel::open`] again installs a fresh
//! connection and a fresh inbound sequence.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use futures::SinkExt;
use futures::stream::{self, BoxStream, StreamExt};
use tokio::io::AsyncWrite;
use tokio::net::UnixStream;
use tokio::net::unix::OwnedReadHalf;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use super::codec::{self, DEFAULT_MAX_FRAME_LENGTH, FrameError, JsonCodec};
use super::protocol::Message;
use super::transport;
use crate::error::IpcError;
use crate::process::{ProcessId, ProcessRef};

const DEFAULT_QUEUE_DEPTH: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

type Inbound = FramedRead<OwnedReadHalf, JsonCodec<Message>>;

struct Connection {
    generation: u64,
    outbound: Option<mpsc::Sender<Bytes>>,
    inbound: Option<Inbound>,
    shutdown: CancellationToken,
}

struct Inner {
    local: ProcessRef,
    remote: ProcessRef,
    max_frame_length: usize,
    queue_depth: usize,
    state: watch::Sender<ChannelState>,
    conn: Mutex<Connection>,
}

#[derive(Clone)]
pub struct Channel {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("local", &self.inner.local.id)
            .field("remote", &self.inner.remote.id)
            .field("state", &self.state())
            .finish()
    }
}

impl Channel {
    /// A channel with no connection yet.
    pub fn new(local: ProcessRef, remote: ProcessRef) -> Self {
        Self::with_limits(local, remote, DEFAULT_MAX_FRAME_LENGTH, DEFAULT_QUEUE_DEPTH)
    }

    pub fn with_limits(
        local: ProcessRef,
        remote: ProcessRef,
        max_frame_length: usize,
        queue_depth: usize,
    ) -> Self {
        let (state, _) = watch::channel(ChannelState::Connecting);
        Self {
            inner: Arc::new(Inner {
                local,
                remote,
                max_frame_length,
                queue_depth: queue_depth.max(1),
                state,
                conn: Mutex::new(Connection {
                    generation: 0,
                    outbound: None,
                    inbound: None,
                    shutdown: CancellationToken::new(),
                }),
            }),
        }
    }

    /// Wrap a connection the supervisor accepted. The channel starts open.
    pub fn accepted(
        local: ProcessRef,
        remote: ProcessRef,
        stream: UnixStream,
        max_frame_length: usize,
        queue_depth: usize,
    ) -> Self {
        let channel = Self::with_limits(local, remote, max_frame_length, queue_depth);
        channel.install(stream);
        channel
    }

    /// Connect to the remote process's socket and transition to `Open`.
    ///
    /// On a channel that was closed this replaces the old connection.
    pub async fn open(&self, path: &Path) -> Result<(), IpcError> {
        let stream = transport::connect(path).await.map_err(|e| {
            IpcError::transport(format!(
                "failed to connect to {} at {}: {e}",
                self.inner.remote.id,
                path.display()
            ))
        })?;
        self.install(stream);
        Ok(())
    }

    fn install(&self, stream: UnixStream) {
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::channel::<Bytes>(self.inner.queue_depth);
        let shutdown = CancellationToken::new();

        let generation = {
            let mut conn = self.conn();
            conn.shutdown.cancel();
            conn.generation += 1;
            conn.outbound = Some(tx);
            conn.inbound = Some(FramedRead::new(
                read_half,
                JsonCodec::with_max_frame_length(self.inner.max_frame_length),
            ));
            conn.shutdown = shutdown.clone();
            conn.generation
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            write_frames(
                write_half,
                rx,
                shutdown,
                inner.max_frame_length,
                &inner.remote.id,
            )
            .await;
            Inner::mark_closed(&inner, generation);
        });

        self.inner.state.send_replace(ChannelState::Open);
        tracing::debug!(
            local = %self.inner.local.id,
            remote = %self.inner.remote.id,
            generation,
            "Channel open"
        );
    }

    /// Queue a message for sending.
    ///
    /// A message whose encoding exceeds the frame limit is a protocol error
    /// for this call only; the channel stays open.
    pub async fn send(&self, msg: Message) -> Result<(), IpcError> {
        let body = match codec::encode_body(&msg, self.inner.max_frame_length) {
            Ok(body) => body,
            Err(FrameError::TooLarge { len, max }) => {
                tracing::warn!(
                    target: "switchyard::protocol",
                    remote = %self.inner.remote.id,
                    kind = ?msg.kind(),
                    method = msg.method(),
                    len,
                    max,
                    "Refusing oversized message"
                );
                return Err(IpcError::protocol(format!(
                    "message of {len} bytes exceeds the {max} byte frame limit"
                )));
            }
            Err(e @ FrameError::Serialize(_)) => {
                return Err(IpcError::internal(format!("failed to encode message: {e}")));
            }
        };
        let sender = {
            let conn = self.conn();
            match (&conn.outbound, self.state()) {
                (Some(tx), ChannelState::Open) => tx.clone(),
                (_, state) => {
                    return Err(IpcError::transport(format!(
                        "channel to {} is {state:?}",
                        self.inner.remote.id
                    )));
                }
            }
        };
        sender.send(body).await.map_err(|_| {
            IpcError::transport(format!("channel to {} closed", self.inner.remote.id))
        })
    }

    /// Inbound messages of the current connection.
    ///
    /// The stream can be taken once per connection; later calls get an empty
    /// stream until the channel is reopened. Frames that fail to parse are
    /// logged and skipped. The stream ends when the connection closes.
    pub fn receive(&self) -> BoxStream<'static, Message> {
        let (framed, shutdown, generation) = {
            let mut conn = self.conn();
            (conn.inbound.take(), conn.shutdown.clone(), conn.generation)
        };
        let Some(framed) = framed else {
            return stream::empty().boxed();
        };

        let inner = Arc::clone(&self.inner);
        stream::unfold(
            (framed, inner, shutdown),
            move |(mut framed, inner, shutdown)| async move {
                loop {
                    let next = tokio::select! {
                        biased;
                        _ = shutdown.cancelled() => None,
                        next = framed.next() => next,
                    };
                    match next {
                        Some(Ok(Ok(msg))) => return Some((msg, (framed, inner, shutdown))),
                        Some(Ok(Err(e))) => {
                            tracing::warn!(
                                target: "switchyard::protocol",
                                remote = %inner.remote.id,
                                error = %e,
                                "Dropping malformed frame"
                            );
                        }
                        Some(Err(e)) => {
                            tracing::warn!(remote = %inner.remote.id, error = %e, "Channel read failed");
                            Inner::mark_closed(&inner, generation);
                            return None;
                        }
                        None => {
                            Inner::mark_closed(&inner, generation);
                            return None;
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Close the current connection. Idempotent.
    pub fn close(&self) {
        let generation = self.conn().generation;
        Inner::mark_closed(&self.inner, generation);
    }

    pub fn state(&self) -> ChannelState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.inner.state.subscribe()
    }

    /// Resolves once the channel is closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        // The sender lives in `inner`, which we hold, so this cannot fail.
        let _ = rx.wait_for(|s| *s == ChannelState::Closed).await;
    }

    pub fn local(&self) -> &ProcessRef {
        &self.inner.local
    }

    pub fn remote(&self) -> &ProcessRef {
        &self.inner.remote
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drain `rx` onto `io` until shutdown, queue closure or an I/O failure.
///
/// Bodies over `max` are dropped with a warning. Only a failed write ends the
/// loop.
async fn write_frames<W: AsyncWrite + Unpin>(
    io: W,
    mut rx: mpsc::Receiver<Bytes>,
    shutdown: CancellationToken,
    max: usize,
    remote: &ProcessId,
) {
    let mut writer = FramedWrite::new(io, codec::frame_codec(max));
    loop {
        let body = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            body = rx.recv() => match body {
                Some(body) => body,
                None => break,
            },
        };
        if body.len() > max {
            tracing::warn!(
                target: "switchyard::protocol",
                remote = %remote,
                len = body.len(),
                max,
                "Skipping frame over the length limit"
            );
            continue;
        }
        if let Err(e) = writer.send(body).await {
            tracing::warn!(remote = %remote, error = %e, "Channel write failed");
            break;
        }
    }
}

impl Inner {
    fn mark_closed(inner: &Arc<Inner>, generation: u64) {
        {
            let mut conn = inner.conn.lock().unwrap_or_else(PoisonError::into_inner);
            if conn.generation != generation {
                return;
            }
            conn.shutdown.cancel();
            conn.outbound = None;
            conn.inbound = None;
        }
        let changed = inner.state.send_if_modified(|state| {
            if *state == ChannelState::Closed {
                false
            } else {
                *state = ChannelState::Closed;
                true
            }
        });
        if changed {
            tracing::debug!(
                local = %inner.local.id,
                remote = %inner.remote.id,
                generation,
                "Channel closed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationId, Params};
    use crate::process::Role;
    use tokio::io::AsyncWriteExt;

    fn pref(id: &str, role: Role) -> ProcessRef {
        ProcessRef::new(ProcessId::new(id).unwrap(), role)
    }

    fn pair() -> (Channel, Channel) {
        let (a, b) = UnixStream::pair().unwrap();
        let controller = pref("controller", Role::Controller);
        let worker = pref("worker-1", Role::Worker);
        (
            Channel::accepted(controller.clone(), worker.clone(), a, 1024 * 1024, 8),
            Channel::accepted(worker, controller, b, 1024 * 1024, 8),
        )
    }

    #[tokio::test]
    async fn messages_arrive_in_order() {
        let (left, right) = pair();
        let mut inbound = right.receive();

        let sent: Vec<Message> = (0..5)
            .map(|i| {
                let mut params = Params::new();
                params.insert("n".into(), i.into());
                Message::request(CorrelationId::new(), "worker.echo", params)
            })
            .collect();
        for msg in &sent {
            left.send(msg.clone()).await.unwrap();
        }

        for expected in &sent {
            let got = inbound.next().await.unwrap();
            assert_eq!(&got, expected);
        }
    }

    #[tokio::test]
    async fn send_on_unopened_channel_is_transport_error() {
        let channel = Channel::new(pref("a", Role::Controller), pref("b", Role::Worker));
        assert_eq!(channel.state(), ChannelState::Connecting);
        let err = channel
            .send(Message::event("a.b", Params::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Transport(_)));
    }

    #[tokio::test]
    async fn remote_close_ends_stream_and_notifies() {
        let (left, right) = pair();
        let mut inbound = right.receive();
        let mut states = right.subscribe();

        left.close();
        assert!(inbound.next().await.is_none());
        right.closed().await;
        assert_eq!(*states.borrow_and_update(), ChannelState::Closed);

        let err = right
            .send(Message::event("a.b", Params::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Transport(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (left, _right) = pair();
        let mut states = left.subscribe();
        left.close();
        left.close();
        states.changed().await.unwrap();
        assert_eq!(*states.borrow(), ChannelState::Closed);
        assert!(!states.has_changed().unwrap());
    }

    #[tokio::test]
    async fn malformed_frame_is_skipped() {
        let (mut raw, b) = UnixStream::pair().unwrap();
        let channel = Channel::accepted(
            pref("worker-1", Role::Worker),
            pref("controller", Role::Controller),
            b,
            1024 * 1024,
            8,
        );
        let mut inbound = channel.receive();

        let junk = b"{\"id\": 12}";
        raw.write_all(&(junk.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(junk).await.unwrap();

        let good = Message::event("ui.ping", Params::new());
        let body = serde_json::to_vec(&good).unwrap();
        raw.write_all(&(body.len() as u32).to_be_bytes()).await.unwrap();
        raw.write_all(&body).await.unwrap();

        assert_eq!(inbound.next().await.unwrap(), good);
        assert!(channel.is_open());
    }

    #[tokio::test]
    async fn reopen_installs_new_connection() {
        let dir = tempfile::tempdir().unwrap();
        let id = ProcessId::new("worker-1").unwrap();
        let endpoint = transport::Endpoint::bind(dir.path(), &id).unwrap();

        let channel = Channel::new(pref("controller", Role::Controller), pref("worker-1", Role::Worker));
        channel.open(endpoint.path()).await.unwrap();
        let first = endpoint.accept().await.unwrap();
        assert!(channel.is_open());

        drop(first);
        assert!(channel.receive().next().await.is_none());
        assert_eq!(channel.state(), ChannelState::Closed);

        channel.open(endpoint.path()).await.unwrap();
        let second = endpoint.accept().await.unwrap();
        assert!(channel.is_open());

        let peer = Channel::accepted(
            pref("worker-1", Role::Worker),
            pref("controller", Role::Controller),
            second,
            1024 * 1024,
            8,
        );
        let msg = Message::event("worker.ready", Params::new());
        peer.send(msg.clone()).await.unwrap();
        assert_eq!(channel.receive().next().await.unwrap(), msg);
    }

    #[tokio::test]
    async fn oversized_send_is_refused_and_channel_stays_open() {
        let (a, b) = UnixStream::pair().unwrap();
        let controller = pref("controller", Role::Controller);
        let worker = pref("worker-1", Role::Worker);
        let left = Channel::accepted(controller.clone(), worker.clone(), a, 2048, 8);
        let right = Channel::accepted(worker, controller, b, 2048, 8);
        let mut inbound = right.receive();

        let mut params = Params::new();
        params.insert("blob".into(), "x".repeat(4096).into());
        let err = left
            .send(Message::event("ui.upload", params))
            .await
            .unwrap_err();
        assert!(matches!(err, IpcError::Protocol(_)));
        assert!(left.is_open());

        let small = Message::event("ui.ping", Params::new());
        left.send(small.clone()).await.unwrap();
        assert_eq!(inbound.next().await.unwrap(), small);
        assert!(right.is_open());
    }

    #[tokio::test]
    async fn writer_skips_bodies_over_the_limit() {
        let (a, b) = UnixStream::pair().unwrap();
        let (tx, rx) = mpsc::channel(4);
        let shutdown = CancellationToken::new();
        let remote = ProcessId::new("worker-1").unwrap();
        let writer = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { write_frames(a, rx, shutdown, 64, &remote).await }
        });

        tx.send(Bytes::from(vec![b' '; 128])).await.unwrap();
        tx.send(Bytes::from_static(b"{\"ok\":true}")).await.unwrap();

        let mut reader = FramedRead::new(b, JsonCodec::<serde_json::Value>::with_max_frame_length(64));
        let first = reader.next().await.unwrap().unwrap().unwrap();
        assert_eq!(first, serde_json::json!({"ok": true}));

        drop(tx);
        writer.await.unwrap();
        assert!(reader.next().await.is_none());
        assert!(!shutdown.is_cancelled());
    }
}
