//! Outstanding outbound calls.
//!
//! Each call owns one slot keyed by its correlation id. Removing the slot is
//! the single point that decides how the call ends: whichever path removes it
//! (response, timeout, cancellation, disconnect) resolves it, and every other
//! path finds nothing to do.

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde_json::Value;
use tokio::sync::oneshot;

use super::handler::InboundPayload;
use crate::bridge::protocol::CorrelationId;
use crate::error::IpcError;
use crate::process::ProcessId;

/// Successful outcome of a call.
#[derive(Debug)]
pub struct Reply {
    pub value: Value,
    pub payload: Option<InboundPayload>,
}

pub(crate) type Outcome = Result<Reply, IpcError>;

struct PendingCall {
    peer: ProcessId,
    method: String,
    tx: oneshot::Sender<Outcome>,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    slots: DashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    /// Open a slot under a correlation id unused by any other in-flight call.
    pub fn register(&self, peer: &ProcessId, method: &str) -> (CorrelationId, oneshot::Receiver<Outcome>) {
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            peer: peer.clone(),
            method: method.to_string(),
            tx,
        };
        loop {
            let id = CorrelationId::new();
            match self.slots.entry(id) {
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    return (id, rx);
                }
                Entry::Occupied(_) => {
                    tracing::warn!(correlation_id = %id, "Correlation id collision, regenerating");
                }
            }
        }
    }

    /// Deliver a response that arrived from `from`.
    ///
    /// Returns the outcome back when no slot matches, so the caller can dispose
    /// of it (and any payload it carries).
    pub fn resolve(&self, id: CorrelationId, from: &ProcessId, outcome: Outcome) -> Result<(), Outcome> {
        match self.slots.remove_if(&id, |_, call| &call.peer == from) {
            Some((_, call)) => {
                tracing::trace!(correlation_id = %id, method = %call.method, "Call resolved");
                // Receiver gone means the caller is being dropped; nothing to do.
                let _ = call.tx.send(outcome);
                Ok(())
            }
            None => Err(outcome),
        }
    }

    /// Drop a slot without resolving it. True if this call removed it.
    pub fn remove(&self, id: &CorrelationId) -> bool {
        self.slots.remove(id).is_some()
    }

    /// Fail every call waiting on `peer`.
    pub fn fail_peer(&self, peer: &ProcessId, err: &IpcError) -> usize {
        let ids: Vec<CorrelationId> = self
            .slots
            .iter()
            .filter(|e| &e.value().peer == peer)
            .map(|e| *e.key())
            .collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.slots.remove_if(&id, |_, call| &call.peer == peer) {
                let _ = call.tx.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn fail_all(&self, err: &IpcError) -> usize {
        let ids: Vec<CorrelationId> = self.slots.iter().map(|e| *e.key()).collect();
        let mut failed = 0;
        for id in ids {
            if let Some((_, call)) = self.slots.remove(&id) {
                let _ = call.tx.send(Err(err.clone()));
                failed += 1;
            }
        }
        failed
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pid(s: &str) -> ProcessId {
        ProcessId::new(s).unwrap()
    }

    fn ok(v: Value) -> Outcome {
        Ok(Reply {
            value: v,
            payload: None,
        })
    }

    #[tokio::test]
    async fn resolves_exactly_once() {
        let pending = PendingCalls::default();
        let worker = pid("worker-1");
        let (id, rx) = pending.register(&worker, "worker.echo");
        assert_eq!(pending.len(), 1);

        assert!(pending.resolve(id, &worker, ok(Value::from(1))).is_ok());
        assert!(pending.resolve(id, &worker, ok(Value::from(2))).is_err());
        assert!(!pending.remove(&id));
        assert_eq!(pending.fail_peer(&worker, &IpcError::Cancelled), 0);

        let reply = rx.await.unwrap().unwrap();
        assert_eq!(reply.value, Value::from(1));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn response_from_wrong_peer_is_rejected() {
        let pending = PendingCalls::default();
        let (id, _rx) = pending.register(&pid("worker-1"), "worker.echo");
        assert!(pending.resolve(id, &pid("worker-2"), ok(Value::Null)).is_err());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn fail_peer_only_touches_that_peer() {
        let pending = PendingCalls::default();
        let (_, rx1) = pending.register(&pid("worker-1"), "a.b");
        let (_, rx2) = pending.register(&pid("worker-1"), "a.c");
        let (_, rx3) = pending.register(&pid("worker-2"), "a.d");

        let failed = pending.fail_peer(&pid("worker-1"), &IpcError::ConnectionLost("gone".into()));
        assert_eq!(failed, 2);
        assert!(matches!(rx1.await.unwrap(), Err(IpcError::ConnectionLost(_))));
        assert!(matches!(rx2.await.unwrap(), Err(IpcError::ConnectionLost(_))));
        assert_eq!(pending.len(), 1);
        drop(rx3);
    }

    #[test]
    fn ids_are_unique() {
        let pending = PendingCalls::default();
        let worker = pid("worker-1");
        let ids: std::collections::HashSet<_> = (0..1000)
            .map(|_| pending.register(&worker, "a.b").0)
            .collect();
        assert_eq!(ids.len(), 1000);
    }
}
