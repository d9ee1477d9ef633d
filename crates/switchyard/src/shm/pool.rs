//! Allocation, leasing and reclamation of shared buffers.
//!
//! Every process has one [`BufferPool`]. It tracks two kinds of buffers:
//!
//! - **owned**: allocated here. The pool keeps a per-holder grant count;
//!   the owner holds one grant from allocation, each remote holder one per
//!   message that carried the buffer. When the total reaches zero the shm
//!   name is unlinked and the entry dropped.
//! - **foreign**: allocated by a peer and opened here read-only. Each live
//!   local view accounts for one grant the owner handed us; dropping a view
//!   emits a [`ReleaseNotice`] that the router forwards to the owner.
//!
//! A view copies the buffer's bytes out when it is opened. An owner that
//! shrinks its object afterwards cannot affect the view, and one that does
//! so earlier makes the open fail with a protocol error.
//!
//! All reference count and state changes for one buffer go through that
//! buffer's mutex. Allocation never reuses a name, so a handle never refers
//! to different memory while a lease on it is outstanding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::mpsc;

use super::region::{self, Region, Sealed};
use crate::bridge::protocol::{BufferHandle, BufferRef};
use crate::error::IpcError;
use crate::process::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseState {
    Leased,
    Released,
    Revoked,
}

/// Bulk bytes plus a content type only application code interprets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub content_type: String,
    pub bytes: Bytes,
}

impl Payload {
    pub fn new(content_type: impl Into<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            bytes: bytes.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// A local holder gave up one grant on a buffer owned by `owner`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseNotice {
    pub handle: BufferHandle,
    pub owner: ProcessId,
}

/// Outcome of [`BufferPool::revoke_process`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RevokeSummary {
    /// Owned buffers on which the process held grants.
    pub leases_dropped: usize,
    /// Foreign buffers the process owned.
    pub revoked: usize,
}

struct LeaseBook {
    state: LeaseState,
    grants: HashMap<ProcessId, usize>,
}

impl LeaseBook {
    fn total(&self) -> usize {
        self.grants.values().sum()
    }
}

struct Slot {
    meta: BufferRef,
    region: Sealed,
    book: Mutex<LeaseBook>,
}

impl Slot {
    fn book(&self) -> MutexGuard<'_, LeaseBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct BufferPool {
    local: ProcessId,
    owned: DashMap<BufferHandle, Arc<Slot>>,
    foreign: DashMap<BufferHandle, Arc<Slot>>,
    releases: Mutex<Option<mpsc::UnboundedSender<ReleaseNotice>>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("local", &self.local)
            .field("owned", &self.owned.len())
            .field("foreign", &self.foreign.len())
            .finish()
    }
}

impl BufferPool {
    pub fn new(local: ProcessId) -> Arc<Self> {
        Arc::new(Self {
            local,
            owned: DashMap::new(),
            foreign: DashMap::new(),
            releases: Mutex::new(None),
        })
    }

    pub fn local(&self) -> &ProcessId {
        &self.local
    }

    /// Route release notices for foreign buffers to the returned receiver.
    /// Replaces any earlier subscriber.
    pub fn subscribe_releases(&self) -> mpsc::UnboundedReceiver<ReleaseNotice> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.releases.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        rx
    }

    /// Reserve a fresh region of `size` bytes. The owner holds one grant.
    pub fn allocate(self: &Arc<Self>, size: usize) -> Result<BufferWriter, IpcError> {
        let mut attempts = 0;
        loop {
            let handle = BufferHandle::generate();
            match Region::create(handle.as_str(), size) {
                Ok(region) => {
                    tracing::trace!(handle = %handle, size, "Allocated shared buffer");
                    return Ok(BufferWriter {
                        pool: Arc::clone(self),
                        guard: UnlinkOnDrop(Some(handle.clone())),
                        handle,
                        region,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempts < 3 => {
                    attempts += 1;
                }
                Err(e) => {
                    return Err(IpcError::transport(format!(
                        "failed to allocate {size} byte shared buffer: {e}"
                    )));
                }
            }
        }
    }

    /// Allocate, copy `payload` in and seal.
    pub fn publish(self: &Arc<Self>, payload: &Payload) -> Result<BufferRef, IpcError> {
        let mut writer = self.allocate(payload.len())?;
        writer.as_mut_slice().copy_from_slice(&payload.bytes);
        Ok(writer.finish(payload.content_type.clone()))
    }

    /// Grant `requester` a lease on an owned buffer.
    pub fn lease(&self, handle: &BufferHandle, requester: &ProcessId) -> Result<(), IpcError> {
        let slot = self
            .owned
            .get(handle)
            .map(|s| Arc::clone(s.value()))
            .ok_or_else(|| IpcError::protocol(format!("unknown buffer {handle}")))?;

        let mut book = slot.book();
        match book.state {
            LeaseState::Leased => {
                *book.grants.entry(requester.clone()).or_insert(0) += 1;
                tracing::trace!(
                    handle = %handle,
                    holder = %requester,
                    ref_count = book.total(),
                    "Lease granted"
                );
                Ok(())
            }
            LeaseState::Released | LeaseState::Revoked => Err(IpcError::protocol(format!(
                "buffer {handle} is no longer available"
            ))),
        }
    }

    /// Drop one grant `holder` has on an owned buffer.
    ///
    /// Returns false, and changes nothing, when `holder` holds no grant.
    pub fn release(&self, handle: &BufferHandle, holder: &ProcessId) -> bool {
        let Some(slot) = self.owned.get(handle).map(|s| Arc::clone(s.value())) else {
            return false;
        };

        let reclaim = {
            let mut book = slot.book();
            let Some(count) = book.grants.get_mut(holder) else {
                return false;
            };
            *count -= 1;
            if *count == 0 {
                book.grants.remove(holder);
            }
            let remaining = book.total();
            tracing::trace!(handle = %handle, holder = %holder, ref_count = remaining, "Lease released");
            if remaining == 0 && book.state == LeaseState::Leased {
                book.state = LeaseState::Released;
                true
            } else {
                false
            }
        };

        if reclaim {
            self.reclaim(&slot);
        }
        true
    }

    /// Invalidate every lease on a buffer and unlink it now.
    ///
    /// Views keep their copy but every read fails.
    pub fn revoke(&self, handle: &BufferHandle) -> bool {
        if let Some(slot) = self.owned.get(handle).map(|s| Arc::clone(s.value())) {
            Self::mark_revoked(&slot);
            self.reclaim(&slot);
            return true;
        }
        if let Some((_, slot)) = self.foreign.remove(handle) {
            Self::mark_revoked(&slot);
            // The owner is gone and cannot unlink it any more.
            Self::unlink(&slot);
            return true;
        }
        false
    }

    /// Clean up after `process` terminated: drop every grant it held on our
    /// buffers and revoke every buffer it owned that we mapped.
    pub fn revoke_process(&self, process: &ProcessId) -> RevokeSummary {
        let mut summary = RevokeSummary::default();

        let owned: Vec<Arc<Slot>> = self.owned.iter().map(|e| Arc::clone(e.value())).collect();
        for slot in owned {
            let reclaim = {
                let mut book = slot.book();
                if book.grants.remove(process).is_none() {
                    continue;
                }
                summary.leases_dropped += 1;
                if book.total() == 0 && book.state == LeaseState::Leased {
                    book.state = LeaseState::Released;
                    true
                } else {
                    false
                }
            };
            if reclaim {
                self.reclaim(&slot);
            }
        }

        let foreign: Vec<BufferHandle> = self
            .foreign
            .iter()
            .filter(|e| &e.value().meta.owner == process)
            .map(|e| e.key().clone())
            .collect();
        for handle in foreign {
            if self.revoke(&handle) {
                summary.revoked += 1;
            }
        }

        if summary != RevokeSummary::default() {
            tracing::info!(
                process_id = %process,
                leases_dropped = summary.leases_dropped,
                revoked = summary.revoked,
                "Revoked shared buffers of terminated process"
            );
        }
        summary
    }

    /// Open a buffer for reading and copy its bytes out.
    ///
    /// For an owned buffer the local process takes an extra grant. For a
    /// foreign buffer this consumes one grant the owner gave us; it is
    /// returned when the view is released. On error no grant is consumed.
    pub fn open_view(self: &Arc<Self>, meta: &BufferRef) -> Result<BufferView, IpcError> {
        if meta.owner == self.local {
            self.lease(&meta.handle, &self.local)?;
            let slot = self
                .owned
                .get(&meta.handle)
                .map(|s| Arc::clone(s.value()))
                .ok_or_else(|| IpcError::protocol(format!("unknown buffer {}", meta.handle)))?;
            return self.load_view(slot);
        }

        let size = usize::try_from(meta.size)
            .map_err(|_| IpcError::protocol(format!("buffer size {} too large", meta.size)))?;

        let slot = match self.foreign.entry(meta.handle.clone()) {
            Entry::Occupied(mut entry) => {
                let existing = Arc::clone(entry.get());
                let mut book = existing.book();
                match book.state {
                    LeaseState::Leased => {
                        *book.grants.entry(self.local.clone()).or_insert(0) += 1;
                        drop(book);
                        existing
                    }
                    LeaseState::Revoked => {
                        return Err(IpcError::protocol(format!(
                            "buffer {} was revoked",
                            meta.handle
                        )));
                    }
                    // Last view is on its way out; open afresh.
                    LeaseState::Released => {
                        drop(book);
                        let slot = self.map_foreign(meta, size)?;
                        entry.insert(Arc::clone(&slot));
                        slot
                    }
                }
            }
            Entry::Vacant(entry) => {
                let slot = self.map_foreign(meta, size)?;
                entry.insert(Arc::clone(&slot));
                slot
            }
        };
        self.load_view(slot)
    }

    /// Copy the slot's bytes into a new view, or undo the grant `open_view`
    /// just took.
    fn load_view(self: &Arc<Self>, slot: Arc<Slot>) -> Result<BufferView, IpcError> {
        match slot.region.read() {
            Ok(data) => Ok(BufferView::new(Arc::clone(self), slot, data)),
            Err(e) => {
                tracing::warn!(
                    target: "switchyard::protocol",
                    handle = %slot.meta.handle,
                    owner = %slot.meta.owner,
                    error = %e,
                    "Shared buffer unreadable"
                );
                if slot.meta.owner == self.local {
                    self.release(&slot.meta.handle, &self.local);
                } else {
                    self.drop_foreign_grant(&slot);
                }
                Err(IpcError::protocol(format!(
                    "failed to read buffer {}: {e}",
                    slot.meta.handle
                )))
            }
        }
    }

    /// Give back a grant on a foreign buffer without ever opening it.
    pub fn forfeit(&self, meta: &BufferRef) {
        if meta.owner == self.local {
            self.release(&meta.handle, &self.local);
        } else {
            self.notify(&meta.handle, &meta.owner);
        }
    }

    /// Outstanding grants on an owned buffer.
    pub fn ref_count(&self, handle: &BufferHandle) -> Option<usize> {
        self.owned.get(handle).map(|s| {
            let total = s.value().book().total();
            total
        })
    }

    pub fn lease_state(&self, handle: &BufferHandle) -> Option<LeaseState> {
        self.owned
            .get(handle)
            .or_else(|| self.foreign.get(handle))
            .map(|s| {
                let state = s.value().book().state;
                state
            })
    }

    /// True while the buffer is tracked here, owned or mapped.
    pub fn is_live(&self, handle: &BufferHandle) -> bool {
        self.owned.contains_key(handle) || self.foreign.contains_key(handle)
    }

    pub fn owned_count(&self) -> usize {
        self.owned.len()
    }

    pub fn mapped_count(&self) -> usize {
        self.foreign.len()
    }

    fn map_foreign(&self, meta: &BufferRef, size: usize) -> Result<Arc<Slot>, IpcError> {
        let region = Sealed::open(meta.handle.as_str(), size).map_err(|e| {
            IpcError::protocol(format!("failed to open buffer {}: {e}", meta.handle))
        })?;
        let mut grants = HashMap::new();
        grants.insert(self.local.clone(), 1);
        Ok(Arc::new(Slot {
            meta: meta.clone(),
            region,
            book: Mutex::new(LeaseBook {
                state: LeaseState::Leased,
                grants,
            }),
        }))
    }

    fn release_view(&self, slot: &Arc<Slot>) {
        if slot.meta.owner == self.local {
            self.release(&slot.meta.handle, &self.local);
            return;
        }
        if self.drop_foreign_grant(slot) {
            self.notify(&slot.meta.handle, &slot.meta.owner);
        }
    }

    /// Drop one local grant on a foreign slot, forgetting the slot with the
    /// last one. False if the slot was revoked.
    fn drop_foreign_grant(&self, slot: &Arc<Slot>) -> bool {
        let forget = {
            let mut book = slot.book();
            if book.state == LeaseState::Revoked {
                return false;
            }
            let remaining = match book.grants.get_mut(&self.local) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count
                }
                None => 0,
            };
            if remaining == 0 {
                book.grants.clear();
                book.state = LeaseState::Released;
            }
            remaining == 0
        };
        if forget {
            self.foreign
                .remove_if(&slot.meta.handle, |_, s| Arc::ptr_eq(s, slot));
        }
        true
    }

    fn notify(&self, handle: &BufferHandle, owner: &ProcessId) {
        let guard = self.releases.lock().unwrap_or_else(PoisonError::into_inner);
        let sent = guard.as_ref().is_some_and(|tx| {
            tx.send(ReleaseNotice {
                handle: handle.clone(),
                owner: owner.clone(),
            })
            .is_ok()
        });
        if !sent {
            tracing::debug!(handle = %handle, owner = %owner, "No route for release notice");
        }
    }

    fn mark_revoked(slot: &Slot) {
        let mut book = slot.book();
        book.state = LeaseState::Revoked;
        book.grants.clear();
    }

    fn reclaim(&self, slot: &Arc<Slot>) {
        self.owned
            .remove_if(&slot.meta.handle, |_, s| Arc::ptr_eq(s, slot));
        Self::unlink(slot);
        tracing::debug!(handle = %slot.meta.handle, size = slot.meta.size, "Reclaimed shared buffer");
    }

    fn unlink(slot: &Slot) {
        match region::unlink(slot.region.name()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(handle = %slot.meta.handle, error = %e, "shm_unlink failed"),
        }
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        for entry in self.owned.iter() {
            Self::unlink(entry.value());
        }
    }
}

/// Exclusive write access to a freshly allocated buffer, before it is sealed.
///
/// Dropping an unfinished writer unlinks the region.
pub struct BufferWriter {
    pool: Arc<BufferPool>,
    handle: BufferHandle,
    region: Region,
    guard: UnlinkOnDrop,
}

impl BufferWriter {
    pub fn handle(&self) -> &BufferHandle {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.region.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.region.as_mut_slice()
    }

    pub fn write_at(&mut self, offset: usize, data: &[u8]) -> Result<(), IpcError> {
        let buf = self.region.as_mut_slice();
        let end = offset
            .checked_add(data.len())
            .filter(|end| *end <= buf.len())
            .ok_or_else(|| {
                IpcError::internal(format!(
                    "write of {} bytes at offset {offset} exceeds buffer of {} bytes",
                    data.len(),
                    buf.len()
                ))
            })?;
        buf[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Seal the buffer: compute its checksum and register it as owned.
    pub fn finish(self, content_type: impl Into<String>) -> BufferRef {
        let Self {
            pool,
            handle,
            region,
            mut guard,
        } = self;
        guard.disarm();

        let meta = BufferRef {
            handle: handle.clone(),
            size: region.len() as u64,
            checksum: crc32fast::hash(region.as_slice()),
            content_type: content_type.into(),
            owner: pool.local.clone(),
        };
        let region = region.seal();
        let mut grants = HashMap::new();
        grants.insert(pool.local.clone(), 1);
        pool.owned.insert(
            handle,
            Arc::new(Slot {
                meta: meta.clone(),
                region,
                book: Mutex::new(LeaseBook {
                    state: LeaseState::Leased,
                    grants,
                }),
            }),
        );
        meta
    }
}

struct UnlinkOnDrop(Option<BufferHandle>);

impl UnlinkOnDrop {
    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for UnlinkOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            tracing::trace!(handle = %handle, "Discarding unfinished shared buffer");
            if let Err(e) = region::unlink(handle.as_str()) {
                tracing::warn!(handle = %handle, error = %e, "shm_unlink failed");
            }
        }
    }
}

/// A leased buffer and a private copy of its bytes. Releases its lease
/// exactly once, on [`BufferView::release`] or drop.
pub struct BufferView {
    pool: Arc<BufferPool>,
    slot: Arc<Slot>,
    data: Bytes,
    released: bool,
}

impl std::fmt::Debug for BufferView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("meta", &self.slot.meta)
            .field("released", &self.released)
            .finish()
    }
}

impl BufferView {
    fn new(pool: Arc<BufferPool>, slot: Arc<Slot>, data: Bytes) -> Self {
        Self {
            pool,
            slot,
            data,
            released: false,
        }
    }

    pub fn meta(&self) -> &BufferRef {
        &self.slot.meta
    }

    pub fn handle(&self) -> &BufferHandle {
        &self.slot.meta.handle
    }

    pub fn content_type(&self) -> &str {
        &self.slot.meta.content_type
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn state(&self) -> LeaseState {
        self.slot.book().state
    }

    /// Raw bytes. Fails once the buffer has been revoked.
    pub fn bytes(&self) -> Result<&[u8], IpcError> {
        if self.slot.book().state == LeaseState::Revoked {
            return Err(IpcError::protocol(format!(
                "buffer {} was revoked",
                self.slot.meta.handle
            )));
        }
        Ok(&self.data)
    }

    pub fn verify(&self) -> Result<(), IpcError> {
        self.read_verified().map(|_| ())
    }

    /// Bytes, after checking them against the checksum the owner recorded.
    pub fn read_verified(&self) -> Result<&[u8], IpcError> {
        let bytes = self.bytes()?;
        let actual = crc32fast::hash(bytes);
        if actual != self.slot.meta.checksum {
            tracing::warn!(
                target: "switchyard::protocol",
                handle = %self.slot.meta.handle,
                expected = self.slot.meta.checksum,
                actual,
                "Shared buffer checksum mismatch"
            );
            return Err(IpcError::protocol(format!(
                "checksum mismatch on buffer {}",
                self.slot.meta.handle
            )));
        }
        Ok(bytes)
    }

    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if !self.released {
            self.released = true;
            self.pool.release_view(&self.slot);
        }
    }
}

impl Drop for BufferView {
    fn drop(&mut self) {
        self.release_once();
    }
}
