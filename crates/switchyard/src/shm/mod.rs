//! Shared-memory transport for payloads too large to inline.

mod pool;
mod region;

pub use pool::{
    BufferPool, BufferView, BufferWriter, LeaseState, Payload, ReleaseNotice, RevokeSummary,
};
