//! Framing, addressing and connections between processes.

pub mod channel;
pub mod codec;
pub mod protocol;
pub mod transport;

pub use channel::{Channel, ChannelState};
pub use codec::JsonCodec;
pub use protocol::{
    BufferHandle, BufferRef, CorrelationId, InlinePayload, Message, MessageKind, Params,
};
pub use transport::{ChildTransportInfo, Endpoint};
