//! Framed codec for channel traffic.
//!
//! 4-byte big-endian length prefix (LengthDelimitedCodec) + serde_json body.
//! Works over any AsyncRead/AsyncWrite.
//!
//! Decoding yields `Result<T, serde_json::Error>` items: a frame with a valid
//! length but an unparseable body is surfaced to the reader as an item so it
//! can be logged and skipped, instead of terminating the stream the way a
//! decoder error would. Oversized frames are still hard errors.
//!
//! On the way out [`encode_body`] serializes and size-checks a message before
//! it is queued, so a body that could never be framed is refused to its sender
//! instead of failing inside the writer.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

/// The length-prefix layer shared by both directions.
pub fn frame_codec(max: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max)
        .new_codec()
}

/// Serialize `item` into a frame body no longer than `max`.
pub fn encode_body<T: Serialize>(item: &T, max: usize) -> Result<Bytes, FrameError> {
    let json = serde_json::to_vec(item)?;
    let len = json.len();
    tracing::trace!(json_size_bytes = len, "Encoding frame");
    if len > max {
        return Err(FrameError::TooLarge { len, max });
    }
    if len > 1024 * 1024 {
        tracing::debug!(
            json_size_kb = len / 1024,
            "Large frame being encoded; consider lowering the inline threshold"
        );
    }
    Ok(Bytes::from(json))
}

pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max: usize) -> Self {
        Self {
            inner: frame_codec(max),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = Result<T, serde_json::Error>;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self
            .inner
            .decode(src)?
            .map(|bytes| serde_json::from_slice(&bytes)))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let body = encode_body(&item, self.inner.max_frame_length())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(body, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::{CorrelationId, Message, Params};

    #[test]
    fn frame_is_big_endian_length_prefixed() {
        let mut codec = JsonCodec::<serde_json::Value>::new();
        let mut buf = BytesMut::new();
        codec.encode(serde_json::json!({"a": 1}), &mut buf).unwrap();

        let body = br#"{"a":1}"#;
        assert_eq!(&buf[..4], &(body.len() as u32).to_be_bytes());
        assert_eq!(&buf[4..], body);
    }

    #[test]
    fn decodes_message_after_partial_reads() {
        let mut codec = JsonCodec::<Message>::new();
        let mut full = BytesMut::new();
        let msg = Message::request(CorrelationId::new(), "worker.echo", Params::new());
        codec.encode(msg.clone(), &mut full).unwrap();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&full[..6]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[6..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn malformed_body_is_an_item_not_an_error() {
        let mut codec = JsonCodec::<Message>::new();
        let mut buf = BytesMut::new();
        let body = b"{not json";
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);

        let item = codec.decode(&mut buf).unwrap().unwrap();
        assert!(item.is_err());
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = JsonCodec::<Message>::with_max_frame_length(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1024u32.to_be_bytes());
        buf.extend_from_slice(&[b' '; 32]);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn encode_body_refuses_oversized_messages() {
        let mut params = Params::new();
        params.insert("blob".into(), "x".repeat(4096).into());
        let msg = Message::event("ui.upload", params);

        let err = encode_body(&msg, 1024).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max: 1024, len } if len > 4096));

        let body = encode_body(&msg, DEFAULT_MAX_FRAME_LENGTH).unwrap();
        assert_eq!(serde_json::from_slice::<Message>(&body).unwrap(), msg);
    }
}
