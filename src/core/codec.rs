//! Frame codec for byte streams.
//!
//! [`FrameCodec`] implements the tokio codec traits so a connection can run
//! as `Framed<TcpStream, FrameCodec>`. Partial input yields `Ok(None)` until
//! a whole frame is buffered; declared lengths are validated before any
//! allocation.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::{FRAME_HEADER_LEN, MAX_PAYLOAD_SIZE};
use crate::error::WireError;

/// One complete `[id][length][payload]` unit on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Registered packet id.
    pub id: i32,
    /// Serialized packet fields.
    pub payload: Bytes,
}

/// Encoder/decoder for [`Frame`]s with a configurable payload size limit.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl FrameCodec {
    /// Codec with a custom payload size limit.
    pub fn with_limit(max_payload_size: usize) -> Self {
        FrameCodec { max_payload_size }
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, WireError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let id = i32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        let declared = i32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        if declared < 0 {
            return Err(WireError::Framing(format!(
                "negative payload length {declared} for packet id {id}"
            )));
        }
        let len = declared as usize;
        if len > self.max_payload_size {
            return Err(WireError::Framing(format!(
                "payload of {len} bytes for packet id {id} exceeds limit of {}",
                self.max_payload_size
            )));
        }

        if src.len() < FRAME_HEADER_LEN + len {
            // Reserve so the next read can complete the frame in one pass.
            src.reserve(FRAME_HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame { id, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = WireError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), WireError> {
        let len = frame.payload.len();
        if len > self.max_payload_size {
            return Err(WireError::Framing(format!(
                "payload of {len} bytes for packet id {} exceeds limit of {}",
                frame.id, self.max_payload_size
            )));
        }
        dst.reserve(FRAME_HEADER_LEN + len);
        dst.put_i32(frame.id);
        dst.put_i32(len as i32);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}
