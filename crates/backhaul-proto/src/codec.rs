//! Codec for encoding/decoding protocol frames
//!
//! Frame layout (big-endian):
//!
//! ```text
//! totalLength:u32 | command:u8 | tunnelId:i64 | sessionId:i64 | headerLength:u32 | header | body
//! ```
//!
//! `totalLength` counts every byte after itself; the body is whatever remains
//! after the header block.

use crate::messages::{Command, ProtoMessage};
use crate::{FRAME_FIXED_SIZE, MAX_FRAME_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Codec errors
///
/// Every variant except `Io` means the peer sent a malformed frame; the
/// connection must be closed.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Unknown command: {0}")]
    UnknownCommand(u8),

    #[error("Truncated frame: {0}")]
    Truncated(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Length-prefixed frame codec
///
/// Decoding is resumable: [`FrameCodec::decode_frame`] returns `Ok(None)` until
/// a whole frame is buffered.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_SIZE as usize)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a message to bytes
    pub fn encode_frame(&self, msg: &ProtoMessage) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode_into(msg, &mut buf)?;
        Ok(buf.freeze())
    }

    fn encode_into(&self, msg: &ProtoMessage, buf: &mut BytesMut) -> Result<(), CodecError> {
        let total = FRAME_FIXED_SIZE + msg.header.len() + msg.body.len();
        if total > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }

        buf.reserve(4 + total);
        buf.put_u32(total as u32);
        buf.put_u8(msg.command as u8);
        buf.put_i64(msg.tunnel_id);
        buf.put_i64(msg.session_id);
        buf.put_u32(msg.header.len() as u32);
        buf.put_slice(&msg.header);
        buf.put_slice(&msg.body);
        Ok(())
    }

    /// Decode one message from the front of `buf`
    ///
    /// Returns Ok(Some(message)) if a complete frame was decoded,
    /// Ok(None) if more data is needed,
    /// Err if the frame is malformed
    pub fn decode_frame(&self, buf: &mut BytesMut) -> Result<Option<ProtoMessage>, CodecError> {
        if buf.len() < 4 {
            return Ok(None);
        }

        let total = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        // Reject before buffering the payload so a hostile length cannot grow memory
        if total > self.max_frame_size {
            return Err(CodecError::FrameTooLarge {
                size: total,
                max: self.max_frame_size,
            });
        }
        if total < FRAME_FIXED_SIZE {
            return Err(CodecError::Truncated("length shorter than fixed header"));
        }

        if buf.len() < 4 + total {
            buf.reserve(4 + total - buf.len());
            return Ok(None);
        }

        buf.advance(4);
        let mut frame = buf.split_to(total);

        let command_byte = frame.get_u8();
        let command = Command::try_from(command_byte).map_err(CodecError::UnknownCommand)?;
        let tunnel_id = frame.get_i64();
        let session_id = frame.get_i64();
        let header_len = frame.get_u32() as usize;

        if header_len > frame.len() {
            return Err(CodecError::Truncated("header longer than frame"));
        }

        let header = frame.split_to(header_len).freeze();
        let body = frame.freeze();

        Ok(Some(ProtoMessage {
            command,
            tunnel_id,
            session_id,
            header,
            body,
        }))
    }

    /// Try to decode multiple messages from buffer
    pub fn decode_all(&self, buf: &mut BytesMut) -> Result<Vec<ProtoMessage>, CodecError> {
        let mut messages = Vec::new();

        while let Some(msg) = self.decode_frame(buf)? {
            messages.push(msg);
        }

        Ok(messages)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = ProtoMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_frame(src)
    }
}

impl Encoder<ProtoMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: ProtoMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encode_into(&item, dst)
    }
}
