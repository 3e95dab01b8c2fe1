//! Length-prefixed CBOR framing for the relay link.
//!
//! Wire format: `[4-byte big-endian length][CBOR payload]`. Frames larger
//! than [`MAX_FRAME_LEN`] are rejected before any allocation happens.

use crate::error::{UplinkError, UplinkResult};
use std::io::Cursor;

/// Upper bound for a single frame (16 MiB). File transfers are chunked by
/// the command layer, so anything above this is a corrupt length prefix.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Encode a serializable value into a length-prefixed CBOR frame.
pub fn encode_frame<T: serde::Serialize>(value: &T) -> UplinkResult<Vec<u8>> {
    let mut payload = Vec::new();
    ciborium::into_writer(value, &mut payload)?;

    if payload.len() > MAX_FRAME_LEN {
        return Err(UplinkError::Codec(format!(
            "frame too large: {} bytes",
            payload.len()
        )));
    }

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend(payload);
    Ok(frame)
}

/// Decode a CBOR payload (without length prefix) into a typed value.
pub fn decode_payload<T: serde::de::DeserializeOwned>(data: &[u8]) -> UplinkResult<T> {
    let value: T = ciborium::from_reader(Cursor::new(data))?;
    Ok(value)
}

/// Streaming frame decoder: accumulates bytes and yields complete messages.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes into the decoder and return all complete decoded messages.
    pub fn feed<T: serde::de::DeserializeOwned>(&mut self, data: &[u8]) -> UplinkResult<Vec<T>> {
        self.buffer.extend_from_slice(data);
        let mut messages = Vec::new();

        while let Some(len) = self.pending_len()? {
            if self.buffer.len() < 4 + len {
                break;
            }
            let msg: T = decode_payload(&self.buffer[4..4 + len])?;
            messages.push(msg);
            self.buffer.drain(..4 + len);
        }

        Ok(messages)
    }

    /// Length of the next frame, if the prefix has fully arrived.
    fn pending_len(&self) -> UplinkResult<Option<usize>> {
        if self.buffer.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > MAX_FRAME_LEN {
            return Err(UplinkError::Codec(format!("frame too large: {len} bytes")));
        }
        Ok(Some(len))
    }
}
