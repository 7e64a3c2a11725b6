//! Wire framing and pluggable body serialization
//!
//! Every frame starts with a fixed 16-byte header:
//!
//! | offset | size | field                                                  |
//! |--------|------|--------------------------------------------------------|
//! | 0      | 2    | magic `0xDABB`                                         |
//! | 2      | 1    | flags: bit7 req/resp, bit6 two-way, bit5 event, bits 4-0 serialization id |
//! | 3      | 1    | status (responses only)                                |
//! | 4      | 8    | request/response id, big-endian                        |
//! | 12     | 4    | body length                                            |
//!
//! A body longer than the payload limit is skipped on the wire and decoded
//! as a frame with `truncated` set, so the connection survives oversized
//! messages.

use bytes::Bytes;
use mizzen_core::{ChannelBuffer, Error, Result};
use serde::{de::DeserializeOwned, Serialize};

pub const MAGIC: u16 = 0xDABB;
pub const HEADER_LENGTH: usize = 16;

const FLAG_REQUEST: u8 = 0x80;
const FLAG_TWO_WAY: u8 = 0x40;
const FLAG_EVENT: u8 = 0x20;
const SERIALIZATION_MASK: u8 = 0x1F;

/// Response status codes
pub mod status {
    pub const OK: u8 = 20;
    pub const CLIENT_TIMEOUT: u8 = 30;
    pub const SERVER_TIMEOUT: u8 = 31;
    pub const BAD_REQUEST: u8 = 40;
    pub const BAD_RESPONSE: u8 = 50;
    pub const SERVICE_NOT_FOUND: u8 = 60;
    pub const SERVICE_ERROR: u8 = 70;
    pub const SERVER_ERROR: u8 = 80;
    pub const CLIENT_ERROR: u8 = 90;
    pub const SERVER_THREADPOOL_EXHAUSTED: u8 = 100;
}

/// Body serialization formats, identified on the wire by the low flag bits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerializationFormat {
    /// Binary, compact, the default
    Bincode,
    /// Human-readable
    Json,
    /// Binary, cross-language
    MessagePack,
}

impl Default for SerializationFormat {
    fn default() -> Self {
        SerializationFormat::Bincode
    }
}

impl SerializationFormat {
    pub fn id(&self) -> u8 {
        match self {
            SerializationFormat::Bincode => 2,
            SerializationFormat::Json => 6,
            SerializationFormat::MessagePack => 8,
        }
    }

    pub fn from_id(id: u8) -> Result<Self> {
        match id {
            2 => Ok(SerializationFormat::Bincode),
            6 => Ok(SerializationFormat::Json),
            8 => Ok(SerializationFormat::MessagePack),
            other => Err(Error::Serialization(format!("unknown serialization id {}", other))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SerializationFormat::Bincode => "bincode",
            SerializationFormat::Json => "json",
            SerializationFormat::MessagePack => "messagepack",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "bincode" => Ok(SerializationFormat::Bincode),
            "json" => Ok(SerializationFormat::Json),
            "messagepack" => Ok(SerializationFormat::MessagePack),
            other => Err(Error::Serialization(format!("unknown serialization '{}'", other))),
        }
    }

    pub fn serialize<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            SerializationFormat::Bincode => bincode::serialize(value)
                .map_err(|e| Error::Serialization(format!("bincode encode failed: {}", e))),
            SerializationFormat::Json => serde_json::to_vec(value)
                .map_err(|e| Error::Serialization(format!("json encode failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::to_vec(value)
                .map_err(|e| Error::Serialization(format!("messagepack encode failed: {}", e))),
        }
    }

    pub fn deserialize<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        match self {
            SerializationFormat::Bincode => bincode::deserialize(data)
                .map_err(|e| Error::Serialization(format!("bincode decode failed: {}", e))),
            SerializationFormat::Json => serde_json::from_slice(data)
                .map_err(|e| Error::Serialization(format!("json decode failed: {}", e))),
            SerializationFormat::MessagePack => rmp_serde::from_slice(data)
                .map_err(|e| Error::Serialization(format!("messagepack decode failed: {}", e))),
        }
    }
}

/// One decoded wire frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub request: bool,
    pub two_way: bool,
    pub event: bool,
    pub format: SerializationFormat,
    /// Meaningful on responses only
    pub status: u8,
    pub id: u64,
    pub body: Bytes,
    /// Body exceeded the payload limit and was dropped on the floor
    pub truncated: bool,
}

impl Frame {
    pub fn request(id: u64, format: SerializationFormat, two_way: bool, body: Bytes) -> Self {
        Self {
            request: true,
            two_way,
            event: false,
            format,
            status: 0,
            id,
            body,
            truncated: false,
        }
    }

    pub fn response(id: u64, format: SerializationFormat, status: u8, body: Bytes) -> Self {
        Self {
            request: false,
            two_way: false,
            event: false,
            format,
            status,
            id,
            body,
            truncated: false,
        }
    }

    /// Heartbeat probe: an event-flagged two-way request with a null body
    pub fn heartbeat(id: u64, format: SerializationFormat) -> Self {
        Self {
            request: true,
            two_way: true,
            event: true,
            format,
            status: 0,
            id,
            body: Bytes::new(),
            truncated: false,
        }
    }

    /// Heartbeat reply mirroring the probe's id
    pub fn heartbeat_reply(id: u64, format: SerializationFormat) -> Self {
        Self {
            request: false,
            two_way: false,
            event: true,
            format,
            status: status::OK,
            id,
            body: Bytes::new(),
            truncated: false,
        }
    }
}

/// Stateful frame codec over a [`ChannelBuffer`]
pub struct ExchangeCodec {
    payload_limit: usize,
    skipping: Option<(Frame, usize)>,
}

impl ExchangeCodec {
    pub fn new(payload_limit: usize) -> Self {
        Self { payload_limit, skipping: None }
    }

    pub fn encode(&self, frame: &Frame, buf: &mut ChannelBuffer) -> Result<()> {
        let mut flags = frame.format.id() & SERIALIZATION_MASK;
        if frame.request {
            flags |= FLAG_REQUEST;
        }
        if frame.two_way {
            flags |= FLAG_TWO_WAY;
        }
        if frame.event {
            flags |= FLAG_EVENT;
        }
        buf.write_u16(MAGIC).map_err(codec_error)?;
        buf.write_u8(flags).map_err(codec_error)?;
        buf.write_u8(frame.status).map_err(codec_error)?;
        buf.write_u64(frame.id).map_err(codec_error)?;
        buf.write_u32(frame.body.len() as u32).map_err(codec_error)?;
        buf.write_slice(&frame.body).map_err(codec_error)?;
        Ok(())
    }

    /// Decode the next frame, or `None` when more bytes are needed
    pub fn decode(&mut self, buf: &mut ChannelBuffer) -> Result<Option<Frame>> {
        // finish skipping an oversized body before looking at new headers
        if let Some((frame, remaining)) = self.skipping.take() {
            let available = buf.readable_bytes().min(remaining);
            buf.skip(available).map_err(codec_error)?;
            let remaining = remaining - available;
            if remaining > 0 {
                self.skipping = Some((frame, remaining));
                return Ok(None);
            }
            return Ok(Some(frame));
        }

        if buf.readable_bytes() < HEADER_LENGTH {
            return Ok(None);
        }
        buf.mark_reader_index();

        let magic = buf.read_u16().map_err(codec_error)?;
        if magic != MAGIC {
            return Err(Error::Network(format!(
                "codec mismatch: bad magic 0x{:04X}",
                magic
            )));
        }
        let flags = buf.read_u8().map_err(codec_error)?;
        let status = buf.read_u8().map_err(codec_error)?;
        let id = buf.read_u64().map_err(codec_error)?;
        let body_len = buf.read_u32().map_err(codec_error)? as usize;

        let format = SerializationFormat::from_id(flags & SERIALIZATION_MASK)?;
        let mut frame = Frame {
            request: flags & FLAG_REQUEST != 0,
            two_way: flags & FLAG_TWO_WAY != 0,
            event: flags & FLAG_EVENT != 0,
            format,
            status,
            id,
            body: Bytes::new(),
            truncated: false,
        };

        if body_len > self.payload_limit {
            frame.truncated = true;
            self.skipping = Some((frame, body_len));
            // re-enter the skip branch with whatever is already buffered
            return self.decode(buf);
        }

        if buf.readable_bytes() < body_len {
            buf.reset_reader_index();
            return Ok(None);
        }
        frame.body = buf.read_bytes(body_len).map_err(codec_error)?;
        Ok(Some(frame))
    }
}

fn codec_error(e: mizzen_core::BufferError) -> Error {
    Error::Network(format!("codec buffer failure: {}", e))
}
