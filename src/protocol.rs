// Copyright 2020 Joyent, Inc.

//! Fast message types and the `FastRpc` codec.
//!
//! The codec is stateless apart from the partial-frame bytes buffered by
//! `tokio_util`'s framed reader, so one instance can be used per direction
//! of a connection.

use std::str;

use byteorder::{BigEndian, ByteOrder};
use bytes::{BufMut, BytesMut};
use chrono::Utc;
use crc16::{State, ARC};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::{FromPrimitive, ToPrimitive};
use serde_derive::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FastError;

/*
 * Message IDs: each Fast message has a message id, which is scoped to the Fast
 * connection.  We allocate these sequentially from a circular 31-bit space.
 */
pub const FP_MSGID_MAX: u32 = i32::max_value() as u32;

const FP_OFF_TYPE: usize = 0x1;
const FP_OFF_STATUS: usize = 0x2;
const FP_OFF_MSGID: usize = 0x3;
const FP_OFF_DATALEN: usize = 0xb;
const FP_OFF_DATA: usize = 0xf;

pub const FP_HEADER_SZ: usize = FP_OFF_DATA;

const FP_VERSION_1: u8 = 0x1;
const FP_VERSION_CURRENT: u8 = FP_VERSION_1;

/// Largest payload accepted by a default `FastRpc` codec: 16 MiB.
pub const FP_DEFAULT_MAX_DATA_LEN: usize = 16 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FastMessageType {
    Json = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive, ToPrimitive)]
pub enum FastMessageStatus {
    Data = 1,
    End = 2,
    Error = 3,
}

impl FastMessageStatus {
    pub fn name(self) -> &'static str {
        match self {
            FastMessageStatus::Data => "data",
            FastMessageStatus::End => "end",
            FastMessageStatus::Error => "error",
        }
    }
}

struct FastMessageHeader {
    msg_type: FastMessageType,
    status: FastMessageStatus,
    id: u32,
    data_len: usize,
}

/// Generator for the circular 31-bit message id space. The first id handed
/// out is 1, and the sequence wraps from `FP_MSGID_MAX` back to 1.
#[derive(Clone, Debug, Default)]
pub struct FastMessageId(u32);

impl FastMessageId {
    pub fn new() -> FastMessageId {
        FastMessageId(0)
    }
}

impl Iterator for FastMessageId {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        self.0 = if self.0 >= FP_MSGID_MAX { 1 } else { self.0 + 1 };
        Some(self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FastMessageMetaData {
    pub uts: u64,
    pub name: String,
}

impl FastMessageMetaData {
    pub fn new(n: String) -> FastMessageMetaData {
        let now = Utc::now();
        let now_micros = now.timestamp() as u64 * 1_000_000
            + u64::from(now.timestamp_subsec_micros());

        FastMessageMetaData {
            uts: now_micros,
            name: n,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FastMessageData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub m: Option<FastMessageMetaData>,
    pub d: Value,
}

impl FastMessageData {
    /// Payload for a request: carries the method name and a timestamp.
    pub fn new(n: String, d: Value) -> FastMessageData {
        FastMessageData {
            m: Some(FastMessageMetaData::new(n)),
            d,
        }
    }

    /// Payload without metadata, as servers commonly send for responses.
    pub fn response(d: Value) -> FastMessageData {
        FastMessageData { m: None, d }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct FastMessage {
    pub msg_type: FastMessageType,
    pub status: FastMessageStatus,
    pub id: u32,
    pub data: FastMessageData,
}

impl FastMessage {
    /// Parse one complete frame. `buf` must hold at least the whole frame;
    /// trailing bytes are ignored.
    pub fn parse(buf: &[u8]) -> Result<FastMessage, FastError> {
        FastMessage::check_buffer_size(buf)?;
        let header = FastMessage::parse_header(buf)?;

        FastMessage::validate_data_length(buf, header.data_len)?;
        let raw_data = &buf[FP_OFF_DATA..FP_OFF_DATA + header.data_len];
        let data = FastMessage::parse_data(raw_data)?;

        let msg = FastMessage {
            msg_type: header.msg_type,
            status: header.status,
            id: header.id,
            data,
        };
        msg.validate()?;
        Ok(msg)
    }

    fn check_buffer_size(buf: &[u8]) -> Result<(), FastError> {
        if buf.len() < FP_HEADER_SZ {
            let msg = "unable to parse message: not enough bytes";
            Err(FastError::bad_frame(String::from(msg)))
        } else {
            Ok(())
        }
    }

    fn parse_header(buf: &[u8]) -> Result<FastMessageHeader, FastError> {
        if buf[0] != FP_VERSION_CURRENT {
            let msg = format!("unsupported version {}", buf[0]);
            return Err(FastError::bad_frame(msg));
        }
        let msg_type = FromPrimitive::from_u8(buf[FP_OFF_TYPE])
            .ok_or_else(|| {
                let msg = format!("unsupported type {}", buf[FP_OFF_TYPE]);
                FastError::bad_frame(msg)
            })?;
        let status = FromPrimitive::from_u8(buf[FP_OFF_STATUS])
            .ok_or_else(|| {
                let msg = format!("unsupported status {}", buf[FP_OFF_STATUS]);
                FastError::bad_frame(msg)
            })?;
        let msg_id = BigEndian::read_u32(&buf[FP_OFF_MSGID..FP_OFF_MSGID + 4]);
        // The CRC that follows the msgid is not verified: node-fast computes
        // it with an old crc library that has a bug, so mismatches are
        // expected from those peers.
        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;

        Ok(FastMessageHeader {
            msg_type,
            status,
            id: msg_id,
            data_len,
        })
    }

    fn validate_data_length(buf: &[u8], data_length: usize) -> Result<(), FastError> {
        if buf.len() < (FP_HEADER_SZ + data_length) {
            let msg = "data payload size does not match indicated data length";
            Err(FastError::bad_frame(String::from(msg)))
        } else {
            Ok(())
        }
    }

    fn parse_data(data_buf: &[u8]) -> Result<FastMessageData, FastError> {
        match str::from_utf8(data_buf) {
            Ok(data_str) => serde_json::from_str(data_str).map_err(|e| {
                let msg = format!("failed to parse data payload as JSON: {}", e);
                FastError::bad_frame(msg)
            }),
            Err(_) => {
                let msg = "failed to parse data payload as UTF-8";
                Err(FastError::bad_frame(String::from(msg)))
            }
        }
    }

    /// Check the rules a message must satisfy, on either side of the wire:
    /// the id fits in 31 bits, DATA and END carry an array in `d`, and ERROR
    /// carries an object with string `name` and `message` fields.
    pub fn validate(&self) -> Result<(), FastError> {
        if self.id > FP_MSGID_MAX {
            let msg = format!("msgid {} exceeds the 31-bit id space", self.id);
            return Err(FastError::bad_frame(msg));
        }

        match self.status {
            FastMessageStatus::Data | FastMessageStatus::End => {
                if !self.data.d.is_array() {
                    let msg = format!(
                        "data.d for {} message {} must be an array",
                        self.status.name(),
                        self.id
                    );
                    return Err(FastError::bad_data(self.id, msg));
                }
            }
            FastMessageStatus::Error => {
                let d = &self.data.d;
                let has_field = |key: &str| d.get(key).map_or(false, Value::is_string);
                if !d.is_object() || !has_field("name") || !has_field("message") {
                    let msg = format!(
                        "data.d for error message {} must be an object \
                         with \"name\" and \"message\"",
                        self.id
                    );
                    return Err(FastError::bad_data(self.id, msg));
                }
            }
        }

        Ok(())
    }

    pub fn data(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Data,
            id: msg_id,
            data,
        }
    }

    pub fn end(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::End,
            id: msg_id,
            data,
        }
    }

    pub fn error(msg_id: u32, data: FastMessageData) -> FastMessage {
        FastMessage {
            msg_type: FastMessageType::Json,
            status: FastMessageStatus::Error,
            id: msg_id,
            data,
        }
    }
}

/// Codec for Fast messages, used with `tokio_util::codec::{FramedRead,
/// FramedWrite}`.
#[derive(Clone, Debug)]
pub struct FastRpc {
    max_data_len: usize,
}

impl FastRpc {
    pub fn new() -> FastRpc {
        FastRpc::with_max_data_len(FP_DEFAULT_MAX_DATA_LEN)
    }

    pub fn with_max_data_len(max_data_len: usize) -> FastRpc {
        FastRpc { max_data_len }
    }
}

impl Default for FastRpc {
    fn default() -> FastRpc {
        FastRpc::new()
    }
}

impl Decoder for FastRpc {
    type Item = FastMessage;
    type Error = FastError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, FastError> {
        if buf.len() < FP_HEADER_SZ {
            return Ok(None);
        }

        let data_len =
            BigEndian::read_u32(&buf[FP_OFF_DATALEN..FP_OFF_DATALEN + 4]) as usize;
        if data_len > self.max_data_len {
            let msg = format!(
                "data length {} exceeds maximum of {} bytes",
                data_len, self.max_data_len
            );
            return Err(FastError::bad_frame(msg));
        }

        let frame_len = FP_HEADER_SZ + data_len;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let frame = buf.split_to(frame_len);
        FastMessage::parse(&frame).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, FastError> {
        match self.decode(buf)? {
            Some(msg) => Ok(Some(msg)),
            None if buf.is_empty() => Ok(None),
            None => Err(FastError::unexpected_end()),
        }
    }
}

impl Encoder<FastMessage> for FastRpc {
    type Error = FastError;

    fn encode(&mut self, item: FastMessage, buf: &mut BytesMut) -> Result<(), FastError> {
        item.validate()?;
        encode_msg(&item, self.max_data_len, buf)
    }
}

/// Write `msg` to `buf`. Nothing is written if the message cannot be
/// encoded.
pub fn encode_msg(
    msg: &FastMessage,
    max_data_len: usize,
    buf: &mut BytesMut,
) -> Result<(), FastError> {
    let msg_type_u8 = ToPrimitive::to_u8(&msg.msg_type)
        .ok_or_else(|| FastError::bad_frame(String::from("invalid message type")))?;
    let status_u8 = ToPrimitive::to_u8(&msg.status)
        .ok_or_else(|| FastError::bad_frame(String::from("invalid status")))?;
    let data_str = serde_json::to_string(&msg.data).map_err(|e| {
        FastError::bad_frame(format!("failed to encode data payload: {}", e))
    })?;
    let data_len = data_str.len();
    if data_len > max_data_len {
        let msg = format!(
            "data length {} exceeds maximum of {} bytes",
            data_len, max_data_len
        );
        return Err(FastError::bad_frame(msg));
    }

    buf.reserve(FP_HEADER_SZ + data_len);
    buf.put_u8(FP_VERSION_CURRENT);
    buf.put_u8(msg_type_u8);
    buf.put_u8(status_u8);
    buf.put_u32(msg.id);
    buf.put_u32(State::<ARC>::calculate(data_str.as_bytes()) as u32);
    buf.put_u32(data_len as u32);
    buf.put_slice(data_str.as_bytes());
    Ok(())
}
