//! Danmaku stream transport: binary framing, payload decoding and the
//! long-lived TCP connection driver.

pub mod codec;
pub mod stream;

use serde::{Deserialize, Serialize};

/// Payload framing type.
pub const TYPE_UNCOMPRESSED_NORMAL: u16 = 0;
pub const TYPE_UNCOMPRESSED_OPERATION: u16 = 1;
pub const TYPE_ZLIB_NORMAL: u16 = 2;
pub const TYPE_BROTLI_NORMAL: u16 = 3;

/// Operation codes.
pub const OP_HEARTBEAT: u32 = 2;
pub const OP_HEARTBEAT_REPLY: u32 = 3;
pub const OP_NORMAL: u32 = 5;
pub const OP_AUTH: u32 = 7;
pub const OP_AUTH_REPLY: u32 = 8;

pub const HEADER_LEN: u16 = 16;

/// Header of a danmaku frame:
///
/// ```text
/// +--------------------------------------------------------------------------+
/// | Total Length | Header Length | Type    | Op Code | Sequence ID | Message |
/// +--------------------------------------------------------------------------+
/// | 4 bytes      | 2 bytes       | 2 bytes | 4 bytes | 4 bytes     | N bytes |
/// +--------------------------------------------------------------------------+
/// ```
///
/// All fields big-endian. `total_length` covers the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub total_length: u32,
    pub header_length: u16,
    pub frame_type: u16,
    pub op: u32,
    pub sequence_id: u32,
}

impl FrameHeader {
    pub fn new(frame_type: u16, op: u32, sequence_id: u32, payload_len: usize) -> Self {
        Self {
            total_length: HEADER_LEN as u32 + payload_len as u32,
            header_length: HEADER_LEN,
            frame_type,
            op,
            sequence_id,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN as usize] {
        let mut buf = [0u8; HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&self.total_length.to_be_bytes());
        buf[4..6].copy_from_slice(&self.header_length.to_be_bytes());
        buf[6..8].copy_from_slice(&self.frame_type.to_be_bytes());
        buf[8..12].copy_from_slice(&self.op.to_be_bytes());
        buf[12..16].copy_from_slice(&self.sequence_id.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8; HEADER_LEN as usize]) -> Self {
        Self {
            total_length: u32::from_be_bytes(buf[0..4].try_into().unwrap()),
            header_length: u16::from_be_bytes(buf[4..6].try_into().unwrap()),
            frame_type: u16::from_be_bytes(buf[6..8].try_into().unwrap()),
            op: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            sequence_id: u32::from_be_bytes(buf[12..16].try_into().unwrap()),
        }
    }
}

/// A decoded semantic event. Only `SEND_GIFT` carries structure today; every
/// other command is forwarded as a raw placeholder and ignored downstream.
#[derive(Debug, Clone)]
pub enum Event {
    SendGift(SendGift),
    Raw {
        cmd: String,
        raw: serde_json::Value,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendGift {
    #[serde(rename = "giftId")]
    pub gift_id: i64,
    #[serde(rename = "giftName")]
    pub gift_name: String,
    pub num: i64,
    /// Unit price of the delivered gift. For a blind box this is the outcome
    /// price, not what the gifter paid.
    pub price: i64,
    pub uid: i64,
    pub uname: String,
    /// Present iff the gift is a blind box.
    #[serde(default)]
    pub blind_gift: Option<BlindGift>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlindGift {
    #[serde(default)]
    pub gift_tip_price: i64,
    pub original_gift_id: i64,
    pub original_gift_name: String,
    /// Unit face price the gifter actually paid.
    pub original_gift_price: i64,
}

/// Auth payload sent right after the TCP connect.
#[derive(Debug, Serialize)]
pub struct AuthPayload {
    pub uid: i64,
    pub roomid: i64,
    /// Always 3.
    pub protover: i64,
    /// Always "web".
    pub platform: &'static str,
    /// Always 2.
    #[serde(rename = "type")]
    pub conn_type: i64,
    /// Stream token from the getDanmuInfo endpoint.
    pub key: String,
}

impl AuthPayload {
    pub fn new(uid: i64, room_id: i64, token: String) -> Self {
        Self {
            uid,
            roomid: room_id,
            protover: 3,
            platform: "web",
            conn_type: 2,
            key: token,
        }
    }
}
