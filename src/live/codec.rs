//! Frame codec for the danmaku stream.
//!
//! One socket read yields one frame; compressed frames contain a
//! concatenation of inner frames which are decoded recursively. Anything
//! malformed inside a payload is logged and skipped so a single bad message
//! cannot take the connection down; only a stream error or a short read
//! aborts the read.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::io::Read;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

use super::{
    Event, FrameHeader, SendGift, HEADER_LEN, OP_AUTH_REPLY, OP_HEARTBEAT_REPLY,
    TYPE_BROTLI_NORMAL, TYPE_UNCOMPRESSED_NORMAL, TYPE_UNCOMPRESSED_OPERATION, TYPE_ZLIB_NORMAL,
};

/// Read one frame off the stream and decode it into zero or more events.
pub async fn read_messages<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<Event>> {
    let mut header_buf = [0u8; HEADER_LEN as usize];
    reader
        .read_exact(&mut header_buf)
        .await
        .context("failed to read frame header")?;
    let header = FrameHeader::decode(&header_buf);

    if header.total_length < header.header_length as u32 {
        return Err(anyhow!(
            "malformed frame header: total length {} < header length {}",
            header.total_length,
            header.header_length
        ));
    }

    let payload_len = (header.total_length - header.header_length as u32) as usize;
    let mut payload = vec![0u8; payload_len];
    reader
        .read_exact(&mut payload)
        .await
        .context("failed to read frame payload")?;

    decode_frame(&header, &payload)
}

/// Serialize a frame: header followed by the payload.
pub fn encode_frame(frame_type: u16, op: u32, sequence_id: u32, payload: &[u8]) -> Vec<u8> {
    let header = FrameHeader::new(frame_type, op, sequence_id, payload.len());
    let mut buf = Vec::with_capacity(HEADER_LEN as usize + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(header: &FrameHeader, payload: &[u8]) -> Result<Vec<Event>> {
    // Heartbeat and auth replies carry nothing we act on.
    if header.op == OP_HEARTBEAT_REPLY {
        debug!("received heartbeat reply");
        return Ok(Vec::new());
    }
    if header.op == OP_AUTH_REPLY {
        debug!("received auth reply");
        return Ok(Vec::new());
    }

    match header.frame_type {
        TYPE_UNCOMPRESSED_NORMAL => Ok(parse_event(payload).into_iter().collect()),
        TYPE_UNCOMPRESSED_OPERATION => {
            debug!("skipping operation frame");
            Ok(Vec::new())
        }
        TYPE_ZLIB_NORMAL => {
            let mut decompressed = Vec::new();
            let mut decoder = flate2::read::ZlibDecoder::new(payload);
            if let Err(e) = decoder.read_to_end(&mut decompressed) {
                // A single bad compressed frame does not kill the stream.
                warn!(error = %e, "discarding invalid zlib frame");
                return Ok(Vec::new());
            }
            decode_buffer(&decompressed)
        }
        TYPE_BROTLI_NORMAL => {
            let mut decompressed = Vec::new();
            let mut decoder = brotli::Decompressor::new(payload, 4096);
            if let Err(e) = decoder.read_to_end(&mut decompressed) {
                warn!(error = %e, "discarding invalid brotli frame");
                return Ok(Vec::new());
            }
            decode_buffer(&decompressed)
        }
        other => {
            warn!(frame_type = other, "unknown frame type");
            Ok(Vec::new())
        }
    }
}

/// Decode the concatenated frames inside a decompressed buffer. A truncated
/// inner frame is a short read and fails the whole decode.
fn decode_buffer(buf: &[u8]) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    let mut offset = 0;

    while offset < buf.len() {
        let remaining = &buf[offset..];
        if remaining.len() < HEADER_LEN as usize {
            return Err(anyhow!("short read: truncated inner frame header"));
        }

        let header = FrameHeader::decode(remaining[..HEADER_LEN as usize].try_into().unwrap());
        let total = header.total_length as usize;
        if total < header.header_length as usize || total > remaining.len() {
            return Err(anyhow!("short read: truncated inner frame payload"));
        }

        let payload = &remaining[header.header_length as usize..total];
        events.extend(decode_frame(&header, payload)?);
        offset += total;
    }

    Ok(events)
}

fn parse_event(bytes: &[u8]) -> Option<Event> {
    #[derive(Deserialize)]
    struct DummyMessage {
        cmd: String,
    }
    #[derive(Deserialize)]
    struct GiftMessage {
        data: SendGift,
    }

    // Extract the cmd first, then re-parse into the concrete shape.
    let raw: serde_json::Value = match serde_json::from_slice(bytes) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, msg = %String::from_utf8_lossy(bytes), "failed to parse event");
            return None;
        }
    };
    let dummy: DummyMessage = match serde_json::from_value(raw.clone()) {
        Ok(d) => d,
        Err(e) => {
            warn!(error = %e, msg = %String::from_utf8_lossy(bytes), "event has no cmd field");
            return None;
        }
    };

    match dummy.cmd.as_str() {
        "SEND_GIFT" => match serde_json::from_value::<GiftMessage>(raw) {
            Ok(gift) => Some(Event::SendGift(gift.data)),
            Err(e) => {
                warn!(error = %e, msg = %String::from_utf8_lossy(bytes), "failed to parse SEND_GIFT");
                None
            }
        },
        _ => {
            debug!(cmd = %dummy.cmd, "event command not implemented");
            Some(Event::Raw {
                cmd: dummy.cmd,
                raw,
            })
        }
    }
}
