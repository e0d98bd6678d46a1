// =============================================================================
// Binary wire format — compact self-describing frames
// =============================================================================
//
// Frame layout (all integers little-endian):
//
//   Offset  Size  Field
//   0       2     magic (0x4D52)
//   2       1     version
//   3       1     frame type (1 snapshot, 2 update, 3 pong, 4 error)
//   4       8     seq
//   12      8     timestamp_ms (unix millis)
//   20      n     body (value encoding below)
//   20+n    4     checksum (CRC32/IEEE over bytes [0, 20+n))
//
// Body value encoding, one tag byte per value:
//   0 null · 1 false · 2 true · 3 i64 · 4 u64 · 5 f64
//   6 string (u32 len + utf8) · 7 array (u32 count + values)
//   8 object (u32 count + (string key, value) pairs)
//
// The body carries the frame's `data`/`changes` object (snapshot/update),
// the error string (error), or null (pong). The schema is identical to the
// JSON encoding; JSON remains the canonical reference.
// =============================================================================

use bytes::{Buf, BufMut, BytesMut};
use chrono::TimeZone;
use thiserror::Error;

use super::{FrameType, JsonMap, ServerFrame};
use crate::error::{Error as ServiceError, Result};

pub const WIRE_MAGIC: u16 = 0x4D52;
pub const WIRE_VERSION: u8 = 1;

/// Header bytes before the body.
const HEADER_LEN: usize = 20;
/// Trailing checksum bytes.
const CHECKSUM_LEN: usize = 4;

/// Nesting limit for decoded values.
const MAX_DEPTH: usize = 32;

const TAG_NULL: u8 = 0;
const TAG_FALSE: u8 = 1;
const TAG_TRUE: u8 = 2;
const TAG_I64: u8 = 3;
const TAG_U64: u8 = 4;
const TAG_F64: u8 = 5;
const TAG_STRING: u8 = 6;
const TAG_ARRAY: u8 = 7;
const TAG_OBJECT: u8 = 8;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("frame too short: {0} bytes")]
    Truncated(usize),
    #[error("invalid magic: 0x{0:04X}")]
    InvalidMagic(u16),
    #[error("unsupported version: {0}")]
    UnsupportedVersion(u8),
    #[error("unknown frame type: {0}")]
    UnknownFrameType(u8),
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("unknown value tag: {0}")]
    UnknownTag(u8),
    #[error("value nesting exceeds {MAX_DEPTH}")]
    TooDeep,
    #[error("length prefix exceeds remaining buffer")]
    BadLength,
    #[error("invalid utf8 in string value")]
    BadUtf8,
    #[error("invalid timestamp: {0}")]
    BadTimestamp(i64),
    #[error("frame body has wrong shape for its type")]
    BadBody,
}

impl From<WireError> for ServiceError {
    fn from(e: WireError) -> Self {
        ServiceError::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

fn frame_type_byte(frame_type: FrameType) -> u8 {
    match frame_type {
        FrameType::Snapshot => 1,
        FrameType::Update => 2,
        FrameType::Pong => 3,
        FrameType::Error => 4,
    }
}

fn frame_type_from_byte(byte: u8) -> std::result::Result<FrameType, WireError> {
    match byte {
        1 => Ok(FrameType::Snapshot),
        2 => Ok(FrameType::Update),
        3 => Ok(FrameType::Pong),
        4 => Ok(FrameType::Error),
        other => Err(WireError::UnknownFrameType(other)),
    }
}

/// Encode a server frame into the binary format.
pub fn encode_frame(frame: &ServerFrame) -> Result<Vec<u8>> {
    let mut buf = BytesMut::with_capacity(256);
    buf.put_u16_le(WIRE_MAGIC);
    buf.put_u8(WIRE_VERSION);
    buf.put_u8(frame_type_byte(frame.frame_type));
    buf.put_u64_le(frame.seq);
    buf.put_i64_le(frame.timestamp.timestamp_millis());

    let body = match frame.frame_type {
        FrameType::Snapshot | FrameType::Update => match frame.body() {
            Some(map) => serde_json::Value::Object(map.clone()),
            None => serde_json::Value::Object(JsonMap::new()),
        },
        FrameType::Error => serde_json::Value::String(frame.error.clone().unwrap_or_default()),
        FrameType::Pong => serde_json::Value::Null,
    };
    encode_value(&mut buf, &body)?;

    let checksum = crc32(&buf);
    buf.put_u32_le(checksum);
    Ok(buf.to_vec())
}

fn encode_value(buf: &mut BytesMut, value: &serde_json::Value) -> Result<()> {
    match value {
        serde_json::Value::Null => buf.put_u8(TAG_NULL),
        serde_json::Value::Bool(false) => buf.put_u8(TAG_FALSE),
        serde_json::Value::Bool(true) => buf.put_u8(TAG_TRUE),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                buf.put_u8(TAG_I64);
                buf.put_i64_le(i);
            } else if let Some(u) = n.as_u64() {
                buf.put_u8(TAG_U64);
                buf.put_u64_le(u);
            } else {
                buf.put_u8(TAG_F64);
                buf.put_f64_le(n.as_f64().unwrap_or(f64::NAN));
            }
        }
        serde_json::Value::String(s) => {
            buf.put_u8(TAG_STRING);
            put_str(buf, s);
        }
        serde_json::Value::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                encode_value(buf, item)?;
            }
        }
        serde_json::Value::Object(map) => {
            buf.put_u8(TAG_OBJECT);
            buf.put_u32_le(map.len() as u32);
            for (key, item) in map {
                put_str(buf, key);
                encode_value(buf, item)?;
            }
        }
    }
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

/// Decode a binary frame. Validates magic, version, and checksum before
/// touching the body.
pub fn decode_frame(bytes: &[u8]) -> std::result::Result<ServerFrame, WireError> {
    if bytes.len() < HEADER_LEN + 1 + CHECKSUM_LEN {
        return Err(WireError::Truncated(bytes.len()));
    }

    let (payload, checksum_bytes) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    let stored = u32::from_le_bytes(checksum_bytes.try_into().expect("4 checksum bytes"));
    if crc32(payload) != stored {
        return Err(WireError::ChecksumMismatch);
    }

    let mut cursor = payload;
    let magic = cursor.get_u16_le();
    if magic != WIRE_MAGIC {
        return Err(WireError::InvalidMagic(magic));
    }
    let version = cursor.get_u8();
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    let frame_type = frame_type_from_byte(cursor.get_u8())?;
    let seq = cursor.get_u64_le();
    let timestamp_ms = cursor.get_i64_le();
    let timestamp = chrono::Utc
        .timestamp_millis_opt(timestamp_ms)
        .single()
        .ok_or(WireError::BadTimestamp(timestamp_ms))?;

    let body = decode_value(&mut cursor, 0)?;
    if cursor.has_remaining() {
        return Err(WireError::BadLength);
    }

    let mut frame = ServerFrame {
        frame_type,
        seq,
        timestamp,
        data: None,
        changes: None,
        error: None,
    };
    match (frame_type, body) {
        (FrameType::Snapshot, serde_json::Value::Object(map)) => frame.data = Some(map),
        (FrameType::Update, serde_json::Value::Object(map)) => frame.changes = Some(map),
        (FrameType::Error, serde_json::Value::String(code)) => frame.error = Some(code),
        (FrameType::Pong, serde_json::Value::Null) => {}
        _ => return Err(WireError::BadBody),
    }
    Ok(frame)
}

fn decode_value(
    cursor: &mut &[u8],
    depth: usize,
) -> std::result::Result<serde_json::Value, WireError> {
    if depth > MAX_DEPTH {
        return Err(WireError::TooDeep);
    }
    if !cursor.has_remaining() {
        return Err(WireError::BadLength);
    }

    let tag = cursor.get_u8();
    let value = match tag {
        TAG_NULL => serde_json::Value::Null,
        TAG_FALSE => serde_json::Value::Bool(false),
        TAG_TRUE => serde_json::Value::Bool(true),
        TAG_I64 => {
            ensure_remaining(cursor, 8)?;
            serde_json::Value::from(cursor.get_i64_le())
        }
        TAG_U64 => {
            ensure_remaining(cursor, 8)?;
            serde_json::Value::from(cursor.get_u64_le())
        }
        TAG_F64 => {
            ensure_remaining(cursor, 8)?;
            serde_json::Value::from(cursor.get_f64_le())
        }
        TAG_STRING => serde_json::Value::String(get_str(cursor)?),
        TAG_ARRAY => {
            ensure_remaining(cursor, 4)?;
            let count = cursor.get_u32_le() as usize;
            let mut items = Vec::new();
            for _ in 0..count {
                items.push(decode_value(cursor, depth + 1)?);
            }
            serde_json::Value::Array(items)
        }
        TAG_OBJECT => {
            ensure_remaining(cursor, 4)?;
            let count = cursor.get_u32_le() as usize;
            let mut map = JsonMap::new();
            for _ in 0..count {
                let key = get_str(cursor)?;
                map.insert(key, decode_value(cursor, depth + 1)?);
            }
            serde_json::Value::Object(map)
        }
        other => return Err(WireError::UnknownTag(other)),
    };
    Ok(value)
}

fn get_str(cursor: &mut &[u8]) -> std::result::Result<String, WireError> {
    ensure_remaining(cursor, 4)?;
    let len = cursor.get_u32_le() as usize;
    ensure_remaining(cursor, len)?;
    let (head, tail) = cursor.split_at(len);
    let s = std::str::from_utf8(head).map_err(|_| WireError::BadUtf8)?.to_string();
    *cursor = tail;
    Ok(s)
}

fn ensure_remaining(cursor: &[u8], needed: usize) -> std::result::Result<(), WireError> {
    if cursor.remaining() < needed {
        return Err(WireError::BadLength);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CRC32 (IEEE)
// ---------------------------------------------------------------------------

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut n = 0usize;
    while n < 256 {
        let mut crc = n as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 { 0xEDB8_8320 ^ (crc >> 1) } else { crc >> 1 };
            bit += 1;
        }
        table[n] = crc;
        n += 1;
    }
    table
}

static CRC_TABLE: [u32; 256] = crc32_table();

fn crc32(data: &[u8]) -> u32 {
    let mut crc = u32::MAX;
    for &byte in data {
        crc = CRC_TABLE[((crc ^ byte as u32) & 0xFF) as usize] ^ (crc >> 8);
    }
    !crc
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> ServerFrame {
        let mut data = JsonMap::new();
        data.insert(
            "account".into(),
            serde_json::json!({
                "total_balance": 100000.0,
                "available_balance": 95000.5,
                "margin_used": 4999.5,
                "updated_at": "2026-03-01T00:00:00Z"
            }),
        );
        data.insert(
            "positions".into(),
            serde_json::json!({
                "BTCUSDT": {
                    "side": "BUY",
                    "quantity": 0.5,
                    "entry_price": 50000,
                    "mark_price": null
                }
            }),
        );
        ServerFrame::snapshot(42, data)
    }

    #[test]
    fn frames_roundtrip() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();

        assert_eq!(decoded.frame_type, FrameType::Snapshot);
        assert_eq!(decoded.seq, 42);
        assert_eq!(
            decoded.timestamp.timestamp_millis(),
            frame.timestamp.timestamp_millis()
        );
        assert_eq!(
            serde_json::Value::Object(decoded.data.unwrap()),
            serde_json::Value::Object(frame.data.unwrap())
        );
    }

    #[test]
    fn update_and_pong_and_error_roundtrip() {
        let mut changes = JsonMap::new();
        changes.insert("orders".into(), serde_json::json!([{"order_id": "o-1"}]));
        let update = decode_frame(&encode_frame(&ServerFrame::update(7, changes)).unwrap()).unwrap();
        assert_eq!(update.frame_type, FrameType::Update);
        assert!(update.changes.is_some());
        assert!(update.data.is_none());

        let pong = decode_frame(&encode_frame(&ServerFrame::pong(8)).unwrap()).unwrap();
        assert_eq!(pong.frame_type, FrameType::Pong);
        assert!(pong.body().is_none());

        let error =
            decode_frame(&encode_frame(&ServerFrame::error(9, "invalid_input")).unwrap()).unwrap();
        assert_eq!(error.error.as_deref(), Some("invalid_input"));
    }

    #[test]
    fn corruption_is_detected() {
        let mut bytes = encode_frame(&sample_frame()).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xFF;
        assert_eq!(decode_frame(&bytes), Err(WireError::ChecksumMismatch));
    }

    #[test]
    fn wrong_magic_and_version_are_rejected() {
        let frame = ServerFrame::pong(1);
        let good = encode_frame(&frame).unwrap();

        let mut bad_magic = good.clone();
        bad_magic[0] ^= 0xFF;
        // Fix the checksum so the magic check itself is exercised.
        let len = bad_magic.len();
        let crc = crc32(&bad_magic[..len - 4]).to_le_bytes();
        bad_magic[len - 4..].copy_from_slice(&crc);
        assert!(matches!(decode_frame(&bad_magic), Err(WireError::InvalidMagic(_))));

        let mut bad_version = good.clone();
        bad_version[2] = 99;
        let crc = crc32(&bad_version[..len - 4]).to_le_bytes();
        bad_version[len - 4..].copy_from_slice(&crc);
        assert_eq!(decode_frame(&bad_version), Err(WireError::UnsupportedVersion(99)));
    }

    #[test]
    fn truncated_frames_are_rejected() {
        let bytes = encode_frame(&sample_frame()).unwrap();
        assert!(matches!(decode_frame(&bytes[..10]), Err(WireError::Truncated(_))));
    }

    #[test]
    fn numbers_preserve_kind() {
        let mut data = JsonMap::new();
        data.insert(
            "values".into(),
            serde_json::json!({"int": -5, "uint": 18446744073709551615u64, "float": 1.25}),
        );
        let decoded = decode_frame(&encode_frame(&ServerFrame::snapshot(1, data)).unwrap()).unwrap();
        let values = &decoded.data.unwrap()["values"];
        assert!(values["int"].is_i64());
        assert!(values["uint"].is_u64());
        assert!(values["float"].is_f64());
        assert_eq!(values["float"].as_f64(), Some(1.25));
    }

    #[test]
    fn binary_is_smaller_than_json_for_numeric_payloads() {
        let frame = sample_frame();
        let json_len = serde_json::to_vec(&frame).unwrap().len();
        let bin_len = encode_frame(&frame).unwrap().len();
        assert!(bin_len < json_len, "binary {bin_len} >= json {json_len}");
    }

    #[test]
    fn crc32_matches_known_vector() {
        // IEEE CRC32 of "123456789".
        assert_eq!(crc32(b"123456789"), 0xCBF4_3926);
    }
}
