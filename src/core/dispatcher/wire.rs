// src/core/dispatcher/wire.rs

//! The self-describing binary wire format (spec §6): every request and
//! reply is a single map, unsigned-integer-tagged, with 1- and 2-byte
//! (and, for raw byte strings that can hold a full blob, 4-byte) length
//! prefixes. Loosely modeled on `spineldb::core::protocol::resp_frame`'s
//! `Encoder`/`Decoder` pair, but self-describing rather than line-based
//! since the transport here carries opaque maps rather than RESP arrays.

use crate::core::errors::CoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use indexmap::IndexMap;

const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_UINT8: u8 = 0x03;
const TAG_UINT16: u8 = 0x04;
const TAG_UINT32: u8 = 0x05;
const TAG_UINT64: u8 = 0x06;
const TAG_STR8: u8 = 0x07;
const TAG_STR16: u8 = 0x08;
const TAG_BIN8: u8 = 0x09;
const TAG_BIN16: u8 = 0x0A;
const TAG_BIN32: u8 = 0x0B;
const TAG_ARRAY16: u8 = 0x0C;
const TAG_MAP16: u8 = 0x0D;

/// A dynamically-typed wire value. Requests and replies are always
/// `Value::Map`; the other variants only ever appear nested inside one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Null,
    Bool(bool),
    UInt(u64),
    Str(String),
    Bin(Vec<u8>),
    Array(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn map() -> IndexMap<String, Value> {
        IndexMap::new()
    }

    pub fn as_map(&self) -> Result<&IndexMap<String, Value>, CoreError> {
        match self {
            Value::Map(m) => Ok(m),
            _ => Err(CoreError::BadMessage("expected a map".to_string())),
        }
    }
}

/// Encodes a value into `out`, growing it as needed.
pub fn encode(value: &Value, out: &mut BytesMut) {
    match value {
        Value::Null => out.put_u8(TAG_NULL),
        Value::Bool(false) => out.put_u8(TAG_FALSE),
        Value::Bool(true) => out.put_u8(TAG_TRUE),
        Value::UInt(n) => encode_uint(*n, out),
        Value::Str(s) => encode_str(s, out),
        Value::Bin(b) => encode_bin(b, out),
        Value::Array(items) => {
            out.put_u8(TAG_ARRAY16);
            out.put_u16(items.len() as u16);
            for item in items {
                encode(item, out);
            }
        }
        Value::Map(entries) => {
            out.put_u8(TAG_MAP16);
            out.put_u16(entries.len() as u16);
            for (key, val) in entries {
                encode_str(key, out);
                encode(val, out);
            }
        }
    }
}

fn encode_uint(n: u64, out: &mut BytesMut) {
    if n <= u8::MAX as u64 {
        out.put_u8(TAG_UINT8);
        out.put_u8(n as u8);
    } else if n <= u16::MAX as u64 {
        out.put_u8(TAG_UINT16);
        out.put_u16(n as u16);
    } else if n <= u32::MAX as u64 {
        out.put_u8(TAG_UINT32);
        out.put_u32(n as u32);
    } else {
        out.put_u8(TAG_UINT64);
        out.put_u64(n);
    }
}

fn encode_str(s: &str, out: &mut BytesMut) {
    let bytes = s.as_bytes();
    if bytes.len() <= u8::MAX as usize {
        out.put_u8(TAG_STR8);
        out.put_u8(bytes.len() as u8);
    } else {
        out.put_u8(TAG_STR16);
        out.put_u16(bytes.len() as u16);
    }
    out.put_slice(bytes);
}

fn encode_bin(b: &[u8], out: &mut BytesMut) {
    if b.len() <= u8::MAX as usize {
        out.put_u8(TAG_BIN8);
        out.put_u8(b.len() as u8);
    } else if b.len() <= u16::MAX as usize {
        out.put_u8(TAG_BIN16);
        out.put_u16(b.len() as u16);
    } else {
        out.put_u8(TAG_BIN32);
        out.put_u32(b.len() as u32);
    }
    out.put_slice(b);
}

/// Decodes a single value from the front of `buf`, advancing it past what
/// was consumed. A truncated or malformed buffer reports `bad_message`.
pub fn decode(buf: &mut Bytes) -> Result<Value, CoreError> {
    let tag = read_u8(buf)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_FALSE => Ok(Value::Bool(false)),
        TAG_TRUE => Ok(Value::Bool(true)),
        TAG_UINT8 => Ok(Value::UInt(read_u8(buf)? as u64)),
        TAG_UINT16 => Ok(Value::UInt(read_u16(buf)? as u64)),
        TAG_UINT32 => Ok(Value::UInt(read_u32(buf)? as u64)),
        TAG_UINT64 => Ok(Value::UInt(read_u64(buf)?)),
        TAG_STR8 => {
            let len = read_u8(buf)? as usize;
            Ok(Value::Str(read_utf8(buf, len)?))
        }
        TAG_STR16 => {
            let len = read_u16(buf)? as usize;
            Ok(Value::Str(read_utf8(buf, len)?))
        }
        TAG_BIN8 => {
            let len = read_u8(buf)? as usize;
            Ok(Value::Bin(read_raw(buf, len)?))
        }
        TAG_BIN16 => {
            let len = read_u16(buf)? as usize;
            Ok(Value::Bin(read_raw(buf, len)?))
        }
        TAG_BIN32 => {
            let len = read_u32(buf)? as usize;
            Ok(Value::Bin(read_raw(buf, len)?))
        }
        TAG_ARRAY16 => {
            let count = read_u16(buf)?;
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                items.push(decode(buf)?);
            }
            Ok(Value::Array(items))
        }
        TAG_MAP16 => {
            let count = read_u16(buf)?;
            let mut entries = IndexMap::with_capacity(count as usize);
            for _ in 0..count {
                let key = match decode(buf)? {
                    Value::Str(s) => s,
                    _ => return Err(CoreError::BadMessage("map key must be a string".to_string())),
                };
                let val = decode(buf)?;
                entries.insert(key, val);
            }
            Ok(Value::Map(entries))
        }
        other => Err(CoreError::BadMessage(format!("unknown wire tag {other:#04x}"))),
    }
}

fn truncated() -> CoreError {
    CoreError::BadMessage("truncated frame".to_string())
}

fn read_u8(buf: &mut Bytes) -> Result<u8, CoreError> {
    if buf.remaining() < 1 {
        return Err(truncated());
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> Result<u16, CoreError> {
    if buf.remaining() < 2 {
        return Err(truncated());
    }
    Ok(buf.get_u16())
}

fn read_u32(buf: &mut Bytes) -> Result<u32, CoreError> {
    if buf.remaining() < 4 {
        return Err(truncated());
    }
    Ok(buf.get_u32())
}

fn read_u64(buf: &mut Bytes) -> Result<u64, CoreError> {
    if buf.remaining() < 8 {
        return Err(truncated());
    }
    Ok(buf.get_u64())
}

fn read_raw(buf: &mut Bytes, len: usize) -> Result<Vec<u8>, CoreError> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(buf.copy_to_bytes(len).to_vec())
}

fn read_utf8(buf: &mut Bytes, len: usize) -> Result<String, CoreError> {
    let raw = read_raw(buf, len)?;
    String::from_utf8(raw).map_err(|_| CoreError::BadMessage("invalid utf-8 in string".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_request_shaped_map() {
        let mut map = Value::map();
        map.insert("cmd".to_string(), Value::Str("vlob_read".to_string()));
        map.insert("version".to_string(), Value::UInt(1));
        map.insert("blob".to_string(), Value::Bin(vec![1, 2, 3]));
        let value = Value::Map(map);

        let mut buf = BytesMut::new();
        encode(&value, &mut buf);
        let mut frozen = buf.freeze();
        let decoded = decode(&mut frozen).unwrap();

        assert_eq!(decoded, value);
        assert!(frozen.is_empty());
    }

    #[test]
    fn truncated_frame_is_bad_message() {
        let mut buf = Bytes::from_static(&[TAG_UINT16, 0x01]);
        let err = decode(&mut buf).unwrap_err();
        assert_eq!(err, CoreError::BadMessage("truncated frame".to_string()));
    }
}
