//! Session Payload Codec
//!
//! Compact binary form of a [`SessionPayload`]:
//!
//! ```text
//! payload    := compressed:u8 ( raw | len:i32 zstd(raw)[len] )
//! raw        := segments:u8 timeout:i32 [static-objects] [items]
//! segments   := 0x01 has static objects | 0x02 has items
//! ```
//!
//! All integers are little-endian. Strings and blobs are `len:i32` followed by
//! the bytes. An absent segment decodes to an empty-but-present one.

use bytes::{Buf, BufMut};
use std::collections::BTreeMap;
use thiserror::Error;

use super::payload::{SessionItems, SessionPayload, SessionValue, StaticObjects};

const HAS_STATIC_OBJECTS: u8 = 0x01;
const HAS_SESSION_ITEMS: u8 = 0x02;
const KNOWN_SEGMENTS: u8 = HAS_STATIC_OBJECTS | HAS_SESSION_ITEMS;

// zstd level 0 selects the library default
const COMPRESSION_LEVEL: i32 = 0;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_JSON: u8 = 6;

/// Malformed or truncated payload bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("payload truncated")]
    Truncated,

    #[error("invalid flag byte 0x{0:02x}")]
    InvalidFlag(u8),

    #[error("invalid length {0}")]
    InvalidLength(i32),

    #[error("unknown value tag {0}")]
    UnknownValueTag(u8),

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("invalid JSON value: {0}")]
    Json(String),

    #[error("decompression failed: {0}")]
    Decompress(String),

    #[error("{0} unexpected trailing bytes")]
    TrailingBytes(usize),

    #[error("duplicate key '{0}'")]
    DuplicateKey(String),
}

/// Payload could not be encoded
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("compression failed: {0}")]
    Compress(String),

    #[error("segment of {0} bytes exceeds the encodable size")]
    TooLarge(usize),

    #[error("JSON serialization failed: {0}")]
    Json(String),
}

/// Encode a payload, optionally compressing the whole raw form
pub fn encode(payload: &SessionPayload, compress: bool) -> Result<Vec<u8>, EncodeError> {
    let raw = encode_raw(payload)?;

    if !compress {
        let mut out = Vec::with_capacity(raw.len() + 1);
        out.put_u8(0);
        out.put_slice(&raw);
        return Ok(out);
    }

    let compressed = zstd::encode_all(raw.as_slice(), COMPRESSION_LEVEL)
        .map_err(|e| EncodeError::Compress(e.to_string()))?;

    let mut out = Vec::with_capacity(compressed.len() + 5);
    out.put_u8(1);
    put_len(&mut out, compressed.len())?;
    out.put_slice(&compressed);
    Ok(out)
}

/// Decode bytes produced by [`encode`]
pub fn decode(data: &[u8]) -> Result<SessionPayload, DecodeError> {
    let mut reader = Reader::new(data);

    let payload = match reader.u8()? {
        0 => decode_raw(&mut reader)?,
        1 => {
            let len = reader.len()?;
            let compressed = reader.bytes(len)?;
            let raw = zstd::decode_all(compressed).map_err(|e| DecodeError::Decompress(e.to_string()))?;

            let mut inner = Reader::new(&raw);
            let payload = decode_raw(&mut inner)?;
            inner.finish()?;
            payload
        }
        other => return Err(DecodeError::InvalidFlag(other)),
    };

    reader.finish()?;
    Ok(payload)
}

fn encode_raw(payload: &SessionPayload) -> Result<Vec<u8>, EncodeError> {
    let mut segments = 0u8;
    if !payload.static_objects.never_accessed() {
        segments |= HAS_STATIC_OBJECTS;
    }
    if !payload.items.is_empty() {
        segments |= HAS_SESSION_ITEMS;
    }

    let mut out = Vec::new();
    out.put_u8(segments);
    out.put_i32_le(payload.timeout_minutes);

    if segments & HAS_STATIC_OBJECTS != 0 {
        put_len(&mut out, payload.static_objects.len())?;
        for (name, object) in payload.static_objects.iter() {
            put_str(&mut out, name)?;
            put_blob(&mut out, object)?;
        }
    }

    if segments & HAS_SESSION_ITEMS != 0 {
        put_len(&mut out, payload.items.len())?;
        for (key, value) in payload.items.iter() {
            put_str(&mut out, key)?;
            put_value(&mut out, value)?;
        }
    }

    Ok(out)
}

fn decode_raw(reader: &mut Reader<'_>) -> Result<SessionPayload, DecodeError> {
    let segments = reader.u8()?;
    if segments & !KNOWN_SEGMENTS != 0 {
        return Err(DecodeError::InvalidFlag(segments));
    }

    let timeout_minutes = reader.i32()?;

    let static_objects = if segments & HAS_STATIC_OBJECTS != 0 {
        let count = reader.len()?;
        let mut objects = BTreeMap::new();
        for _ in 0..count {
            let name = reader.string()?;
            let object = reader.blob()?;
            if objects.contains_key(&name) {
                return Err(DecodeError::DuplicateKey(name));
            }
            objects.insert(name, object);
        }
        StaticObjects::restored(objects)
    } else {
        StaticObjects::new()
    };

    let mut items = SessionItems::new();
    if segments & HAS_SESSION_ITEMS != 0 {
        let count = reader.len()?;
        for _ in 0..count {
            let key = reader.string()?;
            let value = reader.value()?;
            if items.get(&key).is_some() {
                return Err(DecodeError::DuplicateKey(key));
            }
            items.set(key, value);
        }
    }

    Ok(SessionPayload {
        items,
        static_objects,
        timeout_minutes,
    })
}

fn put_len(out: &mut Vec<u8>, len: usize) -> Result<(), EncodeError> {
    let len = i32::try_from(len).map_err(|_| EncodeError::TooLarge(len))?;
    out.put_i32_le(len);
    Ok(())
}

fn put_blob(out: &mut Vec<u8>, data: &[u8]) -> Result<(), EncodeError> {
    put_len(out, data.len())?;
    out.put_slice(data);
    Ok(())
}

fn put_str(out: &mut Vec<u8>, s: &str) -> Result<(), EncodeError> {
    put_blob(out, s.as_bytes())
}

fn put_value(out: &mut Vec<u8>, value: &SessionValue) -> Result<(), EncodeError> {
    match value {
        SessionValue::Null => out.put_u8(TAG_NULL),
        SessionValue::Bool(b) => {
            out.put_u8(TAG_BOOL);
            out.put_u8(u8::from(*b));
        }
        SessionValue::Int(i) => {
            out.put_u8(TAG_INT);
            out.put_i64_le(*i);
        }
        SessionValue::Float(f) => {
            out.put_u8(TAG_FLOAT);
            out.put_f64_le(*f);
        }
        SessionValue::Str(s) => {
            out.put_u8(TAG_STR);
            put_str(out, s)?;
        }
        SessionValue::Bytes(b) => {
            out.put_u8(TAG_BYTES);
            put_blob(out, b)?;
        }
        SessionValue::Json(v) => {
            let json = serde_json::to_vec(v).map_err(|e| EncodeError::Json(e.to_string()))?;
            out.put_u8(TAG_JSON);
            put_blob(out, &json)?;
        }
    }
    Ok(())
}

/// Bounds-checked cursor over encoded bytes
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn need(&self, n: usize) -> Result<(), DecodeError> {
        if self.buf.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn f64(&mut self) -> Result<f64, DecodeError> {
        self.need(8)?;
        Ok(self.buf.get_f64_le())
    }

    fn len(&mut self) -> Result<usize, DecodeError> {
        let len = self.i32()?;
        usize::try_from(len).map_err(|_| DecodeError::InvalidLength(len))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        self.need(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn blob(&mut self) -> Result<Vec<u8>, DecodeError> {
        let len = self.len()?;
        Ok(self.bytes(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.len()?;
        let bytes = self.bytes(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| DecodeError::InvalidUtf8)
    }

    fn value(&mut self) -> Result<SessionValue, DecodeError> {
        let value = match self.u8()? {
            TAG_NULL => SessionValue::Null,
            TAG_BOOL => match self.u8()? {
                0 => SessionValue::Bool(false),
                1 => SessionValue::Bool(true),
                other => return Err(DecodeError::InvalidFlag(other)),
            },
            TAG_INT => SessionValue::Int(self.i64()?),
            TAG_FLOAT => SessionValue::Float(self.f64()?),
            TAG_STR => SessionValue::Str(self.string()?),
            TAG_BYTES => SessionValue::Bytes(self.blob()?),
            TAG_JSON => {
                let len = self.len()?;
                let json = self.bytes(len)?;
                let value = serde_json::from_slice(json).map_err(|e| DecodeError::Json(e.to_string()))?;
                SessionValue::Json(value)
            }
            other => return Err(DecodeError::UnknownValueTag(other)),
        };
        Ok(value)
    }

    fn finish(&self) -> Result<(), DecodeError> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}
