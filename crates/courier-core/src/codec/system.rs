//! Built-in codecs for the primitive body kinds
//!
//! Their ids are fixed and go on the wire in place of a codec name.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use courier_common::{BusError, ReplyException, ReplyFailure};

use super::{Body, MessageCodec, get_len_prefixed, get_string, put_len_prefixed};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i8)]
pub enum SystemCodec {
    Null = 0,
    Bool = 1,
    Byte = 2,
    Short = 3,
    Int = 4,
    Long = 5,
    Float = 6,
    Double = 7,
    Char = 8,
    String = 9,
    Buffer = 10,
    Bytes = 11,
    ReplyException = 12,
}

impl SystemCodec {
    pub const ALL: [SystemCodec; 13] = [
        SystemCodec::Null,
        SystemCodec::Bool,
        SystemCodec::Byte,
        SystemCodec::Short,
        SystemCodec::Int,
        SystemCodec::Long,
        SystemCodec::Float,
        SystemCodec::Double,
        SystemCodec::Char,
        SystemCodec::String,
        SystemCodec::Buffer,
        SystemCodec::Bytes,
        SystemCodec::ReplyException,
    ];

    pub fn from_id(id: i8) -> Option<Self> {
        Self::ALL.iter().copied().find(|codec| *codec as i8 == id)
    }

    /// Built-in codec for a body, `None` for application objects.
    pub fn for_body(body: &Body) -> Option<Self> {
        let codec = match body {
            Body::Null => SystemCodec::Null,
            Body::Bool(_) => SystemCodec::Bool,
            Body::Byte(_) => SystemCodec::Byte,
            Body::Short(_) => SystemCodec::Short,
            Body::Int(_) => SystemCodec::Int,
            Body::Long(_) => SystemCodec::Long,
            Body::Float(_) => SystemCodec::Float,
            Body::Double(_) => SystemCodec::Double,
            Body::Char(_) => SystemCodec::Char,
            Body::String(_) => SystemCodec::String,
            Body::Buffer(_) => SystemCodec::Buffer,
            Body::Bytes(_) => SystemCodec::Bytes,
            Body::Failure(_) => SystemCodec::ReplyException,
            Body::Object(_) => return None,
        };
        Some(codec)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemCodec::Null => "null",
            SystemCodec::Bool => "boolean",
            SystemCodec::Byte => "byte",
            SystemCodec::Short => "short",
            SystemCodec::Int => "int",
            SystemCodec::Long => "long",
            SystemCodec::Float => "float",
            SystemCodec::Double => "double",
            SystemCodec::Char => "char",
            SystemCodec::String => "string",
            SystemCodec::Buffer => "buffer",
            SystemCodec::Bytes => "bytearray",
            SystemCodec::ReplyException => "replyexception",
        }
    }

    fn mismatch(&self, body: &Body) -> BusError {
        BusError::Codec(format!(
            "codec '{}' cannot encode a {} body",
            self.as_str(),
            body.type_name()
        ))
    }

    fn need(&self, buf: &[u8], len: usize) -> Result<(), BusError> {
        if buf.len() < len {
            return Err(BusError::MalformedFrame(format!(
                "{} body needs {len} bytes, have {}",
                self.as_str(),
                buf.len()
            )));
        }
        Ok(())
    }
}

impl MessageCodec for SystemCodec {
    fn name(&self) -> &str {
        self.as_str()
    }

    fn system_id(&self) -> i8 {
        *self as i8
    }

    fn encode(&self, body: &Body, buf: &mut BytesMut) -> Result<(), BusError> {
        match (self, body) {
            (SystemCodec::Null, Body::Null) => {}
            (SystemCodec::Bool, Body::Bool(v)) => buf.put_u8(u8::from(*v)),
            (SystemCodec::Byte, Body::Byte(v)) => buf.put_i8(*v),
            (SystemCodec::Short, Body::Short(v)) => buf.put_i16(*v),
            (SystemCodec::Int, Body::Int(v)) => buf.put_i32(*v),
            (SystemCodec::Long, Body::Long(v)) => buf.put_i64(*v),
            (SystemCodec::Float, Body::Float(v)) => buf.put_f32(*v),
            (SystemCodec::Double, Body::Double(v)) => buf.put_f64(*v),
            (SystemCodec::Char, Body::Char(v)) => buf.put_u32(u32::from(*v)),
            (SystemCodec::String, Body::String(v)) => put_len_prefixed(buf, v.as_bytes()),
            (SystemCodec::Buffer, Body::Buffer(v)) => put_len_prefixed(buf, v),
            (SystemCodec::Bytes, Body::Bytes(v)) => put_len_prefixed(buf, v),
            (SystemCodec::ReplyException, Body::Failure(v)) => {
                buf.put_u8(v.failure_type.to_byte());
                buf.put_i32(v.failure_code);
                put_len_prefixed(buf, v.message.as_bytes());
            }
            _ => return Err(self.mismatch(body)),
        }
        Ok(())
    }

    fn decode(&self, mut buf: &[u8]) -> Result<Body, BusError> {
        let body = match self {
            SystemCodec::Null => Body::Null,
            SystemCodec::Bool => {
                self.need(buf, 1)?;
                Body::Bool(buf.get_u8() != 0)
            }
            SystemCodec::Byte => {
                self.need(buf, 1)?;
                Body::Byte(buf.get_i8())
            }
            SystemCodec::Short => {
                self.need(buf, 2)?;
                Body::Short(buf.get_i16())
            }
            SystemCodec::Int => {
                self.need(buf, 4)?;
                Body::Int(buf.get_i32())
            }
            SystemCodec::Long => {
                self.need(buf, 8)?;
                Body::Long(buf.get_i64())
            }
            SystemCodec::Float => {
                self.need(buf, 4)?;
                Body::Float(buf.get_f32())
            }
            SystemCodec::Double => {
                self.need(buf, 8)?;
                Body::Double(buf.get_f64())
            }
            SystemCodec::Char => {
                self.need(buf, 4)?;
                let code = buf.get_u32();
                let c = char::from_u32(code).ok_or_else(|| {
                    BusError::MalformedFrame(format!("invalid char code point {code:#x}"))
                })?;
                Body::Char(c)
            }
            SystemCodec::String => Body::String(get_string(&mut buf, "string body")?),
            SystemCodec::Buffer => {
                Body::Buffer(Bytes::copy_from_slice(get_len_prefixed(&mut buf, "buffer body")?))
            }
            SystemCodec::Bytes => Body::Bytes(get_len_prefixed(&mut buf, "byte array body")?.to_vec()),
            SystemCodec::ReplyException => {
                self.need(buf, 5)?;
                let raw_type = buf.get_u8();
                let failure_type = ReplyFailure::from_byte(raw_type).ok_or_else(|| {
                    BusError::MalformedFrame(format!("unknown reply failure type {raw_type}"))
                })?;
                let failure_code = buf.get_i32();
                let message = get_string(&mut buf, "reply failure message")?;
                Body::Failure(ReplyException::new(failure_type, failure_code, message))
            }
        };
        Ok(body)
    }

    fn transform(&self, body: &Body) -> Body {
        match body {
            // A local receiver gets its own copy of the bytes, not a view shared with the sender.
            Body::Buffer(b) => Body::Buffer(Bytes::copy_from_slice(b)),
            other => other.clone(),
        }
    }
}
