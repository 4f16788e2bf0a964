//! Message bodies and the codecs that put them on the wire
//!
//! Every body crossing a process boundary is encoded by a [`MessageCodec`].
//! Built-in body kinds use the [`system`] codecs, identified on the wire by a
//! small id; anything else needs a user codec registered by name in the
//! [`registry`].

pub mod registry;
pub mod system;

use std::any::{Any, TypeId};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use courier_common::{BusError, ReplyException};

pub use registry::CodecRegistry;
pub use system::SystemCodec;

/// System id written on the wire for user codecs; their name follows.
pub const USER_CODEC_ID: i8 = -1;

/// Application value carried by a user codec
#[derive(Clone)]
pub struct ObjectBody {
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl ObjectBody {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            value: Arc::new(value),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref::<T>()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.is::<T>()
    }

    pub(crate) fn value_type_id(&self) -> TypeId {
        (*self.value).type_id()
    }
}

impl Debug for ObjectBody {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl PartialEq for ObjectBody {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.value, &other.value)
    }
}

/// Body of a message
#[derive(Clone, Debug, PartialEq)]
pub enum Body {
    Null,
    Bool(bool),
    Byte(i8),
    Short(i16),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Char(char),
    String(String),
    Buffer(Bytes),
    Bytes(Vec<u8>),
    Failure(ReplyException),
    Object(ObjectBody),
}

impl Body {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        Body::Object(ObjectBody::new(value))
    }

    /// Name of the body kind, used in error messages and for default codec lookup.
    pub fn type_name(&self) -> &'static str {
        match self {
            Body::Null => "null",
            Body::Bool(_) => "boolean",
            Body::Byte(_) => "byte",
            Body::Short(_) => "short",
            Body::Int(_) => "int",
            Body::Long(_) => "long",
            Body::Float(_) => "float",
            Body::Double(_) => "double",
            Body::Char(_) => "char",
            Body::String(_) => "string",
            Body::Buffer(_) => "buffer",
            Body::Bytes(_) => "bytearray",
            Body::Failure(_) => "replyexception",
            Body::Object(object) => object.type_name(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Body::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Body::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Body::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i32> {
        match self {
            Body::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Body::Long(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_double(&self) -> Option<f64> {
        match self {
            Body::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Body::Buffer(b) => Some(b),
            Body::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_failure(&self) -> Option<&ReplyException> {
        match self {
            Body::Failure(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object<T: Any>(&self) -> Option<&T> {
        match self {
            Body::Object(object) => object.downcast_ref::<T>(),
            _ => None,
        }
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Null
    }
}

impl From<bool> for Body {
    fn from(v: bool) -> Self {
        Body::Bool(v)
    }
}

impl From<i8> for Body {
    fn from(v: i8) -> Self {
        Body::Byte(v)
    }
}

impl From<i16> for Body {
    fn from(v: i16) -> Self {
        Body::Short(v)
    }
}

impl From<i32> for Body {
    fn from(v: i32) -> Self {
        Body::Int(v)
    }
}

impl From<i64> for Body {
    fn from(v: i64) -> Self {
        Body::Long(v)
    }
}

impl From<f32> for Body {
    fn from(v: f32) -> Self {
        Body::Float(v)
    }
}

impl From<f64> for Body {
    fn from(v: f64) -> Self {
        Body::Double(v)
    }
}

impl From<char> for Body {
    fn from(v: char) -> Self {
        Body::Char(v)
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::String(v)
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::String(v.to_string())
    }
}

impl From<Bytes> for Body {
    fn from(v: Bytes) -> Self {
        Body::Buffer(v)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(v)
    }
}

impl From<ReplyException> for Body {
    fn from(v: ReplyException) -> Self {
        Body::Failure(v)
    }
}

impl<T: Into<Body>> From<Option<T>> for Body {
    fn from(v: Option<T>) -> Self {
        v.map_or(Body::Null, Into::into)
    }
}

/// Serializer for one kind of message body
pub trait MessageCodec: Send + Sync + 'static {
    /// Unique name of the codec; sent on the wire for user codecs.
    fn name(&self) -> &str;

    /// Wire id; anything other than [`USER_CODEC_ID`] is reserved for built-ins.
    fn system_id(&self) -> i8 {
        USER_CODEC_ID
    }

    /// Append the encoded body to `buf`.
    fn encode(&self, body: &Body, buf: &mut BytesMut) -> Result<(), BusError>;

    /// Decode a body from the bytes following the frame header.
    fn decode(&self, buf: &[u8]) -> Result<Body, BusError>;

    /// Copy applied when a message is delivered inside the same process.
    fn transform(&self, body: &Body) -> Body {
        body.clone()
    }
}

pub(crate) fn put_len_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_i32(data.len() as i32);
    buf.put_slice(data);
}

pub(crate) fn get_len_prefixed<'a>(buf: &mut &'a [u8], what: &str) -> Result<&'a [u8], BusError> {
    if buf.remaining() < 4 {
        return Err(BusError::MalformedFrame(format!("{what} length missing")));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Err(BusError::MalformedFrame(format!(
            "{what} has negative length {len}"
        )));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(BusError::MalformedFrame(format!(
            "{what} truncated: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let whole: &'a [u8] = *buf;
    let (data, rest) = whole.split_at(len);
    *buf = rest;
    Ok(data)
}

pub(crate) fn get_string(buf: &mut &[u8], what: &str) -> Result<String, BusError> {
    let data = get_len_prefixed(buf, what)?;
    String::from_utf8(data.to_vec())
        .map_err(|e| BusError::MalformedFrame(format!("{what} is not valid UTF-8: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Point {
        x: i32,
        y: i32,
    }

    #[test]
    fn test_body_accessors() {
        assert_eq!(Body::from("hello").as_str(), Some("hello"));
        assert_eq!(Body::from(42).as_int(), Some(42));
        assert_eq!(Body::from(42i64).as_long(), Some(42));
        assert_eq!(Body::from(true).as_bool(), Some(true));
        assert_eq!(Body::from(vec![1u8, 2]).as_bytes(), Some(&[1u8, 2][..]));
        assert!(Body::from(None::<String>).is_null());
        assert_eq!(Body::from(42).as_str(), None);
    }

    #[test]
    fn test_object_body() {
        let body = Body::object(Point { x: 1, y: 2 });
        assert_eq!(body.as_object::<Point>(), Some(&Point { x: 1, y: 2 }));
        assert!(body.as_object::<String>().is_none());
        assert!(body.type_name().ends_with("Point"));

        let copy = body.clone();
        assert_eq!(body, copy);
        assert_ne!(body, Body::object(Point { x: 1, y: 2 }));
    }

    #[test]
    fn test_len_prefixed_truncated() {
        let mut buf = BytesMut::new();
        buf.put_i32(10);
        buf.put_slice(b"abc");
        let mut cursor = &buf[..];
        assert!(matches!(
            get_len_prefixed(&mut cursor, "address"),
            Err(BusError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_get_string() {
        let mut buf = BytesMut::new();
        put_len_prefixed(&mut buf, "orders".as_bytes());
        buf.put_u8(7);
        let mut cursor = &buf[..];
        assert_eq!(get_string(&mut cursor, "address").unwrap(), "orders");
        assert_eq!(cursor, &[7u8][..]);
    }
}
