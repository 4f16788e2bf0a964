//! Message envelope and its binary wire layout
//!
//! Frames are big-endian and start with a 4-byte length that does not count
//! itself:
//!
//! ```text
//! i32   frame length
//! u8    protocol version
//! i8    codec id (-1 = user codec, name follows)
//! [i32 len, name]
//! u8    0 = send, 1 = publish
//! i32 len, address
//! i32 len, reply address (0 = none)
//! i32   sender port
//! i32 len, sender host
//! ...   body bytes, owned by the codec
//! ```

use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};

use courier_common::BusError;

use crate::codec::{
    Body, CodecRegistry, MessageCodec, USER_CODEC_ID, get_string, put_len_prefixed,
};
use crate::message::Message;
use crate::model::NodeId;

/// Highest wire protocol version this node reads and the one it writes.
pub const WIRE_PROTOCOL_VERSION: u8 = 1;

const LENGTH_PREFIX: usize = 4;

const SEND_FLAG: u8 = 0;
const PUBLISH_FLAG: u8 = 1;

/// Body of an envelope: a value handed to `send`, or bytes read off the wire
#[derive(Clone, Debug)]
pub enum Payload {
    Sent(Body),
    Wire(Bytes),
}

/// A message in flight
#[derive(Clone)]
pub struct MessageEnvelope {
    pub sender: NodeId,
    pub address: String,
    pub reply_address: Option<String>,
    pub send: bool,
    pub codec: Arc<dyn MessageCodec>,
    pub payload: Payload,
}

impl std::fmt::Debug for MessageEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEnvelope")
            .field("sender", &self.sender)
            .field("address", &self.address)
            .field("reply_address", &self.reply_address)
            .field("send", &self.send)
            .field("codec", &self.codec.name())
            .field("payload", &self.payload)
            .finish()
    }
}

impl MessageEnvelope {
    pub fn new(
        sender: NodeId,
        address: impl Into<String>,
        reply_address: Option<String>,
        send: bool,
        codec: Arc<dyn MessageCodec>,
        body: Body,
    ) -> Self {
        Self {
            sender,
            address: address.into(),
            reply_address,
            send,
            codec,
            payload: Payload::Sent(body),
        }
    }

    /// Encode with the current protocol version.
    pub fn encode_to_wire(&self) -> Result<Bytes, BusError> {
        self.encode_with_version(WIRE_PROTOCOL_VERSION)
    }

    /// Encode, refusing frames a peer would reject as too large.
    pub fn encode_within(&self, max_frame_size: usize) -> Result<Bytes, BusError> {
        let frame = self.encode_to_wire()?;
        let frame_len = frame.len() - LENGTH_PREFIX;
        if frame_len > max_frame_size {
            return Err(BusError::MalformedFrame(format!(
                "frame of {frame_len} bytes exceeds the limit of {max_frame_size}"
            )));
        }
        Ok(frame)
    }

    pub fn encode_with_version(&self, version: u8) -> Result<Bytes, BusError> {
        if version == 0 || version > WIRE_PROTOCOL_VERSION {
            return Err(BusError::UnsupportedProtocolVersion {
                found: version,
                supported: WIRE_PROTOCOL_VERSION,
            });
        }

        let mut buf = BytesMut::with_capacity(64 + self.address.len());
        buf.put_i32(0);
        buf.put_u8(version);
        let codec_id = self.codec.system_id();
        buf.put_i8(codec_id);
        if codec_id == USER_CODEC_ID {
            put_len_prefixed(&mut buf, self.codec.name().as_bytes());
        }
        buf.put_u8(if self.send { SEND_FLAG } else { PUBLISH_FLAG });
        put_len_prefixed(&mut buf, self.address.as_bytes());
        put_len_prefixed(
            &mut buf,
            self.reply_address.as_deref().unwrap_or_default().as_bytes(),
        );
        buf.put_i32(i32::from(self.sender.port));
        put_len_prefixed(&mut buf, self.sender.host.as_bytes());

        match &self.payload {
            Payload::Sent(body) => self.codec.encode(body, &mut buf)?,
            Payload::Wire(raw) => buf.put_slice(raw),
        }

        let frame_len = buf.len() - LENGTH_PREFIX;
        let frame_len = i32::try_from(frame_len)
            .map_err(|_| BusError::Codec(format!("frame of {frame_len} bytes is too large")))?;
        BigEndian::write_i32(&mut buf[..LENGTH_PREFIX], frame_len);
        Ok(buf.freeze())
    }

    /// Build the message handed to a local handler.
    ///
    /// Values sent inside this process go through the codec's `transform`;
    /// bytes from the wire stay raw until the handler first reads the body.
    pub fn to_message(&self) -> Message {
        match &self.payload {
            Payload::Sent(body) => Message::decoded(self, self.codec.transform(body)),
            Payload::Wire(raw) => Message::raw(self, raw.clone()),
        }
    }
}

/// Decode a complete frame, length prefix included.
pub fn decode_from_wire(frame: Bytes, codecs: &CodecRegistry) -> Result<MessageEnvelope, BusError> {
    if frame.len() < LENGTH_PREFIX {
        return Err(BusError::MalformedFrame("frame length missing".to_string()));
    }
    let declared = BigEndian::read_i32(&frame[..LENGTH_PREFIX]);
    if declared < 0 || declared as usize != frame.len() - LENGTH_PREFIX {
        return Err(BusError::MalformedFrame(format!(
            "frame declares {declared} bytes but carries {}",
            frame.len() - LENGTH_PREFIX
        )));
    }

    let mut cursor = &frame[LENGTH_PREFIX..];
    if cursor.remaining() < 2 {
        return Err(BusError::MalformedFrame("frame header truncated".to_string()));
    }
    let version = cursor.get_u8();
    if version > WIRE_PROTOCOL_VERSION {
        return Err(BusError::UnsupportedProtocolVersion {
            found: version,
            supported: WIRE_PROTOCOL_VERSION,
        });
    }

    let codec_id = cursor.get_i8();
    let codec = if codec_id == USER_CODEC_ID {
        let name = get_string(&mut cursor, "codec name")?;
        codecs
            .user_codec(&name)
            .ok_or(BusError::CodecNotFound(name))?
    } else {
        codecs
            .system_codec(codec_id)
            .ok_or_else(|| BusError::MalformedFrame(format!("unknown system codec id {codec_id}")))?
    };

    if cursor.remaining() < 1 {
        return Err(BusError::MalformedFrame("send flag missing".to_string()));
    }
    let send = match cursor.get_u8() {
        SEND_FLAG => true,
        PUBLISH_FLAG => false,
        other => {
            return Err(BusError::MalformedFrame(format!("invalid send flag {other}")));
        }
    };

    let address = get_string(&mut cursor, "address")?;
    let reply_address = get_string(&mut cursor, "reply address")?;
    let reply_address = (!reply_address.is_empty()).then_some(reply_address);

    if cursor.remaining() < 4 {
        return Err(BusError::MalformedFrame("sender port missing".to_string()));
    }
    let port = cursor.get_i32();
    let port = u16::try_from(port)
        .map_err(|_| BusError::MalformedFrame(format!("invalid sender port {port}")))?;
    let host = get_string(&mut cursor, "sender host")?;

    let body_start = frame.len() - cursor.remaining();
    Ok(MessageEnvelope {
        sender: NodeId::new(host, port),
        address,
        reply_address,
        send,
        codec,
        payload: Payload::Wire(frame.slice(body_start..)),
    })
}

/// Cut the next complete frame off the front of a stream buffer.
///
/// Returns `Ok(None)` until enough bytes have arrived.
pub fn split_frame(buf: &mut BytesMut, max_frame_size: usize) -> Result<Option<Bytes>, BusError> {
    if buf.len() < LENGTH_PREFIX {
        return Ok(None);
    }
    let declared = BigEndian::read_i32(&buf[..LENGTH_PREFIX]);
    if declared < 0 {
        return Err(BusError::MalformedFrame(format!(
            "negative frame length {declared}"
        )));
    }
    let declared = declared as usize;
    if declared > max_frame_size {
        return Err(BusError::MalformedFrame(format!(
            "frame of {declared} bytes exceeds the limit of {max_frame_size}"
        )));
    }
    if buf.len() < LENGTH_PREFIX + declared {
        return Ok(None);
    }
    Ok(Some(buf.split_to(LENGTH_PREFIX + declared).freeze()))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;
    use crate::codec::SystemCodec;

    fn string_envelope(send: bool) -> MessageEnvelope {
        MessageEnvelope::new(
            NodeId::new("h", 1234),
            "a1",
            Some("r1".to_string()),
            send,
            Arc::new(SystemCodec::String),
            Body::from("hello"),
        )
    }

    #[test]
    fn test_wire_round_trip() {
        let codecs = CodecRegistry::new();
        let frame = string_envelope(true).encode_to_wire().unwrap();
        let decoded = decode_from_wire(frame, &codecs).unwrap();

        assert_eq!(decoded.address, "a1");
        assert_eq!(decoded.reply_address.as_deref(), Some("r1"));
        assert_eq!(decoded.sender, NodeId::new("h", 1234));
        assert!(decoded.send);
        assert_eq!(decoded.codec.system_id(), SystemCodec::String as i8);

        let message = decoded.to_message();
        assert_eq!(message.body().unwrap(), Body::from("hello"));
    }

    #[test]
    fn test_layout() {
        let frame = string_envelope(false).encode_to_wire().unwrap();
        let declared = BigEndian::read_i32(&frame[..4]) as usize;
        assert_eq!(declared, frame.len() - 4);
        assert_eq!(frame[4], WIRE_PROTOCOL_VERSION);
        assert_eq!(frame[5] as i8, SystemCodec::String as i8);
        assert_eq!(frame[6], PUBLISH_FLAG);
        assert_eq!(BigEndian::read_i32(&frame[7..11]), 2);
        assert_eq!(&frame[11..13], b"a1");
    }

    #[test]
    fn test_no_reply_address() {
        let codecs = CodecRegistry::new();
        let mut envelope = string_envelope(true);
        envelope.reply_address = None;
        let decoded = decode_from_wire(envelope.encode_to_wire().unwrap(), &codecs).unwrap();
        assert!(decoded.reply_address.is_none());
    }

    #[test]
    fn test_encode_unsupported_version() {
        let envelope = string_envelope(true);
        assert!(matches!(
            envelope.encode_with_version(2),
            Err(BusError::UnsupportedProtocolVersion { found: 2, supported: 1 })
        ));
        assert!(envelope.encode_with_version(0).is_err());
    }

    #[test]
    fn test_decode_newer_version_rejected() {
        let codecs = CodecRegistry::new();
        let frame = string_envelope(true).encode_to_wire().unwrap();
        let mut tampered = BytesMut::from(&frame[..]);
        tampered[4] = WIRE_PROTOCOL_VERSION + 1;
        assert!(matches!(
            decode_from_wire(tampered.freeze(), &codecs),
            Err(BusError::UnsupportedProtocolVersion { found: 2, .. })
        ));
    }

    #[test]
    fn test_decode_unknown_user_codec() {
        struct Named;
        impl MessageCodec for Named {
            fn name(&self) -> &str {
                "named"
            }
            fn encode(&self, _body: &Body, buf: &mut BytesMut) -> Result<(), BusError> {
                buf.put_u8(1);
                Ok(())
            }
            fn decode(&self, _buf: &[u8]) -> Result<Body, BusError> {
                Ok(Body::Null)
            }
        }

        let envelope = MessageEnvelope::new(
            NodeId::new("h", 1),
            "a",
            None,
            true,
            Arc::new(Named),
            Body::object(1u8),
        );
        let frame = envelope.encode_to_wire().unwrap();
        let codecs = CodecRegistry::new();
        assert!(matches!(
            decode_from_wire(frame.clone(), &codecs),
            Err(BusError::CodecNotFound(name)) if name == "named"
        ));

        codecs.register(Arc::new(Named)).unwrap();
        assert!(decode_from_wire(frame, &codecs).is_ok());
    }

    #[test]
    fn test_decode_truncated_frame() {
        let codecs = CodecRegistry::new();
        let frame = string_envelope(true).encode_to_wire().unwrap();
        let truncated = frame.slice(..frame.len() - 3);
        assert!(matches!(
            decode_from_wire(truncated, &codecs),
            Err(BusError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_split_frame_waits_for_complete_frame() {
        let frame = string_envelope(true).encode_to_wire().unwrap();
        let mut stream = BytesMut::new();
        stream.extend_from_slice(&frame[..10]);
        assert!(split_frame(&mut stream, 1024).unwrap().is_none());
        stream.extend_from_slice(&frame[10..]);
        stream.extend_from_slice(&frame[..2]);
        assert_eq!(split_frame(&mut stream, 1024).unwrap().unwrap(), frame);
        assert_eq!(stream.len(), 2);
    }

    #[test]
    fn test_split_frame_rejects_oversized() {
        let frame = string_envelope(true).encode_to_wire().unwrap();
        let mut stream = BytesMut::from(&frame[..]);
        assert!(matches!(
            split_frame(&mut stream, 8),
            Err(BusError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_encode_within_limit() {
        let envelope = string_envelope(true);
        let frame = envelope.encode_to_wire().unwrap();
        let frame_len = frame.len() - LENGTH_PREFIX;

        assert_eq!(envelope.encode_within(frame_len).unwrap(), frame);
        assert!(matches!(
            envelope.encode_within(frame_len - 1),
            Err(BusError::MalformedFrame(_))
        ));
    }

    proptest! {
        #[test]
        fn test_split_frame_any_chunking(
            count in 1usize..8,
            chunk in 1usize..64,
        ) {
            let frames: Vec<Bytes> = (0..count)
                .map(|i| {
                    let mut envelope = string_envelope(i % 2 == 0);
                    envelope.payload = Payload::Sent(Body::from(format!("body-{i}")));
                    envelope.encode_to_wire().unwrap()
                })
                .collect();
            let stream: Vec<u8> = frames.iter().flat_map(|f| f.iter().copied()).collect();

            let mut buffer = BytesMut::new();
            let mut out = Vec::new();
            for piece in stream.chunks(chunk) {
                buffer.extend_from_slice(piece);
                while let Some(frame) = split_frame(&mut buffer, 1024).unwrap() {
                    out.push(frame);
                }
            }
            prop_assert_eq!(out, frames);
            prop_assert!(buffer.is_empty());
        }
    }
}
