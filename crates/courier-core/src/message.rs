// Message delivered to a handler

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

use courier_common::{BusError, ReplyException};

use crate::codec::{Body, MessageCodec};
use crate::model::{DeliveryOptions, NodeId};
use crate::service::bus::EventBus;
use crate::service::reply::ReplyResult;
use crate::wire::MessageEnvelope;

enum BodyState {
    Decoded(Body),
    Raw(Bytes),
}

/// A message received by a handler
///
/// Bodies that arrived over the wire are decoded on first access and the raw
/// bytes are released afterwards.
pub struct Message {
    address: String,
    reply_address: Option<String>,
    sender: NodeId,
    send: bool,
    codec: Arc<dyn MessageCodec>,
    body: Mutex<BodyState>,
}

impl Message {
    pub(crate) fn decoded(envelope: &MessageEnvelope, body: Body) -> Self {
        Self::with_state(envelope, BodyState::Decoded(body))
    }

    pub(crate) fn raw(envelope: &MessageEnvelope, raw: Bytes) -> Self {
        Self::with_state(envelope, BodyState::Raw(raw))
    }

    fn with_state(envelope: &MessageEnvelope, state: BodyState) -> Self {
        Self {
            address: envelope.address.clone(),
            reply_address: envelope.reply_address.clone(),
            sender: envelope.sender.clone(),
            send: envelope.send,
            codec: envelope.codec.clone(),
            body: Mutex::new(state),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn reply_address(&self) -> Option<&str> {
        self.reply_address.as_deref()
    }

    /// Node the message was sent from
    pub fn sender(&self) -> &NodeId {
        &self.sender
    }

    /// `true` for point-to-point, `false` for publish
    pub fn is_send(&self) -> bool {
        self.send
    }

    pub fn codec_name(&self) -> &str {
        self.codec.name()
    }

    /// The message body, decoding it on first access.
    pub fn body(&self) -> Result<Body, BusError> {
        let mut state = self.body.lock();
        if let BodyState::Raw(raw) = &*state {
            let body = self.codec.decode(raw)?;
            *state = BodyState::Decoded(body);
        }
        match &*state {
            BodyState::Decoded(body) => Ok(body.clone()),
            BodyState::Raw(_) => Err(BusError::IllegalState("body not decoded".to_string())),
        }
    }

    /// Failure carried by the body, if this is a failure reply.
    pub(crate) fn failure(&self) -> Result<Option<ReplyException>, BusError> {
        Ok(match self.body()? {
            Body::Failure(failure) => Some(failure),
            _ => None,
        })
    }

    /// Reply to the sender. Without a reply address this does nothing.
    pub fn reply(&self, bus: &EventBus, body: impl Into<Body>) -> Result<(), BusError> {
        self.reply_with_options(bus, body, DeliveryOptions::default())
    }

    pub fn reply_with_options(
        &self,
        bus: &EventBus,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        match self.reply_address.as_deref() {
            Some(reply_address) => {
                bus.send_reply(&self.sender, reply_address, body.into(), options, None)
            }
            None => Ok(()),
        }
    }

    /// Reply and expect a reply to the reply.
    pub fn reply_with_handler<F>(
        &self,
        bus: &EventBus,
        body: impl Into<Body>,
        options: DeliveryOptions,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        match self.reply_address.as_deref() {
            Some(reply_address) => bus.send_reply(
                &self.sender,
                reply_address,
                body.into(),
                options,
                Some(Box::new(handler)),
            ),
            None => Ok(()),
        }
    }

    /// Signal failure to the sender; it receives a `RECIPIENT_FAILURE` with this code and message.
    pub fn fail(
        &self,
        bus: &EventBus,
        failure_code: i32,
        message: impl Into<String>,
    ) -> Result<(), BusError> {
        self.reply(
            bus,
            Body::Failure(ReplyException::recipient_failure(failure_code, message)),
        )
    }
}

impl Debug for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("address", &self.address)
            .field("reply_address", &self.reply_address)
            .field("sender", &self.sender)
            .field("send", &self.send)
            .field("codec", &self.codec.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::{BufMut, BytesMut};

    use super::*;
    use crate::codec::{CodecRegistry, SystemCodec};
    use crate::wire::decode_from_wire;

    struct CountingCodec {
        decodes: Arc<AtomicUsize>,
    }

    impl MessageCodec for CountingCodec {
        fn name(&self) -> &str {
            "counting"
        }

        fn encode(&self, body: &Body, buf: &mut BytesMut) -> Result<(), BusError> {
            buf.put_i32(body.as_int().unwrap_or_default());
            Ok(())
        }

        fn decode(&self, buf: &[u8]) -> Result<Body, BusError> {
            self.decodes.fetch_add(1, Ordering::SeqCst);
            SystemCodec::Int.decode(buf)
        }
    }

    #[test]
    fn test_body_decoded_once() {
        let decodes = Arc::new(AtomicUsize::new(0));
        let codec = Arc::new(CountingCodec {
            decodes: decodes.clone(),
        });
        let codecs = CodecRegistry::new();
        codecs.register(codec.clone()).unwrap();

        let envelope = MessageEnvelope::new(
            NodeId::new("h", 1),
            "numbers",
            None,
            true,
            codec,
            Body::Int(41),
        );
        let frame = envelope.encode_to_wire().unwrap();
        let message = decode_from_wire(frame, &codecs).unwrap().to_message();

        assert_eq!(decodes.load(Ordering::SeqCst), 0);
        assert_eq!(message.body().unwrap(), Body::Int(41));
        assert_eq!(message.body().unwrap(), Body::Int(41));
        assert_eq!(decodes.load(Ordering::SeqCst), 1);
        assert_eq!(message.codec_name(), "counting");
    }

    #[test]
    fn test_failure_body() {
        let envelope = MessageEnvelope::new(
            NodeId::new("h", 1),
            "r",
            None,
            true,
            Arc::new(SystemCodec::ReplyException),
            Body::Failure(ReplyException::recipient_failure(5, "boom")),
        );
        let message = envelope.to_message();
        let failure = message.failure().unwrap().unwrap();
        assert_eq!(failure.failure_code, 5);
        assert!(!message.address().is_empty());
        assert!(message.reply_address().is_none());
    }
}
