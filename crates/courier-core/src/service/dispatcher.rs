// Delivery dispatcher: hands messages to registrations on their own contexts

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::trace;

use crate::handler::{HandlerHolder, HandlerRegistry};
use crate::message::Message;
use crate::metrics;
use crate::wire::MessageEnvelope;

/// Delivery counters of one bus
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    /// Handler invocations scheduled
    pub delivered: u64,
    /// Messages that found no registration
    pub dropped: u64,
}

#[derive(Default)]
pub struct Dispatcher {
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an envelope to the local registrations at its address.
    ///
    /// A send goes to the next registration in round-robin order, a publish to
    /// every registration present now. Returns the number of recipients.
    pub fn deliver(&self, registry: &HandlerRegistry, envelope: &MessageEnvelope) -> usize {
        let recipients = if envelope.send {
            registry.choose(&envelope.address).into_iter().collect()
        } else {
            registry.snapshot(&envelope.address)
        };
        self.deliver_to(recipients, envelope)
    }

    /// Deliver an envelope that came from another node. Local-only
    /// registrations are not reachable this way.
    pub fn deliver_advertised(
        &self,
        registry: &HandlerRegistry,
        envelope: &MessageEnvelope,
    ) -> usize {
        let recipients = if envelope.send {
            registry.choose_advertised(&envelope.address).into_iter().collect()
        } else {
            registry.snapshot_advertised(&envelope.address)
        };
        self.deliver_to(recipients, envelope)
    }

    fn deliver_to(
        &self,
        recipients: Vec<Arc<HandlerHolder>>,
        envelope: &MessageEnvelope,
    ) -> usize {
        for holder in &recipients {
            self.dispatch(holder, envelope.to_message());
        }

        let count = recipients.len();
        if count == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            metrics::record_dropped("no_handlers");
        } else {
            metrics::record_delivered(count);
        }
        count
    }

    /// Schedule one handler invocation on the registration's context.
    pub fn dispatch(&self, holder: &Arc<HandlerHolder>, message: Message) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        trace!(
            address = %holder.address,
            registration_id = %holder.id,
            context_id = holder.context.id(),
            "Dispatching message"
        );
        let handler = holder.handler.clone();
        holder.context.run(move || handler.handle(message));
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}
