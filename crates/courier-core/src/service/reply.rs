// Reply correlation: one-shot reply addresses, timers and failure delivery

use std::fmt::{Display, Formatter};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::debug;
use uuid::Uuid;

use courier_common::{BUS_FAILURE_CODE, REPLY_ADDRESS_PREFIX, ReplyException, ReplyFailure};

use crate::handler::{Handler, HandlerRegistry, RegistrationId};
use crate::message::Message;
use crate::metrics;
use crate::service::context::Context;

/// Outcome delivered to a reply handler
pub type ReplyResult = Result<Message, ReplyException>;

pub type ReplyHandler = Box<dyn FnOnce(ReplyResult) + Send + 'static>;

/// State of a reply exchange; everything but `Waiting` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyState {
    Waiting,
    Replied,
    TimedOut,
    Failed,
}

impl Display for ReplyState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplyState::Waiting => write!(f, "WAITING"),
            ReplyState::Replied => write!(f, "REPLIED"),
            ReplyState::TimedOut => write!(f, "TIMED_OUT"),
            ReplyState::Failed => write!(f, "FAILED"),
        }
    }
}

struct PendingReply {
    target: String,
    handler: Mutex<ReplyHandler>,
    context: Context,
    registration: RegistrationId,
    timer: Option<AbortHandle>,
}

/// Handler registered at an ephemeral reply address
struct ReplyReceiver {
    manager: Weak<ReplyManager>,
    reply_address: String,
}

impl Handler<Message> for ReplyReceiver {
    fn handle(&self, message: Message) {
        if let Some(manager) = self.manager.upgrade() {
            manager.on_reply(&self.reply_address, message);
        }
    }
}

/// Outstanding request/reply exchanges of one bus
pub struct ReplyManager {
    pending: DashMap<String, PendingReply>,
    registry: Arc<HandlerRegistry>,
    runtime: Handle,
}

impl ReplyManager {
    pub fn new(registry: Arc<HandlerRegistry>, runtime: Handle) -> Arc<Self> {
        Arc::new(Self {
            pending: DashMap::new(),
            registry,
            runtime,
        })
    }

    /// Start an exchange for a send to `target`.
    ///
    /// Registers a local-only receiver on `context` and returns the fresh reply
    /// address to embed in the outgoing message.
    pub fn create(self: &Arc<Self>, target: &str, handler: ReplyHandler, context: Context) -> String {
        let reply_address = format!("{REPLY_ADDRESS_PREFIX}{}", Uuid::new_v4());
        let receiver = Arc::new(ReplyReceiver {
            manager: Arc::downgrade(self),
            reply_address: reply_address.clone(),
        });
        let (registration, _) =
            self.registry
                .register(&reply_address, receiver, context.clone(), true);

        self.pending.insert(
            reply_address.clone(),
            PendingReply {
                target: target.to_string(),
                handler: Mutex::new(handler),
                context,
                registration,
                timer: None,
            },
        );
        metrics::set_pending_replies(self.pending.len());
        debug!(
            address = %target,
            reply_address = %reply_address,
            state = %ReplyState::Waiting,
            "Awaiting reply"
        );
        reply_address
    }

    /// Start the timeout of a waiting exchange. `None` waits forever.
    pub fn arm_timer(self: &Arc<Self>, reply_address: &str, timeout: Option<Duration>) {
        let Some(timeout) = timeout else {
            return;
        };
        if let Some(mut pending) = self.pending.get_mut(reply_address) {
            let manager = Arc::downgrade(self);
            let address = reply_address.to_string();
            let timer = self.runtime.spawn(async move {
                tokio::time::sleep(timeout).await;
                if let Some(manager) = manager.upgrade() {
                    manager.time_out(&address, timeout);
                }
            });
            pending.timer = Some(timer.abort_handle());
        }
    }

    /// Terminate an exchange; only the first caller gets the entry.
    fn take(&self, reply_address: &str, state: ReplyState) -> Option<PendingReply> {
        let (_, pending) = self.pending.remove(reply_address)?;
        if let Some(timer) = &pending.timer {
            timer.abort();
        }
        self.registry.unregister(pending.registration);

        metrics::set_pending_replies(self.pending.len());
        debug!(
            address = %pending.target,
            reply_address = %reply_address,
            state = %state,
            "Reply exchange finished"
        );
        Some(pending)
    }

    /// A message arrived at the reply address; runs on the caller's context.
    fn on_reply(&self, reply_address: &str, message: Message) {
        let result = match message.failure() {
            Ok(None) => Ok(message),
            Ok(Some(failure)) => Err(failure),
            Err(e) => Err(ReplyException::recipient_failure(
                BUS_FAILURE_CODE,
                e.to_string(),
            )),
        };
        let state = match &result {
            Ok(_) => ReplyState::Replied,
            Err(_) => ReplyState::Failed,
        };

        match self.take(reply_address, state) {
            Some(pending) => {
                metrics::record_reply_outcome(result.as_ref().err().map(|e| e.failure_type));
                let handler = pending.handler.into_inner();
                handler(result);
            }
            None => debug!(
                reply_address = %reply_address,
                "Dropping reply for a finished exchange"
            ),
        }
    }

    fn time_out(&self, reply_address: &str, timeout: Duration) {
        if let Some(pending) = self.take(reply_address, ReplyState::TimedOut) {
            let failure = ReplyException::timeout(&pending.target, timeout.as_millis() as u64);
            metrics::record_reply_outcome(Some(ReplyFailure::Timeout));
            let handler = pending.handler.into_inner();
            pending.context.run(move || handler(Err(failure)));
        }
    }

    /// Fail a waiting exchange, e.g. with `NO_HANDLERS`. Returns `false` if it already finished.
    pub fn fail(&self, reply_address: &str, failure: ReplyException) -> bool {
        match self.take(reply_address, ReplyState::Failed) {
            Some(pending) => {
                metrics::record_reply_outcome(Some(failure.failure_type));
                let handler = pending.handler.into_inner();
                pending.context.run(move || handler(Err(failure)));
                true
            }
            None => false,
        }
    }

    /// Drop an exchange whose message never left this node.
    pub fn discard(&self, reply_address: &str) -> bool {
        self.take(reply_address, ReplyState::Failed).is_some()
    }

    pub fn is_pending(&self, reply_address: &str) -> bool {
        self.pending.contains_key(reply_address)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Drop every waiting exchange without notifying its handler.
    pub fn clear(&self) -> usize {
        let addresses: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        addresses
            .iter()
            .filter(|address| self.take(address, ReplyState::Failed).is_some())
            .count()
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::oneshot;

    use super::*;

    fn manager() -> (Arc<ReplyManager>, Arc<HandlerRegistry>) {
        let registry = Arc::new(HandlerRegistry::new());
        (
            ReplyManager::new(registry.clone(), Handle::current()),
            registry,
        )
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_unregisters_reply_address() {
        let (manager, registry) = manager();
        let (tx, rx) = oneshot::channel();
        let address = manager.create(
            "slow",
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            Context::event_loop(&Handle::current()),
        );
        assert!(address.starts_with(REPLY_ADDRESS_PREFIX));
        assert!(registry.has_handlers(&address));

        manager.arm_timer(&address, Some(Duration::from_millis(20)));
        let failure = tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();

        assert_eq!(failure.failure_type, ReplyFailure::Timeout);
        assert_eq!(failure.failure_code, BUS_FAILURE_CODE);
        assert!(!registry.has_handlers(&address));
        assert!(!manager.is_pending(&address));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_fail_is_first_wins() {
        let (manager, _) = manager();
        let (tx, rx) = oneshot::channel();
        let address = manager.create(
            "nobody",
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
            Context::event_loop(&Handle::current()),
        );

        assert!(manager.fail(&address, ReplyException::no_handlers("nobody")));
        assert!(!manager.fail(&address, ReplyException::no_handlers("nobody")));

        let failure = rx.await.unwrap().unwrap_err();
        assert_eq!(failure.failure_type, ReplyFailure::NoHandlers);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_clear_drops_pending() {
        let (manager, registry) = manager();
        for _ in 0..3 {
            let address = manager.create(
                "x",
                Box::new(|_| {}),
                Context::event_loop(&Handle::current()),
            );
            manager.arm_timer(&address, Some(Duration::from_secs(60)));
        }
        assert_eq!(manager.pending_count(), 3);
        assert_eq!(manager.clear(), 3);
        assert_eq!(manager.pending_count(), 0);
        assert!(registry.is_empty());
    }
}
