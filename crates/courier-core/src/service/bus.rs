// Event bus: registration, send/publish, replies and cluster routing

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use courier_common::{BUS_FAILURE_CODE, BusError, ReplyException, validate_address};

use super::cluster::ClusterAdapter;
use super::cluster_manager::{ClusterManager, ClusterTransport, FrameSink, NodeListener};
use super::context::{Context, ContextKind};
use super::dispatcher::{DeliveryStats, Dispatcher};
use super::node_event::{LoggingNodeChangeListener, NodeChangeEvent, NodeChangeEventPublisher};
use super::reply::{ReplyHandler, ReplyManager, ReplyResult};
use crate::codec::{Body, CodecRegistry, MessageCodec};
use crate::handler::{Handler, HandlerRegistry, RegistrationId};
use crate::message::Message;
use crate::metrics;
use crate::model::{BusOptions, DeliveryOptions, NodeId};
use crate::wire::{MessageEnvelope, decode_from_wire};

const NODE_EVENT_QUEUE_SIZE: usize = 256;

/// Reply exchange riding along with an outgoing message
struct AwaitingReply {
    reply_address: String,
    timeout: Option<Duration>,
}

/// Where an outgoing message goes
enum Route {
    /// Resolve the address, locally or across the cluster
    Address,
    /// Straight to one node; used for replies
    Node(NodeId),
}

/// Cluster-side work, processed in order by one task per bus
enum ClusterCommand {
    /// Bring the subscription map in line with the registry for one address
    Reconcile(String),
    Route {
        envelope: MessageEnvelope,
        reply: Option<AwaitingReply>,
    },
    Direct {
        target: NodeId,
        envelope: MessageEnvelope,
        reply: Option<AwaitingReply>,
    },
    PurgeNode(NodeId),
    Flush(oneshot::Sender<()>),
}

struct ClusterLink {
    adapter: Arc<ClusterAdapter>,
    commands: mpsc::UnboundedSender<ClusterCommand>,
}

struct BusInner {
    node: NodeId,
    options: BusOptions,
    runtime: Handle,
    codecs: CodecRegistry,
    registry: Arc<HandlerRegistry>,
    dispatcher: Dispatcher,
    replies: Arc<ReplyManager>,
    events: Arc<NodeChangeEventPublisher>,
    cluster: Option<ClusterLink>,
    closed: AtomicBool,
}

/// Address-based message bus
///
/// Cloning is cheap; all clones share one bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

/// Handle that does not keep the bus alive
#[derive(Clone)]
pub struct WeakEventBus {
    inner: Weak<BusInner>,
}

impl WeakEventBus {
    pub fn upgrade(&self) -> Option<EventBus> {
        self.inner.upgrade().map(|inner| EventBus { inner })
    }
}

impl FrameSink for WeakEventBus {
    fn receive_frame(&self, frame: Bytes) {
        if let Some(bus) = self.upgrade() {
            bus.handle_frame(frame);
        }
    }
}

impl NodeListener for WeakEventBus {
    fn node_added(&self, node: &NodeId) {
        if let Some(bus) = self.upgrade()
            && let Some(link) = &bus.inner.cluster
        {
            link.adapter.node_added(node);
        }
    }

    fn node_left(&self, node: &NodeId) {
        if let Some(bus) = self.upgrade()
            && let Some(link) = &bus.inner.cluster
        {
            link.adapter.node_left(node);
            let _ = link.commands.send(ClusterCommand::PurgeNode(node.clone()));
        }
    }
}

impl EventBus {
    /// Create a bus local to this process. Must be called inside a tokio runtime.
    pub fn new(options: BusOptions) -> Result<Self, BusError> {
        let runtime = current_runtime()?;
        let node = options.node_id();
        let events = Arc::new(NodeChangeEventPublisher::new(NODE_EVENT_QUEUE_SIZE));
        let bus = Self::build(node, options, runtime, events, None);
        info!(node = %bus.inner.node, "Started local event bus");
        Ok(bus)
    }

    /// Create a bus and join it to a cluster.
    ///
    /// The node identity comes from the cluster manager.
    pub async fn clustered(
        options: BusOptions,
        manager: Arc<dyn ClusterManager>,
        transport: Arc<dyn ClusterTransport>,
    ) -> Result<Self, BusError> {
        let runtime = current_runtime()?;
        let node = manager.node_id();
        let events = Arc::new(NodeChangeEventPublisher::new(NODE_EVENT_QUEUE_SIZE));
        events.register_listener(Arc::new(LoggingNodeChangeListener));
        let adapter = Arc::new(ClusterAdapter::new(manager, transport, events.clone()));

        let (commands, rx) = mpsc::unbounded_channel();
        let link = ClusterLink {
            adapter: adapter.clone(),
            commands,
        };
        let bus = Self::build(node, options, runtime.clone(), events, Some(link));
        runtime.spawn(run_cluster_worker(bus.downgrade(), adapter.clone(), rx));

        let weak = Arc::new(bus.downgrade());
        if let Err(e) = adapter.join(weak.clone(), weak).await {
            bus.inner.closed.store(true, Ordering::SeqCst);
            return Err(e);
        }
        info!(node = %bus.inner.node, "Started clustered event bus");
        Ok(bus)
    }

    fn build(
        node: NodeId,
        options: BusOptions,
        runtime: Handle,
        events: Arc<NodeChangeEventPublisher>,
        cluster: Option<ClusterLink>,
    ) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let replies = ReplyManager::new(registry.clone(), runtime.clone());
        Self {
            inner: Arc::new(BusInner {
                node,
                options,
                runtime,
                codecs: CodecRegistry::new(),
                registry,
                dispatcher: Dispatcher::new(),
                replies,
                events,
                cluster,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakEventBus {
        WeakEventBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.inner.node
    }

    pub fn options(&self) -> &BusOptions {
        &self.inner.options
    }

    pub fn is_clustered(&self) -> bool {
        self.inner.cluster.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.inner.dispatcher.stats()
    }

    /// Number of reply exchanges still waiting
    pub fn pending_replies(&self) -> usize {
        self.inner.replies.pending_count()
    }

    /// Live cluster members as seen by this bus; just this node when local.
    pub fn cluster_nodes(&self) -> Vec<NodeId> {
        match &self.inner.cluster {
            Some(link) => link.adapter.live_nodes(),
            None => vec![self.inner.node.clone()],
        }
    }

    pub fn subscribe_node_events(&self) -> broadcast::Receiver<NodeChangeEvent> {
        self.inner.events.subscribe()
    }

    /// New execution context on this bus's runtime
    pub fn create_context(&self, kind: ContextKind) -> Context {
        match kind {
            ContextKind::EventLoop => Context::event_loop(&self.inner.runtime),
            ContextKind::Worker => Context::worker(&self.inner.runtime),
        }
    }

    fn current_or_new_context(&self) -> Context {
        Context::current().unwrap_or_else(|| Context::event_loop(&self.inner.runtime))
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }

    // ===================== Registration =====================

    /// Register a handler; it runs on the current context, or a new event loop
    /// context when called from outside one.
    pub fn register<H>(&self, address: &str, handler: H) -> Result<RegistrationId, BusError>
    where
        H: Handler<Message>,
    {
        self.register_with(address, Arc::new(handler), None, false)
    }

    /// Register a handler that is never advertised to the cluster.
    pub fn register_local<H>(&self, address: &str, handler: H) -> Result<RegistrationId, BusError>
    where
        H: Handler<Message>,
    {
        self.register_with(address, Arc::new(handler), None, true)
    }

    /// Register a handler bound to an explicit context.
    pub fn register_on<H>(
        &self,
        address: &str,
        handler: H,
        context: Context,
    ) -> Result<RegistrationId, BusError>
    where
        H: Handler<Message>,
    {
        self.register_with(address, Arc::new(handler), Some(context), false)
    }

    fn register_with(
        &self,
        address: &str,
        handler: Arc<dyn Handler<Message>>,
        context: Option<Context>,
        local_only: bool,
    ) -> Result<RegistrationId, BusError> {
        self.ensure_open()?;
        validate_address(address)?;

        let context = context.unwrap_or_else(|| self.current_or_new_context());
        let (id, advertise) = self
            .inner
            .registry
            .register(address, handler, context, local_only);
        metrics::set_registrations(self.inner.registry.len());

        if advertise && let Some(link) = &self.inner.cluster {
            let _ = link
                .commands
                .send(ClusterCommand::Reconcile(address.to_string()));
        }
        Ok(id)
    }

    /// Remove a registration. Returns `false` if it was already gone.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let Some(removed) = self.inner.registry.unregister(id) else {
            return false;
        };
        metrics::set_registrations(self.inner.registry.len());

        if removed.withdraw && let Some(link) = &self.inner.cluster {
            let _ = link
                .commands
                .send(ClusterCommand::Reconcile(removed.holder.address.clone()));
        }
        true
    }

    // ===================== Codecs =====================

    pub fn register_codec(&self, codec: Arc<dyn MessageCodec>) -> Result<(), BusError> {
        self.inner.codecs.register(codec)
    }

    pub fn unregister_codec(&self, name: &str) -> Result<(), BusError> {
        self.inner.codecs.unregister(name)
    }

    /// Register a codec used for every body of type `T` sent without a codec name.
    pub fn register_default_codec<T: std::any::Any>(
        &self,
        codec: Arc<dyn MessageCodec>,
    ) -> Result<(), BusError> {
        self.inner.codecs.register_default::<T>(codec)
    }

    pub fn unregister_default_codec<T: std::any::Any>(&self) -> Result<(), BusError> {
        self.inner.codecs.unregister_default::<T>()
    }

    // ===================== Sending =====================

    pub fn send(&self, address: &str, body: impl Into<Body>) -> Result<(), BusError> {
        self.send_with_options(address, body, DeliveryOptions::default())
    }

    pub fn send_with_options(
        &self,
        address: &str,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        self.send_internal(address, body.into(), options, true, None, Route::Address)
    }

    /// Send and expect a reply. The handler gets the reply, or the failure, on
    /// the context current at this call.
    pub fn send_with_reply<F>(
        &self,
        address: &str,
        body: impl Into<Body>,
        options: DeliveryOptions,
        handler: F,
    ) -> Result<(), BusError>
    where
        F: FnOnce(ReplyResult) + Send + 'static,
    {
        self.send_internal(
            address,
            body.into(),
            options,
            true,
            Some(Box::new(handler)),
            Route::Address,
        )
    }

    /// Send and wait for the reply.
    pub async fn request(
        &self,
        address: &str,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<Message, BusError> {
        let (tx, rx) = oneshot::channel();
        self.send_with_reply(address, body, options, move |result| {
            let _ = tx.send(result);
        })?;
        let result = rx.await.map_err(|_| BusError::Closed)?;
        Ok(result?)
    }

    pub fn publish(&self, address: &str, body: impl Into<Body>) -> Result<(), BusError> {
        self.publish_with_options(address, body, DeliveryOptions::default())
    }

    pub fn publish_with_options(
        &self,
        address: &str,
        body: impl Into<Body>,
        options: DeliveryOptions,
    ) -> Result<(), BusError> {
        self.send_internal(address, body.into(), options, false, None, Route::Address)
    }

    /// Send a reply to `reply_address`, which lives on `sender`.
    pub(crate) fn send_reply(
        &self,
        sender: &NodeId,
        reply_address: &str,
        body: Body,
        options: DeliveryOptions,
        handler: Option<ReplyHandler>,
    ) -> Result<(), BusError> {
        let route = if *sender == self.inner.node || self.inner.cluster.is_none() {
            Route::Address
        } else {
            Route::Node(sender.clone())
        };
        self.send_internal(reply_address, body, options, true, handler, route)
    }

    fn send_internal(
        &self,
        address: &str,
        body: Body,
        options: DeliveryOptions,
        send: bool,
        handler: Option<ReplyHandler>,
        route: Route,
    ) -> Result<(), BusError> {
        self.ensure_open()?;
        validate_address(address)?;
        let codec = self
            .inner
            .codecs
            .lookup_for_send(&body, options.codec_name.as_deref())?;
        metrics::record_send(send);

        let reply = handler.map(|handler| {
            let context = self.current_or_new_context();
            AwaitingReply {
                reply_address: self.inner.replies.create(address, handler, context),
                timeout: self.inner.options.effective_timeout(&options),
            }
        });
        let envelope = MessageEnvelope::new(
            self.inner.node.clone(),
            address,
            reply.as_ref().map(|r| r.reply_address.clone()),
            send,
            codec,
            body,
        );

        let command = match (&self.inner.cluster, route) {
            (Some(_), Route::Address) if !is_local_reply_address(address) => {
                ClusterCommand::Route { envelope, reply }
            }
            (Some(_), Route::Node(target)) => ClusterCommand::Direct {
                target,
                envelope,
                reply,
            },
            _ => {
                let delivered = self
                    .inner
                    .dispatcher
                    .deliver(&self.inner.registry, &envelope);
                self.settle(&envelope.address, reply, delivered);
                return Ok(());
            }
        };

        let Some(link) = &self.inner.cluster else {
            return Err(BusError::IllegalState("bus is not clustered".to_string()));
        };
        if let Err(mpsc::error::SendError(command)) = link.commands.send(command) {
            if let ClusterCommand::Route {
                reply: Some(reply), ..
            }
            | ClusterCommand::Direct {
                reply: Some(reply), ..
            } = command
            {
                self.inner.replies.discard(&reply.reply_address);
            }
            return Err(BusError::Closed);
        }
        Ok(())
    }

    /// Finish the sending side of an exchange once the recipient count is known.
    fn settle(&self, address: &str, reply: Option<AwaitingReply>, delivered: usize) {
        match reply {
            Some(reply) if delivered == 0 => {
                self.inner
                    .replies
                    .fail(&reply.reply_address, ReplyException::no_handlers(address));
            }
            Some(reply) => self.inner.replies.arm_timer(&reply.reply_address, reply.timeout),
            None if delivered == 0 => {
                debug!(address = %address, "No handlers for address, message dropped");
            }
            None => {}
        }
    }

    fn fail_transmission(&self, reply: Option<AwaitingReply>, address: &str, error: &BusError) {
        let Some(reply) = reply else {
            return;
        };
        let failure = match error {
            BusError::NetworkError(_) | BusError::Cluster(_) => ReplyException::no_handlers(address),
            other => ReplyException::recipient_failure(BUS_FAILURE_CODE, other.to_string()),
        };
        self.inner.replies.fail(&reply.reply_address, failure);
    }

    // ===================== Cluster side =====================

    async fn route(
        &self,
        adapter: &ClusterAdapter,
        envelope: MessageEnvelope,
        reply: Option<AwaitingReply>,
    ) {
        let address = envelope.address.clone();
        let has_local = self.inner.registry.has_handlers(&address);
        let subscribers = match adapter.subscribers(&address).await {
            Ok(subscribers) => subscribers,
            Err(e) => {
                warn!(address = %address, "Subscription lookup failed: {}", e);
                Vec::new()
            }
        };

        if envelope.send {
            let candidates = adapter.candidates(&subscribers, has_local);
            match adapter.choose(&address, &candidates) {
                Some(target) if target == self.inner.node => {
                    let delivered = self
                        .inner
                        .dispatcher
                        .deliver(&self.inner.registry, &envelope);
                    self.settle(&address, reply, delivered);
                }
                Some(target) => self.transmit(adapter, &target, &envelope, reply).await,
                None => self.settle(&address, reply, 0),
            }
            return;
        }

        let mut delivered = if has_local {
            self.inner
                .dispatcher
                .deliver(&self.inner.registry, &envelope)
        } else {
            0
        };
        let targets = adapter.publish_targets(&subscribers);
        if !targets.is_empty() {
            match envelope.encode_within(self.inner.options.max_frame_size) {
                Ok(frame) => {
                    for target in targets {
                        match adapter.transmit(&target, frame.clone()).await {
                            Ok(()) => delivered += 1,
                            Err(e) => warn!(
                                address = %address,
                                node = %target,
                                "Failed to publish to node: {}", e
                            ),
                        }
                    }
                }
                Err(e) => warn!(address = %address, "Failed to encode message: {}", e),
            }
        }
        self.settle(&address, reply, delivered);
    }

    async fn transmit(
        &self,
        adapter: &ClusterAdapter,
        target: &NodeId,
        envelope: &MessageEnvelope,
        reply: Option<AwaitingReply>,
    ) {
        let result = match envelope.encode_within(self.inner.options.max_frame_size) {
            Ok(frame) => adapter.transmit(target, frame).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => self.settle(&envelope.address, reply, 1),
            Err(e) => {
                warn!(
                    address = %envelope.address,
                    node = %target,
                    "Failed to send message to node: {}", e
                );
                metrics::record_dropped("transmit_failed");
                self.fail_transmission(reply, &envelope.address, &e);
            }
        }
    }

    /// Accept one frame from another node.
    pub fn handle_frame(&self, frame: Bytes) {
        metrics::record_frame_received();
        if self.is_closed() {
            metrics::record_dropped("closed");
            return;
        }
        match decode_from_wire(frame, &self.inner.codecs) {
            Ok(envelope) => {
                let dispatcher = &self.inner.dispatcher;
                let delivered = if is_local_reply_address(&envelope.address) {
                    dispatcher.deliver(&self.inner.registry, &envelope)
                } else {
                    dispatcher.deliver_advertised(&self.inner.registry, &envelope)
                };
                if delivered == 0 {
                    debug!(
                        address = %envelope.address,
                        sender = %envelope.sender,
                        "No handlers for address, remote message dropped"
                    );
                }
            }
            Err(e) => {
                warn!("Dropping undecodable frame: {}", e);
                metrics::record_dropped("malformed");
            }
        }
    }

    // ===================== Lifecycle =====================

    /// Wait until all cluster work queued so far has been processed.
    pub async fn flush(&self) {
        if let Some(link) = &self.inner.cluster {
            let (tx, rx) = oneshot::channel();
            if link.commands.send(ClusterCommand::Flush(tx)).is_ok() {
                let _ = rx.await;
            }
        }
    }

    /// Close the bus: withdraw advertisements, drop pending replies and
    /// registrations, leave the cluster and clear user codecs.
    pub async fn close(&self) -> Result<(), BusError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.flush().await;

        let dropped = self.inner.replies.clear();
        let advertised = self.inner.registry.advertised_addresses();
        let removed = self.inner.registry.drain();
        metrics::set_registrations(0);

        let mut result = Ok(());
        if let Some(link) = &self.inner.cluster {
            for address in &advertised {
                if let Err(e) = link.adapter.withdraw(address).await {
                    warn!(address = %address, "Failed to withdraw address: {}", e);
                }
            }
            result = link.adapter.leave().await;
        }
        self.inner.codecs.clear();

        info!(
            node = %self.inner.node,
            registrations = removed.len(),
            pending_replies = dropped,
            "Closed event bus"
        );
        result
    }
}

fn current_runtime() -> Result<Handle, BusError> {
    Handle::try_current().map_err(|_| {
        BusError::IllegalState("the event bus must be created inside a tokio runtime".to_string())
    })
}

/// Reply addresses only exist on the node that created them.
fn is_local_reply_address(address: &str) -> bool {
    address.starts_with(courier_common::REPLY_ADDRESS_PREFIX)
}

async fn run_cluster_worker(
    bus: WeakEventBus,
    adapter: Arc<ClusterAdapter>,
    mut commands: mpsc::UnboundedReceiver<ClusterCommand>,
) {
    while let Some(command) = commands.recv().await {
        let Some(bus) = bus.upgrade() else {
            break;
        };
        match command {
            ClusterCommand::Reconcile(address) => {
                // Transitions can be queued out of order; the registry holds the truth.
                if bus.inner.registry.is_advertised(&address) {
                    if let Err(e) = adapter.advertise(&address).await {
                        warn!(address = %address, "Failed to advertise address: {}", e);
                    }
                } else if let Err(e) = adapter.withdraw(&address).await {
                    warn!(address = %address, "Failed to withdraw address: {}", e);
                }
            }
            ClusterCommand::Route { envelope, reply } => {
                bus.route(&adapter, envelope, reply).await;
            }
            ClusterCommand::Direct {
                target,
                envelope,
                reply,
            } => {
                bus.transmit(&adapter, &target, &envelope, reply).await;
            }
            ClusterCommand::PurgeNode(node) => adapter.purge(&node).await,
            ClusterCommand::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!(node = %adapter.node_id(), "Cluster worker stopped");
}
