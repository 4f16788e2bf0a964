// Local registration table: address -> live registrations, with a round-robin cursor

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::Handler;
use crate::message::Message;
use crate::service::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(pub u64);

impl Display for RegistrationId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One registration of a handler at an address
pub struct HandlerHolder {
    pub id: RegistrationId,
    pub address: String,
    pub handler: Arc<dyn Handler<Message>>,
    /// Context the handler runs on, captured at registration time
    pub context: Context,
    /// Never advertised to the cluster
    pub local_only: bool,
}

/// Outcome of removing a registration
pub struct Unregistered {
    pub holder: Arc<HandlerHolder>,
    /// The last advertised registration for the address is gone.
    pub withdraw: bool,
}

#[derive(Default)]
struct Handlers {
    list: Vec<Arc<HandlerHolder>>,
    cursor: AtomicUsize,
    advertised: usize,
}

/// Registrations of one bus, sharded by address
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: DashMap<String, Handlers>,
    index: DashMap<RegistrationId, String>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a registration.
    ///
    /// The returned flag is set when this is the first advertised registration
    /// for the address, so the node should be advertised to the cluster.
    pub fn register(
        &self,
        address: &str,
        handler: Arc<dyn Handler<Message>>,
        context: Context,
        local_only: bool,
    ) -> (RegistrationId, bool) {
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let holder = Arc::new(HandlerHolder {
            id,
            address: address.to_string(),
            handler,
            context,
            local_only,
        });

        let advertise = {
            let mut handlers = self.handlers.entry(address.to_string()).or_default();
            handlers.list.push(holder);
            if local_only {
                false
            } else {
                handlers.advertised += 1;
                handlers.advertised == 1
            }
        };
        self.index.insert(id, address.to_string());

        debug!(
            address = %address,
            registration_id = %id,
            local_only,
            "Registered handler at address '{}'",
            address
        );
        (id, advertise)
    }

    /// Remove a registration. Removing an unknown or already removed id returns `None`.
    pub fn unregister(&self, id: RegistrationId) -> Option<Unregistered> {
        let (_, address) = self.index.remove(&id)?;

        let Entry::Occupied(mut entry) = self.handlers.entry(address.clone()) else {
            return None;
        };
        let handlers = entry.get_mut();
        let position = handlers.list.iter().position(|h| h.id == id)?;
        let holder = handlers.list.remove(position);
        let withdraw = if holder.local_only {
            false
        } else {
            handlers.advertised -= 1;
            handlers.advertised == 0
        };
        if handlers.list.is_empty() {
            entry.remove();
        }

        debug!(
            address = %address,
            registration_id = %id,
            "Unregistered handler at address '{}'",
            address
        );
        Some(Unregistered { holder, withdraw })
    }

    /// Pick the next registration for a point-to-point send.
    pub fn choose(&self, address: &str) -> Option<Arc<HandlerHolder>> {
        let handlers = self.handlers.get(address)?;
        if handlers.list.is_empty() {
            return None;
        }
        let index = handlers.cursor.fetch_add(1, Ordering::Relaxed) % handlers.list.len();
        Some(handlers.list[index].clone())
    }

    /// Like [`choose`](Self::choose), skipping local-only registrations.
    pub fn choose_advertised(&self, address: &str) -> Option<Arc<HandlerHolder>> {
        let handlers = self.handlers.get(address)?;
        let advertised: Vec<&Arc<HandlerHolder>> =
            handlers.list.iter().filter(|h| !h.local_only).collect();
        if advertised.is_empty() {
            return None;
        }
        let index = handlers.cursor.fetch_add(1, Ordering::Relaxed) % advertised.len();
        Some(advertised[index].clone())
    }

    /// All registrations at an address, as of now.
    pub fn snapshot(&self, address: &str) -> Vec<Arc<HandlerHolder>> {
        self.handlers
            .get(address)
            .map(|handlers| handlers.list.clone())
            .unwrap_or_default()
    }

    /// Registrations at an address that other nodes may reach
    pub fn snapshot_advertised(&self, address: &str) -> Vec<Arc<HandlerHolder>> {
        self.handlers
            .get(address)
            .map(|handlers| {
                handlers
                    .list
                    .iter()
                    .filter(|h| !h.local_only)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_handlers(&self, address: &str) -> bool {
        self.handlers
            .get(address)
            .is_some_and(|handlers| !handlers.list.is_empty())
    }

    /// Whether the address has at least one registration other nodes may reach
    pub fn is_advertised(&self, address: &str) -> bool {
        self.handlers
            .get(address)
            .is_some_and(|handlers| handlers.advertised > 0)
    }

    /// Addresses with at least one advertised registration
    pub fn advertised_addresses(&self) -> Vec<String> {
        self.handlers
            .iter()
            .filter(|entry| entry.advertised > 0)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Remove every registration, returning them.
    pub fn drain(&self) -> Vec<Arc<HandlerHolder>> {
        let ids: Vec<RegistrationId> = self.index.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.unregister(id))
            .map(|removed| removed.holder)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use proptest::prelude::*;

    use super::*;

    fn noop() -> Arc<dyn Handler<Message>> {
        Arc::new(|_message: Message| {})
    }

    fn registry_with(
        runtime: &tokio::runtime::Runtime,
        address: &str,
        count: usize,
    ) -> (HandlerRegistry, Vec<RegistrationId>) {
        let registry = HandlerRegistry::new();
        let ids = (0..count)
            .map(|_| {
                let context = Context::event_loop(runtime.handle());
                registry.register(address, noop(), context, false).0
            })
            .collect();
        (registry, ids)
    }

    fn runtime() -> tokio::runtime::Runtime {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    #[test]
    fn test_advertise_transitions() {
        let rt = runtime();
        let registry = HandlerRegistry::new();
        let context = Context::event_loop(rt.handle());

        let (first, advertise) = registry.register("a", noop(), context.clone(), false);
        assert!(advertise);
        let (second, advertise) = registry.register("a", noop(), context.clone(), false);
        assert!(!advertise);
        let (local, advertise) = registry.register("a", noop(), context, true);
        assert!(!advertise);
        assert_eq!(registry.advertised_addresses(), vec!["a".to_string()]);
        assert!(registry.is_advertised("a"));

        assert!(!registry.unregister(first).unwrap().withdraw);
        assert!(!registry.unregister(local).unwrap().withdraw);
        assert!(registry.unregister(second).unwrap().withdraw);
        assert!(!registry.is_advertised("a"));
        assert!(!registry.has_handlers("a"));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_twice() {
        let rt = runtime();
        let (registry, ids) = registry_with(&rt, "a", 1);
        assert!(registry.unregister(ids[0]).is_some());
        assert!(registry.unregister(ids[0]).is_none());
        assert!(registry.unregister(RegistrationId(999)).is_none());
    }

    #[test]
    fn test_local_only_never_advertised() {
        let rt = runtime();
        let registry = HandlerRegistry::new();
        let (id, advertise) =
            registry.register("reply", noop(), Context::event_loop(rt.handle()), true);
        assert!(!advertise);
        assert!(registry.advertised_addresses().is_empty());
        assert!(!registry.is_advertised("reply"));
        assert!(registry.has_handlers("reply"));
        assert!(!registry.unregister(id).unwrap().withdraw);
    }

    #[test]
    fn test_advertised_views_skip_local_only() {
        let rt = runtime();
        let registry = HandlerRegistry::new();
        let (shared, _) =
            registry.register("a", noop(), Context::event_loop(rt.handle()), false);
        registry.register("a", noop(), Context::event_loop(rt.handle()), true);

        for _ in 0..4 {
            assert_eq!(registry.choose_advertised("a").unwrap().id, shared);
        }
        let advertised = registry.snapshot_advertised("a");
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0].id, shared);
        assert_eq!(registry.snapshot("a").len(), 2);

        registry.unregister(shared);
        assert!(registry.choose_advertised("a").is_none());
        assert!(registry.snapshot_advertised("a").is_empty());
        assert!(registry.choose("a").is_some());
    }

    #[test]
    fn test_snapshot_unaffected_by_later_changes() {
        let rt = runtime();
        let (registry, ids) = registry_with(&rt, "a", 3);
        let snapshot = registry.snapshot("a");
        registry.unregister(ids[0]);
        assert_eq!(snapshot.len(), 3);
        assert_eq!(registry.snapshot("a").len(), 2);
        assert!(registry.snapshot("other").is_empty());
    }

    #[test]
    fn test_drain() {
        let rt = runtime();
        let (registry, _) = registry_with(&rt, "a", 2);
        registry.register("b", noop(), Context::event_loop(rt.handle()), true);
        assert_eq!(registry.drain().len(), 3);
        assert!(registry.is_empty());
        assert!(registry.choose("a").is_none());
    }

    proptest! {
        #[test]
        fn test_round_robin_is_fair(handlers in 1usize..12, rounds in 1usize..20) {
            let rt = runtime();
            let (registry, _) = registry_with(&rt, "a", handlers);
            let mut counts: HashMap<RegistrationId, usize> = HashMap::new();
            for _ in 0..handlers * rounds {
                let chosen = registry.choose("a").unwrap();
                *counts.entry(chosen.id).or_default() += 1;
            }
            prop_assert_eq!(counts.len(), handlers);
            prop_assert!(counts.values().all(|count| *count == rounds));
        }
    }
}
