//! Message handlers and the per-address registration table

pub mod registry;

pub use registry::{HandlerHolder, HandlerRegistry, RegistrationId, Unregistered};

/// Single-method capability invoked for each delivered event
pub trait Handler<E>: Send + Sync + 'static {
    fn handle(&self, event: E);
}

impl<E, F> Handler<E> for F
where
    F: Fn(E) + Send + Sync + 'static,
{
    fn handle(&self, event: E) {
        self(event)
    }
}
