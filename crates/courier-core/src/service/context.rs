// Execution contexts: serial task queues that handlers are bound to

use std::fmt::{Display, Formatter};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error};

tokio::task_local! {
    static CURRENT_CONTEXT: Context;
}

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextKind {
    /// Tasks run inline on a runtime worker, one at a time
    EventLoop,
    /// Tasks run one at a time on the blocking pool
    Worker,
}

impl Display for ContextKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextKind::EventLoop => write!(f, "event-loop"),
            ContextKind::Worker => write!(f, "worker"),
        }
    }
}

struct ContextInner {
    id: u64,
    kind: ContextKind,
    tx: mpsc::UnboundedSender<Task>,
}

/// A serial executor
///
/// Tasks submitted to one context run in submission order and never
/// concurrently with each other. While a task runs, [`Context::current`]
/// returns its context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl Context {
    pub fn event_loop(handle: &Handle) -> Self {
        Self::spawn(handle, ContextKind::EventLoop)
    }

    pub fn worker(handle: &Handle) -> Self {
        Self::spawn(handle, ContextKind::Worker)
    }

    fn spawn(handle: &Handle, kind: ContextKind) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        let inner = Arc::new(ContextInner {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            tx,
        });
        let weak: Weak<ContextInner> = Arc::downgrade(&inner);
        let id = inner.id;

        handle.spawn(async move {
            while let Some(task) = rx.recv().await {
                let context = weak.upgrade().map(|inner| Context { inner });
                match kind {
                    ContextKind::EventLoop => run_in(context, task),
                    ContextKind::Worker => {
                        let joined =
                            tokio::task::spawn_blocking(move || run_in(context, task)).await;
                        if let Err(e) = joined {
                            error!(context_id = id, "Worker task failed to run: {}", e);
                        }
                    }
                }
            }
            debug!(context_id = id, kind = %kind, "Context drained and stopped");
        });

        Context { inner }
    }

    /// The context running the current task, if any.
    pub fn current() -> Option<Context> {
        CURRENT_CONTEXT.try_with(|context| context.clone()).ok()
    }

    /// Queue a task on this context.
    pub fn run<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.inner.tx.send(Box::new(task)).is_err() {
            debug!(
                context_id = self.inner.id,
                "Context stopped, dropping task"
            );
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn kind(&self) -> ContextKind {
        self.inner.kind
    }

    pub fn same_as(&self, other: &Context) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .finish()
    }
}

fn run_in(context: Option<Context>, task: Task) {
    let context_id = context.as_ref().map(Context::id);
    let outcome = match context {
        Some(context) => CURRENT_CONTEXT.sync_scope(context, || catch_unwind(AssertUnwindSafe(task))),
        None => catch_unwind(AssertUnwindSafe(task)),
    };
    if let Err(panic) = outcome {
        let reason = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!(context_id, "Handler panicked: {}", reason);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_tasks_run_in_order() {
        let context = Context::event_loop(&Handle::current());
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..100 {
            let tx = tx.clone();
            context.run(move || {
                let _ = tx.send(i);
            });
        }
        for expected in 0..100 {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(got, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_current_context_inside_task() {
        assert!(Context::current().is_none());

        for context in [
            Context::event_loop(&Handle::current()),
            Context::worker(&Handle::current()),
        ] {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let expected = context.clone();
            context.run(move || {
                let current = Context::current().unwrap();
                let _ = tx.send((current.same_as(&expected), current.kind()));
            });
            let (same, kind) = tokio::time::timeout(Duration::from_secs(5), rx)
                .await
                .unwrap()
                .unwrap();
            assert!(same);
            assert_eq!(kind, context.kind());
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_panicking_task_does_not_stop_context() {
        let context = Context::event_loop(&Handle::current());
        context.run(|| panic!("boom"));
        let (tx, rx) = tokio::sync::oneshot::channel();
        context.run(move || {
            let _ = tx.send(());
        });
        tokio::time::timeout(Duration::from_secs(5), rx)
            .await
            .unwrap()
            .unwrap();
    }
}
