//! Per-request ambient context (trace ids, request metadata) carried through
//! the task. Frames are task-local and scoped to one carrier, so two
//! containers on the same task never observe each other's values, and frames
//! never cross container boundaries.

use std::{
    cell::RefCell,
    collections::BTreeMap,
    future::Future,
    sync::atomic::{
        AtomicU64,
        Ordering,
    },
};

use crate::{
    errors::ContextError,
    event::EventValue,
};

/// Keys the request middleware populates.
pub mod keys {
    pub const TRACE_ID: &str = "trace_id";
    pub const SPAN_ID: &str = "span_id";
    pub const REQUEST_BYTES: &str = "req_bytes";
    pub const RESPONSE_BYTES: &str = "res_bytes";
    pub const STATUS_CODE: &str = "status_code";
    pub const LATENCY_MS: &str = "latency_ms";
    pub const METHOD: &str = "method";
    pub const PATH: &str = "path";
    pub const CLIENT_IP: &str = "client_ip";
    pub const USER_AGENT: &str = "user_agent";
}

pub type ContextFrame = BTreeMap<String, EventValue>;

#[derive(Clone)]
struct ScopedFrame {
    carrier: u64,
    values: ContextFrame,
}

tokio::task_local! {
    static ACTIVE_FRAMES: RefCell<Vec<ScopedFrame>>;
}

static NEXT_CARRIER_ID: AtomicU64 = AtomicU64::new(0);

/// Task-local context for one container. Cheap to clone; all clones address
/// the same carrier.
#[derive(Clone, Debug)]
pub struct ContextCarrier {
    id: u64,
}

impl ContextCarrier {
    pub fn new() -> Self {
        Self {
            id: NEXT_CARRIER_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Run `fut` with `frame` bound. This is the middleware entry point:
    /// nested scopes stack, and the inner frame wins on key conflicts.
    pub async fn scope<F: Future>(&self, frame: ContextFrame, fut: F) -> F::Output {
        let mut stack = current_stack();
        stack.push(ScopedFrame {
            carrier: self.id,
            values: frame,
        });
        ACTIVE_FRAMES.scope(RefCell::new(stack), fut).await
    }

    /// Wrap a future so a spawned child task inherits the caller's frames.
    /// Frames for other carriers are carried too; they stay invisible to
    /// this carrier's readers either way.
    pub fn propagate<F: Future>(&self, fut: F) -> impl Future<Output = F::Output> + use<F> {
        let stack = current_stack();
        ACTIVE_FRAMES.scope(RefCell::new(stack), fut)
    }

    /// Push additional values onto the current scope. The returned token
    /// restores the previous state when dropped (or via `restore`). Binds
    /// nest LIFO. Outside any scope this is a recorded no-op.
    pub fn bind(&self, values: ContextFrame) -> BindToken {
        let carrier = self.id;
        let depth = ACTIVE_FRAMES
            .try_with(|frames| {
                let mut stack = frames.borrow_mut();
                stack.push(ScopedFrame { carrier, values });
                stack.len() - 1
            })
            .ok();
        if depth.is_none() {
            let err = ContextError {
                operation: "bind",
                reason: "no active context scope on this task".to_string(),
            };
            tracing::debug!("{err}");
        }
        BindToken { depth }
    }

    /// The innermost value for `key` within this carrier's frames.
    pub fn get(&self, key: &str) -> Option<EventValue> {
        ACTIVE_FRAMES
            .try_with(|frames| {
                frames
                    .borrow()
                    .iter()
                    .rev()
                    .filter(|frame| frame.carrier == self.id)
                    .find_map(|frame| frame.values.get(key).cloned())
            })
            .ok()
            .flatten()
    }

    /// Merged view of this carrier's frames, outermost first so inner binds
    /// win. Enrichers read this.
    pub fn snapshot(&self) -> ContextFrame {
        ACTIVE_FRAMES
            .try_with(|frames| {
                let mut merged = ContextFrame::new();
                for frame in frames
                    .borrow()
                    .iter()
                    .filter(|frame| frame.carrier == self.id)
                {
                    for (key, value) in &frame.values {
                        merged.insert(key.clone(), value.clone());
                    }
                }
                merged
            })
            .unwrap_or_default()
    }
}

fn current_stack() -> Vec<ScopedFrame> {
    ACTIVE_FRAMES
        .try_with(|frames| frames.borrow().clone())
        .unwrap_or_default()
}

/// Undoes a `bind` by truncating the frame stack back to where it was.
/// Dropping out of order truncates past later binds; binds are LIFO.
#[must_use = "dropping the token immediately undoes the bind"]
pub struct BindToken {
    depth: Option<usize>,
}

impl BindToken {
    pub fn restore(mut self) {
        self.apply();
    }

    fn apply(&mut self) {
        if let Some(depth) = self.depth.take() {
            let _ = ACTIVE_FRAMES.try_with(|frames| {
                let mut stack = frames.borrow_mut();
                if stack.len() > depth {
                    stack.truncate(depth);
                }
            });
        }
    }
}

impl Drop for BindToken {
    fn drop(&mut self) {
        self.apply();
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreemap;

    use super::{
        keys,
        ContextCarrier,
    };
    use crate::event::EventValue;

    #[tokio::test]
    async fn test_scope_and_get() {
        let carrier = ContextCarrier::new();
        let frame = btreemap! {
            keys::TRACE_ID.to_string() => EventValue::from("trace-1"),
        };
        carrier
            .scope(frame, async {
                assert_eq!(
                    carrier.get(keys::TRACE_ID),
                    Some(EventValue::from("trace-1"))
                );
                assert_eq!(carrier.get(keys::SPAN_ID), None);
            })
            .await;
        assert_eq!(carrier.get(keys::TRACE_ID), None);
    }

    #[tokio::test]
    async fn test_bind_restores_on_drop() {
        let carrier = ContextCarrier::new();
        carrier
            .scope(Default::default(), async {
                {
                    let _token = carrier.bind(btreemap! {
                        keys::SPAN_ID.to_string() => EventValue::from("span-inner"),
                    });
                    assert_eq!(
                        carrier.get(keys::SPAN_ID),
                        Some(EventValue::from("span-inner"))
                    );
                }
                assert_eq!(carrier.get(keys::SPAN_ID), None);
            })
            .await;
    }

    #[tokio::test]
    async fn test_nested_binds_shadow_and_merge() {
        let carrier = ContextCarrier::new();
        let outer = btreemap! {
            keys::TRACE_ID.to_string() => EventValue::from("outer"),
            keys::METHOD.to_string() => EventValue::from("GET"),
        };
        carrier
            .scope(outer, async {
                let _token = carrier.bind(btreemap! {
                    keys::TRACE_ID.to_string() => EventValue::from("inner"),
                });
                let snapshot = carrier.snapshot();
                assert_eq!(snapshot[keys::TRACE_ID], EventValue::from("inner"));
                assert_eq!(snapshot[keys::METHOD], EventValue::from("GET"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_carriers_are_disjoint() {
        let a = ContextCarrier::new();
        let b = ContextCarrier::new();
        a.scope(
            btreemap! { keys::TRACE_ID.to_string() => EventValue::from("a") },
            async {
                assert_eq!(a.get(keys::TRACE_ID), Some(EventValue::from("a")));
                assert_eq!(b.get(keys::TRACE_ID), None);
                assert!(b.snapshot().is_empty());
            },
        )
        .await;
    }

    #[tokio::test]
    async fn test_propagate_into_spawned_task() {
        let carrier = ContextCarrier::new();
        let frame = btreemap! { keys::TRACE_ID.to_string() => EventValue::from("t") };
        carrier
            .scope(frame, async {
                let child = carrier.clone();
                let handle = tokio::spawn(carrier.propagate(async move {
                    child.get(keys::TRACE_ID)
                }));
                assert_eq!(handle.await.unwrap(), Some(EventValue::from("t")));
            })
            .await;
    }

    #[tokio::test]
    async fn test_bind_outside_scope_is_noop() {
        let carrier = ContextCarrier::new();
        let token = carrier.bind(Default::default());
        token.restore();
        assert_eq!(carrier.get(keys::TRACE_ID), None);
    }
}
