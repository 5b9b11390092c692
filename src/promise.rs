//! Single-value promises with at-most-once resolution.
//!
//! A [`Promise`] either starts prefilled or carries a resolver closure. The
//! first consumer to await it runs the resolver under a single-entry lock;
//! everyone else — concurrent or years later — observes the exact same cached
//! outcome, success or error. With `start_soon` in effect a background task
//! begins resolution before any consumer shows up.
//!
//! Resolution outcomes are fanned out to the context's hooks as a
//! type-erased [`ResolvedValue`].

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::task::{Context, Poll};

use futures::future::BoxFuture;

use crate::error::{Error, Result};
use crate::frozen::Frozen;
use crate::message::Message;
use crate::runtime::PromisingContext;

/// Type-erased resolution payload delivered to `on_promise_resolved`
/// handlers.
#[derive(Debug, Clone)]
pub enum ResolvedValue {
    Unit,
    Text(String),
    Message(Message),
    Messages(Vec<Message>),
    Record(Frozen),
}

/// Resolution payloads a [`Promise`] can settle to.
///
/// The bound keeps outcomes cheap to replay (`Clone`) and lets the runtime
/// hand a uniform event to resolution hooks.
pub trait Resolvable: Clone + Send + Sync + 'static {
    fn as_resolved(&self) -> ResolvedValue;
}

impl Resolvable for () {
    fn as_resolved(&self) -> ResolvedValue {
        ResolvedValue::Unit
    }
}

impl Resolvable for String {
    fn as_resolved(&self) -> ResolvedValue {
        ResolvedValue::Text(self.clone())
    }
}

impl Resolvable for Message {
    fn as_resolved(&self) -> ResolvedValue {
        ResolvedValue::Message(self.clone())
    }
}

impl Resolvable for Vec<Message> {
    fn as_resolved(&self) -> ResolvedValue {
        ResolvedValue::Messages(self.clone())
    }
}

impl Resolvable for Frozen {
    fn as_resolved(&self) -> ResolvedValue {
        ResolvedValue::Record(self.clone())
    }
}

type Resolver<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T>> + Send>;

enum PromiseState<T> {
    Pending,
    Done(Result<T>),
}

thread_local! {
    /// Promises whose resolvers are live in the current poll stack. A
    /// resolver that awaits its own promise re-enters `resolve` from within
    /// this stack, which is how the anti-pattern is told apart from ordinary
    /// concurrent awaits on the same task.
    static RESOLVING_STACK: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

fn resolving_stack_contains(token: usize) -> bool {
    RESOLVING_STACK.with(|stack| stack.borrow().contains(&token))
}

/// Wraps a resolver future so the promise token is on the thread-local stack
/// exactly while the resolver is being polled.
struct InstrumentedResolver<T> {
    fut: BoxFuture<'static, Result<T>>,
    token: usize,
}

impl<T> Future for InstrumentedResolver<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        struct StackGuard;
        impl Drop for StackGuard {
            fn drop(&mut self) {
                RESOLVING_STACK.with(|stack| {
                    stack.borrow_mut().pop();
                });
            }
        }

        let this = self.get_mut();
        RESOLVING_STACK.with(|stack| stack.borrow_mut().push(this.token));
        let _guard = StackGuard;
        this.fut.as_mut().poll(cx)
    }
}

struct PromiseInner<T: Resolvable> {
    context: Arc<PromisingContext>,
    state: StdMutex<PromiseState<T>>,
    gate: tokio::sync::Mutex<Option<Resolver<T>>>,
}

/// A promise of a single value, resolvable at most once.
///
/// Cloning shares the underlying state: all clones resolve to the same
/// outcome and the resolver still runs only once.
pub struct Promise<T: Resolvable> {
    inner: Arc<PromiseInner<T>>,
}

impl<T: Resolvable> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Resolvable> Promise<T> {
    /// A promise whose result is already known. The resolved event still
    /// fires, on the next scheduling opportunity.
    pub fn prefilled(value: T) -> Result<Self> {
        let context = PromisingContext::current()?;
        let promise = Self {
            inner: Arc::new(PromiseInner {
                context: context.clone(),
                state: StdMutex::new(PromiseState::Done(Ok(value.clone()))),
                gate: tokio::sync::Mutex::new(None),
            }),
        };

        if context.any_hooks_registered() {
            let outcome: std::result::Result<ResolvedValue, Error> = Ok(value.as_resolved());
            let ctx = context.clone();
            context.start_soon(async move {
                ctx.emit_promise_resolved(&outcome);
                Ok(())
            });
        }

        Ok(promise)
    }

    /// A promise backed by a resolver, scheduled according to the context
    /// default.
    pub fn new<F, Fut>(resolver: F) -> Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self::with_options(resolver, None)
    }

    /// A promise backed by a resolver, with an explicit `start_soon`
    /// override.
    pub fn with_options<F, Fut>(resolver: F, start_soon: Option<bool>) -> Result<Self>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let context = PromisingContext::current()?;
        let start_soon = start_soon.unwrap_or_else(|| context.start_everything_soon_by_default());

        let promise = Self {
            inner: Arc::new(PromiseInner {
                context: context.clone(),
                state: StdMutex::new(PromiseState::Pending),
                gate: tokio::sync::Mutex::new(Some(Box::new(move || Box::pin(resolver())))),
            }),
        };

        if start_soon {
            let eager = promise.clone();
            context.start_soon(async move {
                let _ = eager.resolve().await;
                Ok(())
            });
        }

        Ok(promise)
    }

    /// Whether this promise has already settled.
    pub fn is_resolved(&self) -> bool {
        matches!(
            *self.inner.state.lock().expect("promise state poisoned"),
            PromiseState::Done(_)
        )
    }

    /// Await the resolved value.
    ///
    /// The first caller drives the resolver; later callers replay the cached
    /// outcome. A resolver that awaits its own promise is detected and fails
    /// fast instead of hanging, and a resolver whose task is dropped
    /// mid-flight leaves [`Error::Cancelled`] as the recorded outcome.
    pub async fn resolve(&self) -> Result<T> {
        let token = Arc::as_ptr(&self.inner) as usize;

        {
            let state = self.inner.state.lock().expect("promise state poisoned");
            if let PromiseState::Done(outcome) = &*state {
                return outcome.clone();
            }
        }
        if resolving_stack_contains(token) {
            return Err(Error::deadlock(
                "a resolver is awaiting the very promise it is resolving",
            ));
        }

        let mut gate = self.inner.gate.lock().await;

        {
            let state = self.inner.state.lock().expect("promise state poisoned");
            if let PromiseState::Done(outcome) = &*state {
                return outcome.clone();
            }
        }

        let resolver = gate
            .take()
            .ok_or_else(|| Error::other("promise has neither a result nor a resolver"))?;

        struct CancelGuard<T: Resolvable> {
            inner: Arc<PromiseInner<T>>,
            armed: bool,
        }

        impl<T: Resolvable> Drop for CancelGuard<T> {
            fn drop(&mut self) {
                if self.armed {
                    let mut state = self.inner.state.lock().expect("promise state poisoned");
                    *state = PromiseState::Done(Err(Error::Cancelled));
                }
            }
        }

        let mut guard = CancelGuard {
            inner: self.inner.clone(),
            armed: true,
        };

        let outcome = InstrumentedResolver {
            fut: resolver(),
            token,
        }
        .await;
        guard.armed = false;

        if let Err(err) = &outcome {
            tracing::debug!(error = %err, "a promise resolver failed");
        }

        {
            let mut state = self.inner.state.lock().expect("promise state poisoned");
            *state = PromiseState::Done(outcome.clone());
        }

        let resolved = match &outcome {
            Ok(value) => Ok(value.as_resolved()),
            Err(err) => Err(err.clone()),
        };
        self.inner.context.emit_promise_resolved(&resolved);

        drop(gate);
        outcome
    }
}

impl<T: Resolvable> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}
