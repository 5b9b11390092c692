//! Resolution hooks for observing promise outcomes.
//!
//! A runtime context carries two handler registries:
//!
//! - `on_promise_resolved` — fired after *any* promise settles, with the
//!   type-erased outcome.
//! - `on_persist_message` — fired for message-valued outcomes, at most once
//!   per message instance no matter how many promises resolve to it. This is
//!   the seam where chat-history and storage integrations attach.
//!
//! Handlers are async, run as background tasks of the context that owns them,
//! and must not assume any ordering across messages.
//!
//! # Examples
//!
//! ```rust,no_run
//! use miniagents::{Hooks, PersistMessageEvent};
//!
//! let hooks = Hooks::new().add_on_persist_message(|event: PersistMessageEvent| async move {
//!     println!("persist {}", event.message.hash_key());
//! });
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::error::Error;
use crate::message::Message;
use crate::promise::ResolvedValue;

/// Event fired after a promise settles.
#[derive(Debug, Clone)]
pub struct PromiseResolvedEvent {
    /// The resolved value, when resolution succeeded
    pub value: Option<ResolvedValue>,
    /// The cached error, when resolution failed
    pub error: Option<Error>,
}

impl PromiseResolvedEvent {
    pub fn from_outcome(outcome: &Result<ResolvedValue, Error>) -> Self {
        match outcome {
            Ok(value) => Self {
                value: Some(value.clone()),
                error: None,
            },
            Err(error) => Self {
                value: None,
                error: Some(error.clone()),
            },
        }
    }
}

/// Event fired the first time a message instance is observed as a resolution.
#[derive(Debug, Clone)]
pub struct PersistMessageEvent {
    pub message: Message,
}

/// Type alias for promise-resolved handler functions
pub type PromiseResolvedHandler =
    Arc<dyn Fn(PromiseResolvedEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Type alias for persist-message handler functions
pub type PersistMessageHandler =
    Arc<dyn Fn(PersistMessageEvent) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Container for all hook types
#[derive(Clone, Default)]
pub struct Hooks {
    pub on_promise_resolved: Vec<PromiseResolvedHandler>,
    pub on_persist_message: Vec<PersistMessageHandler>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an on-promise-resolved hook
    pub fn add_on_promise_resolved<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PromiseResolvedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_promise_resolved
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    /// Add an on-persist-message hook
    pub fn add_on_persist_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PersistMessageEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.on_persist_message
            .push(Arc::new(move |event| Box::pin(handler(event))));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_promise_resolved.is_empty() && self.on_persist_message.is_empty()
    }
}

impl std::fmt::Debug for Hooks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hooks")
            .field(
                "on_promise_resolved",
                &format!("{} handlers", self.on_promise_resolved.len()),
            )
            .field(
                "on_persist_message",
                &format!("{} handlers", self.on_persist_message.len()),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_handlers_are_registered() {
        let hooks = Hooks::new()
            .add_on_promise_resolved(|_event| async move {})
            .add_on_persist_message(|_event| async move {});

        assert_eq!(hooks.on_promise_resolved.len(), 1);
        assert_eq!(hooks.on_persist_message.len(), 1);
        assert!(!hooks.is_empty());
    }

    #[tokio::test]
    async fn test_handler_invocation() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        let hooks = Hooks::new().add_on_promise_resolved(move |event| {
            let seen = seen.clone();
            async move {
                if event.error.is_none() {
                    seen.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        let event = PromiseResolvedEvent {
            value: Some(ResolvedValue::Unit),
            error: None,
        };
        (hooks.on_promise_resolved[0])(event).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
