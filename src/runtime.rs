//! Runtime context and the `MiniAgents` entry point.
//!
//! A [`PromisingContext`] is the scoped home of everything the runtime does in
//! the background: it carries the global defaults, the registry of background
//! tasks spawned on its behalf, and the resolution hooks. The innermost
//! active context is reachable from any task through a task-local cell, and
//! every task spawned via [`PromisingContext::start_soon`] inherits it.
//!
//! [`MiniAgents`] is the user-facing wrapper: configure it with the builder,
//! then [`MiniAgents::run`] an entry future inside the activated context.
//! When the entry future finishes, the context is finalized — the background
//! registry is drained repeatedly (resolving a promise may spawn more tasks)
//! before `run` returns.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::Level;

use crate::agent::MiniAgent;
use crate::error::{Error, Result};
use crate::hooks::{Hooks, PersistMessageEvent, PromiseResolvedEvent};
use crate::promise::ResolvedValue;

tokio::task_local! {
    static CURRENT: Arc<PromisingContext>;
}

/// Completion handle for a background task started with `start_soon`.
///
/// Unlike a raw `JoinHandle`, awaiting it never propagates panics or abort
/// errors — it simply waits until the task is gone, which is what the
/// gather-before-end-marker logic of sequence merging needs.
pub struct TaskHandle {
    done: oneshot::Receiver<()>,
}

impl TaskHandle {
    /// Wait for the task to finish, succeed or not.
    pub async fn wait(self) {
        let _ = self.done.await;
    }
}

/// Scoped lifecycle for promises, streams and agents.
///
/// Contexts nest: a context built while another is active records it as its
/// parent, and resolution events fire handlers up the whole chain. A context
/// can be activated at most once; activating it a second time fails with
/// [`Error::ContextReentered`].
pub struct PromisingContext {
    start_everything_soon_by_default: bool,
    appenders_capture_errors_by_default: bool,
    longer_hash_keys: bool,
    errors_as_messages: bool,
    error_tracebacks_in_messages: bool,
    suppress_background_errors: bool,
    log_level_for_errors: Level,
    hooks: Hooks,
    llm_logger_agent: Option<MiniAgent>,
    parent: Option<Arc<PromisingContext>>,
    self_ref: Weak<PromisingContext>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    activated: AtomicBool,
    first_background_error: StdMutex<Option<Error>>,
}

impl PromisingContext {
    /// The innermost active context, or a usage error explaining how to get
    /// one.
    pub fn current() -> Result<Arc<PromisingContext>> {
        Self::try_current().ok_or_else(|| {
            Error::no_active_context(
                "no PromisingContext is active on this task; run your code through \
                 `MiniAgents::run(..)` (or spawn it with `start_soon`)",
            )
        })
    }

    /// The innermost active context, if any.
    pub fn try_current() -> Option<Arc<PromisingContext>> {
        CURRENT.try_with(|ctx| ctx.clone()).ok()
    }

    pub fn start_everything_soon_by_default(&self) -> bool {
        self.start_everything_soon_by_default
    }

    pub fn appenders_capture_errors_by_default(&self) -> bool {
        self.appenders_capture_errors_by_default
    }

    pub fn longer_hash_keys(&self) -> bool {
        self.longer_hash_keys
    }

    pub fn errors_as_messages(&self) -> bool {
        self.errors_as_messages
    }

    pub fn error_tracebacks_in_messages(&self) -> bool {
        self.error_tracebacks_in_messages
    }

    /// Agent slot consulted by LLM I/O integrations for prompt/response
    /// logging. The core only stores it.
    pub fn llm_logger_agent(&self) -> Option<&MiniAgent> {
        self.llm_logger_agent.as_ref()
    }

    fn arc(&self) -> Arc<PromisingContext> {
        self.self_ref
            .upgrade()
            .expect("context is owned by an Arc for its whole lifetime")
    }

    /// Whether any resolution hook is registered on this context or an
    /// ancestor. Lets hot paths skip scheduling empty event fan-outs.
    pub(crate) fn any_hooks_registered(&self) -> bool {
        let mut chain = Some(self.arc());
        while let Some(ctx) = chain {
            if !ctx.hooks.is_empty() {
                return true;
            }
            chain = ctx.parent.clone();
        }
        false
    }

    /// Spawn a future as a background task of this context.
    ///
    /// The task inherits this context as its current one. Failures are logged
    /// at the configured level and suppressed so one agent's crash does not
    /// take down unrelated agents; with suppression off, the first failure is
    /// surfaced when the context finalizes.
    pub fn start_soon<F>(&self, fut: F) -> TaskHandle
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let ctx = self.arc();
        let level = self.log_level_for_errors;
        let suppress = self.suppress_background_errors;
        let (done_tx, done_rx) = oneshot::channel();

        let handle = tokio::spawn(CURRENT.scope(self.arc(), async move {
            if let Err(err) = fut.await {
                log_at(level, &err);
                if !suppress {
                    let mut slot = ctx
                        .first_background_error
                        .lock()
                        .expect("background error slot poisoned");
                    if slot.is_none() {
                        *slot = Some(err);
                    }
                }
            }
            let _ = done_tx.send(());
        }));

        let mut tasks = self.tasks.lock().expect("task registry poisoned");
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);

        TaskHandle { done: done_rx }
    }

    /// Wait for a set of background tasks, tolerating cancellation.
    pub async fn gather(&self, handles: Vec<TaskHandle>) {
        for handle in handles {
            handle.wait().await;
        }
    }

    /// Wait until every background task registered so far has finished,
    /// repeatedly: a draining task may itself spawn new tasks.
    pub async fn flush_tasks(&self) {
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut tasks = self.tasks.lock().expect("task registry poisoned");
                if tasks.is_empty() {
                    break;
                }
                std::mem::take(&mut *tasks)
            };
            for handle in drained {
                let _ = handle.await;
            }
        }
    }

    fn abort_all(&self) {
        let tasks = self.tasks.lock().expect("task registry poisoned");
        for handle in tasks.iter() {
            handle.abort();
        }
    }

    /// Make this context current for the duration of `fut`, then finalize it
    /// (drain all background tasks). Dropping the returned future mid-flight
    /// aborts every task registered against this context.
    pub async fn activate_within<F>(&self, fut: F) -> Result<F::Output>
    where
        F: Future,
    {
        if self.activated.swap(true, Ordering::SeqCst) {
            return Err(Error::context_reentered(
                "this PromisingContext has already been activated",
            ));
        }

        struct AbortGuard {
            ctx: Arc<PromisingContext>,
            armed: bool,
        }

        impl Drop for AbortGuard {
            fn drop(&mut self) {
                if self.armed {
                    self.ctx.abort_all();
                }
            }
        }

        let mut guard = AbortGuard {
            ctx: self.arc(),
            armed: true,
        };

        let ctx = self.arc();
        let output = CURRENT
            .scope(self.arc(), async move {
                let output = fut.await;
                ctx.flush_tasks().await;
                output
            })
            .await;
        guard.armed = false;

        if !self.suppress_background_errors {
            let mut slot = self
                .first_background_error
                .lock()
                .expect("background error slot poisoned");
            if let Some(err) = slot.take() {
                return Err(err);
            }
        }

        Ok(output)
    }

    /// Fan a settled promise outcome out to the handler registries of this
    /// context and all of its parents. Persist handlers fire at most once per
    /// message instance.
    pub(crate) fn emit_promise_resolved(
        &self,
        outcome: &std::result::Result<ResolvedValue, Error>,
    ) {
        let event = PromiseResolvedEvent::from_outcome(outcome);

        let mut chain = Some(self.arc());
        while let Some(ctx) = chain {
            for handler in &ctx.hooks.on_promise_resolved {
                let handler = handler.clone();
                let event = event.clone();
                ctx.start_soon(async move {
                    handler(event).await;
                    Ok(())
                });
            }
            chain = ctx.parent.clone();
        }

        if let Ok(ResolvedValue::Message(message)) = outcome {
            if message.mark_persist_once() {
                let event = PersistMessageEvent {
                    message: message.clone(),
                };
                let mut chain = Some(self.arc());
                while let Some(ctx) = chain {
                    for handler in &ctx.hooks.on_persist_message {
                        let handler = handler.clone();
                        let event = event.clone();
                        ctx.start_soon(async move {
                            handler(event).await;
                            Ok(())
                        });
                    }
                    chain = ctx.parent.clone();
                }
            }
        }
    }
}

impl std::fmt::Debug for PromisingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromisingContext")
            .field(
                "start_everything_soon_by_default",
                &self.start_everything_soon_by_default,
            )
            .field("errors_as_messages", &self.errors_as_messages)
            .field("longer_hash_keys", &self.longer_hash_keys)
            .field("hooks", &self.hooks)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

fn log_at(level: Level, err: &Error) {
    if level == Level::ERROR {
        tracing::error!(error = %err, "background task failed");
    } else if level == Level::WARN {
        tracing::warn!(error = %err, "background task failed");
    } else if level == Level::INFO {
        tracing::info!(error = %err, "background task failed");
    } else if level == Level::DEBUG {
        tracing::debug!(error = %err, "background task failed");
    } else {
        tracing::trace!(error = %err, "background task failed");
    }
}

/// The MiniAgents runtime: a configured context plus a scoped entry point.
///
/// # Examples
///
/// ```rust,no_run
/// use miniagents::{MiniAgent, MiniAgents};
///
/// # async fn demo() -> miniagents::Result<()> {
/// let echo = MiniAgent::new("echo", |ctx| async move {
///     ctx.reply("hello")?;
///     ctx.reply("world")
/// });
///
/// let runtime = MiniAgents::new();
/// runtime
///     .run(async {
///         let replies = echo.trigger("hi")?.resolve().await?;
///         assert_eq!(replies.len(), 2);
///         Ok(())
///     })
///     .await
/// # }
/// ```
pub struct MiniAgents {
    context: Arc<PromisingContext>,
}

impl MiniAgents {
    /// Runtime with default options.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a new builder for constructing a [`MiniAgents`] runtime.
    pub fn builder() -> MiniAgentsBuilder {
        MiniAgentsBuilder::default()
    }

    /// The context this runtime activates.
    pub fn context(&self) -> &Arc<PromisingContext> {
        &self.context
    }

    /// Activate the context, drive `entry` to completion, then finalize —
    /// waiting for every background task spawned during the scope.
    pub async fn run<T, F>(&self, entry: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.context.activate_within(entry).await?
    }
}

impl Default for MiniAgents {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MiniAgents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniAgents")
            .field("context", &self.context)
            .finish()
    }
}

/// Builder for a [`MiniAgents`] runtime.
///
/// All options have defaults; chain only what you need:
///
/// ```rust
/// use miniagents::MiniAgents;
///
/// let runtime = MiniAgents::builder()
///     .errors_as_messages(true)
///     .longer_hash_keys(true)
///     .build();
/// # let _ = runtime;
/// ```
pub struct MiniAgentsBuilder {
    start_everything_soon_by_default: bool,
    appenders_capture_errors_by_default: bool,
    longer_hash_keys: bool,
    errors_as_messages: bool,
    error_tracebacks_in_messages: bool,
    suppress_background_errors: bool,
    log_level_for_errors: Level,
    hooks: Hooks,
    llm_logger_agent: Option<MiniAgent>,
}

impl Default for MiniAgentsBuilder {
    fn default() -> Self {
        Self {
            // Agents and streams fan out in the background unless told not to
            start_everything_soon_by_default: true,
            appenders_capture_errors_by_default: false,
            longer_hash_keys: false,
            errors_as_messages: false,
            error_tracebacks_in_messages: false,
            suppress_background_errors: true,
            log_level_for_errors: Level::ERROR,
            hooks: Hooks::new(),
            llm_logger_agent: None,
        }
    }
}

impl MiniAgentsBuilder {
    /// Whether promises, streams and agent bodies are scheduled in the
    /// background as soon as they are created (default: true).
    pub fn start_everything_soon_by_default(mut self, value: bool) -> Self {
        self.start_everything_soon_by_default = value;
        self
    }

    /// Default `capture_errors` for stream appenders (default: false).
    pub fn appenders_capture_errors_by_default(mut self, value: bool) -> Self {
        self.appenders_capture_errors_by_default = value;
        self
    }

    /// Use full 64-character hash keys instead of 40 (default: false).
    pub fn longer_hash_keys(mut self, value: bool) -> Self {
        self.longer_hash_keys = value;
        self
    }

    /// Reify stream and agent failures as in-band error messages
    /// (default: false).
    pub fn errors_as_messages(mut self, value: bool) -> Self {
        self.errors_as_messages = value;
        self
    }

    /// Include a debug rendering of the failure in reified error messages
    /// (default: false).
    pub fn error_tracebacks_in_messages(mut self, value: bool) -> Self {
        self.error_tracebacks_in_messages = value;
        self
    }

    /// With suppression off, the first background failure is returned from
    /// `run` after finalization instead of being swallowed (default: on).
    pub fn suppress_background_errors(mut self, value: bool) -> Self {
        self.suppress_background_errors = value;
        self
    }

    /// Level at which background failures are logged (default: ERROR).
    pub fn log_level_for_errors(mut self, level: Level) -> Self {
        self.log_level_for_errors = level;
        self
    }

    /// Register an on-promise-resolved handler.
    pub fn on_promise_resolved<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PromiseResolvedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks = self.hooks.add_on_promise_resolved(handler);
        self
    }

    /// Register an on-persist-message handler.
    pub fn on_persist_message<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(PersistMessageEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks = self.hooks.add_on_persist_message(handler);
        self
    }

    /// Agent that LLM integrations should route prompt/response logs to.
    pub fn llm_logger_agent(mut self, agent: MiniAgent) -> Self {
        self.llm_logger_agent = Some(agent);
        self
    }

    /// Build the runtime. The context's parent is whatever context is active
    /// at this point, so runtimes built inside `run` scopes nest.
    pub fn build(self) -> MiniAgents {
        MiniAgents {
            context: Arc::new_cyclic(|weak| PromisingContext {
                start_everything_soon_by_default: self.start_everything_soon_by_default,
                appenders_capture_errors_by_default: self.appenders_capture_errors_by_default,
                longer_hash_keys: self.longer_hash_keys,
                errors_as_messages: self.errors_as_messages,
                error_tracebacks_in_messages: self.error_tracebacks_in_messages,
                suppress_background_errors: self.suppress_background_errors,
                log_level_for_errors: self.log_level_for_errors,
                hooks: self.hooks,
                llm_logger_agent: self.llm_logger_agent,
                parent: PromisingContext::try_current(),
                self_ref: weak.clone(),
                tasks: StdMutex::new(Vec::new()),
                activated: AtomicBool::new(false),
                first_background_error: StdMutex::new(None),
            }),
        }
    }
}

impl std::fmt::Debug for MiniAgentsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniAgentsBuilder")
            .field("errors_as_messages", &self.errors_as_messages)
            .field("longer_hash_keys", &self.longer_hash_keys)
            .field("hooks", &self.hooks)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_current_fails_outside_scope() {
        let err = PromisingContext::current().unwrap_err();
        assert!(matches!(err, Error::NoActiveContext(_)));
    }

    #[tokio::test]
    async fn test_run_activates_and_finalizes() {
        let runtime = MiniAgents::new();
        let value = runtime
            .run(async {
                let ctx = PromisingContext::current()?;
                assert!(ctx.start_everything_soon_by_default());
                Ok(42)
            })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_double_activation_fails() {
        let runtime = MiniAgents::new();
        runtime.run(async { Ok(()) }).await.unwrap();
        let err = runtime.run(async { Ok(()) }).await.unwrap_err();
        assert!(matches!(err, Error::ContextReentered(_)));
    }

    #[tokio::test]
    async fn test_background_error_is_suppressed_by_default() {
        let runtime = MiniAgents::new();
        runtime
            .run(async {
                let ctx = PromisingContext::current()?;
                ctx.start_soon(async { Err(Error::other("background boom")) });
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_background_error_surfaces_when_not_suppressed() {
        let runtime = MiniAgents::builder()
            .suppress_background_errors(false)
            .log_level_for_errors(Level::DEBUG)
            .build();
        let err = runtime
            .run(async {
                let ctx = PromisingContext::current()?;
                ctx.start_soon(async { Err(Error::other("background boom")) });
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err, Error::other("background boom"));
    }

    #[tokio::test]
    async fn test_tasks_spawned_during_flush_are_awaited() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let runtime = MiniAgents::new();
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        runtime
            .run(async move {
                let ctx = PromisingContext::current()?;
                let inner = seen.clone();
                ctx.start_soon(async move {
                    let ctx = PromisingContext::current()?;
                    let innermost = inner.clone();
                    ctx.start_soon(async move {
                        innermost.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    });
                    inner.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                });
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
