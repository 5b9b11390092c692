//! Agents: async closures wired together through message sequences.
//!
//! A [`MiniAgent`] wraps a `Fn(InteractionContext) -> future` under an alias.
//! Calling one never blocks: [`MiniAgent::trigger`] immediately returns a
//! [`MessageSequencePromise`] for the reply, and the body runs as a
//! background task of the current context (or lazily, on first consumption,
//! when eager scheduling is off). The body's return value is ignored — its
//! effect is what it appends through [`InteractionContext::reply`] and
//! [`InteractionContext::reply_out_of_order`].
//!
//! After a call's reply stream fully resolves, the runtime builds audit
//! records (`AgentCallRecord` / `AgentReplyRecord`) linking the agent alias
//! with the hash keys of its inputs and replies; they reach the
//! `on_promise_resolved` hooks through separately scheduled promises so the
//! user-visible chain can never deadlock on them.

use std::any::Any;
use std::future::Future;
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::frozen::{Frozen, FrozenValue};
use crate::promise::Promise;
use crate::runtime::PromisingContext;
use crate::sequence::{
    MessageInput, MessageSequence, MessageSequenceAppender, MessageSequencePromise,
    SequenceHook, SequenceOptions,
};

/// The callable behind an agent.
pub type AgentFn =
    Arc<dyn Fn(InteractionContext) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Placeholder expanded to the agent alias inside descriptions.
pub const AGENT_ALIAS_PLACEHOLDER: &str = "{AGENT_ALIAS}";

struct AgentInner {
    func: AgentFn,
    alias: String,
    description: Option<String>,
    default_kwargs: Frozen,
    mutable_state: Option<Arc<dyn Any + Send + Sync>>,
}

/// A registered agent. Cheap to clone; clones share the callable, the
/// partially-applied kwargs and the mutable-state slot.
#[derive(Clone)]
pub struct MiniAgent {
    inner: Arc<AgentInner>,
}

impl MiniAgent {
    /// Register a closure as an agent. The alias is upper-cased, matching
    /// the convention that agent aliases read like constants.
    ///
    /// # Panics
    ///
    /// Panics if the alias is empty; use [`MiniAgent::builder`] for a
    /// fallible build.
    pub fn new<F, Fut>(alias: &str, func: F) -> MiniAgent
    where
        F: Fn(InteractionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        Self::builder(alias, func)
            .build()
            .expect("agent registration with defaults only fails on an empty alias")
    }

    /// Full registration builder.
    pub fn builder<F, Fut>(alias: &str, func: F) -> AgentBuilder
    where
        F: Fn(InteractionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        AgentBuilder {
            func: Arc::new(move |ctx| Box::pin(func(ctx))),
            alias: alias.to_string(),
            uppercase_alias: true,
            description: None,
            kwargs: None,
            mutable_state: None,
        }
    }

    pub fn alias(&self) -> &str {
        &self.inner.alias
    }

    pub fn description(&self) -> Option<&str> {
        self.inner.description.as_deref()
    }

    /// Kwargs partially applied through [`MiniAgent::fork`].
    pub fn default_kwargs(&self) -> &Frozen {
        &self.inner.default_kwargs
    }

    /// Downcast the fork's mutable-state slot.
    pub fn mutable_state<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.inner.mutable_state.clone()?.downcast::<T>().ok()
    }

    /// A new agent sharing this one's callable, with overridden kwargs,
    /// alias, or mutable state.
    pub fn fork(&self) -> AgentForkBuilder {
        AgentForkBuilder {
            base: self.clone(),
            alias: None,
            description: None,
            kwargs: None,
            mutable_state: None,
        }
    }

    /// Send `input` and immediately receive the reply sequence promise.
    pub fn trigger(&self, input: impl Into<MessageInput>) -> Result<MessageSequencePromise> {
        let call = self.initiate_call()?;
        call.send(input)?;
        Ok(call.reply_sequence())
    }

    /// Like [`MiniAgent::trigger`], with call kwargs.
    pub fn trigger_with(
        &self,
        input: impl Into<MessageInput>,
        kwargs: serde_json::Value,
    ) -> Result<MessageSequencePromise> {
        let call = self.initiate_call_with(kwargs)?;
        call.send(input)?;
        Ok(call.reply_sequence())
    }

    /// Open a call handle: inputs can then be sent piecemeal before (or
    /// while) the reply streams.
    pub fn initiate_call(&self) -> Result<AgentCall> {
        self.initiate_call_with(serde_json::json!({}))
    }

    /// Open a call handle with call kwargs merged over the fork defaults.
    pub fn initiate_call_with(&self, kwargs: serde_json::Value) -> Result<AgentCall> {
        let context = PromisingContext::current()?;
        let call_id = Uuid::new_v4();

        let kwarg_fields = match kwargs {
            serde_json::Value::Object(map) => map
                .into_iter()
                .map(|(k, v)| Ok((k, FrozenValue::try_from(v)?)))
                .collect::<Result<Vec<_>>>()?,
            other => {
                return Err(Error::invalid_input(format!(
                    "call kwargs must be a JSON object, got {other}"
                )));
            }
        };
        let call_kwargs = self.inner.default_kwargs.merged_with(kwarg_fields)?;

        // The input side: opened right away so the caller can send.
        let input_sequence = MessageSequence::new(SequenceOptions {
            capture_errors: None,
            start_soon: Some(false),
            errors_as_messages: None,
        })?;
        input_sequence.appender().open()?;

        // The agent body runs exactly once, through this promise; it gets its
        // reply appender and input promise over a oneshot because the reply
        // sequence that owns them is built afterwards.
        let (deps_tx, deps_rx) = oneshot::channel::<RunDeps>();
        let agent = self.clone();
        let kwargs_for_run = call_kwargs.clone();
        let run_promise: Promise<Frozen> = Promise::with_options(
            move || run_agent(agent, kwargs_for_run, call_id, deps_rx),
            Some(false),
        )?;

        let kick_promise = run_promise.clone();
        let kick_context = context.clone();
        let on_first_poll: SequenceHook = Arc::new(move || {
            let promise = kick_promise.clone();
            kick_context.start_soon(async move {
                let _ = promise.resolve().await;
                Ok(())
            });
        });

        let reply_slot: Arc<OnceLock<MessageSequencePromise>> = Arc::new(OnceLock::new());
        let record_slot = reply_slot.clone();
        let record_run = run_promise.clone();
        let record_alias = self.inner.alias.clone();
        let on_terminated: SequenceHook = Arc::new(move || {
            let Some(reply) = record_slot.get().cloned() else {
                return;
            };
            let run = record_run.clone();
            let alias = record_alias.clone();
            let record = Promise::<Frozen>::with_options(
                move || build_reply_record(alias, run, reply),
                Some(true),
            );
            if let Err(error) = record {
                tracing::debug!(error = %error, "could not schedule an agent reply record");
            }
        });

        let reply_sequence = MessageSequence::with_hooks(
            SequenceOptions {
                capture_errors: Some(true),
                start_soon: None,
                errors_as_messages: None,
            },
            Some(on_first_poll),
            Some(on_terminated),
        )?;

        let _ = reply_slot.set(reply_sequence.sequence_promise.clone());
        let _ = deps_tx.send(RunDeps {
            reply_appender: reply_sequence.appender().clone(),
            input_promise: input_sequence.sequence_promise.clone(),
        });

        Ok(AgentCall {
            input_appender: input_sequence.appender().clone(),
            reply_sequence: reply_sequence.sequence_promise,
        })
    }
}

impl std::fmt::Debug for MiniAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MiniAgent")
            .field("alias", &self.inner.alias)
            .field("default_kwargs", &format!("{} kwargs", self.inner.default_kwargs.len()))
            .field("has_mutable_state", &self.inner.mutable_state.is_some())
            .finish()
    }
}

struct RunDeps {
    reply_appender: MessageSequenceAppender,
    input_promise: MessageSequencePromise,
}

/// Drive one agent invocation: open the reply appender for the scope of the
/// body, capture body failures into the reply stream, then assemble the
/// `AgentCallRecord`.
async fn run_agent(
    agent: MiniAgent,
    kwargs: Frozen,
    call_id: Uuid,
    deps_rx: oneshot::Receiver<RunDeps>,
) -> Result<Frozen> {
    let RunDeps {
        reply_appender,
        input_promise,
    } = deps_rx
        .await
        .map_err(|_| Error::other("the agent call was dropped before it was fully wired"))?;

    let interaction = InteractionContext {
        this_agent: agent.clone(),
        message_promises: input_promise.clone(),
        reply_appender: reply_appender.clone(),
        kwargs: kwargs.clone(),
        call_id,
    };

    let func = agent.inner.func.clone();
    // capture_errors is on for reply appenders, so a failing body lands in
    // the reply stream; AppenderClosed (e.g. after finish_early) propagates
    // to the background wrapper instead.
    reply_appender.scope(move || func(interaction)).await?;

    let inputs = input_promise.resolve().await?;
    let input_hashes: Vec<FrozenValue> = inputs
        .iter()
        .map(|message| FrozenValue::from(message.hash_key()))
        .collect();

    let fields = kwargs
        .fields()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .chain([
            ("agent_alias".to_string(), FrozenValue::from(agent.alias())),
            ("call_id".to_string(), FrozenValue::from(call_id)),
            (
                "message_hash_keys".to_string(),
                FrozenValue::tuple(input_hashes),
            ),
        ]);
    Frozen::new("AgentCallRecord", fields)
}

async fn build_reply_record(
    alias: String,
    run_promise: Promise<Frozen>,
    reply_sequence: MessageSequencePromise,
) -> Result<Frozen> {
    let replies = reply_sequence.resolve().await?;
    let call_record = run_promise.resolve().await?;
    let reply_hashes: Vec<FrozenValue> = replies
        .iter()
        .map(|message| FrozenValue::from(message.hash_key()))
        .collect();

    Frozen::new(
        "AgentReplyRecord",
        [
            ("agent_alias".to_string(), FrozenValue::from(alias)),
            (
                "agent_call_hash_key".to_string(),
                FrozenValue::from(call_record.hash_key()),
            ),
            (
                "reply_hash_keys".to_string(),
                FrozenValue::tuple(reply_hashes),
            ),
        ],
    )
}

/// Per-invocation handle passed to the agent body.
#[derive(Clone)]
pub struct InteractionContext {
    this_agent: MiniAgent,
    message_promises: MessageSequencePromise,
    reply_appender: MessageSequenceAppender,
    kwargs: Frozen,
    call_id: Uuid,
}

impl InteractionContext {
    /// The agent being invoked.
    pub fn this_agent(&self) -> &MiniAgent {
        &self.this_agent
    }

    /// The flat sequence of input messages.
    pub fn message_promises(&self) -> &MessageSequencePromise {
        &self.message_promises
    }

    /// Call kwargs: fork defaults with per-call overrides merged in.
    pub fn kwargs(&self) -> &Frozen {
        &self.kwargs
    }

    pub fn call_id(&self) -> Uuid {
        self.call_id
    }

    /// Append to the ordered reply stream. Accepts anything the flattening
    /// grammar accepts.
    pub fn reply(&self, input: impl Into<MessageInput>) -> Result<()> {
        self.reply_appender.append(input)
    }

    /// Append to the out-of-order reply stream; items appear whenever they
    /// become ready, with no position guarantee.
    pub fn reply_out_of_order(&self, input: impl Into<MessageInput>) -> Result<()> {
        self.reply_appender.append_out_of_order(input)
    }

    /// Signal that no further replies will be produced. Consumers see the
    /// end of the sequence without waiting for the body to return; later
    /// `reply` calls fail with `AppenderClosed`.
    pub fn finish_early(&self) -> Result<()> {
        self.reply_appender.close();
        Ok(())
    }
}

impl std::fmt::Debug for InteractionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractionContext")
            .field("agent", &self.this_agent.alias())
            .field("call_id", &self.call_id)
            .finish()
    }
}

/// An in-flight agent call: send inputs, then take the reply sequence.
pub struct AgentCall {
    input_appender: MessageSequenceAppender,
    reply_sequence: MessageSequencePromise,
}

impl AgentCall {
    /// Send more input on the ordered channel.
    pub fn send(&self, input: impl Into<MessageInput>) -> Result<&Self> {
        self.input_appender.append(input)?;
        Ok(self)
    }

    /// Send input on the out-of-order channel.
    pub fn send_out_of_order(&self, input: impl Into<MessageInput>) -> Result<&Self> {
        self.input_appender.append_out_of_order(input)?;
        Ok(self)
    }

    /// Finish the call and return the reply sequence promise.
    pub fn reply_sequence(&self) -> MessageSequencePromise {
        self.finish();
        self.reply_sequence.clone()
    }

    /// Return the reply sequence while keeping the input side open — for
    /// full-duplex exchanges where inputs keep flowing as replies stream.
    pub fn reply_sequence_keeping_input_open(&self) -> MessageSequencePromise {
        self.reply_sequence.clone()
    }

    /// Close the input side; no more inputs can be sent.
    pub fn finish(&self) {
        self.input_appender.close();
    }
}

impl std::fmt::Debug for AgentCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentCall")
            .field("input_appender", &self.input_appender)
            .finish()
    }
}

/// Registration builder (see [`MiniAgent::builder`]).
pub struct AgentBuilder {
    func: AgentFn,
    alias: String,
    uppercase_alias: bool,
    description: Option<String>,
    kwargs: Option<serde_json::Value>,
    mutable_state: Option<Arc<dyn Any + Send + Sync>>,
}

impl AgentBuilder {
    /// Human-readable description; `{AGENT_ALIAS}` expands to the final
    /// alias.
    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Keep the alias exactly as given instead of upper-casing it.
    pub fn keep_alias_case(mut self) -> Self {
        self.uppercase_alias = false;
        self
    }

    /// Default kwargs made available to every invocation.
    pub fn kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    /// Attach non-freezable state shared across calls of this agent.
    pub fn mutable_state<T: Any + Send + Sync>(mut self, state: T) -> Self {
        self.mutable_state = Some(Arc::new(state));
        self
    }

    pub fn build(self) -> Result<MiniAgent> {
        if self.alias.trim().is_empty() {
            return Err(Error::invalid_input("agent alias cannot be empty"));
        }
        let alias = if self.uppercase_alias {
            self.alias.to_uppercase()
        } else {
            self.alias
        };

        let description = self
            .description
            .map(|d| d.replace(AGENT_ALIAS_PLACEHOLDER, &alias));

        let default_kwargs = match self.kwargs {
            Some(kwargs) => Frozen::from_json("Frozen", kwargs)?,
            None => Frozen::empty("Frozen")?,
        };

        Ok(MiniAgent {
            inner: Arc::new(AgentInner {
                func: self.func,
                alias,
                description,
                default_kwargs,
                mutable_state: self.mutable_state,
            }),
        })
    }
}

/// Fork builder (see [`MiniAgent::fork`]).
pub struct AgentForkBuilder {
    base: MiniAgent,
    alias: Option<String>,
    description: Option<String>,
    kwargs: Option<serde_json::Value>,
    mutable_state: Option<Arc<dyn Any + Send + Sync>>,
}

impl AgentForkBuilder {
    /// Alias for the fork (default: the base agent's alias).
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Kwargs merged over the base agent's defaults.
    pub fn kwargs(mut self, kwargs: serde_json::Value) -> Self {
        self.kwargs = Some(kwargs);
        self
    }

    /// Replace the mutable-state slot for this fork.
    pub fn mutable_state<T: Any + Send + Sync>(mut self, state: T) -> Self {
        self.mutable_state = Some(Arc::new(state));
        self
    }

    pub fn build(self) -> Result<MiniAgent> {
        let alias = match self.alias {
            Some(alias) if alias.trim().is_empty() => {
                return Err(Error::invalid_input("agent alias cannot be empty"));
            }
            Some(alias) => alias.to_uppercase(),
            None => self.base.inner.alias.clone(),
        };

        let description = self
            .description
            .map(|d| d.replace(AGENT_ALIAS_PLACEHOLDER, &alias))
            .or_else(|| self.base.inner.description.clone());

        let default_kwargs = match self.kwargs {
            Some(serde_json::Value::Object(map)) => {
                let overrides = map
                    .into_iter()
                    .map(|(k, v)| Ok((k, FrozenValue::try_from(v)?)))
                    .collect::<Result<Vec<_>>>()?;
                self.base.inner.default_kwargs.merged_with(overrides)?
            }
            Some(other) => {
                return Err(Error::invalid_input(format!(
                    "fork kwargs must be a JSON object, got {other}"
                )));
            }
            None => self.base.inner.default_kwargs.clone(),
        };

        Ok(MiniAgent {
            inner: Arc::new(AgentInner {
                func: self.base.inner.func.clone(),
                alias,
                description,
                default_kwargs,
                mutable_state: self
                    .mutable_state
                    .or_else(|| self.base.inner.mutable_state.clone()),
            }),
        })
    }
}
