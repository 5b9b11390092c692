//! # MiniAgents
//!
//! A streaming-promise runtime for composing **agents** — independent
//! asynchronous producers of message streams — into dynamic dataflow graphs.
//!
//! ## The model
//!
//! - Calling an agent returns **immediately** with a promise of a message
//!   sequence; each message is itself a promise of a token stream.
//! - Promises are **replayable**: any number of consumers iterate the same
//!   stream from the beginning while the producer runs at most once per
//!   piece.
//! - Agents and their consumers run **concurrently in the background** on
//!   one cooperative scheduler, so deep pipelines fan out and converge
//!   without explicit task plumbing.
//! - Replies may nest other promises and whole sub-sequences; the runtime
//!   **flattens** them transparently, so graph depth is invisible.
//! - Failures either propagate as typed errors or are **reified** into
//!   in-band error messages that travel through the pipeline.
//! - Resolved messages are **frozen and content-addressed**: a stable
//!   SHA-256 hash key over their canonical JSON, with nested messages
//!   externalized Merkle-style.
//!
//! ## A taste
//!
//! ```rust,no_run
//! use miniagents::{MiniAgent, MiniAgents};
//!
//! #[tokio::main]
//! async fn main() -> miniagents::Result<()> {
//!     let echo = MiniAgent::new("echo", |ctx| async move {
//!         ctx.reply("hello")?;
//!         ctx.reply("world")
//!     });
//!
//!     MiniAgents::new()
//!         .run(async {
//!             let replies = echo.trigger("hi")?;
//!             let mut messages = replies.messages();
//!             while let Some(promise) = messages.next().await {
//!                 println!("{}", promise?.resolve().await?.as_text());
//!             }
//!             Ok(())
//!         })
//!         .await
//! }
//! ```
//!
//! ## Architecture
//!
//! - **runtime**: scoped context, background-task registry, the `MiniAgents`
//!   entry point
//! - **promise**: single-value promises with at-most-once resolution
//! - **stream**: replayable streamed promises and the appender write handle
//! - **sequence**: recursive flattening of heterogeneous inputs, the
//!   out-of-order side channel, sequence promises and joining
//! - **message**: frozen content-addressed messages and token-streamed
//!   message promises
//! - **agent**: registration, forking, invocation and reply collection
//! - **frozen**: the deep-immutable value model underneath messages
//! - **hooks**: resolution and persistence handler registries
//! - **error**: the `Error` enum and `Result` alias used across the crate

// ============================================================================
// MODULE DECLARATIONS
// ============================================================================

/// Agent registration, forking, invocation handles and the per-invocation
/// interaction context.
mod agent;

/// Error types and conversions used across all public APIs.
mod error;

/// Deep-immutable records, canonical JSON and content hashing.
mod frozen;

/// Handler registries fired on promise resolution and message persistence.
mod hooks;

/// Frozen messages, message promises and the token appender.
mod message;

/// Single-value promises with cached, replayable outcomes.
mod promise;

/// The scoped runtime context and the `MiniAgents` entry point.
mod runtime;

/// Flattening of nested message inputs into flat sequence promises.
mod sequence;

/// Replayable streamed promises and the producer-side appender.
mod stream;

// ============================================================================
// PUBLIC EXPORTS
// ============================================================================

// --- Runtime lifecycle ---

pub use runtime::{MiniAgents, MiniAgentsBuilder, PromisingContext, TaskHandle};

// --- Agents ---

pub use agent::{
    AGENT_ALIAS_PLACEHOLDER, AgentBuilder, AgentCall, AgentFn, AgentForkBuilder,
    InteractionContext, MiniAgent,
};

// --- Messages ---

pub use message::{
    AuxFieldCollector, ERROR_MESSAGE_CLASS, MESSAGE_CLASS, MESSAGE_CONTENT_FIELD,
    MESSAGE_CONTENT_TEMPLATE_FIELD, Message, MessageBuilder, MessagePromise,
    MessagePromiseBuilder, MessageTokenAppender, MessageTokenStreamer, TEXT_MESSAGE_CLASS,
    TokenCursor,
};

// --- Sequences ---

pub use sequence::{
    FlatSequence, FlatSequenceOptions, Flattener, JoinOptions, MessageCursor, MessageInput,
    MessageSequence, MessageSequenceAppender, MessageSequencePromise, SequenceOptions,
};

// --- Promises & streams ---

pub use promise::{Promise, Resolvable, ResolvedValue};
pub use stream::{PieceStream, StreamAppender, StreamCursor, StreamedPromise};

// --- Hooks ---

pub use hooks::{
    Hooks, PersistMessageEvent, PersistMessageHandler, PromiseResolvedEvent,
    PromiseResolvedHandler,
};

// --- Frozen data model ---

pub use frozen::{FROZEN_CLASS_FIELD, Frozen, FrozenValue};

// --- Error handling ---

pub use error::{Error, Result};

// ============================================================================
// CONVENIENCE PRELUDE
// ============================================================================

/// The types you reach for in typical agent code:
/// `use miniagents::prelude::*;`
pub mod prelude {
    pub use crate::{
        Error, InteractionContext, JoinOptions, Message, MessageInput, MessagePromise,
        MessageSequencePromise, MiniAgent, MiniAgents, PromisingContext, Result,
    };
}
