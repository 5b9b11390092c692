//! Sequence flattening: many shapes in, one flat stream of promises out.
//!
//! [`FlatSequence`] merges two upstream channels — an **ordered** one and an
//! optional **out-of-order** one — through a flattener that expands each
//! upstream item into zero or more downstream items. Ordered items come out
//! in arrival order; out-of-order items are flattened by one background task
//! each and interleave purely by readiness. The downstream ends only after
//! both channels have ended, and the out-of-order workers are joined before
//! that side reports its end.
//!
//! [`MessageInput`] is the grammar of things an agent may reply with: plain
//! strings, field maps, messages, promises of messages, whole sequence
//! promises, errors, and arbitrarily nested collections of all of those.
//! Nesting is invisible to consumers — everything flattens into a single
//! stream of [`MessagePromise`]s.

use std::future::Future;
use std::sync::Arc;

use async_stream::stream;
use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::error::{Error, Result};
use crate::frozen::{Frozen, FrozenValue};
use crate::message::{
    self, MESSAGE_CONTENT_FIELD, MESSAGE_CONTENT_TEMPLATE_FIELD, Message, MessagePromise,
};
use crate::promise::Resolvable;
use crate::runtime::PromisingContext;
use crate::stream::{PieceStream, StreamAppender, StreamCursor, StreamedPromise};

/// Expands one upstream item into a stream of downstream items.
pub type Flattener<IN, OUT> = Arc<dyn Fn(IN) -> BoxStream<'static, Result<OUT>> + Send + Sync>;

pub(crate) type SequenceHook = Arc<dyn Fn() + Send + Sync>;

enum MergeItem<OUT> {
    Item(Result<OUT>),
    EndOrdered,
    EndOutOfOrder,
}

/// Options for [`FlatSequence::new`].
#[derive(Default)]
pub struct FlatSequenceOptions {
    start_soon: Option<bool>,
    on_first_poll: Option<SequenceHook>,
    on_terminated: Option<SequenceHook>,
}

impl FlatSequenceOptions {
    pub fn start_soon(mut self, start_soon: bool) -> Self {
        self.start_soon = Some(start_soon);
        self
    }

    /// Hook invoked when the downstream stream is first driven (the agent
    /// runtime schedules the agent body here).
    pub(crate) fn on_first_poll(mut self, hook: SequenceHook) -> Self {
        self.on_first_poll = Some(hook);
        self
    }

    /// Hook invoked after both upstream channels have terminated.
    pub(crate) fn on_terminated(mut self, hook: SequenceHook) -> Self {
        self.on_terminated = Some(hook);
        self
    }
}

/// Flattens heterogeneous upstream items into one streamed promise.
pub struct FlatSequence<OUT, W: Resolvable> {
    pub sequence_promise: StreamedPromise<OUT, W>,
}

impl<OUT, W> FlatSequence<OUT, W>
where
    OUT: Clone + Send + 'static,
    W: Resolvable,
{
    /// Wire the upstream channels through the flattener into a streamed
    /// promise resolved by `resolver`.
    ///
    /// The merge machinery starts lazily, on the first poll of the
    /// downstream (which happens immediately when `start_soon` is in
    /// effect).
    pub fn new<IN, F, Fut>(
        ordered: PieceStream<IN>,
        out_of_order: Option<PieceStream<IN>>,
        flattener: Flattener<IN, OUT>,
        resolver: F,
        options: FlatSequenceOptions,
    ) -> Result<Self>
    where
        IN: Send + 'static,
        F: FnOnce(StreamCursor<OUT>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<W>> + Send + 'static,
    {
        let context = PromisingContext::current()?;
        let FlatSequenceOptions {
            start_soon,
            on_first_poll,
            on_terminated,
        } = options;

        let has_out_of_order = out_of_order.is_some();
        let (tx, mut rx) = mpsc::unbounded_channel::<MergeItem<OUT>>();

        let downstream = stream! {
            if let Some(hook) = &on_first_poll {
                hook();
            }
            context.start_soon(merge_upstreams(ordered, out_of_order, flattener, tx));

            let mut ordered_done = false;
            let mut out_of_order_done = !has_out_of_order;
            while !(ordered_done && out_of_order_done) {
                match rx.recv().await {
                    Some(MergeItem::Item(item)) => yield item,
                    Some(MergeItem::EndOrdered) => ordered_done = true,
                    Some(MergeItem::EndOutOfOrder) => out_of_order_done = true,
                    None => break,
                }
            }
            if let Some(hook) = &on_terminated {
                hook();
            }
        };

        Ok(Self {
            sequence_promise: StreamedPromise::new(downstream, resolver, start_soon)?,
        })
    }
}

/// Drive both upstream channels into the merge queue. Each out-of-order item
/// gets its own background task; the workers are gathered before the
/// out-of-order end marker goes out.
async fn merge_upstreams<IN, OUT>(
    mut ordered: PieceStream<IN>,
    out_of_order: Option<PieceStream<IN>>,
    flattener: Flattener<IN, OUT>,
    tx: UnboundedSender<MergeItem<OUT>>,
) -> Result<()>
where
    IN: Send + 'static,
    OUT: Send + 'static,
{
    let context = PromisingContext::current()?;

    if let Some(mut unordered) = out_of_order {
        let unordered_tx = tx.clone();
        let unordered_flattener = flattener.clone();
        context.start_soon(async move {
            let context = PromisingContext::current()?;
            let mut workers = Vec::new();
            while let Some(item) = unordered.next().await {
                match item {
                    Ok(input) => {
                        let tx = unordered_tx.clone();
                        let flattener = unordered_flattener.clone();
                        workers.push(context.start_soon(async move {
                            let mut expanded = flattener(input);
                            while let Some(out) = expanded.next().await {
                                if tx.send(MergeItem::Item(out)).is_err() {
                                    break;
                                }
                            }
                            Ok(())
                        }));
                    }
                    Err(error) => {
                        let _ = unordered_tx.send(MergeItem::Item(Err(error)));
                    }
                }
            }
            context.gather(workers).await;
            let _ = unordered_tx.send(MergeItem::EndOutOfOrder);
            Ok(())
        });
    }

    while let Some(item) = ordered.next().await {
        match item {
            Ok(input) => {
                let mut expanded = flattener(input);
                while let Some(out) = expanded.next().await {
                    if tx.send(MergeItem::Item(out)).is_err() {
                        return Ok(());
                    }
                }
            }
            Err(error) => {
                let _ = tx.send(MergeItem::Item(Err(error)));
            }
        }
    }
    let _ = tx.send(MergeItem::EndOrdered);
    Ok(())
}

/// Anything an agent can reply with, as a tagged union.
///
/// Conversions exist from strings, messages, promises, sequence promises,
/// frozen records, errors, and vectors of any of those, so call sites mostly
/// just pass values through `impl Into<MessageInput>`.
pub enum MessageInput {
    /// A message promise, passed through unchanged
    Promise(MessagePromise),
    /// A concrete message, wrapped into an already-resolved promise
    Message(Message),
    /// A plain string, wrapped into a `TextMessage`
    Text(String),
    /// An open record, wrapped into an open `Message`
    Record(Frozen),
    /// An error, surfaced as an error piece (or reified downstream)
    Error(Error),
    /// A collection, expanded recursively
    Many(Vec<MessageInput>),
    /// A whole sequence promise, expanded into its message promises
    Sequence(MessageSequencePromise),
    /// An async stream of further inputs, expanded recursively
    Stream(BoxStream<'static, MessageInput>),
}

impl MessageInput {
    /// Convert a JSON value: strings become text messages, objects become
    /// open records, arrays expand element-wise.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(match value {
            serde_json::Value::String(s) => MessageInput::Text(s),
            serde_json::Value::Array(items) => MessageInput::Many(
                items
                    .into_iter()
                    .map(MessageInput::from_json)
                    .collect::<Result<_>>()?,
            ),
            serde_json::Value::Object(_) => {
                MessageInput::Record(Frozen::from_json("Frozen", value)?)
            }
            other => {
                return Err(Error::invalid_input(format!(
                    "{other} cannot be turned into messages"
                )));
            }
        })
    }
}

impl From<&str> for MessageInput {
    fn from(text: &str) -> Self {
        MessageInput::Text(text.to_string())
    }
}

impl From<String> for MessageInput {
    fn from(text: String) -> Self {
        MessageInput::Text(text)
    }
}

impl From<Message> for MessageInput {
    fn from(message: Message) -> Self {
        MessageInput::Message(message)
    }
}

impl From<MessagePromise> for MessageInput {
    fn from(promise: MessagePromise) -> Self {
        MessageInput::Promise(promise)
    }
}

impl From<MessageSequencePromise> for MessageInput {
    fn from(sequence: MessageSequencePromise) -> Self {
        MessageInput::Sequence(sequence)
    }
}

impl From<Frozen> for MessageInput {
    fn from(record: Frozen) -> Self {
        MessageInput::Record(record)
    }
}

impl From<Error> for MessageInput {
    fn from(error: Error) -> Self {
        MessageInput::Error(error)
    }
}

impl<T: Into<MessageInput>> From<Vec<T>> for MessageInput {
    fn from(items: Vec<T>) -> Self {
        MessageInput::Many(items.into_iter().map(Into::into).collect())
    }
}

impl std::fmt::Debug for MessageInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageInput::Promise(_) => write!(f, "MessageInput::Promise"),
            MessageInput::Message(m) => write!(f, "MessageInput::Message({:?})", m.content()),
            MessageInput::Text(t) => write!(f, "MessageInput::Text({t:?})"),
            MessageInput::Record(_) => write!(f, "MessageInput::Record"),
            MessageInput::Error(e) => write!(f, "MessageInput::Error({e})"),
            MessageInput::Many(items) => write!(f, "MessageInput::Many({} items)", items.len()),
            MessageInput::Sequence(_) => write!(f, "MessageInput::Sequence"),
            MessageInput::Stream(_) => write!(f, "MessageInput::Stream"),
        }
    }
}

/// The message flattening grammar. Errors inside nested collections surface
/// as error pieces without cancelling their siblings.
pub(crate) fn flatten_input(input: MessageInput) -> BoxStream<'static, Result<MessagePromise>> {
    match input {
        MessageInput::Promise(promise) => {
            futures::stream::once(async move { Ok(promise) }).boxed()
        }
        MessageInput::Message(message) => {
            futures::stream::once(async move { message.as_promise() }).boxed()
        }
        MessageInput::Text(text) => {
            futures::stream::once(async move { Message::text(text).as_promise() }).boxed()
        }
        MessageInput::Record(record) => {
            futures::stream::once(async move { Message::from_frozen(&record)?.as_promise() })
                .boxed()
        }
        MessageInput::Error(error) => futures::stream::once(async move { Err(error) }).boxed(),
        MessageInput::Many(items) => futures::stream::iter(items).flat_map(flatten_input).boxed(),
        MessageInput::Sequence(sequence) => sequence.raw_piece_stream().boxed(),
        MessageInput::Stream(inputs) => inputs.flat_map(flatten_input).boxed(),
    }
}

/// Paired write handles for the two channels of a message sequence.
#[derive(Clone, Debug)]
pub struct MessageSequenceAppender {
    ordered: StreamAppender<MessageInput>,
    out_of_order: StreamAppender<MessageInput>,
    capture_errors: bool,
}

impl MessageSequenceAppender {
    fn new(capture_errors: Option<bool>) -> Result<Self> {
        let context = PromisingContext::current()?;
        let capture_errors =
            capture_errors.unwrap_or_else(|| context.appenders_capture_errors_by_default());
        Ok(Self {
            ordered: StreamAppender::new(Some(capture_errors))?,
            out_of_order: StreamAppender::new(Some(capture_errors))?,
            capture_errors,
        })
    }

    pub fn open(&self) -> Result<()> {
        self.ordered.open()?;
        self.out_of_order.open()
    }

    /// Close both channels; idempotent.
    pub fn close(&self) {
        self.ordered.close();
        self.out_of_order.close();
    }

    pub fn was_open(&self) -> bool {
        self.ordered.was_open() && self.out_of_order.was_open()
    }

    pub fn is_open(&self) -> bool {
        self.ordered.is_open() && self.out_of_order.is_open()
    }

    /// Append to the ordered channel.
    pub fn append(&self, input: impl Into<MessageInput>) -> Result<()> {
        self.ordered.append(input.into())
    }

    /// Append to the out-of-order channel: the items will interleave with
    /// ordered ones purely by readiness.
    pub fn append_out_of_order(&self, input: impl Into<MessageInput>) -> Result<()> {
        self.out_of_order.append(input.into())
    }

    pub(crate) fn append_error(&self, error: Error) -> Result<()> {
        self.ordered.append_error(error)
    }

    /// Scoped acquisition over both channels, with the capture-errors
    /// contract applied to the ordered one.
    pub async fn scope<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        self.open()?;
        let outcome = body().await;
        let result = match outcome {
            Err(error)
                if self.capture_errors && !matches!(error, Error::AppenderClosed(_)) =>
            {
                tracing::debug!(error = %error, "capturing a sequence producer error");
                if self.append_error(error).is_err() {
                    tracing::error!(
                        "a sequence appender could not capture an error because it was closed"
                    );
                }
                Ok(())
            }
            other => other,
        };
        self.close();
        result
    }
}

/// Options for building a [`MessageSequence`].
#[derive(Default, Debug, Clone)]
pub struct SequenceOptions {
    pub capture_errors: Option<bool>,
    pub start_soon: Option<bool>,
    pub errors_as_messages: Option<bool>,
}

/// A message sequence under construction: the appender half plus the promise
/// half.
pub struct MessageSequence {
    appender: MessageSequenceAppender,
    pub sequence_promise: MessageSequencePromise,
}

impl MessageSequence {
    pub fn new(options: SequenceOptions) -> Result<Self> {
        Self::with_hooks(options, None, None)
    }

    pub(crate) fn with_hooks(
        options: SequenceOptions,
        on_first_poll: Option<SequenceHook>,
        on_terminated: Option<SequenceHook>,
    ) -> Result<Self> {
        let context = PromisingContext::current()?;
        let errors_as_messages = options
            .errors_as_messages
            .unwrap_or_else(|| context.errors_as_messages());

        let appender = MessageSequenceAppender::new(options.capture_errors)?;
        let ordered = appender.ordered.take_stream()?;
        let out_of_order = appender.out_of_order.take_stream()?;

        let flattener: Flattener<MessageInput, MessagePromise> = Arc::new(flatten_input);

        let mut flat_options = FlatSequenceOptions::default();
        if let Some(start_soon) = options.start_soon {
            flat_options = flat_options.start_soon(start_soon);
        }
        if let Some(hook) = on_first_poll {
            flat_options = flat_options.on_first_poll(hook);
        }
        if let Some(hook) = on_terminated {
            flat_options = flat_options.on_terminated(hook);
        }

        let flat = FlatSequence::new(
            ordered,
            Some(out_of_order),
            flattener,
            move |cursor| resolve_sequence(cursor, errors_as_messages),
            flat_options,
        )?;

        Ok(Self {
            appender,
            sequence_promise: MessageSequencePromise {
                inner: flat.sequence_promise,
                errors_as_messages,
            },
        })
    }

    pub fn appender(&self) -> &MessageSequenceAppender {
        &self.appender
    }
}

/// Collect every message promise first (so nested producers keep streaming
/// concurrently), then resolve them in order.
async fn resolve_sequence(
    mut cursor: StreamCursor<MessagePromise>,
    errors_as_messages: bool,
) -> Result<Vec<Message>> {
    let mut promises = Vec::new();
    while let Some(item) = cursor.next().await {
        match item {
            Ok(promise) if errors_as_messages => promises.push(promise.with_reified_errors()),
            Ok(promise) => promises.push(promise),
            Err(error) if errors_as_messages => {
                promises.push(message::error_message(&error).as_promise()?);
            }
            Err(error) => return Err(error),
        }
    }

    let mut messages = Vec::with_capacity(promises.len());
    for promise in promises {
        messages.push(promise.resolve().await?);
    }
    Ok(messages)
}

/// A promise of a whole message sequence: iterate it message promise by
/// message promise, or await it into a tuple of concrete messages.
#[derive(Clone)]
pub struct MessageSequencePromise {
    inner: StreamedPromise<MessagePromise, Vec<Message>>,
    errors_as_messages: bool,
}

impl MessageSequencePromise {
    /// Turn any [`MessageInput`] into a flat sequence promise. A sequence
    /// promise passes through unchanged.
    pub fn from_input(input: impl Into<MessageInput>) -> Result<Self> {
        let input = input.into();
        if let MessageInput::Sequence(sequence) = input {
            return Ok(sequence);
        }

        let sequence = MessageSequence::new(SequenceOptions {
            capture_errors: Some(true),
            start_soon: Some(false),
            errors_as_messages: None,
        })?;
        let appender = sequence.appender().clone();
        appender.open()?;
        appender.append(input)?;
        appender.close();
        Ok(sequence.sequence_promise)
    }

    /// Fresh replay cursor over the message promises.
    pub fn messages(&self) -> MessageCursor {
        MessageCursor {
            cursor: self.inner.cursor(),
            errors_as_messages: self.errors_as_messages,
        }
    }

    /// Raw pieces for flattening: no error reification applied.
    pub(crate) fn raw_piece_stream(
        &self,
    ) -> impl Stream<Item = Result<MessagePromise>> + Send + use<> {
        self.inner.piece_stream()
    }

    /// Await the whole sequence as a tuple of concrete messages. An empty
    /// sequence resolves to an empty tuple.
    pub async fn resolve(&self) -> Result<Vec<Message>> {
        self.inner.resolve().await
    }

    /// Join every message into one synthetic text message promise.
    pub fn as_single_text_promise(&self, options: JoinOptions) -> Result<MessagePromise> {
        join_sequence(self.clone(), options)
    }
}

impl std::fmt::Debug for MessageSequencePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageSequencePromise")
            .field("errors_as_messages", &self.errors_as_messages)
            .field("inner", &self.inner)
            .finish()
    }
}

/// Replay cursor over a sequence's message promises.
///
/// In errors-as-messages mode, error pieces come out as prefilled error
/// message promises and yielded promises reify their own failures.
pub struct MessageCursor {
    cursor: StreamCursor<MessagePromise>,
    errors_as_messages: bool,
}

impl MessageCursor {
    pub async fn next(&mut self) -> Option<Result<MessagePromise>> {
        match self.cursor.next().await {
            Some(Ok(promise)) if self.errors_as_messages => {
                Some(Ok(promise.with_reified_errors()))
            }
            Some(Err(error)) if self.errors_as_messages => {
                Some(message::error_message(&error).as_promise())
            }
            other => other,
        }
    }
}

/// Options for [`MessageSequencePromise::as_single_text_promise`].
#[derive(Clone, Debug)]
pub struct JoinOptions {
    delimiter: Option<String>,
    strip_leading_newlines: bool,
    reference_originals: bool,
    start_soon: Option<bool>,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            delimiter: Some("\n\n".to_string()),
            strip_leading_newlines: false,
            reference_originals: true,
            start_soon: Some(false),
        }
    }
}

impl JoinOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delimiter(mut self, delimiter: impl Into<String>) -> Self {
        self.delimiter = Some(delimiter.into());
        self
    }

    pub fn no_delimiter(mut self) -> Self {
        self.delimiter = None;
        self
    }

    /// Strip leading newlines from each joined message (models prompted in
    /// certain ways love to start with them).
    pub fn strip_leading_newlines(mut self, strip: bool) -> Self {
        self.strip_leading_newlines = strip;
        self
    }

    /// Embed the source messages as an `original_messages` tuple field
    /// (default: true).
    pub fn reference_originals(mut self, reference: bool) -> Self {
        self.reference_originals = reference;
        self
    }

    pub fn start_soon(mut self, start_soon: bool) -> Self {
        self.start_soon = Some(start_soon);
        self
    }
}

fn join_sequence(
    sequence: MessageSequencePromise,
    options: JoinOptions,
) -> Result<MessagePromise> {
    let start_soon = options.start_soon;

    let mut builder = Message::promise().streamer(move |collector| {
        stream! {
            let mut cursor = sequence.messages();
            let mut originals: Vec<Message> = Vec::new();
            let mut first = true;

            while let Some(item) = cursor.next().await {
                let promise = match item {
                    Ok(promise) => promise,
                    Err(error) => {
                        yield Err(error);
                        continue;
                    }
                };

                collector.extend(non_content_fields(promise.known_beforehand()));

                if !first {
                    if let Some(delimiter) = &options.delimiter {
                        yield Ok(delimiter.clone());
                    }
                }

                let mut strip = options.strip_leading_newlines;
                let mut tokens = promise.tokens();
                while let Some(token) = tokens.next().await {
                    match token {
                        Ok(mut token) => {
                            if strip {
                                token = token.trim_start_matches(['\n', '\r']).to_string();
                            }
                            if !token.is_empty() {
                                strip = false;
                                yield Ok(token);
                            }
                        }
                        Err(error) => yield Err(error),
                    }
                }

                match promise.resolve().await {
                    Ok(resolved) => {
                        collector.extend(non_content_fields(resolved.record()));
                        if options.reference_originals {
                            originals.push(resolved);
                        }
                    }
                    Err(error) => yield Err(error),
                }

                first = false;
            }

            if options.reference_originals {
                collector.insert("original_messages", FrozenValue::tuple(originals));
            }
        }
    });

    if let Some(start_soon) = start_soon {
        builder = builder.start_soon(start_soon);
    }
    builder.build()
}

fn non_content_fields(record: &Frozen) -> Vec<(String, FrozenValue)> {
    record
        .fields()
        .filter(|(name, _)| {
            *name != MESSAGE_CONTENT_FIELD && *name != MESSAGE_CONTENT_TEMPLATE_FIELD
        })
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}
