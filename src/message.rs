//! Messages: the frozen, content-addressed unit of exchange between agents.
//!
//! A [`Message`] wraps a [`Frozen`] record tagged with a message kind
//! (`"Message"`, `"TextMessage"`, `"ErrorMessage"`, or anything you choose).
//! Messages are open by default — arbitrary extra fields are accepted — and
//! never change after construction. Hashing externalizes nested messages into
//! `<field>__hash_key` references, so a message's identity depends on its own
//! content plus the hashes of its sub-messages.
//!
//! A [`MessagePromise`] is the streamed counterpart: a replayable token
//! stream whose resolved value is a concrete message, with preliminary
//! metadata readable before any token arrives. [`MessageTokenAppender`] is
//! the producer handle used by token-streaming integrations, carrying an
//! auxiliary field collector for metadata discovered mid-stream.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use futures::stream::BoxStream;

use crate::error::{Error, Result};
use crate::frozen::{self, Frozen, FrozenValue};
use crate::runtime::PromisingContext;
use crate::stream::{StreamAppender, StreamCursor, StreamedPromise};

/// Reserved field: the rendered content of a message.
pub const MESSAGE_CONTENT_FIELD: &str = "content";

/// Reserved field: a `{field}` template rendered against the record.
pub const MESSAGE_CONTENT_TEMPLATE_FIELD: &str = "content_template";

/// Default message kind tag.
pub const MESSAGE_CLASS: &str = "Message";

/// Kind tag for plain text messages.
pub const TEXT_MESSAGE_CLASS: &str = "TextMessage";

/// Kind tag for reified errors.
pub const ERROR_MESSAGE_CLASS: &str = "ErrorMessage";

struct MessageState {
    persist_fired: AtomicBool,
    hash_hex: OnceLock<String>,
}

/// A frozen message. Cheap to clone; clones share identity (the persist
/// handler fires once per instance, not once per clone). Equality is
/// structural, so two independently built messages with the same fields are
/// equal and share a hash key.
#[derive(Clone)]
pub struct Message {
    record: Frozen,
    state: Arc<MessageState>,
}

impl Message {
    fn from_record(record: Frozen) -> Self {
        Self {
            record,
            state: Arc::new(MessageState {
                persist_fired: AtomicBool::new(false),
                hash_hex: OnceLock::new(),
            }),
        }
    }

    /// Builder for a message of any kind.
    pub fn builder() -> MessageBuilder {
        MessageBuilder::default()
    }

    /// A `TextMessage` whose positional argument is its content.
    pub fn text(content: impl Into<String>) -> Message {
        Message::builder()
            .class_name(TEXT_MESSAGE_CLASS)
            .content(content)
            .build()
            .expect("a plain text message always freezes")
    }

    /// A `TextMessage` with extra fields.
    pub fn text_with(content: impl Into<String>, fields: serde_json::Value) -> Result<Message> {
        Message::builder()
            .class_name(TEXT_MESSAGE_CLASS)
            .content(content)
            .fields(fields)
            .build()
    }

    /// An open `Message` built from JSON fields.
    pub fn from_fields(fields: serde_json::Value) -> Result<Message> {
        Message::builder().fields(fields).build()
    }

    /// An open `Message` carrying the fields of an existing frozen record.
    pub fn from_frozen(record: &Frozen) -> Result<Message> {
        let fields = record
            .fields()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect::<Vec<_>>();
        Ok(Message::from_record(Frozen::new(MESSAGE_CLASS, fields)?))
    }

    /// The frozen record behind this message.
    pub fn record(&self) -> &Frozen {
        &self.record
    }

    /// The message kind tag (`class_`).
    pub fn class_name(&self) -> &str {
        self.record.class_name()
    }

    pub fn get(&self, name: &str) -> Option<&FrozenValue> {
        self.record.get(name)
    }

    pub fn content(&self) -> Option<&str> {
        self.record.get_str(MESSAGE_CONTENT_FIELD)
    }

    pub fn content_template(&self) -> Option<&str> {
        self.record.get_str(MESSAGE_CONTENT_TEMPLATE_FIELD)
    }

    /// Whether this message reifies an error.
    pub fn is_error(&self) -> bool {
        matches!(self.get("is_error"), Some(FrozenValue::Bool(true)))
    }

    /// Rendered text: the formatted `content_template` if present, else the
    /// verbatim `content`, else a fenced JSON dump of the whole record.
    pub fn as_text(&self) -> String {
        if let Some(template) = self.content_template() {
            return frozen::render_template(template, &self.record);
        }
        if let Some(content) = self.content() {
            return content.to_string();
        }
        format!("```json\n{}\n```", self.full_json())
    }

    /// Complete JSON with nested messages inlined.
    pub fn full_json(&self) -> String {
        self.record.full_json()
    }

    /// Canonical serialized JSON with nested messages externalized to hash
    /// references.
    pub fn serialized_json(&self) -> String {
        self.record.to_json(true).to_string()
    }

    /// Content hash over the serialized (externalized) form.
    pub fn hash_key(&self) -> String {
        let full = self
            .state
            .hash_hex
            .get_or_init(|| frozen::hash_hex(&self.serialized_json()));
        frozen::truncate_hash(full)
    }

    /// All nested messages, depth-first, children before parents.
    pub fn sub_messages(&self) -> Vec<Message> {
        let mut out = Vec::new();
        self.record.collect_messages(&mut out);
        out
    }

    /// First caller wins; used to fire the persist handler at most once per
    /// message instance.
    pub(crate) fn mark_persist_once(&self) -> bool {
        !self.state.persist_fired.swap(true, Ordering::SeqCst)
    }

    /// Wrap this message in an already-resolved promise.
    pub fn as_promise(&self) -> Result<MessagePromise> {
        MessagePromise::prefilled(self.clone())
    }

    /// Start building a message promise (streaming or prefilled).
    pub fn promise() -> MessagePromiseBuilder {
        MessagePromiseBuilder::default()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.record == other.record
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("class_", &self.class_name())
            .field("content", &self.content())
            .field("fields", &format!("{} fields", self.record.len()))
            .finish()
    }
}

impl serde::Serialize for Message {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        self.record.serialize(serializer)
    }
}

/// Build a reified error message: `"<Kind>: <payload>"` content, flagged
/// `is_error`, with a debug traceback when the context enables it.
pub(crate) fn error_message(error: &Error) -> Message {
    let with_traceback = PromisingContext::try_current()
        .map(|ctx| ctx.error_tracebacks_in_messages())
        .unwrap_or(false);

    let mut builder = Message::builder()
        .class_name(ERROR_MESSAGE_CLASS)
        .content(format!("{}: {}", error.kind_name(), error.message()))
        .field("is_error", true)
        .field("error_class", error.kind_name());
    if with_traceback {
        builder = builder.field("traceback", format!("{error:?}"));
    }
    builder
        .build()
        .expect("an error message always freezes")
}

/// Builder for [`Message`].
///
/// ```rust,no_run
/// use miniagents::Message;
/// use serde_json::json;
///
/// # fn demo() -> miniagents::Result<()> {
/// let msg = Message::builder()
///     .content("the answer")
///     .field("role", "assistant")
///     .fields(json!({"model": "gpt-nano"}))
///     .build()?;
/// assert_eq!(msg.content(), Some("the answer"));
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct MessageBuilder {
    class_name: Option<String>,
    allowed_fields: Option<Vec<String>>,
    fields: BTreeMap<String, FrozenValue>,
    json_fields: Option<serde_json::Value>,
    error: Option<Error>,
}

impl MessageBuilder {
    /// The message kind tag (default `"Message"`).
    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.fields.insert(
            MESSAGE_CONTENT_FIELD.to_string(),
            FrozenValue::from(content.into()),
        );
        self
    }

    pub fn content_template(mut self, template: impl Into<String>) -> Self {
        self.fields.insert(
            MESSAGE_CONTENT_TEMPLATE_FIELD.to_string(),
            FrozenValue::from(template.into()),
        );
        self
    }

    /// Set one field from any freezable value.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FrozenValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Set one field from a value whose freezing may fail (e.g. a float).
    pub fn try_field<V>(mut self, name: impl Into<String>, value: V) -> Self
    where
        V: TryInto<FrozenValue, Error = Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.fields.insert(name.into(), value);
            }
            Err(err) => self.error = Some(err),
        }
        self
    }

    /// Merge a JSON object of fields (objects nest as records, arrays as
    /// tuples).
    pub fn fields(mut self, fields: serde_json::Value) -> Self {
        self.json_fields = Some(match self.json_fields.take() {
            None => fields,
            Some(mut existing) => {
                if let (Some(map), Some(new)) = (existing.as_object_mut(), fields.as_object()) {
                    for (k, v) in new {
                        map.insert(k.clone(), v.clone());
                    }
                }
                existing
            }
        });
        self
    }

    /// Make the message strict: any field outside `allowed` (plus the
    /// reserved content fields) is rejected at build time.
    pub fn allowed_fields(mut self, allowed: &[&str]) -> Self {
        self.allowed_fields = Some(allowed.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Message> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let mut fields = self.fields;
        if let Some(json_fields) = self.json_fields {
            match json_fields {
                serde_json::Value::Object(map) => {
                    for (name, value) in map {
                        fields.insert(name, FrozenValue::try_from(value)?);
                    }
                }
                other => {
                    return Err(Error::invalid_input(format!(
                        "message fields must be a JSON object, got {other}"
                    )));
                }
            }
        }

        if let Some(allowed) = &self.allowed_fields {
            for name in fields.keys() {
                let reserved =
                    name == MESSAGE_CONTENT_FIELD || name == MESSAGE_CONTENT_TEMPLATE_FIELD;
                if !reserved && !allowed.iter().any(|a| a == name) {
                    return Err(Error::invalid_field(format!(
                        "field `{name}` is not allowed in this message kind"
                    )));
                }
            }
        }

        let class_name = self.class_name.unwrap_or_else(|| MESSAGE_CLASS.to_string());
        Ok(Message::from_record(Frozen::new(class_name, fields)?))
    }
}

/// Mutable map of metadata discovered while a message streams (role, model,
/// finish reason, ...). Merged into the final message by the resolver; the
/// reserved content fields are rejected there.
#[derive(Clone, Default)]
pub struct AuxFieldCollector {
    inner: Arc<StdMutex<BTreeMap<String, FrozenValue>>>,
}

impl AuxFieldCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, name: impl Into<String>, value: impl Into<FrozenValue>) {
        self.inner
            .lock()
            .expect("field collector poisoned")
            .insert(name.into(), value.into());
    }

    pub fn extend<I, K>(&self, fields: I)
    where
        I: IntoIterator<Item = (K, FrozenValue)>,
        K: Into<String>,
    {
        let mut inner = self.inner.lock().expect("field collector poisoned");
        for (name, value) in fields {
            inner.insert(name.into(), value);
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, FrozenValue> {
        self.inner.lock().expect("field collector poisoned").clone()
    }

    fn snapshot_checked(&self) -> Result<BTreeMap<String, FrozenValue>> {
        let snapshot = self.snapshot();
        for reserved in [MESSAGE_CONTENT_FIELD, MESSAGE_CONTENT_TEMPLATE_FIELD] {
            if snapshot.contains_key(reserved) {
                return Err(Error::invalid_field(format!(
                    "`{reserved}` must not be set through the auxiliary field collector; \
                     it is resolved from the token stream"
                )));
            }
        }
        Ok(snapshot)
    }
}

impl std::fmt::Debug for AuxFieldCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.inner.lock().map(|m| m.len()).unwrap_or_default();
        f.debug_struct("AuxFieldCollector")
            .field("fields", &format!("{len} fields"))
            .finish()
    }
}

/// Token streamer closure: receives the auxiliary field collector and returns
/// the token stream.
pub type MessageTokenStreamer =
    Box<dyn FnOnce(AuxFieldCollector) -> BoxStream<'static, Result<String>> + Send>;

/// Stream appender whose pieces are message tokens, with an attached
/// [`AuxFieldCollector`].
#[derive(Clone)]
pub struct MessageTokenAppender {
    appender: StreamAppender<String>,
    collector: AuxFieldCollector,
}

impl MessageTokenAppender {
    pub fn new(capture_errors: Option<bool>) -> Result<Self> {
        Ok(Self {
            appender: StreamAppender::new(capture_errors)?,
            collector: AuxFieldCollector::new(),
        })
    }

    pub fn open(&self) -> Result<()> {
        self.appender.open()
    }

    pub fn close(&self) {
        self.appender.close()
    }

    pub fn was_open(&self) -> bool {
        self.appender.was_open()
    }

    pub fn is_open(&self) -> bool {
        self.appender.is_open()
    }

    pub fn append(&self, token: impl Into<String>) -> Result<()> {
        self.appender.append(token.into())
    }

    pub fn append_error(&self, error: Error) -> Result<()> {
        self.appender.append_error(error)
    }

    /// Scoped acquisition; see [`StreamAppender::scope`].
    pub async fn scope<F, Fut>(&self, body: F) -> Result<()>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        self.appender.scope(body).await
    }

    /// Metadata collected while streaming.
    pub fn collector(&self) -> &AuxFieldCollector {
        &self.collector
    }
}

impl std::fmt::Debug for MessageTokenAppender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageTokenAppender")
            .field("appender", &self.appender)
            .field("collector", &self.collector)
            .finish()
    }
}

/// A promise of a message, streamed token by token.
///
/// Carries `known_beforehand` metadata that is readable before any token
/// flows — enough to route or hide a message without awaiting it.
#[derive(Clone)]
pub struct MessagePromise {
    inner: StreamedPromise<String, Message>,
    known_beforehand: Frozen,
    message_class: String,
    reify_errors: bool,
}

impl MessagePromise {
    /// Promise of an already-built message; its single "token" is the
    /// rendered text.
    pub fn prefilled(message: Message) -> Result<Self> {
        let known_beforehand = message.record().clone();
        let message_class = message.class_name().to_string();
        Ok(Self {
            inner: StreamedPromise::prefilled(vec![message.as_text()], message)?,
            known_beforehand,
            message_class,
            reify_errors: false,
        })
    }

    fn from_token_stream(
        message_class: String,
        known_beforehand: Frozen,
        collector: AuxFieldCollector,
        tokens: BoxStream<'static, Result<String>>,
        start_soon: Option<bool>,
    ) -> Result<Self> {
        let resolver_class = message_class.clone();
        let resolver_collector = collector.clone();
        let inner = StreamedPromise::new(
            tokens,
            move |mut cursor: StreamCursor<String>| async move {
                let mut content = String::new();
                while let Some(item) = cursor.next().await {
                    content.push_str(&item?);
                }
                let mut builder = Message::builder()
                    .class_name(resolver_class)
                    .content(content);
                for (name, value) in resolver_collector.snapshot_checked()? {
                    builder = builder.field(name, value);
                }
                builder.build()
            },
            start_soon,
        )?;

        Ok(Self {
            inner,
            known_beforehand,
            message_class,
            reify_errors: false,
        })
    }

    /// Preliminary metadata, readable before tokens flow.
    pub fn known_beforehand(&self) -> &Frozen {
        &self.known_beforehand
    }

    /// The kind tag the resolved message will carry.
    pub fn message_class(&self) -> &str {
        &self.message_class
    }

    /// Fresh replay cursor over the tokens.
    pub fn tokens(&self) -> TokenCursor {
        TokenCursor {
            cursor: self.inner.cursor(),
            reify_errors: self.reify_errors,
        }
    }

    /// Await the concrete message.
    ///
    /// In errors-as-messages mode a failure mid-stream resolves to an error
    /// message carrying whatever content already streamed, instead of
    /// propagating.
    pub async fn resolve(&self) -> Result<Message> {
        if !self.reify_errors {
            return self.inner.resolve().await;
        }

        let mut streamed = String::new();
        let mut cursor = self.inner.cursor();
        loop {
            match cursor.next().await {
                Some(Ok(token)) => streamed.push_str(&token),
                Some(Err(error)) => return Ok(partial_error_message(&streamed, &error)),
                None => break,
            }
        }
        match self.inner.resolve().await {
            Ok(message) => Ok(message),
            Err(error) => Ok(partial_error_message(&streamed, &error)),
        }
    }

    pub(crate) fn with_reified_errors(&self) -> Self {
        let mut clone = self.clone();
        clone.reify_errors = true;
        clone
    }
}

impl std::fmt::Debug for MessagePromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePromise")
            .field("message_class", &self.message_class)
            .field("inner", &self.inner)
            .finish()
    }
}

fn partial_error_message(streamed: &str, error: &Error) -> Message {
    let with_traceback = PromisingContext::try_current()
        .map(|ctx| ctx.error_tracebacks_in_messages())
        .unwrap_or(false);

    let mut builder = Message::builder()
        .class_name(ERROR_MESSAGE_CLASS)
        .content(format!(
            "{streamed}\n{}: {}",
            error.kind_name(),
            error.message()
        ))
        .field("is_error", true)
        .field("error_class", error.kind_name());
    if with_traceback {
        builder = builder.field("traceback", format!("{error:?}"));
    }
    builder.build().expect("an error message always freezes")
}

/// Replay cursor over a message promise's tokens.
pub struct TokenCursor {
    cursor: StreamCursor<String>,
    reify_errors: bool,
}

impl TokenCursor {
    /// Next token; in errors-as-messages mode a captured error comes out as
    /// an in-band `"\n<Kind>: <payload>"` token and iteration continues.
    pub async fn next(&mut self) -> Option<Result<String>> {
        match self.cursor.next().await {
            Some(Err(error)) if self.reify_errors => Some(Ok(format!(
                "\n{}: {}",
                error.kind_name(),
                error.message()
            ))),
            other => other,
        }
    }

    /// Collect the remaining tokens into one string.
    pub async fn collect_text(mut self) -> Result<String> {
        let mut text = String::new();
        while let Some(token) = self.next().await {
            text.push_str(&token?);
        }
        Ok(text)
    }
}

/// Builder for [`MessagePromise`] (see [`Message::promise`]).
///
/// Exactly one source: `content` (prefilled), a `streamer` closure, or an
/// **open** `appender`. Metadata becomes the promise's `known_beforehand`
/// record and is merged into the final message.
#[derive(Default)]
pub struct MessagePromiseBuilder {
    class_name: Option<String>,
    content: Option<String>,
    metadata: BTreeMap<String, FrozenValue>,
    json_metadata: Option<serde_json::Value>,
    start_soon: Option<bool>,
    streamer: Option<MessageTokenStreamer>,
    appender: Option<MessageTokenAppender>,
}

impl MessagePromiseBuilder {
    pub fn class_name(mut self, class_name: impl Into<String>) -> Self {
        self.class_name = Some(class_name.into());
        self
    }

    /// Prefill the content instead of streaming it.
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// One preliminary metadata field.
    pub fn field(mut self, name: impl Into<String>, value: impl Into<FrozenValue>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Preliminary metadata as a JSON object.
    pub fn metadata(mut self, metadata: serde_json::Value) -> Self {
        self.json_metadata = Some(metadata);
        self
    }

    pub fn start_soon(mut self, start_soon: bool) -> Self {
        self.start_soon = Some(start_soon);
        self
    }

    /// Stream tokens from a closure that receives the field collector.
    pub fn streamer<F, S>(mut self, streamer: F) -> Self
    where
        F: FnOnce(AuxFieldCollector) -> S + Send + 'static,
        S: futures::Stream<Item = Result<String>> + Send + 'static,
    {
        use futures::StreamExt;
        self.streamer = Some(Box::new(move |collector| streamer(collector).boxed()));
        self
    }

    /// Stream tokens from an appender. It must already be open — wiring an
    /// unopened appender into a promise is how consumers end up waiting
    /// forever, so it fails fast.
    pub fn appender(mut self, appender: &MessageTokenAppender) -> Self {
        self.appender = Some(appender.clone());
        self
    }

    pub fn build(self) -> Result<MessagePromise> {
        let mut metadata = self.metadata;
        if let Some(json_metadata) = self.json_metadata {
            match json_metadata {
                serde_json::Value::Object(map) => {
                    for (name, value) in map {
                        metadata.insert(name, FrozenValue::try_from(value)?);
                    }
                }
                other => {
                    return Err(Error::invalid_input(format!(
                        "preliminary metadata must be a JSON object, got {other}"
                    )));
                }
            }
        }

        let class_name = self.class_name.unwrap_or_else(|| MESSAGE_CLASS.to_string());
        let known_beforehand = Frozen::new("Frozen", metadata.clone())?;

        if self.content.is_some() && (self.streamer.is_some() || self.appender.is_some()) {
            return Err(Error::invalid_input(
                "provide either prefilled content or a token source, not both",
            ));
        }

        if let Some(appender) = self.appender {
            if self.streamer.is_some() {
                return Err(Error::invalid_input(
                    "provide either a streamer or an appender, not both",
                ));
            }
            if !appender.was_open() {
                return Err(Error::appender_not_open(
                    "open the MessageTokenAppender before building a promise from it",
                ));
            }
            let collector = appender.collector().clone();
            collector.extend(metadata);
            let tokens = appender.appender.take_stream()?;
            return MessagePromise::from_token_stream(
                class_name,
                known_beforehand,
                collector,
                tokens,
                self.start_soon,
            );
        }

        if let Some(streamer) = self.streamer {
            let collector = AuxFieldCollector::new();
            collector.extend(metadata);
            let tokens = streamer(collector.clone());
            return MessagePromise::from_token_stream(
                class_name,
                known_beforehand,
                collector,
                tokens,
                self.start_soon,
            );
        }

        let mut builder = Message::builder().class_name(class_name);
        for (name, value) in metadata {
            builder = builder.field(name, value);
        }
        if let Some(content) = self.content {
            builder = builder.content(content);
        }
        MessagePromise::prefilled(builder.build()?)
    }
}

impl std::fmt::Debug for MessagePromiseBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePromiseBuilder")
            .field("class_name", &self.class_name)
            .field("prefilled", &self.content.is_some())
            .field("has_streamer", &self.streamer.is_some())
            .field("has_appender", &self.appender.is_some())
            .finish()
    }
}
