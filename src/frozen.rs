//! Deep-immutable records with content-addressed identity.
//!
//! The data model has two layers:
//!
//! - [`FrozenValue`]: a recursively immutable value — scalars, tuples, nested
//!   records, or whole messages.
//! - [`Frozen`]: a labeled record of frozen values carrying a `class_` tag.
//!
//! Every record can produce a **canonical JSON** rendering (sorted keys,
//! UTF-8, no NaN) and exposes a `hash_key`: the SHA-256 of that rendering,
//! truncated to 40 hex characters unless the active context asks for full
//! 64-character keys. Messages nested inside a message are *externalized*
//! during hashing — replaced by `<field>__hash_key` references — which gives
//! messages Merkle-style identity.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeDelta, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::runtime::PromisingContext;

/// Synthetic field carrying the concrete record kind in serialized form.
pub const FROZEN_CLASS_FIELD: &str = "class_";

/// Length of a truncated hash key (full SHA-256 hex is 64 characters).
pub(crate) const SHORT_HASH_LEN: usize = 40;

/// A recursively immutable field value.
///
/// Collections become tuples, maps become nested [`Frozen`] records, and
/// whole [`Message`]s may sit inside a record (they get externalized when the
/// parent message is hashed). Floats are guaranteed finite — conversions
/// reject NaN and infinities so the canonical JSON stays well-defined.
#[derive(Debug, Clone, PartialEq)]
pub enum FrozenValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(Arc<str>),
    Bytes(Arc<[u8]>),
    Uuid(Uuid),
    DateTime(DateTime<Utc>),
    Date(NaiveDate),
    Time(NaiveTime),
    Duration(TimeDelta),
    Tuple(Arc<[FrozenValue]>),
    Record(Frozen),
    Message(Message),
}

impl FrozenValue {
    /// Validated float constructor; NaN and infinities are rejected.
    pub fn float(value: f64) -> Result<Self> {
        if !value.is_finite() {
            return Err(Error::invalid_field(format!(
                "non-finite float {value} cannot be frozen"
            )));
        }
        Ok(FrozenValue::Float(value))
    }

    /// Byte-string value; rendered as base64 in canonical JSON.
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        FrozenValue::Bytes(Arc::from(value.into().into_boxed_slice()))
    }

    /// Tuple value from anything convertible to frozen values.
    pub fn tuple<I, T>(items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<FrozenValue>,
    {
        FrozenValue::Tuple(items.into_iter().map(Into::into).collect())
    }

    /// JSON rendering of this value. With `externalize` set, message-valued
    /// entries nested in records are replaced by hash-key references; a
    /// message encountered directly (e.g. inside a mixed tuple) is always
    /// inlined in full.
    pub(crate) fn to_json(&self, externalize: bool) -> Value {
        match self {
            FrozenValue::Null => Value::Null,
            FrozenValue::Bool(b) => Value::Bool(*b),
            FrozenValue::Int(i) => Value::from(*i),
            FrozenValue::Float(f) => Value::from(*f),
            FrozenValue::Str(s) => Value::String(s.to_string()),
            FrozenValue::Bytes(b) => Value::String(BASE64.encode(b)),
            FrozenValue::Uuid(u) => Value::String(u.to_string()),
            FrozenValue::DateTime(dt) => Value::String(dt.to_rfc3339()),
            FrozenValue::Date(d) => Value::String(d.to_string()),
            FrozenValue::Time(t) => Value::String(t.to_string()),
            FrozenValue::Duration(td) => {
                Value::from(td.num_milliseconds() as f64 / 1000.0)
            }
            FrozenValue::Tuple(items) => {
                Value::Array(items.iter().map(|v| v.to_json(externalize)).collect())
            }
            FrozenValue::Record(record) => record.to_json(externalize),
            FrozenValue::Message(message) => message.record().to_json(false),
        }
    }

    /// Plain-text rendering used for `{field}` template interpolation.
    pub(crate) fn render_text(&self) -> String {
        match self {
            FrozenValue::Str(s) => s.to_string(),
            FrozenValue::Null => "null".to_string(),
            FrozenValue::Bool(b) => b.to_string(),
            FrozenValue::Int(i) => i.to_string(),
            FrozenValue::Float(f) => f.to_string(),
            FrozenValue::Uuid(u) => u.to_string(),
            FrozenValue::DateTime(dt) => dt.to_rfc3339(),
            FrozenValue::Date(d) => d.to_string(),
            FrozenValue::Time(t) => t.to_string(),
            other => other.to_json(false).to_string(),
        }
    }

    /// Depth-first collection of every message reachable from this value,
    /// children before parents.
    pub(crate) fn collect_messages(&self, out: &mut Vec<Message>) {
        match self {
            FrozenValue::Message(message) => {
                message.record().collect_messages(out);
                out.push(message.clone());
            }
            FrozenValue::Tuple(items) => {
                for item in items.iter() {
                    item.collect_messages(out);
                }
            }
            FrozenValue::Record(record) => record.collect_messages(out),
            _ => {}
        }
    }
}

impl From<bool> for FrozenValue {
    fn from(v: bool) -> Self {
        FrozenValue::Bool(v)
    }
}

impl From<i64> for FrozenValue {
    fn from(v: i64) -> Self {
        FrozenValue::Int(v)
    }
}

impl From<i32> for FrozenValue {
    fn from(v: i32) -> Self {
        FrozenValue::Int(v as i64)
    }
}

impl From<u32> for FrozenValue {
    fn from(v: u32) -> Self {
        FrozenValue::Int(v as i64)
    }
}

impl From<&str> for FrozenValue {
    fn from(v: &str) -> Self {
        FrozenValue::Str(Arc::from(v))
    }
}

impl From<String> for FrozenValue {
    fn from(v: String) -> Self {
        FrozenValue::Str(Arc::from(v.as_str()))
    }
}

impl From<Uuid> for FrozenValue {
    fn from(v: Uuid) -> Self {
        FrozenValue::Uuid(v)
    }
}

impl From<DateTime<Utc>> for FrozenValue {
    fn from(v: DateTime<Utc>) -> Self {
        FrozenValue::DateTime(v)
    }
}

impl From<NaiveDate> for FrozenValue {
    fn from(v: NaiveDate) -> Self {
        FrozenValue::Date(v)
    }
}

impl From<NaiveTime> for FrozenValue {
    fn from(v: NaiveTime) -> Self {
        FrozenValue::Time(v)
    }
}

impl From<TimeDelta> for FrozenValue {
    fn from(v: TimeDelta) -> Self {
        FrozenValue::Duration(v)
    }
}

impl From<&Path> for FrozenValue {
    fn from(v: &Path) -> Self {
        FrozenValue::Str(Arc::from(v.to_string_lossy().as_ref()))
    }
}

impl From<PathBuf> for FrozenValue {
    fn from(v: PathBuf) -> Self {
        FrozenValue::from(v.as_path())
    }
}

impl From<Frozen> for FrozenValue {
    fn from(v: Frozen) -> Self {
        FrozenValue::Record(v)
    }
}

impl From<Message> for FrozenValue {
    fn from(v: Message) -> Self {
        FrozenValue::Message(v)
    }
}

impl<T: Into<FrozenValue>> From<Vec<T>> for FrozenValue {
    fn from(items: Vec<T>) -> Self {
        FrozenValue::tuple(items)
    }
}

impl TryFrom<f64> for FrozenValue {
    type Error = Error;

    fn try_from(v: f64) -> Result<Self> {
        FrozenValue::float(v)
    }
}

impl TryFrom<Value> for FrozenValue {
    type Error = Error;

    /// JSON objects become nested open records, arrays become tuples.
    fn try_from(value: Value) -> Result<Self> {
        Ok(match value {
            Value::Null => FrozenValue::Null,
            Value::Bool(b) => FrozenValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    FrozenValue::Int(i)
                } else if let Some(f) = n.as_f64() {
                    FrozenValue::float(f)?
                } else {
                    return Err(Error::invalid_field(format!(
                        "number {n} cannot be frozen"
                    )));
                }
            }
            Value::String(s) => FrozenValue::from(s),
            Value::Array(items) => FrozenValue::Tuple(
                items
                    .into_iter()
                    .map(FrozenValue::try_from)
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => FrozenValue::Record(Frozen::from_object("Frozen", map)?),
        })
    }
}

impl serde::Serialize for FrozenValue {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json(false).serialize(serializer)
    }
}

struct FrozenInner {
    class_name: String,
    fields: BTreeMap<String, FrozenValue>,
    hash_hex: OnceLock<String>,
}

/// A recursively immutable labeled record.
///
/// Construction freezes all field values; afterwards nothing about the record
/// can change. Equality is structural (class tag plus fields), and equal
/// records produce equal hash keys.
#[derive(Clone)]
pub struct Frozen {
    inner: Arc<FrozenInner>,
}

impl Frozen {
    /// Build a record from already-frozen field values.
    pub fn new<I, K>(class_name: impl Into<String>, fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, FrozenValue)>,
        K: Into<String>,
    {
        let class_name = class_name.into();
        if class_name.trim().is_empty() {
            return Err(Error::invalid_input("record class name cannot be empty"));
        }

        let mut map = BTreeMap::new();
        for (key, value) in fields {
            let key = key.into();
            if key.trim().is_empty() {
                return Err(Error::invalid_field("field name cannot be empty"));
            }
            if key == FROZEN_CLASS_FIELD {
                return Err(Error::invalid_field(format!(
                    "`{FROZEN_CLASS_FIELD}` is synthesized from the record kind and cannot be \
                     supplied as a field"
                )));
            }
            map.insert(key, value);
        }

        Ok(Frozen {
            inner: Arc::new(FrozenInner {
                class_name,
                fields: map,
                hash_hex: OnceLock::new(),
            }),
        })
    }

    /// Record with no fields.
    pub fn empty(class_name: impl Into<String>) -> Result<Self> {
        Self::new(class_name, std::iter::empty::<(String, FrozenValue)>())
    }

    /// Build a record from a JSON object, converting nested objects to
    /// records and arrays to tuples.
    pub fn from_json(class_name: impl Into<String>, value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Self::from_object(class_name, map),
            other => Err(Error::invalid_input(format!(
                "expected a JSON object to build a frozen record, got {other}"
            ))),
        }
    }

    fn from_object(class_name: impl Into<String>, map: Map<String, Value>) -> Result<Self> {
        let fields = map
            .into_iter()
            .map(|(k, v)| Ok((k, FrozenValue::try_from(v)?)))
            .collect::<Result<Vec<_>>>()?;
        Self::new(class_name, fields)
    }

    /// The concrete kind tag of this record.
    pub fn class_name(&self) -> &str {
        &self.inner.class_name
    }

    /// Look up a single field.
    pub fn get(&self, name: &str) -> Option<&FrozenValue> {
        self.inner.fields.get(name)
    }

    /// Field value rendered as a string, if the field is a string.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(FrozenValue::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// Iterate fields in sorted (canonical) order.
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FrozenValue)> {
        self.inner.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.inner.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.fields.is_empty()
    }

    /// A new record of the same class with `overrides` merged over the
    /// current fields (used for fork defaults and metadata accumulation).
    pub fn merged_with<I, K>(&self, overrides: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, FrozenValue)>,
        K: Into<String>,
    {
        let base = self
            .fields()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .chain(overrides.into_iter().map(|(k, v)| (k.into(), v)));
        Self::new(self.class_name(), base)
    }

    /// JSON object for this record. Keys come out sorted because the field
    /// map is ordered; with `externalize` set, message-valued fields (and
    /// all-message tuples) are replaced by `<field>__hash_key` /
    /// `<field>__hash_keys` references at every nesting level.
    pub(crate) fn to_json(&self, externalize: bool) -> Value {
        let mut ordered: BTreeMap<String, Value> = BTreeMap::new();
        ordered.insert(
            FROZEN_CLASS_FIELD.to_string(),
            Value::String(self.inner.class_name.clone()),
        );

        for (key, value) in &self.inner.fields {
            if externalize {
                match value {
                    FrozenValue::Message(message) => {
                        ordered.insert(
                            format!("{key}__hash_key"),
                            Value::String(message.hash_key()),
                        );
                        continue;
                    }
                    FrozenValue::Tuple(items)
                        if !items.is_empty()
                            && items.iter().all(|i| matches!(i, FrozenValue::Message(_))) =>
                    {
                        let hashes = items
                            .iter()
                            .map(|i| match i {
                                FrozenValue::Message(m) => Value::String(m.hash_key()),
                                _ => unreachable!(),
                            })
                            .collect();
                        ordered.insert(format!("{key}__hash_keys"), Value::Array(hashes));
                        continue;
                    }
                    _ => {}
                }
            }
            ordered.insert(key.clone(), value.to_json(externalize));
        }

        Value::Object(Map::from_iter(ordered))
    }

    /// Complete JSON with every nested record and message inlined.
    pub fn full_json(&self) -> String {
        self.to_json(false).to_string()
    }

    /// Canonical serialized JSON of this record (sorted keys, compact).
    pub fn serialized_json(&self) -> String {
        self.to_json(false).to_string()
    }

    /// Content hash of the serialized form, truncated to 40 hex characters
    /// unless the active context asks for full-length keys.
    pub fn hash_key(&self) -> String {
        let full = self
            .inner
            .hash_hex
            .get_or_init(|| hash_hex(&self.serialized_json()));
        truncate_hash(full)
    }

    /// Every message reachable from this record, depth-first.
    pub(crate) fn collect_messages(&self, out: &mut Vec<Message>) {
        for value in self.inner.fields.values() {
            value.collect_messages(out);
        }
    }
}

impl PartialEq for Frozen {
    fn eq(&self, other: &Self) -> bool {
        self.inner.class_name == other.inner.class_name && self.inner.fields == other.inner.fields
    }
}

impl std::fmt::Debug for Frozen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frozen")
            .field("class_", &self.inner.class_name)
            .field("fields", &format!("{} fields", self.inner.fields.len()))
            .finish()
    }
}

impl serde::Serialize for Frozen {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json(false).serialize(serializer)
    }
}

pub(crate) fn hash_hex(serialized: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    format!("{:x}", hasher.finalize())
}

pub(crate) fn truncate_hash(full: &str) -> String {
    let longer = PromisingContext::try_current()
        .map(|ctx| ctx.longer_hash_keys())
        .unwrap_or(false);
    if longer {
        full.to_string()
    } else {
        full[..SHORT_HASH_LEN].to_string()
    }
}

/// Render a `{field}` template against a record. `{{` and `}}` escape to
/// literal braces; placeholders that name no field are left untouched.
pub(crate) fn render_template(template: &str, record: &Frozen) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                match record.get(&name) {
                    Some(value) if closed => out.push_str(&value.render_text()),
                    _ => {
                        out.push('{');
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            other => out.push(other),
        }
    }

    out
}
