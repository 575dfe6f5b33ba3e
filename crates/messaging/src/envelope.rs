use std::fmt::{self, Display};

use bytes::Bytes;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Name of the correlation ID field.
pub const CORRELATION_ID: &str = "correlation-id";

/// Name of the reply destination field.
pub const REPLY_TO: &str = "reply-to";

/// Name of the application ID field.
pub const APPLICATION_ID: &str = "application-id";

/// Name of the body field.
pub const BODY: &str = "body";

/// Name of the retry counter field.
pub const RETRY_COUNT: &str = "retry-count";

/// Name of the diagnostic trace flag field.
pub const TRACE: &str = "trace";

/// Name of the return code field.
pub const RETURN_CODE: &str = "return-code";

/// Name of the error message field.
pub const ERROR_MESSAGE: &str = "error-message";

/// Name of the operation field.
pub const OPERATION: &str = "operation";

/// Message group identifier carried by group control messages.
pub const MSG_GROUP_ID: &str = "msg-group-id";

/// Every field the core is allowed to inspect.
pub const RESERVED_FIELDS: [&str; 9] = [
    CORRELATION_ID,
    REPLY_TO,
    APPLICATION_ID,
    BODY,
    RETRY_COUNT,
    TRACE,
    RETURN_CODE,
    ERROR_MESSAGE,
    OPERATION,
];

/// A typed envelope field value.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum FieldValue {
    /// UTF-8 text.
    Text(String),

    /// Opaque bytes.
    Bytes(Bytes),

    /// Signed integer.
    Integer(i64),

    /// Boolean flag.
    Boolean(bool),
}

impl FieldValue {
    /// Returns the text value, if this is a text field.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    /// Returns the integer value, if this is an integer field.
    #[must_use]
    pub const fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns the boolean value, if this is a boolean field.
    #[must_use]
    pub const fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(value) => Some(*value),
            _ => None,
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<Bytes> for FieldValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

/// Status codes carried in the `return-code` field of replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReturnCode {
    /// The request was handled.
    Success,

    /// The request was malformed.
    BadRequest,

    /// The request referenced something unknown.
    NotFound,

    /// The handler failed.
    ServerError,
}

impl ReturnCode {
    /// Numeric value written to the envelope.
    #[must_use]
    pub const fn code(self) -> i64 {
        match self {
            Self::Success => 0,
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::ServerError => 500,
        }
    }

    /// Parses a numeric return code.
    #[must_use]
    pub const fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            400 => Some(Self::BadRequest),
            404 => Some(Self::NotFound),
            500 => Some(Self::ServerError),
            _ => None,
        }
    }
}

impl Display for ReturnCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::BadRequest => write!(f, "bad request"),
            Self::NotFound => write!(f, "not found"),
            Self::ServerError => write!(f, "server error"),
        }
    }
}

/// The generic field-map representation of a message.
///
/// Fields keep their insertion order. Only the reserved fields are
/// interpreted by the request/reply machinery; the body is opaque.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Envelope {
    fields: IndexMap<String, FieldValue>,
}

impl Envelope {
    /// Creates an empty envelope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an envelope with a text body.
    #[must_use]
    pub fn text<K>(body: K) -> Self
    where
        K: Into<String>,
    {
        let mut envelope = Self::new();
        envelope.set_body_text(body);
        envelope
    }

    /// Creates an envelope with a binary body.
    #[must_use]
    pub fn binary<B>(body: B) -> Self
    where
        B: Into<Bytes>,
    {
        let mut envelope = Self::new();
        envelope.set_body_bytes(body);
        envelope
    }

    /// Gets a field by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Sets a field, replacing any previous value in place.
    pub fn insert<K, V>(&mut self, name: K, value: V) -> Option<FieldValue>
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        self.fields.insert(name.into(), value.into())
    }

    /// Removes a field, keeping the order of the remaining ones.
    pub fn remove(&mut self, name: &str) -> Option<FieldValue> {
        self.fields.shift_remove(name)
    }

    /// Iterates fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the envelope has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    fn text_field(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(FieldValue::as_text)
    }

    /// The body, text or binary.
    #[must_use]
    pub fn body(&self) -> Option<&FieldValue> {
        self.get(BODY)
    }

    /// The body as text. Binary bodies are returned when valid UTF-8.
    #[must_use]
    pub fn body_text(&self) -> Option<&str> {
        match self.body()? {
            FieldValue::Text(text) => Some(text),
            FieldValue::Bytes(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    /// The body as raw bytes.
    #[must_use]
    pub fn body_bytes(&self) -> Option<Bytes> {
        match self.body()? {
            FieldValue::Text(text) => Some(Bytes::copy_from_slice(text.as_bytes())),
            FieldValue::Bytes(bytes) => Some(bytes.clone()),
            _ => None,
        }
    }

    /// Sets a text body.
    pub fn set_body_text<K>(&mut self, body: K)
    where
        K: Into<String>,
    {
        self.insert(BODY, FieldValue::Text(body.into()));
    }

    /// Sets a binary body.
    pub fn set_body_bytes<B>(&mut self, body: B)
    where
        B: Into<Bytes>,
    {
        self.insert(BODY, FieldValue::Bytes(body.into()));
    }

    /// The correlation ID.
    #[must_use]
    pub fn correlation_id(&self) -> Option<&str> {
        self.text_field(CORRELATION_ID)
    }

    /// Sets the correlation ID.
    pub fn set_correlation_id<K>(&mut self, correlation_id: K)
    where
        K: Into<String>,
    {
        self.insert(CORRELATION_ID, FieldValue::Text(correlation_id.into()));
    }

    /// The reply destination.
    #[must_use]
    pub fn reply_to(&self) -> Option<&str> {
        self.text_field(REPLY_TO)
    }

    /// Sets the reply destination.
    pub fn set_reply_to<K>(&mut self, reply_to: K)
    where
        K: Into<String>,
    {
        self.insert(REPLY_TO, FieldValue::Text(reply_to.into()));
    }

    /// The application ID of the sender.
    #[must_use]
    pub fn application_id(&self) -> Option<&str> {
        self.text_field(APPLICATION_ID)
    }

    /// Sets the application ID.
    pub fn set_application_id<K>(&mut self, application_id: K)
    where
        K: Into<String>,
    {
        self.insert(APPLICATION_ID, FieldValue::Text(application_id.into()));
    }

    /// The retry counter, zero when absent.
    #[must_use]
    pub fn retry_count(&self) -> i64 {
        self.get(RETRY_COUNT)
            .and_then(FieldValue::as_integer)
            .unwrap_or(0)
    }

    /// Sets the retry counter.
    pub fn set_retry_count(&mut self, retry_count: i64) {
        self.insert(RETRY_COUNT, FieldValue::Integer(retry_count));
    }

    /// Whether diagnostic tracing is requested, false when absent.
    #[must_use]
    pub fn trace(&self) -> bool {
        self.get(TRACE)
            .and_then(FieldValue::as_boolean)
            .unwrap_or(false)
    }

    /// Sets the diagnostic trace flag.
    pub fn set_trace(&mut self, trace: bool) {
        self.insert(TRACE, FieldValue::Boolean(trace));
    }

    /// The raw return code.
    #[must_use]
    pub fn return_code(&self) -> Option<i64> {
        self.get(RETURN_CODE).and_then(FieldValue::as_integer)
    }

    /// Sets the return code.
    pub fn set_return_code(&mut self, return_code: ReturnCode) {
        self.insert(RETURN_CODE, FieldValue::Integer(return_code.code()));
    }

    /// The error message.
    #[must_use]
    pub fn error_message(&self) -> Option<&str> {
        self.text_field(ERROR_MESSAGE)
    }

    /// Sets the error message.
    pub fn set_error_message<K>(&mut self, error_message: K)
    where
        K: Into<String>,
    {
        self.insert(ERROR_MESSAGE, FieldValue::Text(error_message.into()));
    }

    /// The requested operation.
    #[must_use]
    pub fn operation(&self) -> Option<&str> {
        self.text_field(OPERATION)
    }

    /// Sets the requested operation.
    pub fn set_operation<K>(&mut self, operation: K)
    where
        K: Into<String>,
    {
        self.insert(OPERATION, FieldValue::Text(operation.into()));
    }

    /// The message group carried by group control messages.
    #[must_use]
    pub fn msg_group_id(&self) -> Option<&str> {
        self.text_field(MSG_GROUP_ID)
    }

    /// Sets the message group of a control message.
    pub fn set_msg_group_id<K>(&mut self, group_id: K)
    where
        K: Into<String>,
    {
        self.insert(MSG_GROUP_ID, FieldValue::Text(group_id.into()));
    }

    /// Builds a reply skeleton carrying this envelope's correlation ID.
    #[must_use]
    pub fn reply(&self, return_code: ReturnCode) -> Self {
        let mut reply = Self::new();
        if let Some(correlation_id) = self.correlation_id() {
            reply.set_correlation_id(correlation_id);
        }
        reply.set_return_code(return_code);
        reply
    }
}

impl<K, V> FromIterator<(K, V)> for Envelope
where
    K: Into<String>,
    V: Into<FieldValue>,
{
    fn from_iter<I>(iter: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}
