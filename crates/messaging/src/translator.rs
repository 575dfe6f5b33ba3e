use crate::envelope::{
    APPLICATION_ID, BODY, CORRELATION_ID, ERROR_MESSAGE, Envelope, FieldValue, OPERATION,
    REPLY_TO, RETRY_COUNT, RETURN_CODE, TRACE,
};

use std::error::Error;
use std::fmt::Debug;

use bytes::Bytes;
use indexmap::IndexMap;
use thiserror::Error;

/// Marker trait for translator errors
pub trait TranslatorError: Error + Send + Sync + 'static {}

/// A trait converting envelopes to and from a transport-native message.
pub trait Translator
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The transport-native message type.
    type Message: Clone + Debug + Send + Sync + 'static;

    /// The error type for the translator.
    type Error: TranslatorError;

    /// Encodes an envelope.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented by the transport.
    fn encode(&self, envelope: &Envelope) -> Result<Self::Message, Self::Error>;

    /// Decodes a native message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is malformed.
    fn decode(&self, message: &Self::Message) -> Result<Envelope, Self::Error>;
}

/// Header carrying the body encoding.
pub const BODY_KIND_HEADER: &str = "body-kind";

/// Prefix of headers carrying non-reserved fields.
pub const EXTRA_FIELD_PREFIX: &str = "x-field-";

const BODY_KIND_TEXT: &str = "text";
const BODY_KIND_BYTES: &str = "bytes";

/// A headers-plus-payload message, the common shape of broker messages.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawMessage {
    /// String headers, in field order.
    pub headers: IndexMap<String, String>,

    /// The message payload.
    pub payload: Bytes,
}

/// Errors that can occur when translating header-based messages.
#[derive(Debug, Error)]
pub enum HeaderTranslatorError {
    /// A header could not be parsed as the type its field requires.
    #[error("header '{header}' has invalid value '{value}'")]
    InvalidHeader {
        /// The header name.
        header: String,

        /// The rejected value.
        value: String,
    },

    /// The body kind header is unknown.
    #[error("unknown body kind '{0}'")]
    UnknownBodyKind(String),

    /// A text body is not valid UTF-8.
    #[error("text body is not valid UTF-8")]
    InvalidUtf8,

    /// An extra field could not be serialized or deserialized.
    #[error(transparent)]
    ExtraField(#[from] serde_json::Error),
}

impl TranslatorError for HeaderTranslatorError {}

/// Translates envelopes into [`RawMessage`]s.
///
/// Reserved fields travel as plain headers, the body as the payload, and any
/// other field as an `x-field-` header holding its JSON-encoded typed value.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderTranslator;

#[derive(Clone, Copy)]
enum HeaderType {
    Text,
    Integer,
    Boolean,
}

fn reserved_header_type(name: &str) -> Option<HeaderType> {
    match name {
        CORRELATION_ID | REPLY_TO | APPLICATION_ID | ERROR_MESSAGE | OPERATION => {
            Some(HeaderType::Text)
        }
        RETRY_COUNT | RETURN_CODE => Some(HeaderType::Integer),
        TRACE => Some(HeaderType::Boolean),
        _ => None,
    }
}

impl HeaderTranslator {
    fn plain_header(name: &str, value: &FieldValue) -> Option<String> {
        match (reserved_header_type(name)?, value) {
            (HeaderType::Text, FieldValue::Text(text)) => Some(text.clone()),
            (HeaderType::Integer, FieldValue::Integer(value)) => Some(value.to_string()),
            (HeaderType::Boolean, FieldValue::Boolean(value)) => Some(value.to_string()),
            _ => None,
        }
    }

    fn parse_header(
        name: &str,
        kind: HeaderType,
        value: &str,
    ) -> Result<FieldValue, HeaderTranslatorError> {
        let invalid = || HeaderTranslatorError::InvalidHeader {
            header: name.to_string(),
            value: value.to_string(),
        };

        match kind {
            HeaderType::Text => Ok(FieldValue::Text(value.to_string())),
            HeaderType::Integer => value
                .parse::<i64>()
                .map(FieldValue::Integer)
                .map_err(|_| invalid()),
            HeaderType::Boolean => value
                .parse::<bool>()
                .map(FieldValue::Boolean)
                .map_err(|_| invalid()),
        }
    }
}

impl Translator for HeaderTranslator {
    type Message = RawMessage;
    type Error = HeaderTranslatorError;

    fn encode(&self, envelope: &Envelope) -> Result<RawMessage, HeaderTranslatorError> {
        let mut message = RawMessage::default();

        for (name, value) in envelope.iter() {
            if name == BODY {
                match value {
                    FieldValue::Text(text) => {
                        message.payload = Bytes::copy_from_slice(text.as_bytes());
                        message
                            .headers
                            .insert(BODY_KIND_HEADER.to_string(), BODY_KIND_TEXT.to_string());
                        continue;
                    }
                    FieldValue::Bytes(bytes) => {
                        message.payload = bytes.clone();
                        message
                            .headers
                            .insert(BODY_KIND_HEADER.to_string(), BODY_KIND_BYTES.to_string());
                        continue;
                    }
                    _ => {}
                }
            }

            if let Some(header) = Self::plain_header(name, value) {
                message.headers.insert(name.to_string(), header);
            } else {
                message.headers.insert(
                    format!("{EXTRA_FIELD_PREFIX}{name}"),
                    serde_json::to_string(value)?,
                );
            }
        }

        Ok(message)
    }

    fn decode(&self, message: &RawMessage) -> Result<Envelope, HeaderTranslatorError> {
        let mut envelope = Envelope::new();

        for (header, value) in &message.headers {
            if let Some(name) = header.strip_prefix(EXTRA_FIELD_PREFIX) {
                let field: FieldValue = serde_json::from_str(value)?;
                envelope.insert(name, field);
            } else if header == BODY_KIND_HEADER {
                match value.as_str() {
                    BODY_KIND_TEXT => {
                        let text = std::str::from_utf8(&message.payload)
                            .map_err(|_| HeaderTranslatorError::InvalidUtf8)?;
                        envelope.set_body_text(text);
                    }
                    BODY_KIND_BYTES => envelope.set_body_bytes(message.payload.clone()),
                    other => {
                        return Err(HeaderTranslatorError::UnknownBodyKind(other.to_string()));
                    }
                }
            } else if let Some(kind) = reserved_header_type(header) {
                envelope.insert(header.as_str(), Self::parse_header(header, kind, value)?);
            }
        }

        if !message.headers.contains_key(BODY_KIND_HEADER) && !message.payload.is_empty() {
            envelope.set_body_bytes(message.payload.clone());
        }

        Ok(envelope)
    }
}
