use async_nats::HeaderMap;
use bytes::Bytes;
use switchyard_messaging::{
    Envelope, HeaderTranslator, HeaderTranslatorError, RawMessage, Translator,
};

/// A message as carried over NATS.
#[derive(Clone, Debug, Default)]
pub struct NatsMessage {
    /// NATS headers.
    pub headers: HeaderMap,

    /// The payload.
    pub payload: Bytes,
}

impl From<RawMessage> for NatsMessage {
    fn from(raw: RawMessage) -> Self {
        let mut headers = HeaderMap::new();
        for (name, value) in &raw.headers {
            headers.insert(name.as_str(), value.as_str());
        }

        Self {
            headers,
            payload: raw.payload,
        }
    }
}

impl From<&NatsMessage> for RawMessage {
    fn from(message: &NatsMessage) -> Self {
        let headers = message
            .headers
            .iter()
            .filter_map(|(name, values)| {
                values
                    .last()
                    .map(|value| (name.to_string(), value.to_string()))
            })
            .collect();

        Self {
            headers,
            payload: message.payload.clone(),
        }
    }
}

/// Translates envelopes to NATS messages through [`HeaderTranslator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NatsTranslator;

impl Translator for NatsTranslator {
    type Message = NatsMessage;
    type Error = HeaderTranslatorError;

    fn encode(&self, envelope: &Envelope) -> Result<NatsMessage, HeaderTranslatorError> {
        HeaderTranslator.encode(envelope).map(NatsMessage::from)
    }

    fn decode(&self, message: &NatsMessage) -> Result<Envelope, HeaderTranslatorError> {
        HeaderTranslator.decode(&RawMessage::from(message))
    }
}
