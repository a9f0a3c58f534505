use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

pub const MEASUREMENT: &str = "telemetry";

const RAW_FIELD: &str = "raw";
const SUBJECT_TAG: &str = "subject";
const TOPIC_TAG: &str = "topic";

/// One broker delivery, as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct RawMessage {
    pub subject: String,
    pub payload: Bytes,
    /// Time the broker durably stored the message.
    pub received_at: DateTime<Utc>,
    pub delivered: i64,
}

impl RawMessage {
    pub fn payload_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar {
    Float(f64),
    Boolean(bool),
}

impl Scalar {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(number) => number.as_f64().map(Scalar::Float),
            Value::Bool(flag) => Some(Scalar::Boolean(*flag)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Float(f64),
    Boolean(bool),
    String(String),
}

impl From<Scalar> for FieldValue {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Float(v) => FieldValue::Float(v),
            Scalar::Boolean(v) => FieldValue::Boolean(v),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("empty payload")]
    Empty,
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Recognized members of a telemetry payload. Members of an unexpected
/// type are skipped one by one instead of failing the whole payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedPayload {
    pub ts_ns: Option<i64>,
    pub topic: Option<String>,
    pub data: BTreeMap<String, Scalar>,
    /// Top-level scalar members that are not control keys.
    pub extra: BTreeMap<String, Scalar>,
}

impl ParsedPayload {
    /// Decodes the first JSON value in `payload`; trailing bytes are ignored.
    /// Invalid UTF-8 is replaced with U+FFFD first, so one bad string does
    /// not cost the rest of the members.
    pub fn decode(payload: &[u8]) -> Result<Self, PayloadError> {
        let text = String::from_utf8_lossy(payload);
        let mut values = serde_json::Deserializer::from_str(&text).into_iter::<Value>();
        match values.next() {
            None => Err(PayloadError::Empty),
            Some(Err(err)) => Err(err.into()),
            Some(Ok(Value::Object(map))) => Ok(Self::from_object(map)),
            Some(Ok(_)) => Err(PayloadError::NotAnObject),
        }
    }

    fn from_object(map: Map<String, Value>) -> Self {
        let mut parsed = Self::default();
        for (key, value) in map {
            match key.as_str() {
                // Integer literals only; floats and strings are not overrides.
                "ts_ns" => parsed.ts_ns = value.as_i64(),
                "topic" => parsed.topic = value.as_str().map(str::to_string),
                "data" => {
                    if let Value::Object(data) = value {
                        parsed.data = data
                            .into_iter()
                            .filter_map(|(k, v)| Scalar::from_json(&v).map(|s| (k, s)))
                            .collect();
                    }
                }
                "trace_id" => {}
                _ => {
                    if let Some(scalar) = Scalar::from_json(&value) {
                        parsed.extra.insert(key, scalar);
                    }
                }
            }
        }
        parsed
    }
}

pub type FieldSet = BTreeMap<String, FieldValue>;

/// Flattens `data` and top-level scalars into one field set. Top-level
/// members are applied last and win on a name collision.
pub fn extract_fields(payload: &ParsedPayload) -> (FieldSet, String) {
    let topic = payload.topic.clone().unwrap_or_default();
    let mut fields = FieldSet::new();
    for (key, value) in payload.data.iter().chain(payload.extra.iter()) {
        fields.insert(key.clone(), FieldValue::from(*value));
    }
    (fields, topic)
}

/// A single point ready for the sink.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub measurement: &'static str,
    pub tags: BTreeMap<String, String>,
    pub fields: FieldSet,
    pub timestamp: DateTime<Utc>,
}

pub fn build_record(
    raw: &RawMessage,
    timestamp: DateTime<Utc>,
    mut fields: FieldSet,
    topic: &str,
) -> Record {
    fields.insert(
        RAW_FIELD.to_string(),
        FieldValue::String(raw.payload_text().into_owned()),
    );

    let mut tags = BTreeMap::new();
    tags.insert(SUBJECT_TAG.to_string(), raw.subject.clone());
    if !topic.is_empty() {
        tags.insert(TOPIC_TAG.to_string(), topic.to_string());
    }

    Record {
        measurement: MEASUREMENT,
        tags,
        fields,
        timestamp,
    }
}
