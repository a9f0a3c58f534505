mod influx;
mod line_protocol;

pub use influx::InfluxSink;

use crate::config::Config;
use crate::telemetry::Record;
use anyhow::Result;
use reqwest::StatusCode;
use std::future::Future;

/// Error text fragments the store uses for points it will never accept.
const PERMANENT_PATTERNS: [&str; 3] = [
    "outside retention policy",
    "beyond retention policy",
    "unprocessable entity",
];

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("{status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    Accepted,
    PermanentReject(String),
    TransientFailure(String),
}

/// Sorts a failed write into retry-or-drop. Permanent only for the
/// retention and unprocessable-point cases; anything unknown is retried.
pub fn classify(err: &SinkError) -> WriteOutcome {
    let text = err.to_string();
    if let SinkError::Status { status, .. } = err {
        if *status == StatusCode::UNPROCESSABLE_ENTITY {
            return WriteOutcome::PermanentReject(text);
        }
    }
    let lowered = text.to_ascii_lowercase();
    if PERMANENT_PATTERNS
        .iter()
        .any(|pattern| lowered.contains(pattern))
    {
        WriteOutcome::PermanentReject(text)
    } else {
        WriteOutcome::TransientFailure(text)
    }
}

pub trait PointSink: Send + Sync {
    fn write(&self, record: &Record) -> impl Future<Output = WriteOutcome> + Send;
}

#[derive(Clone, Debug)]
pub enum Sink {
    Influx(InfluxSink),
    /// No store configured: points are only logged.
    Diagnostic,
}

impl Sink {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.influx_token.as_deref() {
            Some(token) => {
                let sink = InfluxSink::from_config(config, token)?;
                tracing::info!(
                    endpoint = %sink.endpoint(),
                    org = %config.influx_org,
                    bucket = %config.influx_bucket,
                    "influx enabled"
                );
                Ok(Sink::Influx(sink))
            }
            None => {
                tracing::info!("influx disabled (no INFLUX_TOKEN); points will only be logged");
                Ok(Sink::Diagnostic)
            }
        }
    }
}

impl PointSink for Sink {
    async fn write(&self, record: &Record) -> WriteOutcome {
        match self {
            Sink::Influx(influx) => match influx.write_line(record.to_line_protocol()).await {
                Ok(()) => WriteOutcome::Accepted,
                Err(err) => classify(&err),
            },
            Sink::Diagnostic => {
                let subject = record.tags.get("subject").map(String::as_str).unwrap_or("");
                tracing::info!(
                    target: "diagnostic",
                    subject,
                    timestamp = %record.timestamp.to_rfc3339(),
                    point = %record.to_line_protocol(),
                    "telemetry"
                );
                WriteOutcome::Accepted
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::{FieldValue, MEASUREMENT};
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn status(code: u16, body: &str) -> SinkError {
        SinkError::Status {
            status: StatusCode::from_u16(code).unwrap(),
            body: body.to_string(),
        }
    }

    fn record() -> Record {
        let mut fields = BTreeMap::new();
        fields.insert("raw".to_string(), FieldValue::String("{}".to_string()));
        let mut tags = BTreeMap::new();
        tags.insert("subject".to_string(), "telemetry.demo".to_string());
        Record {
            measurement: MEASUREMENT,
            tags,
            fields,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn retention_errors_are_permanent() {
        let err = status(
            400,
            "partial write: point is outside retention policy dropped=1",
        );
        assert!(matches!(classify(&err), WriteOutcome::PermanentReject(_)));

        let err = status(
            400,
            r#"{"code":"invalid","message":"points beyond retention policy dropped=1"}"#,
        );
        assert!(matches!(classify(&err), WriteOutcome::PermanentReject(_)));
    }

    #[test]
    fn unprocessable_points_are_permanent() {
        assert!(matches!(
            classify(&status(422, "field type conflict")),
            WriteOutcome::PermanentReject(_)
        ));
        assert!(matches!(
            classify(&status(400, r#"{"code":"Unprocessable Entity"}"#)),
            WriteOutcome::PermanentReject(_)
        ));
    }

    #[test]
    fn other_statuses_are_transient() {
        for code in [400, 401, 429, 500, 503] {
            let outcome = classify(&status(code, "try later"));
            assert!(
                matches!(outcome, WriteOutcome::TransientFailure(_)),
                "status {code}"
            );
        }
    }

    #[test]
    fn rejection_reason_keeps_error_text() {
        let outcome = classify(&status(422, "schema conflict on x"));
        assert_eq!(
            outcome,
            WriteOutcome::PermanentReject("422 Unprocessable Entity: schema conflict on x".to_string())
        );
    }

    #[tokio::test]
    async fn diagnostic_sink_always_accepts() {
        assert_eq!(Sink::Diagnostic.write(&record()).await, WriteOutcome::Accepted);
    }

    #[tokio::test]
    async fn unreachable_store_is_transient() {
        let influx = InfluxSink::new(
            "http://127.0.0.1:1",
            "r4f",
            "telemetry_raw",
            "token",
            Duration::from_secs(2),
        )
        .unwrap();
        let outcome = Sink::Influx(influx).write(&record()).await;
        assert!(matches!(outcome, WriteOutcome::TransientFailure(_)));
    }
}
