mod broker;


pub use broker::Broker;

use crate::sink::{PointSink, WriteOutcome};
use crate::stats::{bump, IngestStats};
use crate::telemetry::{build_record, extract_fields, ParsedPayload, RawMessage};
use crate::timestamp;
use anyhow::Result;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::{Stream, StreamExt};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A broker delivery that must be settled exactly once.
pub trait Delivery: Send + Sync {
    fn raw(&self) -> RawMessage;
    fn ack(&self) -> impl Future<Output = Result<()>> + Send;
    /// Asks the broker to redeliver now instead of after the ack wait.
    fn nak(&self) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DropReason {
    InvalidTimestamp,
    Rejected(String),
}

/// Terminal state of one delivery.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Nacked(String),
    Dropped(DropReason),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerExit {
    Cancelled,
    StreamEnded,
}

/// Runs one message from receipt to the acknowledgment decision. Does not
/// talk to the broker; see [`handle`].
pub async fn process<S: PointSink>(
    raw: &RawMessage,
    sink: &S,
    now: DateTime<Utc>,
) -> Disposition {
    let parsed = match ParsedPayload::decode(&raw.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            tracing::debug!(subject = %raw.subject, error = %err, "payload not decoded; keeping raw only");
            ParsedPayload::default()
        }
    };

    let resolution = timestamp::resolve(parsed.ts_ns, raw.received_at, now);
    let Some(ts) = resolution.accepted() else {
        tracing::warn!(
            subject = %raw.subject,
            source = %resolution.source,
            timestamp = %resolution
                .timestamp
                .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Nanos, true))
                .unwrap_or_else(|| format!("unrepresentable ts_ns={:?}", parsed.ts_ns)),
            delivered = raw.delivered,
            "drop bad timestamp"
        );
        return Disposition::Dropped(DropReason::InvalidTimestamp);
    };

    let (fields, topic) = extract_fields(&parsed);
    let record = build_record(raw, ts, fields, &topic);

    match sink.write(&record).await {
        WriteOutcome::Accepted => Disposition::Acked,
        WriteOutcome::PermanentReject(reason) => {
            tracing::warn!(
                subject = %raw.subject,
                timestamp = %ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
                delivered = raw.delivered,
                error = %reason,
                "drop unsalvageable point"
            );
            Disposition::Dropped(DropReason::Rejected(reason))
        }
        WriteOutcome::TransientFailure(reason) => {
            tracing::warn!(
                subject = %raw.subject,
                timestamp = %ts.to_rfc3339_opts(SecondsFormat::Nanos, true),
                delivered = raw.delivered,
                error = %reason,
                "sink write failed (will retry)"
            );
            Disposition::Nacked(reason)
        }
    }
}

/// Processes and settles one delivery: ack for success and drops, nak for
/// transient failures. A failed ack is logged; the broker then redelivers
/// after the ack wait.
pub async fn handle<D: Delivery, S: PointSink>(
    delivery: &D,
    sink: &S,
    stats: &IngestStats,
) -> Disposition {
    let raw = delivery.raw();
    bump(&stats.received);

    let disposition = process(&raw, sink, Utc::now()).await;
    let settled = match &disposition {
        Disposition::Acked => {
            bump(&stats.acked);
            delivery.ack().await
        }
        Disposition::Dropped(reason) => {
            match reason {
                DropReason::InvalidTimestamp => bump(&stats.dropped_timestamp),
                DropReason::Rejected(err) => {
                    bump(&stats.dropped_rejected);
                    stats.record_error(err.clone());
                }
            }
            delivery.ack().await
        }
        Disposition::Nacked(err) => {
            bump(&stats.nacked);
            stats.record_error(err.clone());
            delivery.nak().await
        }
    };

    if let Err(err) = settled {
        bump(&stats.ack_failures);
        tracing::warn!(subject = %raw.subject, error = %err, "failed to settle delivery");
    }

    disposition
}

/// Pulls deliveries one at a time until cancelled or the stream ends.
/// Cancellation is only observed between messages, so an in-flight
/// message always reaches its ack or nak.
pub async fn run<St, D, E, S>(
    deliveries: St,
    sink: &S,
    stats: &IngestStats,
    cancel: CancellationToken,
) -> HandlerExit
where
    St: Stream<Item = Result<D, E>>,
    D: Delivery,
    E: Display,
    S: PointSink,
{
    let mut deliveries = std::pin::pin!(deliveries);
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return HandlerExit::Cancelled,
            next = deliveries.next() => next,
        };

        match next {
            Some(Ok(delivery)) => {
                handle(&delivery, sink, stats).await;
            }
            Some(Err(err)) => {
                tracing::warn!(error = %err, "delivery stream error");
                tokio::select! {
                    _ = cancel.cancelled() => return HandlerExit::Cancelled,
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                }
            }
            None => return HandlerExit::StreamEnded,
        }
    }
}
