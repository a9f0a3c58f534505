use super::Delivery;
use crate::config::Config;
use crate::telemetry::RawMessage;
use anyhow::{Context, Result};
use async_nats::jetstream::{
    self,
    consumer::{pull, AckPolicy, Consumer},
    AckKind,
};
use chrono::{DateTime, Utc};

/// Owned broker connection plus the durable pull consumer.
pub struct Broker {
    client: async_nats::Client,
    consumer: Consumer<pull::Config>,
}

impl Broker {
    /// Connects and binds the durable consumer, creating it if missing.
    /// The stream itself must already exist.
    pub async fn connect(config: &Config) -> Result<Self> {
        let client = async_nats::ConnectOptions::new()
            .name(&config.nats_name)
            .connect(config.nats_url.as_str())
            .await
            .with_context(|| format!("connect to NATS at {}", config.nats_url))?;

        let js = jetstream::new(client.clone());
        let stream = js
            .get_stream(&config.stream)
            .await
            .with_context(|| format!("look up stream {}", config.stream))?;

        let consumer = stream
            .get_or_create_consumer(&config.durable, consumer_config(config))
            .await
            .with_context(|| format!("bind durable consumer {}", config.durable))?;

        tracing::info!(
            url = %config.nats_url,
            stream = %config.stream,
            durable = %config.durable,
            subject = %config.subject,
            "subscribed to telemetry stream"
        );

        Ok(Self { client, consumer })
    }

    /// Pulls one message per request, so a handler never holds more than
    /// the delivery it is working on when shutdown starts.
    pub async fn messages(&self) -> Result<pull::Stream> {
        self.consumer
            .stream()
            .max_messages_per_batch(1)
            .messages()
            .await
            .context("open pull message stream")
    }

    /// Flushes pending acks before the connection is dropped.
    pub async fn close(self) -> Result<()> {
        self.client
            .flush()
            .await
            .context("flush NATS connection")
    }
}

/// Durable consumer settings. Unacked deliveries are capped at the handler
/// count, so the broker holds back everything a handler has not started.
fn consumer_config(config: &Config) -> pull::Config {
    pull::Config {
        durable_name: Some(config.durable.clone()),
        filter_subject: config.subject.clone(),
        ack_policy: AckPolicy::Explicit,
        ack_wait: config.ack_wait(),
        max_deliver: config.max_deliver,
        max_ack_pending: i64::try_from(config.handlers).unwrap_or(i64::MAX),
        ..Default::default()
    }
}

impl Delivery for jetstream::Message {
    fn raw(&self) -> RawMessage {
        let (received_at, delivered) = match self.info() {
            Ok(info) => (
                DateTime::from_timestamp(
                    info.published.unix_timestamp(),
                    info.published.nanosecond(),
                )
                .unwrap_or_else(Utc::now),
                info.delivered,
            ),
            Err(err) => {
                tracing::debug!(error = %err, subject = %self.subject, "missing jetstream metadata");
                (Utc::now(), 1)
            }
        };

        RawMessage {
            subject: self.subject.to_string(),
            payload: self.payload.clone(),
            received_at,
            delivered,
        }
    }

    async fn ack(&self) -> Result<()> {
        jetstream::Message::ack(self)
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))
    }

    async fn nak(&self) -> Result<()> {
        self.ack_with(AckKind::Nak(None))
            .await
            .map_err(|err| anyhow::anyhow!(err.to_string()))
    }
}
