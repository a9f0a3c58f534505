mod config;
mod consumer;
mod sink;
mod stats;
mod telemetry;
mod timestamp;

use crate::config::Config;
use crate::consumer::{Broker, HandlerExit};
use crate::sink::Sink;
use crate::stats::IngestStats;
use anyhow::Result;
use std::sync::Arc;
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

fn init_tracing(config: &Config) -> Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_otlp::WithExportConfig;
    use opentelemetry_sdk::{runtime::Tokio, trace::Config as OTelTraceConfig, Resource};
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,telem_worker=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true);

    if let Some(endpoint) = &config.otlp_endpoint {
        let endpoint = normalize_otlp_http_endpoint(endpoint);
        let exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(endpoint);
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(exporter)
            .with_trace_config(OTelTraceConfig::default().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "telem-worker"),
            ])))
            .install_batch(Tokio)?;

        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .with(otel_layer)
            .try_init()?;
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .try_init()?;
    }

    Ok(())
}

fn normalize_otlp_http_endpoint(endpoint: &str) -> String {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return String::new();
    }
    if trimmed.contains("/v1/traces") {
        return trimmed.to_string();
    }
    format!("{}/v1/traces", trimmed.trim_end_matches('/'))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error=%err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error=%err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing(&config)?;

    let broker = Broker::connect(&config).await?;
    let sink = Sink::from_config(&config)?;
    let stats = Arc::new(IngestStats::new());
    let cancel = CancellationToken::new();

    let mut handlers = JoinSet::new();
    for handler_id in 0..config.handlers {
        let messages = broker.messages().await?;
        let sink = sink.clone();
        let stats = stats.clone();
        let cancel = cancel.clone();
        handlers.spawn(async move {
            let exit = consumer::run(messages, &sink, &stats, cancel).await;
            (handler_id, exit)
        });
    }
    tracing::info!(
        handlers = config.handlers,
        subject = %config.subject,
        "worker running"
    );

    let stats_handle = config.stats_interval().map(|interval| {
        let stats = stats.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                stats.log_snapshot("worker stats");
            }
        })
    });

    let mut failure = None;
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received; draining in-flight messages");
        }
        Some(joined) = handlers.join_next() => {
            failure = handler_failure(joined);
        }
    }

    cancel.cancel();
    while let Some(joined) = handlers.join_next().await {
        if let Some(err) = handler_failure(joined) {
            failure.get_or_insert(err);
        }
    }
    if let Some(handle) = stats_handle {
        handle.abort();
    }

    if let Err(err) = broker.close().await {
        tracing::warn!(error=%err, "failed to flush broker connection");
    }
    stats.log_snapshot("worker stopped");

    match failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// A handler that stops on its own (stream ended, task panicked) takes the
/// whole worker down with a non-zero exit. Only a cancelled handler is clean.
fn handler_failure(joined: Result<(usize, HandlerExit), JoinError>) -> Option<anyhow::Error> {
    match joined {
        Ok((_, HandlerExit::Cancelled)) => None,
        Ok((handler_id, HandlerExit::StreamEnded)) => {
            tracing::error!(handler_id, "delivery stream ended");
            Some(anyhow::anyhow!("handler {handler_id}: delivery stream ended"))
        }
        Err(err) => {
            tracing::error!(error=%err, "handler task failed");
            Some(anyhow::Error::new(err).context("handler task failed"))
        }
    }
}
