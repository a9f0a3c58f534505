use super::SinkError;
use crate::config::Config;
use anyhow::{Context, Result};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use std::time::Duration;

/// One request per point against the InfluxDB v2 `/api/v2/write` endpoint.
/// Clones share one connection pool.
#[derive(Clone, Debug)]
pub struct InfluxSink {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl InfluxSink {
    pub fn new(
        base_url: &str,
        org: &str,
        bucket: &str,
        token: &str,
        timeout: Duration,
    ) -> Result<Self> {
        let mut endpoint = Url::parse(&format!("{}/api/v2/write", base_url.trim_end_matches('/')))
            .with_context(|| format!("invalid influx url {base_url}"))?;
        endpoint
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket)
            .append_pair("precision", "ns");

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("build influx http client")?;

        Ok(Self {
            client,
            endpoint,
            token: token.to_string(),
        })
    }

    pub fn from_config(config: &Config, token: &str) -> Result<Self> {
        Self::new(
            &config.influx_url,
            &config.influx_org,
            &config.influx_bucket,
            token,
            config.influx_timeout(),
        )
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub async fn write_line(&self, line: String) -> Result<(), SinkError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(line)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(SinkError::Status {
            status,
            body: body.trim().to_string(),
        })
    }
}
