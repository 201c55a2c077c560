use crate::config::SinkConfig;
use crate::model::{FieldValue, Point};
use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{debug, info};

/// Destination for points leaving the pipeline.
#[async_trait]
pub trait PointSink: Send + Sync {
    async fn write_point(&self, point: &Point) -> Result<()>;
}

/// Accepts every point without sending it anywhere.
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

#[async_trait]
impl PointSink for NoopSink {
    async fn write_point(&self, point: &Point) -> Result<()> {
        debug!(identity = %point.identity, "noop sink dropped point");
        Ok(())
    }
}

/// Writes points to an InfluxDB `/write` endpoint as line protocol.
#[derive(Debug, Clone)]
pub struct InfluxWriter {
    client: reqwest::Client,
    write_url: String,
    database: String,
    username: Option<String>,
    password: Option<String>,
    tags: BTreeMap<String, String>,
}

impl InfluxWriter {
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let database = config
            .database
            .clone()
            .filter(|db| !db.trim().is_empty())
            .ok_or_else(|| anyhow!("sink database must be set"))?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .context("failed to create InfluxDB client")?;

        let write_url = format!("{}/write", config.url.trim_end_matches('/'));
        info!(url = %write_url, database = %database, "configured InfluxDB sink");

        Ok(Self {
            client,
            write_url,
            database,
            username: config.username.clone(),
            password: config.password.clone(),
            tags: config.tags.clone(),
        })
    }
}

#[async_trait]
impl PointSink for InfluxWriter {
    async fn write_point(&self, point: &Point) -> Result<()> {
        let body = encode_line(point, &self.tags)?;

        let mut request = self
            .client
            .post(&self.write_url)
            .query(&[("db", self.database.as_str()), ("precision", "s")])
            .body(body);
        if let Some(username) = &self.username {
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = request
            .send()
            .await
            .with_context(|| format!("failed to reach {}", self.write_url))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            bail!("InfluxDB rejected write with {status}: {}", text.trim());
        }

        debug!(identity = %point.identity, "wrote point to InfluxDB");
        Ok(())
    }
}

/// Encodes `point` as one line of InfluxDB line protocol with second precision.
pub fn encode_line(point: &Point, tags: &BTreeMap<String, String>) -> Result<String> {
    if point.fields.is_empty() {
        bail!("point {} has no fields", point.identity);
    }

    let mut line = String::with_capacity(64 + point.fields.len() * 24);
    line.push_str(&escape(&point.identity, &[',', ' ']));
    for (key, value) in tags {
        let _ = write!(
            line,
            ",{}={}",
            escape(key, &[',', '=', ' ']),
            escape(value, &[',', '=', ' '])
        );
    }

    line.push(' ');
    for (index, (name, value)) in point.fields.iter().enumerate() {
        if index > 0 {
            line.push(',');
        }
        line.push_str(&escape(name, &[',', '=', ' ']));
        line.push('=');
        match value {
            FieldValue::Float(number) => {
                let _ = write!(line, "{number}");
            }
            FieldValue::Text(text) => {
                line.push('"');
                line.push_str(&escape(text, &['"', '\\']));
                line.push('"');
            }
        }
    }

    let _ = write!(line, " {}", point.timestamp);
    Ok(line)
}

fn escape(raw: &str, special: &[char]) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if special.contains(&ch) {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
