//! Minimal Loki push client for shipping parsed records.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Serialize)]
struct PushRequest<'a> {
    streams: Vec<Stream<'a>>,
}

#[derive(Debug, Serialize)]
struct Stream<'a> {
    stream: &'a BTreeMap<String, String>,
    /// `[timestamp_ns, line]` pairs.
    values: Vec<[String; 2]>,
}

pub struct LokiClient {
    push_url: String,
    username: Option<String>,
    password: Option<String>,
    labels: BTreeMap<String, String>,
    http: reqwest::blocking::Client,
}

impl LokiClient {
    pub fn new(
        push_url: impl Into<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::blocking::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build Loki HTTP client")?;

        let labels = BTreeMap::from([
            ("job".to_string(), "xferfaxlog".to_string()),
            ("instance".to_string(), "faxrelay".to_string()),
        ]);

        Ok(Self {
            push_url: push_url.into(),
            username: username.filter(|u| !u.is_empty()),
            password: password.filter(|p| !p.is_empty()),
            labels,
            http,
        })
    }

    /// Push one log line to Loki, stamped with the current time.
    pub fn push(&self, line: &str) -> Result<()> {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos()
            .to_string();
        let body = PushRequest {
            streams: vec![Stream {
                stream: &self.labels,
                values: vec![[ts, line.to_string()]],
            }],
        };

        let mut request = self.http.post(&self.push_url).json(&body);
        if let (Some(user), Some(pass)) = (&self.username, &self.password) {
            request = request.basic_auth(user, Some(pass));
        }

        let response = request
            .send()
            .with_context(|| format!("Failed to send request to Loki at {}", self.push_url))?;

        let status = response.status();
        // Loki answers 204 No Content on success.
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            anyhow::bail!("Loki push failed with status {}: {}", status, text.trim());
        }
        Ok(())
    }

    /// Serialise a value to JSON and push it.
    pub fn push_json<T: Serialize>(&self, value: &T) -> Result<()> {
        let line = serde_json::to_string(value).context("Failed to marshal log entry")?;
        self.push(&line)
    }
}
