//! Historical storage API source.
//!
//! Issues one query against the network server's storage integration for a
//! bounded time window and parses the newline-delimited JSON response.
//!
//! # Response Format
//!
//! ```text
//! {"result": {"end_device_ids": {...}, "received_at": "...", "uplink_message": {...}}}
//! {"result": {...}}
//! ```
//!
//! Each line is parsed on its own. A malformed line is reported and skipped;
//! a line without a `result` field is a control line and is ignored.

use super::{EnvelopeSource, SourceItem, SourceStats};
use crate::{Error, Result};
use async_trait::async_trait;
use fieldsync_core::RawEnvelope;
use reqwest::header::ACCEPT;
use serde_json::Value;
use std::time::Duration;

/// Upper bound on one historical query, connection through body.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the historical source.
#[derive(Debug, Clone)]
pub struct HistoricalConfig {
    /// Base URL of the network server, e.g. `https://nam1.cloud.thethings.network`.
    pub api_base: String,

    pub application_id: String,

    pub device_id: String,

    /// Bearer token for the storage API.
    pub api_key: Option<String>,

    /// How far back to query.
    pub window: Duration,

    /// Request timeout.
    pub timeout: Duration,
}

impl Default for HistoricalConfig {
    fn default() -> Self {
        Self {
            api_base: "https://nam1.cloud.thethings.network".to_string(),
            application_id: String::new(),
            device_id: String::new(),
            api_key: None,
            window: Duration::from_secs(12 * 3600),
            timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl HistoricalConfig {
    /// Storage endpoint for the configured device's uplinks.
    pub fn storage_url(&self) -> String {
        format!(
            "{}/api/v3/as/applications/{}/devices/{}/packages/storage/uplink_message",
            self.api_base.trim_end_matches('/'),
            self.application_id,
            self.device_id
        )
    }
}

/// Pull-based source: one bounded query per process start.
pub struct HistoricalFetcher {
    config: HistoricalConfig,
    client: reqwest::Client,
}

impl HistoricalFetcher {
    /// Create a fetcher with the given configuration.
    pub fn new(config: HistoricalConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &HistoricalConfig {
        &self.config
    }

    /// Fetch every envelope received within `window`.
    ///
    /// Malformed lines are logged and dropped. Any transport failure is
    /// returned as [`Error::Transport`].
    pub async fn fetch(&self, window: Duration) -> Result<Vec<RawEnvelope>> {
        let parsed = self.fetch_stream(window).await?;
        Ok(parsed.into_envelopes())
    }

    async fn fetch_stream(&self, window: Duration) -> Result<ParsedStream> {
        let body = self.fetch_body(window).await?;
        let parsed = parse_stream(&body);
        tracing::info!(
            lines = parsed.total_lines,
            envelopes = parsed.envelope_count(),
            malformed = parsed.parse_errors(),
            skipped = parsed.skipped,
            "Processed historical response"
        );
        Ok(parsed)
    }

    async fn fetch_body(&self, window: Duration) -> Result<String> {
        let url = self.config.storage_url();
        let last = format_window(window);
        tracing::info!(url = %url, last = %last, "Fetching historical uplinks");

        let mut request = self
            .client
            .get(&url)
            .query(&[("last", last.as_str())])
            .header(ACCEPT, "text/event-stream");
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Transport(format!("request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Transport(format!(
                "storage API returned HTTP {status}"
            )));
        }

        response
            .text()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {e}")))
    }
}

#[async_trait]
impl EnvelopeSource for HistoricalFetcher {
    fn name(&self) -> &'static str {
        "historical"
    }

    async fn process<F>(&mut self, mut handler: F) -> Result<SourceStats>
    where
        F: FnMut(SourceItem) -> Result<bool> + Send,
    {
        let parsed = self.fetch_stream(self.config.window).await?;

        let mut stats = SourceStats {
            skipped: parsed.skipped,
            ..Default::default()
        };

        for item in parsed.items {
            stats.total_items += 1;
            match &item {
                SourceItem::Envelope(_) => stats.valid_envelopes += 1,
                SourceItem::Malformed { .. } => stats.parse_errors += 1,
            }
            if !handler(item)? {
                tracing::info!("Handler signaled stop");
                break;
            }
        }

        Ok(stats)
    }
}

/// Result of splitting and parsing one response body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedStream {
    /// Envelopes and malformed-line reports, in line order.
    pub items: Vec<SourceItem>,

    /// Non-blank lines seen.
    pub total_lines: usize,

    /// Lines without a `result` field.
    pub skipped: usize,
}

impl ParsedStream {
    pub fn envelope_count(&self) -> usize {
        self.items
            .iter()
            .filter(|item| matches!(item, SourceItem::Envelope(_)))
            .count()
    }

    pub fn parse_errors(&self) -> usize {
        self.items.len() - self.envelope_count()
    }

    pub fn into_envelopes(self) -> Vec<RawEnvelope> {
        self.items
            .into_iter()
            .filter_map(|item| match item {
                SourceItem::Envelope(envelope) => Some(envelope),
                SourceItem::Malformed { .. } => None,
            })
            .collect()
    }
}

/// Parse a newline-delimited response body.
///
/// One bad line never aborts the batch.
pub fn parse_stream(body: &str) -> ParsedStream {
    let mut parsed = ParsedStream::default();

    for (line_num, line) in body.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        parsed.total_lines += 1;

        let value: Value = match serde_json::from_str(line) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!("Line {}: JSON parse error: {}", line_num + 1, e);
                parsed.items.push(SourceItem::Malformed {
                    reason: format!("line {}: {}", line_num + 1, e),
                });
                continue;
            }
        };

        let result = match value {
            Value::Object(mut fields) => fields.remove("result"),
            _ => None,
        };

        match result {
            Some(result) if result.is_object() => {
                parsed
                    .items
                    .push(SourceItem::Envelope(RawEnvelope::historical(result)));
            }
            Some(_) => {
                tracing::warn!("Line {}: `result` is not an object", line_num + 1);
                parsed.items.push(SourceItem::Malformed {
                    reason: format!("line {}: `result` is not an object", line_num + 1),
                });
            }
            None => {
                tracing::debug!("Line {}: no result data, skipping", line_num + 1);
                parsed.skipped += 1;
            }
        }
    }

    parsed
}

/// Render a window as the storage API's `last` parameter (`12h`, `90m`, `45s`).
pub fn format_window(window: Duration) -> String {
    let secs = window.as_secs();
    if secs > 0 && secs.is_multiple_of(3600) {
        format!("{}h", secs / 3600)
    } else if secs > 0 && secs.is_multiple_of(60) {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}

/// Parse a window such as `30m`, `12h` or `2d`. A bare number is seconds.
pub fn parse_window(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);

    let amount: u64 = digits
        .parse()
        .map_err(|_| Error::Config(format!("invalid window '{input}': expected e.g. 12h")))?;

    let multiplier = match unit {
        "" | "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86_400,
        other => {
            return Err(Error::Config(format!(
                "invalid window unit '{other}' in '{input}': use s, m, h or d"
            )));
        }
    };

    if amount == 0 {
        return Err(Error::Config(format!("window '{input}' must be positive")));
    }

    let secs = amount
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Config(format!("window '{input}' is too large")))?;
    Ok(Duration::from_secs(secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn result_line(device_id: &str, received_at: &str) -> String {
        json!({
            "result": {
                "end_device_ids": { "device_id": device_id },
                "received_at": received_at,
                "uplink_message": { "decoded_payload": { "Bat": 3.6 } }
            }
        })
        .to_string()
    }

    /// Serve one canned HTTP response and hand back the raw request text.
    async fn serve_once(
        status_line: &'static str,
        body: String,
    ) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];
            let n = socket.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();

            let response = format!(
                "{status_line}\r\nContent-Type: text/event-stream\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            socket.shutdown().await.unwrap();
            request
        });

        (format!("http://{addr}"), handle)
    }

    fn config(api_base: String) -> HistoricalConfig {
        HistoricalConfig {
            api_base,
            application_id: "soil-app".to_string(),
            device_id: "sensor-1".to_string(),
            api_key: Some("secret-key".to_string()),
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_stream_one_bad_line_among_ten() {
        let mut lines: Vec<String> = (0..10)
            .map(|i| result_line("sensor-1", &format!("2024-01-01T{i:02}:00:00Z")))
            .collect();
        lines.insert(4, "{\"result\": {\"end_device_ids\": ".to_string());
        let body = lines.join("\n");

        let parsed = parse_stream(&body);
        assert_eq!(parsed.total_lines, 11);
        assert_eq!(parsed.envelope_count(), 10);
        assert_eq!(parsed.parse_errors(), 1);
        assert!(matches!(parsed.items[4], SourceItem::Malformed { .. }));
    }

    #[test]
    fn test_parse_stream_skips_control_and_blank_lines() {
        let body = format!(
            "\n{}\n   \n{{\"heartbeat\": true}}\n{}\n",
            result_line("sensor-1", "t1"),
            result_line("sensor-1", "t2")
        );
        let parsed = parse_stream(&body);

        assert_eq!(parsed.total_lines, 3);
        assert_eq!(parsed.skipped, 1);
        assert_eq!(parsed.envelope_count(), 2);
        assert_eq!(parsed.parse_errors(), 0);

        let envelopes = parsed.into_envelopes();
        assert_eq!(envelopes[0].received_at(), Some("t1"));
        assert_eq!(envelopes[1].received_at(), Some("t2"));
    }

    #[test]
    fn test_parse_stream_non_object_result_is_malformed() {
        let parsed = parse_stream("{\"result\": 42}\n[1,2]");
        assert_eq!(parsed.parse_errors(), 1);
        assert_eq!(parsed.skipped, 1);
    }

    #[test]
    fn test_parse_stream_empty_body() {
        let parsed = parse_stream("");
        assert!(parsed.items.is_empty());
        assert_eq!(parsed.total_lines, 0);
    }

    #[test]
    fn test_storage_url() {
        let cfg = config("https://eu1.cloud.thethings.network/".to_string());
        assert_eq!(
            cfg.storage_url(),
            "https://eu1.cloud.thethings.network/api/v3/as/applications/soil-app/devices/sensor-1/packages/storage/uplink_message"
        );
    }

    #[test]
    fn test_format_window() {
        assert_eq!(format_window(Duration::from_secs(12 * 3600)), "12h");
        assert_eq!(format_window(Duration::from_secs(90 * 60)), "90m");
        assert_eq!(format_window(Duration::from_secs(45)), "45s");
        assert_eq!(format_window(Duration::from_secs(2 * 86_400)), "48h");
    }

    #[test]
    fn test_parse_window() {
        assert_eq!(parse_window("12h").unwrap(), Duration::from_secs(43_200));
        assert_eq!(parse_window("30m").unwrap(), Duration::from_secs(1_800));
        assert_eq!(parse_window("2d").unwrap(), Duration::from_secs(172_800));
        assert_eq!(parse_window("90").unwrap(), Duration::from_secs(90));
        assert!(parse_window("").is_err());
        assert!(parse_window("0h").is_err());
        assert!(parse_window("12w").is_err());
        assert!(parse_window("h").is_err());
        assert!(matches!(
            parse_window("300000000000000000d"),
            Err(Error::Config(_))
        ));
        assert_eq!(
            parse_window(&format!("{}s", u64::MAX)).unwrap(),
            Duration::from_secs(u64::MAX)
        );
    }

    #[tokio::test]
    async fn test_fetch_sends_window_and_credentials() {
        let body = format!(
            "{}\n{}\n",
            result_line("sensor-1", "2024-01-01T00:00:00Z"),
            result_line("sensor-1", "2024-01-01T01:00:00Z")
        );
        let (base, server) = serve_once("HTTP/1.1 200 OK", body).await;

        let fetcher = HistoricalFetcher::new(config(base)).unwrap();
        let envelopes = fetcher.fetch(Duration::from_secs(12 * 3600)).await.unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[1].received_at(), Some("2024-01-01T01:00:00Z"));

        let request = server.await.unwrap();
        assert!(request.starts_with(
            "GET /api/v3/as/applications/soil-app/devices/sensor-1/packages/storage/uplink_message?last=12h"
        ));
        let lower = request.to_ascii_lowercase();
        assert!(lower.contains("authorization: bearer secret-key"));
        assert!(lower.contains("accept: text/event-stream"));
    }

    #[tokio::test]
    async fn test_fetch_http_error_is_transport_error() {
        let (base, server) = serve_once("HTTP/1.1 401 Unauthorized", String::new()).await;

        let fetcher = HistoricalFetcher::new(config(base)).unwrap();
        let result = fetcher.fetch(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_transport_error() {
        // Bind then drop to get a port nobody is listening on.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let fetcher = HistoricalFetcher::new(config(format!("http://{addr}"))).unwrap();
        let result = fetcher.fetch(Duration::from_secs(3600)).await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn test_process_delivers_items_in_line_order() {
        let body = format!(
            "{}\nnot json\n{}\n",
            result_line("sensor-1", "t1"),
            result_line("sensor-2", "t2")
        );
        let (base, server) = serve_once("HTTP/1.1 200 OK", body).await;

        let mut fetcher = HistoricalFetcher::new(config(base)).unwrap();
        let mut seen = Vec::new();
        let stats = fetcher
            .process(|item| {
                seen.push(item);
                Ok(true)
            })
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(stats.total_items, 3);
        assert_eq!(stats.valid_envelopes, 2);
        assert_eq!(stats.parse_errors, 1);
        assert!(matches!(seen[1], SourceItem::Malformed { .. }));
        match &seen[2] {
            SourceItem::Envelope(env) => assert_eq!(env.device_id(), Some("sensor-2")),
            other => panic!("unexpected item: {other:?}"),
        }
    }
}
