//! Live MQTT subscription source.
//!
//! Subscribes to one device's uplink topic on the network server's MQTT
//! integration and hands each published message to the handler as it
//! arrives.
//!
//! # Reconnection
//!
//! There is no in-process retry. An event-loop error (refused credentials,
//! dropped connection) ends the run with [`Error::Subscription`] and the
//! process supervisor is expected to restart the daemon.
//!
//! # Cancellation
//!
//! Cancellation is observed only while waiting for the next packet, never
//! while the handler runs, so a handler invocation always completes.

use super::{EnvelopeSource, SourceItem, SourceStats};
use crate::{Error, Result};
use async_trait::async_trait;
use fieldsync_core::RawEnvelope;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS, SubscribeReasonCode};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

/// Configuration for the live source.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Broker address: `mqtt://host:port`, `tcp://host:port` or `host[:port]`.
    pub broker_url: String,

    pub client_id: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Topic to subscribe to, see [`uplink_topic`].
    pub topic: String,

    pub keep_alive: Duration,

    /// Largest accepted packet; uplinks with metadata run to a few KiB.
    pub max_packet_size: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            broker_url: "mqtt://localhost:1883".to_string(),
            client_id: "fieldsync-ingest".to_string(),
            username: None,
            password: None,
            topic: String::new(),
            keep_alive: Duration::from_secs(60),
            max_packet_size: 256 * 1024,
        }
    }
}

/// Uplink topic for one device.
///
/// With a tenant the topic is `v3/{app}@{tenant}/devices/{device}/up`,
/// without one `v3/{app}/devices/{device}/up`.
pub fn uplink_topic(application_id: &str, tenant: Option<&str>, device_id: &str) -> String {
    match tenant.filter(|t| !t.is_empty()) {
        Some(tenant) => format!("v3/{application_id}@{tenant}/devices/{device_id}/up"),
        None => format!("v3/{application_id}/devices/{device_id}/up"),
    }
}

/// Push-based source: one MQTT subscription, messages handled one at a time.
pub struct LiveIngestor {
    config: LiveConfig,
    cancel: CancellationToken,
}

impl LiveIngestor {
    /// Create a live source that stops when `cancel` fires.
    pub fn new(config: LiveConfig, cancel: CancellationToken) -> Self {
        Self { config, cancel }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Subscribe and invoke `handler` once per arriving message, in arrival
    /// order, until cancelled, stopped by the handler, or disconnected.
    pub async fn start<F>(&mut self, mut handler: F) -> Result<SourceStats>
    where
        F: FnMut(SourceItem) -> Result<bool> + Send,
    {
        let mut stats = SourceStats::default();

        if self.cancel.is_cancelled() {
            debug!("Live source cancelled before connecting");
            return Ok(stats);
        }
        if self.config.topic.trim().is_empty() {
            return Err(Error::Config("live topic must not be empty".to_string()));
        }

        let (host, port) = parse_broker_url(&self.config.broker_url)?;

        let mut options = MqttOptions::new(self.config.client_id.as_str(), host.as_str(), port);
        options.set_keep_alive(self.config.keep_alive);
        options.set_clean_session(true);
        options.set_max_packet_size(self.config.max_packet_size, self.config.max_packet_size);
        if let Some(username) = &self.config.username {
            options.set_credentials(
                username.as_str(),
                self.config.password.as_deref().unwrap_or_default(),
            );
        }

        info!(
            broker = %format!("{host}:{port}"),
            topic = %self.config.topic,
            "Connecting to MQTT broker"
        );

        let (client, mut eventloop) = AsyncClient::new(options, 10);
        client
            .subscribe(self.config.topic.as_str(), QoS::AtLeastOnce)
            .await
            .map_err(|e| Error::Subscription(format!("failed to queue subscribe: {e}")))?;

        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("Stopping live subscription");
                    let _ = client.disconnect().await;
                    break;
                }
                event = eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let keep_going = {
                        let _span = info_span!(
                            "mqtt_message",
                            topic = %publish.topic,
                            payload_size = publish.payload.len()
                        )
                        .entered();

                        let item = decode_publish(&publish.payload);
                        stats.total_items += 1;
                        match &item {
                            SourceItem::Envelope(_) => stats.valid_envelopes += 1,
                            SourceItem::Malformed { reason } => {
                                warn!("Error processing MQTT message: {}", reason);
                                stats.parse_errors += 1;
                            }
                        }

                        handler(item)?
                    };

                    if !keep_going {
                        info!("Handler signaled stop");
                        let _ = client.disconnect().await;
                        break;
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(Error::Subscription(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    info!("Connected to MQTT broker");
                }
                Ok(Event::Incoming(Packet::SubAck(suback))) => {
                    if suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        return Err(Error::Subscription(format!(
                            "broker rejected subscription to {}",
                            self.config.topic
                        )));
                    }
                    info!(topic = %self.config.topic, "Subscribed");
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    return Err(Error::Subscription(
                        "broker closed the connection".to_string(),
                    ));
                }
                Ok(_) => {
                    // Pings, acks and outgoing traffic
                }
                Err(e) => {
                    error!(error = %e, "Unexpected MQTT disconnection");
                    return Err(Error::Subscription(format!("MQTT event loop error: {e}")));
                }
            }
        }

        Ok(stats)
    }
}

#[async_trait]
impl EnvelopeSource for LiveIngestor {
    fn name(&self) -> &'static str {
        "live"
    }

    async fn process<F>(&mut self, handler: F) -> Result<SourceStats>
    where
        F: FnMut(SourceItem) -> Result<bool> + Send,
    {
        self.start(handler).await
    }
}

/// Turn a published payload into a source item.
pub fn decode_publish(payload: &[u8]) -> SourceItem {
    match RawEnvelope::from_live_payload(payload) {
        Ok(envelope) => SourceItem::Envelope(envelope),
        Err(e) => SourceItem::Malformed {
            reason: e.to_string(),
        },
    }
}

/// Parse a broker URL into host and port. The port defaults to 1883.
pub fn parse_broker_url(url: &str) -> Result<(String, u16)> {
    let trimmed = url
        .trim()
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://");

    let parts: Vec<&str> = trimmed.split(':').collect();
    match parts.as_slice() {
        [host] if !host.is_empty() => Ok((host.to_string(), 1883)),
        [host, port] if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                Error::Config(format!("invalid port in broker URL: {port}"))
            })?;
            Ok((host.to_string(), port))
        }
        _ => Err(Error::Config(format!("invalid broker URL format: {url}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_broker_url_with_port() {
        let (host, port) = parse_broker_url("mqtt://localhost:1883").unwrap();
        assert_eq!(host, "localhost");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_without_scheme() {
        let (host, port) = parse_broker_url("nam1.cloud.thethings.network:8883").unwrap();
        assert_eq!(host, "nam1.cloud.thethings.network");
        assert_eq!(port, 8883);
    }

    #[test]
    fn test_parse_broker_url_default_port() {
        let (host, port) = parse_broker_url("tcp://192.168.1.20").unwrap();
        assert_eq!(host, "192.168.1.20");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_parse_broker_url_invalid() {
        assert!(parse_broker_url("mqtt://host:notaport").is_err());
        assert!(parse_broker_url("a:b:c").is_err());
        assert!(parse_broker_url("").is_err());
        assert!(parse_broker_url("mqtt://:1883").is_err());
    }

    #[test]
    fn test_uplink_topic() {
        assert_eq!(
            uplink_topic("soil-app", None, "sensor-1"),
            "v3/soil-app/devices/sensor-1/up"
        );
        assert_eq!(
            uplink_topic("soil-app", Some("ttn"), "sensor-1"),
            "v3/soil-app@ttn/devices/sensor-1/up"
        );
        assert_eq!(
            uplink_topic("soil-app", Some(""), "sensor-1"),
            "v3/soil-app/devices/sensor-1/up"
        );
    }

    #[test]
    fn test_decode_publish() {
        let payload = json!({
            "end_device_ids": { "device_id": "sensor-1" },
            "received_at": "2024-01-01T00:00:00Z"
        })
        .to_string();
        match decode_publish(payload.as_bytes()) {
            SourceItem::Envelope(env) => {
                assert_eq!(env.device_id(), Some("sensor-1"));
                assert_eq!(env.received_at(), Some("2024-01-01T00:00:00Z"));
            }
            other => panic!("unexpected item: {other:?}"),
        }

        assert!(matches!(
            decode_publish(b"\xff\xfe"),
            SourceItem::Malformed { .. }
        ));
        assert!(matches!(
            decode_publish(b"\"just a string\""),
            SourceItem::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_when_already_cancelled_returns_immediately() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = LiveIngestor::new(
            LiveConfig {
                topic: "v3/app/devices/dev/up".to_string(),
                ..Default::default()
            },
            cancel,
        );

        let stats = source.start(|_| Ok(true)).await.unwrap();
        assert_eq!(stats, SourceStats::default());
    }

    #[tokio::test]
    async fn test_start_requires_topic() {
        let mut source = LiveIngestor::new(LiveConfig::default(), CancellationToken::new());
        let result = source.start(|_| Ok(true)).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_broker_is_subscription_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut source = LiveIngestor::new(
            LiveConfig {
                broker_url: format!("mqtt://{addr}"),
                topic: "v3/app/devices/dev/up".to_string(),
                ..Default::default()
            },
            CancellationToken::new(),
        );

        let result = source.start(|_| Ok(true)).await;
        assert!(matches!(result, Err(Error::Subscription(_))));
    }
}
