//! MQTT publisher module
//!
//! Publishes inverter state to the broker with topics like
//! `{prefix}/{slug}`, receives commands on `{prefix}/{slug}/set` and
//! `{prefix}/set`, and announces entities through Home Assistant discovery.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

use crate::command::InboundCommand;
use crate::config::MqttConfig;
use crate::poller::Snapshot;
use crate::registers::Catalog;

pub mod discovery;

const ONLINE: &str = "online";
const OFFLINE: &str = "offline";

/// Topic layout under one prefix
#[derive(Debug, Clone)]
pub struct Topics {
    prefix: String,
    discovery_prefix: String,
}

impl Topics {
    pub fn new(prefix: impl Into<String>, discovery_prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            discovery_prefix: discovery_prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn discovery_prefix(&self) -> &str {
        &self.discovery_prefix
    }

    pub fn state(&self, slug: &str) -> String {
        format!("{}/{}", self.prefix, slug)
    }

    pub fn command(&self, slug: &str) -> String {
        format!("{}/{}/set", self.prefix, slug)
    }

    /// Subscription filter for per-slug commands
    pub fn command_filter(&self) -> String {
        format!("{}/+/set", self.prefix)
    }

    /// Topic carrying a JSON object of slug/value pairs
    pub fn bulk_command(&self) -> String {
        format!("{}/set", self.prefix)
    }

    pub fn telemetry(&self) -> String {
        format!("{}/telemetry", self.prefix)
    }

    pub fn availability(&self) -> String {
        format!("{}/availability", self.prefix)
    }

    pub fn error(&self) -> String {
        format!("{}/error", self.prefix)
    }

    /// Turn an incoming message into a command, `None` for foreign topics
    pub fn parse_command(&self, topic: &str, payload: String) -> Option<InboundCommand> {
        let rest = topic.strip_prefix(&self.prefix)?.strip_prefix('/')?;
        if rest == "set" {
            return Some(InboundCommand { slug: None, payload });
        }
        let slug = rest.strip_suffix("/set")?;
        if slug.is_empty() || slug.contains('/') {
            return None;
        }
        Some(InboundCommand {
            slug: Some(slug.to_string()),
            payload,
        })
    }
}

/// Outbound side of the broker connection
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()>;
}

/// Publish the per-slug states and the combined telemetry of one cycle
pub async fn publish_snapshot(
    publisher: &dyn Publisher,
    topics: &Topics,
    retain: bool,
    snapshot: &Snapshot,
) -> Result<()> {
    let mut failed = 0;
    for (slug, payload) in snapshot.state_messages() {
        if let Err(e) = publisher.publish(&topics.state(&slug), payload, retain).await {
            debug!("State publish for {} failed: {}", slug, e);
            failed += 1;
        }
    }

    let telemetry = serde_json::to_string(&snapshot.telemetry())
        .with_context(|| "Failed to serialize telemetry")?;
    publisher
        .publish(&topics.telemetry(), telemetry, false)
        .await?;

    if failed > 0 {
        anyhow::bail!("{} state messages were not published", failed);
    }
    Ok(())
}

/// Forward snapshots from the poll loop to the broker until the channel closes
pub async fn start_publishing(
    publisher: Arc<dyn Publisher>,
    topics: Topics,
    retain: bool,
    mut update_rx: broadcast::Receiver<Arc<Snapshot>>,
) {
    info!("MQTT publishing loop started");

    loop {
        match update_rx.recv().await {
            Ok(snapshot) => {
                match publish_snapshot(publisher.as_ref(), &topics, retain, &snapshot).await {
                    Ok(()) => {
                        metrics::counter!("solarbridge_mqtt_snapshots_total", "result" => "ok")
                            .increment(1)
                    }
                    Err(e) => {
                        error!("MQTT publish error: {}", e);
                        metrics::counter!("solarbridge_mqtt_snapshots_total", "result" => "error")
                            .increment(1);
                    }
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("MQTT publisher lagged, missed {} snapshots", n);
            }
            Err(broadcast::error::RecvError::Closed) => {
                info!("Snapshot channel closed, stopping publisher");
                break;
            }
        }
    }
}

fn qos_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        2 => QoS::ExactlyOnce,
        _ => {
            warn!("Invalid QoS level {}, using 1", level);
            QoS::AtLeastOnce
        }
    }
}

/// MQTT Publisher backed by rumqttc
pub struct MqttPublisher {
    client: AsyncClient,
    topics: Topics,
    qos: QoS,
    connected: Arc<AtomicBool>,
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    ///
    /// Incoming command messages are pushed onto `commands`; every
    /// (re)connect subscribes, marks the bridge online and republishes
    /// discovery for `catalog`.
    pub fn new(
        config: &MqttConfig,
        catalog: Arc<Catalog>,
        commands: mpsc::Sender<InboundCommand>,
    ) -> Result<Self> {
        if config.topic_prefix.is_empty() || config.topic_prefix.contains(['+', '#']) {
            anyhow::bail!("Invalid MQTT topic prefix '{}'", config.topic_prefix);
        }

        let topics = Topics::new(&config.topic_prefix, &config.discovery_prefix);
        let qos = qos_level(config.qos);

        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(topics.availability(), OFFLINE, qos, true));

        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            mqttoptions.set_credentials(user, pass);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);
        let connected = Arc::new(AtomicBool::new(false));

        let publisher = Self {
            client,
            topics,
            qos,
            connected,
        };
        publisher.spawn_event_loop(eventloop, catalog, commands, config.host.clone(), config.port);

        info!(
            "MQTT publisher initialized: {}:{} (prefix: {}, qos: {})",
            config.host, config.port, config.topic_prefix, config.qos
        );
        Ok(publisher)
    }

    pub fn topics(&self) -> &Topics {
        &self.topics
    }

    /// Spawn the MQTT event loop handler
    fn spawn_event_loop(
        &self,
        mut eventloop: EventLoop,
        catalog: Arc<Catalog>,
        commands: mpsc::Sender<InboundCommand>,
        host: String,
        port: u16,
    ) {
        let client = self.client.clone();
        let topics = self.topics.clone();
        let connected = self.connected.clone();
        let qos = self.qos;

        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        if ack.code == rumqttc::ConnectReturnCode::Success {
                            connected.store(true, Ordering::SeqCst);
                            info!("Connected to MQTT broker at {}:{}", host, port);
                            // the event loop must keep polling while these are queued
                            tokio::spawn(announce(
                                client.clone(),
                                topics.clone(),
                                catalog.clone(),
                                qos,
                            ));
                        } else {
                            error!("MQTT connection rejected: {:?}", ack.code);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(message))) => {
                        let payload = String::from_utf8_lossy(&message.payload).into_owned();
                        match topics.parse_command(&message.topic, payload) {
                            Some(command) => {
                                debug!("Command received on {}", message.topic);
                                if let Err(e) = commands.try_send(command) {
                                    warn!("Dropping command from {}: {}", message.topic, e);
                                }
                            }
                            None => debug!("Ignoring message on {}", message.topic),
                        }
                    }
                    Ok(Event::Incoming(Packet::PingResp)) => {
                        debug!("MQTT ping response");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(Event::Outgoing(_)) => {}
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        error!("MQTT error: {:?}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });
    }

    /// Broker connection flag, kept current by the event loop
    pub fn connection_state(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Mark the bridge offline and close the session
    pub async fn shutdown(&self) -> Result<()> {
        self.client
            .publish(self.topics.availability(), self.qos, true, OFFLINE)
            .await
            .with_context(|| "Failed to publish availability")?;
        self.client
            .disconnect()
            .await
            .with_context(|| "Failed to disconnect from MQTT broker")?;
        info!("MQTT session closed");
        Ok(())
    }
}

#[async_trait]
impl Publisher for MqttPublisher {
    async fn publish(&self, topic: &str, payload: String, retain: bool) -> Result<()> {
        self.client
            .publish(topic, self.qos, retain, payload.into_bytes())
            .await
            .with_context(|| format!("Failed to publish to {}", topic))?;
        debug!("MQTT published to {}", topic);
        Ok(())
    }
}

/// Subscribe to commands, mark the bridge online and publish discovery
async fn announce(client: AsyncClient, topics: Topics, catalog: Arc<Catalog>, qos: QoS) {
    for filter in [topics.command_filter(), topics.bulk_command()] {
        if let Err(e) = client.subscribe(&filter, qos).await {
            error!("Failed to subscribe to {}: {}", filter, e);
        }
    }

    if let Err(e) = client.publish(topics.availability(), qos, true, ONLINE).await {
        error!("Failed to publish availability: {}", e);
    }

    let messages = discovery::messages(&catalog, &topics);
    let count = messages.len();
    for (topic, payload) in messages {
        if let Err(e) = client.publish(&topic, qos, true, payload).await {
            error!("Failed to publish discovery to {}: {}", topic, e);
        }
    }
    info!("Published {} discovery entries", count);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::energy::{EnergyState, PowerSnapshot};
    use crate::registers::DecodedValue;
    use chrono::{Local, TimeZone};
    use std::sync::Mutex;

    fn topics() -> Topics {
        Topics::new("vevor_eml3500", "homeassistant")
    }

    #[test]
    fn test_qos_mapping() {
        assert!(matches!(qos_level(0), QoS::AtMostOnce));
        assert!(matches!(qos_level(1), QoS::AtLeastOnce));
        assert!(matches!(qos_level(2), QoS::ExactlyOnce));
        assert!(matches!(qos_level(7), QoS::AtLeastOnce));
    }

    #[test]
    fn test_topic_format() {
        let topics = topics();
        assert_eq!(topics.state("faults"), "vevor_eml3500/faults");
        assert_eq!(topics.command("output_mode"), "vevor_eml3500/output_mode/set");
        assert_eq!(topics.command_filter(), "vevor_eml3500/+/set");
        assert_eq!(topics.bulk_command(), "vevor_eml3500/set");
        assert_eq!(topics.availability(), "vevor_eml3500/availability");
        assert_eq!(topics.error(), "vevor_eml3500/error");
    }

    #[test]
    fn test_parse_command() {
        let topics = topics();
        let single = topics
            .parse_command("vevor_eml3500/output_mode/set", "parallel".to_string())
            .unwrap();
        assert_eq!(single.slug.as_deref(), Some("output_mode"));
        assert_eq!(single.payload, "parallel");

        let bulk = topics
            .parse_command("vevor_eml3500/set", "{}".to_string())
            .unwrap();
        assert_eq!(bulk.slug, None);

        assert!(topics.parse_command("vevor_eml3500/faults", String::new()).is_none());
        assert!(topics.parse_command("other/output_mode/set", String::new()).is_none());
        assert!(topics.parse_command("vevor_eml3500x/set", String::new()).is_none());
    }

    fn snapshot() -> Snapshot {
        let timestamp = Local.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
        Snapshot {
            timestamp,
            values: vec![
                ("faults".to_string(), DecodedValue::BitsetLabels(Vec::new())),
                ("mains_voltage".to_string(), DecodedValue::Numeric(230.1)),
                ("pv_power".to_string(), DecodedValue::Unavailable),
            ],
            flows: PowerSnapshot::default(),
            energy: EnergyState::new(timestamp.date_naive()),
        }
    }

    #[tokio::test]
    async fn test_publish_snapshot() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let log = sent.clone();
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().returning(move |topic, payload, retain| {
            log.lock().unwrap().push((topic.to_string(), payload, retain));
            Ok(())
        });

        publish_snapshot(&publisher, &topics(), true, &snapshot())
            .await
            .unwrap();

        let sent = sent.lock().unwrap();
        assert!(sent.contains(&("vevor_eml3500/faults".to_string(), "OK".to_string(), true)));
        assert!(sent.contains(&(
            "vevor_eml3500/mains_voltage".to_string(),
            "230.1".to_string(),
            true
        )));
        assert!(sent.iter().all(|(topic, _, _)| topic != "vevor_eml3500/pv_power"));
        assert!(sent.iter().any(|(topic, _, _)| topic == "vevor_eml3500/grid_import_energy_today"));

        let (_, telemetry, retain) = sent.last().unwrap();
        assert!(!retain);
        let telemetry: serde_json::Value = serde_json::from_str(telemetry).unwrap();
        assert_eq!(telemetry["pv_power"], serde_json::Value::Null);
        assert_eq!(telemetry["mains_voltage"], 230.1);
    }

    #[tokio::test]
    async fn test_failed_state_publish_is_reported() {
        let mut publisher = MockPublisher::new();
        publisher
            .expect_publish()
            .returning(|topic, _, _| {
                if topic.ends_with("/faults") {
                    Err(anyhow::anyhow!("broker gone"))
                } else {
                    Ok(())
                }
            });

        let result = publish_snapshot(&publisher, &topics(), true, &snapshot()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_publishing_stops_when_channel_closes() {
        let mut publisher = MockPublisher::new();
        publisher.expect_publish().returning(|_, _, _| Ok(()));
        let (tx, rx) = broadcast::channel(4);
        tx.send(Arc::new(snapshot())).unwrap();
        drop(tx);

        tokio::time::timeout(
            Duration::from_secs(5),
            start_publishing(Arc::new(publisher), topics(), true, rx),
        )
        .await
        .unwrap();
    }
}
