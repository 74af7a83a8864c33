//! MQTT connection lifecycle and acknowledged publishing
//!
//! The broker connection is established once at startup with bounded retries.
//! A background task then drives the rumqttc event loop for the lifetime of
//! the process: it reconnects on its own after network loss and reports every
//! outgoing publish and every PUBACK, so that a publish can wait for the
//! acknowledgement of its own packet id.

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectionError, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing, QoS,
};
use std::collections::HashSet;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task;
use tracing::{debug, info, warn};

use crate::config::{MqttConfig, MQTT_KEEP_ALIVE, PUBLISH_ACK_TIMEOUT};
use crate::metrics::{render_topic, AVAILABILITY_TOPIC, PAYLOAD_OFFLINE, PAYLOAD_ONLINE};
use crate::retry::{RetryError, RetryPolicy};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Capacity of the client -> event loop request channel
const REQUEST_CAPACITY: usize = 10;

/// Broker still unreachable (or refusing the CONNACK) after every attempt
pub type ConnectError = RetryError<ConnectionError>;

#[derive(Debug, Error)]
pub enum PublishError {
    /// Request queue full (event loop offline) or invalid topic
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
    #[error("no PUBACK for '{topic}' within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },
    #[error("MQTT event loop stopped")]
    Disconnected,
}

/// Publish side of the broker connection, shared by the polling loop and the
/// discovery republisher. Returns once the broker acknowledged the message.
#[async_trait]
pub trait StatePublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError>;
}

/// What the event loop driver reports back to the publisher
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PacketEvent {
    Sent(u16),
    Acked(u16),
}

/// Follows our QoS 1 publishes from the request queue to their PUBACK.
///
/// Requests leave the queue in order, so the n-th first-time `Sent` after a
/// request was queued belongs to the n-th queued request. A `Sent` for a
/// packet id that is already in flight is a retransmission after reconnect.
struct AckTracker {
    events: mpsc::UnboundedReceiver<PacketEvent>,
    /// Queued requests not yet written to the socket
    unsent: usize,
    /// Written, not yet acknowledged
    in_flight: HashSet<u16>,
}

impl AckTracker {
    fn new(events: mpsc::UnboundedReceiver<PacketEvent>) -> Self {
        Self {
            events,
            unsent: 0,
            in_flight: HashSet::new(),
        }
    }

    /// Returns the packet id of a first-time write
    fn apply(&mut self, event: PacketEvent) -> Option<u16> {
        match event {
            PacketEvent::Sent(pkid) => {
                if !self.in_flight.insert(pkid) {
                    return None;
                }
                self.unsent = self.unsent.saturating_sub(1);
                Some(pkid)
            }
            PacketEvent::Acked(pkid) => {
                self.in_flight.remove(&pkid);
                None
            }
        }
    }

    /// Apply everything reported since the last publish
    fn catch_up(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            self.apply(event);
        }
    }

    /// Wait for the PUBACK of the request queued at `position` (1-based,
    /// counted among the unsent requests). Acks of abandoned publishes are
    /// consumed without completing this one. Cancel safe: each event is fully
    /// applied before the next await.
    async fn wait_for_ack(&mut self, position: usize) -> Result<u16, PublishError> {
        let mut ahead = position.saturating_sub(1);
        let mut ours = None;
        loop {
            let event = self.events.recv().await.ok_or(PublishError::Disconnected)?;
            if let PacketEvent::Acked(pkid) = event {
                if ours == Some(pkid) {
                    self.apply(event);
                    return Ok(pkid);
                }
            }
            if let Some(pkid) = self.apply(event) {
                if ours.is_none() {
                    if ahead == 0 {
                        ours = Some(pkid);
                    } else {
                        ahead -= 1;
                    }
                }
            }
        }
    }
}

pub struct MqttPublisher {
    client: AsyncClient,
    // Publishes are serialized so only one caller waits on the tracker
    tracker: Mutex<AckTracker>,
    ack_timeout: Duration,
}

#[async_trait]
impl StatePublisher for MqttPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> Result<(), PublishError> {
        let mut tracker = self.tracker.lock().await;
        tracker.catch_up();

        // never wait on a full queue while the event loop is reconnecting
        self.client.try_publish(topic, QoS::AtLeastOnce, retain, payload)?;
        tracker.unsent += 1;
        let position = tracker.unsent;

        match tokio::time::timeout(self.ack_timeout, tracker.wait_for_ack(position)).await {
            Ok(Ok(pkid)) => {
                debug!("PUBACK {} for {}", pkid, topic);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(PublishError::AckTimeout {
                topic: topic.to_string(),
                timeout: self.ack_timeout,
            }),
        }
    }
}

pub fn availability_topic(config: &MqttConfig) -> String {
    render_topic(AVAILABILITY_TOPIC, &config.sensor_id)
}

/// Client options: keep-alive, optional credentials and the retained
/// "offline" last will on the availability topic
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut opts = MqttOptions::new(
        format!("weather-bridge-{}", config.sensor_id),
        config.broker.host.clone(),
        config.broker.port,
    );
    opts.set_keep_alive(MQTT_KEEP_ALIVE);
    opts.set_clean_session(true);
    if !config.username.is_empty() {
        opts.set_credentials(config.username.clone(), config.password.clone());
    }
    opts.set_last_will(LastWill::new(
        availability_topic(config),
        PAYLOAD_OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));
    opts
}

/// Connect to the broker, retrying per `retry`. On success the event loop is
/// handed to a background task and "online" is announced (retained).
pub async fn connect(
    config: &MqttConfig,
    retry: RetryPolicy,
) -> Result<MqttPublisher, ConnectError> {
    connect_with_ack_timeout(config, retry, PUBLISH_ACK_TIMEOUT).await
}

pub async fn connect_with_ack_timeout(
    config: &MqttConfig,
    retry: RetryPolicy,
    ack_timeout: Duration,
) -> Result<MqttPublisher, ConnectError> {
    let (client, eventloop) = AsyncClient::new(mqtt_options(config), REQUEST_CAPACITY);

    let eventloop = Mutex::new(eventloop);
    let el = &eventloop;
    retry
        .run(&format!("MQTT connect to {}", config.broker), |_attempt| async move {
            let mut guard = el.lock().await;
            wait_for_connack(&mut guard).await
        })
        .await?;
    info!("Connected to MQTT broker {}", config.broker);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    task::spawn(drive_event_loop(eventloop.into_inner(), event_tx));

    let publisher = MqttPublisher {
        client,
        tracker: Mutex::new(AckTracker::new(event_rx)),
        ack_timeout,
    };

    let topic = availability_topic(config);
    if let Err(e) = publisher.publish(&topic, PAYLOAD_ONLINE.into(), true).await {
        warn!("Failed to announce availability on {}: {}", topic, e);
    }

    Ok(publisher)
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    loop {
        // a refused CONNACK surfaces as ConnectionError::ConnectionRefused
        if let Event::Incoming(Incoming::ConnAck(ack)) = eventloop.poll().await? {
            debug!("CONNACK: {:?}", ack.code);
            return Ok(());
        }
    }
}

/// Runs forever. Errors are logged and the next poll reconnects.
async fn drive_event_loop(mut eventloop: EventLoop, events: mpsc::UnboundedSender<PacketEvent>) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                let _ = events.send(PacketEvent::Sent(pkid));
            }
            Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                let _ = events.send(PacketEvent::Acked(ack.pkid));
            }
            Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                info!("Reconnected to MQTT broker");
            }
            Ok(_) => {}
            Err(e) => {
                warn!("MQTT connection error: {} (retrying in {:?})", e, RECONNECT_DELAY);
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}
