use std::time::{Duration, Instant};

use anyhow::{Context as _, anyhow, bail};
use async_trait::async_trait;
use log::{debug, error, info};
use rumqttc::{
    ConnectReturnCode, ConnectionError, Event, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::{self, ConfigError};
use crate::messages::{ConnectionState, TransportEvent};

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// The source of beacon sightings and connection changes.
#[async_trait]
pub trait Transport: Send {
    /// Connects and subscribes, then keeps delivering into `tx` from a
    /// background task. Resolves once the subscription is acknowledged.
    async fn start(&mut self, tx: mpsc::Sender<TransportEvent>) -> anyhow::Result<JoinHandle<()>>;

    /// Asks the background task to stop. It exits once the disconnect has
    /// gone out.
    async fn disconnect(&mut self) -> anyhow::Result<()>;
}

/// [`Transport`] over an MQTT broker.
pub struct MqttTransport {
    client: MqttClient,
    eventloop: Option<rumqttc::EventLoop>,
    connect_timeout: Duration,
}

impl MqttTransport {
    pub fn new(config: &config::Config) -> Result<Self, ConfigError> {
        let (client, eventloop) = MqttClient::new(config)?;
        Ok(MqttTransport {
            client,
            eventloop: Some(eventloop),
            connect_timeout: config.broker.connect_timeout(),
        })
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn start(&mut self, tx: mpsc::Sender<TransportEvent>) -> anyhow::Result<JoinHandle<()>> {
        let mut eventloop = self
            .eventloop
            .take()
            .ok_or_else(|| anyhow!("MQTT transport already started"))?;
        self.client.connect(&mut eventloop, self.connect_timeout).await?;

        let client = self.client.clone();
        Ok(tokio::spawn(async move {
            client.event_loop(&mut eventloop, tx).await;
            debug!("Disconnected from {}", client.address());
        }))
    }

    async fn disconnect(&mut self) -> anyhow::Result<()> {
        self.client
            .disconnect()
            .await
            .context("failed to disconnect MQTT client")
    }
}

/// What the steady-state loop does with one poll result.
#[derive(Debug)]
enum Step {
    Forward(TransportEvent),
    /// The broker accepted a (re)connection; the subscription must be renewed.
    Reconnected,
    /// Poll failed. Wait before polling again, then report the loss if this
    /// is the first failure since the last connection.
    Backoff(Option<TransportEvent>),
    Skip,
    Stop,
}

fn translate(polled: Result<Event, ConnectionError>, connected: &mut bool) -> Step {
    match polled {
        Ok(Event::Incoming(Packet::Publish(p))) => Step::Forward(TransportEvent::Message {
            topic: p.topic,
            payload: p.payload.to_vec(),
            received_at: Instant::now(),
        }),
        Ok(Event::Incoming(Packet::ConnAck(_))) => {
            *connected = true;
            Step::Reconnected
        }
        Ok(Event::Incoming(Packet::SubAck(_))) => {
            debug!("Subscription acknowledged");
            Step::Skip
        }
        Ok(Event::Outgoing(Outgoing::Disconnect)) => {
            debug!("Disconnect sent to MQTT broker");
            Step::Stop
        }
        Ok(_) => Step::Skip,
        Err(err) => {
            if !*connected {
                debug!("Still unable to reach MQTT broker: {}", err);
                return Step::Backoff(None);
            }
            *connected = false;
            Step::Backoff(Some(TransportEvent::Connection(
                ConnectionState::ConnectionLost(err.to_string()),
            )))
        }
    }
}

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    address: String,
    topic: String,
}

impl MqttClient {
    pub fn new(config: &config::Config) -> Result<(Self, rumqttc::EventLoop), ConfigError> {
        let broker = &config.broker;
        let address = broker.parsed_address()?;

        let mut mqttoptions = MqttOptions::new(broker.client_id(), address.host, address.port);
        mqttoptions.set_keep_alive(broker.keep_alive());

        if let (Some(username), Some(password)) = (broker.username.as_ref(), broker.password.as_ref()) {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        if address.tls {
            mqttoptions.set_transport(rumqttc::Transport::tls_with_default_config());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        Ok((
            MqttClient {
                client,
                address: broker.address.clone(),
                topic: config.topic().to_string(),
            },
            eventloop,
        ))
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub async fn subscribe(&self) -> Result<(), rumqttc::ClientError> {
        self.client.subscribe(&self.topic, QoS::AtMostOnce).await
    }

    /// Drives the event loop until the broker has acknowledged both the
    /// connection and the subscription. Any failure before that is returned.
    pub async fn connect(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        timeout: Duration,
    ) -> anyhow::Result<()> {
        tokio::time::timeout(timeout, self.handshake(eventloop))
            .await
            .map_err(|_| anyhow!("timed out connecting to MQTT broker {}", self.address))?
    }

    async fn handshake(&self, eventloop: &mut rumqttc::EventLoop) -> anyhow::Result<()> {
        loop {
            let event = eventloop
                .poll()
                .await
                .with_context(|| format!("failed to connect to MQTT broker {}", self.address))?;

            match event {
                Event::Incoming(Packet::ConnAck(ack)) => {
                    if !matches!(ack.code, ConnectReturnCode::Success) {
                        bail!("MQTT broker refused connection: {:?}", ack.code);
                    }
                    info!("Connected to MQTT broker {}", self.address);
                    self.subscribe()
                        .await
                        .with_context(|| format!("failed to subscribe to MQTT topic {}", self.topic))?;
                }
                Event::Incoming(Packet::SubAck(ack)) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure))
                    {
                        bail!("MQTT broker refused subscription to {}", self.topic);
                    }
                    debug!("Subscribed to {}", self.topic);
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    /// Forwards deliveries and connection changes until the client
    /// disconnects or the receiving side goes away. Reconnection is left to
    /// the event loop, which retries on the next poll.
    pub async fn event_loop(
        &self,
        eventloop: &mut rumqttc::EventLoop,
        tx: mpsc::Sender<TransportEvent>,
    ) {
        let mut connected = true;
        loop {
            let event = match translate(eventloop.poll().await, &mut connected) {
                Step::Forward(event) => event,
                Step::Reconnected => {
                    if let Err(err) = self.subscribe().await {
                        error!("Error subscribing to MQTT topic: {:?}", err);
                    }
                    TransportEvent::Connection(ConnectionState::Connected)
                }
                Step::Backoff(lost) => {
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    match lost {
                        Some(event) => event,
                        None => continue,
                    }
                }
                Step::Skip => continue,
                Step::Stop => break,
            };

            if tx.send(event).await.is_err() {
                debug!("Ingestion loop closed, stopping MQTT event loop");
                break;
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client.disconnect().await
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use rumqttc::{ConnAck, Publish, SubAck};

    use super::*;

    fn io_error() -> ConnectionError {
        ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
    }

    #[test]
    fn test_translate_publish() {
        let mut connected = true;
        let publish = Publish::new("bluetooth/devices", QoS::AtMostOnce, "AA:BB:CC:DD:EE:FF");
        match translate(Ok(Event::Incoming(Packet::Publish(publish))), &mut connected) {
            Step::Forward(TransportEvent::Message { topic, payload, .. }) => {
                assert_eq!(topic, "bluetooth/devices");
                assert_eq!(payload, b"AA:BB:CC:DD:EE:FF");
            }
            other => panic!("unexpected step {:?}", other),
        }
        assert!(connected);
    }

    #[test]
    fn test_translate_reports_one_loss_per_outage() {
        let mut connected = true;

        let steps: Vec<Step> = (0..3).map(|_| translate(Err(io_error()), &mut connected)).collect();
        assert!(matches!(
            &steps[0],
            Step::Backoff(Some(TransportEvent::Connection(ConnectionState::ConnectionLost(reason))))
                if reason.contains("reset by peer")
        ));
        assert!(matches!(steps[1], Step::Backoff(None)));
        assert!(matches!(steps[2], Step::Backoff(None)));
        assert!(!connected);

        let ack = ConnAck::new(ConnectReturnCode::Success, false);
        assert!(matches!(
            translate(Ok(Event::Incoming(Packet::ConnAck(ack))), &mut connected),
            Step::Reconnected
        ));
        assert!(connected);

        assert!(matches!(
            translate(Err(io_error()), &mut connected),
            Step::Backoff(Some(_))
        ));
    }

    #[test]
    fn test_translate_control_packets() {
        let mut connected = true;
        assert!(matches!(
            translate(Ok(Event::Incoming(Packet::SubAck(SubAck::new(1, vec![])))), &mut connected),
            Step::Skip
        ));
        assert!(matches!(
            translate(Ok(Event::Incoming(Packet::PingResp)), &mut connected),
            Step::Skip
        ));
        assert!(matches!(
            translate(Ok(Event::Outgoing(Outgoing::PingReq)), &mut connected),
            Step::Skip
        ));
        assert!(matches!(
            translate(Ok(Event::Outgoing(Outgoing::Disconnect)), &mut connected),
            Step::Stop
        ));
    }

    fn unreachable_broker() -> config::Config {
        config::from_toml(
            r#"
            api_version = "catdoorbell.github.com/v1alpha1"
            kind = "Config"
            target_mac = "AA:BB:CC:DD:EE:FF"

            [broker]
            address = "tcp://127.0.0.1:1"
            "#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_event_loop_reports_outage_once() {
        let (client, mut eventloop) = MqttClient::new(&unreachable_broker()).unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let task = tokio::spawn(async move { client.event_loop(&mut eventloop, tx).await });

        let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap();
        assert!(matches!(
            first,
            Some(TransportEvent::Connection(ConnectionState::ConnectionLost(_)))
        ));

        // Further failed reconnects stay quiet.
        assert!(
            tokio::time::timeout(RECONNECT_DELAY * 3, rx.recv())
                .await
                .is_err()
        );
        task.abort();
    }

    #[tokio::test]
    async fn test_transport_start_fails_without_broker() {
        let mut transport = MqttTransport::new(&unreachable_broker()).unwrap();
        transport.connect_timeout = Duration::from_secs(5);
        let (tx, _rx) = mpsc::channel(8);

        assert!(transport.start(tx.clone()).await.is_err());
        // The event loop is consumed by the first attempt.
        let err = transport.start(tx).await.unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[tokio::test]
    async fn test_new_rejects_bad_broker_address() {
        let mut config = config::from_toml(
            r#"
            api_version = "catdoorbell.github.com/v1alpha1"
            kind = "Config"
            target_mac = "AA:BB:CC:DD:EE:FF"

            [broker]
            address = "tcp://localhost:1883"
            "#,
        )
        .unwrap();
        assert!(MqttClient::new(&config).is_ok());

        config.broker.address = "ws://localhost".to_string();
        assert!(matches!(
            MqttClient::new(&config),
            Err(ConfigError::InvalidBroker { .. })
        ));
    }

    #[tokio::test]
    async fn test_connect_fails_without_broker() {
        let (client, mut eventloop) = MqttClient::new(&unreachable_broker()).unwrap();
        assert!(
            client
                .connect(&mut eventloop, Duration::from_secs(5))
                .await
                .is_err()
        );
    }
}
