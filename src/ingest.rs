use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::alert::{AlertDispatcher, DispatchReport};
use crate::debounce::DebounceGate;
use crate::identity::{self, DeviceIdentifier};
use crate::messages::{ConnectionState, SightingEvent, TransportEvent};

/// What happened to a single delivered message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handled {
    Malformed,
    NotTarget,
    Suppressed,
    Alerted(DispatchReport),
}

/// Consumes transport events and turns sightings of the target into alerts.
pub struct Ingestor {
    target: DeviceIdentifier,
    cooldown: Duration,
    gate: Arc<DebounceGate>,
    dispatcher: AlertDispatcher,
}

impl Ingestor {
    pub fn new(
        target: DeviceIdentifier,
        cooldown: Duration,
        gate: Arc<DebounceGate>,
        dispatcher: AlertDispatcher,
    ) -> Self {
        Ingestor {
            target,
            cooldown,
            gate,
            dispatcher,
        }
    }

    /// Runs until cancelled or until the transport drops its sender. A
    /// message already being handled is finished before returning.
    ///
    /// Alert channels block (D-Bus, the audio queue), so each event is handled
    /// on the blocking pool rather than on a runtime worker.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<TransportEvent>, cancel: CancellationToken) {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Ingestion loop cancelled");
                    break;
                }
                event = rx.recv() => match event {
                    Some(event) => {
                        let ingestor = self.clone();
                        let handled =
                            tokio::task::spawn_blocking(move || ingestor.handle_event(event)).await;
                        if let Err(err) = handled {
                            error!("Failed to handle transport event: {}", err);
                        }
                    }
                    None => {
                        debug!("Transport closed");
                        break;
                    }
                },
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Message {
                topic,
                payload,
                received_at,
            } => {
                debug!("Received MQTT message on topic {}", topic);
                self.handle_payload(&payload, received_at);
            }
            TransportEvent::Connection(ConnectionState::Connected) => {
                info!("Connected to MQTT broker");
            }
            TransportEvent::Connection(ConnectionState::ConnectionLost(reason)) => {
                warn!("Lost connection to MQTT broker: {}", reason);
            }
        }
    }

    pub fn handle_payload(&self, payload: &[u8], received_at: Instant) -> Handled {
        let Some(observed) = DeviceIdentifier::from_payload(payload) else {
            debug!("Ignoring malformed beacon payload ({} bytes)", payload.len());
            return Handled::Malformed;
        };
        self.handle_sighting(SightingEvent {
            observed,
            received_at,
        })
    }

    pub fn handle_sighting(&self, event: SightingEvent) -> Handled {
        debug!("Received beacon from device {}", event.observed);

        if !identity::matches(&event.observed, &self.target) {
            return Handled::NotTarget;
        }

        if !self.gate.try_accept(event.received_at, self.cooldown) {
            let since = self
                .gate
                .last_accepted()
                .and_then(|last| event.received_at.checked_duration_since(last))
                .unwrap_or_default();
            debug!(
                "Ignoring beacon from device {}, last alert {}s ago",
                event.observed,
                since.as_secs()
            );
            return Handled::Suppressed;
        }

        info!("Detected target device {}", event.observed);
        let report = self.dispatcher.dispatch(&event);
        if let (Some(visual), Some(audio)) = (report.visual.failure(), report.audio.failure()) {
            warn!(
                "No alert channel succeeded for {} (visual: {}, audio: {})",
                event.observed, visual, audio
            );
        }
        Handled::Alerted(report)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::alert::AlertOutcome;
    use crate::alert::tests::{FakeAudio, FakeVisual};

    const COOLDOWN: Duration = Duration::from_secs(300);

    struct Fixture {
        ingestor: Arc<Ingestor>,
        gate: Arc<DebounceGate>,
        visual: Arc<FakeVisual>,
        audio: Arc<FakeAudio>,
    }

    fn fixture() -> Fixture {
        let gate = Arc::new(DebounceGate::new());
        let visual = Arc::new(FakeVisual::default());
        let audio = Arc::new(FakeAudio::default());
        let dispatcher = AlertDispatcher::new(visual.clone(), audio.clone(), PathBuf::from("icon.png"));
        let ingestor = Ingestor::new(
            DeviceIdentifier::new("aa:bb:cc:dd:ee:ff"),
            COOLDOWN,
            gate.clone(),
            dispatcher,
        );
        Fixture {
            ingestor: Arc::new(ingestor),
            gate,
            visual,
            audio,
        }
    }

    fn message(payload: &[u8], received_at: Instant) -> TransportEvent {
        TransportEvent::Message {
            topic: "bluetooth/devices".to_string(),
            payload: payload.to_vec(),
            received_at,
        }
    }

    #[test]
    fn test_target_sighting_alerts() {
        let f = fixture();
        let handled = f.ingestor.handle_payload(b"AA:BB:CC:DD:EE:FF", Instant::now());
        assert_eq!(
            handled,
            Handled::Alerted(DispatchReport {
                visual: AlertOutcome::Succeeded,
                audio: AlertOutcome::Succeeded,
            })
        );
        assert_eq!(f.audio.played.load(Ordering::SeqCst), 1);
        assert_eq!(
            f.visual.raised.lock().unwrap()[0].1,
            "Device AA:BB:CC:DD:EE:FF came into range"
        );
    }

    #[test]
    fn test_other_devices_leave_state_untouched() {
        let f = fixture();
        let t0 = Instant::now();
        assert_eq!(
            f.ingestor.handle_payload(b"11:22:33:44:55:66", t0),
            Handled::NotTarget
        );
        assert_eq!(f.ingestor.handle_payload(&[0xc3, 0x28], t0), Handled::Malformed);
        assert_eq!(f.ingestor.handle_payload(b"", t0), Handled::Malformed);

        assert_eq!(f.gate.last_accepted(), None);
        assert_eq!(f.audio.played.load(Ordering::SeqCst), 0);
        assert!(f.visual.raised.lock().unwrap().is_empty());
    }

    #[test]
    fn test_repeat_sightings_are_debounced() {
        let f = fixture();
        let t0 = Instant::now();
        let results: Vec<Handled> = [0, 60, 301, 302]
            .into_iter()
            .map(|secs| {
                f.ingestor
                    .handle_payload(b"aa:bb:cc:dd:ee:ff", t0 + Duration::from_secs(secs))
            })
            .collect();

        assert!(matches!(results[0], Handled::Alerted(_)));
        assert_eq!(results[1], Handled::Suppressed);
        assert!(matches!(results[2], Handled::Alerted(_)));
        assert_eq!(results[3], Handled::Suppressed);
        assert_eq!(f.audio.played.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_failure_does_not_block_future_detections() {
        let gate = Arc::new(DebounceGate::new());
        let audio = Arc::new(FakeAudio {
            fail: true,
            ..Default::default()
        });
        let visual = Arc::new(FakeVisual::default());
        let ingestor = Ingestor::new(
            DeviceIdentifier::new("aa:bb:cc:dd:ee:ff"),
            COOLDOWN,
            gate,
            AlertDispatcher::new(visual.clone(), audio, PathBuf::new()),
        );
        let t0 = Instant::now();

        assert!(matches!(
            ingestor.handle_payload(b"aa:bb:cc:dd:ee:ff", t0),
            Handled::Alerted(DispatchReport {
                visual: AlertOutcome::Succeeded,
                audio: AlertOutcome::Failed(_),
            })
        ));
        assert!(matches!(
            ingestor.handle_payload(b"aa:bb:cc:dd:ee:ff", t0 + COOLDOWN),
            Handled::Alerted(_)
        ));
        assert_eq!(visual.raised.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_run_drains_until_transport_closes() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(16);
        let t0 = Instant::now();

        tx.send(TransportEvent::Connection(ConnectionState::Connected))
            .await
            .unwrap();
        tx.send(message(b"aa:bb:cc:dd:ee:ff", t0)).await.unwrap();
        tx.send(message(b"AA:BB:CC:DD:EE:FF", t0 + Duration::from_secs(1)))
            .await
            .unwrap();
        tx.send(TransportEvent::Connection(ConnectionState::ConnectionLost(
            "reset by peer".to_string(),
        )))
        .await
        .unwrap();
        tx.send(message(b"aa:bb:cc:dd:ee:ff", t0 + COOLDOWN)).await.unwrap();
        drop(tx);

        f.ingestor.clone().run(rx, CancellationToken::new()).await;

        assert_eq!(f.audio.played.load(Ordering::SeqCst), 2);
        assert_eq!(f.gate.last_accepted(), Some(t0 + COOLDOWN));
    }

    #[tokio::test]
    async fn test_run_stops_when_cancelled() {
        let f = fixture();
        let (tx, rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        cancel.cancel();

        // The sender stays open, so only cancellation can end the loop.
        f.ingestor.clone().run(rx, cancel).await;

        assert!(tx.is_closed());
        assert_eq!(f.audio.played.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_run_handles_alerts_off_the_runtime_thread() {
        #[derive(Default)]
        struct ThreadRecorder {
            threads: std::sync::Mutex<Vec<std::thread::ThreadId>>,
        }

        impl crate::alert::AudioCue for ThreadRecorder {
            fn play(&self) -> anyhow::Result<()> {
                self.threads.lock().unwrap().push(std::thread::current().id());
                Ok(())
            }
        }

        let recorder = Arc::new(ThreadRecorder::default());
        let ingestor = Arc::new(Ingestor::new(
            DeviceIdentifier::new("aa:bb:cc:dd:ee:ff"),
            COOLDOWN,
            Arc::new(DebounceGate::new()),
            AlertDispatcher::new(Arc::new(FakeVisual::default()), recorder.clone(), PathBuf::new()),
        ));
        let (tx, rx) = mpsc::channel(1);
        tx.send(message(b"aa:bb:cc:dd:ee:ff", Instant::now())).await.unwrap();
        drop(tx);

        ingestor.run(rx, CancellationToken::new()).await;

        // The current-thread runtime drives everything on this thread.
        let threads = recorder.threads.lock().unwrap();
        assert_eq!(threads.len(), 1);
        assert_ne!(threads[0], std::thread::current().id());
    }
}
