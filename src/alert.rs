use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};

use crate::messages::SightingEvent;

pub const ALERT_TITLE: &str = "Doorbell";

/// Raises a desktop notification.
pub trait VisualAlert: Send + Sync {
    fn raise(&self, title: &str, message: &str, icon: &Path) -> anyhow::Result<()>;
}

/// Starts the doorbell sound. Implementations must return as soon as playback
/// has been handed off, not when it finishes.
pub trait AudioCue: Send + Sync {
    fn play(&self) -> anyhow::Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AlertOutcome {
    Succeeded,
    Failed(/* reason */ String),
}

impl AlertOutcome {
    fn from_result(channel: &str, result: anyhow::Result<()>) -> Self {
        match result {
            Ok(()) => {
                debug!("{} alert raised", channel);
                AlertOutcome::Succeeded
            }
            Err(err) => {
                warn!("Failed to raise {} alert: {:#}", channel, err);
                AlertOutcome::Failed(format!("{:#}", err))
            }
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, AlertOutcome::Succeeded)
    }

    pub fn failure(&self) -> Option<&str> {
        match self {
            AlertOutcome::Succeeded => None,
            AlertOutcome::Failed(reason) => Some(reason),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DispatchReport {
    pub visual: AlertOutcome,
    pub audio: AlertOutcome,
}

/// Fans an accepted detection out to the visual and audio channels. Each
/// channel runs regardless of what the other one did.
#[derive(Clone)]
pub struct AlertDispatcher {
    visual: Arc<dyn VisualAlert>,
    audio: Arc<dyn AudioCue>,
    icon_path: PathBuf,
}

impl AlertDispatcher {
    pub fn new(visual: Arc<dyn VisualAlert>, audio: Arc<dyn AudioCue>, icon_path: PathBuf) -> Self {
        AlertDispatcher {
            visual,
            audio,
            icon_path,
        }
    }

    pub fn dispatch(&self, event: &SightingEvent) -> DispatchReport {
        let message = alert_message(event);

        let visual = AlertOutcome::from_result(
            "visual",
            self.visual.raise(ALERT_TITLE, &message, &self.icon_path),
        );
        let audio = AlertOutcome::from_result("audio", self.audio.play());

        DispatchReport { visual, audio }
    }
}

pub fn alert_message(event: &SightingEvent) -> String {
    format!("Device {} came into range", event.observed)
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use anyhow::bail;

    use super::*;
    use crate::identity::DeviceIdentifier;

    #[derive(Default)]
    pub(crate) struct FakeVisual {
        pub fail: bool,
        pub raised: Mutex<Vec<(String, String, PathBuf)>>,
    }

    impl VisualAlert for FakeVisual {
        fn raise(&self, title: &str, message: &str, icon: &Path) -> anyhow::Result<()> {
            if self.fail {
                bail!("notification daemon unavailable");
            }
            self.raised.lock().unwrap().push((
                title.to_string(),
                message.to_string(),
                icon.to_path_buf(),
            ));
            Ok(())
        }
    }

    #[derive(Default)]
    pub(crate) struct FakeAudio {
        pub fail: bool,
        pub played: AtomicUsize,
    }

    impl AudioCue for FakeAudio {
        fn play(&self) -> anyhow::Result<()> {
            if self.fail {
                bail!("audio device unavailable");
            }
            self.played.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn sighting(mac: &str) -> SightingEvent {
        SightingEvent {
            observed: DeviceIdentifier::new(mac),
            received_at: Instant::now(),
        }
    }

    #[test]
    fn test_dispatch_raises_both_channels() {
        let visual = Arc::new(FakeVisual::default());
        let audio = Arc::new(FakeAudio::default());
        let dispatcher = AlertDispatcher::new(
            visual.clone(),
            audio.clone(),
            PathBuf::from("/tmp/cat-icon.png"),
        );

        let report = dispatcher.dispatch(&sighting("AA:BB:CC:DD:EE:FF"));

        assert!(report.visual.is_success());
        assert!(report.audio.is_success());
        assert_eq!(audio.played.load(Ordering::SeqCst), 1);
        let raised = visual.raised.lock().unwrap();
        assert_eq!(
            raised.as_slice(),
            &[(
                "Doorbell".to_string(),
                "Device AA:BB:CC:DD:EE:FF came into range".to_string(),
                PathBuf::from("/tmp/cat-icon.png"),
            )]
        );
    }

    #[test]
    fn test_audio_failure_does_not_affect_visual() {
        let visual = Arc::new(FakeVisual::default());
        let audio = Arc::new(FakeAudio {
            fail: true,
            ..Default::default()
        });
        let dispatcher = AlertDispatcher::new(visual.clone(), audio, PathBuf::new());

        let report = dispatcher.dispatch(&sighting("aa:bb:cc:dd:ee:ff"));

        assert_eq!(report.visual, AlertOutcome::Succeeded);
        assert_eq!(
            report.audio,
            AlertOutcome::Failed("audio device unavailable".to_string())
        );
        assert_eq!(visual.raised.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_visual_failure_does_not_affect_audio() {
        let visual = Arc::new(FakeVisual {
            fail: true,
            ..Default::default()
        });
        let audio = Arc::new(FakeAudio::default());
        let dispatcher = AlertDispatcher::new(visual, audio.clone(), PathBuf::new());

        let report = dispatcher.dispatch(&sighting("aa:bb:cc:dd:ee:ff"));

        assert!(!report.visual.is_success());
        assert_eq!(report.visual.failure(), Some("notification daemon unavailable"));
        assert_eq!(report.audio, AlertOutcome::Succeeded);
        assert_eq!(report.audio.failure(), None);
        assert_eq!(audio.played.load(Ordering::SeqCst), 1);
    }
}
