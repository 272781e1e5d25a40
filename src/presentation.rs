use std::sync::Arc;

use log::{debug, warn};

use crate::alert::AlertDispatcher;
use crate::assets::UnpackedAssets;
use crate::lifecycle::ShutdownHandle;
use crate::notifier::DesktopNotifier;
use crate::speaker::Speaker;
#[cfg(all(feature = "tray", target_os = "linux"))]
use crate::tray::Tray;

/// The user-facing side of the process: whatever the alert channels need,
/// plus any UI that can ask to quit. Both methods block.
pub trait Presentation: Send {
    fn acquire(&mut self, quit: ShutdownHandle) -> anyhow::Result<AlertDispatcher>;

    /// Releases what `acquire` got, including after a partial acquire.
    fn release(&mut self);
}

/// Desktop notifications, the default audio device and, when built with the
/// `tray` feature, a tray icon.
#[derive(Default)]
pub struct DesktopPresentation {
    assets: Option<UnpackedAssets>,
    speaker: Option<Arc<Speaker>>,
    #[cfg(all(feature = "tray", target_os = "linux"))]
    tray: Option<Tray>,
}

impl Presentation for DesktopPresentation {
    fn acquire(&mut self, quit: ShutdownHandle) -> anyhow::Result<AlertDispatcher> {
        let icon_path = self
            .assets
            .insert(UnpackedAssets::unpack()?)
            .icon_path()
            .to_path_buf();

        let speaker = Arc::new(Speaker::open()?);
        self.speaker = Some(speaker.clone());

        #[cfg(all(feature = "tray", target_os = "linux"))]
        {
            match Tray::spawn(quit) {
                Ok(tray) => self.tray = Some(tray),
                Err(err) => warn!("System tray unavailable: {:#}", err),
            }
        }
        #[cfg(not(all(feature = "tray", target_os = "linux")))]
        {
            debug!("Built without tray support");
            drop(quit);
        }

        Ok(AlertDispatcher::new(Arc::new(DesktopNotifier), speaker, icon_path))
    }

    fn release(&mut self) {
        #[cfg(all(feature = "tray", target_os = "linux"))]
        {
            if let Some(mut tray) = self.tray.take() {
                tray.close();
            }
        }

        if let Some(speaker) = self.speaker.take() {
            speaker.close();
        }

        if let Some(assets) = self.assets.take() {
            match assets.close() {
                Ok(()) => debug!("Removed unpacked assets"),
                Err(err) => warn!("Failed to remove unpacked assets: {:#}", err),
            }
        }
    }
}

impl Drop for DesktopPresentation {
    fn drop(&mut self) {
        self.release();
    }
}
