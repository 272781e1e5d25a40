use std::path::Path;

use anyhow::Context as _;
use notify_rust::Notification;

use crate::alert::VisualAlert;

const APP_NAME: &str = "cat-doorbell";

/// Desktop notifications through the platform's notification service.
#[derive(Debug, Default)]
pub struct DesktopNotifier;

impl VisualAlert for DesktopNotifier {
    fn raise(&self, title: &str, message: &str, icon: &Path) -> anyhow::Result<()> {
        let mut notification = Notification::new();
        notification.summary(title).body(message).appname(APP_NAME);
        if let Some(icon) = icon.to_str() {
            notification.icon(icon);
        }

        notification
            .show()
            .context("failed to show desktop notification")?;
        Ok(())
    }
}
