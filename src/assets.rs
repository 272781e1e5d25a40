use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use log::debug;
use tempfile::TempDir;

pub const ICON_FILE_NAME: &str = "cat-icon.png";
pub const ICON_PNG: &[u8] = include_bytes!("../assets/cat-icon.png");
pub const DOORBELL_WAV: &[u8] = include_bytes!("../assets/doorbell.wav");

/// Assets materialised on disk for collaborators that need a path rather
/// than bytes. The directory is deleted when this is closed or dropped.
#[derive(Debug)]
pub struct UnpackedAssets {
    dir: TempDir,
    icon_path: PathBuf,
}

impl UnpackedAssets {
    pub fn unpack() -> anyhow::Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("cat-doorbell")
            .tempdir()
            .context("failed to create temporary directory")?;

        let icon_path = dir.path().join(ICON_FILE_NAME);
        fs::write(&icon_path, ICON_PNG).context("failed to unpack cat icon")?;
        debug!("Unpacked notification icon to {}", icon_path.display());

        Ok(UnpackedAssets { dir, icon_path })
    }

    pub fn icon_path(&self) -> &Path {
        &self.icon_path
    }

    pub fn close(self) -> anyhow::Result<()> {
        let path = self.dir.path().to_path_buf();
        self.dir
            .close()
            .with_context(|| format!("failed to remove {}", path.display()))
    }
}
