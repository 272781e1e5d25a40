use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use log::LevelFilter;

const MAX_LOG_FILES: usize = 10;
const LOG_FILE_SUFFIX: &str = "-cat-doorbell.log";

pub fn default_log_dir() -> PathBuf {
    dirs::state_dir()
        .or_else(dirs::data_local_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("cat-doorbell")
        .join("logs")
}

/// Logs to stderr and to a fresh file in `log_dir`. `RUST_LOG`, when set,
/// is applied on top of `level`.
pub fn init(level: LevelFilter, log_dir: &Path) -> anyhow::Result<PathBuf> {
    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory {}", log_dir.display()))?;
    remove_old_logs(log_dir, MAX_LOG_FILES).context("failed to remove old logs")?;

    let path = log_dir.join(log_file_name());
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;

    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder
        .filter_level(level)
        .target(env_logger::Target::Pipe(Box::new(TeeWriter { file })));
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.try_init().context("failed to install logger")?;

    Ok(path)
}

fn log_file_name() -> String {
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();
    format!("{}-{}{}", started, std::process::id(), LOG_FILE_SUFFIX)
}

/// Keeps the newest `keep` log files. Names start with the start time, so
/// name order is age order.
fn remove_old_logs(log_dir: &Path, keep: usize) -> io::Result<()> {
    let mut logs = Vec::new();
    for entry in fs::read_dir(log_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() && entry.file_name().to_string_lossy().ends_with(LOG_FILE_SUFFIX) {
            logs.push(entry.path());
        }
    }
    if logs.len() <= keep {
        return Ok(());
    }

    logs.sort();
    for path in &logs[..logs.len() - keep] {
        fs::remove_file(path)?;
    }
    Ok(())
}

struct TeeWriter {
    file: File,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        self.file.flush()
    }
}
