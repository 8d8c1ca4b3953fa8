pub mod config;
pub mod dispatch;
pub mod mcp_client;
pub mod oauth;
pub mod service;
pub mod status;

#[cfg(test)]
mod test_support;

use std::path::Path;

use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::EnvFilter;

pub use config::{load_config, load_or_default, ConnectConfig, LoggingConfig};
pub use dispatch::{CapabilityDispatcher, DispatchError, OperationResponse};
pub use mcp_client::{McpError, ServiceTool};
pub use oauth::{OAuthDiscovery, OAuthError};
pub use service::{InMemoryServiceStore, Service, ServiceStore};
pub use status::{BroadcastStatusSink, NoopStatusSink, ServiceStatusUpdate, StatusSink};

/// Install the global tracing subscriber.
///
/// With `logging.file` set, existing logs are rotated (`connect.log` →
/// `connect.log.1` → …, keeping `keep_files`) and a fresh file is opened
/// with a line-flushing writer. Otherwise logs go to stderr. `RUST_LOG`
/// overrides the configured filter. A subscriber that is already installed
/// is left alone.
pub fn init_tracing(config: &LoggingConfig) -> std::io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let writer = match &config.file {
        Some(file) => {
            let log_path = Path::new(file);
            if let Some(dir) = log_path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            rotate_log_file(log_path, config.keep_files);
            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)?;
            BoxMakeWriter::new(FlushingWriter::new(log_file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };
    let ansi = config.file.is_none();

    let installed = if config.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_target(true)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_ansi(ansi)
            .with_target(true)
            .with_thread_ids(false)
            .try_init()
    };
    if installed.is_err() {
        return Ok(());
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?config.file,
        pid = std::process::id(),
        "=== agent-deck-connect starting ==="
    );
    Ok(())
}

/// Rotate log files: `connect.log` → `connect.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    if keep == 0 {
        let _ = std::fs::remove_file(base_path);
        return;
    }

    // Delete the oldest
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    // Shift: .{n-1} → .{n}
    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    // Current → .1
    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// `tracing-subscriber` buffers log output internally. Without explicit
/// flushing, log entries may sit in OS buffers and be lost on crash.
#[derive(Clone)]
struct FlushingWriter {
    file: std::sync::Arc<std::sync::Mutex<std::fs::File>>,
}

impl FlushingWriter {
    fn new(file: std::fs::File) -> Self {
        Self {
            file: std::sync::Arc::new(std::sync::Mutex::new(file)),
        }
    }
}

impl std::io::Write for FlushingWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        let n = std::io::Write::write(&mut *f, buf)?;
        std::io::Write::flush(&mut *f)?;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let mut f = self
            .file
            .lock()
            .map_err(|e| std::io::Error::other(format!("lock poisoned: {e}")))?;
        std::io::Write::flush(&mut *f)
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for FlushingWriter {
    type Writer = FlushingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_shifts_and_drops_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("connect.log");
        std::fs::write(&base, "current").unwrap();
        std::fs::write(dir.path().join("connect.log.1"), "one").unwrap();
        std::fs::write(dir.path().join("connect.log.2"), "two").unwrap();

        rotate_log_file(&base, 2);

        assert!(!base.exists());
        let read = |name: &str| std::fs::read_to_string(dir.path().join(name)).unwrap();
        assert_eq!(read("connect.log.1"), "current");
        assert_eq!(read("connect.log.2"), "one");
        assert!(!dir.path().join("connect.log.3").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();
        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"line\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "line\n");
    }

    #[test]
    fn test_init_tracing_creates_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("connect.log");
        let config = LoggingConfig {
            file: Some(path.to_string_lossy().into_owned()),
            ..LoggingConfig::default()
        };
        init_tracing(&config).unwrap();
        assert!(path.exists());
    }
}
