//! toolmux — resilient multiplexing client for MCP tool servers.
//!
//! The [`mcp_client`] module holds everything: transports, the connection
//! pool with reconnect-and-retry, the schema advisory, configuration,
//! discovery cache and the host-facing tool surface.

pub mod mcp_client;

use std::path::{Path, PathBuf};

/// Where log output goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Rotated `toolmux.log` in the data directory.
    File,
    /// Standard error, for interactive use. Stdout is left to results.
    Stderr,
}

/// Return the platform-standard data directory for toolmux.
///
/// - macOS: `~/Library/Application Support/toolmux/`
/// - Windows: `{FOLDERID_RoamingAppData}\toolmux\`
/// - Linux: `$XDG_DATA_HOME/toolmux/` (fallback `~/.local/share/toolmux/`)
///
/// Falls back to `~/.toolmux/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("toolmux");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".toolmux")
}

/// Initialize the tracing subscriber.
///
/// `RUST_LOG` overrides the default `toolmux=info,warn` filter. With
/// [`LogTarget::File`], existing logs are rotated (keeping the last 3) and a
/// fresh `toolmux.log` is opened with a line-flushing writer; its path is
/// returned. Calling this twice is harmless: the second subscriber is not
/// installed.
pub fn init_tracing(target: LogTarget) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolmux=info,warn"));

    match target {
        LogTarget::Stderr => {
            let _ = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .try_init();
            Ok(None)
        }
        LogTarget::File => {
            let log_dir = data_dir();
            std::fs::create_dir_all(&log_dir)?;
            let log_path = log_dir.join("toolmux.log");

            // Rotate: toolmux.log.2 → .3, .1 → .2, toolmux.log → .1
            rotate_log_file(&log_path, 3);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;

            let installed = fmt::fmt()
                .with_env_filter(filter)
                .with_writer(FlushingWriter::new(log_file))
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .try_init()
                .is_ok();

            if installed {
                tracing::info!(
                    version = env!("CARGO_PKG_VERSION"),
                    log_file = %log_path.display(),
                    pid = std::process::id(),
                    "=== toolmux starting ==="
                );
            }
            Ok(Some(log_path))
        }
    }
}

/// Rotate log files: `toolmux.log` → `toolmux.log.1` → `.2` → … → `.{keep}`.
///
/// Oldest file beyond `keep` is deleted. Missing files in the chain are skipped.
fn rotate_log_file(base_path: &Path, keep: u32) {
    let oldest = format!("{}.{keep}", base_path.display());
    let _ = std::fs::remove_file(&oldest);

    for i in (1..keep).rev() {
        let from = format!("{}.{i}", base_path.display());
        let to = format!("{}.{}", base_path.display(), i + 1);
        let _ = std::fs::rename(&from, &to);
    }

    if base_path.exists() {
        let to = format!("{}.1", base_path.display());
        let _ = std::fs::rename(base_path, &to);
    }
}

/// A writer that wraps `std::fs::File` and flushes after every write.
///
/// Without explicit flushing, the last log lines before a crash can sit in
/// OS buffers and be lost.
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
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_rotate_log_file_keeps_last_three() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("toolmux.log");

        for generation in 0..5 {
            std::fs::write(&base, format!("gen {generation}")).unwrap();
            rotate_log_file(&base, 3);
        }

        assert!(!base.exists());
        let read = |suffix: u32| {
            std::fs::read_to_string(format!("{}.{suffix}", base.display())).unwrap()
        };
        assert_eq!(read(1), "gen 4");
        assert_eq!(read(2), "gen 3");
        assert_eq!(read(3), "gen 2");
        assert!(!dir.path().join("toolmux.log.4").exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        writer.write_all(b"first line\n").unwrap();
        let mut clone = writer.clone();
        clone.write_all(b"second line\n").unwrap();

        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first line\nsecond line\n"
        );
    }

    #[test]
    fn test_data_dir_ends_with_app_name() {
        let dir = data_dir();
        let last = dir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(last == "toolmux" || last == ".toolmux");
    }
}
