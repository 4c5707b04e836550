pub mod mcp_client;

use std::io::Write;
use std::path::{Path, PathBuf};

pub use mcp_client::{ClientConfig, McpClient, McpError, ServerConfig, ServerEvent, ToolDescriptor};

/// Name of the log file inside the log directory.
pub const LOG_FILE_NAME: &str = "mcp-stdio.log";

/// Rotated log files kept next to the current one.
const LOG_KEEP: u32 = 3;

/// Return the platform-standard data directory for this crate.
///
/// - macOS: `~/Library/Application Support/mcp-stdio/`
/// - Windows: `{FOLDERID_RoamingAppData}\mcp-stdio\`
/// - Linux: `$XDG_DATA_HOME/mcp-stdio/` (fallback `~/.local/share/...`)
///
/// Falls back to `~/.mcp-stdio/` only if none of the above can be resolved.
pub fn data_dir() -> PathBuf {
    if let Some(dir) = dirs::data_dir() {
        return dir.join("mcp-stdio");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mcp-stdio")
}

/// Where log lines go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Stderr,
    /// Directory holding `mcp-stdio.log` and its rotations.
    Dir(PathBuf),
}

impl Default for LogTarget {
    fn default() -> Self {
        LogTarget::Dir(data_dir())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Initialize the tracing subscriber.
///
/// For a directory target:
/// 1. Rotates existing logs (mcp-stdio.log → .1 → .2 → .3, keeps last 3).
/// 2. Opens a fresh mcp-stdio.log with a line-flushing writer.
/// 3. Logs a startup banner with the log path.
///
/// Returns the log file path, if any. Fails if the file cannot be opened or
/// a global subscriber is already installed.
pub fn init_tracing(target: LogTarget, format: LogFormat) -> std::io::Result<Option<PathBuf>> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mcp_stdio=info,warn"));

    let (writer, log_path) = match &target {
        LogTarget::Stderr => (LogWriter::Stderr, None),
        LogTarget::Dir(dir) => {
            std::fs::create_dir_all(dir)?;
            let log_path = dir.join(LOG_FILE_NAME);
            rotate_log_file(&log_path, LOG_KEEP);

            let log_file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&log_path)?;
            (LogWriter::File(FlushingWriter::new(log_file)), Some(log_path))
        }
    };

    let builder = fmt::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false);

    let installed = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    installed.map_err(|e| std::io::Error::other(e.to_string()))?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_file = ?log_path,
        pid = std::process::id(),
        "=== mcp-stdio starting ==="
    );

    Ok(log_path)
}

/// Rotate log files: `mcp-stdio.log` → `mcp-stdio.log.1` → `.2` → … → `.{keep}`.
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
/// Each log line is on disk before the next one is formatted, so the tail of
/// the log survives a crash of the host process.
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

/// Either log destination behind one `MakeWriter`.
#[derive(Clone)]
enum LogWriter {
    Stderr,
    File(FlushingWriter),
}

impl std::io::Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            LogWriter::Stderr => std::io::stderr().write(buf),
            LogWriter::File(f) => f.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            LogWriter::Stderr => std::io::stderr().flush(),
            LogWriter::File(f) => f.flush(),
        }
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap()
    }

    #[test]
    fn test_rotate_shifts_and_drops_oldest() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join(LOG_FILE_NAME);
        for (suffix, body) in [("", "current"), (".1", "one"), (".2", "two"), (".3", "three")] {
            std::fs::write(format!("{}{suffix}", base.display()), body).unwrap();
        }

        rotate_log_file(&base, 3);

        assert!(!base.exists());
        assert_eq!(read(Path::new(&format!("{}.1", base.display()))), "current");
        assert_eq!(read(Path::new(&format!("{}.2", base.display()))), "one");
        assert_eq!(read(Path::new(&format!("{}.3", base.display()))), "two");
    }

    #[test]
    fn test_rotate_with_gaps() {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path().join(LOG_FILE_NAME);
        std::fs::write(&base, "current").unwrap();

        rotate_log_file(&base, 3);
        rotate_log_file(&base, 3);

        assert_eq!(read(Path::new(&format!("{}.2", base.display()))), "current");
        assert!(!Path::new(&format!("{}.1", base.display())).exists());
    }

    #[test]
    fn test_flushing_writer_writes_through() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("out.log");
        let file = std::fs::File::create(&path).unwrap();

        let mut writer = FlushingWriter::new(file);
        let mut clone = writer.clone();
        writer.write_all(b"first\n").unwrap();
        clone.write_all(b"second\n").unwrap();

        assert_eq!(read(&path), "first\nsecond\n");
    }

    #[test]
    fn test_default_log_target_is_data_dir() {
        assert_eq!(LogTarget::default(), LogTarget::Dir(data_dir()));
        assert!(data_dir().ends_with("mcp-stdio") || data_dir().ends_with(".mcp-stdio"));
    }
}
