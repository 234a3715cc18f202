//! Shared logging setup for the taskbridge binaries.
//!
//! Both processes log to stderr and to a size-rotated file under
//! `~/.taskbridge/logs/<app>.log`, filtered by `RUST_LOG` when set.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_LOG_FILTER: &str =
    "taskbridge_coordinator=info,taskbridge_worker=info,taskbridge_protocol=info";
const MAX_ROTATED_FILES: usize = 5;
const MAX_LOG_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Initialize tracing for a taskbridge binary.
///
/// `log_level` overrides the default filter for both outputs; `RUST_LOG`
/// wins over both when present.
pub fn init_logging(app_name: &str, log_level: Option<&str>) -> Result<()> {
    let log_dir = ensure_logs_dir().context("Failed to ensure log directory")?;
    let writer = RotatingWriter::open(log_dir, app_name)
        .context("Failed to open rotating log file")?;

    let base_filter = log_level.unwrap_or(DEFAULT_LOG_FILTER);
    let file_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(base_filter));
    let console_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(base_filter));

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_filter(file_filter),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(console_filter),
        )
        .init();

    Ok(())
}

/// The taskbridge home directory: `~/.taskbridge` (override: `TASKBRIDGE_HOME`).
pub fn taskbridge_home() -> PathBuf {
    if let Ok(override_path) = std::env::var("TASKBRIDGE_HOME") {
        return PathBuf::from(override_path);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".taskbridge")
}

/// The logs directory: `~/.taskbridge/logs`.
pub fn logs_dir() -> PathBuf {
    taskbridge_home().join("logs")
}

fn ensure_logs_dir() -> Result<PathBuf> {
    let logs = logs_dir();
    fs::create_dir_all(&logs)
        .with_context(|| format!("Failed to create logs directory: {}", logs.display()))?;
    Ok(logs)
}

/// Size-based log rotation: `<app>.log` is renamed to `<app>.log.1` (and so
/// on, oldest dropped) once it crosses [`MAX_LOG_FILE_BYTES`].
struct Rotator {
    dir: PathBuf,
    base: String,
    file: File,
    written: u64,
}

impl Rotator {
    fn open(dir: PathBuf, base: String) -> io::Result<Self> {
        let file = Self::append_handle(&dir, &base)?;
        let written = file.metadata()?.len();
        let mut rotator = Self {
            dir,
            base,
            file,
            written,
        };
        if rotator.written > MAX_LOG_FILE_BYTES {
            rotator.rotate()?;
        }
        Ok(rotator)
    }

    fn append_handle(dir: &PathBuf, base: &str) -> io::Result<File> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("{}.log", base)))
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{}.log.{}", self.base, index))
    }

    fn rotate(&mut self) -> io::Result<()> {
        let _ = self.file.flush();

        let oldest = self.rotated_path(MAX_ROTATED_FILES - 1);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for index in (1..MAX_ROTATED_FILES - 1).rev() {
            let src = self.rotated_path(index);
            if src.exists() {
                fs::rename(&src, self.rotated_path(index + 1))?;
            }
        }
        let current = self.dir.join(format!("{}.log", self.base));
        if current.exists() {
            fs::rename(&current, self.rotated_path(1))?;
        }

        self.file = Self::append_handle(&self.dir, &self.base)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for Rotator {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written + buf.len() as u64 > MAX_LOG_FILE_BYTES {
            self.rotate()?;
        }
        let bytes = self.file.write(buf)?;
        self.written += bytes as u64;
        Ok(bytes)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// Clonable `MakeWriter` handle over the shared rotator.
#[derive(Clone)]
struct RotatingWriter {
    inner: Arc<Mutex<Rotator>>,
}

impl RotatingWriter {
    fn open(dir: PathBuf, app_name: &str) -> Result<Self> {
        let base: String = app_name
            .chars()
            .map(|ch| {
                if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                    ch
                } else {
                    '_'
                }
            })
            .collect();
        let rotator = Rotator::open(dir, base)
            .with_context(|| format!("Failed to open log file for {}", app_name))?;
        Ok(Self {
            inner: Arc::new(Mutex::new(rotator)),
        })
    }
}

struct RotatingWriterGuard {
    inner: Arc<Mutex<Rotator>>,
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for RotatingWriter {
    type Writer = RotatingWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriterGuard {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Write for RotatingWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "log writer lock poisoned"))?;
        guard.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotator_rolls_over() {
        let dir = tempfile::tempdir().unwrap();
        let mut rotator = Rotator::open(dir.path().to_path_buf(), "test".to_string()).unwrap();
        rotator.written = MAX_LOG_FILE_BYTES; // force the next write to rotate
        rotator.write_all(b"after rotation\n").unwrap();
        rotator.flush().unwrap();

        assert!(dir.path().join("test.log").exists());
        assert!(dir.path().join("test.log.1").exists());
        let fresh = fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert_eq!(fresh, "after rotation\n");
    }

    #[test]
    fn test_home_env_override() {
        std::env::set_var("TASKBRIDGE_HOME", "/tmp/tb-test-home");
        assert_eq!(taskbridge_home(), PathBuf::from("/tmp/tb-test-home"));
        std::env::remove_var("TASKBRIDGE_HOME");
    }
}
