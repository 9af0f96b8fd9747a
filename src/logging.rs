//! Logging setup
//!
//! JSON logs to stdout, optionally mirrored to a size-rotated log file.

use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Default maximum log file size (10MB)
pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default number of rotated files kept next to the live one
pub const DEFAULT_MAX_FILES: usize = 5;

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over `log_level`.
pub fn init_tracing(log_level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let console_layer = fmt::layer().json().with_filter(filter());
    let subscriber = tracing_subscriber::registry().with(console_layer);

    match log_file {
        Some(path) => {
            let writer = RotatingFileWriter::with_defaults(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let file_layer = fmt::layer()
                .json()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(filter());
            subscriber.with(file_layer).try_init()?;
            eprintln!(
                "Logging to file: {} ({}MB rotation, {} rotated files kept)",
                path.display(),
                DEFAULT_MAX_FILE_SIZE / (1024 * 1024),
                DEFAULT_MAX_FILES
            );
        }
        None => subscriber.try_init()?,
    }
    Ok(())
}

/// Size-rotated log file writer
///
/// `app.log` is the live file; on rotation it becomes `app.log.1`, older
/// files shift up by one and anything past `max_files` is deleted.
#[derive(Debug, Clone)]
pub struct RotatingFileWriter {
    inner: Arc<Mutex<WriterState>>,
}

#[derive(Debug)]
struct WriterState {
    base_path: PathBuf,
    file: Option<File>,
    current_size: u64,
    max_size: u64,
    max_files: usize,
}

impl RotatingFileWriter {
    pub fn new(path: impl AsRef<Path>, max_size: u64, max_files: usize) -> io::Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if base_path.file_name().is_none() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "log path has no file name"));
        }
        if let Some(parent) = base_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }

        let current_size = fs::metadata(&base_path).map(|m| m.len()).unwrap_or(0);
        let file = open_append(&base_path)?;

        Ok(Self {
            inner: Arc::new(Mutex::new(WriterState {
                base_path,
                file: Some(file),
                current_size,
                max_size,
                max_files,
            })),
        })
    }

    pub fn with_defaults(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::new(path, DEFAULT_MAX_FILE_SIZE, DEFAULT_MAX_FILES)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

impl WriterState {
    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        if self.max_files == 0 {
            fs::remove_file(&self.base_path).ok();
        } else {
            fs::remove_file(self.rotated_path(self.max_files)).ok();
            for index in (1..self.max_files).rev() {
                let from = self.rotated_path(index);
                if from.exists() {
                    fs::rename(&from, self.rotated_path(index + 1))?;
                }
            }
            if self.base_path.exists() {
                fs::rename(&self.base_path, self.rotated_path(1))?;
            }
        }

        self.file = Some(open_append(&self.base_path)?);
        self.current_size = 0;
        Ok(())
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        let mut name = self.base_path.file_name().unwrap_or_default().to_os_string();
        name.push(format!(".{index}"));
        self.base_path.with_file_name(name)
    }
}

impl Write for RotatingFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if state.current_size > 0 && state.current_size + buf.len() as u64 > state.max_size {
            state.rotate()?;
        }

        let file = state
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "Log file not open"))?;
        let written = file.write(buf)?;
        state.current_size += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut state = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        match state.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> fmt::MakeWriter<'a> for RotatingFileWriter {
    type Writer = RotatingFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_writer_creates_parent_dirs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/logs/gateway.log");

        let mut writer = RotatingFileWriter::with_defaults(&path).unwrap();
        writer.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        writer.flush().unwrap();

        assert!(fs::read_to_string(&path).unwrap().contains("hello"));
    }

    #[test]
    fn test_rotation_keeps_bounded_history() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        let mut writer = RotatingFileWriter::new(&path, 64, 2).unwrap();

        for i in 0..20 {
            let line = format!("line {i:02}: credential pool sweep complete\n");
            writer.write_all(line.as_bytes()).unwrap();
        }
        writer.flush().unwrap();

        assert!(path.exists());
        assert!(dir.path().join("gateway.log.1").exists());
        assert!(dir.path().join("gateway.log.2").exists());
        assert!(!dir.path().join("gateway.log.3").exists());

        let live = fs::read_to_string(&path).unwrap();
        assert!(live.contains("line 19"));
    }

    #[test]
    fn test_oversized_line_is_written_whole() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gateway.log");
        let mut writer = RotatingFileWriter::new(&path, 8, 1).unwrap();

        writer.write_all(b"a line longer than the limit\n").unwrap();
        writer.flush().unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "a line longer than the limit\n");
    }
}
