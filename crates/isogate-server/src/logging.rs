//! Line-oriented log sink: a size-rotated file plus a broadcast feed.
//!
//! Plugged into `tracing-subscriber` as a [`MakeWriter`]. Each formatted
//! event is buffered by its [`SinkWriter`] and emitted as whole lines when
//! the writer is flushed or dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing_subscriber::fmt::MakeWriter;

const FEED_CAPACITY: usize = 512;

/// `file`, `file.1` … `file.keep`; rotated before a line would push
/// `file` past `max_bytes`.
struct RotatingFile {
    path: PathBuf,
    max_bytes: u64,
    keep: usize,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: &Path, max_bytes: u64, keep: usize) -> io::Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            path: path.to_path_buf(),
            max_bytes,
            keep,
            file,
            written,
        })
    }

    fn generation(&self, n: usize) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;
        if self.keep > 0 {
            for n in (1..self.keep).rev() {
                let from = self.generation(n);
                if from.exists() {
                    fs::rename(&from, self.generation(n + 1))?;
                }
            }
            fs::rename(&self.path, self.generation(1))?;
        }
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        self.written = 0;
        Ok(())
    }

    fn write_line(&mut self, line: &[u8]) -> io::Result<()> {
        let len = line.len() as u64;
        if self.written > 0 && self.written + len > self.max_bytes {
            self.rotate()?;
        }
        self.file.write_all(line)?;
        self.written += len;
        Ok(())
    }
}

/// Shared handle; clones write to the same file and feed.
#[derive(Clone)]
pub struct LogSink {
    file: Option<Arc<Mutex<RotatingFile>>>,
    feed: broadcast::Sender<String>,
}

impl LogSink {
    /// Sink that only publishes to the feed.
    pub fn feed_only() -> Self {
        Self {
            file: None,
            feed: broadcast::channel(FEED_CAPACITY).0,
        }
    }

    pub fn with_file(path: &Path, max_bytes: u64, keep: usize) -> io::Result<Self> {
        let file = RotatingFile::open(path, max_bytes, keep)?;
        Ok(Self {
            file: Some(Arc::new(Mutex::new(file))),
            feed: broadcast::channel(FEED_CAPACITY).0,
        })
    }

    /// Every emitted line, without its trailing newline.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.feed.subscribe()
    }

    fn emit(&self, bytes: &[u8]) {
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            if let Some(file) = &self.file {
                let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
                if let Err(e) = file.write_line(line) {
                    // Nowhere else to report it.
                    eprintln!("log file write failed: {e}");
                }
            }
            let text = String::from_utf8_lossy(line);
            let _ = self
                .feed
                .send(text.trim_end_matches(['\n', '\r']).to_string());
        }
    }
}

/// Per-event writer handed out by [`LogSink`].
pub struct SinkWriter {
    sink: LogSink,
    buf: Vec<u8>,
}

impl Write for SinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let buf = std::mem::take(&mut self.buf);
            self.sink.emit(&buf);
        }
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> MakeWriter<'a> for LogSink {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: self.clone(),
            buf: Vec::new(),
        }
    }
}
