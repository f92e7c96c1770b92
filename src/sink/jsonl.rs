use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write as _};
use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;

use super::TradeQueue;
use crate::error::SinkError;
use crate::types::{now_ms, CanonicalTrade};

const FLUSH_EVERY_LINES: usize = 500;
const FLUSH_EVERY_MS: u64 = 1_000;

const BACKEND: &str = "jsonl";

/// Append-only JSONL trade buffer. One line per pushed trade.
///
/// Meant for local runs without Redis; a consumer tails the file.
pub struct JsonlQueue {
    inner: Mutex<Appender>,
}

struct Appender {
    out: BufWriter<File>,
    pending_lines: usize,
    last_flush_ms: u64,
}

impl JsonlQueue {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(queue_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(queue_err)?;
        Ok(Self {
            inner: Mutex::new(Appender {
                out: BufWriter::new(file),
                pending_lines: 0,
                last_flush_ms: now_ms(),
            }),
        })
    }

    fn with_appender<T>(
        &self,
        f: impl FnOnce(&mut Appender) -> std::io::Result<T>,
    ) -> Result<T, SinkError> {
        let mut guard = self.inner.lock().map_err(|_| SinkError::Queue {
            backend: BACKEND,
            source: "jsonl appender lock poisoned".into(),
        })?;
        f(&mut guard).map_err(queue_err)
    }
}

impl Appender {
    fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.out.write_all(line.as_bytes())?;
        self.out.write_all(b"\n")?;
        self.pending_lines = self.pending_lines.saturating_add(1);

        let now = now_ms();
        if self.pending_lines >= FLUSH_EVERY_LINES
            || now.saturating_sub(self.last_flush_ms) >= FLUSH_EVERY_MS
        {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.pending_lines = 0;
        self.last_flush_ms = now_ms();
        Ok(())
    }

    fn flush_and_sync(&mut self) -> std::io::Result<()> {
        self.flush()?;
        self.out.get_ref().sync_all()
    }
}

#[async_trait]
impl TradeQueue for JsonlQueue {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn push(&self, trade: &CanonicalTrade) -> Result<(), SinkError> {
        let line = serde_json::to_string(trade)?;
        self.with_appender(|a| a.write_line(&line))
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.with_appender(Appender::flush_and_sync)
    }
}

impl Drop for JsonlQueue {
    fn drop(&mut self) {
        if let Ok(mut a) = self.inner.lock() {
            let _ = a.flush_and_sync();
        }
    }
}

fn queue_err(e: std::io::Error) -> SinkError {
    SinkError::Queue {
        backend: BACKEND,
        source: Box::new(e),
    }
}
