//! Asynchronous request audit logging
//!
//! The orchestrator hands finished entries to `RequestLogger`, which
//! queues them on a bounded channel drained by a dedicated writer thread.
//! The response path never waits on a log write; when the channel is full
//! the entry is dropped with a warning.

use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;
use store::{LogSink, RequestLogEntry, StoreError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{error, warn};

/// Longest request/response body persisted per entry.
pub const MAX_BODY_LOG_LENGTH: usize = 5000;

/// Truncate a logged body at a character boundary.
pub fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_BODY_LOG_LENGTH {
        return body.to_string();
    }
    let mut end = MAX_BODY_LOG_LENGTH;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...[TRUNCATED]", &body[..end])
}

/// Fire-and-forget writer for request log entries.
pub struct RequestLogger {
    tx: Mutex<Option<mpsc::Sender<RequestLogEntry>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RequestLogger {
    /// Spawn the writer thread. It runs its own small runtime so the
    /// logger works regardless of which runtime the request path uses.
    pub fn new(sink: Arc<dyn LogSink>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<RequestLogEntry>(capacity.max(1));

        let worker = std::thread::Builder::new()
            .name("gproxy-request-log".to_string())
            .spawn(move || {
                let rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(e) => {
                        error!(error = %e, "Failed to build log writer runtime");
                        return;
                    }
                };
                rt.block_on(async move {
                    while let Some(entry) = rx.recv().await {
                        if let Err(e) = sink.append(entry).await {
                            warn!(error = %e, "Request log write failed");
                        }
                    }
                });
            });

        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(e) => {
                error!(error = %e, "Failed to spawn log writer thread");
                None
            }
        };

        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(worker),
        }
    }

    /// Queue an entry without blocking. Bodies are truncated here so every
    /// sink receives bounded records.
    pub fn record(&self, mut entry: RequestLogEntry) {
        entry.request_body = entry.request_body.map(|body| truncate_body(&body));
        entry.response_body = entry.response_body.map(|body| truncate_body(&body));

        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            return;
        };
        match tx.try_send(entry) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("Request log channel full, dropping entry");
            }
            Err(TrySendError::Closed(_)) => {
                warn!("Request log writer stopped, dropping entry");
            }
        }
    }

    /// Close the channel and wait for queued entries to reach the sink.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Log sink appending one JSON object per line to a file.
pub struct JsonLogSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLogSink {
    pub fn new<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait::async_trait]
impl LogSink for JsonLogSink {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        let line = serde_json::to_string(&entry)?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// Sink used when no log file is configured: entries surface only in the
/// structured log.
pub struct TracingLogSink;

#[async_trait::async_trait]
impl LogSink for TracingLogSink {
    async fn append(&self, entry: RequestLogEntry) -> Result<(), StoreError> {
        tracing::debug!(
            url = %entry.original_url,
            method = %entry.method,
            status = ?entry.status,
            cache = %entry.cache_status.as_str(),
            duration_ms = entry.duration_ms,
            "Request log entry"
        );
        Ok(())
    }
}
