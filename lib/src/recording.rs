//! Wire traffic recording
//!
//! A recorder sees every message text crossing the connection. The `shutdown`
//! request stops it; stopping twice is harmless.

use crate::error::Result;
use crate::sync::lock;
use chrono::Utc;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Incoming,
    Outgoing,
}

pub trait TrafficRecorder: Send + Sync {
    fn record(&self, direction: Direction, text: &str);

    /// Flush and stop recording; later records are dropped
    fn stop(&self);
}

#[derive(Serialize)]
struct Entry {
    timestamp: String,
    direction: Direction,
    message: serde_json::Value,
}

/// Appends one JSON object per message to a file
pub struct JsonlRecorder {
    path: PathBuf,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl JsonlRecorder {
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!("Recording wire traffic to {}", path.display());
        Ok(Self {
            path,
            writer: Mutex::new(Some(BufWriter::new(file))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl TrafficRecorder for JsonlRecorder {
    fn record(&self, direction: Direction, text: &str) {
        let mut guard = lock(&self.writer);
        let Some(writer) = guard.as_mut() else {
            return;
        };

        // Unparseable input is still recorded, as a JSON string
        let message = serde_json::from_str(text)
            .unwrap_or_else(|_| serde_json::Value::String(text.to_string()));

        let entry = Entry {
            timestamp: Utc::now().to_rfc3339(),
            direction,
            message,
        };
        let result = serde_json::to_writer(&mut *writer, &entry)
            .map_err(std::io::Error::from)
            .and_then(|_| writer.write_all(b"\n"));
        if let Err(e) = result {
            tracing::warn!("Failed to record message to {}: {}", self.path.display(), e);
        }
    }

    fn stop(&self) {
        if let Some(mut writer) = lock(&self.writer).take() {
            if let Err(e) = writer.flush() {
                tracing::warn!("Failed to flush recording {}: {}", self.path.display(), e);
            }
            tracing::info!("Stopped recording to {}", self.path.display());
        }
    }
}
