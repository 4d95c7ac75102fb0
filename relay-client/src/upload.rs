//! Client-side chunked upload driver (§4.G).
//!
//! Chunk transmission is fire-and-forget over the ordered websocket stream —
//! there is no per-chunk acknowledgement, only the periodic `upload-progress`
//! events the server emits at the configured granularity, followed by a
//! terminal `upload-complete` or `upload-error`. [`UploadRegistry`] routes
//! those terminal/progress frames (seen by the orchestrator's read loop)
//! back to whichever [`UploadHandle`] is waiting on them.

use std::collections::HashMap;
use std::sync::Mutex;

use relay_types::api::message::{ApplicationMessage, UploadChunk, UploadEnd, UploadStart};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::Error;

/// An update on a running upload.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    /// Bytes received so far, reported at the server's configured
    /// granularity (default 64 KiB).
    Progress {
        /// Total bytes the server has received for this upload.
        bytes_received: u64,
    },
    /// The upload finished successfully.
    Complete {
        /// The staged file descriptor, shaped by the host application.
        file: serde_json::Value,
    },
    /// The upload failed.
    Error {
        /// Human-readable reason.
        message: String,
    },
}

/// A handle to a running upload (§4.G).
pub struct UploadHandle {
    upload_id: Uuid,
    events: mpsc::UnboundedReceiver<UploadEvent>,
}

impl UploadHandle {
    pub(crate) fn new(upload_id: Uuid, events: mpsc::UnboundedReceiver<UploadEvent>) -> Self {
        Self { upload_id, events }
    }

    /// The id this upload was started with.
    pub fn id(&self) -> Uuid {
        self.upload_id
    }

    /// Waits for the next progress event, or the terminal complete/error
    /// event. Returns `None` once the terminal event has already been
    /// delivered and consumed.
    pub async fn next(&mut self) -> Option<UploadEvent> {
        self.events.recv().await
    }
}

/// Tracks uploads the orchestrator has started, from the client's side.
pub(crate) struct UploadRegistry {
    channels: Mutex<HashMap<Uuid, mpsc::UnboundedSender<UploadEvent>>>,
}

impl UploadRegistry {
    pub(crate) fn new() -> Self {
        Self { channels: Mutex::new(HashMap::new()) }
    }

    pub(crate) fn register(&self, upload_id: Uuid) -> mpsc::UnboundedReceiver<UploadEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.lock().unwrap().insert(upload_id, tx);
        rx
    }

    pub(crate) fn progress(&self, upload_id: Uuid, bytes_received: u64) {
        if let Some(tx) = self.channels.lock().unwrap().get(&upload_id) {
            let _ = tx.send(UploadEvent::Progress { bytes_received });
        }
    }

    pub(crate) fn complete(&self, upload_id: Uuid, file: serde_json::Value) {
        if let Some(tx) = self.channels.lock().unwrap().remove(&upload_id) {
            let _ = tx.send(UploadEvent::Complete { file });
        }
    }

    pub(crate) fn error(&self, upload_id: Uuid, message: String) {
        if let Some(tx) = self.channels.lock().unwrap().remove(&upload_id) {
            let _ = tx.send(UploadEvent::Error { message });
        }
    }

    pub(crate) fn fail_all(&self) {
        for (_, tx) in self.channels.lock().unwrap().drain() {
            let _ = tx.send(UploadEvent::Error { message: "connection closed".to_string() });
        }
    }
}

/// Streams `data` to the server as a sequence of `upload-start`/
/// `upload-chunk`/`upload-end` frames, `chunk_size` bytes at a time.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn send_chunks(
    outbound: &mpsc::UnboundedSender<ApplicationMessage>,
    upload_id: Uuid,
    project_id: String,
    session_id: String,
    filename: String,
    mime_type: String,
    data: &[u8],
    chunk_size: usize,
) -> Result<(), Error> {
    use base64::Engine as _;

    let start = UploadStart { upload_id, project_id, session_id, filename, size: data.len() as u64, mime_type };
    send(outbound, ApplicationMessage::UploadStart(start))?;

    for (offset, chunk) in data.chunks(chunk_size.max(1)).enumerate() {
        let chunk_message = UploadChunk {
            upload_id,
            offset: (offset * chunk_size) as u64,
            data: base64::engine::general_purpose::STANDARD.encode(chunk),
        };
        send(outbound, ApplicationMessage::UploadChunk(chunk_message))?;
    }

    send(outbound, ApplicationMessage::UploadEnd(UploadEnd { upload_id }))
}

fn send(outbound: &mpsc::UnboundedSender<ApplicationMessage>, message: ApplicationMessage) -> Result<(), Error> {
    outbound.send(message).map_err(|_| Error::Transport("connection closed mid-upload".to_string()))
}
