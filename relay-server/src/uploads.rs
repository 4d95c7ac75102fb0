//! Upload engine (§4.G): the upload-start/chunk/end protocol, offset
//! enforcement, and progress reporting.

use std::{collections::HashMap, sync::Arc};

use relay_types::api::message::{UploadComplete, UploadError, UploadProgress};
use tokio::task::JoinHandle;

use crate::collaborators::{Collaborators, UploadStagingError};
use crate::metrics::{METRICS_ID_UPLOADS_BYTES_RECEIVED, METRICS_ID_UPLOADS_COMPLETED, METRICS_ID_UPLOADS_FAILED, METRICS_ID_UPLOADS_IN_PROGRESS};

/// Progress is reported at most once per this many bytes, or on the chunk
/// that completes the upload.
pub const PROGRESS_GRANULARITY_BYTES: u64 = 64 * 1024;

/// Server-side bookkeeping for a single in-flight upload (§3 "Upload
/// state").
struct UploadState {
    expected_size: u64,
    bytes_received: u64,
    last_progress_report: u64,
    pending_writes: Vec<JoinHandle<Result<(), UploadStagingError>>>,
}

/// One connection's in-flight uploads.
#[derive(Default)]
pub struct UploadTable {
    uploads: HashMap<uuid::Uuid, UploadState>,
}

/// What the router should send back to the client after an upload
/// operation.
pub enum UploadOutcome {
    /// A progress report.
    Progress(UploadProgress),
    /// The upload finished.
    Complete(UploadComplete),
    /// The upload failed or was rejected.
    Error(UploadError),
    /// Nothing to send yet — the chunk landed below the reporting
    /// granularity.
    None,
}

impl UploadTable {
    /// Builds an empty upload table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Handles `upload-start`: allocates staging space and returns the
    /// initial zero-byte progress report.
    pub async fn start(
        &mut self,
        collaborators: &Arc<Collaborators>,
        upload_id: uuid::Uuid,
        project_id: &str,
        session_id: &str,
        filename: &str,
        size: u64,
        mime_type: &str,
    ) -> UploadOutcome {
        match collaborators
            .upload_staging
            .start_upload(upload_id, project_id, session_id, filename, size, mime_type)
            .await
        {
            Ok(()) => {
                self.uploads.insert(
                    upload_id,
                    UploadState {
                        expected_size: size,
                        bytes_received: 0,
                        last_progress_report: 0,
                        pending_writes: Vec::new(),
                    },
                );
                metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).increment(1);
                UploadOutcome::Progress(UploadProgress { upload_id, bytes_received: 0 })
            }
            Err(err) => {
                metrics::counter!(METRICS_ID_UPLOADS_FAILED).increment(1);
                UploadOutcome::Error(UploadError { upload_id, message: err.to_string() })
            }
        }
    }

    /// Handles an `upload-chunk` message or binary-upload frame: enforces
    /// that `offset` equals the running byte count, dispatches the write,
    /// and reports progress if the granularity threshold was crossed.
    pub fn write_chunk(&mut self, collaborators: &Arc<Collaborators>, upload_id: uuid::Uuid, offset: u64, data: Vec<u8>) -> UploadOutcome {
        let Some(state) = self.uploads.get_mut(&upload_id) else {
            return UploadOutcome::Error(UploadError { upload_id, message: "unknown upload".to_string() });
        };

        if offset != state.bytes_received {
            let expected = state.bytes_received;
            self.uploads.remove(&upload_id);
            let collaborators = Arc::clone(collaborators);
            tokio::spawn(async move {
                collaborators.upload_staging.cancel_upload(upload_id).await;
            });
            metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).decrement(1);
            metrics::counter!(METRICS_ID_UPLOADS_FAILED).increment(1);
            return UploadOutcome::Error(UploadError {
                upload_id,
                message: format!("offset {offset} does not match {expected} bytes already received"),
            });
        }

        let len = data.len() as u64;
        metrics::counter!(METRICS_ID_UPLOADS_BYTES_RECEIVED).increment(len);
        state.bytes_received += len;
        let bytes_received = state.bytes_received;
        let expected_size = state.expected_size;
        let collaborators_for_write = Arc::clone(collaborators);
        state
            .pending_writes
            .push(tokio::spawn(
                async move { collaborators_for_write.upload_staging.write_chunk(upload_id, offset, &data).await },
            ));

        if bytes_received - state.last_progress_report >= PROGRESS_GRANULARITY_BYTES || bytes_received == expected_size {
            state.last_progress_report = bytes_received;
            UploadOutcome::Progress(UploadProgress { upload_id, bytes_received })
        } else {
            UploadOutcome::None
        }
    }

    /// Handles `upload-end`: awaits every outstanding chunk write, then
    /// finalizes the upload.
    pub async fn end(&mut self, collaborators: &Arc<Collaborators>, upload_id: uuid::Uuid) -> UploadOutcome {
        let Some(mut state) = self.uploads.remove(&upload_id) else {
            return UploadOutcome::Error(UploadError { upload_id, message: "unknown upload".to_string() });
        };

        for handle in state.pending_writes.drain(..) {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    collaborators.upload_staging.cancel_upload(upload_id).await;
                    metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).decrement(1);
                    metrics::counter!(METRICS_ID_UPLOADS_FAILED).increment(1);
                    return UploadOutcome::Error(UploadError { upload_id, message: err.to_string() });
                }
                Err(_join_err) => {
                    collaborators.upload_staging.cancel_upload(upload_id).await;
                    metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).decrement(1);
                    metrics::counter!(METRICS_ID_UPLOADS_FAILED).increment(1);
                    return UploadOutcome::Error(UploadError { upload_id, message: "chunk write task panicked".to_string() });
                }
            }
        }

        metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).decrement(1);
        match collaborators.upload_staging.complete_upload(upload_id).await {
            Ok(file) => {
                metrics::counter!(METRICS_ID_UPLOADS_COMPLETED).increment(1);
                UploadOutcome::Complete(UploadComplete { upload_id, file })
            }
            Err(err) => {
                metrics::counter!(METRICS_ID_UPLOADS_FAILED).increment(1);
                UploadOutcome::Error(UploadError { upload_id, message: err.to_string() })
            }
        }
    }

    /// Cancels every in-flight upload on this connection — called on close.
    pub fn cancel_all(&mut self, collaborators: &Arc<Collaborators>) {
        for (upload_id, _state) in self.uploads.drain() {
            metrics::gauge!(METRICS_ID_UPLOADS_IN_PROGRESS).decrement(1);
            let collaborators = Arc::clone(collaborators);
            tokio::spawn(async move {
                collaborators.upload_staging.cancel_upload(upload_id).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{
        ActivityBus, CleanupGuard, Collaborators, Credentials, CredentialStore, EventPayload, HttpApplication, SessionProcess,
        SessionSupervisor, SessionWatch, SessionWatchParams, StoredSessionStore, UploadStaging,
    };
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use relay_types::api::message::{Request, Response};
    use relay_types::model::{StoredSession, Timestamp};
    use tokio::sync::mpsc;

    struct RecordingUploadStaging {
        writes: Mutex<Vec<(u64, usize)>>,
    }

    #[async_trait]
    impl UploadStaging for RecordingUploadStaging {
        async fn start_upload(&self, _upload_id: uuid::Uuid, _project_id: &str, _session_id: &str, _filename: &str, _size: u64, _mime_type: &str) -> Result<(), UploadStagingError> {
            Ok(())
        }
        async fn write_chunk(&self, _upload_id: uuid::Uuid, offset: u64, data: &[u8]) -> Result<(), UploadStagingError> {
            self.writes.lock().push((offset, data.len()));
            Ok(())
        }
        async fn complete_upload(&self, _upload_id: uuid::Uuid) -> Result<EventPayload, UploadStagingError> {
            Ok(serde_json::json!({"path": "test.bin"}))
        }
        async fn cancel_upload(&self, _upload_id: uuid::Uuid) {}
    }

    struct Unused;
    impl ActivityBus for Unused {
        fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
            mpsc::unbounded_channel()
        }
    }
    impl SessionSupervisor for Unused {
        fn process_for_session(&self, _session_id: &str) -> Option<std::sync::Arc<dyn SessionProcess>> {
            None
        }
    }
    impl SessionWatch for Unused {
        fn subscribe(&self, _params: SessionWatchParams) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
            mpsc::unbounded_channel()
        }
    }
    #[async_trait]
    impl HttpApplication for Unused {
        async fn handle(&self, request: Request) -> Response {
            Response { id: request.id, status: 200, headers: Default::default(), body: None, setup_required: false }
        }
    }
    impl CredentialStore for Unused {
        fn get_credentials(&self) -> Option<Credentials> {
            None
        }
        fn get_username(&self) -> Option<String> {
            None
        }
    }
    #[async_trait]
    impl StoredSessionStore for Unused {
        async fn create_session(&self, _session: StoredSession) {}
        async fn get_session(&self, _session_id: uuid::Uuid) -> Option<StoredSession> {
            None
        }
        async fn validate_proof(&self, _session_id: uuid::Uuid, _nonce: &[u8; 24], _ciphertext: &[u8]) -> bool {
            false
        }
        async fn update_last_connected(&self, _session_id: uuid::Uuid, _now: Timestamp) {}
    }

    fn stub_collaborators(staging: RecordingUploadStaging) -> Arc<Collaborators> {
        Arc::new(Collaborators {
            http_application: Arc::new(Unused),
            session_supervisor: Arc::new(Unused),
            activity_bus: Arc::new(Unused),
            session_watch: Arc::new(Unused),
            upload_staging: Arc::new(staging),
            credential_store: Arc::new(Unused),
            stored_session_store: Arc::new(Unused),
        })
    }

    #[tokio::test]
    async fn mismatched_offset_is_rejected_and_upload_dropped() {
        let collaborators = stub_collaborators(RecordingUploadStaging { writes: Mutex::new(Vec::new()) });
        let mut table = UploadTable::new();
        let upload_id = uuid::Uuid::new_v4();
        table.start(&collaborators, upload_id, "proj", "sess", "f.bin", 10, "application/octet-stream").await;

        let outcome = table.write_chunk(&collaborators, upload_id, 5, vec![0u8; 5]);
        assert!(matches!(outcome, UploadOutcome::Error(_)));

        let outcome = table.write_chunk(&collaborators, upload_id, 0, vec![0u8; 5]);
        assert!(matches!(outcome, UploadOutcome::Error(_)));
    }

    #[tokio::test]
    async fn sequential_chunks_complete_successfully() {
        let collaborators = stub_collaborators(RecordingUploadStaging { writes: Mutex::new(Vec::new()) });
        let mut table = UploadTable::new();
        let upload_id = uuid::Uuid::new_v4();
        table.start(&collaborators, upload_id, "proj", "sess", "f.bin", 10, "application/octet-stream").await;

        let outcome = table.write_chunk(&collaborators, upload_id, 0, vec![0u8; 10]);
        assert!(matches!(outcome, UploadOutcome::Progress(UploadProgress { bytes_received: 10, .. })));

        let outcome = table.end(&collaborators, upload_id).await;
        assert!(matches!(outcome, UploadOutcome::Complete(_)));
    }
}
