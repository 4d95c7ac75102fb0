//! Collaborator traits the relay core depends on but does not implement.
//!
//! The core is agnostic to how the orchestrated agent application actually
//! works; it only needs these seven seams. Test and example binaries provide
//! in-memory implementations; a real deployment wires in the actual
//! application, process supervisor, and stores.

use std::sync::Arc;

use async_trait::async_trait;
use relay_types::{
    api::message::{Request, Response},
    model::{StoredSession, Timestamp},
};
use tokio::sync::mpsc;

/// A single event produced by the activity bus, a session's own process, or
/// a session-watch producer. Payload shape is channel-specific and is not
/// interpreted by the core — it is forwarded verbatim inside an `event`
/// frame.
pub type EventPayload = serde_json::Value;

/// Executes tunneled HTTP requests against the in-process application.
#[async_trait]
pub trait HttpApplication: Send + Sync {
    /// Executes `request` against the application and returns its response.
    async fn handle(&self, request: Request) -> Response;
}

/// A single agent session's live process, as seen by the session supervisor.
pub trait SessionProcess: Send + Sync {
    /// Subscribes to this session's events. Returns a receiver of payloads
    /// and a guard that unregisters the subscription when dropped.
    fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard);
}

/// Looks up the live process owning a given agent session, if any.
pub trait SessionSupervisor: Send + Sync {
    /// Returns the process for `session_id`, or `None` if no process
    /// currently owns that session.
    fn process_for_session(&self, session_id: &str) -> Option<Arc<dyn SessionProcess>>;
}

/// Global event feed: session status, creation, updates, file changes,
/// worker activity, browser tab connect/disconnect.
pub trait ActivityBus: Send + Sync {
    /// Subscribes to the global feed. Returns a receiver of payloads and a
    /// guard that unregisters the subscription when dropped.
    fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard);
}

/// Parameters identifying a focused file-change watch.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionWatchParams {
    /// The session whose working file is being watched.
    pub session_id: String,
    /// The project the session belongs to.
    pub project_id: String,
    /// An optional hint about which provider's file layout to expect.
    pub provider_hint: Option<String>,
}

/// Focused file-change watch for a specific session's file, used by viewers
/// that do not own the underlying process.
pub trait SessionWatch: Send + Sync {
    /// Subscribes to file-change events for `params`. Returns a receiver of
    /// payloads and a guard that unregisters the subscription when dropped.
    fn subscribe(
        &self,
        params: SessionWatchParams,
    ) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard);
}

/// A handle whose `Drop` impl runs a collaborator-provided cleanup closure
/// exactly once.
///
/// Generalizes the teacher's `SessionDropGuard` (which only ever removed a
/// session id from a `HashSet`) to an arbitrary unsubscribe closure, since
/// the relay has several independent kinds of subscription to clean up.
pub struct CleanupGuard {
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CleanupGuard {
    /// Wraps `cleanup` so it runs exactly once, when the guard is dropped.
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cleanup: Some(Box::new(cleanup)),
        }
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
    }
}

/// Where in-flight upload bytes land before an upload is finalized.
#[async_trait]
pub trait UploadStaging: Send + Sync {
    /// Allocates staging space for a new upload.
    async fn start_upload(
        &self,
        upload_id: uuid::Uuid,
        project_id: &str,
        session_id: &str,
        filename: &str,
        size: u64,
        mime_type: &str,
    ) -> Result<(), UploadStagingError>;

    /// Writes `data` at `offset` for the given upload.
    async fn write_chunk(&self, upload_id: uuid::Uuid, offset: u64, data: &[u8]) -> Result<(), UploadStagingError>;

    /// Finalizes the upload, returning a description of the completed file.
    async fn complete_upload(&self, upload_id: uuid::Uuid) -> Result<EventPayload, UploadStagingError>;

    /// Cancels and discards a partially staged upload.
    async fn cancel_upload(&self, upload_id: uuid::Uuid);
}

/// Errors from the upload staging collaborator.
#[derive(Debug, thiserror::Error)]
pub enum UploadStagingError {
    /// The write offset did not match the upload's running byte count.
    #[error("offset {offset} does not match {expected} bytes already received")]
    OffsetMismatch {
        /// The offset the chunk claimed.
        offset: u64,
        /// The number of bytes actually received so far.
        expected: u64,
    },
    /// Any other staging failure (disk full, IO error, unknown upload id).
    #[error("{0}")]
    Other(String),
}

/// The single identity's SRP credentials, provisioned out of band.
pub struct Credentials {
    /// The identity's username.
    pub username: String,
    /// The password salt.
    pub salt: Vec<u8>,
    /// The SRP password verifier.
    pub verifier: Vec<u8>,
}

/// Looks up the single identity's SRP credentials.
pub trait CredentialStore: Send + Sync {
    /// Returns the stored credentials, if any identity has been provisioned.
    fn get_credentials(&self) -> Option<Credentials>;
    /// Returns the provisioned username, if any.
    fn get_username(&self) -> Option<String>;
}

/// Persists resumable sessions (stored sessions).
#[async_trait]
pub trait StoredSessionStore: Send + Sync {
    /// Creates and persists a new stored session.
    async fn create_session(&self, session: StoredSession);
    /// Looks up a stored session by id.
    async fn get_session(&self, session_id: uuid::Uuid) -> Option<StoredSession>;
    /// Validates a resume proof: `ciphertext` under the stored session's key
    /// with `nonce` must decrypt to a timestamp recent enough to accept.
    async fn validate_proof(&self, session_id: uuid::Uuid, nonce: &[u8; 24], ciphertext: &[u8]) -> bool;
    /// Updates the session's `last_connected_at` timestamp.
    async fn update_last_connected(&self, session_id: uuid::Uuid, now: Timestamp);
}

/// The full set of collaborators a [`crate::RelayServerBuilder`] is wired
/// with.
pub struct Collaborators {
    /// The tunneled HTTP application.
    pub http_application: Arc<dyn HttpApplication>,
    /// The agent session supervisor.
    pub session_supervisor: Arc<dyn SessionSupervisor>,
    /// The global activity event bus.
    pub activity_bus: Arc<dyn ActivityBus>,
    /// The focused session-file watch.
    pub session_watch: Arc<dyn SessionWatch>,
    /// Upload staging.
    pub upload_staging: Arc<dyn UploadStaging>,
    /// The single identity's credential store.
    pub credential_store: Arc<dyn CredentialStore>,
    /// The resumable-session store.
    pub stored_session_store: Arc<dyn StoredSessionStore>,
}
