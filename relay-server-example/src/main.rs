//! A minimal demo binary wiring in-memory collaborators into a relay server.
//!
//! Demonstrates the seven trait seams in `relay_server::collaborators` with
//! the simplest implementation that actually works: a single hardcoded
//! identity, an echo application, and no persistence across restarts. A real
//! deployment replaces every collaborator here with its own process
//! supervisor, activity bus, and credential/session stores.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use clap::Parser;
use relay_crypto::secretbox::SessionKey;
use relay_crypto::srp;
use relay_server::RelayServerBuilder;
use relay_server::collaborators::{
    ActivityBus, CleanupGuard, Collaborators, Credentials, CredentialStore, EventPayload, HttpApplication, SessionProcess, SessionSupervisor, SessionWatch, SessionWatchParams, StoredSessionStore,
    UploadStaging, UploadStagingError,
};
use relay_server::config::RelayServerConfig;
use relay_types::api::message::{Request, Response};
use relay_types::model::{StoredSession, Timestamp};
use tokio::sync::mpsc;

#[derive(Parser)]
struct Args {
    #[clap(flatten)]
    server: RelayServerConfig,

    /// The single demo identity's username.
    #[clap(long, env = "RELAY_DEMO_USERNAME", default_value = "demo")]
    username: String,

    /// The single demo identity's password.
    #[clap(long, env = "RELAY_DEMO_PASSWORD", default_value = "demo-password")]
    password: String,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let credentials = DemoCredentials::provision(&args.username, &args.password);
    let bind_addr = args.server.bind_addr;

    let collaborators = Collaborators {
        http_application: Arc::new(EchoApplication),
        session_supervisor: Arc::new(NoSessionSupervisor),
        activity_bus: Arc::new(InMemoryBus::default()),
        session_watch: Arc::new(InMemorySessionWatch),
        upload_staging: Arc::new(InMemoryUploadStaging::default()),
        credential_store: Arc::new(credentials),
        stored_session_store: Arc::new(InMemoryStoredSessionStore::default()),
    };

    let app = RelayServerBuilder::init(args.server, collaborators).build();

    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    tracing::info!(%bind_addr, "relay demo server listening");
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

/// Answers every tunneled request with a canned 200, echoing the method and
/// path back in the body.
struct EchoApplication;

#[async_trait]
impl HttpApplication for EchoApplication {
    async fn handle(&self, request: Request) -> Response {
        Response {
            id: request.id,
            status: 200,
            headers: HashMap::new(),
            body: Some(serde_json::json!({"method": request.method, "path": request.path})),
            setup_required: false,
        }
    }
}

/// No agent sessions are ever running in this demo.
struct NoSessionSupervisor;

impl SessionSupervisor for NoSessionSupervisor {
    fn process_for_session(&self, _session_id: &str) -> Option<Arc<dyn SessionProcess>> {
        None
    }
}

/// An in-memory activity feed: every subscriber gets its own channel,
/// removed from the registry when its [`CleanupGuard`] drops.
#[derive(Default)]
struct InMemoryBus {
    subscribers: Arc<Mutex<HashMap<uuid::Uuid, mpsc::UnboundedSender<EventPayload>>>>,
}

impl ActivityBus for InMemoryBus {
    fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        self.subscribers.lock().unwrap().insert(id, tx);
        let subscribers = Arc::clone(&self.subscribers);
        (rx, CleanupGuard::new(move || { subscribers.lock().unwrap().remove(&id); }))
    }
}

/// No session-file producer exists in this demo; every watch subscription
/// simply never receives an event.
struct InMemorySessionWatch;

impl SessionWatch for InMemorySessionWatch {
    fn subscribe(&self, _params: SessionWatchParams) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (rx, CleanupGuard::new(|| {}))
    }
}

/// Stages uploads directly in process memory, keyed by upload id.
#[derive(Default)]
struct InMemoryUploadStaging {
    uploads: Mutex<HashMap<uuid::Uuid, (String, Vec<u8>)>>,
}

#[async_trait]
impl UploadStaging for InMemoryUploadStaging {
    async fn start_upload(&self, upload_id: uuid::Uuid, _project_id: &str, _session_id: &str, filename: &str, _size: u64, _mime_type: &str) -> Result<(), UploadStagingError> {
        self.uploads.lock().unwrap().insert(upload_id, (filename.to_string(), Vec::new()));
        Ok(())
    }

    async fn write_chunk(&self, upload_id: uuid::Uuid, offset: u64, data: &[u8]) -> Result<(), UploadStagingError> {
        let mut uploads = self.uploads.lock().unwrap();
        let (_, bytes) = uploads.get_mut(&upload_id).ok_or_else(|| UploadStagingError::Other("unknown upload".to_string()))?;
        if bytes.len() as u64 != offset {
            return Err(UploadStagingError::OffsetMismatch { offset, expected: bytes.len() as u64 });
        }
        bytes.extend_from_slice(data);
        Ok(())
    }

    async fn complete_upload(&self, upload_id: uuid::Uuid) -> Result<EventPayload, UploadStagingError> {
        let uploads = self.uploads.lock().unwrap();
        let (filename, bytes) = uploads.get(&upload_id).ok_or_else(|| UploadStagingError::Other("unknown upload".to_string()))?;
        Ok(serde_json::json!({"filename": filename, "size": bytes.len()}))
    }

    async fn cancel_upload(&self, upload_id: uuid::Uuid) {
        self.uploads.lock().unwrap().remove(&upload_id);
    }
}

/// The single demo identity's SRP credentials, computed once at startup.
struct DemoCredentials {
    username: String,
    salt: Vec<u8>,
    verifier: Vec<u8>,
}

impl DemoCredentials {
    fn provision(username: &str, password: &str) -> Self {
        let salt = srp::generate_salt().to_vec();
        let verifier = srp::compute_verifier(username.as_bytes(), password.as_bytes(), &salt);
        Self { username: username.to_string(), salt, verifier }
    }
}

impl CredentialStore for DemoCredentials {
    fn get_credentials(&self) -> Option<Credentials> {
        Some(Credentials { username: self.username.clone(), salt: self.salt.clone(), verifier: self.verifier.clone() })
    }

    fn get_username(&self) -> Option<String> {
        Some(self.username.clone())
    }
}

/// Persists resumable sessions in process memory; gone on restart.
#[derive(Default)]
struct InMemoryStoredSessionStore {
    sessions: Mutex<HashMap<uuid::Uuid, StoredSession>>,
}

#[async_trait]
impl StoredSessionStore for InMemoryStoredSessionStore {
    async fn create_session(&self, session: StoredSession) {
        self.sessions.lock().unwrap().insert(session.session_id, session);
    }

    async fn get_session(&self, session_id: uuid::Uuid) -> Option<StoredSession> {
        self.sessions.lock().unwrap().get(&session_id).cloned()
    }

    async fn validate_proof(&self, session_id: uuid::Uuid, nonce: &[u8; 24], ciphertext: &[u8]) -> bool {
        use base64::Engine as _;
        let Some(session) = self.sessions.lock().unwrap().get(&session_id).cloned() else {
            return false;
        };
        let Ok(key_bytes) = base64::engine::general_purpose::STANDARD.decode(&session.session_key) else {
            return false;
        };
        let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else {
            return false;
        };
        let key = SessionKey::from_bytes(key_bytes);
        relay_crypto::secretbox::open(&key, nonce, ciphertext).is_ok()
    }

    async fn update_last_connected(&self, session_id: uuid::Uuid, now: Timestamp) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
            session.last_connected_at = now;
        }
    }
}
