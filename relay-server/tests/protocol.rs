//! End-to-end coverage for a full SRP-6a handshake followed by one encrypted
//! request/response round trip, driven against the real router over a real
//! websocket — the same shape as `oprf-service/tests/setup.rs`, adapted to
//! this protocol's handshake.
//!
//! This is deliberately the one test in the crate that goes through a real
//! socket rather than calling router internals directly: it is the only
//! thing that would have caught a client/server disagreement over where the
//! sequence-number counter starts. It sticks to the legacy JSON-shaped
//! encrypted envelope (a plain text frame) rather than the binary envelope,
//! so the whole exchange can be driven with `send_json`/`receive_json`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum_test::TestServer;
use base64::Engine as _;
use relay_crypto::secretbox::{self, SessionKey};
use relay_crypto::srp::{self, SrpClientSession};
use relay_server::RelayServerBuilder;
use relay_server::collaborators::{
    ActivityBus, CleanupGuard, Collaborators, Credentials, CredentialStore, EventPayload, HttpApplication, SessionProcess, SessionSupervisor, SessionWatch, SessionWatchParams, StoredSessionStore,
    UploadStaging, UploadStagingError,
};
use relay_server::config::RelayServerConfig;
use relay_types::api::handshake::{HandshakeMessage, Hello, Proof};
use relay_types::api::message::{ApplicationMessage, Request, SequencedMessage};
use relay_types::model::{StoredSession, Timestamp};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

const USERNAME: &str = "alice";
const PASSWORD: &str = "correct horse battery staple";

struct EchoApplication;

#[async_trait]
impl HttpApplication for EchoApplication {
    async fn handle(&self, request: Request) -> relay_types::api::message::Response {
        relay_types::api::message::Response {
            id: request.id,
            status: 200,
            headers: HashMap::new(),
            body: Some(serde_json::json!({"method": request.method, "path": request.path})),
            setup_required: false,
        }
    }
}

struct NoSessionSupervisor;

impl SessionSupervisor for NoSessionSupervisor {
    fn process_for_session(&self, _session_id: &str) -> Option<Arc<dyn SessionProcess>> {
        None
    }
}

struct NoActivityBus;

impl ActivityBus for NoActivityBus {
    fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (rx, CleanupGuard::new(|| {}))
    }
}

struct NoSessionWatch;

impl SessionWatch for NoSessionWatch {
    fn subscribe(&self, _params: SessionWatchParams) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
        let (_tx, rx) = mpsc::unbounded_channel();
        (rx, CleanupGuard::new(|| {}))
    }
}

struct NoUploadStaging;

#[async_trait]
impl UploadStaging for NoUploadStaging {
    async fn start_upload(&self, _upload_id: uuid::Uuid, _project_id: &str, _session_id: &str, _filename: &str, _size: u64, _mime_type: &str) -> Result<(), UploadStagingError> {
        Err(UploadStagingError::Other("not exercised by this test".to_string()))
    }

    async fn write_chunk(&self, _upload_id: uuid::Uuid, _offset: u64, _data: &[u8]) -> Result<(), UploadStagingError> {
        Err(UploadStagingError::Other("not exercised by this test".to_string()))
    }

    async fn complete_upload(&self, _upload_id: uuid::Uuid) -> Result<EventPayload, UploadStagingError> {
        Err(UploadStagingError::Other("not exercised by this test".to_string()))
    }

    async fn cancel_upload(&self, _upload_id: uuid::Uuid) {}
}

struct SingleIdentity {
    username: String,
    salt: Vec<u8>,
    verifier: Vec<u8>,
}

impl CredentialStore for SingleIdentity {
    fn get_credentials(&self) -> Option<Credentials> {
        Some(Credentials { username: self.username.clone(), salt: self.salt.clone(), verifier: self.verifier.clone() })
    }

    fn get_username(&self) -> Option<String> {
        Some(self.username.clone())
    }
}

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
        let Some(session) = self.sessions.lock().unwrap().get(&session_id).cloned() else {
            return false;
        };
        let Ok(key_bytes) = base64::engine::general_purpose::STANDARD.decode(&session.session_key) else {
            return false;
        };
        let Ok(key_bytes): Result<[u8; 32], _> = key_bytes.try_into() else {
            return false;
        };
        secretbox::open(&SessionKey::from_bytes(key_bytes), nonce, ciphertext).is_ok()
    }

    async fn update_last_connected(&self, session_id: uuid::Uuid, now: Timestamp) {
        if let Some(session) = self.sessions.lock().unwrap().get_mut(&session_id) {
            session.last_connected_at = now;
        }
    }
}

fn test_server() -> TestServer {
    let salt = srp::generate_salt().to_vec();
    let verifier = srp::compute_verifier(USERNAME.as_bytes(), PASSWORD.as_bytes(), &salt);

    let collaborators = Collaborators {
        http_application: Arc::new(EchoApplication),
        session_supervisor: Arc::new(NoSessionSupervisor),
        activity_bus: Arc::new(NoActivityBus),
        session_watch: Arc::new(NoSessionWatch),
        upload_staging: Arc::new(NoUploadStaging),
        credential_store: Arc::new(SingleIdentity { username: USERNAME.to_string(), salt, verifier }),
        stored_session_store: Arc::new(InMemoryStoredSessionStore::default()),
    };

    let config = RelayServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        allowed_origins: vec!["*".to_string()],
        ws_max_message_size: 8 * 1024 * 1024,
        handshake_timeout: Duration::from_secs(10),
        request_timeout: Duration::from_secs(30),
        subscription_heartbeat_interval: Duration::from_secs(30),
        resume_challenge_validity: Duration::from_secs(60),
        hello_bucket_capacity: 6,
        hello_bucket_refill: Duration::from_secs(360),
        identity_bucket_capacity: 30,
        identity_bucket_refill: Duration::from_secs(1800),
        upload_progress_granularity: 65536,
    };

    let router = RelayServerBuilder::init(config, collaborators).build();
    TestServer::builder().http_transport().build(router).expect("can build test server")
}

/// The legacy JSON-shaped encrypted envelope (a plain text frame), matching
/// `relay_crypto::codec::encode_legacy_encrypted_envelope`'s wire shape.
#[derive(Serialize, Deserialize)]
struct LegacyEnvelope {
    #[serde(rename = "type")]
    kind: String,
    nonce: String,
    ciphertext: String,
}

impl LegacyEnvelope {
    fn seal(key: &SessionKey, sequenced: &SequencedMessage) -> Self {
        let plaintext = serde_json::to_vec(sequenced).expect("always serializable");
        let sealed = secretbox::seal(key, &plaintext);
        Self {
            kind: "encrypted".to_string(),
            nonce: base64::engine::general_purpose::STANDARD.encode(sealed.nonce),
            ciphertext: base64::engine::general_purpose::STANDARD.encode(sealed.ciphertext),
        }
    }

    fn open(&self, key: &SessionKey) -> SequencedMessage {
        let nonce: [u8; 24] = base64::engine::general_purpose::STANDARD.decode(&self.nonce).expect("valid base64").try_into().expect("24-byte nonce");
        let ciphertext = base64::engine::general_purpose::STANDARD.decode(&self.ciphertext).expect("valid base64");
        let plaintext = secretbox::open(key, &nonce, &ciphertext).expect("sealed with the same session key");
        serde_json::from_slice(&plaintext).expect("server sends a SequencedMessage")
    }
}

#[tokio::test]
async fn handshake_then_request_round_trip() {
    let server = test_server();
    let mut websocket = server.get_websocket("/relay").add_header(http::header::ORIGIN.as_str(), "http://localhost").await.into_websocket().await;

    // `hello` → `challenge` → `proof` → `verify`, written out by hand since
    // this test cannot depend on `relay-client`'s orchestrator.
    let client = SrpClientSession::step1();
    websocket
        .send_json(&HandshakeMessage::Hello(Hello { username: USERNAME.to_string(), a_pub: hex::encode(client.a_pub()) }))
        .await;

    let challenge = match websocket.receive_json::<HandshakeMessage>().await {
        HandshakeMessage::Challenge(challenge) => challenge,
        other => panic!("expected challenge, got {other:?}"),
    };
    let salt = hex::decode(&challenge.salt).expect("server sends valid hex salt");
    let b_pub = hex::decode(&challenge.b_pub).expect("server sends valid hex b_pub");
    let verified = client.step2(USERNAME.as_bytes(), PASSWORD.as_bytes(), &salt, &b_pub).expect("correct password verifies");

    websocket.send_json(&HandshakeMessage::Proof(Proof { m1: hex::encode(verified.m1()) })).await;

    let verify = match websocket.receive_json::<HandshakeMessage>().await {
        HandshakeMessage::Verify(verify) => verify,
        other => panic!("expected verify, got {other:?}"),
    };
    verified.step3(&hex::decode(&verify.m2).expect("server sends valid hex m2")).expect("server proof verifies");

    let session_key = SessionKey::derive_session_key(verified.shared_secret());

    // The very first authenticated application message must carry seq=1 —
    // this is exactly the off-by-one this test guards against.
    let request = Request { id: uuid::Uuid::new_v4(), method: "GET".to_string(), path: "/ping".to_string(), headers: HashMap::new(), body: None };
    let sequenced = SequencedMessage { seq: 1, msg: ApplicationMessage::Request(request.clone()) };
    websocket.send_json(&LegacyEnvelope::seal(&session_key, &sequenced)).await;

    let reply = tokio::time::timeout(Duration::from_secs(5), websocket.receive_json::<LegacyEnvelope>())
        .await
        .expect("server replies within the timeout — a hang here means the seq check rejected the frame");
    let reply_sequenced = reply.open(&session_key);

    assert_eq!(reply_sequenced.seq, 1);
    match reply_sequenced.msg {
        ApplicationMessage::Response(response) => {
            assert_eq!(response.id, request.id);
            assert_eq!(response.status, 200);
        }
        other => panic!("expected a Response, got {other:?}"),
    }
}
