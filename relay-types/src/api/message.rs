//! Application messages exchanged once a connection is authenticated.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Header name clients send with their supported wire-protocol version, used
/// during the websocket upgrade for basic compatibility logging.
pub static PROTOCOL_VERSION_HEADER: http::HeaderName =
    http::HeaderName::from_static("x-relay-protocol-version");

/// HTTP-style request tunneled to the local application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlates this request with its [`Response`].
    pub id: uuid::Uuid,
    /// HTTP method, e.g. `"GET"`.
    pub method: String,
    /// Path, relative to the tunneled application's base.
    pub path: String,
    /// Request headers to forward.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Request body. Binary bodies are represented with [`BinaryBody`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
}

/// HTTP-style response to a tunneled [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Matches the originating [`Request::id`].
    pub id: uuid::Uuid,
    /// HTTP status code.
    pub status: u16,
    /// Selected response headers (content-type, etag, and any `x-` prefixed header).
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Response body. Binary bodies are represented with [`BinaryBody`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<serde_json::Value>,
    /// Mirrors an `x-setup-required` response header, if present.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub setup_required: bool,
}

/// Marker wrapper for a base64-encoded binary body, embedded in place of a
/// JSON body when the tunneled content is not text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryBody {
    /// Always `true`; lets the receiver distinguish this from a plain object.
    #[serde(rename = "_binary")]
    pub binary: bool,
    /// Base64-encoded payload.
    pub data: String,
}

impl BinaryBody {
    /// Wraps raw bytes as a binary body marker.
    pub fn new(bytes: &[u8]) -> Self {
        use base64::Engine as _;
        Self {
            binary: true,
            data: base64::engine::general_purpose::STANDARD.encode(bytes),
        }
    }
}

/// The channel a subscription attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubscriptionChannel {
    /// Events scoped to a single agent session.
    Session,
    /// The global activity feed.
    Activity,
    /// A focused file-change watch for a session not owned by this connection.
    SessionWatch,
}

/// Client → server: opens a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscribe {
    /// Client-chosen subscription id; the server rejects collisions.
    pub subscription_id: uuid::Uuid,
    /// Which channel to attach to.
    pub channel: SubscriptionChannel,
    /// Channel-specific parameters (session id, project id, provider hint, ...).
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
    /// Resume hint: the last event id this subscriber already has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_id: Option<u64>,
}

/// Client → server: closes a previously opened subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Unsubscribe {
    /// The subscription to close.
    pub subscription_id: uuid::Uuid,
}

/// Server → client: an event delivered on a subscription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// The subscription this event belongs to.
    pub subscription_id: uuid::Uuid,
    /// Monotonic, per-subscription event id.
    pub event_id: u64,
    /// The event payload, shaped by the producer.
    pub payload: serde_json::Value,
}

/// Server → client: acknowledges a subscription is live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionConnected {
    /// The subscription now live.
    pub subscription_id: uuid::Uuid,
}

/// Server → client: a subscription failed or was refused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionError {
    /// The subscription this error applies to.
    pub subscription_id: uuid::Uuid,
    /// HTTP-shaped status for the failure, e.g. 404 for "no active process".
    pub status: u16,
    /// Human-readable message.
    pub message: String,
}

/// Server → client: a subscription was closed (cleanly, or by transport loss).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionClosed {
    /// The subscription that closed.
    pub subscription_id: uuid::Uuid,
}

/// Server → client, periodic: keeps idle subscriptions alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionHeartbeat {
    /// The subscription this heartbeat applies to.
    pub subscription_id: uuid::Uuid,
}

/// Client → server: begins a resumable upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStart {
    /// Client-chosen upload id.
    pub upload_id: uuid::Uuid,
    /// Owning project.
    pub project_id: String,
    /// Owning agent session.
    pub session_id: String,
    /// Original filename.
    pub filename: String,
    /// Total size in bytes, as declared by the client.
    pub size: u64,
    /// MIME type.
    pub mime_type: String,
}

/// Client → server: a chunk of a running upload, sent as JSON (the binary
/// frame form uses [`UploadChunkHeader`] instead and carries no JSON body).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadChunk {
    /// The upload this chunk belongs to.
    pub upload_id: uuid::Uuid,
    /// Byte offset; must equal the server's running `bytes_received`.
    pub offset: u64,
    /// Base64-encoded chunk bytes.
    pub data: String,
}

/// Binary-frame layout for an upload chunk: 16-byte UUID, 8-byte big-endian
/// offset, followed immediately by the raw chunk bytes (see the codec).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadChunkHeader {
    /// The upload this chunk belongs to.
    pub upload_id: uuid::Uuid,
    /// Byte offset; must equal the server's running `bytes_received`.
    pub offset: u64,
}

impl UploadChunkHeader {
    /// Size in bytes of the encoded header, before the chunk payload.
    pub const ENCODED_LEN: usize = 16 + 8;

    /// Encodes the header as the first [`Self::ENCODED_LEN`] bytes of a
    /// binary-upload-chunk frame payload.
    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut buf = [0u8; Self::ENCODED_LEN];
        buf[..16].copy_from_slice(self.upload_id.as_bytes());
        buf[16..].copy_from_slice(&self.offset.to_be_bytes());
        buf
    }

    /// Decodes the header from the front of a binary-upload-chunk frame
    /// payload, returning the header and the remaining chunk bytes.
    pub fn decode(bytes: &[u8]) -> Option<(Self, &[u8])> {
        if bytes.len() < Self::ENCODED_LEN {
            return None;
        }
        let upload_id = uuid::Uuid::from_slice(&bytes[..16]).ok()?;
        let offset = u64::from_be_bytes(bytes[16..24].try_into().ok()?);
        Some((Self { upload_id, offset }, &bytes[Self::ENCODED_LEN..]))
    }
}

/// Client → server: signals all chunks have been sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEnd {
    /// The upload to finalize.
    pub upload_id: uuid::Uuid,
}

/// Server → client: progress on a running upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadProgress {
    /// The upload this progress report applies to.
    pub upload_id: uuid::Uuid,
    /// Total bytes received so far.
    pub bytes_received: u64,
}

/// Server → client: an upload finished successfully.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadComplete {
    /// The upload that finished.
    pub upload_id: uuid::Uuid,
    /// The staged file descriptor, shaped by the upload-staging collaborator.
    pub file: serde_json::Value,
}

/// Server → client: an upload failed or was cancelled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadError {
    /// The upload that failed.
    pub upload_id: uuid::Uuid,
    /// Human-readable reason.
    pub message: String,
}

/// Either direction: a liveness probe; the receiver must answer with [`Pong`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ping {
    /// Echoed back verbatim in the matching [`Pong`].
    pub id: String,
}

/// Either direction: answers a [`Ping`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pong {
    /// The [`Ping::id`] this answers.
    pub id: String,
}

/// Client → server, sent immediately after authentication: declares which
/// optional frame formats the client understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Capabilities {
    /// Format names the client accepts beyond plain JSON, e.g.
    /// `["compressed-json", "binary-upload"]`.
    #[serde(default)]
    pub formats: Vec<String>,
}

/// Any application message, in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[allow(missing_docs)]
pub enum ApplicationMessage {
    Request(Request),
    Response(Response),
    Subscribe(Subscribe),
    Unsubscribe(Unsubscribe),
    Event(Event),
    SubscriptionConnected(SubscriptionConnected),
    SubscriptionError(SubscriptionError),
    SubscriptionClosed(SubscriptionClosed),
    SubscriptionHeartbeat(SubscriptionHeartbeat),
    UploadStart(UploadStart),
    UploadChunk(UploadChunk),
    UploadEnd(UploadEnd),
    UploadProgress(UploadProgress),
    UploadComplete(UploadComplete),
    UploadError(UploadError),
    Ping(Ping),
    Pong(Pong),
    Capabilities(Capabilities),
}

/// An authenticated payload as it exists inside the plaintext of an
/// encrypted envelope: a monotonic sequence number plus the message itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequencedMessage {
    /// Monotonically increasing per-connection sequence number.
    pub seq: u64,
    /// The wrapped application message.
    pub msg: ApplicationMessage,
}
