//! The client's public surface (§4.J).
//!
//! A [`Connection`] owns exactly one live transport to a host and drives the
//! SRP-6a handshake or session resume over it, then exposes
//! `fetch`/`subscribe*`/`upload` on top. Once authenticated, every
//! application message is sequenced and encrypted under the derived session
//! key — this crate implements the relay/secure transport path named in
//! §4.J; a trusted-local "direct" transport that skips SRP and encryption
//! entirely would be a plain HTTP client with no websocket framing, and has
//! no counterpart here (see DESIGN.md).
//!
//! Reconnection is handled transparently: [`Connection::connect`] blocks
//! until the first handshake succeeds, then hands the socket to a background
//! task that keeps re-authenticating per [`crate::connection_manager`]'s
//! backoff policy whenever the transport drops. Callers of `fetch`/
//! `subscribe*`/`upload` never see the reconnect happen; a request merely
//! waits a little longer, or fails with a retryable [`Error`] if the
//! reconnect attempt budget runs out.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as SyncMutex};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use relay_crypto::codec::{self, DecodedFrame};
use relay_crypto::secretbox::{self, SessionKey};
use relay_crypto::srp::SrpClientSession;
use relay_types::api::handshake::{HandshakeMessage, Hello, Proof, Resume, ResumeInit};
use relay_types::api::message::{ApplicationMessage, Capabilities, Ping, Pong, Response, SequencedMessage, Subscribe, SubscriptionChannel};
use relay_types::model::StoredSession;
use tokio::sync::{Mutex as AsyncMutex, mpsc, oneshot};
use tracing::instrument;
use uuid::Uuid;

use crate::Error;
use crate::config::RelayClientConfig;
use crate::connection_manager::{ConnectionManager, ManagerAction};
pub use crate::connection_manager::{ConnectionManagerState, StateChange};
use crate::runtime;
use crate::subscription::{Subscription, SubscriptionRegistry};
use crate::transport::{self, Closed, Frame, SocketReader, SocketWriter};
use crate::tunnel::Tunnel;
use crate::upload::{self, UploadHandle, UploadRegistry};

/// The identity a connection authenticates as on a fresh SRP-6a exchange.
#[derive(Debug, Clone)]
pub struct ClientIdentity {
    /// The username known to the host's credential store.
    pub username: String,
    /// The plaintext password, used once to run the SRP-6a exchange. Never
    /// persisted — once authenticated, only the derived session key is kept
    /// (consistent with this crate carrying neither `secrecy` nor `zeroize`,
    /// see DESIGN.md).
    pub password: Vec<u8>,
}

struct Authenticated {
    session_key: SessionKey,
    #[allow(dead_code)]
    session_id: Uuid,
    outbound_seq: AtomicU64,
    last_inbound_seq: u64,
}

impl Authenticated {
    fn new(session_key: SessionKey, session_id: Uuid) -> Self {
        Self { session_key, session_id, outbound_seq: AtomicU64::new(1), last_inbound_seq: 0 }
    }

    /// Enforces `seq > lastInboundSeq`, mirroring the server's
    /// `accept_inbound_seq` (§3, §4.D item 2). Returns `false` on a
    /// replayed or reordered sequence number.
    fn accept_inbound_seq(&mut self, seq: u64) -> bool {
        if seq <= self.last_inbound_seq {
            return false;
        }
        self.last_inbound_seq = seq;
        true
    }
}

/// The client half of the relay session-transport protocol (§4.J).
pub struct Connection {
    url: String,
    identity: ClientIdentity,
    resume: AsyncMutex<Option<StoredSession>>,
    config: RelayClientConfig,
    outbound_tx: mpsc::UnboundedSender<ApplicationMessage>,
    tunnel: Tunnel,
    subscriptions: SubscriptionRegistry,
    uploads: UploadRegistry,
    manager: SyncMutex<ConnectionManager>,
    pending_pong: SyncMutex<Option<(String, oneshot::Sender<()>)>>,
    force_reconnect_tx: mpsc::UnboundedSender<()>,
    closing: AtomicBool,
}

impl Connection {
    /// Connects to `url` and runs the handshake (fresh SRP, since no
    /// resumable session has been set yet — see [`Self::set_resume_session`]
    /// to opt into resume on a later reconnect). Blocks until the first
    /// connection is authenticated; afterwards, reconnects happen in the
    /// background.
    #[instrument(skip(identity, config), fields(username = %identity.username))]
    pub async fn connect(url: impl Into<String>, identity: ClientIdentity, config: RelayClientConfig) -> Result<Arc<Self>, Error> {
        let url = url.into();
        let request_timeout = config.request_timeout;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (force_reconnect_tx, force_reconnect_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(Self {
            url,
            identity,
            resume: AsyncMutex::new(None),
            manager: SyncMutex::new(ConnectionManager::new(&config)),
            tunnel: Tunnel::new(outbound_tx.clone(), request_timeout),
            config,
            outbound_tx,
            subscriptions: SubscriptionRegistry::new(),
            uploads: UploadRegistry::new(),
            pending_pong: SyncMutex::new(None),
            force_reconnect_tx,
            closing: AtomicBool::new(false),
        });

        let (writer, reader, auth) = connection.connect_and_authenticate().await?;
        connection.manager.lock().unwrap().mark_connected(Instant::now());

        let background = Arc::clone(&connection);
        runtime::spawn(async move {
            background.serve_and_reconnect(writer, reader, auth, outbound_rx, force_reconnect_rx).await;
        });

        Ok(connection)
    }

    /// Sets (or clears) the stored session used to resume on the next
    /// (re)connect, instead of running a fresh SRP exchange.
    pub async fn set_resume_session(&self, session: Option<StoredSession>) {
        *self.resume.lock().await = session;
    }

    /// The connection manager's current coarse state (§4.H).
    pub fn state(&self) -> ConnectionManagerState {
        self.manager.lock().unwrap().state()
    }

    /// Sends a tunneled HTTP-style request and awaits its response.
    #[instrument(skip(self, headers, body), fields(%method, %path))]
    pub async fn fetch(&self, method: &str, path: &str, headers: HashMap<String, String>, body: Option<serde_json::Value>) -> Result<Response, Error> {
        self.tunnel.request(method, path, headers, body).await
    }

    /// Like [`Self::fetch`], but for a non-JSON body: the request body (if
    /// any) is wrapped as a [`relay_types::api::message::BinaryBody`], and a
    /// binary response body is decoded back to raw bytes.
    #[instrument(skip(self, headers, body), fields(%method, %path))]
    pub async fn fetch_blob(&self, method: &str, path: &str, headers: HashMap<String, String>, body: Option<&[u8]>) -> Result<(Response, Option<Vec<u8>>), Error> {
        self.tunnel.request_blob(method, path, headers, body).await
    }

    async fn subscribe(&self, channel: SubscriptionChannel, params: HashMap<String, serde_json::Value>, last_event_id: Option<u64>) -> Result<Subscription, Error> {
        let subscription_id = Uuid::new_v4();
        let ack_rx = self.subscriptions.begin(subscription_id);
        let subscribe = Subscribe { subscription_id, channel, params, last_event_id };
        self.outbound_tx
            .send(ApplicationMessage::Subscribe(subscribe))
            .map_err(|_| Error::Transport("connection closed before subscribe could be sent".to_string()))?;
        let events_rx = ack_rx.await.map_err(|_| Error::Transport("connection closed before subscription was acknowledged".to_string()))??;
        Ok(Subscription::new(subscription_id, events_rx, self.outbound_tx.clone()))
    }

    /// Opens a subscription to a single agent session's events.
    pub async fn subscribe_session(&self, session_id: &str, last_event_id: Option<u64>) -> Result<Subscription, Error> {
        let params = HashMap::from([("session_id".to_string(), serde_json::Value::String(session_id.to_string()))]);
        self.subscribe(SubscriptionChannel::Session, params, last_event_id).await
    }

    /// Opens a subscription to the global activity feed.
    pub async fn subscribe_activity(&self, last_event_id: Option<u64>) -> Result<Subscription, Error> {
        self.subscribe(SubscriptionChannel::Activity, HashMap::new(), last_event_id).await
    }

    /// Opens a focused file-change watch for a session not owned by this
    /// connection.
    pub async fn subscribe_session_watch(&self, session_id: &str, last_event_id: Option<u64>) -> Result<Subscription, Error> {
        let params = HashMap::from([("session_id".to_string(), serde_json::Value::String(session_id.to_string()))]);
        self.subscribe(SubscriptionChannel::SessionWatch, params, last_event_id).await
    }

    /// Starts a chunked upload and returns a handle to its progress/terminal
    /// events. `data` is streamed to the server in `upload_chunk_size`-byte
    /// pieces.
    #[instrument(skip(self, data), fields(%project_id, %session_id, %filename, size = data.len()))]
    pub async fn upload(&self, project_id: &str, session_id: &str, filename: &str, mime_type: &str, data: &[u8]) -> Result<UploadHandle, Error> {
        let upload_id = Uuid::new_v4();
        let events = self.uploads.register(upload_id);
        upload::send_chunks(
            &self.outbound_tx,
            upload_id,
            project_id.to_string(),
            session_id.to_string(),
            filename.to_string(),
            mime_type.to_string(),
            data,
            self.config.upload_chunk_size,
        )
        .await?;
        Ok(UploadHandle::new(upload_id, events))
    }

    /// Forces an immediate reconnect, e.g. because the embedding application
    /// observed the host becoming reachable again after a network change.
    pub fn force_reconnect(&self) {
        let _ = self.force_reconnect_tx.send(());
    }

    /// Sends a liveness ping and waits up to the configured pong timeout;
    /// forces a reconnect if no pong arrives. Intended to be called by the
    /// embedding application when it observes the page becoming visible
    /// again after having been hidden for a while (§4.H) — this crate has no
    /// visibility API of its own to watch for that condition.
    pub async fn notify_visibility_restored(&self) -> Result<(), Error> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        *self.pending_pong.lock().unwrap() = Some((id.clone(), tx));
        self.outbound_tx.send(ApplicationMessage::Ping(Ping { id })).map_err(|_| Error::Transport("connection closed".to_string()))?;
        match runtime::timeout(self.config.pong_timeout, rx).await {
            Some(Ok(())) => Ok(()),
            _ => {
                self.force_reconnect();
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Permanently closes the connection; no further reconnect attempts are
    /// made.
    pub fn close(&self) {
        self.closing.store(true, Ordering::SeqCst);
        let _ = self.force_reconnect_tx.send(());
    }

    #[instrument(skip(self))]
    async fn connect_and_authenticate(&self) -> Result<(SocketWriter, SocketReader, Authenticated), Error> {
        let (mut writer, mut reader) = transport::connect(&self.url).await.map_err(Error::Transport)?;
        let auth = runtime::timeout(self.config.handshake_timeout, self.authenticate(&mut writer, &mut reader)).await.ok_or(Error::HandshakeTimeout)??;
        Ok((writer, reader, auth))
    }

    async fn authenticate(&self, writer: &mut SocketWriter, reader: &mut SocketReader) -> Result<Authenticated, Error> {
        let resume = self.resume.lock().await.clone();
        if let Some(stored) = resume {
            match self.try_resume(writer, reader, &stored).await {
                Ok(auth) => return Ok(auth),
                Err(err) => tracing::debug!(error = %err, "resume failed, falling back to a fresh SRP exchange"),
            }
        }
        self.srp_handshake(writer, reader).await
    }

    async fn try_resume(&self, writer: &mut SocketWriter, reader: &mut SocketReader, stored: &StoredSession) -> Result<Authenticated, Error> {
        send_handshake(writer, &HandshakeMessage::ResumeInit(ResumeInit { session_id: stored.session_id, username: stored.username.clone() })).await?;
        let HandshakeMessage::ResumeChallenge(challenge) = recv_handshake(reader).await? else {
            return Err(Error::UnexpectedMessage);
        };

        let nonce: [u8; 24] = hex::decode(&challenge.nonce).map_err(|_| Error::UnexpectedMessage)?.try_into().map_err(|_| Error::UnexpectedMessage)?;
        let key_bytes: [u8; 32] = {
            use base64::Engine as _;
            base64::engine::general_purpose::STANDARD.decode(&stored.session_key).map_err(|_| Error::UnexpectedMessage)?.try_into().map_err(|_| Error::UnexpectedMessage)?
        };
        let session_key = SessionKey::from_bytes(key_bytes);

        let now_millis = SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is after the Unix epoch").as_millis() as u64;
        let ciphertext = secretbox::seal_with_nonce(&session_key, &nonce, &now_millis.to_be_bytes());
        let resume = {
            use base64::Engine as _;
            Resume {
                session_id: stored.session_id,
                proof: base64::engine::general_purpose::STANDARD.encode(&ciphertext),
                proof_nonce: base64::engine::general_purpose::STANDARD.encode(nonce),
            }
        };
        send_handshake(writer, &HandshakeMessage::Resume(resume)).await?;

        match recv_handshake(reader).await? {
            HandshakeMessage::Resumed(resumed) => Ok(Authenticated::new(session_key, resumed.session_id)),
            HandshakeMessage::Invalid(_) => Err(Error::InvalidProof),
            _ => Err(Error::UnexpectedMessage),
        }
    }

    async fn srp_handshake(&self, writer: &mut SocketWriter, reader: &mut SocketReader) -> Result<Authenticated, Error> {
        let client = SrpClientSession::step1();
        send_handshake(writer, &HandshakeMessage::Hello(Hello { username: self.identity.username.clone(), a_pub: hex::encode(client.a_pub()) })).await?;

        let challenge = match recv_handshake(reader).await? {
            HandshakeMessage::Challenge(challenge) => challenge,
            HandshakeMessage::Invalid(invalid) if invalid.reason == "unknown_identity" => return Err(Error::UnknownIdentity),
            HandshakeMessage::Invalid(_) => return Err(Error::InvalidProof),
            _ => return Err(Error::UnexpectedMessage),
        };
        let salt = hex::decode(&challenge.salt).map_err(|_| Error::UnexpectedMessage)?;
        let b_pub = hex::decode(&challenge.b_pub).map_err(|_| Error::UnexpectedMessage)?;
        let verified = client.step2(self.identity.username.as_bytes(), &self.identity.password, &salt, &b_pub)?;

        send_handshake(writer, &HandshakeMessage::Proof(Proof { m1: hex::encode(verified.m1()) })).await?;

        match recv_handshake(reader).await? {
            HandshakeMessage::Verify(verify) => {
                let m2 = hex::decode(&verify.m2).map_err(|_| Error::UnexpectedMessage)?;
                verified.step3(&m2)?;
                let session_key = SessionKey::derive_session_key(verified.shared_secret());
                Ok(Authenticated::new(session_key, verify.session_id))
            }
            HandshakeMessage::Invalid(_) => Err(Error::InvalidProof),
            _ => Err(Error::UnexpectedMessage),
        }
    }

    async fn serve_and_reconnect(
        self: Arc<Self>,
        mut writer: SocketWriter,
        mut reader: SocketReader,
        mut auth: Authenticated,
        mut outbound_rx: mpsc::UnboundedReceiver<ApplicationMessage>,
        mut force_reconnect_rx: mpsc::UnboundedReceiver<()>,
    ) {
        loop {
            let err = self.serve(&mut writer, &mut reader, &mut auth, &mut outbound_rx, &mut force_reconnect_rx).await;
            self.tunnel.fail_all();
            self.subscriptions.fail_all();
            self.uploads.fail_all();

            if self.closing.load(Ordering::SeqCst) {
                self.manager.lock().unwrap().stop();
                return;
            }

            let mut retryable = err.is_retryable();
            let mut last_err = err;
            loop {
                let action = self.manager.lock().unwrap().handle_failure(Instant::now(), retryable);
                match action {
                    ManagerAction::GiveUp { .. } => {
                        tracing::warn!(error = %last_err, "relay connection closed permanently");
                        return;
                    }
                    ManagerAction::ScheduleReconnect { delay, .. } => {
                        runtime::sleep(delay).await;
                        if self.closing.load(Ordering::SeqCst) {
                            self.manager.lock().unwrap().stop();
                            return;
                        }
                        match self.connect_and_authenticate().await {
                            Ok((new_writer, new_reader, new_auth)) => {
                                writer = new_writer;
                                reader = new_reader;
                                auth = new_auth;
                                self.manager.lock().unwrap().mark_connected(Instant::now());
                                break;
                            }
                            Err(reconnect_err) => {
                                tracing::debug!(error = %reconnect_err, "reconnect attempt failed");
                                retryable = reconnect_err.is_retryable();
                                last_err = reconnect_err;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Drives one live transport until it closes or a fatal error occurs.
    async fn serve(
        &self,
        writer: &mut SocketWriter,
        reader: &mut SocketReader,
        auth: &mut Authenticated,
        outbound_rx: &mut mpsc::UnboundedReceiver<ApplicationMessage>,
        force_reconnect_rx: &mut mpsc::UnboundedReceiver<()>,
    ) -> Error {
        let capabilities = ApplicationMessage::Capabilities(Capabilities { formats: vec!["compressed-json".to_string(), "binary-upload".to_string()] });
        if let Err(err) = self.send_application(writer, auth, capabilities).await {
            return err;
        }

        loop {
            use futures::FutureExt as _;

            let inbound = reader.recv().fuse();
            let outgoing = outbound_rx.recv().fuse();
            let forced = force_reconnect_rx.recv().fuse();
            let stale_check = runtime::sleep(self.config.stale_check_interval).fuse();
            futures::pin_mut!(inbound, outgoing, forced, stale_check);

            futures::select! {
                frame = inbound => match frame {
                    Some(Ok(frame)) => {
                        if let Err(err) = self.handle_inbound(frame, auth).await {
                            return err;
                        }
                    }
                    Some(Err(Closed::ByPeer { code, reason })) => return Error::ClosedByPeer { code: code.unwrap_or(0), reason },
                    Some(Err(Closed::Error(message))) => return Error::Transport(message),
                    None => return Error::Transport("connection closed by peer".to_string()),
                },
                message = outgoing => match message {
                    Some(message) => {
                        if let Err(err) = self.send_application(writer, auth, message).await {
                            return err;
                        }
                    }
                    None => return Error::Transport("client dropped".to_string()),
                },
                _ = forced => return Error::Transport("reconnect requested".to_string()),
                _ = stale_check => {
                    if self.manager.lock().unwrap().is_stale(Instant::now()) {
                        tracing::debug!("connection considered stale, forcing reconnect");
                        return Error::Transport("stale connection".to_string());
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, frame: Frame, auth: &mut Authenticated) -> Result<(), Error> {
        let decoded = match frame {
            Frame::Text(text) => codec::decode_text_frame(&text)?,
            Frame::Binary(bytes) => codec::decode_binary_frame(&bytes)?,
        };

        let message = match decoded {
            DecodedFrame::Json(value) | DecodedFrame::CompressedJson(value) => serde_json::from_value::<ApplicationMessage>(value).map_err(|_| Error::UnexpectedMessage)?,
            DecodedFrame::EncryptedEnvelope { nonce, ciphertext } => self.decrypt_sequenced(auth, &nonce, &ciphertext, false)?,
            DecodedFrame::LegacyEncryptedEnvelope { nonce, ciphertext } => self.decrypt_sequenced(auth, &nonce, &ciphertext, true)?,
            DecodedFrame::UploadChunk { .. } => return Err(Error::UnexpectedMessage),
        };

        let is_heartbeat = matches!(message, ApplicationMessage::SubscriptionHeartbeat(_));
        self.manager.lock().unwrap().record_event(Instant::now(), is_heartbeat);

        match message {
            ApplicationMessage::Response(response) => self.tunnel.resolve(response),
            ApplicationMessage::Event(event) => self.subscriptions.event(event.subscription_id, event.event_id, event.payload),
            ApplicationMessage::SubscriptionConnected(connected) => self.subscriptions.connected(connected.subscription_id),
            ApplicationMessage::SubscriptionError(error) => self.subscriptions.rejected(error.subscription_id, error.status, error.message),
            ApplicationMessage::SubscriptionClosed(closed) => self.subscriptions.closed(closed.subscription_id),
            ApplicationMessage::SubscriptionHeartbeat(heartbeat) => self.subscriptions.heartbeat(heartbeat.subscription_id),
            ApplicationMessage::UploadProgress(progress) => self.uploads.progress(progress.upload_id, progress.bytes_received),
            ApplicationMessage::UploadComplete(complete) => self.uploads.complete(complete.upload_id, complete.file),
            ApplicationMessage::UploadError(error) => self.uploads.error(error.upload_id, error.message),
            ApplicationMessage::Ping(ping) => {
                let _ = self.outbound_tx.send(ApplicationMessage::Pong(Pong { id: ping.id }));
            }
            ApplicationMessage::Pong(pong) => {
                let mut pending = self.pending_pong.lock().unwrap();
                if pending.as_ref().is_some_and(|(id, _)| *id == pong.id) {
                    if let Some((_, tx)) = pending.take() {
                        let _ = tx.send(());
                    }
                }
            }
            ApplicationMessage::Capabilities(_)
            | ApplicationMessage::Request(_)
            | ApplicationMessage::Subscribe(_)
            | ApplicationMessage::Unsubscribe(_)
            | ApplicationMessage::UploadStart(_)
            | ApplicationMessage::UploadChunk(_)
            | ApplicationMessage::UploadEnd(_) => return Err(Error::UnexpectedMessage),
        }
        Ok(())
    }

    fn decrypt_sequenced(&self, auth: &mut Authenticated, nonce: &[u8; 24], ciphertext: &[u8], legacy: bool) -> Result<ApplicationMessage, Error> {
        let plaintext = secretbox::open(&auth.session_key, nonce, ciphertext)?;
        let value = if legacy {
            serde_json::from_slice(&plaintext).map_err(|err| Error::Codec(relay_crypto::codec::CodecError::from(err)))?
        } else {
            codec::decode_decrypted_payload(&plaintext)?
        };
        let sequenced: SequencedMessage = serde_json::from_value(value).map_err(|_| Error::UnexpectedMessage)?;
        if !auth.accept_inbound_seq(sequenced.seq) {
            // A replayed or reordered sequence number is treated the same as
            // a decryption failure, mirroring the server's own handling.
            return Err(Error::Decryption(relay_crypto::secretbox::SecretboxError::DecryptionFailed));
        }
        Ok(sequenced.msg)
    }

    async fn send_application(&self, writer: &mut SocketWriter, auth: &Authenticated, message: ApplicationMessage) -> Result<(), Error> {
        let seq = auth.outbound_seq.fetch_add(1, Ordering::SeqCst);
        let value = serde_json::to_value(SequencedMessage { seq, msg: message }).expect("always serializable");
        let plaintext = codec::encode_inner_json(&value);
        let sealed = secretbox::seal(&auth.session_key, &plaintext);
        let envelope = codec::encode_encrypted_envelope(&sealed.nonce, &sealed.ciphertext);
        writer.send_binary(envelope).await.map_err(Error::Transport)
    }
}

async fn send_handshake(writer: &mut SocketWriter, message: &HandshakeMessage) -> Result<(), Error> {
    let text = serde_json::to_string(message).expect("handshake messages always serialize");
    writer.send_text(text).await.map_err(Error::Transport)
}

async fn recv_handshake(reader: &mut SocketReader) -> Result<HandshakeMessage, Error> {
    match reader.recv().await {
        Some(Ok(Frame::Text(text))) => serde_json::from_str(&text).map_err(|_| Error::UnexpectedMessage),
        Some(Ok(Frame::Binary(_))) => Err(Error::UnexpectedMessage),
        Some(Err(Closed::ByPeer { code, reason })) => Err(Error::ClosedByPeer { code: code.unwrap_or(0), reason }),
        Some(Err(Closed::Error(message))) => Err(Error::Transport(message)),
        None => Err(Error::Transport("connection closed before handshake completed".to_string())),
    }
}
