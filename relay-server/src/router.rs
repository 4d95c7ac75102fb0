//! Per-connection message router (§4.D).
//!
//! A [`Connection`] owns everything a single socket needs: its auth state,
//! its live subscriptions and uploads, and an in-progress SRP exchange, if
//! any. Frames are read and dispatched strictly sequentially — the only
//! concurrency is the subscription forwarders' background tasks, which feed
//! their events back through [`Connection::outbound_tx`] rather than
//! touching the socket directly (§5: a connection has a single writer).

use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use axum::extract::ws::{Message, WebSocket};
use base64::Engine as _;
use relay_crypto::codec::{self, CodecError, DecodedFrame};
use relay_crypto::secretbox::{self, SecretboxError, SessionKey};
use relay_crypto::srp::{SrpServerSession, SrpSessionError};
use relay_types::api::FrameFormat;
use relay_types::api::handshake::{Challenge, HandshakeMessage, Hello, Invalid, Proof, Resume, ResumeChallenge, ResumeInit, Resumed, Verify};
use relay_types::api::message::{
    ApplicationMessage, Capabilities, Ping, Pong, SequencedMessage, Subscribe, SubscriptionError, Unsubscribe, UploadChunkHeader, UploadEnd,
};
use relay_types::model::{StoredSession, Timestamp};
use tokio::sync::mpsc;

use crate::api::errors::Error;
use crate::collaborators::Collaborators;
use crate::connection::admission::Admission;
use crate::connection::rate_limit::IdentityBucket;
use crate::connection::state::{AuthPhase, ConnectionState, HelloRateLimit};
use crate::metrics::{
    METRICS_ID_CONNECTIONS_REJECTED, METRICS_ID_HANDSHAKE_FAILURE, METRICS_ID_HANDSHAKE_SUCCESS, METRICS_ID_RESUME_FAILURE,
    METRICS_ID_RESUME_SUCCESS,
};
use crate::subscriptions::{OutboundSink, SubscribeError, SubscriptionTable};
use crate::tunnel;
use crate::uploads::{UploadOutcome, UploadTable};

/// In-progress SRP-6a exchange, held between `hello` and `proof`.
struct PendingSrp {
    username: String,
    a_pub: Vec<u8>,
    verifier: Vec<u8>,
    server: SrpServerSession,
}

/// One accepted socket's full router state.
pub struct Connection {
    state: ConnectionState,
    subscriptions: SubscriptionTable,
    uploads: UploadTable,
    collaborators: Arc<Collaborators>,
    admission: Arc<Admission>,
    pending_srp: Option<PendingSrp>,
    outbound_tx: OutboundSink,
    outbound_rx: mpsc::UnboundedReceiver<ApplicationMessage>,
    heartbeat_interval: Duration,
    request_timeout: Duration,
}

impl Connection {
    /// Builds a connection router around a freshly admitted `state`.
    pub fn new(
        state: ConnectionState,
        collaborators: Arc<Collaborators>,
        admission: Arc<Admission>,
        heartbeat_interval: Duration,
        request_timeout: Duration,
    ) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            state,
            subscriptions: SubscriptionTable::new(),
            uploads: UploadTable::new(),
            collaborators,
            admission,
            pending_srp: None,
            outbound_tx,
            outbound_rx,
            heartbeat_interval,
            request_timeout,
        }
    }

    /// Drives the connection until it closes or a fatal error occurs.
    /// `handshake_timeout` bounds the time allowed to reach `authenticated`;
    /// once authenticated it no longer applies. Always runs [`Self::shutdown`]
    /// before returning, whatever the outcome.
    pub async fn run(mut self, ws: &mut WebSocket, handshake_timeout: Duration) -> Result<(), Error> {
        let result = self.run_inner(ws, handshake_timeout).await;
        self.shutdown();
        result
    }

    async fn run_inner(&mut self, ws: &mut WebSocket, handshake_timeout: Duration) -> Result<(), Error> {
        let sleep = tokio::time::sleep(handshake_timeout);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                biased;
                () = &mut sleep, if self.state.auth_phase() != AuthPhase::Authenticated => {
                    return Err(Error::HandshakeTimeout);
                }
                frame = ws.recv() => {
                    let message = frame.ok_or(Error::ConnectionClosed)??;
                    if !self.handle_message(ws, message).await? {
                        return Ok(());
                    }
                }
                Some(outgoing) = self.outbound_rx.recv() => {
                    self.send_application_message(ws, outgoing).await?;
                }
            }
        }
    }

    /// Handles one websocket-level message. Returns `Ok(false)` on a clean
    /// peer-initiated close.
    async fn handle_message(&mut self, ws: &mut WebSocket, message: Message) -> Result<bool, Error> {
        match message {
            Message::Text(text) => {
                let frame = codec::decode_text_frame(&text)?;
                self.handle_frame(ws, frame).await?;
                Ok(true)
            }
            Message::Binary(bytes) => {
                let frame = codec::decode_binary_frame(&bytes)?;
                if !matches!(frame, DecodedFrame::EncryptedEnvelope { .. }) {
                    self.state.note_binary_frame();
                }
                self.handle_frame(ws, frame).await?;
                Ok(true)
            }
            Message::Ping(_) | Message::Pong(_) => Ok(true),
            Message::Close(_) => Ok(false),
        }
    }

    async fn handle_frame(&mut self, ws: &mut WebSocket, frame: DecodedFrame) -> Result<(), Error> {
        match frame {
            DecodedFrame::Json(value) | DecodedFrame::CompressedJson(value) => self.handle_plain_value(ws, value).await,
            DecodedFrame::UploadChunk { header, bytes } => self.handle_binary_upload_chunk(ws, header, bytes).await,
            DecodedFrame::EncryptedEnvelope { nonce, ciphertext } => {
                self.state.note_binary_encrypted();
                self.handle_encrypted(ws, &nonce, &ciphertext, false).await
            }
            DecodedFrame::LegacyEncryptedEnvelope { nonce, ciphertext } => self.handle_encrypted(ws, &nonce, &ciphertext, true).await,
        }
    }

    async fn handle_plain_value(&mut self, ws: &mut WebSocket, value: serde_json::Value) -> Result<(), Error> {
        if self.state.auth_phase() != AuthPhase::Authenticated {
            let handshake: HandshakeMessage = serde_json::from_value(value).map_err(|_| Error::UnexpectedMessage)?;
            return self.handle_handshake(ws, handshake).await;
        }
        if self.state.requires_encrypted_messages() {
            return Err(Error::EncryptedMessageRequired);
        }
        let message: ApplicationMessage = serde_json::from_value(value).map_err(|_| Error::UnexpectedMessage)?;
        self.dispatch_application(ws, message).await
    }

    async fn handle_encrypted(&mut self, ws: &mut WebSocket, nonce: &[u8; 24], ciphertext: &[u8], legacy: bool) -> Result<(), Error> {
        if self.state.auth_phase() != AuthPhase::Authenticated {
            return Err(Error::UnexpectedMessage);
        }
        let key = self.state.session_key().expect("authenticated connections always hold a session key").clone();
        let plaintext = secretbox::open(&key, nonce, ciphertext)?;
        let value = if legacy {
            serde_json::from_slice(&plaintext).map_err(CodecError::from)?
        } else {
            codec::decode_decrypted_payload(&plaintext)?
        };
        let sequenced: SequencedMessage = serde_json::from_value(value).map_err(|_| Error::UnexpectedMessage)?;
        if !self.state.accept_inbound_seq(sequenced.seq) {
            // A replayed or reordered sequence number is treated the same as
            // a failed decryption (§8 S2): the peer cannot tell which check
            // rejected the frame.
            return Err(Error::Decryption(SecretboxError::DecryptionFailed));
        }
        self.dispatch_application(ws, sequenced.msg).await
    }

    async fn handle_binary_upload_chunk(&mut self, ws: &mut WebSocket, header: UploadChunkHeader, bytes: Vec<u8>) -> Result<(), Error> {
        if self.state.auth_phase() != AuthPhase::Authenticated {
            return Err(Error::UnexpectedMessage);
        }
        let outcome = self.uploads.write_chunk(&self.collaborators, header.upload_id, header.offset, bytes);
        self.send_upload_outcome(ws, outcome).await
    }

    async fn dispatch_application(&mut self, ws: &mut WebSocket, message: ApplicationMessage) -> Result<(), Error> {
        match message {
            ApplicationMessage::Request(request) => {
                let response = tunnel::handle_request(&self.collaborators, self.request_timeout, request).await;
                self.send_application_message(ws, ApplicationMessage::Response(response)).await
            }
            ApplicationMessage::Subscribe(subscribe) => self.handle_subscribe(ws, subscribe).await,
            ApplicationMessage::Unsubscribe(Unsubscribe { subscription_id }) => {
                self.subscriptions.unsubscribe(subscription_id);
                Ok(())
            }
            ApplicationMessage::UploadStart(start) => {
                let outcome = self
                    .uploads
                    .start(&self.collaborators, start.upload_id, &start.project_id, &start.session_id, &start.filename, start.size, &start.mime_type)
                    .await;
                self.send_upload_outcome(ws, outcome).await
            }
            ApplicationMessage::UploadChunk(chunk) => {
                let bytes = base64::engine::general_purpose::STANDARD.decode(&chunk.data).map_err(|_| Error::UnexpectedMessage)?;
                let outcome = self.uploads.write_chunk(&self.collaborators, chunk.upload_id, chunk.offset, bytes);
                self.send_upload_outcome(ws, outcome).await
            }
            ApplicationMessage::UploadEnd(UploadEnd { upload_id }) => {
                let outcome = self.uploads.end(&self.collaborators, upload_id).await;
                self.send_upload_outcome(ws, outcome).await
            }
            ApplicationMessage::Ping(Ping { id }) => self.send_application_message(ws, ApplicationMessage::Pong(Pong { id })).await,
            ApplicationMessage::Pong(_) => Ok(()),
            ApplicationMessage::Capabilities(Capabilities { formats }) => {
                self.state.set_supported_formats(parse_supported_formats(&formats));
                Ok(())
            }
            ApplicationMessage::Response(_)
            | ApplicationMessage::Event(_)
            | ApplicationMessage::SubscriptionConnected(_)
            | ApplicationMessage::SubscriptionError(_)
            | ApplicationMessage::SubscriptionClosed(_)
            | ApplicationMessage::SubscriptionHeartbeat(_)
            | ApplicationMessage::UploadProgress(_)
            | ApplicationMessage::UploadComplete(_)
            | ApplicationMessage::UploadError(_) => Err(Error::UnexpectedMessage),
        }
    }

    async fn handle_subscribe(&mut self, ws: &mut WebSocket, subscribe: Subscribe) -> Result<(), Error> {
        let subscription_id = subscribe.subscription_id;
        match self.subscriptions.subscribe(
            &self.collaborators,
            subscription_id,
            subscribe.channel,
            subscribe.params,
            self.outbound_tx.clone(),
            self.heartbeat_interval,
        ) {
            Ok(()) => Ok(()),
            Err(err) => {
                let status = match &err {
                    SubscribeError::DuplicateId => 409,
                    SubscribeError::NoActiveProcess(_) => 404,
                };
                self.send_application_message(
                    ws,
                    ApplicationMessage::SubscriptionError(SubscriptionError { subscription_id, status, message: err.to_string() }),
                )
                .await
            }
        }
    }

    async fn handle_handshake(&mut self, ws: &mut WebSocket, message: HandshakeMessage) -> Result<(), Error> {
        match message {
            HandshakeMessage::Hello(hello) => self.handle_hello(ws, hello).await,
            HandshakeMessage::Proof(proof) => self.handle_proof(ws, proof).await,
            HandshakeMessage::ResumeInit(resume_init) => self.handle_resume_init(ws, resume_init).await,
            HandshakeMessage::Resume(resume) => self.handle_resume(ws, resume).await,
            HandshakeMessage::Challenge(_)
            | HandshakeMessage::Verify(_)
            | HandshakeMessage::ResumeChallenge(_)
            | HandshakeMessage::Resumed(_)
            | HandshakeMessage::Invalid(_)
            | HandshakeMessage::Error(_) => Err(Error::UnexpectedMessage),
        }
    }

    async fn handle_hello(&mut self, ws: &mut WebSocket, hello: Hello) -> Result<(), Error> {
        let now = now_timestamp();
        let identity_bucket: IdentityBucket = self.admission.identity_bucket(&hello.username);
        if self.state.ratelimit_hello(&identity_bucket, &hello.username, now) == HelloRateLimit::Cooldown {
            metrics::counter!(METRICS_ID_CONNECTIONS_REJECTED).increment(1);
            return Err(Error::RateLimited);
        }

        let credentials = self.collaborators.credential_store.get_credentials().filter(|c| c.username == hello.username);
        let Some(credentials) = credentials else {
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "unknown_identity".to_string() })).await;
        };

        let a_pub = hex::decode(&hello.a_pub).map_err(|_| Error::UnexpectedMessage)?;
        let server = SrpServerSession::new(&credentials.verifier);
        let challenge = HandshakeMessage::Challenge(Challenge { salt: hex::encode(&credentials.salt), b_pub: hex::encode(server.b_pub()) });
        self.pending_srp = Some(PendingSrp { username: hello.username, a_pub, verifier: credentials.verifier, server });
        self.state.mark_waiting_proof();
        self.send_handshake(ws, challenge).await
    }

    async fn handle_proof(&mut self, ws: &mut WebSocket, proof: Proof) -> Result<(), Error> {
        let Some(pending) = self.pending_srp.take() else {
            return Err(Error::UnexpectedMessage);
        };
        let m1 = hex::decode(&proof.m1).map_err(|_| Error::UnexpectedMessage)?;

        match pending.server.verify_client(&pending.verifier, &pending.a_pub, &m1) {
            Ok(verified) => {
                let session_key = SessionKey::derive_session_key(verified.shared_secret());
                let session_id = uuid::Uuid::new_v4();
                let now = now_timestamp();
                self.collaborators
                    .stored_session_store
                    .create_session(StoredSession {
                        session_id,
                        username: pending.username,
                        session_key: base64::engine::general_purpose::STANDARD.encode(session_key.as_bytes()),
                        browser_profile_id: None,
                        origin: None,
                        user_agent: None,
                        created_at: now,
                        last_connected_at: now,
                    })
                    .await;
                let verify = HandshakeMessage::Verify(Verify { m2: hex::encode(verified.m2()), session_id });
                self.state.mark_authenticated(session_key);
                metrics::counter!(METRICS_ID_HANDSHAKE_SUCCESS).increment(1);
                self.send_handshake(ws, verify).await
            }
            Err(SrpSessionError::InvalidProof) => {
                let now = now_timestamp();
                self.state.record_failed_proof(now);
                self.state.reset_after_failed_proof();
                metrics::counter!(METRICS_ID_HANDSHAKE_FAILURE).increment(1);
                self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "invalid_proof".to_string() })).await
            }
        }
    }

    async fn handle_resume_init(&mut self, ws: &mut WebSocket, resume_init: ResumeInit) -> Result<(), Error> {
        let session = self.collaborators.stored_session_store.get_session(resume_init.session_id).await;
        let Some(session) = session.filter(|s| s.username == resume_init.username) else {
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "unknown_session".to_string() })).await;
        };

        let now = now_timestamp();
        let nonce = self.state.issue_resume_challenge(session.session_id, resume_init.username, now);
        self.send_handshake(ws, HandshakeMessage::ResumeChallenge(ResumeChallenge { nonce: hex::encode(nonce) })).await
    }

    async fn handle_resume(&mut self, ws: &mut WebSocket, resume: Resume) -> Result<(), Error> {
        let now = now_timestamp();
        let Some(session) = self.collaborators.stored_session_store.get_session(resume.session_id).await else {
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "unknown_session".to_string() })).await;
        };

        // Single-use regardless of outcome (§8 invariant 7): once consumed,
        // a second `resume` against the same challenge always fails below.
        if self.state.consume_resume_challenge(resume.session_id, &session.username, now).is_none() {
            metrics::counter!(METRICS_ID_RESUME_FAILURE).increment(1);
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "resume_challenge_expired".to_string() })).await;
        }

        let proof_nonce = base64::engine::general_purpose::STANDARD
            .decode(&resume.proof_nonce)
            .ok()
            .and_then(|bytes| <[u8; 24]>::try_from(bytes).ok());
        let ciphertext = base64::engine::general_purpose::STANDARD.decode(&resume.proof).ok();
        let Some((proof_nonce, ciphertext)) = proof_nonce.zip(ciphertext) else {
            metrics::counter!(METRICS_ID_RESUME_FAILURE).increment(1);
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "malformed_proof".to_string() })).await;
        };

        if !self.collaborators.stored_session_store.validate_proof(resume.session_id, &proof_nonce, &ciphertext).await {
            metrics::counter!(METRICS_ID_RESUME_FAILURE).increment(1);
            return self.send_handshake(ws, HandshakeMessage::Invalid(Invalid { reason: "invalid_proof".to_string() })).await;
        }

        let key_bytes = base64::engine::general_purpose::STANDARD.decode(&session.session_key).map_err(|_| Error::UnexpectedMessage)?;
        let key_bytes: [u8; 32] = key_bytes.try_into().map_err(|_| Error::UnexpectedMessage)?;
        self.state.mark_authenticated(SessionKey::from_bytes(key_bytes));
        self.collaborators.stored_session_store.update_last_connected(resume.session_id, now).await;
        metrics::counter!(METRICS_ID_RESUME_SUCCESS).increment(1);
        self.send_handshake(ws, HandshakeMessage::Resumed(Resumed { session_id: resume.session_id })).await
    }

    async fn send_handshake(&mut self, ws: &mut WebSocket, message: HandshakeMessage) -> Result<(), Error> {
        let text = serde_json::to_string(&message).expect("handshake messages are always serializable");
        ws.send(Message::Text(text.into())).await.map_err(|err| Error::SendFailure(err.to_string()))
    }

    async fn send_upload_outcome(&mut self, ws: &mut WebSocket, outcome: UploadOutcome) -> Result<(), Error> {
        let message = match outcome {
            UploadOutcome::Progress(progress) => ApplicationMessage::UploadProgress(progress),
            UploadOutcome::Complete(complete) => ApplicationMessage::UploadComplete(complete),
            UploadOutcome::Error(error) => ApplicationMessage::UploadError(error),
            UploadOutcome::None => return Ok(()),
        };
        self.send_application_message(ws, message).await
    }

    async fn send_application_message(&mut self, ws: &mut WebSocket, message: ApplicationMessage) -> Result<(), Error> {
        if self.state.requires_encrypted_messages() {
            let key = self.state.session_key().expect("encryption-requiring connections are only reachable once authenticated").clone();
            let seq = self.state.next_outbound_seq();
            let value = serde_json::to_value(SequencedMessage { seq, msg: message }).expect("always serializable");

            if self.state.binary_mode().use_binary_encrypted {
                let plaintext = codec::encode_inner_json(&value);
                let sealed = secretbox::seal(&key, &plaintext);
                let envelope = codec::encode_encrypted_envelope(&sealed.nonce, &sealed.ciphertext);
                ws.send(Message::Binary(envelope.into())).await.map_err(|err| Error::SendFailure(err.to_string()))
            } else {
                let plaintext = serde_json::to_vec(&value).expect("always serializable");
                let sealed = secretbox::seal(&key, &plaintext);
                let envelope = codec::encode_legacy_encrypted_envelope(&sealed.nonce, &sealed.ciphertext);
                ws.send(Message::Text(envelope.into())).await.map_err(|err| Error::SendFailure(err.to_string()))
            }
        } else {
            let text = serde_json::to_string(&message).expect("always serializable");
            ws.send(Message::Text(text.into())).await.map_err(|err| Error::SendFailure(err.to_string()))
        }
    }

    /// Cleans up every live subscription and in-flight upload — called when
    /// the connection loop exits, whatever the reason.
    pub fn shutdown(&mut self) {
        self.subscriptions.close_all();
        self.uploads.cancel_all(&self.collaborators);
    }
}

fn now_timestamp() -> Timestamp {
    let millis = SystemTime::now().duration_since(UNIX_EPOCH).expect("system clock is after the Unix epoch").as_millis() as u64;
    Timestamp::from_millis(millis)
}

/// Maps the `formats` strings from an opening `capabilities` message onto
/// the [`FrameFormat`] set the connection should expect the peer to produce.
/// Plain JSON is always implicitly supported.
fn parse_supported_formats(formats: &[String]) -> HashSet<FrameFormat> {
    let mut set = HashSet::from([FrameFormat::Json]);
    for format in formats {
        match format.as_str() {
            "compressed-json" => {
                set.insert(FrameFormat::CompressedJson);
            }
            "binary-upload" => {
                set.insert(FrameFormat::BinaryUploadChunk);
            }
            _ => {}
        }
    }
    set
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_capability_names_are_ignored() {
        let formats = parse_supported_formats(&["compressed-json".to_string(), "smell-o-vision".to_string()]);
        assert!(formats.contains(&FrameFormat::Json));
        assert!(formats.contains(&FrameFormat::CompressedJson));
        assert!(!formats.contains(&FrameFormat::BinaryUploadChunk));
    }

    #[test]
    fn no_capabilities_still_supports_json() {
        let formats = parse_supported_formats(&[]);
        assert_eq!(formats, HashSet::from([FrameFormat::Json]));
    }
}
