//! Subscription multiplexer (§4.F): session, activity, and session-watch
//! channels, each delivering server-produced events as `event` frames with
//! a monotonic per-subscription event id, plus periodic heartbeats.

use std::{collections::HashMap, sync::Arc, time::Duration};

use relay_types::api::message::{
    ApplicationMessage, Event, SubscriptionChannel, SubscriptionClosed, SubscriptionConnected, SubscriptionHeartbeat,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::collaborators::{Collaborators, SessionWatchParams};
use crate::metrics::{METRICS_ID_SUBSCRIPTIONS_EVENTS_SENT, METRICS_ID_SUBSCRIPTIONS_OPEN};

/// Outbound sink a subscription's background task delivers frames into —
/// the connection's single writer task.
pub type OutboundSink = mpsc::UnboundedSender<ApplicationMessage>;

/// Errors starting a new subscription.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// The subscription id is already in use on this connection.
    #[error("subscription id already in use")]
    DuplicateId,
    /// A `session` subscription named a session with no live process.
    #[error("no active process owns session {0}")]
    NoActiveProcess(String),
}

/// One connection's live subscriptions: id → cancellation handle for its
/// forwarding task.
#[derive(Default)]
pub struct SubscriptionTable {
    entries: HashMap<uuid::Uuid, CancellationToken>,
}

impl SubscriptionTable {
    /// Builds an empty subscription table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new subscription, spawning a task that forwards producer
    /// events (plus periodic heartbeats) into `outbound` until cancelled,
    /// unsubscribed, or the producer's channel closes.
    pub fn subscribe(
        &mut self,
        collaborators: &Arc<Collaborators>,
        subscription_id: uuid::Uuid,
        channel: SubscriptionChannel,
        params: HashMap<String, serde_json::Value>,
        outbound: OutboundSink,
        heartbeat_interval: Duration,
    ) -> Result<(), SubscribeError> {
        if self.entries.contains_key(&subscription_id) {
            return Err(SubscribeError::DuplicateId);
        }

        let (receiver, guard) = match channel {
            SubscriptionChannel::Session => {
                let session_id = params.get("sessionId").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                let process = collaborators
                    .session_supervisor
                    .process_for_session(&session_id)
                    .ok_or_else(|| SubscribeError::NoActiveProcess(session_id.clone()))?;
                process.subscribe()
            }
            SubscriptionChannel::Activity => collaborators.activity_bus.subscribe(),
            SubscriptionChannel::SessionWatch => {
                let params = SessionWatchParams {
                    session_id: params.get("sessionId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    project_id: params.get("projectId").and_then(|v| v.as_str()).unwrap_or_default().to_string(),
                    provider_hint: params.get("providerHint").and_then(|v| v.as_str()).map(str::to_string),
                };
                collaborators.session_watch.subscribe(params)
            }
        };

        let cancel = CancellationToken::new();
        self.entries.insert(subscription_id, cancel.clone());
        metrics::gauge!(METRICS_ID_SUBSCRIPTIONS_OPEN).increment(1);
        spawn_forwarder(subscription_id, receiver, guard, outbound, heartbeat_interval, cancel);
        Ok(())
    }

    /// Stops a subscription and runs its cleanup, if present. A no-op if the
    /// id is not live.
    pub fn unsubscribe(&mut self, subscription_id: uuid::Uuid) {
        if let Some(cancel) = self.entries.remove(&subscription_id) {
            cancel.cancel();
        }
    }

    /// Stops every live subscription — called on connection close.
    pub fn close_all(&mut self) {
        for (_, cancel) in self.entries.drain() {
            cancel.cancel();
        }
    }

    /// Number of currently live subscriptions on this connection.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether this connection has no live subscriptions.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn spawn_forwarder(
    subscription_id: uuid::Uuid,
    mut receiver: mpsc::UnboundedReceiver<crate::collaborators::EventPayload>,
    guard: crate::collaborators::CleanupGuard,
    outbound: OutboundSink,
    heartbeat_interval: Duration,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        // Held for the task's lifetime; its Drop impl runs the
        // collaborator's unsubscribe closure exactly once, whichever way
        // this loop exits.
        let _guard = guard;
        let mut event_id: u64 = 0;
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.reset();

        if outbound
            .send(ApplicationMessage::SubscriptionConnected(SubscriptionConnected { subscription_id }))
            .is_err()
        {
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = heartbeat.tick() => {
                    if outbound
                        .send(ApplicationMessage::SubscriptionHeartbeat(SubscriptionHeartbeat { subscription_id }))
                        .is_err()
                    {
                        break;
                    }
                }
                event = receiver.recv() => {
                    match event {
                        Some(payload) => {
                            event_id += 1;
                            let event = Event { subscription_id, event_id, payload };
                            if outbound.send(ApplicationMessage::Event(event)).is_err() {
                                break;
                            }
                            metrics::counter!(METRICS_ID_SUBSCRIPTIONS_EVENTS_SENT).increment(1);
                        }
                        None => {
                            let _ = outbound.send(ApplicationMessage::SubscriptionClosed(SubscriptionClosed { subscription_id }));
                            break;
                        }
                    }
                }
            }
        }
        metrics::gauge!(METRICS_ID_SUBSCRIPTIONS_OPEN).decrement(1);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{ActivityBus, CleanupGuard, Credentials, CredentialStore, EventPayload, HttpApplication, SessionProcess, SessionSupervisor, SessionWatch, StoredSessionStore};
    use relay_types::api::message::{Request, Response};
    use relay_types::model::{StoredSession, Timestamp};
    use async_trait::async_trait;

    struct StubActivityBus;
    impl ActivityBus for StubActivityBus {
        fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
            let (tx, rx) = mpsc::unbounded_channel();
            tx.send(serde_json::json!({"kind": "session-created"})).unwrap();
            (rx, CleanupGuard::new(|| {}))
        }
    }

    struct StubSupervisor;
    impl SessionSupervisor for StubSupervisor {
        fn process_for_session(&self, _session_id: &str) -> Option<Arc<dyn SessionProcess>> {
            None
        }
    }

    struct StubSessionWatch;
    impl SessionWatch for StubSessionWatch {
        fn subscribe(&self, _params: SessionWatchParams) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
            let (_tx, rx) = mpsc::unbounded_channel();
            (rx, CleanupGuard::new(|| {}))
        }
    }

    struct StubHttpApplication;
    #[async_trait]
    impl HttpApplication for StubHttpApplication {
        async fn handle(&self, request: Request) -> Response {
            Response { id: request.id, status: 200, headers: Default::default(), body: None, setup_required: false }
        }
    }

    struct StubUploadStaging;
    #[async_trait]
    impl crate::collaborators::UploadStaging for StubUploadStaging {
        async fn start_upload(&self, _upload_id: uuid::Uuid, _project_id: &str, _session_id: &str, _filename: &str, _size: u64, _mime_type: &str) -> Result<(), crate::collaborators::UploadStagingError> {
            Ok(())
        }
        async fn write_chunk(&self, _upload_id: uuid::Uuid, _offset: u64, _data: &[u8]) -> Result<(), crate::collaborators::UploadStagingError> {
            Ok(())
        }
        async fn complete_upload(&self, _upload_id: uuid::Uuid) -> Result<EventPayload, crate::collaborators::UploadStagingError> {
            Ok(serde_json::json!({}))
        }
        async fn cancel_upload(&self, _upload_id: uuid::Uuid) {}
    }

    struct StubCredentialStore;
    impl CredentialStore for StubCredentialStore {
        fn get_credentials(&self) -> Option<Credentials> {
            None
        }
        fn get_username(&self) -> Option<String> {
            None
        }
    }

    struct StubStoredSessionStore;
    #[async_trait]
    impl StoredSessionStore for StubStoredSessionStore {
        async fn create_session(&self, _session: StoredSession) {}
        async fn get_session(&self, _session_id: uuid::Uuid) -> Option<StoredSession> {
            None
        }
        async fn validate_proof(&self, _session_id: uuid::Uuid, _nonce: &[u8; 24], _ciphertext: &[u8]) -> bool {
            false
        }
        async fn update_last_connected(&self, _session_id: uuid::Uuid, _now: Timestamp) {}
    }

    fn stub_collaborators() -> Arc<Collaborators> {
        Arc::new(Collaborators {
            http_application: Arc::new(StubHttpApplication),
            session_supervisor: Arc::new(StubSupervisor),
            activity_bus: Arc::new(StubActivityBus),
            session_watch: Arc::new(StubSessionWatch),
            upload_staging: Arc::new(StubUploadStaging),
            credential_store: Arc::new(StubCredentialStore),
            stored_session_store: Arc::new(StubStoredSessionStore),
        })
    }

    #[tokio::test]
    async fn activity_subscription_delivers_connected_then_event() {
        let collaborators = stub_collaborators();
        let mut table = SubscriptionTable::new();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();

        table
            .subscribe(&collaborators, id, SubscriptionChannel::Activity, HashMap::new(), outbound_tx, Duration::from_secs(30))
            .unwrap();

        let first = outbound_rx.recv().await.unwrap();
        assert!(matches!(first, ApplicationMessage::SubscriptionConnected(_)));
        let second = outbound_rx.recv().await.unwrap();
        assert!(matches!(second, ApplicationMessage::Event(_)));
    }

    #[tokio::test]
    async fn duplicate_subscription_id_is_rejected() {
        let collaborators = stub_collaborators();
        let mut table = SubscriptionTable::new();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();

        table
            .subscribe(&collaborators, id, SubscriptionChannel::Activity, HashMap::new(), outbound_tx.clone(), Duration::from_secs(30))
            .unwrap();
        let err = table
            .subscribe(&collaborators, id, SubscriptionChannel::Activity, HashMap::new(), outbound_tx, Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, SubscribeError::DuplicateId));
    }

    #[tokio::test]
    async fn session_subscription_without_live_process_is_rejected() {
        let collaborators = stub_collaborators();
        let mut table = SubscriptionTable::new();
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();
        let id = uuid::Uuid::new_v4();
        let mut params = HashMap::new();
        params.insert("sessionId".to_string(), serde_json::json!("abc"));

        let err = table
            .subscribe(&collaborators, id, SubscriptionChannel::Session, params, outbound_tx, Duration::from_secs(30))
            .unwrap_err();
        assert!(matches!(err, SubscribeError::NoActiveProcess(_)));
    }
}
