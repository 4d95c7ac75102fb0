//! Request/response tunnel (§4.E): runs a tunneled `request` message against
//! the in-process [`HttpApplication`](crate::collaborators::HttpApplication)
//! collaborator and turns a timeout into a synthetic error response rather
//! than dropping the request on the floor.

use std::{collections::HashMap, sync::Arc, time::Duration};

use relay_types::api::message::{Request, Response};

use crate::collaborators::Collaborators;
use crate::metrics::{METRICS_ID_TUNNEL_REQUESTS_IN_FLIGHT, METRICS_ID_TUNNEL_REQUESTS_TIMEOUT, METRICS_ID_TUNNEL_REQUEST_DURATION};

/// Runs `request` against the tunneled application, bounded by
/// `request_timeout`. A timeout yields a synthetic `504` response rather than
/// an error, since the request id still needs a matching response (§8:
/// "exactly one of response / timeout / connection-closed-error per request
/// id").
pub async fn handle_request(collaborators: &Arc<Collaborators>, request_timeout: Duration, request: Request) -> Response {
    let id = request.id;
    let started = tokio::time::Instant::now();
    metrics::gauge!(METRICS_ID_TUNNEL_REQUESTS_IN_FLIGHT).increment(1);

    let outcome = tokio::time::timeout(request_timeout, collaborators.http_application.handle(request)).await;

    metrics::gauge!(METRICS_ID_TUNNEL_REQUESTS_IN_FLIGHT).decrement(1);
    metrics::histogram!(METRICS_ID_TUNNEL_REQUEST_DURATION).record(started.elapsed().as_millis() as f64);

    match outcome {
        Ok(response) => response,
        Err(_) => {
            metrics::counter!(METRICS_ID_TUNNEL_REQUESTS_TIMEOUT).increment(1);
            Response {
                id,
                status: 504,
                headers: HashMap::new(),
                body: Some(serde_json::json!({"error": "request timed out"})),
                setup_required: false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct SlowApplication;
    #[async_trait]
    impl crate::collaborators::HttpApplication for SlowApplication {
        async fn handle(&self, request: Request) -> Response {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Response { id: request.id, status: 200, headers: HashMap::new(), body: None, setup_required: false }
        }
    }

    struct EchoApplication;
    #[async_trait]
    impl crate::collaborators::HttpApplication for EchoApplication {
        async fn handle(&self, request: Request) -> Response {
            Response { id: request.id, status: 200, headers: HashMap::new(), body: request.body, setup_required: false }
        }
    }

    fn collaborators_with(app: impl crate::collaborators::HttpApplication + 'static) -> Arc<Collaborators> {
        use crate::collaborators::*;
        use relay_types::model::{StoredSession, Timestamp};
        use tokio::sync::mpsc;

        struct Unused;
        impl ActivityBus for Unused {
            fn subscribe(&self) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
                mpsc::unbounded_channel()
            }
        }
        impl SessionSupervisor for Unused {
            fn process_for_session(&self, _session_id: &str) -> Option<Arc<dyn SessionProcess>> {
                None
            }
        }
        impl SessionWatch for Unused {
            fn subscribe(&self, _params: SessionWatchParams) -> (mpsc::UnboundedReceiver<EventPayload>, CleanupGuard) {
                mpsc::unbounded_channel()
            }
        }
        #[async_trait]
        impl UploadStaging for Unused {
            async fn start_upload(&self, _: uuid::Uuid, _: &str, _: &str, _: &str, _: u64, _: &str) -> Result<(), UploadStagingError> {
                Ok(())
            }
            async fn write_chunk(&self, _: uuid::Uuid, _: u64, _: &[u8]) -> Result<(), UploadStagingError> {
                Ok(())
            }
            async fn complete_upload(&self, _: uuid::Uuid) -> Result<EventPayload, UploadStagingError> {
                Ok(serde_json::json!({}))
            }
            async fn cancel_upload(&self, _: uuid::Uuid) {}
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
            async fn create_session(&self, _: StoredSession) {}
            async fn get_session(&self, _: uuid::Uuid) -> Option<StoredSession> {
                None
            }
            async fn validate_proof(&self, _: uuid::Uuid, _: &[u8; 24], _: &[u8]) -> bool {
                false
            }
            async fn update_last_connected(&self, _: uuid::Uuid, _: Timestamp) {}
        }

        Arc::new(Collaborators {
            http_application: Arc::new(app),
            session_supervisor: Arc::new(Unused),
            activity_bus: Arc::new(Unused),
            session_watch: Arc::new(Unused),
            upload_staging: Arc::new(Unused),
            credential_store: Arc::new(Unused),
            stored_session_store: Arc::new(Unused),
        })
    }

    #[tokio::test]
    async fn request_within_timeout_passes_through() {
        let collaborators = collaborators_with(EchoApplication);
        let request = Request { id: uuid::Uuid::new_v4(), method: "GET".into(), path: "/x".into(), headers: HashMap::new(), body: Some(serde_json::json!("hi")) };
        let response = handle_request(&collaborators, Duration::from_secs(5), request.clone()).await;
        assert_eq!(response.id, request.id);
        assert_eq!(response.status, 200);
        assert_eq!(response.body, request.body);
    }

    #[tokio::test]
    async fn request_exceeding_timeout_yields_504() {
        let collaborators = collaborators_with(SlowApplication);
        let request = Request { id: uuid::Uuid::new_v4(), method: "GET".into(), path: "/x".into(), headers: HashMap::new(), body: None };
        let id = request.id;
        let response = handle_request(&collaborators, Duration::from_millis(10), request).await;
        assert_eq!(response.id, id);
        assert_eq!(response.status, 504);
    }
}
