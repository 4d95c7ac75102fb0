//! Client-side request/response correlation (§4.E).
//!
//! Mirrors the request/response matching the teacher's OPRF sessions did
//! with a `JoinSet`/`mpsc` pair, but over a single long-lived socket instead
//! of one task per request: every `fetch` registers a one-shot waiter keyed
//! by the request id it generates, and [`Tunnel::resolve`] (driven by the
//! orchestrator's read loop) wakes it when the matching [`Response`] frame
//! arrives. A request that outlives [`Tunnel::request_timeout`] is resolved
//! locally with [`crate::Error::RequestTimeout`] — it never blocks anything
//! else on the connection.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use relay_types::api::message::{ApplicationMessage, BinaryBody, Request, Response};
use tokio::sync::{mpsc, oneshot};

use crate::runtime;
use crate::Error;

pub(crate) struct Tunnel {
    outbound: mpsc::UnboundedSender<ApplicationMessage>,
    pending: Mutex<HashMap<uuid::Uuid, oneshot::Sender<Response>>>,
    request_timeout: Duration,
}

impl Tunnel {
    pub(crate) fn new(outbound: mpsc::UnboundedSender<ApplicationMessage>, request_timeout: Duration) -> Self {
        Self { outbound, pending: Mutex::new(HashMap::new()), request_timeout }
    }

    /// Sends a tunneled HTTP-style request and awaits its response, or
    /// [`Error::RequestTimeout`] after [`Self::request_timeout`] elapses.
    pub(crate) async fn request(&self, method: &str, path: &str, headers: HashMap<String, String>, body: Option<serde_json::Value>) -> Result<Response, Error> {
        let id = uuid::Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let request = Request { id, method: method.to_string(), path: path.to_string(), headers, body };
        if self.outbound.send(ApplicationMessage::Request(request)).is_err() {
            self.pending.lock().unwrap().remove(&id);
            return Err(Error::Transport("connection closed before request could be sent".to_string()));
        }

        match runtime::timeout(self.request_timeout, rx).await {
            Some(Ok(response)) => Ok(response),
            Some(Err(_)) => Err(Error::Transport("connection closed while awaiting response".to_string())),
            None => {
                self.pending.lock().unwrap().remove(&id);
                Err(Error::RequestTimeout)
            }
        }
    }

    /// Convenience wrapper around [`Self::request`] for non-JSON bodies: the
    /// request body is base64-wrapped in a [`BinaryBody`], and the response
    /// body, if it is a [`BinaryBody`], is decoded back to raw bytes.
    pub(crate) async fn request_blob(&self, method: &str, path: &str, headers: HashMap<String, String>, body: Option<&[u8]>) -> Result<(Response, Option<Vec<u8>>), Error> {
        let json_body = body.map(|bytes| serde_json::to_value(BinaryBody::new(bytes)).expect("BinaryBody always serializes"));
        let response = self.request(method, path, headers, json_body).await?;
        let decoded = match &response.body {
            Some(value) => serde_json::from_value::<BinaryBody>(value.clone()).ok().and_then(|binary| {
                use base64::Engine as _;
                base64::engine::general_purpose::STANDARD.decode(binary.data).ok()
            }),
            None => None,
        };
        Ok((response, decoded))
    }

    /// Delivers an inbound [`Response`] to whichever [`Self::request`] call
    /// is waiting for it, if any (a response for an id nobody is waiting on
    /// — e.g. its request already timed out — is simply dropped).
    pub(crate) fn resolve(&self, response: Response) {
        if let Some(tx) = self.pending.lock().unwrap().remove(&response.id) {
            let _ = tx.send(response);
        }
    }

    /// Drops every pending waiter, e.g. because the transport disconnected;
    /// their `rx.await` resolves to the "connection closed" error above.
    pub(crate) fn fail_all(&self) {
        self.pending.lock().unwrap().clear();
    }
}
