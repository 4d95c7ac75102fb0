//! Client-side subscriptions (§4.F).
//!
//! A [`Subscription`] is a typed handle over one subscription's event
//! stream. Opening one blocks until the server acknowledges it with
//! `subscription-connected` or rejects it with `subscription-error`
//! (§7: a rejected subscription never reaches the caller as a handle at
//! all — the rejection is surfaced directly from the `subscribe*` call).

use std::collections::HashMap;
use std::sync::Mutex;

use relay_types::api::message::{ApplicationMessage, Unsubscribe};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::Error;

/// One update delivered on a live subscription.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    /// A payload, with its monotonic per-subscription event id.
    Event {
        /// The event id, usable as a `last_event_id` on a future resubscribe.
        event_id: u64,
        /// The event payload, shaped by whatever produced it.
        payload: serde_json::Value,
    },
    /// A periodic liveness heartbeat; carries no data.
    Heartbeat,
    /// The server closed the subscription. No further events will arrive.
    Closed,
}

/// A live subscription handle (§4.F).
pub struct Subscription {
    subscription_id: Uuid,
    events: mpsc::UnboundedReceiver<SubscriptionEvent>,
    outbound: mpsc::UnboundedSender<ApplicationMessage>,
}

impl Subscription {
    pub(crate) fn new(subscription_id: Uuid, events: mpsc::UnboundedReceiver<SubscriptionEvent>, outbound: mpsc::UnboundedSender<ApplicationMessage>) -> Self {
        Self { subscription_id, events, outbound }
    }

    /// The id this subscription was opened with.
    pub fn id(&self) -> Uuid {
        self.subscription_id
    }

    /// Waits for the next event. Returns `None` once the subscription has
    /// closed and no further events remain buffered.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        self.events.recv().await
    }

    /// Closes the subscription. Best-effort: if the connection is already
    /// gone there is nothing left to tell the server.
    pub fn unsubscribe(&self) {
        let _ = self.outbound.send(ApplicationMessage::Unsubscribe(Unsubscribe { subscription_id: self.subscription_id }));
    }
}

struct PendingSubscribe {
    ack: oneshot::Sender<Result<mpsc::UnboundedReceiver<SubscriptionEvent>, Error>>,
    events_rx: Option<mpsc::UnboundedReceiver<SubscriptionEvent>>,
    events_tx: mpsc::UnboundedSender<SubscriptionEvent>,
}

/// Tracks subscriptions the orchestrator has open, from the client's side.
pub(crate) struct SubscriptionRegistry {
    pending: Mutex<HashMap<Uuid, PendingSubscribe>>,
    live: Mutex<HashMap<Uuid, mpsc::UnboundedSender<SubscriptionEvent>>>,
}

impl SubscriptionRegistry {
    pub(crate) fn new() -> Self {
        Self { pending: Mutex::new(HashMap::new()), live: Mutex::new(HashMap::new()) }
    }

    /// Registers a subscription awaiting acknowledgement and returns the
    /// receiver the caller should await for the ack.
    pub(crate) fn begin(&self, subscription_id: Uuid) -> oneshot::Receiver<Result<mpsc::UnboundedReceiver<SubscriptionEvent>, Error>> {
        let (ack_tx, ack_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.pending
            .lock()
            .unwrap()
            .insert(subscription_id, PendingSubscribe { ack: ack_tx, events_rx: Some(events_rx), events_tx });
        ack_rx
    }

    /// `subscription-connected`: the pending subscribe succeeds.
    pub(crate) fn connected(&self, subscription_id: Uuid) {
        let Some(mut pending) = self.pending.lock().unwrap().remove(&subscription_id) else {
            return;
        };
        self.live.lock().unwrap().insert(subscription_id, pending.events_tx.clone());
        let events_rx = pending.events_rx.take().expect("events_rx is only taken once, here");
        let _ = pending.ack.send(Ok(events_rx));
    }

    /// `subscription-error`: the pending subscribe is rejected.
    pub(crate) fn rejected(&self, subscription_id: Uuid, status: u16, message: String) {
        if let Some(pending) = self.pending.lock().unwrap().remove(&subscription_id) {
            let _ = pending.ack.send(Err(Error::SubscriptionRejected { status, message }));
        }
    }

    pub(crate) fn event(&self, subscription_id: Uuid, event_id: u64, payload: serde_json::Value) {
        if let Some(tx) = self.live.lock().unwrap().get(&subscription_id) {
            let _ = tx.send(SubscriptionEvent::Event { event_id, payload });
        }
    }

    pub(crate) fn heartbeat(&self, subscription_id: Uuid) {
        if let Some(tx) = self.live.lock().unwrap().get(&subscription_id) {
            let _ = tx.send(SubscriptionEvent::Heartbeat);
        }
    }

    pub(crate) fn closed(&self, subscription_id: Uuid) {
        if let Some(tx) = self.live.lock().unwrap().remove(&subscription_id) {
            let _ = tx.send(SubscriptionEvent::Closed);
        }
    }

    /// Drops every pending and live subscription, e.g. on disconnect. Live
    /// handles observe a closed channel (`next()` returns `None`); pending
    /// acks resolve to a transport error.
    pub(crate) fn fail_all(&self) {
        for (_, pending) in self.pending.lock().unwrap().drain() {
            let _ = pending.ack.send(Err(Error::Transport("connection closed before subscription was acknowledged".to_string())));
            drop(pending.events_rx);
        }
        self.live.lock().unwrap().clear();
    }
}
