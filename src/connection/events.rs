//! Lifecycle event bus
//!
//! Three channels, fixed at compile time: `authenticate`, `connect`, and
//! `disconnect`. Subscribers fire synchronously in registration order; a
//! failing subscriber is logged and never prevents its successors.

use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use super::record::ConnectionRecord;
use super::sender::OutboundHandle;

/// The lifecycle channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventChannel {
    Authenticate,
    Connect,
    Disconnect,
}

/// Error surfaced by a lifecycle subscriber.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SubscriberError(pub String);

/// A lifecycle subscriber. `authenticate` and `connect` receive the socket
/// handle; `disconnect` fires after the socket is gone. Mutations of the
/// record apply to the in-process copy only.
pub type Subscriber = Arc<
    dyn Fn(&mut ConnectionRecord, Option<&OutboundHandle>) -> Result<(), SubscriberError>
        + Send
        + Sync,
>;

#[derive(Default)]
pub struct EventBus {
    authenticate: RwLock<Vec<Subscriber>>,
    connect: RwLock<Vec<Subscriber>>,
    disconnect: RwLock<Vec<Subscriber>>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("authenticate", &self.authenticate.read().len())
            .field("connect", &self.connect.read().len())
            .field("disconnect", &self.disconnect.read().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, channel: EventChannel) -> &RwLock<Vec<Subscriber>> {
        match channel {
            EventChannel::Authenticate => &self.authenticate,
            EventChannel::Connect => &self.connect,
            EventChannel::Disconnect => &self.disconnect,
        }
    }

    /// Append a subscriber to a channel.
    pub fn on(&self, channel: EventChannel, subscriber: Subscriber) {
        self.slot(channel).write().push(subscriber);
    }

    /// Remove the first subscriber equal (by reference) to the given one.
    pub fn off(&self, channel: EventChannel, subscriber: &Subscriber) {
        let mut subscribers = self.slot(channel).write();
        if let Some(index) = subscribers
            .iter()
            .position(|s| Arc::ptr_eq(s, subscriber))
        {
            subscribers.remove(index);
        }
    }

    /// Invoke a channel's subscribers in registration order.
    pub fn emit(
        &self,
        channel: EventChannel,
        record: &mut ConnectionRecord,
        socket: Option<&OutboundHandle>,
    ) {
        let subscribers = self.slot(channel).read().clone();
        for subscriber in subscribers {
            if let Err(err) = subscriber(record, socket) {
                warn!(
                    channel = ?channel,
                    conn_id = %record.id,
                    error = %err,
                    "lifecycle subscriber failed"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use parking_lot::Mutex;
    use uuid::Uuid;

    fn record() -> ConnectionRecord {
        ConnectionRecord::issued(
            Uuid::new_v4(),
            "cliX",
            "tok-1",
            "ws://localhost/api/connection/connect",
            None,
            Utc::now(),
        )
    }

    fn recording(order: Arc<Mutex<Vec<&'static str>>>, label: &'static str) -> Subscriber {
        Arc::new(move |_, _| {
            order.lock().push(label);
            Ok(())
        })
    }

    #[test]
    fn test_subscribers_fire_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.on(EventChannel::Connect, recording(order.clone(), "first"));
        bus.on(EventChannel::Connect, recording(order.clone(), "second"));
        bus.on(EventChannel::Connect, recording(order.clone(), "third"));

        bus.emit(EventChannel::Connect, &mut record(), None);
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_failing_subscriber_does_not_stop_successors() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        bus.on(
            EventChannel::Disconnect,
            Arc::new(|_, _| Err(SubscriberError("boom".to_string()))),
        );
        bus.on(EventChannel::Disconnect, recording(order.clone(), "after"));

        bus.emit(EventChannel::Disconnect, &mut record(), None);
        assert_eq!(*order.lock(), vec!["after"]);
    }

    #[test]
    fn test_off_removes_first_equal_reference() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let subscriber = recording(order.clone(), "kept-out");
        bus.on(EventChannel::Authenticate, subscriber.clone());
        bus.on(EventChannel::Authenticate, recording(order.clone(), "kept"));

        bus.off(EventChannel::Authenticate, &subscriber);
        bus.emit(EventChannel::Authenticate, &mut record(), None);
        assert_eq!(*order.lock(), vec!["kept"]);
    }

    #[test]
    fn test_subscriber_mutations_are_visible_to_successors() {
        let bus = EventBus::new();
        bus.on(
            EventChannel::Authenticate,
            Arc::new(|record, _| {
                record.client_address = Some("10.0.0.1".to_string());
                Ok(())
            }),
        );
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        bus.on(
            EventChannel::Authenticate,
            Arc::new(move |record, _| {
                *seen_clone.lock() = record.client_address.clone();
                Ok(())
            }),
        );

        let mut rec = record();
        bus.emit(EventChannel::Authenticate, &mut rec, None);
        assert_eq!(seen.lock().as_deref(), Some("10.0.0.1"));
    }
}
