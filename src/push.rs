//! Live push channel.
//!
//! Subscribers receive messages over unbounded in-process channels. The hub is owned by
//! the ledger and only broadcast to while the ledger lock is held, so every subscriber
//! sees messages in sequence order, and its `initial_data` before any increment.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

use serde::Serialize;

use crate::ledger::{AggregateStats, CrossingEvent};

/// One message on the live push channel.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// Full state, sent once when a subscriber connects.
    InitialData {
        vehicles: Vec<CrossingEvent>,
        stats: AggregateStats,
    },
    /// A new crossing with the stats it produced.
    VehicleCrossed {
        event: CrossingEvent,
        stats: AggregateStats,
    },
    /// A recorded event whose plate was reconciled.
    PlateUpdated { event: CrossingEvent },
    /// The ledger was reset.
    DataCleared,
}

impl PushMessage {
    pub fn name(&self) -> &'static str {
        match self {
            PushMessage::InitialData { .. } => "initial_data",
            PushMessage::VehicleCrossed { .. } => "vehicle_crossed",
            PushMessage::PlateUpdated { .. } => "plate_updated",
            PushMessage::DataCleared => "data_cleared",
        }
    }
}

/// Receiving end of a live push subscription.
pub struct Subscription {
    rx: Receiver<PushMessage>,
}

impl Subscription {
    pub fn recv_timeout(&self, timeout: Duration) -> Result<PushMessage, RecvTimeoutError> {
        self.rx.recv_timeout(timeout)
    }

    /// Drains every message already queued.
    pub fn drain(&self) -> Vec<PushMessage> {
        self.rx.try_iter().collect()
    }
}

#[derive(Debug, Default)]
pub(crate) struct PushHub {
    subscribers: Vec<Sender<PushMessage>>,
}

impl PushHub {
    /// Registers a subscriber whose first message is `initial`.
    pub(crate) fn subscribe(&mut self, initial: PushMessage) -> Subscription {
        let (tx, rx) = mpsc::channel();
        // The receiver is alive here, so the send cannot fail.
        let _ = tx.send(initial);
        self.subscribers.push(tx);
        Subscription { rx }
    }

    /// Sends to every live subscriber and forgets the disconnected ones.
    pub(crate) fn broadcast(&mut self, message: PushMessage) {
        self.subscribers
            .retain(|tx| tx.send(message.clone()).is_ok());
    }

    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_message_comes_first() {
        let mut hub = PushHub::default();
        let sub = hub.subscribe(PushMessage::DataCleared);
        hub.broadcast(PushMessage::DataCleared);
        let names: Vec<&str> = sub.drain().iter().map(PushMessage::name).collect();
        assert_eq!(names, vec!["data_cleared", "data_cleared"]);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let mut hub = PushHub::default();
        let keep = hub.subscribe(PushMessage::DataCleared);
        let gone = hub.subscribe(PushMessage::DataCleared);
        drop(gone);
        hub.broadcast(PushMessage::DataCleared);
        assert_eq!(hub.len(), 1);
        assert_eq!(keep.drain().len(), 2);
    }

    #[test]
    fn messages_serialize_with_type_tag() {
        let json = serde_json::to_value(PushMessage::DataCleared).unwrap();
        assert_eq!(json["type"], "data_cleared");
    }
}
