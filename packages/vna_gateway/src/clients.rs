//! Set of live WebSocket clients.
//!
//! Each client is represented by the sending half of its outbound queue; the
//! connection's writer task drains the queue into the socket. A client is in
//! the set only while its queue is open.

use axum::extract::ws::Message;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};
use uuid::Uuid;

pub type ClientId = Uuid;

/// Outcome of one broadcast sweep
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    /// Clients whose queue was full; they stay connected and miss this sample
    pub dropped: usize,
    /// Clients removed because their queue was closed
    pub pruned: Vec<ClientId>,
}

#[derive(Default)]
pub struct ClientSet {
    clients: Mutex<HashMap<ClientId, mpsc::Sender<Message>>>,
}

impl ClientSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, mpsc::Sender<Message>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add a client's outbound queue and return its id
    pub fn insert(&self, sender: mpsc::Sender<Message>) -> ClientId {
        let id = Uuid::new_v4();
        let mut clients = self.clients();
        clients.insert(id, sender);
        info!(client = %id, "Client added. Total: {}", clients.len());
        id
    }

    /// Remove a client. Removing an absent client is a no-op.
    pub fn remove(&self, id: ClientId) -> bool {
        let mut clients = self.clients();
        let removed = clients.remove(&id).is_some();
        if removed {
            info!(client = %id, "Client removed. Remaining: {}", clients.len());
        }
        removed
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.clients().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.clients().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients().is_empty()
    }

    /// Offer `message` to every client without waiting on any of them.
    ///
    /// Iterates over a snapshot; clients whose queue is closed are removed
    /// after the sweep.
    pub fn broadcast(&self, message: Message) -> BroadcastReport {
        let targets: Vec<(ClientId, mpsc::Sender<Message>)> = self
            .clients()
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut report = BroadcastReport::default();
        for (id, tx) in &targets {
            match tx.try_send(message.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(client = %id, "Client queue full, dropping sample");
                    report.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => report.pruned.push(*id),
            }
        }

        for id in &report.pruned {
            self.remove(*id);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(msg: &Message) -> &str {
        match msg {
            Message::Text(t) => t.as_str(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    #[test]
    fn remove_twice_is_a_noop() {
        let set = ClientSet::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = set.insert(tx);

        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(set.is_empty());
    }

    #[test]
    fn broadcast_reaches_every_client() {
        let set = ClientSet::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        set.insert(tx_a);
        set.insert(tx_b);

        let report = set.broadcast(Message::Text("hello".into()));
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());

        assert_eq!(text(&rx_a.try_recv().unwrap()), "hello");
        assert_eq!(text(&rx_b.try_recv().unwrap()), "hello");
    }

    #[test]
    fn closed_client_is_pruned_and_others_keep_receiving() {
        let set = ClientSet::new();
        let (tx_a, rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        let (tx_c, mut rx_c) = mpsc::channel(4);
        let a = set.insert(tx_a);
        let b = set.insert(tx_b);
        let c = set.insert(tx_c);

        drop(rx_a);
        let report = set.broadcast(Message::Text("1".into()));
        assert_eq!(report.pruned, vec![a]);
        assert_eq!(report.delivered, 2);
        assert!(!set.contains(a));
        assert!(set.contains(b) && set.contains(c));

        let report = set.broadcast(Message::Text("2".into()));
        assert_eq!(report.delivered, 2);
        assert!(report.pruned.is_empty());

        for rx in [&mut rx_b, &mut rx_c] {
            assert_eq!(text(&rx.try_recv().unwrap()), "1");
            assert_eq!(text(&rx.try_recv().unwrap()), "2");
        }
    }

    #[test]
    fn full_queue_drops_sample_but_keeps_client() {
        let set = ClientSet::new();
        let (tx, mut rx) = mpsc::channel(1);
        let id = set.insert(tx);

        assert_eq!(set.broadcast(Message::Text("first".into())).delivered, 1);
        let report = set.broadcast(Message::Text("second".into()));
        assert_eq!(report.dropped, 1);
        assert!(set.contains(id));

        assert_eq!(text(&rx.try_recv().unwrap()), "first");
        assert!(rx.try_recv().is_err());
    }
}
