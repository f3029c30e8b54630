use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, Weak},
};

use tokio::sync::mpsc;

use crate::Origin;

/// A message delivered to a window, tagged with the sender's origin
///
/// The origin is stamped by the messaging layer, not by the sender, so it can
/// be trusted when deciding whether to act on the message.
#[derive(Clone, Debug)]
pub struct MessageEvent {
    /// The origin of the browsing context that sent the message
    pub origin: Origin,
    /// The message payload
    pub data: serde_json::Value,
}

#[derive(Default)]
struct Listeners {
    next_id: u64,
    senders: HashMap<u64, mpsc::UnboundedSender<MessageEvent>>,
}

type SharedListeners = Arc<Mutex<Listeners>>;

fn lock(listeners: &Mutex<Listeners>) -> std::sync::MutexGuard<'_, Listeners> {
    listeners
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The message event target of a window
///
/// Clones refer to the same window.
#[derive(Clone, Default)]
pub struct MessageBus {
    listeners: SharedListeners,
}

impl MessageBus {
    /// Constructs a new message bus with no listeners
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener
    ///
    /// The listener receives every message posted after this call and is
    /// deregistered when dropped.
    pub fn listen(&self) -> MessageListener {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut listeners = lock(&self.listeners);
            let id = listeners.next_id;
            listeners.next_id += 1;
            listeners.senders.insert(id, tx);
            id
        };

        tracing::trace!(listener = id, "registered message listener");

        MessageListener {
            id,
            rx,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Delivers a message to every registered listener
    ///
    /// Returns the number of listeners the message was delivered to.
    pub fn post(&self, event: MessageEvent) -> usize {
        let mut listeners = lock(&self.listeners);
        listeners
            .senders
            .retain(|_, tx| tx.send(event.clone()).is_ok());
        listeners.senders.len()
    }

    /// The number of currently registered listeners
    pub fn listener_count(&self) -> usize {
        lock(&self.listeners).senders.len()
    }
}

impl fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("MessageBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

/// A registered message listener
#[derive(Debug)]
pub struct MessageListener {
    id: u64,
    rx: mpsc::UnboundedReceiver<MessageEvent>,
    listeners: Weak<Mutex<Listeners>>,
}

impl MessageListener {
    /// Waits for the next message
    ///
    /// Returns `None` once the window's message bus has been torn down.
    pub async fn recv(&mut self) -> Option<MessageEvent> {
        self.rx.recv().await
    }

    /// Takes a message that has already been delivered, without waiting
    pub fn try_recv(&mut self) -> Option<MessageEvent> {
        self.rx.try_recv().ok()
    }
}

impl Drop for MessageListener {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            lock(&listeners).senders.remove(&self.id);
            tracing::trace!(listener = self.id, "deregistered message listener");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(data: serde_json::Value) -> MessageEvent {
        MessageEvent {
            origin: Origin::from_static("https://app.example.com"),
            data,
        }
    }

    #[tokio::test]
    async fn every_listener_receives_posted_messages() {
        let bus = MessageBus::new();
        let mut first = bus.listen();
        let mut second = bus.listen();

        assert_eq!(bus.post(event(serde_json::json!(1))), 2);

        assert_eq!(first.recv().await.unwrap().data, serde_json::json!(1));
        assert_eq!(second.recv().await.unwrap().data, serde_json::json!(1));
    }

    #[test]
    fn dropping_a_listener_deregisters_it() {
        let bus = MessageBus::new();
        let listener = bus.listen();
        assert_eq!(bus.listener_count(), 1);

        drop(listener);

        assert_eq!(bus.listener_count(), 0);
        assert_eq!(bus.post(event(serde_json::json!(null))), 0);
    }
}
