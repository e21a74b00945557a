use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use crate::logging::Logger;
use crate::wire::message::Message;

/// Anything a MULTICAST_UPDATE frame can be pushed to. The live transport
/// channel implements this; tests substitute their own sinks.
pub trait UpdateSink: Send + Sync {
    fn push_update(&self, message: &Message) -> bool;
}

impl UpdateSink for crate::transport::ServerChannel {
    fn push_update(&self, message: &Message) -> bool {
        self.send_message(message).is_ok()
    }
}

/// Fan-out targets. Entries are weak: a disconnecting worker drops the
/// strong handle, and the next broadcast prunes whatever fails to upgrade
/// or errors on send.
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<HashMap<u64, Weak<dyn UpdateSink>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, id: u64, sink: &Arc<impl UpdateSink + 'static>) {
        let strong: Arc<dyn UpdateSink> = sink.clone();
        let weak = Arc::downgrade(&strong);
        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .insert(id, weak);
    }

    pub fn remove(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .remove(&id);
    }

    pub fn count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .len()
    }

    /// Sends to every live subscriber, each upgraded to a strong reference
    /// for the duration of one send. Returns the number of deliveries.
    pub fn broadcast(&self, message: &Message, logger: &Logger) -> usize {
        let entries: Vec<(u64, Weak<dyn UpdateSink>)> = self
            .subscribers
            .lock()
            .expect("subscriber registry lock poisoned")
            .iter()
            .map(|(id, weak)| (*id, Weak::clone(weak)))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, weak) in entries {
            match weak.upgrade() {
                Some(sink) if sink.push_update(message) => delivered += 1,
                Some(_) => {
                    logger.warn(
                        Some("server::broadcast"),
                        &format!("dropping subscriber {id}: send failed"),
                    );
                    dead.push(id);
                }
                None => dead.push(id),
            }
        }

        if !dead.is_empty() {
            let mut subscribers = self
                .subscribers
                .lock()
                .expect("subscriber registry lock poisoned");
            for id in dead {
                subscribers.remove(&id);
            }
        }

        delivered
    }
}
