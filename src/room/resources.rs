#![forbid(unsafe_code)]

// Process-local handle tables for transports, producers, and consumers.
//
// Entries are evicted when the engine reports the handle closed. Locks are
// never held while closing a handle, since close notifications fire
// synchronously and re-enter the tables.

use crate::media::engine::{MediaConsumer, MediaProducer, MediaRouter, MediaTransport};
use crate::media::types::{MediaRole, TransportDirection};
use std::collections::HashMap;
use std::sync::RwLock as StdRwLock;
use std::sync::{Arc, Weak};
use tracing::debug;

/// Which participant, in which channel and on which connection, created a handle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub user_id: String,
    pub channel_id: String,
    pub connection_id: String,
}

#[derive(Clone)]
pub struct TransportEntry {
    pub transport: Arc<dyn MediaTransport>,
    pub router: Arc<dyn MediaRouter>,
    pub direction: TransportDirection,
    pub owner: Owner,
}

#[derive(Clone)]
pub struct ProducerEntry {
    pub producer: Arc<dyn MediaProducer>,
    pub role: MediaRole,
    pub owner: Owner,
}

#[derive(Clone)]
pub struct ConsumerEntry {
    pub consumer: Arc<dyn MediaConsumer>,
    pub owner: Owner,
}

/// Handles removed from the tables, ready to be closed
#[derive(Default)]
pub struct Released {
    pub consumers: Vec<ConsumerEntry>,
    pub producers: Vec<ProducerEntry>,
    pub transports: Vec<TransportEntry>,
}

impl Released {
    /// Closes consumers first, then producers, then transports. Returns the
    /// ids of the closed producers.
    pub fn close(self) -> Vec<String> {
        for entry in self.consumers {
            entry.consumer.close();
        }
        let producer_ids = self
            .producers
            .into_iter()
            .map(|entry| {
                entry.producer.close();
                entry.producer.id()
            })
            .collect();
        for entry in self.transports {
            entry.transport.close();
        }
        producer_ids
    }
}

fn drain_where<T: Clone>(table: &StdRwLock<HashMap<String, T>>, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
    let mut table = table.write().unwrap_or_else(|e| e.into_inner());
    let ids: Vec<String> = table
        .iter()
        .filter(|(_, entry)| pred(entry))
        .map(|(id, _)| id.clone())
        .collect();
    ids.iter().filter_map(|id| table.remove(id)).collect()
}

#[derive(Default)]
pub struct ResourceTables {
    transports: StdRwLock<HashMap<String, TransportEntry>>,
    producers: StdRwLock<HashMap<String, ProducerEntry>>,
    consumers: StdRwLock<HashMap<String, ConsumerEntry>>,
}

impl ResourceTables {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_transport(self: &Arc<Self>, entry: TransportEntry) {
        let id = entry.transport.id();
        let transport = entry.transport.clone();
        self.transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);

        let tables: Weak<Self> = Arc::downgrade(self);
        transport.on_close(Box::new(move || {
            if let Some(tables) = tables.upgrade() {
                if tables
                    .transports
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                    .is_some()
                {
                    debug!("Transport {} closed, evicted", id);
                }
            }
        }));
    }

    pub fn add_producer(self: &Arc<Self>, entry: ProducerEntry) {
        let id = entry.producer.id();
        let producer = entry.producer.clone();
        self.producers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);

        let tables: Weak<Self> = Arc::downgrade(self);
        producer.on_close(Box::new(move || {
            if let Some(tables) = tables.upgrade() {
                if tables
                    .producers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                    .is_some()
                {
                    debug!("Producer {} closed, evicted", id);
                }
            }
        }));
    }

    pub fn add_consumer(self: &Arc<Self>, entry: ConsumerEntry) {
        let id = entry.consumer.id();
        let consumer = entry.consumer.clone();
        self.consumers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), entry);

        let tables: Weak<Self> = Arc::downgrade(self);
        consumer.on_close(Box::new(move || {
            if let Some(tables) = tables.upgrade() {
                if tables
                    .consumers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&id)
                    .is_some()
                {
                    debug!("Consumer {} closed, evicted", id);
                }
            }
        }));
    }

    pub fn transport(&self, id: &str) -> Option<TransportEntry> {
        self.transports.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn producer(&self, id: &str) -> Option<ProducerEntry> {
        self.producers.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    pub fn consumer(&self, id: &str) -> Option<ConsumerEntry> {
        self.consumers.read().unwrap_or_else(|e| e.into_inner()).get(id).cloned()
    }

    /// Removes every handle matching `pred` from the tables without closing it
    pub fn release(&self, pred: impl Fn(&Owner) -> bool) -> Released {
        Released {
            consumers: drain_where(&self.consumers, |e| pred(&e.owner)),
            producers: drain_where(&self.producers, |e| pred(&e.owner)),
            transports: drain_where(&self.transports, |e| pred(&e.owner)),
        }
    }

    pub fn release_all(&self) -> Released {
        self.release(|_| true)
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.transports.read().unwrap_or_else(|e| e.into_inner()).len(),
            self.producers.read().unwrap_or_else(|e| e.into_inner()).len(),
            self.consumers.read().unwrap_or_else(|e| e.into_inner()).len(),
        )
    }

    /// Whether any handle created in the channel is still registered
    pub fn channel_in_use(&self, channel_id: &str) -> bool {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|e| e.owner.channel_id == channel_id)
    }
}
