//! Outgoing message storage.
//!
//! A sender does not push messages to its peers; it deposits them here,
//! in a per-receiver outbox, and the peer pulls them through a transport
//! when it is ready. Deposit never blocks, retrieval blocks until a
//! message is available, and each outbox is FIFO. No ordering holds
//! between different receivers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, Sender};

use crate::error::{Error, Result};
use crate::reference::Reference;

/// One producer-consumer queue of serialized messages.
#[derive(Clone)]
pub struct Outbox {
    tx: Sender<Vec<u8>>,
    rx: Receiver<Vec<u8>>,
}

impl Outbox {
    pub fn new() -> Self {
        let (tx, rx) = unbounded();
        Outbox { tx, rx }
    }

    /// Adds a message to the queue. Never blocks.
    pub fn deposit(&self, message: Vec<u8>) {
        // The queue is unbounded and we hold both endpoints, so the
        // channel cannot be disconnected.
        let _ = self.tx.send(message);
    }

    /// Takes the oldest message, blocking until one is available.
    pub fn retrieve(&self) -> Result<Vec<u8>> {
        self.rx.recv().map_err(|_| {
            Error::Protocol("outbox was closed while a receiver was waiting".to_string())
        })
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Outbox::new()
    }
}

/// All outboxes of one instance, indexed by receiver endpoint.
///
/// Outboxes are created on demand from both sides: a deposit creates the
/// queue if the receiver has not asked yet, and a retrieval creates it if
/// the receiver got there first.
pub struct PostOffice {
    outboxes: RwLock<HashMap<Reference, Outbox>>,
    /// Requests a transport server is currently serving: taken from an
    /// outbox but not yet handed to the peer.
    serving: AtomicUsize,
}

impl PostOffice {
    pub fn new() -> Self {
        PostOffice {
            outboxes: RwLock::new(HashMap::new()),
            serving: AtomicUsize::new(0),
        }
    }

    fn outbox_for(&self, receiver: &Reference) -> Outbox {
        if let Some(outbox) = self
            .outboxes
            .read()
            .expect("outbox map lock poisoned")
            .get(receiver)
        {
            return outbox.clone();
        }
        let mut outboxes = self.outboxes.write().expect("outbox map lock poisoned");
        outboxes.entry(receiver.clone()).or_default().clone()
    }

    /// Queues a message for the given receiver.
    pub fn deposit(&self, receiver: &Reference, message: Vec<u8>) {
        self.outbox_for(receiver).deposit(message);
    }

    /// Removes and returns the oldest message for the given receiver,
    /// blocking until one has been deposited.
    pub fn retrieve(&self, receiver: &Reference) -> Result<Vec<u8>> {
        self.outbox_for(receiver).retrieve()
    }

    /// Marks the start of a transport request against this post office.
    /// Must be paired with [`serving_done`](Self::serving_done); keeps
    /// [`wait_until_empty`](Self::wait_until_empty) from declaring the
    /// office drained while a response is still on its way out.
    pub fn serving_started(&self) {
        self.serving.fetch_add(1, Ordering::SeqCst);
    }

    pub fn serving_done(&self) {
        self.serving.fetch_sub(1, Ordering::SeqCst);
    }

    /// Waits until every queued message has been picked up and every
    /// in-flight request has been answered. Called before shutting the
    /// transport down, so that a clean close never drops messages.
    pub fn wait_until_empty(&self) {
        loop {
            let all_empty = self
                .outboxes
                .read()
                .expect("outbox map lock poisoned")
                .values()
                .all(|outbox| outbox.is_empty());
            if all_empty && self.serving.load(Ordering::SeqCst) == 0 {
                return;
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Default for PostOffice {
    fn default() -> Self {
        PostOffice::new()
    }
}
