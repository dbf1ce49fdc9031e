//! In-flight request table of one channel.

use std::sync::atomic::{AtomicU32, Ordering};

use dashmap::DashMap;
use tokio::sync::oneshot;

use crate::error::{Result, RpcError};
use crate::protocol::Message;

/// Maps message ids of outstanding requests to their response slots.
///
/// Ids are allocated per channel and never 0.
#[derive(Debug)]
pub struct FutureManager {
    next_id: AtomicU32,
    pending: DashMap<u32, oneshot::Sender<Result<Message>>>,
}

impl FutureManager {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU32::new(1),
            pending: DashMap::new(),
        }
    }

    /// Allocate the next message id.
    pub fn next_id(&self) -> u32 {
        loop {
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    /// Register a pending request and get the receiver for its response.
    pub fn register(&self, msg_id: u32) -> oneshot::Receiver<Result<Message>> {
        let (tx, rx) = oneshot::channel();
        self.pending.insert(msg_id, tx);
        rx
    }

    /// Complete the request `msg_id`. Returns `false` if nothing was waiting.
    pub fn complete(&self, msg_id: u32, outcome: Result<Message>) -> bool {
        match self.pending.remove(&msg_id) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Forget a request, e.g. after its caller timed out.
    pub fn remove(&self, msg_id: u32) {
        self.pending.remove(&msg_id);
    }

    /// Fail every outstanding request with `err`.
    pub fn fail_all(&self, err: RpcError) {
        let ids: Vec<u32> = self.pending.iter().map(|e| *e.key()).collect();
        for id in ids {
            self.complete(id, Err(err.clone()));
        }
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Default for FutureManager {
    fn default() -> Self {
        Self::new()
    }
}
