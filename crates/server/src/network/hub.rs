//! Subscriber hub
//!
//! Tracks every open push-stream connection. Each subscriber owns a small
//! bounded queue; [`SubscriberHub::broadcast`] pushes a frame into every
//! queue under the hub lock and the connection task writes it to the socket
//! afterwards. The socket is never touched while the lock is held.
//!
//! A full or closed queue is treated like a failed write: the subscriber is
//! swap-removed in the same critical section and its connection task sees
//! the channel close and shuts the stream down.

use async_channel::{Receiver, Sender, TrySendError};
use protocol::{DeviceRecord, encode_snapshot_frame};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Default maximum number of concurrent subscribers
pub const DEFAULT_MAX_SUBSCRIBERS: usize = 10;

/// Frames buffered per subscriber before it counts as stalled
pub const SUBSCRIBER_QUEUE_DEPTH: usize = 16;

/// A frame shared by every subscriber it is sent to
pub type Frame = Arc<str>;

/// Subscriber identifier, unique for the lifetime of the hub
pub type SubscriberId = u64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("Subscriber limit reached ({0})")]
    Full(usize),

    #[error("Server is shutting down")]
    Closed,
}

struct Subscriber {
    id: SubscriberId,
    peer: SocketAddr,
    tx: Sender<Frame>,
}

#[derive(Default)]
struct HubState {
    subscribers: Vec<Subscriber>,
    next_id: SubscriberId,
    closed: bool,
}

/// Receiving side handed to a stream connection on registration
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriberId,
    pub frames: Receiver<Frame>,
}

pub struct SubscriberHub {
    state: Mutex<HubState>,
    capacity: usize,
}

impl SubscriberHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Register a subscriber
    ///
    /// Fails with [`HubError::Full`] at capacity. Existing subscribers are
    /// never evicted to make room.
    pub async fn add(&self, peer: SocketAddr) -> Result<Subscription, HubError> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(HubError::Closed);
        }
        if state.subscribers.len() >= self.capacity {
            warn!(
                "Rejecting subscriber {}: limit of {} reached",
                peer, self.capacity
            );
            return Err(HubError::Full(self.capacity));
        }

        let id = state.next_id;
        state.next_id += 1;

        let (tx, rx) = async_channel::bounded(SUBSCRIBER_QUEUE_DEPTH);
        state.subscribers.push(Subscriber { id, peer, tx });
        info!(
            "Subscriber {} ({}) registered, {} active",
            id,
            peer,
            state.subscribers.len()
        );

        Ok(Subscription { id, frames: rx })
    }

    /// Deregister a subscriber, returning whether it was still present
    pub async fn remove(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock().await;
        let Some(pos) = state.subscribers.iter().position(|s| s.id == id) else {
            return false;
        };
        let sub = state.subscribers.swap_remove(pos);
        sub.tx.close();
        info!(
            "Subscriber {} ({}) removed, {} active",
            id,
            sub.peer,
            state.subscribers.len()
        );
        true
    }

    /// Queue `frame` for every current subscriber
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub async fn broadcast(&self, frame: &str) -> usize {
        let frame: Frame = Arc::from(frame);
        let mut state = self.state.lock().await;
        if state.closed {
            return 0;
        }

        let mut delivered = 0;
        let mut i = 0;
        while i < state.subscribers.len() {
            match state.subscribers[i].tx.try_send(Arc::clone(&frame)) {
                Ok(()) => {
                    delivered += 1;
                    i += 1;
                }
                Err(e) => {
                    let sub = state.subscribers.swap_remove(i);
                    sub.tx.close();
                    let reason = match e {
                        TrySendError::Full(_) => "queue full",
                        TrySendError::Closed(_) => "connection gone",
                    };
                    warn!("Dropping subscriber {} ({}): {}", sub.id, sub.peer, reason);
                    // Do not advance: swap_remove moved the last subscriber into `i`
                }
            }
        }

        debug!("Broadcast queued for {} subscriber(s)", delivered);
        delivered
    }

    /// Encode a snapshot and broadcast it
    pub async fn broadcast_snapshot(&self, records: &[DeviceRecord]) -> usize {
        match encode_snapshot_frame(records) {
            Ok(frame) => self.broadcast(&frame).await,
            Err(e) => {
                warn!("Failed to encode device snapshot: {}", e);
                0
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Force-close every subscriber and refuse new ones
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        state.closed = true;
        let count = state.subscribers.len();
        for sub in state.subscribers.drain(..) {
            sub.tx.close();
        }
        if count > 0 {
            info!("Closed {} subscriber connection(s)", count);
        }
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SUBSCRIBERS)
    }
}
