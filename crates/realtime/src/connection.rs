//! Handle to one live transport channel.

use std::sync::{Arc, Mutex, PoisonError};

use shared::{
    domain::{ConnectionId, UserId},
    protocol::ServerEvent,
};
use tokio::sync::mpsc;

/// Who an authenticated connection belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Outbound side of a connection. Each connection has its own unbounded queue,
/// drained by the transport's writer task, so a slow socket never stalls a broadcaster.
///
/// A new handle starts *held*: events are buffered until [`ConnectionHandle::release`]
/// pushes the ready snapshot, so the snapshot is always the first event on the wire.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    outbound: mpsc::UnboundedSender<ServerEvent>,
    held: Mutex<Option<Vec<ServerEvent>>>,
}

impl ConnectionHandle {
    pub fn new(identity: Identity) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            identity,
            outbound,
            held: Mutex::new(Some(Vec::new())),
        });
        (handle, inbound)
    }

    /// Queues an event. Returns false once the transport side has gone away.
    pub fn deliver(&self, event: ServerEvent) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        match held.as_mut() {
            Some(buffer) => {
                buffer.push(event);
                true
            }
            None => self.outbound.send(event).is_ok(),
        }
    }

    /// Sends `first`, then everything buffered while the handle was held.
    pub(crate) fn release(&self, first: ServerEvent) -> bool {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let buffered = held.take().unwrap_or_default();
        let mut open = self.outbound.send(first).is_ok();
        for event in buffered {
            open &= self.outbound.send(event).is_ok();
        }
        open
    }

    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}
