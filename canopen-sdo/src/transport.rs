//! Bus seams: sending frames, and fanning received frames out to listeners
//! keyed by protocol.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::{debug, trace};
use tokio::sync::mpsc;

use crate::frame::{SdoFrame, RESPONSE_COB_ID_BASE};

/// Anything able to put an SDO frame on the bus.
pub trait Transport: Send + Sync {
    fn send(&self, cob_id: u16, frame: &SdoFrame) -> io::Result<()>;
}

/// CANopen communication object classes, derived from the COB-ID function code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Nmt,
    Emergency,
    Pdo,
    /// Server to client SDO responses.
    Sdo,
    Heartbeat,
}

impl Protocol {
    /// Classify a standard COB-ID, returning the node it came from.
    pub fn classify(cob_id: u16) -> Option<(Self, u8)> {
        let node_id = (cob_id & 0x7F) as u8;
        match cob_id {
            0x000 => Some((Self::Nmt, 0)),
            0x081..=0x0FF => Some((Self::Emergency, node_id)),
            0x181..=0x57F => Some((Self::Pdo, node_id)),
            0x581..=0x5FF => Some((Self::Sdo, (cob_id - RESPONSE_COB_ID_BASE) as u8)),
            0x701..=0x77F => Some((Self::Heartbeat, node_id)),
            _ => None,
        }
    }
}

/// A frame delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundFrame {
    pub cob_id: u16,
    pub node_id: u8,
    /// Zero padded when the frame carried fewer than 8 bytes.
    pub data: [u8; 8],
    pub len: usize,
}

type ListenerId = u64;

#[derive(Default)]
struct Registry {
    next_id: ListenerId,
    listeners: HashMap<Protocol, Vec<(ListenerId, mpsc::UnboundedSender<InboundFrame>)>>,
}

fn lock(registry: &Mutex<Registry>) -> MutexGuard<'_, Registry> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Delivers received frames to the listeners subscribed to their protocol.
#[derive(Clone, Default)]
pub struct Dispatcher {
    registry: Arc<Mutex<Registry>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for frames of `protocol`. Dropping the listener deregisters it.
    pub fn subscribe(&self, protocol: Protocol) -> Listener {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = lock(&self.registry);
        let id = registry.next_id;
        registry.next_id += 1;
        registry.listeners.entry(protocol).or_default().push((id, tx));
        trace!("listener {} subscribed to {:?}", id, protocol);

        Listener {
            id,
            protocol,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Hand a received frame to every listener of its protocol.
    /// Returns how many listeners got it.
    pub fn publish(&self, cob_id: u16, data: &[u8]) -> usize {
        let Some((protocol, node_id)) = Protocol::classify(cob_id) else {
            return 0;
        };
        if protocol == Protocol::Sdo && data.len() != 8 {
            debug!("dropping SDO frame 0x{:03X} with {} bytes", cob_id, data.len());
            return 0;
        }

        let len = data.len().min(8);
        let mut frame = InboundFrame {
            cob_id,
            node_id,
            data: [0u8; 8],
            len,
        };
        frame.data[..len].copy_from_slice(&data[..len]);

        let mut registry = lock(&self.registry);
        match registry.listeners.get_mut(&protocol) {
            Some(listeners) => {
                // Drop listeners whose receiver is gone
                listeners.retain(|(_, tx)| tx.send(frame).is_ok());
                listeners.len()
            }
            None => 0,
        }
    }

    pub fn listener_count(&self, protocol: Protocol) -> usize {
        lock(&self.registry)
            .listeners
            .get(&protocol)
            .map_or(0, |listeners| listeners.len())
    }
}

/// Subscription handle returned by [`Dispatcher::subscribe`].
pub struct Listener {
    id: ListenerId,
    protocol: Protocol,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
    registry: Weak<Mutex<Registry>>,
}

impl Listener {
    /// Next frame, in arrival order. `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = lock(&registry);
            if let Some(listeners) = registry.listeners.get_mut(&self.protocol) {
                listeners.retain(|(id, _)| *id != self.id);
            }
            trace!("listener {} unsubscribed from {:?}", self.id, self.protocol);
        }
    }
}
