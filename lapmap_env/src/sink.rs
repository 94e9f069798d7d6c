//! Outbound message sink abstraction.
//!
//! The transport layer (message bus) is an external collaborator; the engine
//! only needs a place to hand finished messages to. Production wires this to
//! the real bus, the simulation and the tests to a buffer.

use crate::error::EnvError;
use crate::time::Timestamp;
use parking_lot::Mutex;

/// Receiver of the engine's outbound messages.
///
/// `M` is the engine's outbound message type; this crate stays agnostic of
/// its shape. Implementations must tolerate concurrent senders.
pub trait MessageSink<M>: Send + Sync + 'static {
    /// Delivers one message stamped with its sample time and the sender id.
    fn send(&self, message: M, sample_time: Timestamp, sender_stamp: u32) -> Result<(), EnvError>;
}

/// A delivered message together with its envelope metadata.
#[derive(Debug, Clone)]
pub struct Delivery<M> {
    pub message: M,
    pub sample_time: Timestamp,
    pub sender_stamp: u32,
}

/// In-memory sink collecting everything it is handed, in order.
#[derive(Debug)]
pub struct BufferSink<M> {
    deliveries: Mutex<Vec<Delivery<M>>>,
}

impl<M> BufferSink<M> {
    pub fn new() -> Self {
        Self {
            deliveries: Mutex::new(Vec::new()),
        }
    }

    /// Drains all buffered deliveries.
    pub fn drain(&self) -> Vec<Delivery<M>> {
        std::mem::take(&mut *self.deliveries.lock())
    }

    /// Number of buffered deliveries.
    pub fn len(&self) -> usize {
        self.deliveries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M> Default for BufferSink<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + Sync + Clone + 'static> MessageSink<M> for BufferSink<M> {
    fn send(&self, message: M, sample_time: Timestamp, sender_stamp: u32) -> Result<(), EnvError> {
        self.deliveries.lock().push(Delivery {
            message,
            sample_time,
            sender_stamp,
        });
        Ok(())
    }
}
