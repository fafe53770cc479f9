//! Receive and transmit queues: descriptor rings plus the batch operations
//! that move packet buffers between the application and the NIC.
//!
//! Every slot of a ring has an entry in a side table holding the
//! [`PacketBuffer`] whose payload the slot's descriptor points at, since the
//! descriptor itself only carries a physical address.
//!
//! Each queue is driven by exactly one thread; every mutating call takes `&mut self`.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate memory_structs;
extern crate kernel_config;
extern crate dma_memory;
extern crate nic_buffers;
extern crate nic_descriptors;
extern crate mempool;

mod ring;
mod rx;
mod tx;
#[cfg(test)]
mod test;

pub use ring::{DescriptorRing, TailRegister};
pub use rx::RxQueue;
pub use tx::TxQueue;

use core::fmt;


/// The errors that descriptor ring operations can return.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueueError {
    /// The ring was used before its descriptor memory was attached.
    UninitializedRing,
    /// The ring can't have the requested number of descriptors.
    InvalidRingSize(u16),
    /// A descriptor index past the end of the ring.
    InvalidIndex(u16),
    /// The descriptor memory offered to the ring is unusable.
    InvalidRegion(&'static str),
    /// A buffer offered for transmission has a size the NIC can't send.
    InvalidBufferSize(u32),
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueError::UninitializedRing => write!(f, "descriptor ring used before its memory was attached"),
            QueueError::InvalidRingSize(n) => write!(f, "a ring can't have {} descriptors", n),
            QueueError::InvalidIndex(i) => write!(f, "descriptor index {} is out of range", i),
            QueueError::InvalidRegion(msg) => write!(f, "invalid descriptor region: {}", msg),
            QueueError::InvalidBufferSize(size) => write!(f, "can't transmit a buffer of {} bytes", size),
        }
    }
}

impl From<QueueError> for &'static str {
    fn from(error: QueueError) -> Self {
        match error {
            QueueError::UninitializedRing => "descriptor ring used before its memory was attached",
            QueueError::InvalidRingSize(_) => "invalid number of ring descriptors",
            QueueError::InvalidIndex(_) => "descriptor index out of range",
            QueueError::InvalidRegion(msg) => msg,
            QueueError::InvalidBufferSize(_) => "invalid transmit buffer size",
        }
    }
}
