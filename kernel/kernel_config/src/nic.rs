//! Defaults for descriptor rings, packet buffers, and the demo applications.

/// Number of receive descriptors per RX queue.
pub const DEFAULT_NUM_RX_DESC: u16 = 512;
/// Number of transmit descriptors per TX queue.
pub const DEFAULT_NUM_TX_DESC: u16 = 512;

/// Size of each mempool entry, header and headroom included.
/// Must evenly divide a huge page.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;
/// Number of entries in a mempool backing a queue pair.
pub const DEFAULT_NUM_BUFFERS: usize = 4096;

/// Descriptor rings must start on a 128-byte boundary (82599 datasheet, 7.1.9 / 7.2.3.2).
pub const RING_ALIGNMENT: usize = 128;
/// Ring byte lengths must be a multiple of this.
pub const RING_LENGTH_GRANULARITY: usize = 128;

/// Maximum number of packets the forwarder moves per RX/TX call.
pub const FORWARD_BATCH_SIZE: usize = 32;

/// Maximum number of packets the generator sends per TX call.
pub const PKTGEN_BATCH_SIZE: usize = 64;
/// Number of entries in the generator's mempool.
pub const PKTGEN_NUM_BUFFERS: usize = 2048;
/// Size of a generated packet on the wire, excluding the CRC.
pub const PACKET_SIZE: usize = 60;
