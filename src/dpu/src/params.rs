//! Compile-time sizing of queues, buffers, and the cache table.

/// Control message buffer size; re-exported from the wire crate so every
/// queue-depth constant lives in one place.
pub use dstore_wire::ctrl::CTRL_MSG_SIZE;

pub const CTRL_SENDQ_DEPTH: u32 = 16;
pub const CTRL_RECVQ_DEPTH: u32 = 16;
pub const CTRL_COMPQ_DEPTH: u32 = 16;

pub const BUFF_SENDQ_DEPTH: u32 = 256;
pub const BUFF_RECVQ_DEPTH: u32 = 256;
pub const BUFF_COMPQ_DEPTH: u32 = 256;

/// Rotating pool of in-flight data-plane request contexts per buffer
/// connection.
pub const MAX_OUTSTANDING_IO: usize = 256;

/// Every Nth agent iteration also runs the control-plane pass.
pub const DATA_PLANE_WEIGHT: u32 = 16;

pub const RESOLVE_TIMEOUT_MS: i32 = 2000;
pub const LISTEN_BACKLOG: i32 = 64;
pub const INLINE_THRESHOLD: usize = 1024;

pub const CACHE_BUCKET_SIZE: usize = 8;
pub const DEFAULT_CACHE_BUCKET_COUNT_POWER: u32 = 14;

/// Default per-ring arena size; the handshake may negotiate smaller rings.
pub const DEFAULT_RING_CAPACITY: u32 = 1 << 20;

/// A handshake advertising less than this is rejected outright.
pub const MIN_RING_CAPACITY: u32 = 256;
