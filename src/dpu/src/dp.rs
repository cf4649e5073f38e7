//! The data-path work-queue seam.
//!
//! The engine drives every connection through [`WorkQueue`]: post a
//! [`WorkRequest`], later poll a [`Completion`] whose `wr_id` says which
//! step finished. Implementations must complete work requests in posting
//! order per queue — the engine pipelines on that guarantee (it posts the
//! head write-back immediately after the data reads). The verbs backend
//! satisfies this with a reliable-connected QP; the loopback queue in
//! [`crate::loopback`] satisfies it trivially.
//!
//! Every local byte range is named by a [`StagingArea`] tag plus an
//! offset, mirroring the fixed per-purpose memory regions a connection
//! registers; remote ranges are offsets into the host's DMA buffer.

use thiserror::Error;

/// Work-request ids. Completions carry these back as the engine's state
/// discriminator.
pub mod wr_id {
    pub const CTRL_RECV: u64 = 1;
    pub const CTRL_SEND: u64 = 2;
    pub const READ_REQUEST_META: u64 = 3;
    pub const READ_REQUEST_DATA: u64 = 4;
    pub const READ_REQUEST_DATA_SPLIT: u64 = 5;
    pub const WRITE_REQUEST_META: u64 = 6;
    pub const READ_RESPONSE_META: u64 = 7;
    pub const WRITE_RESPONSE_DATA: u64 = 8;
    pub const WRITE_RESPONSE_DATA_SPLIT: u64 = 9;
    pub const WRITE_RESPONSE_META: u64 = 10;
}

/// The fixed staging regions a connection owns. A queue implementation
/// maps each tag to the memory it registered for that purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StagingArea {
    Recv,
    Send,
    RequestData,
    RequestMeta,
    RequestHead,
    ResponseData,
    ResponseMeta,
    ResponseTail,
}

/// One scatter-gather entry: `len` bytes at `offset` into a staging area.
#[derive(Debug, Clone, Copy)]
pub struct SgEntry {
    pub area: StagingArea,
    pub offset: usize,
    pub len: usize,
}

impl SgEntry {
    pub fn new(area: StagingArea, offset: usize, len: usize) -> Self {
        SgEntry { area, offset, len }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum WorkRequest {
    /// Two-sided send out of a staging area. Always signaled.
    Send { wr_id: u64, sge: SgEntry },
    /// Pre-posted receive into a staging area.
    Recv { wr_id: u64, sge: SgEntry },
    /// RDMA READ of `[remote_off, remote_off + sge.len)` in the host
    /// buffer into the staging range.
    Read {
        wr_id: u64,
        sge: SgEntry,
        remote_off: usize,
    },
    /// RDMA WRITE of the staging range to the host buffer; `imm` selects
    /// WRITE_WITH_IMM for interrupt-notify mode.
    Write {
        wr_id: u64,
        sge: SgEntry,
        remote_off: usize,
        imm: Option<u32>,
    },
}

impl WorkRequest {
    pub fn wr_id(&self) -> u64 {
        match *self {
            WorkRequest::Send { wr_id, .. }
            | WorkRequest::Recv { wr_id, .. }
            | WorkRequest::Read { wr_id, .. }
            | WorkRequest::Write { wr_id, .. } => wr_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    Send,
    Recv,
    RdmaRead,
    RdmaWrite,
}

/// A successful completion. Failed completions never surface here: any
/// provider error is fatal and comes back as [`DatapathError`] from
/// `poll` (the fabric is private; a failure means the link is gone).
#[derive(Debug, Clone, Copy)]
pub struct Completion {
    pub wr_id: u64,
    pub opcode: WcOpcode,
    /// Bytes received, for `Recv` completions.
    pub byte_len: usize,
}

#[derive(Debug, Error)]
pub enum DatapathError {
    #[error("work completion failed with status {status} (wr_id {wr_id})")]
    Completion { wr_id: u64, status: i32 },
    #[error("failed to post work request: {0}")]
    Post(std::io::Error),
    #[error("completion queue poll failed: {0}")]
    Poll(std::io::Error),
    #[error("queue not connected")]
    NotConnected,
}

pub trait WorkQueue {
    /// Makes a staging buffer available for DMA under the given tag
    /// (a memory registration, for the verbs backend).
    fn register(&mut self, area: StagingArea, buf: std::sync::Arc<crate::dma::DmaBuffer>);

    /// Captures the peer's DMA window from the handshake: base address,
    /// access token, and total registered length.
    fn set_remote(&mut self, base: u64, rkey: u32, len: usize);

    /// Posts one work request. Sends and RDMA reads/writes are always
    /// signaled.
    fn post(&mut self, wr: WorkRequest) -> Result<(), DatapathError>;

    /// Non-blocking poll for the next completion, in posting order.
    fn poll(&mut self) -> Result<Option<Completion>, DatapathError>;

    /// Receive work requests currently outstanding on this queue.
    fn outstanding_recvs(&self) -> usize;
}
