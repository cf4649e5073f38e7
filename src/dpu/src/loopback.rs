//! Loopback transport: an in-process stand-in for the host across the
//! fabric.
//!
//! [`HostMemory`] is the host's registered DMA window laid out per
//! [`dstore_wire::layout`], with the host-side producer/consumer moves the
//! front end would make. [`LoopbackQueue`] implements [`WorkQueue`] by
//! executing reads and writes against that window immediately, completing
//! strictly in posting order — the same ordering contract a
//! reliable-connected QP gives the engine.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use dstore_wire::buff::{
    self, ParsedResponse, BATCH_META_BYTES,
};
use dstore_wire::layout;
use dstore_wire::{FileId, FileIoSize, RequestId, RingSize};

use crate::dma::DmaBuffer;
use crate::dp::{wr_id, Completion, DatapathError, SgEntry, StagingArea, WcOpcode, WorkQueue, WorkRequest};

/// The host's DMA window plus the front-end cursor state.
pub struct HostMemory {
    buf: Arc<DmaBuffer>,
    pub capacity: RingSize,
    tail_producer: RingSize,
    head_consumer: RingSize,
}

impl HostMemory {
    pub fn new(capacity: RingSize) -> Arc<Mutex<Self>> {
        let buf = DmaBuffer::zeroed(layout::total_size(capacity as usize));
        Arc::new(Mutex::new(HostMemory {
            buf,
            capacity,
            tail_producer: 0,
            head_consumer: 0,
        }))
    }

    pub fn base_address(&self) -> u64 {
        self.buf.as_ptr() as u64
    }

    #[allow(clippy::mut_from_ref)]
    fn request_arena(&self) -> &mut [u8] {
        unsafe {
            self.buf
                .slice_mut(layout::request_arena_off(), self.capacity as usize)
        }
    }

    fn response_arena(&self) -> &[u8] {
        unsafe {
            self.buf
                .slice(layout::response_arena_off(self.capacity as usize), self.capacity as usize)
        }
    }

    /// Produces a write record and publishes the new tail.
    pub fn push_write(
        &mut self,
        request_id: RequestId,
        file_id: FileId,
        offset: u64,
        payload: &[u8],
    ) -> FileIoSize {
        let at = self.tail_producer as usize;
        let size = buff::encode_write_request(self.request_arena(), at, request_id, file_id, offset, payload);
        self.advance_producer(size);
        size
    }

    /// Produces a read record and publishes the new tail.
    pub fn push_read(
        &mut self,
        request_id: RequestId,
        file_id: FileId,
        offset: u64,
        bytes: FileIoSize,
    ) -> FileIoSize {
        let at = self.tail_producer as usize;
        let size = buff::encode_read_request(self.request_arena(), at, request_id, file_id, offset, bytes);
        self.advance_producer(size);
        size
    }

    fn advance_producer(&mut self, bytes: FileIoSize) {
        self.tail_producer = (self.tail_producer + bytes) % self.capacity;
        let tail = self.tail_producer;
        // progress first, published tail second; readers retry on mismatch
        self.buf.write_u32(layout::REQ_META_OFF, tail);
        self.buf
            .write_u32(layout::REQ_META_OFF + layout::META_PUBLISHED_OFF, tail);
    }

    /// Forces the request meta pair into a torn state (`progress !=
    /// tail`), as a reader would observe mid-update.
    pub fn tear_request_meta(&mut self, progress: RingSize, tail: RingSize) {
        self.buf.write_u32(layout::REQ_META_OFF, progress);
        self.buf
            .write_u32(layout::REQ_META_OFF + layout::META_PUBLISHED_OFF, tail);
    }

    /// The consumer head the DPU wrote back for the request ring.
    pub fn request_head(&self) -> RingSize {
        self.buf.read_u32(layout::REQ_HEAD_OFF)
    }

    /// The published response tail (`TailC`) the DPU wrote.
    pub fn response_tail(&self) -> RingSize {
        self.buf.read_u32(layout::RESP_TAIL_OFF)
    }

    pub fn response_head(&self) -> RingSize {
        self.head_consumer
    }

    /// Drains every published response. In batched mode each batch starts
    /// with the framing slot whose leading word is the batch byte count.
    pub fn pop_responses(&mut self, batched: bool) -> Vec<(ParsedResponse, Vec<u8>)> {
        let tail = self.response_tail();
        let capacity = self.capacity;
        let mut out = Vec::new();
        let mut pos = self.head_consumer;

        while pos != tail {
            if batched {
                let total = buff::read_wrapped::<FileIoSize>(self.response_arena(), pos as usize);
                assert!(total >= BATCH_META_BYTES && total <= capacity);
                let end = (pos + total) % capacity;
                let mut inner = (pos + BATCH_META_BYTES) % capacity;
                while inner != end {
                    let rec = self.parse_response_at(inner);
                    inner = (inner + rec.0.size) % capacity;
                    out.push(rec);
                }
                pos = end;
            } else {
                let rec = self.parse_response_at(pos);
                pos = (pos + rec.0.size) % capacity;
                out.push(rec);
            }
        }

        self.advance_consumer(pos);
        out
    }

    fn parse_response_at(&self, at: RingSize) -> (ParsedResponse, Vec<u8>) {
        let arena = self.response_arena();
        let resp = ParsedResponse::parse(arena, at as usize).expect("malformed response record");
        // the record is padded to the response alignment; only
        // `bytes_serviced` of the trailer are payload
        let room = resp.size as usize - buff::SIZE_PREFIX - buff::ACK_HEADER_SIZE;
        let payload_len = room.min(resp.bytes_serviced as usize);
        let mut payload = vec![0u8; payload_len];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = arena[(resp.payload_at + i) % arena.len()];
        }
        (resp, payload)
    }

    /// Publishes a new consumer head for the response ring.
    pub fn advance_consumer(&mut self, head: RingSize) {
        self.head_consumer = head;
        self.buf.write_u32(layout::RESP_META_OFF, head);
        self.buf
            .write_u32(layout::RESP_META_OFF + layout::META_PUBLISHED_OFF, head);
    }

    /// Forces the response meta pair into a torn state.
    pub fn tear_response_meta(&mut self, progress: RingSize, head: RingSize) {
        self.buf.write_u32(layout::RESP_META_OFF, progress);
        self.buf
            .write_u32(layout::RESP_META_OFF + layout::META_PUBLISHED_OFF, head);
    }

    fn read_range(&self, off: usize, dst: &mut [u8]) {
        dst.copy_from_slice(unsafe { self.buf.slice(off, dst.len()) });
    }

    fn write_range(&mut self, off: usize, src: &[u8]) {
        unsafe { self.buf.slice_mut(off, src.len()) }.copy_from_slice(src);
    }
}

/// A loopback work queue bound to one [`HostMemory`].
pub struct LoopbackQueue {
    host: Arc<Mutex<HostMemory>>,
    staging: HashMap<StagingArea, Arc<DmaBuffer>>,
    completions: VecDeque<Completion>,
    inbox: VecDeque<Vec<u8>>,
    outbox: VecDeque<Vec<u8>>,
    posted_recvs: usize,
    /// Immediate data delivered with WRITE_WITH_IMM tail publications.
    pub imm_seen: Vec<u32>,
    /// Every work request posted, in order.
    pub posted: Vec<WorkRequest>,
}

impl LoopbackQueue {
    pub fn new(host: Arc<Mutex<HostMemory>>) -> Self {
        LoopbackQueue {
            host,
            staging: HashMap::new(),
            completions: VecDeque::new(),
            inbox: VecDeque::new(),
            outbox: VecDeque::new(),
            posted_recvs: 0,
            imm_seen: Vec::new(),
            posted: Vec::new(),
        }
    }

    fn area(&self, sge: &SgEntry) -> &Arc<DmaBuffer> {
        self.staging
            .get(&sge.area)
            .unwrap_or_else(|| panic!("staging area {:?} not registered", sge.area))
    }

    /// Host side: send a control message toward the DPU. Returns false if
    /// no receive was posted (the message is queued until one is).
    pub fn host_send(&mut self, bytes: &[u8]) -> bool {
        self.inbox.push_back(bytes.to_vec());
        self.try_deliver()
    }

    fn try_deliver(&mut self) -> bool {
        if self.posted_recvs == 0 || self.inbox.is_empty() {
            return false;
        }
        let msg = self.inbox.pop_front().unwrap();
        self.posted_recvs -= 1;
        let buf = self.staging[&StagingArea::Recv].clone();
        unsafe { buf.slice_mut(0, msg.len()) }.copy_from_slice(&msg);
        self.completions.push_back(Completion {
            wr_id: wr_id::CTRL_RECV,
            opcode: WcOpcode::Recv,
            byte_len: msg.len(),
        });
        true
    }

    /// Host side: messages the DPU sent.
    pub fn take_sent(&mut self) -> Vec<Vec<u8>> {
        self.outbox.drain(..).collect()
    }
}

impl WorkQueue for LoopbackQueue {
    fn register(&mut self, area: StagingArea, buf: Arc<DmaBuffer>) {
        self.staging.insert(area, buf);
    }

    fn set_remote(&mut self, _base: u64, _rkey: u32, len: usize) {
        let host = self.host.lock().unwrap();
        assert_eq!(len, layout::total_size(host.capacity as usize));
    }

    fn post(&mut self, wr: WorkRequest) -> Result<(), DatapathError> {
        self.posted.push(wr);
        match wr {
            WorkRequest::Recv { .. } => {
                self.posted_recvs += 1;
                self.try_deliver();
            }
            WorkRequest::Send { wr_id, sge } => {
                let buf = self.area(&sge).clone();
                let bytes = unsafe { buf.slice(sge.offset, sge.len) }.to_vec();
                self.outbox.push_back(bytes);
                self.completions.push_back(Completion {
                    wr_id,
                    opcode: WcOpcode::Send,
                    byte_len: sge.len,
                });
            }
            WorkRequest::Read { wr_id, sge, remote_off } => {
                let buf = self.area(&sge).clone();
                let dst = unsafe { buf.slice_mut(sge.offset, sge.len) };
                self.host.lock().unwrap().read_range(remote_off, dst);
                self.completions.push_back(Completion {
                    wr_id,
                    opcode: WcOpcode::RdmaRead,
                    byte_len: sge.len,
                });
            }
            WorkRequest::Write { wr_id, sge, remote_off, imm } => {
                let buf = self.area(&sge).clone();
                let src = unsafe { buf.slice(sge.offset, sge.len) };
                self.host.lock().unwrap().write_range(remote_off, src);
                if let Some(imm) = imm {
                    self.imm_seen.push(imm);
                }
                self.completions.push_back(Completion {
                    wr_id,
                    opcode: WcOpcode::RdmaWrite,
                    byte_len: sge.len,
                });
            }
        }
        Ok(())
    }

    fn poll(&mut self) -> Result<Option<Completion>, DatapathError> {
        Ok(self.completions.pop_front())
    }

    fn outstanding_recvs(&self) -> usize {
        self.posted_recvs
    }
}
