//! Buffer connections and the per-connection data-plane state machine.
//!
//! Each buffer connection cycles through: poll the host's request tail
//! (RDMA READ of the meta pair), fetch new payload bytes (one or two DMA
//! reads at the wrap), parse and execute the records against the file
//! service, sweep completions forward, and publish finished responses
//! back into the host's response ring (DMA writes, then the tail word).
//! Everything is driven by CQ completions; nothing blocks.
//!
//! The engine pipelines on per-queue ordering: the head write-back is
//! posted immediately after the data reads, and the `TailC` word write is
//! posted immediately after the response data writes.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, info, trace, warn};

use dstore_wire::buff::{
    self, BuffAckHeader, ParsedRecord, BATCH_META_BYTES, READ_RECORD_SIZE, RESPONSE_ALIGNMENT,
    SIZE_PREFIX, WRITE_ACK_SIZE,
};
use dstore_wire::ctrl::{BuffRequestId, CtrlAck, BuffRequest, CTRL_MSG_SIZE};
use dstore_wire::layout;
use dstore_wire::{code, FileIoSize, RingSize, REQUEST_INVALID};

use crate::conn::ConnState;
use crate::dma::{DmaBuffer, SplittableBuffer};
use crate::dp::{wr_id, Completion, SgEntry, StagingArea, WcOpcode, WorkQueue, WorkRequest};
use crate::fs::{DataPlaneBatch, FileService, RequestContextArena, SlotRequest};
use crate::params::{MAX_OUTSTANDING_IO, MIN_RING_CAPACITY};
use crate::ring::{RequestRing, ResponseRing, SplitState};
use crate::Error;

/// Data-plane behavior knobs, fixed per connection at handshake time.
#[derive(Debug, Clone, Copy)]
pub struct EngineOptions {
    /// Submit each execute pass to the file service as one batch with a
    /// reservation-time framing slot, instead of per-record submissions.
    pub batching: bool,
    /// Publish the `TailC` word with WRITE_WITH_IMM so the host can sleep
    /// on a completion event instead of polling.
    pub notify_imm: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            batching: true,
            notify_imm: false,
        }
    }
}

/// A parsed request waiting for response-ring space.
struct PendingRecord {
    header: buff::BuffReqHeader,
    is_read: bool,
    /// Ring offset of a write's payload bytes in the request mirror.
    payload_at: RingSize,
}

/// A reserved response-ring extent awaiting the completion sweep.
#[derive(Clone, Copy)]
enum Reserved {
    BatchMeta { size: FileIoSize },
    Record {
        slot: u16,
        at: RingSize,
        size: FileIoSize,
    },
}

/// A framed batch awaiting publication.
struct Batch {
    start: RingSize,
    total: FileIoSize,
}

struct RingState {
    req: RequestRing,
    resp: ResponseRing,
    req_stage: Arc<DmaBuffer>,
    req_meta: Arc<DmaBuffer>,
    req_head: Arc<DmaBuffer>,
    resp_stage: Arc<DmaBuffer>,
    resp_meta: Arc<DmaBuffer>,
    resp_tail: Arc<DmaBuffer>,
    read_split: SplitState,
    write_split: SplitState,
    /// Bytes fetched by the in-flight data read(s).
    read_data_size: RingSize,
    pending: VecDeque<PendingRecord>,
    reserved: VecDeque<Reserved>,
    batches: VecDeque<Batch>,
    in_flight_slots: usize,
    /// A request-meta poll became due while the pending queue was
    /// non-empty; re-arm it once the queue drains.
    meta_poll_deferred: bool,
    /// A publication cycle (response meta read) is outstanding.
    publish_requested: bool,
}

impl RingState {
    fn new(capacity: RingSize) -> Self {
        RingState {
            req: RequestRing::new(capacity),
            resp: ResponseRing::new(capacity),
            req_stage: DmaBuffer::zeroed(capacity as usize),
            req_meta: DmaBuffer::zeroed(layout::META_PAIR_SIZE),
            req_head: DmaBuffer::zeroed(layout::CACHE_LINE),
            resp_stage: DmaBuffer::zeroed(capacity as usize),
            resp_meta: DmaBuffer::zeroed(layout::META_PAIR_SIZE),
            resp_tail: DmaBuffer::zeroed(layout::CACHE_LINE),
            read_split: SplitState::IDLE,
            write_split: SplitState::IDLE,
            read_data_size: 0,
            pending: VecDeque::new(),
            reserved: VecDeque::new(),
            batches: VecDeque::new(),
            in_flight_slots: 0,
            meta_poll_deferred: false,
            publish_requested: false,
        }
    }

    #[allow(clippy::mut_from_ref)]
    fn resp_arena_mut(&self) -> &mut [u8] {
        unsafe { self.resp_stage.slice_mut(0, self.resp_stage.len()) }
    }

    fn req_arena(&self) -> &[u8] {
        unsafe { self.req_stage.slice(0, self.req_stage.len()) }
    }
}

pub struct BuffConn<Q> {
    pub id: u16,
    pub client_id: u16,
    pub state: ConnState,
    opts: EngineOptions,
    queue: Option<Q>,
    recv_buf: Arc<DmaBuffer>,
    send_buf: Arc<DmaBuffer>,
    rings: Option<RingState>,
    arena: Arc<RequestContextArena>,
    next_ctx: u16,
}

impl<Q: WorkQueue> BuffConn<Q> {
    pub fn new(id: u16, opts: EngineOptions) -> Self {
        BuffConn {
            id,
            client_id: 0,
            state: ConnState::Available,
            opts,
            queue: None,
            recv_buf: DmaBuffer::zeroed(CTRL_MSG_SIZE),
            send_buf: DmaBuffer::zeroed(CTRL_MSG_SIZE),
            rings: None,
            arena: RequestContextArena::new(MAX_OUTSTANDING_IO),
            next_ctx: 0,
        }
    }

    pub fn activate(&mut self, mut queue: Q) -> Result<(), Error> {
        assert_eq!(self.state, ConnState::Available);
        queue.register(StagingArea::Recv, self.recv_buf.clone());
        queue.register(StagingArea::Send, self.send_buf.clone());
        queue.post(WorkRequest::Recv {
            wr_id: wr_id::CTRL_RECV,
            sge: SgEntry::new(StagingArea::Recv, 0, CTRL_MSG_SIZE),
        })?;
        self.queue = Some(queue);
        self.state = ConnState::Occupied;
        Ok(())
    }

    pub fn set_connected(&mut self) {
        self.state = ConnState::Connected;
    }

    pub fn teardown(&mut self) {
        self.queue = None;
        self.rings = None;
        self.next_ctx = 0;
        self.state = ConnState::Available;
    }

    pub fn queue_mut(&mut self) -> Option<&mut Q> {
        self.queue.as_mut()
    }

    /// Local response-ring cursors, for observability and tests.
    pub fn tails(&self) -> Option<(RingSize, RingSize, RingSize)> {
        self.rings.as_ref().map(|r| (r.resp.tail_a, r.resp.tail_b, r.resp.tail_c))
    }

    pub fn request_head(&self) -> Option<RingSize> {
        self.rings.as_ref().map(|r| r.req.head)
    }

    /// Polls one completion off this connection's CQ.
    pub fn poll_cq(&mut self, fs: &dyn FileService) -> Result<(), Error> {
        if !self.state.is_connected() {
            return Ok(());
        }
        let wc = match self.queue.as_mut().unwrap().poll()? {
            Some(wc) => wc,
            None => return Ok(()),
        };
        self.handle_completion(wc, fs)
    }

    fn handle_completion(&mut self, wc: Completion, fs: &dyn FileService) -> Result<(), Error> {
        match wc.opcode {
            WcOpcode::Recv => self.handle_message(),
            WcOpcode::Send => Ok(()),
            WcOpcode::RdmaRead => match wc.wr_id {
                wr_id::READ_REQUEST_META => self.on_request_meta(),
                wr_id::READ_REQUEST_DATA | wr_id::READ_REQUEST_DATA_SPLIT => {
                    self.on_request_data(fs)
                }
                wr_id::READ_RESPONSE_META => self.on_response_meta(),
                other => {
                    warn!("buff conn #{}: unknown read completion {}", self.id, other);
                    Ok(())
                }
            },
            WcOpcode::RdmaWrite => match wc.wr_id {
                wr_id::WRITE_REQUEST_META => self.on_request_head_written(),
                wr_id::WRITE_RESPONSE_DATA | wr_id::WRITE_RESPONSE_DATA_SPLIT => {
                    let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
                    if rings.write_split.complete_one() {
                        trace!("buff conn #{}: response bytes on the wire", self.id);
                    }
                    Ok(())
                }
                wr_id::WRITE_RESPONSE_META => Ok(()),
                other => {
                    warn!("buff conn #{}: unknown write completion {}", self.id, other);
                    Ok(())
                }
            },
        }
    }

    /// Handshake and release messages on the buffer connection.
    fn handle_message(&mut self) -> Result<(), Error> {
        let req = {
            let buf = unsafe { self.recv_buf.slice(0, CTRL_MSG_SIZE) };
            BuffRequest::decode(buf)?
        };

        match req {
            BuffRequest::RequestId(h) => self.handshake(h),
            BuffRequest::Release(r) => {
                if r.buffer_id == self.id && r.client_id == self.client_id {
                    info!("buff conn #{} (client #{}) released", self.id, r.client_id);
                    self.teardown();
                    Ok(())
                } else {
                    warn!("buff conn #{}: release with mismatched ids", self.id);
                    self.repost_recv()
                }
            }
        }
    }

    fn handshake(&mut self, h: BuffRequestId) -> Result<(), Error> {
        self.repost_recv()?;

        if h.capacity < MIN_RING_CAPACITY {
            warn!(
                "buff conn #{}: unusable ring capacity {} in handshake",
                self.id, h.capacity
            );
            self.teardown();
            return Ok(());
        }

        self.client_id = h.client_id;
        let rings = RingState::new(h.capacity);
        let queue = self.queue.as_mut().ok_or(Error::NotConnected)?;
        queue.register(StagingArea::RequestData, rings.req_stage.clone());
        queue.register(StagingArea::RequestMeta, rings.req_meta.clone());
        queue.register(StagingArea::RequestHead, rings.req_head.clone());
        queue.register(StagingArea::ResponseData, rings.resp_stage.clone());
        queue.register(StagingArea::ResponseMeta, rings.resp_meta.clone());
        queue.register(StagingArea::ResponseTail, rings.resp_tail.clone());
        queue.set_remote(
            h.buffer_address,
            h.access_token,
            layout::total_size(h.capacity as usize),
        );
        self.rings = Some(rings);

        info!(
            "buff conn #{} serves client #{}: capacity {} bytes, remote base {:#x}",
            self.id, h.client_id, h.capacity, h.buffer_address
        );

        let len = {
            let buf = unsafe { self.send_buf.slice_mut(0, CTRL_MSG_SIZE) };
            CtrlAck::BuffRespondId { buffer_id: self.id }
                .encode_into(dstore_wire::ctrl::B2F_RESPOND_ID, buf)
        };
        let queue = self.queue.as_mut().unwrap();
        queue.post(WorkRequest::Send {
            wr_id: wr_id::CTRL_SEND,
            sge: SgEntry::new(StagingArea::Send, 0, len),
        })?;

        // start the polling loop
        self.post_request_meta_read()
    }

    fn repost_recv(&mut self) -> Result<(), Error> {
        self.queue
            .as_mut()
            .ok_or(Error::NotConnected)?
            .post(WorkRequest::Recv {
                wr_id: wr_id::CTRL_RECV,
                sge: SgEntry::new(StagingArea::Recv, 0, CTRL_MSG_SIZE),
            })?;
        Ok(())
    }

    fn post_request_meta_read(&mut self) -> Result<(), Error> {
        self.queue
            .as_mut()
            .ok_or(Error::NotConnected)?
            .post(WorkRequest::Read {
                wr_id: wr_id::READ_REQUEST_META,
                sge: SgEntry::new(StagingArea::RequestMeta, 0, layout::META_PAIR_SIZE),
                remote_off: layout::REQ_META_OFF,
            })?;
        Ok(())
    }

    fn post_response_meta_read(&mut self) -> Result<(), Error> {
        self.queue
            .as_mut()
            .ok_or(Error::NotConnected)?
            .post(WorkRequest::Read {
                wr_id: wr_id::READ_RESPONSE_META,
                sge: SgEntry::new(StagingArea::ResponseMeta, 0, layout::META_PAIR_SIZE),
                remote_off: layout::RESP_META_OFF,
            })?;
        Ok(())
    }

    /// Step 2: the request tail word arrived.
    fn on_request_meta(&mut self) -> Result<(), Error> {
        let rings = self.rings.as_ref().ok_or(Error::NotConnected)?;
        let progress = rings.req_meta.read_u32(0);
        let tail = rings.req_meta.read_u32(layout::META_PUBLISHED_OFF);
        let head = rings.req.head;
        let capacity = rings.req.capacity;

        if tail >= capacity || tail == head || tail != progress {
            // no new work, a mid-update pair, or a garbage tail word:
            // poll again
            return self.post_request_meta_read();
        }

        // fetch `[head, progress)`, mirroring ring offsets one-to-one
        let (first_len, second_len) = if progress > head {
            (progress - head, 0)
        } else {
            (capacity - head, progress)
        };

        let rings = self.rings.as_mut().unwrap();
        rings.read_data_size = first_len + second_len;
        let split = second_len != 0;
        rings.read_split = SplitState::start(split);
        rings.req.head = progress;
        rings.req_head.write_u32(0, progress);

        let queue = self.queue.as_mut().unwrap();
        if split {
            queue.post(WorkRequest::Read {
                wr_id: wr_id::READ_REQUEST_DATA_SPLIT,
                sge: SgEntry::new(StagingArea::RequestData, 0, second_len as usize),
                remote_off: layout::request_arena_off(),
            })?;
        }
        queue.post(WorkRequest::Read {
            wr_id: wr_id::READ_REQUEST_DATA,
            sge: SgEntry::new(StagingArea::RequestData, head as usize, first_len as usize),
            remote_off: layout::request_arena_off() + head as usize,
        })?;

        // pipeline the head write-back; reliable-connected queues complete
        // work requests in posting order, so the host cannot observe the
        // new head before the data reads execute
        queue.post(WorkRequest::Write {
            wr_id: wr_id::WRITE_REQUEST_META,
            sge: SgEntry::new(StagingArea::RequestHead, 0, std::mem::size_of::<RingSize>()),
            remote_off: layout::REQ_HEAD_OFF,
            imm: None,
        })?;
        Ok(())
    }

    /// Step 3 -> 4: one part of the payload fetch finished.
    fn on_request_data(&mut self, fs: &dyn FileService) -> Result<(), Error> {
        let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
        if !rings.read_split.complete_one() {
            return Ok(());
        }
        self.parse_fetched();
        self.drain_pending(fs)
    }

    /// The head write-back finished: the next meta poll is due, unless the
    /// execute pass is stalled on response-ring space.
    fn on_request_head_written(&mut self) -> Result<(), Error> {
        let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
        if rings.pending.is_empty() {
            self.post_request_meta_read()
        } else {
            rings.meta_poll_deferred = true;
            Ok(())
        }
    }

    /// Walks the fetched bytes as framed records, in ring order.
    fn parse_fetched(&mut self) {
        let rings = self.rings.as_mut().unwrap();
        let capacity = rings.req.capacity;
        let total = rings.read_data_size;
        let mut at = (rings.req.head + capacity - total) % capacity;
        let mut parsed: RingSize = 0;

        while parsed < total {
            let rec = match ParsedRecord::parse(rings.req_arena(), at as usize) {
                Ok(rec) => rec,
                Err(e) => {
                    // a corrupt ring is unrecoverable for this session
                    warn!("buff conn #{}: {} at ring offset {}", self.id, e, at);
                    break;
                }
            };
            rings.pending.push_back(PendingRecord {
                header: rec.header,
                is_read: rec.is_read,
                payload_at: (at + READ_RECORD_SIZE) % capacity,
            });
            parsed += rec.size;
            at = (at + rec.size) % capacity;
        }
        trace!(
            "buff conn #{}: parsed {} bytes into {} pending records",
            self.id,
            parsed,
            rings.pending.len()
        );
    }

    /// Step 4: reserve response space for as many pending records as fit
    /// and submit them to the file service. Stops short when the response
    /// ring or the context pool is exhausted; the sweep retries as
    /// `tail_b` drains.
    fn drain_pending(&mut self, fs: &dyn FileService) -> Result<(), Error> {
        let batching = self.opts.batching;
        let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
        if rings.pending.is_empty() {
            return self.rearm_deferred_poll();
        }

        let reservable = rings.resp.reservable();
        let overhead = if batching { BATCH_META_BYTES } else { 0 };
        let free_slots = MAX_OUTSTANDING_IO - rings.in_flight_slots;

        let mut take = 0usize;
        let mut resp_bytes = overhead;
        for rec in rings.pending.iter() {
            if take == free_slots {
                break;
            }
            let rs = if rec.is_read {
                buff::read_response_size(rec.header.bytes)
            } else {
                WRITE_ACK_SIZE
            };
            if resp_bytes + rs > reservable {
                break;
            }
            resp_bytes += rs;
            take += 1;
        }

        if take == 0 {
            debug!(
                "buff conn #{}: execute stalled ({} pending, {} reservable)",
                self.id,
                rings.pending.len(),
                reservable
            );
            return Ok(());
        }

        let capacity = rings.resp.capacity;
        let batch_start = rings.resp.tail_a;
        let mut progress = batch_start;

        if batching {
            // reservation-time framing slot; the byte count lands at
            // execute end once it is known
            let stub = BuffAckHeader {
                request_id: REQUEST_INVALID,
                result: code::IO_PENDING as u16,
                bytes_serviced: 0,
            };
            buff::write_wrapped(rings.resp_arena_mut(), progress as usize, &0u32);
            buff::write_wrapped(
                rings.resp_arena_mut(),
                (progress as usize + SIZE_PREFIX) % capacity as usize,
                &stub,
            );
            rings.reserved.push_back(Reserved::BatchMeta { size: BATCH_META_BYTES });
            progress = (progress + BATCH_META_BYTES) % capacity;
        }

        let first_index = self.next_ctx;
        let mut total_resp: FileIoSize = overhead;

        for _ in 0..take {
            let rec = rings.pending.pop_front().unwrap();
            let resp_size = if rec.is_read {
                buff::read_response_size(rec.header.bytes)
            } else {
                WRITE_ACK_SIZE
            };

            // response stub: size prefix plus a pending ack header
            buff::write_wrapped(rings.resp_arena_mut(), progress as usize, &resp_size);
            let stub = BuffAckHeader {
                request_id: rec.header.request_id,
                result: code::IO_PENDING as u16,
                bytes_serviced: 0,
            };
            buff::write_wrapped(
                rings.resp_arena_mut(),
                (progress as usize + SIZE_PREFIX) % capacity as usize,
                &stub,
            );

            let data = if rec.is_read {
                // the file service deposits read bytes straight into the
                // response staging, after the stub
                let payload_at = (progress + RESPONSE_ALIGNMENT) % capacity;
                SplittableBuffer::new(
                    rings.resp_stage.clone(),
                    payload_at as usize,
                    rec.header.bytes as usize,
                )
            } else {
                // a write's source bytes live in the request mirror
                SplittableBuffer::new(
                    rings.req_stage.clone(),
                    rec.payload_at as usize,
                    rec.header.bytes as usize,
                )
            };

            let slot_index = self.next_ctx;
            self.arena.slot(slot_index).prepare(SlotRequest {
                header: rec.header,
                is_read: rec.is_read,
                data,
            });
            self.next_ctx = (self.next_ctx + 1) % MAX_OUTSTANDING_IO as u16;
            rings.in_flight_slots += 1;
            rings.reserved.push_back(Reserved::Record {
                slot: slot_index,
                at: progress,
                size: resp_size,
            });

            progress = (progress + resp_size) % capacity;
            total_resp += resp_size;

            if !batching {
                fs.submit_data_plane(DataPlaneBatch {
                    arena: self.arena.clone(),
                    first_index: slot_index,
                    count: 1,
                });
            }
        }

        rings.resp.advance_a(total_resp);

        if batching {
            buff::write_wrapped(rings.resp_arena_mut(), batch_start as usize, &total_resp);
            rings.batches.push_back(Batch {
                start: batch_start,
                total: total_resp,
            });
            fs.submit_data_plane(DataPlaneBatch {
                arena: self.arena.clone(),
                first_index,
                count: take as u16,
            });
        }

        debug!(
            "buff conn #{}: reserved {} response bytes for {} records (tail_a {})",
            self.id,
            total_resp,
            take,
            rings.resp.tail_a
        );

        if rings.pending.is_empty() {
            self.rearm_deferred_poll()
        } else {
            Ok(())
        }
    }

    fn rearm_deferred_poll(&mut self) -> Result<(), Error> {
        let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
        if rings.meta_poll_deferred {
            rings.meta_poll_deferred = false;
            self.post_request_meta_read()
        } else {
            Ok(())
        }
    }

    /// Step 5: advance `tail_b` over the longest all-complete prefix of
    /// reserved responses, then trigger publication when a batch (or, in
    /// unbatched mode, anything) is ready.
    pub fn sweep(&mut self, fs: &dyn FileService) -> Result<(), Error> {
        if !self.state.is_connected() || self.rings.is_none() {
            return Ok(());
        }

        let rings = self.rings.as_mut().unwrap();
        let mut advanced = false;

        loop {
            let front = match rings.reserved.front() {
                Some(front) => *front,
                None => break,
            };
            match front {
                Reserved::BatchMeta { size } => {
                    rings.resp.advance_b(size);
                    rings.reserved.pop_front();
                    advanced = true;
                }
                Reserved::Record { slot, at, size } => {
                    let ctx = self.arena.slot(slot);
                    let result = ctx.result();
                    if result == code::IO_PENDING {
                        break;
                    }
                    // fill the final ack over the stub
                    let ack = BuffAckHeader {
                        request_id: ctx.request().header.request_id,
                        result: result as u16,
                        bytes_serviced: ctx.bytes_serviced(),
                    };
                    let capacity = rings.resp.capacity as usize;
                    buff::write_wrapped(
                        rings.resp_arena_mut(),
                        (at as usize + SIZE_PREFIX) % capacity,
                        &ack,
                    );
                    rings.resp.advance_b(size);
                    rings.in_flight_slots -= 1;
                    rings.reserved.pop_front();
                    advanced = true;
                }
            }
        }

        if advanced {
            self.request_publication()?;
            // tail_b drained: a stalled execute pass may proceed now
            self.drain_pending(fs)?;
        }
        Ok(())
    }

    /// Step 5 -> 6: start a publication cycle if one is due.
    fn request_publication(&mut self) -> Result<(), Error> {
        let batching = self.opts.batching;
        let rings = self.rings.as_mut().unwrap();
        if rings.publish_requested {
            return Ok(());
        }
        let due = if batching {
            match rings.batches.front() {
                Some(batch) => rings.resp.unpublished() >= batch.total,
                None => false,
            }
        } else {
            rings.resp.unpublished() > 0
        };
        if !due {
            return Ok(());
        }
        rings.publish_requested = true;
        self.post_response_meta_read()
    }

    /// Step 6 -> 7: the host's response head arrived; write the response
    /// bytes if the target range has been consumed, else keep polling.
    fn on_response_meta(&mut self) -> Result<(), Error> {
        let batching = self.opts.batching;
        let rings = self.rings.as_mut().ok_or(Error::NotConnected)?;
        let progress = rings.resp_meta.read_u32(0);
        let head = rings.resp_meta.read_u32(layout::META_PUBLISHED_OFF);
        let capacity = rings.resp.capacity;

        let tail_start = rings.resp.tail_c;
        let total = if batching {
            match rings.batches.front() {
                Some(batch) => {
                    debug_assert_eq!(batch.start, tail_start);
                    batch.total
                }
                None => {
                    rings.publish_requested = false;
                    return Ok(());
                }
            }
        } else {
            rings.resp.unpublished()
        };
        if total == 0 {
            rings.publish_requested = false;
            return Ok(());
        }

        if head >= capacity || head != progress {
            // host mid-update or a garbage head word
            return self.post_response_meta_read();
        }

        // free space between our publication tail and the host's head
        let free = if tail_start >= head {
            head + capacity - tail_start
        } else {
            head - tail_start
        };
        if free < total {
            // the host has not consumed far enough; never overwrite
            return self.post_response_meta_read();
        }

        let (first_len, second_len) = if tail_start + total <= capacity {
            (total, 0)
        } else {
            (capacity - tail_start, total - (capacity - tail_start))
        };
        let split = second_len != 0;
        rings.write_split = SplitState::start(split);

        let queue = self.queue.as_mut().unwrap();
        if split {
            queue.post(WorkRequest::Write {
                wr_id: wr_id::WRITE_RESPONSE_DATA_SPLIT,
                sge: SgEntry::new(StagingArea::ResponseData, 0, second_len as usize),
                remote_off: layout::response_arena_off(capacity as usize),
                imm: None,
            })?;
        }
        queue.post(WorkRequest::Write {
            wr_id: wr_id::WRITE_RESPONSE_DATA,
            sge: SgEntry::new(StagingArea::ResponseData, tail_start as usize, first_len as usize),
            remote_off: layout::response_arena_off(capacity as usize) + tail_start as usize,
            imm: None,
        })?;

        // publish the new tail right behind the data, relying on per-queue
        // ordering for the payload-before-tail guarantee
        rings.resp.advance_c(total);
        let new_tail = rings.resp.tail_c;
        rings.resp_tail.write_u32(0, new_tail);
        let imm = if self.opts.notify_imm { Some(new_tail) } else { None };
        let queue = self.queue.as_mut().unwrap();
        queue.post(WorkRequest::Write {
            wr_id: wr_id::WRITE_RESPONSE_META,
            sge: SgEntry::new(StagingArea::ResponseTail, 0, std::mem::size_of::<RingSize>()),
            remote_off: layout::RESP_TAIL_OFF,
            imm,
        })?;

        if batching {
            rings.batches.pop_front();
        }
        rings.publish_requested = false;
        debug!(
            "buff conn #{}: published {} response bytes, tail_c {}",
            self.id, total, new_tail
        );

        // more completed batches may already be waiting
        self.request_publication()
    }
}
