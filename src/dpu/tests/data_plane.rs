//! End-to-end data-plane scenarios over the loopback transport.
//!
//! Each test stands up one buffer connection against an emulated host
//! window, produces ring records exactly as the front end would, ticks
//! the agent, and checks the bytes and cursors the host observes.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dstore_wire::buff::WRITE_ACK_SIZE;
use dstore_wire::ctrl::{
    self, encode_request, payload_bytes, BuffRequestId, CtrlAck, CTRL_MSG_SIZE,
};
use dstore_wire::{code, layout, RingSize, DIR_ROOT};

use dstore_dpu::agent::{Agent, NoConnEvents};
use dstore_dpu::cache::{default_hashers, CacheTable};
use dstore_dpu::dp::{wr_id, StagingArea, WorkRequest};
use dstore_dpu::engine::EngineOptions;
use dstore_dpu::fs::{
    ControlPlaneOp, ControlPlaneRequest, CtrlResponseSlot, FileService, ManualFileService,
};
use dstore_dpu::loopback::{HostMemory, LoopbackQueue};
use dstore_dpu::memfs::MemoryFileService;

const TEST_FILE: u16 = 42;

struct Rig {
    host: Arc<Mutex<HostMemory>>,
    agent: Agent<LoopbackQueue>,
}

impl Rig {
    fn new(capacity: RingSize, fs: Arc<dyn FileService>, opts: EngineOptions) -> Self {
        let host = HostMemory::new(capacity);
        let mut agent = Agent::new(1, 1, opts, fs, Arc::new(AtomicBool::new(false)));

        let queue = LoopbackQueue::new(host.clone());
        agent.buff_conns[0].activate(queue).unwrap();
        agent.buff_conns[0].set_connected();

        let (base, cap) = {
            let h = host.lock().unwrap();
            (h.base_address(), h.capacity)
        };
        let handshake = BuffRequestId::new(0, cap, base, 0x77);
        let mut msg = [0u8; CTRL_MSG_SIZE];
        let len = encode_request(ctrl::F2B_REQUEST_ID, Some(payload_bytes(&handshake)), &mut msg);
        assert!(agent.buff_conns[0]
            .queue_mut()
            .unwrap()
            .host_send(&msg[..len]));

        let mut rig = Rig { host, agent };
        rig.tick_n(4);

        // the handshake ack carries our buffer id
        let sent = rig.queue().take_sent();
        assert_eq!(sent.len(), 1);
        let (id, ack) = CtrlAck::decode(&sent[0]).unwrap();
        assert_eq!(id, ctrl::B2F_RESPOND_ID);
        // on a buffer connection the respond-id payload is the buffer id
        assert!(matches!(ack, CtrlAck::RespondId { client_id: 0 }));
        rig
    }

    fn queue(&mut self) -> &mut LoopbackQueue {
        self.agent.buff_conns[0].queue_mut().unwrap()
    }

    fn tick_n(&mut self, n: usize) {
        for _ in 0..n {
            self.agent.tick(&mut NoConnEvents).unwrap();
        }
    }

    fn tick_until<F: FnMut(&mut Rig) -> bool>(&mut self, mut pred: F) {
        for _ in 0..5000 {
            if pred(self) {
                return;
            }
            self.agent.tick(&mut NoConnEvents).unwrap();
            std::thread::sleep(Duration::from_micros(200));
        }
        panic!("condition not reached in 5000 ticks");
    }
}

fn memfs_with_file(size: u64) -> Arc<MemoryFileService> {
    let cache = Arc::new(CacheTable::new(8, default_hashers()));
    let fs = Arc::new(MemoryFileService::start(1 << 30, cache));
    create_file(fs.as_ref(), TEST_FILE);
    if size > 0 {
        resize_file(fs.as_ref(), TEST_FILE, size);
    }
    fs
}

fn create_file(fs: &dyn FileService, file_id: u16) {
    let slot = CtrlResponseSlot::new();
    fs.submit_control_plane(ControlPlaneRequest {
        op: ControlPlaneOp::CreateFile(ctrl::ReqCreateFile {
            file_id,
            dir_id: DIR_ROOT,
            file_attributes: 0,
            file_name: ctrl::NameBuf::from_str("x"),
        }),
        slot: slot.clone(),
    });
    wait_slot(&slot);
}

fn resize_file(fs: &dyn FileService, file_id: u16, new_size: u64) {
    let slot = CtrlResponseSlot::new();
    fs.submit_control_plane(ControlPlaneRequest {
        op: ControlPlaneOp::ChangeFileSize(ctrl::ReqChangeFileSize::new(file_id, new_size)),
        slot: slot.clone(),
    });
    wait_slot(&slot);
}

fn wait_slot(slot: &CtrlResponseSlot) {
    for _ in 0..5000 {
        if slot.result() != code::IO_PENDING {
            assert_eq!(slot.result(), code::SUCCESS);
            return;
        }
        std::thread::sleep(Duration::from_micros(200));
    }
    panic!("control-plane request never completed");
}

#[test]
fn single_write_round_trip() {
    let fs = memfs_with_file(0);
    let mut rig = Rig::new(
        4096,
        fs,
        EngineOptions {
            batching: false,
            notify_imm: false,
        },
    );

    rig.host
        .lock()
        .unwrap()
        .push_write(7, TEST_FILE, 0, &[0xAA; 16]);

    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == WRITE_ACK_SIZE);

    let mut host = rig.host.lock().unwrap();
    assert_eq!(host.request_head(), 48);
    let responses = host.pop_responses(false);
    assert_eq!(responses.len(), 1);
    let (ack, payload) = &responses[0];
    assert_eq!(ack.size, 12);
    assert_eq!(ack.request_id, 7);
    assert_eq!(ack.result, code::SUCCESS);
    assert_eq!(ack.bytes_serviced, 16);
    assert!(payload.is_empty());
    drop(host);

    // the written bytes come back on a read
    rig.host.lock().unwrap().push_read(8, TEST_FILE, 0, 16);
    rig.tick_until(|r| r.host.lock().unwrap().response_tail() != WRITE_ACK_SIZE);

    let responses = rig.host.lock().unwrap().pop_responses(false);
    assert_eq!(responses.len(), 1);
    let (ack, payload) = &responses[0];
    assert_eq!(ack.request_id, 8);
    assert_eq!(ack.bytes_serviced, 16);
    assert_eq!(&payload[..], &[0xAA; 16]);
}

#[test]
fn write_straddling_the_wrap_splits_the_fetch() {
    let fs = Arc::new(ManualFileService::new());
    let mut rig = Rig::new(
        4096,
        fs.clone(),
        EngineOptions {
            batching: false,
            notify_imm: false,
        },
    );

    // park the producer at 4080: one 4080-byte record, completed and
    // consumed before the interesting one
    let filler = vec![0x11u8; 4060];
    rig.host.lock().unwrap().push_write(1, TEST_FILE, 0, &filler);
    rig.tick_until(|_| fs.pending_data() == 1);
    for batch in fs.take_data() {
        for (_, slot) in batch.slots() {
            slot.complete(code::SUCCESS, slot.request().header.bytes);
        }
    }
    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == WRITE_ACK_SIZE);
    {
        let mut host = rig.host.lock().unwrap();
        host.pop_responses(false);
        assert_eq!(host.request_head(), 4080);
    }
    rig.queue().posted.clear();

    // a 48-byte record at 4080 wraps; the fetch must split 16 + 32
    rig.host.lock().unwrap().push_write(9, TEST_FILE, 64, &[0x5A; 28]);
    rig.tick_until(|_| fs.pending_data() == 1);

    let posted = rig.queue().posted.clone();
    let mut reads: Vec<(u64, usize, usize)> = posted
        .iter()
        .filter_map(|wr| match wr {
            WorkRequest::Read { wr_id, sge, remote_off }
                if sge.area == StagingArea::RequestData =>
            {
                Some((*wr_id, sge.len, *remote_off))
            }
            _ => None,
        })
        .collect();
    reads.sort_by_key(|(id, ..)| *id);
    assert_eq!(
        reads,
        vec![
            (wr_id::READ_REQUEST_DATA, 16, layout::request_arena_off() + 4080),
            (wr_id::READ_REQUEST_DATA_SPLIT, 32, layout::request_arena_off()),
        ]
    );

    // the payload presented to the file service follows the record header
    // across the wrap: 28 contiguous bytes starting at mirror offset 4
    let batches = fs.take_data();
    assert_eq!(batches.len(), 1);
    let batch = &batches[0];
    let mut seen = 0;
    for (_, slot) in batch.slots() {
        let req = slot.request();
        assert!(!req.is_read);
        assert_eq!(req.header.request_id, 9);
        assert_eq!(req.header.offset, 64);
        assert_eq!(req.data.first_off, 4);
        assert_eq!(req.data.total_len(), 28);
        assert!(!req.data.is_split());
        let mut payload = vec![0u8; 28];
        req.data.copy_to(&mut payload);
        assert_eq!(payload, vec![0x5A; 28]);
        slot.complete(code::SUCCESS, 28);
        seen += 1;
    }
    assert_eq!(seen, 1);

    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == 2 * WRITE_ACK_SIZE);
}

#[test]
fn batched_reads_share_one_framing_slot() {
    let fs = memfs_with_file(32);
    // deposit a recognizable pattern
    {
        let mut rig = Rig::new(
            4096,
            fs.clone(),
            EngineOptions {
                batching: true,
                notify_imm: false,
            },
        );
        let data: Vec<u8> = (0u8..32).collect();
        rig.host.lock().unwrap().push_write(99, TEST_FILE, 0, &data);
        rig.tick_until(|r| r.host.lock().unwrap().response_tail() != 0);
        rig.host.lock().unwrap().pop_responses(true);
    }

    let mut rig = Rig::new(
        4096,
        fs,
        EngineOptions {
            batching: true,
            notify_imm: false,
        },
    );

    {
        let mut host = rig.host.lock().unwrap();
        for (i, off) in [(1u16, 0u64), (2, 8), (3, 16), (4, 24)] {
            host.push_read(i, TEST_FILE, off, 8);
        }
    }

    // 24-byte batch slot + four 24-byte responses
    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == 120);
    assert_eq!(rig.agent.buff_conns[0].tails(), Some((120, 120, 120)));

    let responses = rig.host.lock().unwrap().pop_responses(true);
    assert_eq!(responses.len(), 4);
    for (i, (ack, payload)) in responses.iter().enumerate() {
        assert_eq!(ack.size, 24);
        assert_eq!(ack.request_id, (i + 1) as u16);
        assert_eq!(ack.result, code::SUCCESS);
        assert_eq!(ack.bytes_serviced, 8);
        let base = (i * 8) as u8;
        let expect: Vec<u8> = (base..base + 8).collect();
        assert_eq!(&payload[..], &expect[..]);
    }
}

#[test]
fn response_ring_backpressure_stalls_instead_of_overwriting() {
    let fs = Arc::new(ManualFileService::new());
    let mut rig = Rig::new(
        4096,
        fs.clone(),
        EngineOptions {
            batching: true,
            notify_imm: false,
        },
    );

    // three 2000-byte reads want 24 + 3 * 2016 response bytes; only two
    // fit in the 4095 reservable bytes, the third must wait
    {
        let mut host = rig.host.lock().unwrap();
        for i in 1u16..=3 {
            host.push_read(i, TEST_FILE, 0, 2000);
        }
    }
    rig.tick_until(|r| r.agent.buff_conns[0].tails() == Some((4056, 24, 0)));
    assert_eq!(fs.pending_data(), 1);

    // finish the first two; they publish, but nothing may be overwritten
    for batch in fs.take_data() {
        for (_, slot) in batch.slots() {
            slot.complete(code::SUCCESS, 2000);
        }
    }
    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == 4056);

    // the stalled third read is reserved once tail_b drained, and its
    // publication now blocks on the host's unconsumed head
    rig.tick_until(|_| fs.pending_data() == 1);
    for batch in fs.take_data() {
        for (_, slot) in batch.slots() {
            slot.complete(code::SUCCESS, 2000);
        }
    }
    rig.tick_n(50);
    assert_eq!(rig.host.lock().unwrap().response_tail(), 4056);

    // the host consumes; publication of the second batch proceeds and
    // wraps the arena end
    {
        let mut host = rig.host.lock().unwrap();
        let responses = host.pop_responses(true);
        assert_eq!(responses.len(), 2);
        assert_eq!(host.response_head(), 4056);
    }
    rig.tick_until(|r| r.host.lock().unwrap().response_tail() == (4056 + 2040) % 4096);

    let responses = rig.host.lock().unwrap().pop_responses(true);
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].0.request_id, 3);
}

#[test]
fn torn_request_meta_forces_repoll() {
    let fs = memfs_with_file(0);
    let mut rig = Rig::new(
        4096,
        fs,
        EngineOptions {
            batching: false,
            notify_imm: false,
        },
    );

    rig.queue().posted.clear();
    rig.host.lock().unwrap().tear_request_meta(20, 48);
    rig.tick_n(8);

    // only meta re-polls, never a data fetch
    let posted = rig.queue().posted.clone();
    assert!(posted.iter().all(|wr| matches!(
        wr,
        WorkRequest::Read { wr_id: wr_id::READ_REQUEST_META, .. }
    )));
    assert!(posted.len() >= 4);

    // heal the pair: a real record at [0, 48) becomes visible
    rig.host.lock().unwrap().push_write(5, TEST_FILE, 0, &[1u8; 16]);
    rig.tick_until(|r| r.host.lock().unwrap().request_head() == 48);
}

#[test]
fn random_interleaving_preserves_order() {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let fs = memfs_with_file(1 << 16);
    let mut rig = Rig::new(
        8192,
        fs,
        EngineOptions {
            batching: true,
            notify_imm: false,
        },
    );
    let mut rng = StdRng::seed_from_u64(0xB0B);

    let mut expected = Vec::new();
    let mut received = Vec::new();
    let mut next_id = 1u16;
    for _round in 0..8 {
        let records = rng.gen_range(1..=6);
        {
            let mut host = rig.host.lock().unwrap();
            for _ in 0..records {
                let id = next_id;
                next_id += 1;
                expected.push(id);
                if rng.gen_bool(0.5) {
                    let len = rng.gen_range(1..=256);
                    let payload: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                    host.push_write(id, TEST_FILE, rng.gen_range(0..1 << 10), &payload);
                } else {
                    host.push_read(id, TEST_FILE, rng.gen_range(0..1 << 10), rng.gen_range(1..=256));
                }
            }
        }

        // drain before the next round so neither ring overruns
        rig.tick_until(|r| {
            let mut host = r.host.lock().unwrap();
            for (ack, _) in host.pop_responses(true) {
                received.push(ack.request_id);
            }
            received.len() == expected.len()
        });
    }

    // per-connection FIFO: responses come back in request order
    assert_eq!(received, expected);
}
