//! Control-connection scenarios: handshake, metadata RPCs, pending-slot
//! discipline, and the receive re-post invariant.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use dstore_wire::ctrl::{
    self, encode_request, payload_bytes, CtrlAck, CTRL_MSG_SIZE,
};
use dstore_wire::{code, DIR_ROOT};

use dstore_dpu::agent::{Agent, NoConnEvents};
use dstore_dpu::cache::{default_hashers, CacheTable};
use dstore_dpu::dp::WorkQueue;
use dstore_dpu::engine::EngineOptions;
use dstore_dpu::fs::{FileService, ManualFileService};
use dstore_dpu::loopback::{HostMemory, LoopbackQueue};
use dstore_dpu::memfs::MemoryFileService;

struct Rig {
    agent: Agent<LoopbackQueue>,
}

impl Rig {
    fn new(fs: Arc<dyn FileService>) -> Self {
        let host = HostMemory::new(4096);
        let mut agent = Agent::new(1, 1, EngineOptions::default(), fs, Arc::new(AtomicBool::new(false)));
        let queue = LoopbackQueue::new(host);
        agent.ctrl_conns[0].activate(queue).unwrap();
        agent.ctrl_conns[0].set_connected();
        Rig { agent }
    }

    fn queue(&mut self) -> &mut LoopbackQueue {
        self.agent.ctrl_conns[0].queue_mut().unwrap()
    }

    fn send(&mut self, msg_id: u32, payload: Option<&[u8]>) {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let len = encode_request(msg_id, payload, &mut buf);
        assert!(self.queue().host_send(&buf[..len]));
    }

    fn tick_until_sent(&mut self) -> Vec<u8> {
        for _ in 0..5000 {
            self.agent.tick(&mut NoConnEvents).unwrap();
            let mut sent = self.queue().take_sent();
            if !sent.is_empty() {
                assert_eq!(sent.len(), 1);
                return sent.pop().unwrap();
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        panic!("no ack sent in 5000 ticks");
    }
}

fn memfs() -> Arc<MemoryFileService> {
    let cache = Arc::new(CacheTable::new(8, default_hashers()));
    Arc::new(MemoryFileService::start(1 << 30, cache))
}

#[test]
fn request_id_handshake_is_inline() {
    let fs = Arc::new(ManualFileService::new());
    let mut rig = Rig::new(fs.clone());

    rig.send(ctrl::F2B_REQUEST_ID, None);
    let ack = rig.tick_until_sent();

    let (id, decoded) = CtrlAck::decode(&ack).unwrap();
    assert_eq!(id, ctrl::B2F_RESPOND_ID);
    assert!(matches!(decoded, CtrlAck::RespondId { client_id: 0 }));

    // no file-service round trip, and the receive was re-posted
    assert!(fs.take_ctrl().is_empty());
    assert_eq!(rig.queue().outstanding_recvs(), 1);
}

#[test]
fn create_file_goes_through_the_pending_slot() {
    let fs = Arc::new(ManualFileService::new());
    let mut rig = Rig::new(fs.clone());

    let req = ctrl::ReqCreateFile {
        file_id: 42,
        dir_id: DIR_ROOT,
        file_attributes: 0,
        file_name: ctrl::NameBuf::from_str("x"),
    };
    rig.send(ctrl::F2B_REQ_CREATE_FILE, Some(payload_bytes(&req)));

    // the ack is gated on the result word: nothing goes out while pending
    for _ in 0..20 {
        rig.agent.tick(&mut NoConnEvents).unwrap();
    }
    assert!(rig.queue().take_sent().is_empty());
    assert_eq!(rig.queue().outstanding_recvs(), 1);

    let pending = fs.take_ctrl();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].slot.result(), code::IO_PENDING);
    pending[0]
        .slot
        .complete(code::SUCCESS, dstore_dpu::fs::CtrlPayload::None);

    let ack = rig.tick_until_sent();
    let (id, decoded) = CtrlAck::decode(&ack).unwrap();
    assert_eq!(id, ctrl::B2F_ACK_CREATE_FILE);
    assert!(matches!(decoded, CtrlAck::Result { result: code::SUCCESS }));
}

#[test]
fn metadata_rpcs_against_the_memory_service() {
    let fs = memfs();
    let mut rig = Rig::new(fs);

    let create = ctrl::ReqCreateFile {
        file_id: 7,
        dir_id: DIR_ROOT,
        file_attributes: 0o644,
        file_name: ctrl::NameBuf::from_str("alpha"),
    };
    rig.send(ctrl::F2B_REQ_CREATE_FILE, Some(payload_bytes(&create)));
    let (id, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert_eq!(id, ctrl::B2F_ACK_CREATE_FILE);
    assert!(matches!(ack, CtrlAck::Result { result: code::SUCCESS }));

    let resize = ctrl::ReqChangeFileSize::new(7, 1 << 16);
    rig.send(ctrl::F2B_REQ_CHANGE_FILE_SIZE, Some(payload_bytes(&resize)));
    let (id, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert_eq!(id, ctrl::B2F_ACK_CHANGE_FILE_SIZE);
    assert!(matches!(ack, CtrlAck::Result { result: code::SUCCESS }));

    let size_req = ctrl::ReqFileId { file_id: 7 };
    rig.send(ctrl::F2B_REQ_GET_FILE_SIZE, Some(payload_bytes(&size_req)));
    let (id, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert_eq!(id, ctrl::B2F_ACK_GET_FILE_SIZE);
    match ack {
        CtrlAck::FileSize { result, file_size } => {
            assert_eq!(result, code::SUCCESS);
            assert_eq!(file_size, 1 << 16);
        }
        other => panic!("unexpected ack {:?}", other),
    }

    let attr_req = ctrl::ReqFileId { file_id: 7 };
    rig.send(ctrl::F2B_REQ_GET_FILE_ATTR, Some(payload_bytes(&attr_req)));
    let (_, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    match ack {
        CtrlAck::FileAttr { result, attributes } => {
            assert_eq!(result, code::SUCCESS);
            assert_eq!(attributes, 0o644);
        }
        other => panic!("unexpected ack {:?}", other),
    }

    // a missing file surfaces the service's error verbatim
    let missing = ctrl::ReqFileId { file_id: 9999 };
    rig.send(ctrl::F2B_REQ_GET_FILE_SIZE, Some(payload_bytes(&missing)));
    let (_, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert!(matches!(
        ack,
        CtrlAck::FileSize { result: code::FILE_NOT_FOUND, .. }
    ));

    assert_eq!(rig.queue().outstanding_recvs(), 1);
}

#[test]
fn terminate_returns_the_slot() {
    let fs = Arc::new(ManualFileService::new());
    let mut rig = Rig::new(fs);

    let req = ctrl::ReqTerminate { client_id: 0 };
    rig.send(ctrl::F2B_TERMINATE, Some(payload_bytes(&req)));
    for _ in 0..4 {
        rig.agent.tick(&mut NoConnEvents).unwrap();
    }

    use dstore_dpu::conn::ConnState;
    assert_eq!(rig.agent.ctrl_conns[0].state, ConnState::Available);
}

#[test]
fn directory_tree_operations() {
    let fs = memfs();
    let mut rig = Rig::new(fs);

    let mkdir = ctrl::ReqCreateDir {
        dir_id: 3,
        parent_id: DIR_ROOT,
        path_name: ctrl::NameBuf::from_str("data"),
    };
    rig.send(ctrl::F2B_REQ_CREATE_DIR, Some(payload_bytes(&mkdir)));
    let (id, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert_eq!(id, ctrl::B2F_ACK_CREATE_DIR);
    assert!(matches!(ack, CtrlAck::Result { result: code::SUCCESS }));

    // a file keeps its directory non-empty
    let create = ctrl::ReqCreateFile {
        file_id: 11,
        dir_id: 3,
        file_attributes: 0,
        file_name: ctrl::NameBuf::from_str("f"),
    };
    rig.send(ctrl::F2B_REQ_CREATE_FILE, Some(payload_bytes(&create)));
    rig.tick_until_sent();

    let rmdir = ctrl::ReqRemoveDir { dir_id: 3 };
    rig.send(ctrl::F2B_REQ_REMOVE_DIR, Some(payload_bytes(&rmdir)));
    let (_, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert!(matches!(ack, CtrlAck::Result { result: code::DIR_NOT_EMPTY }));

    let rm_file = ctrl::ReqDeleteFile { file_id: 11, dir_id: 3 };
    rig.send(ctrl::F2B_REQ_DELETE_FILE, Some(payload_bytes(&rm_file)));
    rig.tick_until_sent();

    rig.send(ctrl::F2B_REQ_REMOVE_DIR, Some(payload_bytes(&rmdir)));
    let (_, ack) = CtrlAck::decode(&rig.tick_until_sent()).unwrap();
    assert!(matches!(ack, CtrlAck::Result { result: code::SUCCESS }));
}
