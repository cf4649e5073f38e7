//! Control connections and the metadata RPC dispatcher.
//!
//! Control messages are synchronous RPCs in spirit, asynchronous on the
//! wire: the handler re-posts the receive, parks the request in the
//! connection's single pending slot with `IO_PENDING`, and submits it to
//! the file service. The agent's control pass later notices the result
//! word flip and sends the ack.

use std::sync::Arc;

use log::{debug, info, warn};

use dstore_wire::ctrl::{self, CtrlAck, CtrlRequest, CTRL_MSG_SIZE};
use dstore_wire::code;

use crate::conn::ConnState;
use crate::dma::DmaBuffer;
use crate::dp::{wr_id, Completion, SgEntry, StagingArea, WcOpcode, WorkQueue, WorkRequest};
use crate::fs::{
    ControlPlaneOp, ControlPlaneRequest, CtrlPayload, CtrlResponseSlot, FileService,
};
use crate::Error;

struct PendingCtrl {
    ack_id: u32,
    slot: Arc<CtrlResponseSlot>,
}

pub struct CtrlConn<Q> {
    pub id: u16,
    pub state: ConnState,
    queue: Option<Q>,
    recv_buf: Arc<DmaBuffer>,
    send_buf: Arc<DmaBuffer>,
    pending: Option<PendingCtrl>,
}

impl<Q: WorkQueue> CtrlConn<Q> {
    pub fn new(id: u16) -> Self {
        CtrlConn {
            id,
            state: ConnState::Available,
            queue: None,
            recv_buf: DmaBuffer::zeroed(CTRL_MSG_SIZE),
            send_buf: DmaBuffer::zeroed(CTRL_MSG_SIZE),
            pending: None,
        }
    }

    /// Claims the slot for a new session: registers the message buffers
    /// and pre-posts one receive.
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
        self.pending = None;
        self.state = ConnState::Available;
    }

    pub fn queue_mut(&mut self) -> Option<&mut Q> {
        self.queue.as_mut()
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
            WcOpcode::Recv => self.handle_message(fs),
            // sends and DMA acks need no action here
            WcOpcode::Send | WcOpcode::RdmaWrite | WcOpcode::RdmaRead => Ok(()),
        }
    }

    fn handle_message(&mut self, fs: &dyn FileService) -> Result<(), Error> {
        let req = {
            let buf = unsafe { self.recv_buf.slice(0, CTRL_MSG_SIZE) };
            CtrlRequest::decode(buf)?
        };
        debug!("ctrl conn #{}: {:?}", self.id, req);

        match req {
            CtrlRequest::RequestId => {
                self.repost_recv()?;
                let ack = CtrlAck::RespondId { client_id: self.id };
                self.post_ack(ctrl::B2F_RESPOND_ID, &ack)
            }
            CtrlRequest::Terminate(t) => {
                if t.client_id == self.id {
                    info!("ctrl conn #{} terminated by client", self.id);
                    self.teardown();
                    Ok(())
                } else {
                    warn!("ctrl conn #{}: terminate with mismatched client id {}", self.id, t.client_id);
                    self.repost_recv()
                }
            }
            other => {
                self.repost_recv()?;
                self.submit(other, fs)
            }
        }
    }

    fn submit(&mut self, req: CtrlRequest, fs: &dyn FileService) -> Result<(), Error> {
        let op = match req {
            CtrlRequest::CreateDir(r) => ControlPlaneOp::CreateDir(r),
            CtrlRequest::RemoveDir(r) => ControlPlaneOp::RemoveDir(r),
            CtrlRequest::CreateFile(r) => ControlPlaneOp::CreateFile(r),
            CtrlRequest::DeleteFile(r) => ControlPlaneOp::DeleteFile(r),
            CtrlRequest::ChangeFileSize(r) => ControlPlaneOp::ChangeFileSize(r),
            CtrlRequest::GetFileSize(r) => ControlPlaneOp::GetFileSize(r),
            CtrlRequest::GetFileInfo(r) => ControlPlaneOp::GetFileInfo(r),
            CtrlRequest::GetFileAttr(r) => ControlPlaneOp::GetFileAttr(r),
            CtrlRequest::GetFreeSpace => ControlPlaneOp::GetFreeSpace,
            CtrlRequest::MoveFile(r) => ControlPlaneOp::MoveFile(r),
            CtrlRequest::RequestId | CtrlRequest::Terminate(_) => unreachable!(),
        };

        if self.pending.is_some() {
            // single-slot discipline: a client that pipelines RPCs loses
            // the second one
            warn!("ctrl conn #{}: request while another is pending, dropped", self.id);
            return Ok(());
        }

        let slot = CtrlResponseSlot::new();
        self.pending = Some(PendingCtrl {
            ack_id: req.ack_id(),
            slot: slot.clone(),
        });
        fs.submit_control_plane(ControlPlaneRequest { op, slot });
        Ok(())
    }

    /// The control-plane completion pass: when the pending result word is
    /// no longer `IO_PENDING`, send the ack and clear the slot.
    pub fn sweep_pending(&mut self) -> Result<(), Error> {
        if !self.state.is_connected() {
            return Ok(());
        }
        let ready = match &self.pending {
            Some(p) => p.slot.result() != code::IO_PENDING,
            None => return Ok(()),
        };
        if !ready {
            return Ok(());
        }

        let p = self.pending.take().unwrap();
        let result = p.slot.result();
        let ack = match p.slot.payload() {
            CtrlPayload::None => CtrlAck::Result { result },
            CtrlPayload::FileSize(file_size) => CtrlAck::FileSize { result, file_size },
            CtrlPayload::FileInfo(properties) => CtrlAck::FileInfo { result, properties },
            CtrlPayload::FileAttr(attributes) => CtrlAck::FileAttr { result, attributes },
            CtrlPayload::FreeSpace(free_space) => CtrlAck::FreeSpace { result, free_space },
        };
        self.post_ack(p.ack_id, &ack)
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

    fn post_ack(&mut self, ack_id: u32, ack: &CtrlAck) -> Result<(), Error> {
        let len = {
            let buf = unsafe { self.send_buf.slice_mut(0, CTRL_MSG_SIZE) };
            ack.encode_into(ack_id, buf)
        };
        self.queue
            .as_mut()
            .ok_or(Error::NotConnected)?
            .post(WorkRequest::Send {
                wr_id: wr_id::CTRL_SEND,
                sge: SgEntry::new(StagingArea::Send, 0, len),
            })?;
        Ok(())
    }
}
