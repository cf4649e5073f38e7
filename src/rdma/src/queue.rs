//! The verbs-backed work queue.
//!
//! One [`VerbsQueue`] wraps one reliable-connected QP plus its CQ, PD, and
//! per-purpose memory registrations. Work requests complete in posting
//! order on the QP; the engine's pipelining depends on exactly that.

use std::collections::HashMap;
use std::io;
use std::ptr;
use std::sync::Arc;

use log::{error, warn};
use rdma_sys::*;

use dstore_dpu::dma::DmaBuffer;
use dstore_dpu::dp::{Completion, DatapathError, SgEntry, StagingArea, WcOpcode, WorkQueue, WorkRequest};
use dstore_dpu::params;

use crate::verbs::{CompletionQueue, MemoryRegion, ProtectionDomain};
use crate::Error;

pub struct VerbsQueue {
    cm_id: *mut rdma_cm_id,
    qp: *mut ibv_qp,
    cq: CompletionQueue,
    pd: ProtectionDomain,
    mrs: HashMap<StagingArea, MemoryRegion>,
    remote_base: u64,
    rkey: u32,
    remote_len: usize,
    outstanding_recvs: usize,
}

unsafe impl Send for VerbsQueue {}

impl VerbsQueue {
    /// Builds PD, CQ, and a reliable-connected QP on a connect-request
    /// cm id, sized by the given queue depths.
    pub fn for_cm_id(cm_id: *mut rdma_cm_id, sendq: u32, recvq: u32, compq: u32) -> Result<Self, Error> {
        let ctx = unsafe { (*cm_id).verbs };
        let pd = ProtectionDomain::alloc(ctx)?;
        let cq = CompletionQueue::create(ctx, compq as i32)?;

        let mut init_attr: ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        init_attr.cap.max_send_wr = sendq;
        init_attr.cap.max_recv_wr = recvq;
        init_attr.cap.max_send_sge = 1;
        init_attr.cap.max_recv_sge = 1;
        init_attr.cap.max_inline_data = params::INLINE_THRESHOLD as u32;
        init_attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        init_attr.send_cq = cq.as_ptr();
        init_attr.recv_cq = cq.as_ptr();

        let rc = unsafe { rdma_create_qp(cm_id, pd.as_ptr(), &mut init_attr) };
        if rc != 0 {
            return Err(Error::RdmaCm(io::Error::last_os_error()));
        }

        Ok(VerbsQueue {
            cm_id,
            qp: unsafe { (*cm_id).qp },
            cq,
            pd,
            mrs: HashMap::new(),
            remote_base: 0,
            rkey: 0,
            remote_len: 0,
            outstanding_recvs: 0,
        })
    }

    fn sge_for(&self, sge: &SgEntry) -> Result<ibv_sge, DatapathError> {
        let mr = self.mrs.get(&sge.area).ok_or(DatapathError::NotConnected)?;
        Ok(ibv_sge {
            addr: mr.addr() + sge.offset as u64,
            length: sge.len as u32,
            lkey: mr.lkey(),
        })
    }

    fn remote_addr(&self, remote_off: usize, len: usize) -> Result<u64, DatapathError> {
        if remote_off + len > self.remote_len {
            return Err(DatapathError::Post(io::Error::new(
                io::ErrorKind::InvalidInput,
                "remote range outside the registered window",
            )));
        }
        Ok(self.remote_base + remote_off as u64)
    }

    fn post_one_sided(
        &mut self,
        wr_id: u64,
        sge: &SgEntry,
        remote_off: usize,
        opcode: u32,
        imm: Option<u32>,
    ) -> Result<(), DatapathError> {
        let mut sg = self.sge_for(sge)?;
        let remote_addr = self.remote_addr(remote_off, sge.len)?;

        let mut wr: ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sg;
        wr.num_sge = 1;
        wr.opcode = opcode;
        wr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
        wr.wr.rdma.remote_addr = remote_addr;
        wr.wr.rdma.rkey = self.rkey;
        if let Some(imm) = imm {
            wr.__bindgen_anon_1.imm_data = imm;
        }

        let mut bad_wr = ptr::null_mut();
        let rc = unsafe { ibv_post_send(self.qp, &mut wr, &mut bad_wr) };
        if rc != 0 {
            return Err(DatapathError::Post(io::Error::from_raw_os_error(rc)));
        }
        Ok(())
    }
}

impl WorkQueue for VerbsQueue {
    fn register(&mut self, area: StagingArea, buf: Arc<DmaBuffer>) {
        match MemoryRegion::register(&self.pd, buf) {
            Ok(mr) => {
                self.mrs.insert(area, mr);
            }
            Err(e) => {
                // registration failure means the session cannot proceed;
                // the next post on this area surfaces it as fatal
                error!("failed to register {:?}: {}", area, e);
            }
        }
    }

    fn set_remote(&mut self, base: u64, rkey: u32, len: usize) {
        self.remote_base = base;
        self.rkey = rkey;
        self.remote_len = len;
    }

    fn post(&mut self, wr: WorkRequest) -> Result<(), DatapathError> {
        match wr {
            WorkRequest::Recv { wr_id, sge } => {
                let mut sg = self.sge_for(&sge)?;
                let mut rwr: ibv_recv_wr = unsafe { std::mem::zeroed() };
                rwr.wr_id = wr_id;
                rwr.sg_list = &mut sg;
                rwr.num_sge = 1;
                let mut bad_wr = ptr::null_mut();
                let rc = unsafe { ibv_post_recv(self.qp, &mut rwr, &mut bad_wr) };
                if rc != 0 {
                    return Err(DatapathError::Post(io::Error::from_raw_os_error(rc)));
                }
                self.outstanding_recvs += 1;
                Ok(())
            }
            WorkRequest::Send { wr_id, sge } => {
                let mut sg = self.sge_for(&sge)?;
                let mut swr: ibv_send_wr = unsafe { std::mem::zeroed() };
                swr.wr_id = wr_id;
                swr.sg_list = &mut sg;
                swr.num_sge = 1;
                swr.opcode = ibv_wr_opcode::IBV_WR_SEND;
                swr.send_flags = ibv_send_flags::IBV_SEND_SIGNALED.0;
                let mut bad_wr = ptr::null_mut();
                let rc = unsafe { ibv_post_send(self.qp, &mut swr, &mut bad_wr) };
                if rc != 0 {
                    return Err(DatapathError::Post(io::Error::from_raw_os_error(rc)));
                }
                Ok(())
            }
            WorkRequest::Read { wr_id, sge, remote_off } => {
                self.post_one_sided(wr_id, &sge, remote_off, ibv_wr_opcode::IBV_WR_RDMA_READ, None)
            }
            WorkRequest::Write { wr_id, sge, remote_off, imm } => {
                let opcode = if imm.is_some() {
                    ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM
                } else {
                    ibv_wr_opcode::IBV_WR_RDMA_WRITE
                };
                self.post_one_sided(wr_id, &sge, remote_off, opcode, imm)
            }
        }
    }

    fn poll(&mut self) -> Result<Option<Completion>, DatapathError> {
        let wc = match self.cq.poll_one().map_err(DatapathError::Poll)? {
            Some(wc) => wc,
            None => return Ok(None),
        };
        if wc.status != ibv_wc_status::IBV_WC_SUCCESS {
            // the fabric is private; a failed completion means the link is
            // gone and the whole session terminates
            return Err(DatapathError::Completion {
                wr_id: wc.wr_id,
                status: wc.status as i32,
            });
        }
        let opcode = match wc.opcode {
            ibv_wc_opcode::IBV_WC_RECV | ibv_wc_opcode::IBV_WC_RECV_RDMA_WITH_IMM => {
                self.outstanding_recvs -= 1;
                WcOpcode::Recv
            }
            ibv_wc_opcode::IBV_WC_SEND => WcOpcode::Send,
            ibv_wc_opcode::IBV_WC_RDMA_READ => WcOpcode::RdmaRead,
            ibv_wc_opcode::IBV_WC_RDMA_WRITE => WcOpcode::RdmaWrite,
            other => {
                warn!("unexpected completion opcode {} (wr_id {})", other, wc.wr_id);
                return Ok(None);
            }
        };
        Ok(Some(Completion {
            wr_id: wc.wr_id,
            opcode,
            byte_len: wc.byte_len as usize,
        }))
    }

    fn outstanding_recvs(&self) -> usize {
        self.outstanding_recvs
    }
}

impl Drop for VerbsQueue {
    fn drop(&mut self) {
        // registrations must go before the PD; the QP before the CQ
        unsafe { rdma_destroy_qp(self.cm_id) };
        self.mrs.clear();
    }
}
