//! RDMA primitive wrappers.
//!
//! Each type owns exactly one verbs object and releases it on drop, in
//! the reverse order of the setup path (QP before CQ before channel
//! before PD). The wrappers stay deliberately close to the raw calls:
//! everything here runs on the agent thread and failures are fatal to the
//! session, so there is nothing to recover gracefully.

use std::io;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Arc;

use rdma_sys::*;

use dstore_dpu::dma::DmaBuffer;

use crate::Error;

pub struct ProtectionDomain {
    pd: *mut ibv_pd,
}

unsafe impl Send for ProtectionDomain {}

impl ProtectionDomain {
    pub fn alloc(ctx: *mut ibv_context) -> Result<Self, Error> {
        let pd = unsafe { ibv_alloc_pd(ctx) };
        if pd.is_null() {
            return Err(Error::Ibv(io::Error::last_os_error()));
        }
        Ok(ProtectionDomain { pd })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_pd {
        self.pd
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        unsafe { ibv_dealloc_pd(self.pd) };
    }
}

/// A CQ with its completion channel, notify armed at creation. The
/// steady-state data path polls; the channel only matters at handshake
/// boundaries.
pub struct CompletionQueue {
    channel: *mut ibv_comp_channel,
    cq: *mut ibv_cq,
}

unsafe impl Send for CompletionQueue {}

impl CompletionQueue {
    pub fn create(ctx: *mut ibv_context, cqe: i32) -> Result<Self, Error> {
        let channel = unsafe { ibv_create_comp_channel(ctx) };
        if channel.is_null() {
            return Err(Error::Ibv(io::Error::last_os_error()));
        }
        let cq = unsafe { ibv_create_cq(ctx, cqe * 2, ptr::null_mut(), channel, 0) };
        if cq.is_null() {
            let err = io::Error::last_os_error();
            unsafe { ibv_destroy_comp_channel(channel) };
            return Err(Error::Ibv(err));
        }
        let rc = unsafe { ibv_req_notify_cq(cq, 0) };
        if rc != 0 {
            let err = io::Error::from_raw_os_error(rc);
            unsafe {
                ibv_destroy_cq(cq);
                ibv_destroy_comp_channel(channel);
            }
            return Err(Error::Ibv(err));
        }
        Ok(CompletionQueue { channel, cq })
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut ibv_cq {
        self.cq
    }

    /// Non-blocking poll of a single work completion.
    pub fn poll_one(&self) -> io::Result<Option<ibv_wc>> {
        let mut wc = MaybeUninit::<ibv_wc>::uninit();
        let n = unsafe { ibv_poll_cq(self.cq, 1, wc.as_mut_ptr()) };
        match n {
            0 => Ok(None),
            1 => Ok(Some(unsafe { wc.assume_init() })),
            _ => Err(io::Error::last_os_error()),
        }
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        unsafe {
            ibv_destroy_cq(self.cq);
            ibv_destroy_comp_channel(self.channel);
        }
    }
}

/// A registered staging buffer. Keeps the backing allocation alive for as
/// long as the HCA may touch it.
pub struct MemoryRegion {
    mr: *mut ibv_mr,
    _buf: Arc<DmaBuffer>,
}

unsafe impl Send for MemoryRegion {}

impl MemoryRegion {
    pub fn register(pd: &ProtectionDomain, buf: Arc<DmaBuffer>) -> Result<Self, Error> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        let mr = unsafe {
            ibv_reg_mr(
                pd.as_ptr(),
                buf.as_ptr().cast(),
                buf.len(),
                access.0 as i32,
            )
        };
        if mr.is_null() {
            return Err(Error::Ibv(io::Error::last_os_error()));
        }
        Ok(MemoryRegion { mr, _buf: buf })
    }

    #[inline]
    pub fn lkey(&self) -> u32 {
        unsafe { (*self.mr).lkey }
    }

    #[inline]
    pub fn addr(&self) -> u64 {
        unsafe { (*self.mr).addr as u64 }
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        unsafe { ibv_dereg_mr(self.mr) };
    }
}
