//! Connection manager.
//!
//! A single listener accepts both connection kinds; the first byte of the
//! connect-time private data says which. Slots come from the agent's
//! preallocated arrays and are reused across sessions. Handshake-stage
//! failures abort the one connection attempt and free its slot; they
//! never take the process down.

use std::ffi::CStr;
use std::io;
use std::net::SocketAddr;
use std::ptr;

use log::{debug, error, info, warn};
use rdma_sys::*;
use socket2::SockAddr;

use dstore_dpu::agent::ConnEvents;
use dstore_dpu::ctrl::CtrlConn;
use dstore_dpu::engine::BuffConn;
use dstore_dpu::params;
use dstore_wire::{BUFF_CONN_PRIV_DATA, CTRL_CONN_PRIV_DATA};

use crate::queue::VerbsQueue;
use crate::Error;

pub struct ConnectionManager {
    channel: *mut rdma_event_channel,
    listener: *mut rdma_cm_id,
    ctrl_ids: Vec<Option<*mut rdma_cm_id>>,
    buff_ids: Vec<Option<*mut rdma_cm_id>>,
}

unsafe impl Send for ConnectionManager {}

impl ConnectionManager {
    pub fn listen(addr: SocketAddr, max_clients: usize, max_buffs: usize) -> Result<Self, Error> {
        let channel = unsafe { rdma_create_event_channel() };
        if channel.is_null() {
            return Err(Error::RdmaCm(io::Error::last_os_error()));
        }
        set_nonblocking(channel).map_err(|e| {
            unsafe { rdma_destroy_event_channel(channel) };
            Error::RdmaCm(e)
        })?;

        let mut listener: *mut rdma_cm_id = ptr::null_mut();
        let rc = unsafe {
            rdma_create_id(channel, &mut listener, ptr::null_mut(), rdma_port_space::RDMA_PS_TCP)
        };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe { rdma_destroy_event_channel(channel) };
            return Err(Error::RdmaCm(err));
        }

        let sockaddr = SockAddr::from(addr);
        let rc = unsafe { rdma_bind_addr(listener, sockaddr.as_ptr() as *mut sockaddr) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                rdma_destroy_id(listener);
                rdma_destroy_event_channel(channel);
            }
            return Err(Error::RdmaCm(err));
        }

        let rc = unsafe { rdma_listen(listener, params::LISTEN_BACKLOG) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            unsafe {
                rdma_destroy_id(listener);
                rdma_destroy_event_channel(channel);
            }
            return Err(Error::RdmaCm(err));
        }

        info!("listening for connections on {}", addr);
        Ok(ConnectionManager {
            channel,
            listener,
            ctrl_ids: vec![None; max_clients],
            buff_ids: vec![None; max_buffs],
        })
    }

    fn handle_event(
        &mut self,
        event: *mut rdma_cm_event,
        ctrl: &mut [CtrlConn<VerbsQueue>],
        buff: &mut [BuffConn<VerbsQueue>],
    ) -> Result<(), Error> {
        let kind = unsafe { (*event).event };
        let id = unsafe { (*event).id };
        debug!("cm event {}", event_name(kind));

        match kind {
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_RESOLVED => {
                let rc = unsafe { rdma_resolve_route(id, params::RESOLVE_TIMEOUT_MS) };
                unsafe { rdma_ack_cm_event(event) };
                if rc != 0 {
                    warn!("rdma_resolve_route: {}", io::Error::last_os_error());
                }
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_RESOLVED => {
                unsafe { rdma_ack_cm_event(event) };
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_REQUEST => {
                let priv_data =
                    unsafe { (*event).param.conn.private_data as *const u8 };
                let tag = if priv_data.is_null() { 0 } else { unsafe { *priv_data } };
                let responder_resources = unsafe { (*event).param.conn.responder_resources };
                unsafe { rdma_ack_cm_event(event) };
                if let Err(e) = self.accept(tag, id, responder_resources, ctrl, buff) {
                    // reject by dropping; the slot (if any) stays free
                    warn!("rejecting connection: {}", e);
                    unsafe { rdma_destroy_id(id) };
                }
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ESTABLISHED => {
                unsafe { rdma_ack_cm_event(event) };
                if let Some(slot) = find_slot(&self.ctrl_ids, id) {
                    ctrl[slot].set_connected();
                    info!("control connection #{} established", slot);
                } else if let Some(slot) = find_slot(&self.buff_ids, id) {
                    buff[slot].set_connected();
                    info!("buffer connection #{} established", slot);
                } else {
                    warn!("ESTABLISHED for an unknown cm id");
                }
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_DISCONNECTED => {
                unsafe { rdma_ack_cm_event(event) };
                if let Some(slot) = find_slot(&self.ctrl_ids, id) {
                    ctrl[slot].teardown();
                    self.ctrl_ids[slot] = None;
                    unsafe { rdma_destroy_id(id) };
                    info!("control connection #{} disconnected", slot);
                } else if let Some(slot) = find_slot(&self.buff_ids, id) {
                    buff[slot].teardown();
                    self.buff_ids[slot] = None;
                    unsafe { rdma_destroy_id(id) };
                    info!("buffer connection #{} disconnected", slot);
                } else {
                    warn!("DISCONNECTED for an unknown cm id");
                }
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_ADDR_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_ROUTE_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_CONNECT_ERROR
            | rdma_cm_event_type::RDMA_CM_EVENT_UNREACHABLE
            | rdma_cm_event_type::RDMA_CM_EVENT_REJECTED => {
                let status = unsafe { (*event).status };
                unsafe { rdma_ack_cm_event(event) };
                // per-connection failure: free the slot, keep running
                if let Some(slot) = find_slot(&self.ctrl_ids, id) {
                    ctrl[slot].teardown();
                    self.ctrl_ids[slot] = None;
                    unsafe { rdma_destroy_id(id) };
                } else if let Some(slot) = find_slot(&self.buff_ids, id) {
                    buff[slot].teardown();
                    self.buff_ids[slot] = None;
                    unsafe { rdma_destroy_id(id) };
                }
                warn!("cm event {} (status {})", event_name(kind), status);
                Ok(())
            }
            rdma_cm_event_type::RDMA_CM_EVENT_DEVICE_REMOVAL => {
                unsafe { rdma_ack_cm_event(event) };
                error!("RDMA device removed");
                Err(Error::RdmaCm(io::Error::new(
                    io::ErrorKind::Other,
                    "device removal",
                )))
            }
            _ => {
                unsafe { rdma_ack_cm_event(event) };
                warn!("unhandled cm event {}", event_name(kind));
                Ok(())
            }
        }
    }

    fn accept(
        &mut self,
        tag: u8,
        id: *mut rdma_cm_id,
        responder_resources: u8,
        ctrl: &mut [CtrlConn<VerbsQueue>],
        buff: &mut [BuffConn<VerbsQueue>],
    ) -> Result<(), Error> {
        match tag {
            CTRL_CONN_PRIV_DATA => {
                let slot = ctrl
                    .iter()
                    .position(|c| c.state == dstore_dpu::conn::ConnState::Available)
                    .ok_or(Error::NoSlot("control"))?;
                let queue = VerbsQueue::for_cm_id(
                    id,
                    params::CTRL_SENDQ_DEPTH,
                    params::CTRL_RECVQ_DEPTH,
                    params::CTRL_COMPQ_DEPTH,
                )?;
                ctrl[slot].activate(queue)?;
                if let Err(e) = accept_on(id, params::CTRL_RECVQ_DEPTH as u8, responder_resources) {
                    ctrl[slot].teardown();
                    return Err(e);
                }
                self.ctrl_ids[slot] = Some(id);
                info!("control connection #{} accepted", slot);
                Ok(())
            }
            BUFF_CONN_PRIV_DATA => {
                let slot = buff
                    .iter()
                    .position(|c| c.state == dstore_dpu::conn::ConnState::Available)
                    .ok_or(Error::NoSlot("buffer"))?;
                let queue = VerbsQueue::for_cm_id(
                    id,
                    params::BUFF_SENDQ_DEPTH,
                    params::BUFF_RECVQ_DEPTH,
                    params::BUFF_COMPQ_DEPTH,
                )?;
                buff[slot].activate(queue)?;
                if let Err(e) = accept_on(id, params::BUFF_RECVQ_DEPTH as u8, responder_resources) {
                    buff[slot].teardown();
                    return Err(e);
                }
                self.buff_ids[slot] = Some(id);
                info!("buffer connection #{} accepted", slot);
                Ok(())
            }
            other => Err(Error::BadPrivData(other)),
        }
    }
}

impl ConnEvents<VerbsQueue> for ConnectionManager {
    fn poll(
        &mut self,
        ctrl: &mut [CtrlConn<VerbsQueue>],
        buff: &mut [BuffConn<VerbsQueue>],
    ) -> Result<(), dstore_dpu::Error> {
        let mut event: *mut rdma_cm_event = ptr::null_mut();
        let rc = unsafe { rdma_get_cm_event(self.channel, &mut event) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(());
            }
            return Err(Error::RdmaCm(err).into());
        }
        self.handle_event(event, ctrl, buff).map_err(Into::into)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        unsafe {
            rdma_destroy_id(self.listener);
            rdma_destroy_event_channel(self.channel);
        }
    }
}

fn accept_on(id: *mut rdma_cm_id, depth: u8, initiator_depth: u8) -> Result<(), Error> {
    let mut conn_param: rdma_conn_param = unsafe { std::mem::zeroed() };
    conn_param.responder_resources = depth;
    conn_param.initiator_depth = initiator_depth;
    let rc = unsafe { rdma_accept(id, &mut conn_param) };
    if rc != 0 {
        return Err(Error::RdmaCm(io::Error::last_os_error()));
    }
    Ok(())
}

fn find_slot(ids: &[Option<*mut rdma_cm_id>], id: *mut rdma_cm_id) -> Option<usize> {
    ids.iter().position(|entry| *entry == Some(id))
}

fn set_nonblocking(channel: *mut rdma_event_channel) -> io::Result<()> {
    let fd = unsafe { (*channel).fd };
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn event_name(event: rdma_cm_event_type::Type) -> String {
    let name = unsafe { rdma_event_str(event) };
    if name.is_null() {
        return "UNKNOWN".to_string();
    }
    unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned()
}
