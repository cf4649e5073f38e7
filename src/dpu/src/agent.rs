//! The single-threaded agent loop.
//!
//! One cooperative loop, pinned to a core by the daemon, round-robins over
//! every connection. Buffer CQs and I/O completion sweeps run on every
//! iteration; connection-manager events, control CQs, and control-plane
//! completions run on every [`DATA_PLANE_WEIGHT`]-th iteration. All polls
//! are non-blocking; termination is a force-quit flag flipped from signal
//! handlers, and any datapath error is fatal for the whole engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info};

use crate::ctrl::CtrlConn;
use crate::dp::WorkQueue;
use crate::engine::{BuffConn, EngineOptions};
use crate::fs::FileService;
use crate::params::DATA_PLANE_WEIGHT;
use crate::Error;

/// Drives connection setup and teardown for the agent. The verbs backend
/// polls the RDMA CM event channel here; tests wire connections up
/// directly and use [`NoConnEvents`].
pub trait ConnEvents<Q: WorkQueue> {
    fn poll(&mut self, ctrl: &mut [CtrlConn<Q>], buff: &mut [BuffConn<Q>]) -> Result<(), Error>;
}

pub struct NoConnEvents;

impl<Q: WorkQueue> ConnEvents<Q> for NoConnEvents {
    fn poll(&mut self, _ctrl: &mut [CtrlConn<Q>], _buff: &mut [BuffConn<Q>]) -> Result<(), Error> {
        Ok(())
    }
}

pub struct Agent<Q> {
    pub ctrl_conns: Vec<CtrlConn<Q>>,
    pub buff_conns: Vec<BuffConn<Q>>,
    fs: Arc<dyn FileService>,
    force_quit: Arc<AtomicBool>,
    data_plane_counter: u32,
    data_plane_weight: u32,
}

impl<Q: WorkQueue> Agent<Q> {
    pub fn new(
        max_clients: usize,
        max_buffs: usize,
        opts: EngineOptions,
        fs: Arc<dyn FileService>,
        force_quit: Arc<AtomicBool>,
    ) -> Self {
        let ctrl_conns = (0..max_clients).map(|i| CtrlConn::new(i as u16)).collect();
        let buff_conns = (0..max_buffs)
            .map(|i| BuffConn::new(i as u16, opts))
            .collect();
        Agent {
            ctrl_conns,
            buff_conns,
            fs,
            force_quit,
            data_plane_counter: 0,
            data_plane_weight: DATA_PLANE_WEIGHT,
        }
    }

    pub fn set_data_plane_weight(&mut self, weight: u32) {
        assert!(weight > 0);
        self.data_plane_weight = weight;
    }

    pub fn file_service(&self) -> &Arc<dyn FileService> {
        &self.fs
    }

    /// One scheduling round. Control-plane work piggybacks on every
    /// `data_plane_weight`-th round.
    pub fn tick(&mut self, events: &mut dyn ConnEvents<Q>) -> Result<(), Error> {
        if self.data_plane_counter == 0 {
            events.poll(&mut self.ctrl_conns, &mut self.buff_conns)?;

            for conn in self.ctrl_conns.iter_mut() {
                conn.poll_cq(self.fs.as_ref())?;
            }
            for conn in self.ctrl_conns.iter_mut() {
                conn.sweep_pending()?;
            }
        }

        for conn in self.buff_conns.iter_mut() {
            conn.poll_cq(self.fs.as_ref())?;
        }
        for conn in self.buff_conns.iter_mut() {
            conn.sweep(self.fs.as_ref())?;
        }

        self.data_plane_counter += 1;
        if self.data_plane_counter == self.data_plane_weight {
            self.data_plane_counter = 0;
        }
        Ok(())
    }

    /// Spins until the force-quit flag is raised or a datapath error makes
    /// the session unrecoverable.
    pub fn run(&mut self, events: &mut dyn ConnEvents<Q>) -> Result<(), Error> {
        info!(
            "agent loop starting: {} control slots, {} buffer slots",
            self.ctrl_conns.len(),
            self.buff_conns.len()
        );
        while !self.force_quit.load(Ordering::Relaxed) {
            if let Err(e) = self.tick(events) {
                error!("agent loop terminating: {}", e);
                self.force_quit.store(true, Ordering::Relaxed);
                return Err(e);
            }
        }
        info!("agent loop exited");
        Ok(())
    }
}
