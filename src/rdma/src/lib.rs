//! Verbs transport backend.
//!
//! Safe-enough wrappers over `rdma-sys` for the handful of primitives the
//! engine needs (protection domain, completion queue, reliable-connected
//! queue pair, memory registration), a [`queue::VerbsQueue`] implementing
//! the engine's work-queue seam, and the [`cm`] connection manager that
//! listens, classifies, and tears down client connections.
//!
//! Building this crate requires rdma-core (`libibverbs`, `librdmacm`) on
//! the host; it is deliberately not in the workspace's default members.

use std::io;

use thiserror::Error;

pub mod cm;
pub mod queue;
pub mod verbs;

#[derive(Debug, Error)]
pub enum Error {
    #[error("verbs error: {0}")]
    Ibv(io::Error),
    #[error("rdmacm error: {0}")]
    RdmaCm(io::Error),
    #[error("no available connection slot for a {0} connection")]
    NoSlot(&'static str),
    #[error("unrecognized connection tag {0:#x}")]
    BadPrivData(u8),
    #[error("engine error: {0}")]
    Engine(#[from] dstore_dpu::Error),
}

impl From<Error> for dstore_dpu::Error {
    fn from(e: Error) -> Self {
        match e {
            Error::Engine(inner) => inner,
            Error::Ibv(io) | Error::RdmaCm(io) => dstore_dpu::Error::Io(io),
            other => dstore_dpu::Error::Io(io::Error::new(io::ErrorKind::Other, other.to_string())),
        }
    }
}
