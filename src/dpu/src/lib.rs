//! DPU-side engine core of the disaggregated direct storage service.
//!
//! A remote host posts file-I/O requests into ring buffers in its own
//! memory; this crate's engine pulls them across the fabric with one-sided
//! reads, services them against a [`fs::FileService`], and pushes framed
//! responses back with one-sided writes. The transport itself sits behind
//! the [`dp::WorkQueue`] seam: the verbs backend lives in `dstore-rdma`,
//! and [`loopback`] provides an in-process implementation with identical
//! ordering semantics for tests and single-machine runs.

pub mod agent;
pub mod cache;
pub mod config;
pub mod conn;
pub mod ctrl;
pub mod dma;
pub mod dp;
pub mod engine;
pub mod fs;
pub mod loopback;
pub mod memfs;
pub mod params;
pub mod ring;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("wire format error: {0}")]
    Wire(#[from] dstore_wire::WireError),
    #[error("datapath error: {0}")]
    Datapath(#[from] dp::DatapathError),
    #[error("cache error: {0}")]
    Cache(#[from] cache::CacheError),
    #[error("connection is not set up")]
    NotConnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
