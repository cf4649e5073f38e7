//! The file-service boundary.
//!
//! The engine never blocks on storage: control-plane operations and
//! data-plane batches are handed to a [`FileService`] and complete by
//! flipping a per-request result word from `IO_PENDING`. Data-plane
//! contexts live in a fixed arena owned by the buffer connection; the
//! service receives `(arena, first_index, count)` and never owns a slot.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use dstore_wire::buff::BuffReqHeader;
use dstore_wire::ctrl::{
    FileProperties, ReqChangeFileSize, ReqCreateDir, ReqCreateFile, ReqDeleteFile, ReqFileId,
    ReqMoveFile, ReqRemoveDir,
};
use dstore_wire::{code, ErrorCode, FileAttributes, FileSize};

use crate::dma::SplittableBuffer;

/// Completion slot for one in-flight control-plane request. The service
/// stores the payload first, then flips `result` with `Release`; the
/// dispatcher polls `result` with `Acquire` before reading the payload.
pub struct CtrlResponseSlot {
    result: AtomicU32,
    payload: Mutex<CtrlPayload>,
}

#[derive(Debug, Clone, Copy)]
pub enum CtrlPayload {
    None,
    FileSize(FileSize),
    FileInfo(FileProperties),
    FileAttr(FileAttributes),
    FreeSpace(FileSize),
}

impl CtrlResponseSlot {
    pub fn new() -> Arc<Self> {
        Arc::new(CtrlResponseSlot {
            result: AtomicU32::new(code::IO_PENDING),
            payload: Mutex::new(CtrlPayload::None),
        })
    }

    pub fn complete(&self, result: ErrorCode, payload: CtrlPayload) {
        *self.payload.lock().unwrap() = payload;
        self.result.store(result, Ordering::Release);
    }

    #[inline]
    pub fn result(&self) -> ErrorCode {
        self.result.load(Ordering::Acquire)
    }

    pub fn payload(&self) -> CtrlPayload {
        *self.payload.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ControlPlaneOp {
    CreateDir(ReqCreateDir),
    RemoveDir(ReqRemoveDir),
    CreateFile(ReqCreateFile),
    DeleteFile(ReqDeleteFile),
    ChangeFileSize(ReqChangeFileSize),
    GetFileSize(ReqFileId),
    GetFileInfo(ReqFileId),
    GetFileAttr(ReqFileId),
    GetFreeSpace,
    MoveFile(ReqMoveFile),
}

pub struct ControlPlaneRequest {
    pub op: ControlPlaneOp,
    pub slot: Arc<CtrlResponseSlot>,
}

/// What the engine stages into a slot before submission: the decoded
/// request header and the splittable byte range the service reads a write
/// payload from or deposits read bytes into.
#[derive(Debug, Clone)]
pub struct SlotRequest {
    pub header: BuffReqHeader,
    pub is_read: bool,
    pub data: SplittableBuffer,
}

/// One in-flight data-plane request context.
///
/// The engine fills `request` and resets `result` to `IO_PENDING` before
/// the slot is submitted (the submission channel provides the
/// happens-before edge); the service reads `request`, does the I/O, and
/// completes the slot. A slot is recycled only after the completion sweep
/// has consumed it, so the service must not touch a slot after completing
/// it.
pub struct DataPlaneSlot {
    request: UnsafeCell<Option<SlotRequest>>,
    result: AtomicU32,
    bytes_serviced: AtomicU32,
}

unsafe impl Sync for DataPlaneSlot {}

impl DataPlaneSlot {
    fn new() -> Self {
        DataPlaneSlot {
            request: UnsafeCell::new(None),
            result: AtomicU32::new(code::SUCCESS),
            bytes_serviced: AtomicU32::new(0),
        }
    }

    /// Engine side: stage a request into the slot.
    pub(crate) fn prepare(&self, req: SlotRequest) {
        unsafe { *self.request.get() = Some(req) };
        self.bytes_serviced.store(0, Ordering::Relaxed);
        self.result.store(code::IO_PENDING, Ordering::Release);
    }

    /// Service side: the staged request.
    pub fn request(&self) -> &SlotRequest {
        unsafe { (*self.request.get()).as_ref().expect("slot submitted without a request") }
    }

    /// Service side: finish the slot. `result` is stored last.
    pub fn complete(&self, result: ErrorCode, bytes_serviced: u32) {
        self.bytes_serviced.store(bytes_serviced, Ordering::Relaxed);
        self.result.store(result, Ordering::Release);
    }

    #[inline]
    pub fn result(&self) -> ErrorCode {
        self.result.load(Ordering::Acquire)
    }

    #[inline]
    pub fn bytes_serviced(&self) -> u32 {
        self.bytes_serviced.load(Ordering::Relaxed)
    }
}

/// Fixed pool of data-plane contexts, cycled modulo its size.
pub struct RequestContextArena {
    slots: Box<[DataPlaneSlot]>,
}

impl RequestContextArena {
    pub fn new(size: usize) -> Arc<Self> {
        let slots: Vec<DataPlaneSlot> = (0..size).map(|_| DataPlaneSlot::new()).collect();
        Arc::new(RequestContextArena {
            slots: slots.into_boxed_slice(),
        })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn slot(&self, index: u16) -> &DataPlaneSlot {
        &self.slots[index as usize]
    }
}

/// An `(arena, first_index, count)` batch submitted in one call; indices
/// wrap modulo the arena size.
#[derive(Clone)]
pub struct DataPlaneBatch {
    pub arena: Arc<RequestContextArena>,
    pub first_index: u16,
    pub count: u16,
}

impl DataPlaneBatch {
    pub fn slots(&self) -> impl Iterator<Item = (u16, &DataPlaneSlot)> {
        let len = self.arena.len() as u16;
        let first = self.first_index;
        (0..self.count).map(move |i| {
            let idx = (first + i) % len;
            (idx, self.arena.slot(idx))
        })
    }
}

/// The storage collaborator. Implementations run on their own thread (an
/// SPDK reactor in production, [`crate::memfs::MemoryFileService`] here)
/// and must be non-blocking on the submission path.
pub trait FileService: Send + Sync {
    fn submit_control_plane(&self, req: ControlPlaneRequest);
    fn submit_data_plane(&self, batch: DataPlaneBatch);
}

/// Test double that parks every submission until the caller completes it,
/// for exercising `IO_PENDING` gating deterministically.
#[derive(Default)]
pub struct ManualFileService {
    ctrl: Mutex<Vec<ControlPlaneRequest>>,
    data: Mutex<Vec<DataPlaneBatch>>,
}

impl ManualFileService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_ctrl(&self) -> Vec<ControlPlaneRequest> {
        std::mem::take(&mut self.ctrl.lock().unwrap())
    }

    pub fn take_data(&self) -> Vec<DataPlaneBatch> {
        std::mem::take(&mut self.data.lock().unwrap())
    }

    pub fn pending_data(&self) -> usize {
        self.data.lock().unwrap().len()
    }
}

impl FileService for ManualFileService {
    fn submit_control_plane(&self, req: ControlPlaneRequest) {
        self.ctrl.lock().unwrap().push(req);
    }

    fn submit_data_plane(&self, batch: DataPlaneBatch) {
        self.data.lock().unwrap().push(batch);
    }
}
