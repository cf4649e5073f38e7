//! In-memory file service.
//!
//! A [`FileService`] backed by process memory: a file table keyed by file
//! id, a directory table, and a byte store per file. It runs its own
//! worker thread and talks to the engine only through submission channels
//! and slot result words, the same contract an SPDK-backed service would
//! honor. The shared cache table memoizes file properties on the data
//! path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Receiver, Sender};
use dashmap::DashMap;
use fnv::FnvBuildHasher;
use log::{debug, info, warn};

use dstore_wire::ctrl::FileProperties;
use dstore_wire::{code, DirId, ErrorCode, FileId, FileSize, DIR_ROOT};

use crate::cache::{CacheItem, CacheTable, CACHE_VALUE_SIZE};
use crate::fs::{
    ControlPlaneOp, ControlPlaneRequest, CtrlPayload, DataPlaneBatch, FileService,
};

enum Submission {
    Ctrl(ControlPlaneRequest),
    Data(DataPlaneBatch),
    Shutdown,
}

struct FileRecord {
    name: String,
    dir: DirId,
    attributes: u32,
    data: Vec<u8>,
}

struct DirRecord {
    #[allow(dead_code)]
    name: String,
    parent: DirId,
}

struct Store {
    files: DashMap<FileId, FileRecord, FnvBuildHasher>,
    dirs: DashMap<DirId, DirRecord, FnvBuildHasher>,
    used: AtomicU64,
    capacity: u64,
    cache: Arc<CacheTable>,
}

pub struct MemoryFileService {
    tx: Sender<Submission>,
    worker: Option<JoinHandle<()>>,
}

impl MemoryFileService {
    pub fn start(capacity: u64, cache: Arc<CacheTable>) -> Self {
        let (tx, rx) = unbounded();
        let store = Store {
            files: DashMap::default(),
            dirs: DashMap::default(),
            used: AtomicU64::new(0),
            capacity,
            cache,
        };
        store.dirs.insert(
            DIR_ROOT,
            DirRecord {
                name: "/".to_string(),
                parent: DIR_ROOT,
            },
        );
        let worker = std::thread::Builder::new()
            .name("dstore-fs".to_string())
            .spawn(move || run_worker(rx, store))
            .expect("failed to spawn file-service thread");
        MemoryFileService {
            tx,
            worker: Some(worker),
        }
    }
}

impl Drop for MemoryFileService {
    fn drop(&mut self) {
        let _ = self.tx.send(Submission::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl FileService for MemoryFileService {
    fn submit_control_plane(&self, req: ControlPlaneRequest) {
        let _ = self.tx.send(Submission::Ctrl(req));
    }

    fn submit_data_plane(&self, batch: DataPlaneBatch) {
        let _ = self.tx.send(Submission::Data(batch));
    }
}

fn run_worker(rx: Receiver<Submission>, store: Store) {
    info!("file service up, capacity {} bytes", store.capacity);
    while let Ok(submission) = rx.recv() {
        match submission {
            Submission::Ctrl(req) => {
                let (result, payload) = store.control_plane(&req.op);
                req.slot.complete(result, payload);
            }
            Submission::Data(batch) => store.data_plane(&batch),
            Submission::Shutdown => break,
        }
    }
    info!("file service down");
}

fn props_value(props: &FileProperties) -> [u8; CACHE_VALUE_SIZE] {
    let mut value = [0u8; CACHE_VALUE_SIZE];
    unsafe {
        std::ptr::copy_nonoverlapping(
            props as *const FileProperties as *const u8,
            value.as_mut_ptr(),
            CACHE_VALUE_SIZE,
        )
    };
    value
}

impl Store {
    fn control_plane(&self, op: &ControlPlaneOp) -> (ErrorCode, CtrlPayload) {
        match op {
            ControlPlaneOp::CreateDir(r) => {
                if self.dirs.contains_key(&r.dir_id) {
                    return (code::DIR_EXISTS, CtrlPayload::None);
                }
                if !self.dirs.contains_key(&r.parent_id) {
                    return (code::DIR_NOT_FOUND, CtrlPayload::None);
                }
                self.dirs.insert(
                    r.dir_id,
                    DirRecord {
                        name: r.path_name.as_str().to_string(),
                        parent: r.parent_id,
                    },
                );
                (code::SUCCESS, CtrlPayload::None)
            }
            ControlPlaneOp::RemoveDir(r) => {
                if r.dir_id == DIR_ROOT {
                    return (code::INVALID_ARGS, CtrlPayload::None);
                }
                if !self.dirs.contains_key(&r.dir_id) {
                    return (code::DIR_NOT_FOUND, CtrlPayload::None);
                }
                let occupied = self.files.iter().any(|f| f.dir == r.dir_id)
                    || self.dirs.iter().any(|d| d.parent == r.dir_id);
                if occupied {
                    return (code::DIR_NOT_EMPTY, CtrlPayload::None);
                }
                self.dirs.remove(&r.dir_id);
                (code::SUCCESS, CtrlPayload::None)
            }
            ControlPlaneOp::CreateFile(r) => {
                if !self.dirs.contains_key(&r.dir_id) {
                    return (code::DIR_NOT_FOUND, CtrlPayload::None);
                }
                if self.files.contains_key(&r.file_id) {
                    return (code::FILE_EXISTS, CtrlPayload::None);
                }
                debug!("create file #{} ({:?})", r.file_id, r.file_name.as_str());
                self.files.insert(
                    r.file_id,
                    FileRecord {
                        name: r.file_name.as_str().to_string(),
                        dir: r.dir_id,
                        attributes: r.file_attributes,
                        data: Vec::new(),
                    },
                );
                self.cache_props(r.file_id, r.file_attributes, 0);
                (code::SUCCESS, CtrlPayload::None)
            }
            ControlPlaneOp::DeleteFile(r) => match self.files.remove(&r.file_id) {
                Some((_, record)) => {
                    self.used.fetch_sub(record.data.len() as u64, Ordering::Relaxed);
                    self.cache.delete(r.file_id as u64);
                    (code::SUCCESS, CtrlPayload::None)
                }
                None => (code::FILE_NOT_FOUND, CtrlPayload::None),
            },
            ControlPlaneOp::ChangeFileSize(r) => {
                let mut file = match self.files.get_mut(&r.file_id) {
                    Some(f) => f,
                    None => return (code::FILE_NOT_FOUND, CtrlPayload::None),
                };
                let old = file.data.len() as u64;
                if r.new_size > old {
                    let grow = r.new_size - old;
                    if self.used.load(Ordering::Relaxed) + grow > self.capacity {
                        return (code::NO_SPACE, CtrlPayload::None);
                    }
                    self.used.fetch_add(grow, Ordering::Relaxed);
                } else {
                    self.used.fetch_sub(old - r.new_size, Ordering::Relaxed);
                }
                file.data.resize(r.new_size as usize, 0);
                let attributes = file.attributes;
                drop(file);
                self.cache_props(r.file_id, attributes, r.new_size);
                (code::SUCCESS, CtrlPayload::None)
            }
            ControlPlaneOp::GetFileSize(r) => match self.files.get(&r.file_id) {
                Some(f) => (code::SUCCESS, CtrlPayload::FileSize(f.data.len() as FileSize)),
                None => (code::FILE_NOT_FOUND, CtrlPayload::FileSize(0)),
            },
            ControlPlaneOp::GetFileInfo(r) => match self.files.get(&r.file_id) {
                Some(f) => (
                    code::SUCCESS,
                    CtrlPayload::FileInfo(FileProperties::new(f.attributes, f.data.len() as FileSize)),
                ),
                None => (code::FILE_NOT_FOUND, CtrlPayload::FileInfo(FileProperties::new(0, 0))),
            },
            ControlPlaneOp::GetFileAttr(r) => match self.files.get(&r.file_id) {
                Some(f) => (code::SUCCESS, CtrlPayload::FileAttr(f.attributes)),
                None => (code::FILE_NOT_FOUND, CtrlPayload::FileAttr(0)),
            },
            ControlPlaneOp::GetFreeSpace => {
                let free = self.capacity - self.used.load(Ordering::Relaxed);
                (code::SUCCESS, CtrlPayload::FreeSpace(free))
            }
            ControlPlaneOp::MoveFile(r) => match self.files.get_mut(&r.file_id) {
                Some(mut f) => {
                    f.name = r.new_name.as_str().to_string();
                    (code::SUCCESS, CtrlPayload::None)
                }
                None => (code::FILE_NOT_FOUND, CtrlPayload::None),
            },
        }
    }

    fn cache_props(&self, file_id: FileId, attributes: u32, size: FileSize) {
        let props = FileProperties::new(attributes, size);
        let item = CacheItem::new(file_id as u64, props_value(&props));
        if self.cache.insert(&item).is_err() {
            // advisory cache: a full table only costs lookups
            warn!("cache table full while caching file #{}", file_id);
        }
    }

    fn data_plane(&self, batch: &DataPlaneBatch) {
        for (_, slot) in batch.slots() {
            let req = slot.request();
            let (result, bytes) = if req.is_read {
                self.read_file(req)
            } else {
                self.write_file(req)
            };
            slot.complete(result, bytes);
        }
    }

    fn read_file(&self, req: &crate::fs::SlotRequest) -> (ErrorCode, u32) {
        let header = &req.header;
        // a cache hit answers the bounds check without touching the table
        if self.cache.lookup(header.file_id as u64).is_none() {
            if !self.files.contains_key(&header.file_id) {
                return (code::FILE_NOT_FOUND, 0);
            }
        }
        let file = match self.files.get(&header.file_id) {
            Some(f) => f,
            None => return (code::FILE_NOT_FOUND, 0),
        };
        let offset = header.offset as usize;
        let len = header.bytes as usize;
        if offset + len > file.data.len() {
            return (code::READ_OVERFLOW, 0);
        }
        req.data.copy_from(&file.data[offset..offset + len]);
        (code::SUCCESS, len as u32)
    }

    fn write_file(&self, req: &crate::fs::SlotRequest) -> (ErrorCode, u32) {
        let header = &req.header;
        let mut file = match self.files.get_mut(&header.file_id) {
            Some(f) => f,
            None => return (code::FILE_NOT_FOUND, 0),
        };
        let offset = header.offset as usize;
        let len = header.bytes as usize;
        let end = offset + len;
        if end > file.data.len() {
            let grow = (end - file.data.len()) as u64;
            if self.used.load(Ordering::Relaxed) + grow > self.capacity {
                return (code::NO_SPACE, 0);
            }
            self.used.fetch_add(grow, Ordering::Relaxed);
            file.data.resize(end, 0);
        }
        req.data.copy_to(&mut file.data[offset..end]);
        let attributes = file.attributes;
        let size = file.data.len() as FileSize;
        drop(file);
        self.cache_props(header.file_id, attributes, size);
        (code::SUCCESS, len as u32)
    }
}
