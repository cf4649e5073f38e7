//! Control-plane messages.
//!
//! Every control message is a [`MsgHeader`] followed by a kind-specific
//! payload, carried in a fixed [`CTRL_MSG_SIZE`] buffer. Acks use the
//! request id with the high bit of the low byte set ([`ACK_BIT`]).

use std::mem;

use crate::{
    read_pod, write_pod, AccessToken, DirId, ErrorCode, FileAttributes, FileId, FileSize,
    RingSize, WireError, FILE_NAME_MAX,
};

pub const CTRL_MSG_SIZE: usize = 256;

pub const ACK_BIT: u32 = 0x80;

pub const F2B_REQUEST_ID: u32 = 0x01;
pub const F2B_TERMINATE: u32 = 0x02;
pub const F2B_REQ_CREATE_DIR: u32 = 0x0E;
pub const F2B_REQ_REMOVE_DIR: u32 = 0x0F;
pub const F2B_REQ_CREATE_FILE: u32 = 0x10;
pub const F2B_REQ_DELETE_FILE: u32 = 0x11;
pub const F2B_REQ_CHANGE_FILE_SIZE: u32 = 0x12;
pub const F2B_REQ_GET_FILE_SIZE: u32 = 0x13;
pub const F2B_REQ_GET_FILE_INFO: u32 = 0x14;
pub const F2B_REQ_GET_FILE_ATTR: u32 = 0x15;
pub const F2B_REQ_GET_FREE_SPACE: u32 = 0x16;
pub const F2B_REQ_MOVE_FILE: u32 = 0x17;

pub const B2F_RESPOND_ID: u32 = F2B_REQUEST_ID | ACK_BIT;
pub const B2F_ACK_CREATE_DIR: u32 = F2B_REQ_CREATE_DIR | ACK_BIT;
pub const B2F_ACK_REMOVE_DIR: u32 = F2B_REQ_REMOVE_DIR | ACK_BIT;
pub const B2F_ACK_CREATE_FILE: u32 = F2B_REQ_CREATE_FILE | ACK_BIT;
pub const B2F_ACK_DELETE_FILE: u32 = F2B_REQ_DELETE_FILE | ACK_BIT;
pub const B2F_ACK_CHANGE_FILE_SIZE: u32 = F2B_REQ_CHANGE_FILE_SIZE | ACK_BIT;
pub const B2F_ACK_GET_FILE_SIZE: u32 = F2B_REQ_GET_FILE_SIZE | ACK_BIT;
pub const B2F_ACK_GET_FILE_INFO: u32 = F2B_REQ_GET_FILE_INFO | ACK_BIT;
pub const B2F_ACK_GET_FILE_ATTR: u32 = F2B_REQ_GET_FILE_ATTR | ACK_BIT;
pub const B2F_ACK_GET_FREE_SPACE: u32 = F2B_REQ_GET_FREE_SPACE | ACK_BIT;
pub const B2F_ACK_MOVE_FILE: u32 = F2B_REQ_MOVE_FILE | ACK_BIT;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MsgHeader {
    pub msg_id: u32,
}

pub const MSG_HEADER_SIZE: usize = mem::size_of::<MsgHeader>();

/// A NUL-padded fixed-size name field.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct NameBuf(pub [u8; FILE_NAME_MAX]);

impl NameBuf {
    pub fn from_str(s: &str) -> Self {
        let mut buf = [0u8; FILE_NAME_MAX];
        let n = s.len().min(FILE_NAME_MAX - 1);
        buf[..n].copy_from_slice(&s.as_bytes()[..n]);
        NameBuf(buf)
    }

    pub fn as_str(&self) -> &str {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(FILE_NAME_MAX);
        std::str::from_utf8(&self.0[..end]).unwrap_or("")
    }
}

impl std::fmt::Debug for NameBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct FileProperties {
    pub attributes: FileAttributes,
    _pad: u32,
    pub size: FileSize,
    pub creation_time: u64,
    pub last_access_time: u64,
    pub last_write_time: u64,
}

impl FileProperties {
    pub fn new(attributes: FileAttributes, size: FileSize) -> Self {
        FileProperties {
            attributes,
            _pad: 0,
            size,
            creation_time: 0,
            last_access_time: 0,
            last_write_time: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqTerminate {
    pub client_id: u16,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqCreateDir {
    pub dir_id: DirId,
    pub parent_id: DirId,
    pub path_name: NameBuf,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqRemoveDir {
    pub dir_id: DirId,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqCreateFile {
    pub file_id: FileId,
    pub dir_id: DirId,
    pub file_attributes: FileAttributes,
    pub file_name: NameBuf,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqDeleteFile {
    pub file_id: FileId,
    pub dir_id: DirId,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqChangeFileSize {
    pub file_id: FileId,
    _pad: [u16; 3],
    pub new_size: FileSize,
}

impl ReqChangeFileSize {
    pub fn new(file_id: FileId, new_size: FileSize) -> Self {
        ReqChangeFileSize {
            file_id,
            _pad: [0; 3],
            new_size,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqFileId {
    pub file_id: FileId,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ReqMoveFile {
    pub file_id: FileId,
    pub new_name: NameBuf,
}

/// Handshake payload on a buffer connection: the host reports its ring
/// buffer address, per-ring capacity, and the rkey the DPU uses for DMA.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BuffRequestId {
    pub client_id: u16,
    _pad: u16,
    pub capacity: RingSize,
    pub buffer_address: u64,
    pub access_token: AccessToken,
    _pad2: u32,
}

impl BuffRequestId {
    pub fn new(client_id: u16, capacity: RingSize, buffer_address: u64, access_token: AccessToken) -> Self {
        BuffRequestId {
            client_id,
            _pad: 0,
            capacity,
            buffer_address,
            access_token,
            _pad2: 0,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BuffRelease {
    pub client_id: u16,
    pub buffer_id: u16,
}

/// A decoded control-connection request.
#[derive(Debug, Clone, Copy)]
pub enum CtrlRequest {
    RequestId,
    Terminate(ReqTerminate),
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

impl CtrlRequest {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (msg_id, payload) = split_header(buf)?;
        let req = match msg_id {
            F2B_REQUEST_ID => CtrlRequest::RequestId,
            F2B_TERMINATE => CtrlRequest::Terminate(decode_payload(payload)?),
            F2B_REQ_CREATE_DIR => CtrlRequest::CreateDir(decode_payload(payload)?),
            F2B_REQ_REMOVE_DIR => CtrlRequest::RemoveDir(decode_payload(payload)?),
            F2B_REQ_CREATE_FILE => CtrlRequest::CreateFile(decode_payload(payload)?),
            F2B_REQ_DELETE_FILE => CtrlRequest::DeleteFile(decode_payload(payload)?),
            F2B_REQ_CHANGE_FILE_SIZE => CtrlRequest::ChangeFileSize(decode_payload(payload)?),
            F2B_REQ_GET_FILE_SIZE => CtrlRequest::GetFileSize(decode_payload(payload)?),
            F2B_REQ_GET_FILE_INFO => CtrlRequest::GetFileInfo(decode_payload(payload)?),
            F2B_REQ_GET_FILE_ATTR => CtrlRequest::GetFileAttr(decode_payload(payload)?),
            F2B_REQ_GET_FREE_SPACE => CtrlRequest::GetFreeSpace,
            F2B_REQ_MOVE_FILE => CtrlRequest::MoveFile(decode_payload(payload)?),
            other => return Err(WireError::UnknownMsgId(other)),
        };
        Ok(req)
    }

    /// The msg id of the ack this request expects.
    pub fn ack_id(&self) -> u32 {
        match self {
            CtrlRequest::RequestId => B2F_RESPOND_ID,
            CtrlRequest::Terminate(_) => 0,
            CtrlRequest::CreateDir(_) => B2F_ACK_CREATE_DIR,
            CtrlRequest::RemoveDir(_) => B2F_ACK_REMOVE_DIR,
            CtrlRequest::CreateFile(_) => B2F_ACK_CREATE_FILE,
            CtrlRequest::DeleteFile(_) => B2F_ACK_DELETE_FILE,
            CtrlRequest::ChangeFileSize(_) => B2F_ACK_CHANGE_FILE_SIZE,
            CtrlRequest::GetFileSize(_) => B2F_ACK_GET_FILE_SIZE,
            CtrlRequest::GetFileInfo(_) => B2F_ACK_GET_FILE_INFO,
            CtrlRequest::GetFileAttr(_) => B2F_ACK_GET_FILE_ATTR,
            CtrlRequest::GetFreeSpace => B2F_ACK_GET_FREE_SPACE,
            CtrlRequest::MoveFile(_) => B2F_ACK_MOVE_FILE,
        }
    }
}

/// A decoded buffer-connection request.
#[derive(Debug, Clone, Copy)]
pub enum BuffRequest {
    RequestId(BuffRequestId),
    Release(BuffRelease),
}

impl BuffRequest {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        let (msg_id, payload) = split_header(buf)?;
        match msg_id {
            F2B_REQUEST_ID => Ok(BuffRequest::RequestId(decode_payload(payload)?)),
            F2B_TERMINATE => Ok(BuffRequest::Release(decode_payload(payload)?)),
            other => Err(WireError::UnknownMsgId(other)),
        }
    }
}

/// Ack payloads. The `result` field comes first in every ack so a pending
/// response can be polled through its leading error-code word.
#[derive(Debug, Clone, Copy)]
pub enum CtrlAck {
    RespondId { client_id: u16 },
    Result { result: ErrorCode },
    FileSize { result: ErrorCode, file_size: FileSize },
    FileInfo { result: ErrorCode, properties: FileProperties },
    FileAttr { result: ErrorCode, attributes: FileAttributes },
    FreeSpace { result: ErrorCode, free_space: FileSize },
    BuffRespondId { buffer_id: u16 },
}

impl CtrlAck {
    /// Serializes `msg_id` and this payload; returns the total message size.
    pub fn encode_into(&self, msg_id: u32, buf: &mut [u8]) -> usize {
        assert!(buf.len() >= CTRL_MSG_SIZE);
        write_pod(buf, &MsgHeader { msg_id });
        let payload = &mut buf[MSG_HEADER_SIZE..];
        let n = match *self {
            CtrlAck::RespondId { client_id } => {
                write_pod(payload, &client_id);
                mem::size_of::<u16>()
            }
            CtrlAck::BuffRespondId { buffer_id } => {
                write_pod(payload, &buffer_id);
                mem::size_of::<u16>()
            }
            CtrlAck::Result { result } => {
                write_pod(payload, &result);
                mem::size_of::<ErrorCode>()
            }
            CtrlAck::FileSize { result, file_size } => {
                write_pod(payload, &AckU64 { result, _pad: 0, value: file_size });
                mem::size_of::<AckU64>()
            }
            CtrlAck::FreeSpace { result, free_space } => {
                write_pod(payload, &AckU64 { result, _pad: 0, value: free_space });
                mem::size_of::<AckU64>()
            }
            CtrlAck::FileAttr { result, attributes } => {
                write_pod(payload, &AckAttr { result, attributes });
                mem::size_of::<AckAttr>()
            }
            CtrlAck::FileInfo { result, properties } => {
                write_pod(payload, &AckInfo { result, _pad: 0, properties });
                mem::size_of::<AckInfo>()
            }
        };
        MSG_HEADER_SIZE + n
    }

    /// Decodes an ack given the received msg id.
    pub fn decode(buf: &[u8]) -> Result<(u32, Self), WireError> {
        let (msg_id, payload) = split_header(buf)?;
        let ack = match msg_id {
            B2F_RESPOND_ID => CtrlAck::RespondId { client_id: decode_payload(payload)? },
            B2F_ACK_GET_FILE_SIZE => {
                let a: AckU64 = decode_payload(payload)?;
                CtrlAck::FileSize { result: a.result, file_size: a.value }
            }
            B2F_ACK_GET_FREE_SPACE => {
                let a: AckU64 = decode_payload(payload)?;
                CtrlAck::FreeSpace { result: a.result, free_space: a.value }
            }
            B2F_ACK_GET_FILE_ATTR => {
                let a: AckAttr = decode_payload(payload)?;
                CtrlAck::FileAttr { result: a.result, attributes: a.attributes }
            }
            B2F_ACK_GET_FILE_INFO => {
                let a: AckInfo = decode_payload(payload)?;
                CtrlAck::FileInfo { result: a.result, properties: a.properties }
            }
            id if id & ACK_BIT != 0 => CtrlAck::Result { result: decode_payload(payload)? },
            other => return Err(WireError::UnknownMsgId(other)),
        };
        Ok((msg_id, ack))
    }
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AckU64 {
    result: ErrorCode,
    _pad: u32,
    value: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AckAttr {
    result: ErrorCode,
    attributes: FileAttributes,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct AckInfo {
    result: ErrorCode,
    _pad: u32,
    properties: FileProperties,
}

/// Encodes a request message; the host side of the handshake uses this, and
/// tests drive the dispatcher with it.
pub fn encode_request(msg_id: u32, payload: Option<&[u8]>, buf: &mut [u8]) -> usize {
    assert!(buf.len() >= CTRL_MSG_SIZE);
    write_pod(buf, &MsgHeader { msg_id });
    let mut len = MSG_HEADER_SIZE;
    if let Some(p) = payload {
        buf[len..len + p.len()].copy_from_slice(p);
        len += p.len();
    }
    len
}

/// Returns the raw bytes of a POD payload struct.
pub fn payload_bytes<T: Copy>(val: &T) -> &[u8] {
    unsafe { std::slice::from_raw_parts(val as *const T as *const u8, mem::size_of::<T>()) }
}

fn split_header(buf: &[u8]) -> Result<(u32, &[u8]), WireError> {
    if buf.len() < MSG_HEADER_SIZE {
        return Err(WireError::Truncated(buf.len()));
    }
    let header: MsgHeader = unsafe { read_pod(buf) };
    Ok((header.msg_id, &buf[MSG_HEADER_SIZE..]))
}

fn decode_payload<T: Copy>(payload: &[u8]) -> Result<T, WireError> {
    if payload.len() < mem::size_of::<T>() {
        return Err(WireError::Truncated(payload.len()));
    }
    Ok(unsafe { read_pod(payload) })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{code, DIR_ROOT};

    #[test]
    fn layouts_are_fixed() {
        assert_eq!(mem::size_of::<MsgHeader>(), 4);
        assert_eq!(mem::size_of::<FileProperties>(), 40);
        assert_eq!(mem::size_of::<BuffRequestId>(), 24);
        assert_eq!(mem::size_of::<ReqCreateFile>(), 8 + FILE_NAME_MAX);
        assert_eq!(mem::size_of::<ReqChangeFileSize>(), 16);
    }

    #[test]
    fn request_round_trip() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let req = ReqCreateFile {
            file_id: 42,
            dir_id: 0,
            file_attributes: 0,
            file_name: NameBuf::from_str("x"),
        };
        let n = encode_request(F2B_REQ_CREATE_FILE, Some(payload_bytes(&req)), &mut buf);
        assert!(n <= CTRL_MSG_SIZE);

        match CtrlRequest::decode(&buf).unwrap() {
            CtrlRequest::CreateFile(r) => {
                assert_eq!(r.file_id, 42);
                assert_eq!(r.dir_id, DIR_ROOT);
                assert_eq!(r.file_name.as_str(), "x");
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn ack_round_trip() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        let ack = CtrlAck::FileSize { result: code::SUCCESS, file_size: 1 << 30 };
        let n = ack.encode_into(B2F_ACK_GET_FILE_SIZE, &mut buf);
        assert_eq!(n, MSG_HEADER_SIZE + 16);

        let (id, decoded) = CtrlAck::decode(&buf).unwrap();
        assert_eq!(id, B2F_ACK_GET_FILE_SIZE);
        match decoded {
            CtrlAck::FileSize { result, file_size } => {
                assert_eq!(result, code::SUCCESS);
                assert_eq!(file_size, 1 << 30);
            }
            other => panic!("decoded {:?}", other),
        }
    }

    #[test]
    fn unknown_id_is_rejected() {
        let mut buf = [0u8; CTRL_MSG_SIZE];
        encode_request(0x7F, None, &mut buf);
        assert!(matches!(CtrlRequest::decode(&buf), Err(WireError::UnknownMsgId(0x7F))));
    }
}
