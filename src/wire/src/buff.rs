//! Ring-buffer record framing.
//!
//! Every request and response record starts with a [`FileIoSize`] size
//! prefix covering the whole record. Requests carry a [`BuffReqHeader`];
//! a record no larger than the bare header is a read, anything larger is a
//! write whose payload trails the header. Responses carry a
//! [`BuffAckHeader`] and, for reads only, the serviced payload.

use std::mem;

use crate::{ErrorCode, FileId, FileIoSize, RequestId, WireError};

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BuffReqHeader {
    pub request_id: RequestId,
    pub file_id: FileId,
    pub bytes: FileIoSize,
    pub offset: u64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BuffAckHeader {
    pub request_id: RequestId,
    pub result: u16,
    pub bytes_serviced: FileIoSize,
}

pub const SIZE_PREFIX: usize = mem::size_of::<FileIoSize>();
pub const REQ_HEADER_SIZE: usize = mem::size_of::<BuffReqHeader>();
pub const ACK_HEADER_SIZE: usize = mem::size_of::<BuffAckHeader>();

/// A read request is exactly a size prefix plus a request header.
pub const READ_RECORD_SIZE: FileIoSize = (SIZE_PREFIX + REQ_HEADER_SIZE) as FileIoSize;

/// Response records and request records are padded to a multiple of this,
/// so reserving one aligned unit is always enough for a bare ack.
pub const RESPONSE_ALIGNMENT: FileIoSize = (SIZE_PREFIX + ACK_HEADER_SIZE) as FileIoSize;

/// The framing slot reserved at the start of every response batch: one
/// aligned unit for `(u32 batch_total_bytes, BuffAckHeader)` plus one pad
/// unit. `batch_total_bytes` counts the slot itself.
pub const BATCH_META_BYTES: FileIoSize = 2 * RESPONSE_ALIGNMENT;

/// Rounds a record size up to the response alignment.
#[inline]
pub const fn align_record(size: FileIoSize) -> FileIoSize {
    let rem = size % RESPONSE_ALIGNMENT;
    if rem == 0 {
        size
    } else {
        size + (RESPONSE_ALIGNMENT - rem)
    }
}

/// Size of the ring record for a write carrying `payload` bytes.
#[inline]
pub const fn write_record_size(payload: FileIoSize) -> FileIoSize {
    align_record(READ_RECORD_SIZE + payload)
}

/// Size of the response record for a read returning `bytes` of payload.
#[inline]
pub const fn read_response_size(bytes: FileIoSize) -> FileIoSize {
    align_record(RESPONSE_ALIGNMENT + bytes)
}

/// Size of the response record acknowledging a write.
pub const WRITE_ACK_SIZE: FileIoSize = RESPONSE_ALIGNMENT;

/// A request record parsed out of the staging mirror.
#[derive(Debug, Clone, Copy)]
pub struct ParsedRecord {
    pub header: BuffReqHeader,
    /// Total record size including prefix and padding.
    pub size: FileIoSize,
    pub is_read: bool,
}

impl ParsedRecord {
    /// Parses the record whose size prefix sits at `at` in `mirror`, a
    /// staging buffer mirroring the whole ring arena. The header may wrap
    /// around the arena end.
    pub fn parse(mirror: &[u8], at: usize) -> Result<Self, WireError> {
        let capacity = mirror.len();
        let size = read_wrapped::<FileIoSize>(mirror, at);
        if size < READ_RECORD_SIZE || size as usize > capacity {
            return Err(WireError::Malformed("record size out of range"));
        }
        // Reads are exactly the bare header; write records are padded to
        // the response alignment by the producer.
        if size != READ_RECORD_SIZE && size % RESPONSE_ALIGNMENT != 0 {
            return Err(WireError::Malformed("record size not aligned"));
        }
        let header = read_wrapped::<BuffReqHeader>(mirror, (at + SIZE_PREFIX) % capacity);
        let is_read = size == READ_RECORD_SIZE;
        if is_read {
            // the response (header, payload, padding, batch slot) must be
            // representable on a ring of this capacity
            if header.bytes as usize + BATCH_META_BYTES as usize + RESPONSE_ALIGNMENT as usize
                >= capacity
            {
                return Err(WireError::Malformed("read larger than the ring"));
            }
        } else if header.bytes + READ_RECORD_SIZE > size {
            return Err(WireError::Malformed("write payload exceeds its record"));
        }
        Ok(ParsedRecord {
            header,
            size,
            is_read,
        })
    }
}

/// Reads a POD value at `at`, copying across the wrap if the value
/// straddles the arena end.
pub fn read_wrapped<T: Copy>(mirror: &[u8], at: usize) -> T {
    let n = mem::size_of::<T>();
    let capacity = mirror.len();
    debug_assert!(n <= capacity && n <= 64);
    if at + n <= capacity {
        unsafe { crate::read_pod(&mirror[at..]) }
    } else {
        let mut tmp = [0u8; 64];
        let first = capacity - at;
        tmp[..first].copy_from_slice(&mirror[at..]);
        tmp[first..n].copy_from_slice(&mirror[..n - first]);
        unsafe { crate::read_pod(&tmp[..n]) }
    }
}

/// Writes a POD value at `at`, splitting across the wrap if needed.
pub fn write_wrapped<T: Copy>(mirror: &mut [u8], at: usize, val: &T) {
    let n = mem::size_of::<T>();
    let capacity = mirror.len();
    debug_assert!(n <= capacity);
    let bytes = unsafe { std::slice::from_raw_parts(val as *const T as *const u8, n) };
    if at + n <= capacity {
        mirror[at..at + n].copy_from_slice(bytes);
    } else {
        let first = capacity - at;
        mirror[at..].copy_from_slice(&bytes[..first]);
        mirror[..n - first].copy_from_slice(&bytes[first..]);
    }
}

/// Encodes a write request record at `at` in a ring arena; used by the
/// host side of the protocol and by tests. Returns the padded record size.
pub fn encode_write_request(
    arena: &mut [u8],
    at: usize,
    request_id: RequestId,
    file_id: FileId,
    offset: u64,
    payload: &[u8],
) -> FileIoSize {
    let size = write_record_size(payload.len() as FileIoSize);
    let header = BuffReqHeader {
        request_id,
        file_id,
        bytes: payload.len() as FileIoSize,
        offset,
    };
    let capacity = arena.len();
    write_wrapped(arena, at, &size);
    write_wrapped(arena, (at + SIZE_PREFIX) % capacity, &header);
    let mut pos = (at + SIZE_PREFIX + REQ_HEADER_SIZE) % capacity;
    for &b in payload {
        arena[pos] = b;
        pos = (pos + 1) % capacity;
    }
    size
}

/// Encodes a read request record at `at`. Returns the record size.
pub fn encode_read_request(
    arena: &mut [u8],
    at: usize,
    request_id: RequestId,
    file_id: FileId,
    offset: u64,
    bytes: FileIoSize,
) -> FileIoSize {
    let header = BuffReqHeader {
        request_id,
        file_id,
        bytes,
        offset,
    };
    let capacity = arena.len();
    write_wrapped(arena, at, &READ_RECORD_SIZE);
    write_wrapped(arena, (at + SIZE_PREFIX) % capacity, &header);
    READ_RECORD_SIZE
}

/// A response record read back out of a response arena.
#[derive(Debug, Clone, Copy)]
pub struct ParsedResponse {
    pub size: FileIoSize,
    pub request_id: RequestId,
    pub result: ErrorCode,
    pub bytes_serviced: FileIoSize,
    pub payload_at: usize,
}

impl ParsedResponse {
    pub fn parse(arena: &[u8], at: usize) -> Result<Self, WireError> {
        let capacity = arena.len();
        let size = read_wrapped::<FileIoSize>(arena, at);
        if size < RESPONSE_ALIGNMENT || size as usize > capacity {
            return Err(WireError::Malformed("response size out of range"));
        }
        let ack = read_wrapped::<BuffAckHeader>(arena, (at + SIZE_PREFIX) % capacity);
        Ok(ParsedResponse {
            size,
            request_id: ack.request_id,
            result: ack.result as ErrorCode,
            bytes_serviced: ack.bytes_serviced,
            payload_at: (at + SIZE_PREFIX + ACK_HEADER_SIZE) % capacity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_constants() {
        assert_eq!(REQ_HEADER_SIZE, 16);
        assert_eq!(ACK_HEADER_SIZE, 8);
        assert_eq!(READ_RECORD_SIZE, 20);
        assert_eq!(RESPONSE_ALIGNMENT, 12);
        assert_eq!(BATCH_META_BYTES, 24);
    }

    #[test]
    fn record_size_arithmetic() {
        // 16-byte write payload: 4 + 16 + 16 = 36, padded to 48
        assert_eq!(write_record_size(16), 48);
        // 8-byte read response: 12 + 8 = 20, padded to 24
        assert_eq!(read_response_size(8), 24);
        assert_eq!(WRITE_ACK_SIZE, 12);
        assert_eq!(align_record(12), 12);
    }

    #[test]
    fn parse_write_record() {
        let mut arena = vec![0u8; 4096];
        let payload = [0xAAu8; 16];
        let size = encode_write_request(&mut arena, 0, 7, 42, 0, &payload);
        assert_eq!(size, 48);

        let rec = ParsedRecord::parse(&arena, 0).unwrap();
        assert!(!rec.is_read);
        assert_eq!(rec.size, 48);
        assert_eq!(rec.header.request_id, 7);
        assert_eq!(rec.header.file_id, 42);
        assert_eq!(rec.header.bytes, 16);
    }

    #[test]
    fn parse_record_across_wrap() {
        let mut arena = vec![0u8; 4096];
        let payload = [0x5Au8; 28];
        let size = encode_write_request(&mut arena, 4080, 9, 3, 64, &payload);
        assert_eq!(size, 48);

        let rec = ParsedRecord::parse(&arena, 4080).unwrap();
        assert_eq!(rec.header.request_id, 9);
        assert_eq!(rec.header.bytes, 28);
        assert_eq!(rec.header.offset, 64);
    }

    #[test]
    fn bad_record_is_rejected() {
        let arena = vec![0u8; 256];
        assert!(ParsedRecord::parse(&arena, 0).is_err());
    }
}
