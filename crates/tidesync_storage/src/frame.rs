//! Checksummed frames.
//!
//! Layout: `[body_len: u32 LE][crc32(body): u32 LE][body]`.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Size of the frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 8;

/// Largest accepted frame body (64 MiB).
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Wraps a body in a frame.
pub(crate) fn encode(body: &[u8]) -> StorageResult<Vec<u8>> {
    if body.len() > MAX_FRAME_SIZE {
        return Err(StorageError::FrameTooLarge {
            size: body.len(),
            limit: MAX_FRAME_SIZE,
        });
    }

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&crc32fast::hash(body).to_le_bytes());
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Frames recovered from a backend.
#[derive(Debug, Default)]
pub(crate) struct Recovered {
    /// Bodies of all intact frames, in write order.
    pub bodies: Vec<Vec<u8>>,
    /// Offset just past the last intact frame.
    pub valid_len: u64,
}

/// Reads frames until the end of the backend or the first torn/corrupt frame.
pub(crate) fn recover(backend: &dyn StorageBackend) -> StorageResult<Recovered> {
    let size = backend.size()?;
    let mut recovered = Recovered::default();
    let mut offset = 0u64;

    while offset + FRAME_HEADER_SIZE as u64 <= size {
        let header = backend.read_at(offset, FRAME_HEADER_SIZE)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);

        let body_start = offset + FRAME_HEADER_SIZE as u64;
        if len > MAX_FRAME_SIZE || body_start + len as u64 > size {
            break;
        }

        let body = backend.read_at(body_start, len)?;
        if crc32fast::hash(&body) != crc {
            break;
        }

        recovered.bodies.push(body);
        offset = body_start + len as u64;
    }

    recovered.valid_len = offset;
    Ok(recovered)
}
