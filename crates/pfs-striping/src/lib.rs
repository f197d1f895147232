//! Striping-plan arithmetic.
//!
//! This crate is the bottom of the dependency order: it knows nothing about
//! RPCs, file records, or locking. It turns `(offset, num_bytes)` plus a
//! file's `(stripe_width, size, chunk presence)` into the ordered list of
//! per-chunk slices that cover the request.

use thiserror::Error;

/// One planned chunk-relative slice: which chunk, which server hosts it,
/// and the inclusive global byte range this chunk contributes to the plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_index: u64,
    pub server_index: u32,
    pub start: u64,
    pub end: u64,
}

impl ChunkPlan {
    /// Number of bytes this planned slice covers.
    pub fn byte_len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StripingError {
    #[error("write offset {offset} is past current end of file {size}")]
    WriteOffsetPastEof { offset: u64, size: u64 },
    #[error("stripe width must be at least 1")]
    StripeWidthZero,
}

/// The chunk size `S = block_size * stripe_blocks`.
pub fn chunk_size(block_size: u64, stripe_blocks: u64) -> u64 {
    block_size * stripe_blocks
}

/// Chunk *k* is hosted by file service `k mod W`.
pub fn server_for_chunk(chunk_index: u64, width: u32) -> u32 {
    (chunk_index % width as u64) as u32
}

/// The chunk index covering a given global byte.
pub fn chunk_index_of(byte: u64, chunk_size: u64) -> u64 {
    byte / chunk_size
}

/// Compute a read plan.
///
/// `chunk_present` reports whether chunk `k` currently has data; the plan
/// stops at the first absent chunk, which is how a file with holes at its
/// high end reports an earlier-than-`file_size` EOF. Returns an empty plan
/// if `offset >= file_size` or the request is zero bytes.
pub fn plan_read(
    offset: u64,
    num_bytes: u64,
    width: u32,
    chunk_size: u64,
    file_size: u64,
    chunk_present: impl Fn(u64) -> bool,
) -> Vec<ChunkPlan> {
    if width == 0 || num_bytes == 0 || offset >= file_size {
        return Vec::new();
    }

    let last_byte_requested = offset + num_bytes - 1;
    let first_k = offset / chunk_size;
    let last_k = (last_byte_requested / chunk_size).min((file_size - 1) / chunk_size);

    let mut plan = Vec::new();
    for k in first_k..=last_k {
        if !chunk_present(k) {
            break;
        }
        let chunk_start = k * chunk_size;
        let chunk_end = chunk_start + chunk_size - 1;
        let start = offset.max(chunk_start);
        let end = last_byte_requested.min(chunk_end).min(file_size - 1);
        if start > end {
            break;
        }
        plan.push(ChunkPlan {
            chunk_index: k,
            server_index: server_for_chunk(k, width),
            start,
            end,
        });
    }
    plan
}

/// Compute a write plan. Unlike reads, writes may extend the
/// file, so there is no EOF clipping and no dependence on which chunks
/// already exist: every chunk in range is planned, new or not. The caller
/// (the metadata registry) is responsible for the side effects of planning
/// a write, creating new chunk records, extending existing ones, and
/// growing `file_size`.
pub fn plan_write(
    offset: u64,
    num_bytes: u64,
    width: u32,
    chunk_size: u64,
    file_size: u64,
) -> Result<Vec<ChunkPlan>, StripingError> {
    if width == 0 {
        return Err(StripingError::StripeWidthZero);
    }
    if offset > file_size {
        return Err(StripingError::WriteOffsetPastEof {
            offset,
            size: file_size,
        });
    }
    if num_bytes == 0 {
        return Ok(Vec::new());
    }

    let last_byte = offset + num_bytes - 1;
    let first_k = offset / chunk_size;
    let last_k = last_byte / chunk_size;

    let mut plan = Vec::with_capacity((last_k - first_k + 1) as usize);
    for k in first_k..=last_k {
        let chunk_start = k * chunk_size;
        let chunk_end = chunk_start + chunk_size - 1;
        let start = offset.max(chunk_start);
        let end = last_byte.min(chunk_end);
        plan.push(ChunkPlan {
            chunk_index: k,
            server_index: server_for_chunk(k, width),
            start,
            end,
        });
    }
    Ok(plan)
}
