//! Fixed-size slicing of an encrypted payload

use bytes::Bytes;
use shc_core::{ShcError, ShcResult};

/// Number of `chunk_size` slices needed to cover `len` bytes.
pub fn chunk_count(len: u64, chunk_size: u64) -> ShcResult<u32> {
    if chunk_size == 0 {
        return Err(ShcError::Contract("chunk size must be non-zero".into()));
    }
    u32::try_from(len.div_ceil(chunk_size)).map_err(|_| {
        ShcError::Contract(format!(
            "{len} bytes at {chunk_size} bytes per chunk exceeds the chunk index range"
        ))
    })
}

/// Split `payload` into `chunk_size` slices. Slices share the payload's
/// buffer; only the last may be short.
pub fn split(payload: &Bytes, chunk_size: u64) -> ShcResult<Vec<Bytes>> {
    chunk_count(payload.len() as u64, chunk_size)?;
    let step = usize::try_from(chunk_size).unwrap_or(usize::MAX);
    let mut out = Vec::with_capacity(payload.len().div_ceil(step.max(1)));
    let mut start = 0usize;
    while start < payload.len() {
        let end = start.saturating_add(step).min(payload.len());
        out.push(payload.slice(start..end));
        start = end;
    }
    Ok(out)
}
