//! Streamed encryption of large files
//!
//! Phases and the progress range each reports:
//! ```text
//! read     0..=50   1 MiB reads, yielding between reads
//! encrypt 50..=75   one AES-GCM pass on a blocking thread
//! encode  75..=100  base64 over 3 MiB ciphertext slices, yielding between slices
//! ```
//! Slices are multiples of 3 bytes, so the concatenated base64 has no
//! interior padding and equals a single-pass encoding.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use shc_core::{ShcError, ShcResult};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::envelope::SEPARATOR;
use crate::keys::SymmetricKey;

/// Read granularity
pub const READ_CHUNK_SIZE: usize = 1024 * 1024;

/// Encode granularity; must stay a multiple of 3
pub const ENCODE_CHUNK_SIZE: usize = 3 * 1024 * 1024;

/// Encrypt everything `reader` yields into one envelope string that
/// [`decrypt_payload`](crate::decrypt_payload) opens.
///
/// `total_size` only scales the read-phase progress; a wrong value skews
/// the percentages but not the output. `on_progress` receives whole
/// percentages, non-decreasing, ending at 100.
pub async fn encrypt_large_file<R, F>(
    mut reader: R,
    total_size: u64,
    key: &SymmetricKey,
    mut on_progress: F,
) -> ShcResult<String>
where
    R: AsyncRead + Unpin,
    F: FnMut(u8),
{
    let mut plaintext = Vec::with_capacity(usize::try_from(total_size).unwrap_or(0));
    let mut reported = 0u8;
    let mut report = |pct: u8, on_progress: &mut F| {
        let pct = pct.min(100);
        if pct >= reported {
            reported = pct;
            on_progress(pct);
        }
    };

    // ── read ────────────────────────────────────────────────────────────
    loop {
        let n = read_chunk(&mut reader, &mut plaintext).await?;
        if n == 0 {
            break;
        }
        tokio::task::yield_now().await;
        if total_size > 0 {
            let pct = (plaintext.len() as u64).saturating_mul(50) / total_size;
            report(pct.min(50) as u8, &mut on_progress);
        }
    }
    tracing::debug!(bytes = plaintext.len(), "large payload read");
    report(50, &mut on_progress);

    // ── encrypt ─────────────────────────────────────────────────────────
    let key = key.clone();
    let envelope = tokio::task::spawn_blocking(move || crate::aead::seal(&key, &plaintext))
        .await
        .map_err(|e| ShcError::Crypto(format!("encryption task failed: {e}")))??;
    tokio::task::yield_now().await;
    report(75, &mut on_progress);

    // ── encode ──────────────────────────────────────────────────────────
    let ciphertext = &envelope.ciphertext;
    let mut out = String::with_capacity(ciphertext.len().div_ceil(3) * 4 + 24);
    out.push_str(&STANDARD.encode(envelope.iv));
    out.push(SEPARATOR);

    let total = ciphertext.len();
    for (i, slice) in ciphertext.chunks(ENCODE_CHUNK_SIZE).enumerate() {
        STANDARD.encode_string(slice, &mut out);
        tokio::task::yield_now().await;
        let end = (i * ENCODE_CHUNK_SIZE + slice.len()) as u64;
        report(75 + (end * 25 / total as u64) as u8, &mut on_progress);
    }

    report(100, &mut on_progress);
    Ok(out)
}

/// Fill up to one read chunk; returns bytes appended (0 at EOF).
async fn read_chunk<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> ShcResult<usize> {
    let start = buf.len();
    buf.resize(start + READ_CHUNK_SIZE, 0);
    let mut filled = start;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(filled - start)
}
