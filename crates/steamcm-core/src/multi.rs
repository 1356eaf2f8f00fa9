//! Multi-message container splitting.
//!
//! Wire format of the (optionally gzip-compressed) sequence:
//! `[u32 LE length][sub-message bytes]` repeated, no padding.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::{CmError, CmResult};
use crate::protobufs::CMsgMulti;

/// Whether the container body needs decompression first.
pub fn is_compressed(multi: &CMsgMulti) -> bool {
    multi.size_unzipped.unwrap_or(0) > 0
}

/// Upper bound on the buffer reserved up front from a declared size.
const MAX_PREALLOC: usize = 1 << 20;

/// Gunzip `data`, requiring exactly `expected` bytes of output.
///
/// Inflation stops one byte past `expected`, so an oversized stream is
/// rejected without being inflated in full.
pub fn decompress(data: &[u8], expected: u32) -> CmResult<Vec<u8>> {
    let mut out = Vec::with_capacity((expected as usize).min(MAX_PREALLOC));
    GzDecoder::new(data)
        .take(u64::from(expected) + 1)
        .read_to_end(&mut out)
        .map_err(|e| CmError::Decompress(format!("gzip: {e}")))?;
    if out.len() != expected as usize {
        return Err(CmError::Decompress(format!(
            "decompressed {} bytes, expected {expected}",
            out.len()
        )));
    }
    Ok(out)
}

/// Split a length-prefixed sequence into its sub-messages, in order.
///
/// A truncated prefix or body fails the whole sequence.
pub fn split(data: &[u8]) -> CmResult<Vec<Vec<u8>>> {
    let mut messages = Vec::new();
    let mut pos = 0;

    while pos < data.len() {
        let prefix = data.get(pos..pos + 4).ok_or_else(|| {
            CmError::Framing(format!("multi: truncated length prefix at offset {pos}"))
        })?;
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        pos += 4;

        let body = data.get(pos..pos + len).ok_or_else(|| {
            CmError::Framing(format!(
                "multi: sub-message of {len} bytes at offset {pos} overruns {} byte body",
                data.len()
            ))
        })?;
        messages.push(body.to_vec());
        pos += len;
    }

    Ok(messages)
}

/// Decompress if needed, then split. Blocking; run off the dispatch path for
/// large containers.
pub fn unpack(multi: &CMsgMulti) -> CmResult<Vec<Vec<u8>>> {
    let body = multi.message_body.as_deref().unwrap_or_default();
    if is_compressed(multi) {
        let inflated = decompress(body, multi.size_unzipped.unwrap_or(0))?;
        split(&inflated)
    } else {
        split(body)
    }
}

/// Build a container from sub-messages.
pub fn pack(messages: &[Vec<u8>], compress: bool) -> CmResult<CMsgMulti> {
    let mut raw = Vec::new();
    for m in messages {
        raw.extend_from_slice(&(m.len() as u32).to_le_bytes());
        raw.extend_from_slice(m);
    }

    if !compress {
        return Ok(CMsgMulti {
            size_unzipped: None,
            message_body: Some(raw),
        });
    }

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&raw)?;
    let zipped = encoder.finish()?;
    Ok(CMsgMulti {
        size_unzipped: Some(raw.len() as u32),
        message_body: Some(zipped),
    })
}
