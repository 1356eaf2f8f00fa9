//! Multi container unpacking for the inbound pump.

use tracing::debug;

use steamcm_core::multi;
use steamcm_core::protobufs::CMsgMulti;
use steamcm_core::{CmError, CmResult};

/// Split a Multi body into its sub-message frames, in wire order.
///
/// Compressed bodies are inflated on the blocking pool so the pump is not
/// stalled by the CPU work.
pub async fn unpack(body: CMsgMulti) -> CmResult<Vec<Vec<u8>>> {
    if !multi::is_compressed(&body) {
        return multi::split(body.message_body.as_deref().unwrap_or_default());
    }

    debug!(
        compressed = body.message_body.as_ref().map(|b| b.len()).unwrap_or(0),
        unzipped = body.size_unzipped.unwrap_or(0),
        "inflating multi"
    );
    tokio::task::spawn_blocking(move || multi::unpack(&body))
        .await
        .map_err(|e| CmError::Decompress(format!("inflate task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames() -> Vec<Vec<u8>> {
        vec![b"first".to_vec(), Vec::new(), b"third frame".to_vec()]
    }

    #[tokio::test]
    async fn plain_body_in_order() {
        let body = multi::pack(&frames(), false).unwrap();
        assert_eq!(unpack(body).await.unwrap(), frames());
    }

    #[tokio::test]
    async fn compressed_body_in_order() {
        let body = multi::pack(&frames(), true).unwrap();
        assert!(multi::is_compressed(&body));
        assert_eq!(unpack(body).await.unwrap(), frames());
    }

    #[tokio::test]
    async fn declared_size_mismatch_drops_everything() {
        let mut body = multi::pack(&frames(), true).unwrap();
        body.size_unzipped = body.size_unzipped.map(|n| n + 1);
        assert!(matches!(unpack(body).await, Err(CmError::Decompress(_))));
    }
}
