//! Frame transports.
//!
//! The gateway speaks whole binary frames; how they travel is behind the
//! [`FrameSink`] / [`FrameSource`] pair. Methods return boxed futures so the
//! traits stay dyn-compatible.

pub mod memory;
pub mod websocket;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use steamcm_core::CmResult;

pub use websocket::WebSocketConnector;

/// Write half. Shared between the caller's `send` path and the keep-alive
/// loop.
pub trait FrameSink: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>>;

    fn close(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>>;
}

/// Read half, owned by the inbound pump.
pub trait FrameSource: Send {
    /// The next binary frame, or `None` once the peer closed the stream.
    fn next_frame(&mut self) -> Pin<Box<dyn Future<Output = CmResult<Option<Vec<u8>>>> + Send + '_>>;
}

/// An open duplex connection split into its halves.
pub struct Transport {
    pub sink: Arc<dyn FrameSink>,
    pub source: Box<dyn FrameSource>,
}

/// Opens transports to server addresses.
pub trait Connector: Send + Sync {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = CmResult<Transport>> + Send + 'a>>;
}
