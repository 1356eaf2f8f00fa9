//! In-process transport over channels, for driving a gateway without a
//! network.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use steamcm_core::{CmError, CmResult, Envelope};

use super::{Connector, FrameSink, FrameSource, Transport};

struct MemorySink {
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl FrameSink for MemorySink {
    fn send_frame(&self, frame: Vec<u8>) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
        let result = match self.tx.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
            Some(tx) => tx
                .send(frame)
                .map_err(|_| CmError::Transport("peer went away".into())),
            None => Err(CmError::Transport("transport closed".into())),
        };
        Box::pin(async move { result })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        Box::pin(async { Ok(()) })
    }
}

struct MemorySource {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl FrameSource for MemorySource {
    fn next_frame(&mut self) -> Pin<Box<dyn Future<Output = CmResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move { Ok(self.rx.recv().await) })
    }
}

/// The server side of an in-memory transport.
pub struct MemoryPeer {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl MemoryPeer {
    /// Push a raw frame to the client. Returns false once the client is gone.
    pub fn send(&self, frame: Vec<u8>) -> bool {
        self.tx.as_ref().is_some_and(|tx| tx.send(frame).is_ok())
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        self.send(envelope.to_bytes())
    }

    /// Next frame written by the client, `None` once it closed its side.
    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Next client frame, parsed. Frames that fail to parse are skipped.
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            let frame = self.recv().await?;
            if let Ok(envelope) = Envelope::parse(&frame) {
                return Some(envelope);
            }
        }
    }

    /// End the client's read stream.
    pub fn close(&mut self) {
        self.tx.take();
    }
}

/// A connected client transport and the peer that drives it.
pub fn pair() -> (Transport, MemoryPeer) {
    let (to_client, from_peer) = mpsc::unbounded_channel();
    let (to_peer, from_client) = mpsc::unbounded_channel();
    let transport = Transport {
        sink: Arc::new(MemorySink {
            tx: Mutex::new(Some(to_peer)),
        }),
        source: Box::new(MemorySource { rx: from_peer }),
    };
    let peer = MemoryPeer {
        tx: Some(to_client),
        rx: from_client,
    };
    (transport, peer)
}

/// Hands out pre-built transports by address; unknown addresses refuse.
#[derive(Default)]
pub struct MemoryConnector {
    transports: Mutex<HashMap<String, Vec<Transport>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept one connection to `address`, returning its server side.
    pub fn listen(&self, address: &str) -> MemoryPeer {
        let (transport, peer) = pair();
        self.transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(address.to_string())
            .or_default()
            .push(transport);
        peer
    }
}

impl Connector for MemoryConnector {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = CmResult<Transport>> + Send + 'a>> {
        let transport = self
            .transports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(address)
            .and_then(|queue| (!queue.is_empty()).then(|| queue.remove(0)));
        Box::pin(async move {
            transport.ok_or_else(|| CmError::Transport(format!("connection to {address} refused")))
        })
    }
}
