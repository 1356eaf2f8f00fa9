//! WebSocket transport: one binary WebSocket message per CM frame.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use steamcm_core::{CmError, CmResult};

use super::{Connector, FrameSink, FrameSource, Transport};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// CM WebSocket endpoint for a `host:port` address.
pub fn cm_socket_url(address: &str) -> String {
    format!("wss://{address}/cmsocket/")
}

struct WebSocketSink {
    sink: Mutex<SplitSink<WsStream, Message>>,
}

impl FrameSink for WebSocketSink {
    fn send_frame(&self, frame: Vec<u8>) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            sink.send(Message::Binary(frame))
                .await
                .map_err(|e| CmError::Transport(format!("WS write error: {e}")))
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = CmResult<()>> + Send + '_>> {
        Box::pin(async move {
            let mut sink = self.sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            sink.close()
                .await
                .map_err(|e| CmError::Transport(format!("WS close error: {e}")))
        })
    }
}

struct WebSocketSource {
    stream: SplitStream<WsStream>,
}

impl FrameSource for WebSocketSource {
    fn next_frame(&mut self) -> Pin<Box<dyn Future<Output = CmResult<Option<Vec<u8>>>> + Send + '_>> {
        Box::pin(async move {
            while let Some(msg) = self.stream.next().await {
                match msg {
                    Ok(Message::Binary(data)) => return Ok(Some(data)),
                    Ok(Message::Close(_)) => {
                        debug!("WebSocket close frame received");
                        return Ok(None);
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
                    Ok(other) => {
                        debug!(kind = ?other, "ignoring non-binary WebSocket message");
                    }
                    Err(e) => return Err(CmError::Transport(format!("WS read error: {e}"))),
                }
            }
            Ok(None)
        })
    }
}

/// Dials `wss://{address}/cmsocket/`.
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WebSocketConnector {
    fn connect<'a>(
        &'a self,
        address: &'a str,
    ) -> Pin<Box<dyn Future<Output = CmResult<Transport>> + Send + 'a>> {
        Box::pin(async move {
            let url = cm_socket_url(address);
            let (ws, _response) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
                .await
                .map_err(|_| CmError::Timeout)?
                .map_err(|e| CmError::Transport(format!("WebSocket connect error: {e}")))?;

            info!(%url, "WebSocket connected");

            let (sink, stream) = ws.split();
            Ok(Transport {
                sink: Arc::new(WebSocketSink {
                    sink: Mutex::new(sink),
                }),
                source: Box::new(WebSocketSource { stream }),
            })
        })
    }
}
