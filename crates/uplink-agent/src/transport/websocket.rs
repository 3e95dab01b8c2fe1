//! WebSocket transport: length-prefixed CBOR frames inside binary messages.

use super::{RelayDial, RelayLink};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uplink_core::{encode_frame, Envelope, FrameDecoder, UplinkError, UplinkResult};

pub struct WsLink {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    decoder: FrameDecoder,
    pending: VecDeque<Envelope>,
}

#[async_trait]
impl RelayLink for WsLink {
    async fn send(&mut self, envelope: &Envelope) -> UplinkResult<()> {
        let frame = encode_frame(envelope)?;
        self.ws
            .send(Message::Binary(frame))
            .await
            .map_err(|e| UplinkError::Transport(e.to_string()))
    }

    async fn recv(&mut self) -> UplinkResult<Envelope> {
        loop {
            if let Some(envelope) = self.pending.pop_front() {
                return Ok(envelope);
            }
            match self.ws.next().await {
                Some(Ok(Message::Binary(data))) => {
                    self.pending.extend(self.decoder.feed::<Envelope>(&data)?);
                }
                Some(Ok(Message::Close(_))) => {
                    return Err(UplinkError::Transport("closed by peer".into()));
                }
                // transport-level ping/pong and text are not ours
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(UplinkError::Transport(e.to_string())),
                None => return Err(UplinkError::Transport("connection closed".into())),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// Dialer for `ws://` and `wss://` relay endpoints.
#[derive(Debug, Default)]
pub struct WsDialer;

#[async_trait]
impl RelayDial for WsDialer {
    type Link = WsLink;

    async fn dial(&mut self, url: &str, timeout: Duration) -> UplinkResult<WsLink> {
        let (ws, _response) = tokio::time::timeout(timeout, connect_async(url))
            .await
            .map_err(|_| UplinkError::Timeout)?
            .map_err(|e| UplinkError::Transport(e.to_string()))?;
        Ok(WsLink {
            ws,
            decoder: FrameDecoder::new(),
            pending: VecDeque::new(),
        })
    }
}
