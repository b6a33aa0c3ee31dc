use anyhow::anyhow;
use async_trait::async_trait;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::net::TcpStream;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use tracing::warn;

use crate::signal::Signal;

use super::{ChannelError, ChannelRecv, ChannelSend, Hello, Transport, channel_name};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Signaling transport backed by a serve process's `/bus` relay.
pub(crate) struct WsTransport {
    endpoint: String,
}

impl WsTransport {
    pub(crate) fn new(server: &str) -> Self {
        WsTransport {
            endpoint: format!("{}/bus", server.trim_end_matches('/')),
        }
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn open(
        &self,
        room: &str,
    ) -> anyhow::Result<(Box<dyn ChannelSend>, Box<dyn ChannelRecv>)> {
        let (mut ws, _) = connect_async(&self.endpoint).await?;

        // name the channel before anything else, then the relay starts
        // forwarding other subscribers' frames
        let hello = serde_json::to_vec(&Hello {
            channel: channel_name(room),
        })?;
        ws.send(Message::binary(hello)).await?;

        let (sink, stream) = ws.split();
        Ok((Box::new(WsSend(sink)), Box::new(WsRecv(stream))))
    }
}

struct WsSend(SplitSink<Ws, Message>);
struct WsRecv(SplitStream<Ws>);

#[async_trait]
impl ChannelSend for WsSend {
    async fn send(&mut self, msg: &Signal) -> Result<(), ChannelError> {
        let frame = serde_json::to_vec(msg).map_err(|e| ChannelError::Unknown(anyhow!(e)))?;
        self.0
            .send(Message::binary(frame))
            .await
            .map_err(|e| ChannelError::Unknown(anyhow!(e)))?;
        Ok(())
    }
}

#[async_trait]
impl ChannelRecv for WsRecv {
    async fn recv(&mut self) -> Result<Signal, ChannelError> {
        loop {
            let msg = match self.0.next().await {
                None => return Err(ChannelError::Closed),
                Some(Err(err)) => return Err(ChannelError::Unknown(anyhow!(err))),
                Some(Ok(Message::Close(_))) => return Err(ChannelError::Closed),
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(msg)) => msg,
            };
            match serde_json::from_slice(&msg.into_data()) {
                Ok(signal) => return Ok(signal),
                Err(err) => {
                    warn!("dropping malformed relay frame: {err}");
                    continue;
                }
            }
        }
    }
}
