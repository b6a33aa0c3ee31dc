use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, broadcast};
use tracing::warn;
use uuid::Uuid;

use crate::signal::Signal;

pub(crate) mod ws;

/// Frames buffered per channel before slow subscribers start lagging.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub(crate) enum ChannelError {
    #[error("channel closed")]
    Closed,
    #[error("Unknown error: {0}")]
    Unknown(#[from] anyhow::Error),
}

#[async_trait]
pub(crate) trait ChannelSend: Send + Sync {
    async fn send(&mut self, msg: &Signal) -> Result<(), ChannelError>;
}

#[async_trait]
pub(crate) trait ChannelRecv: Send + Sync {
    /// Next well-formed signal from another subscriber. Malformed frames
    /// are dropped here, never surfaced.
    async fn recv(&mut self) -> Result<Signal, ChannelError>;
}

/// Opens a broadcast subscription scoped to a room name. Every frame a
/// subscriber sends reaches every *other* subscriber of the same channel
/// on the same machine.
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    async fn open(&self, room: &str)
    -> anyhow::Result<(Box<dyn ChannelSend>, Box<dyn ChannelRecv>)>;
}

/// First frame a relay subscriber sends, naming its channel.
#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct Hello {
    pub(crate) channel: String,
}

pub(crate) fn channel_name(room: &str) -> String {
    format!("voice-room-{room}")
}

type Frame = (Uuid, Bytes);

/// In-process broadcast bus: a registry of per-channel senders. Backs the
/// relay endpoint and stands in for the whole transport in tests.
#[derive(Default)]
pub(crate) struct Bus {
    channels: Mutex<HashMap<String, broadcast::Sender<Frame>>>,
}

impl Bus {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Bus::default())
    }

    pub(crate) async fn subscribe(&self, name: &str) -> (BusSender, BusReceiver) {
        let mut channels = self.channels.lock().await;
        channels.retain(|_, tx| tx.receiver_count() > 0);
        let tx = channels
            .entry(name.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let origin = Uuid::new_v4();
        (
            BusSender {
                origin,
                tx: tx.clone(),
            },
            BusReceiver {
                origin,
                rx: tx.subscribe(),
            },
        )
    }

    pub(crate) async fn subscribers(&self, name: &str) -> usize {
        let channels = self.channels.lock().await;
        channels.get(name).map_or(0, |tx| tx.receiver_count())
    }
}

pub(crate) struct BusSender {
    origin: Uuid,
    tx: broadcast::Sender<Frame>,
}

pub(crate) struct BusReceiver {
    origin: Uuid,
    rx: broadcast::Receiver<Frame>,
}

impl BusSender {
    pub(crate) fn send(&self, frame: Bytes) {
        // no subscribers is fine; broadcasting into an empty room is a no-op
        let _ = self.tx.send((self.origin, frame));
    }
}

impl BusReceiver {
    /// Next frame from another subscriber; own frames never come back.
    pub(crate) async fn recv(&mut self) -> Result<Bytes, ChannelError> {
        loop {
            match self.rx.recv().await {
                Ok((origin, _)) if origin == self.origin => continue,
                Ok((_, frame)) => return Ok(frame),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("bus subscriber lagged, skipped {skipped} frames");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return Err(ChannelError::Closed),
            }
        }
    }
}

struct LocalSend(BusSender);
struct LocalRecv(BusReceiver);

#[async_trait]
impl ChannelSend for LocalSend {
    async fn send(&mut self, msg: &Signal) -> Result<(), ChannelError> {
        let frame = serde_json::to_vec(msg).map_err(|e| ChannelError::Unknown(e.into()))?;
        self.0.send(frame.into());
        Ok(())
    }
}

#[async_trait]
impl ChannelRecv for LocalRecv {
    async fn recv(&mut self) -> Result<Signal, ChannelError> {
        loop {
            let frame = self.0.recv().await?;
            match serde_json::from_slice(&frame) {
                Ok(signal) => return Ok(signal),
                Err(err) => {
                    warn!("dropping malformed signal frame: {err}");
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl Transport for Bus {
    async fn open(
        &self,
        room: &str,
    ) -> anyhow::Result<(Box<dyn ChannelSend>, Box<dyn ChannelRecv>)> {
        let (tx, rx) = self.subscribe(&channel_name(room)).await;
        Ok((Box::new(LocalSend(tx)), Box::new(LocalRecv(rx))))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use uuid::Uuid;

    use super::*;

    fn leave(room_id: &str) -> Signal {
        Signal::Leave {
            from: Uuid::new_v4(),
            room_id: room_id.to_string(),
        }
    }

    #[tokio::test]
    async fn subscribers_see_each_other_but_not_themselves() {
        let bus = Bus::new();
        let (mut a_tx, mut a_rx) = Transport::open(&*bus, "r1").await.unwrap();
        let (_b_tx, mut b_rx) = Transport::open(&*bus, "r1").await.unwrap();

        let msg = leave("r1");
        a_tx.send(&msg).await.unwrap();

        let received = b_rx.recv().await.unwrap();
        assert_eq!(received.from_id(), msg.from_id());

        let echo = tokio::time::timeout(Duration::from_millis(200), a_rx.recv()).await;
        assert!(echo.is_err(), "a subscriber must not hear its own frames");
    }

    #[tokio::test]
    async fn channels_are_scoped_by_room() {
        let bus = Bus::new();
        let (mut a_tx, _a_rx) = Transport::open(&*bus, "alpha").await.unwrap();
        let (_b_tx, mut b_rx) = Transport::open(&*bus, "beta").await.unwrap();

        a_tx.send(&leave("alpha")).await.unwrap();
        let crossed = tokio::time::timeout(Duration::from_millis(200), b_rx.recv()).await;
        assert!(crossed.is_err(), "rooms must not leak into each other");
    }

    #[tokio::test]
    async fn malformed_frames_are_skipped() {
        let bus = Bus::new();
        let (raw_tx, _raw_rx) = bus.subscribe(&channel_name("r1")).await;
        let (_tx, mut rx) = Transport::open(&*bus, "r1").await.unwrap();

        raw_tx.send(Bytes::from_static(b"not json"));
        let msg = leave("r1");
        raw_tx.send(serde_json::to_vec(&msg).unwrap().into());

        let received = rx.recv().await.unwrap();
        assert_eq!(received.from_id(), msg.from_id());
    }
}
