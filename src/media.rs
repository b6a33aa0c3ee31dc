use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use tokio::{task::JoinHandle, time::interval};
use webrtc::{
    api::media_engine::MIME_TYPE_OPUS,
    media::Sample,
    rtp_transceiver::rtp_codec::RTCRtpCodecCapability,
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

/// Opus framing: 48 kHz, one frame every 20 ms.
const FRAME_DURATION: Duration = Duration::from_millis(20);
/// A minimal Opus DTX frame, i.e. encoded silence.
const SILENCE_FRAME: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Error)]
pub(crate) enum MediaError {
    #[error("microphone access denied")]
    Denied,
}

/// Stand-in for the platform microphone. A capture backend slots in
/// behind [`LocalMedia`]; until then the live device carries silence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub(crate) enum Microphone {
    /// Acquires a working audio track that carries encoded silence.
    Silence,
    /// Fails to acquire, like a refused permission prompt.
    Denied,
}

impl Microphone {
    pub(crate) fn acquire(&self) -> Result<LocalMedia, MediaError> {
        match self {
            Microphone::Denied => Err(MediaError::Denied),
            Microphone::Silence => Ok(LocalMedia::silence()),
        }
    }
}

/// The tab's one capture stream: a single Opus audio track shared by
/// every peer connection, plus the in-place mute flag.
pub(crate) struct LocalMedia {
    track: Arc<TrackLocalStaticSample>,
    live: Arc<AtomicBool>,
    feeder: JoinHandle<()>,
}

impl LocalMedia {
    fn silence() -> Self {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            "audio".to_owned(),
            "parlor".to_owned(),
        ));
        let live = Arc::new(AtomicBool::new(true));
        let feeder = tokio::spawn({
            let track = track.clone();
            let live = live.clone();
            async move {
                let mut ticker = interval(FRAME_DURATION);
                loop {
                    ticker.tick().await;
                    if !live.load(Ordering::Relaxed) {
                        continue;
                    }
                    let sample = Sample {
                        data: Bytes::from_static(&SILENCE_FRAME),
                        duration: FRAME_DURATION,
                        ..Default::default()
                    };
                    if track.write_sample(&sample).await.is_err() {
                        break;
                    }
                }
            }
        });
        LocalMedia { track, live, feeder }
    }

    pub(crate) fn track(&self) -> Arc<TrackLocalStaticSample> {
        self.track.clone()
    }

    /// Enables or disables the audio track in place; no renegotiation.
    pub(crate) fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::Relaxed);
    }
}

impl Drop for LocalMedia {
    fn drop(&mut self) {
        self.feeder.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn denied_microphone_never_acquires() {
        assert!(matches!(
            Microphone::Denied.acquire(),
            Err(MediaError::Denied)
        ));
    }

    #[tokio::test]
    async fn silence_microphone_yields_a_mutable_stream() {
        let media = Microphone::Silence.acquire().unwrap();
        assert!(media.live.load(Ordering::Relaxed));
        media.set_live(false);
        assert!(!media.live.load(Ordering::Relaxed));
        media.set_live(true);
        assert!(media.live.load(Ordering::Relaxed));
    }
}
