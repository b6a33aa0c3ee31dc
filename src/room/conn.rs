use std::sync::Arc;

use anyhow::Result;
use ractor::{ActorRef, cast};
use tracing::{debug, warn};
use webrtc::{
    api::{
        APIBuilder, interceptor_registry::register_default_interceptors,
        media_engine::MediaEngine,
    },
    ice_transport::{
        ice_candidate::{RTCIceCandidate, RTCIceCandidateInit},
        ice_server::RTCIceServer,
    },
    interceptor::registry::Registry,
    peer_connection::{
        RTCPeerConnection, configuration::RTCConfiguration,
        sdp::session_description::RTCSessionDescription,
    },
    track::track_local::track_local_static_sample::TrackLocalStaticSample,
};

use crate::signal::TabId;

use super::RoomMsg;

/// One direct media connection toward one peer, with the local stream's
/// track attached from the start.
pub(crate) struct PeerConn {
    rtc: RTCPeerConnection,
}

impl PeerConn {
    pub(crate) async fn new(
        ice_servers: &[String],
        track: Arc<TrackLocalStaticSample>,
    ) -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: ice_servers.to_vec(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };
        let rtc = api.new_peer_connection(config).await?;
        rtc.add_track(track).await?;
        Ok(PeerConn { rtc })
    }

    /// Routes this connection's events into the controller, keyed by the
    /// peer the connection belongs to.
    pub(crate) fn wire(&self, room: ActorRef<RoomMsg>, peer: TabId) {
        let on_candidate = room.clone();
        self.rtc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            if let Err(err) =
                                cast!(on_candidate, RoomMsg::LocalCandidate(peer, init))
                            {
                                debug!("dropping local candidate for {peer}: {err}");
                            }
                        }
                        Err(err) => warn!("failed to encode local candidate: {err}"),
                    }
                }
                Box::pin(async {})
            }));

        self.rtc.on_track(Box::new(move |track, _, _| {
            if let Err(err) = cast!(room, RoomMsg::RemoteTrack(peer, track)) {
                debug!("dropping remote track for {peer}: {err}");
            }
            Box::pin(async {})
        }));
    }

    /// Offerer side: produce and install the local offer.
    pub(crate) async fn offer(&self) -> Result<RTCSessionDescription> {
        let offer = self.rtc.create_offer(None).await?;
        self.rtc.set_local_description(offer.clone()).await?;
        Ok(offer)
    }

    /// Answerer side: apply the remote offer and produce the answer.
    pub(crate) async fn answer(
        &self,
        offer: RTCSessionDescription,
    ) -> Result<RTCSessionDescription> {
        self.rtc.set_remote_description(offer).await?;
        let answer = self.rtc.create_answer(None).await?;
        self.rtc.set_local_description(answer.clone()).await?;
        Ok(answer)
    }

    pub(crate) async fn accept_answer(&self, answer: RTCSessionDescription) -> Result<()> {
        self.rtc.set_remote_description(answer).await?;
        Ok(())
    }

    pub(crate) async fn add_candidate(&self, candidate: RTCIceCandidateInit) -> Result<()> {
        self.rtc.add_ice_candidate(candidate).await?;
        Ok(())
    }

    pub(crate) async fn close(&self) {
        if let Err(err) = self.rtc.close().await {
            debug!("closing peer connection: {err}");
        }
    }
}
