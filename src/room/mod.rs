use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort, async_trait, cast};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::{ice_transport::ice_candidate::RTCIceCandidateInit, track::track_remote::TrackRemote};

use crate::{
    media::{LocalMedia, Microphone},
    signal::{Signal, TabId},
    transport::{ChannelError, ChannelRecv, ChannelSend, Transport},
};

pub(crate) mod conn;

use conn::PeerConn;

const NOT_IN_ROOM: &str = "Not connected to a room";

/// The signed-in user for this tab.
#[derive(Debug, Clone)]
pub(crate) struct Identity {
    pub(crate) username: String,
    pub(crate) email: String,
}

pub(crate) struct RoomArgs {
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) microphone: Microphone,
    pub(crate) ice_servers: Vec<String>,
}

struct ActiveRoom {
    room_id: String,
    send: Box<dyn ChannelSend>,
    pump_stop: mpsc::UnboundedSender<()>,
}

/// Where a peer's inbound audio ends up; one per peer, replaced whenever
/// the peer renegotiates a track.
struct RemoteSink {
    task: tokio::task::JoinHandle<()>,
}

impl Drop for RemoteSink {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Debug, Clone)]
pub(crate) struct RoomSnapshot {
    pub(crate) tab_id: TabId,
    pub(crate) username: Option<String>,
    pub(crate) room_id: Option<String>,
    pub(crate) peers: Vec<(TabId, String)>,
    pub(crate) connections: usize,
    pub(crate) muted: bool,
}

#[derive(derive_more::Debug)]
pub(crate) enum RoomMsg {
    // operations driven by the UI
    #[debug("SetUser")]
    SetUser(Option<Identity>, RpcReplyPort<()>),
    #[debug("Join({_0:?})")]
    Join(String, RpcReplyPort<String>),
    #[debug("Leave")]
    Leave(RpcReplyPort<String>),
    #[debug("Mute")]
    Mute(RpcReplyPort<String>),
    #[debug("Snapshot")]
    Snapshot(RpcReplyPort<RoomSnapshot>),
    // events from the signaling channel and the peer connections
    #[debug("Signal")]
    Signal(Signal),
    #[debug("LocalCandidate({_0})")]
    LocalCandidate(TabId, RTCIceCandidateInit),
    #[debug("RemoteTrack({_0})")]
    RemoteTrack(TabId, Arc<TrackRemote>),
}

/// Owns the local view of "who is in my room" and keeps exactly one live
/// connection per known peer. Every operation and every inbound event is
/// one mailbox message, so the whole state machine runs strictly one step
/// at a time; a join issued while another join is in flight waits its
/// turn instead of interleaving.
pub(crate) struct RoomActor;

pub(crate) struct RoomState {
    tab_id: TabId,
    transport: Arc<dyn Transport>,
    microphone: Microphone,
    ice_servers: Vec<String>,

    user: Option<Identity>,
    room: Option<ActiveRoom>,
    peers: HashMap<TabId, String>,
    conns: HashMap<TabId, PeerConn>,
    sinks: HashMap<TabId, RemoteSink>,
    media: Option<LocalMedia>,
    muted: bool,
}

#[async_trait]
impl Actor for RoomActor {
    type Msg = RoomMsg;
    type State = RoomState;
    type Arguments = RoomArgs;

    async fn pre_start(
        &self,
        _: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        Ok(RoomState {
            tab_id: Uuid::new_v4(),
            transport: args.transport,
            microphone: args.microphone,
            ice_servers: args.ice_servers,
            user: None,
            room: None,
            peers: HashMap::new(),
            conns: HashMap::new(),
            sinks: HashMap::new(),
            media: None,
            muted: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        debug!("received event: {message:?}");
        match message {
            RoomMsg::SetUser(user, reply) => {
                // identity changes never layer onto an existing membership
                state.leave().await;
                match &user {
                    Some(identity) => {
                        info!("signed in as {} <{}>", identity.username, identity.email);
                    }
                    None => {
                        state.media = None;
                        state.muted = false;
                    }
                }
                state.user = user;
                let _ = reply.send(());
            }
            RoomMsg::Join(room_id, reply) => {
                let status = state.join(&myself, room_id).await;
                let _ = reply.send(status);
            }
            RoomMsg::Leave(reply) => {
                state.leave().await;
                let _ = reply.send(NOT_IN_ROOM.to_string());
            }
            RoomMsg::Mute(reply) => {
                let _ = reply.send(state.mute());
            }
            RoomMsg::Snapshot(reply) => {
                let _ = reply.send(state.snapshot());
            }
            RoomMsg::Signal(signal) => {
                // a bad message is dropped, never the whole channel
                if let Err(err) = state.dispatch(&myself, signal).await {
                    warn!("failed to handle signal: {err}");
                }
            }
            RoomMsg::LocalCandidate(peer, candidate) => {
                state.send_candidate(peer, candidate).await;
            }
            RoomMsg::RemoteTrack(peer, track) => {
                state.attach_sink(peer, track);
            }
        }
        Ok(())
    }

    async fn post_stop(
        &self,
        _: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        state.leave().await;
        Ok(())
    }
}

impl RoomState {
    async fn join(&mut self, myself: &ActorRef<RoomMsg>, room_id: String) -> String {
        let Some(user) = self.user.clone() else {
            return "Sign in first.".to_string();
        };
        let room_id = room_id.trim().to_string();
        if room_id.is_empty() {
            return "Enter a room name first.".to_string();
        }
        if self.media.is_none() {
            match self.microphone.acquire() {
                Ok(media) => {
                    media.set_live(!self.muted);
                    self.media = Some(media);
                }
                Err(err) => {
                    debug!("microphone acquisition failed: {err}");
                    return "Microphone access is required to join.".to_string();
                }
            }
        }

        // re-joining is a clean restart, never layered state
        self.leave().await;

        let (send, recv) = match self.transport.open(&room_id).await {
            Ok(halves) => halves,
            Err(err) => {
                warn!("failed to open signaling channel for {room_id}: {err}");
                return "Could not open the room channel.".to_string();
            }
        };
        let pump_stop = spawn_pump(myself.clone(), recv);
        let mut room = ActiveRoom {
            room_id: room_id.clone(),
            send,
            pump_stop,
        };

        let announce = Signal::JoinAnnouncement {
            from: self.tab_id,
            room_id: room_id.clone(),
            username: user.username,
        };
        if let Err(err) = room.send.send(&announce).await {
            warn!("failed to announce into {room_id}: {err}");
        }
        self.room = Some(room);
        info!("joined room {room_id}");
        format!("Connected to room: {room_id}")
    }

    /// Unconditional reset back to the idle state; safe to call when
    /// already idle.
    async fn leave(&mut self) {
        if let Some(mut room) = self.room.take() {
            let bye = Signal::Leave {
                from: self.tab_id,
                room_id: room.room_id.clone(),
            };
            if let Err(err) = room.send.send(&bye).await {
                debug!("failed to send leave for {}: {err}", room.room_id);
            }
            let _ = room.pump_stop.send(());
            info!("left room {}", room.room_id);
        }
        for (peer, conn) in self.conns.drain() {
            debug!("closing connection to {peer}");
            conn.close().await;
        }
        self.sinks.clear();
        self.peers.clear();
    }

    fn mute(&mut self) -> String {
        let Some(media) = &self.media else {
            return "Join a room first.".to_string();
        };
        self.muted = !self.muted;
        media.set_live(!self.muted);
        if self.muted { "Muted." } else { "Unmuted." }.to_string()
    }

    fn snapshot(&self) -> RoomSnapshot {
        RoomSnapshot {
            tab_id: self.tab_id,
            username: self.user.as_ref().map(|u| u.username.clone()),
            room_id: self.room.as_ref().map(|r| r.room_id.clone()),
            peers: self
                .peers
                .iter()
                .map(|(id, name)| (*id, name.clone()))
                .collect(),
            connections: self.conns.len(),
            muted: self.muted,
        }
    }

    async fn dispatch(&mut self, myself: &ActorRef<RoomMsg>, signal: Signal) -> anyhow::Result<()> {
        let Some(room) = &self.room else {
            return Ok(());
        };
        let room_id = room.room_id.clone();
        // self-originated echoes and other rooms' traffic are not ours
        if signal.from_id() == self.tab_id || signal.room_id() != room_id {
            return Ok(());
        }
        // unicast types are acted on only by their addressee
        if let Some(to) = signal.to()
            && to != self.tab_id
        {
            return Ok(());
        }

        match signal {
            Signal::JoinAnnouncement { from, username, .. } => {
                debug!("{username} ({from}) announced into {room_id}");
                self.peers.insert(from, username);
                // whoever *receives* the announcement initiates, so each
                // new pairing gets exactly one offerer
                self.create_conn(myself, from).await?;
                let Some(conn) = self.conns.get(&from) else {
                    return Ok(());
                };
                let offer = conn.offer().await?;
                let username = self.username();
                self.send_signal(Signal::Offer {
                    from: self.tab_id,
                    to: from,
                    room_id,
                    username,
                    offer,
                })
                .await;
            }
            Signal::Offer {
                from,
                username,
                offer,
                ..
            } => {
                debug!("offer from {username} ({from})");
                self.peers.insert(from, username);
                self.create_conn(myself, from).await?;
                let Some(conn) = self.conns.get(&from) else {
                    return Ok(());
                };
                let answer = conn.answer(offer).await?;
                self.send_signal(Signal::Answer {
                    from: self.tab_id,
                    to: from,
                    room_id,
                    answer,
                })
                .await;
            }
            Signal::Answer { from, answer, .. } => match self.conns.get(&from) {
                Some(conn) => conn.accept_answer(answer).await?,
                // the peer may have been torn down already
                None => debug!("answer from unknown peer {from}, ignoring"),
            },
            Signal::Candidate {
                from, candidate, ..
            } => {
                if let Some(conn) = self.conns.get(&from) {
                    // probing is best effort; late, duplicate and
                    // malformed candidates are expected and harmless
                    if let Err(err) = conn.add_candidate(candidate).await {
                        debug!("discarding candidate from {from}: {err}");
                    }
                } else {
                    debug!("candidate from unknown peer {from}, ignoring");
                }
            }
            Signal::Leave { from, .. } => {
                self.peers.remove(&from);
                self.sinks.remove(&from);
                if let Some(conn) = self.conns.remove(&from) {
                    conn.close().await;
                }
                info!("peer {from} left {room_id}");
            }
        }
        Ok(())
    }

    /// Creates the connection for a peer unless one already exists.
    async fn create_conn(&mut self, myself: &ActorRef<RoomMsg>, peer: TabId) -> anyhow::Result<()> {
        if self.conns.contains_key(&peer) {
            return Ok(());
        }
        let track = self
            .media
            .as_ref()
            .ok_or_else(|| anyhow!("no local media stream"))?
            .track();
        let conn = PeerConn::new(&self.ice_servers, track).await?;
        conn.wire(myself.clone(), peer);
        self.conns.insert(peer, conn);
        Ok(())
    }

    async fn send_signal(&mut self, signal: Signal) {
        let Some(room) = &mut self.room else {
            return;
        };
        if let Err(err) = room.send.send(&signal).await {
            warn!("failed to send signal: {err}");
        }
    }

    async fn send_candidate(&mut self, peer: TabId, candidate: RTCIceCandidateInit) {
        // the connection may be gone by the time its candidate surfaces
        if !self.conns.contains_key(&peer) {
            return;
        }
        let Some(room) = &self.room else {
            return;
        };
        let signal = Signal::Candidate {
            from: self.tab_id,
            to: peer,
            room_id: room.room_id.clone(),
            candidate,
        };
        self.send_signal(signal).await;
    }

    fn attach_sink(&mut self, peer: TabId, track: Arc<TrackRemote>) {
        if !self.peers.contains_key(&peer) {
            // stale event for a peer that already left
            return;
        }
        debug!("attaching audio sink for {peer}");
        let task = tokio::spawn(async move {
            let mut packets: u64 = 0;
            while track.read_rtp().await.is_ok() {
                packets += 1;
            }
            debug!("audio sink for {peer} drained after {packets} packets");
        });
        // replaces any prior sink for this peer
        self.sinks.insert(peer, RemoteSink { task });
    }

    fn username(&self) -> String {
        self.user
            .as_ref()
            .map(|u| u.username.clone())
            .unwrap_or_default()
    }
}

/// Forwards channel frames into the mailbox until told to stop or the
/// channel dies.
fn spawn_pump(room: ActorRef<RoomMsg>, mut recv: Box<dyn ChannelRecv>) -> mpsc::UnboundedSender<()> {
    let (stop_tx, mut stop_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = stop_rx.recv() => break,
                signal = recv.recv() => match signal {
                    Ok(signal) => {
                        if cast!(room, RoomMsg::Signal(signal)).is_err() {
                            break;
                        }
                    }
                    Err(ChannelError::Closed) => {
                        debug!("signaling channel closed");
                        break;
                    }
                    Err(err) => {
                        warn!("signaling receive failed: {err}");
                        continue;
                    }
                },
            }
        }
    });
    stop_tx
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use ractor::call;
    use tokio::time::{sleep, timeout};

    use crate::transport::{Bus, BusReceiver, BusSender, channel_name};

    use super::*;

    async fn spawn_room(bus: Arc<Bus>, microphone: Microphone) -> ActorRef<RoomMsg> {
        let (actor, _) = Actor::spawn(
            None,
            RoomActor,
            RoomArgs {
                transport: bus,
                microphone,
                ice_servers: Vec::new(),
            },
        )
        .await
        .unwrap();
        actor
    }

    async fn sign_in(actor: &ActorRef<RoomMsg>, username: &str) {
        let identity = Identity {
            username: username.to_string(),
            email: format!("{username}@example.com"),
        };
        call!(actor, RoomMsg::SetUser, Some(identity)).unwrap();
    }

    async fn tap(bus: &Bus, room: &str) -> (BusSender, BusReceiver) {
        bus.subscribe(&channel_name(room)).await
    }

    fn frame(signal: &Signal) -> Bytes {
        serde_json::to_vec(signal).unwrap().into()
    }

    async fn wait_for(
        actor: &ActorRef<RoomMsg>,
        what: &str,
        check: impl Fn(&RoomSnapshot) -> bool,
    ) -> RoomSnapshot {
        for _ in 0..100 {
            let snapshot = call!(actor, RoomMsg::Snapshot).unwrap();
            if check(&snapshot) {
                return snapshot;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("timed out waiting for: {what}");
    }

    async fn drain(rx: &mut BusReceiver) -> Vec<Signal> {
        let mut signals = Vec::new();
        while let Ok(Ok(bytes)) = timeout(Duration::from_millis(300), rx.recv()).await {
            if let Ok(signal) = serde_json::from_slice(&bytes) {
                signals.push(signal);
            }
        }
        signals
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_tabs_exchange_exactly_one_offer_answer_pair() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        let b = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;
        sign_in(&b, "bob").await;

        let (_tap_tx, mut tap_rx) = tap(&bus, "r1").await;

        let status = call!(a, RoomMsg::Join, "r1".to_string()).unwrap();
        assert_eq!(status, "Connected to room: r1");
        call!(b, RoomMsg::Join, "r1".to_string()).unwrap();

        let a_snap = wait_for(&a, "a connected to b", |s| s.connections == 1).await;
        let b_snap = wait_for(&b, "b connected to a", |s| s.connections == 1).await;
        assert_eq!(a_snap.peers.len(), 1);
        assert_eq!(b_snap.peers.len(), 1);
        assert_eq!(a_snap.peers[0].1, "bob");
        assert_eq!(b_snap.peers[0].1, "alice");
        // each side's one connection is addressed to the other's id
        assert_eq!(a_snap.peers[0].0, b_snap.tab_id);
        assert_eq!(b_snap.peers[0].0, a_snap.tab_id);

        let signals = drain(&mut tap_rx).await;
        let offers = signals
            .iter()
            .filter(|s| matches!(s, Signal::Offer { .. }))
            .count();
        let answers = signals
            .iter()
            .filter(|s| matches!(s, Signal::Answer { .. }))
            .count();
        assert_eq!(offers, 1, "exactly one side may initiate");
        assert_eq!(answers, 1);

        a.stop(None);
        b.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn rejoining_leaves_nothing_behind_in_the_old_room() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;

        let (alpha_tx, mut alpha_rx) = tap(&bus, "alpha").await;
        call!(a, RoomMsg::Join, "alpha".to_string()).unwrap();
        call!(a, RoomMsg::Join, "beta".to_string()).unwrap();

        let signals = drain(&mut alpha_rx).await;
        assert!(
            matches!(signals.first(), Some(Signal::JoinAnnouncement { .. })),
            "alpha saw the announcement"
        );
        assert!(
            matches!(signals.last(), Some(Signal::Leave { .. })),
            "alpha saw the departure"
        );

        // the alpha subscription is gone; only the tap remains attached
        for _ in 0..100 {
            if bus.subscribers(&channel_name("alpha")).await == 1 {
                break;
            }
            sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(bus.subscribers(&channel_name("alpha")).await, 1);

        // traffic in alpha no longer reaches the controller
        let stranger = Uuid::new_v4();
        alpha_tx.send(frame(&Signal::JoinAnnouncement {
            from: stranger,
            room_id: "alpha".to_string(),
            username: "mallory".to_string(),
        }));
        sleep(Duration::from_millis(200)).await;
        let snapshot = call!(a, RoomMsg::Snapshot).unwrap();
        assert_eq!(snapshot.room_id.as_deref(), Some("beta"));
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.connections, 0);

        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn leave_always_drops_the_peer_whatever_its_state() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;
        call!(a, RoomMsg::Join, "r1".to_string()).unwrap();

        let (fake_tx, _fake_rx) = tap(&bus, "r1").await;
        let stranger = Uuid::new_v4();
        fake_tx.send(frame(&Signal::JoinAnnouncement {
            from: stranger,
            room_id: "r1".to_string(),
            username: "mallory".to_string(),
        }));

        // mid-negotiation: the offer is out, no answer will ever come
        wait_for(&a, "negotiation started", |s| {
            s.peers.len() == 1 && s.connections == 1
        })
        .await;

        fake_tx.send(frame(&Signal::Leave {
            from: stranger,
            room_id: "r1".to_string(),
        }));
        let snapshot = wait_for(&a, "peer dropped", |s| s.peers.is_empty()).await;
        assert_eq!(snapshot.connections, 0);

        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn messages_addressed_to_someone_else_are_ignored() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;
        call!(a, RoomMsg::Join, "r1".to_string()).unwrap();

        // a real offer, but addressed to a third tab
        let media = Microphone::Silence.acquire().unwrap();
        let offerer = PeerConn::new(&[], media.track()).await.unwrap();
        let offer = offerer.offer().await.unwrap();

        let (fake_tx, mut fake_rx) = tap(&bus, "r1").await;
        fake_tx.send(frame(&Signal::Offer {
            from: Uuid::new_v4(),
            to: Uuid::new_v4(),
            room_id: "r1".to_string(),
            username: "mallory".to_string(),
            offer,
        }));

        sleep(Duration::from_millis(300)).await;
        let snapshot = call!(a, RoomMsg::Snapshot).unwrap();
        assert!(snapshot.peers.is_empty(), "misaddressed offer acted upon");
        assert_eq!(snapshot.connections, 0);
        let answers = drain(&mut fake_rx)
            .await
            .into_iter()
            .filter(|s| matches!(s, Signal::Answer { .. }))
            .count();
        assert_eq!(answers, 0);

        offerer.close().await;
        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn denied_microphone_aborts_the_join() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Denied).await;
        sign_in(&a, "alice").await;

        let status = call!(a, RoomMsg::Join, "r1".to_string()).unwrap();
        assert_eq!(status, "Microphone access is required to join.");
        let snapshot = call!(a, RoomMsg::Snapshot).unwrap();
        assert_eq!(snapshot.room_id, None);
        assert_eq!(bus.subscribers(&channel_name("r1")).await, 0);

        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn empty_room_name_is_rejected() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;

        let status = call!(a, RoomMsg::Join, "   ".to_string()).unwrap();
        assert_eq!(status, "Enter a room name first.");
        let snapshot = call!(a, RoomMsg::Snapshot).unwrap();
        assert_eq!(snapshot.room_id, None);

        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn mute_needs_a_stream_and_then_toggles_in_place() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;

        assert_eq!(call!(a, RoomMsg::Mute).unwrap(), "Join a room first.");

        call!(a, RoomMsg::Join, "r1".to_string()).unwrap();
        assert_eq!(call!(a, RoomMsg::Mute).unwrap(), "Muted.");
        assert!(call!(a, RoomMsg::Snapshot).unwrap().muted);
        assert_eq!(call!(a, RoomMsg::Mute).unwrap(), "Unmuted.");
        assert!(!call!(a, RoomMsg::Snapshot).unwrap().muted);

        a.stop(None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn signing_out_resets_everything() {
        let bus = Bus::new();
        let a = spawn_room(bus.clone(), Microphone::Silence).await;
        sign_in(&a, "alice").await;
        call!(a, RoomMsg::Join, "r1".to_string()).unwrap();

        call!(a, RoomMsg::SetUser, None).unwrap();
        let snapshot = call!(a, RoomMsg::Snapshot).unwrap();
        assert_eq!(snapshot.username, None);
        assert_eq!(snapshot.room_id, None);
        assert!(snapshot.peers.is_empty());
        assert_eq!(snapshot.connections, 0);

        // leaving again while idle is a no-op, not an error
        assert_eq!(call!(a, RoomMsg::Leave).unwrap(), NOT_IN_ROOM);

        a.stop(None);
    }
}
