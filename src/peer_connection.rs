use crate::config::Config;
use crate::data_channel::{DataChannel, DataChannelOptions};
use crate::error::Error;
use crate::event::EventToken;
use crate::media::{
    MediaStream, MediaStreamTrack, MediaTrack, RawFrame, TrackEvent, TrackInfo, TrackKind,
    TrackRegistry,
};
use crate::promise::{Completer, Promise};
use crate::runtime::Runtime;
use crate::sdp::{IceCandidate, SessionDescription};
use arc_swap::ArcSwapOption;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_gathering_state::RTCIceGatheringState;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::offer_answer_options::{RTCAnswerOptions, RTCOfferOptions};
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;

/// Where the negotiation state machine currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    HaveLocalPranswer,
    HaveRemotePranswer,
    Closed,
}

impl SignalingState {
    fn from_engine(state: RTCSignalingState) -> Self {
        match state {
            RTCSignalingState::Unspecified | RTCSignalingState::Stable => SignalingState::Stable,
            RTCSignalingState::HaveLocalOffer => SignalingState::HaveLocalOffer,
            RTCSignalingState::HaveRemoteOffer => SignalingState::HaveRemoteOffer,
            RTCSignalingState::HaveLocalPranswer => SignalingState::HaveLocalPranswer,
            RTCSignalingState::HaveRemotePranswer => SignalingState::HaveRemotePranswer,
            RTCSignalingState::Closed => SignalingState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Failed,
    Disconnected,
    Closed,
}

impl IceConnectionState {
    fn from_engine(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Unspecified | RTCIceConnectionState::New => {
                IceConnectionState::New
            }
            RTCIceConnectionState::Checking => IceConnectionState::Checking,
            RTCIceConnectionState::Connected => IceConnectionState::Connected,
            RTCIceConnectionState::Completed => IceConnectionState::Completed,
            RTCIceConnectionState::Failed => IceConnectionState::Failed,
            RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
            RTCIceConnectionState::Closed => IceConnectionState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceGatheringState {
    New,
    Gathering,
    Complete,
}

impl IceGatheringState {
    fn from_engine(state: RTCIceGatheringState) -> Self {
        match state {
            RTCIceGatheringState::Unspecified | RTCIceGatheringState::New => IceGatheringState::New,
            RTCIceGatheringState::Gathering => IceGatheringState::Gathering,
            RTCIceGatheringState::Complete => IceGatheringState::Complete,
        }
    }

    fn from_gatherer(state: RTCIceGathererState) -> Self {
        match state {
            RTCIceGathererState::Unspecified | RTCIceGathererState::New => IceGatheringState::New,
            RTCIceGathererState::Gathering => IceGatheringState::Gathering,
            RTCIceGathererState::Complete | RTCIceGathererState::Closed => {
                IceGatheringState::Complete
            }
        }
    }
}

/// Knobs for [PeerCoordinator::create_offer].
#[derive(Debug, Clone, Copy, Default)]
pub struct OfferOptions {
    pub voice_activity_detection: bool,
    /// Forces fresh ICE credentials, restarting connectivity checks.
    pub ice_restart: bool,
}

/// Knobs for [PeerCoordinator::create_answer].
#[derive(Debug, Clone, Copy, Default)]
pub struct AnswerOptions {
    pub voice_activity_detection: bool,
}

type Slot<T> = ArcSwapOption<Box<dyn Fn(T) + Send + Sync>>;

#[derive(Default)]
struct Callbacks {
    ice_candidate: Slot<IceCandidate>,
    add_track: Slot<MediaStreamTrack>,
    remove_track: Slot<TrackInfo>,
    add_stream: Slot<MediaStream>,
    remove_stream: Slot<MediaStream>,
    data_channel: Slot<DataChannel>,
    negotiation_needed: Slot<()>,
    signaling_state: Slot<SignalingState>,
    ice_gathering_state: Slot<IceGatheringState>,
    ice_connection_state: Slot<IceConnectionState>,
    candidates_removed: Slot<Vec<IceCandidate>>,
    raw_video: Slot<RawFrame>,
    raw_audio: Slot<RawFrame>,
}

struct PendingCandidate {
    candidate: IceCandidate,
    completer: Completer<()>,
}

struct CoordinatorShared {
    runtime: Arc<Runtime>,
    pc: Arc<RTCPeerConnection>,
    // The engine factory stays alive for as long as its connection does.
    _api: API,
    callbacks: Callbacks,
    registry: StdMutex<TrackRegistry>,
    streams: StdMutex<HashMap<String, Vec<MediaStreamTrack>>>,
    /// Serializes candidate admission against the post-remote drain. Holding
    /// it across set_remote_description plus the drain is what makes queued
    /// candidates land strictly before any newer direct one.
    gate: Mutex<Vec<PendingCandidate>>,
    set_local_busy: AtomicBool,
    set_remote_busy: AtomicBool,
    bypass: AtomicBool,
    closed: AtomicBool,
    /// Latches the Closed signaling event so it fires exactly once whether
    /// the teardown came from [PeerCoordinator::close] or from the engine.
    closed_emitted: AtomicBool,
    token: StdMutex<Option<EventToken>>,
}

impl CoordinatorShared {
    /// Hands `value` to the registered callback through the dispatch loop.
    /// Consumer code never runs on the engine's threads.
    fn emit<T: Send + 'static>(&self, slot: &Slot<T>, value: T) {
        if let Some(cb) = slot.load_full() {
            let scheduled = self
                .runtime
                .dispatcher()
                .schedule(move || cb(value), Duration::ZERO);
            if scheduled.is_err() {
                log::trace!("event dropped, dispatcher is shut down");
            }
        }
    }

    fn release_token(&self) {
        self.token.lock().unwrap().take();
    }

    /// Announces the terminal Closed state and drops the liveness token.
    /// The engine does not raise the signaling observer on a local close,
    /// so both the observer and [PeerCoordinator::close] funnel through
    /// this latch.
    fn emit_closed(&self) {
        if !self.closed_emitted.swap(true, Ordering::SeqCst) {
            self.emit(&self.callbacks.signaling_state, SignalingState::Closed);
        }
        self.release_token();
    }

    /// Reconciles the registry against an empty snapshot on teardown,
    /// announcing removal of every remote track and stream still present.
    /// Reader tasks that die afterwards find their ids already gone and
    /// stay silent.
    fn clear_tracks(&self) {
        let delta = self.registry.lock().unwrap().sync(&[]);
        if delta.is_empty() {
            return;
        }
        let gone_streams: Vec<MediaStream> = {
            let mut streams = self.streams.lock().unwrap();
            streams
                .drain()
                .map(|(id, tracks)| {
                    for track in &tracks {
                        track.mark_ended();
                    }
                    MediaStream::new(id, Vec::new())
                })
                .collect()
        };
        for event in delta.into_events() {
            if let TrackEvent::Removed(info) = event {
                self.emit(&self.callbacks.remove_track, info);
            }
        }
        for stream in gone_streams {
            self.emit(&self.callbacks.remove_stream, stream);
        }
    }

    fn handle_track_added(self: Arc<Self>, track: MediaStreamTrack) {
        {
            let mut registry = self.registry.lock().unwrap();
            if !registry.insert(track.info().clone()) {
                return;
            }
        }
        let new_stream = {
            let mut streams = self.streams.lock().unwrap();
            let entry = streams.entry(track.stream_id().to_string()).or_default();
            entry.push(track.clone());
            if entry.len() == 1 {
                Some(MediaStream::new(
                    track.stream_id().to_string(),
                    entry.clone(),
                ))
            } else {
                None
            }
        };
        log::debug!("remote {} track {} added", track.kind(), track.id());
        self.emit(&self.callbacks.add_track, track.clone());
        if let Some(stream) = new_stream {
            self.emit(&self.callbacks.add_stream, stream);
        }
        self.spawn_reader(track);
    }

    fn handle_track_removed(&self, track: &MediaStreamTrack) {
        track.mark_ended();
        if self.registry.lock().unwrap().remove(track.id()).is_none() {
            return;
        }
        let gone_stream = {
            let mut streams = self.streams.lock().unwrap();
            match streams.get_mut(track.stream_id()) {
                Some(entry) => {
                    entry.retain(|t| t.id() != track.id());
                    if entry.is_empty() {
                        streams.remove(track.stream_id());
                        Some(MediaStream::new(track.stream_id().to_string(), Vec::new()))
                    } else {
                        None
                    }
                }
                None => None,
            }
        };
        log::debug!("remote {} track {} removed", track.kind(), track.id());
        self.emit(&self.callbacks.remove_track, track.info().clone());
        if let Some(stream) = gone_stream {
            self.emit(&self.callbacks.remove_stream, stream);
        }
    }

    /// Pulls RTP off the remote track on the worker context. While the
    /// decoder bypass is on, still-encoded payloads go to the raw hooks; the
    /// read loop terminating is the track-removal signal either way.
    fn spawn_reader(self: Arc<Self>, track: MediaStreamTrack) {
        let weak = Arc::downgrade(&self);
        self.runtime.worker().spawn(async move {
            let remote = track.remote().clone();
            loop {
                let (packet, _attrs) = match remote.read_rtp().await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let Some(shared) = weak.upgrade() else { return };
                if shared.closed.load(Ordering::SeqCst) {
                    break;
                }
                if !shared.bypass.load(Ordering::SeqCst) {
                    continue;
                }
                let frame = RawFrame {
                    track_id: track.id().to_string(),
                    kind: track.kind(),
                    payload: packet.payload,
                    timestamp: packet.header.timestamp,
                    sequence_number: packet.header.sequence_number,
                    marker: packet.header.marker,
                };
                let slot = match track.kind() {
                    TrackKind::Audio => &shared.callbacks.raw_audio,
                    TrackKind::Video => &shared.callbacks.raw_video,
                };
                shared.emit(slot, frame);
            }
            if let Some(shared) = weak.upgrade() {
                shared.handle_track_removed(&track);
            }
        });
    }

    /// Applies the remote description, then drains the pending-candidate
    /// queue in insertion order, settling each entry's own promise. Per-entry
    /// failures do not abort the drain or roll anything back.
    async fn apply_remote(
        &self,
        desc: webrtc::peer_connection::sdp::session_description::RTCSessionDescription,
    ) -> Result<(), Error> {
        let mut queue = self.gate.lock().await;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(|e| Error::SdpTranslation(e.to_string()))?;
        for pending in queue.drain(..) {
            let applied = self
                .pc
                .add_ice_candidate(pending.candidate.to_engine())
                .await;
            match applied {
                Ok(()) => pending.completer.resolve(()),
                Err(e) => pending
                    .completer
                    .reject(Error::CandidateRejected(e.to_string())),
            }
        }
        Ok(())
    }
}

/// Drives one peer-to-peer session: negotiation, candidates, tracks, and
/// data channels, over the engine's media transport.
///
/// Every asynchronous operation returns a [Promise]; every event callback is
/// delivered from [Runtime::dispatch_events], so a host that pumps the loop
/// from a single thread never sees concurrent callbacks.
pub struct PeerCoordinator {
    shared: Arc<CoordinatorShared>,
}

impl PeerCoordinator {
    /// Builds a coordinator on `runtime` with the given configuration.
    ///
    /// Fails fast with [Error::Config] before the engine is touched when the
    /// configuration is structurally invalid. The engine factory work runs on
    /// the network context; this call waits for it.
    pub fn create(runtime: &Arc<Runtime>, config: Config) -> Result<Self, Error> {
        if runtime.is_shutdown() {
            return Err(Error::NotReady("runtime is shut down"));
        }
        config.validate()?;
        let rtc_config = config.engine_config();

        let (tx, rx) = std::sync::mpsc::channel();
        runtime.network().spawn(async move {
            let _ = tx.send(build_connection(rtc_config).await);
        });
        let (api, pc) = rx
            .recv()
            .map_err(|_| Error::Runtime("network context stopped during setup".into()))??;

        let shared = Arc::new(CoordinatorShared {
            runtime: runtime.clone(),
            pc,
            _api: api,
            callbacks: Callbacks::default(),
            registry: StdMutex::new(TrackRegistry::new()),
            streams: StdMutex::new(HashMap::new()),
            gate: Mutex::new(Vec::new()),
            set_local_busy: AtomicBool::new(false),
            set_remote_busy: AtomicBool::new(false),
            bypass: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            closed_emitted: AtomicBool::new(false),
            token: StdMutex::new(Some(runtime.dispatcher().token())),
        });
        install_observers(&shared);
        Ok(PeerCoordinator { shared })
    }

    /// Opens a data channel with `label`. Channels may be created before any
    /// negotiation has happened; they open once the session connects.
    pub fn create_data_channel(
        &self,
        label: &str,
        options: DataChannelOptions,
    ) -> Promise<DataChannel> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Promise::rejected(Error::Closed);
        }
        if let Err(e) = options.validate() {
            return Promise::rejected(e);
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        let label = label.to_string();
        self.shared.runtime.signaling().spawn(async move {
            let created = shared
                .pc
                .create_data_channel(&label, Some(options.to_engine()))
                .await;
            match created {
                Ok(dc) => completer.resolve(DataChannel::new(
                    dc,
                    Some(shared.runtime.dispatcher().clone()),
                )),
                Err(e) => completer.reject(Error::ChannelCreation(e.to_string())),
            }
        });
        promise
    }

    /// Synthesizes an offer describing everything this side wants to
    /// negotiate. With the default configuration that is bidirectional audio
    /// and video plus any channels created so far.
    pub fn create_offer(&self, options: OfferOptions) -> Promise<SessionDescription> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Promise::rejected(Error::Closed);
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        self.shared.runtime.signaling().spawn(async move {
            let result = shared
                .pc
                .create_offer(Some(RTCOfferOptions {
                    voice_activity_detection: options.voice_activity_detection,
                    ice_restart: options.ice_restart,
                }))
                .await
                .map(|d| SessionDescription::from_engine(&d))
                .map_err(|e| Error::Negotiation(e.to_string()));
            completer.settle(result);
        });
        promise
    }

    /// Synthesizes an answer to the currently applied remote offer.
    pub fn create_answer(&self, options: AnswerOptions) -> Promise<SessionDescription> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Promise::rejected(Error::Closed);
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        self.shared.runtime.signaling().spawn(async move {
            let result = shared
                .pc
                .create_answer(Some(RTCAnswerOptions {
                    voice_activity_detection: options.voice_activity_detection,
                }))
                .await
                .map(|d| SessionDescription::from_engine(&d))
                .map_err(|e| Error::Negotiation(e.to_string()));
            completer.settle(result);
        });
        promise
    }

    /// Applies a description produced locally. At most one set-local may be
    /// in flight; a concurrent second call is rejected with
    /// [Error::InFlight].
    pub fn set_local_description(&self, desc: SessionDescription) -> Promise<()> {
        self.set_description(desc, false)
    }

    /// Applies a description received from the remote peer. On success any
    /// candidates queued while no remote description existed are applied in
    /// insertion order, each settling its own promise.
    pub fn set_remote_description(&self, desc: SessionDescription) -> Promise<()> {
        self.set_description(desc, true)
    }

    fn set_description(&self, desc: SessionDescription, remote: bool) -> Promise<()> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Promise::rejected(Error::Closed);
        }
        let engine_desc = match desc.to_engine() {
            Ok(d) => d,
            Err(e) => return Promise::rejected(e),
        };
        let (guard, op) = if remote {
            (&self.shared.set_remote_busy, "set_remote_description")
        } else {
            (&self.shared.set_local_busy, "set_local_description")
        };
        if guard
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Promise::rejected(Error::InFlight(op));
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        self.shared.runtime.signaling().spawn(async move {
            let result = if remote {
                shared.apply_remote(engine_desc).await
            } else {
                shared
                    .pc
                    .set_local_description(engine_desc)
                    .await
                    .map_err(|e| Error::SdpTranslation(e.to_string()))
            };
            let guard = if remote {
                &shared.set_remote_busy
            } else {
                &shared.set_local_busy
            };
            guard.store(false, Ordering::SeqCst);
            completer.settle(result);
        });
        promise
    }

    /// Submits a remote ICE candidate.
    ///
    /// The candidate text is parsed locally first; garbage is rejected with
    /// [Error::SdpParse] before any queueing or engine involvement. While no
    /// remote description is applied the candidate is held back and its
    /// promise settles once it is actually applied during the drain.
    pub fn add_ice_candidate(&self, candidate: &IceCandidate) -> Promise<()> {
        if let Err(e) = candidate.validate() {
            return Promise::rejected(e);
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Promise::rejected(Error::Closed);
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        let candidate = candidate.clone();
        self.shared.runtime.signaling().spawn(async move {
            let mut queue = shared.gate.lock().await;
            let has_remote = shared.pc.remote_description().await.is_some();
            if has_remote {
                let applied = shared.pc.add_ice_candidate(candidate.to_engine()).await;
                match applied {
                    Ok(()) => completer.resolve(()),
                    Err(e) => completer.reject(Error::CandidateRejected(e.to_string())),
                }
            } else {
                queue.push(PendingCandidate {
                    candidate,
                    completer,
                });
            }
        });
        promise
    }

    /// Tears the session down. Idempotent and infallible: a second call gets
    /// an already-resolved promise and produces no further events.
    pub fn close(&self) -> Promise<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Promise::resolved(());
        }
        let (promise, completer) = Promise::channel(Some(self.shared.runtime.dispatcher()));
        let shared = self.shared.clone();
        self.shared.runtime.network().spawn(async move {
            {
                let mut queue = shared.gate.lock().await;
                for pending in queue.drain(..) {
                    pending.completer.reject(Error::Closed);
                }
            }
            if let Err(e) = shared.pc.close().await {
                log::warn!("engine close reported: {e}");
            }
            shared.clear_tracks();
            shared.emit_closed();
            completer.resolve(());
        });
        promise
    }

    /// Feeds still-encoded remote media to the raw hooks instead of (and
    /// regardless of) any downstream decoding.
    pub fn set_decoder_bypass(&self, enabled: bool) {
        self.shared.bypass.store(enabled, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    pub fn signaling_state(&self) -> SignalingState {
        SignalingState::from_engine(self.shared.pc.signaling_state())
    }

    pub fn ice_connection_state(&self) -> IceConnectionState {
        IceConnectionState::from_engine(self.shared.pc.ice_connection_state())
    }

    pub fn ice_gathering_state(&self) -> IceGatheringState {
        IceGatheringState::from_engine(self.shared.pc.ice_gathering_state())
    }

    /// Pending local description if one exists, else the current one, else
    /// the empty description.
    pub async fn local_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.local_description().await)
    }

    pub async fn current_local_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.current_local_description().await)
    }

    pub async fn pending_local_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.pending_local_description().await)
    }

    pub async fn remote_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.remote_description().await)
    }

    pub async fn current_remote_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.current_remote_description().await)
    }

    pub async fn pending_remote_description(&self) -> SessionDescription {
        SessionDescription::from_engine_opt(self.shared.pc.pending_remote_description().await)
    }

    /// Remote streams currently known, as a point-in-time copy.
    pub fn streams(&self) -> Vec<MediaStream> {
        let streams = self.shared.streams.lock().unwrap();
        streams
            .iter()
            .map(|(id, tracks)| MediaStream::new(id.clone(), tracks.clone()))
            .collect()
    }

    pub fn on_ice_candidate<F>(&self, f: F)
    where
        F: Fn(IceCandidate) + Send + Sync + 'static,
    {
        self.shared.callbacks.ice_candidate.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_add_track<F>(&self, f: F)
    where
        F: Fn(MediaStreamTrack) + Send + Sync + 'static,
    {
        self.shared.callbacks.add_track.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_remove_track<F>(&self, f: F)
    where
        F: Fn(TrackInfo) + Send + Sync + 'static,
    {
        self.shared.callbacks.remove_track.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_add_stream<F>(&self, f: F)
    where
        F: Fn(MediaStream) + Send + Sync + 'static,
    {
        self.shared.callbacks.add_stream.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_remove_stream<F>(&self, f: F)
    where
        F: Fn(MediaStream) + Send + Sync + 'static,
    {
        self.shared.callbacks.remove_stream.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_data_channel<F>(&self, f: F)
    where
        F: Fn(DataChannel) + Send + Sync + 'static,
    {
        self.shared.callbacks.data_channel.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_negotiation_needed<F>(&self, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .negotiation_needed
            .store(Some(Arc::new(Box::new(move |()| f()))));
    }

    pub fn on_signaling_state_change<F>(&self, f: F)
    where
        F: Fn(SignalingState) + Send + Sync + 'static,
    {
        self.shared.callbacks.signaling_state.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_ice_gathering_state_change<F>(&self, f: F)
    where
        F: Fn(IceGatheringState) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .ice_gathering_state
            .store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_ice_connection_state_change<F>(&self, f: F)
    where
        F: Fn(IceConnectionState) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .ice_connection_state
            .store(Some(Arc::new(Box::new(f))));
    }

    /// Invoked when previously gathered local candidates are invalidated.
    pub fn on_ice_candidates_removed<F>(&self, f: F)
    where
        F: Fn(Vec<IceCandidate>) + Send + Sync + 'static,
    {
        self.shared
            .callbacks
            .candidates_removed
            .store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_raw_video<F>(&self, f: F)
    where
        F: Fn(RawFrame) + Send + Sync + 'static,
    {
        self.shared.callbacks.raw_video.store(Some(Arc::new(Box::new(f))));
    }

    pub fn on_raw_audio<F>(&self, f: F)
    where
        F: Fn(RawFrame) + Send + Sync + 'static,
    {
        self.shared.callbacks.raw_audio.store(Some(Arc::new(Box::new(f))));
    }

    #[cfg(test)]
    fn pending_candidate_count(&self) -> usize {
        self.shared.gate.try_lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl AsRef<RTCPeerConnection> for PeerCoordinator {
    fn as_ref(&self) -> &RTCPeerConnection {
        &self.shared.pc
    }
}

impl std::fmt::Debug for PeerCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCoordinator")
            .field("signaling_state", &self.signaling_state())
            .field("closed", &self.is_closed())
            .finish()
    }
}

async fn build_connection(
    config: RTCConfiguration,
) -> Result<(API, Arc<RTCPeerConnection>), Error> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_default_codecs()?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    let api = APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build();

    let pc = Arc::new(api.new_peer_connection(config).await?);

    // Every session negotiates bidirectional audio and video up front.
    pc.add_transceiver_from_kind(TrackKind::Audio.to_engine(), None)
        .await?;
    pc.add_transceiver_from_kind(TrackKind::Video.to_engine(), None)
        .await?;

    Ok((api, pc))
}

fn install_observers(shared: &Arc<CoordinatorShared>) {
    let weak = Arc::downgrade(shared);
    shared.pc.on_ice_candidate(Box::new(move |candidate| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            match candidate {
                Some(candidate) => match IceCandidate::from_engine(&candidate) {
                    Ok(candidate) => shared.emit(&shared.callbacks.ice_candidate, candidate),
                    Err(e) => log::warn!("discarding unmappable local candidate: {e}"),
                },
                None => log::trace!("local candidate gathering finished"),
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    shared
        .pc
        .on_track(Box::new(move |track, _receiver, _transceiver| {
            let weak = weak.clone();
            Box::pin(async move {
                let Some(shared) = weak.upgrade() else { return };
                match MediaStreamTrack::new(track) {
                    Some(track) => shared.handle_track_added(track),
                    None => log::warn!("remote track of unspecified kind ignored"),
                }
            })
        }));

    let weak = Arc::downgrade(shared);
    shared.pc.on_data_channel(Box::new(move |dc| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            let channel = DataChannel::new(dc, Some(shared.runtime.dispatcher().clone()));
            shared.emit(&shared.callbacks.data_channel, channel);
        })
    }));

    let weak = Arc::downgrade(shared);
    shared.pc.on_negotiation_needed(Box::new(move || {
        let weak = weak.clone();
        Box::pin(async move {
            if let Some(shared) = weak.upgrade() {
                shared.emit(&shared.callbacks.negotiation_needed, ());
            }
        })
    }));

    let weak = Arc::downgrade(shared);
    shared.pc.on_signaling_state_change(Box::new(move |state| {
        let weak = weak.clone();
        Box::pin(async move {
            let Some(shared) = weak.upgrade() else { return };
            let state = SignalingState::from_engine(state);
            if state == SignalingState::Closed {
                shared.emit_closed();
                return;
            }
            shared.emit(&shared.callbacks.signaling_state, state);
        })
    }));

    let weak = Arc::downgrade(shared);
    shared
        .pc
        .on_ice_gathering_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.emit(
                        &shared.callbacks.ice_gathering_state,
                        IceGatheringState::from_gatherer(state),
                    );
                }
            })
        }));

    let weak = Arc::downgrade(shared);
    shared
        .pc
        .on_ice_connection_state_change(Box::new(move |state| {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(shared) = weak.upgrade() {
                    shared.emit(
                        &shared.callbacks.ice_connection_state,
                        IceConnectionState::from_engine(state),
                    );
                }
            })
        }));
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sdp::SdpKind;
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use std::sync::atomic::AtomicUsize;

    /// Runs the dispatch loop from a side thread so callback-driven tests
    /// make progress while the test body awaits.
    fn pump(runtime: &Arc<Runtime>) -> (Arc<AtomicBool>, std::thread::JoinHandle<()>) {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = stop.clone();
        let runtime = runtime.clone();
        let handle = std::thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                if !runtime.dispatch_events(false) {
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        });
        (stop, handle)
    }

    #[tokio::test]
    async fn fresh_coordinator_has_empty_descriptions() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let c = PeerCoordinator::create(&runtime, Config::default())?;

        assert!(c.local_description().await.is_empty());
        assert!(c.remote_description().await.is_empty());
        assert!(c.current_local_description().await.is_empty());
        assert!(c.pending_remote_description().await.is_empty());
        assert_eq!(c.signaling_state(), SignalingState::Stable);
        assert_eq!(c.ice_gathering_state(), IceGatheringState::New);
        assert_eq!(c.ice_connection_state(), IceConnectionState::New);

        c.close().await?;
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn offer_negotiates_audio_and_video_and_applies_locally() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let c = PeerCoordinator::create(&runtime, Config::default())?;

        let offer = c.create_offer(OfferOptions::default()).await?;
        assert_eq!(offer.kind, SdpKind::Offer);
        assert!(offer.sdp.contains("m=audio"));
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("sendrecv"));

        c.set_local_description(offer.clone()).await?;
        let applied = c.local_description().await;
        assert!(!applied.is_empty());
        assert_eq!(applied.kind, SdpKind::Offer);
        assert_eq!(c.signaling_state(), SignalingState::HaveLocalOffer);
        // Not yet negotiated to completion, so nothing is current.
        assert!(c.current_local_description().await.is_empty());
        assert!(!c.pending_local_description().await.is_empty());

        c.close().await?;
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn overlapping_set_local_rejects_the_second_caller() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let c = PeerCoordinator::create(&runtime, Config::default())?;
        let offer = c.create_offer(OfferOptions::default()).await?;

        // The guard is taken at call time, before the engine work runs, so
        // the second call loses while the first is still outstanding.
        let winner = c.set_local_description(offer.clone());
        let loser = c.set_local_description(offer);
        assert!(matches!(loser.await, Err(Error::InFlight(_))));
        winner.await?;

        // Once the winner settles the guard is free again.
        let refreshed = c.create_offer(OfferOptions::default()).await?;
        c.set_local_description(refreshed).await?;

        c.close().await?;
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn unparsable_candidate_is_rejected_without_queueing() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let c = PeerCoordinator::create(&runtime, Config::default())?;

        let garbage = IceCandidate {
            candidate: "not a candidate at all".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        };
        let result = c.add_ice_candidate(&garbage).await;
        assert!(matches!(result, Err(Error::SdpParse(_))));
        assert_eq!(c.pending_candidate_count(), 0);

        c.close().await?;
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn early_candidates_wait_for_remote_and_drain_in_order() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let offerer = PeerCoordinator::create(&runtime, Config::default())?;
        let answerer = PeerCoordinator::create(&runtime, Config::default())?;
        let (stop, pump_thread) = pump(&runtime);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        offerer.on_ice_candidate(move |c| {
            let _ = tx.send(c);
        });

        let offer = offerer.create_offer(OfferOptions::default()).await?;
        offerer.set_local_description(offer.clone()).await?;

        // Take a couple of host candidates from the offerer and hand them to
        // the answerer before it has any remote description.
        let mut promises = Vec::new();
        for _ in 0..2 {
            let candidate = rx.recv().await.expect("candidate gathering produced none");
            promises.push(answerer.add_ice_candidate(&candidate));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for p in &promises {
            assert!(p.try_result().is_none());
        }
        assert_eq!(answerer.pending_candidate_count(), 2);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut tracked = Vec::new();
        for (i, p) in promises.into_iter().enumerate() {
            let order = order.clone();
            tracked.push(p.on_resolve(move |()| {
                order.blocking_lock().push(i);
            }));
        }

        answerer.set_remote_description(offer).await?;
        for p in tracked {
            p.await?;
        }
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while order.lock().await.len() < 2 && std::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(*order.lock().await, vec![0, 1]);
        assert_eq!(answerer.pending_candidate_count(), 0);

        offerer.close().await?;
        answerer.close().await?;
        stop.store(true, Ordering::SeqCst);
        pump_thread.join().unwrap();
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn close_twice_produces_one_closed_transition() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let c = PeerCoordinator::create(&runtime, Config::default())?;
        let (stop, pump_thread) = pump(&runtime);

        let closed_events = Arc::new(AtomicUsize::new(0));
        let counter = closed_events.clone();
        c.on_signaling_state_change(move |state| {
            if state == SignalingState::Closed {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        c.close().await?;
        c.close().await?;

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while closed_events.load(Ordering::SeqCst) == 0
            && std::time::Instant::now() < deadline
        {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(closed_events.load(Ordering::SeqCst), 1);
        assert!(c.is_closed());

        stop.store(true, Ordering::SeqCst);
        pump_thread.join().unwrap();
        runtime.shutdown();
        Ok(())
    }

    #[tokio::test]
    async fn data_channel_round_trip_between_two_coordinators() -> Result<(), Error> {
        let runtime = Runtime::new()?;
        let offerer = Arc::new(PeerCoordinator::create(&runtime, Config::default())?);
        let answerer = Arc::new(PeerCoordinator::create(&runtime, Config::default())?);
        let (stop, pump_thread) = pump(&runtime);

        // Trickle candidates both ways as they are gathered.
        let (tx_a, mut rx_a) = tokio::sync::mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = tokio::sync::mpsc::unbounded_channel();
        offerer.on_ice_candidate(move |c| {
            let _ = tx_a.send(c);
        });
        answerer.on_ice_candidate(move |c| {
            let _ = tx_b.send(c);
        });
        {
            let answerer = answerer.clone();
            tokio::spawn(async move {
                while let Some(c) = rx_a.recv().await {
                    let _ = answerer.add_ice_candidate(&c);
                }
            });
        }
        {
            let offerer = offerer.clone();
            tokio::spawn(async move {
                while let Some(c) = rx_b.recv().await {
                    let _ = offerer.add_ice_candidate(&c);
                }
            });
        }

        let (dc_tx, mut dc_rx) = tokio::sync::mpsc::unbounded_channel();
        answerer.on_data_channel(move |dc| {
            let _ = dc_tx.send(dc);
        });

        // Channel created before any negotiation has run.
        let mut dc1 = offerer
            .create_data_channel("chat", DataChannelOptions::default())
            .await?;

        let offer = offerer.create_offer(OfferOptions::default()).await?;
        offerer.set_local_description(offer.clone()).await?;
        answerer.set_remote_description(offer).await?;
        let answer = answerer.create_answer(AnswerOptions::default()).await?;
        answerer.set_local_description(answer.clone()).await?;
        offerer.set_remote_description(answer).await?;

        let mut dc2 = dc_rx.recv().await.expect("remote channel never announced");
        assert_eq!(dc2.label(), "chat");
        // The read is armed while dc2 may still be connecting; the payload
        // itself has to wake it, not the open transition.
        let reader = tokio::spawn(async move { dc2.next().await });

        assert!(dc1.ready().await?);
        assert_eq!(dc1.label(), "chat");

        let payload = Bytes::from_static(b"hello");
        dc1.send(payload.clone()).await?;
        let received = tokio::time::timeout(Duration::from_secs(10), reader)
            .await
            .expect("read never completed")
            .unwrap()
            .expect("channel closed early")?;
        assert_eq!(received, payload);

        offerer.close().await?;
        answerer.close().await?;
        stop.store(true, Ordering::SeqCst);
        pump_thread.join().unwrap();
        runtime.shutdown();
        Ok(())
    }
}
