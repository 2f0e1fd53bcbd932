use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_remote::TrackRemote;

/// Media flavor of a track. Maps onto the engine codec type; the engine's
/// `Unspecified` never escapes this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    pub(crate) fn from_engine(kind: RTPCodecType) -> Option<Self> {
        match kind {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            RTPCodecType::Unspecified => None,
        }
    }

    pub(crate) fn to_engine(self) -> RTPCodecType {
        match self {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Identity of a track, detached from its engine handle so that registry
/// bookkeeping stays cheap to clone and compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackInfo {
    pub id: String,
    pub stream_id: String,
    pub kind: TrackKind,
}

/// Common face of a media track, remote or otherwise.
pub trait MediaTrack {
    fn id(&self) -> &str;
    fn kind(&self) -> TrackKind;
    /// Whether the source has stopped producing media for good.
    fn ended(&self) -> bool;
}

/// A remote media track surfaced by the negotiation layer.
#[derive(Clone)]
pub struct MediaStreamTrack {
    info: TrackInfo,
    remote: Arc<TrackRemote>,
    ended: Arc<AtomicBool>,
}

impl MediaStreamTrack {
    pub(crate) fn new(remote: Arc<TrackRemote>) -> Option<Self> {
        let kind = TrackKind::from_engine(remote.kind())?;
        Some(MediaStreamTrack {
            info: TrackInfo {
                id: remote.id(),
                stream_id: remote.stream_id(),
                kind,
            },
            remote,
            ended: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Id of the media stream this track belongs to.
    pub fn stream_id(&self) -> &str {
        &self.info.stream_id
    }

    pub fn info(&self) -> &TrackInfo {
        &self.info
    }

    pub(crate) fn remote(&self) -> &Arc<TrackRemote> {
        &self.remote
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }
}

impl MediaTrack for MediaStreamTrack {
    fn id(&self) -> &str {
        &self.info.id
    }

    fn kind(&self) -> TrackKind {
        self.info.kind
    }

    fn ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for MediaStreamTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStreamTrack")
            .field("id", &self.info.id)
            .field("stream_id", &self.info.stream_id)
            .field("kind", &self.info.kind)
            .finish()
    }
}

/// Grouping of tracks sharing a stream id, as announced by the remote peer.
#[derive(Debug, Clone, Default)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaStreamTrack>,
}

impl MediaStream {
    pub(crate) fn new(id: String, tracks: Vec<MediaStreamTrack>) -> Self {
        MediaStream { id, tracks }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaStreamTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaStreamTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &MediaStreamTrack> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn get_track_by_id(&self, id: &str) -> Option<&MediaStreamTrack> {
        self.tracks.iter().find(|t| t.id() == id)
    }
}

/// What changed between two sightings of the remote track set. Removals are
/// listed before additions because consumers must tear down stale tracks
/// before wiring replacements that may reuse a stream id.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct TrackDelta {
    pub removed: Vec<TrackInfo>,
    pub added: Vec<TrackInfo>,
}

impl TrackDelta {
    pub(crate) fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }

    /// Flattens into per-track events, removals first.
    pub(crate) fn into_events(self) -> Vec<TrackEvent> {
        self.removed
            .into_iter()
            .map(TrackEvent::Removed)
            .chain(self.added.into_iter().map(TrackEvent::Added))
            .collect()
    }
}

/// A single membership change in the remote track set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TrackEvent {
    Added(TrackInfo),
    Removed(TrackInfo),
}

/// Cache of tracks already announced to the consumer, keyed by track id.
///
/// The engine reports tracks both incrementally and as whole-set snapshots;
/// the registry turns either into an exact add/remove delta so consumers
/// never see a duplicate announcement.
#[derive(Debug, Default)]
pub(crate) struct TrackRegistry {
    tracks: HashMap<String, TrackInfo>,
}

impl TrackRegistry {
    pub(crate) fn new() -> Self {
        TrackRegistry::default()
    }

    /// Records one newly seen track. Returns `false` when the id is already
    /// known, meaning no announcement should be made.
    pub(crate) fn insert(&mut self, info: TrackInfo) -> bool {
        use std::collections::hash_map::Entry;
        match self.tracks.entry(info.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(info);
                true
            }
        }
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<TrackInfo> {
        self.tracks.remove(id)
    }

    /// Reconciles the cache against a full snapshot, returning what vanished
    /// and what is new. Known tracks present in both are untouched.
    pub(crate) fn sync(&mut self, snapshot: &[TrackInfo]) -> TrackDelta {
        let mut delta = TrackDelta::default();
        let keep: HashMap<&str, &TrackInfo> =
            snapshot.iter().map(|t| (t.id.as_str(), t)).collect();
        let stale: Vec<String> = self
            .tracks
            .keys()
            .filter(|id| !keep.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(info) = self.tracks.remove(&id) {
                delta.removed.push(info);
            }
        }
        for info in snapshot {
            if self.insert(info.clone()) {
                delta.added.push(info.clone());
            }
        }
        delta
    }
}

/// One media unit lifted out of the engine's receive path before decoding.
///
/// Frames are delivered in arrival order per track, on the worker context,
/// carrying the RTP-level payload untouched.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub track_id: String,
    pub kind: TrackKind,
    pub payload: Bytes,
    pub timestamp: u32,
    pub sequence_number: u16,
    pub marker: bool,
}
