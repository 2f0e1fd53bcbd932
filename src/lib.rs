//! `peerlink` wraps a native [webrtc](https://webrtc.rs) engine into a peer
//! session layer driven by a host-owned event loop:
//! - Negotiation (offers, answers, ICE candidates) is exposed as explicit
//!   operations returning [Promise]s instead of nested callbacks.
//! - Every event callback is delivered from [Runtime::dispatch_events], so a
//!   host pumping the loop from one thread never sees concurrent callbacks.
//! - Remote candidates arriving before the remote description are queued and
//!   applied in arrival order once a description lands.
//! - Data channels implement Stream and Sink, remote tracks can hand their
//!   still-encoded payloads to raw media hooks.
//!
//! # Examples
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use futures_util::{SinkExt, StreamExt};
//! use peerlink::{
//!     AnswerOptions, Config, DataChannelOptions, Error, OfferOptions, PeerCoordinator, Runtime,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     let runtime = Runtime::new()?;
//!     let caller = PeerCoordinator::create(&runtime, Config::default())?;
//!     let callee = PeerCoordinator::create(&runtime, Config::default())?;
//!
//!     // In a real deployment candidates travel over an out-of-band
//!     // signaling transport. Here both peers live in one process.
//!     let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
//!     caller.on_ice_candidate(move |candidate| {
//!         let _ = tx.send(candidate);
//!     });
//!
//!     // Callbacks only fire while somebody pumps the loop.
//!     let pump = runtime.clone();
//!     std::thread::spawn(move || while pump.dispatch_events(true) {});
//!
//!     let mut chat = caller
//!         .create_data_channel("chat", DataChannelOptions::default())
//!         .await?;
//!
//!     let offer = caller.create_offer(OfferOptions::default()).await?;
//!     caller.set_local_description(offer.clone()).await?;
//!     callee.set_remote_description(offer).await?;
//!     let answer = callee.create_answer(AnswerOptions::default()).await?;
//!     callee.set_local_description(answer.clone()).await?;
//!     caller.set_remote_description(answer).await?;
//!     while let Some(candidate) = rx.recv().await {
//!         callee.add_ice_candidate(&candidate).await?;
//!     }
//!
//!     chat.ready().await?;
//!     chat.send(Bytes::from_static(b"hello")).await?;
//!
//!     caller.close().await?;
//!     callee.close().await?;
//!     runtime.shutdown();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod data_channel;
pub mod dispatch;
pub mod error;
mod event;
pub mod media;
pub mod peer_connection;
pub mod promise;
pub mod runtime;
pub mod sdp;

pub use config::{BundlePolicy, Config, IceServer, IceTransportPolicy, RtcpMuxPolicy};
pub use data_channel::{ChannelState, DataChannel, DataChannelOptions};
pub use dispatch::Dispatcher;
pub use error::Error;
pub use media::{
    MediaStream, MediaStreamTrack, MediaTrack, RawFrame, TrackInfo, TrackKind,
};
pub use peer_connection::{
    AnswerOptions, IceConnectionState, IceGatheringState, OfferOptions, PeerCoordinator,
    SignalingState,
};
pub use promise::Promise;
pub use runtime::Runtime;
pub use sdp::{IceCandidate, SdpKind, SessionDescription};
