use crate::dispatch::Dispatcher;
use crate::error::Error;
use crate::event::EventToken;
use arc_swap::ArcSwap;
use bytes::Bytes;
use futures_util::Future;
use futures_util::{ready, Sink, Stream};
use std::future::poll_fn;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::ReusableBoxFuture;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

/// Lifecycle of a data channel as reported by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    fn from_engine(state: RTCDataChannelState) -> Self {
        match state {
            RTCDataChannelState::Connecting | RTCDataChannelState::Unspecified => {
                ChannelState::Connecting
            }
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
        }
    }
}

/// Reliability and identity parameters for a locally created channel.
///
/// Defaults give an ordered, fully reliable channel, which is what the
/// engine negotiates when nothing is specified.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct DataChannelOptions {
    /// `None` means ordered; carried as an option to round-trip the engine's
    /// tri-state wire form.
    pub ordered: Option<bool>,
    /// Milliseconds a message may spend in retransmission before being given
    /// up on. Mutually exclusive with `max_retransmits`.
    pub max_packet_life_time: Option<u16>,
    pub max_retransmits: Option<u16>,
    pub protocol: Option<String>,
    /// Explicit stream id. Only meaningful together with `negotiated`.
    pub id: Option<u16>,
    /// Marks the channel as negotiated out of band: both sides create it
    /// with the same `id` and no in-band announcement happens.
    pub negotiated: bool,
}

impl DataChannelOptions {
    pub(crate) fn validate(&self) -> Result<(), Error> {
        if self.max_packet_life_time.is_some() && self.max_retransmits.is_some() {
            return Err(Error::ChannelCreation(
                "max_packet_life_time and max_retransmits are mutually exclusive".into(),
            ));
        }
        match (self.negotiated, self.id) {
            (true, None) => Err(Error::ChannelCreation(
                "negotiated channel requires an explicit id".into(),
            )),
            (false, Some(_)) => Err(Error::ChannelCreation(
                "explicit id requires the negotiated flag".into(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn to_engine(&self) -> RTCDataChannelInit {
        RTCDataChannelInit {
            ordered: self.ordered,
            max_packet_life_time: self.max_packet_life_time,
            max_retransmits: self.max_retransmits,
            protocol: self.protocol.clone(),
            // The engine folds the negotiated flag and the id into one field.
            negotiated: if self.negotiated { self.id } else { None },
        }
    }
}

/// Message-oriented byte pipe over the coordinator's transport.
///
/// Incoming payloads arrive through the [Stream] impl, outgoing ones go
/// through the [Sink] impl; both wait for the channel to finish opening
/// before touching the engine.
pub struct DataChannel {
    dc: Arc<RTCDataChannel>,
    status: Arc<ArcSwap<StreamState>>,
    dispatcher: Option<Dispatcher>,
    /// Stash for received payloads waiting to be read.
    sender: UnboundedSender<Result<Option<Bytes>, Error>>,
    /// Shared across clones; whichever handle polls first gets the payload.
    receiver: Arc<Mutex<UnboundedReceiver<Result<Option<Bytes>, Error>>>>,
    /// Send-side sub-state. Only meaningful while `status` is open.
    sink_state: SinkState,
    /// Awaiter reused across sends. While the channel is still connecting it
    /// waits for open; while open and `Awaiting` it waits for the engine
    /// send to finish.
    send_waiter: ReusableBoxFuture<'static, Result<(), Error>>,
}

impl DataChannel {
    pub(crate) fn new(dc: Arc<RTCDataChannel>, dispatcher: Option<Dispatcher>) -> Self {
        let (sender, receiver) = unbounded_channel();
        let token = dispatcher.as_ref().map(|d| d.token());
        let status = Arc::new(ArcSwap::new(StreamState::connecting(token)));
        let s = Arc::downgrade(&status);
        dc.on_open(Box::new(move || {
            let s = s.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    status.rcu(|old| match &**old {
                        StreamState::Connecting { ready, token } => {
                            ready.notify_waiters();
                            // Clone re-acquires before the old state's copy
                            // releases, so pending-work never dips to zero.
                            StreamState::open(token.clone())
                        }
                        _ => old.clone(),
                    });
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_close(Box::new(move || {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let old = status.swap(StreamState::closed_gracefully());
                    match &*old {
                        StreamState::Connecting { ready, .. } => {
                            ready.notify_waiters();
                            let _ = tx.send(Ok(None));
                        }
                        StreamState::Open { .. } => {
                            let _ = tx.send(Ok(None));
                        }
                        StreamState::Closed { .. } => {}
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_error(Box::new(move |e| {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let error: Error = e.into();
                    let old = status.swap(StreamState::failed(error.clone()));
                    match &*old {
                        StreamState::Connecting { ready, .. } => {
                            ready.notify_waiters();
                            let _ = tx.send(Err(error));
                        }
                        StreamState::Open { .. } => {
                            let _ = tx.send(Err(error));
                        }
                        StreamState::Closed { .. } => {}
                    }
                }
            })
        }));
        let s = Arc::downgrade(&status);
        let tx = sender.clone();
        dc.on_message(Box::new(move |msg| {
            let s = s.clone();
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(status) = s.upgrade() {
                    let status = Self::ready_internal(&status).await;
                    if status.is_open() {
                        let _ = tx.send(Ok(Some(msg.data)));
                    }
                }
            })
        }));
        let send_waiter = Self::wait_for_open(status.clone());
        DataChannel {
            dc,
            status,
            dispatcher,
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            sink_state: SinkState::Idle,
            send_waiter,
        }
    }

    fn wait_for_open(
        status: Arc<ArcSwap<StreamState>>,
    ) -> ReusableBoxFuture<'static, Result<(), Error>> {
        ReusableBoxFuture::new(async move {
            match &*Self::ready_internal(&status).await {
                StreamState::Open { .. } => Ok(()),
                StreamState::Closed { reason } => match reason {
                    Some(reason) => Err(reason.clone()),
                    None => Ok(()),
                },
                StreamState::Connecting { .. } => Err(Error::NotReady("data channel")),
            }
        })
    }

    pub fn label(&self) -> &str {
        self.dc.label()
    }

    /// Negotiated stream id. Zero until the transport assigns one.
    pub fn id(&self) -> u16 {
        self.dc.id()
    }

    pub fn protocol(&self) -> &str {
        self.dc.protocol()
    }

    pub fn ordered(&self) -> bool {
        self.dc.ordered()
    }

    /// Engine-reported lifecycle state.
    pub fn ready_state(&self) -> ChannelState {
        ChannelState::from_engine(self.dc.ready_state())
    }

    pub fn is_open(&self) -> bool {
        self.status.load().is_open()
    }

    pub fn is_closed(&self) -> bool {
        self.status.load().is_closed()
    }

    /// Bytes accepted for sending but not yet handed to the transport.
    pub async fn buffered_amount(&self) -> usize {
        self.dc.buffered_amount().await
    }

    /// Installs `f` to fire whenever the send buffer drains below
    /// `threshold` bytes. The callback is delivered through the dispatch
    /// loop when the channel belongs to a coordinator.
    pub async fn set_buffered_amount_low<F>(&self, threshold: usize, f: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        let dispatcher = self.dispatcher.clone();
        let f = Arc::new(f);
        self.dc.set_buffered_amount_low_threshold(threshold).await;
        self.dc
            .on_buffered_amount_low(Box::new(move || {
                let f = f.clone();
                let dispatcher = dispatcher.clone();
                Box::pin(async move {
                    match &dispatcher {
                        Some(d) => {
                            if d.schedule(move || f(), std::time::Duration::ZERO).is_err() {
                                log::trace!("buffered-amount-low event after shutdown");
                            }
                        }
                        None => f(),
                    }
                })
            }))
            .await;
    }

    /// Waits until the channel leaves the connecting state.
    ///
    /// `Ok(true)` once open, `Ok(false)` if it closed gracefully first,
    /// `Err` if it failed while opening.
    pub async fn ready(&self) -> Result<bool, Error> {
        let status = Self::ready_internal(&self.status).await;
        match &*status {
            StreamState::Open { .. } => Ok(true),
            StreamState::Closed { reason } => match reason {
                Some(reason) => Err(reason.clone()),
                None => Ok(false),
            },
            StreamState::Connecting { .. } => Err(Error::NotReady("data channel")),
        }
    }

    async fn close_internal(&mut self) -> Result<(), Error> {
        self.status.rcu(|old| match &**old {
            StreamState::Connecting { ready, .. } => {
                ready.notify_waiters();
                StreamState::closed_gracefully()
            }
            StreamState::Open { .. } => StreamState::closed_gracefully(),
            StreamState::Closed { .. } => old.clone(),
        });
        let _ = self.sender.send(Ok(None));
        self.receiver.lock().await.close();
        if self.sink_state == SinkState::Awaiting {
            poll_fn(|cx| self.send_waiter.poll(cx)).await?;
        }
        self.dc.close().await?;
        self.sender.closed().await;

        Ok(())
    }

    async fn ready_internal(status: &Arc<ArcSwap<StreamState>>) -> Arc<StreamState> {
        loop {
            let status = status.load_full();
            match &*status {
                StreamState::Open { .. } | StreamState::Closed { .. } => return status,
                StreamState::Connecting { ready, .. } => {
                    ready.notified().await;
                }
            }
        }
    }

    /// Waits directly on the buffer rather than on the open notification:
    /// a payload or closing sentinel posted between two polls stays queued,
    /// so a recreated future cannot miss it.
    async fn recv_internal(&self) -> Option<Result<Bytes, Error>> {
        let mut receiver = self.receiver.lock().await;
        match receiver.recv().await? {
            Ok(None) => {
                receiver.close();
                None
            }
            Ok(Some(payload)) => Some(Ok(payload)),
            Err(err) => {
                receiver.close();
                Some(Err(err))
            }
        }
    }
}

impl Stream for DataChannel {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut fut = Box::pin(self.recv_internal());
        unsafe { Pin::new_unchecked(&mut fut) }.poll(cx)
    }
}

impl std::fmt::Debug for DataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataChannel")
            .field("label", &self.dc.label())
            .field("state", &self.ready_state())
            .finish()
    }
}

impl AsRef<RTCDataChannel> for DataChannel {
    fn as_ref(&self) -> &RTCDataChannel {
        &self.dc
    }
}

/// Clones share the channel and its receive buffer; each handle carries its
/// own send machinery so concurrent sinks do not trample one another.
impl Clone for DataChannel {
    fn clone(&self) -> Self {
        DataChannel {
            dc: self.dc.clone(),
            status: self.status.clone(),
            dispatcher: self.dispatcher.clone(),
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            sink_state: SinkState::Idle,
            send_waiter: Self::wait_for_open(self.status.clone()),
        }
    }
}

/// Internal open/close machine. The liveness token rides along while the
/// channel is connecting or open and is released exactly when the state
/// reaches `Closed`.
#[derive(Debug)]
enum StreamState {
    Connecting {
        ready: Notify,
        token: Option<EventToken>,
    },
    Open {
        token: Option<EventToken>,
    },
    Closed {
        reason: Option<Error>,
    },
}

impl StreamState {
    fn connecting(token: Option<EventToken>) -> Arc<Self> {
        Arc::new(StreamState::Connecting {
            ready: Notify::new(),
            token,
        })
    }

    fn open(token: Option<EventToken>) -> Arc<Self> {
        Arc::new(StreamState::Open { token })
    }

    fn closed_gracefully() -> Arc<Self> {
        Arc::new(StreamState::Closed { reason: None })
    }

    fn failed(reason: Error) -> Arc<Self> {
        Arc::new(StreamState::Closed {
            reason: Some(reason),
        })
    }

    fn is_open(&self) -> bool {
        matches!(self, StreamState::Open { .. })
    }

    fn is_closed(&self) -> bool {
        matches!(self, StreamState::Closed { .. })
    }
}

#[derive(Debug, Copy, Clone, PartialOrd, PartialEq)]
enum SinkState {
    Idle,
    Awaiting,
}

impl Sink<Bytes> for DataChannel {
    type Error = Error;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &**self.status.load() {
            StreamState::Open { .. } => match &mut self.sink_state {
                SinkState::Idle => Poll::Ready(Ok(())),
                SinkState::Awaiting => {
                    let res = ready!(self.send_waiter.poll(cx));
                    self.sink_state = SinkState::Idle;
                    Poll::Ready(res)
                }
            },
            StreamState::Connecting { .. } => {
                // While connecting, send_waiter is the wait-for-open future.
                self.send_waiter.poll(cx)
            }
            StreamState::Closed { .. } => Poll::Ready(Err(Error::Closed)),
        }
    }

    fn start_send(mut self: Pin<&mut Self>, item: Bytes) -> Result<(), Self::Error> {
        let dc = self.dc.clone();
        self.send_waiter.set(async move {
            dc.send(&item).await?;
            Ok(())
        });
        self.sink_state = SinkState::Awaiting;
        Ok(())
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        match &self.sink_state {
            SinkState::Idle => {
                if self.status.load().is_closed() {
                    Poll::Ready(Err(Error::Closed))
                } else {
                    Poll::Ready(Ok(()))
                }
            }
            SinkState::Awaiting => {
                let res = ready!(self.send_waiter.poll(cx));
                self.sink_state = SinkState::Idle;
                Poll::Ready(res)
            }
        }
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let mut fut = Box::pin(self.close_internal());
        Pin::new(&mut fut).poll(cx)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn conflicting_reliability_options_are_rejected() {
        let options = DataChannelOptions {
            max_packet_life_time: Some(500),
            max_retransmits: Some(3),
            ..Default::default()
        };
        assert!(matches!(
            options.validate(),
            Err(Error::ChannelCreation(_))
        ));
    }

    #[test]
    fn options_translate_field_for_field() {
        let options = DataChannelOptions {
            ordered: Some(false),
            max_retransmits: Some(3),
            protocol: Some("chat".into()),
            id: Some(42),
            negotiated: true,
            ..Default::default()
        };
        options.validate().unwrap();
        let init = options.to_engine();
        assert_eq!(init.ordered, Some(false));
        assert_eq!(init.max_retransmits, Some(3));
        assert_eq!(init.max_packet_life_time, None);
        assert_eq!(init.protocol.as_deref(), Some("chat"));
        assert_eq!(init.negotiated, Some(42));
    }

    #[test]
    fn id_and_negotiated_must_come_together() {
        let id_only = DataChannelOptions {
            id: Some(7),
            ..Default::default()
        };
        assert!(matches!(
            id_only.validate(),
            Err(Error::ChannelCreation(_))
        ));
        let negotiated_only = DataChannelOptions {
            negotiated: true,
            ..Default::default()
        };
        assert!(matches!(
            negotiated_only.validate(),
            Err(Error::ChannelCreation(_))
        ));
    }

    #[test]
    fn default_options_leave_the_engine_defaults_alone() {
        let init = DataChannelOptions::default().to_engine();
        assert_eq!(init.ordered, None);
        assert_eq!(init.max_packet_life_time, None);
        assert_eq!(init.max_retransmits, None);
        assert_eq!(init.negotiated, None);
    }

    #[test]
    fn engine_states_collapse_to_four() {
        assert_eq!(
            ChannelState::from_engine(RTCDataChannelState::Unspecified),
            ChannelState::Connecting
        );
        assert_eq!(
            ChannelState::from_engine(RTCDataChannelState::Open),
            ChannelState::Open
        );
        assert_eq!(
            ChannelState::from_engine(RTCDataChannelState::Closed),
            ChannelState::Closed
        );
    }
}
