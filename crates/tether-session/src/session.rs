//! Session handle.
//!
//! A [`Session`] owns the multiplexer for one established session. It issues
//! requests on the requester view, routes the peer's responses back to the
//! [`RequesterStream`] that asked, hands the peer's requests to a
//! [`Responder`], and runs the control channel (keepalive, connection errors).

use crate::keepalive::{KeepAliveTick, KeepAliveTracker};
use crate::multiplexer::{ConnectionMultiplexer, MuxView, ViewSender};
use crate::resumable::ResumableConnection;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tether_core::{
    ErrorCode, ErrorFrame, Frame, FrameType, KeepAliveConfig, KeepaliveFrame, Payload, Role,
    SessionState, StreamId, StreamIdAllocator, TetherError,
};
use tether_transport::{BoxFuture, Lifecycle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::Stream;
use tracing::{debug, trace, warn};

type Streams = Arc<Mutex<HashMap<StreamId, tokio::sync::mpsc::UnboundedSender<Frame>>>>;

/// Handles frames on streams the peer issues
pub trait Responder: Send + Sync + 'static {
    /// Handle one frame; called sequentially in arrival order
    ///
    /// Long-running work should be spawned so later frames are not held up.
    /// An error is answered with APPLICATION_ERROR on the frame's stream.
    fn handle_frame(&self, frame: Frame, responses: ViewSender) -> BoxFuture<Result<(), TetherError>>;
}

type ResponderFn = Arc<dyn Fn(Frame, ViewSender) -> BoxFuture<Result<(), TetherError>> + Send + Sync>;

/// Responder backed by an async closure
#[derive(Clone)]
pub struct FnResponder {
    handler: ResponderFn,
}

impl FnResponder {
    pub fn new<F, Fut>(handler: F) -> Self
    where
        F: Fn(Frame, ViewSender) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), TetherError>> + Send + 'static,
    {
        let handler = Arc::new(move |frame: Frame, responses: ViewSender| {
            Box::pin(handler(frame, responses)) as BoxFuture<_>
        });
        Self { handler }
    }
}

impl Responder for FnResponder {
    fn handle_frame(&self, frame: Frame, responses: ViewSender) -> BoxFuture<Result<(), TetherError>> {
        (self.handler)(frame, responses)
    }
}

/// Rejects every request that expects a response
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectingResponder;

impl Responder for RejectingResponder {
    fn handle_frame(&self, frame: Frame, responses: ViewSender) -> BoxFuture<Result<(), TetherError>> {
        Box::pin(async move {
            if frame.frame_type.is_request() && frame.frame_type != FrameType::RequestFnf {
                responses
                    .send(Frame::error(
                        frame.stream_id,
                        ErrorCode::REJECTED,
                        "no responder",
                    ))
                    .await?;
            }
            Ok(())
        })
    }
}

struct Inner {
    role: Role,
    ids: StreamIdAllocator,
    requester: ViewSender,
    control: ViewSender,
    streams: Streams,
    multiplexer: ConnectionMultiplexer,
    resumable: Option<ResumableConnection>,
    lifecycle: Lifecycle,
}

/// Handle to an established session
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Start session processing over `multiplexer`
    ///
    /// `control` is the multiplexer's control view, already used for the
    /// setup handshake. When `keepalive` is given this side sends keepalive
    /// ticks and enforces acknowledgments.
    pub fn start(
        multiplexer: ConnectionMultiplexer,
        control: MuxView,
        resumable: Option<ResumableConnection>,
        keepalive: Option<KeepAliveConfig>,
    ) -> Result<Session, TetherError> {
        let role = multiplexer.role();
        let requester_view = multiplexer
            .requester_view()
            .ok_or_else(|| TetherError::Protocol("requester view already taken".to_string()))?;
        let lifecycle = multiplexer.lifecycle().clone();
        let streams: Streams = Arc::new(Mutex::new(HashMap::new()));
        let tracker = keepalive
            .as_ref()
            .map(|config| Arc::new(Mutex::new(KeepAliveTracker::new(config))));

        let inner = Arc::new(Inner {
            role,
            ids: StreamIdAllocator::for_role(role),
            requester: requester_view.sender(),
            control: control.sender(),
            streams: streams.clone(),
            multiplexer,
            resumable: resumable.clone(),
            lifecycle: lifecycle.clone(),
        });

        tokio::spawn(route_responses(requester_view, streams, role));
        tokio::spawn(control_loop(control, lifecycle.clone(), tracker.clone(), role));

        if let (Some(config), Some(tracker)) = (keepalive, tracker) {
            if !config.interval.is_zero() {
                tokio::spawn(keepalive_loop(
                    config,
                    tracker,
                    inner.control.clone(),
                    lifecycle,
                    resumable,
                ));
            }
        }

        debug!(%role, resumable = inner.resumable.is_some(), "session started");
        Ok(Session { inner })
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Serve the peer's requests with `responder`; may be called once
    pub fn serve(&self, responder: Arc<dyn Responder>) -> Result<(), TetherError> {
        let view = self
            .inner
            .multiplexer
            .responder_view()
            .ok_or_else(|| TetherError::Protocol("session is already serving".to_string()))?;
        tokio::spawn(respond(view, responder, self.inner.role));
        Ok(())
    }

    /// Open a stream with the frame built by `first` for the allocated id
    pub async fn open_stream<F>(&self, first: F) -> Result<RequesterStream, TetherError>
    where
        F: FnOnce(StreamId) -> Frame,
    {
        let stream_id = self.allocate()?;
        let frame = first(stream_id);
        if frame.stream_id != stream_id || !frame.frame_type.is_request() {
            return Err(TetherError::Protocol(format!(
                "stream {} must open with a request frame, got {} on stream {}",
                stream_id, frame.frame_type, frame.stream_id
            )));
        }

        let (tx, receiver) = tokio::sync::mpsc::unbounded_channel();
        if let Ok(mut streams) = self.inner.streams.lock() {
            streams.insert(stream_id, tx);
        }
        let stream = RequesterStream {
            stream_id,
            receiver,
            sender: self.inner.requester.clone(),
            streams: self.inner.streams.clone(),
            finished: false,
        };

        // on failure the stream is dropped, which unregisters it
        self.inner.requester.send(frame).await?;
        trace!(role = %self.inner.role, stream_id, "stream opened");
        Ok(stream)
    }

    /// Single response request
    pub async fn request_response(&self, payload: Payload) -> Result<Payload, TetherError> {
        let mut stream = self
            .open_stream(|id| Frame::request_response(id, payload))
            .await?;
        match stream.recv().await {
            Some(frame) if frame.frame_type == FrameType::Payload => Ok(frame.payload_data()?),
            Some(frame) if frame.frame_type == FrameType::Error => {
                let error = ErrorFrame::decode(&frame)?;
                Err(TetherError::Remote {
                    code: error.code,
                    message: error.message,
                })
            }
            Some(frame) => Err(TetherError::Protocol(format!(
                "unexpected {} in response",
                frame.frame_type
            ))),
            None => Err(TetherError::ConnectionClosed),
        }
    }

    /// Stream request with initial demand `initial_n`
    pub async fn request_stream(
        &self,
        payload: Payload,
        initial_n: u32,
    ) -> Result<RequesterStream, TetherError> {
        self.open_stream(|id| Frame::request_stream(id, initial_n, payload))
            .await
    }

    pub async fn fire_and_forget(&self, payload: Payload) -> Result<(), TetherError> {
        let stream_id = self.allocate()?;
        self.inner
            .requester
            .send(Frame::request_fnf(stream_id, payload))
            .await
    }

    /// Push metadata to the peer on the control channel
    pub async fn metadata_push(&self, metadata: Bytes) -> Result<(), TetherError> {
        self.inner.control.send(Frame::metadata_push(metadata)).await
    }

    fn allocate(&self) -> Result<StreamId, TetherError> {
        if self.inner.lifecycle.is_terminated() {
            return Err(TetherError::ConnectionClosed);
        }
        self.inner.ids.next().map_err(|e| {
            warn!(role = %self.inner.role, "stream ids exhausted, closing session");
            let _ = self
                .inner
                .control
                .try_send(Frame::error(0, ErrorCode::CONNECTION_ERROR, e.to_string()));
            self.inner.lifecycle.terminate(Err(e.clone()));
            e
        })
    }

    /// Close the session and its connection
    pub fn close(&self) {
        self.inner.multiplexer.close();
    }

    /// Send ERROR on stream 0, then close
    pub async fn close_with_error(&self, code: ErrorCode, message: impl Into<String>) {
        let _ = self.inner.control.send(Frame::error(0, code, message)).await;
        self.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_terminated()
    }

    /// Wait for the session to end, with the reason it ended
    pub async fn closed(&self) -> Result<(), TetherError> {
        self.inner.lifecycle.terminated().await
    }

    pub fn state(&self) -> SessionState {
        if self.is_closed() {
            return SessionState::Closed;
        }
        match &self.inner.resumable {
            Some(resumable) => resumable.state(),
            None => SessionState::Established,
        }
    }

    /// Whether new work should be routed to this session (0.0 to 1.0)
    pub fn availability(&self) -> f64 {
        match &self.inner.resumable {
            Some(resumable) => resumable.availability(),
            None => self.inner.multiplexer.availability(),
        }
    }

    pub fn resumable(&self) -> Option<&ResumableConnection> {
        self.inner.resumable.as_ref()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}

/// One stream issued by this side
pub struct RequesterStream {
    stream_id: StreamId,
    receiver: tokio::sync::mpsc::UnboundedReceiver<Frame>,
    sender: ViewSender,
    streams: Streams,
    finished: bool,
}

impl RequesterStream {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Next frame from the peer; `None` after a terminal frame or session end
    pub async fn recv(&mut self) -> Option<Frame> {
        let frame = self.receiver.recv().await;
        self.observe(frame.as_ref());
        frame
    }

    fn observe(&mut self, frame: Option<&Frame>) {
        match frame {
            Some(frame) if frame.is_terminal() => self.finished = true,
            None => self.finished = true,
            _ => {}
        }
    }

    /// Send a follow-up frame (PAYLOAD, REQUEST_N) on this stream
    pub async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        if frame.stream_id != self.stream_id {
            return Err(TetherError::Protocol(format!(
                "frame for stream {} sent on stream {}",
                frame.stream_id, self.stream_id
            )));
        }
        self.sender.send(frame).await
    }

    pub async fn request_n(&self, n: u32) -> Result<(), TetherError> {
        self.sender.send(Frame::request_n(self.stream_id, n)).await
    }

    /// Cancel the stream
    pub async fn cancel(mut self) -> Result<(), TetherError> {
        self.finished = true;
        self.unregister();
        self.sender.send(Frame::cancel(self.stream_id)).await
    }

    fn unregister(&self) {
        if let Ok(mut streams) = self.streams.lock() {
            streams.remove(&self.stream_id);
        }
    }
}

impl Stream for RequesterStream {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        let polled = self.receiver.poll_recv(cx);
        if let Poll::Ready(frame) = &polled {
            self.observe(frame.as_ref());
        }
        polled
    }
}

impl Drop for RequesterStream {
    fn drop(&mut self) {
        self.unregister();
        if !self.finished && !self.sender.is_closed() {
            let _ = self.sender.try_send(Frame::cancel(self.stream_id));
        }
    }
}

impl fmt::Debug for RequesterStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequesterStream")
            .field("stream_id", &self.stream_id)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Deliver responses to the stream that issued the request
async fn route_responses(mut view: MuxView, streams: Streams, role: Role) {
    while let Some(frame) = view.recv().await {
        let stream_id = frame.stream_id;
        let terminal = frame.is_terminal();
        let Ok(mut open) = streams.lock() else {
            break;
        };
        match open.get(&stream_id) {
            Some(tx) => {
                if tx.send(frame).is_err() || terminal {
                    open.remove(&stream_id);
                }
            }
            None => trace!(%role, stream_id, "frame for unknown stream dropped"),
        }
    }
    // completes every open stream
    if let Ok(mut streams) = streams.lock() {
        streams.clear();
    }
}

/// Feed the peer's requests to the responder
async fn respond(mut view: MuxView, responder: Arc<dyn Responder>, role: Role) {
    let responses = view.sender();
    while let Some(frame) = view.recv().await {
        let stream_id = frame.stream_id;
        let fire_and_forget = frame.frame_type == FrameType::RequestFnf;
        if let Err(e) = responder.handle_frame(frame, responses.clone()).await {
            debug!(%role, stream_id, "responder failed: {}", e);
            if !fire_and_forget {
                let _ = responses
                    .send(Frame::error(
                        stream_id,
                        ErrorCode::APPLICATION_ERROR,
                        e.to_string(),
                    ))
                    .await;
            }
        }
    }
}

/// Process stream 0 after establishment
async fn control_loop(
    mut control: MuxView,
    lifecycle: Lifecycle,
    tracker: Option<Arc<Mutex<KeepAliveTracker>>>,
    role: Role,
) {
    while let Some(frame) = control.recv().await {
        let violation = match frame.frame_type {
            FrameType::Keepalive => match KeepaliveFrame::decode(&frame) {
                Ok(keepalive) if keepalive.respond => {
                    let reply = KeepaliveFrame::new(false, keepalive.data).into_frame();
                    if control.send(reply).await.is_err() {
                        break;
                    }
                    None
                }
                Ok(_) => {
                    if let Some(Ok(mut tracker)) = tracker.as_ref().map(|t| t.lock()) {
                        tracker.on_ack();
                    }
                    None
                }
                Err(e) => Some(e.to_string()),
            },
            FrameType::Error => {
                let error = match ErrorFrame::decode(&frame) {
                    Ok(error) => TetherError::Remote {
                        code: error.code,
                        message: error.message,
                    },
                    Err(e) => TetherError::Framing(e),
                };
                debug!(%role, "peer closed session: {}", error);
                lifecycle.terminate(Err(error));
                break;
            }
            FrameType::Lease | FrameType::MetadataPush => {
                trace!(%role, frame_type = %frame.frame_type, "ignored");
                None
            }
            other => Some(format!("unexpected {} frame on stream 0", other)),
        };

        if let Some(message) = violation {
            warn!(%role, "protocol violation: {}", message);
            let _ = control
                .send(Frame::error(0, ErrorCode::CONNECTION_ERROR, message.clone()))
                .await;
            lifecycle.terminate(Err(TetherError::Protocol(message)));
            break;
        }
    }
}

/// Send keepalives and enforce acknowledgments
async fn keepalive_loop(
    config: KeepAliveConfig,
    tracker: Arc<Mutex<KeepAliveTracker>>,
    control: ViewSender,
    lifecycle: Lifecycle,
    resumable: Option<ResumableConnection>,
) {
    let mut ticker = tokio::time::interval_at(Instant::now() + config.interval, config.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let terminated = lifecycle.terminated();
    tokio::pin!(terminated);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = &mut terminated => break,
        }

        let tick = {
            let Ok(mut tracker) = tracker.lock() else {
                break;
            };
            let connected = resumable
                .as_ref()
                .map_or(true, |r| r.state() == SessionState::Established);
            if connected {
                let tick = tracker.on_tick(Instant::now());
                if matches!(tick, KeepAliveTick::Expired { .. }) {
                    tracker.reset();
                }
                Some(tick)
            } else {
                // acknowledgments cannot arrive without a link
                tracker.reset();
                None
            }
        };
        let Some(tick) = tick else {
            continue;
        };

        match tick {
            KeepAliveTick::Send => {
                let keepalive = KeepaliveFrame::new(true, Bytes::new()).into_frame();
                if let Err(e) = control.send(keepalive).await {
                    trace!("keepalive not sent: {}", e);
                }
            }
            KeepAliveTick::Expired { missed } => match &resumable {
                Some(resumable) => {
                    warn!(missed, "keepalive acknowledgments missed, disconnecting");
                    resumable.disconnect();
                }
                None => {
                    let error = TetherError::KeepAliveTimeout(missed);
                    warn!("{}", error);
                    let _ = control
                        .send(Frame::error(0, ErrorCode::CONNECTION_ERROR, error.to_string()))
                        .await;
                    lifecycle.terminate(Err(error));
                    break;
                }
            },
        }
    }
}
