//! Connection multiplexer.
//!
//! Splits one duplex connection into three views by stream id:
//! - control: stream 0
//! - initiator: odd ids, streams issued by the client
//! - acceptor: even non-zero ids, streams issued by the server
//!
//! Routing depends only on the id, so both roles use the same code. Which
//! view carries this side's own requests is a matter of role (see
//! [`ConnectionMultiplexer::requester_view`]).

use std::fmt;
use std::sync::Mutex;
use tether_core::state::initiator_stream;
use tether_core::{Frame, Role, StreamId, TetherError};
use tether_transport::{DuplexConnection, FrameReceiver, FrameSender, Lifecycle};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Depth of each view's inbound queue
const VIEW_BUFFER: usize = 1024;

/// Which partition of the stream id space a view carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ViewKind {
    Control,
    Initiator,
    Acceptor,
}

impl ViewKind {
    pub fn of(stream_id: StreamId) -> Self {
        if stream_id == 0 {
            Self::Control
        } else if initiator_stream(stream_id) {
            Self::Initiator
        } else {
            Self::Acceptor
        }
    }

    pub fn admits(self, stream_id: StreamId) -> bool {
        Self::of(stream_id) == self
    }
}

impl fmt::Display for ViewKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Control => f.write_str("control"),
            Self::Initiator => f.write_str("initiator"),
            Self::Acceptor => f.write_str("acceptor"),
        }
    }
}

/// Sends frames belonging to one view onto the shared connection
#[derive(Debug, Clone)]
pub struct ViewSender {
    kind: ViewKind,
    inner: FrameSender,
}

impl ViewSender {
    fn check(&self, frame: &Frame) -> Result<(), TetherError> {
        if self.kind.admits(frame.stream_id) {
            Ok(())
        } else {
            Err(TetherError::Protocol(format!(
                "stream {} does not belong to the {} view",
                frame.stream_id, self.kind
            )))
        }
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        self.check(&frame)?;
        self.inner.send(frame).await
    }

    pub fn try_send(&self, frame: Frame) -> Result<(), TetherError> {
        self.check(&frame)?;
        self.inner.try_send(frame)
    }

    pub fn kind(&self) -> ViewKind {
        self.kind
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

/// One logical frame stream over the multiplexed connection
#[derive(Debug)]
pub struct MuxView {
    sender: ViewSender,
    receiver: mpsc::Receiver<Frame>,
}

impl MuxView {
    /// Next inbound frame; `None` once the multiplexer has closed
    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        self.sender.send(frame).await
    }

    pub fn sender(&self) -> ViewSender {
        self.sender.clone()
    }

    pub fn kind(&self) -> ViewKind {
        self.sender.kind
    }
}

#[derive(Default)]
struct Views {
    control: Option<MuxView>,
    initiator: Option<MuxView>,
    acceptor: Option<MuxView>,
}

pub struct ConnectionMultiplexer {
    role: Role,
    sender: FrameSender,
    views: Mutex<Views>,
}

impl ConnectionMultiplexer {
    /// Start demultiplexing `connection`
    pub fn new(connection: DuplexConnection, role: Role) -> Self {
        let (sender, receiver) = connection.split();

        let (control_tx, control_rx) = mpsc::channel(VIEW_BUFFER);
        let (initiator_tx, initiator_rx) = mpsc::channel(VIEW_BUFFER);
        let (acceptor_tx, acceptor_rx) = mpsc::channel(VIEW_BUFFER);

        let view = |kind, receiver| MuxView {
            sender: ViewSender {
                kind,
                inner: sender.clone(),
            },
            receiver,
        };
        let views = Views {
            control: Some(view(ViewKind::Control, control_rx)),
            initiator: Some(view(ViewKind::Initiator, initiator_rx)),
            acceptor: Some(view(ViewKind::Acceptor, acceptor_rx)),
        };

        tokio::spawn(demultiplex(
            receiver,
            sender.lifecycle().clone(),
            role,
            [control_tx, initiator_tx, acceptor_tx],
        ));

        Self {
            role,
            sender,
            views: Mutex::new(views),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    fn take(&self, kind: ViewKind) -> Option<MuxView> {
        let mut views = self.views.lock().ok()?;
        match kind {
            ViewKind::Control => views.control.take(),
            ViewKind::Initiator => views.initiator.take(),
            ViewKind::Acceptor => views.acceptor.take(),
        }
    }

    /// Stream 0 frames. Each view can be taken once.
    pub fn control_view(&self) -> Option<MuxView> {
        self.take(ViewKind::Control)
    }

    /// Frames on client-issued streams
    pub fn initiator_view(&self) -> Option<MuxView> {
        self.take(ViewKind::Initiator)
    }

    /// Frames on server-issued streams
    pub fn acceptor_view(&self) -> Option<MuxView> {
        self.take(ViewKind::Acceptor)
    }

    /// The view for streams this side issues: responses to our requests arrive here
    pub fn requester_view(&self) -> Option<MuxView> {
        match self.role {
            Role::Client => self.initiator_view(),
            Role::Server => self.acceptor_view(),
        }
    }

    /// The view for streams the peer issues: requests to us arrive here
    pub fn responder_view(&self) -> Option<MuxView> {
        match self.role {
            Role::Client => self.acceptor_view(),
            Role::Server => self.initiator_view(),
        }
    }

    /// Close the underlying connection and complete all views
    pub fn close(&self) {
        if self.sender.lifecycle().terminate(Ok(())) {
            debug!(role = %self.role, "multiplexer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        self.sender.lifecycle()
    }

    pub async fn closed(&self) -> Result<(), TetherError> {
        self.sender.lifecycle().terminated().await
    }

    /// 1.0 while the underlying connection is open
    pub fn availability(&self) -> f64 {
        if self.is_closed() {
            0.0
        } else {
            1.0
        }
    }
}

impl fmt::Debug for ConnectionMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionMultiplexer")
            .field("role", &self.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Route each inbound frame to exactly one view
async fn demultiplex(
    mut receiver: FrameReceiver,
    lifecycle: Lifecycle,
    role: Role,
    views: [mpsc::Sender<Frame>; 3],
) {
    let [control, initiator, acceptor] = views;

    // the connection ends its receive side after it terminates, so frames
    // delivered before termination are still routed
    loop {
        let frame = match receiver.recv().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                warn!(%role, "connection failed: {}", e);
                lifecycle.terminate(Err(e));
                break;
            }
            None => {
                lifecycle.terminate(Ok(()));
                break;
            }
        };

        let kind = ViewKind::of(frame.stream_id);
        let view = match kind {
            ViewKind::Control => &control,
            ViewKind::Initiator => &initiator,
            ViewKind::Acceptor => &acceptor,
        };
        trace!(%role, stream_id = frame.stream_id, frame_type = %frame.frame_type, view = %kind, "demux");
        if view.send(frame).await.is_err() {
            debug!(%role, view = %kind, "view dropped, discarding frame");
        }
    }
    // view senders drop here, completing every view
}
