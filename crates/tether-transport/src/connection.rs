//! Duplex frame connections.
//!
//! A [`DuplexConnection`] is the user-facing end: frames go out through a
//! [`FrameSender`] and come in through a [`FrameReceiver`]. The other end,
//! [`ConnectionIo`], is held by whatever drives the connection (a socket task,
//! an in-memory peer, an interceptor). Both ends share a [`Lifecycle`].

use std::sync::Arc;
use tether_core::{Frame, TetherError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::ReceiverStream;

/// Default channel depth for connection queues
pub const DEFAULT_BUFFER: usize = 256;

/// Terminal outcome of a connection: `None` while open, then the first
/// outcome recorded. Later outcomes are ignored.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state: Arc<watch::Sender<Option<Result<(), TetherError>>>>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            state: Arc::new(state),
        }
    }

    /// Record the terminal outcome; returns false if one was already recorded
    pub fn terminate(&self, outcome: Result<(), TetherError>) -> bool {
        let mut outcome = Some(outcome);
        self.state.send_if_modified(|current| {
            if current.is_some() {
                return false;
            }
            *current = outcome.take();
            true
        })
    }

    pub fn is_terminated(&self) -> bool {
        self.state.borrow().is_some()
    }

    pub fn outcome(&self) -> Option<Result<(), TetherError>> {
        self.state.borrow().clone()
    }

    /// Wait for the terminal outcome
    pub async fn terminated(&self) -> Result<(), TetherError> {
        let mut rx = self.state.subscribe();
        loop {
            let outcome = rx.borrow_and_update().clone();
            if let Some(outcome) = outcome {
                return outcome;
            }
            if rx.changed().await.is_err() {
                return Err(TetherError::ConnectionClosed);
            }
        }
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Propagate termination between two lifecycles, in both directions
pub fn link_lifecycles(a: Lifecycle, b: Lifecycle) {
    tokio::spawn(async move {
        tokio::select! {
            outcome = a.terminated() => { b.terminate(outcome); }
            outcome = b.terminated() => { a.terminate(outcome); }
        }
    });
}

/// Sending half of a connection
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<Frame>,
    lifecycle: Lifecycle,
}

impl FrameSender {
    /// Queue a frame for sending
    ///
    /// Fails with `ConnectionClosed` once the connection has terminated.
    pub async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        if self.lifecycle.is_terminated() {
            return Err(TetherError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TetherError::ConnectionClosed)
    }

    /// Queue a frame without waiting for capacity
    pub fn try_send(&self, frame: Frame) -> Result<(), TetherError> {
        if self.lifecycle.is_terminated() {
            return Err(TetherError::ConnectionClosed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                TetherError::Transport("send queue full".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => TetherError::ConnectionClosed,
        })
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_terminated()
    }
}

/// Receiving half of a connection
#[derive(Debug)]
pub struct FrameReceiver {
    rx: mpsc::Receiver<Result<Frame, TetherError>>,
}

impl FrameReceiver {
    /// Receive the next frame
    ///
    /// Returns `None` once the connection has ended and all delivered frames
    /// have been read. A transport failure is reported as one `Err` item first.
    pub async fn recv(&mut self) -> Option<Result<Frame, TetherError>> {
        self.rx.recv().await
    }

    pub fn into_stream(self) -> ReceiverStream<Result<Frame, TetherError>> {
        ReceiverStream::new(self.rx)
    }
}

/// Driver side of a connection
#[derive(Debug)]
pub struct ConnectionIo {
    /// Frames the user has queued for sending
    pub outbound: mpsc::Receiver<Frame>,
    /// Frames to deliver to the user
    pub inbound: mpsc::Sender<Result<Frame, TetherError>>,
    pub lifecycle: Lifecycle,
}

/// A bidirectional frame channel
#[derive(Debug)]
pub struct DuplexConnection {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl DuplexConnection {
    /// Create a connection and the driver end that backs it
    pub fn new_pair(buffer: usize) -> (DuplexConnection, ConnectionIo) {
        let lifecycle = Lifecycle::new();
        let (out_tx, out_rx) = mpsc::channel(buffer);
        let (in_tx, in_rx) = mpsc::channel(buffer);

        let connection = DuplexConnection {
            sender: FrameSender {
                tx: out_tx,
                lifecycle: lifecycle.clone(),
            },
            receiver: FrameReceiver { rx: in_rx },
        };
        let io = ConnectionIo {
            outbound: out_rx,
            inbound: in_tx,
            lifecycle,
        };
        (connection, io)
    }

    pub fn split(self) -> (FrameSender, FrameReceiver) {
        (self.sender, self.receiver)
    }

    pub fn sender(&self) -> &FrameSender {
        &self.sender
    }

    pub async fn send(&self, frame: Frame) -> Result<(), TetherError> {
        self.sender.send(frame).await
    }

    pub async fn recv(&mut self) -> Option<Result<Frame, TetherError>> {
        self.receiver.recv().await
    }

    /// Close the connection; frames already queued are still flushed
    pub fn close(&self) {
        self.sender.lifecycle.terminate(Ok(()));
    }

    pub async fn closed(&self) -> Result<(), TetherError> {
        self.sender.lifecycle.terminated().await
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.sender.lifecycle
    }

    /// 1.0 while open, 0.0 once terminated
    pub fn availability(&self) -> f64 {
        if self.sender.lifecycle.is_terminated() {
            0.0
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::Payload;
    use tokio_stream::StreamExt;

    #[tokio::test]
    async fn test_lifecycle_first_outcome_wins() {
        let lifecycle = Lifecycle::new();
        assert!(!lifecycle.is_terminated());

        assert!(lifecycle.terminate(Err(TetherError::Transport("reset".into()))));
        assert!(!lifecycle.terminate(Ok(())));
        assert_eq!(
            lifecycle.terminated().await,
            Err(TetherError::Transport("reset".into()))
        );
    }

    #[tokio::test]
    async fn test_terminated_wakes_waiters() {
        let lifecycle = Lifecycle::new();
        let waiter = {
            let lifecycle = lifecycle.clone();
            tokio::spawn(async move { lifecycle.terminated().await })
        };
        tokio::task::yield_now().await;
        lifecycle.terminate(Ok(()));
        assert_eq!(waiter.await.unwrap(), Ok(()));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (connection, mut io) = DuplexConnection::new_pair(4);
        connection.send(Frame::cancel(1)).await.unwrap();
        connection.close();

        assert_eq!(
            connection.send(Frame::cancel(3)).await,
            Err(TetherError::ConnectionClosed)
        );
        assert_eq!(connection.availability(), 0.0);
        // queued before close, still readable by the driver
        assert_eq!(io.outbound.recv().await, Some(Frame::cancel(1)));
    }

    #[tokio::test]
    async fn test_receiver_stream() {
        let (connection, io) = DuplexConnection::new_pair(4);
        let frame = Frame::payload(1, Payload::from("a"), true, true);
        io.inbound.send(Ok(frame.clone())).await.unwrap();
        drop(io);

        let (_, receiver) = connection.split();
        let frames: Vec<_> = receiver.into_stream().collect().await;
        assert_eq!(frames, vec![Ok(frame)]);
    }

    #[tokio::test]
    async fn test_linked_lifecycles() {
        let a = Lifecycle::new();
        let b = Lifecycle::new();
        link_lifecycles(a.clone(), b.clone());

        b.terminate(Err(TetherError::Transport("eof".into())));
        assert_eq!(
            a.terminated().await,
            Err(TetherError::Transport("eof".into()))
        );
    }
}
