//! In-memory transport.
//!
//! Connections are pairs of channel-backed [`DuplexConnection`]s; closing
//! either end closes the other once queued frames have been delivered.

use crate::connection::{link_lifecycles, ConnectionIo, DuplexConnection, Lifecycle, DEFAULT_BUFFER};
use crate::transport::{BoxFuture, ClientTransport, ConnectionAcceptor, ServerHandle, ServerTransport};
use std::sync::{Arc, Mutex};
use tether_core::{Frame, TetherError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Create two connected in-memory connections
pub fn pair() -> (DuplexConnection, DuplexConnection) {
    pair_with_buffer(DEFAULT_BUFFER)
}

pub fn pair_with_buffer(buffer: usize) -> (DuplexConnection, DuplexConnection) {
    let (a, a_io) = DuplexConnection::new_pair(buffer);
    let (b, b_io) = DuplexConnection::new_pair(buffer);

    link_lifecycles(a_io.lifecycle.clone(), b_io.lifecycle.clone());

    let ConnectionIo {
        outbound: a_out,
        inbound: a_in,
        lifecycle: a_life,
    } = a_io;
    let ConnectionIo {
        outbound: b_out,
        inbound: b_in,
        lifecycle: b_life,
    } = b_io;

    tokio::spawn(forward(a_out, b_in, a_life));
    tokio::spawn(forward(b_out, a_in, b_life));
    (a, b)
}

/// Move frames from one end's send queue to the other end's receive queue
async fn forward(
    mut outbound: mpsc::Receiver<Frame>,
    inbound: mpsc::Sender<Result<Frame, TetherError>>,
    lifecycle: Lifecycle,
) {
    let terminated = lifecycle.terminated();
    tokio::pin!(terminated);

    loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    trace!(stream_id = frame.stream_id, frame_type = %frame.frame_type, "local forward");
                    if inbound.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = &mut terminated => {
                while let Ok(frame) = outbound.try_recv() {
                    if inbound.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    // both halves dropped: the peer sees end of stream
    lifecycle.terminate(Ok(()));
}

/// Create a connected in-memory client/server transport pair
pub fn transport() -> (LocalClientTransport, LocalServerTransport) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        LocalClientTransport { tx },
        LocalServerTransport {
            rx: Arc::new(Mutex::new(Some(rx))),
        },
    )
}

#[derive(Debug, Clone)]
pub struct LocalClientTransport {
    tx: mpsc::UnboundedSender<DuplexConnection>,
}

impl ClientTransport for LocalClientTransport {
    fn connect(&self) -> BoxFuture<Result<DuplexConnection, TetherError>> {
        let tx = self.tx.clone();
        Box::pin(async move {
            let (client, server) = pair();
            tx.send(server)
                .map_err(|_| TetherError::Transport("local server is not running".to_string()))?;
            Ok(client)
        })
    }
}

#[derive(Debug, Clone)]
pub struct LocalServerTransport {
    rx: Arc<Mutex<Option<mpsc::UnboundedReceiver<DuplexConnection>>>>,
}

impl ServerTransport for LocalServerTransport {
    fn start(&self, acceptor: ConnectionAcceptor) -> BoxFuture<Result<ServerHandle, TetherError>> {
        let rx = self.rx.lock().ok().and_then(|mut rx| rx.take());
        Box::pin(async move {
            let mut rx = rx.ok_or_else(|| {
                TetherError::Transport("local server transport already started".to_string())
            })?;

            let lifecycle = Lifecycle::new();
            let handle = ServerHandle::new(lifecycle.clone(), None);

            tokio::spawn(async move {
                let terminated = lifecycle.terminated();
                tokio::pin!(terminated);
                loop {
                    tokio::select! {
                        connection = rx.recv() => match connection {
                            Some(connection) => {
                                debug!("Accepted local connection");
                                tokio::spawn(acceptor(connection));
                            }
                            None => break,
                        },
                        _ = &mut terminated => break,
                    }
                }
                lifecycle.terminate(Ok(()));
                debug!("Local server stopped");
            });

            Ok(handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::Payload;

    #[tokio::test]
    async fn test_pair_delivers_in_order() {
        let (a, mut b) = pair();
        for i in 0..10u32 {
            a.send(Frame::payload(1, Payload::new(vec![i as u8]), true, false))
                .await
                .unwrap();
        }
        for i in 0..10u32 {
            let frame = b.recv().await.unwrap().unwrap();
            assert_eq!(&frame.payload_data().unwrap().data[..], &[i as u8]);
        }
    }

    #[tokio::test]
    async fn test_close_flushes_then_ends_peer() {
        let (a, mut b) = pair();
        a.send(Frame::cancel(1)).await.unwrap();
        a.send(Frame::cancel(3)).await.unwrap();
        a.close();

        assert_eq!(b.recv().await, Some(Ok(Frame::cancel(1))));
        assert_eq!(b.recv().await, Some(Ok(Frame::cancel(3))));
        assert_eq!(b.recv().await, None);
        assert_eq!(b.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn test_drop_closes_peer() {
        let (a, mut b) = pair();
        drop(a);
        assert_eq!(b.recv().await, None);
        assert_eq!(b.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn test_transport_connects() {
        let (client, server) = transport();
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let acceptor: ConnectionAcceptor = Arc::new(move |connection: DuplexConnection| -> BoxFuture<()> {
            let accepted_tx = accepted_tx.clone();
            Box::pin(async move {
                let _ = accepted_tx.send(connection);
            })
        });
        let handle = server.start(acceptor.clone()).await.unwrap();
        assert!(server.start(acceptor).await.is_err());

        let connection = client.connect().await.unwrap();
        let mut accepted = accepted_rx.recv().await.unwrap();
        connection.send(Frame::cancel(5)).await.unwrap();
        assert_eq!(accepted.recv().await, Some(Ok(Frame::cancel(5))));

        handle.close();
        assert_eq!(handle.closed().await, Ok(()));
    }
}
