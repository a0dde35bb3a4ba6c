//! TCP transport.
//!
//! Each frame is preceded by its length as a 24-bit big-endian integer.

use crate::connection::{ConnectionIo, DuplexConnection, Lifecycle, DEFAULT_BUFFER};
use crate::transport::{BoxFuture, ClientTransport, ConnectionAcceptor, ServerHandle, ServerTransport};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::net::SocketAddr;
use tether_core::frame::MAX_FRAME_SIZE;
use tether_core::{Frame, TetherError};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

/// Length prefix size
const LENGTH_PREFIX: usize = 3;

/// Wrap an established TCP stream as a frame connection
pub fn connection(stream: TcpStream) -> DuplexConnection {
    if let Err(e) = stream.set_nodelay(true) {
        warn!("Failed to set TCP_NODELAY: {}", e);
    }
    let (reader, writer) = stream.into_split();
    let (connection, io) = DuplexConnection::new_pair(DEFAULT_BUFFER);
    let ConnectionIo {
        outbound,
        inbound,
        lifecycle,
    } = io;

    tokio::spawn(write_loop(writer, outbound, lifecycle.clone()));
    tokio::spawn(read_loop(reader, inbound, lifecycle));
    connection
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Frame>, lifecycle: Lifecycle) {
    let terminated = lifecycle.terminated();
    tokio::pin!(terminated);
    let mut buf = BytesMut::new();

    let result = loop {
        tokio::select! {
            biased;
            frame = outbound.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &mut buf, &frame).await {
                        break Err(e);
                    }
                }
                None => break Ok(()),
            },
            _ = &mut terminated => {
                let mut flushed = Ok(());
                while let Ok(frame) = outbound.try_recv() {
                    flushed = write_frame(&mut writer, &mut buf, &frame).await;
                    if flushed.is_err() {
                        break;
                    }
                }
                break flushed;
            }
        }
    };

    if let Err(e) = &result {
        debug!("TCP write failed: {}", e);
    }
    let _ = writer.shutdown().await;
    lifecycle.terminate(result);
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    buf: &mut BytesMut,
    frame: &Frame,
) -> Result<(), TetherError> {
    let len = frame.encoded_len();
    if len > MAX_FRAME_SIZE {
        return Err(TetherError::Protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }

    buf.clear();
    buf.reserve(LENGTH_PREFIX + len);
    buf.put_uint(len as u64, LENGTH_PREFIX);
    frame.encode_into(buf);
    trace!(stream_id = frame.stream_id, frame_type = %frame.frame_type, len, "TCP write");

    writer
        .write_all(&buf[..])
        .await
        .map_err(|e| TetherError::Transport(format!("write failed: {}", e)))
}

async fn read_loop(
    reader: OwnedReadHalf,
    inbound: mpsc::Sender<Result<Frame, TetherError>>,
    lifecycle: Lifecycle,
) {
    let mut reader = BufReader::new(reader);
    let terminated = lifecycle.terminated();
    tokio::pin!(terminated);

    let result = loop {
        tokio::select! {
            read = read_frame(&mut reader) => match read {
                Ok(Some(frame)) => {
                    trace!(stream_id = frame.stream_id, frame_type = %frame.frame_type, "TCP read");
                    if inbound.send(Ok(frame)).await.is_err() {
                        break Ok(());
                    }
                }
                Ok(None) => {
                    debug!("TCP peer closed connection");
                    break Ok(());
                }
                Err(e) => {
                    warn!("TCP read failed: {}", e);
                    let _ = inbound.send(Err(e.clone())).await;
                    break Err(e);
                }
            },
            _ = &mut terminated => break Ok(()),
        }
    };

    lifecycle.terminate(result);
}

/// Read one length-prefixed frame; `None` on clean end of stream
async fn read_frame(reader: &mut BufReader<OwnedReadHalf>) -> Result<Option<Frame>, TetherError> {
    let mut prefix = [0u8; LENGTH_PREFIX];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(TetherError::Transport(format!("read failed: {}", e))),
    }
    let len = (usize::from(prefix[0]) << 16) | (usize::from(prefix[1]) << 8) | usize::from(prefix[2]);

    let mut body = vec![0u8; len];
    reader
        .read_exact(&mut body)
        .await
        .map_err(|e| TetherError::Transport(format!("read failed: {}", e)))?;

    Ok(Some(Frame::decode(Bytes::from(body))?))
}

/// Dials a fixed address
#[derive(Debug, Clone)]
pub struct TcpClientTransport {
    addr: SocketAddr,
}

impl TcpClientTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl ClientTransport for TcpClientTransport {
    fn connect(&self) -> BoxFuture<Result<DuplexConnection, TetherError>> {
        let addr = self.addr;
        Box::pin(async move {
            let stream = TcpStream::connect(addr)
                .await
                .map_err(|e| TetherError::Transport(format!("connect to {} failed: {}", addr, e)))?;
            debug!("Connected to {}", addr);
            Ok(connection(stream))
        })
    }
}

/// Listens on a fixed address
#[derive(Debug, Clone)]
pub struct TcpServerTransport {
    addr: SocketAddr,
}

impl TcpServerTransport {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

impl ServerTransport for TcpServerTransport {
    fn start(&self, acceptor: ConnectionAcceptor) -> BoxFuture<Result<ServerHandle, TetherError>> {
        let addr = self.addr;
        Box::pin(async move {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|e| TetherError::Transport(format!("bind {} failed: {}", addr, e)))?;
            let local_addr = listener
                .local_addr()
                .map_err(|e| TetherError::Transport(e.to_string()))?;
            debug!("TCP server listening on {}", local_addr);

            let lifecycle = Lifecycle::new();
            let handle = ServerHandle::new(lifecycle.clone(), Some(local_addr));

            tokio::spawn(async move {
                let terminated = lifecycle.terminated();
                tokio::pin!(terminated);
                loop {
                    tokio::select! {
                        accepted = listener.accept() => match accepted {
                            Ok((stream, peer)) => {
                                debug!("Accepted TCP connection from {}", peer);
                                tokio::spawn(acceptor(connection(stream)));
                            }
                            Err(e) => {
                                error!("TCP accept error: {}", e);
                            }
                        },
                        _ = &mut terminated => break,
                    }
                }
                debug!("TCP server on {} stopped", local_addr);
            });

            Ok(handle)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tether_core::{ErrorCode, Payload};

    async fn connected() -> (DuplexConnection, DuplexConnection, ServerHandle) {
        let (accepted_tx, mut accepted_rx) = mpsc::unbounded_channel();
        let acceptor: ConnectionAcceptor = Arc::new(move |connection: DuplexConnection| -> BoxFuture<()> {
            let accepted_tx = accepted_tx.clone();
            Box::pin(async move {
                let _ = accepted_tx.send(connection);
            })
        });

        let server = TcpServerTransport::new("127.0.0.1:0".parse().unwrap());
        let handle = server.start(acceptor).await.unwrap();
        let addr = handle.local_addr().unwrap();

        let client = TcpClientTransport::new(addr).connect().await.unwrap();
        let accepted = accepted_rx.recv().await.unwrap();
        (client, accepted, handle)
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let (client, mut server, handle) = connected().await;

        let frame = Frame::request_stream(1, 8, Payload::with_metadata("m", "hello"));
        client.send(frame.clone()).await.unwrap();
        assert_eq!(server.recv().await, Some(Ok(frame)));

        server.send(Frame::complete(1)).await.unwrap();
        let mut client = client;
        assert_eq!(client.recv().await, Some(Ok(Frame::complete(1))));

        handle.close();
    }

    #[tokio::test]
    async fn test_tcp_close_flushes_queued_frames() {
        let (client, mut server, handle) = connected().await;

        client
            .send(Frame::error(0, ErrorCode::INVALID_SETUP, "Unsupported version 2.0"))
            .await
            .unwrap();
        client.close();

        let frame = server.recv().await.unwrap().unwrap();
        assert_eq!(frame.frame_type, tether_core::FrameType::Error);
        assert_eq!(server.recv().await, None);
        assert_eq!(server.closed().await, Ok(()));

        handle.close();
    }
}
