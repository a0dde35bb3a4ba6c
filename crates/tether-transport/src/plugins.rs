//! Connection interceptors.
//!
//! Interceptors wrap a physical connection before anything else sees it.
//! The multiplexer and resumable layers only deal with `DuplexConnection`s,
//! so an interceptor can observe or rewrite frames without either knowing.

use crate::connection::{ConnectionIo, DuplexConnection, DEFAULT_BUFFER};
use std::fmt;
use std::sync::Arc;
use tether_core::Frame;
use tracing::trace;

/// Wraps a connection into another connection
pub trait ConnectionInterceptor: Send + Sync + 'static {
    fn intercept(&self, connection: DuplexConnection) -> DuplexConnection;
}

/// Ordered list of interceptors applied to every physical connection
#[derive(Clone, Default)]
pub struct PluginRegistry {
    connection: Vec<Arc<dyn ConnectionInterceptor>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interceptor; earlier interceptors sit closer to the transport
    pub fn with_connection_interceptor(mut self, interceptor: impl ConnectionInterceptor) -> Self {
        self.connection.push(Arc::new(interceptor));
        self
    }

    pub fn add_connection_interceptor(&mut self, interceptor: Arc<dyn ConnectionInterceptor>) {
        self.connection.push(interceptor);
    }

    pub fn apply_connection(&self, connection: DuplexConnection) -> DuplexConnection {
        self.connection
            .iter()
            .fold(connection, |connection, interceptor| interceptor.intercept(connection))
    }

    pub fn is_empty(&self) -> bool {
        self.connection.is_empty()
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("connection_interceptors", &self.connection.len())
            .finish()
    }
}

/// Direction of a frame relative to the local endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Outbound,
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Outbound => f.write_str("out"),
            Self::Inbound => f.write_str("in"),
        }
    }
}

/// Wrap `inner` so `observe` sees every frame in both directions
///
/// Frames are passed through unchanged and in order. Termination of either
/// side terminates the other with the same outcome.
pub fn tap<F>(inner: DuplexConnection, observe: F) -> DuplexConnection
where
    F: Fn(Direction, &Frame) + Send + Sync + 'static,
{
    let observe = Arc::new(observe);
    let (outer, io) = DuplexConnection::new_pair(DEFAULT_BUFFER);
    let ConnectionIo {
        mut outbound,
        inbound,
        lifecycle,
    } = io;
    let (inner_tx, mut inner_rx) = inner.split();

    {
        let lifecycle = lifecycle.clone();
        let inner_lifecycle = inner_tx.lifecycle().clone();
        tokio::spawn(async move {
            let outcome = inner_lifecycle.terminated().await;
            lifecycle.terminate(outcome);
        });
    }

    {
        let observe = observe.clone();
        tokio::spawn(async move {
            let terminated = lifecycle.terminated();
            tokio::pin!(terminated);
            loop {
                tokio::select! {
                    biased;
                    frame = outbound.recv() => match frame {
                        Some(frame) => {
                            observe(Direction::Outbound, &frame);
                            if inner_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = &mut terminated => {
                        while let Ok(frame) = outbound.try_recv() {
                            observe(Direction::Outbound, &frame);
                            if inner_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
            // inner closes only after queued frames were handed over
            lifecycle.terminate(Ok(()));
            let outcome = lifecycle.outcome().unwrap_or(Ok(()));
            inner_tx.lifecycle().terminate(outcome);
        });
    }

    tokio::spawn(async move {
        while let Some(item) = inner_rx.recv().await {
            if let Ok(frame) = &item {
                observe(Direction::Inbound, frame);
            }
            if inbound.send(item).await.is_err() {
                break;
            }
        }
    });

    outer
}

/// Traces every frame crossing the connection
#[derive(Debug, Clone)]
pub struct FrameLoggingInterceptor {
    label: Arc<str>,
}

impl FrameLoggingInterceptor {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: Arc::from(label.into()),
        }
    }
}

impl Default for FrameLoggingInterceptor {
    fn default() -> Self {
        Self::new("tether")
    }
}

impl ConnectionInterceptor for FrameLoggingInterceptor {
    fn intercept(&self, connection: DuplexConnection) -> DuplexConnection {
        let label = self.label.clone();
        tap(connection, move |direction, frame| {
            trace!(
                label = %label,
                %direction,
                stream_id = frame.stream_id,
                frame_type = %frame.frame_type,
                len = frame.encoded_len(),
                "frame"
            );
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct Recording(Arc<Mutex<Vec<(Direction, u32)>>>);

    impl ConnectionInterceptor for Recording {
        fn intercept(&self, connection: DuplexConnection) -> DuplexConnection {
            let seen = self.0.clone();
            tap(connection, move |direction, frame| {
                if let Ok(mut seen) = seen.lock() {
                    seen.push((direction, frame.stream_id));
                }
            })
        }
    }

    #[tokio::test]
    async fn test_tap_sees_both_directions() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = PluginRegistry::new()
            .with_connection_interceptor(FrameLoggingInterceptor::default())
            .with_connection_interceptor(Recording(seen.clone()));

        let (a, mut b) = local::pair();
        let mut a = registry.apply_connection(a);

        a.send(Frame::cancel(1)).await.unwrap();
        assert_eq!(b.recv().await, Some(Ok(Frame::cancel(1))));

        b.send(Frame::cancel(2)).await.unwrap();
        assert_eq!(a.recv().await, Some(Ok(Frame::cancel(2))));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen, vec![(Direction::Outbound, 1), (Direction::Inbound, 2)]);
    }

    #[tokio::test]
    async fn test_tap_close_flushes_and_propagates() {
        let count = Arc::new(AtomicUsize::new(0));
        let (a, mut b) = local::pair();
        let a = {
            let count = count.clone();
            tap(a, move |_, _| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        a.send(Frame::cancel(1)).await.unwrap();
        a.send(Frame::cancel(3)).await.unwrap();
        a.close();

        assert_eq!(b.recv().await, Some(Ok(Frame::cancel(1))));
        assert_eq!(b.recv().await, Some(Ok(Frame::cancel(3))));
        assert_eq!(b.recv().await, None);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_registry() {
        assert!(PluginRegistry::new().is_empty());
    }
}
