//! Resumable connections.
//!
//! A [`ResumableConnection`] sits between a physical connection and the
//! multiplexer. The multiplexer sees one logical [`DuplexConnection`] for the
//! whole life of the session, while physical links come and go underneath.
//!
//! Every resumable frame sent is recorded in a [`ResumeCache`]; every
//! resumable frame received advances the received position. When a link is
//! replaced, RESUME / RESUME_OK exchange positions and each side replays what
//! the other has not seen.
//!
//! All state lives in a single driver task. The handle talks to it through a
//! command channel, so disconnect, reconnect and resume requests are
//! serialized.

use std::fmt;
use std::time::Duration;
use tether_core::{
    ErrorCode, ErrorFrame, Frame, FrameType, KeepaliveFrame, ResumeCache, ResumeConfig,
    ResumeFrame, ResumeOkFrame, ResumeToken, Role, SessionState, TetherError, Version,
};
use tether_transport::{
    ConnectionIo, DuplexConnection, FrameReceiver, FrameSender, Lifecycle, DEFAULT_BUFFER,
};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

/// Snapshot of a resumable session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeStatus {
    pub state: SessionState,
    /// Bytes of resumable frames sent
    pub sent_position: u64,
    /// Bytes the peer has acknowledged
    pub acknowledged_position: u64,
    pub earliest_resend_position: u64,
    /// Bytes of resumable frames received
    pub received_position: u64,
}

enum Command {
    MarkEstablished,
    Disconnect,
    MaxLifetime(Duration),
    Reconnect {
        connection: DuplexConnection,
        reply: oneshot::Sender<Result<(), TetherError>>,
    },
    AcceptResume {
        connection: DuplexConnection,
        resume: ResumeFrame,
        reply: oneshot::Sender<Result<(), TetherError>>,
    },
}

/// Handle to a resumable session's connection state
#[derive(Clone)]
pub struct ResumableConnection {
    role: Role,
    token: ResumeToken,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<ResumeStatus>,
    /// Lifecycle of the current physical link
    link: watch::Receiver<Option<Lifecycle>>,
    lifecycle: Lifecycle,
}

impl ResumableConnection {
    /// Wrap `physical`, returning the handle and the logical connection to multiplex
    pub fn new(
        role: Role,
        token: ResumeToken,
        config: ResumeConfig,
        physical: DuplexConnection,
    ) -> (Self, DuplexConnection) {
        let (logical, io) = DuplexConnection::new_pair(DEFAULT_BUFFER);
        let cache = ResumeCache::new(config.strategy, config.capacity);
        let (status_tx, status) = watch::channel(ResumeStatus {
            state: SessionState::New,
            sent_position: 0,
            acknowledged_position: 0,
            earliest_resend_position: 0,
            received_position: 0,
        });
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link) = watch::channel(None);
        let lifecycle = io.lifecycle.clone();

        let driver = Driver {
            role,
            token: token.clone(),
            config,
            state: SessionState::New,
            cache,
            received_position: 0,
            link: None,
            link_status: link_tx,
            max_lifetime: None,
            expiry: None,
            io,
            status: status_tx,
        };
        tokio::spawn(driver.run(physical, command_rx));

        let handle = Self {
            role,
            token,
            commands,
            status,
            link,
            lifecycle,
        };
        (handle, logical)
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn token(&self) -> &ResumeToken {
        &self.token
    }

    pub fn state(&self) -> SessionState {
        self.status.borrow().state
    }

    pub fn status(&self) -> ResumeStatus {
        *self.status.borrow()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<ResumeStatus> {
        self.status.clone()
    }

    /// Wait until the state satisfies `predicate`
    pub async fn wait_for_state<F>(&self, predicate: F) -> SessionState
    where
        F: Fn(SessionState) -> bool,
    {
        let mut status = self.status.clone();
        loop {
            let state = status.borrow_and_update().state;
            if predicate(state) || status.changed().await.is_err() {
                return state;
            }
        }
    }

    /// The current link's availability while established, 0.0 otherwise
    pub fn availability(&self) -> f64 {
        if self.state() != SessionState::Established {
            return 0.0;
        }
        match self.link.borrow().as_ref() {
            Some(lifecycle) if !lifecycle.is_terminated() => 1.0,
            _ => 0.0,
        }
    }

    /// The setup handshake on the current link completed
    pub fn mark_established(&self) {
        let _ = self.commands.send(Command::MarkEstablished);
    }

    /// Drop the current link; the session waits for a reconnect
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Close the session once it has been disconnected for `max_lifetime`
    ///
    /// A zero duration leaves disconnected sessions waiting indefinitely.
    pub fn set_max_lifetime(&self, max_lifetime: Duration) {
        let _ = self.commands.send(Command::MaxLifetime(max_lifetime));
    }

    /// Client side: resume the session over `connection`
    ///
    /// Dropping the returned future abandons the handshake and closes
    /// `connection`; the session stays disconnected.
    pub async fn reconnect(&self, connection: DuplexConnection) -> Result<(), TetherError> {
        let (reply, response) = oneshot::channel();
        self.request(Command::Reconnect { connection, reply }, response)
            .await
    }

    /// Server side: answer a RESUME received as the first frame of `connection`
    pub async fn accept_resume(
        &self,
        connection: DuplexConnection,
        resume: ResumeFrame,
    ) -> Result<(), TetherError> {
        let (reply, response) = oneshot::channel();
        self.request(
            Command::AcceptResume {
                connection,
                resume,
                reply,
            },
            response,
        )
        .await
    }

    async fn request(
        &self,
        command: Command,
        response: oneshot::Receiver<Result<(), TetherError>>,
    ) -> Result<(), TetherError> {
        self.commands
            .send(command)
            .map_err(|_| TetherError::ConnectionClosed)?;
        response.await.unwrap_or(Err(TetherError::ConnectionClosed))
    }

    /// Close the session; terminal
    pub fn close(&self) {
        self.lifecycle.terminate(Ok(()));
    }

    pub fn is_closed(&self) -> bool {
        self.lifecycle.is_terminated()
    }

    /// Wait for the session to end; resume failures are reported as `ResumeFailed`
    pub async fn closed(&self) -> Result<(), TetherError> {
        self.lifecycle.terminated().await
    }

    pub fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }
}

impl fmt::Debug for ResumableConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableConnection")
            .field("role", &self.role)
            .field("token", &self.token.to_string())
            .field("status", &self.status())
            .finish()
    }
}

/// Current physical connection
struct Link {
    sender: FrameSender,
    receiver: FrameReceiver,
}

impl Link {
    fn new(connection: DuplexConnection) -> Self {
        let (sender, receiver) = connection.split();
        Self { sender, receiver }
    }

    fn close(&self) {
        self.sender.lifecycle().terminate(Ok(()));
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn recv_link(link: &mut Option<Link>) -> Option<Result<Frame, TetherError>> {
    match link {
        Some(link) => link.receiver.recv().await,
        None => std::future::pending().await,
    }
}

/// How a resume handshake went wrong
enum ResumeError {
    /// The new link failed; the session stays resumable
    Link(TetherError),
    /// The session cannot be resumed
    Fatal(String),
    /// The session was closed locally
    Closed,
}

struct Driver {
    role: Role,
    token: ResumeToken,
    config: ResumeConfig,
    state: SessionState,
    cache: ResumeCache,
    received_position: u64,
    link: Option<Link>,
    link_status: watch::Sender<Option<Lifecycle>>,
    max_lifetime: Option<Duration>,
    /// When a disconnected session gives up on its peer
    expiry: Option<Instant>,
    io: ConnectionIo,
    status: watch::Sender<ResumeStatus>,
}

impl Driver {
    async fn run(mut self, physical: DuplexConnection, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.install(Link::new(physical));
        self.transition(SessionState::SetupPending);

        let lifecycle = self.io.lifecycle.clone();
        let terminated = lifecycle.terminated();
        tokio::pin!(terminated);
        let mut commands_open = true;

        while self.state != SessionState::Closed {
            tokio::select! {
                biased;
                command = commands.recv(), if commands_open => match command {
                    Some(command) => self.on_command(command).await,
                    None => commands_open = false,
                },
                _ = &mut terminated => {
                    // flush what the session queued before closing
                    while let Ok(frame) = self.io.outbound.try_recv() {
                        self.on_outbound(frame).await;
                    }
                    break;
                }
                frame = self.io.outbound.recv() => match frame {
                    Some(frame) => self.on_outbound(frame).await,
                    None => break,
                },
                inbound = recv_link(&mut self.link) => self.on_inbound(inbound).await,
                _ = until(self.expiry) => self.expire(),
            }
        }

        self.drop_link();
        self.io.lifecycle.terminate(Ok(()));
        self.transition(SessionState::Closed);
    }

    fn transition(&mut self, state: SessionState) {
        if self.state != state {
            debug!(role = %self.role, "resumable session {} -> {}", self.state, state);
            self.state = state;
            self.arm_expiry();
        }
        self.publish();
    }

    fn arm_expiry(&mut self) {
        self.expiry = match (self.state, self.max_lifetime) {
            (SessionState::Disconnected, Some(lifetime)) => Some(Instant::now() + lifetime),
            _ => None,
        };
    }

    fn expire(&mut self) {
        let reason = format!(
            "peer did not resume within {:?}",
            self.max_lifetime.unwrap_or_default()
        );
        warn!(role = %self.role, token = %self.token, "{}", reason);
        self.io
            .lifecycle
            .terminate(Err(TetherError::ResumeFailed(reason)));
        self.transition(SessionState::Closed);
    }

    fn install(&mut self, link: Link) {
        self.link_status
            .send_replace(Some(link.sender.lifecycle().clone()));
        self.link = Some(link);
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.link_status.send_replace(None);
    }

    fn publish(&self) {
        self.status.send_replace(ResumeStatus {
            state: self.state,
            sent_position: self.cache.current_position(),
            acknowledged_position: self.cache.remote_position(),
            earliest_resend_position: self.cache.earliest_resend_position(),
            received_position: self.received_position,
        });
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::MarkEstablished => {
                if self.state == SessionState::SetupPending {
                    self.transition(SessionState::Established);
                }
            }
            Command::Disconnect => {
                if self.state.is_connected() {
                    self.link_lost("disconnect requested".to_string());
                }
            }
            Command::MaxLifetime(lifetime) => {
                self.max_lifetime = Some(lifetime).filter(|lifetime| !lifetime.is_zero());
                self.arm_expiry();
            }
            Command::Reconnect {
                connection,
                mut reply,
            } => {
                let result = self.reconnect(connection, &mut reply).await;
                let _ = reply.send(result);
            }
            Command::AcceptResume {
                connection,
                resume,
                reply,
            } => {
                let result = self.accept_resume(connection, resume).await;
                let _ = reply.send(result);
            }
        }
    }

    /// Record and forward a frame from the session
    async fn on_outbound(&mut self, frame: Frame) {
        let frame = self.stamp_keepalive(frame);
        if frame.is_resumable() {
            self.cache.sent(frame.clone());
        }
        self.publish();

        if self.state.is_connected() {
            let sent = match &self.link {
                Some(link) => link.sender.send(frame).await,
                None => Err(TetherError::ConnectionClosed),
            };
            if let Err(e) = sent {
                self.link_lost(e.to_string());
            }
        } else if !frame.is_resumable() {
            trace!(role = %self.role, frame_type = %frame.frame_type, "dropping control frame while {}", self.state);
        }
    }

    /// KEEPALIVE frames carry our received position as an acknowledgment
    fn stamp_keepalive(&self, frame: Frame) -> Frame {
        if frame.frame_type != FrameType::Keepalive {
            return frame;
        }
        match KeepaliveFrame::decode(&frame) {
            Ok(mut keepalive) => {
                keepalive.last_received_position = self.received_position;
                keepalive.into_frame()
            }
            Err(_) => frame,
        }
    }

    async fn on_inbound(&mut self, inbound: Option<Result<Frame, TetherError>>) {
        let frame = match inbound {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                self.link_lost(e.to_string());
                return;
            }
            None => {
                self.link_lost("connection closed".to_string());
                return;
            }
        };

        if frame.is_resumable() {
            self.received_position += frame.encoded_len() as u64;
        } else if frame.frame_type == FrameType::Keepalive {
            if let Err(e) = self.on_peer_acknowledgment(&frame) {
                self.fail(e, ErrorCode::CONNECTION_ERROR).await;
                return;
            }
        }

        self.publish();

        if self.io.inbound.send(Ok(frame)).await.is_err() {
            trace!(role = %self.role, "session receiver gone, discarding frame");
        }
    }

    /// Apply the position carried by a peer KEEPALIVE
    fn on_peer_acknowledgment(&mut self, frame: &Frame) -> Result<(), TetherError> {
        let position = KeepaliveFrame::decode(frame)?.last_received_position;
        if position > self.cache.current_position() {
            return Err(TetherError::invalid_position(
                position,
                format!(
                    "peer acknowledged more than the {} bytes sent",
                    self.cache.current_position()
                ),
            ));
        }
        // stale, or below the floor forced by eviction
        if position <= self.cache.remote_position() {
            return Ok(());
        }
        self.cache.update_remote_position(position)
    }

    fn link_lost(&mut self, reason: String) {
        self.drop_link();
        if self.state.is_connected() {
            debug!(role = %self.role, "link lost: {}", reason);
            self.transition(SessionState::Disconnected);
        }
    }

    /// End the session after a protocol violation
    async fn fail(&mut self, error: TetherError, code: ErrorCode) {
        error!(role = %self.role, "resumable session failed: {}", error);
        if let Some(link) = self.link.take() {
            let _ = link
                .sender
                .send(Frame::error(0, code, error.to_string()))
                .await;
            link.close();
        }
        self.link_status.send_replace(None);
        self.io.lifecycle.terminate(Err(error));
        self.transition(SessionState::Closed);
    }

    async fn reconnect(
        &mut self,
        connection: DuplexConnection,
        reply: &mut oneshot::Sender<Result<(), TetherError>>,
    ) -> Result<(), TetherError> {
        if self.state == SessionState::Closed || self.io.lifecycle.is_terminated() {
            connection.close();
            return Err(TetherError::ConnectionClosed);
        }
        if self.state.is_connected() {
            self.link_lost("replaced by reconnect".to_string());
        }
        self.transition(SessionState::Resuming);

        let mut link = Link::new(connection);
        let resume = ResumeFrame {
            version: Version::CURRENT,
            token: self.token.clone(),
            last_received_server_position: self.received_position,
            first_available_client_position: self.cache.earliest_resend_position(),
        };
        debug!(
            role = %self.role,
            received = self.received_position,
            earliest = self.cache.earliest_resend_position(),
            "sending RESUME"
        );

        let lifecycle = self.io.lifecycle.clone();
        let outcome = tokio::select! {
            outcome = self.client_handshake(&mut link, resume) => outcome,
            _ = lifecycle.terminated() => Err(ResumeError::Closed),
            _ = reply.closed() => Err(ResumeError::Link(TetherError::Transport(
                "resume abandoned by caller".to_string(),
            ))),
        };

        match outcome {
            Ok(replay) => self.establish(link, replay).await,
            Err(ResumeError::Closed) => {
                link.close();
                debug!(role = %self.role, "closed while resuming");
                self.transition(SessionState::Closed);
                Err(TetherError::ConnectionClosed)
            }
            Err(ResumeError::Link(e)) => {
                link.close();
                self.transition(SessionState::Disconnected);
                Err(e)
            }
            Err(ResumeError::Fatal(reason)) => {
                link.close();
                error!(role = %self.role, "resume failed: {}", reason);
                let error = TetherError::ResumeFailed(reason);
                self.io.lifecycle.terminate(Err(error.clone()));
                self.transition(SessionState::Closed);
                Err(error)
            }
        }
    }

    /// Send RESUME, wait for RESUME_OK and reconcile positions
    async fn client_handshake(
        &mut self,
        link: &mut Link,
        resume: ResumeFrame,
    ) -> Result<Vec<Frame>, ResumeError> {
        link.sender
            .send(resume.into_frame())
            .await
            .map_err(ResumeError::Link)?;

        let reply = tokio::time::timeout(self.config.resume_timeout, link.receiver.recv())
            .await
            .map_err(|_| {
                ResumeError::Fatal(format!(
                    "no RESUME_OK within {:?}",
                    self.config.resume_timeout
                ))
            })?;

        let frame = match reply {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(ResumeError::Link(e)),
            None => {
                return Err(ResumeError::Link(TetherError::Transport(
                    "connection closed during resume".to_string(),
                )))
            }
        };

        match frame.frame_type {
            FrameType::ResumeOk => {
                let ok = ResumeOkFrame::decode(&frame)
                    .map_err(|e| ResumeError::Fatal(e.to_string()))?;
                let position = ok.last_received_client_position;
                self.cache
                    .update_remote_position(position)
                    .and_then(|_| self.cache.resend(position))
                    .map_err(|e| ResumeError::Fatal(e.to_string()))
            }
            FrameType::Error => {
                let reason = match ErrorFrame::decode(&frame) {
                    Ok(err) => format!("{}: {}", err.code, err.message),
                    Err(e) => e.to_string(),
                };
                Err(ResumeError::Fatal(reason))
            }
            other => Err(ResumeError::Fatal(format!(
                "expected RESUME_OK, got {}",
                other
            ))),
        }
    }

    async fn accept_resume(
        &mut self,
        connection: DuplexConnection,
        resume: ResumeFrame,
    ) -> Result<(), TetherError> {
        if self.state == SessionState::Closed || self.io.lifecycle.is_terminated() {
            reject(&connection, "session closed").await;
            return Err(TetherError::ConnectionClosed);
        }
        if self.state.is_connected() {
            self.link_lost("replaced by resume".to_string());
        }
        self.transition(SessionState::Resuming);

        match self.reconcile(&resume) {
            Ok(replay) => {
                let link = Link::new(connection);
                let ok = ResumeOkFrame {
                    last_received_client_position: self.received_position,
                };
                if let Err(e) = link.sender.send(ok.into_frame()).await {
                    link.close();
                    self.transition(SessionState::Disconnected);
                    return Err(e);
                }
                self.establish(link, replay).await
            }
            Err(reason) => {
                error!(role = %self.role, "rejecting resume: {}", reason);
                reject(&connection, &reason).await;
                let error = TetherError::ResumeFailed(reason);
                self.io.lifecycle.terminate(Err(error.clone()));
                self.transition(SessionState::Closed);
                Err(error)
            }
        }
    }

    /// Check a client's RESUME against local state, returning frames to replay
    fn reconcile(&mut self, resume: &ResumeFrame) -> Result<Vec<Frame>, String> {
        if resume.token != self.token {
            return Err("resume token mismatch".to_string());
        }
        if resume.version.major != Version::CURRENT.major {
            return Err(format!("unsupported version {}", resume.version));
        }
        if resume.first_available_client_position > self.received_position {
            return Err(format!(
                "client can only replay from {}, server has received {}",
                resume.first_available_client_position, self.received_position
            ));
        }
        let position = resume.last_received_server_position;
        self.cache
            .update_remote_position(position)
            .and_then(|_| self.cache.resend(position))
            .map_err(|e| e.to_string())
    }

    /// Install `link` and replay unacknowledged frames on it
    async fn establish(&mut self, link: Link, replay: Vec<Frame>) -> Result<(), TetherError> {
        let count = replay.len();
        for frame in replay {
            if let Err(e) = link.sender.send(frame).await {
                link.close();
                self.transition(SessionState::Disconnected);
                return Err(e);
            }
        }
        self.install(link);
        debug!(role = %self.role, replayed = count, "resumed");
        self.transition(SessionState::Established);
        Ok(())
    }
}

/// Answer a RESUME with REJECTED_RESUME and close the connection
async fn reject(connection: &DuplexConnection, reason: &str) {
    if let Err(e) = connection
        .send(Frame::error(0, ErrorCode::REJECTED_RESUME, reason))
        .await
    {
        warn!("failed to send resume rejection: {}", e);
    }
    connection.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tether_core::{BufferStrategy, Payload};
    use tether_transport::local;

    fn config() -> ResumeConfig {
        ResumeConfig {
            strategy: BufferStrategy::Frames,
            capacity: 64,
            resume_timeout: std::time::Duration::from_millis(500),
        }
    }

    fn token() -> ResumeToken {
        ResumeToken::new(Bytes::from_static(b"session-1"))
    }

    fn payload(stream_id: u32, data: &'static str) -> Frame {
        Frame::payload(stream_id, Payload::from(data), true, false)
    }

    struct Pair {
        client: ResumableConnection,
        client_logical: DuplexConnection,
        server: ResumableConnection,
        server_logical: DuplexConnection,
    }

    async fn established() -> Pair {
        established_with(config()).await
    }

    async fn established_with(config: ResumeConfig) -> Pair {
        let (a, b) = local::pair();
        let (client, client_logical) =
            ResumableConnection::new(Role::Client, token(), config.clone(), a);
        let (server, server_logical) = ResumableConnection::new(Role::Server, token(), config, b);
        client.mark_established();
        server.mark_established();
        client.wait_for_state(|s| s == SessionState::Established).await;
        server.wait_for_state(|s| s == SessionState::Established).await;
        Pair {
            client,
            client_logical,
            server,
            server_logical,
        }
    }

    /// Reconnect the pair over a fresh link, the server answering the RESUME
    async fn resume(pair: &Pair) -> (Result<(), TetherError>, Result<(), TetherError>) {
        let (a, mut b) = local::pair();
        let client = pair.client.clone();
        let reconnect = tokio::spawn(async move { client.reconnect(a).await });

        let first = b.recv().await.unwrap().unwrap();
        let frame = ResumeFrame::decode(&first).unwrap();
        let accepted = pair.server.accept_resume(b, frame).await;
        let reconnected = reconnect.await.unwrap();
        (reconnected, accepted)
    }

    #[tokio::test]
    async fn test_starts_setup_pending() {
        let (a, _b) = local::pair();
        let (conn, _logical) = ResumableConnection::new(Role::Client, token(), config(), a);
        let state = conn
            .wait_for_state(|s| s == SessionState::SetupPending)
            .await;
        assert_eq!(state, SessionState::SetupPending);
        assert_eq!(conn.availability(), 0.0);

        conn.mark_established();
        conn.wait_for_state(|s| s == SessionState::Established).await;
        assert_eq!(conn.availability(), 1.0);
    }

    #[tokio::test]
    async fn test_availability_follows_link() {
        let (a, _b) = local::pair();
        let physical = a.lifecycle().clone();
        let (conn, _logical) = ResumableConnection::new(Role::Client, token(), config(), a);
        conn.mark_established();
        conn.wait_for_state(|s| s == SessionState::Established).await;
        assert_eq!(conn.availability(), 1.0);

        physical.terminate(Err(TetherError::Transport("reset".to_string())));
        assert_eq!(conn.availability(), 0.0);
    }

    #[tokio::test]
    async fn test_positions_track_resumable_frames() {
        let mut pair = established().await;

        pair.client_logical.send(payload(1, "hello")).await.unwrap();
        pair.client_logical
            .send(KeepaliveFrame::new(true, Bytes::new()).into_frame())
            .await
            .unwrap();

        let first = pair.server_logical.recv().await.unwrap().unwrap();
        let keepalive = pair.server_logical.recv().await.unwrap().unwrap();
        assert_eq!(first.stream_id, 1);
        assert_eq!(keepalive.frame_type, FrameType::Keepalive);

        let len = payload(1, "hello").encoded_len() as u64;
        assert_eq!(pair.client.status().sent_position, len);
        assert_eq!(pair.server.status().received_position, len);
        // keepalives are not counted
        assert_eq!(pair.server.status().sent_position, 0);
    }

    #[tokio::test]
    async fn test_keepalive_acknowledges_positions() {
        let mut pair = established().await;

        pair.client_logical.send(payload(1, "one")).await.unwrap();
        pair.server_logical.recv().await.unwrap().unwrap();

        // the server's keepalive is stamped with what it has received
        pair.server_logical
            .send(KeepaliveFrame::new(false, Bytes::new()).into_frame())
            .await
            .unwrap();
        let ack = pair.client_logical.recv().await.unwrap().unwrap();
        let decoded = KeepaliveFrame::decode(&ack).unwrap();
        let len = payload(1, "one").encoded_len() as u64;
        assert_eq!(decoded.last_received_position, len);

        let status = pair.client.status();
        assert_eq!(status.acknowledged_position, len);
        assert_eq!(status.earliest_resend_position, len);
    }

    #[tokio::test]
    async fn test_sends_while_disconnected_are_replayed() {
        let mut pair = established().await;

        pair.client_logical.send(payload(1, "before")).await.unwrap();
        assert_eq!(
            pair.server_logical.recv().await.unwrap().unwrap(),
            payload(1, "before")
        );

        pair.client.disconnect();
        pair.client
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;
        pair.server
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;

        pair.client_logical.send(payload(1, "during")).await.unwrap();
        pair.server_logical.send(payload(1, "reply")).await.unwrap();

        let (reconnected, accepted) = resume(&pair).await;
        assert_eq!(reconnected, Ok(()));
        assert_eq!(accepted, Ok(()));
        assert_eq!(pair.client.state(), SessionState::Established);

        // nothing duplicated, nothing lost
        assert_eq!(
            pair.server_logical.recv().await.unwrap().unwrap(),
            payload(1, "during")
        );
        assert_eq!(
            pair.client_logical.recv().await.unwrap().unwrap(),
            payload(1, "reply")
        );

        pair.client_logical.send(payload(1, "after")).await.unwrap();
        assert_eq!(
            pair.server_logical.recv().await.unwrap().unwrap(),
            payload(1, "after")
        );
    }

    #[tokio::test]
    async fn test_link_failure_disconnects_without_closing() {
        let (a, b) = local::pair();
        let (client, _logical) = ResumableConnection::new(Role::Client, token(), config(), a);
        client.mark_established();
        client.wait_for_state(|s| s == SessionState::Established).await;

        b.close();
        client
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;
        assert!(!client.is_closed());
        assert_eq!(client.availability(), 0.0);
    }

    #[tokio::test]
    async fn test_rejected_resume_closes_session() {
        let pair = established().await;
        pair.client.disconnect();
        pair.client
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;

        let (a, mut b) = local::pair();
        let client = pair.client.clone();
        let reconnect = tokio::spawn(async move { client.reconnect(a).await });

        let first = b.recv().await.unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Resume);
        b.send(Frame::error(0, ErrorCode::REJECTED_RESUME, "unknown session"))
            .await
            .unwrap();

        let result = reconnect.await.unwrap();
        assert!(matches!(result, Err(TetherError::ResumeFailed(_))));
        assert_eq!(pair.client.state(), SessionState::Closed);
        assert!(matches!(
            pair.client.closed().await,
            Err(TetherError::ResumeFailed(_))
        ));
        assert_eq!(
            pair.client.reconnect(local::pair().0).await,
            Err(TetherError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_resume_timeout_closes_session() {
        let pair = established().await;
        pair.client.disconnect();

        let (a, _b) = local::pair();
        let result = pair.client.reconnect(a).await;
        assert!(matches!(result, Err(TetherError::ResumeFailed(_))));
        assert_eq!(pair.client.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_resume_link_failure_stays_resumable() {
        let pair = established().await;
        pair.client.disconnect();

        let (a, mut b) = local::pair();
        let client = pair.client.clone();
        let reconnect = tokio::spawn(async move { client.reconnect(a).await });
        b.recv().await.unwrap().unwrap();
        b.close();

        assert!(matches!(
            reconnect.await.unwrap(),
            Err(TetherError::Transport(_))
        ));
        assert_eq!(pair.client.state(), SessionState::Disconnected);
    }

    /// Disconnect, then start a reconnect whose RESUME the peer never answers
    async fn unanswered_resume(
        pair: &Pair,
    ) -> (
        tokio::task::JoinHandle<Result<(), TetherError>>,
        DuplexConnection,
    ) {
        pair.client.disconnect();
        pair.client
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;

        let (a, mut b) = local::pair();
        let client = pair.client.clone();
        let reconnect = tokio::spawn(async move { client.reconnect(a).await });
        let first = b.recv().await.unwrap().unwrap();
        assert_eq!(first.frame_type, FrameType::Resume);
        pair.client
            .wait_for_state(|s| s == SessionState::Resuming)
            .await;
        (reconnect, b)
    }

    #[tokio::test]
    async fn test_close_while_resuming() {
        let pair = established_with(ResumeConfig {
            resume_timeout: Duration::from_secs(30),
            ..config()
        })
        .await;
        let (reconnect, b) = unanswered_resume(&pair).await;

        pair.client.close();
        assert!(tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .is_ok());
        assert_eq!(reconnect.await.unwrap(), Err(TetherError::ConnectionClosed));
        pair.client
            .wait_for_state(|s| s == SessionState::Closed)
            .await;
        assert_eq!(pair.client.closed().await, Ok(()));
    }

    #[tokio::test]
    async fn test_abandoned_reconnect_closes_link() {
        let pair = established_with(ResumeConfig {
            resume_timeout: Duration::from_secs(30),
            ..config()
        })
        .await;
        let (reconnect, b) = unanswered_resume(&pair).await;

        reconnect.abort();
        assert!(tokio::time::timeout(Duration::from_secs(1), b.closed())
            .await
            .is_ok());
        pair.client
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;
        assert!(!pair.client.is_closed());
    }

    #[tokio::test]
    async fn test_disconnected_session_expires() {
        let pair = established().await;
        pair.server.set_max_lifetime(Duration::from_millis(50));
        pair.client.close();

        let outcome = tokio::time::timeout(Duration::from_secs(2), pair.server.closed())
            .await
            .unwrap();
        assert!(matches!(outcome, Err(TetherError::ResumeFailed(_))));
        pair.server
            .wait_for_state(|s| s == SessionState::Closed)
            .await;
    }

    #[tokio::test]
    async fn test_resume_cancels_expiry() {
        let pair = established().await;
        pair.server.set_max_lifetime(Duration::from_millis(100));
        pair.client.disconnect();
        pair.server
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;

        let (reconnected, accepted) = resume(&pair).await;
        assert_eq!(reconnected, Ok(()));
        assert_eq!(accepted, Ok(()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(pair.server.state(), SessionState::Established);
        assert!(!pair.server.is_closed());
    }

    #[tokio::test]
    async fn test_server_rejects_evicted_position() {
        let (a, b) = local::pair();
        let small = ResumeConfig {
            capacity: 1,
            ..config()
        };
        let (client, _client_logical) = ResumableConnection::new(Role::Client, token(), config(), a);
        let (server, server_logical) = ResumableConnection::new(Role::Server, token(), small, b);
        client.mark_established();
        server.mark_established();
        server.wait_for_state(|s| s == SessionState::Established).await;

        server.disconnect();
        server
            .wait_for_state(|s| s == SessionState::Disconnected)
            .await;
        // two frames with capacity one: the first is evicted unacknowledged
        server_logical.send(payload(2, "a")).await.unwrap();
        server_logical.send(payload(2, "b")).await.unwrap();

        let (c, mut d) = local::pair();
        let resume = ResumeFrame {
            version: Version::CURRENT,
            token: token(),
            last_received_server_position: 0,
            first_available_client_position: 0,
        };
        let result = server.accept_resume(c, resume).await;
        assert!(matches!(result, Err(TetherError::ResumeFailed(_))));

        let rejection = d.recv().await.unwrap().unwrap();
        let error = ErrorFrame::decode(&rejection).unwrap();
        assert_eq!(error.code, ErrorCode::REJECTED_RESUME);
        assert_eq!(d.recv().await, None);
        assert_eq!(server.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let pair = established().await;
        pair.client.close();
        pair.client
            .wait_for_state(|s| s == SessionState::Closed)
            .await;
        assert_eq!(pair.client.closed().await, Ok(()));
        assert_eq!(
            pair.client_logical.send(payload(1, "x")).await,
            Err(TetherError::ConnectionClosed)
        );
    }
}
