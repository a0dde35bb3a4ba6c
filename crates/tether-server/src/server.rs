//! Tether server implementation
//!
//! Every accepted connection must open with SETUP or RESUME on stream 0.
//! SETUP creates a session and hands it to the [`SocketAcceptor`]; RESUME
//! attaches the connection to a live resumable session. Anything else is
//! answered with a single ERROR frame before the connection is closed.

use crate::config::ServerConfig;
use crate::registry::SessionRegistry;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tether_core::{
    ErrorCode, Frame, FrameType, ResumeFrame, Role, SetupFrame, TetherError, Version,
};
use tether_session::{ConnectionMultiplexer, ResumableConnection, Responder, Session};
use tether_transport::{
    BoxFuture, ConnectionAcceptor, DuplexConnection, PluginRegistry, ServerHandle, ServerTransport,
};
use tracing::{debug, error, info, warn};

/// Application hook invoked once per new session
pub trait SocketAcceptor: Send + Sync + 'static {
    /// Inspect SETUP and return the responder for the client's requests
    ///
    /// An error rejects the session with REJECTED_SETUP.
    fn accept(
        &self,
        setup: SetupFrame,
        session: Session,
    ) -> BoxFuture<Result<Arc<dyn Responder>, TetherError>>;
}

type AcceptFn =
    Arc<dyn Fn(SetupFrame, Session) -> BoxFuture<Result<Arc<dyn Responder>, TetherError>> + Send + Sync>;

/// Acceptor backed by an async closure
#[derive(Clone)]
pub struct FnAcceptor {
    accept: AcceptFn,
}

impl FnAcceptor {
    pub fn new<F, Fut>(accept: F) -> Self
    where
        F: Fn(SetupFrame, Session) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Arc<dyn Responder>, TetherError>> + Send + 'static,
    {
        let accept = Arc::new(move |setup: SetupFrame, session: Session| {
            Box::pin(accept(setup, session)) as BoxFuture<_>
        });
        Self { accept }
    }
}

impl SocketAcceptor for FnAcceptor {
    fn accept(
        &self,
        setup: SetupFrame,
        session: Session,
    ) -> BoxFuture<Result<Arc<dyn Responder>, TetherError>> {
        (self.accept)(setup, session)
    }
}

/// Establishes server sessions on accepted connections
#[derive(Clone)]
pub struct TetherServer {
    config: ServerConfig,
    plugins: PluginRegistry,
    acceptor: Arc<dyn SocketAcceptor>,
    registry: SessionRegistry,
}

impl TetherServer {
    pub fn new(config: ServerConfig, acceptor: impl SocketAcceptor) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            acceptor: Arc::new(acceptor),
            registry: SessionRegistry::new(),
        }
    }

    /// Interceptors applied to every accepted connection
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Live resumable sessions
    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    /// Start serving connections from `transport`
    pub async fn start(&self, transport: &dyn ServerTransport) -> Result<ServerHandle, TetherError> {
        self.config.validate()?;

        let server = Arc::new(self.clone());
        let acceptor: ConnectionAcceptor = Arc::new(move |connection: DuplexConnection| {
            let server = server.clone();
            Box::pin(async move { server.handle_connection(connection).await }) as BoxFuture<()>
        });

        let handle = transport.start(acceptor).await?;
        info!(
            local_addr = ?handle.local_addr(),
            resume = self.config.resume.is_some(),
            "Tether server started"
        );
        Ok(handle)
    }

    /// Establish or resume a session on one physical connection
    pub async fn handle_connection(&self, connection: DuplexConnection) {
        let mut connection = self.plugins.apply_connection(connection);

        let first = match tokio::time::timeout(self.config.setup_timeout, connection.recv()).await
        {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                debug!("connection failed before setup: {}", e);
                connection.close();
                return;
            }
            Ok(None) => {
                debug!("connection closed before setup");
                return;
            }
            Err(_) => {
                let message = format!("no SETUP within {:?}", self.config.setup_timeout);
                reject(connection, ErrorCode::INVALID_SETUP, message).await;
                return;
            }
        };

        match (first.stream_id, first.frame_type) {
            (0, FrameType::Setup) => self.setup(connection, first).await,
            (0, FrameType::Resume) => self.resume(connection, first).await,
            (stream_id, frame_type) => {
                let message = format!(
                    "expected SETUP or RESUME, got {} on stream {}",
                    frame_type, stream_id
                );
                reject(connection, ErrorCode::INVALID_SETUP, message).await;
            }
        }
    }

    async fn setup(&self, connection: DuplexConnection, frame: Frame) {
        let version = match SetupFrame::peek_version(&frame) {
            Ok(version) => version,
            Err(e) => {
                reject(connection, ErrorCode::INVALID_SETUP, e.to_string()).await;
                return;
            }
        };
        if version.major != Version::CURRENT.major {
            let message = format!("Unsupported version {}", version);
            reject(connection, ErrorCode::INVALID_SETUP, message).await;
            return;
        }
        let setup = match SetupFrame::decode(&frame) {
            Ok(setup) => setup,
            Err(e) => {
                reject(connection, ErrorCode::INVALID_SETUP, e.to_string()).await;
                return;
            }
        };
        if setup.lease {
            reject(connection, ErrorCode::UNSUPPORTED_SETUP, "leases are not supported").await;
            return;
        }

        let (connection, resumable) = match (&setup.resume_token, &self.config.resume) {
            (None, _) => (connection, None),
            (Some(_), None) => {
                reject(connection, ErrorCode::UNSUPPORTED_SETUP, "resumption is disabled").await;
                return;
            }
            (Some(token), Some(resume)) => {
                if self.registry.get(token).is_some() {
                    let message = format!("resume token {} is already in use", token);
                    reject(connection, ErrorCode::REJECTED_SETUP, message).await;
                    return;
                }
                let (resumable, logical) = ResumableConnection::new(
                    Role::Server,
                    token.clone(),
                    resume.clone(),
                    connection,
                );
                resumable.set_max_lifetime(setup.max_lifetime);
                resumable.mark_established();
                (logical, Some(resumable))
            }
        };

        let multiplexer = ConnectionMultiplexer::new(connection, Role::Server);
        let Some(control) = multiplexer.control_view() else {
            multiplexer.close();
            return;
        };
        let session = match Session::start(multiplexer, control, resumable.clone(), None) {
            Ok(session) => session,
            Err(e) => {
                error!("failed to start session: {}", e);
                return;
            }
        };

        if let Some(resumable) = resumable {
            if let Err(e) = self.registry.register(resumable) {
                session
                    .close_with_error(ErrorCode::REJECTED_SETUP, e.to_string())
                    .await;
                return;
            }
        }

        let responder = match self.acceptor.accept(setup, session.clone()).await {
            Ok(responder) => responder,
            Err(e) => {
                warn!("session rejected by acceptor: {}", e);
                session
                    .close_with_error(ErrorCode::REJECTED_SETUP, e.to_string())
                    .await;
                return;
            }
        };
        if let Err(e) = session.serve(responder) {
            error!("failed to serve session: {}", e);
            session.close();
            return;
        }
        debug!(resumable = session.resumable().is_some(), "server session established");
    }

    async fn resume(&self, connection: DuplexConnection, frame: Frame) {
        if self.config.resume.is_none() {
            reject(connection, ErrorCode::REJECTED_RESUME, "resumption is disabled").await;
            return;
        }
        let resume = match ResumeFrame::decode(&frame) {
            Ok(resume) => resume,
            Err(e) => {
                reject(connection, ErrorCode::REJECTED_RESUME, e.to_string()).await;
                return;
            }
        };
        let Some(session) = self.registry.get(&resume.token) else {
            let message = format!("unknown resume token {}", resume.token);
            reject(connection, ErrorCode::REJECTED_RESUME, message).await;
            return;
        };

        let token = resume.token.clone();
        match session.accept_resume(connection, resume).await {
            Ok(()) => debug!(%token, "session resumed"),
            Err(e @ TetherError::ResumeFailed(_)) => error!(%token, "resume failed: {}", e),
            Err(e) => debug!(%token, "resume interrupted: {}", e),
        }
    }
}

impl fmt::Debug for TetherServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherServer")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("sessions", &self.registry.len())
            .finish()
    }
}

/// Answer with a single ERROR on stream 0 and close
async fn reject(connection: DuplexConnection, code: ErrorCode, message: impl Into<String>) {
    let message = message.into();
    warn!(%code, "rejecting connection: {}", message);
    let _ = connection.send(Frame::error(0, code, message)).await;
    connection.close();
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::time::Duration;
    use tether_core::{ErrorFrame, Payload, ResumeConfig, ResumeToken};
    use tether_session::RejectingResponder;
    use tether_transport::local;

    fn accept_all() -> FnAcceptor {
        FnAcceptor::new(|_setup: SetupFrame, _session: Session| async move {
            Ok::<_, TetherError>(Arc::new(RejectingResponder) as Arc<dyn Responder>)
        })
    }

    fn setup(version: Version, resume_token: Option<ResumeToken>) -> Frame {
        setup_with_lifetime(version, resume_token, Duration::from_secs(90))
    }

    fn setup_with_lifetime(
        version: Version,
        resume_token: Option<ResumeToken>,
        max_lifetime: Duration,
    ) -> Frame {
        SetupFrame {
            version,
            keepalive_interval: Duration::from_secs(20),
            max_lifetime,
            resume_token,
            lease: false,
            metadata_mime_type: "application/binary".to_string(),
            data_mime_type: "application/binary".to_string(),
            payload: Payload::default(),
        }
        .into_frame()
    }

    async fn expect_rejection(client: &mut DuplexConnection, code: ErrorCode) -> ErrorFrame {
        let error = ErrorFrame::decode(&client.recv().await.unwrap().unwrap()).unwrap();
        assert_eq!(error.stream_id, 0);
        assert_eq!(error.code, code);
        assert_eq!(client.recv().await, None);
        error
    }

    #[tokio::test]
    async fn test_unsupported_version_rejected() {
        let server = TetherServer::new(ServerConfig::default(), accept_all());
        let (mut client, connection) = local::pair();

        client.send(setup(Version::new(2, 0), None)).await.unwrap();
        server.handle_connection(connection).await;

        let error = expect_rejection(&mut client, ErrorCode::INVALID_SETUP).await;
        assert_eq!(error.message, "Unsupported version 2.0");
    }

    #[tokio::test]
    async fn test_first_frame_must_be_setup() {
        let server = TetherServer::new(ServerConfig::default(), accept_all());
        let (mut client, connection) = local::pair();

        client
            .send(Frame::request_response(1, Payload::from("early")))
            .await
            .unwrap();
        server.handle_connection(connection).await;

        expect_rejection(&mut client, ErrorCode::INVALID_SETUP).await;
    }

    #[tokio::test]
    async fn test_setup_timeout() {
        let config = ServerConfig {
            setup_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let server = TetherServer::new(config, accept_all());
        let (mut client, connection) = local::pair();

        server.handle_connection(connection).await;
        expect_rejection(&mut client, ErrorCode::INVALID_SETUP).await;
    }

    #[tokio::test]
    async fn test_resume_token_with_resumption_disabled() {
        let server = TetherServer::new(ServerConfig::default(), accept_all());
        let (mut client, connection) = local::pair();

        client
            .send(setup(Version::CURRENT, Some(ResumeToken::generate())))
            .await
            .unwrap();
        server.handle_connection(connection).await;

        expect_rejection(&mut client, ErrorCode::UNSUPPORTED_SETUP).await;
    }

    #[tokio::test]
    async fn test_unknown_resume_token() {
        let config = ServerConfig::default().with_resume(ResumeConfig::default());
        let server = TetherServer::new(config, accept_all());
        let (mut client, connection) = local::pair();

        let resume = ResumeFrame {
            version: Version::CURRENT,
            token: ResumeToken::new(Bytes::from_static(b"nobody")),
            last_received_server_position: 0,
            first_available_client_position: 0,
        };
        client.send(resume.into_frame()).await.unwrap();
        server.handle_connection(connection).await;

        expect_rejection(&mut client, ErrorCode::REJECTED_RESUME).await;
    }

    #[tokio::test]
    async fn test_acceptor_error_rejects_setup() {
        let acceptor = FnAcceptor::new(|_setup: SetupFrame, _session: Session| async move {
            Err::<Arc<dyn Responder>, _>(TetherError::Rejected("not today".to_string()))
        });
        let server = TetherServer::new(ServerConfig::default(), acceptor);
        let (mut client, connection) = local::pair();

        client.send(setup(Version::CURRENT, None)).await.unwrap();
        server.handle_connection(connection).await;

        let error = expect_rejection(&mut client, ErrorCode::REJECTED_SETUP).await;
        assert!(error.message.contains("not today"));
    }

    #[tokio::test]
    async fn test_duplicate_resume_token() {
        let config = ServerConfig::default().with_resume(ResumeConfig::default());
        let server = TetherServer::new(config, accept_all());
        let token = ResumeToken::generate();

        let (first, connection) = local::pair();
        first.send(setup(Version::CURRENT, Some(token.clone()))).await.unwrap();
        server.handle_connection(connection).await;
        assert_eq!(server.registry().len(), 1);

        let (mut second, connection) = local::pair();
        second.send(setup(Version::CURRENT, Some(token))).await.unwrap();
        server.handle_connection(connection).await;
        expect_rejection(&mut second, ErrorCode::REJECTED_SETUP).await;
        assert_eq!(server.registry().len(), 1);
    }

    #[tokio::test]
    async fn test_abandoned_session_leaves_registry() {
        let config = ServerConfig::default().with_resume(ResumeConfig::default());
        let server = TetherServer::new(config, accept_all());
        let token = ResumeToken::generate();

        let (client, connection) = local::pair();
        client
            .send(setup_with_lifetime(
                Version::CURRENT,
                Some(token.clone()),
                Duration::from_millis(50),
            ))
            .await
            .unwrap();
        server.handle_connection(connection).await;
        assert_eq!(server.registry().len(), 1);

        client.close();
        for _ in 0..100 {
            if server.registry().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(server.registry().get(&token).is_none());
    }
}
