//! Tether client implementation

use crate::config::ClientConfig;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use tether_core::{ResumeToken, Role, SetupFrame, TetherError, Version};
use tether_session::{ConnectionMultiplexer, ResumableConnection, Responder, Session};
use tether_transport::{ClientTransport, PluginRegistry};
use tracing::{debug, instrument};

/// Establishes client sessions
#[derive(Clone)]
pub struct TetherClient {
    config: ClientConfig,
    plugins: PluginRegistry,
    responder: Option<Arc<dyn Responder>>,
}

impl TetherClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            plugins: PluginRegistry::new(),
            responder: None,
        }
    }

    /// Interceptors applied to every physical connection, including reconnects
    pub fn with_plugins(mut self, plugins: PluginRegistry) -> Self {
        self.plugins = plugins;
        self
    }

    /// Serve requests the server issues on this session
    pub fn with_responder(mut self, responder: Arc<dyn Responder>) -> Self {
        self.responder = Some(responder);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect and send SETUP
    ///
    /// The session is usable as soon as this returns; requests are pipelined
    /// behind SETUP and a rejection arrives as the session's close error.
    #[instrument(skip_all)]
    pub async fn connect(
        &self,
        transport: Arc<dyn ClientTransport>,
    ) -> Result<ClientSession, TetherError> {
        self.config.validate()?;

        let connection = transport.connect().await?;
        let connection = self.plugins.apply_connection(connection);

        let (connection, resumable, resume_token) = match &self.config.resume {
            Some(resume) => {
                let token = self
                    .config
                    .resume_token
                    .clone()
                    .unwrap_or_else(ResumeToken::generate);
                let (resumable, logical) =
                    ResumableConnection::new(Role::Client, token.clone(), resume.clone(), connection);
                (logical, Some(resumable), Some(token))
            }
            None => (connection, None, None),
        };

        let multiplexer = ConnectionMultiplexer::new(connection, Role::Client);
        let control = multiplexer
            .control_view()
            .ok_or_else(|| TetherError::Protocol("control view already taken".to_string()))?;

        let keepalive = &self.config.keepalive;
        let setup = SetupFrame {
            version: Version::CURRENT,
            keepalive_interval: keepalive.interval,
            max_lifetime: keepalive.max_lifetime(),
            resume_token,
            lease: false,
            metadata_mime_type: self.config.metadata_mime_type.clone(),
            data_mime_type: self.config.data_mime_type.clone(),
            payload: self.config.setup_payload.clone(),
        };
        if let Err(e) = control.send(setup.into_frame()).await {
            multiplexer.close();
            return Err(e);
        }
        if let Some(resumable) = &resumable {
            resumable.mark_established();
        }

        let session = Session::start(
            multiplexer,
            control,
            resumable.clone(),
            Some(keepalive.clone()),
        )?;
        if let Some(responder) = &self.responder {
            session.serve(responder.clone())?;
        }

        debug!(resumable = resumable.is_some(), "client session established");
        Ok(ClientSession {
            session,
            resumable,
            transport,
            plugins: self.plugins.clone(),
        })
    }
}

impl fmt::Debug for TetherClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TetherClient")
            .field("config", &self.config)
            .field("plugins", &self.plugins)
            .field("responder", &self.responder.as_ref().map(|_| "<Responder>"))
            .finish()
    }
}

/// A client session plus what is needed to resume it
pub struct ClientSession {
    session: Session,
    resumable: Option<ResumableConnection>,
    transport: Arc<dyn ClientTransport>,
    plugins: PluginRegistry,
}

impl ClientSession {
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Dial the transport once and resume the session over the new connection
    ///
    /// A failed dial or a failed link leaves the session disconnected so the
    /// caller may try again. A rejected resume closes the session.
    #[instrument(skip(self))]
    pub async fn reconnect(&self) -> Result<(), TetherError> {
        let resumable = self
            .resumable
            .as_ref()
            .ok_or_else(|| TetherError::Config("session is not resumable".to_string()))?;
        if resumable.is_closed() {
            return Err(TetherError::ConnectionClosed);
        }

        let connection = self.transport.connect().await?;
        let connection = self.plugins.apply_connection(connection);
        resumable.reconnect(connection).await?;
        debug!(token = %resumable.token(), "session resumed");
        Ok(())
    }
}

impl Deref for ClientSession {
    type Target = Session;

    fn deref(&self) -> &Session {
        &self.session
    }
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("session", &self.session)
            .field("resumable", &self.resumable.is_some())
            .finish()
    }
}
