//! Live resumable sessions by resume token.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tether_core::{ResumeToken, TetherError};
use tether_session::ResumableConnection;
use tracing::debug;

/// Resumable sessions that a RESUME may attach to
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<Mutex<HashMap<ResumeToken, ResumableConnection>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `session` under its token
    ///
    /// Fails with `Rejected` if a live session already holds the token. The
    /// entry is removed once the session closes.
    pub fn register(&self, session: ResumableConnection) -> Result<(), TetherError> {
        let token = session.token().clone();
        {
            let mut sessions = self.lock()?;
            if sessions.contains_key(&token) {
                return Err(TetherError::Rejected(format!(
                    "resume token {} is already in use",
                    token
                )));
            }
            sessions.insert(token.clone(), session.clone());
        }

        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            let outcome = session.closed().await;
            if let Ok(mut sessions) = sessions.lock() {
                sessions.remove(&token);
            }
            debug!(%token, ?outcome, "resumable session unregistered");
        });
        Ok(())
    }

    pub fn get(&self, token: &ResumeToken) -> Option<ResumableConnection> {
        self.lock().ok()?.get(token).cloned()
    }

    pub fn len(&self) -> usize {
        self.lock().map(|sessions| sessions.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<ResumeToken, ResumableConnection>>, TetherError>
    {
        self.sessions
            .lock()
            .map_err(|_| TetherError::Protocol("session registry poisoned".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_core::{ResumeConfig, Role};
    use tether_transport::{local, DuplexConnection};

    fn resumable(token: &ResumeToken) -> (ResumableConnection, DuplexConnection) {
        let (a, _b) = local::pair();
        ResumableConnection::new(Role::Server, token.clone(), ResumeConfig::default(), a)
    }

    #[tokio::test]
    async fn test_duplicate_token_rejected() {
        let registry = SessionRegistry::new();
        let token = ResumeToken::generate();

        let (first, _first_logical) = resumable(&token);
        let (second, _second_logical) = resumable(&token);
        registry.register(first.clone()).unwrap();
        assert!(matches!(
            registry.register(second),
            Err(TetherError::Rejected(_))
        ));
        assert_eq!(registry.len(), 1);
        assert!(registry.get(&token).is_some());

        first.close();
        first.closed().await.unwrap();
        for _ in 0..100 {
            if registry.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(registry.get(&token).is_none());
    }
}
