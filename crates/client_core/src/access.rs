use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use shared::domain::Identity;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessEvent {
    TokenExpired,
    TokenUpdated { token: String },
    Error(String),
}

/// Supplies credentials for the session and announces their lifecycle.
pub trait AccessManager: Send + Sync {
    fn token(&self) -> String;
    fn identity(&self) -> Identity;
    fn expiration_date(&self) -> Option<DateTime<Utc>>;

    fn is_expired(&self) -> bool {
        self.expiration_date()
            .is_some_and(|expires_at| expires_at <= Utc::now())
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessEvent>;
}

struct TokenState {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

/// Holds a token handed in by the application, which refreshes it explicitly.
pub struct StaticAccessManager {
    identity: Identity,
    state: Mutex<TokenState>,
    events: broadcast::Sender<AccessEvent>,
}

impl StaticAccessManager {
    pub fn new(
        token: impl Into<String>,
        identity: Identity,
        expires_at: Option<DateTime<Utc>>,
    ) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            identity,
            state: Mutex::new(TokenState {
                token: token.into(),
                expires_at,
            }),
            events,
        }
    }

    pub fn update_token(&self, token: impl Into<String>, expires_at: Option<DateTime<Utc>>) {
        let token = token.into();
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.token = token.clone();
            state.expires_at = expires_at;
        }
        let _ = self.events.send(AccessEvent::TokenUpdated { token });
    }

    pub fn expire(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expires_at = Some(Utc::now());
        let _ = self.events.send(AccessEvent::TokenExpired);
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.events.send(AccessEvent::Error(message.into()));
    }
}

impl AccessManager for StaticAccessManager {
    fn token(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .token
            .clone()
    }

    fn identity(&self) -> Identity {
        self.identity.clone()
    }

    fn expiration_date(&self) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .expires_at
    }

    fn subscribe(&self) -> broadcast::Receiver<AccessEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[test]
    fn expiry_and_refresh_are_announced() {
        let access = StaticAccessManager::new(
            "t1",
            Identity::new("alice"),
            Some(Utc::now() + Duration::hours(1)),
        );
        let mut events = access.subscribe();
        assert!(!access.is_expired());

        access.expire();
        assert!(access.is_expired());
        assert_eq!(events.try_recv().expect("expired"), AccessEvent::TokenExpired);

        access.update_token("t2", None);
        assert!(!access.is_expired());
        assert_eq!(access.token(), "t2");
        assert_eq!(
            events.try_recv().expect("updated"),
            AccessEvent::TokenUpdated { token: "t2".into() }
        );
    }
}
