use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::User;

/// The authenticated user a request acts as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: i32,
    pub username: String,
}

impl From<&User> for Principal {
    fn from(user: &User) -> Self {
        Principal {
            user_id: user.id,
            username: user.username.clone(),
        }
    }
}

/// Ownership check run before every mutating operation.
pub fn authorize(principal: &Principal, owner_id: i32) -> Result<()> {
    if principal.user_id == owner_id {
        Ok(())
    } else {
        tracing::warn!(
            user = %principal.username,
            owner_id,
            "refused action on a resource owned by someone else"
        );
        Err(Error::Authorization)
    }
}

pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone)]
struct Session {
    principal: Principal,
    issued_at: Instant,
}

/// Bearer tokens issued at login, mapped to the user they belong to.
/// Tokens lapse `ttl` after issue; lapsed ones are swept on every login.
#[derive(Debug, Clone)]
pub struct Sessions {
    inner: Arc<Mutex<HashMap<Uuid, Session>>>,
    ttl: Duration,
}

impl Default for Sessions {
    fn default() -> Self {
        Sessions::new(DEFAULT_SESSION_TTL)
    }
}

impl Sessions {
    pub fn new(ttl: Duration) -> Self {
        Sessions {
            inner: Arc::default(),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<Uuid, Session>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_live(&self, session: &Session) -> bool {
        session.issued_at.elapsed() < self.ttl
    }

    pub fn login(&self, user: &User) -> Uuid {
        let token = Uuid::new_v4();
        let mut sessions = self.lock();
        let before = sessions.len();
        sessions.retain(|_, s| self.is_live(s));
        if sessions.len() < before {
            tracing::debug!(expired = before - sessions.len(), "swept expired sessions");
        }
        sessions.insert(
            token,
            Session {
                principal: Principal::from(user),
                issued_at: Instant::now(),
            },
        );
        tracing::info!(user = %user.username, "session opened");
        token
    }

    pub fn logout(&self, token: Uuid) -> bool {
        self.lock().remove(&token).is_some()
    }

    pub fn resolve(&self, token: Uuid) -> Option<Principal> {
        let mut sessions = self.lock();
        let session = sessions.get(&token)?.clone();
        if self.is_live(&session) {
            Some(session.principal)
        } else {
            sessions.remove(&token);
            None
        }
    }

    /// Number of stored tokens, lapsed ones not yet swept included.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every session of a user, e.g. after the account is deleted.
    pub fn forget_user(&self, user_id: i32) {
        self.lock().retain(|_, s| s.principal.user_id != user_id);
    }

    /// Resolves an `Authorization: Bearer <token>` header value.
    pub fn resolve_header(&self, header: Option<&str>) -> Result<Principal> {
        let token = bearer_token(header).ok_or(Error::Unauthenticated)?;
        self.resolve(token).ok_or(Error::Unauthenticated)
    }
}

pub fn bearer_token(header: Option<&str>) -> Option<Uuid> {
    header
        .and_then(|h| h.strip_prefix("Bearer "))
        .and_then(|t| Uuid::parse_str(t.trim()).ok())
}
