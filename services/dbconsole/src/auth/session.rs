//! Session registry.
//!
//! # Purpose
//! Owns every live [`Session`]. A session is minted after a successful login,
//! looked up by the id carried in the sealed `session` cookie, refreshed on
//! each valid use, and removed on logout or expiry.
//!
//! # Key invariants
//! - Session ids are 128-bit random and never logged in full.
//! - `now <= absolute_expiry` and `now - last_seen_at <= idle_timeout` for
//!   every session handed out; a session failing either is removed on sight.
//! - The password is only held sealed; it is opened per request to build
//!   [`Credentials`] and never stored in plain text.
//! - Ending a session revokes the nonce of every identity cookie tied to it,
//!   so replaying pre-logout cookies cannot log the user back in.
use crate::auth::sealer::{IdentityCookie, SealError, Sealer, SessionCookie};
use crate::backend::Credentials;
use crate::clock::{log_prefix, new_id, Clock};
use crate::error::{ConsoleError, ConsoleResult};
use dashmap::DashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct SessionPolicy {
    pub idle_timeout: Duration,
    pub absolute_timeout: Duration,
    pub identity_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub username: String,
    pub sealed_password: String,
    /// Nonces of the identity cookies that may re-establish this user's
    /// login: the one minted with the session, plus the one it was silently
    /// re-established from, if any.
    pub identity_nonces: Vec<String>,
    pub created_at: Instant,
    pub last_seen_at: Instant,
    pub absolute_expiry: Instant,
}

impl Session {
    fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        now > self.absolute_expiry || now.saturating_duration_since(self.last_seen_at) > idle_timeout
    }
}

/// A freshly minted session and the sealed values for both cookies.
#[derive(Debug, Clone)]
pub struct IssuedSession {
    pub session_id: String,
    pub username: String,
    pub session_cookie: String,
    pub identity_cookie: String,
}

/// An opened `identity` cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedIdentity {
    pub credentials: Credentials,
    pub nonce: String,
    pub issued_at: u64,
}

/// What a request learns from a valid session.
#[derive(Debug, Clone)]
pub struct ActiveSession {
    pub session_id: String,
    pub credentials: Credentials,
}

pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    /// Revoked identity nonce -> unix second after which the cookie would
    /// be stale anyway and the entry can go.
    revoked_identities: DashMap<String, u64>,
    sealer: Sealer,
    policy: SessionPolicy,
}

impl SessionRegistry {
    pub fn new(sealer: Sealer, policy: SessionPolicy) -> Self {
        Self {
            sessions: DashMap::new(),
            revoked_identities: DashMap::new(),
            sealer,
            policy,
        }
    }

    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Mint a session for credentials that already authenticated at the backend.
    pub fn create(&self, credentials: &Credentials) -> ConsoleResult<IssuedSession> {
        if credentials.password.is_empty() {
            return Err(ConsoleError::validation("password must not be empty"));
        }
        let clock = self.sealer.clock();
        let now = clock.now();
        let sealed_password = self.sealer.seal_secret(&credentials.password)?;
        let identity_nonce = new_id();
        let session = Session {
            id: new_id(),
            username: credentials.role.clone(),
            sealed_password: sealed_password.clone(),
            identity_nonces: vec![identity_nonce.clone()],
            created_at: now,
            last_seen_at: now,
            absolute_expiry: now + self.policy.absolute_timeout,
        };
        let session_cookie = self.seal_session_cookie(&session.id)?;
        let identity_cookie = self.sealer.seal(&IdentityCookie {
            usr: credentials.role.clone(),
            pwd: sealed_password,
            iat: clock.unix_seconds(),
            nonce: identity_nonce,
        })?;
        let issued = IssuedSession {
            session_id: session.id.clone(),
            username: session.username.clone(),
            session_cookie,
            identity_cookie,
        };
        self.sessions.insert(session.id.clone(), session);
        metrics::gauge!("dbconsole_sessions_active").set(self.sessions.len() as f64);
        tracing::info!(
            session = log_prefix(&issued.session_id),
            user = %issued.username,
            "session created"
        );
        Ok(issued)
    }

    /// A new sealed `session` cookie value for an existing session id.
    pub fn seal_session_cookie(&self, session_id: &str) -> ConsoleResult<String> {
        Ok(self.sealer.seal(&SessionCookie {
            sid: session_id.to_string(),
            iat: self.sealer.clock().unix_seconds(),
            nonce: new_id(),
        })?)
    }

    /// Open a `session` cookie and return the session id it carries.
    pub fn open_session_cookie(&self, sealed: &str) -> Result<String, SealError> {
        let payload: SessionCookie = self.sealer.open(sealed, self.policy.absolute_timeout)?;
        Ok(payload.sid)
    }

    /// Open an `identity` cookie down to usable credentials. Cookies revoked
    /// by a logout yield [`SealError::Revoked`].
    pub fn open_identity_cookie(&self, sealed: &str) -> Result<OpenedIdentity, SealError> {
        let payload: IdentityCookie = self.sealer.open(sealed, self.policy.identity_timeout)?;
        if self.revoked_identities.contains_key(&payload.nonce) {
            return Err(SealError::Revoked);
        }
        let password = self.sealer.open_secret(&payload.pwd)?;
        Ok(OpenedIdentity {
            credentials: Credentials::new(payload.usr, password),
            nonce: payload.nonce,
            issued_at: payload.iat,
        })
    }

    /// Tie an identity cookie the client already holds to a session, so that
    /// ending the session revokes it as well.
    pub fn bind_identity(&self, session_id: &str, nonce: &str) {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            if !session.identity_nonces.iter().any(|known| known == nonce) {
                session.identity_nonces.push(nonce.to_string());
            }
        }
    }

    /// Refuse any further use of the identity cookie carrying `nonce`.
    pub fn revoke_identity(&self, nonce: &str) {
        let until = self
            .sealer
            .clock()
            .unix_seconds()
            .saturating_add(self.policy.identity_timeout.as_secs());
        self.revoked_identities.insert(nonce.to_string(), until);
    }

    /// Validate a session id, refresh its idle clock, and open its password.
    pub fn touch(&self, session_id: &str) -> ConsoleResult<ActiveSession> {
        let now = self.sealer.clock().now();
        let (username, sealed_password) = {
            let Some(mut session) = self.sessions.get_mut(session_id) else {
                return Err(ConsoleError::auth("session is not known, please log in"));
            };
            if session.is_expired(now, self.policy.idle_timeout) {
                None
            } else {
                session.last_seen_at = now;
                Some((session.username.clone(), session.sealed_password.clone()))
            }
        }
        .ok_or_else(|| {
            self.expire(session_id);
            ConsoleError::auth("session expired, please log in again")
        })?;
        let password = self.sealer.open_secret(&sealed_password)?;
        Ok(ActiveSession {
            session_id: session_id.to_string(),
            credentials: Credentials::new(username, password),
        })
    }

    pub fn username(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .map(|session| session.username.clone())
    }

    /// Remove a session and revoke its identity cookies. Removing an unknown
    /// id is not an error.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let removed = self.sessions.remove(session_id).map(|(_, session)| session);
        if let Some(session) = &removed {
            for nonce in &session.identity_nonces {
                self.revoke_identity(nonce);
            }
            metrics::gauge!("dbconsole_sessions_active").set(self.sessions.len() as f64);
            tracing::info!(session = log_prefix(session_id), "session ended");
        }
        removed
    }

    /// Evict every idle or absolutely expired session.
    pub fn reap_expired(&self) -> usize {
        let now = self.sealer.clock().now();
        let before = self.sessions.len();
        self.sessions
            .retain(|_, session| !session.is_expired(now, self.policy.idle_timeout));
        let reaped = before.saturating_sub(self.sessions.len());
        let wall = self.sealer.clock().unix_seconds();
        self.revoked_identities.retain(|_, until| *until >= wall);
        if reaped > 0 {
            metrics::gauge!("dbconsole_sessions_active").set(self.sessions.len() as f64);
            tracing::debug!(reaped, "expired sessions evicted");
        }
        reaped
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    fn expire(&self, session_id: &str) {
        if self.sessions.remove(session_id).is_some() {
            metrics::gauge!("dbconsole_sessions_active").set(self.sessions.len() as f64);
            tracing::info!(session = log_prefix(session_id), "session expired");
        }
    }
}
