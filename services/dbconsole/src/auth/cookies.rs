//! Browser cookie construction and parsing.
//!
//! Both console cookies are `HttpOnly`, `SameSite=Strict`, `Path=/`, and
//! `Secure` when the console is served over TLS.
use axum::http::header::COOKIE;
use axum::http::HeaderMap;
use cookie::{Cookie, SameSite};
use std::time::Duration;

pub const SESSION_COOKIE: &str = "dbconsole_session";
pub const IDENTITY_COOKIE: &str = "dbconsole_identity";

#[derive(Debug, Clone)]
pub struct CookiePolicy {
    pub secure: bool,
    pub session_max_age: Duration,
    pub identity_max_age: Duration,
}

impl CookiePolicy {
    pub fn session(&self, value: String) -> Cookie<'static> {
        self.build(SESSION_COOKIE, value, self.session_max_age)
    }

    pub fn identity(&self, value: String) -> Cookie<'static> {
        self.build(IDENTITY_COOKIE, value, self.identity_max_age)
    }

    /// Removal cookies for both names, sent on logout and on any tamper.
    pub fn clear_all(&self) -> [Cookie<'static>; 2] {
        [self.removal(SESSION_COOKIE), self.removal(IDENTITY_COOKIE)]
    }

    fn build(&self, name: &'static str, value: String, max_age: Duration) -> Cookie<'static> {
        let seconds = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        Cookie::build((name, value))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .max_age(cookie::time::Duration::seconds(seconds))
            .build()
    }

    fn removal(&self, name: &'static str) -> Cookie<'static> {
        Cookie::build((name, ""))
            .path("/")
            .http_only(true)
            .secure(self.secure)
            .same_site(SameSite::Strict)
            .max_age(cookie::time::Duration::ZERO)
            .expires(cookie::time::OffsetDateTime::UNIX_EPOCH)
            .build()
    }
}

/// The console's cookies as presented on one request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PresentedCookies {
    pub session: Option<String>,
    pub identity: Option<String>,
}

impl PresentedCookies {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let mut presented = Self::default();
        for header in headers.get_all(COOKIE) {
            let Ok(text) = header.to_str() else {
                continue;
            };
            for cookie in Cookie::split_parse(text).flatten() {
                let value = cookie.value().to_string();
                if value.is_empty() {
                    continue;
                }
                match cookie.name() {
                    SESSION_COOKIE => presented.session = Some(value),
                    IDENTITY_COOKIE => presented.identity = Some(value),
                    _ => {}
                }
            }
        }
        presented
    }

    pub fn is_empty(&self) -> bool {
        self.session.is_none() && self.identity.is_none()
    }
}
