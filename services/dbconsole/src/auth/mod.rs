//! Authentication plumbing: cookie sealing, cookie headers, and the session
//! registry that ties a browser to database credentials.
pub mod cookies;
pub mod sealer;
pub mod session;

pub use cookies::{CookiePolicy, PresentedCookies, IDENTITY_COOKIE, SESSION_COOKIE};
pub use sealer::{CookieKey, SealError, Sealer};
pub use session::{ActiveSession, IssuedSession, OpenedIdentity, SessionPolicy, SessionRegistry};
