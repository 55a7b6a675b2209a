//! Explicit per-user session state.
//!
//! A [`SessionContext`] is created at login and threaded through every chat
//! operation. It carries the authenticated user, the currently selected thread
//! and an expiry instant. Every operation calls [`SessionContext::check`] first;
//! an expired or logged-out session refuses all further work.

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::error::StoreError;
use crate::identity::INVALID_CREDENTIALS;

pub const MISSING_CREDENTIALS: &str = "Please enter username and password.";

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("{}", MISSING_CREDENTIALS)]
    MissingCredentials,

    #[error("{}", INVALID_CREDENTIALS)]
    InvalidCredentials,
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session expired, please log in again")]
    Expired,

    #[error("No chat is selected")]
    NoActiveChat,

    #[error("Chat {0} belongs to another user")]
    NotOwner(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct SessionContext {
    user_id: i32,
    username: String,
    thread_id: Option<String>,
    expires_at: DateTime<Utc>,
    active: bool,
}

impl SessionContext {
    /// A session for `user_id` valid for `ttl_secs` from now.
    pub fn new(user_id: i32, username: impl Into<String>, ttl_secs: u64) -> Self {
        let ttl = TimeDelta::try_seconds(ttl_secs.min(i64::MAX as u64) as i64)
            .unwrap_or(TimeDelta::MAX);
        let expires_at = Utc::now()
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self::expiring_at(user_id, username, expires_at)
    }

    pub fn expiring_at(user_id: i32, username: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            user_id,
            username: username.into(),
            thread_id: None,
            expires_at,
            active: true,
        }
    }

    pub fn user_id(&self) -> i32 {
        self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn thread_id(&self) -> Option<&str> {
        self.thread_id.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub(crate) fn select_thread(&mut self, thread_id: impl Into<String>) {
        self.thread_id = Some(thread_id.into());
    }

    /// Fails once the session was invalidated or its TTL elapsed.
    pub fn check(&self) -> Result<(), SessionError> {
        self.check_at(Utc::now())
    }

    pub fn check_at(&self, now: DateTime<Utc>) -> Result<(), SessionError> {
        if !self.active || now >= self.expires_at {
            return Err(SessionError::Expired);
        }
        Ok(())
    }

    /// The selected thread, after checking the session is still valid.
    pub fn current_thread(&self) -> Result<String, SessionError> {
        self.check()?;
        self.thread_id.clone().ok_or(SessionError::NoActiveChat)
    }

    pub fn invalidate(&mut self) {
        self.active = false;
        self.thread_id = None;
    }
}

/// `ana` -> `Ana`, `BOB` -> `Bob`.
pub fn display_name(username: &str) -> String {
    let mut chars = username.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_session_is_valid_until_ttl() {
        let session = SessionContext::new(1, "ana", 60);
        assert!(session.check().is_ok());
        assert!(matches!(
            session.check_at(session.expires_at()),
            Err(SessionError::Expired)
        ));
    }

    #[test]
    fn zero_ttl_is_immediately_expired() {
        let session = SessionContext::new(1, "ana", 0);
        assert!(matches!(session.check(), Err(SessionError::Expired)));
    }

    #[test]
    fn huge_ttl_does_not_overflow() {
        let session = SessionContext::new(1, "ana", u64::MAX);
        assert!(session.check().is_ok());
    }

    #[test]
    fn invalidate_clears_thread_and_refuses_work() {
        let mut session = SessionContext::new(1, "ana", 60);
        session.select_thread("t1");
        assert_eq!(session.current_thread().unwrap(), "t1");

        session.invalidate();
        assert_eq!(session.thread_id(), None);
        assert!(matches!(session.current_thread(), Err(SessionError::Expired)));
    }

    #[test]
    fn no_thread_selected() {
        let session = SessionContext::new(1, "ana", 60);
        assert!(matches!(session.current_thread(), Err(SessionError::NoActiveChat)));
    }

    #[test]
    fn login_messages() {
        assert_eq!(LoginError::MissingCredentials.to_string(), MISSING_CREDENTIALS);
        assert_eq!(LoginError::InvalidCredentials.to_string(), INVALID_CREDENTIALS);
    }

    #[test]
    fn display_name_capitalises() {
        assert_eq!(display_name("ana"), "Ana");
        assert_eq!(display_name("BOB"), "Bob");
        assert_eq!(display_name(""), "");
    }
}
