//! # Identity store
//!
//! Maps a username to a numeric identity and a salted Argon2 verifier.
//!
//! Verification never tells the caller *why* it failed: an unknown username, a
//! wrong secret, an unreadable verifier and an unavailable database all come back
//! as the same [`INVALID_CREDENTIALS`] reason. The root cause is only logged.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::Utc;
use diesel::prelude::*;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{Result, StoreError};
use crate::models::{NewUser, User};
use crate::schema::users;
use crate::store::Database;

/// The single reason reported for every failed verification.
pub const INVALID_CREDENTIALS: &str = "Invalid username or password.";

/// Secret hashed once per hasher to give unknown usernames a verifier to check against.
const DECOY_SECRET: &str = "gemis-decoy-verifier";

/// Salts and hashes secrets, and checks secrets against stored verifiers.
#[derive(Clone)]
pub struct SecretHasher {
    argon2: Argon2<'static>,
    decoy: OnceCell<String>,
}

impl Default for SecretHasher {
    fn default() -> Self {
        Self {
            argon2: Argon2::default(),
            decoy: OnceCell::new(),
        }
    }
}

impl SecretHasher {
    /// Argon2id with explicit cost parameters (memory in KiB, iterations, lanes).
    pub fn with_params(m_cost: u32, t_cost: u32, p_cost: u32) -> Result<Self> {
        let params =
            Params::new(m_cost, t_cost, p_cost, None).map_err(|e| StoreError::hash(e.to_string()))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
            decoy: OnceCell::new(),
        })
    }

    /// Produce a PHC string with a fresh random salt.
    pub fn hash(&self, secret: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = self
            .argon2
            .hash_password(secret.as_bytes(), &salt)
            .map_err(|e| StoreError::hash(e.to_string()))?;
        Ok(hash.to_string())
    }

    /// Compare `secret` against a stored PHC string.
    ///
    /// A malformed verifier is an error, a mismatch is `Ok(false)`.
    pub fn check(&self, secret: &str, verifier: &str) -> Result<bool> {
        let parsed = PasswordHash::new(verifier).map_err(|e| StoreError::hash(e.to_string()))?;
        Ok(self
            .argon2
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok())
    }

    /// Run a full check against a verifier with this hasher's parameters and
    /// report a mismatch. Unknown usernames cost as much as wrong secrets.
    pub fn check_decoy(&self, secret: &str) -> Result<bool> {
        let verifier = self.decoy.get_or_try_init(|| self.hash(DECOY_SECRET))?;
        self.check(secret, verifier)?;
        Ok(false)
    }
}

impl Database {
    /// Provision a user. Fails with [`StoreError::DuplicateUser`] if the name is taken.
    pub fn create_user(&mut self, name: &str, secret: &str) -> Result<i32> {
        let verifier = self.hasher.hash(secret)?;
        let new_user = NewUser {
            username: name,
            hash_password: &verifier,
            created_at: Utc::now().naive_utc(),
        };

        let inserted = diesel::insert_into(users::table)
            .values(&new_user)
            .returning(users::id)
            .get_result::<i32>(self.conn())
            .map_err(StoreError::from);

        match inserted {
            Ok(id) => {
                info!(user_id = id, username = name, "user created");
                Ok(id)
            }
            Err(err) if err.is_unique_violation() => Err(StoreError::DuplicateUser(name.into())),
            Err(err) => Err(err),
        }
    }

    /// Check a credential pair.
    ///
    /// Returns `(true, "OK")` on success and `(false, INVALID_CREDENTIALS)` on
    /// any failure, including infrastructure faults.
    pub fn verify(&mut self, name: &str, secret: &str) -> (bool, &'static str) {
        match self.try_verify(name, secret) {
            Ok(true) => (true, "OK"),
            Ok(false) => (false, INVALID_CREDENTIALS),
            Err(err) => {
                warn!(username = name, error = %err, "credential verification fault");
                (false, INVALID_CREDENTIALS)
            }
        }
    }

    fn try_verify(&mut self, name: &str, secret: &str) -> Result<bool> {
        let verifier = users::table
            .filter(users::username.eq(name))
            .select(users::hash_password)
            .first::<String>(self.conn())
            .optional()?;

        match verifier {
            Some(verifier) => self.hasher.check(secret, &verifier),
            None => self.hasher.check_decoy(secret),
        }
    }

    pub fn user_id(&mut self, name: &str) -> Result<Option<i32>> {
        Ok(users::table
            .filter(users::username.eq(name))
            .select(users::id)
            .first::<i32>(self.conn())
            .optional()?)
    }

    /// All users, newest first.
    pub fn list_users(&mut self) -> Result<Vec<User>> {
        Ok(users::table
            .order((users::created_at.desc(), users::id.desc()))
            .select(User::as_select())
            .load(self.conn())?)
    }

    /// Replace a user's secret. Returns `false` if no such user exists.
    pub fn set_secret(&mut self, name: &str, secret: &str) -> Result<bool> {
        let verifier = self.hasher.hash(secret)?;
        let updated = diesel::update(users::table.filter(users::username.eq(name)))
            .set(users::hash_password.eq(verifier))
            .execute(self.conn())?;
        Ok(updated > 0)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::memory_db;

    use super::*;

    #[test]
    fn verify_accepts_the_right_secret_only() {
        let mut db = memory_db();
        db.create_user("ana", "s3cret").unwrap();

        assert_eq!(db.verify("ana", "s3cret"), (true, "OK"));
        assert_eq!(db.verify("ana", "wrong"), (false, INVALID_CREDENTIALS));
    }

    #[test]
    fn unknown_user_is_indistinguishable_from_wrong_secret() {
        let mut db = memory_db();
        db.create_user("ana", "s3cret").unwrap();

        let unknown = db.verify("nobody", "s3cret");
        let wrong = db.verify("ana", "nope");
        assert_eq!(unknown, wrong);
    }

    #[test]
    fn unknown_user_still_runs_a_full_check() {
        let mut db = memory_db();
        assert!(db.hasher.decoy.get().is_none());

        assert_eq!(db.verify("nobody", "gemis-decoy-verifier"), (false, INVALID_CREDENTIALS));
        let decoy = db.hasher.decoy.get().cloned().unwrap();
        assert!(decoy.starts_with("$argon2id$"));

        // The decoy is hashed once and reused.
        db.verify("someone", "x");
        assert_eq!(db.hasher.decoy.get(), Some(&decoy));
    }

    #[test]
    fn corrupt_verifier_collapses_to_generic_reason() {
        let mut db = memory_db();
        db.create_user("ana", "s3cret").unwrap();
        diesel::update(users::table)
            .set(users::hash_password.eq("not-a-phc-string"))
            .execute(db.conn())
            .unwrap();

        assert_eq!(db.verify("ana", "s3cret"), (false, INVALID_CREDENTIALS));
    }

    #[test]
    fn duplicate_username_is_rejected() {
        let mut db = memory_db();
        db.create_user("ana", "one").unwrap();

        let err = db.create_user("ana", "two").unwrap_err();
        assert!(matches!(err, StoreError::DuplicateUser(name) if name == "ana"));
        assert_eq!(db.list_users().unwrap().len(), 1);
    }

    #[test]
    fn secrets_are_salted() {
        let mut db = memory_db();
        db.create_user("ana", "same").unwrap();
        db.create_user("bob", "same").unwrap();

        let users = db.list_users().unwrap();
        assert_ne!(users[0].hash_password, users[1].hash_password);
        assert!(!users[0].hash_password.contains("same"));
    }

    #[test]
    fn set_secret_rotates_the_verifier() {
        let mut db = memory_db();
        db.create_user("ana", "old").unwrap();

        assert!(db.set_secret("ana", "new").unwrap());
        assert!(!db.set_secret("ghost", "new").unwrap());
        assert!(!db.verify("ana", "old").0);
        assert!(db.verify("ana", "new").0);
    }

    #[test]
    fn user_id_lookup() {
        let mut db = memory_db();
        let id = db.create_user("ana", "pw").unwrap();

        assert_eq!(db.user_id("ana").unwrap(), Some(id));
        assert_eq!(db.user_id("bob").unwrap(), None);
    }
}
