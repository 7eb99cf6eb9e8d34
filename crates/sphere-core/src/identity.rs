//! Identity records.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sphere_protocol::{UserId, UserSummary};
use std::collections::BTreeSet;

use crate::secrets::{constant_time_eq, sha256_hex};

/// A one-time secret stored as a hash with an expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSecret {
    /// SHA-256 hex of the plaintext secret.
    pub hash: String,
    /// When the secret stops being accepted.
    pub expires_at: DateTime<Utc>,
}

impl PendingSecret {
    /// Hash `plaintext` and stamp it with an expiry `ttl` from now.
    #[must_use]
    pub fn new(plaintext: &str, ttl: Duration) -> Self {
        Self {
            hash: sha256_hex(plaintext),
            expires_at: Utc::now() + ttl,
        }
    }

    /// Whether the secret has expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// Whether `plaintext` matches and has not expired at `now`.
    #[must_use]
    pub fn accepts(&self, plaintext: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired(now) && constant_time_eq(&self.hash, &sha256_hex(plaintext))
    }
}

/// Which pending secret of an identity to address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecretKind {
    EmailVerification,
    PhoneOtp,
    PasswordReset,
}

/// A registered identity.
///
/// Holds credentials and secret hashes, so it is never serialized as a whole.
/// Use [`Identity::profile`] for anything leaving the process.
#[derive(Debug, Clone)]
pub struct Identity {
    pub id: UserId,
    pub username: String,
    pub email: String,
    /// Argon2 PHC string. Absent for federated accounts.
    pub password_hash: Option<String>,
    pub email_verified: bool,
    pub phone_number: Option<String>,
    pub phone_verified: bool,
    pub followers: BTreeSet<UserId>,
    pub following: BTreeSet<UserId>,
    /// SHA-256 of the only refresh token currently accepted.
    pub refresh_token_hash: Option<String>,
    pub email_verification: Option<PendingSecret>,
    pub phone_otp: Option<PendingSecret>,
    pub password_reset: Option<PendingSecret>,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Create an unverified identity with an empty follow graph.
    #[must_use]
    pub fn new(
        username: impl Into<String>,
        email: impl Into<String>,
        password_hash: Option<String>,
    ) -> Self {
        Self {
            id: UserId::new(),
            username: username.into(),
            email: email.into(),
            password_hash,
            email_verified: false,
            phone_number: None,
            phone_verified: false,
            followers: BTreeSet::new(),
            following: BTreeSet::new(),
            refresh_token_hash: None,
            email_verification: None,
            phone_otp: None,
            password_reset: None,
            created_at: Utc::now(),
        }
    }

    /// Public summary for listings.
    #[must_use]
    pub fn summary(&self) -> UserSummary {
        UserSummary {
            id: self.id,
            username: self.username.clone(),
        }
    }

    /// Public profile without credentials or secrets.
    #[must_use]
    pub fn profile(&self) -> Profile {
        Profile {
            id: self.id,
            username: self.username.clone(),
            email: self.email.clone(),
            email_verified: self.email_verified,
            phone_verified: self.phone_verified,
            followers: self.followers.iter().copied().collect(),
            following: self.following.iter().copied().collect(),
            created_at: self.created_at,
        }
    }

    /// Get a pending secret.
    #[must_use]
    pub fn pending(&self, kind: SecretKind) -> Option<&PendingSecret> {
        match kind {
            SecretKind::EmailVerification => self.email_verification.as_ref(),
            SecretKind::PhoneOtp => self.phone_otp.as_ref(),
            SecretKind::PasswordReset => self.password_reset.as_ref(),
        }
    }

    /// Get a mutable slot for a pending secret.
    pub fn pending_mut(&mut self, kind: SecretKind) -> &mut Option<PendingSecret> {
        match kind {
            SecretKind::EmailVerification => &mut self.email_verification,
            SecretKind::PhoneOtp => &mut self.phone_otp,
            SecretKind::PasswordReset => &mut self.password_reset,
        }
    }
}

/// What clients see of an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub id: UserId,
    pub username: String,
    pub email: String,
    pub email_verified: bool,
    pub phone_verified: bool,
    pub followers: Vec<UserId>,
    pub following: Vec<UserId>,
    pub created_at: DateTime<Utc>,
}
