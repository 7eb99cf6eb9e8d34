//! Access/refresh token issuance, rotation and revocation.
//!
//! Access tokens carry a snapshot of the identity and are verified without
//! touching storage. Refresh tokens carry only the id; the directory keeps the
//! SHA-256 of the single refresh token currently accepted for each identity.

use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sphere_protocol::UserId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::identity::Identity;
use crate::secrets::{constant_time_eq, sha256_hex};

/// Default access token lifetime (15 minutes).
pub const DEFAULT_ACCESS_TTL: Duration = Duration::from_secs(15 * 60);

/// Default refresh token lifetime (10 days).
pub const DEFAULT_REFRESH_TTL: Duration = Duration::from_secs(10 * 24 * 60 * 60);

/// Secrets and lifetimes for both token kinds.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub access_secret: String,
    pub access_ttl: Duration,
    pub refresh_secret: String,
    pub refresh_ttl: Duration,
}

impl TokenConfig {
    /// Create a config with default lifetimes.
    #[must_use]
    pub fn new(access_secret: impl Into<String>, refresh_secret: impl Into<String>) -> Self {
        Self {
            access_secret: access_secret.into(),
            access_ttl: DEFAULT_ACCESS_TTL,
            refresh_secret: refresh_secret.into(),
            refresh_ttl: DEFAULT_REFRESH_TTL,
        }
    }
}

/// Claims of an access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub id: UserId,
    pub username: String,
    pub email: String,
    #[serde(rename = "emailVerified")]
    pub email_verified: bool,
    pub following: Vec<UserId>,
    pub followers: Vec<UserId>,
    pub exp: i64,
}

impl AccessClaims {
    /// Snapshot an identity into claims expiring at `exp`.
    #[must_use]
    pub fn snapshot(identity: &Identity, exp: i64) -> Self {
        Self {
            id: identity.id,
            username: identity.username.clone(),
            email: identity.email.clone(),
            email_verified: identity.email_verified,
            following: identity.following.iter().copied().collect(),
            followers: identity.followers.iter().copied().collect(),
            exp,
        }
    }
}

/// Claims of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub id: UserId,
    pub exp: i64,
    /// Makes every refresh token distinct, even two minted in the same second.
    pub jti: Uuid,
}

/// A freshly issued token pair, in plaintext.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl Keys {
    fn from_secret(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }
}

/// Issues, verifies, rotates and revokes token pairs.
pub struct TokenService {
    directory: Arc<dyn UserDirectory>,
    access: Keys,
    refresh: Keys,
    access_ttl: Duration,
    refresh_ttl: Duration,
    validation: Validation,
}

impl TokenService {
    /// Create a token service backed by `directory`.
    #[must_use]
    pub fn new(directory: Arc<dyn UserDirectory>, config: &TokenConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        Self {
            directory,
            access: Keys::from_secret(&config.access_secret),
            refresh: Keys::from_secret(&config.refresh_secret),
            access_ttl: config.access_ttl,
            refresh_ttl: config.refresh_ttl,
            validation,
        }
    }

    /// Issue a new pair for `id` and make its refresh token the only one accepted.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the identity does not exist.
    pub async fn issue(&self, id: UserId) -> Result<TokenPair> {
        let identity = self.directory.require(id).await?;
        let pair = self.mint(&identity)?;

        let hash = sha256_hex(&pair.refresh_token);
        self.directory
            .modify(id, Box::new(move |u: &mut Identity| u.refresh_token_hash = Some(hash)))
            .await?;

        debug!(user = %id, "Issued token pair");
        Ok(pair)
    }

    /// Exchange a refresh token for a new pair, invalidating the presented one.
    ///
    /// # Errors
    ///
    /// - `Unauthenticated` if no token is given or the identity is gone
    /// - `InvalidToken` if the signature or expiry check fails
    /// - `TokenMismatch` if the token is not the identity's current one,
    ///   including a token that was already rotated away
    pub async fn rotate(&self, presented: &str) -> Result<TokenPair> {
        if presented.trim().is_empty() {
            return Err(Error::Unauthenticated("no refresh token provided".into()));
        }

        let claims: RefreshClaims = self.verify(presented, &self.refresh.decoding)?;
        let identity = self
            .directory
            .get(claims.id)
            .await?
            .ok_or_else(|| Error::Unauthenticated("identity no longer exists".into()))?;

        let presented_hash = sha256_hex(presented);
        let matches = identity
            .refresh_token_hash
            .as_deref()
            .is_some_and(|stored| constant_time_eq(stored, &presented_hash));
        if !matches {
            warn!(user = %identity.id, "Refresh token mismatch, possible replay");
            return Err(Error::TokenMismatch);
        }

        let pair = self.mint(&identity)?;
        let swapped = match self
            .directory
            .swap_refresh_hash(identity.id, &presented_hash, sha256_hex(&pair.refresh_token))
            .await
        {
            Ok(swapped) => swapped,
            Err(Error::NotFound(_)) => {
                return Err(Error::Unauthenticated("identity no longer exists".into()))
            }
            Err(e) => return Err(e),
        };

        if !swapped {
            // A concurrent refresh consumed the same token first.
            warn!(user = %identity.id, "Refresh token consumed concurrently");
            return Err(Error::TokenMismatch);
        }

        debug!(user = %identity.id, "Rotated token pair");
        Ok(pair)
    }

    /// Forget the stored refresh hash so no refresh token is accepted.
    ///
    /// Idempotent; revoking an unknown identity is a no-op.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory fails.
    pub async fn revoke(&self, id: UserId) -> Result<()> {
        match self
            .directory
            .modify(id, Box::new(|u: &mut Identity| u.refresh_token_hash = None))
            .await
        {
            Ok(_) => {
                debug!(user = %id, "Revoked refresh token");
                Ok(())
            }
            Err(Error::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Verify an access token's signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` on any verification failure.
    pub fn verify_access(&self, token: &str) -> Result<AccessClaims> {
        self.verify(token, &self.access.decoding)
    }

    /// Verify a refresh token's signature and expiry.
    ///
    /// # Errors
    ///
    /// Returns `InvalidToken` on any verification failure.
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims> {
        self.verify(token, &self.refresh.decoding)
    }

    fn verify<C: DeserializeOwned>(&self, token: &str, key: &DecodingKey) -> Result<C> {
        decode::<C>(token, key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| Error::InvalidToken(e.to_string()))
    }

    fn mint(&self, identity: &Identity) -> Result<TokenPair> {
        let now = Utc::now().timestamp();
        let access = AccessClaims::snapshot(identity, expiry(now, self.access_ttl)?);
        let refresh = RefreshClaims {
            id: identity.id,
            exp: expiry(now, self.refresh_ttl)?,
            jti: Uuid::new_v4(),
        };

        let header = Header::new(Algorithm::HS256);
        let access_token = encode(&header, &access, &self.access.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign access token: {e}")))?;
        let refresh_token = encode(&header, &refresh, &self.refresh.encoding)
            .map_err(|e| Error::Internal(format!("failed to sign refresh token: {e}")))?;

        Ok(TokenPair {
            access_token,
            refresh_token,
        })
    }
}

fn expiry(now: i64, ttl: Duration) -> Result<i64> {
    i64::try_from(ttl.as_secs())
        .ok()
        .and_then(|secs| now.checked_add(secs))
        .ok_or_else(|| Error::Internal(format!("token lifetime of {}s is out of range", ttl.as_secs())))
}
