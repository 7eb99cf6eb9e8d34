//! Account lifecycle: registration, login, verification and password reset.

use chrono::{Duration, Utc};
use sphere_protocol::UserId;
use std::sync::Arc;
use tracing::{info, warn};

use crate::directory::UserDirectory;
use crate::error::{Error, Result};
use crate::identity::{Identity, PendingSecret, SecretKind};
use crate::notifier::Notifier;
use crate::password;
use crate::secrets::{random_hex, random_otp, sha256_hex};
use crate::tokens::{AccessClaims, TokenPair, TokenService};

const MIN_USERNAME_LEN: usize = 3;
const MIN_PASSWORD_LEN: usize = 8;
const SECRET_BYTES: usize = 20;
const LOGIN_FAILED: &str = "invalid email or password";

/// Settings for account flows.
#[derive(Debug, Clone)]
pub struct AccountSettings {
    /// Base URL used in verification and reset links.
    pub public_url: String,
    /// Lifetime of verification links, reset links and phone OTPs.
    pub secret_ttl: Duration,
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            public_url: "http://127.0.0.1:8080".into(),
            secret_ttl: Duration::minutes(10),
        }
    }
}

/// Registration input.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub username: String,
    pub email: String,
    pub password: String,
}

/// Drives account flows over the directory, token service and notifier.
pub struct AccountService {
    directory: Arc<dyn UserDirectory>,
    tokens: Arc<TokenService>,
    notifier: Arc<dyn Notifier>,
    settings: AccountSettings,
}

impl AccountService {
    #[must_use]
    pub fn new(
        directory: Arc<dyn UserDirectory>,
        tokens: Arc<TokenService>,
        notifier: Arc<dyn Notifier>,
        settings: AccountSettings,
    ) -> Self {
        Self {
            directory,
            tokens,
            notifier,
            settings,
        }
    }

    /// Create an identity and email it a verification link.
    ///
    /// A failed email does not fail registration; the link is discarded so
    /// the user can ask for a new one.
    ///
    /// # Errors
    ///
    /// - `Validation` for a short username or password, or a malformed email
    /// - `Conflict` if the username or email is taken
    pub async fn register(&self, account: NewAccount) -> Result<Identity> {
        let username = account.username.trim().to_string();
        let email = normalize_email(&account.email);

        if username.chars().count() < MIN_USERNAME_LEN {
            return Err(Error::Validation(format!(
                "username must be at least {MIN_USERNAME_LEN} characters"
            )));
        }
        if !looks_like_email(&email) {
            return Err(Error::Validation("email address is invalid".into()));
        }
        if account.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let hash = password::hash(account.password).await?;
        let secret = random_hex(SECRET_BYTES);

        let mut identity = Identity::new(username, email, Some(hash));
        identity.email_verification = Some(PendingSecret::new(&secret, self.settings.secret_ttl));
        let mut identity = self.directory.insert(identity).await?;

        let link = format!("{}/api/v1/auth/verify-email?token={secret}", self.settings.public_url);
        let html = format!(
            "<p>Please verify your email by clicking this link: <a href=\"{link}\">{link}</a></p>"
        );
        if let Err(e) = self
            .notifier
            .send_email(&identity.email, "SocialSphere - Email Verification", &html)
            .await
        {
            warn!(user = %identity.id, error = %e, "Verification email failed");
            identity = self
                .clear_secret(identity.id, SecretKind::EmailVerification)
                .await?;
        }

        info!(user = %identity.id, username = %identity.username, "Account registered");
        Ok(identity)
    }

    /// Check credentials and start a new session.
    ///
    /// # Errors
    ///
    /// Returns `Unauthenticated` with the same message for an unknown email,
    /// a passwordless account and a wrong password.
    pub async fn login(&self, email: &str, password: &str) -> Result<(AccessClaims, TokenPair)> {
        let identity = self
            .directory
            .find_by_email(&normalize_email(email))
            .await?
            .ok_or_else(|| Error::Unauthenticated(LOGIN_FAILED.into()))?;

        let Some(phc) = identity.password_hash.clone() else {
            return Err(Error::Unauthenticated(LOGIN_FAILED.into()));
        };
        if !password::verify(password.to_string(), phc).await {
            warn!(user = %identity.id, "Login rejected");
            return Err(Error::Unauthenticated(LOGIN_FAILED.into()));
        }

        let pair = self.tokens.issue(identity.id).await?;
        let claims = self.tokens.verify_access(&pair.access_token)?;
        info!(user = %identity.id, "Logged in");
        Ok((claims, pair))
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// # Errors
    ///
    /// See [`TokenService::rotate`].
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        self.tokens.rotate(refresh_token).await
    }

    /// End the identity's session.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory fails.
    pub async fn logout(&self, id: UserId) -> Result<()> {
        self.tokens.revoke(id).await
    }

    /// Confirm an email address and start a session.
    ///
    /// # Errors
    ///
    /// Returns `Validation` if the link is unknown or expired.
    pub async fn verify_email(&self, secret: &str) -> Result<TokenPair> {
        let identity = self
            .consume_secret(SecretKind::EmailVerification, secret)
            .await?
            .ok_or_else(|| Error::Validation("verification link is invalid or has expired".into()))?;

        self.directory
            .modify(
                identity.id,
                Box::new(|u: &mut Identity| u.email_verified = true),
            )
            .await?;

        info!(user = %identity.id, "Email verified");
        self.tokens.issue(identity.id).await
    }

    /// Send a fresh verification link.
    ///
    /// # Errors
    ///
    /// - `NotFound` if the identity does not exist
    /// - `InvalidOperation` if the email is already verified
    /// - `Notifier` if the email could not be sent
    pub async fn resend_verification(&self, id: UserId) -> Result<()> {
        let identity = self.directory.require(id).await?;
        if identity.email_verified {
            return Err(Error::InvalidOperation("email is already verified".into()));
        }

        let secret = self.store_secret(id, SecretKind::EmailVerification).await?;
        let link = format!("{}/api/v1/auth/verify-email?token={secret}", self.settings.public_url);
        let html = format!(
            "<p>Here is your new verification link: <a href=\"{link}\">{link}</a></p>"
        );

        if let Err(e) = self
            .notifier
            .send_email(&identity.email, "SocialSphere - Resend Email Verification", &html)
            .await
        {
            warn!(user = %id, error = %e, "Verification email failed");
            self.clear_secret(id, SecretKind::EmailVerification).await?;
            return Err(Error::Notifier(e.to_string()));
        }
        Ok(())
    }

    /// Attach an unverified phone number and text it a one-time code.
    ///
    /// # Errors
    ///
    /// - `Validation` if the number is not E.164
    /// - `NotFound` if the identity does not exist
    /// - `Notifier` if the SMS could not be sent
    pub async fn add_phone(&self, id: UserId, phone: &str) -> Result<()> {
        let phone = phone.trim().to_string();
        if !is_e164(&phone) {
            return Err(Error::Validation(
                "phone number must be in E.164 format, e.g. +15551234567".into(),
            ));
        }

        let otp = random_otp();
        let pending = PendingSecret::new(&otp, self.settings.secret_ttl);
        let number = phone.clone();
        self.directory
            .modify(
                id,
                Box::new(move |u: &mut Identity| {
                    u.phone_number = Some(number);
                    u.phone_verified = false;
                    u.phone_otp = Some(pending);
                }),
            )
            .await?;

        let body = format!("Your SocialSphere verification code is: {otp}");
        if let Err(e) = self.notifier.send_sms(&phone, &body).await {
            warn!(user = %id, error = %e, "OTP SMS failed");
            self.clear_secret(id, SecretKind::PhoneOtp).await?;
            return Err(Error::Notifier(e.to_string()));
        }
        Ok(())
    }

    /// Confirm the phone number with the code sent by [`Self::add_phone`].
    ///
    /// # Errors
    ///
    /// - `Validation` for a malformed, wrong or expired code
    /// - `NotFound` if the identity does not exist
    pub async fn verify_phone(&self, id: UserId, otp: &str) -> Result<()> {
        let otp = otp.trim();
        if otp.len() != 6 || !otp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::Validation("code must be 6 digits".into()));
        }

        let identity = self.directory.require(id).await?;
        let valid = identity
            .phone_otp
            .as_ref()
            .is_some_and(|p| p.accepts(otp, Utc::now()));
        if !valid {
            return Err(Error::Validation("code is invalid or has expired".into()));
        }

        self.directory
            .modify(
                id,
                Box::new(|u: &mut Identity| {
                    u.phone_verified = true;
                    u.phone_otp = None;
                }),
            )
            .await?;
        info!(user = %id, "Phone verified");
        Ok(())
    }

    /// Email a password reset link.
    ///
    /// Unknown addresses succeed silently.
    ///
    /// # Errors
    ///
    /// Returns `Notifier` if the email could not be sent.
    pub async fn forgot_password(&self, email: &str) -> Result<()> {
        let Some(identity) = self.directory.find_by_email(&normalize_email(email)).await? else {
            return Ok(());
        };

        let secret = self.store_secret(identity.id, SecretKind::PasswordReset).await?;
        let link = format!("{}/reset-password/{secret}", self.settings.public_url);
        let html = format!(
            "<p>You requested a password reset. Click this link: <a href=\"{link}\">{link}</a></p>"
        );

        if let Err(e) = self
            .notifier
            .send_email(&identity.email, "SocialSphere - Password Reset Request", &html)
            .await
        {
            warn!(user = %identity.id, error = %e, "Reset email failed");
            self.clear_secret(identity.id, SecretKind::PasswordReset).await?;
            return Err(Error::Notifier(e.to_string()));
        }
        Ok(())
    }

    /// Set a new password with a reset link. Every session is revoked.
    ///
    /// # Errors
    ///
    /// Returns `Validation` for a short password or an unknown or expired link.
    pub async fn reset_password(&self, secret: &str, new_password: &str) -> Result<()> {
        if new_password.chars().count() < MIN_PASSWORD_LEN {
            return Err(Error::Validation(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let identity = self
            .consume_secret(SecretKind::PasswordReset, secret)
            .await?
            .ok_or_else(|| Error::Validation("reset link is invalid or has expired".into()))?;

        let hash = password::hash(new_password.to_string()).await?;
        self.directory
            .modify(
                identity.id,
                Box::new(move |u: &mut Identity| {
                    u.password_hash = Some(hash);
                    u.refresh_token_hash = None;
                }),
            )
            .await?;

        info!(user = %identity.id, "Password reset");
        Ok(())
    }

    async fn store_secret(&self, id: UserId, kind: SecretKind) -> Result<String> {
        let secret = random_hex(SECRET_BYTES);
        let pending = PendingSecret::new(&secret, self.settings.secret_ttl);
        self.directory
            .modify(
                id,
                Box::new(move |u: &mut Identity| *u.pending_mut(kind) = Some(pending)),
            )
            .await?;
        Ok(secret)
    }

    async fn clear_secret(&self, id: UserId, kind: SecretKind) -> Result<Identity> {
        self.directory
            .modify(id, Box::new(move |u: &mut Identity| *u.pending_mut(kind) = None))
            .await
    }

    /// Find the identity holding `secret` and clear it.
    async fn consume_secret(&self, kind: SecretKind, secret: &str) -> Result<Option<Identity>> {
        let secret = secret.trim();
        if secret.is_empty() {
            return Ok(None);
        }
        let Some(identity) = self.directory.find_by_secret(kind, &sha256_hex(secret)).await? else {
            return Ok(None);
        };
        self.clear_secret(identity.id, kind).await.map(Some)
    }
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

/// `+` followed by 2 to 15 digits, the first non-zero.
fn is_e164(phone: &str) -> bool {
    let Some(digits) = phone.strip_prefix('+') else {
        return false;
    };
    (2..=15).contains(&digits.len())
        && digits.bytes().all(|b| b.is_ascii_digit())
        && !digits.starts_with('0')
}
