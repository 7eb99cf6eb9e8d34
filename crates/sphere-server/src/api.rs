//! JSON HTTP routes over the core services.

use axum::{
    async_trait,
    extract::{FromRequestParts, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sphere_core::{
    AccessClaims, ChatMessage, Error, FollowOutcome, Identity, NewAccount, NotificationView,
    Profile, TokenPair, UserId, UserSummary,
};
use std::sync::Arc;

use crate::error::{ApiError, ApiResult};
use crate::handlers::{bearer_token, AppState};
use crate::metrics;

/// Routes under `/api/v1`.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/auth/register", post(register))
        .route("/api/v1/auth/login", post(login))
        .route("/api/v1/auth/refresh", post(refresh))
        .route("/api/v1/auth/logout", post(logout))
        .route(
            "/api/v1/auth/verify-email",
            get(verify_email).post(verify_email),
        )
        .route("/api/v1/auth/resend-verification", post(resend_verification))
        .route("/api/v1/auth/forgot-password", post(forgot_password))
        .route("/api/v1/auth/reset-password", post(reset_password))
        .route("/api/v1/users/me", get(me))
        .route("/api/v1/users/phone", post(add_phone))
        .route("/api/v1/users/phone/verify", post(verify_phone))
        .route("/api/v1/users/:id/follow", post(toggle_follow))
        .route("/api/v1/chat/conversations", get(conversations))
        .route("/api/v1/chat/:id/history", get(history))
        .route("/api/v1/notifications", get(notifications))
        .route("/api/v1/notifications/read", post(mark_notifications_read))
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    success: bool,
    data: T,
}

fn ok<T: Serialize>(data: T) -> Json<Envelope<T>> {
    Json(Envelope {
        success: true,
        data,
    })
}

/// The identity behind a bearer access token.
///
/// Unlike gateway connections, HTTP requests confirm the identity still exists.
pub struct AuthUser(pub Identity);

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| Error::Unauthenticated("missing bearer token".into()))?;

        let claims = state.tokens.verify_access(token).map_err(|e| {
            metrics::record_auth_failure("http");
            e
        })?;

        let identity = state
            .directory
            .get(claims.id)
            .await?
            .ok_or_else(|| Error::Unauthenticated("identity no longer exists".into()))?;
        Ok(AuthUser(identity))
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Envelope<Profile>>)> {
    let identity = state
        .accounts
        .register(NewAccount {
            username: req.username,
            email: req.email,
            password: req.password,
        })
        .await?;
    Ok((StatusCode::CREATED, ok(identity.profile())))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginResponse {
    user: AccessClaims,
    #[serde(flatten)]
    tokens: TokenPair,
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Envelope<LoginResponse>>> {
    let (user, tokens) = state.accounts.login(&req.email, &req.password).await?;
    Ok(ok(LoginResponse { user, tokens }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    #[serde(default)]
    refresh_token: String,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RefreshRequest>,
) -> ApiResult<Json<Envelope<TokenPair>>> {
    let pair = state.accounts.refresh(&req.refresh_token).await.map_err(|e| {
        metrics::record_auth_failure("refresh");
        e
    })?;
    Ok(ok(pair))
}

async fn logout(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<()>>> {
    state.accounts.logout(user.id).await?;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: String,
}

async fn verify_email(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Json<Envelope<TokenPair>>> {
    Ok(ok(state.accounts.verify_email(&query.token).await?))
}

async fn resend_verification(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<()>>> {
    state.accounts.resend_verification(user.id).await?;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
struct ForgotPasswordRequest {
    email: String,
}

async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgotPasswordRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    state.accounts.forgot_password(&req.email).await?;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
struct ResetPasswordRequest {
    token: String,
    password: String,
}

async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    state
        .accounts
        .reset_password(&req.token, &req.password)
        .await?;
    Ok(ok(()))
}

async fn me(AuthUser(user): AuthUser) -> Json<Envelope<Profile>> {
    ok(user.profile())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PhoneRequest {
    phone_number: String,
}

async fn add_phone(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<PhoneRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    state.accounts.add_phone(user.id, &req.phone_number).await?;
    Ok(ok(()))
}

#[derive(Debug, Deserialize)]
struct OtpRequest {
    otp: String,
}

async fn verify_phone(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(req): Json<OtpRequest>,
) -> ApiResult<Json<Envelope<()>>> {
    state.accounts.verify_phone(user.id, &req.otp).await?;
    Ok(ok(()))
}

#[derive(Debug, Serialize)]
struct FollowResponse {
    status: &'static str,
}

async fn toggle_follow(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(target): Path<UserId>,
) -> ApiResult<Json<Envelope<FollowResponse>>> {
    let (outcome, _) = state.engagement.follow(user.id, target).await?;
    let status = match outcome {
        FollowOutcome::Followed => "followed",
        FollowOutcome::Unfollowed => "unfollowed",
    };
    Ok(ok(FollowResponse { status }))
}

async fn conversations(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<Vec<UserSummary>>>> {
    Ok(ok(state.messages.conversation_partners(user.id).await?))
}

/// Full history with `partner`. Reading it marks their messages as read.
async fn history(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Path(partner): Path<UserId>,
) -> ApiResult<Json<Envelope<Vec<ChatMessage>>>> {
    if state.directory.get(partner).await?.is_none() {
        return Err(Error::NotFound("user").into());
    }
    state
        .messages
        .mark_conversation_read(user.id, partner)
        .await?;
    Ok(ok(state.messages.history(user.id, partner).await?))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct NotificationList {
    notifications: Vec<NotificationView>,
    unread_count: usize,
}

async fn notifications(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<NotificationList>>> {
    let notifications = state.notifications.list(user.id).await?;
    let unread_count = state.notifications.unread_count(user.id).await?;
    Ok(ok(NotificationList {
        notifications,
        unread_count,
    }))
}

#[derive(Debug, Serialize)]
struct MarkedRead {
    updated: usize,
}

async fn mark_notifications_read(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Envelope<MarkedRead>>> {
    let updated = state.notifications.mark_all_read(user.id).await?;
    Ok(ok(MarkedRead { updated }))
}
