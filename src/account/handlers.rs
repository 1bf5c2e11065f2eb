use axum::{
    extract::{FromRef, State},
    routing::{get, post},
    Form, Json, Router,
};
use tracing::{info, instrument, warn};

use crate::{
    account::{
        dto::{RegisterRequest, TokenRequest, TokenResponse, UserResponse},
        jwt::{AuthUser, JwtKeys},
        password::{hash_password, verify_password},
        repo::{self, NewUser},
    },
    error::ApiError,
    state::AppState,
};

pub fn account_routes() -> Router<AppState> {
    Router::new()
        .route("/register", post(register))
        .route("/token", post(issue_token))
        .route("/users/me", get(me))
}

#[instrument(skip(state, payload))]
pub async fn register(
    State(state): State<AppState>,
    Json(payload): Json<RegisterRequest>,
) -> Result<Json<UserResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;

    // Pre-checks give deterministic ordering; the unique constraints in
    // repo::create remain the arbiter under concurrent registration.
    if repo::find_by_username(&mut conn, &payload.username)
        .await?
        .is_some()
    {
        warn!(username = %payload.username, "username already registered");
        return Err(ApiError::DuplicateUsername);
    }
    if repo::find_by_email(&mut conn, &payload.email).await?.is_some() {
        warn!(email = %payload.email, "email already registered");
        return Err(ApiError::DuplicateEmail);
    }

    let hash = hash_password(&payload.password)?;

    let user = repo::create(
        &mut conn,
        NewUser {
            username: &payload.username,
            password_hash: &hash,
            email: &payload.email,
            first_name: payload.first_name.as_deref(),
            last_name: payload.last_name.as_deref(),
        },
    )
    .await?;

    info!(user_id = user.user_id, username = %user.username, "user registered");
    Ok(Json(user.into()))
}

#[instrument(skip(state, form))]
pub async fn issue_token(
    State(state): State<AppState>,
    Form(form): Form<TokenRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;

    // Unknown user and wrong password are indistinguishable to the caller.
    let user = repo::find_by_username(&mut conn, &form.username)
        .await?
        .ok_or_else(|| {
            warn!(username = %form.username, "login with unknown username");
            ApiError::InvalidCredentials
        })?;

    if !verify_password(&form.password, &user.password_hash)? {
        warn!(username = %user.username, "login with invalid password");
        return Err(ApiError::InvalidCredentials);
    }

    let keys = JwtKeys::from_ref(&state);
    let access_token = keys.sign_access(&user.username)?;

    repo::touch_last_login(&mut conn, user.user_id).await?;

    info!(user_id = user.user_id, username = %user.username, "user logged in");
    Ok(Json(TokenResponse {
        access_token,
        token_type: "bearer".into(),
    }))
}

#[instrument(skip(state))]
pub async fn me(
    State(state): State<AppState>,
    AuthUser(username): AuthUser,
) -> Result<Json<UserResponse>, ApiError> {
    let mut conn = state.db.acquire().await?;

    let user = repo::find_by_username(&mut conn, &username)
        .await?
        .ok_or_else(|| {
            warn!(username = %username, "token subject no longer exists");
            ApiError::InvalidToken
        })?;

    Ok(Json(user.into()))
}

#[cfg(test)]
mod me_route_tests {
    use crate::account::jwt::{Claims, JwtKeys};
    use crate::app::build_app;
    use crate::state::AppState;
    use axum::body::Body;
    use axum::extract::FromRef;
    use axum::http::{header, Request, StatusCode};
    use jsonwebtoken::{encode, Header};
    use time::OffsetDateTime;
    use tower::ServiceExt;

    async fn detail_of(response: axum::response::Response) -> (StatusCode, String) {
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json body");
        (status, body["detail"].as_str().unwrap_or_default().into())
    }

    fn me_request(auth_header: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder().uri("/users/me");
        if let Some(value) = auth_header {
            builder = builder.header(header::AUTHORIZATION, value);
        }
        builder.body(Body::empty()).expect("request")
    }

    // These requests are all rejected by the extractor, so the fake state's
    // lazily-connecting pool is never touched.

    #[tokio::test]
    async fn missing_header_is_not_authenticated() {
        let app = build_app(AppState::fake());
        let response = app.oneshot(me_request(None)).await.unwrap();
        let (status, detail) = detail_of(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail, "Not authenticated");
    }

    #[tokio::test]
    async fn wrong_scheme_is_not_authenticated() {
        let app = build_app(AppState::fake());
        let response = app
            .oneshot(me_request(Some("Basic YWxpY2U6cDE=")))
            .await
            .unwrap();
        let (status, detail) = detail_of(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail, "Not authenticated");
    }

    #[tokio::test]
    async fn garbage_token_cannot_be_validated() {
        let app = build_app(AppState::fake());
        let response = app
            .oneshot(me_request(Some("Bearer definitely-not-a-jwt")))
            .await
            .unwrap();
        let (status, detail) = detail_of(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail, "Could not validate credentials");
    }

    #[tokio::test]
    async fn expired_token_cannot_be_validated() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: "alice".into(),
            iat: (now - 7200) as usize,
            exp: (now - 3600) as usize,
        };
        let token = encode(&Header::default(), &claims, &keys.encoding).expect("encode");

        let app = build_app(state);
        let response = app
            .oneshot(me_request(Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        let (status, detail) = detail_of(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail, "Could not validate credentials");
    }

    #[tokio::test]
    async fn empty_subject_cannot_be_validated() {
        let state = AppState::fake();
        let keys = JwtKeys::from_ref(&state);
        let token = keys.sign_access("").expect("sign access");

        let app = build_app(state);
        let response = app
            .oneshot(me_request(Some(&format!("Bearer {token}"))))
            .await
            .unwrap();
        let (status, detail) = detail_of(response).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(detail, "Could not validate credentials");
    }

    #[tokio::test]
    async fn unauthorized_responses_advertise_bearer() {
        let app = build_app(AppState::fake());
        let response = app.oneshot(me_request(None)).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get(header::WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok()),
            Some("Bearer")
        );
    }
}
