use anyhow::anyhow;
use axum::{
    extract::{Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{AppError, AppResult};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid, // user id
    pub exp: i64,
    pub iat: i64,
}

/// Identity of the caller, placed in request extensions by [`auth_middleware`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser {
    pub user_id: Uuid,
}

/// Verifies HS256 bearer tokens issued by the identity service.
#[derive(Clone)]
pub struct TokenVerifier {
    decoding_key: DecodingKey,
    encoding_key: EncodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            validation: Validation::default(),
        }
    }

    pub fn verify(&self, token: &str) -> AppResult<Uuid> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.sub)
            .map_err(|e| AppError::Unauthorized(anyhow!("invalid bearer token: {}", e)))
    }

    pub fn issue(&self, user_id: Uuid, ttl: Duration) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| AppError::InternalServerError(anyhow!("Failed to encode token: {}", e)))
    }
}

/// Bearer credential from the `Authorization` header, or from the `token`
/// query parameter for clients that cannot set headers on a socket handshake.
fn bearer_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string());

    from_header.or_else(|| {
        parts.uri.query().and_then(|query| {
            url::form_urlencoded::parse(query.as_bytes())
                .find(|(key, _)| key == "token")
                .map(|(_, value)| value.into_owned())
        })
    })
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> AppResult<Response> {
    let (mut parts, body) = req.into_parts();

    let token = bearer_token(&parts)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::Unauthorized(anyhow!("missing bearer token")))?;
    let user_id = state.tokens.verify(&token)?;

    parts.extensions.insert(AuthUser { user_id });
    Ok(next.run(Request::from_parts(parts, body)).await)
}
