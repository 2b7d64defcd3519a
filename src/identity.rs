use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Query},
    http::{header::AUTHORIZATION, request::Parts},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::warn;

use crate::{
    db::UserId,
    error::{ChatError, ChatResult},
    AppError,
};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    exp: i64,
}

struct Keys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Turns a bearer token into a user id. Tokens are HS256 JWTs carrying the id
/// in `sub`.
#[derive(Clone)]
pub struct Identity {
    keys: Arc<Keys>,
    ttl: Duration,
}

impl Identity {
    pub fn new(secret: &[u8], ttl: Duration) -> Self {
        Self {
            keys: Arc::new(Keys {
                encoding: EncodingKey::from_secret(secret),
                decoding: DecodingKey::from_secret(secret),
            }),
            ttl,
        }
    }

    pub fn from_secret(secret: Option<&str>, ttl: Duration) -> Self {
        match secret {
            Some(secret) => Self::new(secret.as_bytes(), ttl),
            None => {
                warn!("JWT_SECRET not set, using a random key; tokens will not survive a restart");
                let secret: [u8; 32] = rand::rng().random();
                Self::new(&secret, ttl)
            }
        }
    }

    pub fn resolve(&self, credential: &str) -> ChatResult<UserId> {
        let token = credential.strip_prefix("Bearer ").unwrap_or(credential).trim();
        if token.is_empty() {
            return Err(ChatError::Unauthenticated);
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        let data = decode::<Claims>(token, &self.keys.decoding, &validation)
            .map_err(|_| ChatError::Unauthenticated)?;
        data.claims
            .sub
            .parse()
            .map_err(|_| ChatError::Unauthenticated)
    }

    pub fn issue(&self, user_id: UserId) -> anyhow::Result<String> {
        let claims = Claims {
            sub: user_id.to_string(),
            exp: (OffsetDateTime::now_utc() + self.ttl).unix_timestamp(),
        };
        Ok(encode(&Header::new(Algorithm::HS256), &claims, &self.keys.encoding)?)
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    access_token: Option<String>,
}

/// Header first, then `?access_token=` since browsers cannot set headers on
/// a websocket upgrade.
pub fn credential(parts: &Parts) -> Option<String> {
    if let Some(header) = parts.headers.get(AUTHORIZATION) {
        return header.to_str().ok().map(str::to_owned);
    }
    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(query)| query.access_token)
}

/// The caller of an HTTP or websocket route, resolved from its bearer token.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub id: UserId,
    pub credential: String,
}

impl<S> FromRequestParts<S> for CurrentUser
where
    Identity: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let identity = Identity::from_ref(state);
        let credential = credential(parts).ok_or(ChatError::Unauthenticated)?;
        let id = identity.resolve(&credential)?;
        Ok(CurrentUser { id, credential })
    }
}
