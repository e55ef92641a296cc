use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::errors::{AppError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub group: String,
    pub exp: usize,
}

/// Signs and verifies bearer tokens and answers admin checks.
#[derive(Clone)]
pub struct AuthApi {
    secret: String,
    admin_groups: Vec<String>,
}

impl AuthApi {
    pub fn new(secret: impl Into<String>, admin_groups: Vec<String>) -> Self {
        Self {
            secret: secret.into(),
            admin_groups,
        }
    }

    pub fn authenticate(&self, token: &str) -> Result<Claims> {
        let token_data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_ref()),
            &Validation::new(Algorithm::HS256),
        )?;
        Ok(token_data.claims)
    }

    pub fn gen_token(&self, sub: &str, group: &str, ttl: chrono::Duration) -> Result<String> {
        let claims = Claims {
            sub: sub.to_string(),
            group: group.to_string(),
            exp: (Utc::now() + ttl).timestamp() as usize,
        };

        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_ref()),
        )?;
        Ok(token)
    }

    /// Long-lived admin token used by background workers acting on their own behalf.
    pub fn system_token(&self) -> Result<String> {
        let group = self
            .admin_groups
            .first()
            .ok_or_else(|| AppError::configuration("no admin group configured"))?;
        self.gen_token("system", group, chrono::Duration::days(10 * 365))
    }

    pub fn is_admin(&self, claims: &Claims) -> bool {
        self.admin_groups.iter().any(|g| g == &claims.group)
    }

    pub fn require_admin(&self, claims: &Claims) -> Result<()> {
        if self.is_admin(claims) {
            Ok(())
        } else {
            Err(AppError::Unauthorized)
        }
    }
}

pub async fn auth_middleware(
    State(auth): State<Arc<AuthApi>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Result<Response> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .ok_or(AppError::AuthError)?;

    let claims = auth.authenticate(token)?;

    // Insert claims into request extensions
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}
