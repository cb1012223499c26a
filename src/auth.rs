use std::collections::HashMap;

use axum::{
    extract::{Query, Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use sha2::{Digest, Sha256};

use crate::server::ApiErr;

pub const API_KEY_HEADER: &str = "x-api-key";
pub const API_KEY_QUERY: &str = "api-key";

/// The configured shared secret, kept only as a digest.
#[derive(Clone, Default)]
pub struct ApiKey {
    digest: Option<[u8; 32]>,
}

impl ApiKey {
    pub fn new(secret: Option<&str>) -> Self {
        Self { digest: secret.map(digest) }
    }

    pub fn required(&self) -> bool {
        self.digest.is_some()
    }

    pub fn verify(&self, presented: Option<&str>) -> bool {
        match (&self.digest, presented) {
            (None, _) => true,
            (Some(expected), Some(presented)) => keys_match(expected, &digest(presented)),
            (Some(_), None) => false,
        }
    }
}

fn digest(secret: &str) -> [u8; 32] {
    Sha256::digest(secret.as_bytes()).into()
}

/// Compares every byte regardless of where the first mismatch is.
fn keys_match(a: &[u8; 32], b: &[u8; 32]) -> bool {
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// `x-api-key`, then `Authorization: Bearer`, then `?api-key=`.
pub fn presented_key(headers: &HeaderMap, query: &HashMap<String, String>) -> Option<String> {
    if let Some(key) = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok()) {
        return Some(key.trim().to_string());
    }
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if let Some(token) = bearer {
        return Some(token.trim().to_string());
    }
    query.get(API_KEY_QUERY).cloned()
}

pub async fn require_api_key(State(key): State<ApiKey>, req: Request, next: Next) -> Response {
    if !key.required() {
        return next.run(req).await;
    }
    let query = Query::<HashMap<String, String>>::try_from_uri(req.uri())
        .map(|Query(q)| q)
        .unwrap_or_default();
    let presented = presented_key(req.headers(), &query);
    if key.verify(presented.as_deref()) {
        return next.run(req).await;
    }
    tracing::warn!(path = %req.uri().path(), presented = presented.is_some(), "rejected request without valid api key");
    ApiErr::unauthorized().into_response()
}
