use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use axum::async_trait;
use axum::extract::FromRequestParts;
use http::request::Parts;
use lru_time_cache::LruCache;
use tracing::debug;

use crate::config;
use crate::error::AppError;
use crate::route::AppState;

pub const ACCESS_TOKEN_HEADER: &str = "x-webitel-access";

const SESSION_CACHE_CAPACITY: usize = 1024;
const MIN_SESSION_TTL: Duration = Duration::from_secs(1);

/// Identity a validated access token resolves to.
#[derive(Debug, Clone)]
pub struct AuthSession {
    pub domain_id: i64,
    pub user_id: i64,
}

/// Token validation with a TTL'd cache in front, so hot sessions skip the
/// lookup on every call.
pub struct AuthManager {
    tokens: HashMap<String, AuthSession>,
    cache: Mutex<LruCache<String, AuthSession>>,
}

impl AuthManager {
    pub fn new(cfg: &config::Auth) -> Self {
        let ttl = Duration::from_millis(cfg.session_ttl).max(MIN_SESSION_TTL);
        let tokens = cfg
            .tokens
            .iter()
            .map(|t| {
                (
                    t.token.clone(),
                    AuthSession {
                        domain_id: t.domain_id,
                        user_id: t.user_id,
                    },
                )
            })
            .collect();
        Self {
            tokens,
            cache: Mutex::new(LruCache::with_expiry_duration_and_capacity(
                ttl,
                SESSION_CACHE_CAPACITY,
            )),
        }
    }

    pub fn session(&self, token: &str) -> Option<AuthSession> {
        {
            let mut cache = self.cache.lock().unwrap();
            if let Some(session) = cache.get(token) {
                debug!("auth session cache hit");
                return Some(session.clone());
            }
        }
        let session = self.tokens.get(token).cloned()?;
        self.cache
            .lock()
            .unwrap()
            .insert(token.to_string(), session.clone());
        Some(session)
    }
}

/// Extractor gating every recorder operation on `x-webitel-access`.
pub struct Auth(pub AuthSession);

#[async_trait]
impl FromRequestParts<AppState> for Auth {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(ACCESS_TOKEN_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| AppError::unauthenticated("missing access token"))?;
        state
            .auth
            .session(token)
            .map(Auth)
            .ok_or_else(|| AppError::unauthenticated("invalid access token"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AccessToken;

    fn manager() -> AuthManager {
        AuthManager::new(&config::Auth {
            tokens: vec![AccessToken {
                token: "secret".into(),
                domain_id: 1,
                user_id: 7,
            }],
            session_ttl: 60_000,
        })
    }

    #[test]
    fn known_token_resolves() {
        let auth = manager();
        let session = auth.session("secret").unwrap();
        assert_eq!(session.domain_id, 1);
        assert_eq!(session.user_id, 7);
        // Second hit is served from the cache.
        assert!(auth.session("secret").is_some());
    }

    #[test]
    fn unknown_token_is_rejected() {
        let auth = manager();
        assert!(auth.session("nope").is_none());
        assert!(auth.session("").is_none());
    }

    #[test]
    fn ttl_is_floored_at_one_second() {
        // A zero TTL would make every cache insert dead on arrival.
        let auth = AuthManager::new(&config::Auth {
            tokens: vec![AccessToken {
                token: "secret".into(),
                domain_id: 1,
                user_id: 7,
            }],
            session_ttl: 0,
        });
        assert!(auth.session("secret").is_some());
        assert!(auth.session("secret").is_some());
    }
}
