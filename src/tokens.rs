//! Single-use stream tokens.
//!
//! Browsers cannot attach headers to an `EventSource`, so stream
//! connections authenticate with a short-lived opaque token passed in the
//! URL. A token is valid for exactly one successful [`TokenIssuer::validate`]
//! call, after which it is permanently spent; expiry (5 minutes by
//! default) bounds the exposure of a leaked URL.
//!
//! The issuer owns all token storage, indexed both by secret (lookup) and
//! by user (per-user cap). A background sweep removes expired and used
//! tokens every minute so abandoned tokens cannot accumulate.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::TokenError;
use crate::models::{now_ms, StreamToken, TokenClaims};

/// Secret length in hex characters (32 random bytes).
pub const TOKEN_HEX_LEN: usize = 64;

/// Scope granted when the caller does not ask for specific scopes.
pub const DEFAULT_SCOPE: &str = "stream:read";

#[derive(Debug, Default)]
struct TokenStore {
    /// Secret -> token record.
    by_secret: HashMap<String, StreamToken>,
    /// User id -> secrets held by that user.
    by_user: HashMap<String, HashSet<String>>,
}

impl TokenStore {
    fn insert(&mut self, token: StreamToken) {
        self.by_user
            .entry(token.user_id.clone())
            .or_default()
            .insert(token.token.clone());
        self.by_secret.insert(token.token.clone(), token);
    }

    fn remove(&mut self, secret: &str) -> Option<StreamToken> {
        let token = self.by_secret.remove(secret)?;
        if let Some(secrets) = self.by_user.get_mut(&token.user_id) {
            secrets.remove(secret);
            if secrets.is_empty() {
                self.by_user.remove(&token.user_id);
            }
        }
        Some(token)
    }

    /// Remove this user's expired and used tokens. Returns how many went.
    fn sweep_user(&mut self, user_id: &str, now: i64) -> usize {
        let Some(secrets) = self.by_user.get(user_id) else {
            return 0;
        };
        let dead: Vec<String> = secrets
            .iter()
            .filter(|secret| {
                self.by_secret
                    .get(*secret)
                    .map_or(true, |t| t.used || now > t.expires_at)
            })
            .cloned()
            .collect();
        for secret in &dead {
            self.remove(secret);
        }
        dead.len()
    }

    fn live_count(&self, user_id: &str, now: i64) -> usize {
        self.by_user
            .get(user_id)
            .map(|secrets| {
                secrets
                    .iter()
                    .filter_map(|secret| self.by_secret.get(secret))
                    .filter(|t| !t.used && now <= t.expires_at)
                    .count()
            })
            .unwrap_or(0)
    }
}

/// Issues, validates (single-use), peeks, and revokes stream tokens.
#[derive(Debug)]
pub struct TokenIssuer {
    store: Mutex<TokenStore>,
    default_ttl: Duration,
    max_per_user: usize,
}

impl TokenIssuer {
    pub fn new(default_ttl: Duration, max_per_user: usize) -> Self {
        Self {
            store: Mutex::new(TokenStore::default()),
            default_ttl,
            max_per_user,
        }
    }

    fn lock(&self) -> MutexGuard<'_, TokenStore> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a token for one stream connection. When the user is at the
    /// per-user cap, their expired/used tokens are swept first; only if
    /// they still hold the maximum does issuance fail.
    pub fn generate(
        &self,
        user_id: &str,
        stream_id: &str,
        scopes: Option<BTreeSet<String>>,
        expiry: Option<Duration>,
    ) -> Result<StreamToken, TokenError> {
        let now = now_ms();
        let mut store = self.lock();

        if store.live_count(user_id, now) >= self.max_per_user {
            store.sweep_user(user_id, now);
            let held = store.live_count(user_id, now);
            if held >= self.max_per_user {
                tracing::warn!(user_id = %user_id, held, "token issuance refused: per-user cap");
                return Err(TokenError::MaxTokensExceeded {
                    user_id: user_id.to_string(),
                    held,
                    max: self.max_per_user,
                });
            }
        }

        let ttl = expiry.unwrap_or(self.default_ttl);
        let token = StreamToken {
            id: uuid::Uuid::new_v4().to_string(),
            token: random_secret(),
            user_id: user_id.to_string(),
            stream_id: stream_id.to_string(),
            scopes: scopes.unwrap_or_else(|| BTreeSet::from([DEFAULT_SCOPE.to_string()])),
            created_at: now,
            expires_at: now + ttl.as_millis() as i64,
            used: false,
            used_at: None,
        };
        tracing::debug!(token_id = %token.id, user_id = %user_id, stream_id = %stream_id, "token issued");
        store.insert(token.clone());
        Ok(token)
    }

    /// Validate and CONSUME a token: on success it is marked used and can
    /// never validate again. Do not call speculatively — use [`peek`](Self::peek)
    /// to check without spending.
    pub fn validate(&self, secret: &str) -> Result<TokenClaims, TokenError> {
        if !is_well_formed(secret) {
            return Err(TokenError::InvalidFormat);
        }
        let now = now_ms();
        let mut store = self.lock();

        let token = store.by_secret.get(secret).ok_or(TokenError::NotFound)?;
        if token.used {
            return Err(TokenError::AlreadyUsed);
        }
        if now > token.expires_at {
            let expired = store.remove(secret);
            if let Some(t) = expired {
                tracing::debug!(token_id = %t.id, "expired token removed on validation");
            }
            return Err(TokenError::Expired);
        }

        let token = store
            .by_secret
            .get_mut(secret)
            .ok_or(TokenError::NotFound)?;
        token.used = true;
        token.used_at = Some(now);
        tracing::debug!(token_id = %token.id, user_id = %token.user_id, "token consumed");
        Ok(TokenClaims {
            user_id: token.user_id.clone(),
            stream_id: token.stream_id.clone(),
            scopes: token.scopes.clone(),
        })
    }

    /// Same checks as [`validate`](Self::validate) but never mutates:
    /// an expired token reports `Expired` yet stays until the next sweep,
    /// and a valid token is not consumed.
    pub fn peek(&self, secret: &str) -> Result<TokenClaims, TokenError> {
        if !is_well_formed(secret) {
            return Err(TokenError::InvalidFormat);
        }
        let now = now_ms();
        let store = self.lock();
        let token = store.by_secret.get(secret).ok_or(TokenError::NotFound)?;
        if token.used {
            return Err(TokenError::AlreadyUsed);
        }
        if now > token.expires_at {
            return Err(TokenError::Expired);
        }
        Ok(TokenClaims {
            user_id: token.user_id.clone(),
            stream_id: token.stream_id.clone(),
            scopes: token.scopes.clone(),
        })
    }

    /// Remove a token outright, regardless of expiry or use.
    pub fn revoke(&self, secret: &str) -> bool {
        self.lock().remove(secret).is_some()
    }

    /// Remove every token the user holds. Returns how many were removed.
    pub fn revoke_all_for_user(&self, user_id: &str) -> usize {
        let mut store = self.lock();
        let secrets: Vec<String> = store
            .by_user
            .get(user_id)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        for secret in &secrets {
            store.remove(secret);
        }
        if !secrets.is_empty() {
            tracing::info!(user_id = %user_id, count = secrets.len(), "revoked all tokens for user");
        }
        secrets.len()
    }

    /// Remove every expired or used token. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = now_ms();
        let mut store = self.lock();
        let dead: Vec<String> = store
            .by_secret
            .values()
            .filter(|t| t.used || now > t.expires_at)
            .map(|t| t.token.clone())
            .collect();
        for secret in &dead {
            store.remove(secret);
        }
        dead.len()
    }

    /// Total stored tokens (live, used, and not-yet-swept expired).
    pub fn len(&self) -> usize {
        self.lock().by_secret.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) on a fixed interval until the issuer is
    /// dropped. Runs on the runtime's timer, never on a request path.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let issuer = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await; // first tick fires immediately
            loop {
                interval.tick().await;
                let Some(issuer) = issuer.upgrade() else {
                    break;
                };
                let removed = issuer.sweep();
                if removed > 0 {
                    tracing::debug!(removed, "token sweep");
                }
            }
        })
    }
}

fn random_secret() -> String {
    let mut bytes = [0u8; TOKEN_HEX_LEN / 2];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn is_well_formed(secret: &str) -> bool {
    secret.len() == TOKEN_HEX_LEN && secret.chars().all(|c| c.is_ascii_hexdigit())
}
