use std::collections::HashMap;

use async_trait::async_trait;
use common::types::UserId;
use errors::ErrorMetadata;
use http::HeaderMap;

/// The session-auth seam. The core only needs a bearer token resolved to an
/// owner id; how sessions are issued (password login, OAuth, LDAP) lives
/// outside this repository.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, bearer_token: &str) -> anyhow::Result<UserId>;
}

fn invalid_session() -> ErrorMetadata {
    ErrorMetadata::unauthenticated("InvalidBearerToken", "the session token is not valid")
}

/// Fixed token-to-user mapping from process configuration. Enough for a
/// single-box self-hosted deployment and for tests; a real identity
/// provider plugs in through the [`Authenticator`] trait.
pub struct StaticTokenAuthenticator {
    tokens: HashMap<String, UserId>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = (String, UserId)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
    async fn authenticate(&self, bearer_token: &str) -> anyhow::Result<UserId> {
        match self.tokens.get(bearer_token) {
            Some(owner_id) => Ok(*owner_id),
            None => Err(invalid_session().into()),
        }
    }
}

/// Pulls the bearer token out of the `Authorization` header.
pub fn bearer_token(headers: &HeaderMap) -> anyhow::Result<&str> {
    let header = headers
        .get(http::header::AUTHORIZATION)
        .ok_or_else(|| {
            ErrorMetadata::unauthenticated("MissingAuthHeader", "no Authorization header")
        })?
        .to_str()
        .map_err(|_| invalid_session())?;
    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| invalid_session().into())
}
