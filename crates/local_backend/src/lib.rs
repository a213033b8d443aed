//! The HTTP surface of the backend: an axum router over the file-storage
//! core, a bearer-token auth seam, and process configuration.

use std::sync::Arc;

use common::runtime::ProdRuntime;
use file_storage::FileStorage;

pub mod auth;
pub mod config;
pub mod http;

pub use auth::{
    Authenticator,
    StaticTokenAuthenticator,
};

#[derive(Clone)]
pub struct LocalAppState {
    pub file_storage: FileStorage<ProdRuntime>,
    pub authenticator: Arc<dyn Authenticator>,
}
