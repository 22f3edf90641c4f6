pub mod auth;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod images;
pub mod linkcheck;
pub mod policy;
pub mod ratelimit;
pub mod server;
pub mod short;
pub mod store;
pub mod vault;

use std::sync::Arc;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub vault: vault::Vault,
    pub limiter: ratelimit::ClientLimiter,
    /// Checks plaintext link targets before they are stored.
    pub links: Arc<dyn linkcheck::LinkPolicy>,
    /// Base of returned share links, without a trailing slash.
    pub public_url: String,
    /// Honour forwarding headers when identifying clients.
    pub trust_proxy: bool,
    /// Optional bearer token for the admin routes.
    pub admin_key: Option<String>,
}

pub use error::{Error, Result};
pub use server::{build_router, open_vault, resolve_data_dir, run, ServerConfig};
pub use short::ShortCode;
