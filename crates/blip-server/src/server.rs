use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{delete, get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    auth::require_admin,
    handlers::{
        create_image, create_link, create_paste, create_secret, delete_record, get_image,
        get_link, get_paste, get_secret, head_peek, health, peek, redirect_link, stats,
    },
    images::ImageDir,
    linkcheck::PublicOnly,
    policy::DisclosurePolicy,
    ratelimit::{self, limit_by_client, ClientLimiter},
    store::Store,
    vault::{self, Vault},
    AppState,
};

/// How often idle rate limit buckets are dropped.
const LIMITER_EVICTION_INTERVAL: Duration = Duration::from_secs(60);

/// Multipart framing on top of the image itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Base of the share links handed back on creation ($BLIP_PUBLIC_URL).
    pub public_url: String,
    /// Trust `X-Forwarded-For` / `X-Real-IP` for rate limiting ($BLIP_BEHIND_PROXY).
    pub behind_proxy: bool,
    pub ttl: Duration,
    pub sweep_interval: Duration,
    /// Bearer token for the admin routes; they are not mounted without one.
    pub admin_key: Option<String>,
    pub cors_origins: Option<String>,
    pub rate_per_sec: u32,
    pub rate_burst: u32,
    pub encrypted_paste_burns: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("BLIP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("BLIP_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            data_dir: std::env::var("BLIP_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("BLIP_PUBLIC_URL")
                .unwrap_or_else(|_| "http://localhost:8080".into()),
            behind_proxy: env_flag("BLIP_BEHIND_PROXY"),
            ttl: env_duration("BLIP_TTL").unwrap_or(vault::DEFAULT_TTL),
            sweep_interval: env_duration("BLIP_SWEEP_INTERVAL")
                .and_then(|d| non_zero("BLIP_SWEEP_INTERVAL", d))
                .unwrap_or(vault::DEFAULT_SWEEP_INTERVAL),
            admin_key: std::env::var("BLIP_ADMIN_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            cors_origins: std::env::var("BLIP_CORS_ORIGINS").ok(),
            rate_per_sec: std::env::var("BLIP_RATE_PER_SEC")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(ratelimit::DEFAULT_PER_SEC),
            rate_burst: std::env::var("BLIP_RATE_BURST")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(ratelimit::DEFAULT_BURST),
            encrypted_paste_burns: env_flag("BLIP_ENCRYPTED_PASTE_BURNS"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

fn env_duration(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match humantime::parse_duration(&raw) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(var = name, value = %raw, error = %e, "ignoring unparseable duration");
            None
        }
    }
}

fn non_zero(name: &str, d: Duration) -> Option<Duration> {
    if d.is_zero() {
        warn!(var = name, "ignoring zero duration");
        return None;
    }
    Some(d)
}

/// Use `data_dir` if given, else the platform data directory
/// (`~/.local/share/blip/`, etc.). The directory is created if missing.
pub fn resolve_data_dir(data_dir: Option<&Path>) -> Result<PathBuf> {
    let dir = match data_dir {
        Some(d) => d.to_owned(),
        None => ProjectDirs::from("", "", "blip")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("create data dir: {}", dir.display()))?;
    Ok(dir)
}

/// Open the store and image directory under `data_dir`.
pub fn open_vault(data_dir: &Path, cfg: &ServerConfig) -> Result<Vault> {
    let store = Store::open(&data_dir.join("blip.db")).context("open store")?;
    let images = ImageDir::open(data_dir.join("uploads")).context("open uploads dir")?;
    let policy = DisclosurePolicy {
        encrypted_paste_burns: cfg.encrypted_paste_burns,
    };
    Ok(Vault::new(store, images, policy, cfg.ttl))
}

/// All routes, wired to `state`. Admin routes exist only when an admin key
/// is configured.
pub fn build_router(state: AppState) -> Router {
    let create = Router::new()
        .route("/api/links", post(create_link))
        .route("/api/pastes", post(create_paste))
        .route("/api/secrets", post(create_secret))
        .route(
            "/api/images",
            post(create_image)
                .layer(DefaultBodyLimit::max(vault::MAX_IMAGE_BYTES + MULTIPART_OVERHEAD)),
        );

    // Every route that discloses content is billed to the client.
    let retrieve = Router::new()
        .route("/{short}", get(redirect_link))
        .route("/api/links/{short}", get(get_link))
        .route("/p/{short}", get(get_paste))
        .route("/s/{short}", get(get_secret))
        .route("/i/{short}", get(get_image))
        .route("/api/peek/{short}", get(peek).head(head_peek))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            limit_by_client,
        ));

    let mut app = Router::new()
        .route("/health", get(health))
        .merge(create)
        .merge(retrieve);

    if state.admin_key.is_some() {
        let admin = Router::new()
            .route("/api/records/{short}", delete(delete_record))
            .route("/api/stats", get(stats))
            .layer(middleware::from_fn_with_state(state.clone(), require_admin));
        app = app.merge(admin);
    }

    app.with_state(state)
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_deref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let vault = open_vault(&data_dir, &cfg)?;

    // Reclaim anything left over from a previous run before serving.
    match vault.prune() {
        Ok(n) if n > 0 => info!(removed = n, "pruned expired records at startup"),
        Ok(_) => {}
        Err(e) => warn!(error = %e, "startup prune failed"),
    }

    vault.clone().spawn_sweep(cfg.sweep_interval);

    let limiter = ClientLimiter::new(cfg.rate_per_sec, cfg.rate_burst);
    limiter.clone().spawn_eviction(LIMITER_EVICTION_INTERVAL);

    if cfg.admin_key.is_none() {
        info!("BLIP_ADMIN_KEY not set; admin routes disabled");
    }
    if cfg.behind_proxy {
        info!("trusting X-Forwarded-For / X-Real-IP for client addresses");
    }

    let state = AppState {
        vault,
        limiter,
        links: Arc::new(PublicOnly),
        public_url: cfg.public_url.trim_end_matches('/').to_owned(),
        trust_proxy: cfg.behind_proxy,
        admin_key: cfg.admin_key,
    };

    let cors = build_cors(cfg.cors_origins.as_deref());
    let app = build_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, ttl = %humantime::format_duration(cfg.ttl), "blip server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::HEAD,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
