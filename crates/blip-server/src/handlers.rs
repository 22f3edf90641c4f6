use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::{
    crypto,
    error::{Error, Result},
    images,
    short::ShortCode,
    store::{Content, Record},
    AppState,
};

// ── Errors ───────────────────────────────────────────────────────────────────

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::InvalidIdentifier => StatusCode::UNPROCESSABLE_ENTITY,
            Error::InvalidInput(_) | Error::Encryption(_) => StatusCode::BAD_REQUEST,
            Error::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Error::Storage(_) | Error::Entropy => return internal_error(self),
        };
        let message = match &self {
            Error::NotFound => "not found or expired".to_owned(),
            Error::InvalidInput(msg) => msg.clone(),
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn internal_error(e: Error) -> Response {
    error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal server error"})),
    )
        .into_response()
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedResponse {
    pub short: String,
    /// Share link without a key; clients append `#<key>` for sealed content.
    pub url: String,
    pub expires_at: i64,
}

fn created(state: &AppState, path_prefix: &str, record: &Record) -> Response {
    let path = format!("{path_prefix}{}", record.short);
    let body = CreatedResponse {
        short: record.short.to_string(),
        url: crypto::share_link(&state.public_url, &path, None),
        expires_at: record.expires_at,
    };
    info!(
        short = %record.short,
        kind = %record.kind(),
        encrypted = record.encrypted,
        onetime = record.one_time,
        "created"
    );
    (StatusCode::CREATED, Json(body)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CreateLinkRequest {
    pub url: String,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub onetime: bool,
}

pub async fn create_link(
    State(state): State<AppState>,
    Json(body): Json<CreateLinkRequest>,
) -> Result<Response> {
    // A sealed target is opaque; only plaintext targets can be checked.
    if !body.encrypted {
        state.links.check(&body.url).await?;
    }
    let record = state
        .vault
        .create_link(&body.url, body.encrypted, body.onetime)?;
    Ok(created(&state, "/", &record))
}

#[derive(Debug, Deserialize)]
pub struct CreatePasteRequest {
    pub content: String,
    pub language: Option<String>,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub onetime: bool,
}

pub async fn create_paste(
    State(state): State<AppState>,
    Json(body): Json<CreatePasteRequest>,
) -> Result<Response> {
    let record = state.vault.create_paste(
        &body.content,
        body.language.as_deref(),
        body.encrypted,
        body.onetime,
    )?;
    Ok(created(&state, "/p/", &record))
}

#[derive(Debug, Deserialize)]
pub struct CreateSecretRequest {
    pub data: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateSecretRequest>,
) -> Result<Response> {
    let record = state.vault.create_secret(&body.data)?;
    Ok(created(&state, "/s/", &record))
}

pub async fn create_image(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response> {
    let mut file: Option<(Vec<u8>, Option<String>)> = None;
    let mut encrypted = false;
    let mut onetime = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::InvalidInput(format!("failed to parse multipart form: {e}")))?
    {
        let name = field.name().unwrap_or_default().to_owned();
        match name.as_str() {
            "file" => {
                let declared = field.content_type().map(str::to_owned);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("failed to read file: {e}")))?;
                file = Some((bytes.to_vec(), declared));
            }
            "encrypted" | "onetime" => {
                let value = field
                    .text()
                    .await
                    .map_err(|e| Error::InvalidInput(format!("invalid form field: {e}")))?;
                let flag = value.trim() == "true";
                if name == "encrypted" {
                    encrypted = flag;
                } else {
                    onetime = flag;
                }
            }
            _ => {}
        }
    }

    let (bytes, declared) = file.ok_or_else(|| Error::InvalidInput("no file provided".into()))?;
    let content_type = images::detect_content_type(&bytes, declared.as_deref());
    let record = state
        .vault
        .create_image(&bytes, &content_type, encrypted, onetime)?;
    Ok(created(&state, "/i/", &record))
}

// ── Retrieve ──────────────────────────────────────────────────────────────────

fn link_of(record: &Record) -> Result<&str> {
    match &record.content {
        Content::Link { url } => Ok(url),
        _ => Err(Error::NotFound),
    }
}

/// Follow a short link. Sealed targets are handed back for the client to
/// open, since only it holds the key.
pub async fn redirect_link(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let opened = state.vault.open_link(&short)?;
    let url = link_of(&opened.record)?;
    if opened.record.encrypted {
        return Ok(Json(json!({ "url": url, "encrypted": true })).into_response());
    }
    Ok(Redirect::temporary(url).into_response())
}

pub async fn get_link(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let opened = state.vault.open_link(&short)?;
    let url = link_of(&opened.record)?;
    Ok(Json(json!({
        "url": url,
        "encrypted": opened.record.encrypted,
        "expires_at": opened.record.expires_at,
    }))
    .into_response())
}

pub async fn get_paste(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let opened = state.vault.open_paste(&short)?;
    let (content, language) = match opened.record.content {
        Content::Paste { content, language } => (content, language),
        _ => return Err(Error::NotFound),
    };

    if opened.record.encrypted {
        return Ok(Json(json!({ "data": content, "language": language })).into_response());
    }

    let mut builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/plain; charset=utf-8");
    if let Some(lang) = &language {
        builder = builder.header("X-Blip-Language", lang.as_str());
    }
    builder
        .body(Body::from(content))
        .map_err(|e| Error::Storage(format!("build response: {e}")))
}

pub async fn get_secret(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let opened = state.vault.open_secret(&short)?;
    match opened.record.content {
        Content::Secret { data } => Ok(Json(json!({ "data": data })).into_response()),
        _ => Err(Error::NotFound),
    }
}

pub async fn get_image(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let image = state.vault.open_image(&short)?;

    if image.record.encrypted {
        let data = STANDARD.encode(&image.bytes);
        return Ok(Json(json!({ "data": data })).into_response());
    }
    Ok(([(header::CONTENT_TYPE, image.content_type)], image.bytes).into_response())
}

// ── Peek ──────────────────────────────────────────────────────────────────────

pub async fn peek(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let summary = state.vault.peek(&short)?;
    Ok(Json(summary).into_response())
}

pub async fn head_peek(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    let summary = state.vault.peek(&short)?;
    Response::builder()
        .status(StatusCode::OK)
        .header("X-Blip-Kind", summary.kind.as_str())
        .header("X-Blip-Encrypted", summary.encrypted.to_string())
        .header("X-Blip-Onetime", summary.one_time.to_string())
        .header("X-Blip-Expires-At", summary.expires_at.to_string())
        .body(Body::empty())
        .map_err(|e| Error::Storage(format!("build response: {e}")))
}

// ── Admin ─────────────────────────────────────────────────────────────────────

pub async fn delete_record(
    State(state): State<AppState>,
    Path(short): Path<String>,
) -> Result<Response> {
    let short = ShortCode::parse(&short)?;
    state.vault.delete(&short)?;
    info!(short = %short, "admin delete");
    Ok(StatusCode::NO_CONTENT.into_response())
}

pub async fn stats(State(state): State<AppState>) -> Result<Response> {
    let stats = state.vault.stats()?;
    Ok(Json(stats).into_response())
}
