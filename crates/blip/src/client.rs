use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use blip_server::crypto::{self, EnvelopeKey};
use blip_server::ShortCode;
use reqwest::{multipart, Client, Response, Url};
use serde::Deserialize;
use serde_json::{json, Value};

/// What the server hands back for a new item.
#[derive(Debug, Deserialize)]
pub struct Created {
    pub short: String,
    pub url: String,
    pub expires_at: i64,
}

impl Created {
    /// The link to share: the server's URL, plus the key in the fragment
    /// when the content was sealed.
    pub fn share_link(&self, key: Option<&EnvelopeKey>) -> String {
        match key {
            Some(key) => format!("{}#{}", self.url, crypto::encode_key(key)),
            None => self.url.clone(),
        }
    }
}

/// Which kind of item a share link points at, by its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    Link,
    Paste,
    Secret,
    Image,
}

/// Content fetched through a share link, already opened if it was sealed.
#[derive(Debug, PartialEq, Eq)]
pub enum Opened {
    Link(String),
    Paste(Vec<u8>),
    Secret(Vec<u8>),
    Image {
        content_type: String,
        bytes: Vec<u8>,
    },
}

/// Split a share link's path into kind and code.
/// `/AbC123` is a link; `/p/`, `/s/` and `/i/` prefixes name the rest.
pub fn classify(url: &Url) -> Result<(LinkKind, ShortCode)> {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();
    let (kind, code) = match segments.as_slice() {
        [code] => (LinkKind::Link, *code),
        ["p", code] => (LinkKind::Paste, *code),
        ["s", code] => (LinkKind::Secret, *code),
        ["i", code] => (LinkKind::Image, *code),
        _ => anyhow::bail!("not a blip share link: {url}"),
    };
    let code = ShortCode::parse(code).with_context(|| format!("invalid code in {url}"))?;
    Ok((kind, code))
}

/// Thin HTTP client for a blip server.
pub struct BlipClient {
    http: Client,
    server: String,
    admin_key: Option<String>,
}

impl BlipClient {
    pub fn new(server: &str, admin_key: Option<String>) -> Result<Self> {
        // Links are fetched through the JSON endpoint; never follow a
        // redirect to a target the user has not seen.
        let http = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .context("build HTTP client")?;
        Ok(Self {
            http,
            server: server.trim_end_matches('/').to_owned(),
            admin_key,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server)
    }

    pub async fn create_link(&self, url: &str, encrypted: bool, onetime: bool) -> Result<Created> {
        let body = json!({ "url": url, "encrypted": encrypted, "onetime": onetime });
        self.create("/api/links", &body).await
    }

    pub async fn create_paste(
        &self,
        content: &str,
        language: Option<&str>,
        encrypted: bool,
        onetime: bool,
    ) -> Result<Created> {
        let body = json!({
            "content": content,
            "language": language,
            "encrypted": encrypted,
            "onetime": onetime,
        });
        self.create("/api/pastes", &body).await
    }

    pub async fn create_secret(&self, envelope: &str) -> Result<Created> {
        self.create("/api/secrets", &json!({ "data": envelope })).await
    }

    pub async fn create_image(
        &self,
        bytes: Vec<u8>,
        file_name: &str,
        encrypted: bool,
        onetime: bool,
    ) -> Result<Created> {
        let form = multipart::Form::new()
            .part(
                "file",
                multipart::Part::bytes(bytes).file_name(file_name.to_owned()),
            )
            .text("encrypted", encrypted.to_string())
            .text("onetime", onetime.to_string());
        let resp = self
            .http
            .post(self.url("/api/images"))
            .multipart(form)
            .send()
            .await
            .context("HTTP request failed")?;
        let resp = check(resp).await?;
        resp.json().await.context("parse response")
    }

    async fn create(&self, path: &str, body: &Value) -> Result<Created> {
        let resp = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .context("HTTP request failed")?;
        let resp = check(resp).await?;
        resp.json().await.context("parse response")
    }

    /// Fetch whatever `share_link` points at. The fragment is split off
    /// before any request is built, so the key never leaves this process.
    pub async fn open(&self, share_link: &str) -> Result<Opened> {
        let (request_url, key) = crypto::split_share_link(share_link)?;
        let url = Url::parse(&request_url).with_context(|| format!("invalid URL: {request_url}"))?;
        let (kind, code) = classify(&url)?;
        let origin = url.origin().ascii_serialization();

        match kind {
            LinkKind::Link => {
                let body: Value = self.get_json(&format!("{origin}/api/links/{code}")).await?;
                let target = str_field(&body, "url")?;
                if body["encrypted"].as_bool().unwrap_or(false) {
                    let plain = unseal(target, key.as_ref())?;
                    Ok(Opened::Link(
                        String::from_utf8(plain).context("link is not UTF-8")?,
                    ))
                } else {
                    Ok(Opened::Link(target.to_owned()))
                }
            }
            LinkKind::Secret => {
                let body: Value = self.get_json(&format!("{origin}/s/{code}")).await?;
                Ok(Opened::Secret(unseal(str_field(&body, "data")?, key.as_ref())?))
            }
            LinkKind::Paste => {
                let resp = self.get(&format!("{origin}/p/{code}")).await?;
                if is_json(&resp) {
                    let body: Value = resp.json().await.context("parse response")?;
                    Ok(Opened::Paste(unseal(str_field(&body, "data")?, key.as_ref())?))
                } else {
                    let bytes = resp.bytes().await.context("read paste")?;
                    Ok(Opened::Paste(bytes.to_vec()))
                }
            }
            LinkKind::Image => {
                let resp = self.get(&format!("{origin}/i/{code}")).await?;
                if is_json(&resp) {
                    let body: Value = resp.json().await.context("parse response")?;
                    let bytes = unseal(str_field(&body, "data")?, key.as_ref())?;
                    let content_type = blip_server::images::detect_content_type(&bytes, None);
                    Ok(Opened::Image {
                        content_type,
                        bytes,
                    })
                } else {
                    let content_type = resp
                        .headers()
                        .get(reqwest::header::CONTENT_TYPE)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or("application/octet-stream")
                        .to_owned();
                    let bytes = resp.bytes().await.context("read image")?;
                    Ok(Opened::Image {
                        content_type,
                        bytes: bytes.to_vec(),
                    })
                }
            }
        }
    }

    /// Metadata for a code without consuming it.
    pub async fn peek(&self, code: &ShortCode) -> Result<Value> {
        self.get_json(&self.url(&format!("/api/peek/{code}"))).await
    }

    pub async fn delete(&self, code: &ShortCode) -> Result<()> {
        let resp = self
            .http
            .delete(self.url(&format!("/api/records/{code}")))
            .bearer_auth(self.require_admin_key()?)
            .send()
            .await
            .context("HTTP request failed")?;
        check(resp).await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<Value> {
        let resp = self
            .http
            .get(self.url("/api/stats"))
            .bearer_auth(self.require_admin_key()?)
            .send()
            .await
            .context("HTTP request failed")?;
        let resp = check(resp).await?;
        resp.json().await.context("parse response")
    }

    fn require_admin_key(&self) -> Result<&str> {
        self.admin_key
            .as_deref()
            .context("--admin-key / BLIP_ADMIN_KEY is required for this command")
    }

    async fn get(&self, url: &str) -> Result<Response> {
        let resp = self
            .http
            .get(url)
            .send()
            .await
            .context("HTTP request failed")?;
        check(resp).await
    }

    async fn get_json(&self, url: &str) -> Result<Value> {
        let resp = self.get(url).await?;
        resp.json().await.context("parse response")
    }
}

/// Seal `plaintext` under a fresh key.
pub fn seal(plaintext: &[u8]) -> Result<(String, EnvelopeKey)> {
    let key = crypto::generate_key()?;
    let envelope = crypto::seal(plaintext, &key)?;
    Ok((envelope, key))
}

/// Raw envelope bytes for image uploads, which travel as files.
pub fn envelope_bytes(envelope: &str) -> Result<Vec<u8>> {
    STANDARD.decode(envelope).context("decode envelope")
}

fn unseal(envelope: &str, key: Option<&EnvelopeKey>) -> Result<Vec<u8>> {
    let key = key.context("content is encrypted but the link has no #key")?;
    Ok(crypto::open(envelope, key)?)
}

fn str_field<'a>(body: &'a Value, field: &str) -> Result<&'a str> {
    body[field]
        .as_str()
        .with_context(|| format!("response is missing `{field}`"))
}

fn is_json(resp: &Response) -> bool {
    resp.headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"))
}

async fn check(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let json: Value = resp.json().await.unwrap_or_default();
    anyhow::bail!(
        "server returned {status}: {}",
        json["error"].as_str().unwrap_or("")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn created(server: &MockServer, path: &str) -> ResponseTemplate {
        ResponseTemplate::new(201).set_body_json(json!({
            "short": "AbC123",
            "url": format!("{}{path}", server.uri()),
            "expires_at": 1_900_000_000,
        }))
    }

    #[test]
    fn classify_paths() {
        let kind = |s: &str| classify(&Url::parse(s).unwrap()).map(|(k, c)| (k, c.to_string()));
        assert_eq!(
            kind("https://blip.example/AbC123").unwrap(),
            (LinkKind::Link, "AbC123".into())
        );
        assert_eq!(
            kind("https://blip.example/s/AbC123").unwrap().0,
            LinkKind::Secret
        );
        assert_eq!(kind("https://blip.example/p/AbC123/").unwrap().0, LinkKind::Paste);
        assert_eq!(kind("https://blip.example/i/AbC123").unwrap().0, LinkKind::Image);
        assert!(kind("https://blip.example/x/AbC123").is_err());
        assert!(kind("https://blip.example/s/short").is_err());
        assert!(kind("https://blip.example/").is_err());
    }

    #[tokio::test]
    async fn secret_round_trip_keeps_key_local() {
        let server = MockServer::start().await;
        let (envelope, key) = seal(b"hunter2").unwrap();

        Mock::given(method("POST"))
            .and(path("/api/secrets"))
            .and(body_json(json!({ "data": envelope })))
            .respond_with(created(&server, "/s/AbC123"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/s/AbC123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": envelope })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let link = client.create_secret(&envelope).await.unwrap().share_link(Some(&key));
        assert!(link.ends_with(&format!("/s/AbC123#{}", crypto::encode_key(&key))));

        let opened = client.open(&link).await.unwrap();
        assert_eq!(opened, Opened::Secret(b"hunter2".to_vec()));

        // The key never reached the server.
        let encoded = crypto::encode_key(&key);
        for req in server.received_requests().await.unwrap() {
            assert!(!req.url.as_str().contains(&encoded));
            assert!(!String::from_utf8_lossy(&req.body).contains(&encoded));
        }
    }

    #[tokio::test]
    async fn opening_sealed_content_without_key_fails() {
        let server = MockServer::start().await;
        let (envelope, _key) = seal(b"x").unwrap();
        Mock::given(method("GET"))
            .and(path("/s/AbC123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "data": envelope })))
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let err = client
            .open(&format!("{}/s/AbC123", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no #key"));
    }

    #[tokio::test]
    async fn plain_link_uses_json_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/links/AbC123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": "https://example.com",
                "encrypted": false,
                "expires_at": 1,
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let opened = client
            .open(&format!("{}/AbC123", server.uri()))
            .await
            .unwrap();
        assert_eq!(opened, Opened::Link("https://example.com".into()));
    }

    #[tokio::test]
    async fn plain_paste_is_returned_verbatim() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/p/AbC123"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/plain; charset=utf-8")
                    .set_body_string("fn main() {}"),
            )
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let opened = client
            .open(&format!("{}/p/AbC123", server.uri()))
            .await
            .unwrap();
        assert_eq!(opened, Opened::Paste(b"fn main() {}".to_vec()));
    }

    #[tokio::test]
    async fn server_errors_surface_message() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/s/AbC123"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"error": "not found or expired"})),
            )
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let err = client
            .open(&format!("{}/s/AbC123", server.uri()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("404"));
        assert!(err.to_string().contains("not found or expired"));
    }

    #[tokio::test]
    async fn image_upload_is_multipart() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/images"))
            .and(body_string_contains("name=\"onetime\""))
            .and(body_string_contains("name=\"file\""))
            .respond_with(created(&server, "/i/AbC123"))
            .expect(1)
            .mount(&server)
            .await;

        let client = BlipClient::new(&server.uri(), None).unwrap();
        let created = client
            .create_image(b"GIF89a".to_vec(), "cat.gif", false, true)
            .await
            .unwrap();
        assert_eq!(created.short, "AbC123");
    }

    #[tokio::test]
    async fn admin_calls_send_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/records/AbC123"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let code = ShortCode::parse("AbC123").unwrap();
        let client = BlipClient::new(&server.uri(), Some("s3cret".into())).unwrap();
        client.delete(&code).await.unwrap();

        let anonymous = BlipClient::new(&server.uri(), None).unwrap();
        assert!(anonymous.delete(&code).await.is_err());
    }
}
