//! Creation and retrieval of links, pastes, images and secrets.
//!
//! All reads go through [`Store::take_if`] with the disclosure policy as the
//! decision, so a one-time record is handed to exactly one reader.

use std::time::Duration;

use serde::Serialize;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::images::{self, ImageDir};
use crate::policy::DisclosurePolicy;
use crate::short::{allocate, ShortCode};
use crate::store::{Content, Disposition, Kind, Record, RecordSummary, Retrieved, Store};

pub const DEFAULT_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const MAX_PASTE_BYTES: usize = 1_048_576;
pub const MAX_LANGUAGE_LEN: usize = 50;
pub const MAX_IMAGE_BYTES: usize = 32 * 1_048_576;
/// Shortest base64 text that can hold a nonce and a tag.
pub const MIN_SECRET_LEN: usize = 44;

/// How many fresh codes to try before giving up on a creation.
const MAX_ALLOCATION_ATTEMPTS: usize = 8;

/// Freshly written image files younger than this are left alone by the
/// orphan sweep; their record may still be on its way into the store.
const ORPHAN_GRACE: Duration = Duration::from_secs(60);

pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Shortest period the background sweep will tick at.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Live record counts per kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub links: usize,
    pub pastes: usize,
    pub images: usize,
    pub secrets: usize,
}

/// An image handed back by [`Vault::open_image`].
#[derive(Debug)]
pub struct OpenedImage {
    pub record: Record,
    pub content_type: String,
    /// Raw file bytes; a sealed envelope's binary form when encrypted.
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct Vault {
    store: Store,
    images: ImageDir,
    policy: DisclosurePolicy,
    ttl: Duration,
}

impl Vault {
    pub fn new(store: Store, images: ImageDir, policy: DisclosurePolicy, ttl: Duration) -> Self {
        Self {
            store,
            images,
            policy,
            ttl,
        }
    }

    fn lifetime(&self) -> (i64, i64) {
        let now = Store::now();
        let ttl = i64::try_from(self.ttl.as_secs()).unwrap_or(i64::MAX);
        (now, now.saturating_add(ttl))
    }

    /// Allocate a code and store the record built for it, re-rolling when
    /// the code is already held by a live record.
    fn persist(&self, content: Content, encrypted: bool, one_time: bool) -> Result<Record> {
        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let (created_at, expires_at) = self.lifetime();
            let record = Record {
                short: allocate()?,
                content: content.clone(),
                encrypted,
                one_time,
                created_at,
                expires_at,
            };
            if self.store.create(&record)? {
                return Ok(record);
            }
        }
        Err(Error::Storage("no free short code after retries".into()))
    }

    /// Store a link. Target validation for plaintext links is the caller's
    /// job (see [`crate::linkcheck`]); encrypted links are opaque here.
    pub fn create_link(&self, url: &str, encrypted: bool, one_time: bool) -> Result<Record> {
        if url.trim().is_empty() {
            return Err(Error::InvalidInput("url is required".into()));
        }
        let content = Content::Link {
            url: url.to_owned(),
        };
        self.persist(content, encrypted, one_time)
    }

    pub fn create_paste(
        &self,
        content: &str,
        language: Option<&str>,
        encrypted: bool,
        one_time: bool,
    ) -> Result<Record> {
        if content.is_empty() {
            return Err(Error::InvalidInput("content is required".into()));
        }
        if content.len() > MAX_PASTE_BYTES {
            return Err(Error::InvalidInput("content exceeds 1 MiB limit".into()));
        }
        let language = language.map(str::trim).filter(|l| !l.is_empty());
        if language.is_some_and(|l| l.len() > MAX_LANGUAGE_LEN) {
            return Err(Error::InvalidInput(format!(
                "language must be at most {MAX_LANGUAGE_LEN} characters"
            )));
        }
        let content = Content::Paste {
            content: content.to_owned(),
            language: language.map(str::to_owned),
        };
        self.persist(content, encrypted, one_time)
    }

    /// Store a sealed secret. Secrets are always encrypted client-side and
    /// always consumed by their first read.
    pub fn create_secret(&self, envelope: &str) -> Result<Record> {
        if envelope.len() < MIN_SECRET_LEN || !crypto::looks_like_envelope(envelope) {
            return Err(Error::InvalidInput(
                "data must be a base64 sealed envelope".into(),
            ));
        }
        let content = Content::Secret {
            data: envelope.to_owned(),
        };
        self.persist(content, true, true)
    }

    /// Write the side file, then the record. If the record cannot be
    /// stored the file is removed again.
    pub fn create_image(
        &self,
        bytes: &[u8],
        content_type: &str,
        encrypted: bool,
        one_time: bool,
    ) -> Result<Record> {
        if bytes.is_empty() {
            return Err(Error::InvalidInput("file is empty".into()));
        }
        if bytes.len() > MAX_IMAGE_BYTES {
            return Err(Error::InvalidInput("file exceeds 32 MiB limit".into()));
        }

        for _ in 0..MAX_ALLOCATION_ATTEMPTS {
            let short = allocate()?;
            let file_name = images::file_name_for(&short, content_type, encrypted);

            match self.images.write_new(&file_name, bytes) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e.into()),
            }

            let (created_at, expires_at) = self.lifetime();
            let record = Record {
                short,
                content: Content::Image {
                    content_type: content_type.to_owned(),
                    file_name: file_name.clone(),
                },
                encrypted,
                one_time,
                created_at,
                expires_at,
            };

            match self.store.create(&record) {
                Ok(true) => return Ok(record),
                Ok(false) => self.discard_file(&file_name),
                Err(e) => {
                    self.discard_file(&file_name);
                    return Err(e);
                }
            }
        }
        Err(Error::Storage("no free short code after retries".into()))
    }

    fn discard_file(&self, file_name: &str) {
        if let Err(e) = self.images.remove(file_name) {
            error!(file = file_name, error = %e, "failed to roll back image file");
        }
    }

    /// Read a record of `kind`, consuming it when the policy says so.
    /// A record of another kind is reported as absent and left untouched.
    fn open(&self, short: &ShortCode, kind: Kind) -> Result<Retrieved> {
        let policy = self.policy;
        self.store.take_if(short, |record| {
            if record.kind() != kind {
                Disposition::Reject
            } else if policy.consumes(record) {
                Disposition::Consume
            } else {
                Disposition::Keep
            }
        })
    }

    pub fn open_link(&self, short: &ShortCode) -> Result<Retrieved> {
        self.open(short, Kind::Link)
    }

    pub fn open_paste(&self, short: &ShortCode) -> Result<Retrieved> {
        self.open(short, Kind::Paste)
    }

    pub fn open_secret(&self, short: &ShortCode) -> Result<Retrieved> {
        self.open(short, Kind::Secret)
    }

    /// Read an image. A consumed image's record is gone before its file is
    /// read, so a concurrent reader cannot also get it; the file is
    /// unlinked afterwards.
    pub fn open_image(&self, short: &ShortCode) -> Result<OpenedImage> {
        let Retrieved { record, consumed } = self.open(short, Kind::Image)?;
        let (content_type, file_name) = match &record.content {
            Content::Image {
                content_type,
                file_name,
            } => (content_type.clone(), file_name.clone()),
            _ => return Err(Error::NotFound),
        };

        let read = self.images.read(&file_name);
        if consumed {
            if let Err(e) = self.images.remove(&file_name) {
                error!(
                    short = %short,
                    error = %e,
                    "image disclosed but its file could not be deleted"
                );
            }
        }

        let bytes = read.map_err(|e| {
            error!(short = %short, error = %e, "image record without readable file");
            Error::Storage(format!("read image file: {e}"))
        })?;

        Ok(OpenedImage {
            record,
            content_type,
            bytes,
        })
    }

    /// Existence check that never consumes, used for confirmation steps
    /// before a one-time read.
    pub fn peek(&self, short: &ShortCode) -> Result<RecordSummary> {
        self.store.peek(short)
    }

    /// Idempotent delete, including the image file if there is one.
    pub fn delete(&self, short: &ShortCode) -> Result<()> {
        if let Some(record) = self.store.delete(short)? {
            if let Content::Image { file_name, .. } = &record.content {
                self.images.remove(file_name)?;
            }
            debug!(short = %short, "deleted record");
        }
        Ok(())
    }

    pub fn stats(&self) -> Result<Stats> {
        let count = |kind: Kind| self.store.count(|r| r.kind() == kind);
        Ok(Stats {
            links: count(Kind::Link)?,
            pastes: count(Kind::Paste)?,
            images: count(Kind::Image)?,
            secrets: count(Kind::Secret)?,
        })
    }

    /// Remove expired records and their image files.
    pub fn prune(&self) -> Result<usize> {
        let removed = self.store.prune()?;
        for record in &removed {
            if let Content::Image { file_name, .. } = &record.content {
                if let Err(e) = self.images.remove(file_name) {
                    warn!(file = %file_name, error = %e, "failed to delete expired image file");
                }
            }
        }
        Ok(removed.len())
    }

    /// Delete image files whose short code has no live image record.
    /// Each file is judged on its own at the moment it is checked; files not
    /// named `<short>.<ext>` are not ours and are left alone.
    pub fn sweep_orphans(&self) -> Result<usize> {
        self.sweep_orphans_older_than(ORPHAN_GRACE)
    }

    fn sweep_orphans_older_than(&self, min_age: Duration) -> Result<usize> {
        let mut deleted = 0;
        for name in self.images.settled_files(min_age)? {
            let Some(short) = images::short_of(&name) else {
                continue;
            };
            let owned = match self.store.get(&short) {
                Ok(record) => matches!(
                    &record.content,
                    Content::Image { file_name, .. } if *file_name == name
                ),
                Err(Error::NotFound) => false,
                Err(e) => return Err(e),
            };
            if owned {
                continue;
            }
            match self.images.remove(&name) {
                Ok(()) => deleted += 1,
                Err(e) => warn!(file = %name, error = %e, "failed to delete orphaned file"),
            }
        }
        if deleted > 0 {
            info!(count = deleted, "cleaned up orphaned image files");
        }
        Ok(deleted)
    }

    /// Spawn a background Tokio task that prunes expired records and sweeps
    /// orphaned image files every `interval`, never more often than once a
    /// second.
    pub fn spawn_sweep(self, interval: Duration) {
        if interval < MIN_SWEEP_INTERVAL {
            warn!(
                interval = %humantime::format_duration(interval),
                "sweep interval too short, using 1s"
            );
        }
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.prune() {
                    warn!(error = %e, "background sweep error");
                }
                if let Err(e) = self.sweep_orphans() {
                    warn!(error = %e, "orphan sweep error");
                }
            }
        });
    }
}
